//! Multi-scale parcellation pipeline.
//!
//! Takes a subject from a raw T1-weighted image to a reconstructed tree
//! carrying the Lausanne 2018 parcellation at five scales.
//!
//! # Architecture
//!
//! - **Stage template**: expands each scale into its six tool invocations
//! - **Subject pipeline**: runs reconstruction, all scales and finalization
//!   for one subject, failing fast
//! - **State**: the per-subject state machine and its history
//! - **Finalizer**: moves a finished tree to its destination
//! - **Orchestrator**: bounded worker pool over a cohort
//! - **Config**: execution settings for all of the above
//!
//! # Pipeline Flow
//!
//! 1. **Bootstrap**: the toolkit setup script runs once per batch
//! 2. **Reconstruction**: `recon-all` builds the subject tree
//! 3. **Scales 1 to 5**: annotation mapping, per-hemisphere stats, volume
//!    labelling and NIfTI conversion
//! 4. **Finalization**: the tree is moved if a destination was given
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use multiscale_atlas::environment::ToolkitEnvironment;
//! use multiscale_atlas::pipeline::{CohortOrchestrator, PipelineConfig, Subject};
//! use multiscale_atlas::runner::ProcessInvoker;
//!
//! let env = ToolkitEnvironment::load(Some("setup_environment.json".as_ref()))?;
//! let config = PipelineConfig::new().with_max_concurrent_subjects(2);
//! let orchestrator = CohortOrchestrator::new(config, env.clone(), Arc::new(ProcessInvoker::new()))?;
//!
//! let subjects = vec![Subject::in_environment("sub-01", "/raw/sub-01_T1w.nii.gz", &env)?];
//! let report = orchestrator.run(subjects).await?;
//! println!("{} of {} subjects succeeded", report.stats.successful, report.stats.total_executed);
//! ```

pub mod config;
pub mod finalizer;
pub mod orchestrator;
pub mod runner;
pub mod scale;
pub mod stage;
pub mod state;
pub mod subject;

pub use config::{ConfigError, PipelineConfig};
pub use finalizer::{FinalizeOutcome, OutputFinalizer};
pub use orchestrator::{CohortOrchestrator, CohortReport, OrchestratorError, PipelineStats};
pub use runner::{FailureSummary, SubjectPipeline, SubjectReport};
pub use scale::{Hemisphere, ScaleDefinition, ALL_SCALES, DEFAULT_ATLAS, SCALE_COUNT};
pub use stage::{Stage, StageLabel, StageStep, StageTemplate, StepKind};
pub use state::{PipelineRun, PipelineState};
pub use subject::Subject;
