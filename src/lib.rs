//! multiscale-atlas: FreeSurfer reconstruction and Lausanne 2018
//! multi-scale parcellation for BIDS cohorts.
//!
//! This library provides the pipeline engine, the external tool runner,
//! and the cohort resolver behind the `multiscale-atlas` binary.

pub mod cli;
pub mod cohort;
pub mod environment;
pub mod error;
pub mod pipeline;
pub mod runner;

// Re-export commonly used error types
pub use error::{BootstrapError, FinalizeError, PipelineError, ResolveError, ToolError};
