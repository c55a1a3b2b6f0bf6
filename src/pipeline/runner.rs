//! Subject pipeline: reconstruction, all scales, then finalization.
//!
//! Execution for one subject is strictly sequential. The first failing
//! invocation aborts the run; no later step, scale or finalization is
//! attempted and nothing is retried.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use super::finalizer::{FinalizeOutcome, OutputFinalizer};
use super::scale::ALL_SCALES;
use super::stage::{Stage, StageLabel, StageTemplate, StepKind};
use super::state::{PipelineRun, PipelineState};
use super::subject::Subject;
use crate::environment::ToolkitEnvironment;
use crate::error::{FinalizeError, PipelineError};
use crate::runner::ToolInvoker;

/// Where and why a subject failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureSummary {
    /// Stage that failed, `None` for finalization or internal errors.
    pub stage: Option<StageLabel>,
    /// Step that failed within the stage.
    pub step: Option<StepKind>,
    /// Failing tool, if a tool failed.
    pub tool: Option<String>,
    /// Exit code of the failing tool, if it exited normally.
    pub exit_code: Option<i32>,
    /// Full error message.
    pub message: String,
}

impl From<&PipelineError> for FailureSummary {
    fn from(err: &PipelineError) -> Self {
        let (stage, step, exit_code) = match err {
            PipelineError::StepFailed {
                stage, step, source, ..
            } => (Some(*stage), Some(*step), source.exit_code()),
            _ => (None, None, None),
        };
        Self {
            stage,
            step,
            tool: err.tool().map(str::to_string),
            exit_code,
            message: err.to_string(),
        }
    }
}

/// Outcome of one subject's pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubjectReport {
    pub subject_id: String,
    /// Terminal state: `Done` or `Failed`.
    pub state: PipelineState,
    /// Every state visited, in order.
    pub history: Vec<PipelineState>,
    /// Number of tool invocations attempted, including a failing one.
    pub invocations: usize,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
    /// Where the outputs live, for successful runs.
    pub final_path: Option<PathBuf>,
    pub failure: Option<FailureSummary>,
}

impl SubjectReport {
    pub fn is_success(&self) -> bool {
        self.state == PipelineState::Done
    }
}

/// Runs the full pipeline for individual subjects.
pub struct SubjectPipeline {
    invoker: Arc<dyn ToolInvoker>,
    env: ToolkitEnvironment,
    template: StageTemplate,
    finalizer: OutputFinalizer,
}

impl SubjectPipeline {
    pub fn new(
        invoker: Arc<dyn ToolInvoker>,
        env: ToolkitEnvironment,
        template: StageTemplate,
    ) -> Self {
        Self {
            invoker,
            env,
            template,
            finalizer: OutputFinalizer::new(),
        }
    }

    /// Plans finalization instead of moving any outputs.
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.finalizer = self.finalizer.with_dry_run(dry_run);
        self
    }

    pub fn environment(&self) -> &ToolkitEnvironment {
        &self.env
    }

    /// All stages for `subject`, in execution order: reconstruction, then
    /// scales 1 to 5.
    pub fn plan(&self, subject: &Subject) -> Vec<Stage> {
        let mut stages = Vec::with_capacity(ALL_SCALES.len() + 1);
        stages.push(self.template.reconstruction(subject, &self.env));
        stages.extend(
            ALL_SCALES
                .iter()
                .map(|scale| self.template.expand(*scale, subject, &self.env)),
        );
        stages
    }

    /// Runs every stage for `subject`, then finalizes its outputs.
    ///
    /// Never panics on tool failure; the failure is captured in the report.
    pub async fn execute(&self, subject: &Subject) -> SubjectReport {
        let started_at = Utc::now();
        let mut run = PipelineRun::new(subject.id());
        let mut invocations = 0usize;

        info!(subject = %subject.id(), input = %subject.input_image().display(), "Starting subject pipeline");

        let result = self.drive(subject, &mut run, &mut invocations).await;

        let (final_path, failure) = match result {
            Ok(outcome) => {
                info!(
                    subject = %subject.id(),
                    invocations,
                    duration = ?run.elapsed(),
                    output = %outcome.final_path().display(),
                    "Subject pipeline completed"
                );
                (Some(outcome.final_path().to_path_buf()), None)
            }
            Err(err) => {
                run.fail();
                error!(subject = %subject.id(), error = %err, "Subject pipeline failed");
                (None, Some(FailureSummary::from(&err)))
            }
        };

        SubjectReport {
            subject_id: subject.id().to_string(),
            state: run.state(),
            history: run.history().to_vec(),
            invocations,
            started_at,
            duration: run.elapsed(),
            final_path,
            failure,
        }
    }

    async fn drive(
        &self,
        subject: &Subject,
        run: &mut PipelineRun,
        invocations: &mut usize,
    ) -> Result<FinalizeOutcome, PipelineError> {
        for stage in self.plan(subject) {
            let next = match stage.label {
                StageLabel::Reconstruction => PipelineState::Reconstructing,
                StageLabel::Scale(scale) => PipelineState::Scale(scale.index()),
            };
            run.advance(next)?;
            self.run_stage(subject, &stage, invocations).await?;
        }

        run.advance(PipelineState::Finalizing)?;
        let outcome = self.finalize(subject).await?;
        run.advance(PipelineState::Done)?;
        Ok(outcome)
    }

    async fn run_stage(
        &self,
        subject: &Subject,
        stage: &Stage,
        invocations: &mut usize,
    ) -> Result<(), PipelineError> {
        info!(subject = %subject.id(), stage = %stage.label, steps = stage.len(), "Running stage");

        for step in &stage.steps {
            *invocations += 1;
            debug!(subject = %subject.id(), stage = %stage.label, step = %step.kind, "Running step");

            self.invoker
                .run(&step.invocation)
                .await
                .map_err(|source| PipelineError::StepFailed {
                    subject: subject.id().to_string(),
                    stage: stage.label,
                    step: step.kind,
                    source,
                })?;
        }
        Ok(())
    }

    async fn finalize(&self, subject: &Subject) -> Result<FinalizeOutcome, PipelineError> {
        let finalizer = self.finalizer.clone();
        let owned = subject.clone();

        let result = tokio::task::spawn_blocking(move || finalizer.finalize(&owned))
            .await
            .unwrap_or_else(|join_err| {
                Err(FinalizeError::MoveFailed {
                    from: subject.working_dir().to_path_buf(),
                    to: subject.destination().map(PathBuf::from).unwrap_or_default(),
                    source: std::io::Error::other(join_err),
                })
            });

        result.map_err(|source| PipelineError::Finalize {
            subject: subject.id().to_string(),
            source,
        })
    }
}
