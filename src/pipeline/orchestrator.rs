//! Cohort orchestrator.
//!
//! Runs many subjects through [`SubjectPipeline`] with a bounded number of
//! subjects in flight. Subjects never share working directories, so no
//! cross-subject locking is needed; a failure in one subject does not
//! cancel the others. The toolkit bootstrap runs once up front and is the
//! only batch-fatal step.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{info, warn};
use uuid::Uuid;

use super::config::{ConfigError, PipelineConfig};
use super::runner::{SubjectPipeline, SubjectReport};
use super::subject::Subject;
use crate::environment::ToolkitEnvironment;
use crate::error::BootstrapError;
use crate::runner::ToolInvoker;

/// Errors that abort a whole cohort run.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Toolkit bootstrap failed; no subject was processed.
    #[error("Bootstrap failed: {0}")]
    Bootstrap(#[from] BootstrapError),

    /// No subjects to process.
    #[error("No subjects to process")]
    NoSubjects,
}

/// Statistics about a cohort run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineStats {
    /// Total number of subjects executed.
    pub total_executed: u64,
    /// Number of subjects that reached `Done`.
    pub successful: u64,
    /// Number of subjects that ended `Failed`.
    pub failed: u64,
    /// Average per-subject duration.
    pub average_duration: Duration,
}

impl PipelineStats {
    /// Creates new empty stats.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a successful subject.
    fn record_success(&mut self, duration: Duration) {
        self.total_executed += 1;
        self.successful += 1;
        self.update_average_duration(duration);
    }

    /// Records a failed subject.
    fn record_failure(&mut self, duration: Duration) {
        self.total_executed += 1;
        self.failed += 1;
        self.update_average_duration(duration);
    }

    /// Updates the running average duration.
    fn update_average_duration(&mut self, duration: Duration) {
        if self.total_executed == 1 {
            self.average_duration = duration;
        } else {
            // Incremental average: avg = avg + (new - avg) / n
            let n = self.total_executed as f64;
            let old_avg = self.average_duration.as_secs_f64();
            let new_val = duration.as_secs_f64();
            let new_avg = old_avg + (new_val - old_avg) / n;
            self.average_duration = Duration::from_secs_f64(new_avg.max(0.0));
        }
    }

    /// Success rate as a percentage.
    pub fn success_rate(&self) -> f64 {
        if self.total_executed == 0 {
            return 0.0;
        }
        (self.successful as f64 / self.total_executed as f64) * 100.0
    }
}

/// Result of a cohort run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CohortReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
    /// One report per subject, in input order.
    pub reports: Vec<SubjectReport>,
    pub stats: PipelineStats,
}

impl CohortReport {
    /// Whether any subject failed.
    pub fn has_failures(&self) -> bool {
        self.reports.iter().any(|r| !r.is_success())
    }

    /// Reports of failed subjects.
    pub fn failures(&self) -> impl Iterator<Item = &SubjectReport> {
        self.reports.iter().filter(|r| !r.is_success())
    }
}

/// Runs a cohort of subjects through the pipeline.
pub struct CohortOrchestrator {
    config: PipelineConfig,
    invoker: Arc<dyn ToolInvoker>,
    pipeline: Arc<SubjectPipeline>,
    concurrency_limiter: Arc<Semaphore>,
}

impl CohortOrchestrator {
    /// Creates a new orchestrator.
    ///
    /// # Errors
    ///
    /// Returns `OrchestratorError::Config` if the configuration is invalid.
    pub fn new(
        config: PipelineConfig,
        env: ToolkitEnvironment,
        invoker: Arc<dyn ToolInvoker>,
    ) -> Result<Self, OrchestratorError> {
        config.validate()?;

        let pipeline = SubjectPipeline::new(invoker.clone(), env, config.stage_template())
            .with_dry_run(config.dry_run);
        let concurrency_limiter = Arc::new(Semaphore::new(config.max_concurrent_subjects));

        Ok(Self {
            config,
            invoker,
            pipeline: Arc::new(pipeline),
            concurrency_limiter,
        })
    }

    /// Runs the toolkit setup script. Fatal on failure.
    pub async fn bootstrap(&self) -> Result<(), OrchestratorError> {
        self.pipeline
            .environment()
            .bootstrap(self.invoker.as_ref())
            .await?;
        Ok(())
    }

    /// Bootstraps the toolkit, then runs every subject.
    ///
    /// Per-subject failures are collected in the report; only bootstrap
    /// failure aborts the batch.
    pub async fn run(&self, subjects: Vec<Subject>) -> Result<CohortReport, OrchestratorError> {
        if subjects.is_empty() {
            return Err(OrchestratorError::NoSubjects);
        }

        self.bootstrap().await?;
        Ok(self.run_subjects(subjects).await)
    }

    /// Runs every subject without bootstrapping.
    pub async fn run_subjects(&self, subjects: Vec<Subject>) -> CohortReport {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let start = Instant::now();

        info!(
            %run_id,
            subjects = subjects.len(),
            workers = self.config.max_concurrent_subjects,
            "Starting cohort run"
        );

        let futures = subjects.iter().map(|subject| {
            let sem = self.concurrency_limiter.clone();
            let pipeline = self.pipeline.clone();
            async move {
                // The semaphore is never closed, so acquisition cannot fail.
                let _permit = sem.acquire_owned().await.ok();
                pipeline.execute(subject).await
            }
        });
        let reports = futures::future::join_all(futures).await;

        let mut stats = PipelineStats::new();
        for report in &reports {
            if report.is_success() {
                stats.record_success(report.duration);
            } else {
                stats.record_failure(report.duration);
                warn!(
                    subject = %report.subject_id,
                    error = report.failure.as_ref().map(|f| f.message.as_str()).unwrap_or("unknown"),
                    "Subject failed"
                );
            }
        }

        info!(
            %run_id,
            total = stats.total_executed,
            successful = stats.successful,
            failed = stats.failed,
            success_rate = format!("{:.1}%", stats.success_rate()),
            "Cohort run finished"
        );

        CohortReport {
            run_id,
            started_at,
            duration: start.elapsed(),
            reports,
            stats,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::PipelineState;
    use crate::runner::RecordingInvoker;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn env_at(subjects: &std::path::Path) -> ToolkitEnvironment {
        let mut vars = BTreeMap::new();
        vars.insert("FREESURFER_HOME".to_string(), "/opt/fs".to_string());
        vars.insert(
            "SUBJECTS_DIR".to_string(),
            subjects.to_string_lossy().into_owned(),
        );
        ToolkitEnvironment::from_vars(vars).unwrap()
    }

    #[test]
    fn test_pipeline_stats() {
        let mut stats = PipelineStats::new();
        stats.record_success(Duration::from_secs(60));
        stats.record_failure(Duration::from_secs(30));

        assert_eq!(stats.total_executed, 2);
        assert_eq!(stats.successful, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.average_duration.as_secs(), 45);
        assert!((stats.success_rate() - 50.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let subjects = TempDir::new().unwrap();
        let result = CohortOrchestrator::new(
            PipelineConfig::new().with_max_concurrent_subjects(0),
            env_at(subjects.path()),
            Arc::new(RecordingInvoker::new()),
        );
        assert!(matches!(result, Err(OrchestratorError::Config(_))));
    }

    #[tokio::test]
    async fn test_empty_cohort() {
        let subjects = TempDir::new().unwrap();
        let orchestrator = CohortOrchestrator::new(
            PipelineConfig::new(),
            env_at(subjects.path()),
            Arc::new(RecordingInvoker::new()),
        )
        .unwrap();

        let result = orchestrator.run(Vec::new()).await;
        assert!(matches!(result, Err(OrchestratorError::NoSubjects)));
    }

    #[tokio::test]
    async fn test_bootstrap_failure_is_batch_fatal() {
        let subjects = TempDir::new().unwrap();
        let env = env_at(subjects.path());
        let invoker = Arc::new(RecordingInvoker::new().failing_on_program("sh", 1));
        let orchestrator =
            CohortOrchestrator::new(PipelineConfig::new(), env.clone(), invoker.clone()).unwrap();

        let subject = Subject::in_environment("sub-01", "t1.nii.gz", &env).unwrap();
        let result = orchestrator.run(vec![subject]).await;

        assert!(matches!(result, Err(OrchestratorError::Bootstrap(_))));
        assert_eq!(invoker.call_count(), 1);
    }

    #[tokio::test]
    async fn test_failure_does_not_cancel_other_subjects() {
        let subjects = TempDir::new().unwrap();
        let env = env_at(subjects.path());
        // Single worker keeps call order deterministic: bootstrap is call 1,
        // sub-01 takes calls 2..=32, sub-02 fails on its recon-all (call 33).
        let invoker = Arc::new(RecordingInvoker::new().failing_at_call(33, 2));
        let orchestrator = CohortOrchestrator::new(
            PipelineConfig::new().with_max_concurrent_subjects(1),
            env.clone(),
            invoker.clone(),
        )
        .unwrap();

        let cohort = vec![
            Subject::in_environment("sub-01", "a.nii.gz", &env).unwrap(),
            Subject::in_environment("sub-02", "b.nii.gz", &env).unwrap(),
            Subject::in_environment("sub-03", "c.nii.gz", &env).unwrap(),
        ];
        let report = orchestrator.run(cohort).await.unwrap();

        assert!(report.has_failures());
        assert_eq!(report.stats.successful, 2);
        assert_eq!(report.stats.failed, 1);
        assert_eq!(report.reports[1].state, PipelineState::Failed);
        assert_eq!(report.reports[2].state, PipelineState::Done);
        assert_eq!(report.failures().count(), 1);
        assert_eq!(invoker.call_count(), 1 + 31 + 1 + 31);
    }
}
