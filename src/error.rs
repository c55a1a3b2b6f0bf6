//! Error types for multiscale-atlas operations.
//!
//! Defines error types for each subsystem:
//! - Toolkit environment bootstrap
//! - External tool invocation
//! - Per-subject pipeline execution
//! - Output relocation
//! - Cohort and multi-modal file resolution

use std::path::PathBuf;

use thiserror::Error;

use crate::pipeline::{PipelineState, StageLabel, StepKind};

/// Errors raised while preparing the toolkit environment.
///
/// Every variant is fatal to the whole run: no subject is processed after
/// a bootstrap failure.
#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("Missing toolkit variable: {0} is not set in the environment file or process environment")]
    MissingVariable(String),

    #[error("Failed to read environment file '{path}': {source}")]
    EnvFileUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse environment file '{path}': {message}")]
    EnvFileInvalid { path: PathBuf, message: String },

    #[error("Toolkit setup failed: {0}")]
    SetupFailed(#[source] ToolError),
}

/// Errors produced by a single external tool invocation.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("'{program}' exited with non-zero code {code}: {stderr}")]
    NonZeroExit {
        program: String,
        code: i32,
        stderr: String,
    },

    #[error("'{program}' was terminated by a signal: {stderr}")]
    Terminated { program: String, stderr: String },
}

impl ToolError {
    /// Name of the executable that failed.
    pub fn program(&self) -> &str {
        match self {
            ToolError::Spawn { program, .. }
            | ToolError::NonZeroExit { program, .. }
            | ToolError::Terminated { program, .. } => program,
        }
    }

    /// Exit code reported by the tool, when it exited normally.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            ToolError::NonZeroExit { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// Per-subject pipeline failures.
///
/// A `StepFailed` error carries enough context to identify the subject,
/// the stage (reconstruction or a scale) and the failing tool.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Subject '{subject}' failed at {stage} step {step}: {source}")]
    StepFailed {
        subject: String,
        stage: StageLabel,
        step: StepKind,
        #[source]
        source: ToolError,
    },

    #[error("Subject '{subject}' could not be finalized: {source}")]
    Finalize {
        subject: String,
        #[source]
        source: FinalizeError,
    },

    #[error("Invalid state transition from '{from}' to '{to}'")]
    InvalidTransition {
        from: PipelineState,
        to: PipelineState,
    },

    #[error("Invalid subject: {0}")]
    InvalidSubject(String),
}

impl PipelineError {
    /// Name of the failing tool, for step failures.
    pub fn tool(&self) -> Option<&str> {
        match self {
            PipelineError::StepFailed { source, .. } => Some(source.program()),
            _ => None,
        }
    }
}

/// Errors that can occur while relocating a finished subject tree.
#[derive(Debug, Error)]
pub enum FinalizeError {
    #[error("Working directory '{0}' does not exist")]
    SourceMissing(PathBuf),

    #[error("Destination '{0}' already exists")]
    DestinationExists(PathBuf),

    #[error("Failed to move '{from}' to '{to}': {source}")]
    MoveFailed {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors raised while resolving cohort inputs from a dataset index.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("Subject '{subject}' has {count} candidate files in session '{session}': {candidates:?}")]
    AmbiguousRecord {
        subject: String,
        session: String,
        count: usize,
        candidates: Vec<PathBuf>,
    },

    #[error("Subject '{subject}' has more than one '{key}' file after run exclusion: {candidates:?}")]
    AmbiguousFile {
        subject: String,
        key: String,
        candidates: Vec<PathBuf>,
    },

    #[error("Dataset root '{0}' does not exist")]
    MissingDatasetRoot(PathBuf),

    #[error("Index table is missing required column '{0}'")]
    MissingColumn(String),

    #[error("Invalid value '{value}' in column '{column}' at row {row}")]
    InvalidValue {
        column: String,
        value: String,
        row: usize,
    },

    #[error("Invalid file name pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("Failed to walk dataset: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
