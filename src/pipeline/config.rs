//! Pipeline configuration.
//!
//! Execution settings for the subject pipeline and the cohort worker pool.
//! Toolkit variables live separately in
//! [`ToolkitEnvironment`](crate::environment::ToolkitEnvironment).

use thiserror::Error;

use super::scale::DEFAULT_ATLAS;
use super::stage::{StageTemplate, DEFAULT_SOURCE_SUBJECT, DEFAULT_THREADS};

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Configuration for subject pipelines and the cohort orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Maximum number of subjects processed at the same time.
    pub max_concurrent_subjects: usize,
    /// Thread-count hint passed to `recon-all` and `mri_aparc2aseg`.
    pub threads: usize,
    /// Population-average subject holding the atlas annotations.
    pub source_subject: String,
    /// Atlas prefix used in annotation and output names.
    pub atlas: String,
    /// Print the command plan instead of running tools.
    pub dry_run: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_subjects: 1,
            threads: DEFAULT_THREADS,
            source_subject: DEFAULT_SOURCE_SUBJECT.to_string(),
            atlas: DEFAULT_ATLAS.to_string(),
            dry_run: false,
        }
    }
}

impl PipelineConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `PIPELINE_MAX_CONCURRENT_SUBJECTS`: subjects in flight (default: 1)
    /// - `PIPELINE_THREADS`: tool thread hint (default: 8)
    /// - `PIPELINE_SOURCE_SUBJECT`: annotation source subject (default: fsaverage)
    /// - `PIPELINE_ATLAS`: atlas prefix (default: lausanne2018)
    /// - `PIPELINE_DRY_RUN`: print commands only (default: false)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable has an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("PIPELINE_MAX_CONCURRENT_SUBJECTS") {
            config.max_concurrent_subjects =
                parse_env_value(&val, "PIPELINE_MAX_CONCURRENT_SUBJECTS")?;
        }

        if let Ok(val) = std::env::var("PIPELINE_THREADS") {
            config.threads = parse_env_value(&val, "PIPELINE_THREADS")?;
        }

        if let Ok(val) = std::env::var("PIPELINE_SOURCE_SUBJECT") {
            config.source_subject = val;
        }

        if let Ok(val) = std::env::var("PIPELINE_ATLAS") {
            config.atlas = val;
        }

        if let Ok(val) = std::env::var("PIPELINE_DRY_RUN") {
            config.dry_run = parse_env_bool(&val, "PIPELINE_DRY_RUN")?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_subjects == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_concurrent_subjects must be greater than 0".to_string(),
            ));
        }

        if self.threads == 0 {
            return Err(ConfigError::ValidationFailed(
                "threads must be greater than 0".to_string(),
            ));
        }

        if self.source_subject.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "source_subject cannot be empty".to_string(),
            ));
        }

        if self.atlas.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "atlas cannot be empty".to_string(),
            ));
        }

        Ok(())
    }

    /// Builds the stage template these settings describe.
    pub fn stage_template(&self) -> StageTemplate {
        StageTemplate::new()
            .with_atlas(&self.atlas)
            .with_source_subject(&self.source_subject)
            .with_threads(self.threads)
    }

    /// Builder method to set the worker pool size.
    pub fn with_max_concurrent_subjects(mut self, max: usize) -> Self {
        self.max_concurrent_subjects = max;
        self
    }

    /// Builder method to set the thread hint.
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    /// Builder method to set the annotation source subject.
    pub fn with_source_subject(mut self, subject: impl Into<String>) -> Self {
        self.source_subject = subject.into();
        self
    }

    /// Builder method to set the atlas prefix.
    pub fn with_atlas(mut self, atlas: impl Into<String>) -> Self {
        self.atlas = atlas.into();
        self
    }

    /// Builder method to enable or disable dry runs.
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }
}

/// Parses a value from an environment variable string.
fn parse_env_value<T: std::str::FromStr>(val: &str, key: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    val.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key: key.to_string(),
        message: e.to_string(),
    })
}

/// Parses a boolean from an environment variable string.
fn parse_env_bool(val: &str, key: &str) -> Result<bool, ConfigError> {
    match val.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected boolean, got '{}'", val),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.threads, 8);
        assert_eq!(config.source_subject, "fsaverage");
        assert_eq!(config.atlas, "lausanne2018");
    }

    #[test]
    fn test_validation_rejects_zero_workers() {
        let config = PipelineConfig::new().with_max_concurrent_subjects(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_zero_threads() {
        let config = PipelineConfig::new().with_threads(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_empty_atlas() {
        let config = PipelineConfig::new().with_atlas(" ");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_env_value() {
        let value: usize = parse_env_value("4", "TEST").unwrap();
        assert_eq!(value, 4);

        let result: Result<usize, _> = parse_env_value("four", "TEST");
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_parse_env_bool() {
        assert!(parse_env_bool("yes", "TEST").unwrap());
        assert!(!parse_env_bool("OFF", "TEST").unwrap());
        assert!(parse_env_bool("maybe", "TEST").is_err());
    }

    #[test]
    fn test_stage_template_follows_config() {
        let template = PipelineConfig::new().with_atlas("custom").stage_template();
        assert_eq!(template.atlas(), "custom");
    }
}
