//! Toolkit environment configuration and bootstrap.
//!
//! The toolkit binaries read their configuration from environment
//! variables (`FREESURFER_HOME`, `SUBJECTS_DIR`, ...). Rather than exporting
//! those into this process, they are collected into a [`ToolkitEnvironment`]
//! and attached to every [`ToolInvocation`] explicitly.
//!
//! # Environment file
//!
//! A flat string map in JSON (or YAML when the extension is `.yaml`/`.yml`):
//!
//! ```json
//! {
//!   "FREESURFER_HOME": "/opt/freesurfer",
//!   "SUBJECTS_DIR": "/data/subjects",
//!   "FS_LICENSE": "/opt/freesurfer/license.txt"
//! }
//! ```
//!
//! `FREESURFER_HOME` and `SUBJECTS_DIR` fall back to the process
//! environment when the file does not set them; `SUBJECTS_DIR` finally
//! defaults to `$FREESURFER_HOME/subjects`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::BootstrapError;
use crate::runner::{ToolInvocation, ToolInvoker};

/// Variable naming the toolkit installation.
pub const TOOLKIT_HOME_VAR: &str = "FREESURFER_HOME";

/// Variable naming the shared subjects root.
pub const SUBJECTS_DIR_VAR: &str = "SUBJECTS_DIR";

/// Setup script shipped with the toolkit, relative to its home.
pub const SETUP_SCRIPT: &str = "SetUpFreeSurfer.sh";

/// Default environment file name, looked up in the working directory.
pub const DEFAULT_ENV_FILE: &str = "setup_environment.json";

/// Resolved toolkit environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolkitEnvironment {
    vars: BTreeMap<String, String>,
    toolkit_home: PathBuf,
    subjects_dir: PathBuf,
}

impl ToolkitEnvironment {
    /// Builds an environment from an explicit variable map.
    ///
    /// Does not consult the process environment.
    pub fn from_vars(mut vars: BTreeMap<String, String>) -> Result<Self, BootstrapError> {
        let toolkit_home = vars
            .get(TOOLKIT_HOME_VAR)
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from)
            .ok_or_else(|| BootstrapError::MissingVariable(TOOLKIT_HOME_VAR.to_string()))?;

        let subjects_dir = match vars.get(SUBJECTS_DIR_VAR).filter(|v| !v.trim().is_empty()) {
            Some(dir) => PathBuf::from(dir),
            None => {
                let dir = toolkit_home.join("subjects");
                vars.insert(
                    SUBJECTS_DIR_VAR.to_string(),
                    dir.to_string_lossy().into_owned(),
                );
                dir
            }
        };

        Ok(Self {
            vars,
            toolkit_home,
            subjects_dir,
        })
    }

    /// Loads the environment file (if any) and fills the required keys
    /// from the process environment when the file leaves them out.
    pub fn load(env_file: Option<&Path>) -> Result<Self, BootstrapError> {
        let mut vars = match env_file {
            Some(path) => read_env_file(path)?,
            None => BTreeMap::new(),
        };

        for key in [TOOLKIT_HOME_VAR, SUBJECTS_DIR_VAR] {
            if !vars.contains_key(key) {
                if let Ok(value) = std::env::var(key) {
                    debug!(key, "Taking toolkit variable from process environment");
                    vars.insert(key.to_string(), value);
                }
            }
        }

        Self::from_vars(vars)
    }

    /// All declared variables.
    pub fn vars(&self) -> &BTreeMap<String, String> {
        &self.vars
    }

    /// Toolkit installation directory.
    pub fn toolkit_home(&self) -> &Path {
        &self.toolkit_home
    }

    /// Shared subjects root.
    pub fn subjects_dir(&self) -> &Path {
        &self.subjects_dir
    }

    /// Working tree of one subject under the subjects root.
    pub fn subject_dir(&self, subject_id: &str) -> PathBuf {
        self.subjects_dir.join(subject_id)
    }

    /// Path to the toolkit setup script.
    pub fn setup_script(&self) -> PathBuf {
        self.toolkit_home.join(SETUP_SCRIPT)
    }

    /// Creates an invocation that carries this environment.
    pub fn invocation(&self, program: impl Into<String>) -> ToolInvocation {
        ToolInvocation::new(program).with_envs(self.vars.clone())
    }

    /// Runs the toolkit setup script.
    ///
    /// A failure here is fatal to the whole run.
    pub async fn bootstrap(&self, invoker: &dyn ToolInvoker) -> Result<(), BootstrapError> {
        let invocation = self.invocation("sh").path_arg(self.setup_script());

        info!(
            toolkit_home = %self.toolkit_home.display(),
            subjects_dir = %self.subjects_dir.display(),
            "Bootstrapping toolkit environment"
        );

        invoker
            .run(&invocation)
            .await
            .map(|_| ())
            .map_err(BootstrapError::SetupFailed)
    }
}

/// Reads a flat string map from JSON or YAML.
fn read_env_file(path: &Path) -> Result<BTreeMap<String, String>, BootstrapError> {
    let content =
        std::fs::read_to_string(path).map_err(|e| BootstrapError::EnvFileUnreadable {
            path: path.to_path_buf(),
            source: e,
        })?;

    let is_yaml = matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    );

    let parsed: Result<BTreeMap<String, String>, String> = if is_yaml {
        serde_yaml::from_str(&content).map_err(|e| e.to_string())
    } else {
        serde_json::from_str(&content).map_err(|e| e.to_string())
    };

    parsed.map_err(|message| BootstrapError::EnvFileInvalid {
        path: path.to_path_buf(),
        message,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::RecordingInvoker;
    use tempfile::TempDir;

    fn vars(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_from_vars_requires_toolkit_home() {
        let err = ToolkitEnvironment::from_vars(vars(&[("SUBJECTS_DIR", "/s")])).unwrap_err();
        assert!(matches!(err, BootstrapError::MissingVariable(ref k) if k == TOOLKIT_HOME_VAR));
    }

    #[test]
    fn test_subjects_dir_defaults_under_home() {
        let env = ToolkitEnvironment::from_vars(vars(&[("FREESURFER_HOME", "/opt/fs")])).unwrap();
        assert_eq!(env.subjects_dir(), Path::new("/opt/fs/subjects"));
        assert_eq!(env.vars()[SUBJECTS_DIR_VAR], "/opt/fs/subjects");
        assert_eq!(env.subject_dir("sub-01"), PathBuf::from("/opt/fs/subjects/sub-01"));
    }

    #[test]
    fn test_load_json_env_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("setup_environment.json");
        std::fs::write(
            &path,
            r#"{"FREESURFER_HOME": "/opt/fs", "SUBJECTS_DIR": "/data/subjects", "FS_LICENSE": "/opt/fs/license.txt"}"#,
        )
        .unwrap();

        let env = ToolkitEnvironment::load(Some(&path)).unwrap();
        assert_eq!(env.toolkit_home(), Path::new("/opt/fs"));
        assert_eq!(env.subjects_dir(), Path::new("/data/subjects"));
        assert_eq!(env.vars()["FS_LICENSE"], "/opt/fs/license.txt");
    }

    #[test]
    fn test_load_yaml_env_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("env.yaml");
        std::fs::write(&path, "FREESURFER_HOME: /opt/fs\nSUBJECTS_DIR: /data/subjects\n").unwrap();

        let env = ToolkitEnvironment::load(Some(&path)).unwrap();
        assert_eq!(env.subjects_dir(), Path::new("/data/subjects"));
    }

    #[test]
    fn test_invalid_env_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("setup_environment.json");
        std::fs::write(&path, "[1, 2, 3]").unwrap();

        let err = ToolkitEnvironment::load(Some(&path)).unwrap_err();
        assert!(matches!(err, BootstrapError::EnvFileInvalid { .. }));
    }

    #[test]
    fn test_missing_env_file() {
        let err = ToolkitEnvironment::load(Some(Path::new("/nonexistent/env.json"))).unwrap_err();
        assert!(matches!(err, BootstrapError::EnvFileUnreadable { .. }));
    }

    #[test]
    fn test_invocation_carries_environment() {
        let env = ToolkitEnvironment::from_vars(vars(&[
            ("FREESURFER_HOME", "/opt/fs"),
            ("SUBJECTS_DIR", "/data/subjects"),
        ]))
        .unwrap();

        let invocation = env.invocation("mri_convert");
        assert_eq!(invocation.env["SUBJECTS_DIR"], "/data/subjects");
        assert_eq!(invocation.env["FREESURFER_HOME"], "/opt/fs");
    }

    #[tokio::test]
    async fn test_bootstrap_runs_setup_script() {
        let env = ToolkitEnvironment::from_vars(vars(&[("FREESURFER_HOME", "/opt/fs")])).unwrap();
        let invoker = RecordingInvoker::new();

        env.bootstrap(&invoker).await.unwrap();

        let calls = invoker.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].program, "sh");
        assert_eq!(calls[0].args, vec!["/opt/fs/SetUpFreeSurfer.sh"]);
    }

    #[tokio::test]
    async fn test_bootstrap_failure_is_fatal_error() {
        let env = ToolkitEnvironment::from_vars(vars(&[("FREESURFER_HOME", "/opt/fs")])).unwrap();
        let invoker = RecordingInvoker::new().failing_at_call(1, 127);

        let err = env.bootstrap(&invoker).await.unwrap_err();
        assert!(matches!(err, BootstrapError::SetupFailed(_)));
    }
}
