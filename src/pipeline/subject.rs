//! Subject definition.

use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::environment::ToolkitEnvironment;
use crate::error::PipelineError;

/// One cohort entry to be processed.
///
/// Immutable after creation. The working directory is always
/// `<subjects root>/<id>`, which is where the reconstruction tool creates
/// the subject tree. Only constructible through [`Subject::new`], which
/// validates the identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Subject {
    id: String,
    input_image: PathBuf,
    working_dir: PathBuf,
    destination: Option<PathBuf>,
}

impl Subject {
    /// Creates a subject whose working tree lives under `subjects_dir`.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::InvalidSubject` if the identifier is empty
    /// or could escape the subjects root.
    pub fn new(
        id: impl Into<String>,
        input_image: impl Into<PathBuf>,
        subjects_dir: &Path,
    ) -> Result<Self, PipelineError> {
        let id = id.into();
        validate_subject_id(&id)?;
        let working_dir = subjects_dir.join(&id);
        Ok(Self {
            id,
            input_image: input_image.into(),
            working_dir,
            destination: None,
        })
    }

    /// Creates a subject rooted in the environment's subjects directory.
    pub fn in_environment(
        id: impl Into<String>,
        input_image: impl Into<PathBuf>,
        env: &ToolkitEnvironment,
    ) -> Result<Self, PipelineError> {
        Self::new(id, input_image, env.subjects_dir())
    }

    /// Sets where the finished tree is moved.
    pub fn with_destination(mut self, destination: impl Into<PathBuf>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn input_image(&self) -> &Path {
        &self.input_image
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    pub fn destination(&self) -> Option<&Path> {
        self.destination.as_deref()
    }

    /// `<working dir>/label/<file>`.
    pub fn label_path(&self, file: &str) -> PathBuf {
        self.working_dir.join("label").join(file)
    }

    /// `<working dir>/stats/<file>`.
    pub fn stats_path(&self, file: &str) -> PathBuf {
        self.working_dir.join("stats").join(file)
    }

    /// `<working dir>/mri/<file>`.
    pub fn mri_path(&self, file: &str) -> PathBuf {
        self.working_dir.join("mri").join(file)
    }
}

fn validate_subject_id(id: &str) -> Result<(), PipelineError> {
    if id.trim().is_empty() {
        return Err(PipelineError::InvalidSubject(
            "subject identifier cannot be empty".to_string(),
        ));
    }
    if id.contains('/') || id.contains('\\') || id == "." || id == ".." {
        return Err(PipelineError::InvalidSubject(format!(
            "subject identifier '{}' must be a single path component",
            id
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_working_dir_under_subjects_root() {
        let subject = Subject::new("sub-01", "/raw/t1.nii.gz", Path::new("/subjects")).unwrap();
        assert_eq!(subject.working_dir(), Path::new("/subjects/sub-01"));
        assert_eq!(
            subject.label_path("lh.cortex.label"),
            PathBuf::from("/subjects/sub-01/label/lh.cortex.label")
        );
        assert_eq!(subject.destination(), None);
    }

    #[test]
    fn test_rejects_bad_identifiers() {
        for id in ["", "  ", "a/b", "..", "."] {
            assert!(
                Subject::new(id, "t1.nii.gz", Path::new("/subjects")).is_err(),
                "accepted {id:?}"
            );
        }
    }

    #[test]
    fn test_serializes_validated_fields() {
        let subject = Subject::new("sub-03", "/raw/t1.nii.gz", Path::new("/subjects")).unwrap();
        let json = serde_json::to_value(&subject).unwrap();
        assert_eq!(json["id"], "sub-03");
        assert_eq!(json["working_dir"], "/subjects/sub-03");
    }

    #[test]
    fn test_destination() {
        let subject = Subject::new("sub-02", "t1.nii.gz", Path::new("/subjects"))
            .unwrap()
            .with_destination("/results");
        assert_eq!(subject.destination(), Some(Path::new("/results")));
    }
}
