//! Relocation of finished subject trees.

use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::subject::Subject;
use crate::error::FinalizeError;

/// `EXDEV`: rename across filesystems.
const CROSS_DEVICE_ERRNO: i32 = 18;

/// What the finalizer did with a subject tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinalizeOutcome {
    /// No destination configured; the tree stays under the subjects root.
    Skipped { working_dir: PathBuf },
    /// The whole tree now lives at `to`.
    Moved { from: PathBuf, to: PathBuf },
    /// Dry run: the tree would have been moved from `from` to `to`.
    Planned { from: PathBuf, to: PathBuf },
}

impl FinalizeOutcome {
    /// Where the subject's outputs live after finalization.
    pub fn final_path(&self) -> &Path {
        match self {
            FinalizeOutcome::Skipped { working_dir } => working_dir,
            FinalizeOutcome::Moved { to, .. } | FinalizeOutcome::Planned { to, .. } => to,
        }
    }
}

/// Moves a completed working tree to its configured destination.
///
/// If the destination is an existing directory the tree is placed inside
/// it under the subject identifier; otherwise the tree is renamed to the
/// destination path itself. Either the whole tree arrives or none of it
/// does: a cross-filesystem move is staged in a hidden sibling directory
/// and renamed into place only once the copy is complete.
///
/// In dry-run mode nothing on disk is read or written beyond resolving the
/// target path.
#[derive(Debug, Clone, Default)]
pub struct OutputFinalizer {
    dry_run: bool,
}

impl OutputFinalizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Only report the move instead of performing it.
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Relocates `subject`'s working directory, if it has a destination.
    pub fn finalize(&self, subject: &Subject) -> Result<FinalizeOutcome, FinalizeError> {
        let source = subject.working_dir().to_path_buf();

        let Some(destination) = subject.destination() else {
            debug!(subject = %subject.id(), "No destination configured, leaving outputs in place");
            return Ok(FinalizeOutcome::Skipped {
                working_dir: source,
            });
        };

        let target = if destination.is_dir() {
            destination.join(subject.id())
        } else {
            destination.to_path_buf()
        };

        if self.dry_run {
            info!(
                subject = %subject.id(),
                from = %source.display(),
                to = %target.display(),
                "Dry run: would move subject outputs"
            );
            return Ok(FinalizeOutcome::Planned {
                from: source,
                to: target,
            });
        }

        if !source.is_dir() {
            return Err(FinalizeError::SourceMissing(source));
        }

        if target.exists() {
            return Err(FinalizeError::DestinationExists(target));
        }

        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).map_err(|e| move_failed(&source, &target, e))?;
        }

        match std::fs::rename(&source, &target) {
            Ok(()) => {}
            Err(e) if e.raw_os_error() == Some(CROSS_DEVICE_ERRNO) => {
                debug!(subject = %subject.id(), "Destination on another filesystem, copying");
                move_across_devices(&source, &target)?;
            }
            Err(e) => return Err(move_failed(&source, &target, e)),
        }

        info!(
            subject = %subject.id(),
            from = %source.display(),
            to = %target.display(),
            "Moved subject outputs"
        );

        Ok(FinalizeOutcome::Moved {
            from: source,
            to: target,
        })
    }
}

fn move_failed(from: &Path, to: &Path, source: std::io::Error) -> FinalizeError {
    FinalizeError::MoveFailed {
        from: from.to_path_buf(),
        to: to.to_path_buf(),
        source,
    }
}

/// Copies into a staging sibling, renames it into place, then removes the
/// source.
fn move_across_devices(source: &Path, target: &Path) -> Result<(), FinalizeError> {
    let staging = staging_path(target);

    let copied = copy_tree(source, &staging).and_then(|_| std::fs::rename(&staging, target));
    if let Err(e) = copied {
        if staging.exists() {
            if let Err(cleanup) = std::fs::remove_dir_all(&staging) {
                warn!(path = %staging.display(), error = %cleanup, "Failed to remove staging directory");
            }
        }
        return Err(move_failed(source, target, e));
    }

    std::fs::remove_dir_all(source).map_err(|e| move_failed(source, target, e))
}

fn staging_path(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "subject".to_string());
    target.with_file_name(format!(".{}.partial", name))
}

fn copy_tree(source: &Path, target: &Path) -> std::io::Result<()> {
    for entry in WalkDir::new(source) {
        let entry = entry.map_err(std::io::Error::other)?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(std::io::Error::other)?;
        let dest = target.join(relative);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            std::fs::create_dir_all(&dest)?;
        } else if file_type.is_symlink() {
            copy_symlink(entry.path(), &dest)?;
        } else {
            std::fs::copy(entry.path(), &dest)?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn copy_symlink(link: &Path, dest: &Path) -> std::io::Result<()> {
    let pointee = std::fs::read_link(link)?;
    std::os::unix::fs::symlink(pointee, dest)
}

#[cfg(not(unix))]
fn copy_symlink(link: &Path, dest: &Path) -> std::io::Result<()> {
    std::fs::copy(link, dest).map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn subject_with_tree(subjects: &Path, id: &str) -> Subject {
        let subject = Subject::new(id, "t1.nii.gz", subjects).unwrap();
        std::fs::create_dir_all(subject.working_dir().join("mri")).unwrap();
        std::fs::create_dir_all(subject.working_dir().join("stats")).unwrap();
        std::fs::write(subject.mri_path("lausanne2018.scale1.nii.gz"), "volume").unwrap();
        std::fs::write(subject.stats_path("lh.lausanne2018.scale1.stats"), "stats").unwrap();
        subject
    }

    #[test]
    fn test_no_destination_is_noop() {
        let subjects = TempDir::new().unwrap();
        let subject = subject_with_tree(subjects.path(), "sub-01");

        let outcome = OutputFinalizer::new().finalize(&subject).unwrap();

        assert_eq!(outcome.final_path(), subject.working_dir());
        assert!(subject.working_dir().join("mri/lausanne2018.scale1.nii.gz").exists());
    }

    #[test]
    fn test_moves_into_existing_directory() {
        let subjects = TempDir::new().unwrap();
        let results = TempDir::new().unwrap();
        let subject =
            subject_with_tree(subjects.path(), "sub-01").with_destination(results.path());

        let outcome = OutputFinalizer::new().finalize(&subject).unwrap();

        let expected = results.path().join("sub-01");
        assert_eq!(outcome.final_path(), expected.as_path());
        assert!(expected.join("mri/lausanne2018.scale1.nii.gz").exists());
        assert!(expected.join("stats/lh.lausanne2018.scale1.stats").exists());
        assert!(!subject.working_dir().exists());
    }

    #[test]
    fn test_moves_to_new_path() {
        let subjects = TempDir::new().unwrap();
        let results = TempDir::new().unwrap();
        let target = results.path().join("nested").join("sub-01-final");
        let subject = subject_with_tree(subjects.path(), "sub-01").with_destination(&target);

        OutputFinalizer::new().finalize(&subject).unwrap();

        assert!(target.join("mri/lausanne2018.scale1.nii.gz").exists());
        assert!(!subject.working_dir().exists());
    }

    #[test]
    fn test_refuses_to_overwrite() {
        let subjects = TempDir::new().unwrap();
        let results = TempDir::new().unwrap();
        std::fs::create_dir_all(results.path().join("sub-01")).unwrap();
        let subject =
            subject_with_tree(subjects.path(), "sub-01").with_destination(results.path());

        let err = OutputFinalizer::new().finalize(&subject).unwrap_err();

        assert!(matches!(err, FinalizeError::DestinationExists(_)));
        assert!(subject.working_dir().exists());
    }

    #[test]
    fn test_missing_source() {
        let subjects = TempDir::new().unwrap();
        let results = TempDir::new().unwrap();
        let subject = Subject::new("sub-09", "t1.nii.gz", subjects.path())
            .unwrap()
            .with_destination(results.path());

        let err = OutputFinalizer::new().finalize(&subject).unwrap_err();
        assert!(matches!(err, FinalizeError::SourceMissing(_)));
    }

    #[test]
    fn test_dry_run_leaves_tree_in_place() {
        let subjects = TempDir::new().unwrap();
        let results = TempDir::new().unwrap();
        let subject =
            subject_with_tree(subjects.path(), "sub-01").with_destination(results.path());

        let outcome = OutputFinalizer::new()
            .with_dry_run(true)
            .finalize(&subject)
            .unwrap();

        assert_eq!(
            outcome,
            FinalizeOutcome::Planned {
                from: subject.working_dir().to_path_buf(),
                to: results.path().join("sub-01"),
            }
        );
        assert!(subject.working_dir().join("mri/lausanne2018.scale1.nii.gz").exists());
        assert!(!results.path().join("sub-01").exists());
    }

    #[test]
    fn test_dry_run_without_tree_or_destination_dir() {
        let subjects = TempDir::new().unwrap();
        let results = TempDir::new().unwrap();
        let target = results.path().join("not-yet").join("sub-02");
        let subject = Subject::new("sub-02", "t1.nii.gz", subjects.path())
            .unwrap()
            .with_destination(&target);

        let outcome = OutputFinalizer::new()
            .with_dry_run(true)
            .finalize(&subject)
            .unwrap();

        assert_eq!(outcome.final_path(), target.as_path());
        assert!(!results.path().join("not-yet").exists());
    }

    #[test]
    fn test_copy_tree_preserves_layout() {
        let subjects = TempDir::new().unwrap();
        let results = TempDir::new().unwrap();
        let subject = subject_with_tree(subjects.path(), "sub-01");
        let target = results.path().join("copy");

        move_across_devices(subject.working_dir(), &target).unwrap();

        assert!(target.join("mri/lausanne2018.scale1.nii.gz").exists());
        assert!(!subject.working_dir().exists());
        assert!(!staging_path(&target).exists());
    }
}
