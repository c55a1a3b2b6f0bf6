//! Cohort CSV files.
//!
//! The batch input format is headerless with two columns, the prefixed
//! subject identifier and the input image path:
//!
//! ```text
//! sub-01,/data/bids/sub-01/ses-research3T/anat/sub-01_ses-research3T_T1w.nii.gz
//! sub-02,/data/bids/sub-02/ses-clinical01/anat/sub-02_ses-clinical01_T1w.nii.gz
//! ```

use std::io::{Read, Write};
use std::path::Path;

use tracing::info;

use super::resolver::CohortRecord;
use crate::error::ResolveError;
use crate::pipeline::Subject;

const SUBJECT_PREFIX: &str = "sub-";

/// Prefixes a bare subject label with `sub-`.
pub fn subject_id(label: &str) -> String {
    if label.starts_with(SUBJECT_PREFIX) {
        label.to_string()
    } else {
        format!("{}{}", SUBJECT_PREFIX, label)
    }
}

/// Writes `records` in the batch input format.
pub fn write_reconall_csv<W: Write>(
    records: &[CohortRecord],
    writer: W,
) -> Result<(), ResolveError> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(writer);

    for record in records {
        let path = record.file_path.to_string_lossy();
        writer.write_record([subject_id(&record.subject).as_str(), path.as_ref()])?;
    }
    writer.flush()?;

    info!(subjects = records.len(), "Wrote cohort table");
    Ok(())
}

/// Reads a batch input file into subjects rooted at `subjects_dir`.
///
/// With `destination_root`, each subject's tree is moved to
/// `<destination_root>/<id>` when it finishes.
pub fn read_cohort_csv<R: Read>(
    reader: R,
    subjects_dir: &Path,
    destination_root: Option<&Path>,
) -> Result<Vec<Subject>, ResolveError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .trim(csv::Trim::All)
        .from_reader(reader);

    let mut subjects = Vec::new();
    for (line, record) in reader.records().enumerate() {
        let record = record?;
        let row = line + 1;

        let id = record.get(0).filter(|v| !v.is_empty());
        let image = record.get(1).filter(|v| !v.is_empty());
        let (Some(id), Some(image)) = (id, image) else {
            return Err(ResolveError::InvalidValue {
                column: "sub,file_path".to_string(),
                value: record.iter().collect::<Vec<_>>().join(","),
                row,
            });
        };

        let subject =
            Subject::new(id, image, subjects_dir).map_err(|_| ResolveError::InvalidValue {
                column: "sub".to_string(),
                value: id.to_string(),
                row,
            })?;
        let subject = match destination_root {
            Some(root) => subject.with_destination(root.join(id)),
            None => subject,
        };
        subjects.push(subject);
    }

    Ok(subjects)
}
