//! Cohort resolution.
//!
//! Picks, per subject, the raw files the pipeline consumes.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::index::{
    DatasetIndex, IndexQuery, IndexRow, DATATYPE_COLUMN, EXTENSION_COLUMN, FILE_PATH_COLUMN,
    RUN_COLUMN, SESSION_COLUMN, SUBJECT_COLUMN, SUFFIX_COLUMN,
};
use crate::error::ResolveError;

/// Default research session label; wins over [`CLINICAL_SESSION`].
pub const RESEARCH_SESSION: &str = "research3T";

/// Default clinical session label.
pub const CLINICAL_SESSION: &str = "clinical01";

/// Acquisition run that is never complete and is always excluded from
/// multi-modal resolution.
pub const INCOMPLETE_RUN: u32 = 1;

/// Image extensions accepted by default.
pub const NIFTI_EXTENSIONS: [&str; 2] = [".nii.gz", ".nii"];

/// Index columns never carried into resolved records.
pub const BOOKKEEPING_COLUMNS: [&str; 4] = ["extra_entities", "json", "space", "mod_time"];

/// Columns in emission order; entity columns follow, sorted by name.
const STANDARD_COLUMNS: [&str; 7] = [
    SUBJECT_COLUMN,
    SESSION_COLUMN,
    RUN_COLUMN,
    DATATYPE_COLUMN,
    SUFFIX_COLUMN,
    EXTENSION_COLUMN,
    FILE_PATH_COLUMN,
];

/// What to resolve for anatomical input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnatomicalQuery {
    pub suffix: String,
    /// Allowed sessions, highest priority first.
    pub session_priority: Vec<String>,
    pub extensions: Vec<String>,
}

impl Default for AnatomicalQuery {
    fn default() -> Self {
        Self {
            suffix: "T1w".to_string(),
            session_priority: vec![RESEARCH_SESSION.to_string(), CLINICAL_SESSION.to_string()],
            extensions: NIFTI_EXTENSIONS.iter().map(|e| e.to_string()).collect(),
        }
    }
}

impl AnatomicalQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.suffix = suffix.into();
        self
    }

    /// Replaces the session priority list. An empty list accepts rows from
    /// any session, including none.
    pub fn with_session_priority<I, S>(mut self, sessions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.session_priority = sessions.into_iter().map(Into::into).collect();
        self
    }

    fn index_query(&self) -> IndexQuery {
        IndexQuery::new()
            .with_suffix(&self.suffix)
            .with_sessions(self.session_priority.iter().cloned())
            .with_extensions(self.extensions.iter().cloned())
    }

    /// Rank of a session; lower is preferred.
    fn rank(&self, session: Option<&str>) -> usize {
        session
            .and_then(|ses| self.session_priority.iter().position(|p| p == ses))
            .unwrap_or(self.session_priority.len())
    }
}

/// Canonical input for one subject.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CohortRecord {
    /// Subject label without the `sub-` prefix.
    pub subject: String,
    pub session: Option<String>,
    pub file_path: PathBuf,
    /// Every retained column with a value for this record.
    pub attributes: BTreeMap<String, String>,
}

/// Result of anatomical resolution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedCohort {
    /// One record per subject, ordered by subject.
    pub records: Vec<CohortRecord>,
    /// Columns with at least one value across the matched rows.
    pub columns: Vec<String>,
}

impl ResolvedCohort {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, subject: &str) -> Option<&CohortRecord> {
        self.records.iter().find(|r| r.subject == subject)
    }
}

/// Resolves one anatomical image per subject.
///
/// When a subject has rows from several allowed sessions, only the rows of
/// the highest-priority session survive. A subject left with more than one
/// row is an error. Columns without any value across the matched rows are
/// dropped, as are bookkeeping columns.
pub fn resolve_anatomical(
    index: &dyn DatasetIndex,
    query: &AnatomicalQuery,
) -> Result<ResolvedCohort, ResolveError> {
    let rows = index.query(&query.index_query())?;
    let columns = present_columns(&rows);

    let mut by_subject: BTreeMap<String, Vec<IndexRow>> = BTreeMap::new();
    for row in rows {
        by_subject.entry(row.subject.clone()).or_default().push(row);
    }

    let mut records = Vec::with_capacity(by_subject.len());
    for (subject, candidates) in by_subject {
        let best = candidates
            .iter()
            .map(|r| query.rank(r.session.as_deref()))
            .min()
            .unwrap_or(0);
        let mut survivors: Vec<IndexRow> = candidates
            .into_iter()
            .filter(|r| query.rank(r.session.as_deref()) == best)
            .collect();

        if survivors.len() > 1 {
            return Err(ResolveError::AmbiguousRecord {
                session: survivors[0].session.clone().unwrap_or_default(),
                count: survivors.len(),
                candidates: survivors.into_iter().map(|r| r.file_path).collect(),
                subject,
            });
        }

        let Some(row) = survivors.pop() else {
            continue;
        };
        debug!(subject = %subject, session = ?row.session, path = %row.file_path.display(), "Resolved anatomical input");

        let attributes = columns
            .iter()
            .filter_map(|c| row.column(c).map(|v| (c.clone(), v)))
            .collect();
        records.push(CohortRecord {
            subject,
            session: row.session,
            file_path: row.file_path,
            attributes,
        });
    }

    info!(subjects = records.len(), suffix = %query.suffix, "Resolved anatomical cohort");
    Ok(ResolvedCohort { records, columns })
}

fn present_columns(rows: &[IndexRow]) -> Vec<String> {
    let mut columns: Vec<String> = STANDARD_COLUMNS
        .iter()
        .filter(|c| rows.iter().any(|r| r.column(c).is_some()))
        .map(|c| c.to_string())
        .collect();

    let mut extra: Vec<&String> = rows.iter().flat_map(|r| r.entities.keys()).collect();
    extra.sort();
    extra.dedup();
    columns.extend(extra.into_iter().cloned());

    columns.retain(|c| !BOOKKEEPING_COLUMNS.contains(&c.as_str()));
    columns
}

/// Modalities with several files per acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Modality {
    /// Diffusion image plus its gradient tables.
    Diffusion,
    /// Phase-encoding field map.
    FieldMap,
}

impl Modality {
    pub fn datatype(&self) -> &'static str {
        match self {
            Modality::Diffusion => "dwi",
            Modality::FieldMap => "fmap",
        }
    }

    pub fn suffix(&self) -> &'static str {
        match self {
            Modality::Diffusion => "dwi",
            Modality::FieldMap => "epi",
        }
    }

    fn extensions(&self) -> &'static [&'static str] {
        match self {
            Modality::Diffusion => &[".nii.gz", ".nii", ".bval", ".bvec"],
            Modality::FieldMap => &[".nii.gz", ".nii"],
        }
    }

    fn file_key(&self, extension: &str) -> Option<FileKey> {
        match (self, extension) {
            (Modality::Diffusion, ".bval") => Some(FileKey::Bval),
            (Modality::Diffusion, ".bvec") => Some(FileKey::Bvec),
            (Modality::Diffusion, ".nii.gz" | ".nii") => Some(FileKey::Image),
            (Modality::FieldMap, ".nii.gz" | ".nii") => Some(FileKey::FieldMap),
            _ => None,
        }
    }
}

impl std::str::FromStr for Modality {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "dwi" | "diffusion" => Ok(Modality::Diffusion),
            "fmap" | "fieldmap" | "epi" => Ok(Modality::FieldMap),
            other => Err(format!("unknown modality '{}' (expected dwi or fmap)", other)),
        }
    }
}

/// File role within a multi-modal acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum FileKey {
    #[serde(rename = "dwi")]
    Image,
    #[serde(rename = "bval")]
    Bval,
    #[serde(rename = "bvec")]
    Bvec,
    #[serde(rename = "epi")]
    FieldMap,
}

impl FileKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileKey::Image => "dwi",
            FileKey::Bval => "bval",
            FileKey::Bvec => "bvec",
            FileKey::FieldMap => "epi",
        }
    }
}

impl std::fmt::Display for FileKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-subject file paths keyed by role.
pub type MultiModalFiles = BTreeMap<String, BTreeMap<FileKey, PathBuf>>;

/// Resolves one path per file role per subject.
///
/// Rows from run [`INCOMPLETE_RUN`] are dropped first. More than one
/// remaining row for the same subject and role is an error.
///
/// Field maps are keyed by suffix only, not by phase-encoding direction.
/// A subject with a reverse-encoded pair (`dir-AP` and `dir-PA` `epi`
/// images) therefore yields [`ResolveError::AmbiguousFile`] listing both
/// images, and the caller has to pick one.
pub fn resolve_multimodal(
    index: &dyn DatasetIndex,
    modality: Modality,
) -> Result<MultiModalFiles, ResolveError> {
    let query = IndexQuery::new()
        .with_suffix(modality.suffix())
        .with_extensions(modality.extensions().iter().copied());
    let rows = index.query(&query)?;

    let mut grouped: BTreeMap<(String, FileKey), Vec<PathBuf>> = BTreeMap::new();
    let mut excluded = 0usize;
    for row in rows {
        if row.run == Some(INCOMPLETE_RUN) {
            excluded += 1;
            continue;
        }
        if row
            .datatype
            .as_deref()
            .is_some_and(|d| d != modality.datatype())
        {
            continue;
        }
        if let Some(key) = modality.file_key(&row.extension) {
            grouped
                .entry((row.subject, key))
                .or_default()
                .push(row.file_path);
        }
    }

    let mut files = MultiModalFiles::new();
    for ((subject, key), mut paths) in grouped {
        if paths.len() > 1 {
            return Err(ResolveError::AmbiguousFile {
                subject,
                key: key.to_string(),
                candidates: paths,
            });
        }
        if let Some(path) = paths.pop() {
            files.entry(subject).or_default().insert(key, path);
        }
    }

    info!(
        modality = modality.datatype(),
        subjects = files.len(),
        excluded,
        "Resolved multi-modal files"
    );
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cohort::index::InMemoryIndex;

    fn t1(subject: &str, session: &str) -> IndexRow {
        IndexRow::new(
            subject,
            "T1w",
            ".nii.gz",
            format!("/bids/sub-{0}/ses-{1}/anat/sub-{0}_ses-{1}_T1w.nii.gz", subject, session),
        )
        .with_session(session)
        .with_datatype("anat")
    }

    fn dwi(subject: &str, run: u32, ext: &str) -> IndexRow {
        IndexRow::new(
            subject,
            "dwi",
            ext,
            format!("/bids/sub-{0}/dwi/sub-{0}_run-{1}_dwi{2}", subject, run, ext),
        )
        .with_run(run)
        .with_datatype("dwi")
    }

    #[test]
    fn test_research_session_wins() {
        let index = InMemoryIndex::new(vec![t1("01", CLINICAL_SESSION), t1("01", RESEARCH_SESSION)]);

        let cohort = resolve_anatomical(&index, &AnatomicalQuery::new()).unwrap();

        assert_eq!(cohort.len(), 1);
        let record = &cohort.records[0];
        assert_eq!(record.session.as_deref(), Some(RESEARCH_SESSION));
        assert!(record.file_path.to_string_lossy().contains("ses-research3T"));
    }

    #[test]
    fn test_sorted_by_subject() {
        let index = InMemoryIndex::new(vec![t1("02", CLINICAL_SESSION), t1("01", RESEARCH_SESSION)]);

        let cohort = resolve_anatomical(&index, &AnatomicalQuery::new()).unwrap();

        let subjects: Vec<_> = cohort.records.iter().map(|r| r.subject.as_str()).collect();
        assert_eq!(subjects, vec!["01", "02"]);
    }

    #[test]
    fn test_other_sessions_ignored() {
        let index = InMemoryIndex::new(vec![t1("01", "followup"), t1("02", RESEARCH_SESSION)]);

        let cohort = resolve_anatomical(&index, &AnatomicalQuery::new()).unwrap();
        assert_eq!(cohort.len(), 1);
        assert!(cohort.get("01").is_none());
    }

    #[test]
    fn test_duplicate_in_same_session_is_ambiguous() {
        let mut second = t1("01", RESEARCH_SESSION);
        second.file_path = PathBuf::from("/bids/other_T1w.nii.gz");
        let index = InMemoryIndex::new(vec![t1("01", RESEARCH_SESSION), second]);

        let err = resolve_anatomical(&index, &AnatomicalQuery::new()).unwrap_err();
        assert!(matches!(err, ResolveError::AmbiguousRecord { count: 2, ref subject, .. } if subject == "01"));
    }

    #[test]
    fn test_absent_and_bookkeeping_columns_dropped() {
        let index = InMemoryIndex::new(vec![
            t1("01", RESEARCH_SESSION)
                .with_entity("acq", "mprage")
                .with_entity("json", "{}")
                .with_entity("space", "orig"),
            t1("02", RESEARCH_SESSION),
        ]);

        let cohort = resolve_anatomical(&index, &AnatomicalQuery::new()).unwrap();

        assert!(!cohort.columns.contains(&"run".to_string()));
        assert!(cohort.columns.contains(&"acq".to_string()));
        assert!(!cohort.columns.contains(&"json".to_string()));
        assert!(!cohort.columns.contains(&"space".to_string()));
        assert_eq!(cohort.records[0].attributes["acq"], "mprage");
        assert!(!cohort.records[1].attributes.contains_key("acq"));
        assert_eq!(cohort.records[1].attributes["sub"], "02");
    }

    #[test]
    fn test_custom_session_priority() {
        let index = InMemoryIndex::new(vec![t1("01", "a"), t1("01", "b")]);
        let query = AnatomicalQuery::new().with_session_priority(["b", "a"]);

        let cohort = resolve_anatomical(&index, &query).unwrap();
        assert_eq!(cohort.records[0].session.as_deref(), Some("b"));
    }

    #[test]
    fn test_multimodal_excludes_incomplete_run() {
        let index = InMemoryIndex::new(vec![
            dwi("01", 1, ".nii.gz"),
            dwi("01", 2, ".nii.gz"),
            dwi("01", 2, ".bval"),
        ]);

        let files = resolve_multimodal(&index, Modality::Diffusion).unwrap();

        assert_eq!(files.len(), 1);
        let subject = &files["01"];
        assert_eq!(subject.len(), 2);
        assert!(subject[&FileKey::Image].to_string_lossy().contains("run-2"));
        assert!(subject[&FileKey::Bval].to_string_lossy().ends_with("run-2_dwi.bval"));
    }

    #[test]
    fn test_multimodal_duplicate_is_ambiguous() {
        let index = InMemoryIndex::new(vec![dwi("01", 2, ".nii.gz"), dwi("01", 3, ".nii.gz")]);

        let err = resolve_multimodal(&index, Modality::Diffusion).unwrap_err();
        assert!(matches!(err, ResolveError::AmbiguousFile { ref key, .. } if key == "dwi"));
    }

    #[test]
    fn test_fieldmap() {
        let index = InMemoryIndex::new(vec![
            IndexRow::new("01", "epi", ".nii.gz", "/bids/sub-01/fmap/sub-01_dir-AP_epi.nii.gz")
                .with_datatype("fmap"),
            IndexRow::new("01", "epi", ".json", "/bids/sub-01/fmap/sub-01_dir-AP_epi.json")
                .with_datatype("fmap"),
        ]);

        let files = resolve_multimodal(&index, Modality::FieldMap).unwrap();
        assert_eq!(files["01"].len(), 1);
        assert!(files["01"].contains_key(&FileKey::FieldMap));
    }

    #[test]
    fn test_fieldmap_direction_pair_is_ambiguous() {
        let index = InMemoryIndex::new(vec![
            IndexRow::new("01", "epi", ".nii.gz", "/bids/sub-01/fmap/sub-01_dir-AP_epi.nii.gz")
                .with_datatype("fmap"),
            IndexRow::new("01", "epi", ".nii.gz", "/bids/sub-01/fmap/sub-01_dir-PA_epi.nii.gz")
                .with_datatype("fmap"),
        ]);

        let err = resolve_multimodal(&index, Modality::FieldMap).unwrap_err();
        match err {
            ResolveError::AmbiguousFile {
                subject,
                key,
                candidates,
            } => {
                assert_eq!(subject, "01");
                assert_eq!(key, "epi");
                assert_eq!(candidates.len(), 2);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_modality_from_str() {
        assert_eq!("dwi".parse::<Modality>().unwrap(), Modality::Diffusion);
        assert_eq!("FMAP".parse::<Modality>().unwrap(), Modality::FieldMap);
        assert!("bold".parse::<Modality>().is_err());
    }
}
