//! Dataset index.
//!
//! A row-per-file view of a BIDS-style dataset. Rows come either from a
//! tabular export (CSV with one column per entity) or from walking the
//! dataset tree and parsing file names.

use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;
use walkdir::WalkDir;

use crate::error::ResolveError;

/// Column holding the subject label.
pub const SUBJECT_COLUMN: &str = "sub";
/// Column holding the session label.
pub const SESSION_COLUMN: &str = "ses";
/// Column holding the acquisition run index.
pub const RUN_COLUMN: &str = "run";
pub const DATATYPE_COLUMN: &str = "datatype";
pub const SUFFIX_COLUMN: &str = "suffix";
pub const EXTENSION_COLUMN: &str = "ext";
pub const FILE_PATH_COLUMN: &str = "file_path";

/// Top-level directories that never hold raw subject data.
const SKIPPED_DIRS: &[&str] = &["derivatives", "sourcedata", "code", "stimuli"];

/// One file in the dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexRow {
    /// Subject label without the `sub-` prefix.
    pub subject: String,
    pub session: Option<String>,
    pub run: Option<u32>,
    /// Modality directory (`anat`, `dwi`, `fmap`, ...).
    pub datatype: Option<String>,
    pub suffix: String,
    /// Extension including the leading dot, e.g. `.nii.gz`.
    pub extension: String,
    pub file_path: PathBuf,
    /// Remaining entities and metadata columns, present values only.
    pub entities: BTreeMap<String, String>,
}

impl IndexRow {
    pub fn new(
        subject: impl Into<String>,
        suffix: impl Into<String>,
        extension: impl Into<String>,
        file_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            subject: subject.into(),
            session: None,
            run: None,
            datatype: None,
            suffix: suffix.into(),
            extension: extension.into(),
            file_path: file_path.into(),
            entities: BTreeMap::new(),
        }
    }

    pub fn with_session(mut self, session: impl Into<String>) -> Self {
        self.session = Some(session.into());
        self
    }

    pub fn with_run(mut self, run: u32) -> Self {
        self.run = Some(run);
        self
    }

    pub fn with_datatype(mut self, datatype: impl Into<String>) -> Self {
        self.datatype = Some(datatype.into());
        self
    }

    pub fn with_entity(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.entities.insert(key.into(), value.into());
        self
    }

    /// Value of a named column, `None` when absent.
    pub fn column(&self, name: &str) -> Option<String> {
        match name {
            SUBJECT_COLUMN => Some(self.subject.clone()),
            SESSION_COLUMN => self.session.clone(),
            RUN_COLUMN => self.run.map(|r| r.to_string()),
            DATATYPE_COLUMN => self.datatype.clone(),
            SUFFIX_COLUMN => Some(self.suffix.clone()),
            EXTENSION_COLUMN => Some(self.extension.clone()),
            FILE_PATH_COLUMN => Some(self.file_path.to_string_lossy().into_owned()),
            other => self.entities.get(other).cloned(),
        }
    }
}

/// Filter predicates over index rows.
///
/// An empty list accepts any value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexQuery {
    pub suffixes: Vec<String>,
    pub sessions: Vec<String>,
    pub extensions: Vec<String>,
    pub datatype: Option<String>,
}

impl IndexQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.suffixes.push(suffix.into());
        self
    }

    pub fn with_sessions<I, S>(mut self, sessions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.sessions.extend(sessions.into_iter().map(Into::into));
        self
    }

    pub fn with_extensions<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extensions.extend(extensions.into_iter().map(Into::into));
        self
    }

    pub fn with_datatype(mut self, datatype: impl Into<String>) -> Self {
        self.datatype = Some(datatype.into());
        self
    }

    /// Whether `row` passes every predicate.
    pub fn matches(&self, row: &IndexRow) -> bool {
        let suffix_ok = self.suffixes.is_empty() || self.suffixes.contains(&row.suffix);
        let extension_ok = self.extensions.is_empty() || self.extensions.contains(&row.extension);
        let session_ok = self.sessions.is_empty()
            || row
                .session
                .as_ref()
                .is_some_and(|ses| self.sessions.contains(ses));
        let datatype_ok = match (&self.datatype, &row.datatype) {
            (None, _) => true,
            (Some(wanted), Some(actual)) => wanted == actual,
            (Some(_), None) => false,
        };
        suffix_ok && extension_ok && session_ok && datatype_ok
    }
}

/// Source of index rows.
pub trait DatasetIndex {
    /// Every row in the index.
    fn rows(&self) -> Result<Vec<IndexRow>, ResolveError>;

    /// Rows matching `query`, in index order.
    fn query(&self, query: &IndexQuery) -> Result<Vec<IndexRow>, ResolveError> {
        Ok(self
            .rows()?
            .into_iter()
            .filter(|row| query.matches(row))
            .collect())
    }
}

/// Index held in memory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryIndex {
    rows: Vec<IndexRow>,
}

impl InMemoryIndex {
    pub fn new(rows: Vec<IndexRow>) -> Self {
        Self { rows }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Reads a tabular index export.
    ///
    /// The header must name `sub`, `suffix`, `ext` and `file_path`; `ses`,
    /// `run` and `datatype` are optional. Any other column is kept as an
    /// entity. Empty cells count as absent.
    pub fn from_csv_reader<R: Read>(reader: R) -> Result<Self, ResolveError> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::All)
            .from_reader(reader);

        let headers = reader.headers()?.clone();
        let position = |name: &str| headers.iter().position(|h| h == name);
        let require = |name: &str| {
            position(name).ok_or_else(|| ResolveError::MissingColumn(name.to_string()))
        };

        let sub_idx = require(SUBJECT_COLUMN)?;
        let suffix_idx = require(SUFFIX_COLUMN)?;
        let ext_idx = require(EXTENSION_COLUMN)?;
        let path_idx = require(FILE_PATH_COLUMN)?;
        let ses_idx = position(SESSION_COLUMN);
        let run_idx = position(RUN_COLUMN);
        let datatype_idx = position(DATATYPE_COLUMN);

        let known = [
            Some(sub_idx),
            Some(suffix_idx),
            Some(ext_idx),
            Some(path_idx),
            ses_idx,
            run_idx,
            datatype_idx,
        ];

        let mut rows = Vec::new();
        for (line, record) in reader.records().enumerate() {
            let record = record?;
            let cell = |idx: usize| record.get(idx).filter(|v| !v.is_empty());
            let optional = |idx: Option<usize>| idx.and_then(cell).map(str::to_string);

            let subject = cell(sub_idx).ok_or_else(|| ResolveError::InvalidValue {
                column: SUBJECT_COLUMN.to_string(),
                value: String::new(),
                row: line + 1,
            })?;

            let mut row = IndexRow::new(
                subject,
                cell(suffix_idx).unwrap_or_default(),
                cell(ext_idx).unwrap_or_default(),
                cell(path_idx).unwrap_or_default(),
            );
            row.session = optional(ses_idx);
            row.datatype = optional(datatype_idx);
            row.run = optional(run_idx)
                .map(|value| parse_run(&value, line + 1))
                .transpose()?;

            for (idx, header) in headers.iter().enumerate() {
                if known.contains(&Some(idx)) {
                    continue;
                }
                if let Some(value) = cell(idx) {
                    row.entities.insert(header.to_string(), value.to_string());
                }
            }
            rows.push(row);
        }

        debug!(rows = rows.len(), "Loaded index table");
        Ok(Self { rows })
    }

    /// Reads a tabular index export from disk.
    pub fn from_csv_path(path: &Path) -> Result<Self, ResolveError> {
        let file = std::fs::File::open(path)?;
        Self::from_csv_reader(file)
    }
}

impl DatasetIndex for InMemoryIndex {
    fn rows(&self) -> Result<Vec<IndexRow>, ResolveError> {
        Ok(self.rows.clone())
    }
}

/// Accepts `1`, `01` and a float-formatted `1.0` as written by dataframe
/// exports.
fn parse_run(value: &str, row: usize) -> Result<u32, ResolveError> {
    let trimmed = value.strip_suffix(".0").unwrap_or(value);
    trimmed.parse().map_err(|_| ResolveError::InvalidValue {
        column: RUN_COLUMN.to_string(),
        value: value.to_string(),
        row,
    })
}

/// Index built by walking a BIDS dataset on disk.
///
/// Files are recognised by name:
/// `sub-<label>[_<key>-<value>]..._<suffix><extension>`.
#[derive(Debug, Clone)]
pub struct BidsDirectoryIndex {
    root: PathBuf,
    filename: Regex,
}

impl BidsDirectoryIndex {
    /// # Errors
    ///
    /// Returns `ResolveError::MissingDatasetRoot` if `root` is not a
    /// directory.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, ResolveError> {
        let root = root.into();
        if !root.is_dir() {
            return Err(ResolveError::MissingDatasetRoot(root));
        }
        let filename = Regex::new(
            r"^(?P<entities>sub-[A-Za-z0-9]+(?:_[A-Za-z]+-[A-Za-z0-9]+)*)_(?P<suffix>[A-Za-z0-9]+)(?P<ext>\.[A-Za-z0-9.]+)$",
        )?;
        Ok(Self { root, filename })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Parses one file name into a row; `None` if it is not a BIDS file.
    fn parse(&self, path: &Path) -> Option<IndexRow> {
        let name = path.file_name()?.to_str()?;
        let caps = self.filename.captures(name)?;

        let mut entities: BTreeMap<String, String> = caps["entities"]
            .split('_')
            .filter_map(|pair| pair.split_once('-'))
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();

        let subject = entities.remove(SUBJECT_COLUMN)?;
        let mut row = IndexRow::new(subject, &caps["suffix"], &caps["ext"], path);
        row.session = entities.remove(SESSION_COLUMN);
        row.run = entities.remove(RUN_COLUMN).and_then(|r| r.parse().ok());
        row.datatype = path
            .parent()
            .and_then(|p| p.file_name())
            .and_then(|n| n.to_str())
            .filter(|n| !n.starts_with("sub-") && !n.starts_with("ses-"))
            .map(str::to_string);
        row.entities = entities;
        Some(row)
    }
}

impl DatasetIndex for BidsDirectoryIndex {
    fn rows(&self) -> Result<Vec<IndexRow>, ResolveError> {
        let mut rows = Vec::new();
        let walker = WalkDir::new(&self.root)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| {
                let name = entry.file_name().to_string_lossy();
                entry.depth() == 0
                    || !(name.starts_with('.')
                        || (entry.depth() == 1 && SKIPPED_DIRS.contains(&name.as_ref())))
            });

        for entry in walker {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            if let Some(row) = self.parse(entry.path()) {
                rows.push(row);
            }
        }

        debug!(root = %self.root.display(), rows = rows.len(), "Indexed dataset");
        Ok(rows)
    }
}
