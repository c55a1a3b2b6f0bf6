//! Cohort and input file resolution.
//!
//! Turns a BIDS dataset (walked on disk or loaded from an index table)
//! into the list of subjects and input images the pipeline runs on.
//!
//! - [`index`]: row-per-file dataset views and query predicates
//! - [`resolver`]: anatomical and multi-modal resolution rules
//! - [`export`]: the headerless cohort CSV consumed by batch runs

pub mod export;
pub mod index;
pub mod resolver;

pub use export::{read_cohort_csv, subject_id, write_reconall_csv};
pub use index::{BidsDirectoryIndex, DatasetIndex, InMemoryIndex, IndexQuery, IndexRow};
pub use resolver::{
    resolve_anatomical, resolve_multimodal, AnatomicalQuery, CohortRecord, FileKey, Modality,
    MultiModalFiles, ResolvedCohort, INCOMPLETE_RUN,
};
