//! Command-line interface for multiscale-atlas.
//!
//! Provides commands for running the pipeline on one subject or a cohort,
//! and for resolving cohort inputs from a BIDS dataset.

mod commands;

pub use commands::{parse_cli, run_with_cli, Cli, Commands};
