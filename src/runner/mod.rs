//! External tool invocation.
//!
//! This module runs the toolkit binaries that do the actual imaging work.
//! The pipeline never shells out directly; every command goes through a
//! [`ToolInvoker`] so that tests and dry runs can substitute their own.
//!
//! # Architecture
//!
//! ```text
//! StageTemplate → ToolInvocation → ToolInvoker → external process
//!                                      │
//!                                      └─→ InvocationOutcome | ToolError
//! ```
//!
//! A non-zero exit status is always reported as [`ToolError::NonZeroExit`];
//! invokers never downgrade a failure into a success.
//!
//! # Example
//!
//! ```ignore
//! use multiscale_atlas::runner::{ProcessInvoker, ToolInvocation, ToolInvoker};
//!
//! let invocation = ToolInvocation::new("mri_convert")
//!     .arg("in.mgz")
//!     .arg("out.nii.gz")
//!     .with_env("SUBJECTS_DIR", "/data/subjects");
//!
//! let outcome = ProcessInvoker::new().run(&invocation).await?;
//! println!("{} finished in {:?}", outcome.program, outcome.duration);
//! ```

pub mod invocation;
pub mod invoker;
pub mod recording;

pub use crate::error::ToolError;
pub use invocation::ToolInvocation;
pub use invoker::{InvocationOutcome, ProcessInvoker, ToolInvoker};
pub use recording::RecordingInvoker;
