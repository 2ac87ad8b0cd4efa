//! Test script execution.
//!
//! - [`spec`]: script discovery and `spec.json` parsing
//! - [`executor`]: runs one job as a process group with a timeout, logs, and result
//!   uploads
//!
//! # Execution Flow
//!
//! 1. A submission worker hands a PENDING job id to [`ProcessExecutor::run`]
//! 2. The job's spec is loaded and `<scripts>/<name>/run` is spawned with
//!    `--key=value` flags and `arg_<key>` environment variables
//! 3. The wait ends on exit, timeout, or cancellation, and the job is marked terminal
//! 4. On DONE, declared result files are pushed to the hub in the background

pub mod executor;
pub mod spec;

pub use executor::{JobOutcome, ProcessExecutor};
pub use spec::{ScriptDirectory, Spec, SpecSource};
