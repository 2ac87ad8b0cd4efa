use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SatelliteError {
    #[error("submission queue full - try again later.")]
    QueueFull,

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Submission not found: {0}")]
    SubmissionNotFound(String),

    #[error("Could not cancel {0}")]
    NotCancelable(String),

    #[error("Spec not found: {0}")]
    SpecNotFound(String),

    #[error("Invalid spec for {name}: {reason}")]
    InvalidSpec { name: String, reason: String },

    #[error("Invalid submission: {0}")]
    InvalidSubmission(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Log file not found: {0}")]
    LogNotFound(String),

    #[error("File too large, see raw")]
    LogTooLarge,

    #[error("Directory {0} does not exist. Perhaps you should create it?")]
    MissingScriptDirectory(PathBuf),

    #[error("Unsupported snapshot schema version {0}")]
    UnsupportedSnapshot(u32),

    #[error("Persistence error: {0}")]
    Persistence(#[from] redb::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, SatelliteError>;
