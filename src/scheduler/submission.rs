use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SatelliteError};
use crate::scheduler::job::JobRequest;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubmissionStatus {
    Pending,
    Running,
    Done,
    Error,
    Canceled,
    Interrupted,
}

impl SubmissionStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, SubmissionStatus::Pending | SubmissionStatus::Running)
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Some(SubmissionStatus::Pending),
            "RUNNING" => Some(SubmissionStatus::Running),
            "DONE" => Some(SubmissionStatus::Done),
            "ERROR" => Some(SubmissionStatus::Error),
            "CANCELED" => Some(SubmissionStatus::Canceled),
            "INTERRUPTED" => Some(SubmissionStatus::Interrupted),
            _ => None,
        }
    }
}

impl std::fmt::Display for SubmissionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubmissionStatus::Pending => write!(f, "PENDING"),
            SubmissionStatus::Running => write!(f, "RUNNING"),
            SubmissionStatus::Done => write!(f, "DONE"),
            SubmissionStatus::Error => write!(f, "ERROR"),
            SubmissionStatus::Canceled => write!(f, "CANCELED"),
            SubmissionStatus::Interrupted => write!(f, "INTERRUPTED"),
        }
    }
}

/// Body accepted by `POST /run` and by initial submission files.
#[derive(Debug, Clone, Deserialize)]
pub struct SubmissionRequest {
    pub job_specs: Vec<JobRequest>,
    #[serde(default)]
    pub parallel: Option<f64>,
    #[serde(default)]
    pub note: Option<String>,
}

impl SubmissionRequest {
    /// Validate an untyped payload against the submission shape.
    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        serde_json::from_value(value).map_err(|e| SatelliteError::InvalidSubmission(e.to_string()))
    }

    /// Requested parallelism, falling back to `default` when absent.
    pub fn parallel_or(&self, default: u32) -> u32 {
        match self.parallel {
            Some(p) if p.is_finite() && p > 0.0 => p.min(u32::MAX as f64) as u32,
            Some(_) => 0,
            None => default,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Submission {
    pub submission_id: String,
    pub parallel: u32,
    pub submitted: DateTime<Utc>,
    pub status: SubmissionStatus,
    pub note: String,
    pub num_jobs: usize,
    pub job_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Original job requests, kept so a live submission can be persisted and resumed.
    #[serde(skip)]
    pub requests: Vec<JobRequest>,
}

impl Submission {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Number of concurrent workers used to drain this submission's jobs.
    pub fn worker_count(&self) -> usize {
        self.job_ids.len().min((self.parallel as usize).max(1))
    }

    pub fn to_pending(&self) -> PendingSubmission {
        PendingSubmission {
            submission_id: self.submission_id.clone(),
            job_specs: self.requests.clone(),
            parallel: self.parallel,
            note: self.note.clone(),
            submitted: self.submitted,
            job_ids: self.job_ids.clone(),
        }
    }
}

/// A submission that was pending or running at shutdown, with everything needed to
/// enqueue it again under the same ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingSubmission {
    pub submission_id: String,
    pub job_specs: Vec<JobRequest>,
    pub parallel: u32,
    #[serde(default)]
    pub note: String,
    pub submitted: DateTime<Utc>,
    pub job_ids: Vec<String>,
}
