use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Create a fresh URL-safe identifier for a job, submission, or hub request.
pub fn make_id() -> String {
    URL_SAFE_NO_PAD.encode(Uuid::new_v4().as_bytes())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Running,
    Done,
    Error,
    Timeout,
    Canceled,
    Interrupted,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, JobStatus::Pending | JobStatus::Running)
    }

    /// Parse a status name as used in URL filters, ignoring case.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Some(JobStatus::Pending),
            "RUNNING" => Some(JobStatus::Running),
            "DONE" => Some(JobStatus::Done),
            "ERROR" => Some(JobStatus::Error),
            "TIMEOUT" => Some(JobStatus::Timeout),
            "CANCELED" => Some(JobStatus::Canceled),
            "INTERRUPTED" => Some(JobStatus::Interrupted),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "PENDING"),
            JobStatus::Running => write!(f, "RUNNING"),
            JobStatus::Done => write!(f, "DONE"),
            JobStatus::Error => write!(f, "ERROR"),
            JobStatus::Timeout => write!(f, "TIMEOUT"),
            JobStatus::Canceled => write!(f, "CANCELED"),
            JobStatus::Interrupted => write!(f, "INTERRUPTED"),
        }
    }
}

/// One entry of a submission's `job_specs`: a script name and its parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRequest {
    pub name: String,
    #[serde(default)]
    pub params: Map<String, Value>,
}

impl JobRequest {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Map::new(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    pub name: String,
    pub params: Map<String, Value>,
    pub submission_id: String,
    pub submitted: DateTime<Utc>,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Job {
    pub fn new(submission_id: &str, request: &JobRequest, submitted: DateTime<Utc>) -> Self {
        Self::with_id(make_id(), submission_id, request, submitted)
    }

    /// Build a pending job with a known id, used when resuming a persisted submission.
    pub fn with_id(
        job_id: String,
        submission_id: &str,
        request: &JobRequest,
        submitted: DateTime<Utc>,
    ) -> Self {
        Self {
            job_id,
            name: request.name.clone(),
            params: request.params.clone(),
            submission_id: submission_id.to_string(),
            submitted,
            status: JobStatus::Pending,
            started: None,
            finished: None,
            return_code: None,
            error: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}
