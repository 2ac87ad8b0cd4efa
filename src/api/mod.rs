//! HTTP surface of the satellite.
//!
//! Every response body, errors included, is wrapped in an [`Envelope`] carrying the
//! satellite's identity. Errors put a machine-readable message under `data.error`.

use std::net::SocketAddr;
use std::ops::Range;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use crate::config::SatelliteConfig;
use crate::envelope::Envelope;
use crate::error::{Result, SatelliteError};
use crate::scheduler::{JobStatus, Scheduler, SubmissionRequest, SubmissionStatus};
use crate::worker::spec::{ScriptDirectory, SpecSource};

/// Largest log file served inline by `/job/{id}/log/{file}`
pub const MAX_INLINE_LOG: u64 = 100 * 1024;

#[derive(Clone)]
pub struct ApiState {
    pub scheduler: Arc<Scheduler>,
    pub scripts: Arc<ScriptDirectory>,
    pub config: Arc<SatelliteConfig>,
    pub started: DateTime<Utc>,
}

impl ApiState {
    pub fn new(
        scheduler: Arc<Scheduler>,
        scripts: Arc<ScriptDirectory>,
        config: Arc<SatelliteConfig>,
    ) -> Self {
        Self {
            scheduler,
            scripts,
            config,
            started: Utc::now(),
        }
    }

    fn respond<T: Serialize>(&self, status: StatusCode, data: T) -> Response {
        (status, Json(Envelope::wrap(&self.config.identity, data))).into_response()
    }

    fn ok<T: Serialize>(&self, data: T) -> Response {
        self.respond(StatusCode::OK, data)
    }

    fn fail(&self, err: SatelliteError) -> Response {
        let status = status_for(&err);
        if status.is_server_error() {
            tracing::error!(error = %err, "Request failed");
        } else {
            tracing::debug!(error = %err, status = %status, "Request rejected");
        }
        self.respond(status, json!({ "error": err.to_string() }))
    }

    fn reply<T: Serialize>(&self, result: Result<T>) -> Response {
        match result {
            Ok(data) => self.ok(data),
            Err(e) => self.fail(e),
        }
    }

    fn job_dir(&self, job_id: &str) -> PathBuf {
        self.config.scheduler.logs_dir.join(job_id)
    }
}

/// HTTP status for an error returned by a handler.
pub fn status_for(err: &SatelliteError) -> StatusCode {
    match err {
        SatelliteError::QueueFull
        | SatelliteError::NotCancelable(_)
        | SatelliteError::InvalidSpec { .. }
        | SatelliteError::InvalidSubmission(_)
        | SatelliteError::InvalidRequest(_)
        | SatelliteError::LogTooLarge => StatusCode::BAD_REQUEST,
        SatelliteError::JobNotFound(_)
        | SatelliteError::SubmissionNotFound(_)
        | SatelliteError::SpecNotFound(_)
        | SatelliteError::LogNotFound(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/info", get(info_handler))
        .route("/available_tests", get(available_handler))
        .route("/spec/:name", get(spec_handler))
        .route("/run", post(run_handler))
        .route("/jobs", get(jobs_handler))
        .route("/jobs/:status", get(jobs_with_status_handler))
        .route("/jobs/range/:min/:max", get(jobs_in_range_handler))
        .route("/submissions", get(submissions_handler))
        .route("/submissions/:status", get(submissions_with_status_handler))
        .route(
            "/submissions/range/:min/:max",
            get(submissions_in_range_handler),
        )
        .route("/job/:job_id", get(job_handler))
        .route("/job/:job_id/log/:file", get(job_log_handler))
        .route("/job/:job_id/lograw/:file", get(job_lograw_handler))
        .route("/submission/:submission_id", get(submission_handler))
        .route("/submission_jobs/:submission_id", get(submission_jobs_handler))
        .route("/cancel_job/:job_id", post(cancel_job_handler))
        .route(
            "/cancel_submission/:submission_id",
            post(cancel_submission_handler),
        )
        .layer(cors)
        .with_state(state)
}

/// Serve the API on `listener` until `shutdown` is cancelled.
pub async fn serve(
    listener: tokio::net::TcpListener,
    state: ApiState,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let addr: Option<SocketAddr> = listener.local_addr().ok();
    tracing::info!(addr = ?addr, "Starting HTTP server");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

fn format_uptime(secs: i64) -> String {
    let secs = secs.max(0);
    format!("{}:{:02}:{:02}", secs / 3600, (secs / 60) % 60, secs % 60)
}

fn disk_usage() -> Option<(u64, u64, u64)> {
    let stat = nix::sys::statvfs::statvfs("/").ok()?;
    let frag = stat.fragment_size() as u64;
    let total = stat.blocks() as u64 * frag;
    let free = stat.blocks_available() as u64 * frag;
    let used = (stat.blocks() as u64).saturating_sub(stat.blocks_free() as u64) * frag;
    Some((total, used, free))
}

async fn info_handler(State(state): State<ApiState>) -> Response {
    let (num_jobs, num_submissions) = {
        let store = state.scheduler.store().read().await;
        (store.job_count(), store.submission_count())
    };
    let (disk_total, disk_used, disk_free) = disk_usage().unwrap_or_default();
    let config = &state.config;
    state.ok(json!({
        "master": config.hub.base_url,
        "name": config.identity.name,
        "test_scripts": state.scripts.root().display().to_string(),
        "job_logs": config.scheduler.logs_dir.display().to_string(),
        "default_parallel": config.scheduler.default_parallel,
        "default_timeout": config.executor.default_timeout.as_secs_f64(),
        "retention_days": config.scheduler.retention.num_days(),
        "concurrent_submissions": config.scheduler.concurrent_submissions,
        "queue_size": config.scheduler.queue_size,
        "queued": state.scheduler.queued(),
        "advertise": config
            .hub
            .advertise_interval
            .map(|d| d.as_secs_f64() / 60.0)
            .unwrap_or(0.0),
        "satellite_port": config.identity.export_port,
        "num_jobs": num_jobs,
        "num_submissions": num_submissions,
        "uptime": format_uptime((Utc::now() - state.started).num_seconds()),
        "disk_total": disk_total,
        "disk_used": disk_used,
        "disk_free": disk_free,
    }))
}

async fn available_handler(State(state): State<ApiState>) -> Response {
    let scripts = state.scripts.clone();
    let result = tokio::task::spawn_blocking(move || scripts.available())
        .await
        .map_err(|e| SatelliteError::Internal(e.to_string()));
    state.reply(result)
}

async fn spec_handler(State(state): State<ApiState>, Path(name): Path<String>) -> Response {
    match state.scripts.load_spec(&name) {
        Ok(spec) => {
            let spec = state.scripts.resolve_dynamic_options(&name, spec).await;
            state.ok(spec)
        }
        Err(e) => state.fail(e),
    }
}

async fn run_handler(State(state): State<ApiState>, body: Bytes) -> Response {
    let payload: Value = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(e) => return state.fail(SatelliteError::InvalidSubmission(e.to_string())),
    };
    let request = match SubmissionRequest::from_value(payload.clone()) {
        Ok(request) => request,
        Err(e) => {
            return state.respond(
                StatusCode::BAD_REQUEST,
                json!({ "echo": payload, "error": e.to_string() }),
            )
        }
    };
    match state.scheduler.submit(request).await {
        Ok(submission) => state.ok(json!({
            "submission_id": submission.submission_id,
            "job_ids": submission.job_ids,
        })),
        Err(e) => state.fail(e),
    }
}

/// Python-style slice bounds: negative indices count from the end, and both ends are
/// clamped to the list.
fn slice_range(len: usize, min: &str, max: &str) -> Result<Range<usize>> {
    let parse = |raw: &str| -> Result<usize> {
        let index: i64 = raw
            .parse()
            .map_err(|_| SatelliteError::InvalidRequest(format!("bad index {raw:?}")))?;
        Ok(if index < 0 {
            (len as i64 + index).max(0) as usize
        } else {
            (index as usize).min(len)
        })
    };
    let start = parse(min)?;
    let end = parse(max)?;
    Ok(start..end.max(start))
}

async fn jobs_handler(State(state): State<ApiState>) -> Response {
    let store = state.scheduler.store().read().await;
    state.ok(store.jobs_newest_first())
}

async fn jobs_with_status_handler(
    State(state): State<ApiState>,
    Path(status): Path<String>,
) -> Response {
    let wanted = JobStatus::parse(&status);
    let store = state.scheduler.store().read().await;
    let jobs: Vec<_> = store
        .jobs_newest_first()
        .into_iter()
        .filter(|j| Some(j.status) == wanted)
        .collect();
    state.ok(jobs)
}

async fn jobs_in_range_handler(
    State(state): State<ApiState>,
    Path((min, max)): Path<(String, String)>,
) -> Response {
    let store = state.scheduler.store().read().await;
    let jobs = store.jobs_newest_first();
    match slice_range(jobs.len(), &min, &max) {
        Ok(range) => state.ok(json!({
            "total": store.job_count(),
            "slice": &jobs[range],
        })),
        Err(e) => state.fail(e),
    }
}

async fn submissions_handler(State(state): State<ApiState>) -> Response {
    let store = state.scheduler.store().read().await;
    state.ok(store.submissions_newest_first())
}

async fn submissions_with_status_handler(
    State(state): State<ApiState>,
    Path(status): Path<String>,
) -> Response {
    let wanted = SubmissionStatus::parse(&status);
    let store = state.scheduler.store().read().await;
    let subs: Vec<_> = store
        .submissions_newest_first()
        .into_iter()
        .filter(|s| Some(s.status) == wanted)
        .collect();
    state.ok(subs)
}

async fn submissions_in_range_handler(
    State(state): State<ApiState>,
    Path((min, max)): Path<(String, String)>,
) -> Response {
    let store = state.scheduler.store().read().await;
    let subs = store.submissions_newest_first();
    match slice_range(subs.len(), &min, &max) {
        Ok(range) => state.ok(json!({
            "total": store.submission_count(),
            "slice": &subs[range],
        })),
        Err(e) => state.fail(e),
    }
}

async fn job_handler(State(state): State<ApiState>, Path(job_id): Path<String>) -> Response {
    let job = {
        let store = state.scheduler.store().read().await;
        match store.job(&job_id) {
            Some(job) => job.clone(),
            None => return state.fail(SatelliteError::JobNotFound(job_id)),
        }
    };
    let mut record = match serde_json::to_value(&job) {
        Ok(record) => record,
        Err(e) => return state.fail(e.into()),
    };

    if let Ok(mut entries) = tokio::fs::read_dir(state.job_dir(&job_id)).await {
        let mut logs = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            logs.push(entry.file_name().to_string_lossy().into_owned());
        }
        logs.sort();
        record["logs"] = json!(logs);
    }
    state.ok(record)
}

/// Resolve a log file inside a known job's directory.
async fn log_path(state: &ApiState, job_id: &str, file: &str) -> Result<PathBuf> {
    if state.scheduler.store().read().await.job(job_id).is_none() {
        return Err(SatelliteError::JobNotFound(job_id.to_string()));
    }
    if file.is_empty() || file.contains(['/', '\\']) || file == "." || file == ".." {
        return Err(SatelliteError::LogNotFound(file.to_string()));
    }
    Ok(state.job_dir(job_id).join(file))
}

fn not_found_as_log(file: &str, e: std::io::Error) -> SatelliteError {
    if e.kind() == std::io::ErrorKind::NotFound {
        SatelliteError::LogNotFound(file.to_string())
    } else {
        SatelliteError::Io(e)
    }
}

async fn read_log(state: &ApiState, job_id: &str, file: &str) -> Result<String> {
    let path = log_path(state, job_id, file).await?;
    let meta = tokio::fs::metadata(&path)
        .await
        .map_err(|e| not_found_as_log(file, e))?;
    if meta.len() > MAX_INLINE_LOG {
        return Err(SatelliteError::LogTooLarge);
    }
    let bytes = tokio::fs::read(&path)
        .await
        .map_err(|e| not_found_as_log(file, e))?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

async fn job_log_handler(
    State(state): State<ApiState>,
    Path((job_id, file)): Path<(String, String)>,
) -> Response {
    let result = read_log(&state, &job_id, &file).await;
    state.reply(result)
}

async fn read_lograw(state: &ApiState, job_id: &str, file: &str) -> Result<Vec<u8>> {
    let path = log_path(state, job_id, file).await?;
    tokio::fs::read(&path)
        .await
        .map_err(|e| not_found_as_log(file, e))
}

async fn job_lograw_handler(
    State(state): State<ApiState>,
    Path((job_id, file)): Path<(String, String)>,
) -> Response {
    match read_lograw(&state, &job_id, &file).await {
        Ok(bytes) => (
            [
                (header::CONTENT_TYPE, "application/octet-stream".to_string()),
                (
                    header::CONTENT_DISPOSITION,
                    format!("filename=\"{job_id}.{file}\""),
                ),
            ],
            bytes,
        )
            .into_response(),
        Err(e) => state.fail(e),
    }
}

async fn submission_handler(
    State(state): State<ApiState>,
    Path(submission_id): Path<String>,
) -> Response {
    let store = state.scheduler.store().read().await;
    match store.submission(&submission_id) {
        Some(sub) => state.ok(sub),
        None => state.fail(SatelliteError::SubmissionNotFound(submission_id)),
    }
}

async fn submission_jobs_handler(
    State(state): State<ApiState>,
    Path(submission_id): Path<String>,
) -> Response {
    let store = state.scheduler.store().read().await;
    match store.submission_jobs(&submission_id) {
        Some(jobs) => state.ok(jobs),
        None => state.fail(SatelliteError::SubmissionNotFound(submission_id)),
    }
}

async fn cancel_job_handler(State(state): State<ApiState>, Path(job_id): Path<String>) -> Response {
    let result = state.scheduler.cancel_job(&job_id).await.map(|()| json!({}));
    state.reply(result)
}

async fn cancel_submission_handler(
    State(state): State<ApiState>,
    Path(submission_id): Path<String>,
) -> Response {
    let result = state
        .scheduler
        .cancel_submission(&submission_id)
        .await
        .map(|()| json!({}));
    state.reply(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slice_range_clamps_like_python() {
        assert_eq!(slice_range(10, "0", "3").unwrap(), 0..3);
        assert_eq!(slice_range(10, "5", "50").unwrap(), 5..10);
        assert_eq!(slice_range(10, "-2", "10").unwrap(), 8..10);
        assert_eq!(slice_range(10, "7", "2").unwrap(), 7..7);
        assert_eq!(slice_range(0, "0", "20").unwrap(), 0..0);
        assert!(matches!(
            slice_range(10, "a", "2"),
            Err(SatelliteError::InvalidRequest(_))
        ));
    }

    #[test]
    fn uptime_is_hours_minutes_seconds() {
        assert_eq!(format_uptime(0), "0:00:00");
        assert_eq!(format_uptime(3 * 3600 + 62), "3:01:02");
    }

    #[test]
    fn errors_map_to_status_codes() {
        assert_eq!(status_for(&SatelliteError::QueueFull), StatusCode::BAD_REQUEST);
        assert_eq!(
            status_for(&SatelliteError::NotCancelable("job x".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for(&SatelliteError::JobNotFound("x".into())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_for(&SatelliteError::Internal("x".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
