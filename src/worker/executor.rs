use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

use crate::config::ExecutorConfig;
use crate::hub::HubClient;
use crate::scheduler::job::{Job, JobStatus};
use crate::scheduler::store::SharedStore;
use crate::worker::spec::{Spec, SpecSource, Upload};

/// Final state of one job run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobOutcome {
    pub status: JobStatus,
    pub return_code: Option<i32>,
}

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("results file {0} not found")]
    Missing(PathBuf),
    #[error("results file {path} is not supported: {reason}")]
    Unsupported { path: PathBuf, reason: String },
    #[error("failed to read results file: {0}")]
    Io(#[from] std::io::Error),
}

/// Read a job's results artifact. Only JSON documents can be uploaded.
pub fn read_results_artifact(path: &Path) -> Result<Value, ArtifactError> {
    if path.extension().is_some_and(|ext| ext == "csv") {
        return Err(ArtifactError::Unsupported {
            path: path.to_path_buf(),
            reason: "csv uploads are not implemented".to_string(),
        });
    }
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ArtifactError::Missing(path.to_path_buf()))
        }
        Err(e) => return Err(e.into()),
    };
    serde_json::from_str(&text).map_err(|e| ArtifactError::Unsupported {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

fn param_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// `--key=value` flags for the script's entry point.
pub fn cli_args(params: &Map<String, Value>) -> Vec<String> {
    params
        .iter()
        .map(|(k, v)| format!("--{}={}", k, param_value(v)))
        .collect()
}

/// Upper bound on any job's wait, however large the configured timeout.
pub const MAX_JOB_TIMEOUT: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Wait bound for a job: the spec's timeout in seconds when it is a usable number,
/// otherwise `default`, capped at [`MAX_JOB_TIMEOUT`].
pub fn job_timeout(spec_timeout: Option<f64>, default: Duration) -> Duration {
    let timeout = match spec_timeout {
        Some(secs) if secs.is_finite() && secs >= 0.0 => {
            Duration::try_from_secs_f64(secs).unwrap_or(MAX_JOB_TIMEOUT)
        }
        _ => default,
    };
    timeout.min(MAX_JOB_TIMEOUT)
}

enum Exit {
    Exited(Option<i32>),
    WaitFailed(std::io::Error),
    TimedOut,
    Cancelled,
}

/// Runs jobs as external processes.
///
/// Each job launches `<scripts>/<name>/run` in its own process group with the job's
/// parameters as flags and environment variables. The wait is bounded by the spec's
/// timeout and can be interrupted through the job's cancellation token.
pub struct ProcessExecutor {
    config: ExecutorConfig,
    specs: Arc<dyn SpecSource>,
    store: SharedStore,
    hub: HubClient,
}

impl ProcessExecutor {
    pub fn new(
        config: ExecutorConfig,
        specs: Arc<dyn SpecSource>,
        store: SharedStore,
        hub: HubClient,
    ) -> Self {
        Self {
            config,
            specs,
            store,
            hub,
        }
    }

    pub fn job_dir(&self, job_id: &str) -> PathBuf {
        self.config.logs_dir.join(job_id)
    }

    fn job_env(&self, job: &Job) -> Vec<(String, String)> {
        let logs_dir = match std::env::current_dir() {
            Ok(cwd) if self.config.logs_dir.is_relative() => cwd.join(&self.config.logs_dir),
            _ => self.config.logs_dir.clone(),
        };
        let mut env = vec![
            ("JOB_ID".to_string(), job.job_id.clone()),
            ("SUBMISSION_ID".to_string(), job.submission_id.clone()),
            (
                "TEST_SCRIPTS_DIRECTORY".to_string(),
                self.specs.root().display().to_string(),
            ),
            (
                "JOB_LOGS_DIRECTORY".to_string(),
                logs_dir.display().to_string(),
            ),
            ("HUB_BASE_URL".to_string(), self.config.hub_url.clone()),
            (
                "LOGDIR".to_string(),
                logs_dir.join(&job.job_id).display().to_string(),
            ),
        ];
        env.extend(
            job.params
                .iter()
                .map(|(k, v)| (format!("arg_{k}"), param_value(v))),
        );
        env
    }

    fn log_outputs(&self, spec: &Spec, log_dir: &Path) -> std::io::Result<(Stdio, Stdio)> {
        if spec.no_logs {
            return Ok((Stdio::null(), Stdio::null()));
        }
        let stdout = File::create(log_dir.join("stdout.log"))?;
        let stderr = File::create(log_dir.join("stderr.log"))?;
        Ok((stdout.into(), stderr.into()))
    }

    /// Run a job to completion.
    ///
    /// Returns `None` without doing anything if the job is no longer pending. A
    /// cancelled job keeps whatever status the canceller gave it.
    pub async fn run(&self, job_id: &str, cancel: CancellationToken) -> Option<JobOutcome> {
        let job = {
            let store = self.store.read().await;
            match store.job(job_id) {
                Some(job) if job.status == JobStatus::Pending => job.clone(),
                _ => return None,
            }
        };
        tracing::info!(job_id, name = %job.name, "Job started");

        let spec = match self.specs.load_spec(&job.name) {
            Ok(spec) => spec,
            Err(e) => return Some(self.fail(job_id, e.to_string()).await),
        };

        let log_dir = self.job_dir(job_id);
        if let Err(e) = std::fs::create_dir_all(&log_dir) {
            return Some(self.fail(job_id, format!("create log directory: {e}")).await);
        }
        let workdir = spec
            .working_directory
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| log_dir.clone());
        let (stdout, stderr) = match self.log_outputs(&spec, &log_dir) {
            Ok(outputs) => outputs,
            Err(e) => return Some(self.fail(job_id, format!("open job logs: {e}")).await),
        };

        let timeout = job_timeout(spec.timeout, self.config.default_timeout);
        let mut child = match Command::new(self.specs.entry_point(&job.name))
            .args(cli_args(&job.params))
            .envs(self.job_env(&job))
            .current_dir(&workdir)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => return Some(self.fail(job_id, format!("spawn: {e}")).await),
        };

        if !self
            .store
            .write()
            .await
            .start_job(job_id, cancel.clone(), Utc::now())
        {
            // Canceled between the pending check and the spawn.
            terminate(&mut child, self.config.kill_grace).await;
            return None;
        }

        let exit = tokio::select! {
            result = child.wait() => match result {
                Ok(status) => Exit::Exited(status.code()),
                Err(e) => Exit::WaitFailed(e),
            },
            _ = tokio::time::sleep(timeout) => Exit::TimedOut,
            _ = cancel.cancelled() => Exit::Cancelled,
        };

        match exit {
            Exit::Exited(code) => self.store.write().await.complete_job(job_id, code, Utc::now()),
            Exit::WaitFailed(e) => {
                terminate(&mut child, self.config.kill_grace).await;
                self.store
                    .write()
                    .await
                    .fail_job(job_id, format!("wait: {e}"), Utc::now());
            }
            Exit::TimedOut => {
                tracing::warn!(job_id, timeout_secs = timeout.as_secs_f64(), "Job timed out");
                terminate(&mut child, self.config.kill_grace).await;
                self.store.write().await.time_out_job(job_id, Utc::now());
            }
            Exit::Cancelled => {
                terminate(&mut child, self.config.kill_grace).await;
                self.store.write().await.release_job(job_id, Utc::now());
            }
        }

        let outcome = {
            let store = self.store.read().await;
            let finished = store.job(job_id)?;
            JobOutcome {
                status: finished.status,
                return_code: finished.return_code,
            }
        };
        tracing::info!(
            job_id,
            name = %job.name,
            status = %outcome.status,
            return_code = ?outcome.return_code,
            "Job finished"
        );

        // Failed jobs keep their artifacts but never pollute test results.
        if outcome.status == JobStatus::Done {
            self.upload_results(job_id, &spec.uploads, &workdir);
        }
        Some(outcome)
    }

    async fn fail(&self, job_id: &str, error: String) -> JobOutcome {
        tracing::warn!(job_id, error = %error, "Job could not be started");
        let mut store = self.store.write().await;
        store.fail_job(job_id, error, Utc::now());
        JobOutcome {
            status: store
                .job(job_id)
                .map(|j| j.status)
                .unwrap_or(JobStatus::Error),
            return_code: None,
        }
    }

    /// Dispatch each declared results file to the hub on a detached task.
    fn upload_results(&self, job_id: &str, uploads: &[Upload], workdir: &Path) {
        for upload in uploads {
            let path = workdir.join(&upload.results_file);
            match read_results_artifact(&path) {
                Ok(data) => {
                    tracing::info!(
                        job_id,
                        test_system = %upload.test_system,
                        test_name = %upload.test_name,
                        "Uploading test results"
                    );
                    let hub = self.hub.clone();
                    let upload = upload.clone();
                    tokio::spawn(async move {
                        hub.push_results(&upload.test_system, &upload.test_name, &data)
                            .await;
                    });
                }
                Err(ArtifactError::Missing(path)) => {
                    tracing::warn!(job_id, file = %path.display(), "Ignoring upload, file not found");
                }
                Err(e) => {
                    tracing::warn!(job_id, error = %e, "Ignoring upload");
                }
            }
        }
    }
}

/// SIGTERM the child's process group, then SIGKILL it if it outlives `grace`.
async fn terminate(child: &mut Child, grace: Duration) {
    use nix::errno::Errno;
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        return;
    };
    let pgid = Pid::from_raw(-(pid as i32));

    if let Err(e) = signal::kill(pgid, Signal::SIGTERM) {
        if e != Errno::ESRCH {
            tracing::warn!(pid, error = ?e, "SIGTERM to process group failed");
        }
    }
    if tokio::time::timeout(grace, child.wait()).await.is_ok() {
        return;
    }
    if let Err(e) = signal::kill(pgid, Signal::SIGKILL) {
        if e != Errno::ESRCH {
            tracing::warn!(pid, error = ?e, "SIGKILL to process group failed");
        }
    }
    let _ = child.wait().await;
}
