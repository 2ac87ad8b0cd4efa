use std::collections::VecDeque;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::config::SchedulerConfig;
use crate::error::{Result, SatelliteError};
use crate::scheduler::job::{make_id, Job};
use crate::scheduler::retention::{self, VacuumReport};
use crate::scheduler::store::{SharedStore, Snapshot};
use crate::scheduler::submission::{
    PendingSubmission, Submission, SubmissionRequest, SubmissionStatus,
};
use crate::worker::ProcessExecutor;

/// Owns the bounded submission queue and the consumers that drain it.
///
/// The queue carries submission ids only; the records themselves live in the shared
/// store so they can be inspected and cancelled while waiting. A submission is started
/// by at most one consumer, and its jobs are spread over `worker_count()` workers that
/// pull from a common cursor.
pub struct Scheduler {
    config: SchedulerConfig,
    store: SharedStore,
    executor: Arc<ProcessExecutor>,
    tx: mpsc::Sender<String>,
    rx: Mutex<mpsc::Receiver<String>>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig, store: SharedStore, executor: Arc<ProcessExecutor>) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_size.max(1));
        Self {
            config,
            store,
            executor,
            tx,
            rx: Mutex::new(rx),
        }
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Submissions waiting in the queue
    pub fn queued(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    /// Create one job per request and queue the submission.
    ///
    /// Fails with [`SatelliteError::QueueFull`] before touching the store when the queue
    /// has no room. A successful submit also runs the retention collector.
    pub async fn submit(&self, request: SubmissionRequest) -> Result<Submission> {
        let permit = self
            .tx
            .try_reserve()
            .map_err(|_| SatelliteError::QueueFull)?;

        let now = Utc::now();
        let submission_id = make_id();
        let jobs: Vec<Job> = request
            .job_specs
            .iter()
            .map(|r| Job::new(&submission_id, r, now))
            .collect();
        let submission = Submission {
            submission_id: submission_id.clone(),
            parallel: request.parallel_or(self.config.default_parallel),
            submitted: now,
            status: SubmissionStatus::Pending,
            note: request.note.clone().unwrap_or_default(),
            num_jobs: jobs.len(),
            job_ids: jobs.iter().map(|j| j.job_id.clone()).collect(),
            error: None,
            requests: request.job_specs,
        };

        self.store
            .write()
            .await
            .insert_submission(submission.clone(), jobs);
        permit.send(submission_id.clone());
        retention::vacuum(
            &self.store,
            self.config.retention,
            &self.config.logs_dir,
            now,
        )
        .await;

        tracing::info!(
            submission_id = %submission_id,
            jobs = submission.num_jobs,
            parallel = submission.parallel,
            "Submission queued"
        );
        Ok(submission)
    }

    /// Queue a persisted submission again with its original ids and timestamp.
    /// Every job starts over as PENDING.
    pub async fn resume(&self, pending: PendingSubmission) -> Result<()> {
        if pending.job_ids.len() != pending.job_specs.len() {
            return Err(SatelliteError::InvalidSubmission(format!(
                "submission {} has {} job ids for {} job specs",
                pending.submission_id,
                pending.job_ids.len(),
                pending.job_specs.len()
            )));
        }
        let permit = self
            .tx
            .try_reserve()
            .map_err(|_| SatelliteError::QueueFull)?;

        let jobs: Vec<Job> = pending
            .job_ids
            .iter()
            .zip(&pending.job_specs)
            .map(|(id, req)| Job::with_id(id.clone(), &pending.submission_id, req, pending.submitted))
            .collect();
        let submission = Submission {
            submission_id: pending.submission_id.clone(),
            parallel: pending.parallel,
            submitted: pending.submitted,
            status: SubmissionStatus::Pending,
            note: pending.note,
            num_jobs: jobs.len(),
            job_ids: pending.job_ids,
            error: None,
            requests: pending.job_specs,
        };
        self.store.write().await.insert_submission(submission, jobs);
        permit.send(pending.submission_id.clone());

        tracing::info!(submission_id = %pending.submission_id, "Submission resumed");
        Ok(())
    }

    /// Load terminal records from a snapshot and queue its unfinished submissions.
    /// Submissions that no longer fit in the queue are dropped. Returns how many were
    /// queued.
    pub async fn restore(&self, snapshot: Snapshot) -> usize {
        let pending = self.store.write().await.restore(snapshot);
        let mut resumed = 0;
        for submission in pending {
            let id = submission.submission_id.clone();
            match self.resume(submission).await {
                Ok(()) => resumed += 1,
                Err(SatelliteError::QueueFull) => {
                    tracing::warn!(submission_id = %id, "Queue full, dropping restored submission");
                }
                Err(e) => {
                    tracing::warn!(submission_id = %id, error = %e, "Dropping restored submission");
                }
            }
        }
        resumed
    }

    /// Remove live work from the store and return the resumable snapshot.
    pub async fn snapshot(&self) -> Snapshot {
        self.store.write().await.snapshot(&self.config.logs_dir)
    }

    pub async fn vacuum(&self) -> VacuumReport {
        retention::vacuum(
            &self.store,
            self.config.retention,
            &self.config.logs_dir,
            Utc::now(),
        )
        .await
    }

    pub async fn cancel_submission(&self, id: &str) -> Result<()> {
        self.store.write().await.cancel_submission(id)?;
        tracing::info!(submission_id = %id, "Submission canceled");
        Ok(())
    }

    /// Cancel a submission, reporting only whether anything changed.
    pub async fn cancel(&self, id: &str) -> bool {
        self.cancel_submission(id).await.is_ok()
    }

    pub async fn cancel_job(&self, id: &str) -> Result<()> {
        self.store.write().await.cancel_job(id)?;
        tracing::info!(job_id = %id, "Job canceled");
        Ok(())
    }

    /// Start `concurrent_submissions` consumer tasks. They exit once `shutdown` fires,
    /// leaving unfinished submissions in a non-terminal state for the snapshot.
    pub fn spawn_consumers(self: &Arc<Self>, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        (0..self.config.concurrent_submissions.max(1))
            .map(|slot| {
                let scheduler = self.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move { scheduler.consume(slot, shutdown).await })
            })
            .collect()
    }

    async fn consume(&self, slot: usize, shutdown: CancellationToken) {
        tracing::debug!(slot, "Submission consumer started");
        loop {
            let next = tokio::select! {
                _ = shutdown.cancelled() => break,
                id = async { self.rx.lock().await.recv().await } => id,
            };
            let Some(submission_id) = next else {
                break;
            };
            tracing::debug!(slot, submission_id = %submission_id, "Dequeued submission");
            self.run_submission(&submission_id, &shutdown).await;
            if shutdown.is_cancelled() {
                break;
            }
        }
        tracing::debug!(slot, "Submission consumer stopped");
    }

    async fn run_submission(&self, submission_id: &str, shutdown: &CancellationToken) {
        let (job_ids, workers) = {
            let mut store = self.store.write().await;
            let Some(sub) = store.submission_mut(submission_id) else {
                tracing::debug!(submission_id, "Submission vanished before it started");
                return;
            };
            if sub.status != SubmissionStatus::Pending {
                tracing::debug!(submission_id, status = %sub.status, "Skipping submission");
                return;
            }
            sub.status = SubmissionStatus::Running;
            (sub.job_ids.clone(), sub.worker_count())
        };
        tracing::info!(submission_id, workers, "Submission started");

        let cursor = Arc::new(Mutex::new(VecDeque::from(job_ids)));
        let mut tasks = JoinSet::new();
        for _ in 0..workers {
            let cursor = cursor.clone();
            let executor = self.executor.clone();
            let shutdown = shutdown.clone();
            tasks.spawn(async move {
                while !shutdown.is_cancelled() {
                    let Some(job_id) = cursor.lock().await.pop_front() else {
                        break;
                    };
                    executor.run(&job_id, shutdown.child_token()).await;
                }
            });
        }

        let mut failure: Option<String> = None;
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                failure.get_or_insert_with(|| e.to_string());
            }
        }

        let mut store = self.store.write().await;
        let Some(sub) = store.submission_mut(submission_id) else {
            return;
        };
        match failure {
            Some(error) => {
                tracing::error!(submission_id, error = %error, "Submission failed");
                sub.status = SubmissionStatus::Error;
                sub.error = Some(error.clone());
                let failed = store.fail_unfinished_jobs(submission_id, &error, Utc::now());
                if failed > 0 {
                    tracing::warn!(submission_id, jobs = failed, "Marked unfinished jobs as failed");
                }
            }
            // Shutdown leaves the submission RUNNING so it is captured for resumption.
            None if sub.status == SubmissionStatus::Running && !shutdown.is_cancelled() => {
                sub.status = SubmissionStatus::Done;
                tracing::info!(submission_id, "Submission finished");
            }
            None => {
                tracing::info!(submission_id, status = %sub.status, "Submission stopped");
            }
        }
    }
}
