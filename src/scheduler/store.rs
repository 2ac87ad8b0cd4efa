use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, SatelliteError};
use crate::scheduler::job::{Job, JobStatus};
use crate::scheduler::submission::{PendingSubmission, Submission, SubmissionStatus};

pub type SharedStore = Arc<RwLock<StateStore>>;

/// Durable view of the store, as written at shutdown and read back at startup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Snapshot {
    pub jobs: Vec<Job>,
    pub submissions: Vec<Submission>,
    pub pending: Vec<PendingSubmission>,
}

/// In-memory tables of jobs and submissions.
///
/// Jobs stay addressable by id after their submission leaves the queue, until the
/// retention collector or a shutdown snapshot removes them. Each running job also has a
/// cancellation token registered here so a cancel request can reach its process.
#[derive(Debug, Default)]
pub struct StateStore {
    jobs: HashMap<String, Job>,
    submissions: HashMap<String, Submission>,
    running: HashMap<String, CancellationToken>,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared(self) -> SharedStore {
        Arc::new(RwLock::new(self))
    }

    /// Insert a submission together with the jobs it owns. Records already stored under
    /// the same ids are replaced, which is how a resumed submission resets jobs that had
    /// finished before the restart.
    pub fn insert_submission(&mut self, submission: Submission, jobs: Vec<Job>) {
        for job in jobs {
            self.jobs.insert(job.job_id.clone(), job);
        }
        self.submissions
            .insert(submission.submission_id.clone(), submission);
    }

    pub fn job(&self, id: &str) -> Option<&Job> {
        self.jobs.get(id)
    }

    pub fn submission(&self, id: &str) -> Option<&Submission> {
        self.submissions.get(id)
    }

    pub fn submission_mut(&mut self, id: &str) -> Option<&mut Submission> {
        self.submissions.get_mut(id)
    }

    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }

    pub fn submission_count(&self) -> usize {
        self.submissions.len()
    }

    /// All jobs, most recently submitted first
    pub fn jobs_newest_first(&self) -> Vec<&Job> {
        let mut jobs: Vec<&Job> = self.jobs.values().collect();
        jobs.sort_by(|a, b| b.submitted.cmp(&a.submitted));
        jobs
    }

    /// All submissions, most recently submitted first
    pub fn submissions_newest_first(&self) -> Vec<&Submission> {
        let mut subs: Vec<&Submission> = self.submissions.values().collect();
        subs.sort_by(|a, b| b.submitted.cmp(&a.submitted));
        subs
    }

    /// Jobs of a submission in submission order. Ids that were purged are skipped.
    pub fn submission_jobs(&self, submission_id: &str) -> Option<Vec<&Job>> {
        let sub = self.submissions.get(submission_id)?;
        Some(
            sub.job_ids
                .iter()
                .filter_map(|id| self.jobs.get(id))
                .collect(),
        )
    }

    pub fn running_jobs(&self) -> usize {
        self.jobs
            .values()
            .filter(|j| j.status == JobStatus::Running)
            .count()
    }

    /// Transition a pending job to running and register its cancellation token.
    /// Returns false if the job was canceled or removed in the meantime.
    pub fn start_job(&mut self, id: &str, token: CancellationToken, now: DateTime<Utc>) -> bool {
        match self.jobs.get_mut(id) {
            Some(job) if job.status == JobStatus::Pending => {
                job.status = JobStatus::Running;
                job.started = Some(now);
                self.running.insert(id.to_string(), token);
                true
            }
            _ => false,
        }
    }

    /// Record a process exit. The status only changes if the job is still running, so a
    /// concurrent cancellation keeps its INTERRUPTED status.
    pub fn complete_job(&mut self, id: &str, return_code: Option<i32>, now: DateTime<Utc>) {
        self.running.remove(id);
        if let Some(job) = self.jobs.get_mut(id) {
            if job.status == JobStatus::Running {
                job.status = if return_code == Some(0) {
                    JobStatus::Done
                } else {
                    JobStatus::Error
                };
            }
            job.return_code = return_code;
            job.finished = Some(now);
        }
    }

    pub fn time_out_job(&mut self, id: &str, now: DateTime<Utc>) {
        self.running.remove(id);
        if let Some(job) = self.jobs.get_mut(id) {
            if job.status == JobStatus::Running {
                job.status = JobStatus::Timeout;
            }
            job.finished = Some(now);
        }
    }

    /// Mark a job that could not be launched as failed.
    pub fn fail_job(&mut self, id: &str, error: String, now: DateTime<Utc>) {
        self.running.remove(id);
        if let Some(job) = self.jobs.get_mut(id) {
            if !job.status.is_terminal() {
                job.status = JobStatus::Error;
            }
            job.error = Some(error);
            job.finished = Some(now);
        }
    }

    /// Drop the running registration after a cancelled wait, leaving the status to
    /// whoever cancelled it.
    pub fn release_job(&mut self, id: &str, now: DateTime<Utc>) {
        self.running.remove(id);
        if let Some(job) = self.jobs.get_mut(id) {
            job.finished = Some(now);
        }
    }

    /// Fail every job of a submission that is still pending or running, so a submission
    /// that ended in ERROR leaves no live jobs behind. Returns how many were changed.
    pub fn fail_unfinished_jobs(&mut self, submission_id: &str, error: &str, now: DateTime<Utc>) -> usize {
        let Some(sub) = self.submissions.get(submission_id) else {
            return 0;
        };
        let mut failed = 0;
        for job_id in &sub.job_ids {
            let Some(job) = self.jobs.get_mut(job_id) else {
                continue;
            };
            if job.is_terminal() {
                continue;
            }
            if let Some(token) = self.running.remove(job_id) {
                token.cancel();
            }
            job.status = JobStatus::Error;
            job.error = Some(error.to_string());
            job.finished = Some(now);
            failed += 1;
        }
        failed
    }

    /// PENDING becomes CANCELED, RUNNING becomes INTERRUPTED and its process is asked
    /// to terminate.
    pub fn cancel_job(&mut self, id: &str) -> Result<()> {
        let job = self
            .jobs
            .get_mut(id)
            .ok_or_else(|| SatelliteError::JobNotFound(id.to_string()))?;
        match job.status {
            JobStatus::Pending => {
                job.status = JobStatus::Canceled;
                Ok(())
            }
            JobStatus::Running => {
                job.status = JobStatus::Interrupted;
                if let Some(token) = self.running.get(id) {
                    token.cancel();
                }
                Ok(())
            }
            _ => Err(SatelliteError::NotCancelable(format!("job {id}"))),
        }
    }

    pub fn cancel_submission(&mut self, id: &str) -> Result<()> {
        let sub = self
            .submissions
            .get_mut(id)
            .ok_or_else(|| SatelliteError::SubmissionNotFound(id.to_string()))?;
        sub.status = match sub.status {
            SubmissionStatus::Pending => SubmissionStatus::Canceled,
            SubmissionStatus::Running => SubmissionStatus::Interrupted,
            _ => return Err(SatelliteError::NotCancelable(format!("submission {id}"))),
        };
        let job_ids = sub.job_ids.clone();
        for job_id in job_ids {
            // Jobs that already finished are simply left alone.
            let _ = self.cancel_job(&job_id);
        }
        Ok(())
    }

    /// Remove every record matching `purge` and return the removed job ids.
    pub(crate) fn purge(
        &mut self,
        purge_submission: impl Fn(&Submission) -> bool,
        purge_job: impl Fn(&Job) -> bool,
    ) -> (usize, Vec<String>) {
        let before = self.submissions.len();
        self.submissions.retain(|_, s| !purge_submission(s));
        let removed_subs = before - self.submissions.len();

        let removed_jobs: Vec<String> = self
            .jobs
            .values()
            .filter(|j| purge_job(j))
            .map(|j| j.job_id.clone())
            .collect();
        for id in &removed_jobs {
            self.jobs.remove(id);
        }
        (removed_subs, removed_jobs)
    }

    /// Move live work out of the tables into a resumable snapshot.
    ///
    /// Pending and running jobs are dropped along with their log directories, and
    /// pending or running submissions become [`PendingSubmission`] entries. Terminal
    /// records are copied as they are.
    pub fn snapshot(&mut self, logs_dir: &Path) -> Snapshot {
        self.running.clear();
        let pending: Vec<PendingSubmission> = {
            let mut live: Vec<&Submission> = self
                .submissions
                .values()
                .filter(|s| !s.is_terminal())
                .collect();
            live.sort_by_key(|s| s.submitted);
            live.into_iter().map(Submission::to_pending).collect()
        };

        let (_, dropped) = self.purge(|s| !s.is_terminal(), |j| !j.is_terminal());
        for job_id in dropped {
            let _ = std::fs::remove_dir_all(logs_dir.join(job_id));
        }

        Snapshot {
            jobs: self.jobs.values().cloned().collect(),
            submissions: self.submissions.values().cloned().collect(),
            pending,
        }
    }

    /// Load a snapshot's terminal records. Returns the submissions to enqueue again.
    pub fn restore(&mut self, snapshot: Snapshot) -> Vec<PendingSubmission> {
        for job in snapshot.jobs {
            self.jobs.insert(job.job_id.clone(), job);
        }
        for sub in snapshot.submissions {
            self.submissions.insert(sub.submission_id.clone(), sub);
        }
        snapshot.pending
    }
}
