use std::path::Path;

use chrono::{DateTime, Duration, Utc};

use crate::scheduler::store::{SharedStore, StateStore};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct VacuumReport {
    pub submissions_removed: usize,
    pub jobs_removed: usize,
}

/// Terminal records removed from the store whose log directories still exist on disk.
#[derive(Debug, Default)]
pub struct Expired {
    pub submissions_removed: usize,
    pub job_ids: Vec<String>,
}

/// Drop terminal jobs and submissions created at or before `now - retention`.
/// Pending and running records are never purged. A window reaching past the earliest
/// representable time expires nothing.
pub fn expire(store: &mut StateStore, retention: Duration, now: DateTime<Utc>) -> Expired {
    let Some(earliest) = now.checked_sub_signed(retention) else {
        return Expired::default();
    };
    let (submissions_removed, job_ids) = store.purge(
        |s| s.is_terminal() && s.submitted <= earliest,
        |j| j.is_terminal() && j.submitted <= earliest,
    );
    Expired {
        submissions_removed,
        job_ids,
    }
}

/// Delete the log directory of every listed job.
pub async fn remove_job_logs(logs_dir: &Path, job_ids: &[String]) {
    for job_id in job_ids {
        if let Err(e) = tokio::fs::remove_dir_all(logs_dir.join(job_id)).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(job_id = %job_id, error = %e, "Failed to remove job logs");
            }
        }
    }
}

/// Purge expired records, then delete their logs once the store lock is released.
pub async fn vacuum(
    store: &SharedStore,
    retention: Duration,
    logs_dir: &Path,
    now: DateTime<Utc>,
) -> VacuumReport {
    let expired = expire(&mut *store.write().await, retention, now);
    remove_job_logs(logs_dir, &expired.job_ids).await;

    let report = VacuumReport {
        submissions_removed: expired.submissions_removed,
        jobs_removed: expired.job_ids.len(),
    };
    if report != VacuumReport::default() {
        tracing::info!(
            submissions = report.submissions_removed,
            jobs = report.jobs_removed,
            "Vacuumed expired records"
        );
    }
    report
}
