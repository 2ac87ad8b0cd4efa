pub mod dispatcher;
pub mod job;
pub mod retention;
pub mod store;
pub mod submission;

pub use dispatcher::Scheduler;
pub use job::{Job, JobRequest, JobStatus};
pub use store::{SharedStore, Snapshot, StateStore};
pub use submission::{PendingSubmission, Submission, SubmissionRequest, SubmissionStatus};
