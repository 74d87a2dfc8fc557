//! Pluggable persistence and claiming engine.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;

use crate::error::JobQueueError;
use crate::types::{Job, JobFilter, JobId, JobList};

/// Result of a heartbeat for a running job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Heartbeat {
    /// The caller still owns the execution.
    Owned { cancel_requested: bool },
    /// The record is no longer RUNNING under the caller's attempt (reclaimed or settled elsewhere).
    Lost,
}

/// Storage and claiming engine behind every queue.
///
/// Every state change that races with other processes is a conditional write:
/// `claim_next` only takes claimable records, `heartbeat` and `settle` only
/// touch a record that is still RUNNING under the same attempt number.
#[async_trait]
pub trait JobQueueStrategy: Send + Sync {
    /// Persist a new PENDING job. If a record with the same id exists it is
    /// returned unchanged instead.
    async fn add(&self, job: Job) -> Result<Job, JobQueueError>;

    /// Claim the oldest claimable job of `queue`, moving it to RUNNING.
    async fn claim_next(&self, queue: &str) -> Result<Option<Job>, JobQueueError>;

    /// Refresh the liveness timestamp and progress of a running job.
    async fn heartbeat(&self, id: JobId, attempts: u32, progress: u8)
        -> Result<Heartbeat, JobQueueError>;

    /// Persist the outcome of an attempt. Returns false when the record was
    /// no longer RUNNING under `job.attempts` and the write was discarded.
    async fn settle(&self, job: &Job) -> Result<bool, JobQueueError>;

    /// Requeue RUNNING jobs of `queue` whose last heartbeat is older than
    /// `stale_before`. Returns the records after the transition.
    async fn reclaim_stale(
        &self,
        queue: &str,
        stale_before: DateTime<Utc>,
    ) -> Result<Vec<Job>, JobQueueError>;

    async fn find_one(&self, id: JobId) -> Result<Option<Job>, JobQueueError>;

    /// Matching jobs, newest first, paged by `filter.skip`/`filter.take`.
    async fn find_many(&self, filter: &JobFilter) -> Result<JobList, JobQueueError>;

    /// Cancel a job. PENDING and RETRYING records settle as CANCELLED, RUNNING
    /// records get `cancel_requested`, settled records are left alone.
    async fn cancel(&self, id: JobId) -> Result<Option<Job>, JobQueueError>;

    /// Delete settled jobs of the given queues (all queues if empty) settled
    /// before `older_than`. Returns the number removed.
    async fn remove_settled(
        &self,
        queue_names: &[String],
        older_than: DateTime<Utc>,
    ) -> Result<u64, JobQueueError>;

    /// A signal notified when `queue` gains work, for strategies that can push.
    fn wake_signal(&self, _queue: &str) -> Option<Arc<Notify>> {
        None
    }

    /// Short name used in logs.
    fn name(&self) -> &'static str;
}
