//! Handle returned when a job is added.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;

use crate::error::JobQueueError;
use crate::strategy::JobQueueStrategy;
use crate::types::{Job, JobId};
use crate::updates::{JobEvent, JobUpdates};

/// Reference to an enqueued job.
///
/// Waiting resolves from local events when the job runs in this process and
/// falls back to polling the store otherwise.
#[derive(Clone)]
pub struct JobHandle {
    job: Job,
    strategy: Arc<dyn JobQueueStrategy>,
    updates: JobUpdates,
    poll_interval: Duration,
}

impl fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobHandle")
            .field("job_id", &self.job.id)
            .field("queue", &self.job.queue_name)
            .field("poll_interval", &self.poll_interval)
            .finish()
    }
}

impl JobHandle {
    pub(crate) fn new(
        job: Job,
        strategy: Arc<dyn JobQueueStrategy>,
        updates: JobUpdates,
        poll_interval: Duration,
    ) -> Self {
        Self {
            job,
            strategy,
            updates,
            poll_interval,
        }
    }

    #[inline]
    pub fn id(&self) -> JobId {
        self.job.id
    }

    /// The record as it was when the job was added.
    #[inline]
    pub fn job(&self) -> &Job {
        &self.job
    }

    /// Id of the record carrying this job's work. Differs from [`id`](Self::id)
    /// when a buffer collapsed this job into another one.
    pub fn effective_id(&self) -> JobId {
        self.updates.resolve(self.job.id)
    }

    /// Load the current record from the store.
    pub async fn refresh(&self) -> Result<Job, JobQueueError> {
        let id = self.effective_id();
        self.strategy
            .find_one(id)
            .await?
            .ok_or(JobQueueError::NotFound(id))
    }

    /// Wait until the job settles and return the settled record.
    ///
    /// A job still held in a buffer is waited for until it is flushed. Fails
    /// with [`JobQueueError::NotFound`] once the job has no stored record and
    /// is not buffered, e.g. after its buffer was removed or the settled
    /// record was deleted.
    pub async fn wait(&self) -> Result<Job, JobQueueError> {
        let mut events = self.updates.subscribe();
        loop {
            // Read before the lookup: a job is released only after it is stored.
            let (target, held) = self.updates.resolve_held(self.job.id);
            match self.strategy.find_one(target).await? {
                Some(job) if job.is_settled => return Ok(job),
                Some(_) => {}
                None if held => {}
                None => return Err(JobQueueError::NotFound(target)),
            }

            tokio::select! {
                event = events.recv() => match event {
                    Ok(JobEvent::Changed(job)) if job.id == target && job.is_settled => {
                        return Ok(job);
                    }
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => tokio::time::sleep(self.poll_interval).await,
                },
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    /// [`wait`](Self::wait) with an upper bound.
    pub async fn wait_timeout(&self, timeout: Duration) -> Result<Job, JobQueueError> {
        tokio::time::timeout(timeout, self.wait())
            .await
            .map_err(|_| JobQueueError::Timeout(self.job.id))?
    }
}
