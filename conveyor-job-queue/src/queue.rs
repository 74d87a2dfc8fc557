//! Per-queue façade.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use crate::error::JobQueueError;
use crate::handle::JobHandle;
use crate::processor::JobProcessor;
use crate::service::JobQueueService;
use crate::types::{Job, JobOptions, QueueOptions};

/// A named queue obtained from [`JobQueueService::register_queue`].
#[derive(Clone)]
pub struct JobQueue {
    name: Arc<str>,
    options: QueueOptions,
    service: JobQueueService,
}

impl fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobQueue")
            .field("name", &self.name)
            .field("options", &self.options)
            .finish()
    }
}

impl JobQueue {
    pub(crate) fn new(name: &str, options: QueueOptions, service: JobQueueService) -> Self {
        Self {
            name: Arc::from(name),
            options,
            service,
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn options(&self) -> QueueOptions {
        self.options
    }

    /// Add a job carrying `data`.
    ///
    /// Before the service starts (with buffering on) the job is held and
    /// persisted on start; otherwise it is persisted before this returns.
    pub async fn add<T>(&self, data: &T, options: JobOptions) -> Result<JobHandle, JobQueueError>
    where
        T: Serialize + ?Sized,
    {
        let data = serde_json::to_value(data)?;
        let retries = options.retries.unwrap_or(self.options.retries);
        let id = options.job_id.unwrap_or_else(Uuid::new_v4);
        let job = Job::with_id(id, self.name.as_ref(), data, retries);

        let job = self.service.enqueue(job).await?;
        Ok(self.service.handle(job))
    }

    /// Register the processor for this queue. Fails if one is already registered.
    pub async fn process<P>(&self, processor: P) -> Result<(), JobQueueError>
    where
        P: JobProcessor + 'static,
    {
        self.service
            .set_processor(&self.name, Arc::new(processor))
            .await
    }
}
