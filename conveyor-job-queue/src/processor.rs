//! Job processor trait for implementing job handlers.

use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::watch;

use crate::error::ProcessError;
use crate::types::{Job, JobId};
use crate::updates::JobUpdates;

/// Trait for implementing job processors.
///
/// A processor handles every job of the queue it is registered on. Returning
/// `Ok` completes the job with the given result; `Err(ProcessError::Failed)`
/// records a failed attempt; `Err(ProcessError::Cancelled)` settles the job as
/// cancelled.
#[async_trait]
pub trait JobProcessor: Send + Sync {
    async fn process(&self, ctx: JobContext) -> Result<Value, ProcessError>;
}

#[async_trait]
impl<F, Fut> JobProcessor for F
where
    F: Fn(JobContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, ProcessError>> + Send,
{
    async fn process(&self, ctx: JobContext) -> Result<Value, ProcessError> {
        (self)(ctx).await
    }
}

/// A processor that completes every job immediately with a null result.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpProcessor;

#[async_trait]
impl JobProcessor for NoOpProcessor {
    async fn process(&self, _ctx: JobContext) -> Result<Value, ProcessError> {
        Ok(Value::Null)
    }
}

/// Handle given to a processor for one execution attempt.
///
/// Carries the claimed job, a progress reporter and the cooperative
/// cancellation signal.
#[derive(Debug, Clone)]
pub struct JobContext {
    job: Arc<Job>,
    progress: Arc<AtomicU8>,
    cancel: watch::Receiver<bool>,
    updates: Option<JobUpdates>,
}

impl JobContext {
    pub(crate) fn new(
        job: Job,
        progress: Arc<AtomicU8>,
        cancel: watch::Receiver<bool>,
        updates: JobUpdates,
    ) -> Self {
        Self {
            job: Arc::new(job),
            progress,
            cancel,
            updates: Some(updates),
        }
    }

    /// A context that is not attached to a dispatcher; useful for exercising processors directly.
    pub fn detached(job: Job) -> Self {
        let (_tx, cancel) = watch::channel(false);
        Self {
            progress: Arc::new(AtomicU8::new(job.progress)),
            job: Arc::new(job),
            cancel,
            updates: None,
        }
    }

    #[inline]
    pub fn job(&self) -> &Job {
        &self.job
    }

    #[inline]
    pub fn id(&self) -> JobId {
        self.job.id
    }

    #[inline]
    pub fn queue_name(&self) -> &str {
        &self.job.queue_name
    }

    /// 1-based number of the current attempt.
    #[inline]
    pub fn attempt(&self) -> u32 {
        self.job.attempts
    }

    #[inline]
    pub fn raw_data(&self) -> &Value {
        &self.job.data
    }

    /// Deserialize the job payload.
    pub fn data<T: DeserializeOwned>(&self) -> Result<T, ProcessError> {
        serde_json::from_value(self.job.data.clone()).map_err(ProcessError::from)
    }

    /// Report progress (clamped to 100).
    pub fn set_progress(&self, progress: u8) {
        let progress = progress.min(100);
        self.progress.store(progress, Ordering::Relaxed);
        if let Some(updates) = &self.updates {
            updates.publish_progress(self.job.id, progress);
        }
    }

    pub fn progress(&self) -> u8 {
        self.progress.load(Ordering::Relaxed)
    }

    /// Whether cancellation of this job has been requested.
    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Resolves once cancellation has been requested. Never resolves otherwise.
    pub async fn cancelled(&self) {
        let mut rx = self.cancel.clone();
        if rx.wait_for(|cancelled| *cancelled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
