//! Error types for the job queue system.

use thiserror::Error;

use crate::types::JobId;

/// Errors that may occur while interacting with the job queue.
#[derive(Debug, Error)]
pub enum JobQueueError {
    #[error("failed to enqueue job on queue {queue}: {message}")]
    Enqueue { queue: String, message: String },

    #[error("a processor is already registered for queue {0}")]
    DuplicateProcessor(String),

    #[error("invalid queue name `{0}`")]
    InvalidQueueName(String),

    #[error("invalid options for queue {queue}: {reason}")]
    InvalidQueueOptions { queue: String, reason: String },

    #[error("queue {0} is already registered with different options")]
    QueueConflict(String),

    #[error("queue {0} is not registered")]
    UnknownQueue(String),

    #[error("a job buffer with id {0} is already registered")]
    DuplicateBuffer(String),

    #[error("invalid setting: {0}")]
    InvalidSetting(String),

    #[error("job processor failed: {0}")]
    Processor(#[from] ProcessError),

    #[error("job {0} was claimed by another poller")]
    ClaimConflict(JobId),

    #[error("job store unavailable: {0}")]
    TransientStore(String),

    #[error("stale job {job_id} on queue {queue} was reclaimed")]
    StaleJobReclaimed { job_id: JobId, queue: String },

    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error("timed out waiting for job {0} to settle")]
    Timeout(JobId),

    #[error("unknown job state `{0}`")]
    UnknownState(String),

    #[error("failed to serialize job payload: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl JobQueueError {
    /// Whether the error stems from misconfiguration that should abort startup.
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::DuplicateProcessor(_)
                | Self::InvalidQueueName(_)
                | Self::InvalidQueueOptions { .. }
                | Self::QueueConflict(_)
                | Self::DuplicateBuffer(_)
                | Self::InvalidSetting(_)
        )
    }
}

/// Outcome of a processor that did not complete normally.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProcessError {
    /// The attempt failed; the job is retried while attempts remain.
    #[error("{0}")]
    Failed(String),

    /// The processor observed a cancel request and stopped early.
    #[error("job was cancelled")]
    Cancelled,
}

impl ProcessError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

impl From<serde_json::Error> for ProcessError {
    fn from(err: serde_json::Error) -> Self {
        Self::Failed(format!("invalid payload: {err}"))
    }
}
