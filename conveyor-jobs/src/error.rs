//! Job processing errors.

use conveyor_job_queue::ProcessError;
use thiserror::Error;

/// Errors raised by the processors in this crate.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("invalid recipient: {0}")]
    InvalidRecipient(String),

    #[error("template error: {0}")]
    Template(String),
}

impl From<serde_json::Error> for JobError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidPayload(err.to_string())
    }
}

impl From<JobError> for ProcessError {
    fn from(err: JobError) -> Self {
        ProcessError::Failed(err.to_string())
    }
}
