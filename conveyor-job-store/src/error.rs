use conveyor_job_queue::JobQueueError;
use thiserror::Error;

/// Errors raised by the job record store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),

    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error(transparent)]
    Connection(#[from] conveyor_db_connection::DbConnectionError),

    #[error("invalid JSON in job record: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid job record {id}: {reason}")]
    Decode { id: String, reason: String },
}

impl From<StoreError> for JobQueueError {
    fn from(err: StoreError) -> Self {
        JobQueueError::TransientStore(err.to_string())
    }
}
