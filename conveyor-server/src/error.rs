use axum::{http::StatusCode, response::IntoResponse, Json};
use conveyor_job_queue::bridge::BridgeError;
use conveyor_job_queue::JobQueueError;
use serde_json::json;
use thiserror::Error;

/// Error returned by every admin API handler.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("job queue error: {0}")]
    JobQueue(#[from] JobQueueError),
    #[error("worker bridge error: {0}")]
    Bridge(#[from] BridgeError),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error(transparent)]
    SerdeJson(#[from] serde_json::Error),
}

impl ApiError {
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }

    fn status(&self) -> StatusCode {
        match self {
            ApiError::JobQueue(err) => match err {
                JobQueueError::UnknownQueue(_) | JobQueueError::NotFound(_) => {
                    StatusCode::NOT_FOUND
                }
                JobQueueError::InvalidQueueName(_)
                | JobQueueError::Serialization(_)
                | JobQueueError::UnknownState(_) => StatusCode::BAD_REQUEST,
                JobQueueError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
                _ => StatusCode::SERVICE_UNAVAILABLE,
            },
            ApiError::Bridge(BridgeError::UnknownTag(_)) => StatusCode::NOT_IMPLEMENTED,
            ApiError::Bridge(BridgeError::Remote { .. }) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Bridge(_) => StatusCode::BAD_GATEWAY,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) | ApiError::SerdeJson(_) => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::warn!(error = %self, status = status.as_u16(), "request failed");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
