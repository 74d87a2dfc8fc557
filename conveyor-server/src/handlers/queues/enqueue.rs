use std::sync::Arc;

use axum::extract::{Extension, Path};
use axum::http::StatusCode;
use axum::Json;
use conveyor_job_queue::{JobId, JobOptions, JobQueueError};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::{error::ApiError, state::AppState};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueRequest {
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub retries: Option<u32>,
    /// Reusing an id returns the existing job instead of adding a new one.
    #[serde(default)]
    pub job_id: Option<JobId>,
}

/// POST /queues/{name}/jobs
pub async fn enqueue(
    Extension(state): Extension<Arc<AppState>>,
    Path(name): Path<String>,
    Json(body): Json<EnqueueRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let queue = state
        .jobs
        .queue(&name)
        .ok_or(JobQueueError::UnknownQueue(name))?;

    let options = JobOptions {
        retries: body.retries,
        job_id: body.job_id,
    };
    let handle = queue.add(&body.data, options).await?;
    tracing::debug!(queue = queue.name(), job_id = %handle.id(), "job enqueued via api");

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "job": handle.job(),
            "effectiveId": handle.effective_id(),
        })),
    ))
}
