use std::sync::Arc;

use axum::extract::{Extension, Path};
use axum::Json;
use conveyor_job_queue::Job;

use crate::handlers::utils::parse_job_id;
use crate::{error::ApiError, state::AppState};

/// POST /jobs/{id}/cancel
/// Waiting jobs come back CANCELLED; running jobs come back RUNNING with
/// `cancelRequested` set.
pub async fn cancel(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Job>, ApiError> {
    let id = parse_job_id(&id)?;
    state
        .jobs
        .cancel(id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("job {id}")))
}
