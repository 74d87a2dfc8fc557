use std::sync::Arc;

use axum::extract::{Extension, Path};
use axum::Json;
use conveyor_job_queue::Job;

use crate::handlers::utils::parse_job_id;
use crate::{error::ApiError, state::AppState};

/// GET /jobs/{id}
pub async fn get(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Job>, ApiError> {
    let id = parse_job_id(&id)?;
    state
        .jobs
        .get(id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("job {id}")))
}
