use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Extension, Query};
use axum::Json;
use serde_json::{json, Value};

use crate::handlers::utils::split_csv;
use crate::{error::ApiError, state::AppState};

/// POST /buffers/flush
/// Persist the jobs held by the `buffer` ids given (every buffer if none).
pub async fn flush(
    Extension(state): Extension<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<Value>, ApiError> {
    let buffers = split_csv(params.get("buffer"));
    let held = state.jobs.buffer_size(&buffers).await;
    let flushed = state.jobs.flush(&buffers).await?;
    Ok(Json(json!({ "held": held, "flushed": flushed })))
}
