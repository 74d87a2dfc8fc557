use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Extension, Query};
use axum::Json;
use chrono::{Duration, Utc};
use serde_json::{json, Value};

use crate::handlers::utils::split_csv;
use crate::{error::ApiError, state::AppState};

/// DELETE /jobs/settled
/// Remove jobs settled more than `olderThanSecs` seconds ago (default 0),
/// optionally limited to `queue`.
pub async fn remove_settled(
    Extension(state): Extension<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<Value>, ApiError> {
    let queues = split_csv(params.get("queue"));
    let older_than_secs = match params.get("olderThanSecs") {
        Some(raw) => raw
            .parse::<i64>()
            .ok()
            .filter(|secs| *secs >= 0)
            .ok_or_else(|| ApiError::bad_request("olderThanSecs must be a non-negative integer"))?,
        None => 0,
    };
    let cutoff = Duration::try_seconds(older_than_secs)
        .and_then(|age| Utc::now().checked_sub_signed(age))
        .ok_or_else(|| ApiError::bad_request("olderThanSecs is out of range"))?;

    let removed = state.jobs.remove_settled_jobs(&queues, cutoff).await?;
    Ok(Json(json!({ "removed": removed })))
}
