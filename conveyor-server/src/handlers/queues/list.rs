use std::sync::Arc;

use axum::extract::Extension;
use axum::Json;
use serde_json::{json, Value};

use crate::{error::ApiError, state::AppState};

/// GET /queues
/// Registered queues with their options.
pub async fn list(Extension(state): Extension<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    let items: Vec<Value> = state
        .jobs
        .queue_names()
        .into_iter()
        .filter_map(|name| state.jobs.queue(&name))
        .map(|queue| {
            let options = queue.options();
            json!({
                "name": queue.name(),
                "concurrency": options.concurrency,
                "retries": options.retries,
                "runOn": options.run_on,
            })
        })
        .collect();

    Ok(Json(json!({
        "items": items,
        "role": state.jobs.role(),
        "started": state.jobs.is_started().await,
    })))
}
