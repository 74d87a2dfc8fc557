use std::sync::Arc;

use axum::extract::Extension;
use axum::Json;
use chrono::Utc;
use conveyor_jobs::WorkerPing;
use serde_json::{json, Value};

use crate::{error::ApiError, state::AppState};

/// POST /worker/ping
/// Round trip through the process bridge to the worker role.
pub async fn ping(Extension(state): Extension<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    let sent_at = Utc::now();
    let pong = state.bridge.request(&WorkerPing { sent_at }).await?;
    let round_trip_ms = (Utc::now() - sent_at).num_milliseconds();

    Ok(Json(json!({
        "workerPid": pong.pid,
        "receivedAt": pong.received_at,
        "roundTripMs": round_trip_ms,
    })))
}
