use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Extension, Query};
use axum::Json;
use conveyor_job_queue::JobFilter;
use serde_json::{json, Value};

use crate::handlers::utils::{parse_bool, parse_positive_usize, parse_states, split_csv};
use crate::{error::ApiError, state::AppState};

/// GET /jobs
/// List jobs, newest first. Filters: `queue`, `state` (comma separated),
/// `settled`; paging via `page` and `perPage`.
pub async fn list(
    Extension(state): Extension<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<Value>, ApiError> {
    let page = parse_positive_usize(params.get("page"), 1, "page")?;
    let per_page = parse_positive_usize(params.get("perPage"), 20, "perPage")?.min(500);
    let offset = (page - 1)
        .checked_mul(per_page)
        .ok_or_else(|| ApiError::bad_request("page is out of range"))?;

    let filter = JobFilter {
        queue_names: split_csv(params.get("queue")),
        states: parse_states(params.get("state"))?,
        settled: parse_bool(params.get("settled"), "settled")?,
        ..JobFilter::default()
    }
    .page(offset, per_page);

    let list = state.jobs.query(&filter).await?;

    Ok(Json(json!({
        "items": list.items,
        "pagination": {
            "page": page,
            "perPage": per_page,
            "total": list.total,
        }
    })))
}
