use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, Extension},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
    Router,
};
use conveyor_job_queue::JobFilter;

use crate::handlers::{jobs, queues, worker};
use crate::state::AppState;

const DEFAULT_BODY_LIMIT: usize = 1024 * 1024;

/// Build the admin router. Every route lives under `/api`.
pub fn build_router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/jobs", get(jobs::list::list))
        .route("/jobs/settled", delete(jobs::remove_settled::remove_settled))
        .route("/jobs/{id}", get(jobs::get::get))
        .route("/jobs/{id}/cancel", post(jobs::cancel::cancel))
        .route("/queues", get(queues::list::list))
        .route("/queues/{name}/jobs", post(queues::enqueue::enqueue))
        .route("/buffers/flush", post(queues::flush::flush))
        .route("/worker/ping", post(worker::ping::ping))
        .route(
            "/worker/email-preview",
            post(worker::render_preview::render_preview),
        )
        .layer(DefaultBodyLimit::max(DEFAULT_BODY_LIMIT))
        .layer(Extension(state));

    Router::new().nest("/api", api)
}

async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// Ready once the service has started and the job store answers.
async fn ready_handler(Extension(state): Extension<Arc<AppState>>) -> impl IntoResponse {
    if !state.jobs.is_started().await {
        return (StatusCode::SERVICE_UNAVAILABLE, "starting");
    }
    match state.jobs.query(&JobFilter::default().page(0, 1)).await {
        Ok(_) => (StatusCode::OK, "OK"),
        Err(error) => {
            tracing::warn!(%error, "job store not ready");
            (StatusCode::SERVICE_UNAVAILABLE, "job store unavailable")
        }
    }
}
