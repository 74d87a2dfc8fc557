use std::sync::Arc;

use axum::extract::Extension;
use axum::Json;
use conveyor_jobs::{RenderEmailPreview, RenderedEmail};

use crate::{error::ApiError, state::AppState};

/// POST /worker/email-preview
/// Have the worker render an email template without sending it.
pub async fn render_preview(
    Extension(state): Extension<Arc<AppState>>,
    Json(request): Json<RenderEmailPreview>,
) -> Result<Json<RenderedEmail>, ApiError> {
    Ok(Json(state.bridge.request(&request).await?))
}
