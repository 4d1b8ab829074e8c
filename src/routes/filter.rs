//! Moderation endpoints.

use axum::{Json, extract::State};
use futures::future::join_all;
use http::HeaderMap;
use serde::{Deserialize, Serialize};

use crate::{AppState, error::ApiError, models::{FilterRequest, FilterVerdict}};

/// Optional caller identity for per-user statistics. Authentication itself
/// lives in front of the gateway; this header is trusted as-is.
const USER_HEADER: &str = "x-user-id";

fn user_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get(USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(String::from)
}

/// Moderate a text and/or image request.
#[tracing::instrument(name = "routes.filter", skip_all)]
pub async fn filter(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<FilterRequest>,
) -> Json<FilterVerdict> {
    Json(state.pipeline.filter(request, user_id(&headers)).await)
}

#[derive(Debug, Deserialize)]
pub struct BatchRequest {
    pub items: Vec<FilterRequest>,
}

#[derive(Debug, Serialize)]
pub struct BatchResponse {
    pub results: Vec<FilterVerdict>,
}

/// Moderate up to `limits.batch_max_items` requests in one call.
///
/// Items are processed concurrently; result order matches input order.
#[tracing::instrument(name = "routes.filter_batch", skip_all, fields(items = batch.items.len()))]
pub async fn filter_batch(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(batch): Json<BatchRequest>,
) -> Result<Json<BatchResponse>, ApiError> {
    let max = state.config.limits.batch_max_items;
    if batch.items.is_empty() {
        return Err(ApiError::Validation("batch must not be empty".into()));
    }
    if batch.items.len() > max {
        return Err(ApiError::Validation(format!(
            "batch exceeds {} items",
            max
        )));
    }

    let user = user_id(&headers);
    let results = join_all(
        batch
            .items
            .into_iter()
            .map(|item| state.pipeline.filter(item, user.clone())),
    )
    .await;

    Ok(Json(BatchResponse { results }))
}

/// Text-only moderation: any image payload is ignored.
#[tracing::instrument(name = "routes.filter_text", skip_all)]
pub async fn filter_text(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(mut request): Json<FilterRequest>,
) -> Json<FilterVerdict> {
    request.image = None;
    Json(state.pipeline.filter(request, user_id(&headers)).await)
}

/// Image-only moderation: text is ignored and image analysis is implied.
#[tracing::instrument(name = "routes.filter_image", skip_all)]
pub async fn filter_image(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(mut request): Json<FilterRequest>,
) -> Json<FilterVerdict> {
    request.text = String::new();
    request.policy.analyze_images = true;
    Json(state.pipeline.filter(request, user_id(&headers)).await)
}
