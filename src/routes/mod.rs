//! HTTP routing.

pub mod filter;
pub mod health;
pub mod stats;

use axum::{
    Router,
    routing::{get, post},
};

use crate::AppState;

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/filter", post(filter::filter))
        .route("/filter/batch", post(filter::filter_batch))
        .route("/filter/text", post(filter::filter_text))
        .route("/filter/image", post(filter::filter_image))
        .route("/stats/summary", get(stats::summary))
        .route("/stats/aggregate", post(stats::aggregate));

    Router::new()
        .nest("/v1", api)
        .route("/health", get(health::health_check))
        .route("/health/live", get(health::liveness))
        .route("/health/ready", get(health::readiness))
        .with_state(state)
}
