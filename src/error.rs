//! HTTP-boundary error mapping.

use axum::{
    Json,
    response::{IntoResponse, Response},
};
use http::StatusCode;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    /// Malformed or out-of-bounds request input.
    #[error("{0}")]
    Validation(String),

    /// One or more sub-aggregations failed.
    #[error("Aggregation failed")]
    Aggregation(Vec<String>),

    /// Unexpected internal failure.
    #[error("{0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            ApiError::Validation(message) => (
                StatusCode::BAD_REQUEST,
                json!({"error": message}),
            ),
            ApiError::Aggregation(errors) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({"error": "aggregation failed", "details": errors}),
            ),
            ApiError::Internal(message) => {
                tracing::error!(error = %message, "Internal error at the HTTP boundary");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({"error": "internal error"}),
                )
            }
        };
        (status, Json(body)).into_response()
    }
}
