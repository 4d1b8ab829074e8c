//! Health check endpoints for probes and monitoring.

use axum::{Json, extract::State, response::IntoResponse};
use http::StatusCode;
use serde::Serialize;

use crate::AppState;

/// Detailed health status response.
#[derive(Debug, Serialize)]
pub struct HealthStatus {
    /// Overall status: "healthy" or "unhealthy".
    pub status: String,
    /// Service version.
    pub version: String,
    /// Individual subsystem statuses.
    pub subsystems: SubsystemStatus,
}

#[derive(Debug, Serialize)]
pub struct SubsystemStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database: Option<ComponentStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kv: Option<ComponentStatus>,
}

#[derive(Debug, Serialize)]
pub struct ComponentStatus {
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub latency_ms: u64,
}

/// Full health check with subsystem status.
///
/// The durable store being down degrades the service to unhealthy; the
/// shared KV being down does not, because the in-process fallback keeps
/// the request path working.
#[tracing::instrument(name = "health.check", skip(state))]
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let mut overall_healthy = true;
    let mut subsystems = SubsystemStatus {
        database: None,
        kv: None,
    };

    if let Some(db) = &state.db {
        let start = std::time::Instant::now();
        let healthy = db.health_check().await.is_ok();
        if !healthy {
            overall_healthy = false;
        }
        subsystems.database = Some(ComponentStatus {
            healthy,
            message: (!healthy).then(|| "Database connection failed".to_string()),
            latency_ms: start.elapsed().as_millis() as u64,
        });
    }

    if state.kv.has_primary() {
        let start = std::time::Instant::now();
        let healthy = state.kv.health_check().await;
        subsystems.kv = Some(ComponentStatus {
            healthy,
            message: (!healthy).then(|| "Serving from in-process fallback".to_string()),
            latency_ms: start.elapsed().as_millis() as u64,
        });
    }

    let health = HealthStatus {
        status: if overall_healthy {
            "healthy".to_string()
        } else {
            "unhealthy".to_string()
        },
        version: env!("CARGO_PKG_VERSION").to_string(),
        subsystems,
    };

    let status_code = if overall_healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(health))
}

/// Liveness probe. Succeeds whenever the process is running.
#[tracing::instrument(name = "health.liveness")]
pub async fn liveness() -> impl IntoResponse {
    StatusCode::OK
}

/// Readiness probe. Ready unless a configured durable store is down.
#[tracing::instrument(name = "health.readiness", skip(state))]
pub async fn readiness(State(state): State<AppState>) -> impl IntoResponse {
    if let Some(db) = &state.db
        && db.health_check().await.is_err()
    {
        return StatusCode::SERVICE_UNAVAILABLE;
    }
    StatusCode::OK
}
