//! palisade, a content-moderation gateway.
//!
//! Clients submit text and/or an image together with a policy (which
//! categories of sensitive content are permitted) and optional
//! conversation history; the gateway returns a verdict. The gateway does
//! not classify content itself: it composes a deterministic pre-screen,
//! a dual-backend verdict cache, and calls to external text/vision
//! moderation models, and it feeds a batched statistics pipeline that is
//! periodically rolled up into durable daily/hourly tables.

pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod kv;
pub mod models;
pub mod pipeline;
pub mod providers;
pub mod routes;
pub mod screen;
pub mod services;
pub mod stats;

use std::sync::Arc;

use axum::Router;
use thiserror::Error;
use tower_http::{cors::CorsLayer, limit::RequestBodyLimitLayer, trace::TraceLayer};

use crate::{
    cache::VerdictCache,
    config::GatewayConfig,
    db::{DbError, DbPool},
    kv::KvClient,
    pipeline::ModerationPipeline,
    providers::ProviderRegistry,
    screen::PreScreener,
    services::SummaryService,
    stats::{RecorderConfig, StatsAggregator, StatsRecorder},
};

#[derive(Debug, Error)]
pub enum InitError {
    #[error("Failed to initialize durable store: {0}")]
    Db(#[from] DbError),
}

/// Shared application state handed to every route handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub kv: Arc<KvClient>,
    pub db: Option<Arc<DbPool>>,
    pub pipeline: Arc<ModerationPipeline>,
    pub recorder: Arc<StatsRecorder>,
    pub aggregator: Arc<StatsAggregator>,
    pub summary: Arc<SummaryService>,
}

impl AppState {
    /// Wire up every subsystem and start the stats flush worker.
    ///
    /// Must run inside a tokio runtime.
    pub async fn new(config: GatewayConfig) -> Result<Self, InitError> {
        let kv = Arc::new(KvClient::connect(&config.kv).await);
        let db = DbPool::from_config(&config.database).await?.map(Arc::new);
        let store = db.as_ref().map(|d| d.stats());

        let registry = Arc::new(ProviderRegistry::from_config(
            &config.providers,
            &config.routing,
        ));
        let cache = Arc::new(VerdictCache::new(Arc::clone(&kv), config.cache.clone()));

        let recorder = Arc::new(StatsRecorder::new(RecorderConfig::default()));
        recorder.start_worker(Arc::clone(&kv));

        let aggregator = Arc::new(StatsAggregator::new(Arc::clone(&kv), store.clone()));
        let summary = Arc::new(SummaryService::new(Arc::clone(&kv), store));

        let pipeline = Arc::new(ModerationPipeline::new(
            PreScreener::new(&config.screen),
            cache,
            registry,
            Arc::clone(&recorder),
            config.limits.clone(),
        ));

        Ok(Self {
            config: Arc::new(config),
            kv,
            db,
            pipeline,
            recorder,
            aggregator,
            summary,
        })
    }

    /// Wait for in-flight background work, flush remaining statistics,
    /// and stop the flush worker.
    pub async fn shutdown(&self) {
        self.pipeline.drain_background().await;
        self.recorder.shutdown();
    }
}

/// Assemble the HTTP application.
pub fn build_app(state: AppState) -> Router {
    let body_limit = state.config.server.body_limit_bytes;
    routes::router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .layer(RequestBodyLimitLayer::new(body_limit))
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use http::{Request, StatusCode};
    use serde_json::{Value, json};
    use tower::ServiceExt;

    use super::*;

    async fn test_app() -> Router {
        let state = AppState::new(GatewayConfig::default())
            .await
            .expect("state builds without external services");
        build_app(state)
    }

    async fn post_json(app: &Router, uri: &str, body: Value) -> (StatusCode, Value) {
        let request = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: Value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, json)
    }

    async fn get_json(app: &Router, uri: &str) -> (StatusCode, Value) {
        let request = Request::builder()
            .method("GET")
            .uri(uri)
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: Value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, json)
    }

    #[tokio::test]
    async fn test_filter_clean_text() {
        let app = test_app().await;
        let (status, body) = post_json(
            &app,
            "/v1/filter",
            json!({"text": "Hello, how are you?"}),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["blocked"], false);
        assert_eq!(body["flags"], json!([]));
        assert!(body.get("filteredMessage").is_none());
    }

    #[tokio::test]
    async fn test_filter_blocks_phone() {
        let app = test_app().await;
        let (status, body) = post_json(
            &app,
            "/v1/filter",
            json!({"text": "Call me at 555-123-4567"}),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["blocked"], true);
        assert_eq!(body["flags"], json!(["phone_number"]));
        assert!(!body["reason"].as_str().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_filter_redacts_phone() {
        let app = test_app().await;
        let (status, body) = post_json(
            &app,
            "/v1/filter",
            json!({
                "text": "Call me at 555-123-4567",
                "config": {"returnFilteredMessage": true},
            }),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["blocked"], true);
        assert_eq!(
            body["filteredMessage"],
            format!("Call me at {}", "*".repeat(12))
        );
    }

    #[tokio::test]
    async fn test_batch_endpoint() {
        let app = test_app().await;
        let (status, body) = post_json(
            &app,
            "/v1/filter/batch",
            json!({"items": [
                {"text": "Hello there friend"},
                {"text": "Call me at 555-123-4567"},
            ]}),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        let results = body["results"].as_array().unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0]["blocked"], false);
        assert_eq!(results[1]["blocked"], true);
    }

    #[tokio::test]
    async fn test_batch_size_limit() {
        let app = test_app().await;
        let items: Vec<Value> = (0..11).map(|i| json!({"text": format!("msg {}", i)})).collect();
        let (status, body) = post_json(&app, "/v1/filter/batch", json!({"items": items})).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("10"));
    }

    #[tokio::test]
    async fn test_filter_image_endpoint_requires_image() {
        let app = test_app().await;
        // No image at all: text is ignored on this endpoint, so nothing is
        // left to moderate.
        let (status, body) =
            post_json(&app, "/v1/filter/image", json!({"text": "ignored"})).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["blocked"], true);
        assert_eq!(body["reason"], "no content");
    }

    #[tokio::test]
    async fn test_filter_image_endpoint_forces_image_analysis() {
        use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};

        let app = test_app().await;
        let png = BASE64.encode([0x89, b'P', b'N', b'G', 1, 2, 3, 4]);
        let (status, body) = post_json(
            &app,
            "/v1/filter/image",
            json!({
                "image": png,
                "config": {"analyzeImages": false},
            }),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        // No provider is configured and the image path is fail-closed, so
        // a blocked verdict carrying image_error proves the endpoint
        // forced image analysis on despite the policy disabling it. Were
        // the override lost, the image would be ignored and the request
        // would pass clean.
        assert_eq!(body["blocked"], true);
        assert!(
            body["flags"]
                .as_array()
                .unwrap()
                .iter()
                .any(|flag| flag == "image_error")
        );
    }

    #[tokio::test]
    async fn test_stats_summary_without_database() {
        let app = test_app().await;
        let (status, body) = get_json(&app, "/v1/stats/summary").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data_source"], "redis");
        assert_eq!(body["total_requests"], 0);
    }

    #[tokio::test]
    async fn test_aggregate_without_database_skips() {
        let app = test_app().await;
        let (status, body) = post_json(&app, "/v1/stats/aggregate", json!({})).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["skipped"], true);
        assert_eq!(body["recordsProcessed"], 0);
    }

    #[cfg(feature = "database-sqlite")]
    #[tokio::test]
    async fn test_aggregate_skip_data_check_opens_transaction() {
        let mut config = GatewayConfig::default();
        config.database = config::DatabaseConfig::Sqlite(config::SqliteConfig {
            path: "file:agg_skip_test?mode=memory&cache=shared".to_string(),
            create_if_missing: true,
        });

        let state = AppState::new(config).await.unwrap();
        let app = build_app(state);

        // Normal mode on an empty KV takes the guard's skip decision.
        let (status, body) = post_json(&app, "/v1/stats/aggregate", json!({})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["skipped"], true);

        // skip_data_check never evaluates the guard: same KV state, but
        // the run proceeds and the transaction commits an empty batch.
        let (status, body) = post_json(
            &app,
            "/v1/stats/aggregate?skip_data_check=true",
            json!({}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["skipped"], false);
        assert_eq!(body["recordsProcessed"], 0);
    }

    #[tokio::test]
    async fn test_health_endpoints() {
        let app = test_app().await;

        let (status, body) = get_json(&app, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert!(body["version"].as_str().is_some());
        // No database or KV primary configured.
        assert!(body["subsystems"]["database"].is_null());
        assert!(body["subsystems"]["kv"].is_null());

        let (status, _) = get_json(&app, "/health/live").await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = get_json(&app, "/health/ready").await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_malformed_json_is_client_error() {
        let app = test_app().await;
        let request = Request::builder()
            .method("POST")
            .uri("/v1/filter")
            .header("content-type", "application/json")
            .body(Body::from("{not json"))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert!(response.status().is_client_error());
    }

    #[cfg(feature = "database-sqlite")]
    #[tokio::test]
    async fn test_aggregate_with_sqlite_accumulates() {
        use std::sync::atomic::{AtomicU64, Ordering};

        use crate::kv::KvStore;
        use crate::stats::StatsKeys;

        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let db_id = COUNTER.fetch_add(1, Ordering::SeqCst);

        let mut config = GatewayConfig::default();
        config.database = config::DatabaseConfig::Sqlite(config::SqliteConfig {
            path: format!("file:agg_test_{}?mode=memory&cache=shared", db_id),
            create_if_missing: true,
        });

        let state = AppState::new(config).await.unwrap();
        let app = build_app(state.clone());

        // Seed KV counters, then aggregate twice: the second run must see
        // reset counters and skip.
        state.kv.incr_by(StatsKeys::requests_total(), 5).await.unwrap();
        state.kv.incr_by(StatsKeys::requests_blocked(), 2).await.unwrap();

        let (status, body) = post_json(&app, "/v1/stats/aggregate", json!({})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["skipped"], false);
        assert_eq!(body["recordsProcessed"], 1);

        let (_, body) = post_json(&app, "/v1/stats/aggregate", json!({})).await;
        assert_eq!(body["skipped"], true);

        // The durable row now backs the summary.
        let (_, body) = get_json(&app, "/v1/stats/summary").await;
        assert_eq!(body["data_source"], "database");
        assert_eq!(body["total_requests"], 5);
        assert_eq!(body["blocked_requests"], 2);
    }
}
