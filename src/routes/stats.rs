//! Statistics endpoints.

use axum::{
    Json,
    extract::{Query, State},
};
use chrono::{NaiveDate, Utc};
use serde::Deserialize;

use crate::{
    AppState,
    error::ApiError,
    models::StatsSummary,
    stats::{AggregationOutcome, RunMode},
};

#[derive(Debug, Default, Deserialize)]
pub struct SummaryParams {
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
}

/// Aggregate statistics for a date window (today when omitted).
#[tracing::instrument(name = "routes.stats_summary", skip_all)]
pub async fn summary(
    State(state): State<AppState>,
    Query(params): Query<SummaryParams>,
) -> Json<StatsSummary> {
    let range = match (params.from, params.to) {
        (None, None) => None,
        (from, to) => {
            let to = to.unwrap_or_else(|| Utc::now().date_naive());
            let from = from.unwrap_or(to);
            Some((from, to))
        }
    };
    Json(state.summary.summary(range).await)
}

#[derive(Debug, Default, Deserialize)]
pub struct AggregateParams {
    #[serde(default)]
    pub force: bool,
    #[serde(default)]
    pub skip_data_check: bool,
}

/// Trigger an aggregation run.
///
/// Rate limiting of this endpoint is left to the external scheduler that
/// calls it.
#[tracing::instrument(name = "routes.stats_aggregate", skip_all, fields(force = params.force))]
pub async fn aggregate(
    State(state): State<AppState>,
    Query(params): Query<AggregateParams>,
) -> Result<Json<AggregationOutcome>, ApiError> {
    let mode = if params.force {
        RunMode::Force
    } else if params.skip_data_check {
        RunMode::SkipDataCheck
    } else {
        RunMode::Normal
    };

    let outcome = state.aggregator.run(mode).await;
    if outcome.is_success() {
        Ok(Json(outcome))
    } else {
        Err(ApiError::Aggregation(outcome.errors))
    }
}
