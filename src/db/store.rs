//! The durable roll-up store interface.
//!
//! One implementation per backend. The aggregator hands the store a fully
//! computed delta batch; the store applies it in a single transaction with
//! strict accumulation semantics (existing rows gain the delta, they are
//! never overwritten by it).

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};

use super::error::DbResult;
use crate::models::{ApiType, ContentFlagsDaily, RequestStatsDaily};

/// Request-level deltas for one aggregation run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestDelta {
    pub total: i64,
    pub blocked: i64,
    pub cached: i64,
    /// Mean of the current latency sample window, milliseconds.
    pub avg_ms: f64,
    /// 95th percentile of the current latency sample window.
    pub p95_ms: f64,
}

/// Per-API-type call deltas.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiDelta {
    pub api: ApiType,
    pub calls: i64,
    pub errors: i64,
    pub total_time_ms: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FlagDelta {
    pub flag: String,
    pub count: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UserDelta {
    pub user_id: String,
    pub count: i64,
}

/// Everything one aggregation run wants to fold into the durable store.
#[derive(Debug, Clone, Default)]
pub struct RollupBatch {
    /// Calendar day (UTC) the request/flag/user deltas land on.
    pub date: NaiveDate,
    /// Hour bucket (UTC, truncated) the API deltas land on.
    pub hour: DateTime<Utc>,
    pub request: Option<RequestDelta>,
    pub api: Vec<ApiDelta>,
    pub flags: Vec<FlagDelta>,
    pub users: Vec<UserDelta>,
}

impl RollupBatch {
    pub fn is_empty(&self) -> bool {
        self.request.is_none() && self.api.is_empty() && self.flags.is_empty()
            && self.users.is_empty()
    }
}

/// Per-sub-aggregation outcome of one applied batch.
#[derive(Debug, Clone, Default)]
pub struct RollupReport {
    pub request_rows: u64,
    pub api_rows: u64,
    pub flag_rows: u64,
    pub user_rows: u64,
    /// One entry per failed sub-aggregation. The rest of the batch still
    /// commits.
    pub errors: Vec<String>,
}

impl RollupReport {
    pub fn records_processed(&self) -> u64 {
        self.request_rows + self.api_rows + self.flag_rows + self.user_rows
    }

    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }
}

#[async_trait]
pub trait StatsStore: Send + Sync {
    /// Apply a delta batch inside one transaction.
    ///
    /// Each of the four sub-aggregations runs in its own savepoint:
    /// a failing one is rolled back and reported in `errors` while the
    /// others commit with the enclosing transaction.
    async fn apply_rollups(&self, batch: RollupBatch) -> DbResult<RollupReport>;

    async fn request_daily(&self, date: NaiveDate) -> DbResult<Option<RequestStatsDaily>>;

    async fn request_daily_range(
        &self,
        from: NaiveDate,
        to: NaiveDate,
    ) -> DbResult<Vec<RequestStatsDaily>>;

    async fn flags_daily(&self, date: NaiveDate) -> DbResult<Vec<ContentFlagsDaily>>;

    async fn health_check(&self) -> DbResult<()>;
}
