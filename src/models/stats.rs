//! Statistics records: per-request events, durable roll-up rows, and the
//! summary shape served by the query service.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Which external API a call went to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiType {
    Text,
    Image,
}

impl ApiType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApiType::Text => "text",
            ApiType::Image => "image",
        }
    }
}

impl std::fmt::Display for ApiType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row per calendar day (UTC) of request-level roll-ups.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestStatsDaily {
    pub date: NaiveDate,
    pub total_requests: i64,
    /// Requests that went through full analysis (total minus cache hits).
    pub filtered_requests: i64,
    pub blocked_requests: i64,
    pub cached_requests: i64,
    pub avg_response_time_ms: f64,
    pub p95_response_time_ms: f64,
    pub updated_at: Option<DateTime<Utc>>,
}

/// One row per (date, flag).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentFlagsDaily {
    pub date: NaiveDate,
    pub flag_name: String,
    pub count: i64,
}

/// Where a summary's numbers came from, so callers can reason about
/// freshness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SummarySource {
    /// Durable roll-ups, possibly merged with live KV counters.
    Database,
    /// KV counters only (no durable store configured or reachable).
    Redis,
    /// Neither backend reachable; zeroed numbers.
    Fallback,
}

/// Aggregate statistics served by `GET /v1/stats/summary`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsSummary {
    pub total_requests: i64,
    pub blocked_requests: i64,
    pub cached_requests: i64,
    pub avg_response_time_ms: f64,
    pub p95_response_time_ms: f64,
    /// Per-flag totals over the window, flag name to count.
    pub flags: Vec<FlagCount>,
    pub data_source: SummarySource,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlagCount {
    pub flag: String,
    pub count: i64,
}

impl StatsSummary {
    /// Zeroed summary used when neither backend is reachable.
    pub fn empty(source: SummarySource) -> Self {
        Self {
            total_requests: 0,
            blocked_requests: 0,
            cached_requests: 0,
            avg_response_time_ms: 0.0,
            p95_response_time_ms: 0.0,
            flags: Vec::new(),
            data_source: source,
        }
    }
}
