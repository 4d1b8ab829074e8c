//! Periodic roll-up aggregation.
//!
//! An external scheduler (or the `stats/aggregate` endpoint) triggers a
//! run. A run reads the KV counters the recorder has been accumulating,
//! folds them into the durable daily/hourly tables through one
//! [`StatsStore::apply_rollups`] transaction, and, on a fully successful
//! run, resets the consumed counters so the next run starts from zero.
//! Resetting makes aggregation idempotent over identical KV state; a
//! partially failed run leaves the counters in place, trading possible
//! double-counting for never losing deltas (roll-ups only ever grow).
//!
//! In normal mode a run first issues a single pipelined pre-check; if every
//! counter is zero and every keyspace probe comes back empty, the run
//! returns `skipped` without ever opening a durable-store transaction.
//! A forced run consults the same guard but overrides its decision; a
//! skip-data-check run never evaluates the guard at all and proceeds
//! straight to collection.

use std::sync::Arc;

use chrono::{Timelike, Utc};
use serde::Serialize;

use super::keys::{StatsKeys, api_fields};
use crate::{
    db::{ApiDelta, FlagDelta, RequestDelta, RollupBatch, StatsStore, UserDelta},
    kv::{KvClient, KvOp, KvStore},
    models::ApiType,
};

/// How a run was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Consult the guard; skip when there is nothing to aggregate.
    Normal,
    /// Consult the guard but run even when it reports nothing.
    Force,
    /// Never evaluate the guard: go straight to collection and the
    /// transaction, trusting the caller that a run is worthwhile.
    SkipDataCheck,
}

/// Result of one aggregation run.
#[derive(Debug, Clone, Serialize)]
pub struct AggregationOutcome {
    pub skipped: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(rename = "recordsProcessed")]
    pub records_processed: u64,
    pub request_rows: u64,
    pub api_rows: u64,
    pub flag_rows: u64,
    pub user_rows: u64,
    pub errors: Vec<String>,
}

impl AggregationOutcome {
    fn skipped(reason: impl Into<String>) -> Self {
        Self {
            skipped: true,
            reason: Some(reason.into()),
            records_processed: 0,
            request_rows: 0,
            api_rows: 0,
            flag_rows: 0,
            user_rows: 0,
            errors: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Snapshot of the KV statistics state, read in one pipelined burst.
struct KvSnapshot {
    total: i64,
    blocked: i64,
    cached: i64,
    flag_keys: Vec<String>,
    user_keys: Vec<String>,
    api_keys: Vec<String>,
}

impl KvSnapshot {
    fn is_empty(&self) -> bool {
        self.total == 0
            && self.blocked == 0
            && self.cached == 0
            && self.flag_keys.is_empty()
            && self.user_keys.is_empty()
            && self.api_keys.is_empty()
    }
}

pub struct StatsAggregator {
    kv: Arc<KvClient>,
    store: Option<Arc<dyn StatsStore>>,
}

impl StatsAggregator {
    pub fn new(kv: Arc<KvClient>, store: Option<Arc<dyn StatsStore>>) -> Self {
        Self { kv, store }
    }

    #[tracing::instrument(name = "stats.aggregate", skip(self))]
    pub async fn run(&self, mode: RunMode) -> AggregationOutcome {
        let Some(store) = &self.store else {
            return AggregationOutcome::skipped("durable store not configured");
        };

        // The guard read happens only for the modes that consult it; a
        // skip-data-check run collects inside build_batch instead.
        let snapshot = match mode {
            RunMode::SkipDataCheck => None,
            RunMode::Normal | RunMode::Force => match self.read_snapshot().await {
                Ok(snapshot) => {
                    if mode == RunMode::Normal && snapshot.is_empty() {
                        tracing::debug!("No statistics to aggregate, skipping");
                        return AggregationOutcome::skipped("no data to aggregate");
                    }
                    Some(snapshot)
                }
                Err(e) => {
                    return AggregationOutcome::skipped(format!("KV unavailable: {}", e));
                }
            },
        };

        let (batch, consumed_keys) = match self.build_batch(snapshot).await {
            Ok(built) => built,
            Err(e) => {
                return AggregationOutcome::skipped(format!("KV unavailable: {}", e));
            }
        };

        let report = match store.apply_rollups(batch).await {
            Ok(report) => report,
            Err(e) => {
                tracing::error!(error = %e, "Aggregation transaction failed");
                return AggregationOutcome {
                    skipped: false,
                    reason: None,
                    records_processed: 0,
                    request_rows: 0,
                    api_rows: 0,
                    flag_rows: 0,
                    user_rows: 0,
                    errors: vec![format!("transaction: {}", e)],
                };
            }
        };

        if report.is_success() {
            self.reset_counters(consumed_keys).await;
        } else {
            tracing::warn!(
                errors = report.errors.len(),
                "Partial aggregation failure, leaving KV counters for the next run"
            );
        }

        tracing::info!(
            records = report.records_processed(),
            errors = report.errors.len(),
            "Aggregation run complete"
        );

        AggregationOutcome {
            skipped: false,
            reason: None,
            records_processed: report.records_processed(),
            request_rows: report.request_rows,
            api_rows: report.api_rows,
            flag_rows: report.flag_rows,
            user_rows: report.user_rows,
            errors: report.errors,
        }
    }

    /// One pipelined read: the three counters plus the keyspace probes.
    async fn read_snapshot(&self) -> crate::kv::KvResult<KvSnapshot> {
        let replies = self
            .kv
            .pipeline(vec![
                KvOp::Get(StatsKeys::requests_total().to_string()),
                KvOp::Get(StatsKeys::requests_blocked().to_string()),
                KvOp::Get(StatsKeys::requests_cached().to_string()),
                KvOp::Keys(StatsKeys::flag_pattern().to_string()),
                KvOp::Keys(StatsKeys::requests_user_pattern().to_string()),
                KvOp::Keys(StatsKeys::api_stats_pattern().to_string()),
            ])
            .await?;

        Ok(KvSnapshot {
            total: replies.first().map(|r| r.as_counter()).unwrap_or(0),
            blocked: replies.get(1).map(|r| r.as_counter()).unwrap_or(0),
            cached: replies.get(2).map(|r| r.as_counter()).unwrap_or(0),
            flag_keys: replies.get(3).map(|r| r.as_array().to_vec()).unwrap_or_default(),
            user_keys: replies.get(4).map(|r| r.as_array().to_vec()).unwrap_or_default(),
            api_keys: replies.get(5).map(|r| r.as_array().to_vec()).unwrap_or_default(),
        })
    }

    /// Expand the snapshot into a delta batch, returning every KV key the
    /// batch consumed (for the post-commit reset).
    ///
    /// Guarded modes hand in the snapshot their guard read already
    /// produced; a guard-less run passes `None` and the counters and
    /// keyspaces are collected here, with no emptiness decision taken.
    async fn build_batch(
        &self,
        snapshot: Option<KvSnapshot>,
    ) -> crate::kv::KvResult<(RollupBatch, Vec<String>)> {
        let snapshot = match snapshot {
            Some(snapshot) => snapshot,
            None => self.read_snapshot().await?,
        };
        let now = Utc::now();
        let hour = now
            .with_minute(0)
            .and_then(|t| t.with_second(0))
            .and_then(|t| t.with_nanosecond(0))
            .unwrap_or(now);

        let mut consumed = vec![
            StatsKeys::requests_total().to_string(),
            StatsKeys::requests_blocked().to_string(),
            StatsKeys::requests_cached().to_string(),
            StatsKeys::latency_list().to_string(),
        ];

        let samples: Vec<u64> = self
            .kv
            .lrange(StatsKeys::latency_list(), 0, -1)
            .await?
            .iter()
            .filter_map(|s| s.parse().ok())
            .collect();

        let request = if snapshot.total > 0 || snapshot.blocked > 0 || snapshot.cached > 0 {
            Some(RequestDelta {
                total: snapshot.total,
                blocked: snapshot.blocked,
                cached: snapshot.cached,
                avg_ms: mean(&samples),
                p95_ms: percentile_95(&samples),
            })
        } else {
            None
        };

        let mut flags = Vec::new();
        if !snapshot.flag_keys.is_empty() {
            let values = self.kv.mget(&snapshot.flag_keys).await?;
            for (key, value) in snapshot.flag_keys.iter().zip(values) {
                let count: i64 = value.as_deref().and_then(|v| v.parse().ok()).unwrap_or(0);
                if count > 0
                    && let Some(flag) = StatsKeys::flag_name(key)
                {
                    flags.push(FlagDelta {
                        flag: flag.to_string(),
                        count,
                    });
                }
                consumed.push(key.clone());
            }
        }

        let mut users = Vec::new();
        if !snapshot.user_keys.is_empty() {
            let values = self.kv.mget(&snapshot.user_keys).await?;
            for (key, value) in snapshot.user_keys.iter().zip(values) {
                let count: i64 = value.as_deref().and_then(|v| v.parse().ok()).unwrap_or(0);
                if count > 0
                    && let Some(user_id) = StatsKeys::user_id(key)
                {
                    users.push(UserDelta {
                        user_id: user_id.to_string(),
                        count,
                    });
                }
                consumed.push(key.clone());
            }
        }

        let mut api = Vec::new();
        for api_type in [ApiType::Text, ApiType::Image] {
            let key = StatsKeys::api_stats(api_type);
            let fields = self.kv.hgetall(&key).await?;
            if fields.is_empty() {
                continue;
            }
            let get = |name: &str| {
                fields
                    .iter()
                    .find(|(f, _)| f == name)
                    .and_then(|(_, v)| v.parse::<i64>().ok())
                    .unwrap_or(0)
            };
            let delta = ApiDelta {
                api: api_type,
                calls: get(api_fields::CALLS),
                errors: get(api_fields::ERRORS),
                total_time_ms: get(api_fields::TOTAL_TIME),
            };
            if delta.calls > 0 || delta.errors > 0 {
                api.push(delta);
            }
            consumed.push(key);
        }

        Ok((
            RollupBatch {
                date: now.date_naive(),
                hour,
                request,
                api,
                flags,
                users,
            },
            consumed,
        ))
    }

    /// Delete the consumed counters after a fully successful run.
    async fn reset_counters(&self, keys: Vec<String>) {
        let ops: Vec<KvOp> = keys.into_iter().map(KvOp::Del).collect();
        if let Err(e) = self.kv.pipeline(ops).await {
            // Worst case the next run double-counts into a monotone table.
            tracing::warn!(error = %e, "Failed to reset KV counters after aggregation");
        }
    }
}

fn mean(samples: &[u64]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    samples.iter().sum::<u64>() as f64 / samples.len() as f64
}

fn percentile_95(samples: &[u64]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let mut sorted = samples.to_vec();
    sorted.sort_unstable();
    let rank = ((sorted.len() as f64) * 0.95).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1] as f64
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};

    use async_trait::async_trait;
    use chrono::NaiveDate;

    use super::*;
    use crate::{
        db::{DbResult, RollupReport},
        models::{ContentFlagsDaily, Flag, RequestStatsDaily},
        stats::keys::StatsKeys,
    };

    /// Store double that counts transactions and captures batches.
    #[derive(Default)]
    struct MockStore {
        transactions: AtomicU64,
        captured: std::sync::Mutex<Vec<RollupBatch>>,
        fail_sub: bool,
    }

    #[async_trait]
    impl StatsStore for MockStore {
        async fn apply_rollups(&self, batch: RollupBatch) -> DbResult<RollupReport> {
            self.transactions.fetch_add(1, Ordering::SeqCst);
            let rows = RollupReport {
                request_rows: batch.request.is_some() as u64,
                api_rows: batch.api.len() as u64,
                flag_rows: batch.flags.len() as u64,
                user_rows: batch.users.len() as u64,
                errors: if self.fail_sub {
                    vec!["request_daily: boom".to_string()]
                } else {
                    Vec::new()
                },
            };
            self.captured.lock().unwrap().push(batch);
            Ok(rows)
        }

        async fn request_daily(&self, _date: NaiveDate) -> DbResult<Option<RequestStatsDaily>> {
            Ok(None)
        }

        async fn request_daily_range(
            &self,
            _from: NaiveDate,
            _to: NaiveDate,
        ) -> DbResult<Vec<RequestStatsDaily>> {
            Ok(Vec::new())
        }

        async fn flags_daily(&self, _date: NaiveDate) -> DbResult<Vec<ContentFlagsDaily>> {
            Ok(Vec::new())
        }

        async fn health_check(&self) -> DbResult<()> {
            Ok(())
        }
    }

    async fn seed_kv(kv: &KvClient) {
        kv.incr_by(StatsKeys::requests_total(), 5).await.unwrap();
        kv.incr_by(StatsKeys::requests_blocked(), 2).await.unwrap();
        kv.incr_by(StatsKeys::requests_cached(), 1).await.unwrap();
        kv.lpush(
            StatsKeys::latency_list(),
            &["10".into(), "20".into(), "30".into(), "40".into()],
        )
        .await
        .unwrap();
        kv.incr_by(&StatsKeys::flag(&Flag::PhoneNumber.to_string()), 3)
            .await
            .unwrap();
        kv.incr_by(&StatsKeys::requests_user("alice"), 4)
            .await
            .unwrap();
        kv.hincr_by(&StatsKeys::api_stats(ApiType::Text), "calls", 2)
            .await
            .unwrap();
        kv.hincr_by(&StatsKeys::api_stats(ApiType::Text), "total_time", 240)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_empty_kv_skips_without_transaction() {
        let kv = Arc::new(KvClient::in_process());
        let store = Arc::new(MockStore::default());
        let aggregator = StatsAggregator::new(kv, Some(store.clone()));

        let outcome = aggregator.run(RunMode::Normal).await;

        assert!(outcome.skipped);
        assert_eq!(outcome.records_processed, 0);
        assert_eq!(store.transactions.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_force_runs_even_when_empty() {
        let kv = Arc::new(KvClient::in_process());
        let store = Arc::new(MockStore::default());
        let aggregator = StatsAggregator::new(kv, Some(store.clone()));

        let outcome = aggregator.run(RunMode::Force).await;

        assert!(!outcome.skipped);
        assert_eq!(store.transactions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_skip_data_check_runs_without_guard_on_empty_kv() {
        let kv = Arc::new(KvClient::in_process());
        let store = Arc::new(MockStore::default());
        let aggregator = StatsAggregator::new(kv, Some(store.clone()));

        let outcome = aggregator.run(RunMode::SkipDataCheck).await;

        // No guard decision is taken: the transaction opens even though
        // there is nothing to fold in.
        assert!(!outcome.skipped);
        assert_eq!(outcome.records_processed, 0);
        assert_eq!(store.transactions.load(Ordering::SeqCst), 1);
        let batches = store.captured.lock().unwrap();
        assert!(batches[0].is_empty());
    }

    #[tokio::test]
    async fn test_skip_data_check_collects_and_resets() {
        let kv = Arc::new(KvClient::in_process());
        seed_kv(&kv).await;
        let store = Arc::new(MockStore::default());
        let aggregator = StatsAggregator::new(Arc::clone(&kv), Some(store.clone()));

        let outcome = aggregator.run(RunMode::SkipDataCheck).await;
        assert!(!outcome.skipped);
        assert!(outcome.is_success());

        // The collected batch matches what a guarded run would build.
        {
            let batches = store.captured.lock().unwrap();
            let request = batches[0].request.as_ref().unwrap();
            assert_eq!(request.total, 5);
            assert_eq!(request.blocked, 2);
            assert_eq!(batches[0].flags.len(), 1);
            assert_eq!(batches[0].users.len(), 1);
            assert_eq!(batches[0].api.len(), 1);
        }

        // Consumed counters reset exactly as in the other modes.
        assert_eq!(kv.get(StatsKeys::requests_total()).await.unwrap(), None);
        assert_eq!(kv.llen(StatsKeys::latency_list()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_no_store_skips() {
        let aggregator = StatsAggregator::new(Arc::new(KvClient::in_process()), None);
        let outcome = aggregator.run(RunMode::Normal).await;
        assert!(outcome.skipped);
        assert!(outcome.reason.unwrap().contains("not configured"));
    }

    #[tokio::test]
    async fn test_batch_reflects_kv_state() {
        let kv = Arc::new(KvClient::in_process());
        seed_kv(&kv).await;
        let store = Arc::new(MockStore::default());
        let aggregator = StatsAggregator::new(Arc::clone(&kv), Some(store.clone()));

        let outcome = aggregator.run(RunMode::Normal).await;
        assert!(!outcome.skipped);
        assert!(outcome.is_success());

        let batches = store.captured.lock().unwrap();
        let batch = &batches[0];

        let request = batch.request.as_ref().unwrap();
        assert_eq!(request.total, 5);
        assert_eq!(request.blocked, 2);
        assert_eq!(request.cached, 1);
        assert!((request.avg_ms - 25.0).abs() < 1e-9);
        assert!((request.p95_ms - 40.0).abs() < 1e-9);

        assert_eq!(
            batch.flags,
            vec![FlagDelta {
                flag: "phone_number".to_string(),
                count: 3,
            }]
        );
        assert_eq!(
            batch.users,
            vec![UserDelta {
                user_id: "alice".to_string(),
                count: 4,
            }]
        );
        assert_eq!(
            batch.api,
            vec![ApiDelta {
                api: ApiType::Text,
                calls: 2,
                errors: 0,
                total_time_ms: 240,
            }]
        );
        assert_eq!(batch.hour.minute(), 0);
        assert_eq!(batch.hour.second(), 0);
    }

    #[tokio::test]
    async fn test_successful_run_resets_counters() {
        let kv = Arc::new(KvClient::in_process());
        seed_kv(&kv).await;
        let store = Arc::new(MockStore::default());
        let aggregator = StatsAggregator::new(Arc::clone(&kv), Some(store.clone()));

        aggregator.run(RunMode::Normal).await;

        assert_eq!(kv.get(StatsKeys::requests_total()).await.unwrap(), None);
        assert_eq!(kv.llen(StatsKeys::latency_list()).await.unwrap(), 0);
        assert_eq!(
            kv.get(&StatsKeys::flag("phone_number")).await.unwrap(),
            None
        );
        assert!(
            kv.hgetall(&StatsKeys::api_stats(ApiType::Text))
                .await
                .unwrap()
                .is_empty()
        );

        // A second run over the now-empty KV is a no-op: idempotence under
        // the reset-counters policy.
        let outcome = aggregator.run(RunMode::Normal).await;
        assert!(outcome.skipped);
        assert_eq!(store.transactions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_partial_failure_keeps_counters() {
        let kv = Arc::new(KvClient::in_process());
        seed_kv(&kv).await;
        let store = Arc::new(MockStore {
            fail_sub: true,
            ..Default::default()
        });
        let aggregator = StatsAggregator::new(Arc::clone(&kv), Some(store.clone()));

        let outcome = aggregator.run(RunMode::Normal).await;
        assert!(!outcome.skipped);
        assert!(!outcome.is_success());
        assert_eq!(outcome.errors.len(), 1);

        // Counters survive for the next run.
        assert_eq!(
            kv.get(StatsKeys::requests_total()).await.unwrap(),
            Some("5".to_string())
        );
    }

    #[test]
    fn test_percentile_95() {
        assert_eq!(percentile_95(&[]), 0.0);
        assert_eq!(percentile_95(&[7]), 7.0);
        let samples: Vec<u64> = (1..=100).collect();
        assert_eq!(percentile_95(&samples), 95.0);
        assert_eq!(mean(&[10, 20, 30, 40]), 25.0);
    }
}
