//! Aggregate statistics read path.
//!
//! Database-first: the durable roll-ups serve the requested window, with
//! the live KV counters merged in for the still-open day that no
//! aggregation run has folded yet. When no durable store is configured
//! (or it is unreachable) the KV counters alone serve the summary; when
//! both sides are out, a zeroed summary marks itself `fallback`.

use std::sync::Arc;

use chrono::{NaiveDate, Utc};

use crate::{
    db::{DbResult, StatsStore},
    kv::{KvClient, KvResult, KvStore},
    models::{FlagCount, StatsSummary, SummarySource},
    stats::StatsKeys,
};

pub struct SummaryService {
    kv: Arc<KvClient>,
    store: Option<Arc<dyn StatsStore>>,
}

impl SummaryService {
    pub fn new(kv: Arc<KvClient>, store: Option<Arc<dyn StatsStore>>) -> Self {
        Self { kv, store }
    }

    /// Summarise the requested window (today when omitted).
    pub async fn summary(&self, range: Option<(NaiveDate, NaiveDate)>) -> StatsSummary {
        let today = Utc::now().date_naive();
        let (from, to) = range.unwrap_or((today, today));

        if let Some(store) = &self.store {
            match self.from_database(store, from, to, today).await {
                Ok(summary) => return summary,
                Err(e) => {
                    tracing::warn!(error = %e, "Durable summary failed, falling back to KV");
                }
            }
        }

        match self.from_kv().await {
            Ok(summary) => summary,
            Err(e) => {
                tracing::warn!(error = %e, "KV summary failed, returning empty fallback");
                StatsSummary::empty(SummarySource::Fallback)
            }
        }
    }

    async fn from_database(
        &self,
        store: &Arc<dyn StatsStore>,
        from: NaiveDate,
        to: NaiveDate,
        today: NaiveDate,
    ) -> DbResult<StatsSummary> {
        let rows = store.request_daily_range(from, to).await?;

        let mut summary = StatsSummary::empty(SummarySource::Database);
        let mut weighted_avg = 0.0;
        for row in &rows {
            summary.total_requests += row.total_requests;
            summary.blocked_requests += row.blocked_requests;
            summary.cached_requests += row.cached_requests;
            weighted_avg += row.avg_response_time_ms * row.total_requests as f64;
            summary.p95_response_time_ms =
                summary.p95_response_time_ms.max(row.p95_response_time_ms);
        }
        if summary.total_requests > 0 {
            summary.avg_response_time_ms = weighted_avg / summary.total_requests as f64;
        }

        summary.flags = store
            .flags_daily(to)
            .await?
            .into_iter()
            .map(|row| FlagCount {
                flag: row.flag_name,
                count: row.count,
            })
            .collect();

        // The open day's counters have not been aggregated yet; merge them
        // in best-effort so "today" reads fresh.
        if to >= today
            && let Ok(live) = self.from_kv().await
        {
            summary.total_requests += live.total_requests;
            summary.blocked_requests += live.blocked_requests;
            summary.cached_requests += live.cached_requests;
            for live_flag in live.flags {
                match summary.flags.iter_mut().find(|f| f.flag == live_flag.flag) {
                    Some(existing) => existing.count += live_flag.count,
                    None => summary.flags.push(live_flag),
                }
            }
        }

        Ok(summary)
    }

    async fn from_kv(&self) -> KvResult<StatsSummary> {
        let counters = self
            .kv
            .mget(&[
                StatsKeys::requests_total().to_string(),
                StatsKeys::requests_blocked().to_string(),
                StatsKeys::requests_cached().to_string(),
            ])
            .await?;
        let counter =
            |i: usize| -> i64 { counters.get(i).and_then(|v| v.as_deref()).and_then(|v| v.parse().ok()).unwrap_or(0) };

        let samples: Vec<u64> = self
            .kv
            .lrange(StatsKeys::latency_list(), 0, -1)
            .await?
            .iter()
            .filter_map(|s| s.parse().ok())
            .collect();
        let (avg, p95) = latency_stats(&samples);

        let flag_keys = self.kv.keys(StatsKeys::flag_pattern()).await?;
        let mut flags = Vec::new();
        if !flag_keys.is_empty() {
            let values = self.kv.mget(&flag_keys).await?;
            for (key, value) in flag_keys.iter().zip(values) {
                let count: i64 = value.as_deref().and_then(|v| v.parse().ok()).unwrap_or(0);
                if count > 0
                    && let Some(flag) = StatsKeys::flag_name(key)
                {
                    flags.push(FlagCount {
                        flag: flag.to_string(),
                        count,
                    });
                }
            }
            flags.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.flag.cmp(&b.flag)));
        }

        Ok(StatsSummary {
            total_requests: counter(0),
            blocked_requests: counter(1),
            cached_requests: counter(2),
            avg_response_time_ms: avg,
            p95_response_time_ms: p95,
            flags,
            data_source: SummarySource::Redis,
        })
    }
}

fn latency_stats(samples: &[u64]) -> (f64, f64) {
    if samples.is_empty() {
        return (0.0, 0.0);
    }
    let avg = samples.iter().sum::<u64>() as f64 / samples.len() as f64;
    let mut sorted = samples.to_vec();
    sorted.sort_unstable();
    let rank = ((sorted.len() as f64) * 0.95).ceil() as usize;
    let p95 = sorted[rank.clamp(1, sorted.len()) - 1] as f64;
    (avg, p95)
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::{
        db::{RollupBatch, RollupReport},
        models::{ContentFlagsDaily, RequestStatsDaily},
    };

    struct CannedStore {
        rows: Vec<RequestStatsDaily>,
        flags: Vec<ContentFlagsDaily>,
    }

    #[async_trait]
    impl StatsStore for CannedStore {
        async fn apply_rollups(&self, _batch: RollupBatch) -> DbResult<RollupReport> {
            Ok(RollupReport::default())
        }

        async fn request_daily(&self, date: NaiveDate) -> DbResult<Option<RequestStatsDaily>> {
            Ok(self.rows.iter().find(|r| r.date == date).cloned())
        }

        async fn request_daily_range(
            &self,
            from: NaiveDate,
            to: NaiveDate,
        ) -> DbResult<Vec<RequestStatsDaily>> {
            Ok(self
                .rows
                .iter()
                .filter(|r| r.date >= from && r.date <= to)
                .cloned()
                .collect())
        }

        async fn flags_daily(&self, date: NaiveDate) -> DbResult<Vec<ContentFlagsDaily>> {
            Ok(self.flags.iter().filter(|f| f.date == date).cloned().collect())
        }

        async fn health_check(&self) -> DbResult<()> {
            Ok(())
        }
    }

    fn daily(date: NaiveDate, total: i64, blocked: i64, avg: f64) -> RequestStatsDaily {
        RequestStatsDaily {
            date,
            total_requests: total,
            filtered_requests: total - blocked,
            blocked_requests: blocked,
            cached_requests: 0,
            avg_response_time_ms: avg,
            p95_response_time_ms: avg * 2.0,
            updated_at: None,
        }
    }

    #[tokio::test]
    async fn test_kv_only_summary() {
        let kv = Arc::new(KvClient::in_process());
        kv.incr_by(StatsKeys::requests_total(), 7).await.unwrap();
        kv.incr_by(StatsKeys::requests_blocked(), 2).await.unwrap();
        kv.incr_by(&StatsKeys::flag("nsfw"), 3).await.unwrap();
        kv.lpush(StatsKeys::latency_list(), &["10".into(), "30".into()])
            .await
            .unwrap();

        let service = SummaryService::new(kv, None);
        let summary = service.summary(None).await;

        assert_eq!(summary.data_source, SummarySource::Redis);
        assert_eq!(summary.total_requests, 7);
        assert_eq!(summary.blocked_requests, 2);
        assert_eq!(summary.flags.len(), 1);
        assert_eq!(summary.flags[0].flag, "nsfw");
        assert!((summary.avg_response_time_ms - 20.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_database_first_with_live_merge() {
        let today = Utc::now().date_naive();
        let kv = Arc::new(KvClient::in_process());
        kv.incr_by(StatsKeys::requests_total(), 5).await.unwrap();
        kv.incr_by(&StatsKeys::flag("nsfw"), 1).await.unwrap();

        let store: Arc<dyn StatsStore> = Arc::new(CannedStore {
            rows: vec![daily(today, 100, 10, 50.0)],
            flags: vec![ContentFlagsDaily {
                date: today,
                flag_name: "nsfw".to_string(),
                count: 8,
            }],
        });

        let service = SummaryService::new(kv, Some(store));
        let summary = service.summary(None).await;

        assert_eq!(summary.data_source, SummarySource::Database);
        // 100 aggregated + 5 live.
        assert_eq!(summary.total_requests, 105);
        assert_eq!(summary.flags[0].count, 9);
    }

    #[tokio::test]
    async fn test_past_range_skips_live_merge() {
        let today = Utc::now().date_naive();
        let past = today.pred_opt().unwrap().pred_opt().unwrap();
        let kv = Arc::new(KvClient::in_process());
        kv.incr_by(StatsKeys::requests_total(), 5).await.unwrap();

        let store: Arc<dyn StatsStore> = Arc::new(CannedStore {
            rows: vec![daily(past, 40, 4, 25.0)],
            flags: Vec::new(),
        });

        let service = SummaryService::new(kv, Some(store));
        let summary = service.summary(Some((past, past))).await;

        assert_eq!(summary.data_source, SummarySource::Database);
        assert_eq!(summary.total_requests, 40);
    }

    #[tokio::test]
    async fn test_weighted_average_across_days() {
        let today = Utc::now().date_naive();
        let yesterday = today.pred_opt().unwrap();

        let store: Arc<dyn StatsStore> = Arc::new(CannedStore {
            rows: vec![daily(yesterday, 10, 0, 100.0), daily(today, 30, 0, 20.0)],
            flags: Vec::new(),
        });

        let service = SummaryService::new(Arc::new(KvClient::in_process()), Some(store));
        let summary = service.summary(Some((yesterday, today))).await;

        // (100*10 + 20*30) / 40 = 40.
        assert!((summary.avg_response_time_ms - 40.0).abs() < 1e-9);
        assert!((summary.p95_response_time_ms - 200.0).abs() < 1e-9);
    }
}
