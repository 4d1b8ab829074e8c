//! SQLite roll-up store.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::{
    Acquire, Row, Sqlite, SqlitePool, Transaction,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
};

use super::{
    error::DbResult,
    store::{
        ApiDelta, FlagDelta, RequestDelta, RollupBatch, RollupReport, StatsStore, UserDelta,
    },
};
use crate::{
    config::SqliteConfig,
    models::{ContentFlagsDaily, RequestStatsDaily},
};

const MIGRATIONS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS request_stats_daily (
        date TEXT PRIMARY KEY,
        total_requests INTEGER NOT NULL DEFAULT 0,
        filtered_requests INTEGER NOT NULL DEFAULT 0,
        blocked_requests INTEGER NOT NULL DEFAULT 0,
        cached_requests INTEGER NOT NULL DEFAULT 0,
        avg_response_time_ms REAL NOT NULL DEFAULT 0,
        p95_response_time_ms REAL NOT NULL DEFAULT 0,
        updated_at TEXT
    )",
    "CREATE TABLE IF NOT EXISTS api_performance_hourly (
        timestamp TEXT NOT NULL,
        api_type TEXT NOT NULL,
        total_calls INTEGER NOT NULL DEFAULT 0,
        error_calls INTEGER NOT NULL DEFAULT 0,
        avg_response_time_ms REAL NOT NULL DEFAULT 0,
        PRIMARY KEY (timestamp, api_type)
    )",
    "CREATE TABLE IF NOT EXISTS content_flags_daily (
        date TEXT NOT NULL,
        flag_name TEXT NOT NULL,
        count INTEGER NOT NULL DEFAULT 0,
        updated_at TEXT,
        PRIMARY KEY (date, flag_name)
    )",
    "CREATE TABLE IF NOT EXISTS user_activity_daily (
        date TEXT NOT NULL,
        user_id TEXT NOT NULL,
        request_count INTEGER NOT NULL DEFAULT 0,
        blocked_count INTEGER NOT NULL DEFAULT 0,
        updated_at TEXT,
        PRIMARY KEY (date, user_id)
    )",
];

pub struct SqliteStatsStore {
    pool: SqlitePool,
}

impl SqliteStatsStore {
    pub async fn connect(config: &SqliteConfig) -> DbResult<Self> {
        let options = SqliteConnectOptions::from_str(&config.path)
            .map_err(sqlx::Error::from)?
            .create_if_missing(config.create_if_missing);
        let pool = SqlitePoolOptions::new().connect_with(options).await?;
        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Wrap an existing pool (tests).
    pub async fn from_pool(pool: SqlitePool) -> DbResult<Self> {
        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> DbResult<()> {
        for statement in MIGRATIONS {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn upsert_request_daily(
        tx: &mut Transaction<'_, Sqlite>,
        date: NaiveDate,
        delta: &RequestDelta,
        now: DateTime<Utc>,
    ) -> DbResult<u64> {
        let filtered = delta.total - delta.blocked;
        let rows = sqlx::query(
            r#"
            INSERT INTO request_stats_daily
                (date, total_requests, filtered_requests, blocked_requests, cached_requests,
                 avg_response_time_ms, p95_response_time_ms, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(date) DO UPDATE SET
                avg_response_time_ms = CASE
                    WHEN request_stats_daily.total_requests + excluded.total_requests > 0 THEN
                        (request_stats_daily.avg_response_time_ms * request_stats_daily.total_requests
                         + excluded.avg_response_time_ms * excluded.total_requests)
                        / (request_stats_daily.total_requests + excluded.total_requests)
                    ELSE 0 END,
                p95_response_time_ms = CASE
                    WHEN excluded.p95_response_time_ms > 0 THEN excluded.p95_response_time_ms
                    ELSE request_stats_daily.p95_response_time_ms END,
                total_requests = request_stats_daily.total_requests + excluded.total_requests,
                filtered_requests = request_stats_daily.filtered_requests + excluded.filtered_requests,
                blocked_requests = request_stats_daily.blocked_requests + excluded.blocked_requests,
                cached_requests = request_stats_daily.cached_requests + excluded.cached_requests,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(date)
        .bind(delta.total)
        .bind(filtered)
        .bind(delta.blocked)
        .bind(delta.cached)
        .bind(delta.avg_ms)
        .bind(delta.p95_ms)
        .bind(now)
        .execute(&mut **tx)
        .await?
        .rows_affected();
        Ok(rows)
    }

    async fn upsert_api_hourly(
        tx: &mut Transaction<'_, Sqlite>,
        hour: DateTime<Utc>,
        delta: &ApiDelta,
    ) -> DbResult<u64> {
        let avg_ms = if delta.calls > 0 {
            delta.total_time_ms as f64 / delta.calls as f64
        } else {
            0.0
        };
        let rows = sqlx::query(
            r#"
            INSERT INTO api_performance_hourly
                (timestamp, api_type, total_calls, error_calls, avg_response_time_ms)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(timestamp, api_type) DO UPDATE SET
                avg_response_time_ms = CASE
                    WHEN api_performance_hourly.total_calls + excluded.total_calls > 0 THEN
                        (api_performance_hourly.avg_response_time_ms * api_performance_hourly.total_calls
                         + excluded.avg_response_time_ms * excluded.total_calls)
                        / (api_performance_hourly.total_calls + excluded.total_calls)
                    ELSE 0 END,
                total_calls = api_performance_hourly.total_calls + excluded.total_calls,
                error_calls = api_performance_hourly.error_calls + excluded.error_calls
            "#,
        )
        .bind(hour)
        .bind(delta.api.as_str())
        .bind(delta.calls)
        .bind(delta.errors)
        .bind(avg_ms)
        .execute(&mut **tx)
        .await?
        .rows_affected();
        Ok(rows)
    }

    async fn upsert_flag_daily(
        tx: &mut Transaction<'_, Sqlite>,
        date: NaiveDate,
        delta: &FlagDelta,
        now: DateTime<Utc>,
    ) -> DbResult<u64> {
        let rows = sqlx::query(
            r#"
            INSERT INTO content_flags_daily (date, flag_name, count, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(date, flag_name) DO UPDATE SET
                count = content_flags_daily.count + excluded.count,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(date)
        .bind(&delta.flag)
        .bind(delta.count)
        .bind(now)
        .execute(&mut **tx)
        .await?
        .rows_affected();
        Ok(rows)
    }

    /// `blocked_count` is deliberately not in the UPDATE list: the KV side
    /// does not track per-user blocks, so an existing value is preserved.
    async fn upsert_user_daily(
        tx: &mut Transaction<'_, Sqlite>,
        date: NaiveDate,
        delta: &UserDelta,
        now: DateTime<Utc>,
    ) -> DbResult<u64> {
        let rows = sqlx::query(
            r#"
            INSERT INTO user_activity_daily (date, user_id, request_count, blocked_count, updated_at)
            VALUES (?1, ?2, ?3, 0, ?4)
            ON CONFLICT(date, user_id) DO UPDATE SET
                request_count = user_activity_daily.request_count + excluded.request_count,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(date)
        .bind(&delta.user_id)
        .bind(delta.count)
        .bind(now)
        .execute(&mut **tx)
        .await?
        .rows_affected();
        Ok(rows)
    }

    fn row_to_daily(row: &sqlx::sqlite::SqliteRow) -> DbResult<RequestStatsDaily> {
        Ok(RequestStatsDaily {
            date: row.try_get("date")?,
            total_requests: row.try_get("total_requests")?,
            filtered_requests: row.try_get("filtered_requests")?,
            blocked_requests: row.try_get("blocked_requests")?,
            cached_requests: row.try_get("cached_requests")?,
            avg_response_time_ms: row.try_get("avg_response_time_ms")?,
            p95_response_time_ms: row.try_get("p95_response_time_ms")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[async_trait]
impl StatsStore for SqliteStatsStore {
    async fn apply_rollups(&self, batch: RollupBatch) -> DbResult<RollupReport> {
        let mut report = RollupReport::default();
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        if let Some(request) = &batch.request {
            let result = async {
                let mut sp = tx.begin().await?;
                let rows = Self::upsert_request_daily(&mut sp, batch.date, request, now).await?;
                sp.commit().await?;
                Ok::<u64, super::DbError>(rows)
            }
            .await;
            match result {
                Ok(rows) => report.request_rows = rows,
                Err(e) => report.errors.push(format!("request_daily: {}", e)),
            }
        }

        if !batch.api.is_empty() {
            let result = async {
                let mut sp = tx.begin().await?;
                let mut rows = 0;
                for delta in &batch.api {
                    rows += Self::upsert_api_hourly(&mut sp, batch.hour, delta).await?;
                }
                sp.commit().await?;
                Ok::<u64, super::DbError>(rows)
            }
            .await;
            match result {
                Ok(rows) => report.api_rows = rows,
                Err(e) => report.errors.push(format!("api_hourly: {}", e)),
            }
        }

        if !batch.flags.is_empty() {
            let result = async {
                let mut sp = tx.begin().await?;
                let mut rows = 0;
                for delta in &batch.flags {
                    rows += Self::upsert_flag_daily(&mut sp, batch.date, delta, now).await?;
                }
                sp.commit().await?;
                Ok::<u64, super::DbError>(rows)
            }
            .await;
            match result {
                Ok(rows) => report.flag_rows = rows,
                Err(e) => report.errors.push(format!("content_flags_daily: {}", e)),
            }
        }

        if !batch.users.is_empty() {
            let result = async {
                let mut sp = tx.begin().await?;
                let mut rows = 0;
                for delta in &batch.users {
                    rows += Self::upsert_user_daily(&mut sp, batch.date, delta, now).await?;
                }
                sp.commit().await?;
                Ok::<u64, super::DbError>(rows)
            }
            .await;
            match result {
                Ok(rows) => report.user_rows = rows,
                Err(e) => report.errors.push(format!("user_activity_daily: {}", e)),
            }
        }

        tx.commit().await?;
        Ok(report)
    }

    async fn request_daily(&self, date: NaiveDate) -> DbResult<Option<RequestStatsDaily>> {
        let row = sqlx::query(
            "SELECT date, total_requests, filtered_requests, blocked_requests, cached_requests, \
             avg_response_time_ms, p95_response_time_ms, updated_at \
             FROM request_stats_daily WHERE date = ?1",
        )
        .bind(date)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_daily).transpose()
    }

    async fn request_daily_range(
        &self,
        from: NaiveDate,
        to: NaiveDate,
    ) -> DbResult<Vec<RequestStatsDaily>> {
        let rows = sqlx::query(
            "SELECT date, total_requests, filtered_requests, blocked_requests, cached_requests, \
             avg_response_time_ms, p95_response_time_ms, updated_at \
             FROM request_stats_daily WHERE date >= ?1 AND date <= ?2 ORDER BY date",
        )
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_daily).collect()
    }

    async fn flags_daily(&self, date: NaiveDate) -> DbResult<Vec<ContentFlagsDaily>> {
        let rows = sqlx::query(
            "SELECT date, flag_name, count FROM content_flags_daily \
             WHERE date = ?1 ORDER BY count DESC, flag_name",
        )
        .bind(date)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(ContentFlagsDaily {
                    date: row.try_get("date")?,
                    flag_name: row.try_get("flag_name")?,
                    count: row.try_get("count")?,
                })
            })
            .collect()
    }

    async fn health_check(&self) -> DbResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Timelike};

    use super::*;
    use crate::models::ApiType;

    async fn store() -> SqliteStatsStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(":memory:")
            .await
            .unwrap();
        SqliteStatsStore::from_pool(pool).await.unwrap()
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 2, 14).unwrap()
    }

    fn hour() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 14, 9, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_request_daily_insert_then_accumulate() {
        let store = store().await;

        // Preload an existing row.
        store
            .apply_rollups(RollupBatch {
                date: date(),
                hour: hour(),
                request: Some(RequestDelta {
                    total: 10,
                    blocked: 3,
                    cached: 2,
                    avg_ms: 100.0,
                    p95_ms: 200.0,
                }),
                ..Default::default()
            })
            .await
            .unwrap();

        // Apply the delta; counters must accumulate, not overwrite.
        let report = store
            .apply_rollups(RollupBatch {
                date: date(),
                hour: hour(),
                request: Some(RequestDelta {
                    total: 5,
                    blocked: 2,
                    cached: 1,
                    avg_ms: 40.0,
                    p95_ms: 90.0,
                }),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(report.is_success());

        let row = store.request_daily(date()).await.unwrap().unwrap();
        assert_eq!(row.total_requests, 15);
        assert_eq!(row.blocked_requests, 5);
        assert_eq!(row.cached_requests, 3);
        assert_eq!(row.filtered_requests, 10);
        // Weighted average: (100*10 + 40*5) / 15 = 80.
        assert!((row.avg_response_time_ms - 80.0).abs() < 1e-9);
        assert!((row.p95_response_time_ms - 90.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_accumulation_is_monotone() {
        let store = store().await;
        let mut previous = 0;
        for _ in 0..3 {
            store
                .apply_rollups(RollupBatch {
                    date: date(),
                    hour: hour(),
                    request: Some(RequestDelta {
                        total: 7,
                        ..Default::default()
                    }),
                    ..Default::default()
                })
                .await
                .unwrap();
            let total = store
                .request_daily(date())
                .await
                .unwrap()
                .unwrap()
                .total_requests;
            assert!(total >= previous);
            previous = total;
        }
        assert_eq!(previous, 21);
    }

    #[tokio::test]
    async fn test_api_hourly_weighted_average() {
        let store = store().await;

        let batch = |calls: i64, total_time: i64, errors: i64| RollupBatch {
            date: date(),
            hour: hour(),
            api: vec![ApiDelta {
                api: ApiType::Text,
                calls,
                errors,
                total_time_ms: total_time,
            }],
            ..Default::default()
        };

        // 10 calls averaging 100ms, then 5 calls averaging 40ms.
        store.apply_rollups(batch(10, 1000, 1)).await.unwrap();
        store.apply_rollups(batch(5, 200, 0)).await.unwrap();

        let row = sqlx::query(
            "SELECT total_calls, error_calls, avg_response_time_ms \
             FROM api_performance_hourly WHERE api_type = 'text'",
        )
        .fetch_one(&store.pool)
        .await
        .unwrap();

        let total: i64 = row.try_get("total_calls").unwrap();
        let errors: i64 = row.try_get("error_calls").unwrap();
        let avg: f64 = row.try_get("avg_response_time_ms").unwrap();
        assert_eq!(total, 15);
        assert_eq!(errors, 1);
        assert!((avg - 80.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_flags_accumulate() {
        let store = store().await;
        let batch = |count: i64| RollupBatch {
            date: date(),
            hour: hour(),
            flags: vec![FlagDelta {
                flag: "phone_number".to_string(),
                count,
            }],
            ..Default::default()
        };

        store.apply_rollups(batch(3)).await.unwrap();
        store.apply_rollups(batch(4)).await.unwrap();

        let flags = store.flags_daily(date()).await.unwrap();
        assert_eq!(flags.len(), 1);
        assert_eq!(flags[0].flag_name, "phone_number");
        assert_eq!(flags[0].count, 7);
    }

    #[tokio::test]
    async fn test_user_blocked_count_preserved() {
        let store = store().await;

        // Seed a row with a hand-set blocked_count.
        sqlx::query(
            "INSERT INTO user_activity_daily (date, user_id, request_count, blocked_count) \
             VALUES (?1, 'alice', 4, 9)",
        )
        .bind(date())
        .execute(&store.pool)
        .await
        .unwrap();

        store
            .apply_rollups(RollupBatch {
                date: date(),
                hour: hour(),
                users: vec![UserDelta {
                    user_id: "alice".to_string(),
                    count: 6,
                }],
                ..Default::default()
            })
            .await
            .unwrap();

        let row = sqlx::query(
            "SELECT request_count, blocked_count FROM user_activity_daily WHERE user_id = 'alice'",
        )
        .fetch_one(&store.pool)
        .await
        .unwrap();
        let requests: i64 = row.try_get("request_count").unwrap();
        let blocked: i64 = row.try_get("blocked_count").unwrap();
        assert_eq!(requests, 10);
        assert_eq!(blocked, 9);
    }

    #[tokio::test]
    async fn test_hour_buckets_are_distinct_per_api_type() {
        let store = store().await;
        store
            .apply_rollups(RollupBatch {
                date: date(),
                hour: hour(),
                api: vec![
                    ApiDelta {
                        api: ApiType::Text,
                        calls: 1,
                        errors: 0,
                        total_time_ms: 50,
                    },
                    ApiDelta {
                        api: ApiType::Image,
                        calls: 2,
                        errors: 1,
                        total_time_ms: 400,
                    },
                ],
                ..Default::default()
            })
            .await
            .unwrap();

        let rows = sqlx::query("SELECT api_type FROM api_performance_hourly")
            .fetch_all(&store.pool)
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(hour().minute(), 0);
    }

    #[tokio::test]
    async fn test_empty_batch_commits_cleanly() {
        let store = store().await;
        let report = store
            .apply_rollups(RollupBatch {
                date: date(),
                hour: hour(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(report.records_processed(), 0);
        assert!(report.is_success());
    }
}
