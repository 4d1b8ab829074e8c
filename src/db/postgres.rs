//! PostgreSQL roll-up store.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::{
    Acquire, PgPool, Postgres, Row, Transaction,
    postgres::PgPoolOptions,
};

use super::{
    error::DbResult,
    store::{
        ApiDelta, FlagDelta, RequestDelta, RollupBatch, RollupReport, StatsStore, UserDelta,
    },
};
use crate::{
    config::PostgresConfig,
    models::{ContentFlagsDaily, RequestStatsDaily},
};

const MIGRATIONS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS request_stats_daily (
        date DATE PRIMARY KEY,
        total_requests BIGINT NOT NULL DEFAULT 0,
        filtered_requests BIGINT NOT NULL DEFAULT 0,
        blocked_requests BIGINT NOT NULL DEFAULT 0,
        cached_requests BIGINT NOT NULL DEFAULT 0,
        avg_response_time_ms DOUBLE PRECISION NOT NULL DEFAULT 0,
        p95_response_time_ms DOUBLE PRECISION NOT NULL DEFAULT 0,
        updated_at TIMESTAMPTZ
    )",
    "CREATE TABLE IF NOT EXISTS api_performance_hourly (
        timestamp TIMESTAMPTZ NOT NULL,
        api_type TEXT NOT NULL,
        total_calls BIGINT NOT NULL DEFAULT 0,
        error_calls BIGINT NOT NULL DEFAULT 0,
        avg_response_time_ms DOUBLE PRECISION NOT NULL DEFAULT 0,
        PRIMARY KEY (timestamp, api_type)
    )",
    "CREATE TABLE IF NOT EXISTS content_flags_daily (
        date DATE NOT NULL,
        flag_name TEXT NOT NULL,
        count BIGINT NOT NULL DEFAULT 0,
        updated_at TIMESTAMPTZ,
        PRIMARY KEY (date, flag_name)
    )",
    "CREATE TABLE IF NOT EXISTS user_activity_daily (
        date DATE NOT NULL,
        user_id TEXT NOT NULL,
        request_count BIGINT NOT NULL DEFAULT 0,
        blocked_count BIGINT NOT NULL DEFAULT 0,
        updated_at TIMESTAMPTZ,
        PRIMARY KEY (date, user_id)
    )",
];

pub struct PostgresStatsStore {
    pool: PgPool,
}

impl PostgresStatsStore {
    pub async fn connect(config: &PostgresConfig) -> DbResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.url)
            .await?;
        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Wrap an existing pool (tests).
    pub async fn from_pool(pool: PgPool) -> DbResult<Self> {
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
        tx: &mut Transaction<'_, Postgres>,
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
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (date) DO UPDATE SET
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
        tx: &mut Transaction<'_, Postgres>,
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
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (timestamp, api_type) DO UPDATE SET
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
        tx: &mut Transaction<'_, Postgres>,
        date: NaiveDate,
        delta: &FlagDelta,
        now: DateTime<Utc>,
    ) -> DbResult<u64> {
        let rows = sqlx::query(
            r#"
            INSERT INTO content_flags_daily (date, flag_name, count, updated_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (date, flag_name) DO UPDATE SET
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
        tx: &mut Transaction<'_, Postgres>,
        date: NaiveDate,
        delta: &UserDelta,
        now: DateTime<Utc>,
    ) -> DbResult<u64> {
        let rows = sqlx::query(
            r#"
            INSERT INTO user_activity_daily (date, user_id, request_count, blocked_count, updated_at)
            VALUES ($1, $2, $3, 0, $4)
            ON CONFLICT (date, user_id) DO UPDATE SET
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

    fn row_to_daily(row: &sqlx::postgres::PgRow) -> DbResult<RequestStatsDaily> {
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
impl StatsStore for PostgresStatsStore {
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
             FROM request_stats_daily WHERE date = $1",
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
             FROM request_stats_daily WHERE date >= $1 AND date <= $2 ORDER BY date",
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
             WHERE date = $1 ORDER BY count DESC, flag_name",
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
