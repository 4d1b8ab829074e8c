//! Durable storage for statistics roll-ups.

mod error;
#[cfg(feature = "database-postgres")]
pub mod postgres;
#[cfg(feature = "database-sqlite")]
pub mod sqlite;
mod store;

use std::sync::Arc;

pub use error::{DbError, DbResult};
pub use store::{
    ApiDelta, FlagDelta, RequestDelta, RollupBatch, RollupReport, StatsStore, UserDelta,
};

use crate::config::DatabaseConfig;

/// Handle to the configured roll-up store.
pub struct DbPool {
    stats: Arc<dyn StatsStore>,
}

impl DbPool {
    /// Connect per configuration. `Ok(None)` when no durable store is
    /// configured.
    pub async fn from_config(config: &DatabaseConfig) -> DbResult<Option<Self>> {
        match config {
            DatabaseConfig::None => Ok(None),

            #[cfg(feature = "database-sqlite")]
            DatabaseConfig::Sqlite(c) => {
                let store = sqlite::SqliteStatsStore::connect(c).await?;
                Ok(Some(Self {
                    stats: Arc::new(store),
                }))
            }

            #[cfg(feature = "database-postgres")]
            DatabaseConfig::Postgres(c) => {
                let store = postgres::PostgresStatsStore::connect(c).await?;
                Ok(Some(Self {
                    stats: Arc::new(store),
                }))
            }

            #[allow(unreachable_patterns)]
            _ => Err(DbError::Internal(
                "configured database backend is not compiled into this build".to_string(),
            )),
        }
    }

    pub fn stats(&self) -> Arc<dyn StatsStore> {
        Arc::clone(&self.stats)
    }

    pub async fn health_check(&self) -> DbResult<()> {
        self.stats.health_check().await
    }
}
