//! Shared KV client with in-process fallback.
//!
//! The primary backend is an external Redis instance (feature `redis`);
//! the secondary is a process-local map. Reads try primary then fallback;
//! writes go to whichever backend is live. A `ready` flag tracks the
//! primary's health: it is set by the connect path, cleared when a command
//! fails at the connection level, and refreshed by health checks.

mod error;
mod memory;
#[cfg(feature = "redis")]
mod redis;
mod store;

use std::{
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use async_trait::async_trait;
pub use error::{KvError, KvResult};
pub use memory::MemoryKv;
#[cfg(feature = "redis")]
pub use redis::RedisKv;
pub use store::{KvOp, KvReply, KvStore};

use crate::config::KvConfig;

/// Maximum connect attempts before falling back to the in-process store.
#[cfg(feature = "redis")]
const CONNECT_ATTEMPTS: u32 = 3;

/// Base delay for connect backoff; doubles per attempt, capped at 2 s.
#[cfg(feature = "redis")]
const CONNECT_BACKOFF_BASE: Duration = Duration::from_millis(200);

pub struct KvClient {
    primary: Option<Box<dyn KvStore>>,
    fallback: MemoryKv,
    ready: AtomicBool,
}

impl KvClient {
    /// Connect to the configured primary, retrying with bounded backoff.
    ///
    /// A missing URL or an unreachable primary yields a client that serves
    /// everything from the in-process fallback; the primary (if
    /// constructed) can still recover via [`KvClient::health_check`].
    pub async fn connect(config: &KvConfig) -> Self {
        #[cfg(feature = "redis")]
        if let Some(url) = &config.url {
            let command_timeout = Duration::from_millis(config.command_timeout_ms);
            let primary = match RedisKv::new(url, command_timeout) {
                Ok(kv) => kv,
                Err(e) => {
                    tracing::warn!(error = %e, "Invalid KV URL, using in-process fallback");
                    return Self::in_process();
                }
            };

            let mut backoff = CONNECT_BACKOFF_BASE;
            for attempt in 1..=CONNECT_ATTEMPTS {
                match primary.ping().await {
                    Ok(()) => {
                        tracing::info!(attempt, "Connected to shared KV store");
                        return Self {
                            primary: Some(Box::new(primary)),
                            fallback: MemoryKv::new(),
                            ready: AtomicBool::new(true),
                        };
                    }
                    Err(e) => {
                        tracing::warn!(attempt, error = %e, "KV connect failed");
                        if attempt < CONNECT_ATTEMPTS {
                            tokio::time::sleep(backoff).await;
                            backoff = (backoff * 2).min(Duration::from_secs(2));
                        }
                    }
                }
            }

            tracing::warn!(
                attempts = CONNECT_ATTEMPTS,
                "Shared KV unreachable, serving from in-process fallback"
            );
            return Self {
                primary: Some(Box::new(primary)),
                fallback: MemoryKv::new(),
                ready: AtomicBool::new(false),
            };
        }

        #[cfg(not(feature = "redis"))]
        let _ = config;

        Self::in_process()
    }

    /// A purely in-process client. Also the test harness entry point.
    pub fn in_process() -> Self {
        Self {
            primary: None,
            fallback: MemoryKv::new(),
            ready: AtomicBool::new(false),
        }
    }

    /// Whether the primary backend is configured at all.
    pub fn has_primary(&self) -> bool {
        self.primary.is_some()
    }

    /// Whether the primary backend is currently believed healthy.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }

    /// Ping the primary and refresh the ready flag.
    pub async fn health_check(&self) -> bool {
        match &self.primary {
            Some(primary) => {
                let healthy = primary.ping().await.is_ok();
                self.ready.store(healthy, Ordering::Relaxed);
                healthy
            }
            None => false,
        }
    }

    fn primary_if_ready(&self) -> Option<&dyn KvStore> {
        if self.ready.load(Ordering::Relaxed) {
            self.primary.as_deref()
        } else {
            None
        }
    }

    fn degrade(&self, error: &KvError, command: &str) {
        if error.is_connection_error() {
            self.ready.store(false, Ordering::Relaxed);
            tracing::warn!(command, error = %error, "KV primary degraded, switching to fallback");
        } else {
            tracing::warn!(command, error = %error, "KV command failed");
        }
    }
}

/// Routes every operation primary-first with silent fallback on
/// connection-level failures. Non-connection errors surface to the caller.
#[async_trait]
impl KvStore for KvClient {
    async fn get(&self, key: &str) -> KvResult<Option<String>> {
        if let Some(primary) = self.primary_if_ready() {
            match primary.get(key).await {
                Ok(value) => return Ok(value),
                Err(e) => self.degrade(&e, "GET"),
            }
        }
        self.fallback.get(key).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> KvResult<()> {
        if let Some(primary) = self.primary_if_ready() {
            match primary.set(key, value, ttl).await {
                Ok(()) => return Ok(()),
                Err(e) => self.degrade(&e, "SET"),
            }
        }
        self.fallback.set(key, value, ttl).await
    }

    async fn del(&self, key: &str) -> KvResult<()> {
        if let Some(primary) = self.primary_if_ready() {
            match primary.del(key).await {
                Ok(()) => return Ok(()),
                Err(e) => self.degrade(&e, "DEL"),
            }
        }
        self.fallback.del(key).await
    }

    async fn incr_by(&self, key: &str, delta: i64) -> KvResult<i64> {
        if let Some(primary) = self.primary_if_ready() {
            match primary.incr_by(key, delta).await {
                Ok(n) => return Ok(n),
                Err(e) => self.degrade(&e, "INCRBY"),
            }
        }
        self.fallback.incr_by(key, delta).await
    }

    async fn mget(&self, keys: &[String]) -> KvResult<Vec<Option<String>>> {
        if let Some(primary) = self.primary_if_ready() {
            match primary.mget(keys).await {
                Ok(values) => return Ok(values),
                Err(e) => self.degrade(&e, "MGET"),
            }
        }
        self.fallback.mget(keys).await
    }

    async fn hgetall(&self, key: &str) -> KvResult<Vec<(String, String)>> {
        if let Some(primary) = self.primary_if_ready() {
            match primary.hgetall(key).await {
                Ok(fields) => return Ok(fields),
                Err(e) => self.degrade(&e, "HGETALL"),
            }
        }
        self.fallback.hgetall(key).await
    }

    async fn hincr_by(&self, key: &str, field: &str, delta: i64) -> KvResult<i64> {
        if let Some(primary) = self.primary_if_ready() {
            match primary.hincr_by(key, field, delta).await {
                Ok(n) => return Ok(n),
                Err(e) => self.degrade(&e, "HINCRBY"),
            }
        }
        self.fallback.hincr_by(key, field, delta).await
    }

    async fn lpush(&self, key: &str, values: &[String]) -> KvResult<i64> {
        if let Some(primary) = self.primary_if_ready() {
            match primary.lpush(key, values).await {
                Ok(n) => return Ok(n),
                Err(e) => self.degrade(&e, "LPUSH"),
            }
        }
        self.fallback.lpush(key, values).await
    }

    async fn ltrim(&self, key: &str, start: i64, stop: i64) -> KvResult<()> {
        if let Some(primary) = self.primary_if_ready() {
            match primary.ltrim(key, start, stop).await {
                Ok(()) => return Ok(()),
                Err(e) => self.degrade(&e, "LTRIM"),
            }
        }
        self.fallback.ltrim(key, start, stop).await
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> KvResult<Vec<String>> {
        if let Some(primary) = self.primary_if_ready() {
            match primary.lrange(key, start, stop).await {
                Ok(values) => return Ok(values),
                Err(e) => self.degrade(&e, "LRANGE"),
            }
        }
        self.fallback.lrange(key, start, stop).await
    }

    async fn llen(&self, key: &str) -> KvResult<i64> {
        if let Some(primary) = self.primary_if_ready() {
            match primary.llen(key).await {
                Ok(n) => return Ok(n),
                Err(e) => self.degrade(&e, "LLEN"),
            }
        }
        self.fallback.llen(key).await
    }

    async fn keys(&self, pattern: &str) -> KvResult<Vec<String>> {
        if let Some(primary) = self.primary_if_ready() {
            match primary.keys(pattern).await {
                Ok(keys) => return Ok(keys),
                Err(e) => self.degrade(&e, "KEYS"),
            }
        }
        self.fallback.keys(pattern).await
    }

    async fn expire_nx(&self, key: &str, ttl: Duration) -> KvResult<bool> {
        if let Some(primary) = self.primary_if_ready() {
            match primary.expire_nx(key, ttl).await {
                Ok(applied) => return Ok(applied),
                Err(e) => self.degrade(&e, "EXPIRE"),
            }
        }
        self.fallback.expire_nx(key, ttl).await
    }

    async fn pipeline(&self, ops: Vec<KvOp>) -> KvResult<Vec<KvReply>> {
        if let Some(primary) = self.primary_if_ready() {
            match primary.pipeline(ops.clone()).await {
                Ok(replies) => return Ok(replies),
                Err(e) => self.degrade(&e, "PIPELINE"),
            }
        }
        self.fallback.pipeline(ops).await
    }

    async fn ping(&self) -> KvResult<()> {
        if let Some(primary) = self.primary_if_ready() {
            match primary.ping().await {
                Ok(()) => return Ok(()),
                Err(e) => self.degrade(&e, "PING"),
            }
        }
        self.fallback.ping().await
    }
}
