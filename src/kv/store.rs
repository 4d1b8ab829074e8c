//! The uniform KV operation set shared by the Redis backend and the
//! in-process fallback.

use std::time::Duration;

use async_trait::async_trait;

use super::error::{KvError, KvResult};

/// A single operation in a pipelined burst.
///
/// Pipelines exist to collapse a flush or a pre-check into one round trip;
/// they carry no transactional guarantee.
#[derive(Debug, Clone)]
pub enum KvOp {
    Get(String),
    Set {
        key: String,
        value: String,
        ttl: Option<Duration>,
    },
    Del(String),
    IncrBy {
        key: String,
        delta: i64,
    },
    HIncrBy {
        key: String,
        field: String,
        delta: i64,
    },
    LPush {
        key: String,
        values: Vec<String>,
    },
    LTrim {
        key: String,
        start: i64,
        stop: i64,
    },
    /// Set a TTL only if the key has none yet.
    ExpireNx {
        key: String,
        ttl: Duration,
    },
    /// Keyspace probe (`prefix*`), used by the aggregator pre-check.
    Keys(String),
}

/// Reply to one pipelined operation.
#[derive(Debug, Clone, PartialEq)]
pub enum KvReply {
    Nil,
    Ok,
    Int(i64),
    Text(String),
    Array(Vec<String>),
}

impl KvReply {
    pub fn as_int(&self) -> KvResult<i64> {
        match self {
            KvReply::Int(n) => Ok(*n),
            KvReply::Nil => Ok(0),
            other => Err(KvError::Type(format!("expected integer, got {:?}", other))),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            KvReply::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> &[String] {
        match self {
            KvReply::Array(items) => items,
            _ => &[],
        }
    }

    /// Parse a counter reply: integers pass through, text parses, missing
    /// keys read as zero.
    pub fn as_counter(&self) -> i64 {
        match self {
            KvReply::Int(n) => *n,
            KvReply::Text(s) => s.parse().unwrap_or(0),
            _ => 0,
        }
    }
}

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> KvResult<Option<String>>;

    /// Set a value; `ttl = None` means no expiry.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> KvResult<()>;

    async fn del(&self, key: &str) -> KvResult<()>;

    /// Increment a counter by delta, returning the new value. Missing keys
    /// start at zero.
    async fn incr_by(&self, key: &str, delta: i64) -> KvResult<i64>;

    /// Fetch several keys in one round trip; result order matches input.
    async fn mget(&self, keys: &[String]) -> KvResult<Vec<Option<String>>>;

    async fn hgetall(&self, key: &str) -> KvResult<Vec<(String, String)>>;

    async fn hincr_by(&self, key: &str, field: &str, delta: i64) -> KvResult<i64>;

    async fn lpush(&self, key: &str, values: &[String]) -> KvResult<i64>;

    async fn ltrim(&self, key: &str, start: i64, stop: i64) -> KvResult<()>;

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> KvResult<Vec<String>>;

    async fn llen(&self, key: &str) -> KvResult<i64>;

    /// List keys matching a glob pattern. Only `prefix*` patterns are
    /// required by callers; the fallback implements exactly that subset.
    async fn keys(&self, pattern: &str) -> KvResult<Vec<String>>;

    /// Set a TTL only if the key currently has none. Returns true if the
    /// TTL was applied.
    async fn expire_nx(&self, key: &str, ttl: Duration) -> KvResult<bool>;

    /// Execute a burst of operations in one round trip.
    async fn pipeline(&self, ops: Vec<KvOp>) -> KvResult<Vec<KvReply>>;

    async fn ping(&self) -> KvResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_as_int() {
        assert_eq!(KvReply::Int(7).as_int().unwrap(), 7);
        assert_eq!(KvReply::Nil.as_int().unwrap(), 0);
        assert!(KvReply::Text("x".into()).as_int().is_err());
    }

    #[test]
    fn test_reply_as_text() {
        assert_eq!(KvReply::Text("v".into()).as_text(), Some("v"));
        assert_eq!(KvReply::Int(1).as_text(), None);
    }
}
