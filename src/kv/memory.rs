//! In-process KV fallback.
//!
//! Serves the full [`KvStore`] operation set from process-local maps when
//! the shared store is not reachable. Semantics are best-effort: TTLs are
//! enforced on read, nothing is shared across processes, and pipelines
//! execute sequentially.

use std::{
    collections::{HashMap, VecDeque},
    time::{Duration, Instant},
};

use async_trait::async_trait;
use dashmap::DashMap;

use super::{
    error::{KvError, KvResult},
    store::{KvOp, KvReply, KvStore},
};

#[derive(Debug, Clone)]
enum Value {
    Text(String),
    List(VecDeque<String>),
    Hash(HashMap<String, i64>),
}

struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(value: Value, ttl: Option<Duration>) -> Self {
        Self {
            value,
            expires_at: ttl.map(|t| Instant::now() + t),
        }
    }

    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|exp| Instant::now() > exp)
    }
}

/// Process-local [`KvStore`] implementation on a concurrent map.
///
/// Per-key mutation is serialized by the map shard locks; no global lock
/// is taken.
#[derive(Default)]
pub struct MemoryKv {
    data: DashMap<String, Entry>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read an entry, enforcing TTL. Expired entries are removed.
    fn live<'a>(
        &'a self,
        key: &str,
    ) -> Option<dashmap::mapref::one::Ref<'a, String, Entry>> {
        if let Some(entry) = self.data.get(key) {
            if entry.is_expired() {
                drop(entry);
                self.data.remove(key);
                return None;
            }
            return Some(entry);
        }
        None
    }

    fn live_mut<'a>(
        &'a self,
        key: &str,
    ) -> Option<dashmap::mapref::one::RefMut<'a, String, Entry>> {
        if let Some(entry) = self.data.get_mut(key) {
            if entry.is_expired() {
                drop(entry);
                self.data.remove(key);
                return None;
            }
            return Some(entry);
        }
        None
    }

    /// Translate redis-style (start, stop) indices (negative = from end,
    /// inclusive stop) into a front-to-back range.
    fn resolve_range(len: usize, start: i64, stop: i64) -> Option<(usize, usize)> {
        let len = len as i64;
        let start = if start < 0 { (len + start).max(0) } else { start };
        let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
        if start > stop || start >= len {
            return None;
        }
        Some((start as usize, stop as usize))
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &str) -> KvResult<Option<String>> {
        Ok(self.live(key).and_then(|entry| match &entry.value {
            Value::Text(s) => Some(s.clone()),
            _ => None,
        }))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> KvResult<()> {
        self.data.insert(
            key.to_string(),
            Entry::new(Value::Text(value.to_string()), ttl),
        );
        Ok(())
    }

    async fn del(&self, key: &str) -> KvResult<()> {
        self.data.remove(key);
        Ok(())
    }

    async fn incr_by(&self, key: &str, delta: i64) -> KvResult<i64> {
        let mut entry = self
            .data
            .entry(key.to_string())
            .or_insert_with(|| Entry::new(Value::Text("0".to_string()), None));

        if entry.is_expired() {
            *entry = Entry::new(Value::Text("0".to_string()), None);
        }

        match &mut entry.value {
            Value::Text(s) => {
                let current: i64 = s
                    .parse()
                    .map_err(|_| KvError::Type(format!("non-integer counter at {}", key)))?;
                let next = current + delta;
                *s = next.to_string();
                Ok(next)
            }
            _ => Err(KvError::Type(format!("non-string value at {}", key))),
        }
    }

    async fn mget(&self, keys: &[String]) -> KvResult<Vec<Option<String>>> {
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            out.push(self.get(key).await?);
        }
        Ok(out)
    }

    async fn hgetall(&self, key: &str) -> KvResult<Vec<(String, String)>> {
        Ok(self
            .live(key)
            .map(|entry| match &entry.value {
                Value::Hash(map) => map
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_string()))
                    .collect(),
                _ => Vec::new(),
            })
            .unwrap_or_default())
    }

    async fn hincr_by(&self, key: &str, field: &str, delta: i64) -> KvResult<i64> {
        let mut entry = self
            .data
            .entry(key.to_string())
            .or_insert_with(|| Entry::new(Value::Hash(HashMap::new()), None));

        if entry.is_expired() {
            *entry = Entry::new(Value::Hash(HashMap::new()), None);
        }

        match &mut entry.value {
            Value::Hash(map) => {
                let slot = map.entry(field.to_string()).or_insert(0);
                *slot += delta;
                Ok(*slot)
            }
            _ => Err(KvError::Type(format!("non-hash value at {}", key))),
        }
    }

    async fn lpush(&self, key: &str, values: &[String]) -> KvResult<i64> {
        let mut entry = self
            .data
            .entry(key.to_string())
            .or_insert_with(|| Entry::new(Value::List(VecDeque::new()), None));

        if entry.is_expired() {
            *entry = Entry::new(Value::List(VecDeque::new()), None);
        }

        match &mut entry.value {
            Value::List(list) => {
                for value in values {
                    list.push_front(value.clone());
                }
                Ok(list.len() as i64)
            }
            _ => Err(KvError::Type(format!("non-list value at {}", key))),
        }
    }

    async fn ltrim(&self, key: &str, start: i64, stop: i64) -> KvResult<()> {
        if let Some(mut entry) = self.live_mut(key)
            && let Value::List(list) = &mut entry.value
        {
            match Self::resolve_range(list.len(), start, stop) {
                Some((from, to)) => {
                    let kept: VecDeque<String> =
                        list.iter().skip(from).take(to - from + 1).cloned().collect();
                    *list = kept;
                }
                None => list.clear(),
            }
        }
        Ok(())
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> KvResult<Vec<String>> {
        Ok(self
            .live(key)
            .and_then(|entry| match &entry.value {
                Value::List(list) => Self::resolve_range(list.len(), start, stop)
                    .map(|(from, to)| {
                        list.iter().skip(from).take(to - from + 1).cloned().collect()
                    }),
                _ => None,
            })
            .unwrap_or_default())
    }

    async fn llen(&self, key: &str) -> KvResult<i64> {
        Ok(self
            .live(key)
            .map(|entry| match &entry.value {
                Value::List(list) => list.len() as i64,
                _ => 0,
            })
            .unwrap_or(0))
    }

    async fn keys(&self, pattern: &str) -> KvResult<Vec<String>> {
        let matches: Vec<String> = match pattern.strip_suffix('*') {
            Some(prefix) => self
                .data
                .iter()
                .filter(|entry| entry.key().starts_with(prefix) && !entry.is_expired())
                .map(|entry| entry.key().clone())
                .collect(),
            None => self
                .data
                .iter()
                .filter(|entry| entry.key() == pattern && !entry.is_expired())
                .map(|entry| entry.key().clone())
                .collect(),
        };
        Ok(matches)
    }

    async fn expire_nx(&self, key: &str, ttl: Duration) -> KvResult<bool> {
        if let Some(mut entry) = self.live_mut(key)
            && entry.expires_at.is_none()
        {
            entry.expires_at = Some(Instant::now() + ttl);
            return Ok(true);
        }
        Ok(false)
    }

    async fn pipeline(&self, ops: Vec<KvOp>) -> KvResult<Vec<KvReply>> {
        let mut replies = Vec::with_capacity(ops.len());
        for op in ops {
            let reply = match op {
                KvOp::Get(key) => match self.get(&key).await? {
                    Some(v) => KvReply::Text(v),
                    None => KvReply::Nil,
                },
                KvOp::Set { key, value, ttl } => {
                    self.set(&key, &value, ttl).await?;
                    KvReply::Ok
                }
                KvOp::Del(key) => {
                    self.del(&key).await?;
                    KvReply::Ok
                }
                KvOp::IncrBy { key, delta } => KvReply::Int(self.incr_by(&key, delta).await?),
                KvOp::HIncrBy { key, field, delta } => {
                    KvReply::Int(self.hincr_by(&key, &field, delta).await?)
                }
                KvOp::LPush { key, values } => KvReply::Int(self.lpush(&key, &values).await?),
                KvOp::LTrim { key, start, stop } => {
                    self.ltrim(&key, start, stop).await?;
                    KvReply::Ok
                }
                KvOp::ExpireNx { key, ttl } => {
                    KvReply::Int(self.expire_nx(&key, ttl).await? as i64)
                }
                KvOp::Keys(pattern) => KvReply::Array(self.keys(&pattern).await?),
            };
            replies.push(reply);
        }
        Ok(replies)
    }

    async fn ping(&self) -> KvResult<()> {
        Ok(())
    }
}
