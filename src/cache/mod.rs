//! Verdict caching.
//!
//! Maps request fingerprints to previously computed verdicts so repeated
//! content skips the pre-screen and the provider round trip entirely.
//!
//! # Caching strategy
//!
//! - **Adaptive TTL**: blocked verdicts expire fastest (policy and model
//!   changes should un-block quickly), clean allows live longest, flagged
//!   allows sit in between.
//! - **Transparent compression**: payloads at or above the configured
//!   threshold are gzipped and stored as `GZIP:<base64>` when that
//!   actually saves space (compressed form at most 80% of the original).
//! - **Failure policy**: lookups never error (any backend failure reads
//!   as a miss); stores are fire-and-forget and dropped on failure.

mod fingerprint;

use std::{
    io::{Read, Write},
    sync::Arc,
    time::Duration,
};

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
pub use fingerprint::{Fingerprint, ImageDigest};
use flate2::{Compression, read::GzDecoder, write::GzEncoder};
use serde::{Deserialize, Serialize};

use crate::{
    config::CacheConfig,
    kv::{KvClient, KvStore},
    models::FilterVerdict,
};

/// Marker prefix for compressed cache payloads.
const GZIP_PREFIX: &str = "GZIP:";

/// Compressed payloads must be at most this fraction of the original to be
/// worth storing.
const COMPRESSION_GAIN_NUM: usize = 8;
const COMPRESSION_GAIN_DEN: usize = 10;

/// A cached verdict with its storage metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CachedVerdict {
    verdict: FilterVerdict,
    /// Unix seconds at store time.
    stored_at: i64,
    ttl_secs: u64,
}

pub struct VerdictCache {
    kv: Arc<KvClient>,
    config: CacheConfig,
}

impl VerdictCache {
    pub fn new(kv: Arc<KvClient>, config: CacheConfig) -> Self {
        Self { kv, config }
    }

    /// Look up a verdict. Never errors: backend failures and corrupt
    /// entries both read as misses.
    pub async fn get(&self, fingerprint: Fingerprint) -> Option<FilterVerdict> {
        if !self.config.enabled {
            return None;
        }

        let key = fingerprint.cache_key();
        let stored = match self.kv.get(&key).await {
            Ok(Some(stored)) => stored,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Cache lookup failed, treating as miss");
                return None;
            }
        };

        match Self::decode(&stored) {
            Some(cached) => {
                tracing::debug!(key = %key, "Verdict cache hit");
                Some(cached.verdict)
            }
            None => {
                tracing::warn!(key = %key, "Corrupt cache entry, treating as miss");
                None
            }
        }
    }

    /// Store a verdict. Errors are logged and swallowed; callers schedule
    /// this off the hot path and never await its outcome for the response.
    pub async fn put(
        &self,
        fingerprint: Fingerprint,
        verdict: &FilterVerdict,
        ttl: Option<Duration>,
    ) {
        if !self.config.enabled {
            return;
        }

        let ttl = ttl.unwrap_or_else(|| self.adaptive_ttl(verdict));
        let key = fingerprint.cache_key();
        let cached = CachedVerdict {
            verdict: verdict.clone(),
            stored_at: chrono::Utc::now().timestamp(),
            ttl_secs: ttl.as_secs(),
        };

        let payload = match serde_json::to_string(&cached) {
            Ok(json) => self.encode(json),
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Failed to serialize verdict for cache");
                return;
            }
        };

        if let Err(e) = self.kv.set(&key, &payload, Some(ttl)).await {
            tracing::warn!(key = %key, error = %e, "Dropped cache store");
        } else {
            tracing::debug!(key = %key, ttl_secs = ttl.as_secs(), "Verdict cached");
        }
    }

    /// TTL derived from the verdict shape.
    pub fn adaptive_ttl(&self, verdict: &FilterVerdict) -> Duration {
        if verdict.blocked {
            self.config.min_ttl()
        } else if verdict.flags.is_empty() {
            self.config.max_ttl()
        } else {
            self.config.default_ttl()
        }
    }

    /// Gzip the payload when it is large enough and compression actually
    /// pays for itself; plain JSON otherwise.
    fn encode(&self, json: String) -> String {
        if json.len() < self.config.compress_threshold_bytes {
            return json;
        }

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        if encoder.write_all(json.as_bytes()).is_err() {
            return json;
        }
        let compressed = match encoder.finish() {
            Ok(bytes) => bytes,
            Err(_) => return json,
        };

        let tagged = format!("{}{}", GZIP_PREFIX, BASE64.encode(&compressed));
        if tagged.len() * COMPRESSION_GAIN_DEN <= json.len() * COMPRESSION_GAIN_NUM {
            tagged
        } else {
            json
        }
    }

    fn decode(stored: &str) -> Option<CachedVerdict> {
        let json: String = match stored.strip_prefix(GZIP_PREFIX) {
            Some(encoded) => {
                let compressed = BASE64.decode(encoded).ok()?;
                let mut decoder = GzDecoder::new(compressed.as_slice());
                let mut out = String::new();
                decoder.read_to_string(&mut out).ok()?;
                out
            }
            None => stored.to_string(),
        };
        serde_json::from_str(&json).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FilterRequest, Flag};

    fn cache() -> VerdictCache {
        VerdictCache::new(Arc::new(KvClient::in_process()), CacheConfig::default())
    }

    fn fingerprint(text: &str) -> Fingerprint {
        Fingerprint::compute(
            &FilterRequest {
                text: text.to_string(),
                ..Default::default()
            },
            None,
        )
    }

    #[tokio::test]
    async fn test_round_trip() {
        let cache = cache();
        let fp = fingerprint("hello");
        let verdict = FilterVerdict::blocked("contains phone number", vec![Flag::PhoneNumber]);

        assert!(cache.get(fp).await.is_none());
        cache.put(fp, &verdict, None).await;
        assert_eq!(cache.get(fp).await, Some(verdict));
    }

    #[tokio::test]
    async fn test_round_trip_through_compression() {
        let cache = cache();
        let fp = fingerprint("big");
        // Reason long enough to cross the compression threshold and
        // repetitive enough to compress well.
        let verdict = FilterVerdict::blocked("lorem ipsum ".repeat(200), vec![Flag::Nsfw]);

        cache.put(fp, &verdict, None).await;
        assert_eq!(cache.get(fp).await, Some(verdict));
    }

    #[test]
    fn test_encode_tags_compressed_payloads() {
        let cache = cache();
        let json = format!(r#"{{"pad":"{}"}}"#, "x".repeat(4000));
        let encoded = cache.encode(json.clone());
        assert!(encoded.starts_with(GZIP_PREFIX));
        assert!(encoded.len() < json.len());
    }

    #[test]
    fn test_encode_keeps_small_payloads_plain() {
        let cache = cache();
        let json = r#"{"blocked":false}"#.to_string();
        assert_eq!(cache.encode(json.clone()), json);
    }

    #[test]
    fn test_encode_skips_unprofitable_compression() {
        let cache = cache();
        // High-entropy payload: gzip+base64 will not reach the 80% gain.
        let noise: String = (0..3000u32)
            .map(|i| char::from(b'a' + ((i * 7919 + i * i * 31) % 26) as u8))
            .map(|c| if c as u32 % 3 == 0 { c.to_ascii_uppercase() } else { c })
            .collect();
        let json = format!(r#"{{"pad":"{}"}}"#, noise);
        let encoded = cache.encode(json.clone());
        // Either stored plain, or compressed only if genuinely smaller.
        if encoded.starts_with(GZIP_PREFIX) {
            assert!(encoded.len() * 10 <= json.len() * 8);
        } else {
            assert_eq!(encoded, json);
        }
    }

    #[tokio::test]
    async fn test_corrupt_entry_reads_as_miss() {
        let kv = Arc::new(KvClient::in_process());
        let cache = VerdictCache::new(Arc::clone(&kv), CacheConfig::default());
        let fp = fingerprint("poisoned");

        kv.set(&fp.cache_key(), "not json at all", None)
            .await
            .unwrap();
        assert!(cache.get(fp).await.is_none());

        kv.set(&fp.cache_key(), "GZIP:!!!not-base64!!!", None)
            .await
            .unwrap();
        assert!(cache.get(fp).await.is_none());
    }

    #[tokio::test]
    async fn test_disabled_cache_misses_and_drops() {
        let config = CacheConfig {
            enabled: false,
            ..Default::default()
        };
        let cache = VerdictCache::new(Arc::new(KvClient::in_process()), config);
        let fp = fingerprint("x");
        cache.put(fp, &FilterVerdict::allowed("ok"), None).await;
        assert!(cache.get(fp).await.is_none());
    }

    #[test]
    fn test_adaptive_ttl_table() {
        let cache = cache();

        let blocked = FilterVerdict::blocked("no", vec![Flag::Nsfw]);
        assert_eq!(cache.adaptive_ttl(&blocked), Duration::from_secs(3600));

        let clean = FilterVerdict::allowed("ok");
        assert_eq!(
            cache.adaptive_ttl(&clean),
            Duration::from_secs(7 * 24 * 3600)
        );

        let mut flagged = FilterVerdict::allowed("allowed sensitive information");
        flagged.flags.push(Flag::EmailAddress);
        assert_eq!(cache.adaptive_ttl(&flagged), Duration::from_secs(24 * 3600));
    }
}
