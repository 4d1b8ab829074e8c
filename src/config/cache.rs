use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::ConfigError;

/// Verdict cache configuration.
///
/// TTLs are adaptive per verdict shape; the three bounds here parameterise
/// that table. Blocked verdicts expire fastest so a policy change or model
/// improvement is picked up quickly; clean allows are the most stable and
/// live longest.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheConfig {
    /// Master switch. Disabled means every lookup is a miss and puts are
    /// dropped.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// TTL for blocked verdicts.
    #[serde(default = "default_min_ttl_secs")]
    pub min_ttl_secs: u64,

    /// TTL for allowed verdicts that carry annotation flags.
    #[serde(default = "default_default_ttl_secs")]
    pub default_ttl_secs: u64,

    /// TTL for clean allowed verdicts (no flags).
    #[serde(default = "default_max_ttl_secs")]
    pub max_ttl_secs: u64,

    /// Serialized payloads at or above this size are considered for gzip.
    #[serde(default = "default_compress_threshold_bytes")]
    pub compress_threshold_bytes: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            min_ttl_secs: default_min_ttl_secs(),
            default_ttl_secs: default_default_ttl_secs(),
            max_ttl_secs: default_max_ttl_secs(),
            compress_threshold_bytes: default_compress_threshold_bytes(),
        }
    }
}

impl CacheConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_ttl_secs > self.default_ttl_secs || self.default_ttl_secs > self.max_ttl_secs {
            return Err(ConfigError::Validation(
                "cache TTL bounds must satisfy min <= default <= max".into(),
            ));
        }
        Ok(())
    }

    pub fn min_ttl(&self) -> Duration {
        Duration::from_secs(self.min_ttl_secs)
    }

    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }

    pub fn max_ttl(&self) -> Duration {
        Duration::from_secs(self.max_ttl_secs)
    }
}

fn default_enabled() -> bool {
    true
}

fn default_min_ttl_secs() -> u64 {
    60 * 60 // 1 hour
}

fn default_default_ttl_secs() -> u64 {
    24 * 60 * 60 // 1 day
}

fn default_max_ttl_secs() -> u64 {
    7 * 24 * 60 * 60 // 7 days
}

fn default_compress_threshold_bytes() -> usize {
    1024
}
