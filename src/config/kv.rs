use serde::{Deserialize, Serialize};

use super::ConfigError;

/// Shared KV store configuration.
///
/// The KV store backs the statistics counters and the primary verdict
/// cache. It is optional: without a URL every KV operation is served by
/// the in-process fallback.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KvConfig {
    /// Redis URL, e.g. `redis://localhost:6379`. Omit for in-process mode.
    #[serde(default)]
    pub url: Option<String>,

    /// Per-command deadline in milliseconds. Commands slower than this are
    /// treated as failures; the cache reads them as misses.
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
}

impl Default for KvConfig {
    fn default() -> Self {
        Self {
            url: None,
            command_timeout_ms: default_command_timeout_ms(),
        }
    }
}

impl KvConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.command_timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "kv.command_timeout_ms must be greater than zero".into(),
            ));
        }
        if self.url.is_some() && !cfg!(feature = "redis") {
            return Err(ConfigError::Validation(
                "kv.url is set but this build does not include the `redis` feature".into(),
            ));
        }
        Ok(())
    }
}

fn default_command_timeout_ms() -> u64 {
    2_000
}
