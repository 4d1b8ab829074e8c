//! Configuration for the moderation gateway.
//!
//! Configured via a TOML file with `${VAR_NAME}` environment-variable
//! interpolation, or assembled directly from environment variables when no
//! file is given.
//!
//! # Example
//!
//! ```toml
//! [server]
//! host = "0.0.0.0"
//! port = 8080
//!
//! [kv]
//! url = "redis://localhost:6379"
//!
//! [database]
//! type = "sqlite"
//! path = "palisade.db"
//!
//! [providers.openai]
//! type = "open_ai"
//! api_key = "${OPENAI_API_KEY}"
//!
//! [routing.pro]
//! provider = "openai"
//! model = "gpt-4o"
//! ```

mod cache;
mod database;
mod kv;
mod limits;
mod providers;
mod screen;
mod server;

pub use cache::*;
pub use database::*;
pub use kv::*;
pub use limits::*;
pub use providers::*;
pub use screen::*;
use serde::{Deserialize, Serialize};
pub use server::*;

/// Root configuration.
///
/// Every section is optional with defaults, so an empty file is a valid
/// local-development configuration: in-process KV, no durable store, no
/// providers, pre-screen only.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct GatewayConfig {
    /// HTTP server configuration.
    pub server: ServerConfig,

    /// Shared KV store (statistics counters, verdict cache primary).
    pub kv: KvConfig,

    /// Verdict cache TTL bounds and compression.
    pub cache: CacheConfig,

    /// Durable store for statistics roll-ups.
    pub database: DatabaseConfig,

    /// External moderation providers.
    pub providers: ProvidersConfig,

    /// Tier to provider routing.
    pub routing: RoutingConfig,

    /// Request-shape limits.
    pub limits: LimitsConfig,

    /// Pre-screener tuning.
    pub screen: ScreenConfig,
}

impl GatewayConfig {
    /// Load configuration from a TOML file.
    ///
    /// Environment variables in the format `${VAR_NAME}` are expanded.
    /// Missing required variables cause an error.
    #[cfg(feature = "server")]
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(e, path.as_ref().to_path_buf()))?;
        Self::from_str(&contents)
    }

    /// Parse configuration from a TOML string.
    #[cfg(feature = "server")]
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(contents: &str) -> Result<Self, ConfigError> {
        let expanded = expand_env_vars(contents)?;
        let config: GatewayConfig = toml::from_str(&expanded).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Assemble a configuration from environment variables alone.
    ///
    /// Recognised variables: `PALISADE_HOST`, `PALISADE_PORT`,
    /// `PALISADE_KV_URL`, `PALISADE_DATABASE_URL` (postgres),
    /// `PALISADE_SQLITE_PATH`, `OPENAI_API_KEY`, `ANTHROPIC_API_KEY`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = GatewayConfig::default();

        if let Ok(host) = std::env::var("PALISADE_HOST") {
            config.server.host = host
                .parse()
                .map_err(|_| ConfigError::Validation(format!("invalid PALISADE_HOST: {}", host)))?;
        }
        if let Ok(port) = std::env::var("PALISADE_PORT") {
            config.server.port = port
                .parse()
                .map_err(|_| ConfigError::Validation(format!("invalid PALISADE_PORT: {}", port)))?;
        }
        if let Ok(url) = std::env::var("PALISADE_KV_URL") {
            config.kv.url = Some(url);
        }
        if let Ok(url) = std::env::var("PALISADE_DATABASE_URL") {
            config.database = DatabaseConfig::Postgres(PostgresConfig {
                url,
                max_connections: 10,
            });
        } else if let Ok(path) = std::env::var("PALISADE_SQLITE_PATH") {
            config.database = DatabaseConfig::Sqlite(SqliteConfig {
                path,
                create_if_missing: true,
            });
        }
        if let Ok(key) = std::env::var("OPENAI_API_KEY")
            && !key.is_empty()
        {
            config.providers.providers.insert(
                "openai".to_string(),
                ProviderConfig::OpenAi(OpenAiProviderConfig {
                    api_key: Some(key),
                    base_url: "https://api.openai.com/v1".to_string(),
                    text_model: "gpt-4o-mini".to_string(),
                    vision_model: "gpt-4o-mini".to_string(),
                    timeout_secs: 10,
                }),
            );
        }
        if let Ok(key) = std::env::var("ANTHROPIC_API_KEY")
            && !key.is_empty()
        {
            config.providers.providers.insert(
                "anthropic".to_string(),
                ProviderConfig::Anthropic(AnthropicProviderConfig {
                    api_key: Some(key),
                    base_url: "https://api.anthropic.com".to_string(),
                    text_model: "claude-3-5-haiku-latest".to_string(),
                    vision_model: "claude-3-5-haiku-latest".to_string(),
                    timeout_secs: 10,
                }),
            );
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration for consistency and completeness.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.kv.validate()?;
        self.cache.validate()?;
        self.database.validate()?;
        self.providers.validate()?;
        self.routing.validate(&self.providers)?;
        self.limits.validate()?;

        if self.server.body_limit_bytes < self.limits.max_image_bytes {
            return Err(ConfigError::Validation(
                "server.body_limit_bytes must be at least limits.max_image_bytes".into(),
            ));
        }

        Ok(())
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {1}: {0}")]
    Io(std::io::Error, std::path::PathBuf),

    #[cfg(feature = "server")]
    #[error("Failed to parse config: {0}")]
    Parse(toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Validation(String),

    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
}

/// Expand `${VAR_NAME}` references outside comments.
#[cfg(feature = "server")]
fn expand_env_vars(input: &str) -> Result<String, ConfigError> {
    let re = regex::Regex::new(r"\$\{([^}]+)\}").expect("valid literal pattern");
    let mut result = String::with_capacity(input.len());

    for line in input.lines() {
        let comment_pos = line.find('#');
        let mut line_result = String::with_capacity(line.len());
        let mut last_end = 0;

        for cap in re.captures_iter(line) {
            let whole = cap.get(0).expect("capture 0 always present");
            if let Some(pos) = comment_pos
                && whole.start() >= pos
            {
                continue;
            }

            line_result.push_str(&line[last_end..whole.start()]);
            let var_name = &cap[1];
            let value = std::env::var(var_name)
                .map_err(|_| ConfigError::EnvVarNotFound(var_name.to_string()))?;
            line_result.push_str(&value);
            last_end = whole.end();
        }

        line_result.push_str(&line[last_end..]);
        result.push_str(&line_result);
        result.push('\n');
    }

    if !input.ends_with('\n') {
        result.pop();
    }

    Ok(result)
}
