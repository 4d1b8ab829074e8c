use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::ConfigError;
use crate::models::ModelTier;

/// Static provider configurations, keyed by a caller-chosen name.
///
/// A provider with no API key is treated as unconfigured: it stays in the
/// table but is skipped at selection time. This lets one config file serve
/// several deployments where only some credentials are present.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProvidersConfig {
    #[serde(flatten)]
    pub providers: HashMap<String, ProviderConfig>,
}

impl ProvidersConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, provider) in &self.providers {
            if name.is_empty() {
                return Err(ConfigError::Validation(
                    "provider names must not be empty".into(),
                ));
            }
            provider.validate(name)?;
        }
        Ok(())
    }

    /// Names of providers that have usable credentials, sorted for
    /// deterministic fallback order.
    pub fn configured_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .providers
            .iter()
            .filter(|(_, p)| p.is_configured())
            .map(|(name, _)| name.as_str())
            .collect();
        names.sort_unstable();
        names
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[serde(deny_unknown_fields)]
pub enum ProviderConfig {
    OpenAi(OpenAiProviderConfig),
    Anthropic(AnthropicProviderConfig),
}

impl ProviderConfig {
    pub fn is_configured(&self) -> bool {
        match self {
            ProviderConfig::OpenAi(c) => c.api_key.as_deref().is_some_and(|k| !k.is_empty()),
            ProviderConfig::Anthropic(c) => c.api_key.as_deref().is_some_and(|k| !k.is_empty()),
        }
    }

    fn validate(&self, name: &str) -> Result<(), ConfigError> {
        let timeout = match self {
            ProviderConfig::OpenAi(c) => c.timeout_secs,
            ProviderConfig::Anthropic(c) => c.timeout_secs,
        };
        if timeout == 0 {
            return Err(ConfigError::Validation(format!(
                "providers.{}.timeout_secs must be greater than zero",
                name
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OpenAiProviderConfig {
    /// API key. Missing or empty disables the provider.
    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default = "default_openai_base_url")]
    pub base_url: String,

    /// Model used for text analysis when the tier routing names none.
    #[serde(default = "default_openai_text_model")]
    pub text_model: String,

    /// Model used for image analysis.
    #[serde(default = "default_openai_vision_model")]
    pub vision_model: String,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AnthropicProviderConfig {
    /// API key. Missing or empty disables the provider.
    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default = "default_anthropic_base_url")]
    pub base_url: String,

    #[serde(default = "default_anthropic_text_model")]
    pub text_model: String,

    #[serde(default = "default_anthropic_vision_model")]
    pub vision_model: String,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

/// Tier to provider routing.
///
/// Each tier may pin a provider (by table name) and optionally a model.
/// Unrouted tiers, and routed tiers whose provider turns out to be
/// unconfigured, fall back to the first configured provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RoutingConfig {
    #[serde(default)]
    pub fast: Option<TierTarget>,
    #[serde(default)]
    pub normal: Option<TierTarget>,
    #[serde(default)]
    pub pro: Option<TierTarget>,
}

impl RoutingConfig {
    pub fn target(&self, tier: ModelTier) -> Option<&TierTarget> {
        match tier {
            ModelTier::Fast => self.fast.as_ref(),
            ModelTier::Normal => self.normal.as_ref(),
            ModelTier::Pro => self.pro.as_ref(),
        }
    }

    pub fn validate(&self, providers: &ProvidersConfig) -> Result<(), ConfigError> {
        for (tier, target) in [
            ("fast", &self.fast),
            ("normal", &self.normal),
            ("pro", &self.pro),
        ] {
            if let Some(target) = target
                && !providers.providers.contains_key(&target.provider)
            {
                return Err(ConfigError::Validation(format!(
                    "routing.{} references unknown provider \"{}\"",
                    tier, target.provider
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TierTarget {
    /// Provider table name.
    pub provider: String,

    /// Model override; the provider's configured text model otherwise.
    #[serde(default)]
    pub model: Option<String>,
}

fn default_openai_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_openai_text_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_openai_vision_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_anthropic_base_url() -> String {
    "https://api.anthropic.com".to_string()
}

fn default_anthropic_text_model() -> String {
    "claude-3-5-haiku-latest".to_string()
}

fn default_anthropic_vision_model() -> String {
    "claude-3-5-haiku-latest".to_string()
}

fn default_timeout_secs() -> u64 {
    10
}
