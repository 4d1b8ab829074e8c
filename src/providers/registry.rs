//! Tier to provider selection.
//!
//! The registry holds the configured providers and resolves a model tier
//! to a (provider, model) pair at call time. Providers missing credentials
//! never enter the registry; a routed tier whose provider is absent falls
//! back to the first configured provider instead of failing the request.

use std::{collections::HashMap, sync::Arc};

use super::{Analysis, AnthropicProvider, ModerationProvider, OpenAiProvider};
use crate::{
    config::{ProviderConfig, ProvidersConfig, RoutingConfig},
    models::{HistoryMessage, ModelTier, ModerationPolicy},
};

/// A resolved (provider, model) pair for one call.
pub struct Selection {
    pub provider: Arc<dyn ModerationProvider>,
    pub model: String,
}

pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn ModerationProvider>>,
    routing: RoutingConfig,
    /// Deterministic fallback order over configured provider names.
    fallback_order: Vec<String>,
}

impl ProviderRegistry {
    pub fn from_config(providers: &ProvidersConfig, routing: &RoutingConfig) -> Self {
        let mut registry: HashMap<String, Arc<dyn ModerationProvider>> = HashMap::new();

        for (name, config) in &providers.providers {
            if !config.is_configured() {
                tracing::warn!(provider = %name, "Provider has no API key, skipping");
                continue;
            }
            let provider: Arc<dyn ModerationProvider> = match config {
                ProviderConfig::OpenAi(c) => Arc::new(OpenAiProvider::from_config(name, c)),
                ProviderConfig::Anthropic(c) => Arc::new(AnthropicProvider::from_config(name, c)),
            };
            registry.insert(name.clone(), provider);
        }

        let mut fallback_order: Vec<String> = registry.keys().cloned().collect();
        fallback_order.sort_unstable();

        if registry.is_empty() {
            tracing::warn!("No moderation providers configured; AI escalation will fail open");
        }

        Self {
            providers: registry,
            routing: routing.clone(),
            fallback_order,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_providers(
        providers: Vec<(String, Arc<dyn ModerationProvider>)>,
        routing: RoutingConfig,
    ) -> Self {
        let mut fallback_order: Vec<String> =
            providers.iter().map(|(name, _)| name.clone()).collect();
        fallback_order.sort_unstable();
        Self {
            providers: providers.into_iter().collect(),
            routing,
            fallback_order,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Resolve a tier to a provider and text model.
    ///
    /// The routed target wins when its provider is configured; otherwise
    /// the first configured provider serves with its default model.
    pub fn select(&self, tier: ModelTier) -> Option<Selection> {
        if let Some(target) = self.routing.target(tier)
            && let Some(provider) = self.providers.get(&target.provider)
        {
            let model = target
                .model
                .clone()
                .unwrap_or_else(|| provider.default_text_model().to_string());
            return Some(Selection {
                provider: Arc::clone(provider),
                model,
            });
        }

        self.fallback_order.first().map(|name| {
            let provider = &self.providers[name];
            Selection {
                provider: Arc::clone(provider),
                model: provider.default_text_model().to_string(),
            }
        })
    }

    /// Text analysis that never errors: selection misses and provider
    /// failures collapse into the uniform failure analysis.
    pub async fn analyze_text(
        &self,
        tier: ModelTier,
        text: &str,
        history: &[HistoryMessage],
        policy: &ModerationPolicy,
    ) -> Analysis {
        let Some(selection) = self.select(tier) else {
            tracing::warn!("Text analysis requested with no providers configured");
            return Analysis::analysis_failed();
        };

        match selection
            .provider
            .analyze_text(text, history, policy, &selection.model)
            .await
        {
            Ok(analysis) => analysis,
            Err(e) => {
                tracing::warn!(
                    provider = selection.provider.name(),
                    model = %selection.model,
                    error = %e,
                    "Text analysis failed"
                );
                Analysis::analysis_failed()
            }
        }
    }

    /// Image analysis with the same failure envelope as text.
    pub async fn analyze_image(
        &self,
        tier: ModelTier,
        image: &[u8],
        mime: &str,
        policy: &ModerationPolicy,
    ) -> Analysis {
        let Some(selection) = self.select(tier) else {
            tracing::warn!("Image analysis requested with no providers configured");
            return Analysis::analysis_failed();
        };

        match selection.provider.analyze_image(image, mime, policy).await {
            Ok(analysis) => analysis,
            Err(e) => {
                tracing::warn!(
                    provider = selection.provider.name(),
                    error = %e,
                    "Image analysis failed"
                );
                Analysis::analysis_failed()
            }
        }
    }
}
