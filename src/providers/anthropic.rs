//! Anthropic Messages API provider.

use std::time::Duration;

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use serde::Deserialize;
use serde_json::json;

use super::{
    Analysis, ModerationProvider, ProviderError, history_block, image_instruction,
    parse_verdict, text_instruction,
};
use crate::{
    config::AnthropicProviderConfig,
    models::{HistoryMessage, ModerationPolicy},
};

/// Anthropic API version header value.
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Verdicts are tiny JSON objects; this bounds the completion.
const MAX_TOKENS: u32 = 512;

pub struct AnthropicProvider {
    name: String,
    api_key: String,
    base_url: String,
    text_model: String,
    vision_model: String,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: Option<String>,
}

impl AnthropicProvider {
    pub fn from_config(name: &str, config: &AnthropicProviderConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_default();

        Self {
            name: name.to_string(),
            api_key: config.api_key.clone().unwrap_or_default(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            text_model: config.text_model.clone(),
            vision_model: config.vision_model.clone(),
            client,
        }
    }

    async fn complete(&self, body: serde_json::Value) -> Result<Analysis, ProviderError> {
        let response = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Status { status, body });
        }

        let parsed: MessagesResponse = response.json().await?;
        let content = parsed
            .content
            .iter()
            .find_map(|block| block.text.as_deref())
            .ok_or_else(|| ProviderError::Parse("response carried no text block".to_string()))?;

        parse_verdict(content)
    }
}

#[async_trait]
impl ModerationProvider for AnthropicProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn default_text_model(&self) -> &str {
        &self.text_model
    }

    fn vision_model(&self) -> &str {
        &self.vision_model
    }

    async fn analyze_text(
        &self,
        text: &str,
        history: &[HistoryMessage],
        policy: &ModerationPolicy,
        model: &str,
    ) -> Result<Analysis, ProviderError> {
        let user_content = format!("{}Message to analyze:\n{}", history_block(history), text);
        let body = json!({
            "model": model,
            "max_tokens": MAX_TOKENS,
            "system": text_instruction(policy),
            "messages": [
                {"role": "user", "content": user_content},
            ],
        });

        self.complete(body).await
    }

    async fn analyze_image(
        &self,
        image: &[u8],
        mime: &str,
        policy: &ModerationPolicy,
    ) -> Result<Analysis, ProviderError> {
        let body = json!({
            "model": self.vision_model,
            "max_tokens": MAX_TOKENS,
            "system": image_instruction(policy),
            "messages": [
                {"role": "user", "content": [
                    {"type": "image", "source": {
                        "type": "base64",
                        "media_type": mime,
                        "data": BASE64.encode(image),
                    }},
                    {"type": "text", "text": "Analyze this image."},
                ]},
            ],
        });

        self.complete(body).await
    }
}
