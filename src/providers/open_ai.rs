//! OpenAI-compatible chat provider.
//!
//! Speaks the `/chat/completions` shape, which a large family of hosted
//! and self-hosted endpoints implement; the base URL is configurable for
//! exactly that reason. Verdicts are requested as JSON objects with
//! temperature zero.

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
    config::OpenAiProviderConfig,
    models::{HistoryMessage, ModerationPolicy},
};

pub struct OpenAiProvider {
    name: String,
    api_key: String,
    base_url: String,
    text_model: String,
    vision_model: String,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

impl OpenAiProvider {
    pub fn from_config(name: &str, config: &OpenAiProviderConfig) -> Self {
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
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Status { status, body });
        }

        let parsed: ChatResponse = response.json().await?;
        let content = parsed
            .choices
            .first()
            .and_then(|c| c.message.content.as_deref())
            .ok_or_else(|| ProviderError::Parse("response carried no content".to_string()))?;

        parse_verdict(content)
    }
}

#[async_trait]
impl ModerationProvider for OpenAiProvider {
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
            "temperature": 0,
            "response_format": {"type": "json_object"},
            "messages": [
                {"role": "system", "content": text_instruction(policy)},
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
        let data_url = format!("data:{};base64,{}", mime, BASE64.encode(image));
        let body = json!({
            "model": self.vision_model,
            "temperature": 0,
            "response_format": {"type": "json_object"},
            "messages": [
                {"role": "system", "content": image_instruction(policy)},
                {"role": "user", "content": [
                    {"type": "text", "text": "Analyze this image."},
                    {"type": "image_url", "image_url": {"url": data_url}},
                ]},
            ],
        });

        self.complete(body).await
    }
}
