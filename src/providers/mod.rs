//! External moderation providers.
//!
//! Providers expose a uniform capability pair (text analysis and image
//! analysis) over different HTTP APIs. Each returns the same parsed
//! verdict record; everything provider-specific (endpoint shape, auth
//! headers, response envelope) stays inside the implementation.

mod anthropic;
mod open_ai;
mod registry;

use async_trait::async_trait;
pub use anthropic::AnthropicProvider;
pub use open_ai::OpenAiProvider;
pub use registry::{ProviderRegistry, Selection};
use serde::Deserialize;
use thiserror::Error;

use crate::models::{Flag, HistoryMessage, ModerationPolicy};

/// Reason used when a provider call fails.
pub const REASON_ANALYSIS_FAILED: &str = "AI analysis failed";

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Provider returned status {status}: {body}")]
    Status {
        status: http::StatusCode,
        body: String,
    },

    #[error("Failed to parse provider response: {0}")]
    Parse(String),
}

/// The parsed verdict a provider produces for one analysis call.
#[derive(Debug, Clone, PartialEq)]
pub struct Analysis {
    pub is_violation: bool,
    pub flags: Vec<Flag>,
    pub reason: String,
    pub filtered_content: Option<String>,
}

impl Analysis {
    /// The uniform failure shape: not a violation, marked with the `error`
    /// flag. The pipeline maps this fail-open for text and fail-closed for
    /// images.
    pub fn analysis_failed() -> Self {
        Self {
            is_violation: false,
            flags: vec![Flag::Error],
            reason: REASON_ANALYSIS_FAILED.to_string(),
            filtered_content: None,
        }
    }

    pub fn is_failure(&self) -> bool {
        self.flags.iter().any(Flag::is_error)
    }
}

#[async_trait]
pub trait ModerationProvider: Send + Sync {
    fn name(&self) -> &str;

    /// The text model used when tier routing names none.
    fn default_text_model(&self) -> &str;

    /// The model used for image analysis.
    fn vision_model(&self) -> &str;

    async fn analyze_text(
        &self,
        text: &str,
        history: &[HistoryMessage],
        policy: &ModerationPolicy,
        model: &str,
    ) -> Result<Analysis, ProviderError>;

    async fn analyze_image(
        &self,
        image: &[u8],
        mime: &str,
        policy: &ModerationPolicy,
    ) -> Result<Analysis, ProviderError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Shared prompt and verdict plumbing
// ─────────────────────────────────────────────────────────────────────────────

/// Verdict JSON emitted by the model, in either naming convention.
#[derive(Debug, Deserialize)]
struct WireVerdict {
    #[serde(default, rename = "isViolation", alias = "is_violation")]
    is_violation: bool,
    #[serde(default)]
    flags: Vec<String>,
    #[serde(default)]
    reason: String,
    #[serde(default, rename = "filteredContent", alias = "filtered_content")]
    filtered_content: Option<String>,
}

/// Parse the model's verdict text into an [`Analysis`].
///
/// Models occasionally wrap JSON in markdown fences; those are stripped
/// before parsing.
pub(crate) fn parse_verdict(content: &str) -> Result<Analysis, ProviderError> {
    let trimmed = content.trim();
    let stripped = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .map(|s| s.trim_end_matches("```").trim())
        .unwrap_or(trimmed);

    let wire: WireVerdict = serde_json::from_str(stripped)
        .map_err(|e| ProviderError::Parse(format!("verdict is not valid JSON: {}", e)))?;

    Ok(Analysis {
        is_violation: wire.is_violation,
        flags: wire.flags.iter().map(|s| Flag::from(s.as_str())).collect(),
        reason: if wire.reason.is_empty() {
            if wire.is_violation {
                "Content violates moderation policy".to_string()
            } else {
                "Content passed AI analysis".to_string()
            }
        } else {
            wire.reason
        },
        filtered_content: wire.filtered_content,
    })
}

/// System instruction shared by both providers.
pub(crate) fn text_instruction(policy: &ModerationPolicy) -> String {
    format!(
        "You are a content moderation engine. Analyze the user message and reply with a \
         single JSON object: {{\"isViolation\": bool, \"flags\": [string], \"reason\": string, \
         \"filteredContent\": string|null}}. Known flags: phone_number, email_address, \
         physical_address, social_media_handle, abusive_language, inappropriate, nsfw, \
         violence, pii. {}{}",
        permitted_clause(policy),
        if policy.return_filtered_message {
            " If the message can be salvaged by masking the offending spans, set \
             filteredContent to the masked message."
        } else {
            ""
        }
    )
}

pub(crate) fn image_instruction(policy: &ModerationPolicy) -> String {
    format!(
        "You are a content moderation engine. Analyze the image and reply with a single \
         JSON object: {{\"isViolation\": bool, \"flags\": [string], \"reason\": string}}. \
         Known flags: nsfw, violence, inappropriate, pii. {}",
        permitted_clause(policy)
    )
}

fn permitted_clause(policy: &ModerationPolicy) -> String {
    let mut permitted = Vec::new();
    for (allowed, name) in [
        (policy.allow_abuse, "abusive_language"),
        (policy.allow_phone, "phone_number"),
        (policy.allow_email, "email_address"),
        (policy.allow_physical_information, "physical_address"),
        (policy.allow_social_information, "social_media_handle"),
    ] {
        if allowed {
            permitted.push(name);
        }
    }
    if permitted.is_empty() {
        "No sensitive categories are permitted.".to_string()
    } else {
        format!(
            "These categories are permitted and must not count as violations: {}.",
            permitted.join(", ")
        )
    }
}

/// Render history into a compact context block for the user message.
pub(crate) fn history_block(history: &[HistoryMessage]) -> String {
    if history.is_empty() {
        return String::new();
    }
    let mut block = String::from("Previous messages for context:\n");
    for message in history {
        block.push_str("- ");
        block.push_str(message.text());
        block.push('\n');
    }
    block.push('\n');
    block
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_verdict_camel_case() {
        let analysis = parse_verdict(
            r#"{"isViolation": true, "flags": ["phone_number"], "reason": "contains phone"}"#,
        )
        .unwrap();
        assert!(analysis.is_violation);
        assert_eq!(analysis.flags, vec![Flag::PhoneNumber]);
        assert_eq!(analysis.reason, "contains phone");
    }

    #[test]
    fn test_parse_verdict_snake_case_and_fences() {
        let analysis = parse_verdict(
            "```json\n{\"is_violation\": false, \"flags\": [], \"reason\": \"\"}\n```",
        )
        .unwrap();
        assert!(!analysis.is_violation);
        assert_eq!(analysis.reason, "Content passed AI analysis");
    }

    #[test]
    fn test_parse_verdict_defaults_block_reason() {
        let analysis = parse_verdict(r#"{"isViolation": true}"#).unwrap();
        assert!(!analysis.reason.is_empty());
    }

    #[test]
    fn test_parse_verdict_rejects_garbage() {
        assert!(parse_verdict("the content seems fine to me").is_err());
    }

    #[test]
    fn test_parse_verdict_maps_unknown_flags_verbatim() {
        let analysis =
            parse_verdict(r#"{"isViolation": true, "flags": ["hate_speech"]}"#).unwrap();
        assert_eq!(analysis.flags, vec![Flag::Other("hate_speech".into())]);
    }

    #[test]
    fn test_analysis_failed_shape() {
        let failed = Analysis::analysis_failed();
        assert!(!failed.is_violation);
        assert!(failed.is_failure());
        assert_eq!(failed.reason, REASON_ANALYSIS_FAILED);
    }

    #[test]
    fn test_permitted_clause_lists_allowed() {
        let policy = ModerationPolicy {
            allow_phone: true,
            allow_email: true,
            ..Default::default()
        };
        let clause = permitted_clause(&policy);
        assert!(clause.contains("phone_number"));
        assert!(clause.contains("email_address"));
        assert!(!clause.contains("physical_address"));
    }

    #[test]
    fn test_history_block_rendering() {
        assert_eq!(history_block(&[]), "");
        let block = history_block(&[
            HistoryMessage("first".into()),
            HistoryMessage("second".into()),
        ]);
        assert!(block.contains("- first\n"));
        assert!(block.contains("- second\n"));
    }
}
