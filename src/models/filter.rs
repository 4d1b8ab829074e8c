//! Wire types for the moderation endpoints.
//!
//! The request shape is deliberately forgiving: the policy object coerces
//! values strictly (only the literals `true`, `"true"`, `1`, `"1"` enable a
//! flag), history entries accept both bare strings and `{text: ...}`
//! objects, and an unknown model tier clamps to [`ModelTier::Normal`].

use serde::{Deserialize, Deserializer, Serialize};

use super::flags::Flag;

/// Maximum number of prior messages retained for context.
pub const MAX_HISTORY_MESSAGES: usize = 15;

/// Permit flags asserted by a request.
///
/// Every field defaults to the most restrictive value (false). Values are
/// coerced strictly: only the literals `true`, `"true"`, `1`, `"1"` enable a
/// flag; everything else (including `"yes"`, `2`, `null`) is false.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ModerationPolicy {
    #[serde(deserialize_with = "strict_flag")]
    pub allow_abuse: bool,
    #[serde(deserialize_with = "strict_flag")]
    pub allow_phone: bool,
    #[serde(deserialize_with = "strict_flag")]
    pub allow_email: bool,
    #[serde(deserialize_with = "strict_flag")]
    pub allow_physical_information: bool,
    #[serde(deserialize_with = "strict_flag")]
    pub allow_social_information: bool,
    #[serde(deserialize_with = "strict_flag")]
    pub return_filtered_message: bool,
    #[serde(deserialize_with = "strict_flag")]
    pub analyze_images: bool,
}

impl ModerationPolicy {
    /// Whether the policy permits the given flag.
    ///
    /// Flags outside the permit vocabulary (nsfw, violence, provider
    /// extras) are never permitted by policy.
    pub fn permits(&self, flag: &Flag) -> bool {
        match flag {
            Flag::AbusiveLanguage => self.allow_abuse,
            Flag::PhoneNumber => self.allow_phone,
            Flag::EmailAddress => self.allow_email,
            Flag::PhysicalAddress => self.allow_physical_information,
            Flag::SocialMediaHandle => self.allow_social_information,
            _ => false,
        }
    }

    /// Compact encoding of enabled flags, one character per flag.
    ///
    /// Feeds the cache fingerprint: two requests differing only in policy
    /// must not share a cache entry.
    pub fn compact_encoding(&self) -> String {
        let mut out = String::with_capacity(7);
        for (enabled, ch) in [
            (self.allow_abuse, 'a'),
            (self.allow_phone, 'p'),
            (self.allow_email, 'e'),
            (self.allow_physical_information, 'y'),
            (self.allow_social_information, 's'),
            (self.return_filtered_message, 'f'),
            (self.analyze_images, 'i'),
        ] {
            if enabled {
                out.push(ch);
            }
        }
        out
    }
}

/// Strict boolean coercion: only `true`, `"true"`, `1`, `"1"` enable.
fn strict_flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(match value {
        serde_json::Value::Bool(b) => b,
        serde_json::Value::String(s) => s == "true" || s == "1",
        serde_json::Value::Number(n) => n.as_i64() == Some(1),
        _ => false,
    })
}

/// A single prior conversation message, truncated context only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistoryMessage(pub String);

impl HistoryMessage {
    pub fn text(&self) -> &str {
        &self.0
    }
}

impl<'de> Deserialize<'de> for HistoryMessage {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Wire {
            Plain(String),
            Object { text: String },
        }

        Ok(match Wire::deserialize(deserializer)? {
            Wire::Plain(text) | Wire::Object { text } => HistoryMessage(text),
        })
    }
}

/// Model tier requested by the client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", from = "String")]
pub enum ModelTier {
    Fast,
    #[default]
    Normal,
    Pro,
}

impl ModelTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelTier::Fast => "fast",
            ModelTier::Normal => "normal",
            ModelTier::Pro => "pro",
        }
    }
}

impl From<String> for ModelTier {
    /// Unknown tiers clamp to `normal`.
    fn from(s: String) -> Self {
        match s.as_str() {
            "fast" => ModelTier::Fast,
            "pro" => ModelTier::Pro,
            _ => ModelTier::Normal,
        }
    }
}

/// A moderation request, canonicalised at the pipeline boundary.
///
/// Invariant: after validation, at least one of `text`/`image` is non-empty.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FilterRequest {
    /// Text to moderate. May be empty when an image is present.
    #[serde(default)]
    pub text: String,

    /// Opaque base64 image payload.
    #[serde(default)]
    pub image: Option<String>,

    /// Permit flags. Missing object means all-restrictive defaults.
    #[serde(default, rename = "config")]
    pub policy: ModerationPolicy,

    /// Prior conversation context, newest last. Truncated to the last
    /// [`MAX_HISTORY_MESSAGES`] entries during canonicalisation.
    #[serde(default, rename = "oldMessages")]
    pub history: Vec<HistoryMessage>,

    /// Requested model tier. Unknown values clamp to `normal`.
    #[serde(default, rename = "model")]
    pub tier: ModelTier,
}

impl FilterRequest {
    /// True when the request carries neither text nor image content.
    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty() && self.image.as_deref().is_none_or(|i| i.is_empty())
    }

    /// Truncate history to the retained window, keeping the newest entries.
    pub fn truncate_history(&mut self) {
        if self.history.len() > MAX_HISTORY_MESSAGES {
            let skip = self.history.len() - MAX_HISTORY_MESSAGES;
            self.history.drain(..skip);
        }
    }
}

/// The gateway's verdict for a single request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterVerdict {
    /// Whether the content was blocked.
    pub blocked: bool,

    /// Short human-readable reason. Non-empty whenever `blocked` is true.
    pub reason: String,

    /// Deduplicated, order-stable set of triggered flags. May be non-empty
    /// on allowed responses to annotate permitted sensitive content.
    pub flags: Vec<Flag>,

    /// Redacted text, present iff the policy requested it and the pipeline
    /// produced one.
    #[serde(rename = "filteredMessage", skip_serializing_if = "Option::is_none")]
    pub filtered_message: Option<String>,
}

impl FilterVerdict {
    pub fn allowed(reason: impl Into<String>) -> Self {
        Self {
            blocked: false,
            reason: reason.into(),
            flags: Vec::new(),
            filtered_message: None,
        }
    }

    pub fn blocked(reason: impl Into<String>, flags: Vec<Flag>) -> Self {
        Self {
            blocked: true,
            reason: reason.into(),
            flags,
            filtered_message: None,
        }
    }

    /// Safe response returned when the pipeline itself fails: allow, marked
    /// with the `error` flag so callers can tell analysis did not happen.
    pub fn internal_error() -> Self {
        Self {
            blocked: false,
            reason: "Content analysis failed".to_string(),
            flags: vec![Flag::Error],
            filtered_message: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_strict_coercion() {
        let policy: ModerationPolicy = serde_json::from_value(serde_json::json!({
            "allowPhone": true,
            "allowEmail": "true",
            "allowAbuse": 1,
            "allowSocialInformation": "1",
            "allowPhysicalInformation": "yes",
            "returnFilteredMessage": 2,
            "analyzeImages": null,
        }))
        .unwrap();

        assert!(policy.allow_phone);
        assert!(policy.allow_email);
        assert!(policy.allow_abuse);
        assert!(policy.allow_social_information);
        assert!(!policy.allow_physical_information);
        assert!(!policy.return_filtered_message);
        assert!(!policy.analyze_images);
    }

    #[test]
    fn test_policy_missing_is_all_restrictive() {
        let request: FilterRequest = serde_json::from_value(serde_json::json!({
            "text": "hello",
        }))
        .unwrap();

        assert_eq!(request.policy, ModerationPolicy::default());
        assert!(!request.policy.allow_phone);
    }

    #[test]
    fn test_policy_permits() {
        let policy = ModerationPolicy {
            allow_email: true,
            ..Default::default()
        };
        assert!(policy.permits(&Flag::EmailAddress));
        assert!(!policy.permits(&Flag::PhoneNumber));
        assert!(!policy.permits(&Flag::Nsfw));
    }

    #[test]
    fn test_policy_compact_encoding() {
        assert_eq!(ModerationPolicy::default().compact_encoding(), "");

        let policy = ModerationPolicy {
            allow_phone: true,
            allow_social_information: true,
            analyze_images: true,
            ..Default::default()
        };
        assert_eq!(policy.compact_encoding(), "psi");
    }

    #[test]
    fn test_history_accepts_both_shapes() {
        let request: FilterRequest = serde_json::from_value(serde_json::json!({
            "text": "hi",
            "oldMessages": ["plain", {"text": "wrapped"}],
        }))
        .unwrap();

        assert_eq!(request.history.len(), 2);
        assert_eq!(request.history[0].text(), "plain");
        assert_eq!(request.history[1].text(), "wrapped");
    }

    #[test]
    fn test_history_truncation_keeps_newest() {
        let mut request = FilterRequest {
            text: "hi".into(),
            history: (0..20).map(|i| HistoryMessage(format!("m{}", i))).collect(),
            ..Default::default()
        };
        request.truncate_history();

        assert_eq!(request.history.len(), MAX_HISTORY_MESSAGES);
        assert_eq!(request.history[0].text(), "m5");
        assert_eq!(request.history.last().unwrap().text(), "m19");
    }

    #[test]
    fn test_tier_clamps_unknown() {
        assert_eq!(ModelTier::from("fast".to_string()), ModelTier::Fast);
        assert_eq!(ModelTier::from("pro".to_string()), ModelTier::Pro);
        assert_eq!(ModelTier::from("turbo".to_string()), ModelTier::Normal);
        assert_eq!(ModelTier::from(String::new()), ModelTier::Normal);

        let request: FilterRequest =
            serde_json::from_value(serde_json::json!({"text": "x", "model": "ultra"})).unwrap();
        assert_eq!(request.tier, ModelTier::Normal);
    }

    #[test]
    fn test_is_empty() {
        assert!(FilterRequest::default().is_empty());
        assert!(
            FilterRequest {
                text: "  ".into(),
                ..Default::default()
            }
            .is_empty()
        );
        assert!(
            !FilterRequest {
                image: Some("aGk=".into()),
                ..Default::default()
            }
            .is_empty()
        );
    }

    #[test]
    fn test_verdict_serialization_omits_absent_filtered_message() {
        let verdict = FilterVerdict::allowed("ok");
        let json = serde_json::to_value(&verdict).unwrap();
        assert!(json.get("filteredMessage").is_none());
        assert_eq!(json["blocked"], false);
    }
}
