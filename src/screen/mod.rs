//! Deterministic pre-screening.
//!
//! The pre-screener is the cheap first pass of the pipeline: pure pattern
//! matching, no I/O, total over all inputs. It either settles a request on
//! its own (clean pass, permitted annotation, confident block) or hands it
//! to AI escalation with `needs_review`.

mod patterns;
mod redact;

use once_cell::sync::Lazy;
use patterns::{CONTACT_KEYWORDS, LOOSE_DIGIT_RUN, ScreenPattern, abuse_pattern, build_patterns};
pub use redact::mask_simple_patterns;
use regex::Regex;

use crate::{
    config::ScreenConfig,
    models::{Flag, ModerationPolicy, push_unique},
};

/// Detections at or above this confidence block without AI confirmation.
pub const BLOCK_CONFIDENCE: f64 = 0.8;

/// Minimum token count for inspection; anything shorter passes.
const MIN_TOKENS: usize = 3;

/// Reason attached to clean passes.
pub const REASON_CLEAN: &str = "Content passed pre-screening checks";

/// Reason attached to allowed-but-flagged content.
pub const REASON_PERMITTED: &str = "allowed sensitive information";

static WEAK_KEYWORDS: Lazy<Regex> =
    Lazy::new(|| Regex::new(CONTACT_KEYWORDS).expect("valid literal pattern"));
static WEAK_DIGITS: Lazy<Regex> =
    Lazy::new(|| Regex::new(LOOSE_DIGIT_RUN).expect("valid literal pattern"));

/// Result of a pre-screen pass.
#[derive(Debug, Clone, PartialEq)]
pub struct ScreenOutcome {
    /// Content needs AI review: something matched but not confidently
    /// enough to settle here.
    pub needs_review: bool,

    /// Every detected flag, permitted ones included (deduplicated).
    pub flags: Vec<Flag>,

    pub reason: String,

    /// Highest confidence among unpermitted detections; 0.0 when all
    /// detections are permitted or none fired.
    pub confidence: f64,

    /// Confident violation of an unpermitted category.
    pub should_block: bool,
}

impl ScreenOutcome {
    fn clean() -> Self {
        Self {
            needs_review: false,
            flags: Vec::new(),
            reason: REASON_CLEAN.to_string(),
            confidence: 0.0,
            should_block: false,
        }
    }

    /// True when only simple locally-maskable patterns (phone, email)
    /// drove the block decision.
    pub fn only_simple_violations(&self) -> bool {
        self.should_block
            && self
                .flags
                .iter()
                .all(|f| matches!(f, Flag::PhoneNumber | Flag::EmailAddress))
    }
}

pub struct PreScreener {
    patterns: Vec<ScreenPattern>,
    abuse: Option<Regex>,
}

impl PreScreener {
    pub fn new(config: &ScreenConfig) -> Self {
        Self {
            patterns: build_patterns(&config.abuse_lexicon),
            abuse: abuse_pattern(&config.abuse_lexicon),
        }
    }

    /// Evaluate text against the policy. Deterministic: equal inputs give
    /// equal outcomes.
    pub fn evaluate(&self, text: &str, policy: &ModerationPolicy) -> ScreenOutcome {
        if !self.should_inspect(text) {
            return ScreenOutcome::clean();
        }

        // (flag, confidence) per matching pattern, strongest kept per flag.
        let mut detections: Vec<(Flag, f64)> = Vec::new();
        for pattern in &self.patterns {
            if pattern.regex.is_match(text) {
                record_detection(&mut detections, pattern.flag.clone(), pattern.confidence);
            }
        }

        // Weak proximity: contact intent next to a loose digit run that no
        // strict phone pattern claimed.
        if detections.is_empty()
            && WEAK_KEYWORDS.is_match(text)
            && WEAK_DIGITS.is_match(text)
        {
            detections.push((Flag::PhoneNumber, 0.6));
        }

        if detections.is_empty() {
            return ScreenOutcome::clean();
        }

        let mut flags = Vec::new();
        for (flag, _) in &detections {
            push_unique(&mut flags, flag.clone());
        }

        let unpermitted: Vec<&(Flag, f64)> = detections
            .iter()
            .filter(|(flag, _)| !policy.permits(flag))
            .collect();

        if unpermitted.is_empty() {
            return ScreenOutcome {
                needs_review: false,
                flags,
                reason: REASON_PERMITTED.to_string(),
                confidence: 0.0,
                should_block: false,
            };
        }

        let (strongest_flag, confidence) = unpermitted
            .iter()
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(flag, conf)| (flag.clone(), *conf))
            .expect("unpermitted is non-empty");

        if confidence >= BLOCK_CONFIDENCE {
            ScreenOutcome {
                needs_review: false,
                flags,
                reason: format!("Message contains {}", describe(&strongest_flag)),
                confidence,
                should_block: true,
            }
        } else {
            ScreenOutcome {
                needs_review: true,
                flags,
                reason: "Ambiguous signals require review".to_string(),
                confidence,
                should_block: false,
            }
        }
    }

    /// Cheap gate: short texts and texts with no digit, handle, URL, or
    /// abusive token never need the full pattern pass.
    fn should_inspect(&self, text: &str) -> bool {
        if text.split_whitespace().count() < MIN_TOKENS {
            return false;
        }

        let lowered = text.to_lowercase();
        let has_digit = text.chars().any(|c| c.is_ascii_digit());
        let has_handle = text.contains('@');
        let has_url = ["http", "www.", ".com", ".me/"]
            .iter()
            .any(|hint| lowered.contains(hint));
        let has_abuse = self.abuse.as_ref().is_some_and(|re| re.is_match(text));

        has_digit || has_handle || has_url || has_abuse
    }
}

fn record_detection(detections: &mut Vec<(Flag, f64)>, flag: Flag, confidence: f64) {
    match detections.iter_mut().find(|(f, _)| *f == flag) {
        Some((_, existing)) => *existing = existing.max(confidence),
        None => detections.push((flag, confidence)),
    }
}

fn describe(flag: &Flag) -> &'static str {
    match flag {
        Flag::PhoneNumber => "a phone number",
        Flag::EmailAddress => "an email address",
        Flag::PhysicalAddress => "a physical address",
        Flag::SocialMediaHandle => "a social media handle",
        Flag::AbusiveLanguage => "abusive language",
        _ => "sensitive content",
    }
}
