//! Compiled detection patterns for the pre-screener.
//!
//! Patterns are compiled once at startup. Each carries the flag it raises
//! and the confidence the pipeline's gating uses: exact phone/email
//! matches are certain, address and social matches slightly less so,
//! lexicon hits less again.

use regex::Regex;

use crate::models::Flag;

/// A compiled detection pattern with gating metadata.
pub(super) struct ScreenPattern {
    pub regex: Regex,
    pub flag: Flag,
    pub confidence: f64,
    /// Simple patterns (phone, email) can be masked locally without AI.
    pub simple: bool,
}

/// US phone numbers: (555) 123-4567, 555-123-4567, 555.123.4567, 5551234567.
/// Area code starts with 2-9 (NANP); a bare short digit run like `123 456`
/// does not match.
pub(super) const US_PHONE: &str =
    r"\b(?:\+?1[-.\s]?)?\(?[2-9]\d{2}\)?[-.\s]?\d{3}[-.\s]?\d{4}\b";

/// International format: +44 20 7946 0958, +33 1 23 45 67 89.
pub(super) const INTL_PHONE: &str = r"\+[1-9]\d{0,2}[-.\s]?\d{1,4}[-.\s]?\d{1,4}[-.\s]?\d{1,9}";

/// RFC 5322 simplified - covers most real-world email addresses.
pub(super) const EMAIL: &str =
    r"(?i)[a-z0-9._%+-]+@[a-z0-9](?:[a-z0-9-]*[a-z0-9])?(?:\.[a-z0-9](?:[a-z0-9-]*[a-z0-9])?)+";

/// Street address: house number followed by up to three name words and a
/// street token.
const ADDRESS: &str = r"(?i)\b\d{1,5}[a-z]?\s+(?:[a-z][a-z']*\s+){1,3}(?:street|st|avenue|ave|road|rd|boulevard|blvd|lane|ln|drive|dr|court|ct|place|pl|way)\b";

/// Bare social handle. The leading group excludes word characters and `@`
/// so the local part of an email address cannot double-match.
const HANDLE: &str = r"(?:^|[^\w@])@[a-zA-Z][a-zA-Z0-9_.]{2,30}\b";

/// Known platform profile URLs.
const PLATFORM_URL: &str = r"(?i)\b(?:instagram\.com|twitter\.com|x\.com|tiktok\.com|facebook\.com|snapchat\.com|t\.me)/[a-z0-9_.\-]+";

/// Contact-intent keywords used by the weak-proximity heuristic.
pub(super) const CONTACT_KEYWORDS: &str =
    r"(?i)\b(?:call|phone|text|dial|reach|contact|whatsapp)\b";

/// A loose digit run (6+ digits allowing separators) that the strict phone
/// patterns did not claim.
pub(super) const LOOSE_DIGIT_RUN: &str = r"\d(?:[\d\s.\-]){4,}\d";

pub(super) fn build_patterns(abuse_lexicon: &[String]) -> Vec<ScreenPattern> {
    let mut patterns = vec![
        ScreenPattern {
            regex: Regex::new(US_PHONE).expect("valid literal pattern"),
            flag: Flag::PhoneNumber,
            confidence: 1.0,
            simple: true,
        },
        ScreenPattern {
            regex: Regex::new(INTL_PHONE).expect("valid literal pattern"),
            flag: Flag::PhoneNumber,
            confidence: 1.0,
            simple: true,
        },
        ScreenPattern {
            regex: Regex::new(EMAIL).expect("valid literal pattern"),
            flag: Flag::EmailAddress,
            confidence: 1.0,
            simple: true,
        },
        ScreenPattern {
            regex: Regex::new(ADDRESS).expect("valid literal pattern"),
            flag: Flag::PhysicalAddress,
            confidence: 0.85,
            simple: false,
        },
        ScreenPattern {
            regex: Regex::new(HANDLE).expect("valid literal pattern"),
            flag: Flag::SocialMediaHandle,
            confidence: 0.85,
            simple: false,
        },
        ScreenPattern {
            regex: Regex::new(PLATFORM_URL).expect("valid literal pattern"),
            flag: Flag::SocialMediaHandle,
            confidence: 0.9,
            simple: false,
        },
    ];

    if let Some(abuse) = abuse_pattern(abuse_lexicon) {
        patterns.push(ScreenPattern {
            regex: abuse,
            flag: Flag::AbusiveLanguage,
            confidence: 0.8,
            simple: false,
        });
    }

    patterns
}

/// Word-boundary alternation over the configured lexicon.
pub(super) fn abuse_pattern(lexicon: &[String]) -> Option<Regex> {
    let words: Vec<String> = lexicon
        .iter()
        .filter(|w| !w.is_empty())
        .map(|w| regex::escape(w))
        .collect();
    if words.is_empty() {
        return None;
    }
    let pattern = format!(r"(?i)\b(?:{})\b", words.join("|"));
    Some(Regex::new(&pattern).expect("escaped words form a valid pattern"))
}
