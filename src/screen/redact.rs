//! Local redaction of simple patterns.
//!
//! Phone numbers and email addresses are mechanical enough to mask without
//! asking a model: every match is replaced by a `*` run of equal length so
//! the message shape survives.

use std::borrow::Cow;

use once_cell::sync::Lazy;
use regex::Regex;

use super::patterns::{EMAIL, INTL_PHONE, US_PHONE};

static SIMPLE_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [US_PHONE, INTL_PHONE, EMAIL]
        .into_iter()
        .map(|p| Regex::new(p).expect("valid literal pattern"))
        .collect()
});

/// Mask every phone/email match. Returns `None` when nothing matched.
pub fn mask_simple_patterns(text: &str) -> Option<String> {
    let mut masked: Cow<'_, str> = Cow::Borrowed(text);
    for pattern in SIMPLE_PATTERNS.iter() {
        if pattern.is_match(&masked) {
            let replaced = pattern
                .replace_all(&masked, |caps: &regex::Captures<'_>| {
                    "*".repeat(caps[0].chars().count())
                })
                .into_owned();
            masked = Cow::Owned(replaced);
        }
    }

    match masked {
        Cow::Borrowed(_) => None,
        Cow::Owned(out) => Some(out),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_masks_phone_with_equal_length() {
        let masked = mask_simple_patterns("Call me at 555-123-4567").unwrap();
        assert_eq!(masked, format!("Call me at {}", "*".repeat(12)));
    }

    #[test]
    fn test_masks_email() {
        let masked = mask_simple_patterns("write to a@b.co please").unwrap();
        assert_eq!(masked, "write to ****** please");
    }

    #[test]
    fn test_masks_multiple_occurrences() {
        let masked = mask_simple_patterns("a@b.co or c@d.org").unwrap();
        assert!(!masked.contains('@'));
        assert_eq!(masked.len(), "a@b.co or c@d.org".len());
    }

    #[test]
    fn test_no_match_returns_none() {
        assert!(mask_simple_patterns("nothing sensitive here").is_none());
    }
}
