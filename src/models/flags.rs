//! Canonical content-flag vocabulary.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A short token naming a detected sensitive category.
///
/// These flags are normalized across the pre-screener and the external
/// moderation providers. Provider-specific categories are mapped onto this
/// set during analysis; anything unmapped is carried through verbatim as
/// [`Flag::Other`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Flag {
    /// Phone numbers.
    PhoneNumber,
    /// Email addresses.
    EmailAddress,
    /// Physical addresses.
    PhysicalAddress,
    /// Social media handles and profile URLs.
    SocialMediaHandle,
    /// Abusive or insulting language.
    AbusiveLanguage,
    /// Generally inappropriate content.
    Inappropriate,
    /// Sexual content.
    Nsfw,
    /// Violence, gore, graphic content.
    Violence,
    /// Personally identifiable information not covered by a narrower flag.
    Pii,
    /// Analysis failure marker (fail-open for text, fail-closed for images).
    Error,

    // Catch-all for provider-specific flags - must be last for serde(untagged)
    /// Unmapped flag carried through from a provider, or an `image_`-scoped
    /// flag produced by the vision path.
    #[serde(untagged)]
    Other(String),
}

impl Flag {
    /// Scope a flag to the image path by prefixing it with `image_`.
    ///
    /// Flags produced by the vision provider are distinguished from
    /// text-origin flags so callers can tell which modality triggered them.
    pub fn image_scoped(&self) -> Flag {
        Flag::Other(format!("image_{}", self))
    }

    /// Returns true if this flag marks an analysis failure.
    pub fn is_error(&self) -> bool {
        matches!(self, Flag::Error)
    }
}

impl fmt::Display for Flag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Flag::PhoneNumber => write!(f, "phone_number"),
            Flag::EmailAddress => write!(f, "email_address"),
            Flag::PhysicalAddress => write!(f, "physical_address"),
            Flag::SocialMediaHandle => write!(f, "social_media_handle"),
            Flag::AbusiveLanguage => write!(f, "abusive_language"),
            Flag::Inappropriate => write!(f, "inappropriate"),
            Flag::Nsfw => write!(f, "nsfw"),
            Flag::Violence => write!(f, "violence"),
            Flag::Pii => write!(f, "pii"),
            Flag::Error => write!(f, "error"),
            Flag::Other(s) => write!(f, "{}", s),
        }
    }
}

impl From<&str> for Flag {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "phone_number" | "phone" => Flag::PhoneNumber,
            "email_address" | "email" => Flag::EmailAddress,
            "physical_address" | "address" => Flag::PhysicalAddress,
            "social_media_handle" | "social" | "social_media" => Flag::SocialMediaHandle,
            "abusive_language" | "abuse" | "abusive" => Flag::AbusiveLanguage,
            "inappropriate" => Flag::Inappropriate,
            "nsfw" | "sexual" => Flag::Nsfw,
            "violence" | "violent" => Flag::Violence,
            "pii" => Flag::Pii,
            "error" => Flag::Error,
            other => Flag::Other(other.to_string()),
        }
    }
}

/// Append `flag` to `flags` unless an equal flag is already present.
///
/// Verdict flag lists are order-stable sets: first occurrence wins, later
/// duplicates are dropped.
pub fn push_unique(flags: &mut Vec<Flag>, flag: Flag) {
    if !flags.contains(&flag) {
        flags.push(flag);
    }
}

/// Union `extra` into `flags`, preserving order of first occurrence.
pub fn union_flags(flags: &mut Vec<Flag>, extra: impl IntoIterator<Item = Flag>) {
    for flag in extra {
        push_unique(flags, flag);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_display() {
        assert_eq!(Flag::PhoneNumber.to_string(), "phone_number");
        assert_eq!(Flag::SocialMediaHandle.to_string(), "social_media_handle");
        assert_eq!(Flag::Other("weird".into()).to_string(), "weird");
    }

    #[test]
    fn test_flag_from_str_aliases() {
        assert_eq!(Flag::from("phone"), Flag::PhoneNumber);
        assert_eq!(Flag::from("EMAIL"), Flag::EmailAddress);
        assert_eq!(Flag::from("sexual"), Flag::Nsfw);
        assert_eq!(Flag::from("hate"), Flag::Other("hate".to_string()));
    }

    #[test]
    fn test_image_scoped() {
        assert_eq!(Flag::Nsfw.image_scoped().to_string(), "image_nsfw");
        assert_eq!(Flag::Error.image_scoped().to_string(), "image_error");
    }

    #[test]
    fn test_serde_round_trip() {
        let json = serde_json::to_string(&vec![
            Flag::PhoneNumber,
            Flag::Other("image_nsfw".into()),
        ])
        .unwrap();
        assert_eq!(json, r#"["phone_number","image_nsfw"]"#);

        let parsed: Vec<Flag> = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed[0], Flag::PhoneNumber);
        assert_eq!(parsed[1], Flag::Other("image_nsfw".into()));
    }

    #[test]
    fn test_push_unique_dedupes() {
        let mut flags = vec![Flag::PhoneNumber];
        push_unique(&mut flags, Flag::EmailAddress);
        push_unique(&mut flags, Flag::PhoneNumber);
        assert_eq!(flags, vec![Flag::PhoneNumber, Flag::EmailAddress]);
    }

    #[test]
    fn test_union_preserves_first_occurrence_order() {
        let mut flags = vec![Flag::Nsfw];
        union_flags(&mut flags, vec![Flag::Violence, Flag::Nsfw, Flag::Pii]);
        assert_eq!(flags, vec![Flag::Nsfw, Flag::Violence, Flag::Pii]);
    }
}
