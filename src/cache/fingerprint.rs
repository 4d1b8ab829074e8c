//! Request fingerprinting for the verdict cache.
//!
//! A fingerprint condenses the semantically significant parts of a request
//! into a stable 64-bit FNV-1a hash: a sampled text digest, the compact
//! policy encoding, the tail of the conversation history, the image digest
//! when an image is present, and the model tier. Two requests that would
//! produce the same verdict collapse onto the same key; long texts are
//! sampled rather than hashed whole so fingerprinting stays O(1).

use crate::models::{FilterRequest, HistoryMessage};

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Texts longer than this are sampled instead of digested whole.
const SAMPLE_THRESHOLD_CHARS: usize = 100;

/// Length of each head/middle/tail text sample.
const SAMPLE_SLICE_CHARS: usize = 40;

/// Images at or above this size are sampled head/middle/tail.
const IMAGE_SAMPLE_THRESHOLD: usize = 3 * 1024;

/// Size of each image sample window.
const IMAGE_SAMPLE_BYTES: usize = 1024;

/// How many trailing history entries participate in the fingerprint.
const HISTORY_TAIL: usize = 3;

/// Truncation length for each participating history entry.
const HISTORY_SLICE_CHARS: usize = 20;

/// Incremental FNV-1a hasher.
#[derive(Debug, Clone, Copy)]
struct Fnv1a(u64);

impl Fnv1a {
    fn new() -> Self {
        Self(FNV_OFFSET_BASIS)
    }

    fn write(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            self.0 ^= u64::from(byte);
            self.0 = self.0.wrapping_mul(FNV_PRIME);
        }
    }

    /// Component separator so adjacent fields cannot alias.
    fn delimit(&mut self) {
        self.write(&[0]);
    }

    fn finish(self) -> u64 {
        self.0
    }
}

/// A stable request fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint(u64);

impl Fingerprint {
    /// Compute the fingerprint of a canonicalised request.
    ///
    /// `image_digest` must be supplied when the request carries an image;
    /// the digest is computed once by the image path and shared with the
    /// cache so the payload is not walked twice.
    pub fn compute(request: &FilterRequest, image_digest: Option<ImageDigest>) -> Self {
        let mut hasher = Fnv1a::new();

        sample_text(&request.text, &mut hasher);
        hasher.delimit();

        hasher.write(request.policy.compact_encoding().as_bytes());
        hasher.delimit();

        for message in history_tail(&request.history) {
            let truncated: String = message.text().chars().take(HISTORY_SLICE_CHARS).collect();
            hasher.write(truncated.as_bytes());
            hasher.delimit();
        }

        if let Some(digest) = image_digest {
            hasher.write(&digest.0.to_le_bytes());
            hasher.delimit();
        }

        hasher.write(request.tier.as_str().as_bytes());

        Fingerprint(hasher.finish())
    }

    /// The KV key for this fingerprint. Folded to 32 bits of hex, which is
    /// plenty for a cache keyed by TTL-bounded entries.
    pub fn cache_key(&self) -> String {
        let folded = (self.0 >> 32) as u32 ^ self.0 as u32;
        format!("cache:verdict:{:08x}", folded)
    }
}

/// Stable digest of image bytes. Whole-content below the sampling
/// threshold, head/middle/tail 1 kB windows above it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageDigest(u64);

impl ImageDigest {
    pub fn of(bytes: &[u8]) -> Self {
        let mut hasher = Fnv1a::new();

        if bytes.len() >= IMAGE_SAMPLE_THRESHOLD {
            let middle_start = bytes.len() / 2 - IMAGE_SAMPLE_BYTES / 2;
            hasher.write(&bytes[..IMAGE_SAMPLE_BYTES]);
            hasher.write(&bytes[middle_start..middle_start + IMAGE_SAMPLE_BYTES]);
            hasher.write(&bytes[bytes.len() - IMAGE_SAMPLE_BYTES..]);
            // Sampled digests also bind the total length so a crop that
            // preserves the windows still misses.
            hasher.write(&(bytes.len() as u64).to_le_bytes());
        } else {
            hasher.write(bytes);
        }

        ImageDigest(hasher.finish())
    }
}

fn history_tail(history: &[HistoryMessage]) -> &[HistoryMessage] {
    let skip = history.len().saturating_sub(HISTORY_TAIL);
    &history[skip..]
}

/// Feed the sampled text digest into the hasher: whole text when short,
/// head/middle/tail slices when long.
fn sample_text(text: &str, hasher: &mut Fnv1a) {
    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= SAMPLE_THRESHOLD_CHARS {
        hasher.write(text.as_bytes());
        return;
    }

    let middle_start = chars.len() / 2 - SAMPLE_SLICE_CHARS / 2;
    for range in [
        0..SAMPLE_SLICE_CHARS,
        middle_start..middle_start + SAMPLE_SLICE_CHARS,
        chars.len() - SAMPLE_SLICE_CHARS..chars.len(),
    ] {
        let slice: String = chars[range].iter().collect();
        hasher.write(slice.as_bytes());
    }
    hasher.write(&(chars.len() as u64).to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FilterRequest, ModelTier, ModerationPolicy};

    fn request(text: &str) -> FilterRequest {
        FilterRequest {
            text: text.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_same_request_same_fingerprint() {
        let a = Fingerprint::compute(&request("hello world"), None);
        let b = Fingerprint::compute(&request("hello world"), None);
        assert_eq!(a, b);
    }

    #[test]
    fn test_text_changes_fingerprint() {
        let a = Fingerprint::compute(&request("hello world"), None);
        let b = Fingerprint::compute(&request("hello there"), None);
        assert_ne!(a, b);
    }

    #[test]
    fn test_policy_changes_fingerprint() {
        let mut permissive = request("call me maybe");
        permissive.policy = ModerationPolicy {
            allow_phone: true,
            ..Default::default()
        };
        let a = Fingerprint::compute(&request("call me maybe"), None);
        let b = Fingerprint::compute(&permissive, None);
        assert_ne!(a, b);
    }

    #[test]
    fn test_tier_changes_fingerprint() {
        let mut pro = request("hello");
        pro.tier = ModelTier::Pro;
        assert_ne!(
            Fingerprint::compute(&request("hello"), None),
            Fingerprint::compute(&pro, None)
        );
    }

    #[test]
    fn test_only_history_tail_participates() {
        let mut a = request("hi");
        a.history = ["one", "two", "three", "four", "five"]
            .into_iter()
            .map(|s| HistoryMessage(s.to_string()))
            .collect();

        // Same last three entries, different earlier history.
        let mut b = request("hi");
        b.history = ["zero", "different", "three", "four", "five"]
            .into_iter()
            .map(|s| HistoryMessage(s.to_string()))
            .collect();

        assert_eq!(
            Fingerprint::compute(&a, None),
            Fingerprint::compute(&b, None)
        );

        // Changing an entry inside the tail must change the key.
        let mut c = request("hi");
        c.history = ["one", "two", "three", "four", "CHANGED"]
            .into_iter()
            .map(|s| HistoryMessage(s.to_string()))
            .collect();
        assert_ne!(
            Fingerprint::compute(&a, None),
            Fingerprint::compute(&c, None)
        );
    }

    #[test]
    fn test_long_text_sampling_is_stable() {
        let long: String = "abcdefghij".repeat(30);
        let a = Fingerprint::compute(&request(&long), None);
        let b = Fingerprint::compute(&request(&long), None);
        assert_eq!(a, b);
    }

    #[test]
    fn test_long_text_edits_in_sampled_regions_change_key() {
        let base: String = "abcdefghij".repeat(30);
        let mut head_edit = base.clone();
        head_edit.replace_range(0..1, "Z");

        assert_ne!(
            Fingerprint::compute(&request(&base), None),
            Fingerprint::compute(&request(&head_edit), None)
        );
    }

    #[test]
    fn test_image_digest_distinguishes_payloads() {
        let a = ImageDigest::of(&[1u8; 512]);
        let b = ImageDigest::of(&[2u8; 512]);
        assert_ne!(a, b);
        assert_eq!(a, ImageDigest::of(&[1u8; 512]));
    }

    #[test]
    fn test_large_image_sampled_digest_stable() {
        let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        assert_eq!(ImageDigest::of(&payload), ImageDigest::of(&payload));

        // A change in the middle window must flip the digest.
        let mut tweaked = payload.clone();
        tweaked[5_000] ^= 0xff;
        assert_ne!(ImageDigest::of(&payload), ImageDigest::of(&tweaked));
    }

    #[test]
    fn test_image_presence_changes_fingerprint() {
        let digest = ImageDigest::of(b"png bytes");
        assert_ne!(
            Fingerprint::compute(&request("hi"), None),
            Fingerprint::compute(&request("hi"), Some(digest))
        );
    }

    #[test]
    fn test_cache_key_shape() {
        let key = Fingerprint::compute(&request("hi"), None).cache_key();
        assert!(key.starts_with("cache:verdict:"));
        assert_eq!(key.len(), "cache:verdict:".len() + 8);
    }
}
