//! Image payload preparation.
//!
//! Requests carry images as opaque base64. Preparation decodes the
//! payload, enforces the size cap, sniffs the media type from magic
//! bytes, and computes the stable digest the cache fingerprint binds.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use thiserror::Error;

use crate::cache::ImageDigest;

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("Image payload is not valid base64")]
    InvalidBase64,

    #[error("Image is empty")]
    Empty,

    #[error("Image is {size} bytes, limit is {max}")]
    TooLarge { size: usize, max: usize },
}

/// A decoded, size-checked image ready for the vision provider.
#[derive(Debug, Clone)]
pub struct PreparedImage {
    pub bytes: Vec<u8>,
    pub mime: &'static str,
    pub digest: ImageDigest,
}

/// Decode and validate an image payload.
pub fn prepare_image(encoded: &str, max_bytes: usize) -> Result<PreparedImage, ImageError> {
    // Tolerate data-URL prefixes from browser clients.
    let encoded = encoded
        .split_once(";base64,")
        .map(|(_, data)| data)
        .unwrap_or(encoded);

    let bytes = BASE64
        .decode(encoded.trim())
        .map_err(|_| ImageError::InvalidBase64)?;

    if bytes.is_empty() {
        return Err(ImageError::Empty);
    }
    if bytes.len() > max_bytes {
        return Err(ImageError::TooLarge {
            size: bytes.len(),
            max: max_bytes,
        });
    }

    let mime = sniff_mime(&bytes);
    let digest = ImageDigest::of(&bytes);

    Ok(PreparedImage {
        bytes,
        mime,
        digest,
    })
}

/// Media type from magic bytes; JPEG is the conservative default since
/// providers accept it for anything photographic.
fn sniff_mime(bytes: &[u8]) -> &'static str {
    if bytes.starts_with(&[0x89, b'P', b'N', b'G']) {
        "image/png"
    } else if bytes.starts_with(&[0xff, 0xd8, 0xff]) {
        "image/jpeg"
    } else if bytes.starts_with(b"GIF8") {
        "image/gif"
    } else if bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        "image/webp"
    } else {
        "image/jpeg"
    }
}
