//! Content hashing for exact-duplicate detection.
//!
//! Text is normalized (trimmed, internal whitespace runs collapsed to one
//! space) before hashing, so re-posts that only differ in spacing collide.

use sha2::{Digest, Sha256};

/// Trim and collapse every run of whitespace to a single space.
pub fn normalize(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Lowercase hex SHA-256 of the normalized text.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize(text).as_bytes());
    hex::encode(hasher.finalize())
}
