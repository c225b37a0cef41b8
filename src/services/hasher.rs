//! Content hashing for version deduplication.
//!
//! Unlike text deduplication, file content is hashed byte for byte with no
//! normalization: two versions are the same only when their bytes are.

use sha2::{Digest, Sha256};

/// SHA-256 content hasher.
///
/// # Example
///
/// ```rust
/// use stowage::services::ContentHasher;
///
/// let hash = ContentHasher::hash(b"hello");
/// assert_eq!(hash.len(), 64);
/// assert_eq!(ContentHasher::short(&hash), &hash[..12]);
/// ```
pub struct ContentHasher;

impl ContentHasher {
    /// Returns the lowercase hex SHA-256 of `content` (64 characters).
    #[must_use]
    pub fn hash(content: &[u8]) -> String {
        hex::encode(Sha256::digest(content))
    }

    /// Returns `true` if `content` hashes to `expected` (case-insensitive).
    #[must_use]
    pub fn verify(content: &[u8], expected: &str) -> bool {
        Self::hash(content).eq_ignore_ascii_case(expected)
    }

    /// Twelve-character prefix for log lines.
    #[must_use]
    pub fn short(hash: &str) -> &str {
        hash.get(..12).unwrap_or(hash)
    }
}
