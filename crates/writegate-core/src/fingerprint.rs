//! Request fingerprints.
//!
//! ```text
//! request_hash = hex(SHA256(domain + ":" + body))
//! ```
//!
//! The domain separates endpoints so that the same body posted to two scopes
//! never produces the same hash.

use sha2::{Digest, Sha256};

/// Lower-case SHA-256 hex over `domain:body`.
pub fn request_hash(domain: &str, body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(domain.as_bytes());
    hasher.update(b":");
    hasher.update(body);
    hex::encode(hasher.finalize())
}

/// Short, non-reversible label for a caller-supplied key, safe to log.
pub(crate) fn log_label(key: &str) -> String {
    let hash = Sha256::digest(key.as_bytes());
    hex::encode(hash)[..12].to_string()
}
