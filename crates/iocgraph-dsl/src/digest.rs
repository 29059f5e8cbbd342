//! Versioned content digests for the loaded-file ledger.
//!
//! The interpreter records every file it reads as `name -> digest` so the
//! orchestrator can decide whether a cached interpretation is still valid.
//! Digests are serialized with a version prefix:
//!
//! - algorithm: SHA-256
//! - input: the raw bytes of the file as-read
//! - output: `"sha256:<64 lowercase hex digits>"`
//!
//! Callers must treat digest strings as opaque identity tokens; the prefix
//! exists so the encoding can be upgraded without ambiguity.

use sha2::{Digest, Sha256};

/// Prefix used in serialized digests.
pub const CONTENT_DIGEST_PREFIX: &str = "sha256:";

/// Compute the digest for arbitrary bytes.
pub fn content_digest(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let out = hasher.finalize();
    let mut hex = String::with_capacity(CONTENT_DIGEST_PREFIX.len() + 64);
    hex.push_str(CONTENT_DIGEST_PREFIX);
    for byte in out {
        use std::fmt::Write;
        let _ = write!(hex, "{byte:02x}");
    }
    hex
}

/// Compute the digest for UTF-8 text (startup scripts, database files).
pub fn text_digest(text: &str) -> String {
    content_digest(text.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_has_expected_prefix_and_width() {
        let d = text_digest("record(ai, \"A\") {}\n");
        assert!(d.starts_with(CONTENT_DIGEST_PREFIX));
        assert_eq!(d.len(), CONTENT_DIGEST_PREFIX.len() + 64);
    }

    #[test]
    fn digest_changes_when_content_changes() {
        assert_ne!(text_digest("a"), text_digest("b"));
    }

    #[test]
    fn digest_is_deterministic() {
        assert_eq!(text_digest("same"), text_digest("same"));
    }
}
