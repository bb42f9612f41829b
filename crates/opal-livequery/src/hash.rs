//! Content-addressed response fingerprints.
//!
//! A [`ResponseHash`] is the Blake2b-256 digest of the raw serialized
//! payload bytes of one cohort's response. Only the 32-byte digest is
//! retained between ticks — never the payload itself — which is what keeps
//! per-subscription memory bounded.

use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use serde::{Serialize, Serializer};

type Blake2b256 = Blake2b<U32>;

/// Blake2b-256 digest of a serialized response payload.
///
/// Equality is bytewise on the digest. The diagnostic form (`Display`,
/// `Serialize`) is the lowercase hex digest.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResponseHash([u8; 32]);

impl ResponseHash {
    /// Hashes a serialized payload. Deterministic and pure.
    #[must_use]
    pub fn of(bytes: &[u8]) -> Self {
        let mut hasher = Blake2b256::new();
        hasher.update(bytes);
        Self(hasher.finalize().into())
    }

    /// The raw 32-byte digest.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Display for ResponseHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for ResponseHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ResponseHash({self})")
    }
}

impl Serialize for ResponseHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_deterministic() {
        // The hash depends only on the input bytes.
        let a = ResponseHash::of(b"payload");
        let b = ResponseHash::of(b"payload");
        assert_eq!(a, b);
    }

    #[test]
    fn test_hash_distinguishes_payloads() {
        let a = ResponseHash::of(b"payload-a");
        let b = ResponseHash::of(b"payload-b");
        assert_ne!(a, b);
    }

    #[test]
    fn test_hash_empty_input() {
        let a = ResponseHash::of(b"");
        let b = ResponseHash::of(b"");
        assert_eq!(a, b);
        assert_ne!(a, ResponseHash::of(b"x"));
    }

    #[test]
    fn test_hash_hex_display() {
        let h = ResponseHash::of(b"payload");
        let hex = h.to_string();
        assert_eq!(hex.len(), 64);
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(hex, hex.to_lowercase());
    }

    #[test]
    fn test_hash_serialize_as_hex() {
        let h = ResponseHash::of(b"payload");
        let json = serde_json::to_value(h).unwrap();
        assert_eq!(json, serde_json::Value::String(h.to_string()));
    }
}
