//! Content fingerprints.
//!
//! A [`Fingerprint`] is a SHA-256 hash; a [`Digest`] pairs one with the byte
//! length of the hashed content. Digests identify blobs and directory trees
//! in the store, form process-cache keys, and drive early-cutoff comparisons
//! in the scheduler: equal digest means "nothing downstream needs to move".

use std::fmt;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest as _, Sha256};

/// A SHA-256 hash of a byte sequence.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(pub [u8; 32]);

impl Fingerprint {
    /// Hash the given bytes.
    pub fn of_bytes(bytes: &[u8]) -> Self {
        let hash = Sha256::digest(bytes);
        let mut buf = [0u8; 32];
        buf.copy_from_slice(&hash);
        Fingerprint(buf)
    }

    /// Lowercase hex rendering.
    pub fn to_hex(&self) -> String {
        let mut s = String::with_capacity(64);
        for b in &self.0 {
            s.push_str(&format!("{:02x}", b));
        }
        s
    }

    /// Parse a 64-char lowercase hex string.
    pub fn from_hex(hex: &str) -> Result<Self, String> {
        if hex.len() != 64 {
            return Err(format!("expected 64 hex chars, got {}", hex.len()));
        }
        let mut buf = [0u8; 32];
        for (i, chunk) in hex.as_bytes().chunks(2).enumerate() {
            let s = std::str::from_utf8(chunk).map_err(|e| e.to_string())?;
            buf[i] = u8::from_str_radix(s, 16).map_err(|e| e.to_string())?;
        }
        Ok(Fingerprint(buf))
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The first 8 hex chars are enough to tell fingerprints apart in logs.
        write!(f, "Fingerprint({}..)", &self.to_hex()[..8])
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let hex = String::deserialize(deserializer)?;
        Fingerprint::from_hex(&hex).map_err(D::Error::custom)
    }
}

/// A fingerprint plus the length of the fingerprinted content.
///
/// Carrying the length lets consumers size buffers without a round-trip and
/// makes accidental truncation detectable.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Digest {
    pub hash: Fingerprint,
    pub size_bytes: u64,
}

impl Digest {
    pub fn new(hash: Fingerprint, size_bytes: u64) -> Self {
        Digest { hash, size_bytes }
    }

    /// Digest of the given bytes.
    pub fn of_bytes(bytes: &[u8]) -> Self {
        Digest {
            hash: Fingerprint::of_bytes(bytes),
            size_bytes: bytes.len() as u64,
        }
    }

    /// Digest of the empty byte sequence.
    pub fn empty() -> Self {
        Digest::of_bytes(&[])
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", &self.hash.to_hex()[..16], self.size_bytes)
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({}, {})", &self.hash.to_hex()[..8], self.size_bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_deterministic() {
        let a = Fingerprint::of_bytes(b"hello");
        let b = Fingerprint::of_bytes(b"hello");
        assert_eq!(a, b);
        assert_ne!(a, Fingerprint::of_bytes(b"world"));
    }

    #[test]
    fn hex_round_trip() {
        let fp = Fingerprint::of_bytes(b"round trip");
        let parsed = Fingerprint::from_hex(&fp.to_hex()).unwrap();
        assert_eq!(fp, parsed);
    }

    #[test]
    fn from_hex_rejects_bad_input() {
        assert!(Fingerprint::from_hex("abc").is_err());
        assert!(Fingerprint::from_hex(&"zz".repeat(32)).is_err());
    }

    #[test]
    fn digest_tracks_length() {
        let d = Digest::of_bytes(b"12345");
        assert_eq!(d.size_bytes, 5);
        assert_eq!(Digest::empty().size_bytes, 0);
    }

    #[test]
    fn digest_serde_round_trip() {
        let d = Digest::of_bytes(b"serde");
        let json = serde_json::to_string(&d).unwrap();
        let back: Digest = serde_json::from_str(&json).unwrap();
        assert_eq!(d, back);
    }
}
