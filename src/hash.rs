//! Content hash type for vector elements and tree records.
//!
//! `Hash` wraps a raw SHA-256 digest. The all-zero value is a sentinel
//! with two meanings depending on context: a blank vector (root hash) or
//! a nil element slot.
//!
//! ## String form
//!
//! Lowercase hex, as produced by [`Hash::to_hex`] and `Display`. This is
//! what appears in logs and APIs.
//!
//! ## Binary form
//!
//! The raw 32 bytes, used in the encoded tree records and in binary serde.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::Digest;
use std::fmt;

/// Length of a content hash in bytes.
pub const HASH_LEN: usize = 32;

/// A SHA-256 content hash.
///
/// Serde representation follows the human-readable split: hex string in
/// JSON-like formats, raw bytes in binary formats.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Hash([u8; HASH_LEN]);

impl Hash {
    /// The all-zero sentinel hash.
    pub const ZERO: Hash = Hash([0u8; HASH_LEN]);

    /// Hash `bytes` with SHA-256.
    pub fn digest(bytes: &[u8]) -> Self {
        let digest = sha2::Sha256::digest(bytes);
        let mut out = [0u8; HASH_LEN];
        out.copy_from_slice(&digest);
        Hash(out)
    }

    /// Wrap an existing digest.
    pub fn from_bytes(bytes: [u8; HASH_LEN]) -> Self {
        Hash(bytes)
    }

    /// Borrow the raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }

    /// Whether this is the all-zero sentinel.
    pub fn is_zero(&self) -> bool {
        *self == Hash::ZERO
    }

    /// Lowercase hex form (64 characters).
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse a 64-character hex string.
    ///
    /// Returns `None` if the input is not exactly 32 hex-encoded bytes.
    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        let digest: [u8; HASH_LEN] = bytes.try_into().ok()?;
        Some(Hash(digest))
    }

    /// Short display form: the first 7 hex characters.
    pub fn short(&self) -> String {
        let mut s = self.to_hex();
        s.truncate(7);
        s
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", self.short())
    }
}

impl From<[u8; HASH_LEN]> for Hash {
    fn from(bytes: [u8; HASH_LEN]) -> Self {
        Hash(bytes)
    }
}

impl Serialize for Hash {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.serialize_str(&self.to_hex())
        } else {
            serializer.serialize_bytes(&self.0)
        }
    }
}

impl<'de> Deserialize<'de> for Hash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        if deserializer.is_human_readable() {
            let s = String::deserialize(deserializer)?;
            Hash::from_hex(&s)
                .ok_or_else(|| serde::de::Error::custom(format!("invalid hash hex: {s}")))
        } else {
            let bytes = <Vec<u8>>::deserialize(deserializer)?;
            let digest: [u8; HASH_LEN] = bytes
                .try_into()
                .map_err(|_| serde::de::Error::custom("hash must be 32 bytes"))?;
            Ok(Hash(digest))
        }
    }
}
