//! Backing-store seam: the `Pack` trait, initialization flags, and an
//! in-memory implementation.
//!
//! A `Pack` is the minimal content-addressed blob store the vector reads
//! and writes. Everything above it (serving, subscription, replication) is
//! the caller's concern. Implementations are expected to use interior
//! mutability: `get` is idempotent, `add` is a write-through to a cache
//! that returns the canonical hash of the bytes.

use crate::error::{Error, Result};
use crate::hash::Hash;
use std::collections::HashMap;
use std::fmt::Debug;
use std::ops::BitOr;
use std::sync::{Arc, RwLock};

// ============================================================================
// Flags
// ============================================================================

/// Initialization flags a `Pack` hands to the vector on first use.
///
/// The flags are captured once per vector instance and frozen; they are
/// never stored in the encoded records or sent over the network. Bits
/// outside the defined set are reserved and ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Flags(u32);

impl Flags {
    /// No flags set: fully lazy loading, no hash index.
    pub const NONE: Flags = Flags(0);

    /// Maintain an exhaustive hash -> element index for O(1) lookups by
    /// hash. Implies loading the entire tree at initialization.
    pub const HASH_TABLE_INDEX: Flags = Flags(1);

    /// Load the entire tree eagerly at initialization instead of lazily
    /// materializing branches on first traversal.
    pub const ENTIRE_REFS: Flags = Flags(1 << 1);

    const KNOWN: u32 = 0b11;

    /// Raw bit value.
    pub fn bits(self) -> u32 {
        self.0
    }

    /// Construct from raw bits (reserved bits are kept as-is; use
    /// [`Flags::known`] to mask them away).
    pub fn from_bits(bits: u32) -> Flags {
        Flags(bits)
    }

    /// Whether all bits of `other` are set in `self`.
    pub fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }

    /// The defined bits only; reserved bits are dropped.
    pub fn known(self) -> Flags {
        Flags(self.0 & Self::KNOWN)
    }

    /// Whether no defined bit is set.
    pub fn is_empty(self) -> bool {
        self.0 & Self::KNOWN == 0
    }
}

impl BitOr for Flags {
    type Output = Flags;

    fn bitor(self, rhs: Flags) -> Flags {
        Flags(self.0 | rhs.0)
    }
}

// ============================================================================
// Pack trait
// ============================================================================

/// Content-addressed blob store consumed by the vector.
pub trait Pack: Debug {
    /// Initialization flags, read once at a vector's first use.
    fn flags(&self) -> Flags;

    /// Retrieve a previously-added blob.
    ///
    /// Returns `Error::NotFound` if the hash is unknown.
    fn get(&self, hash: &Hash) -> Result<Vec<u8>>;

    /// Content-addressed insertion: store `bytes` and return their hash.
    ///
    /// Must be idempotent — adding the same bytes twice returns the same
    /// hash and is a no-op on the store.
    fn add(&self, bytes: &[u8]) -> Result<Hash>;
}

// ============================================================================
// MemoryPack
// ============================================================================

/// A simple in-memory pack for testing and embedding.
///
/// Stores blobs in a HashMap with interior mutability (via
/// `Arc<RwLock<...>>`), so clones share the same underlying store.
#[derive(Debug, Clone, Default)]
pub struct MemoryPack {
    flags: Flags,
    data: Arc<RwLock<HashMap<Hash, Vec<u8>>>>,
}

impl MemoryPack {
    /// Create a new empty pack with no flags set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new empty pack that reports the given flags.
    pub fn with_flags(flags: Flags) -> Self {
        MemoryPack {
            flags,
            ..Self::default()
        }
    }

    /// A view over the same underlying store reporting different flags.
    ///
    /// Useful for rehydrating a vector from the same data under another
    /// initialization policy.
    pub fn view_with_flags(&self, flags: Flags) -> MemoryPack {
        MemoryPack {
            flags,
            data: Arc::clone(&self.data),
        }
    }

    /// Number of stored blobs.
    pub fn len(&self) -> usize {
        self.data.read().expect("RwLock poisoned").len()
    }

    /// Whether the pack holds no blobs.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a blob with the given hash is present.
    pub fn contains(&self, hash: &Hash) -> bool {
        self.data
            .read()
            .expect("RwLock poisoned")
            .contains_key(hash)
    }
}

impl Pack for MemoryPack {
    fn flags(&self) -> Flags {
        self.flags
    }

    fn get(&self, hash: &Hash) -> Result<Vec<u8>> {
        self.data
            .read()
            .expect("RwLock poisoned")
            .get(hash)
            .cloned()
            .ok_or(Error::NotFound)
    }

    fn add(&self, bytes: &[u8]) -> Result<Hash> {
        let hash = Hash::digest(bytes);
        self.data
            .write()
            .expect("RwLock poisoned")
            .insert(hash, bytes.to_vec());
        Ok(hash)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_pack_add_get() {
        let pack = MemoryPack::new();
        let hash = pack.add(b"hello world").unwrap();

        let bytes = pack.get(&hash).unwrap();
        assert_eq!(bytes, b"hello world");
        assert!(pack.contains(&hash));
    }

    #[test]
    fn test_memory_pack_not_found() {
        let pack = MemoryPack::new();
        let result = pack.get(&Hash::digest(b"missing"));
        assert!(matches!(result, Err(Error::NotFound)));
    }

    #[test]
    fn test_memory_pack_add_is_idempotent() {
        let pack = MemoryPack::new();
        let h1 = pack.add(b"same bytes").unwrap();
        let h2 = pack.add(b"same bytes").unwrap();
        assert_eq!(h1, h2);
        assert_eq!(pack.len(), 1);
    }

    #[test]
    fn test_memory_pack_flags() {
        let pack = MemoryPack::with_flags(Flags::HASH_TABLE_INDEX);
        assert!(pack.flags().contains(Flags::HASH_TABLE_INDEX));
        assert!(!pack.flags().contains(Flags::ENTIRE_REFS));
    }

    #[test]
    fn test_view_with_flags_shares_data() {
        let pack = MemoryPack::new();
        let hash = pack.add(b"shared").unwrap();

        let view = pack.view_with_flags(Flags::ENTIRE_REFS);
        assert_eq!(view.get(&hash).unwrap(), b"shared");
        assert!(view.flags().contains(Flags::ENTIRE_REFS));
        assert!(pack.flags().is_empty());
    }

    #[test]
    fn test_flags_known_masks_reserved_bits() {
        let flags = Flags::from_bits(0xFF);
        assert_eq!(flags.known(), Flags::HASH_TABLE_INDEX | Flags::ENTIRE_REFS);
        assert!(Flags::from_bits(1 << 8).known().is_empty());
    }
}
