//! # merkle-refs
//!
//! Content-addressed Merkle reference vector: a persistent, lazily-loaded
//! sequence of fixed-size SHA-256 hashes organized as a balanced tree of
//! configurable degree, designed to be shared over a network such that
//! small mutations produce small deltas.
//!
//! This crate is the storage-engine core of a larger content-addressed
//! object store; the surrounding node, RPC and CLI surface lives
//! elsewhere. The vector consumes a minimal backing store — the
//! [`Pack`] trait, exposing `get`, `add` and a one-shot `flags()` — and
//! all policy above that (serving, subscription, replication) is the
//! caller's concern.
//!
//! ## Design principles
//!
//! 1. **Dual representation**: persistent Merkle form in the pack,
//!    mutable cached form in memory, round-tripping losslessly.
//! 2. **Lazy by default**: branches materialize on first traversal;
//!    [`Flags::ENTIRE_REFS`] loads the whole tree at initialization and
//!    [`Flags::HASH_TABLE_INDEX`] additionally maintains an exhaustive
//!    hash -> element index.
//! 3. **Single owner**: the vector is not thread safe by contract, and
//!    all operations are synchronous; the pack is the only I/O seam.
//!
//! ## Example
//!
//! ```
//! use merkle_refs::{Hash, MemoryPack, Refs};
//!
//! let pack = MemoryPack::new();
//! let mut refs = Refs::with_degree(4);
//!
//! let hashes: Vec<Hash> = (0u8..10).map(|i| Hash::digest(&[i])).collect();
//! refs.append_hashes(&pack, &hashes)?;
//!
//! assert_eq!(refs.len(&pack)?, 10);
//! assert_eq!(refs.hash_by_index(&pack, 7)?, hashes[7]);
//!
//! // rehydrate from the root hash alone
//! let mut again = Refs::from_hash(refs.hash());
//! assert_eq!(again.len(&pack)?, 10);
//! # Ok::<(), merkle_refs::Error>(())
//! ```

pub mod encode;
pub mod error;
pub mod hash;
mod iter;
pub mod pack;
mod refs;
mod tree;

pub use encode::{EncodedElement, NodeRecord, RootRecord};
pub use error::{Error, Result};
pub use hash::{Hash, HASH_LEN};
pub use iter::IterAction;
pub use pack::{Flags, MemoryPack, Pack};
pub use refs::{Refs, DEFAULT_DEGREE};
