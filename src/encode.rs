//! Canonical on-disk records for the vector tree.
//!
//! Two content-addressed record types, both with a fixed little-endian
//! layout. The encoding is canonical and deterministic: identical logical
//! state always produces identical bytes, and therefore an identical
//! content hash. Flags and in-memory indices are never encoded.
//!
//! ## Layout
//!
//! ```text
//! Root record:
//!   depth:  u32 LE      branch levels below the root (0 = leaves at root)
//!   degree: u32 LE      branching factor, >= 2
//!   length: u32 LE      non-deleted leaves in the whole tree, > 0
//!   count:  u32 LE      number of element slots that follow
//!   count x element
//!
//! Branch record:
//!   length: u32 LE      non-deleted leaves in this subtree
//!   count:  u32 LE      number of element slots that follow
//!   count x element
//!
//! Element (33 bytes):
//!   deleted: u8         0 or 1
//!   hash:    32 bytes   child record hash (depth > 0) or payload hash
//! ```
//!
//! Deleted slots are retained in the encoded form (so peers can detect
//! position shifts) until a rebuild compacts them. Changing this layout
//! breaks the wire format.

use crate::error::{Error, Result};
use crate::hash::{Hash, HASH_LEN};

// ============================================================================
// Constants
// ============================================================================

/// Size of one encoded element slot: deleted byte + hash.
pub const ELEMENT_LEN: usize = 1 + HASH_LEN;

/// Fixed prefix of a root record: depth + degree + length + count.
pub const ROOT_FIXED_LEN: usize = 16;

/// Fixed prefix of a branch record: length + count.
pub const NODE_FIXED_LEN: usize = 8;

/// Upper bound on a plausible tree depth. A canonical tree over u32
/// lengths with degree >= 2 never exceeds 31 levels; anything beyond this
/// bound is a corrupted record.
pub const MAX_DEPTH: u32 = 64;

// ============================================================================
// Records
// ============================================================================

/// One encoded element slot: a deleted marker plus a content hash.
///
/// At depth > 0 the hash names a child branch record; at depth 0 it is an
/// element payload hash (all-zero for a nil slot).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodedElement {
    pub deleted: bool,
    pub hash: Hash,
}

/// The root record of a vector tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootRecord {
    pub depth: u32,
    pub degree: u32,
    pub length: u32,
    pub elements: Vec<EncodedElement>,
}

/// An interior branch record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRecord {
    pub length: u32,
    pub elements: Vec<EncodedElement>,
}

// ============================================================================
// Encoding
// ============================================================================

fn write_elements(elements: &[EncodedElement], out: &mut Vec<u8>) {
    out.extend_from_slice(&(elements.len() as u32).to_le_bytes());
    for el in elements {
        out.push(el.deleted as u8);
        out.extend_from_slice(el.hash.as_bytes());
    }
}

impl RootRecord {
    /// Encode into the canonical byte form.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(ROOT_FIXED_LEN + self.elements.len() * ELEMENT_LEN);
        out.extend_from_slice(&self.depth.to_le_bytes());
        out.extend_from_slice(&self.degree.to_le_bytes());
        out.extend_from_slice(&self.length.to_le_bytes());
        write_elements(&self.elements, &mut out);
        out
    }

    /// Decode and validate a root record.
    ///
    /// Rejects records with `length == 0`, `degree < 2`, an implausible
    /// depth, more slots than the degree allows, or a byte length that
    /// does not exactly match the declared slot count.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < ROOT_FIXED_LEN {
            return Err(Error::invalid_encoding(format!(
                "root record too small: {} bytes",
                data.len()
            )));
        }
        let depth = u32::from_le_bytes(data[0..4].try_into().expect("4-byte slice"));
        let degree = u32::from_le_bytes(data[4..8].try_into().expect("4-byte slice"));
        let length = u32::from_le_bytes(data[8..12].try_into().expect("4-byte slice"));
        let count = u32::from_le_bytes(data[12..16].try_into().expect("4-byte slice"));

        if length == 0 {
            return Err(Error::invalid_encoding("root record with zero length"));
        }
        if degree < 2 {
            return Err(Error::invalid_encoding(format!(
                "root record with degree {degree}"
            )));
        }
        if depth > MAX_DEPTH {
            return Err(Error::invalid_encoding(format!(
                "root record with implausible depth {depth}"
            )));
        }
        let elements = decode_elements(&data[ROOT_FIXED_LEN..], count, degree)?;
        Ok(RootRecord {
            depth,
            degree,
            length,
            elements,
        })
    }
}

impl NodeRecord {
    /// Encode into the canonical byte form.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(NODE_FIXED_LEN + self.elements.len() * ELEMENT_LEN);
        out.extend_from_slice(&self.length.to_le_bytes());
        write_elements(&self.elements, &mut out);
        out
    }

    /// Decode and validate a branch record.
    ///
    /// `degree` is the tree's branching factor, taken from the root
    /// record; a branch may not carry more slots than that. A zero
    /// `length` is legal here: it marks a subtree whose leaves have all
    /// been deleted but not yet compacted.
    pub fn decode(data: &[u8], degree: u32) -> Result<Self> {
        if data.len() < NODE_FIXED_LEN {
            return Err(Error::invalid_encoding(format!(
                "branch record too small: {} bytes",
                data.len()
            )));
        }
        let length = u32::from_le_bytes(data[0..4].try_into().expect("4-byte slice"));
        let count = u32::from_le_bytes(data[4..8].try_into().expect("4-byte slice"));
        let elements = decode_elements(&data[NODE_FIXED_LEN..], count, degree)?;
        Ok(NodeRecord { length, elements })
    }
}

/// Decode exactly `count` element slots, rejecting trailing bytes.
fn decode_elements(data: &[u8], count: u32, degree: u32) -> Result<Vec<EncodedElement>> {
    if count > degree {
        return Err(Error::invalid_encoding(format!(
            "{count} element slots exceed degree {degree}"
        )));
    }
    let expected = count as usize * ELEMENT_LEN;
    if data.len() != expected {
        return Err(Error::invalid_encoding(format!(
            "element section is {} bytes, expected {expected} for {count} slots",
            data.len()
        )));
    }
    let mut elements = Vec::with_capacity(count as usize);
    for chunk in data.chunks_exact(ELEMENT_LEN) {
        let deleted = match chunk[0] {
            0 => false,
            1 => true,
            other => {
                return Err(Error::invalid_encoding(format!(
                    "invalid deleted marker: 0x{other:02x}"
                )));
            }
        };
        let hash = Hash::from_bytes(chunk[1..].try_into().expect("32-byte slice"));
        elements.push(EncodedElement { deleted, hash });
    }
    Ok(elements)
}

// ============================================================================
// Tests
// ============================================================================
