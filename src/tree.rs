//! In-memory tree model: arena-indexed branches and leaf slots.
//!
//! The root owns two arenas; nodes refer to each other by index, with
//! non-owning parent back-links used for index-in-tree reconstruction and
//! length bubbling. Arenas are only compacted by a rebuild or a clear.

use crate::hash::Hash;

/// Index of a leaf slot in the root's leaf arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct LeafId(pub(crate) usize);

/// Index of a branch in the root's branch arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct BranchId(pub(crate) usize);

/// One element slot: deleted marker, content hash (all-zero for a nil
/// slot), and the containing branch (`None` when the leaf hangs directly
/// off the root).
#[derive(Debug, Clone)]
pub(crate) struct Leaf {
    pub(crate) hash: Hash,
    pub(crate) deleted: bool,
    pub(crate) parent: Option<BranchId>,
}

/// An interior tree node.
#[derive(Debug, Clone)]
pub(crate) struct Branch {
    /// Content hash of this node's encoded record.
    pub(crate) hash: Hash,
    /// Deleted slots decoded from a record are preserved for re-encoding
    /// but never loaded or traversed.
    pub(crate) deleted: bool,
    pub(crate) parent: Option<BranchId>,
    pub(crate) state: BranchState,
}

/// Load state of a branch. The loader transitions `Stub -> Loaded`; no
/// other direction exists short of a clear or rebuild.
#[derive(Debug, Clone)]
pub(crate) enum BranchState {
    /// Hash known, record not fetched yet.
    Stub,
    /// Record materialized: subtree length and child slots.
    Loaded {
        length: usize,
        children: Children,
    },
}

/// Child slots of a node: leaves at depth 0, branches above.
#[derive(Debug, Clone)]
pub(crate) enum Children {
    Leaves(Vec<LeafId>),
    Branches(Vec<BranchId>),
}

impl Branch {
    pub(crate) fn is_stub(&self) -> bool {
        matches!(self.state, BranchState::Stub)
    }
}

impl Children {
    pub(crate) fn is_empty(&self) -> bool {
        match self {
            Children::Leaves(l) => l.is_empty(),
            Children::Branches(b) => b.is_empty(),
        }
    }
}

/// Empty child container for a node at the given depth (leaves hang off
/// depth-0 nodes).
pub(crate) fn empty_children(node_depth: usize) -> Children {
    if node_depth == 0 {
        Children::Leaves(Vec::new())
    } else {
        Children::Branches(Vec::new())
    }
}
