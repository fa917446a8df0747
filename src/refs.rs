//! The content-addressed Merkle reference vector.
//!
//! A `Refs` is a persistent, lazily-loaded sequence of fixed-size content
//! hashes organized as a balanced tree of degree `D`, so that small
//! mutations produce small deltas when the vector is shared over a
//! network. The tree has two representations that round-trip losslessly:
//! the persistent Merkle form in a [`Pack`](crate::pack::Pack) and the
//! mutable cached form held here.
//!
//! A vector is created blank (or rehydrated from a root hash) and
//! initialized against a `Pack` on first use: the pack's flags are
//! captured once and frozen. With no flags set, branches materialize
//! lazily on first traversal; `ENTIRE_REFS` loads the whole tree up
//! front, and `HASH_TABLE_INDEX` additionally maintains an exhaustive
//! hash -> element index for O(1) lookups by hash.
//!
//! The vector is single-owner: it is not thread safe and is never meant
//! to be.

use crate::encode::{EncodedElement, NodeRecord, RootRecord};
use crate::error::{Error, Result};
use crate::hash::Hash;
use crate::pack::{Flags, Pack};
use crate::tree::{empty_children, Branch, BranchId, BranchState, Children, Leaf, LeafId};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fmt;

/// Degree used by [`Refs::new`] when the caller does not choose one.
pub const DEFAULT_DEGREE: usize = 16;

// ============================================================================
// Refs
// ============================================================================

/// A content-addressed Merkle reference vector.
///
/// Equality is root-hash equality: two vectors compare equal when they
/// encode the same logical state, regardless of what is currently loaded.
#[derive(Debug, Clone)]
pub struct Refs {
    /// Root content hash; all-zero when the vector is blank.
    pub(crate) hash: Hash,
    /// Branch levels below the root (0 = leaves hang off the root).
    pub(crate) depth: usize,
    /// Branching factor, >= 2 once initialized.
    pub(crate) degree: usize,
    /// Count of non-deleted leaves.
    pub(crate) length: usize,
    /// Flags captured from the pack at initialization.
    pub(crate) flags: Flags,
    pub(crate) initialized: bool,
    /// Length has changed; a rebuild may be required.
    pub(crate) modified: bool,
    pub(crate) branches: Vec<Branch>,
    pub(crate) leaves: Vec<Leaf>,
    /// The root's own child slots.
    pub(crate) children: Children,
    /// Multi-valued hash -> leaf index, allocated when the
    /// `HASH_TABLE_INDEX` flag is set.
    pub(crate) index: Option<HashMap<Hash, Vec<LeafId>>>,
    /// Iterator rewind stack; an entry flips to true when the tree is
    /// mutated under that iterator.
    pub(crate) iterators: Vec<bool>,
}

impl Default for Refs {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for Refs {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl Eq for Refs {}

impl fmt::Display for Refs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.hash)
    }
}

impl Refs {
    /// Create a blank vector with the default degree.
    pub fn new() -> Refs {
        Refs::blank(DEFAULT_DEGREE)
    }

    /// Create a blank vector with the given branching factor.
    ///
    /// # Panics
    ///
    /// Panics if `degree < 2`.
    pub fn with_degree(degree: usize) -> Refs {
        assert!(degree >= 2, "degree must be at least 2");
        Refs::blank(degree)
    }

    /// Rehydrate a vector from a known root hash. The tree is loaded
    /// against a pack on first use.
    pub fn from_hash(hash: Hash) -> Refs {
        Refs {
            hash,
            ..Refs::blank(0)
        }
    }

    fn blank(degree: usize) -> Refs {
        Refs {
            hash: Hash::ZERO,
            depth: 0,
            degree,
            length: 0,
            flags: Flags::NONE,
            initialized: false,
            modified: false,
            branches: Vec::new(),
            leaves: Vec::new(),
            children: Children::Leaves(Vec::new()),
            index: None,
            iterators: Vec::new(),
        }
    }

    // ------------------------------------------------------------------
    // Pack-free accessors
    // ------------------------------------------------------------------

    /// The current root hash. All-zero for a blank vector.
    pub fn hash(&self) -> Hash {
        self.hash
    }

    /// Whether the vector is blank (no elements, zero root hash).
    pub fn is_blank(&self) -> bool {
        self.hash.is_zero()
    }

    /// Short hex form of the root hash.
    pub fn short(&self) -> String {
        self.hash.short()
    }

    /// Flags the vector was initialized with; `Flags::NONE` before
    /// initialization.
    pub fn flags(&self) -> Flags {
        self.flags
    }

    // ------------------------------------------------------------------
    // Initialization and loading
    // ------------------------------------------------------------------

    /// Capture the pack's flags and load the root record if there is one.
    /// Idempotent per instance: later calls with any pack reuse the state
    /// captured here.
    pub(crate) fn initialize<P: Pack>(&mut self, pack: &P) -> Result<()> {
        if self.initialized {
            return Ok(());
        }
        self.flags = pack.flags().known();
        self.initialized = true;
        if self.flags.contains(Flags::HASH_TABLE_INDEX) {
            self.index = Some(HashMap::new());
        }
        if self.hash.is_zero() {
            if self.degree == 0 {
                self.degree = DEFAULT_DEGREE;
            }
            return Ok(());
        }
        self.load_root(pack)
    }

    fn load_root<P: Pack>(&mut self, pack: &P) -> Result<()> {
        let bytes = pack.get(&self.hash)?;
        let record = RootRecord::decode(&bytes)?;
        self.depth = record.depth as usize;
        self.degree = record.degree as usize;
        self.length = record.length as usize;
        tracing::debug!(
            root = %self.hash.short(),
            depth = self.depth,
            degree = self.degree,
            length = self.length,
            "loaded root record"
        );

        if self.depth == 0 {
            let mut ids = Vec::with_capacity(record.elements.len());
            let mut live = 0usize;
            for el in &record.elements {
                let id = self.alloc_leaf(Leaf {
                    hash: el.hash,
                    deleted: el.deleted,
                    parent: None,
                });
                ids.push(id);
                if !el.deleted {
                    live += 1;
                    self.index_insert(el.hash, id);
                }
            }
            if live != self.length {
                return Err(Error::invalid_encoding(format!(
                    "root declares length {} but carries {live} live elements",
                    self.length
                )));
            }
            self.children = Children::Leaves(ids);
            return Ok(());
        }

        let mut ids = Vec::with_capacity(record.elements.len());
        for el in &record.elements {
            ids.push(self.alloc_child_branch(el, None, self.depth - 1));
        }
        self.children = Children::Branches(ids.clone());

        if self.flags.contains(Flags::ENTIRE_REFS) || self.flags.contains(Flags::HASH_TABLE_INDEX) {
            let mut total = 0usize;
            for id in ids {
                if self.branch(id).deleted {
                    continue;
                }
                self.load_branch(pack, id, self.depth - 1, true)?;
                total += self.loaded_length(id);
            }
            if total != self.length {
                return Err(Error::InvalidRefs(
                    "top-level branch lengths do not sum to the root length",
                ));
            }
        }
        Ok(())
    }

    /// Materialize one branch record. With `recurse`, the whole subtree
    /// is fetched, wiring parent back-links and registering leaves in the
    /// index.
    fn load_branch<P: Pack>(
        &mut self,
        pack: &P,
        id: BranchId,
        node_depth: usize,
        recurse: bool,
    ) -> Result<()> {
        if self.branch(id).is_stub() {
            let hash = self.branch(id).hash;
            let bytes = pack.get(&hash)?;
            let record = NodeRecord::decode(&bytes, self.degree as u32)?;
            let length = record.length as usize;
            tracing::trace!(branch = %hash.short(), node_depth, length, "loaded branch record");

            let children = if node_depth == 0 {
                let mut ids = Vec::with_capacity(record.elements.len());
                let mut live = 0usize;
                for el in &record.elements {
                    let lid = self.alloc_leaf(Leaf {
                        hash: el.hash,
                        deleted: el.deleted,
                        parent: Some(id),
                    });
                    ids.push(lid);
                    if !el.deleted {
                        live += 1;
                        self.index_insert(el.hash, lid);
                    }
                }
                if live != length {
                    return Err(Error::invalid_encoding(format!(
                        "branch {} declares length {length} but carries {live} live elements",
                        hash.short()
                    )));
                }
                Children::Leaves(ids)
            } else {
                let mut ids = Vec::with_capacity(record.elements.len());
                for el in &record.elements {
                    ids.push(self.alloc_child_branch(el, Some(id), node_depth - 1));
                }
                Children::Branches(ids)
            };
            self.branch_mut(id).state = BranchState::Loaded { length, children };
        }

        if recurse && node_depth > 0 {
            let ids = self.branch_ids_at(Some(id))?;
            let mut total = 0usize;
            for child in ids {
                if self.branch(child).deleted {
                    continue;
                }
                self.load_branch(pack, child, node_depth - 1, true)?;
                total += self.loaded_length(child);
            }
            if total != self.loaded_length(id) {
                return Err(Error::InvalidRefs(
                    "child lengths do not sum to the branch length",
                ));
            }
        }
        Ok(())
    }

    /// Construct the in-memory slot for one decoded child element.
    /// Deleted slots stay stubs and are never fetched; a zero hash marks
    /// an empty branch that has nothing to fetch.
    fn alloc_child_branch(
        &mut self,
        el: &EncodedElement,
        parent: Option<BranchId>,
        node_depth: usize,
    ) -> BranchId {
        let state = if !el.deleted && el.hash.is_zero() {
            BranchState::Loaded {
                length: 0,
                children: empty_children(node_depth),
            }
        } else {
            BranchState::Stub
        };
        self.alloc_branch(Branch {
            hash: el.hash,
            deleted: el.deleted,
            parent,
            state,
        })
    }

    /// Demand-load a stub branch (one level).
    pub(crate) fn ensure_loaded<P: Pack>(
        &mut self,
        pack: &P,
        id: BranchId,
        node_depth: usize,
    ) -> Result<()> {
        if self.branch(id).deleted || !self.branch(id).is_stub() {
            return Ok(());
        }
        self.load_branch(pack, id, node_depth, false)
    }

    // ------------------------------------------------------------------
    // Arena helpers
    // ------------------------------------------------------------------

    pub(crate) fn branch(&self, id: BranchId) -> &Branch {
        &self.branches[id.0]
    }

    fn branch_mut(&mut self, id: BranchId) -> &mut Branch {
        &mut self.branches[id.0]
    }

    pub(crate) fn leaf(&self, id: LeafId) -> &Leaf {
        &self.leaves[id.0]
    }

    fn leaf_mut(&mut self, id: LeafId) -> &mut Leaf {
        &mut self.leaves[id.0]
    }

    fn alloc_branch(&mut self, branch: Branch) -> BranchId {
        self.branches.push(branch);
        BranchId(self.branches.len() - 1)
    }

    fn alloc_leaf(&mut self, leaf: Leaf) -> LeafId {
        self.leaves.push(leaf);
        LeafId(self.leaves.len() - 1)
    }

    fn children_at(&self, at: Option<BranchId>) -> Result<&Children> {
        match at {
            None => Ok(&self.children),
            Some(id) => match &self.branch(id).state {
                BranchState::Loaded { children, .. } => Ok(children),
                BranchState::Stub => Err(Error::InvalidRefs("walked into an unloaded branch")),
            },
        }
    }

    pub(crate) fn leaf_ids_at(&self, at: Option<BranchId>) -> Result<Vec<LeafId>> {
        match self.children_at(at)? {
            Children::Leaves(ids) => Ok(ids.clone()),
            Children::Branches(_) => Err(Error::InvalidRefs("expected leaves, found branches")),
        }
    }

    pub(crate) fn branch_ids_at(&self, at: Option<BranchId>) -> Result<Vec<BranchId>> {
        match self.children_at(at)? {
            Children::Branches(ids) => Ok(ids.clone()),
            Children::Leaves(_) => Err(Error::InvalidRefs("expected branches, found leaves")),
        }
    }

    fn push_leaf_child(&mut self, at: Option<BranchId>, id: LeafId) -> Result<()> {
        let children = match at {
            None => &mut self.children,
            Some(b) => match &mut self.branch_mut(b).state {
                BranchState::Loaded { children, .. } => children,
                BranchState::Stub => {
                    return Err(Error::InvalidRefs("inserting into an unloaded branch"))
                }
            },
        };
        match children {
            Children::Leaves(ids) => {
                ids.push(id);
                Ok(())
            }
            Children::Branches(_) => Err(Error::InvalidRefs("expected leaves, found branches")),
        }
    }

    fn push_branch_child(&mut self, at: Option<BranchId>, id: BranchId) -> Result<()> {
        let children = match at {
            None => &mut self.children,
            Some(b) => match &mut self.branch_mut(b).state {
                BranchState::Loaded { children, .. } => children,
                BranchState::Stub => {
                    return Err(Error::InvalidRefs("inserting into an unloaded branch"))
                }
            },
        };
        match children {
            Children::Branches(ids) => {
                ids.push(id);
                Ok(())
            }
            Children::Leaves(_) => Err(Error::InvalidRefs("expected branches, found leaves")),
        }
    }

    /// Length of a loaded branch; stubs report zero and must be loaded
    /// before this is meaningful.
    pub(crate) fn loaded_length(&self, id: BranchId) -> usize {
        match &self.branch(id).state {
            BranchState::Loaded { length, .. } => *length,
            BranchState::Stub => 0,
        }
    }

    fn loaded_length_checked(&self, id: BranchId) -> Result<usize> {
        match &self.branch(id).state {
            BranchState::Loaded { length, .. } => Ok(*length),
            BranchState::Stub => Err(Error::InvalidRefs(
                "length of an unloaded branch was required",
            )),
        }
    }

    fn bump_lengths_up(&mut self, from: Option<BranchId>) {
        let mut cur = from;
        while let Some(id) = cur {
            if let BranchState::Loaded { length, .. } = &mut self.branches[id.0].state {
                *length += 1;
            }
            cur = self.branches[id.0].parent;
        }
    }

    fn drop_lengths_up(&mut self, from: Option<BranchId>) {
        let mut cur = from;
        while let Some(id) = cur {
            if let BranchState::Loaded { length, .. } = &mut self.branches[id.0].state {
                *length = length.saturating_sub(1);
            }
            cur = self.branches[id.0].parent;
        }
    }

    fn distance_from_root(&self, id: BranchId) -> usize {
        let mut d = 0;
        let mut cur = self.branch(id).parent;
        while let Some(b) = cur {
            d += 1;
            cur = self.branch(b).parent;
        }
        d
    }

    // ------------------------------------------------------------------
    // Hash index helpers
    // ------------------------------------------------------------------

    fn index_insert(&mut self, hash: Hash, id: LeafId) {
        if let Some(index) = &mut self.index {
            index.entry(hash).or_default().push(id);
        }
    }

    fn index_remove(&mut self, hash: &Hash, id: LeafId) {
        if let Some(index) = &mut self.index {
            if let Some(ids) = index.get_mut(hash) {
                ids.retain(|x| *x != id);
                if ids.is_empty() {
                    index.remove(hash);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Validation
    // ------------------------------------------------------------------

    fn validate_index(&self, index: usize) -> Result<()> {
        if index >= self.length {
            return Err(Error::out_of_range(index, self.length));
        }
        Ok(())
    }

    fn validate_slice(&self, from: usize, to: usize) -> Result<()> {
        if from > self.length || to > self.length {
            return Err(Error::out_of_range(from.max(to), self.length));
        }
        if from > to {
            return Err(Error::InvalidSliceIndex { from, to });
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Number of non-deleted elements.
    pub fn len<P: Pack>(&mut self, pack: &P) -> Result<usize> {
        self.initialize(pack)?;
        Ok(self.length)
    }

    /// Height of the tree: the number of node levels, so a vector whose
    /// leaves hang directly off the root reports 1.
    pub fn depth<P: Pack>(&mut self, pack: &P) -> Result<usize> {
        self.initialize(pack)?;
        Ok(self.depth + 1)
    }

    /// Branching factor of the tree.
    pub fn degree<P: Pack>(&mut self, pack: &P) -> Result<usize> {
        self.initialize(pack)?;
        Ok(self.degree)
    }

    /// Whether any element carries the given hash.
    ///
    /// O(1) with `HASH_TABLE_INDEX`, O(length) otherwise.
    pub fn has_hash<P: Pack>(&mut self, pack: &P, hash: &Hash) -> Result<bool> {
        self.initialize(pack)?;
        if let Some(index) = &self.index {
            return Ok(index.contains_key(hash));
        }
        let target = *hash;
        let mut found = false;
        self.ascend(pack, |_, _, h| {
            if h == target {
                found = true;
                return Ok(crate::iter::IterAction::Stop);
            }
            Ok(crate::iter::IterAction::Continue)
        })?;
        Ok(found)
    }

    /// Decode the element payload stored under `hash`.
    ///
    /// Returns `NotFound` if no element carries the hash, and
    /// `ElementIsNil` if elements carry it but it is the zero hash.
    pub fn value_by_hash<T, P>(&mut self, pack: &P, hash: &Hash) -> Result<T>
    where
        T: DeserializeOwned,
        P: Pack,
    {
        if !self.has_hash(pack, hash)? {
            return Err(Error::NotFound);
        }
        if hash.is_zero() {
            return Err(Error::ElementIsNil);
        }
        let bytes = pack.get(hash)?;
        Ok(postcard::from_bytes(&bytes)?)
    }

    /// Linear index of some element carrying `hash`.
    ///
    /// With the index flag and several matches, which one is reported is
    /// unspecified (currently the most recently registered); use
    /// [`Refs::indices_by_hash`] for all of them.
    pub fn index_of_hash<P: Pack>(&mut self, pack: &P, hash: &Hash) -> Result<usize> {
        self.initialize(pack)?;
        if self.index.is_some() {
            let id = self
                .index
                .as_ref()
                .and_then(|ix| ix.get(hash))
                .and_then(|ids| ids.last().copied())
                .ok_or(Error::NotFound)?;
            return self.leaf_linear_index(id);
        }
        let target = *hash;
        let mut found = None;
        self.ascend(pack, |_, i, h| {
            if h == target {
                found = Some(i);
                return Ok(crate::iter::IterAction::Stop);
            }
            Ok(crate::iter::IterAction::Continue)
        })?;
        found.ok_or(Error::NotFound)
    }

    /// Linear indices of every element carrying `hash`; order
    /// unspecified. `NotFound` when there are none.
    pub fn indices_by_hash<P: Pack>(&mut self, pack: &P, hash: &Hash) -> Result<Vec<usize>> {
        self.initialize(pack)?;
        if self.index.is_some() {
            let ids = self
                .index
                .as_ref()
                .and_then(|ix| ix.get(hash).cloned())
                .unwrap_or_default();
            if ids.is_empty() {
                return Err(Error::NotFound);
            }
            let mut out = Vec::with_capacity(ids.len());
            for id in ids {
                out.push(self.leaf_linear_index(id)?);
            }
            return Ok(out);
        }
        let target = *hash;
        let mut out = Vec::new();
        self.ascend(pack, |_, i, h| {
            if h == target {
                out.push(i);
            }
            Ok(crate::iter::IterAction::Continue)
        })?;
        if out.is_empty() {
            return Err(Error::NotFound);
        }
        Ok(out)
    }

    /// Decode the payload under `hash` and report the element's linear
    /// index as well.
    pub fn value_of_hash_with_index<T, P>(&mut self, pack: &P, hash: &Hash) -> Result<(usize, T)>
    where
        T: DeserializeOwned,
        P: Pack,
    {
        let index = self.index_of_hash(pack, hash)?;
        if hash.is_zero() {
            return Err(Error::ElementIsNil);
        }
        let bytes = pack.get(hash)?;
        Ok((index, postcard::from_bytes(&bytes)?))
    }

    /// Compute a leaf's linear index by walking parent back-links,
    /// summing prior-sibling subtree lengths at each level.
    fn leaf_linear_index(&self, id: LeafId) -> Result<usize> {
        let leaf = self.leaf(id);
        if leaf.deleted {
            return Err(Error::InvalidRefs("deleted leaf reached via the index"));
        }
        let list = match self.children_at(leaf.parent)? {
            Children::Leaves(ids) => ids,
            Children::Branches(_) => {
                return Err(Error::InvalidRefs("leaf parent holds branches"));
            }
        };
        let mut i = 0usize;
        let mut located = false;
        for &lid in list {
            if lid == id {
                located = true;
                break;
            }
            if !self.leaf(lid).deleted {
                i += 1;
            }
        }
        if !located {
            return Err(Error::InvalidRefs("leaf is not a child of its parent"));
        }

        let mut down = leaf.parent;
        while let Some(d) = down {
            let up = self.branch(d).parent;
            let siblings = match self.children_at(up)? {
                Children::Branches(ids) => ids,
                Children::Leaves(_) => {
                    return Err(Error::InvalidRefs("branch parent holds leaves"));
                }
            };
            let mut located = false;
            for &sib in siblings {
                if sib == d {
                    located = true;
                    break;
                }
                if self.branch(sib).deleted {
                    continue;
                }
                i += self.loaded_length_checked(sib)?;
            }
            if !located {
                return Err(Error::InvalidRefs("branch is not a child of its parent"));
            }
            down = up;
        }
        Ok(i)
    }

    /// Walk down to the leaf holding linear index `rel`, demand-loading
    /// traversed branches.
    pub(crate) fn find_leaf<P: Pack>(&mut self, pack: &P, mut rel: usize) -> Result<LeafId> {
        let mut at: Option<BranchId> = None;
        let mut depth = self.depth;
        loop {
            if depth == 0 {
                for id in self.leaf_ids_at(at)? {
                    if self.leaf(id).deleted {
                        continue;
                    }
                    if rel == 0 {
                        return Ok(id);
                    }
                    rel -= 1;
                }
                return Err(Error::InvalidRefs("index not found among live leaves"));
            }
            let mut chosen = None;
            for id in self.branch_ids_at(at)? {
                if self.branch(id).deleted {
                    continue;
                }
                self.ensure_loaded(pack, id, depth - 1)?;
                let len = self.loaded_length(id);
                if len == 0 {
                    continue;
                }
                if rel >= len {
                    rel -= len;
                    continue;
                }
                chosen = Some(id);
                break;
            }
            match chosen {
                Some(id) => {
                    at = Some(id);
                    depth -= 1;
                }
                None => {
                    return Err(Error::InvalidRefs("index not covered by branch lengths"));
                }
            }
        }
    }

    /// Hash of the element at `index`. O(depth).
    pub fn hash_by_index<P: Pack>(&mut self, pack: &P, index: usize) -> Result<Hash> {
        self.initialize(pack)?;
        self.validate_index(index)?;
        let id = self.find_leaf(pack, index)?;
        Ok(self.leaf(id).hash)
    }

    /// Decode the payload of the element at `index`.
    ///
    /// Returns `ElementIsNil` for a nil (zero-hash) element.
    pub fn value_by_index<T, P>(&mut self, pack: &P, index: usize) -> Result<T>
    where
        T: DeserializeOwned,
        P: Pack,
    {
        let hash = self.hash_by_index(pack, index)?;
        if hash.is_zero() {
            return Err(Error::ElementIsNil);
        }
        let bytes = pack.get(&hash)?;
        Ok(postcard::from_bytes(&bytes)?)
    }

    // ------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------

    /// Replace the hash of the element at `index`. Length is unchanged.
    pub fn set_hash_by_index<P: Pack>(&mut self, pack: &P, index: usize, hash: Hash) -> Result<()> {
        self.initialize(pack)?;
        self.validate_index(index)?;
        let id = self.find_leaf(pack, index)?;
        let old = self.leaf(id).hash;
        self.index_remove(&old, id);
        self.index_insert(hash, id);
        self.leaf_mut(id).hash = hash;
        self.modified = true;
        let parent = self.leaf(id).parent;
        self.save_chains(pack, vec![parent])
    }

    /// Serialize `value` into the pack and store its hash at `index`.
    ///
    /// A `None` value stores the zero hash: the element becomes nil but
    /// is not removed.
    pub fn set_value_by_index<T, P>(&mut self, pack: &P, index: usize, value: Option<&T>) -> Result<()>
    where
        T: Serialize,
        P: Pack,
    {
        let hash = match value {
            None => Hash::ZERO,
            Some(v) => {
                let bytes = postcard::to_allocvec(v)?;
                pack.add(&bytes)?
            }
        };
        self.set_hash_by_index(pack, index, hash)
    }

    /// Mark a leaf deleted: unregister it, clear its hash, flag the tree
    /// as modified, and signal the innermost active iterator.
    fn delete_leaf_slot(&mut self, id: LeafId) {
        let hash = self.leaf(id).hash;
        self.index_remove(&hash, id);
        let leaf = self.leaf_mut(id);
        leaf.deleted = true;
        leaf.hash = Hash::ZERO;
        self.modified = true;
        if let Some(top) = self.iterators.last_mut() {
            *top = true;
        }
    }

    /// Delete the element at `index`, adjusting subtree lengths; the
    /// caller saves the touched path.
    fn delete_at<P: Pack>(&mut self, pack: &P, index: usize) -> Result<Option<BranchId>> {
        let id = self.find_leaf(pack, index)?;
        let parent = self.leaf(id).parent;
        self.delete_leaf_slot(id);
        self.drop_lengths_up(parent);
        self.length -= 1;
        Ok(parent)
    }

    /// Delete the element at `index`. The slot is retained in the tree
    /// (and in the encoded form) until the next rebuild compacts it.
    pub fn delete_by_index<P: Pack>(&mut self, pack: &P, index: usize) -> Result<()> {
        self.initialize(pack)?;
        self.validate_index(index)?;
        let parent = self.delete_at(pack, index)?;
        self.save_chains(pack, vec![parent])
    }

    /// Delete every element carrying `hash`. `NotFound` when there are
    /// none.
    pub fn delete_by_hash<P: Pack>(&mut self, pack: &P, hash: &Hash) -> Result<()> {
        self.initialize(pack)?;
        if self.index.is_some() {
            let ids = self
                .index
                .as_ref()
                .and_then(|ix| ix.get(hash).cloned())
                .unwrap_or_default();
            if ids.is_empty() {
                return Err(Error::NotFound);
            }
            let mut parents = Vec::with_capacity(ids.len());
            for id in ids {
                let parent = self.leaf(id).parent;
                self.delete_leaf_slot(id);
                self.drop_lengths_up(parent);
                self.length -= 1;
                parents.push(parent);
            }
            return self.save_chains(pack, parents);
        }

        // Descending keeps the indices of still-unvisited matches stable
        // while earlier (higher) matches are deleted.
        let target = *hash;
        let mut deleted = false;
        self.descend(pack, |r, i, h| {
            if h == target {
                r.delete_by_index(pack, i)?;
                deleted = true;
            }
            Ok(crate::iter::IterAction::Continue)
        })?;
        if !deleted {
            return Err(Error::NotFound);
        }
        Ok(())
    }

    /// Delete the half-open index range `[from, to)`.
    pub fn delete_slice_by_indices<P: Pack>(
        &mut self,
        pack: &P,
        from: usize,
        to: usize,
    ) -> Result<()> {
        self.initialize(pack)?;
        self.validate_slice(from, to)?;
        if from == to {
            return Ok(());
        }
        let mut parents = Vec::with_capacity(to - from);
        for index in (from..to).rev() {
            parents.push(self.delete_at(pack, index)?);
        }
        self.save_chains(pack, parents)
    }

    /// Serialize each payload into the pack and append the resulting
    /// hashes. `None` payloads append nil (zero-hash) elements.
    pub fn append_values<'a, T, P, I>(&mut self, pack: &P, values: I) -> Result<()>
    where
        T: Serialize + 'a,
        P: Pack,
        I: IntoIterator<Item = Option<&'a T>>,
    {
        let mut hashes = Vec::new();
        for value in values {
            match value {
                None => hashes.push(Hash::ZERO),
                Some(v) => {
                    let bytes = postcard::to_allocvec(v)?;
                    hashes.push(pack.add(&bytes)?);
                }
            }
        }
        if hashes.is_empty() {
            return Ok(());
        }
        self.append_hashes(pack, &hashes)
    }

    /// Append the given hashes to the tail of the vector.
    ///
    /// When the free capacity on the rightmost spine cannot hold them,
    /// the tree is rebuilt into the smallest depth that can; deleted
    /// slots are dropped by that rebuild, and are never overwritten
    /// otherwise.
    pub fn append_hashes<P: Pack>(&mut self, pack: &P, hashes: &[Hash]) -> Result<()> {
        self.initialize(pack)?;
        if hashes.is_empty() {
            return Ok(());
        }
        let free = self.free_on_tail(pack)?;
        if free < hashes.len() {
            let live = self.collect_range(pack, 0, self.length)?;
            let new_depth = min_depth(self.degree, self.length + hashes.len());
            tracing::debug!(
                free,
                appending = hashes.len(),
                new_depth,
                "growing the tree before append"
            );
            self.rebuild_arenas(new_depth, &live)?;
            for &hash in hashes {
                self.insert_tail(hash)?;
            }
            self.modified = false;
            self.save_all(pack)?;
        } else {
            let mut parents = Vec::with_capacity(hashes.len());
            for &hash in hashes {
                parents.push(self.insert_tail(hash)?);
            }
            self.save_chains(pack, parents)?;
        }
        if let Some(top) = self.iterators.last_mut() {
            *top = true;
        }
        Ok(())
    }

    /// Append every element of `other` to this vector. `other` is left
    /// unchanged.
    pub fn append_refs<P: Pack>(&mut self, pack: &P, other: &mut Refs) -> Result<()> {
        self.initialize(pack)?;
        other.initialize(pack)?;
        let hashes = other.collect_range(pack, 0, other.length)?;
        if hashes.is_empty() {
            return Ok(());
        }
        self.append_hashes(pack, &hashes)
    }

    /// A new vector holding the elements of `[from, to)`, with this
    /// vector's degree and flags. Equal bounds produce a blank vector.
    pub fn slice<P: Pack>(&mut self, pack: &P, from: usize, to: usize) -> Result<Refs> {
        self.initialize(pack)?;
        self.validate_slice(from, to)?;
        let mut out = Refs::blank(self.degree);
        out.flags = self.flags;
        out.initialized = true;
        if self.flags.contains(Flags::HASH_TABLE_INDEX) {
            out.index = Some(HashMap::new());
        }
        if from == to {
            return Ok(out);
        }
        let hashes = self.collect_range(pack, from, to - from)?;
        out.append_hashes(pack, &hashes)?;
        Ok(out)
    }

    /// Reset to the blank state in place. The pack is not touched; any
    /// active iterators are signalled and terminate against the
    /// now-empty vector.
    pub fn clear(&mut self) {
        if let Some(top) = self.iterators.last_mut() {
            *top = true;
        }
        self.hash = Hash::ZERO;
        self.depth = 0;
        self.degree = 0;
        self.length = 0;
        self.flags = Flags::NONE;
        self.initialized = false;
        self.modified = false;
        self.branches.clear();
        self.leaves.clear();
        self.children = Children::Leaves(Vec::new());
        self.index = None;
    }

    // ------------------------------------------------------------------
    // Tail capacity and insertion
    // ------------------------------------------------------------------

    /// Free element capacity on the rightmost spine: unused slots in the
    /// tail leaf list plus unused branch slots multiplied by the per-slot
    /// capacity at their depth. Deleted slots are occupied, never free.
    fn free_on_tail<P: Pack>(&mut self, pack: &P) -> Result<usize> {
        if self.depth == 0 {
            return Ok(self
                .degree
                .saturating_sub(self.leaf_ids_at(None)?.len()));
        }
        self.free_on_tail_at(pack, None, self.depth)
    }

    fn free_on_tail_at<P: Pack>(
        &mut self,
        pack: &P,
        at: Option<BranchId>,
        node_depth: usize,
    ) -> Result<usize> {
        let ids = self.branch_ids_at(at)?;
        let child_cap = pow(self.degree, node_depth);
        let mut free = self
            .degree
            .saturating_sub(ids.len())
            .saturating_mul(child_cap);
        if let Some(&last) = ids.last() {
            if !self.branch(last).deleted {
                self.ensure_loaded(pack, last, node_depth - 1)?;
                if node_depth - 1 == 0 {
                    free += self
                        .degree
                        .saturating_sub(self.leaf_ids_at(Some(last))?.len());
                } else {
                    free += self.free_on_tail_at(pack, Some(last), node_depth - 1)?;
                }
            }
        }
        Ok(free)
    }

    /// Insert one hash into the rightmost spine, creating sibling
    /// branches as needed. Returns `Some(parent)` on success, `None`
    /// when the subtree is full.
    fn try_insert(
        &mut self,
        at: Option<BranchId>,
        node_depth: usize,
        hash: Hash,
    ) -> Result<Option<Option<BranchId>>> {
        if node_depth == 0 {
            if self.leaf_ids_at(at)?.len() >= self.degree {
                return Ok(None);
            }
            let id = self.alloc_leaf(Leaf {
                hash,
                deleted: false,
                parent: at,
            });
            self.push_leaf_child(at, id)?;
            self.index_insert(hash, id);
            return Ok(Some(at));
        }

        let ids = self.branch_ids_at(at)?;
        if let Some(&last) = ids.last() {
            if !self.branch(last).deleted {
                if let Some(parent) = self.try_insert(Some(last), node_depth - 1, hash)? {
                    return Ok(Some(parent));
                }
            }
        }
        if ids.len() >= self.degree {
            return Ok(None);
        }
        let fresh = self.alloc_branch(Branch {
            hash: Hash::ZERO,
            deleted: false,
            parent: at,
            state: BranchState::Loaded {
                length: 0,
                children: empty_children(node_depth - 1),
            },
        });
        self.push_branch_child(at, fresh)?;
        match self.try_insert(Some(fresh), node_depth - 1, hash)? {
            Some(parent) => Ok(Some(parent)),
            None => Err(Error::InvalidRefs("fresh branch rejected an insertion")),
        }
    }

    /// Insert on the tail and bubble the length increment upward. The
    /// caller must have ensured free capacity.
    fn insert_tail(&mut self, hash: Hash) -> Result<Option<BranchId>> {
        match self.try_insert(None, self.depth, hash)? {
            Some(parent) => {
                self.bump_lengths_up(parent);
                self.length += 1;
                Ok(parent)
            }
            None => Err(Error::InvalidRefs("no free slot on the tail")),
        }
    }

    // ------------------------------------------------------------------
    // Collection walks
    // ------------------------------------------------------------------

    /// Hashes of `count` live elements starting at linear index `from`,
    /// in ascending order. Demand-loads what it traverses.
    pub(crate) fn collect_range<P: Pack>(
        &mut self,
        pack: &P,
        from: usize,
        count: usize,
    ) -> Result<Vec<Hash>> {
        let mut out = Vec::with_capacity(count);
        if count == 0 {
            return Ok(out);
        }
        self.collect_into(pack, None, self.depth, from, count, &mut out)?;
        if out.len() != count {
            return Err(Error::InvalidRefs("fewer live elements than counted"));
        }
        Ok(out)
    }

    fn collect_into<P: Pack>(
        &mut self,
        pack: &P,
        at: Option<BranchId>,
        node_depth: usize,
        mut rel: usize,
        want: usize,
        out: &mut Vec<Hash>,
    ) -> Result<()> {
        if node_depth == 0 {
            for id in self.leaf_ids_at(at)? {
                if out.len() == want {
                    return Ok(());
                }
                let leaf = self.leaf(id);
                if leaf.deleted {
                    continue;
                }
                if rel > 0 {
                    rel -= 1;
                    continue;
                }
                out.push(leaf.hash);
            }
            return Ok(());
        }
        for id in self.branch_ids_at(at)? {
            if out.len() == want {
                return Ok(());
            }
            if self.branch(id).deleted {
                continue;
            }
            self.ensure_loaded(pack, id, node_depth - 1)?;
            let len = self.loaded_length(id);
            if len == 0 {
                continue;
            }
            if rel >= len {
                rel -= len;
                continue;
            }
            self.collect_into(pack, Some(id), node_depth - 1, rel, want, out)?;
            rel = 0;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Saving (bubbling)
    // ------------------------------------------------------------------

    /// Re-encode every branch on the paths from the given leaf parents up
    /// to the root, deepest first, then refresh the root hash. This is
    /// the single bubbling helper called after any mutation that changed
    /// content or length.
    fn save_chains<P: Pack>(&mut self, pack: &P, parents: Vec<Option<BranchId>>) -> Result<()> {
        let mut seen = HashSet::new();
        let mut order: Vec<(usize, BranchId)> = Vec::new();
        for parent in parents.into_iter().flatten() {
            let mut cur = Some(parent);
            while let Some(id) = cur {
                if seen.insert(id) {
                    order.push((self.distance_from_root(id), id));
                }
                cur = self.branch(id).parent;
            }
        }
        order.sort_by(|a, b| b.0.cmp(&a.0));
        for (_, id) in order {
            let bytes = self.node_record(id)?.encode();
            self.branch_mut(id).hash = pack.add(&bytes)?;
        }
        self.save_root(pack)
    }

    /// Re-encode the whole loaded tree bottom-up. Stub subtrees keep
    /// their hashes; they were never mutated.
    fn save_all<P: Pack>(&mut self, pack: &P) -> Result<()> {
        let top: Vec<BranchId> = match &self.children {
            Children::Branches(ids) => ids.clone(),
            Children::Leaves(_) => Vec::new(),
        };
        for id in top {
            self.save_subtree(pack, id)?;
        }
        self.save_root(pack)
    }

    fn save_subtree<P: Pack>(&mut self, pack: &P, id: BranchId) -> Result<()> {
        if self.branch(id).deleted {
            return Ok(());
        }
        let child_branches: Vec<BranchId> = match &self.branch(id).state {
            BranchState::Stub => return Ok(()),
            BranchState::Loaded { length, children } => {
                // an empty slot decoded as nil keeps its zero hash
                if *length == 0 && children.is_empty() && self.branch(id).hash.is_zero() {
                    return Ok(());
                }
                match children {
                    Children::Branches(ids) => ids.clone(),
                    Children::Leaves(_) => Vec::new(),
                }
            }
        };
        for child in child_branches {
            self.save_subtree(pack, child)?;
        }
        let bytes = self.node_record(id)?.encode();
        self.branch_mut(id).hash = pack.add(&bytes)?;
        Ok(())
    }

    fn save_root<P: Pack>(&mut self, pack: &P) -> Result<()> {
        if self.length == 0 {
            self.collapse_blank();
            return Ok(());
        }
        let bytes = self.root_record()?.encode();
        self.hash = pack.add(&bytes)?;
        Ok(())
    }

    /// An empty tree is not representable on disk; the vector falls back
    /// to the blank state, keeping degree, flags and initialization.
    fn collapse_blank(&mut self) {
        self.hash = Hash::ZERO;
        self.depth = 0;
        self.branches.clear();
        self.leaves.clear();
        self.children = Children::Leaves(Vec::new());
        if let Some(index) = &mut self.index {
            index.clear();
        }
    }

    fn child_elements(&self, at: Option<BranchId>) -> Result<Vec<EncodedElement>> {
        match self.children_at(at)? {
            Children::Leaves(ids) => Ok(ids
                .iter()
                .map(|&id| {
                    let leaf = self.leaf(id);
                    EncodedElement {
                        deleted: leaf.deleted,
                        hash: leaf.hash,
                    }
                })
                .collect()),
            Children::Branches(ids) => Ok(ids
                .iter()
                .map(|&id| {
                    let branch = self.branch(id);
                    EncodedElement {
                        deleted: branch.deleted,
                        hash: branch.hash,
                    }
                })
                .collect()),
        }
    }

    fn root_record(&self) -> Result<RootRecord> {
        Ok(RootRecord {
            depth: as_u32(self.depth)?,
            degree: as_u32(self.degree)?,
            length: as_u32(self.length)?,
            elements: self.child_elements(None)?,
        })
    }

    fn node_record(&self, id: BranchId) -> Result<NodeRecord> {
        Ok(NodeRecord {
            length: as_u32(self.loaded_length_checked(id)?)?,
            elements: self.child_elements(Some(id))?,
        })
    }

    // ------------------------------------------------------------------
    // Rebuild
    // ------------------------------------------------------------------

    /// Rebuild the tree into the smallest depth consistent with the
    /// current length, dropping deleted slots. Idempotent: rebuilding an
    /// already-compact tree reproduces the same root hash.
    ///
    /// Forbidden while a traversal is active; it also runs implicitly
    /// when the outermost traversal ends after a mutation.
    pub fn rebuild<P: Pack>(&mut self, pack: &P) -> Result<()> {
        self.initialize(pack)?;
        if !self.iterators.is_empty() {
            return Err(Error::Iterating);
        }
        self.rebuild_inner(pack)
    }

    pub(crate) fn rebuild_inner<P: Pack>(&mut self, pack: &P) -> Result<()> {
        if self.length == 0 {
            self.collapse_blank();
            self.modified = false;
            return Ok(());
        }
        let live = self.collect_range(pack, 0, self.length)?;
        let new_depth = min_depth(self.degree, live.len());
        tracing::debug!(
            length = live.len(),
            from_depth = self.depth,
            to_depth = new_depth,
            "rebuilding the tree"
        );
        self.rebuild_arenas(new_depth, &live)?;
        self.save_all(pack)?;
        self.modified = false;
        Ok(())
    }

    /// Replace the arenas with a fresh left-packed tree of the given
    /// depth holding `hashes` in order. Nothing is saved here.
    fn rebuild_arenas(&mut self, new_depth: usize, hashes: &[Hash]) -> Result<()> {
        self.branches.clear();
        self.leaves.clear();
        if let Some(index) = &mut self.index {
            index.clear();
        }
        self.children = empty_children(new_depth);
        self.depth = new_depth;
        self.length = 0;
        for &hash in hashes {
            self.insert_tail(hash)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Debug dump
    // ------------------------------------------------------------------

    /// Render the tree one node per line for debugging. Unloaded
    /// branches are marked unless `force_load` fetches them.
    pub fn tree_string<P: Pack>(&mut self, pack: &P, force_load: bool) -> Result<String> {
        self.initialize(pack)?;
        let mut out = format!(
            "refs {} length:{} depth:{} degree:{}\n",
            self.short(),
            self.length,
            self.depth,
            self.degree
        );
        if !self.is_blank() {
            self.tree_lines(pack, None, self.depth, 1, force_load, &mut out)?;
        }
        Ok(out)
    }

    fn tree_lines<P: Pack>(
        &mut self,
        pack: &P,
        at: Option<BranchId>,
        node_depth: usize,
        indent: usize,
        force_load: bool,
        out: &mut String,
    ) -> Result<()> {
        let pad = "  ".repeat(indent);
        if node_depth == 0 {
            for id in self.leaf_ids_at(at)? {
                let leaf = self.leaf(id);
                if leaf.deleted {
                    out.push_str(&format!("{pad}(deleted)\n"));
                } else if leaf.hash.is_zero() {
                    out.push_str(&format!("{pad}(nil)\n"));
                } else {
                    out.push_str(&format!("{pad}{}\n", leaf.hash.short()));
                }
            }
            return Ok(());
        }
        for id in self.branch_ids_at(at)? {
            if self.branch(id).deleted {
                out.push_str(&format!("{pad}(deleted)\n"));
                continue;
            }
            if force_load {
                self.ensure_loaded(pack, id, node_depth - 1)?;
            }
            let branch = self.branch(id);
            if branch.is_stub() {
                out.push_str(&format!("{pad}{} (not loaded)\n", branch.hash.short()));
                continue;
            }
            out.push_str(&format!(
                "{pad}{} length:{}\n",
                branch.hash.short(),
                self.loaded_length(id)
            ));
            self.tree_lines(pack, Some(id), node_depth - 1, indent + 1, force_load, out)?;
        }
        Ok(())
    }
}

// ============================================================================
// Small numeric helpers
// ============================================================================

fn as_u32(value: usize) -> Result<u32> {
    u32::try_from(value).map_err(|_| Error::InvalidRefs("field exceeds the u32 wire range"))
}

/// Smallest depth `h` such that `degree^(h + 1) >= length`.
pub(crate) fn min_depth(degree: usize, length: usize) -> usize {
    let mut depth = 0;
    let mut cap = degree;
    while cap < length {
        depth += 1;
        cap = cap.saturating_mul(degree);
    }
    depth
}

/// `base^exp`, saturating.
pub(crate) fn pow(base: usize, exp: usize) -> usize {
    (0..exp).fold(1usize, |acc, _| acc.saturating_mul(base))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pack::MemoryPack;

    fn h(seed: u8) -> Hash {
        Hash::digest(&[seed])
    }

    fn hashes(n: u8) -> Vec<Hash> {
        (0..n).map(h).collect()
    }

    #[test]
    fn test_blank_vector() {
        let pack = MemoryPack::new();
        let mut refs = Refs::new();
        assert!(refs.is_blank());
        assert_eq!(refs.len(&pack).unwrap(), 0);
        assert_eq!(refs.depth(&pack).unwrap(), 1);
        assert_eq!(refs.degree(&pack).unwrap(), DEFAULT_DEGREE);
        assert!(refs.hash().is_zero());
    }

    #[test]
    #[should_panic(expected = "degree must be at least 2")]
    fn test_with_degree_rejects_one() {
        let _ = Refs::with_degree(1);
    }

    #[test]
    fn test_append_within_root_capacity() {
        let pack = MemoryPack::new();
        let mut refs = Refs::with_degree(4);
        refs.append_hashes(&pack, &hashes(3)).unwrap();
        assert_eq!(refs.len(&pack).unwrap(), 3);
        assert_eq!(refs.depth(&pack).unwrap(), 1);
        for i in 0..3 {
            assert_eq!(refs.hash_by_index(&pack, i).unwrap(), h(i as u8));
        }
        assert!(!refs.is_blank());
    }

    #[test]
    fn test_append_grows_depth() {
        let pack = MemoryPack::new();
        let mut refs = Refs::with_degree(4);
        refs.append_hashes(&pack, &hashes(5)).unwrap();
        assert_eq!(refs.len(&pack).unwrap(), 5);
        assert_eq!(refs.depth(&pack).unwrap(), 2);
        for i in 0..5 {
            assert_eq!(refs.hash_by_index(&pack, i).unwrap(), h(i as u8));
        }
    }

    #[test]
    fn test_incremental_append_matches_batch_append() {
        let pack = MemoryPack::new();
        let mut batch = Refs::with_degree(4);
        batch.append_hashes(&pack, &hashes(16)).unwrap();

        let mut incremental = Refs::with_degree(4);
        for hash in hashes(16) {
            incremental.append_hashes(&pack, &[hash]).unwrap();
        }
        assert_eq!(batch.hash(), incremental.hash());
    }

    #[test]
    fn test_hash_by_index_out_of_range() {
        let pack = MemoryPack::new();
        let mut refs = Refs::with_degree(4);
        refs.append_hashes(&pack, &hashes(3)).unwrap();
        assert!(matches!(
            refs.hash_by_index(&pack, 3),
            Err(Error::IndexOutOfRange {
                index: 3,
                length: 3
            })
        ));
    }

    #[test]
    fn test_set_hash_by_index_updates_root_hash() {
        let pack = MemoryPack::new();
        let mut refs = Refs::with_degree(4);
        refs.append_hashes(&pack, &hashes(8)).unwrap();
        let before = refs.hash();
        refs.set_hash_by_index(&pack, 3, h(99)).unwrap();
        assert_eq!(refs.hash_by_index(&pack, 3).unwrap(), h(99));
        assert_ne!(refs.hash(), before);
        assert_eq!(refs.len(&pack).unwrap(), 8);
    }

    #[test]
    fn test_delete_by_index_shifts_later_elements() {
        let pack = MemoryPack::new();
        let mut refs = Refs::with_degree(4);
        refs.append_hashes(&pack, &hashes(8)).unwrap();
        refs.delete_by_index(&pack, 2).unwrap();
        assert_eq!(refs.len(&pack).unwrap(), 7);
        assert_eq!(refs.hash_by_index(&pack, 2).unwrap(), h(3));
        assert_eq!(refs.hash_by_index(&pack, 6).unwrap(), h(7));
    }

    #[test]
    fn test_delete_last_element_collapses_to_blank() {
        let pack = MemoryPack::new();
        let mut refs = Refs::with_degree(4);
        refs.append_hashes(&pack, &[h(1)]).unwrap();
        refs.delete_by_index(&pack, 0).unwrap();
        assert!(refs.is_blank());
        assert_eq!(refs.len(&pack).unwrap(), 0);
        // still usable afterwards
        refs.append_hashes(&pack, &[h(2)]).unwrap();
        assert_eq!(refs.hash_by_index(&pack, 0).unwrap(), h(2));
    }

    #[test]
    fn test_delete_by_hash_without_index() {
        let pack = MemoryPack::new();
        let mut refs = Refs::with_degree(4);
        refs.append_hashes(&pack, &[h(1), h(2), h(1), h(3), h(1)])
            .unwrap();
        refs.delete_by_hash(&pack, &h(1)).unwrap();
        assert_eq!(refs.len(&pack).unwrap(), 2);
        assert_eq!(refs.hash_by_index(&pack, 0).unwrap(), h(2));
        assert_eq!(refs.hash_by_index(&pack, 1).unwrap(), h(3));
        assert!(matches!(
            refs.delete_by_hash(&pack, &h(42)),
            Err(Error::NotFound)
        ));
    }

    #[test]
    fn test_delete_by_hash_with_index() {
        let pack = MemoryPack::with_flags(Flags::HASH_TABLE_INDEX);
        let mut refs = Refs::with_degree(4);
        refs.append_hashes(&pack, &[h(1), h(2), h(1), h(3)]).unwrap();
        refs.delete_by_hash(&pack, &h(1)).unwrap();
        assert_eq!(refs.len(&pack).unwrap(), 2);
        assert!(!refs.has_hash(&pack, &h(1)).unwrap());
        assert!(refs.has_hash(&pack, &h(3)).unwrap());
    }

    #[test]
    fn test_delete_slice_by_indices() {
        let pack = MemoryPack::new();
        let mut refs = Refs::with_degree(4);
        refs.append_hashes(&pack, &hashes(10)).unwrap();
        refs.delete_slice_by_indices(&pack, 2, 6).unwrap();
        assert_eq!(refs.len(&pack).unwrap(), 6);
        let expect = [h(0), h(1), h(6), h(7), h(8), h(9)];
        for (i, want) in expect.iter().enumerate() {
            assert_eq!(refs.hash_by_index(&pack, i).unwrap(), *want);
        }
        // empty range is a no-op
        let before = refs.hash();
        refs.delete_slice_by_indices(&pack, 3, 3).unwrap();
        assert_eq!(refs.hash(), before);
    }

    #[test]
    fn test_slice_validation() {
        let pack = MemoryPack::new();
        let mut refs = Refs::with_degree(4);
        refs.append_hashes(&pack, &hashes(4)).unwrap();
        assert!(matches!(
            refs.slice(&pack, 3, 1),
            Err(Error::InvalidSliceIndex { from: 3, to: 1 })
        ));
        assert!(matches!(
            refs.slice(&pack, 0, 5),
            Err(Error::IndexOutOfRange { .. })
        ));
    }

    #[test]
    fn test_slice_contents() {
        let pack = MemoryPack::new();
        let mut refs = Refs::with_degree(4);
        refs.append_hashes(&pack, &hashes(10)).unwrap();

        let mut cut = refs.slice(&pack, 3, 7).unwrap();
        assert_eq!(cut.len(&pack).unwrap(), 4);
        for i in 0..4 {
            assert_eq!(cut.hash_by_index(&pack, i).unwrap(), h(3 + i as u8));
        }

        let mut empty = refs.slice(&pack, 2, 2).unwrap();
        assert!(empty.is_blank());
        assert_eq!(empty.len(&pack).unwrap(), 0);
    }

    #[test]
    fn test_append_refs() {
        let pack = MemoryPack::new();
        let mut a = Refs::with_degree(4);
        a.append_hashes(&pack, &hashes(3)).unwrap();
        let mut b = Refs::with_degree(4);
        b.append_hashes(&pack, &[h(10), h(11)]).unwrap();

        a.append_refs(&pack, &mut b).unwrap();
        assert_eq!(a.len(&pack).unwrap(), 5);
        assert_eq!(a.hash_by_index(&pack, 3).unwrap(), h(10));
        assert_eq!(a.hash_by_index(&pack, 4).unwrap(), h(11));
        assert_eq!(b.len(&pack).unwrap(), 2);
    }

    #[test]
    fn test_nil_elements() {
        let pack = MemoryPack::new();
        let mut refs = Refs::with_degree(4);
        refs.append_hashes(&pack, &[h(1), Hash::ZERO, h(2)]).unwrap();
        assert_eq!(refs.len(&pack).unwrap(), 3);
        assert!(refs.hash_by_index(&pack, 1).unwrap().is_zero());
        assert!(matches!(
            refs.value_by_index::<u64, _>(&pack, 1),
            Err(Error::ElementIsNil)
        ));
    }

    #[test]
    fn test_values_roundtrip() {
        let pack = MemoryPack::new();
        let mut refs = Refs::with_degree(4);
        let items = vec![String::from("alpha"), String::from("beta")];
        refs.append_values(&pack, items.iter().map(Some)).unwrap();
        refs.append_values::<String, _, _>(&pack, [None]).unwrap();

        assert_eq!(refs.len(&pack).unwrap(), 3);
        let alpha: String = refs.value_by_index(&pack, 0).unwrap();
        assert_eq!(alpha, "alpha");
        let beta: String = refs.value_by_index(&pack, 1).unwrap();
        assert_eq!(beta, "beta");
        assert!(matches!(
            refs.value_by_index::<String, _>(&pack, 2),
            Err(Error::ElementIsNil)
        ));

        let hash = refs.hash_by_index(&pack, 0).unwrap();
        let again: String = refs.value_by_hash(&pack, &hash).unwrap();
        assert_eq!(again, "alpha");
        let (i, value): (usize, String) = refs.value_of_hash_with_index(&pack, &hash).unwrap();
        assert_eq!((i, value.as_str()), (0, "alpha"));
    }

    #[test]
    fn test_set_value_none_blanks_without_removing() {
        let pack = MemoryPack::new();
        let mut refs = Refs::with_degree(4);
        refs.append_hashes(&pack, &hashes(3)).unwrap();
        refs.set_value_by_index::<String, _>(&pack, 1, None).unwrap();
        assert_eq!(refs.len(&pack).unwrap(), 3);
        assert!(refs.hash_by_index(&pack, 1).unwrap().is_zero());
    }

    #[test]
    fn test_index_of_hash_and_indices() {
        for flags in [Flags::NONE, Flags::HASH_TABLE_INDEX] {
            let pack = MemoryPack::with_flags(flags);
            let mut refs = Refs::with_degree(4);
            refs.append_hashes(&pack, &[h(5), h(6), h(5), h(7)]).unwrap();

            let one = refs.index_of_hash(&pack, &h(5)).unwrap();
            assert!(one == 0 || one == 2);
            let mut all = refs.indices_by_hash(&pack, &h(5)).unwrap();
            all.sort_unstable();
            assert_eq!(all, vec![0, 2]);
            assert_eq!(refs.index_of_hash(&pack, &h(7)).unwrap(), 3);
            assert!(matches!(
                refs.index_of_hash(&pack, &h(9)),
                Err(Error::NotFound)
            ));
        }
    }

    #[test]
    fn test_clear_resets_to_created_state() {
        let pack = MemoryPack::with_flags(Flags::HASH_TABLE_INDEX);
        let mut refs = Refs::with_degree(4);
        refs.append_hashes(&pack, &hashes(6)).unwrap();
        refs.clear();
        assert!(refs.is_blank());
        assert!(refs.flags().is_empty());

        // re-initializes against the next pack it sees
        let lazy = MemoryPack::new();
        assert_eq!(refs.len(&lazy).unwrap(), 0);
        refs.append_hashes(&lazy, &[h(1)]).unwrap();
        assert_eq!(refs.len(&lazy).unwrap(), 1);
    }

    #[test]
    fn test_rebuild_compacts_deleted_slots() {
        let pack = MemoryPack::new();
        let mut refs = Refs::with_degree(2);
        refs.append_hashes(&pack, &hashes(8)).unwrap();
        for _ in 0..6 {
            refs.delete_by_index(&pack, 0).unwrap();
        }
        assert_eq!(refs.len(&pack).unwrap(), 2);
        refs.rebuild(&pack).unwrap();
        assert_eq!(refs.depth(&pack).unwrap(), 1);
        assert_eq!(refs.hash_by_index(&pack, 0).unwrap(), h(6));
        assert_eq!(refs.hash_by_index(&pack, 1).unwrap(), h(7));
    }

    #[test]
    fn test_rebuild_is_idempotent() {
        let pack = MemoryPack::new();
        let mut refs = Refs::with_degree(4);
        refs.append_hashes(&pack, &hashes(9)).unwrap();
        refs.delete_by_index(&pack, 4).unwrap();
        refs.rebuild(&pack).unwrap();
        let first = refs.hash();
        refs.rebuild(&pack).unwrap();
        assert_eq!(refs.hash(), first);
    }

    #[test]
    fn test_root_record_matches_reported_state() {
        let pack = MemoryPack::new();
        let mut refs = Refs::with_degree(4);
        refs.append_hashes(&pack, &hashes(7)).unwrap();
        refs.delete_by_index(&pack, 1).unwrap();

        let bytes = pack.get(&refs.hash()).unwrap();
        let record = RootRecord::decode(&bytes).unwrap();
        assert_eq!(record.degree, 4);
        assert_eq!(record.length as usize, refs.len(&pack).unwrap());
        assert_eq!(record.depth as usize + 1, refs.depth(&pack).unwrap());
    }

    #[test]
    fn test_tree_string_shapes() {
        let pack = MemoryPack::new();
        let mut refs = Refs::with_degree(2);
        refs.append_hashes(&pack, &hashes(4)).unwrap();
        let dump = refs.tree_string(&pack, true).unwrap();
        assert!(dump.starts_with(&format!("refs {}", refs.short())));
        assert!(dump.contains("length:2"));

        let mut rehydrated = Refs::from_hash(refs.hash());
        let lazy_dump = rehydrated.tree_string(&pack, false).unwrap();
        assert!(lazy_dump.contains("(not loaded)"));
    }

    #[test]
    fn test_min_depth() {
        assert_eq!(min_depth(4, 0), 0);
        assert_eq!(min_depth(4, 4), 0);
        assert_eq!(min_depth(4, 5), 1);
        assert_eq!(min_depth(4, 16), 1);
        assert_eq!(min_depth(4, 17), 2);
        assert_eq!(min_depth(2, 9), 3);
    }

    #[test]
    fn test_pow_saturates() {
        assert_eq!(pow(4, 0), 1);
        assert_eq!(pow(4, 3), 64);
        assert_eq!(pow(usize::MAX, 2), usize::MAX);
    }
}
