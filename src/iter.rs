//! Traversal over the vector: ascend/descend with modification-safe
//! rewind.
//!
//! A traversal pushes an entry onto the vector's rewind stack and pops it
//! on exit. Mutating operations flip the innermost entry; the leaf loop
//! checks it after every callback and, when set, propagates the signal to
//! the enclosing iterator, unwinds to the top-level driver, and re-enters
//! the recursion from the logical position in the *current* tree. This is
//! what keeps iteration sound when the callback deletes or appends on the
//! same vector, or on an enclosing one.
//!
//! Callbacks return a tri-state: continue, stop (reported as success), or
//! an error that aborts the traversal and surfaces unchanged.

use crate::error::Result;
use crate::hash::Hash;
use crate::pack::Pack;
use crate::refs::Refs;
use crate::tree::BranchId;

/// What a traversal callback wants to happen next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterAction {
    /// Visit the next element.
    Continue,
    /// End the traversal normally.
    Stop,
}

/// Outcome of one recursion pass. `pass` counts callback invocations in
/// the pass, which the driver turns into the re-entry position.
enum Step {
    Done,
    Rewind { pass: usize },
    Stopped,
}

impl Refs {
    /// Visit every element in ascending index order.
    ///
    /// The callback receives the vector itself (so it can mutate during
    /// the traversal), the element's current linear index, and its hash.
    pub fn ascend<P, F>(&mut self, pack: &P, f: F) -> Result<()>
    where
        P: Pack,
        F: FnMut(&mut Refs, usize, Hash) -> Result<IterAction>,
    {
        self.ascend_from(pack, 0, f)
    }

    /// Visit elements in ascending order starting at index `from`.
    pub fn ascend_from<P, F>(&mut self, pack: &P, from: usize, mut f: F) -> Result<()>
    where
        P: Pack,
        F: FnMut(&mut Refs, usize, Hash) -> Result<IterAction>,
    {
        self.initialize(pack)?;
        if self.len_is_zero_or_validate(from)? {
            return Ok(());
        }

        self.iterators.push(false);
        let mut next = from;
        let mut result: Result<()> = Ok(());
        loop {
            let len_at_entry = self.length;
            let mut idx = next;
            match self.ascend_node(pack, None, self.depth, next, &mut idx, &mut f) {
                Ok(Step::Done) | Ok(Step::Stopped) => break,
                Ok(Step::Rewind { pass }) => {
                    // Elements removed at or below the cursor shift the
                    // resume position down; appends land on the tail and
                    // do not.
                    let shift = len_at_entry.saturating_sub(self.length);
                    next += pass.saturating_sub(shift);
                    if next >= self.length {
                        break;
                    }
                }
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
        }
        self.pop_iterator();
        if result.is_ok() && self.modified && self.iterators.is_empty() {
            result = self.rebuild_inner(pack);
        }
        result
    }

    /// Visit every element in descending index order.
    pub fn descend<P, F>(&mut self, pack: &P, f: F) -> Result<()>
    where
        P: Pack,
        F: FnMut(&mut Refs, usize, Hash) -> Result<IterAction>,
    {
        self.initialize(pack)?;
        if self.length == 0 {
            return Ok(());
        }
        let from = self.length - 1;
        self.descend_from(pack, from, f)
    }

    /// Visit elements in descending order starting at index `from`.
    pub fn descend_from<P, F>(&mut self, pack: &P, from: usize, mut f: F) -> Result<()>
    where
        P: Pack,
        F: FnMut(&mut Refs, usize, Hash) -> Result<IterAction>,
    {
        self.initialize(pack)?;
        if self.len_is_zero_or_validate(from)? {
            return Ok(());
        }

        self.iterators.push(false);
        let mut next = from;
        let mut result: Result<()> = Ok(());
        loop {
            let rel_back = (self.length - 1) - next;
            let mut idx = next;
            match self.descend_node(pack, None, self.depth, rel_back, &mut idx, &mut f) {
                Ok(Step::Done) | Ok(Step::Stopped) => break,
                Ok(Step::Rewind { pass }) => {
                    if self.length == 0 || pass > next {
                        break;
                    }
                    next -= pass;
                    if next >= self.length {
                        next = self.length - 1;
                    }
                }
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
        }
        self.pop_iterator();
        if result.is_ok() && self.modified && self.iterators.is_empty() {
            result = self.rebuild_inner(pack);
        }
        result
    }

    /// Traversal of an empty vector is a no-op; otherwise the starting
    /// index is validated against the length.
    fn len_is_zero_or_validate(&self, from: usize) -> Result<bool> {
        if self.length == 0 {
            return Ok(true);
        }
        if from >= self.length {
            return Err(crate::error::Error::out_of_range(from, self.length));
        }
        Ok(false)
    }

    /// Pop the traversal's rewind entry, handing a still-pending signal
    /// to the enclosing iterator.
    fn pop_iterator(&mut self) {
        if let Some(flag) = self.iterators.pop() {
            if flag {
                if let Some(top) = self.iterators.last_mut() {
                    *top = true;
                }
            }
        }
    }

    /// Consume the innermost rewind signal, passing it down the stack so
    /// enclosing iterators re-validate too.
    fn take_rewind(&mut self) -> bool {
        let n = self.iterators.len();
        if n == 0 || !self.iterators[n - 1] {
            return false;
        }
        if n > 1 {
            self.iterators[n - 2] = true;
        }
        self.iterators[n - 1] = false;
        true
    }

    /// Ascend the subtree rooted at `at`, skipping the first `rel` live
    /// elements. `idx` is the global index handed to the callback.
    fn ascend_node<P, F>(
        &mut self,
        pack: &P,
        at: Option<BranchId>,
        node_depth: usize,
        rel: usize,
        idx: &mut usize,
        f: &mut F,
    ) -> Result<Step>
    where
        P: Pack,
        F: FnMut(&mut Refs, usize, Hash) -> Result<IterAction>,
    {
        if node_depth == 0 {
            let mut seen = 0usize;
            let mut pass = 0usize;
            for id in self.leaf_ids_at(at)? {
                let leaf = self.leaf(id);
                if leaf.deleted {
                    continue;
                }
                if seen < rel {
                    seen += 1;
                    continue;
                }
                let hash = leaf.hash;
                let action = f(self, *idx, hash)?;
                *idx += 1;
                seen += 1;
                pass += 1;
                if let IterAction::Stop = action {
                    return Ok(Step::Stopped);
                }
                if self.take_rewind() {
                    return Ok(Step::Rewind { pass });
                }
            }
            return Ok(Step::Done);
        }

        let mut rel = rel;
        let mut pass = 0usize;
        for id in self.branch_ids_at(at)? {
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
            match self.ascend_node(pack, Some(id), node_depth - 1, rel, idx, f)? {
                Step::Done => {
                    pass += len - rel;
                    rel = 0;
                }
                Step::Rewind { pass: sub } => {
                    return Ok(Step::Rewind { pass: pass + sub });
                }
                Step::Stopped => return Ok(Step::Stopped),
            }
        }
        Ok(Step::Done)
    }

    /// Descend the subtree rooted at `at`, skipping the last `rel_back`
    /// live elements. `idx` counts down the global index.
    fn descend_node<P, F>(
        &mut self,
        pack: &P,
        at: Option<BranchId>,
        node_depth: usize,
        rel_back: usize,
        idx: &mut usize,
        f: &mut F,
    ) -> Result<Step>
    where
        P: Pack,
        F: FnMut(&mut Refs, usize, Hash) -> Result<IterAction>,
    {
        if node_depth == 0 {
            let mut seen = 0usize;
            let mut pass = 0usize;
            for id in self.leaf_ids_at(at)?.into_iter().rev() {
                let leaf = self.leaf(id);
                if leaf.deleted {
                    continue;
                }
                if seen < rel_back {
                    seen += 1;
                    continue;
                }
                let hash = leaf.hash;
                let action = f(self, *idx, hash)?;
                *idx = idx.saturating_sub(1);
                seen += 1;
                pass += 1;
                if let IterAction::Stop = action {
                    return Ok(Step::Stopped);
                }
                if self.take_rewind() {
                    return Ok(Step::Rewind { pass });
                }
            }
            return Ok(Step::Done);
        }

        let mut rel_back = rel_back;
        let mut pass = 0usize;
        for id in self.branch_ids_at(at)?.into_iter().rev() {
            if self.branch(id).deleted {
                continue;
            }
            self.ensure_loaded(pack, id, node_depth - 1)?;
            let len = self.loaded_length(id);
            if len == 0 {
                continue;
            }
            if rel_back >= len {
                rel_back -= len;
                continue;
            }
            match self.descend_node(pack, Some(id), node_depth - 1, rel_back, idx, f)? {
                Step::Done => {
                    pass += len - rel_back;
                    rel_back = 0;
                }
                Step::Rewind { pass: sub } => {
                    return Ok(Step::Rewind { pass: pass + sub });
                }
                Step::Stopped => return Ok(Step::Stopped),
            }
        }
        Ok(Step::Done)
    }
}
