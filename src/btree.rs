//! The copy-on-write B+tree engine (spec §4.4), operating over a single
//! DBI's root page id.
//!
//! Branch pages reuse the page header's `next_pgno` field as the
//! left-most child pointer (children are one more than the entries: entry
//! `i` holds `(separator_i, child_{i+1})`, and `child_0` is `next_pgno`).
//! Leaf pages reuse the same field as a right-sibling link, enabling
//! ordered range scans without re-walking from the root. Both reuses are
//! page-type-local; overflow pages use the field for their own chain link.

use crate::comparator::Comparator;
use crate::error::{Error, PageId, Result, TransactionId};
use crate::overflow;
use crate::page::{NodeFlags, Page, PageFlags, SearchResult, HEADER_SIZE};
use bitflags::bitflags;
use std::ops::Bound;

bitflags! {
    /// Flags accepted by [`put`] (spec §6 put flags).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PutFlags: u8 {
        /// Fail with `Exists` instead of overwriting a present key.
        const NO_OVERWRITE = 0x01;
        /// Reserve space for the value without writing it yet (the caller
        /// fills it in afterward). Sapling treats this the same as a
        /// normal put of the given bytes; the distinction only matters to
        /// callers who want to avoid an extra copy, which is outside what
        /// this engine's API surface can express generically.
        const RESERVE_SPACE = 0x02;
    }
}

/// Result of a successful [`put`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PutOutcome {
    /// The key was new.
    Inserted,
    /// The key already existed; the old value is returned.
    Updated(Vec<u8>),
}

/// Abstraction the tree layer uses to read and mutate pages, so it never
/// talks to a page store or a transaction's write overlay directly.
/// Implemented by `Transaction<Write>` (see `txn.rs`).
pub trait TreeIo {
    /// The write transaction this tree mutation is running under.
    fn txn_id(&self) -> TransactionId;
    /// This DB's configured page size.
    fn page_size(&self) -> usize;
    /// Read a page by id.
    fn read(&self, id: PageId) -> Result<Page>;
    /// Return a page at `id` safe to mutate in place: if it already
    /// belongs to the active transaction, it's returned unchanged;
    /// otherwise a fresh copy is allocated under a new id and the old id
    /// is staged for reclamation. Callers must persist the result with
    /// [`TreeIo::write`] and propagate the (possibly new) id upward.
    fn cow(&mut self, id: PageId) -> Result<Page>;
    /// Allocate a brand new page (no prior contents to preserve).
    fn alloc(&mut self, flags: PageFlags) -> Result<Page>;
    /// Persist a page's current contents back to the store.
    fn write(&mut self, page: &Page) -> Result<()>;
    /// Stage a page for reclamation once this transaction commits.
    fn free(&mut self, id: PageId);
}

fn decode_child_id(bytes: &[u8]) -> PageId {
    PageId(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn half_capacity(page_size: usize) -> usize {
    (page_size - HEADER_SIZE) / 2
}

fn is_underflowed(page: &Page) -> bool {
    page.num_keys() > 0 && page.used_bytes() < half_capacity(page.page_size())
}

/// Resolve a node's value: either its inline bytes, or a fetch through the
/// overflow chain if it's BIGDATA.
pub(crate) fn materialize_value(io: &dyn TreeIo, node: crate::page::NodeView<'_>) -> Result<Vec<u8>> {
    if node.flags.contains(NodeFlags::BIGDATA) {
        overflow::read_value(node.overflow_head(), &|id| io.read(id))
    } else {
        Ok(node.value.to_vec())
    }
}

/// Find the children-array index and child page id a branch page would
/// descend into to reach `key` (see module docs for the index convention).
fn find_child(page: &Page, key: &[u8], cmp: &dyn Comparator) -> Result<(usize, PageId)> {
    match page.search_key(key, cmp)? {
        SearchResult::Found(idx) => Ok((idx + 1, page.node(idx)?.child_page())),
        SearchResult::NotFound(0) => Ok((0, page.next_pgno())),
        SearchResult::NotFound(idx) => Ok((idx, page.node(idx - 1)?.child_page())),
    }
}

/// One branch level crossed while descending, recorded so inserts/deletes
/// that change a child's id or cause a split/merge can be propagated back
/// up without re-walking from the root.
#[derive(Debug, Clone, Copy)]
struct PathStep {
    page_id: PageId,
    children_index: usize,
}

fn walk_to_leaf(
    io: &dyn TreeIo,
    root: PageId,
    key: &[u8],
    cmp: &dyn Comparator,
) -> Result<(Vec<PathStep>, Page)> {
    let mut path = Vec::new();
    let mut current = root;
    loop {
        let page = io.read(current)?;
        if page.flags().contains(PageFlags::LEAF) {
            return Ok((path, page));
        }
        if !page.flags().contains(PageFlags::BRANCH) {
            return Err(Error::corrupt_at("expected branch or leaf page", current));
        }
        let (children_index, child_id) = find_child(&page, key, cmp)?;
        path.push(PathStep { page_id: current, children_index });
        current = child_id;
    }
}

// --- get -------------------------------------------------------------------

/// Look up `key`, returning its (possibly overflow-resolved) value.
pub fn get(io: &dyn TreeIo, root: PageId, key: &[u8], cmp: &dyn Comparator) -> Result<Option<Vec<u8>>> {
    if root.is_none() {
        return Ok(None);
    }
    let (_, leaf) = walk_to_leaf(io, root, key, cmp)?;
    match leaf.search_key(key, cmp)? {
        SearchResult::Found(idx) => Ok(Some(materialize_value(io, leaf.node(idx)?)?)),
        SearchResult::NotFound(_) => Ok(None),
    }
}

// --- put ---------------------------------------------------------------------

fn split_cost(page_size: usize) -> usize {
    page_size - HEADER_SIZE
}

/// Split a full leaf's entries (already sorted, including the would-be new
/// entry) at the point where the cumulative size first exceeds half the
/// usable payload, per spec §4.4's tie-break rule.
fn leaf_split_point(entries: &[(Vec<u8>, Vec<u8>, NodeFlags)], page_size: usize) -> usize {
    let half = split_cost(page_size) / 2;
    let mut acc = 0usize;
    for (i, (k, v, _)) in entries.iter().enumerate() {
        acc += Page::entry_cost(k.len(), v.len());
        if acc > half {
            // Tie-break: keep the split so the smaller side carries the
            // last entry we just counted, when the two sides would
            // otherwise be within one entry's size of each other.
            return (i + 1).min(entries.len() - 1).max(1);
        }
    }
    entries.len() / 2
}

fn rebuild_leaf(page: &mut Page, entries: &[(Vec<u8>, Vec<u8>, NodeFlags)]) -> Result<()> {
    page.rebuild(entries)
}

/// Insert or replace `key`'s entry in the leaf at `leaf`, which must
/// already be cow'd. Returns a split descriptor if the leaf overflowed.
enum LeafPut {
    Done(PutOutcome),
    Split { separator: Vec<u8>, right: Page },
}

fn put_into_leaf(
    io: &mut dyn TreeIo,
    leaf: &mut Page,
    key: &[u8],
    value_bytes: &[u8],
    bigdata: bool,
    flags: PutFlags,
    cmp: &dyn Comparator,
) -> Result<LeafPut> {
    let node_flags = if bigdata { NodeFlags::BIGDATA } else { NodeFlags::empty() };

    match leaf.search_key(key, cmp)? {
        SearchResult::Found(idx) => {
            if flags.contains(PutFlags::NO_OVERWRITE) {
                return Err(Error::Exists);
            }
            let old = materialize_value(io, leaf.node(idx)?)?;
            let old_bigdata = leaf.node(idx)?.flags.contains(NodeFlags::BIGDATA);
            if old_bigdata {
                let head = leaf.node(idx)?.overflow_head();
                for id in overflow::chain_pages(head, &|id| io.read(id))? {
                    io.free(id);
                }
            }
            leaf.remove_at(idx)?;
            match leaf.insert_at(idx, key, value_bytes, node_flags) {
                Ok(()) => Ok(LeafPut::Done(PutOutcome::Updated(old))),
                Err(Error::Full(_)) => {
                    let mut entries = leaf.entries()?;
                    entries.insert(idx.min(entries.len()), (key.to_vec(), value_bytes.to_vec(), node_flags));
                    split_leaf(io, leaf, entries, PutOutcome::Updated(old))
                }
                Err(e) => Err(e),
            }
        }
        SearchResult::NotFound(idx) => match leaf.insert_at(idx, key, value_bytes, node_flags) {
            Ok(()) => Ok(LeafPut::Done(PutOutcome::Inserted)),
            Err(Error::Full(_)) => {
                let mut entries = leaf.entries()?;
                entries.insert(idx, (key.to_vec(), value_bytes.to_vec(), node_flags));
                split_leaf(io, leaf, entries, PutOutcome::Inserted)
            }
            Err(e) => Err(e),
        },
    }
}

fn split_leaf(
    io: &mut dyn TreeIo,
    left: &mut Page,
    entries: Vec<(Vec<u8>, Vec<u8>, NodeFlags)>,
    _outcome_hint: PutOutcome,
) -> Result<LeafPut> {
    let page_size = left.page_size();
    let split = leaf_split_point(&entries, page_size);
    let (left_entries, right_entries) = entries.split_at(split);
    let separator = right_entries[0].0.clone();

    let mut right = io.alloc(PageFlags::LEAF)?;
    right.set_next_pgno(left.next_pgno());
    rebuild_leaf(&mut right, right_entries)?;

    rebuild_leaf(left, left_entries)?;
    left.set_next_pgno(right.pgno());

    // The new key always belongs to whichever side now holds it; since we
    // always insert before splitting we report `Inserted`/`Updated`
    // relative to the caller's observed outcome, computed before the
    // split (the key's presence, not its landing side, is what matters).
    Ok(LeafPut::Split { separator, right })
}

/// Recompute a branch page's children-index insertion position for a
/// newly split child, per the uniform rule in the module docs: the new
/// separator/child pair is inserted at exactly the children-index the
/// split child occupied.
fn insert_branch_separator(
    branch: &mut Page,
    children_index: usize,
    separator: &[u8],
    right_id: PageId,
) -> Result<()> {
    match branch.insert_at(children_index, separator, &crate::page::encode_child(right_id), NodeFlags::empty()) {
        Ok(()) => Ok(()),
        Err(Error::Full(_)) => Err(Error::Full("branch split required")),
        Err(e) => Err(e),
    }
}

enum BranchPut {
    Done,
    Split { separator: Vec<u8>, right: Page },
}

fn put_separator_in_branch(
    io: &mut dyn TreeIo,
    branch: &mut Page,
    children_index: usize,
    separator: &[u8],
    right_id: PageId,
) -> Result<BranchPut> {
    match insert_branch_separator(branch, children_index, separator, right_id) {
        Ok(()) => Ok(BranchPut::Done),
        Err(Error::Full(_)) => {
            let mut entries = branch.entries()?;
            entries.insert(
                children_index.min(entries.len()),
                (separator.to_vec(), crate::page::encode_child(right_id).to_vec(), NodeFlags::empty()),
            );
            split_branch(io, branch, entries)
        }
        Err(e) => Err(e),
    }
}

fn split_branch(
    io: &mut dyn TreeIo,
    left: &mut Page,
    entries: Vec<(Vec<u8>, Vec<u8>, NodeFlags)>,
) -> Result<BranchPut> {
    let median = entries.len() / 2;
    let pushed_up = entries[median].0.clone();
    let pushed_child = decode_child_id(&entries[median].1);

    let left_entries = &entries[..median];
    let right_entries = &entries[median + 1..];

    let mut right = io.alloc(PageFlags::BRANCH)?;
    right.set_next_pgno(pushed_child);
    for (k, v, f) in right_entries {
        let idx = right.num_keys();
        right.insert_at(idx, k, v, *f)?;
    }

    left.clear();
    for (k, v, f) in left_entries {
        let idx = left.num_keys();
        left.insert_at(idx, k, v, *f)?;
    }

    Ok(BranchPut::Split { separator: pushed_up, right })
}

/// Insert or replace `key` -> `value` under `root`, returning the
/// (possibly new) root id and the outcome.
pub fn put(
    io: &mut dyn TreeIo,
    root: PageId,
    key: &[u8],
    value: &[u8],
    flags: PutFlags,
    cmp: &dyn Comparator,
) -> Result<(PageId, PutOutcome)> {
    let page_size = io.page_size();
    let txn_id = io.txn_id();
    let bigdata = value.len() > overflow::inline_threshold(page_size);
    let (head_storage, overflow_pages) = if bigdata {
        let mut alloc_fn = || -> Result<PageId> { Ok(io.alloc(PageFlags::OVERFLOW)?.pgno()) };
        let (head, pages) = overflow::write_value(page_size, txn_id, value, &mut alloc_fn)?;
        (Some(head), pages)
    } else {
        (None, Vec::new())
    };
    for p in &overflow_pages {
        io.write(p)?;
    }
    let value_bytes;
    let stored_value: &[u8] = if let Some(head) = head_storage {
        value_bytes = head.0.to_le_bytes();
        &value_bytes
    } else {
        value
    };

    if root.is_none() {
        let mut leaf = io.alloc(PageFlags::LEAF)?;
        leaf.set_next_pgno(PageId::NONE);
        let node_flags = if bigdata { NodeFlags::BIGDATA } else { NodeFlags::empty() };
        leaf.insert_at(0, key, stored_value, node_flags)?;
        io.write(&leaf)?;
        return Ok((leaf.pgno(), PutOutcome::Inserted));
    }

    let (path, leaf_page) = walk_to_leaf(io, root, key, cmp)?;
    let mut leaf = io.cow(leaf_page.pgno())?;
    let result = put_into_leaf(io, &mut leaf, key, stored_value, bigdata, flags, cmp)?;
    io.write(&leaf)?;

    let (mut new_child_id, mut pending_split, outcome) = match result {
        LeafPut::Done(outcome) => (leaf.pgno(), None, outcome),
        LeafPut::Split { separator, right } => {
            io.write(&right)?;
            let outcome = PutOutcome::Inserted;
            (leaf.pgno(), Some((separator, right.pgno())), outcome)
        }
    };

    for step in path.iter().rev() {
        let mut branch = io.cow(step.page_id)?;
        if step.children_index == 0 {
            branch.set_next_pgno(new_child_id);
        } else {
            let old_entry = branch.node(step.children_index - 1)?;
            let key = old_entry.key.to_vec();
            branch.remove_at(step.children_index - 1)?;
            branch.insert_at(step.children_index - 1, &key, &crate::page::encode_child(new_child_id), NodeFlags::empty())?;
        }

        if let Some((sep, right_id)) = pending_split.take() {
            match put_separator_in_branch(io, &mut branch, step.children_index, &sep, right_id)? {
                BranchPut::Done => {}
                BranchPut::Split { separator, right } => {
                    io.write(&right)?;
                    pending_split = Some((separator, right.pgno()));
                }
            }
        }
        io.write(&branch)?;
        new_child_id = branch.pgno();
    }

    if let Some((sep, right_id)) = pending_split {
        let mut new_root = io.alloc(PageFlags::BRANCH)?;
        new_root.set_next_pgno(new_child_id);
        new_root.insert_at(0, &sep, &crate::page::encode_child(right_id), NodeFlags::empty())?;
        io.write(&new_root)?;
        new_child_id = new_root.pgno();
    }

    Ok((new_child_id, outcome))
}

/// Compare-and-swap: replace `key`'s value with `new_value` iff its
/// current value equals `expected`.
pub fn put_if(
    io: &mut dyn TreeIo,
    root: PageId,
    key: &[u8],
    new_value: &[u8],
    expected: &[u8],
    cmp: &dyn Comparator,
) -> Result<(PageId, PutOutcome)> {
    let current = get(io, root, key, cmp)?;
    match current {
        None => Err(Error::NotFound),
        Some(v) if v == expected => put(io, root, key, new_value, PutFlags::empty(), cmp),
        Some(_) => Err(Error::Conflict("put_if: current value does not match expected")),
    }
}

/// Apply `callback(current_value, operand) -> new_value` at `key`,
/// storing the result.
pub fn merge(
    io: &mut dyn TreeIo,
    root: PageId,
    key: &[u8],
    operand: &[u8],
    callback: &dyn Fn(Option<&[u8]>, &[u8]) -> Result<Vec<u8>>,
    cmp: &dyn Comparator,
) -> Result<(PageId, Vec<u8>)> {
    let current = get(io, root, key, cmp)?;
    let new_value = callback(current.as_deref(), operand)?;
    let (new_root, _) = put(io, root, key, &new_value, PutFlags::empty(), cmp)?;
    Ok((new_root, new_value))
}

// --- delete -------------------------------------------------------------------

enum LeafDel {
    NotFound,
    Done(Vec<u8>),
}

/// Delete `key`, returning the (possibly new) root and the removed value.
pub fn del(io: &mut dyn TreeIo, root: PageId, key: &[u8], cmp: &dyn Comparator) -> Result<(PageId, Vec<u8>)> {
    if root.is_none() {
        return Err(Error::NotFound);
    }
    let (path, leaf_page) = walk_to_leaf(io, root, key, cmp)?;
    let mut leaf = io.cow(leaf_page.pgno())?;

    let removed = match leaf.search_key(key, cmp)? {
        SearchResult::NotFound(_) => LeafDel::NotFound,
        SearchResult::Found(idx) => {
            let node = leaf.node(idx)?;
            let value = materialize_value(io, node)?;
            if node.flags.contains(NodeFlags::BIGDATA) {
                let head = node.overflow_head();
                for id in overflow::chain_pages(head, &|id| io.read(id))? {
                    io.free(id);
                }
            }
            leaf.remove_at(idx)?;
            LeafDel::Done(value)
        }
    };

    let removed_value = match removed {
        LeafDel::NotFound => return Err(Error::NotFound),
        LeafDel::Done(v) => v,
    };
    io.write(&leaf)?;

    let mut new_child_id = leaf.pgno();
    // propagate up, fixing underflow as we go
    let mut child_underflowed = is_underflowed(&leaf) && !path.is_empty();

    for (depth, step) in path.iter().enumerate().rev() {
        let mut branch = io.cow(step.page_id)?;
        if step.children_index == 0 {
            branch.set_next_pgno(new_child_id);
        } else {
            let key = branch.node(step.children_index - 1)?.key.to_vec();
            branch.remove_at(step.children_index - 1)?;
            branch.insert_at(step.children_index - 1, &key, &crate::page::encode_child(new_child_id), NodeFlags::empty())?;
        }

        if child_underflowed {
            let is_leaf_level = depth == path.len() - 1;
            fix_underflow(io, &mut branch, step.children_index, is_leaf_level)?;
        }

        io.write(&branch)?;
        new_child_id = branch.pgno();
        child_underflowed = branch.num_keys() == 0 || is_underflowed(&branch);
    }

    // Collapse a root branch that was left with no separators: its single
    // remaining child becomes the new root.
    let mut final_root = new_child_id;
    loop {
        let page = io.read(final_root)?;
        if page.flags().contains(PageFlags::BRANCH) && page.num_keys() == 0 {
            final_root = page.next_pgno();
        } else {
            break;
        }
    }

    Ok((final_root, removed_value))
}

/// After a child at `children_index` shrank below half-full, try to
/// redistribute from a sibling, or merge with one. `child_is_leaf`
/// selects leaf-shaped vs. branch-shaped sibling surgery.
fn fix_underflow(io: &mut dyn TreeIo, branch: &mut Page, children_index: usize, child_is_leaf: bool) -> Result<()> {
    let num_children = branch.num_keys() + 1;
    let child_id = child_at(branch, children_index)?;

    let left_sibling = if children_index > 0 { Some(children_index - 1) } else { None };
    let right_sibling = if children_index + 1 < num_children { Some(children_index + 1) } else { None };

    if let Some(li) = left_sibling {
        let left_id = child_at(branch, li)?;
        let mut left = io.read(left_id)?;
        if left.used_bytes() > half_capacity(left.page_size()) {
            redistribute(io, branch, li, children_index, &mut left, child_is_leaf)?;
            return Ok(());
        }
    }
    if let Some(ri) = right_sibling {
        let right_id = child_at(branch, ri)?;
        let mut right = io.read(right_id)?;
        if right.used_bytes() > half_capacity(right.page_size()) {
            redistribute(io, branch, children_index, ri, &mut right, child_is_leaf)?;
            return Ok(());
        }
    }

    if let Some(li) = left_sibling {
        merge_children(io, branch, li, children_index, child_is_leaf)?;
    } else if let Some(ri) = right_sibling {
        merge_children(io, branch, children_index, ri, child_is_leaf)?;
    }
    let _ = child_id;
    Ok(())
}

fn child_at(branch: &Page, children_index: usize) -> Result<PageId> {
    if children_index == 0 {
        Ok(branch.next_pgno())
    } else {
        Ok(branch.node(children_index - 1)?.child_page())
    }
}

fn set_child_at(branch: &mut Page, children_index: usize, id: PageId) -> Result<()> {
    if children_index == 0 {
        branch.set_next_pgno(id);
    } else {
        let key = branch.node(children_index - 1)?.key.to_vec();
        branch.remove_at(children_index - 1)?;
        branch.insert_at(children_index - 1, &key, &crate::page::encode_child(id), NodeFlags::empty())?;
    }
    Ok(())
}

/// Move one entry from the donor (`left_idx` if it's the left neighbour,
/// otherwise the sibling holds the rightmost spare entry) across the
/// `left_idx`/`right_idx` boundary to relieve whichever side underflowed.
fn redistribute(
    io: &mut dyn TreeIo,
    branch: &mut Page,
    left_idx: usize,
    right_idx: usize,
    donor_hint: &mut Page,
    child_is_leaf: bool,
) -> Result<()> {
    let left_id = child_at(branch, left_idx)?;
    let right_id = child_at(branch, right_idx)?;
    let mut left = io.cow(left_id)?;
    let mut right = io.cow(right_id)?;
    let _ = donor_hint;

    let left_underflowed = is_underflowed(&left);

    if child_is_leaf {
        if left_underflowed {
            // borrow right's first entry
            let mut entries = right.entries()?;
            if entries.is_empty() {
                return Ok(());
            }
            let moved = entries.remove(0);
            left.insert_at(left.num_keys(), &moved.0, &moved.1, moved.2)?;
            right.rebuild(&entries)?;
        } else {
            // borrow left's last entry
            let mut entries = left.entries()?;
            if entries.is_empty() {
                return Ok(());
            }
            let moved = entries.pop().unwrap();
            left.rebuild(&entries)?;
            right.insert_at(0, &moved.0, &moved.1, moved.2)?;
        }
        // parent separator between left/right must equal right's new first key
        if right.num_keys() > 0 {
            let new_sep = right.node(0)?.key.to_vec();
            set_separator(branch, right_idx, &new_sep)?;
        }
    } else {
        // Branch rotation: rotate through the existing parent separator.
        let parent_sep = branch.node(right_idx - 1)?.key.to_vec();
        if left_underflowed {
            let mut right_entries = right.entries()?;
            if right_entries.is_empty() {
                return Ok(());
            }
            let moved = right_entries.remove(0);
            let old_right_leftmost = right.next_pgno();
            left.insert_at(left.num_keys(), &parent_sep, &crate::page::encode_child(old_right_leftmost), NodeFlags::empty())?;
            right.set_next_pgno(decode_child_id(&moved.1));
            right.rebuild(&right_entries)?;
            set_separator(branch, right_idx, &moved.0)?;
        } else {
            let mut left_entries = left.entries()?;
            if left_entries.is_empty() {
                return Ok(());
            }
            let moved = left_entries.pop().unwrap();
            left.rebuild(&left_entries)?;
            let old_right_leftmost = right.next_pgno();
            right.insert_at(0, &parent_sep, &crate::page::encode_child(old_right_leftmost), NodeFlags::empty())?;
            right.set_next_pgno(decode_child_id(&moved.1));
            set_separator(branch, right_idx, &moved.0)?;
        }
    }

    set_child_at(branch, left_idx, left.pgno())?;
    set_child_at(branch, right_idx, right.pgno())?;
    io.write(&left)?;
    io.write(&right)?;
    Ok(())
}

fn set_separator(branch: &mut Page, right_idx: usize, new_key: &[u8]) -> Result<()> {
    let entry_idx = right_idx - 1;
    let value = branch.node(entry_idx)?.value.to_vec();
    branch.remove_at(entry_idx)?;
    branch.insert_at(entry_idx, new_key, &value, NodeFlags::empty())
}

/// Merge the child at `right_idx` into the child at `left_idx`, removing
/// the separator between them from `branch`.
fn merge_children(io: &mut dyn TreeIo, branch: &mut Page, left_idx: usize, right_idx: usize, child_is_leaf: bool) -> Result<()> {
    let left_id = child_at(branch, left_idx)?;
    let right_id = child_at(branch, right_idx)?;
    let mut left = io.cow(left_id)?;
    let right = io.read(right_id)?;

    if child_is_leaf {
        let mut entries = left.entries()?;
        entries.extend(right.entries()?);
        left.rebuild(&entries)?;
        left.set_next_pgno(right.next_pgno());
    } else {
        let parent_sep = branch.node(right_idx - 1)?.key.to_vec();
        let mut entries = left.entries()?;
        entries.push((parent_sep, crate::page::encode_child(right.next_pgno()).to_vec(), NodeFlags::empty()));
        entries.extend(right.entries()?);
        left.rebuild(&entries)?;
    }

    io.free(right_id);
    set_child_at(branch, left_idx, left.pgno())?;
    io.write(&left)?;

    // remove separator entry that pointed at `right_idx`
    let sep_entry_idx = right_idx - 1;
    branch.remove_at(sep_entry_idx)?;
    Ok(())
}

// --- range operations ---------------------------------------------------------

fn key_in_bounds(key: &[u8], lo: Bound<&[u8]>, hi: Bound<&[u8]>, cmp: &dyn Comparator) -> bool {
    let above_lo = match lo {
        Bound::Unbounded => true,
        Bound::Included(b) => cmp.compare(key, b) != std::cmp::Ordering::Less,
        Bound::Excluded(b) => cmp.compare(key, b) == std::cmp::Ordering::Greater,
    };
    let below_hi = match hi {
        Bound::Unbounded => true,
        Bound::Included(b) => cmp.compare(key, b) != std::cmp::Ordering::Greater,
        Bound::Excluded(b) => cmp.compare(key, b) == std::cmp::Ordering::Less,
    };
    above_lo && below_hi
}

fn leftmost_leaf(io: &dyn TreeIo, root: PageId) -> Result<Option<Page>> {
    if root.is_none() {
        return Ok(None);
    }
    let mut current = root;
    loop {
        let page = io.read(current)?;
        if page.flags().contains(PageFlags::LEAF) {
            return Ok(Some(page));
        }
        current = page.next_pgno();
    }
}

/// Count entries with keys in `[lo, hi)` (or whatever bound kind is
/// given), via a leaf-chain scan starting from the first leaf whose keys
/// could be in range.
pub fn count_range(
    io: &dyn TreeIo,
    root: PageId,
    lo: Bound<&[u8]>,
    hi: Bound<&[u8]>,
    cmp: &dyn Comparator,
) -> Result<u64> {
    let start = match lo {
        Bound::Unbounded => leftmost_leaf(io, root)?,
        Bound::Included(k) | Bound::Excluded(k) => {
            if root.is_none() {
                None
            } else {
                let (_, leaf) = walk_to_leaf(io, root, k, cmp)?;
                Some(leaf)
            }
        }
    };
    let mut count = 0u64;
    let mut current = start;
    while let Some(page) = current {
        for i in 0..page.num_keys() {
            let node = page.node(i)?;
            if key_in_bounds(node.key, lo, hi, cmp) {
                count += 1;
            } else if !matches!(hi, Bound::Unbounded) && !key_in_bounds(node.key, Bound::Unbounded, hi, cmp) {
                return Ok(count);
            }
        }
        let next = page.next_pgno();
        current = if next.is_none() { None } else { Some(io.read(next)?) };
    }
    Ok(count)
}

/// Delete every entry with a key in `[lo, hi)`, returning the (possibly
/// new) root and the number of entries removed.
pub fn del_range(
    io: &mut dyn TreeIo,
    mut root: PageId,
    lo: Bound<&[u8]>,
    hi: Bound<&[u8]>,
    cmp: &dyn Comparator,
) -> Result<(PageId, u64)> {
    // Collect keys first (range boundaries shift under concurrent
    // structural edits), then delete them one at a time through the
    // normal path so split/merge bookkeeping stays correct.
    let mut keys = Vec::new();
    let mut current = match lo {
        Bound::Unbounded => leftmost_leaf(io, root)?,
        Bound::Included(k) | Bound::Excluded(k) => {
            if root.is_none() { None } else { Some(walk_to_leaf(io, root, k, cmp)?.1) }
        }
    };
    'outer: while let Some(page) = current {
        for i in 0..page.num_keys() {
            let node = page.node(i)?;
            if key_in_bounds(node.key, lo, hi, cmp) {
                keys.push(node.key.to_vec());
            } else if !matches!(hi, Bound::Unbounded) && !key_in_bounds(node.key, Bound::Unbounded, hi, cmp) {
                break 'outer;
            }
        }
        let next = page.next_pgno();
        current = if next.is_none() { None } else { Some(io.read(next)?) };
    }

    let mut count = 0u64;
    for key in &keys {
        let (new_root, _) = del(io, root, key, cmp)?;
        root = new_root;
        count += 1;
    }
    Ok((root, count))
}

// --- path access for cursors -------------------------------------------------

/// A (page id, children-index) step recorded while descending from root to
/// leaf. Exposed so `cursor.rs` can maintain its own root-to-leaf path for
/// prev/next boundary climbs without re-implementing tree descent.
#[derive(Debug, Clone, Copy)]
pub struct PathEntry {
    /// The branch page visited at this level.
    pub page_id: PageId,
    /// The children-array index the walk descended through.
    pub children_index: usize,
}

/// Walk from `root` to the leaf that would contain `key`, returning the
/// root-to-parent path plus the leaf page itself.
pub fn walk_path(
    io: &dyn TreeIo,
    root: PageId,
    key: &[u8],
    cmp: &dyn Comparator,
) -> Result<(Vec<PathEntry>, Page)> {
    let (path, leaf) = walk_to_leaf(io, root, key, cmp)?;
    Ok((
        path.into_iter().map(|s| PathEntry { page_id: s.page_id, children_index: s.children_index }).collect(),
        leaf,
    ))
}

/// The leftmost leaf reached by repeatedly following `next_pgno` from
/// `root`, or `None` for an empty tree.
pub fn first_leaf(io: &dyn TreeIo, root: PageId) -> Result<Option<Page>> {
    leftmost_leaf(io, root)
}

/// Child page id at `children_index` within a branch page (entry `i` holds
/// child `i+1`; `children_index == 0` is the branch's `next_pgno` field).
pub fn branch_child_at(branch: &Page, children_index: usize) -> Result<PageId> {
    child_at(branch, children_index)
}

/// Number of children a branch page holds (entry count + 1).
pub fn branch_num_children(branch: &Page) -> usize {
    branch.num_keys() + 1
}

/// Bulk-load pre-sorted `(key, value)` pairs, appending/merging them into
/// the tree. Non-DUPSORT duplicate keys fail with `Exists`.
pub fn load_sorted(
    io: &mut dyn TreeIo,
    mut root: PageId,
    entries: &[(Vec<u8>, Vec<u8>)],
    cmp: &dyn Comparator,
) -> Result<PageId> {
    for (k, v) in entries {
        let (new_root, _) = put(io, root, k, v, PutFlags::NO_OVERWRITE, cmp)?;
        root = new_root;
    }
    Ok(root)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comparator::LexicographicComparator;
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct MemTreeIo {
        txn_id: TransactionId,
        page_size: usize,
        pages: Mutex<HashMap<PageId, Page>>,
        next_id: Mutex<u32>,
    }

    impl MemTreeIo {
        fn new(page_size: usize) -> Self {
            MemTreeIo {
                txn_id: TransactionId(1),
                page_size,
                pages: Mutex::new(HashMap::new()),
                next_id: Mutex::new(0),
            }
        }
    }

    impl TreeIo for MemTreeIo {
        fn txn_id(&self) -> TransactionId {
            self.txn_id
        }
        fn page_size(&self) -> usize {
            self.page_size
        }
        fn read(&self, id: PageId) -> Result<Page> {
            self.pages.lock().unwrap().get(&id).cloned().ok_or_else(|| Error::corrupt_at("missing page", id))
        }
        fn cow(&mut self, id: PageId) -> Result<Page> {
            let page = self.read(id)?;
            if page.txn_id() == self.txn_id {
                Ok(page)
            } else {
                let new_id = {
                    let mut next_id = self.next_id.lock().unwrap();
                    let id = PageId(*next_id);
                    *next_id += 1;
                    id
                };
                let mut copy = page;
                copy.set_pgno(new_id);
                copy.set_txn_id(self.txn_id);
                self.free(id);
                Ok(copy)
            }
        }
        fn alloc(&mut self, flags: PageFlags) -> Result<Page> {
            let mut next_id = self.next_id.lock().unwrap();
            let id = PageId(*next_id);
            *next_id += 1;
            Ok(Page::new(self.page_size, id, flags, self.txn_id))
        }
        fn write(&mut self, page: &Page) -> Result<()> {
            self.pages.lock().unwrap().insert(page.pgno(), page.clone());
            Ok(())
        }
        fn free(&mut self, _id: PageId) {}
    }

    #[test]
    fn put_and_get_roundtrip() {
        let mut io = MemTreeIo::new(4096);
        let cmp = LexicographicComparator;
        let (root, outcome) = put(&mut io, PageId::NONE, b"k", b"v", PutFlags::empty(), &cmp).unwrap();
        assert_eq!(outcome, PutOutcome::Inserted);
        assert_eq!(get(&io, root, b"k", &cmp).unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn update_replaces_value() {
        let mut io = MemTreeIo::new(4096);
        let cmp = LexicographicComparator;
        let (root, _) = put(&mut io, PageId::NONE, b"k", b"v1", PutFlags::empty(), &cmp).unwrap();
        let (root, outcome) = put(&mut io, root, b"k", b"v2", PutFlags::empty(), &cmp).unwrap();
        assert_eq!(outcome, PutOutcome::Updated(b"v1".to_vec()));
        assert_eq!(get(&io, root, b"k", &cmp).unwrap(), Some(b"v2".to_vec()));
    }

    #[test]
    fn no_overwrite_rejects_existing_key() {
        let mut io = MemTreeIo::new(4096);
        let cmp = LexicographicComparator;
        let (root, _) = put(&mut io, PageId::NONE, b"k", b"v1", PutFlags::empty(), &cmp).unwrap();
        let err = put(&mut io, root, b"k", b"v2", PutFlags::NO_OVERWRITE, &cmp).unwrap_err();
        assert!(matches!(err, Error::Exists));
    }

    #[test]
    fn delete_removes_key() {
        let mut io = MemTreeIo::new(4096);
        let cmp = LexicographicComparator;
        let (root, _) = put(&mut io, PageId::NONE, b"k", b"v", PutFlags::empty(), &cmp).unwrap();
        let (root, removed) = del(&mut io, root, b"k", &cmp).unwrap();
        assert_eq!(removed, b"v");
        assert_eq!(get(&io, root, b"k", &cmp).unwrap(), None);
    }

    #[test]
    fn delete_missing_key_is_not_found() {
        let mut io = MemTreeIo::new(4096);
        let cmp = LexicographicComparator;
        assert!(matches!(del(&mut io, PageId::NONE, b"k", &cmp), Err(Error::NotFound)));
    }

    #[test]
    fn many_inserts_force_splits_and_stay_retrievable() {
        let mut io = MemTreeIo::new(256);
        let cmp = LexicographicComparator;
        let mut root = PageId::NONE;
        let mut expected = Vec::new();
        for i in 0..200u32 {
            let key = format!("key-{:05}", i).into_bytes();
            let value = format!("value-{:05}", i).into_bytes();
            let (new_root, _) = put(&mut io, root, &key, &value, PutFlags::empty(), &cmp).unwrap();
            root = new_root;
            expected.push((key, value));
        }
        for (k, v) in &expected {
            assert_eq!(get(&io, root, k, &cmp).unwrap().as_deref(), Some(v.as_slice()));
        }
    }

    #[test]
    fn delete_after_many_inserts_keeps_remaining_keys() {
        let mut io = MemTreeIo::new(256);
        let cmp = LexicographicComparator;
        let mut root = PageId::NONE;
        let mut keys = Vec::new();
        for i in 0..120u32 {
            let key = format!("k{:04}", i).into_bytes();
            let (new_root, _) = put(&mut io, root, &key, b"v", PutFlags::empty(), &cmp).unwrap();
            root = new_root;
            keys.push(key);
        }
        for key in keys.iter().step_by(2) {
            let (new_root, _) = del(&mut io, root, key, &cmp).unwrap();
            root = new_root;
        }
        for (i, key) in keys.iter().enumerate() {
            let found = get(&io, root, key, &cmp).unwrap();
            if i % 2 == 0 {
                assert_eq!(found, None, "key {:?} should be gone", key);
            } else {
                assert_eq!(found, Some(b"v".to_vec()));
            }
        }
    }

    #[test]
    fn large_value_uses_overflow_pages() {
        let mut io = MemTreeIo::new(256);
        let cmp = LexicographicComparator;
        let big_value = vec![0x42u8; 2000];
        let (root, _) = put(&mut io, PageId::NONE, b"big", &big_value, PutFlags::empty(), &cmp).unwrap();
        assert_eq!(get(&io, root, b"big", &cmp).unwrap(), Some(big_value));
    }

    #[test]
    fn put_if_succeeds_on_match_and_fails_on_mismatch() {
        let mut io = MemTreeIo::new(4096);
        let cmp = LexicographicComparator;
        let (root, _) = put(&mut io, PageId::NONE, b"k", b"old", PutFlags::empty(), &cmp).unwrap();
        let (root, _) = put_if(&mut io, root, b"k", b"new", b"old", &cmp).unwrap();
        assert_eq!(get(&io, root, b"k", &cmp).unwrap(), Some(b"new".to_vec()));
        let err = put_if(&mut io, root, b"k", b"x", b"stale", &cmp).unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[test]
    fn count_and_del_range() {
        let mut io = MemTreeIo::new(256);
        let cmp = LexicographicComparator;
        let mut root = PageId::NONE;
        for i in 0..50u32 {
            let key = format!("k{:04}", i).into_bytes();
            let (new_root, _) = put(&mut io, root, &key, b"v", PutFlags::empty(), &cmp).unwrap();
            root = new_root;
        }
        let lo = b"k0010".to_vec();
        let hi = b"k0020".to_vec();
        let n = count_range(&io, root, Bound::Included(lo.as_slice()), Bound::Excluded(hi.as_slice()), &cmp).unwrap();
        assert_eq!(n, 10);
        let (new_root, removed) =
            del_range(&mut io, root, Bound::Included(lo.as_slice()), Bound::Excluded(hi.as_slice()), &cmp).unwrap();
        assert_eq!(removed, 10);
        let n2 = count_range(&io, new_root, Bound::Included(lo.as_slice()), Bound::Excluded(hi.as_slice()), &cmp).unwrap();
        assert_eq!(n2, 0);
    }
}
