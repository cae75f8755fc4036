//! Cursor iteration over a single DBI (spec §4.4 "Cursors", §3 "Cursor").
//!
//! A cursor is a stack of (page, slot) pairs from root to leaf, plus (for
//! DUPSORT DBIs) a position within the current key's duplicate set. `seek`
//! descends in `O(log n)`; `next`/`prev` stay in `O(1)` within a leaf and
//! pay an `O(log n)` climb only at a leaf boundary (spec §4.4), grounded on
//! the teacher's `cursor.rs` position stack, adapted to this crate's safe
//! `TreeIo` abstraction instead of raw page pointers.

use crate::btree::{self, PathEntry, PutFlags, TreeIo};
use crate::comparator::ComparatorHandle;
use crate::dupsort;
use crate::error::{Error, PageId, Result};
use crate::page::{Page, PageFlags, SearchResult};

/// Whether `seek` landed on the requested key exactly or the next key after it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekOutcome {
    /// Positioned exactly at the requested key.
    Exact,
    /// The key was absent; positioned at the first key greater than it.
    After,
    /// There is no key greater than or equal to the requested key.
    NotFound,
}

/// A cursor over one DBI within a transaction.
pub struct Cursor<'a> {
    io: &'a mut dyn TreeIo,
    root: PageId,
    key_cmp: ComparatorHandle,
    value_cmp: ComparatorHandle,
    dupsort: bool,
    path: Vec<PathEntry>,
    leaf: Option<Page>,
    index: usize,
    dup_values: Option<Vec<Vec<u8>>>,
    dup_index: usize,
}

impl<'a> Cursor<'a> {
    /// Open a cursor over `root` (the DBI's current root page, which may be
    /// [`PageId::NONE`] for an empty DBI).
    pub fn new(
        io: &'a mut dyn TreeIo,
        root: PageId,
        key_cmp: ComparatorHandle,
        value_cmp: ComparatorHandle,
        dupsort: bool,
    ) -> Self {
        Cursor { io, root, key_cmp, value_cmp, dupsort, path: Vec::new(), leaf: None, index: 0, dup_values: None, dup_index: 0 }
    }

    /// The DBI root as of the cursor's last mutation (write cursors may
    /// have caused splits/merges that changed it).
    pub fn root(&self) -> PageId {
        self.root
    }

    fn clear_position(&mut self) {
        self.path.clear();
        self.leaf = None;
        self.index = 0;
        self.dup_values = None;
        self.dup_index = 0;
    }

    fn load_dup_state_for_current_key(&mut self) -> Result<()> {
        if !self.dupsort {
            self.dup_values = None;
            return Ok(());
        }
        let key = match self.current_key()? {
            Some(k) => k,
            None => {
                self.dup_values = None;
                return Ok(());
            }
        };
        let values = dupsort::dup_values(self.io, self.root, &key, self.key_cmp.as_ref(), self.value_cmp.as_ref())?;
        self.dup_index = 0;
        self.dup_values = Some(values);
        Ok(())
    }

    fn current_key(&self) -> Result<Option<Vec<u8>>> {
        match &self.leaf {
            None => Ok(None),
            Some(leaf) => {
                if self.index >= leaf.num_keys() {
                    return Ok(None);
                }
                Ok(Some(leaf.node(self.index)?.key.to_vec()))
            }
        }
    }

    fn current_raw_value(&self) -> Result<Option<Vec<u8>>> {
        match &self.leaf {
            None => Ok(None),
            Some(leaf) => {
                if self.index >= leaf.num_keys() {
                    return Ok(None);
                }
                let node = leaf.node(self.index)?;
                Ok(Some(btree::materialize_value(self.io, node)?))
            }
        }
    }

    /// The (key, value) pair the cursor is currently positioned at, or
    /// `None` if the cursor has run off either end. For a DUPSORT DBI this
    /// returns the current duplicate value, not the raw encoded blob.
    pub fn current(&self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let key = match self.current_key()? {
            Some(k) => k,
            None => return Ok(None),
        };
        if self.dupsort {
            match &self.dup_values {
                Some(values) if self.dup_index < values.len() => Ok(Some((key, values[self.dup_index].clone()))),
                _ => Ok(None),
            }
        } else {
            let value = self.current_raw_value()?.unwrap_or_default();
            Ok(Some((key, value)))
        }
    }

    /// Position at the first entry whose key is `>= key`.
    pub fn seek(&mut self, key: &[u8]) -> Result<SeekOutcome> {
        self.clear_position();
        if self.root.is_none() {
            return Ok(SeekOutcome::NotFound);
        }
        let (path, leaf) = btree::walk_path(self.io, self.root, key, self.key_cmp.as_ref())?;
        let outcome = match leaf.search_key(key, self.key_cmp.as_ref())? {
            SearchResult::Found(idx) => {
                self.path = path;
                self.index = idx;
                self.leaf = Some(leaf);
                SeekOutcome::Exact
            }
            SearchResult::NotFound(idx) if idx < leaf.num_keys() => {
                self.path = path;
                self.index = idx;
                self.leaf = Some(leaf);
                SeekOutcome::After
            }
            SearchResult::NotFound(_) => {
                self.path = path;
                self.leaf = Some(leaf);
                self.index = usize::MAX; // past end of this leaf; advance_to_next_leaf will fix up
                if !self.advance_to_next_leaf()? {
                    self.clear_position();
                    return Ok(SeekOutcome::NotFound);
                }
                SeekOutcome::After
            }
        };
        self.load_dup_state_for_current_key()?;
        Ok(outcome)
    }

    /// Position at the first entry in the DBI.
    pub fn first(&mut self) -> Result<bool> {
        self.clear_position();
        let leaf = btree::first_leaf(self.io, self.root)?;
        match leaf {
            Some(leaf) if leaf.num_keys() > 0 => {
                let first_key = leaf.node(0)?.key.to_vec();
                let (path, leaf) = btree::walk_path(self.io, self.root, &first_key, self.key_cmp.as_ref())?;
                self.path = path;
                self.leaf = Some(leaf);
                self.index = 0;
                self.load_dup_state_for_current_key()?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Position at the last entry in the DBI.
    pub fn last(&mut self) -> Result<bool> {
        self.clear_position();
        if self.root.is_none() {
            return Ok(false);
        }
        let mut current = self.root;
        let mut path = Vec::new();
        loop {
            let page = self.io.read(current)?;
            if page.flags().contains(PageFlags::LEAF) {
                if page.num_keys() == 0 {
                    return Ok(false);
                }
                self.path = path;
                self.index = page.num_keys() - 1;
                self.leaf = Some(page);
                self.load_dup_state_for_current_key()?;
                if self.dupsort {
                    if let Some(values) = &self.dup_values {
                        self.dup_index = values.len().saturating_sub(1);
                    }
                }
                return Ok(true);
            }
            let num_children = btree::branch_num_children(&page);
            let last_idx = num_children - 1;
            let child = btree::branch_child_at(&page, last_idx)?;
            path.push(PathEntry { page_id: current, children_index: last_idx });
            current = child;
        }
    }

    fn advance_to_next_leaf(&mut self) -> Result<bool> {
        let next_id = match &self.leaf {
            Some(l) => l.next_pgno(),
            None => return Ok(false),
        };
        if next_id.is_none() {
            self.clear_position();
            return Ok(false);
        }
        let next_page = self.io.read(next_id)?;
        if next_page.num_keys() == 0 {
            self.clear_position();
            return Ok(false);
        }
        let first_key = next_page.node(0)?.key.to_vec();
        let (path, leaf) = btree::walk_path(self.io, self.root, &first_key, self.key_cmp.as_ref())?;
        self.path = path;
        self.leaf = Some(leaf);
        self.index = 0;
        Ok(true)
    }

    fn retreat_to_prev_leaf(&mut self) -> Result<bool> {
        let mut path = self.path.clone();
        loop {
            let entry = match path.pop() {
                Some(e) => e,
                None => {
                    self.clear_position();
                    return Ok(false);
                }
            };
            if entry.children_index == 0 {
                continue;
            }
            let branch = self.io.read(entry.page_id)?;
            let new_idx = entry.children_index - 1;
            let mut child_id = btree::branch_child_at(&branch, new_idx)?;
            path.push(PathEntry { page_id: entry.page_id, children_index: new_idx });
            loop {
                let page = self.io.read(child_id)?;
                if page.flags().contains(PageFlags::LEAF) {
                    self.path = path;
                    self.index = page.num_keys().saturating_sub(1);
                    self.leaf = Some(page);
                    return Ok(true);
                }
                let num_children = btree::branch_num_children(&page);
                let last_idx = num_children - 1;
                let next_child = btree::branch_child_at(&page, last_idx)?;
                path.push(PathEntry { page_id: child_id, children_index: last_idx });
                child_id = next_child;
            }
        }
    }

    /// Advance to the next entry. For a DUPSORT DBI, steps through the
    /// current key's remaining duplicates before moving to the next key, so
    /// a full scan enumerates every (key, value) pair exactly once.
    pub fn next(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        if self.leaf.is_none() {
            return Ok(None);
        }
        if self.dupsort {
            if let Some(values) = &self.dup_values {
                if self.dup_index + 1 < values.len() {
                    self.dup_index += 1;
                    return self.current();
                }
            }
        }
        let leaf_len = self.leaf.as_ref().unwrap().num_keys();
        if self.index + 1 < leaf_len {
            self.index += 1;
        } else if !self.advance_to_next_leaf()? {
            return Ok(None);
        }
        self.load_dup_state_for_current_key()?;
        self.current()
    }

    /// Step to the previous entry, mirroring [`Cursor::next`].
    pub fn prev(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        if self.leaf.is_none() {
            return Ok(None);
        }
        if self.dupsort && self.dup_index > 0 {
            self.dup_index -= 1;
            return self.current();
        }
        if self.index > 0 {
            self.index -= 1;
        } else if !self.retreat_to_prev_leaf()? {
            return Ok(None);
        }
        self.load_dup_state_for_current_key()?;
        if self.dupsort {
            if let Some(values) = &self.dup_values {
                self.dup_index = values.len().saturating_sub(1);
            }
        }
        self.current()
    }

    /// DUPSORT: position at the current key's first duplicate value.
    pub fn first_dup(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        if !self.dupsort {
            return Err(Error::Other("first_dup on a non-DUPSORT cursor".into()));
        }
        self.dup_index = 0;
        self.current()
    }

    /// DUPSORT: position at the current key's last duplicate value.
    pub fn last_dup(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        if !self.dupsort {
            return Err(Error::Other("last_dup on a non-DUPSORT cursor".into()));
        }
        if let Some(values) = &self.dup_values {
            self.dup_index = values.len().saturating_sub(1);
        }
        self.current()
    }

    /// DUPSORT: advance within the current key's duplicate set only;
    /// returns `None` without moving to the next key once exhausted.
    pub fn next_dup(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        if !self.dupsort {
            return Err(Error::Other("next_dup on a non-DUPSORT cursor".into()));
        }
        match &self.dup_values {
            Some(values) if self.dup_index + 1 < values.len() => {
                self.dup_index += 1;
                self.current()
            }
            _ => Ok(None),
        }
    }

    /// DUPSORT: retreat within the current key's duplicate set only.
    pub fn prev_dup(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        if !self.dupsort {
            return Err(Error::Other("prev_dup on a non-DUPSORT cursor".into()));
        }
        if self.dup_index > 0 {
            self.dup_index -= 1;
            self.current()
        } else {
            Ok(None)
        }
    }

    /// DUPSORT: number of values stored under the current key.
    pub fn count_dup(&self) -> Result<u64> {
        if !self.dupsort {
            return Err(Error::Other("count_dup on a non-DUPSORT cursor".into()));
        }
        Ok(self.dup_values.as_ref().map(|v| v.len() as u64).unwrap_or(0))
    }

    /// Insert or replace at the cursor's logical position (not necessarily
    /// where the cursor currently sits; this re-seeks to `key`). On a
    /// DUPSORT DBI this adds `value` to `key`'s duplicate set instead of
    /// replacing it. Leaves the cursor positioned at the written entry.
    pub fn put(&mut self, key: &[u8], value: &[u8], flags: PutFlags) -> Result<()> {
        if self.dupsort {
            let (new_root, _) =
                dupsort::dup_put(self.io, self.root, key, value, self.key_cmp.as_ref(), self.value_cmp.as_ref())?;
            self.root = new_root;
        } else {
            let (new_root, _) = btree::put(self.io, self.root, key, value, flags, self.key_cmp.as_ref())?;
            self.root = new_root;
        }
        self.seek(key)?;
        Ok(())
    }

    /// Delete the entry the cursor is positioned at (the current duplicate
    /// value on a DUPSORT DBI), leaving the cursor at the successor entry.
    pub fn del(&mut self) -> Result<()> {
        let key = match self.current_key()? {
            Some(k) => k,
            None => return Err(Error::NotFound),
        };

        if self.dupsort {
            let value = match self.current()? {
                Some((_, v)) => v,
                None => return Err(Error::NotFound),
            };
            let (new_root, removed) =
                dupsort::dup_del(self.io, self.root, &key, &value, self.key_cmp.as_ref(), self.value_cmp.as_ref())?;
            self.root = new_root;
            if !removed {
                return Err(Error::NotFound);
            }
        } else {
            let (new_root, _) = btree::del(self.io, self.root, &key, self.key_cmp.as_ref())?;
            self.root = new_root;
        }

        match self.seek(&key)? {
            SeekOutcome::Exact | SeekOutcome::After => {}
            SeekOutcome::NotFound => self.clear_position(),
        }
        Ok(())
    }
}
