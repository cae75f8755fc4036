//! The transaction manager (spec §4.5).
//!
//! A read transaction pins a committed snapshot via the reader table and
//! never mutates anything. A write transaction stages its mutations in a
//! stack of in-memory page/root overlays ("frames"); only the root frame's
//! commit ever touches the page store. Nesting pushes a frame: the child's
//! overlay shadows its parent's until the child commits (merging its frame
//! into the parent's) or aborts (the frame is simply dropped). Grounded on
//! the teacher's meta-page commit sequence (`env.rs`'s `commit`); the
//! teacher's own nested-transaction path is an unimplemented stub, so the
//! frame-stack overlay here is this crate's own design, built the way the
//! `other_examples` overlay/staging sketches (layered changesets merged
//! upward on commit, discarded wholesale on abort) shape the problem.

use crate::btree::{self, PutFlags, PutOutcome, TreeIo};
use crate::cursor::Cursor;
use crate::db::{Database, Dbi, DbiRuntime};
use crate::error::{Error, PageId, Result, TransactionId};
use crate::meta::{dbi_flags, DbiSlot, MetaPage, MAX_DBI};
use crate::page::{Page, PageFlags};
use bitflags::bitflags;
use parking_lot::MutexGuard;
use std::collections::HashMap;
use std::ops::Bound;

/// Marker type for a read-only transaction.
pub struct Read;
/// Marker type for a write transaction.
pub struct Write;

mod sealed {
    pub trait Sealed {}
    impl Sealed for super::Read {}
    impl Sealed for super::Write {}
}

/// Seals [`Read`]/[`Write`] as the only valid transaction modes.
pub trait Mode: sealed::Sealed {}
impl Mode for Read {}
impl Mode for Write {}

bitflags! {
    /// Flags accepted when beginning a transaction (spec §6).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TxnFlags: u8 {
        /// Begin read-only even on a handle that could write.
        const READ_ONLY = 0x01;
    }
}

/// One level of a write transaction's overlay stack: the root page each DBI
/// is seen at from this frame down, plus the pages this frame has made its
/// own private copy of (fresh allocations and first-touch copies alike).
#[derive(Default)]
struct WriteFrame {
    roots: HashMap<u16, PageId>,
    dirty: HashMap<PageId, Page>,
    freed: Vec<PageId>,
    entries_delta: HashMap<u16, i64>,
    touched: Vec<(u16, Vec<u8>)>,
    new_dbis: Vec<(u16, bool)>,
}

enum TxnState<'db> {
    Read {
        _reader: crate::reader::ReaderGuard<'db>,
        snapshot: MetaPage,
    },
    Write {
        _guard: MutexGuard<'db, ()>,
        base: MetaPage,
        frames: Vec<WriteFrame>,
    },
}

/// A transaction against a [`Database`] (spec §3 "Transaction").
pub struct Transaction<'db, M: Mode> {
    db: &'db Database,
    id: TransactionId,
    state: TxnState<'db>,
    dbi_cache: HashMap<u16, DbiRuntime>,
    _mode: std::marker::PhantomData<M>,
}

impl<'db, M: Mode> Transaction<'db, M> {
    fn cached_dbi(&mut self, dbi: Dbi) -> Result<&DbiRuntime> {
        if !self.dbi_cache.contains_key(&dbi.0) {
            let runtime = self.db.dbi_runtime(dbi)?;
            self.dbi_cache.insert(dbi.0, runtime);
        }
        Ok(self.dbi_cache.get(&dbi.0).unwrap())
    }

    fn dbi_slot(&self, dbi: Dbi, meta: &MetaPage) -> Result<DbiSlot> {
        meta.dbis
            .get(dbi.0 as usize)
            .copied()
            .filter(|s| s.in_use())
            .ok_or_else(|| Error::Other(format!("dbi {} is not open", dbi.0)))
    }

    /// This transaction's id (the snapshot it reads, or the write it will
    /// produce).
    pub fn id(&self) -> TransactionId {
        self.id
    }
}

// ---------------------------------------------------------------------------
// Read transactions
// ---------------------------------------------------------------------------

impl<'db> Transaction<'db, Read> {
    pub(crate) fn begin_read(db: &'db Database) -> Result<Self> {
        let (snapshot, _slot) = db.current_meta();
        let reader = db.inner.readers.register(snapshot.txn_id)?;
        db.inner.freelist.lock().set_oldest_reader(db.inner.readers.oldest_reader());
        Ok(Transaction {
            db,
            id: snapshot.txn_id,
            state: TxnState::Read { _reader: reader, snapshot },
            dbi_cache: HashMap::new(),
            _mode: std::marker::PhantomData,
        })
    }

    /// The meta page this transaction's reader pin is snapshotted at. Used
    /// by the checkpoint codec, which needs a consistent view of every DBI
    /// root without itself negotiating reader registration.
    pub(crate) fn snapshot(&self) -> &MetaPage {
        match &self.state {
            TxnState::Read { snapshot, .. } => snapshot,
            TxnState::Write { .. } => unreachable!("read transaction holds write state"),
        }
    }

    /// Look up `key`'s value. For a DUPSORT DBI this returns the first
    /// duplicate value, if any.
    pub fn get(&mut self, dbi: Dbi, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let slot = self.dbi_slot(dbi, self.snapshot())?;
        let rt = self.cached_dbi(dbi)?.clone();
        if slot.is_dupsort() {
            let values = crate::dupsort::dup_values(self, slot.root, key, rt.key_cmp.as_ref(), rt.value_cmp.as_ref())?;
            Ok(values.into_iter().next())
        } else {
            btree::get(self, slot.root, key, rt.key_cmp.as_ref())
        }
    }

    /// Count entries with keys in `[lo, hi)`.
    pub fn count_range(&mut self, dbi: Dbi, lo: Bound<&[u8]>, hi: Bound<&[u8]>) -> Result<u64> {
        let slot = self.dbi_slot(dbi, self.snapshot())?;
        let rt = self.cached_dbi(dbi)?.clone();
        btree::count_range(self, slot.root, lo, hi, rt.key_cmp.as_ref())
    }

    /// Open a read-only cursor over `dbi`.
    pub fn cursor(&mut self, dbi: Dbi) -> Result<Cursor<'_>> {
        let slot = self.dbi_slot(dbi, self.snapshot())?;
        let rt = self.cached_dbi(dbi)?.clone();
        Ok(Cursor::new(self, slot.root, rt.key_cmp, rt.value_cmp, slot.is_dupsort()))
    }
}

impl TreeIo for Transaction<'_, Read> {
    fn txn_id(&self) -> TransactionId {
        self.id
    }
    fn page_size(&self) -> usize {
        self.db.page_size()
    }
    fn read(&self, id: PageId) -> Result<Page> {
        self.db.inner.page_store.read_page(id)
    }
    fn cow(&mut self, _id: PageId) -> Result<Page> {
        Err(Error::ReadOnly)
    }
    fn alloc(&mut self, _flags: PageFlags) -> Result<Page> {
        Err(Error::ReadOnly)
    }
    fn write(&mut self, _page: &Page) -> Result<()> {
        Err(Error::ReadOnly)
    }
    fn free(&mut self, _id: PageId) {}
}

// ---------------------------------------------------------------------------
// Write transactions
// ---------------------------------------------------------------------------

impl<'db> Transaction<'db, Write> {
    pub(crate) fn begin_write(db: &'db Database) -> Result<Self> {
        let guard = db.inner.write_gate.lock();
        let (base, _slot) = db.current_meta();
        let id = TransactionId(base.txn_id.0 + 1);
        Ok(Transaction {
            db,
            id,
            state: TxnState::Write { _guard: guard, base, frames: vec![WriteFrame::default()] },
            dbi_cache: HashMap::new(),
            _mode: std::marker::PhantomData,
        })
    }

    fn frames(&self) -> &[WriteFrame] {
        match &self.state {
            TxnState::Write { frames, .. } => frames,
            TxnState::Read { .. } => unreachable!("write transaction holds read state"),
        }
    }

    fn frames_mut(&mut self) -> &mut Vec<WriteFrame> {
        match &mut self.state {
            TxnState::Write { frames, .. } => frames,
            TxnState::Read { .. } => unreachable!("write transaction holds read state"),
        }
    }

    fn base(&self) -> &MetaPage {
        match &self.state {
            TxnState::Write { base, .. } => base,
            TxnState::Read { .. } => unreachable!("write transaction holds read state"),
        }
    }

    fn current_root(&self, dbi: Dbi) -> PageId {
        for frame in self.frames().iter().rev() {
            if let Some(&root) = frame.roots.get(&dbi.0) {
                return root;
            }
        }
        self.base().dbis.get(dbi.0 as usize).map(|s| s.root).unwrap_or(PageId::NONE)
    }

    fn set_root(&mut self, dbi: Dbi, root: PageId) {
        self.frames_mut().last_mut().unwrap().roots.insert(dbi.0, root);
    }

    fn bump_entries(&mut self, dbi: Dbi, delta: i64) {
        *self.frames_mut().last_mut().unwrap().entries_delta.entry(dbi.0).or_insert(0) += delta;
    }

    fn record_touch(&mut self, dbi: Dbi, key: &[u8]) {
        self.frames_mut().last_mut().unwrap().touched.push((dbi.0, key.to_vec()));
    }

    fn owned_by_ancestor(&self, id: PageId) -> bool {
        let frames = self.frames();
        if frames.len() < 2 {
            return false;
        }
        frames[..frames.len() - 1].iter().any(|f| f.dirty.contains_key(&id))
    }

    fn alloc_fresh_id(&mut self) -> Result<PageId> {
        let drawn = self.db.inner.freelist.lock().alloc_page();
        match drawn {
            Some(id) => Ok(id),
            None => self.db.inner.page_store.allocate(),
        }
    }

    /// Create a DBI if the slot is free, or return it if it already exists
    /// with matching flags. Fails with [`Error::Exists`] on a flag
    /// mismatch against an already-created DBI.
    pub fn create_dbi(&mut self, index: u16, dupsort: bool) -> Result<Dbi> {
        if index as usize >= MAX_DBI {
            return Err(Error::Other(format!("dbi index {index} exceeds MAX_DBI ({MAX_DBI})")));
        }
        let dbi = Dbi(index);
        let existing = self.base().dbis[index as usize];
        if existing.in_use() {
            if existing.is_dupsort() != dupsort {
                return Err(Error::Exists);
            }
            self.db.set_dbi_runtime(
                dbi,
                DbiRuntime { key_cmp: crate::comparator::lexicographic(), value_cmp: crate::comparator::lexicographic() },
            );
            return Ok(dbi);
        }
        self.frames_mut().last_mut().unwrap().new_dbis.push((index, dupsort));
        self.db.set_dbi_runtime(
            dbi,
            DbiRuntime { key_cmp: crate::comparator::lexicographic(), value_cmp: crate::comparator::lexicographic() },
        );
        Ok(dbi)
    }

    /// Look up `key`'s value. For a DUPSORT DBI this returns the first
    /// duplicate value, if any.
    pub fn get(&mut self, dbi: Dbi, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let root = self.current_root(dbi);
        let rt = self.cached_dbi(dbi)?.clone();
        let dupsort = self.dbi_is_dupsort(dbi)?;
        if dupsort {
            let values = crate::dupsort::dup_values(self, root, key, rt.key_cmp.as_ref(), rt.value_cmp.as_ref())?;
            Ok(values.into_iter().next())
        } else {
            btree::get(self, root, key, rt.key_cmp.as_ref())
        }
    }

    fn dbi_is_dupsort(&self, dbi: Dbi) -> Result<bool> {
        for frame in self.frames().iter().rev() {
            if let Some((_, dupsort)) = frame.new_dbis.iter().find(|(i, _)| *i == dbi.0) {
                return Ok(*dupsort);
            }
        }
        Ok(self.base().dbis.get(dbi.0 as usize).map(|s| s.is_dupsort()).unwrap_or(false))
    }

    /// Insert or update `key` -> `value`.
    pub fn put(&mut self, dbi: Dbi, key: &[u8], value: &[u8], flags: PutFlags) -> Result<()> {
        let root = self.current_root(dbi);
        let rt = self.cached_dbi(dbi)?.clone();
        let dupsort = self.dbi_is_dupsort(dbi)?;
        let new_root = if dupsort {
            let (new_root, inserted) =
                crate::dupsort::dup_put(self, root, key, value, rt.key_cmp.as_ref(), rt.value_cmp.as_ref())?;
            if inserted {
                self.bump_entries(dbi, 1);
            }
            new_root
        } else {
            let (new_root, outcome) = btree::put(self, root, key, value, flags, rt.key_cmp.as_ref())?;
            if matches!(outcome, PutOutcome::Inserted) {
                self.bump_entries(dbi, 1);
            }
            new_root
        };
        self.set_root(dbi, new_root);
        self.record_touch(dbi, key);
        Ok(())
    }

    /// Compare-and-swap.
    pub fn put_if(&mut self, dbi: Dbi, key: &[u8], new_value: &[u8], expected: &[u8]) -> Result<()> {
        let root = self.current_root(dbi);
        let rt = self.cached_dbi(dbi)?.clone();
        let (new_root, _) = btree::put_if(self, root, key, new_value, expected, rt.key_cmp.as_ref())?;
        self.set_root(dbi, new_root);
        self.record_touch(dbi, key);
        Ok(())
    }

    /// Read-modify-write via `callback`.
    pub fn merge(
        &mut self,
        dbi: Dbi,
        key: &[u8],
        operand: &[u8],
        callback: &dyn Fn(Option<&[u8]>, &[u8]) -> Result<Vec<u8>>,
    ) -> Result<Vec<u8>> {
        let root = self.current_root(dbi);
        let rt = self.cached_dbi(dbi)?.clone();
        let (new_root, value) = btree::merge(self, root, key, operand, callback, rt.key_cmp.as_ref())?;
        self.set_root(dbi, new_root);
        self.record_touch(dbi, key);
        Ok(value)
    }

    /// Delete `key`, returning its value.
    pub fn del(&mut self, dbi: Dbi, key: &[u8]) -> Result<Vec<u8>> {
        let root = self.current_root(dbi);
        let rt = self.cached_dbi(dbi)?.clone();
        let dupsort = self.dbi_is_dupsort(dbi)?;
        if dupsort {
            let values = crate::dupsort::dup_values(self, root, key, rt.key_cmp.as_ref(), rt.value_cmp.as_ref())?;
            let first = values.into_iter().next().ok_or(Error::NotFound)?;
            let (new_root, removed) =
                crate::dupsort::dup_del(self, root, key, &first, rt.key_cmp.as_ref(), rt.value_cmp.as_ref())?;
            if removed {
                self.bump_entries(dbi, -1);
            }
            self.set_root(dbi, new_root);
            self.record_touch(dbi, key);
            Ok(first)
        } else {
            let (new_root, value) = btree::del(self, root, key, rt.key_cmp.as_ref())?;
            self.bump_entries(dbi, -1);
            self.set_root(dbi, new_root);
            self.record_touch(dbi, key);
            Ok(value)
        }
    }

    /// Count entries with keys in `[lo, hi)`.
    pub fn count_range(&mut self, dbi: Dbi, lo: Bound<&[u8]>, hi: Bound<&[u8]>) -> Result<u64> {
        let root = self.current_root(dbi);
        let rt = self.cached_dbi(dbi)?.clone();
        btree::count_range(self, root, lo, hi, rt.key_cmp.as_ref())
    }

    /// Delete every entry with a key in `[lo, hi)`.
    pub fn del_range(&mut self, dbi: Dbi, lo: Bound<&[u8]>, hi: Bound<&[u8]>) -> Result<u64> {
        let root = self.current_root(dbi);
        let rt = self.cached_dbi(dbi)?.clone();
        let (new_root, count) = btree::del_range(self, root, lo, hi, rt.key_cmp.as_ref())?;
        self.bump_entries(dbi, -(count as i64));
        self.set_root(dbi, new_root);
        Ok(count)
    }

    /// Bulk-load pre-sorted entries.
    pub fn load_sorted(&mut self, dbi: Dbi, entries: &[(Vec<u8>, Vec<u8>)]) -> Result<()> {
        let root = self.current_root(dbi);
        let rt = self.cached_dbi(dbi)?.clone();
        let new_root = btree::load_sorted(self, root, entries, rt.key_cmp.as_ref())?;
        self.bump_entries(dbi, entries.len() as i64);
        self.set_root(dbi, new_root);
        Ok(())
    }

    /// Open a cursor over `dbi` for this transaction.
    pub fn cursor(&mut self, dbi: Dbi) -> Result<Cursor<'_>> {
        let root = self.current_root(dbi);
        let rt = self.cached_dbi(dbi)?.clone();
        let dupsort = self.dbi_is_dupsort(dbi)?;
        Ok(Cursor::new(self, root, rt.key_cmp, rt.value_cmp, dupsort))
    }

    /// Push a nested frame. Writes made after this call are isolated until
    /// [`Transaction::commit_nested`] or [`Transaction::abort_nested`].
    pub fn begin_nested(&mut self) -> Result<()> {
        self.frames_mut().push(WriteFrame::default());
        Ok(())
    }

    /// Merge the top frame into its parent (spec §4.5 "commit (nested)").
    /// Fails with [`Error::Busy`] if there is no nested frame to commit.
    pub fn commit_nested(&mut self) -> Result<()> {
        let frames = self.frames_mut();
        if frames.len() < 2 {
            return Err(Error::Busy("no nested transaction to commit"));
        }
        let child = frames.pop().unwrap();
        let parent = frames.last_mut().unwrap();
        for (dbi, root) in child.roots {
            parent.roots.insert(dbi, root);
        }
        for (id, page) in child.dirty {
            parent.dirty.insert(id, page);
        }
        parent.freed.extend(child.freed);
        for (dbi, delta) in child.entries_delta {
            *parent.entries_delta.entry(dbi).or_insert(0) += delta;
        }
        parent.touched.extend(child.touched);
        parent.new_dbis.extend(child.new_dbis);
        Ok(())
    }

    /// Discard the top frame, undoing every write it made (spec §4.5
    /// "abort (nested)"). Fails with [`Error::Busy`] if there is no nested
    /// frame to abort.
    pub fn abort_nested(&mut self) -> Result<()> {
        let frames = self.frames_mut();
        if frames.len() < 2 {
            return Err(Error::Busy("no nested transaction to abort"));
        }
        let discarded = frames.pop().unwrap();
        for (index, _) in discarded.new_dbis {
            self.db.clear_dbi_runtime(Dbi(index));
        }
        Ok(())
    }

    /// Commit this transaction: flush all staged pages, publish a new meta
    /// page, stage freed pages for deferred reclamation, and fire any
    /// matching watchers. Must be called on the root (non-nested) frame.
    pub fn commit(mut self) -> Result<TransactionId> {
        if self.frames().len() != 1 {
            return Err(Error::Busy("commit called with a nested transaction still open"));
        }
        let id = self.id;
        let mut new_meta = *self.base();
        new_meta.txn_id = id;

        for (index, dupsort) in self.frames().last().unwrap().new_dbis.clone() {
            let slot = &mut new_meta.dbis[index as usize];
            slot.flags = dbi_flags::IN_USE | if dupsort { dbi_flags::DUPSORT } else { 0 };
            slot.root = PageId::NONE;
            slot.entries = 0;
        }

        // Stage this transaction's freed pages and fold them into the
        // free-list DBI before the top frame is flushed, so the rebuilt
        // free-list tree's own pages land in the same write batch.
        let freed_this_txn: Vec<PageId> = self.frames().last().unwrap().freed.clone();
        let freelist_entries = {
            let mut freelist = self.db.inner.freelist.lock();
            freelist.free_pages(freed_this_txn);
            freelist.set_oldest_reader(self.db.inner.readers.oldest_reader());
            freelist.commit_pending(id);
            freelist.encode_entries()
        };
        let lexicographic = crate::comparator::lexicographic();
        let freelist_root =
            btree::load_sorted(&mut self, PageId::NONE, &freelist_entries, lexicographic.as_ref())?;
        new_meta.freelist_root = freelist_root;

        let frame = self.frames_mut().pop().unwrap();
        for page in frame.dirty.values() {
            self.db.inner.page_store.write_page(page)?;
        }
        for (dbi, root) in &frame.roots {
            new_meta.dbis[*dbi as usize].root = *root;
        }
        for (dbi, delta) in &frame.entries_delta {
            let slot = &mut new_meta.dbis[*dbi as usize];
            slot.entries = (slot.entries as i64 + delta).max(0) as u64;
        }

        let (_, current_slot) = self.db.current_meta();
        let publish_slot = crate::meta::other_slot(current_slot);
        let page = new_meta.to_page(publish_slot, self.db.page_size());
        let stamped = self.maybe_checksum(page, true);
        self.db.inner.page_store.write_page(&stamped)?;
        self.db.inner.page_store.sync(crate::page_store::DurabilityMode::SyncData)?;

        *self.db.inner.meta.write() = (new_meta, publish_slot);

        self.fire_watchers(&frame.touched, &new_meta)?;

        Ok(id)
    }

    fn maybe_checksum(&self, mut page: Page, is_meta: bool) -> Page {
        if self.db.checksum_mode().applies_to(is_meta) {
            crate::checksum::stamp(&mut page);
        }
        page
    }

    /// Fire every registered watcher whose prefix matches a key this
    /// transaction touched, but only once per distinct key and only when
    /// the committed value actually differs from the value the key held in
    /// the snapshot this transaction began on (spec §4.4 "Watchers"): a
    /// `put` of an unchanged value, or a put-then-revert within the same
    /// transaction, must not fire.
    fn fire_watchers(&mut self, touched: &[(u16, Vec<u8>)], new_meta: &MetaPage) -> Result<()> {
        if touched.is_empty() {
            return Ok(());
        }
        let watchers = self.db.inner.watchers.lock();
        if watchers.is_empty() {
            return Ok(());
        }
        let base = *self.base();
        let mut seen: std::collections::HashSet<(u16, &Vec<u8>)> = std::collections::HashSet::new();
        let mut distinct: Vec<(u16, &Vec<u8>)> = Vec::new();
        for (dbi_idx, key) in touched {
            if seen.insert((*dbi_idx, key)) {
                distinct.push((*dbi_idx, key));
            }
        }
        for (dbi_idx, key) in distinct {
            let dbi = Dbi(dbi_idx);
            if !watchers.iter().any(|w| w.dbi.0 == dbi_idx && key.starts_with(&w.prefix)) {
                continue;
            }
            let rt = self.db.dbi_runtime(dbi)?;
            let before_root = base.dbis.get(dbi_idx as usize).map(|s| s.root).unwrap_or(PageId::NONE);
            let before = btree::get(self, before_root, key, rt.key_cmp.as_ref())?;
            let after_root = new_meta.dbis[dbi_idx as usize].root;
            let after = btree::get(self, after_root, key, rt.key_cmp.as_ref())?;
            if before == after {
                continue;
            }
            for watcher in watchers.iter() {
                if watcher.dbi.0 != dbi_idx || !key.starts_with(&watcher.prefix) {
                    continue;
                }
                (watcher.callback)(key, after.as_deref().unwrap_or(&[]), &watcher.ctx);
            }
        }
        Ok(())
    }

    /// Abort this transaction: discard every staged write and return its
    /// pages directly to the reusable pool.
    pub fn abort(mut self) {
        let frame = self.frames_mut().pop().unwrap();
        self.db.inner.freelist.lock().abort_pending();
        for (index, _) in &frame.new_dbis {
            self.db.clear_dbi_runtime(Dbi(*index));
        }
        drop(frame);
    }
}

impl TreeIo for Transaction<'_, Write> {
    fn txn_id(&self) -> TransactionId {
        self.id
    }
    fn page_size(&self) -> usize {
        self.db.page_size()
    }
    fn read(&self, id: PageId) -> Result<Page> {
        for frame in self.frames().iter().rev() {
            if let Some(p) = frame.dirty.get(&id) {
                return Ok(p.clone());
            }
        }
        self.db.inner.page_store.read_page(id)
    }
    fn cow(&mut self, id: PageId) -> Result<Page> {
        let current = TreeIo::read(self, id)?;
        let owned = self.owned_by_ancestor(id);
        {
            let frames = self.frames_mut();
            let top = frames.last_mut().unwrap();
            if let Some(p) = top.dirty.get(&id) {
                return Ok(p.clone());
            }
        }
        if owned {
            let mut copy = current;
            copy.set_txn_id(self.id);
            self.frames_mut().last_mut().unwrap().dirty.insert(id, copy.clone());
            return Ok(copy);
        }
        let new_id = self.alloc_fresh_id()?;
        let mut copy = current;
        copy.set_pgno(new_id);
        copy.set_txn_id(self.id);
        let frames = self.frames_mut();
        let top = frames.last_mut().unwrap();
        top.freed.push(id);
        top.dirty.insert(new_id, copy.clone());
        Ok(copy)
    }
    fn alloc(&mut self, flags: PageFlags) -> Result<Page> {
        let new_id = self.alloc_fresh_id()?;
        let page = Page::new(self.db.page_size(), new_id, flags, self.id);
        self.frames_mut().last_mut().unwrap().dirty.insert(new_id, page.clone());
        Ok(page)
    }
    fn write(&mut self, page: &Page) -> Result<()> {
        self.frames_mut().last_mut().unwrap().dirty.insert(page.pgno(), page.clone());
        Ok(())
    }
    fn free(&mut self, id: PageId) {
        self.frames_mut().last_mut().unwrap().freed.push(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::DbBuilder;

    #[test]
    fn put_get_del_roundtrip() {
        let db = DbBuilder::new().build().unwrap();
        let mut txn = db.begin_write().unwrap();
        let dbi = txn.create_dbi(0, false).unwrap();
        txn.put(dbi, b"k", b"v1", PutFlags::empty()).unwrap();
        assert_eq!(txn.get(dbi, b"k").unwrap(), Some(b"v1".to_vec()));
        txn.commit().unwrap();

        let mut read = db.begin_read().unwrap();
        assert_eq!(read.get(dbi, b"k").unwrap(), Some(b"v1".to_vec()));

        let mut txn2 = db.begin_write().unwrap();
        let removed = txn2.del(dbi, b"k").unwrap();
        assert_eq!(removed, b"v1");
        txn2.commit().unwrap();

        let mut read2 = db.begin_read().unwrap();
        assert_eq!(read2.get(dbi, b"k").unwrap(), None);
    }

    #[test]
    fn reader_sees_old_snapshot_during_concurrent_write() {
        let db = DbBuilder::new().build().unwrap();
        let mut setup = db.begin_write().unwrap();
        let dbi = setup.create_dbi(0, false).unwrap();
        setup.put(dbi, b"k", b"v1", PutFlags::empty()).unwrap();
        setup.commit().unwrap();

        let mut reader = db.begin_read().unwrap();
        let mut writer = db.begin_write().unwrap();
        writer.put(dbi, b"k", b"v2", PutFlags::empty()).unwrap();
        writer.commit().unwrap();

        assert_eq!(reader.get(dbi, b"k").unwrap(), Some(b"v1".to_vec()));
        let mut fresh_reader = db.begin_read().unwrap();
        assert_eq!(fresh_reader.get(dbi, b"k").unwrap(), Some(b"v2".to_vec()));
    }

    #[test]
    fn nested_commit_is_visible_to_parent() {
        let db = DbBuilder::new().build().unwrap();
        let mut txn = db.begin_write().unwrap();
        let dbi = txn.create_dbi(0, false).unwrap();
        txn.put(dbi, b"a", b"1", PutFlags::empty()).unwrap();

        txn.begin_nested().unwrap();
        txn.put(dbi, b"b", b"2", PutFlags::empty()).unwrap();
        txn.commit_nested().unwrap();

        assert_eq!(txn.get(dbi, b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(txn.get(dbi, b"b").unwrap(), Some(b"2".to_vec()));
        txn.commit().unwrap();

        let mut read = db.begin_read().unwrap();
        assert_eq!(read.get(dbi, b"b").unwrap(), Some(b"2".to_vec()));
    }

    #[test]
    fn nested_abort_leaves_parent_untouched() {
        let db = DbBuilder::new().build().unwrap();
        let mut txn = db.begin_write().unwrap();
        let dbi = txn.create_dbi(0, false).unwrap();
        txn.put(dbi, b"a", b"1", PutFlags::empty()).unwrap();

        txn.begin_nested().unwrap();
        txn.put(dbi, b"a", b"2", PutFlags::empty()).unwrap();
        txn.put(dbi, b"c", b"3", PutFlags::empty()).unwrap();
        txn.abort_nested().unwrap();

        assert_eq!(txn.get(dbi, b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(txn.get(dbi, b"c").unwrap(), None);
        txn.commit().unwrap();
    }

    #[test]
    fn abort_discards_writes() {
        let db = DbBuilder::new().build().unwrap();
        let mut setup = db.begin_write().unwrap();
        let dbi = setup.create_dbi(0, false).unwrap();
        setup.commit().unwrap();

        let mut txn = db.begin_write().unwrap();
        txn.put(dbi, b"k", b"v", PutFlags::empty()).unwrap();
        txn.abort();

        let mut read = db.begin_read().unwrap();
        assert_eq!(read.get(dbi, b"k").unwrap(), None);
    }

    #[test]
    fn watcher_fires_on_matching_prefix_commit() {
        use crate::db::WatcherCtx;
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::Arc;

        let db = DbBuilder::new().build().unwrap();
        let mut setup = db.begin_write().unwrap();
        let dbi = setup.create_dbi(0, false).unwrap();
        setup.commit().unwrap();

        let fired = Arc::new(AtomicBool::new(false));
        let ctx = WatcherCtx(fired.clone());
        db.watch(dbi, b"pre/".to_vec(), ctx, |_key, _value, ctx| {
            let flag = ctx.0.downcast_ref::<AtomicBool>().unwrap();
            flag.store(true, Ordering::SeqCst);
        })
        .unwrap();

        let mut txn = db.begin_write().unwrap();
        txn.put(dbi, b"pre/x", b"v", PutFlags::empty()).unwrap();
        txn.commit().unwrap();

        assert!(fired.load(Ordering::SeqCst));
    }
}
