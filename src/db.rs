//! The top-level database handle: page store wiring, DBI registry,
//! the writer gate, the reader-snapshot registry, and watcher
//! registration (spec §4.5, §6).
//!
//! Grounded on the teacher's `env.rs`/`db.rs` split, collapsed into one
//! module since this crate keeps the environment and the DBI registry in a
//! single `Database` handle rather than a separate `Environment` + per-DBI
//! typed wrapper.

use crate::checksum::{self, ChecksumMode};
use crate::comparator::{self, ComparatorHandle};
use crate::error::{Error, PageId, Result, TransactionId};
use crate::freelist::FreeList;
use crate::meta::{self, dbi_flags, DbiSlot, MetaPage, MAX_DBI};
use crate::page_store::{DurabilityMode, GrowableTablePageStore, PageStore};
use crate::reader::ReaderTable;
use bitflags::bitflags;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;

bitflags! {
    /// Flags accepted when opening/creating a DBI (spec §3, §4.9).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DbiFlags: u8 {
        /// Allow multiple sorted values per key.
        const DUPSORT = dbi_flags::DUPSORT;
        /// Entries carry a TTL and may be lazily expired.
        const TTL = dbi_flags::TTL;
    }
}

/// An integer-indexed logical key/value space inside a [`Database`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Dbi(pub u16);

impl Dbi {
    /// DBI 0, always present.
    pub const DEFAULT: Dbi = Dbi(0);
}

/// A registered key-prefix watcher (spec §4.4 "Watchers").
pub(crate) struct Watcher {
    pub dbi: Dbi,
    pub prefix: Vec<u8>,
    pub callback: Box<dyn Fn(&[u8], &[u8], &WatcherCtx) + Send + Sync>,
    pub ctx: WatcherCtx,
}

/// Opaque context handle threaded through to a watcher callback, the
/// capability-record pattern from spec §9.
#[derive(Clone)]
pub struct WatcherCtx(pub Arc<dyn std::any::Any + Send + Sync>);

/// Per-DBI runtime configuration captured at open/create time.
#[derive(Clone)]
pub(crate) struct DbiRuntime {
    pub key_cmp: ComparatorHandle,
    pub value_cmp: ComparatorHandle,
}

/// Internal mutable state guarded by the single writer gate plus a couple
/// of independently-locked pieces (meta, reader table) that readers also
/// touch.
pub(crate) struct DatabaseInner {
    pub page_store: Box<dyn PageStore>,
    pub meta: RwLock<(MetaPage, PageId)>,
    pub freelist: Mutex<FreeList>,
    pub readers: ReaderTable,
    pub write_gate: Mutex<()>,
    pub checksum_mode: ChecksumMode,
    pub dbi_runtime: RwLock<[Option<DbiRuntime>; MAX_DBI]>,
    pub watchers: Mutex<Vec<Watcher>>,
}

/// The top-level storage handle (spec §3 "DB").
pub struct Database {
    pub(crate) inner: DatabaseInner,
}

/// Builder for [`Database`] (spec §2.3 "Configuration").
pub struct DbBuilder {
    page_size: usize,
    max_readers: usize,
    checksum_mode: ChecksumMode,
}

impl Default for DbBuilder {
    fn default() -> Self {
        DbBuilder { page_size: 4096, max_readers: crate::reader::DEFAULT_MAX_READERS, checksum_mode: ChecksumMode::None }
    }
}

impl DbBuilder {
    /// A builder with sapling's defaults (4096-byte pages, 126 readers, no
    /// page checksums).
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the page size. Must be in `[256, 65535]` (spec §3).
    pub fn page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    /// Set the maximum number of concurrent reader snapshots.
    pub fn max_readers(mut self, max_readers: usize) -> Self {
        self.max_readers = max_readers;
        self
    }

    /// Set the page checksum policy.
    pub fn checksum_mode(mut self, mode: ChecksumMode) -> Self {
        self.checksum_mode = mode;
        self
    }

    fn validate(&self) -> Result<()> {
        if !(crate::page::MIN_PAGE_SIZE..=crate::page::MAX_PAGE_SIZE).contains(&self.page_size) {
            return Err(Error::Other(format!(
                "page size {} out of range [{}, {}]",
                self.page_size,
                crate::page::MIN_PAGE_SIZE,
                crate::page::MAX_PAGE_SIZE
            )));
        }
        Ok(())
    }

    /// Create a fresh in-memory database (backed by
    /// [`GrowableTablePageStore`]).
    pub fn build(self) -> Result<Database> {
        self.validate()?;
        let store = GrowableTablePageStore::new(self.page_size);
        self.build_with_store(Box::new(store))
    }

    /// Create a fresh database over a caller-supplied page store.
    pub fn build_with_store(self, mut store: Box<dyn PageStore>) -> Result<Database> {
        self.validate()?;
        if store.num_pages() == 0 {
            store.allocate()?; // slot 0: meta page 1
            store.allocate()?; // slot 1: meta page 2
        }
        let fresh = MetaPage::fresh(self.page_size as u16);
        let page1 = fresh.to_page(meta::META_PAGE_1, self.page_size);
        let page2 = fresh.to_page(meta::META_PAGE_2, self.page_size);
        store.write_page(&stamped(page1, self.checksum_mode, true))?;
        store.write_page(&stamped(page2, self.checksum_mode, true))?;

        Ok(Database {
            inner: DatabaseInner {
                page_store: store,
                meta: RwLock::new((fresh, meta::META_PAGE_1)),
                freelist: Mutex::new(FreeList::new()),
                readers: ReaderTable::new(self.max_readers),
                write_gate: Mutex::new(()),
                checksum_mode: self.checksum_mode,
                dbi_runtime: RwLock::new(std::array::from_fn(|_| None)),
                watchers: Mutex::new(Vec::new()),
            },
        })
    }

    /// Open an existing database from a caller-supplied page store,
    /// choosing the current meta page and rebuilding the free list.
    pub fn open_with_store(self, store: Box<dyn PageStore>) -> Result<Database> {
        let page_size = store.page_size() as u16;
        let m1 = store.read_page(meta::META_PAGE_1).and_then(|p| {
            if self.checksum_mode.applies_to(true) {
                checksum::verify(&p)?;
            }
            MetaPage::from_page(&p, page_size)
        });
        let m2 = store.read_page(meta::META_PAGE_2).and_then(|p| {
            if self.checksum_mode.applies_to(true) {
                checksum::verify(&p)?;
            }
            MetaPage::from_page(&p, page_size)
        });
        let (current, slot) = meta::choose_current(m1, m2)?;

        let freelist_root = current.freelist_root;
        let store_ref: &dyn PageStore = store.as_ref();
        let freelist = FreeList::load(freelist_root, &|id| store_ref.read_page(id))?;

        let mut dbi_runtime: [Option<DbiRuntime>; MAX_DBI] = std::array::from_fn(|_| None);
        for (i, slot_info) in current.dbis.iter().enumerate() {
            if slot_info.in_use() {
                dbi_runtime[i] =
                    Some(DbiRuntime { key_cmp: comparator::lexicographic(), value_cmp: comparator::lexicographic() });
            }
        }

        Ok(Database {
            inner: DatabaseInner {
                page_store: store,
                meta: RwLock::new((current, slot)),
                freelist: Mutex::new(freelist),
                readers: ReaderTable::new(self.max_readers),
                write_gate: Mutex::new(()),
                checksum_mode: self.checksum_mode,
                dbi_runtime: RwLock::new(dbi_runtime),
                watchers: Mutex::new(Vec::new()),
            },
        })
    }
}

fn stamped(mut page: crate::page::Page, mode: ChecksumMode, is_meta: bool) -> crate::page::Page {
    if mode.applies_to(is_meta) {
        checksum::stamp(&mut page);
    }
    page
}

impl Database {
    /// Begin a read-only transaction pinned to the current committed
    /// snapshot.
    pub fn begin_read(&self) -> Result<crate::txn::Transaction<'_, crate::txn::Read>> {
        crate::txn::Transaction::begin_read(self)
    }

    /// Begin a top-level write transaction. Blocks (via the writer mutex)
    /// until any other write transaction completes.
    pub fn begin_write(&self) -> Result<crate::txn::Transaction<'_, crate::txn::Write>> {
        crate::txn::Transaction::begin_write(self)
    }

    /// This database's configured page size.
    pub fn page_size(&self) -> usize {
        self.inner.page_store.page_size()
    }

    /// The page checksum policy in effect.
    pub fn checksum_mode(&self) -> ChecksumMode {
        self.inner.checksum_mode
    }

    /// Structural health of the free list, for long-running test assertions
    /// (spec §4.3, §8).
    pub fn freelist_health(&self) -> crate::freelist::FreelistHealth {
        self.inner.freelist.lock().health()
    }

    /// Number of pages immediately available for reuse.
    pub fn freelist_reusable_len(&self) -> usize {
        self.inner.freelist.lock().len()
    }

    /// Number of distinct transactions still holding pages deferred behind
    /// a reader pin (spec §8: "collapses to at most one").
    pub fn freelist_deferred_txn_count(&self) -> usize {
        self.inner.freelist.lock().deferred_txn_count()
    }

    /// Number of currently active reader snapshots.
    pub fn reader_count(&self) -> usize {
        self.inner.readers.reader_count()
    }

    /// Flush the backing page store according to `mode`.
    pub fn sync(&self, mode: DurabilityMode) -> Result<()> {
        self.inner.page_store.sync(mode)
    }

    /// Register a watcher: `callback` fires at commit time for every key
    /// under `dbi` that both changed and starts with `prefix`. Duplicate
    /// registrations (same dbi + prefix) fail with `Exists`.
    pub fn watch(
        &self,
        dbi: Dbi,
        prefix: impl Into<Vec<u8>>,
        ctx: WatcherCtx,
        callback: impl Fn(&[u8], &[u8], &WatcherCtx) + Send + Sync + 'static,
    ) -> Result<()> {
        let prefix = prefix.into();
        let mut watchers = self.inner.watchers.lock();
        if watchers.iter().any(|w| w.dbi == dbi && w.prefix == prefix) {
            return Err(Error::Exists);
        }
        watchers.push(Watcher { dbi, prefix, callback: Box::new(callback), ctx });
        Ok(())
    }

    pub(crate) fn dbi_runtime(&self, dbi: Dbi) -> Result<DbiRuntime> {
        self.inner
            .dbi_runtime
            .read()
            .get(dbi.0 as usize)
            .and_then(|o| o.clone())
            .ok_or_else(|| Error::Other(format!("dbi {} is not open", dbi.0)))
    }

    pub(crate) fn set_dbi_runtime(&self, dbi: Dbi, runtime: DbiRuntime) {
        if let Some(slot) = self.inner.dbi_runtime.write().get_mut(dbi.0 as usize) {
            *slot = Some(runtime);
        }
    }

    pub(crate) fn clear_dbi_runtime(&self, dbi: Dbi) {
        if let Some(slot) = self.inner.dbi_runtime.write().get_mut(dbi.0 as usize) {
            *slot = None;
        }
    }

    pub(crate) fn current_meta(&self) -> (MetaPage, PageId) {
        *self.inner.meta.read()
    }
}

/// A DBI's root page id and slot metadata, as the caller would want to
/// inspect it (e.g. for the checkpoint codec).
#[derive(Debug, Clone, Copy)]
pub struct DbiInfo {
    /// This DBI's current root page, or [`PageId::NONE`] if empty.
    pub root: PageId,
    /// Live entry count.
    pub entries: u64,
    /// Raw flag byte.
    pub slot: DbiSlot,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_creates_dual_meta_pages() {
        let db = DbBuilder::new().page_size(4096).build().unwrap();
        let (meta, slot) = db.current_meta();
        assert_eq!(meta.txn_id, TransactionId(0));
        assert_eq!(slot, meta::META_PAGE_1);
    }

    #[test]
    fn rejects_invalid_page_size() {
        let err = DbBuilder::new().page_size(64).build().unwrap_err();
        assert!(matches!(err, Error::Other(_)));
    }

    #[test]
    fn watch_rejects_duplicate_registration() {
        let db = DbBuilder::new().build().unwrap();
        let ctx = WatcherCtx(Arc::new(()));
        db.watch(Dbi::DEFAULT, b"a".to_vec(), ctx.clone(), |_, _, _| {}).unwrap();
        let err = db.watch(Dbi::DEFAULT, b"a".to_vec(), ctx, |_, _, _| {}).unwrap_err();
        assert!(matches!(err, Error::Exists));
    }
}
