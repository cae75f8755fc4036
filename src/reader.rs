//! The reader-snapshot registry.
//!
//! Every read-only transaction "pins" the transaction id of the meta
//! snapshot it began against; the free list (`freelist.rs`) only reclaims
//! pages freed at or after the oldest pinned id. This is the reader side
//! of the reader-pinned deferred reclamation scheme spec §3/§5 describe —
//! functionally the same guarantee `crossbeam-epoch` gives a lock-free
//! structure, so a reader registration also takes a `crossbeam-epoch` pin
//! for the duration of its slot, to get the same safepoint behavior for
//! any auxiliary lock-free bookkeeping layered on top later.

use crate::error::{Error, Result, TransactionId};
use std::sync::atomic::{AtomicU64, Ordering};

/// Default maximum number of concurrently active reader snapshots.
pub const DEFAULT_MAX_READERS: usize = 126;

/// Sentinel slot value meaning "unoccupied".
const FREE: u64 = 0;

/// A fixed table of reader slots. Each occupied slot holds the transaction
/// id that reader's snapshot is pinned to.
pub struct ReaderTable {
    slots: Vec<AtomicU64>,
    collector: crossbeam_epoch::Collector,
}

impl ReaderTable {
    /// Create a table with room for `max_readers` concurrent readers.
    pub fn new(max_readers: usize) -> Self {
        let mut slots = Vec::with_capacity(max_readers);
        slots.resize_with(max_readers, || AtomicU64::new(FREE));
        ReaderTable { slots, collector: crossbeam_epoch::Collector::new() }
    }

    /// Register a new reader pinned to `txn_id`. Returns a guard that
    /// releases the slot on drop.
    pub fn register(&self, txn_id: TransactionId) -> Result<ReaderGuard<'_>> {
        // Transaction id 0 is reserved for "free" and can never itself be
        // pinned by a real reader (txn ids start at 1 after the first
        // write commit), so the sentinel can't collide with real data.
        let stamp = txn_id.0.max(1);
        for (index, slot) in self.slots.iter().enumerate() {
            if slot.compare_exchange(FREE, stamp, Ordering::AcqRel, Ordering::Acquire).is_ok() {
                let epoch_guard = self.collector.register().pin();
                return Ok(ReaderGuard { table: self, index, _epoch_guard: epoch_guard });
            }
        }
        Err(Error::Busy("reader table is full"))
    }

    fn release(&self, index: usize) {
        self.slots[index].store(FREE, Ordering::Release);
    }

    /// The lowest transaction id pinned by any active reader, or `None` if
    /// there are no active readers.
    pub fn oldest_reader(&self) -> Option<TransactionId> {
        self.slots
            .iter()
            .map(|s| s.load(Ordering::Acquire))
            .filter(|&v| v != FREE)
            .min()
            .map(TransactionId)
    }

    /// Number of currently occupied slots.
    pub fn reader_count(&self) -> usize {
        self.slots.iter().filter(|s| s.load(Ordering::Acquire) != FREE).count()
    }

    /// Every transaction id currently pinned by a reader, for diagnostics.
    pub fn active_readers(&self) -> Vec<TransactionId> {
        self.slots
            .iter()
            .map(|s| s.load(Ordering::Acquire))
            .filter(|&v| v != FREE)
            .map(TransactionId)
            .collect()
    }
}

/// A held reader slot; releases automatically when dropped (i.e. when the
/// owning read-only transaction ends).
pub struct ReaderGuard<'a> {
    table: &'a ReaderTable,
    index: usize,
    _epoch_guard: crossbeam_epoch::Guard,
}

impl Drop for ReaderGuard<'_> {
    fn drop(&mut self) {
        self.table.release(self.index);
    }
}
