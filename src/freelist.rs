//! Free page tracking: an in-memory mirror of the on-disk free-list DBI,
//! with reader-pinned deferred reclamation (spec §4.3).
//!
//! Pages a write transaction frees are held in `pending` until commit, at
//! which point they're filed under that transaction's id in `by_txn`.
//! They only become reusable once no reader snapshot can still observe a
//! transaction id at or below the one that freed them.

use crate::error::{PageId, Result, TransactionId};
use crate::page::{Page, PageFlags};
use byteorder::{BigEndian, ByteOrder, LittleEndian};
use std::collections::{BTreeMap, BTreeSet};

/// Structural-corruption counters exposed for long-running test assertions
/// (spec §4.3: these are counted, never fatal).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FreelistHealth {
    /// A walked free-list node claimed a next-pointer outside the page range.
    pub out_of_range: u64,
    /// The free-list head was unexpectedly null while pages were expected.
    pub null_head: u64,
    /// Any other inconsistency noticed while walking.
    pub walk_errors: u64,
}

impl FreelistHealth {
    /// Whether every counter is still zero.
    pub fn is_clean(&self) -> bool {
        *self == FreelistHealth::default()
    }
}

/// The free-list manager: pages available for reuse, pages pending
/// reclamation, and pages reclaimed but still possibly visible to readers.
#[derive(Debug, Default)]
pub struct FreeList {
    reusable: BTreeSet<PageId>,
    pending: BTreeSet<PageId>,
    by_txn: BTreeMap<TransactionId, Vec<PageId>>,
    oldest_reader: Option<TransactionId>,
    health: FreelistHealth,
}

impl FreeList {
    /// An empty free list, as for a freshly created database.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a free list by walking the free-list DBI's B+tree starting
    /// at `root`. `read_page` resolves a page id the same way the active
    /// transaction's snapshot would. This is a plain page walk, not a
    /// `btree` cursor, to keep this module free of a dependency on the
    /// tree layer.
    pub fn load(root: PageId, read_page: &dyn Fn(PageId) -> Result<Page>) -> Result<Self> {
        let mut freelist = FreeList::new();
        if root.is_none() {
            return Ok(freelist);
        }

        let mut stack = vec![root];
        while let Some(pgno) = stack.pop() {
            let page = match read_page(pgno) {
                Ok(p) => p,
                Err(_) => {
                    freelist.health.walk_errors += 1;
                    continue;
                }
            };
            if page.flags().contains(PageFlags::LEAF) {
                for i in 0..page.num_keys() {
                    let node = match page.node(i) {
                        Ok(n) => n,
                        Err(_) => {
                            freelist.health.walk_errors += 1;
                            continue;
                        }
                    };
                    if node.key.len() != 8 {
                        freelist.health.walk_errors += 1;
                        continue;
                    }
                    let txn_id = TransactionId(BigEndian::read_u64(node.key));
                    let mut pages = Vec::with_capacity(node.value.len() / 4);
                    for chunk in node.value.chunks(4) {
                        if chunk.len() == 4 {
                            pages.push(PageId(LittleEndian::read_u32(chunk)));
                        } else {
                            freelist.health.walk_errors += 1;
                        }
                    }
                    freelist.by_txn.insert(txn_id, pages);
                }
            } else if page.flags().contains(PageFlags::BRANCH) {
                if page.num_keys() == 0 {
                    freelist.health.null_head += 1;
                    continue;
                }
                for i in 0..page.num_keys() {
                    match page.node(i) {
                        Ok(node) => stack.push(node.child_page()),
                        Err(_) => freelist.health.out_of_range += 1,
                    }
                }
            } else {
                freelist.health.walk_errors += 1;
            }
        }
        Ok(freelist)
    }

    /// Record the oldest transaction id still pinned by any live reader
    /// snapshot. `None` means no readers are active.
    pub fn set_oldest_reader(&mut self, oldest: Option<TransactionId>) {
        self.oldest_reader = oldest;
    }

    /// Stage a page for reclamation once the active write transaction
    /// commits.
    pub fn free_page(&mut self, page_id: PageId) {
        self.pending.insert(page_id);
    }

    /// Stage several pages at once.
    pub fn free_pages(&mut self, ids: impl IntoIterator<Item = PageId>) {
        self.pending.extend(ids);
    }

    /// Take a page from the reusable pool, if any is available. Callers
    /// fall back to [`crate::page_store::PageStore::allocate`] on `None`.
    pub fn alloc_page(&mut self) -> Option<PageId> {
        let id = *self.reusable.iter().next()?;
        self.reusable.remove(&id);
        Some(id)
    }

    /// File this transaction's pending pages under its id, then sweep
    /// every transaction whose pages are no longer reachable by any
    /// reader into the reusable pool.
    pub fn commit_pending(&mut self, txn_id: TransactionId) {
        if !self.pending.is_empty() {
            let pages: Vec<PageId> = self.pending.iter().copied().collect();
            self.by_txn.insert(txn_id, pages);
            self.pending.clear();
        }
        self.sweep();
    }

    /// Drop this transaction's pending pages without filing them (used on
    /// abort: nobody observed them, so they go straight back to the
    /// reusable pool instead of waiting on reader pins).
    pub fn abort_pending(&mut self) {
        self.reusable.extend(self.pending.iter().copied());
        self.pending.clear();
    }

    fn sweep(&mut self) {
        let boundary = self.oldest_reader;
        let safe: Vec<TransactionId> = self
            .by_txn
            .keys()
            .copied()
            .filter(|&txn_id| match boundary {
                None => true,
                Some(oldest) => txn_id < oldest,
            })
            .collect();
        for txn_id in safe {
            if let Some(pages) = self.by_txn.remove(&txn_id) {
                self.reusable.extend(pages);
            }
        }
    }

    /// Encode the current `by_txn` map as (key, value) pairs ready to be
    /// written into the free-list DBI via the tree layer's `load_sorted`.
    pub fn encode_entries(&self) -> Vec<(Vec<u8>, Vec<u8>)> {
        self.by_txn
            .iter()
            .map(|(txn_id, pages)| {
                let mut key = vec![0u8; 8];
                BigEndian::write_u64(&mut key, txn_id.0);
                let mut value = Vec::with_capacity(pages.len() * 4);
                for p in pages {
                    let mut b = [0u8; 4];
                    LittleEndian::write_u32(&mut b, p.0);
                    value.extend_from_slice(&b);
                }
                (key, value)
            })
            .collect()
    }

    /// Number of pages immediately available for reuse.
    pub fn len(&self) -> usize {
        self.reusable.len()
    }

    /// Whether the reusable pool is empty.
    pub fn is_empty(&self) -> bool {
        self.reusable.is_empty()
    }

    /// Number of pages staged by the in-progress write transaction.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Number of distinct transactions still holding pages deferred behind
    /// a reader pin.
    pub fn deferred_txn_count(&self) -> usize {
        self.by_txn.len()
    }

    /// Structural health counters, for test assertions.
    pub fn health(&self) -> FreelistHealth {
        self.health
    }
}
