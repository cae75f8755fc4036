//! Pluggable page storage.
//!
//! The B+tree layer never touches a file or a `Vec` directly: it reads and
//! writes whole pages through a [`PageStore`]. This is the capability-record
//! page allocator from spec §6, realized as a trait object rather than a
//! function-pointer-plus-context pair — idiomatic Rust's equivalent.
//!
//! Two implementations ship: [`GrowableTablePageStore`], the literal
//! "growable table of fixed-size slots" default (spec §4.1, in-memory), and
//! [`MmapPageStore`], an optional on-disk backing for callers who want
//! persistence, grounded in the teacher's `io.rs`.

use crate::error::{Error, PageId, Result};
use crate::page::Page;
use fs4::fs_std::FileExt;
use parking_lot::RwLock;
use std::fs::{File, OpenOptions};
use std::path::Path;

/// How eagerly a [`PageStore`] flushes to stable storage on commit.
///
/// These are a knob layered on top of a caller-supplied store; they do not
/// themselves constitute the fsync guarantee the spec's Non-goals exclude
/// (a crash-consistency contract beyond a user checkpoint writer).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DurabilityMode {
    /// Never sync; rely entirely on the OS page cache.
    NoSync,
    /// Flush data pages but not the meta page.
    AsyncFlush,
    /// Flush data pages, then the meta page, synchronously.
    #[default]
    SyncData,
    /// `fsync` the underlying file after every flush.
    FullSync,
}

/// A fixed-size-page backing store.
///
/// `page_size` is fixed for the lifetime of a store instance; callers pick
/// it once when the database is created (spec §3: page size in
/// [256, 65535]).
pub trait PageStore: Send + Sync {
    /// The size in bytes of every page this store hands out.
    fn page_size(&self) -> usize;

    /// Number of pages currently allocated (including any not yet written).
    fn num_pages(&self) -> u32;

    /// Read the page with the given id.
    fn read_page(&self, id: PageId) -> Result<Page>;

    /// Overwrite the page at `page.pgno()`. The page must already be
    /// allocated (via [`PageStore::allocate`] or a prior write).
    fn write_page(&self, page: &Page) -> Result<()>;

    /// Grow the store by one page slot and return its id.
    fn allocate(&self) -> Result<PageId>;

    /// Flush pending writes according to `mode`.
    fn sync(&self, mode: DurabilityMode) -> Result<()>;
}

/// The default in-memory store: a growable table of fixed-size page slots.
#[derive(Debug)]
pub struct GrowableTablePageStore {
    page_size: usize,
    table: RwLock<Vec<Vec<u8>>>,
}

impl GrowableTablePageStore {
    /// Create an empty store with no pages allocated yet.
    pub fn new(page_size: usize) -> Self {
        GrowableTablePageStore { page_size, table: RwLock::new(Vec::new()) }
    }
}

impl PageStore for GrowableTablePageStore {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn num_pages(&self) -> u32 {
        self.table.read().len() as u32
    }

    fn read_page(&self, id: PageId) -> Result<Page> {
        let table = self.table.read();
        let slot = table
            .get(id.0 as usize)
            .ok_or_else(|| Error::corrupt_at("page id not allocated", id))?;
        Ok(Page::from_bytes(slot.clone()))
    }

    fn write_page(&self, page: &Page) -> Result<()> {
        let id = page.pgno();
        let mut table = self.table.write();
        if id.0 as usize >= table.len() {
            return Err(Error::corrupt_at("write to unallocated page", id));
        }
        table[id.0 as usize] = page.as_bytes().to_vec();
        Ok(())
    }

    fn allocate(&self) -> Result<PageId> {
        let mut table = self.table.write();
        let id = PageId(table.len() as u32);
        table.push(vec![0u8; self.page_size]);
        Ok(id)
    }

    fn sync(&self, _mode: DurabilityMode) -> Result<()> {
        Ok(())
    }
}

/// An on-disk store backed by a memory-mapped file.
///
/// Growth remaps the file: `allocate` extends the file length and
/// remaps, so it must take the write lock even though it does not touch
/// page contents.
pub struct MmapPageStore {
    file: File,
    page_size: usize,
    state: RwLock<MmapState>,
}

struct MmapState {
    mmap: memmap2::MmapMut,
    num_pages: u32,
}

impl MmapPageStore {
    /// Open (creating if necessary) a file-backed page store. Takes an
    /// advisory exclusive lock on the file for the lifetime of the store,
    /// since spec §1 excludes multi-process sharing.
    pub fn open(path: impl AsRef<Path>, page_size: usize) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).create(true).open(path)?;
        file.try_lock_exclusive()
            .map_err(|_| Error::Busy("page store file is locked by another process"))?;

        let len = file.metadata()?.len();
        let num_pages = (len / page_size as u64) as u32;
        let min_len = (page_size as u64).max(len);
        if len < min_len {
            file.set_len(min_len)?;
        }
        let mmap = unsafe { memmap2::MmapMut::map_mut(&file)? };
        Ok(MmapPageStore {
            file,
            page_size,
            state: RwLock::new(MmapState { mmap, num_pages: num_pages.max(0) }),
        })
    }

    fn offset(&self, id: PageId) -> usize {
        id.0 as usize * self.page_size
    }
}

impl PageStore for MmapPageStore {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn num_pages(&self) -> u32 {
        self.state.read().num_pages
    }

    fn read_page(&self, id: PageId) -> Result<Page> {
        let state = self.state.read();
        if id.0 >= state.num_pages {
            return Err(Error::corrupt_at("page id not allocated", id));
        }
        let off = self.offset(id);
        let bytes = state.mmap[off..off + self.page_size].to_vec();
        Ok(Page::from_bytes(bytes))
    }

    fn write_page(&self, page: &Page) -> Result<()> {
        let id = page.pgno();
        let mut state = self.state.write();
        if id.0 >= state.num_pages {
            return Err(Error::corrupt_at("write to unallocated page", id));
        }
        let off = id.0 as usize * self.page_size;
        state.mmap[off..off + self.page_size].copy_from_slice(page.as_bytes());
        Ok(())
    }

    fn allocate(&self) -> Result<PageId> {
        let mut state = self.state.write();
        let id = PageId(state.num_pages);
        let new_len = (state.num_pages as u64 + 1) * self.page_size as u64;
        self.file.set_len(new_len)?;
        // SAFETY: no outstanding borrows of the old mapping survive this
        // scope; `state` holds the only handle to it and we replace it here.
        let mmap = unsafe { memmap2::MmapMut::map_mut(&self.file)? };
        state.mmap = mmap;
        state.num_pages += 1;
        Ok(id)
    }

    fn sync(&self, mode: DurabilityMode) -> Result<()> {
        match mode {
            DurabilityMode::NoSync => Ok(()),
            DurabilityMode::AsyncFlush => {
                self.state.read().mmap.flush_async()?;
                Ok(())
            }
            DurabilityMode::SyncData => {
                self.state.read().mmap.flush()?;
                Ok(())
            }
            DurabilityMode::FullSync => {
                self.state.read().mmap.flush()?;
                self.file.sync_all()?;
                Ok(())
            }
        }
    }
}

impl Drop for MmapPageStore {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransactionId;
    use crate::page::PageFlags;

    #[test]
    fn growable_table_allocate_write_read() {
        let store = GrowableTablePageStore::new(512);
        let id = store.allocate().unwrap();
        assert_eq!(store.num_pages(), 1);
        let page = Page::new(512, id, PageFlags::LEAF, TransactionId(1));
        store.write_page(&page).unwrap();
        let read_back = store.read_page(id).unwrap();
        assert_eq!(read_back.pgno(), id);
    }

    #[test]
    fn growable_table_rejects_unallocated_read() {
        let store = GrowableTablePageStore::new(512);
        assert!(store.read_page(PageId(0)).is_err());
    }

    #[test]
    fn mmap_store_roundtrips_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.sapling");
        let store = MmapPageStore::open(&path, 512).unwrap();
        let id = store.allocate().unwrap();
        let mut page = Page::new(512, id, PageFlags::LEAF, TransactionId(1));
        page.insert_at(0, b"k", b"v", crate::page::NodeFlags::empty()).unwrap();
        store.write_page(&page).unwrap();
        store.sync(DurabilityMode::FullSync).unwrap();
        let read_back = store.read_page(id).unwrap();
        assert_eq!(read_back.node(0).unwrap().key, b"k");
    }
}
