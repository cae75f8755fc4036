//! Page layout: header, node (key/value entry) encoding, and the sorted
//! in-page binary search used by the B+tree layer.
//!
//! Pages are byte buffers of a fixed `page_size` (chosen at DB creation).
//! The header occupies the first [`HEADER_SIZE`] bytes; the remainder is
//! split between a pointer array (growing up from the header) and node
//! bodies (growing down from the end of the page), mirroring the classic
//! LMDB page layout. Unlike the teacher this is encoded through safe
//! `byteorder` reads/writes over a `Vec<u8>` rather than `#[repr(C)]`
//! pointer transmutes (see `DESIGN.md`, Open Question 3).

use crate::comparator::Comparator;
use crate::error::{Error, PageId, PageType, Result, TransactionId};
use bitflags::bitflags;
use byteorder::{ByteOrder, LittleEndian};
use std::cmp::Ordering;

bitflags! {
    /// Page role and state flags, stored in the page header.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u16 {
        /// Internal B+tree node: separators + child page ids.
        const BRANCH = 0x01;
        /// Leaf B+tree node: keys + values.
        const LEAF = 0x02;
        /// Holds a chunk of an oversized value.
        const OVERFLOW = 0x04;
        /// One of the two alternating database meta pages.
        const META = 0x08;
        /// On the free list, awaiting reuse.
        const FREE = 0x10;
        /// Root of a promoted DUPSORT per-key subtree (still BRANCH or LEAF).
        const DUP_SUBTREE = 0x20;
    }
}

bitflags! {
    /// Per-node flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct NodeFlags: u8 {
        /// Value is stored in an overflow page chain; the node's value
        /// field is the 4-byte id of the chain head instead of inline bytes.
        const BIGDATA = 0x01;
    }
}

/// Header byte layout, all little-endian.
mod layout {
    pub const PGNO: usize = 0;
    pub const FLAGS: usize = 4;
    pub const NUM_KEYS: usize = 6;
    pub const LOWER: usize = 8;
    pub const UPPER: usize = 10;
    pub const CHECKSUM: usize = 12;
    pub const NEXT_PGNO: usize = 16;
    pub const TXN_ID: usize = 20;
    pub const OVERFLOW_COUNT: usize = 28;
    pub const SIZE: usize = 32;
}

/// Size in bytes of the fixed page header.
pub const HEADER_SIZE: usize = layout::SIZE;

/// Size in bytes of a node header (flags + key size + value size), not
/// counting the key/value bytes that follow it.
pub const NODE_HEADER_SIZE: usize = 1 + 2 + 4;

/// Minimum legal page size (spec §3).
pub const MIN_PAGE_SIZE: usize = 256;
/// Maximum legal page size (spec §3).
pub const MAX_PAGE_SIZE: usize = 65535;

/// A single database page: a fixed-size byte buffer plus accessors for its
/// header fields and sorted node entries.
#[derive(Debug, Clone)]
pub struct Page {
    buf: Vec<u8>,
}

/// Result of a sorted search within a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchResult {
    /// The key was found at this index.
    Found(usize),
    /// The key was not present; it would be inserted at this index.
    NotFound(usize),
}

impl Page {
    /// Allocate a fresh, empty page of `page_size` bytes.
    pub fn new(page_size: usize, pgno: PageId, flags: PageFlags, txn_id: TransactionId) -> Self {
        let mut buf = vec![0u8; page_size];
        LittleEndian::write_u32(&mut buf[layout::PGNO..], pgno.0);
        LittleEndian::write_u16(&mut buf[layout::FLAGS..], flags.bits());
        LittleEndian::write_u16(&mut buf[layout::LOWER..], HEADER_SIZE as u16);
        LittleEndian::write_u16(&mut buf[layout::UPPER..], page_size as u16);
        LittleEndian::write_u32(&mut buf[layout::NEXT_PGNO..], PageId::NONE.0);
        LittleEndian::write_u64(&mut buf[layout::TXN_ID..], txn_id.0);
        Page { buf }
    }

    /// Wrap an existing byte buffer as a page, without validating contents.
    pub fn from_bytes(buf: Vec<u8>) -> Self {
        Page { buf }
    }

    /// Borrow this page's raw bytes (for checksumming or I/O).
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Mutably borrow this page's raw bytes.
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    /// Consume the page, returning its raw bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    /// The declared page size of this buffer.
    pub fn page_size(&self) -> usize {
        self.buf.len()
    }

    // --- header accessors -------------------------------------------------

    /// This page's own id.
    pub fn pgno(&self) -> PageId {
        PageId(LittleEndian::read_u32(&self.buf[layout::PGNO..]))
    }

    /// Set this page's own id (used when relocating a free-list page).
    pub fn set_pgno(&mut self, id: PageId) {
        LittleEndian::write_u32(&mut self.buf[layout::PGNO..], id.0);
    }

    /// The page's role/state flags.
    pub fn flags(&self) -> PageFlags {
        PageFlags::from_bits_truncate(LittleEndian::read_u16(&self.buf[layout::FLAGS..]))
    }

    /// Replace the page's flags wholesale.
    pub fn set_flags(&mut self, flags: PageFlags) {
        LittleEndian::write_u16(&mut self.buf[layout::FLAGS..], flags.bits());
    }

    /// The page's role, for diagnostics and error reporting.
    pub fn page_type(&self) -> PageType {
        let f = self.flags();
        if f.contains(PageFlags::BRANCH) {
            PageType::Branch
        } else if f.contains(PageFlags::LEAF) {
            PageType::Leaf
        } else if f.contains(PageFlags::OVERFLOW) {
            PageType::Overflow
        } else if f.contains(PageFlags::META) {
            PageType::Meta
        } else {
            PageType::Free
        }
    }

    /// Number of node entries on this page.
    pub fn num_keys(&self) -> usize {
        LittleEndian::read_u16(&self.buf[layout::NUM_KEYS..]) as usize
    }

    fn set_num_keys(&mut self, n: usize) {
        LittleEndian::write_u16(&mut self.buf[layout::NUM_KEYS..], n as u16);
    }

    /// Offset of the first free byte after the pointer array.
    pub fn lower(&self) -> usize {
        LittleEndian::read_u16(&self.buf[layout::LOWER..]) as usize
    }

    fn set_lower(&mut self, v: usize) {
        LittleEndian::write_u16(&mut self.buf[layout::LOWER..], v as u16);
    }

    /// Offset of the first byte used by node bodies (grows downward).
    pub fn upper(&self) -> usize {
        LittleEndian::read_u16(&self.buf[layout::UPPER..]) as usize
    }

    fn set_upper(&mut self, v: usize) {
        LittleEndian::write_u16(&mut self.buf[layout::UPPER..], v as u16);
    }

    /// Bytes available for a new node (body + its 2-byte pointer slot).
    pub fn free_space(&self) -> usize {
        self.upper().saturating_sub(self.lower())
    }

    /// Stored CRC32 checksum, or 0 if none has been written.
    pub fn checksum(&self) -> u32 {
        LittleEndian::read_u32(&self.buf[layout::CHECKSUM..])
    }

    /// Overwrite the stored checksum.
    pub fn set_checksum(&mut self, v: u32) {
        LittleEndian::write_u32(&mut self.buf[layout::CHECKSUM..], v);
    }

    /// Next page in a chain (leaf sibling link, free-list link, or overflow
    /// continuation); [`PageId::NONE`] if this is the last page in its chain.
    pub fn next_pgno(&self) -> PageId {
        PageId(LittleEndian::read_u32(&self.buf[layout::NEXT_PGNO..]))
    }

    /// Set the next-page-in-chain link.
    pub fn set_next_pgno(&mut self, id: PageId) {
        LittleEndian::write_u32(&mut self.buf[layout::NEXT_PGNO..], id.0);
    }

    /// The id of the write transaction that produced this page's current
    /// contents. Used by the COW walk: a page may be edited in place only
    /// if this equals the active writer's transaction id.
    pub fn txn_id(&self) -> TransactionId {
        TransactionId(LittleEndian::read_u64(&self.buf[layout::TXN_ID..]))
    }

    /// Stamp this page with the producing transaction's id.
    pub fn set_txn_id(&mut self, id: TransactionId) {
        LittleEndian::write_u64(&mut self.buf[layout::TXN_ID..], id.0);
    }

    /// Auxiliary count: total value size for the first page of an overflow
    /// chain, or unused for branch/leaf pages.
    pub fn overflow_count(&self) -> u32 {
        LittleEndian::read_u32(&self.buf[layout::OVERFLOW_COUNT..])
    }

    /// Set the auxiliary overflow count field.
    pub fn set_overflow_count(&mut self, v: u32) {
        LittleEndian::write_u32(&mut self.buf[layout::OVERFLOW_COUNT..], v);
    }

    // --- pointer array ------------------------------------------------------

    fn ptr_offset(index: usize) -> usize {
        HEADER_SIZE + index * 2
    }

    fn ptr(&self, index: usize) -> usize {
        LittleEndian::read_u16(&self.buf[Self::ptr_offset(index)..]) as usize
    }

    fn set_ptr(&mut self, index: usize, offset: usize) {
        LittleEndian::write_u16(&mut self.buf[Self::ptr_offset(index)..], offset as u16);
    }

    // --- node read access ---------------------------------------------------

    /// Borrow the `index`-th node's flags, key, and value.
    pub fn node(&self, index: usize) -> Result<NodeView<'_>> {
        if index >= self.num_keys() {
            return Err(Error::corrupt_at("node index out of bounds", self.pgno()));
        }
        let off = self.ptr(index);
        if off < self.upper().min(off + NODE_HEADER_SIZE) || off + NODE_HEADER_SIZE > self.buf.len()
        {
            return Err(Error::corrupt_at("node pointer out of bounds", self.pgno()));
        }
        let flags = NodeFlags::from_bits_truncate(self.buf[off]);
        let ksize = LittleEndian::read_u16(&self.buf[off + 1..]) as usize;
        let vsize = LittleEndian::read_u32(&self.buf[off + 3..]) as usize;
        let key_start = off + NODE_HEADER_SIZE;
        let val_start = key_start + ksize;
        if val_start + vsize > self.buf.len() {
            return Err(Error::corrupt_at("node body extends beyond page", self.pgno()));
        }
        Ok(NodeView {
            flags,
            key: &self.buf[key_start..val_start],
            value: &self.buf[val_start..val_start + vsize],
        })
    }

    /// Binary search for `key` among this page's sorted node entries.
    pub fn search_key(&self, key: &[u8], cmp: &dyn Comparator) -> Result<SearchResult> {
        let n = self.num_keys();
        if n == 0 {
            return Ok(SearchResult::NotFound(0));
        }
        let (mut lo, mut hi) = (0usize, n);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let node = self.node(mid)?;
            match cmp.compare(key, node.key) {
                Ordering::Less => hi = mid,
                Ordering::Greater => lo = mid + 1,
                Ordering::Equal => return Ok(SearchResult::Found(mid)),
            }
        }
        Ok(SearchResult::NotFound(lo))
    }

    // --- node write access ---------------------------------------------------

    /// Bytes a node of this key/value size would occupy, pointer included.
    pub fn entry_cost(key_len: usize, value_len: usize) -> usize {
        NODE_HEADER_SIZE + key_len + value_len + 2
    }

    /// Insert a new node at `index`, shifting the pointer array. `index`
    /// must be the position the sorted order requires (callers use
    /// [`Page::search_key`] to find it).
    pub fn insert_at(
        &mut self,
        index: usize,
        key: &[u8],
        value: &[u8],
        flags: NodeFlags,
    ) -> Result<()> {
        let cost = Self::entry_cost(key.len(), value.len());
        if self.free_space() < cost {
            return Err(Error::Full("page has no room for this entry"));
        }
        let body_size = NODE_HEADER_SIZE + key.len() + value.len();
        let new_upper = self.upper() - body_size;
        self.buf[new_upper] = flags.bits();
        LittleEndian::write_u16(&mut self.buf[new_upper + 1..], key.len() as u16);
        LittleEndian::write_u32(&mut self.buf[new_upper + 3..], value.len() as u32);
        let key_start = new_upper + NODE_HEADER_SIZE;
        self.buf[key_start..key_start + key.len()].copy_from_slice(key);
        self.buf[key_start + key.len()..key_start + key.len() + value.len()].copy_from_slice(value);

        let n = self.num_keys();
        for i in (index..n).rev() {
            let p = self.ptr(i);
            self.set_ptr(i + 1, p);
        }
        self.set_ptr(index, new_upper);
        self.set_num_keys(n + 1);
        self.set_lower(self.lower() + 2);
        self.set_upper(new_upper);
        Ok(())
    }

    /// Remove the node at `index`, shifting the pointer array down. Node
    /// body bytes are not reclaimed; they are overwritten by future inserts
    /// after a page rebuild (mirrors the teacher's `remove_node`).
    pub fn remove_at(&mut self, index: usize) -> Result<()> {
        let n = self.num_keys();
        if index >= n {
            return Err(Error::corrupt_at("remove index out of bounds", self.pgno()));
        }
        for i in index..n - 1 {
            let p = self.ptr(i + 1);
            self.set_ptr(i, p);
        }
        self.set_num_keys(n - 1);
        self.set_lower(self.lower() - 2);
        Ok(())
    }

    /// Replace the value of the node at `index` in place. Only valid when
    /// `new_value.len()` does not exceed the node's current value capacity;
    /// callers needing to grow a value should remove + reinsert instead.
    pub fn set_value_at(&mut self, index: usize, new_value: &[u8]) -> Result<()> {
        let off = self.ptr(index);
        let ksize = LittleEndian::read_u16(&self.buf[off + 1..]) as usize;
        let old_vsize = LittleEndian::read_u32(&self.buf[off + 3..]) as usize;
        if new_value.len() > old_vsize {
            return Err(Error::Other("set_value_at: new value larger than existing slot".into()));
        }
        LittleEndian::write_u32(&mut self.buf[off + 3..], new_value.len() as u32);
        let val_start = off + NODE_HEADER_SIZE + ksize;
        self.buf[val_start..val_start + new_value.len()].copy_from_slice(new_value);
        Ok(())
    }

    /// Drop every node from `from` (inclusive) to the end.
    pub fn truncate_from(&mut self, from: usize) {
        self.set_num_keys(from);
        self.set_lower(HEADER_SIZE + from * 2);
    }

    /// Remove all nodes, resetting the page to empty.
    pub fn clear(&mut self) {
        self.set_num_keys(0);
        self.set_lower(HEADER_SIZE);
        self.set_upper(self.page_size());
    }

    /// Rebuild this page in place from a list of (key, value, flags)
    /// entries already in sorted order. Used after a merge/redistribute
    /// recomputes a node's contents wholesale.
    pub fn rebuild(&mut self, entries: &[(Vec<u8>, Vec<u8>, NodeFlags)]) -> Result<()> {
        self.clear();
        for (k, v, f) in entries {
            let idx = self.num_keys();
            self.insert_at(idx, k, v, *f)?;
        }
        Ok(())
    }

    /// Total bytes occupied by all node bodies plus pointers; used to
    /// compare candidate merge siblings by size and to find a split point.
    pub fn used_bytes(&self) -> usize {
        self.page_size() - self.free_space() - HEADER_SIZE
    }

    /// Iterate all entries as owned (key, value, flags) tuples, in order.
    pub fn entries(&self) -> Result<Vec<(Vec<u8>, Vec<u8>, NodeFlags)>> {
        let mut out = Vec::with_capacity(self.num_keys());
        for i in 0..self.num_keys() {
            let node = self.node(i)?;
            out.push((node.key.to_vec(), node.value.to_vec(), node.flags));
        }
        Ok(out)
    }
}

/// A borrowed view of one node's flags, key, and value.
#[derive(Debug, Clone, Copy)]
pub struct NodeView<'a> {
    /// Node-local flags (currently just [`NodeFlags::BIGDATA`]).
    pub flags: NodeFlags,
    /// The node's key bytes.
    pub key: &'a [u8],
    /// The node's value bytes: inline value bytes, a 4-byte child page id
    /// (branch pages), or a 4-byte overflow chain head id (when
    /// `flags.contains(NodeFlags::BIGDATA)`).
    pub value: &'a [u8],
}

impl<'a> NodeView<'a> {
    /// Interpret this node's value as a branch child page id.
    pub fn child_page(&self) -> PageId {
        PageId(LittleEndian::read_u32(self.value))
    }

    /// Interpret this node's value as an overflow chain head page id.
    pub fn overflow_head(&self) -> PageId {
        PageId(LittleEndian::read_u32(self.value))
    }
}

/// Encode a page id as a 4-byte branch child value.
pub fn encode_child(id: PageId) -> [u8; 4] {
    let mut b = [0u8; 4];
    LittleEndian::write_u32(&mut b, id.0);
    b
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comparator::LexicographicComparator;

    #[test]
    fn new_page_is_empty() {
        let page = Page::new(4096, PageId(1), PageFlags::LEAF, TransactionId(1));
        assert_eq!(page.num_keys(), 0);
        assert_eq!(page.pgno(), PageId(1));
        assert_eq!(page.free_space(), 4096 - HEADER_SIZE);
    }

    #[test]
    fn insert_and_read_back() {
        let mut page = Page::new(4096, PageId(1), PageFlags::LEAF, TransactionId(1));
        page.insert_at(0, b"k", b"v", NodeFlags::empty()).unwrap();
        let node = page.node(0).unwrap();
        assert_eq!(node.key, b"k");
        assert_eq!(node.value, b"v");
    }

    #[test]
    fn sorted_insert_and_search() {
        let mut page = Page::new(4096, PageId(1), PageFlags::LEAF, TransactionId(1));
        let cmp = LexicographicComparator;
        for k in [b"ccc", b"aaa", b"bbb"] {
            let pos = match page.search_key(k, &cmp).unwrap() {
                SearchResult::Found(i) => i,
                SearchResult::NotFound(i) => i,
            };
            page.insert_at(pos, k, b"1", NodeFlags::empty()).unwrap();
        }
        assert_eq!(page.node(0).unwrap().key, b"aaa");
        assert_eq!(page.node(1).unwrap().key, b"bbb");
        assert_eq!(page.node(2).unwrap().key, b"ccc");
        match page.search_key(b"bbb", &cmp).unwrap() {
            SearchResult::Found(1) => {}
            other => panic!("unexpected {:?}", other),
        }
        match page.search_key(b"ddd", &cmp).unwrap() {
            SearchResult::NotFound(3) => {}
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn remove_shifts_pointers() {
        let mut page = Page::new(4096, PageId(1), PageFlags::LEAF, TransactionId(1));
        page.insert_at(0, b"a", b"1", NodeFlags::empty()).unwrap();
        page.insert_at(1, b"b", b"2", NodeFlags::empty()).unwrap();
        page.insert_at(2, b"c", b"3", NodeFlags::empty()).unwrap();
        page.remove_at(1).unwrap();
        assert_eq!(page.num_keys(), 2);
        assert_eq!(page.node(0).unwrap().key, b"a");
        assert_eq!(page.node(1).unwrap().key, b"c");
    }

    #[test]
    fn full_page_rejects_insert() {
        let mut page = Page::new(256, PageId(1), PageFlags::LEAF, TransactionId(1));
        let mut i = 0;
        loop {
            let key = format!("k{:03}", i).into_bytes();
            match page.insert_at(page.num_keys(), &key, b"v", NodeFlags::empty()) {
                Ok(()) => i += 1,
                Err(Error::Full(_)) => break,
                Err(e) => panic!("unexpected error {e:?}"),
            }
        }
        assert!(i > 0);
    }
}
