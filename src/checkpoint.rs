//! Checkpoint/restore codec (spec §4.6).
//!
//! `checkpoint` walks every page reachable from the current meta's DBI
//! roots (branches, leaves, overflow chains, and promoted DUPSORT
//! subtrees) and emits a self-describing, length-framed stream. `restore`
//! rebuilds a fresh [`Database`] from such a stream. The framing is
//! internal (spec §4.6 leaves it to the implementer; see `DESIGN.md` Open
//! Question 2) — only `restore(checkpoint(db)) == db` and "rejects an
//! incompatible page size" are load-bearing.

use crate::checksum::{self, ChecksumMode};
use crate::db::{DbBuilder, Database};
use crate::error::{Error, PageId, Result};
use crate::meta::{self, DbiSlot, MetaPage, MAX_DBI};
use crate::page::{NodeFlags, Page, PageFlags};
use crate::page_store::GrowableTablePageStore;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::collections::HashSet;
use std::io::{Read, Write};

const MAGIC: &[u8; 8] = b"SAPLCKPT";
const FORMAT_VERSION: u16 = 1;
const SENTINEL: u64 = u64::MAX;

/// Stream out a consistent snapshot of `db`'s current committed state.
pub fn checkpoint<W: Write>(db: &Database, out: &mut W) -> Result<()> {
    let mut reader = db.begin_read()?;
    let snapshot = *reader.snapshot();
    let page_size = db.page_size();

    out.write_all(MAGIC)?;
    out.write_u16::<LittleEndian>(FORMAT_VERSION)?;
    out.write_u32::<LittleEndian>(page_size as u32)?;
    out.write_u32::<LittleEndian>(MAX_DBI as u32)?;
    out.write_u64::<LittleEndian>(snapshot.txn_id.0)?;
    out.write_u32::<LittleEndian>(snapshot.freelist_root.0)?;
    for slot in snapshot.dbis.iter() {
        out.write_u32::<LittleEndian>(slot.root.0)?;
        out.write_u64::<LittleEndian>(slot.entries)?;
        out.write_u8(slot.flags)?;
    }

    // Each queue entry carries whether it descends from a DUPSORT DBI, so a
    // leaf's value bytes are only ever interpreted as a `DupValue` when
    // that's actually how they were encoded; a promoted subtree is an
    // ordinary (non-DUPSORT) btree over the duplicate values themselves.
    let mut visited: HashSet<PageId> = HashSet::new();
    let mut queue: Vec<(PageId, bool)> = Vec::new();
    for slot in snapshot.dbis.iter() {
        if slot.in_use() && !slot.root.is_none() {
            queue.push((slot.root, slot.is_dupsort()));
        }
    }
    if !snapshot.freelist_root.is_none() {
        queue.push((snapshot.freelist_root, false));
    }

    while let Some((id, dupsort)) = queue.pop() {
        if !visited.insert(id) {
            continue;
        }
        let page = db.inner.page_store.read_page(id)?;
        enqueue_children(&page, dupsort, &mut queue)?;

        out.write_u64::<LittleEndian>(id.0 as u64)?;
        out.write_all(page.as_bytes())?;
    }

    out.write_u64::<LittleEndian>(SENTINEL)?;
    Ok(())
}

fn enqueue_children(page: &Page, dupsort: bool, queue: &mut Vec<(PageId, bool)>) -> Result<()> {
    let flags = page.flags();
    if flags.contains(PageFlags::BRANCH) {
        for i in 0..crate::btree::branch_num_children(page) {
            queue.push((crate::btree::branch_child_at(page, i)?, dupsort));
        }
    } else if flags.contains(PageFlags::LEAF) {
        for i in 0..page.num_keys() {
            let node = page.node(i)?;
            if node.flags.contains(NodeFlags::BIGDATA) {
                let head = PageId(u32::from_le_bytes(node.value[..4].try_into().unwrap()));
                queue.push((head, false));
            } else if dupsort {
                if let Some(root) = crate::dupsort::subtree_root(node.value)? {
                    queue.push((root, false));
                }
            }
        }
    } else if flags.contains(PageFlags::OVERFLOW) {
        let next = page.next_pgno();
        if !next.is_none() {
            queue.push((next, false));
        }
    }
    Ok(())
}

/// Rebuild a fresh, in-memory [`Database`] from a stream written by
/// [`checkpoint`]. `expected_page_size` is the page size the caller wants
/// the restored database to have; a stream recorded at a different page
/// size fails cleanly with [`Error::Corrupt`] (spec §4.6) rather than
/// silently reinterpreting the bytes. Also fails on a bad magic, an
/// unrecognised format version, or a truncated/malformed stream.
pub fn restore<R: Read>(input: &mut R, expected_page_size: usize, checksum_mode: ChecksumMode) -> Result<Database> {
    let mut magic = [0u8; 8];
    input.read_exact(&mut magic).map_err(|_| Error::corrupt("truncated checkpoint stream"))?;
    if &magic != MAGIC {
        return Err(Error::corrupt("bad checkpoint magic"));
    }
    let version = input.read_u16::<LittleEndian>()?;
    if version != FORMAT_VERSION {
        return Err(Error::Version(format!("unsupported checkpoint format version {version}")));
    }
    let page_size = input.read_u32::<LittleEndian>()? as usize;
    if page_size != expected_page_size {
        return Err(Error::corrupt(format!(
            "checkpoint page size {page_size} does not match target page size {expected_page_size}"
        )));
    }
    let max_dbi = input.read_u32::<LittleEndian>()? as usize;
    if max_dbi != MAX_DBI {
        return Err(Error::corrupt("checkpoint MAX_DBI does not match this build"));
    }
    let txn_id = crate::error::TransactionId(input.read_u64::<LittleEndian>()?);
    let freelist_root = PageId(input.read_u32::<LittleEndian>()?);

    let empty_slot = DbiSlot { root: PageId::NONE, entries: 0, flags: 0 };
    let mut dbis = [empty_slot; MAX_DBI];
    for slot in dbis.iter_mut() {
        let root = PageId(input.read_u32::<LittleEndian>()?);
        let entries = input.read_u64::<LittleEndian>()?;
        let flags = input.read_u8()?;
        *slot = DbiSlot { root, entries, flags };
    }

    let mut pages: Vec<(PageId, Vec<u8>)> = Vec::new();
    let mut max_id: u32 = 1; // meta pages occupy slots 0 and 1
    loop {
        let tag = input.read_u64::<LittleEndian>()?;
        if tag == SENTINEL {
            break;
        }
        let id = PageId(tag as u32);
        let mut buf = vec![0u8; page_size];
        input.read_exact(&mut buf).map_err(|_| Error::corrupt("truncated checkpoint page body"))?;
        max_id = max_id.max(id.0);
        pages.push((id, buf));
    }

    let store = GrowableTablePageStore::new(page_size);
    for _ in 0..=max_id {
        store.allocate()?;
    }
    for (id, buf) in pages {
        let mut page = Page::from_bytes(buf);
        page.set_pgno(id);
        store.write_page(&page)?;
    }

    let restored_meta = MetaPage {
        page_size: page_size as u16,
        format_major: meta::FORMAT_MAJOR,
        format_minor: meta::FORMAT_MINOR,
        txn_id,
        freelist_root,
        dbis,
    };
    let page1 = stamped(restored_meta.to_page(meta::META_PAGE_1, page_size), checksum_mode);
    let page2 = stamped(restored_meta.to_page(meta::META_PAGE_2, page_size), checksum_mode);
    store.write_page(&page1)?;
    store.write_page(&page2)?;

    DbBuilder::new().page_size(expected_page_size).checksum_mode(checksum_mode).open_with_store(Box::new(store))
}

fn stamped(mut page: Page, mode: ChecksumMode) -> Page {
    if mode.applies_to(true) {
        checksum::stamp(&mut page);
    }
    page
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::PutFlags;
    use crate::db::DbBuilder;

    #[test]
    fn round_trip_preserves_contents() {
        let db = DbBuilder::new().build().unwrap();
        let mut txn = db.begin_write().unwrap();
        let dbi = txn.create_dbi(0, false).unwrap();
        for i in 0..200u32 {
            let k = format!("key-{i:04}");
            let v = format!("value-{i:04}");
            txn.put(dbi, k.as_bytes(), v.as_bytes(), PutFlags::empty()).unwrap();
        }
        txn.commit().unwrap();

        let mut buf = Vec::new();
        checkpoint(&db, &mut buf).unwrap();

        let restored = restore(&mut buf.as_slice(), db.page_size(), ChecksumMode::None).unwrap();
        let mut read = restored.begin_read().unwrap();
        for i in 0..200u32 {
            let k = format!("key-{i:04}");
            let v = format!("value-{i:04}");
            assert_eq!(read.get(dbi, k.as_bytes()).unwrap(), Some(v.into_bytes()));
        }
    }

    #[test]
    fn restore_rejects_incompatible_page_size() {
        let db = DbBuilder::new().page_size(4096).build().unwrap();
        let mut buf = Vec::new();
        checkpoint(&db, &mut buf).unwrap();

        let err = restore(&mut buf.as_slice(), 512, ChecksumMode::None).unwrap_err();
        assert!(matches!(err, Error::Corrupt { .. }));
    }
}
