//! The meta page: database-wide metadata, published twice per commit
//! under alternating page ids so a reader never observes a half-written
//! update.

use crate::error::{Error, PageId, Result, TransactionId};
use crate::page::{Page, PageFlags, HEADER_SIZE};
use byteorder::{ByteOrder, LittleEndian};
use static_assertions::const_assert;

/// Page id of the first meta slot.
pub const META_PAGE_1: PageId = PageId(0);
/// Page id of the second meta slot.
pub const META_PAGE_2: PageId = PageId(1);

/// Magic identifying a sapling database file.
pub const MAGIC: u32 = 0x5350_4C31;
/// On-disk format major version. Bumped on incompatible layout changes.
pub const FORMAT_MAJOR: u8 = 1;
/// On-disk format minor version.
pub const FORMAT_MINOR: u8 = 0;

/// Maximum number of DBIs a database may hold (spec §3, default 32).
pub const MAX_DBI: usize = 32;

/// Per-DBI flags stored in its meta slot.
pub mod dbi_flags {
    /// Slot is actually in use (distinguishes an unallocated slot from a
    /// created-but-empty DBI, whose root is [`crate::error::PageId::NONE`]).
    pub const IN_USE: u8 = 0x01;
    /// Values are stored DUPSORT-style: an ordered set per key.
    pub const DUPSORT: u8 = 0x02;
    /// Entries carry a TTL and may be lazily expired.
    pub const TTL: u8 = 0x04;
}

const DBI_SLOT_SIZE: usize = 4 + 8 + 1; // root, entries, flags
const FIXED_FIELDS_SIZE: usize = 4 + 2 + 1 + 1 + 1 + 8 + 4; // magic..freelist_root
const META_BODY_SIZE: usize = FIXED_FIELDS_SIZE + MAX_DBI * DBI_SLOT_SIZE + 4; // + checksum

const_assert!(HEADER_SIZE + META_BODY_SIZE < crate::page::MAX_PAGE_SIZE);

/// Per-DBI metadata as recorded in a meta page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DbiSlot {
    /// Root page of this DBI's B+tree, or [`PageId::NONE`] if empty.
    pub root: PageId,
    /// Number of live entries.
    pub entries: u64,
    /// Raw flag byte (see [`dbi_flags`]).
    pub flags: u8,
}

impl DbiSlot {
    const EMPTY: DbiSlot = DbiSlot { root: PageId::NONE, entries: 0, flags: 0 };

    /// Whether this slot has been allocated to a DBI.
    pub fn in_use(&self) -> bool {
        self.flags & dbi_flags::IN_USE != 0
    }

    /// Whether this DBI allows multiple values per key.
    pub fn is_dupsort(&self) -> bool {
        self.flags & dbi_flags::DUPSORT != 0
    }
}

/// The full contents of a meta page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetaPage {
    /// Page size this database was created with.
    pub page_size: u16,
    /// On-disk format major version.
    pub format_major: u8,
    /// On-disk format minor version.
    pub format_minor: u8,
    /// The transaction that produced this snapshot.
    pub txn_id: TransactionId,
    /// Root of the free-list structure.
    pub freelist_root: PageId,
    /// Per-DBI slots, indexed by DBI number.
    pub dbis: [DbiSlot; MAX_DBI],
}

impl MetaPage {
    /// A freshly initialized, empty database at transaction 0.
    pub fn fresh(page_size: u16) -> Self {
        MetaPage {
            page_size,
            format_major: FORMAT_MAJOR,
            format_minor: FORMAT_MINOR,
            txn_id: TransactionId(0),
            freelist_root: PageId::NONE,
            dbis: [DbiSlot::EMPTY; MAX_DBI],
        }
    }

    /// Validate internal consistency (called after decode, before this
    /// meta is trusted as "current").
    pub fn validate(&self, expected_page_size: u16) -> Result<()> {
        if self.format_major != FORMAT_MAJOR {
            return Err(Error::Version(format!(
                "meta format major {} unsupported (expected {})",
                self.format_major, FORMAT_MAJOR
            )));
        }
        if self.page_size != expected_page_size {
            return Err(Error::corrupt(format!(
                "meta page size {} does not match database page size {}",
                self.page_size, expected_page_size
            )));
        }
        Ok(())
    }

    /// Encode this meta page into a fresh [`Page`] at `pgno`, stamping it
    /// with `txn_id` as its producing transaction.
    pub fn to_page(&self, pgno: PageId, page_size: usize) -> Page {
        let mut page = Page::new(page_size, pgno, PageFlags::META, self.txn_id);
        let buf = page.as_bytes_mut();
        let mut off = HEADER_SIZE;

        LittleEndian::write_u32(&mut buf[off..], MAGIC);
        off += 4;
        LittleEndian::write_u16(&mut buf[off..], self.page_size);
        off += 2;
        buf[off] = 0; // reserved flags byte
        off += 1;
        buf[off] = self.format_major;
        off += 1;
        buf[off] = self.format_minor;
        off += 1;
        LittleEndian::write_u64(&mut buf[off..], self.txn_id.0);
        off += 8;
        LittleEndian::write_u32(&mut buf[off..], self.freelist_root.0);
        off += 4;

        for slot in &self.dbis {
            LittleEndian::write_u32(&mut buf[off..], slot.root.0);
            off += 4;
            LittleEndian::write_u64(&mut buf[off..], slot.entries);
            off += 8;
            buf[off] = slot.flags;
            off += 1;
        }

        let checksum = crc32fast::hash(&buf[HEADER_SIZE..off]);
        LittleEndian::write_u32(&mut buf[off..], checksum);

        page
    }

    /// Decode and validate a meta page's contents.
    pub fn from_page(page: &Page, expected_page_size: u16) -> Result<MetaPage> {
        if !page.flags().contains(PageFlags::META) {
            return Err(Error::corrupt_at("expected a meta page", page.pgno()));
        }
        let buf = page.as_bytes();
        let mut off = HEADER_SIZE;
        if off + META_BODY_SIZE > buf.len() {
            return Err(Error::corrupt_at("meta page truncated", page.pgno()));
        }

        let magic = LittleEndian::read_u32(&buf[off..]);
        if magic != MAGIC {
            return Err(Error::corrupt_at(
                format!("bad meta magic 0x{magic:08x}"),
                page.pgno(),
            ));
        }
        let body_start = off;
        off += 4;
        let page_size = LittleEndian::read_u16(&buf[off..]);
        off += 2;
        off += 1; // reserved
        let format_major = buf[off];
        off += 1;
        let format_minor = buf[off];
        off += 1;
        let txn_id = TransactionId(LittleEndian::read_u64(&buf[off..]));
        off += 8;
        let freelist_root = PageId(LittleEndian::read_u32(&buf[off..]));
        off += 4;

        let mut dbis = [DbiSlot::EMPTY; MAX_DBI];
        for slot in dbis.iter_mut() {
            let root = PageId(LittleEndian::read_u32(&buf[off..]));
            off += 4;
            let entries = LittleEndian::read_u64(&buf[off..]);
            off += 8;
            let flags = buf[off];
            off += 1;
            *slot = DbiSlot { root, entries, flags };
        }

        let stored_checksum = LittleEndian::read_u32(&buf[off..]);
        let computed = crc32fast::hash(&buf[body_start..off]);
        if stored_checksum != computed {
            return Err(Error::corrupt_at("meta page checksum mismatch", page.pgno()));
        }

        let meta = MetaPage { page_size, format_major, format_minor, txn_id, freelist_root, dbis };
        meta.validate(expected_page_size)?;
        Ok(meta)
    }
}

/// Given two candidate meta pages (one of which may be absent/corrupt),
/// pick the current one: the valid meta with the higher transaction id.
pub fn choose_current(
    a: Result<MetaPage>,
    b: Result<MetaPage>,
) -> Result<(MetaPage, PageId)> {
    match (a, b) {
        (Ok(ma), Ok(mb)) => {
            if ma.txn_id >= mb.txn_id {
                Ok((ma, META_PAGE_1))
            } else {
                Ok((mb, META_PAGE_2))
            }
        }
        (Ok(ma), Err(_)) => Ok((ma, META_PAGE_1)),
        (Err(_), Ok(mb)) => Ok((mb, META_PAGE_2)),
        (Err(e), Err(_)) => Err(e),
    }
}

/// Given the page id of the currently-published meta, the slot the next
/// writer should publish into.
pub fn other_slot(current: PageId) -> PageId {
    if current == META_PAGE_1 {
        META_PAGE_2
    } else {
        META_PAGE_1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_meta_roundtrips() {
        let meta = MetaPage::fresh(4096);
        let page = meta.to_page(META_PAGE_1, 4096);
        let decoded = MetaPage::from_page(&page, 4096).unwrap();
        assert_eq!(decoded.txn_id, TransactionId(0));
        assert_eq!(decoded.page_size, 4096);
        assert!(decoded.dbis.iter().all(|s| !s.in_use()));
    }

    #[test]
    fn tampered_checksum_is_rejected() {
        let meta = MetaPage::fresh(4096);
        let mut page = meta.to_page(META_PAGE_1, 4096);
        let last = page.as_bytes().len() - 1;
        page.as_bytes_mut()[last - 200] ^= 0xFF;
        assert!(MetaPage::from_page(&page, 4096).is_err());
    }

    #[test]
    fn wrong_page_size_is_corrupt() {
        let meta = MetaPage::fresh(4096);
        let page = meta.to_page(META_PAGE_1, 4096);
        assert!(MetaPage::from_page(&page, 8192).is_err());
    }

    #[test]
    fn choose_current_prefers_higher_txn_id() {
        let mut m1 = MetaPage::fresh(4096);
        m1.txn_id = TransactionId(5);
        let mut m2 = MetaPage::fresh(4096);
        m2.txn_id = TransactionId(7);
        let (chosen, slot) = choose_current(Ok(m1), Ok(m2)).unwrap();
        assert_eq!(chosen.txn_id, TransactionId(7));
        assert_eq!(slot, META_PAGE_2);
    }

    #[test]
    fn choose_current_falls_back_to_the_valid_one() {
        let m1 = MetaPage::fresh(4096);
        let (chosen, slot) = choose_current(Ok(m1), Err(Error::corrupt("bad"))).unwrap();
        assert_eq!(chosen.txn_id, TransactionId(0));
        assert_eq!(slot, META_PAGE_1);
    }

    #[test]
    fn other_slot_alternates() {
        assert_eq!(other_slot(META_PAGE_1), META_PAGE_2);
        assert_eq!(other_slot(META_PAGE_2), META_PAGE_1);
    }
}
