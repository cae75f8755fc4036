//! Overflow page chains for oversized values.
//!
//! A value whose length exceeds [`inline_threshold`] is not stored inline
//! in its leaf node; instead the node's value bytes become a 4-byte
//! overflow chain head id, and the actual bytes are split across a singly
//! linked chain of `OVERFLOW`-flagged pages. The chain reuses the page
//! header's own `next_pgno` link and `overflow_count` field (set on the
//! head page only) rather than a second embedded header.

use crate::error::{PageId, Result};
use crate::page::{Page, PageFlags, HEADER_SIZE};

/// A value larger than this fraction of the page size is stored as an
/// overflow chain rather than inline in its leaf node.
pub fn inline_threshold(page_size: usize) -> usize {
    page_size / 4
}

/// Write `value` to a freshly allocated chain of overflow pages. `alloc`
/// allocates and returns the id of a new page; the caller's transaction
/// gives out the actual page id (so it can account for COW/free-list
/// bookkeeping). Returns the id of the chain's head page and the
/// populated pages in chain order, ready for the caller to persist via
/// its page store.
pub fn write_value(
    page_size: usize,
    txn_id: crate::error::TransactionId,
    value: &[u8],
    alloc: &mut dyn FnMut() -> Result<PageId>,
) -> Result<(PageId, Vec<Page>)> {
    let data_per_page = page_size - HEADER_SIZE;
    debug_assert!(data_per_page > 0);
    let num_pages = value.len().div_ceil(data_per_page).max(1);

    let mut ids = Vec::with_capacity(num_pages);
    for _ in 0..num_pages {
        ids.push(alloc()?);
    }

    let mut pages = Vec::with_capacity(num_pages);
    let mut offset = 0usize;
    for (i, &id) in ids.iter().enumerate() {
        let mut page = Page::new(page_size, id, PageFlags::OVERFLOW, txn_id);
        let chunk_len = data_per_page.min(value.len() - offset);
        let buf = page.as_bytes_mut();
        buf[HEADER_SIZE..HEADER_SIZE + chunk_len]
            .copy_from_slice(&value[offset..offset + chunk_len]);
        offset += chunk_len;

        if i == 0 {
            page.set_overflow_count(value.len() as u32);
        }
        let next = ids.get(i + 1).copied().unwrap_or(PageId::NONE);
        page.set_next_pgno(next);
        pages.push(page);
    }

    Ok((ids[0], pages))
}

/// Re-materialize a value from its overflow chain head.
pub fn read_value(head: PageId, read_page: &dyn Fn(PageId) -> Result<Page>) -> Result<Vec<u8>> {
    let first = read_page(head)?;
    let total_size = first.overflow_count() as usize;
    let mut out = Vec::with_capacity(total_size);

    let mut current = Some(first);
    while let Some(page) = current {
        let remaining = total_size - out.len();
        let buf = page.as_bytes();
        let data = &buf[HEADER_SIZE..];
        let take = remaining.min(data.len());
        out.extend_from_slice(&data[..take]);

        let next = page.next_pgno();
        current = if next.is_none() { None } else { Some(read_page(next)?) };
    }
    Ok(out)
}

/// Walk an overflow chain collecting every page id in it, for callers that
/// need to free the whole chain (e.g. a value replaced or deleted).
pub fn chain_pages(head: PageId, read_page: &dyn Fn(PageId) -> Result<Page>) -> Result<Vec<PageId>> {
    let mut ids = Vec::new();
    let mut current = head;
    while !current.is_none() {
        ids.push(current);
        let page = read_page(current)?;
        current = page.next_pgno();
    }
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransactionId;
    use std::collections::HashMap;

    fn store_of(pages: Vec<Page>) -> HashMap<PageId, Page> {
        pages.into_iter().map(|p| (p.pgno(), p)).collect()
    }

    #[test]
    fn small_value_fits_one_page() {
        let mut next_id = 0u32;
        let mut alloc = || {
            let id = PageId(next_id);
            next_id += 1;
            Ok(id)
        };
        let value = vec![0xAB; 10];
        let (head, pages) = write_value(512, TransactionId(1), &value, &mut alloc).unwrap();
        assert_eq!(pages.len(), 1);
        let store = store_of(pages);
        let read_back = read_value(head, &|id| Ok(store[&id].clone())).unwrap();
        assert_eq!(read_back, value);
    }

    #[test]
    fn large_value_spans_multiple_pages() {
        let mut next_id = 0u32;
        let mut alloc = || {
            let id = PageId(next_id);
            next_id += 1;
            Ok(id)
        };
        let value: Vec<u8> = (0..2000u32).map(|i| (i % 251) as u8).collect();
        let (head, pages) = write_value(256, TransactionId(1), &value, &mut alloc).unwrap();
        assert!(pages.len() > 1);
        let store = store_of(pages);
        let read_back = read_value(head, &|id| Ok(store[&id].clone())).unwrap();
        assert_eq!(read_back, value);
    }

    #[test]
    fn chain_pages_enumerates_every_link() {
        let mut next_id = 0u32;
        let mut alloc = || {
            let id = PageId(next_id);
            next_id += 1;
            Ok(id)
        };
        let value: Vec<u8> = vec![1; 1000];
        let (head, pages) = write_value(256, TransactionId(1), &value, &mut alloc).unwrap();
        let expected = pages.len();
        let store = store_of(pages);
        let ids = chain_pages(head, &|id| Ok(store[&id].clone())).unwrap();
        assert_eq!(ids.len(), expected);
    }
}
