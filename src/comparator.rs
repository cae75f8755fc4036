//! Key ordering.
//!
//! Every DBI has a comparator deciding the sort order its keys (and, for
//! DUPSORT databases, its values) are stored and searched under. The
//! default is byte-lexicographic; callers may install a custom comparator
//! per DBI. Per spec §9's "dynamic dispatch -> capability records"
//! translation, a custom comparator is a boxed trait object rather than a
//! vtable the original's arena indexed into — `Arc<dyn Comparator>` is the
//! idiomatic Rust realization of that capability record.

use std::cmp::Ordering;
use std::sync::Arc;

/// A key (and DUPSORT value) ordering.
///
/// Implementations must be a total order and must be stable for the
/// lifetime of the database: changing a DBI's comparator after it has
/// stored keys under the old order corrupts the tree's sortedness
/// invariant (spec §3).
pub trait Comparator: Send + Sync {
    /// Compare two byte strings, in the style of [`Ord::cmp`].
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering;
}

/// The default comparator: plain byte-lexicographic order.
#[derive(Debug, Clone, Copy, Default)]
pub struct LexicographicComparator;

impl Comparator for LexicographicComparator {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }
}

/// A comparator backed by an arbitrary closure, for callers who want a
/// custom order (e.g. integer keys in native byte order) without defining
/// a named type.
pub struct FnComparator<F>(pub F)
where
    F: Fn(&[u8], &[u8]) -> Ordering + Send + Sync;

impl<F> Comparator for FnComparator<F>
where
    F: Fn(&[u8], &[u8]) -> Ordering + Send + Sync,
{
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        (self.0)(a, b)
    }
}

/// A shareable handle to a comparator, cheap to clone and pass into every
/// DBI handle and cursor that needs it.
pub type ComparatorHandle = Arc<dyn Comparator>;

/// Build a comparator handle for the default byte-lexicographic order.
pub fn lexicographic() -> ComparatorHandle {
    Arc::new(LexicographicComparator)
}

/// Reversed byte-lexicographic order, useful for keys meant to iterate
/// most-recent-first (e.g. a timer DBI keyed by `!deadline`).
#[derive(Debug, Clone, Copy, Default)]
pub struct ReverseLexicographicComparator;

impl Comparator for ReverseLexicographicComparator {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        b.cmp(a)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lexicographic_orders_bytes() {
        let cmp = LexicographicComparator;
        assert_eq!(cmp.compare(b"a", b"b"), Ordering::Less);
        assert_eq!(cmp.compare(b"b", b"a"), Ordering::Greater);
        assert_eq!(cmp.compare(b"a", b"a"), Ordering::Equal);
        assert_eq!(cmp.compare(b"ab", b"a"), Ordering::Greater);
    }

    #[test]
    fn reverse_lexicographic_inverts_order() {
        let cmp = ReverseLexicographicComparator;
        assert_eq!(cmp.compare(b"a", b"b"), Ordering::Greater);
    }

    #[test]
    fn fn_comparator_wraps_closure() {
        let cmp = FnComparator(|a: &[u8], b: &[u8]| a.len().cmp(&b.len()));
        assert_eq!(cmp.compare(b"aa", b"b"), Ordering::Greater);
    }
}
