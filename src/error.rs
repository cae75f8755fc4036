//! Error types for sapling.

use std::fmt;
use std::io;
use thiserror::Error;

/// The result type used throughout sapling.
pub type Result<T> = std::result::Result<T, Error>;

/// The sapling error type.
///
/// Every fallible storage-engine or runner operation returns one of these
/// variants. The numeric mapping in [`Error::status_code`] is the stable
/// on-the-wire-nowhere-but-API contract from the spec (`ok(0)` ..
/// `conflict(7)`).
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// Lookup of an absent key, or an absent cursor position.
    #[error("not found")]
    NotFound,

    /// Unclassified failure: allocation failure, poisoned lock, I/O error.
    #[error("error: {0}")]
    Other(String),

    /// A key+value cannot be made to fit on a page, even via overflow pages.
    #[error("full: {0}")]
    Full(&'static str),

    /// Mutation attempted against a read-only transaction.
    #[error("read-only transaction")]
    ReadOnly,

    /// Writer contention, or an operation attempted at the wrong nesting depth.
    #[error("busy: {0}")]
    Busy(&'static str),

    /// A no-overwrite collision, or a duplicate watcher registration.
    #[error("already exists")]
    Exists,

    /// CAS mismatch, lease takeover rejected, or a root read-set invalidated.
    #[error("conflict: {0}")]
    Conflict(&'static str),

    /// On-disk checksum/magic failure, length mismatch, or a corrupt graph.
    #[error("corrupt: {details}")]
    Corrupt {
        /// Human-readable description of what was found wrong.
        details: String,
        /// The page where the corruption was detected, if known.
        page_id: Option<PageId>,
    },

    /// A decoded envelope's minor version is unrecognised.
    #[error("unsupported version: {0}")]
    Version(String),
}

impl Error {
    /// Build a [`Error::Corrupt`] with no known offending page.
    pub fn corrupt(details: impl Into<String>) -> Self {
        Error::Corrupt { details: details.into(), page_id: None }
    }

    /// Build a [`Error::Corrupt`] naming the offending page.
    pub fn corrupt_at(details: impl Into<String>, page_id: PageId) -> Self {
        Error::Corrupt { details: details.into(), page_id: Some(page_id) }
    }

    /// Whether the attempt engine should retry a handler that produced this
    /// error (spec §4.8: only `busy` and `conflict` are retryable).
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Busy(_) | Error::Conflict(_))
    }

    /// The stable numeric status code from spec §6.
    pub fn status_code(&self) -> i32 {
        match self {
            Error::NotFound => 1,
            Error::Other(_) => 2,
            Error::Full(_) => 3,
            Error::ReadOnly => 4,
            Error::Busy(_) => 5,
            Error::Exists => 6,
            Error::Conflict(_) => 7,
            Error::Corrupt { .. } => 8,
            Error::Version(_) => 9,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Other(err.to_string())
    }
}

/// A numeric page identifier, stable for the lifetime of the containing DB.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PageId(pub u32);

impl PageId {
    /// The invalid/sentinel page id, used for "no page" references (e.g. an
    /// empty DBI root, or the tail of a singly linked overflow chain).
    pub const NONE: PageId = PageId(0xFFFF_FFFF);

    /// Whether this is the sentinel "no page" id.
    pub fn is_none(self) -> bool {
        self == Self::NONE
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A monotonically increasing write-transaction identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TransactionId(pub u64);

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The tag recorded in a page header identifying its role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageType {
    /// Database metadata (one of the two alternating meta pages).
    Meta,
    /// Internal B+tree node (separators + child page ids).
    Branch,
    /// Leaf B+tree node (keys + inline/overflow values).
    Leaf,
    /// A page (or link in a chain) holding an oversized value.
    Overflow,
    /// A page on the free list, awaiting reuse.
    Free,
}
