//! Sapling: an embedded copy-on-write B+tree storage engine (spec §3-§4.6)
//! with a durable transactional dispatch runner built on top of it (spec
//! §4.7-§4.10).
//!
//! The storage engine gives single-writer/multi-reader snapshot isolation
//! over a single memory-mapped (or in-memory) file, using the dual
//! alternating meta-page scheme: [`db::Database`] opens it,
//! [`txn::Transaction`] reads and writes it, and [`checkpoint`] freezes or
//! restores a consistent copy of it. The runner stages a guest handler's
//! reads, writes, and side-effecting intents through
//! [`runner::atomic::AtomicStack`], commits them with bounded-retry
//! optimism via [`runner::attempt::run_attempt`], and dispatches them off
//! the fixed-DBI mailbox in [`runner::mailbox`] under the poll loop in
//! [`runner::worker`].

pub mod btree;
pub mod checkpoint;
pub mod checksum;
pub mod comparator;
pub mod cursor;
pub mod db;
pub mod dupsort;
pub mod error;
pub mod freelist;
pub mod meta;
pub mod overflow;
pub mod page;
pub mod page_store;
pub mod reader;
pub mod runner;
pub mod txn;

// Re-exports
pub use crate::comparator::{Comparator, ComparatorHandle};
pub use crate::db::{Database, DbBuilder, Dbi, DbiFlags};
pub use crate::error::{Error, PageId, Result, TransactionId};
pub use crate::txn::{Read, Transaction, Write};

/// A read-only transaction.
pub type RoTxn<'db> = Transaction<'db, Read>;
/// A read-write transaction.
pub type RwTxn<'db> = Transaction<'db, Write>;
