//! The nested atomic context stack (spec §4.7).
//!
//! A stack of frames, each holding an ordered read set, write set, and
//! intent set. Grounded on the teacher's nested-transaction overlay/merge
//! idiom (`txn.rs`'s `commit_nested`/`abort_nested`, see `DESIGN.md` Open
//! Question 4) generalized one layer up: instead of staging directly
//! against B+tree roots, a frame stages against a durable read-only
//! snapshot and is only ever translated into real `put`/`del` calls by the
//! attempt engine's root commit (spec §4.8).

use crate::db::Dbi;
use crate::error::{Error, Result};
use crate::txn::{Read, Transaction};

/// One staged mutation in a frame's write set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum WriteKind {
    Put(Vec<u8>),
    Del,
}

/// A deferred side effect, published only after a successful root commit
/// (spec §4.7 "Invariant").
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intent {
    /// Append `bytes` to the outbox.
    OutboxEmit {
        /// The message bytes to append.
        bytes: Vec<u8>,
    },
    /// Arm a timer due at `due_ts`.
    TimerArm {
        /// The due timestamp (opaque to the stack; interpreted by the
        /// mailbox's timer encoding).
        due_ts: i64,
        /// The timer's payload bytes.
        bytes: Vec<u8>,
    },
}

#[derive(Default)]
struct Frame {
    reads: Vec<(Dbi, Vec<u8>, Option<Vec<u8>>)>,
    writes: Vec<(Dbi, Vec<u8>, WriteKind)>,
    intents: Vec<Intent>,
}

/// A handler's view onto the nested atomic context stack plus the read-only
/// snapshot its bottommost frame falls back to (spec §4.7, §4.8 step 2-3).
pub struct AtomicStack<'txn, 'db> {
    frames: Vec<Frame>,
    snapshot: &'txn mut Transaction<'db, Read>,
}

impl<'txn, 'db> AtomicStack<'txn, 'db> {
    pub(crate) fn new(snapshot: &'txn mut Transaction<'db, Read>) -> Self {
        AtomicStack { frames: vec![Frame::default()], snapshot }
    }

    /// Current nesting depth (1 = root frame only).
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Push an empty frame. Writes staged after this call are isolated
    /// until [`AtomicStack::commit_top`] or [`AtomicStack::abort_top`].
    pub fn push_frame(&mut self) {
        self.frames.push(Frame::default());
    }

    /// Merge the top frame into its parent: child writes override parent
    /// writes on the same `(dbi, key)`, child reads extend the parent's
    /// read set, and child intents are appended after the parent's own
    /// (spec §4.7 "commit_top", §5 "nested `commit_top` preserves
    /// child-local order appended after parent-local order"). Requires
    /// depth >= 2.
    pub fn commit_top(&mut self) -> Result<()> {
        if self.frames.len() < 2 {
            return Err(Error::Busy("commit_top requires nesting depth >= 2"));
        }
        let child = self.frames.pop().unwrap();
        let parent = self.frames.last_mut().unwrap();
        parent.reads.extend(child.reads);
        parent.writes.extend(child.writes);
        parent.intents.extend(child.intents);
        Ok(())
    }

    /// Pop and discard the top frame, along with everything it staged.
    /// Requires depth >= 1.
    pub fn abort_top(&mut self) -> Result<()> {
        if self.frames.is_empty() {
            return Err(Error::Busy("no frame to abort"));
        }
        self.frames.pop();
        Ok(())
    }

    /// Resolve `key`'s value (spec §4.7 "Read resolution"): scan write sets
    /// top-down, then read sets top-down, then fall back to the durable
    /// snapshot and cache the result in the bottommost frame.
    pub fn get(&mut self, dbi: Dbi, key: &[u8]) -> Result<Option<Vec<u8>>> {
        for frame in self.frames.iter().rev() {
            for (d, k, kind) in frame.writes.iter().rev() {
                if *d == dbi && k.as_slice() == key {
                    return Ok(match kind {
                        WriteKind::Put(v) => Some(v.clone()),
                        WriteKind::Del => None,
                    });
                }
            }
        }
        for frame in self.frames.iter().rev() {
            for (d, k, v) in frame.reads.iter().rev() {
                if *d == dbi && k.as_slice() == key {
                    return Ok(v.clone());
                }
            }
        }
        let value = self.snapshot.get(dbi, key)?;
        self.frames.first_mut().unwrap().reads.push((dbi, key.to_vec(), value.clone()));
        Ok(value)
    }

    /// Stage a put against the top frame.
    pub fn put(&mut self, dbi: Dbi, key: &[u8], value: &[u8]) {
        self.frames.last_mut().unwrap().writes.push((dbi, key.to_vec(), WriteKind::Put(value.to_vec())));
    }

    /// Stage a delete against the top frame.
    pub fn del(&mut self, dbi: Dbi, key: &[u8]) {
        self.frames.last_mut().unwrap().writes.push((dbi, key.to_vec(), WriteKind::Del));
    }

    /// Stage an outbox-emit intent against the top frame.
    pub fn emit_outbox(&mut self, bytes: impl Into<Vec<u8>>) {
        self.frames.last_mut().unwrap().intents.push(Intent::OutboxEmit { bytes: bytes.into() });
    }

    /// Stage a timer-arm intent against the top frame.
    pub fn arm_timer(&mut self, due_ts: i64, bytes: impl Into<Vec<u8>>) {
        self.frames.last_mut().unwrap().intents.push(Intent::TimerArm { due_ts, bytes: bytes.into() });
    }

    /// Consume the stack, returning the root frame's write set, read set,
    /// and intent list in insertion order (spec §4.7 "Root commit
    /// preconditions"). Fails with [`Error::Busy`] unless depth == 1.
    pub(crate) fn into_root(
        mut self,
    ) -> Result<(Vec<(Dbi, Vec<u8>, WriteKind)>, Vec<(Dbi, Vec<u8>, Option<Vec<u8>>)>, Vec<Intent>)> {
        if self.frames.len() != 1 {
            return Err(Error::Busy("root commit requires nesting depth == 1"));
        }
        let root = self.frames.pop().unwrap();
        Ok((root.writes, root.reads, root.intents))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::PutFlags;
    use crate::db::DbBuilder;

    fn seeded_db() -> crate::db::Database {
        let db = DbBuilder::new().build().unwrap();
        let mut txn = db.begin_write().unwrap();
        let dbi = txn.create_dbi(0, false).unwrap();
        txn.put(dbi, b"x", b"outer-seed", PutFlags::empty()).unwrap();
        txn.commit().unwrap();
        db
    }

    #[test]
    fn nested_commit_merges_writes_and_intents_in_order() {
        let db = seeded_db();
        let dbi = Dbi(0);
        let mut snapshot = db.begin_read().unwrap();
        let mut stack = AtomicStack::new(&mut snapshot);

        stack.put(dbi, b"x", b"outer");
        stack.push_frame();
        stack.put(dbi, b"y", b"child");
        stack.emit_outbox(b"evt".to_vec());
        stack.commit_top().unwrap();

        assert_eq!(stack.depth(), 1);
        assert_eq!(stack.get(dbi, b"x").unwrap(), Some(b"outer".to_vec()));
        assert_eq!(stack.get(dbi, b"y").unwrap(), Some(b"child".to_vec()));

        let (writes, _reads, intents) = stack.into_root().unwrap();
        assert_eq!(writes.len(), 2);
        assert_eq!(intents.len(), 1);
        assert!(matches!(&intents[0], Intent::OutboxEmit { bytes } if bytes == b"evt"));
    }

    #[test]
    fn nested_abort_leaves_parent_reads_and_writes_untouched() {
        let db = seeded_db();
        let dbi = Dbi(0);
        let mut snapshot = db.begin_read().unwrap();
        let mut stack = AtomicStack::new(&mut snapshot);

        stack.put(dbi, b"x", b"outer");
        stack.push_frame();
        stack.put(dbi, b"x", b"child-overwrite");
        stack.put(dbi, b"z", b"child-only");
        stack.abort_top().unwrap();

        assert_eq!(stack.get(dbi, b"x").unwrap(), Some(b"outer".to_vec()));
        assert_eq!(stack.get(dbi, b"z").unwrap(), None);
    }

    #[test]
    fn get_falls_back_to_durable_snapshot_and_caches() {
        let db = seeded_db();
        let dbi = Dbi(0);
        let mut snapshot = db.begin_read().unwrap();
        let mut stack = AtomicStack::new(&mut snapshot);
        assert_eq!(stack.get(dbi, b"x").unwrap(), Some(b"outer-seed".to_vec()));
        let (_, reads, _) = stack.into_root().unwrap();
        assert_eq!(reads, vec![(dbi, b"x".to_vec(), Some(b"outer-seed".to_vec()))]);
    }

    #[test]
    fn root_commit_rejects_nonzero_nesting() {
        let db = seeded_db();
        let mut snapshot = db.begin_read().unwrap();
        let mut stack = AtomicStack::new(&mut snapshot);
        stack.push_frame();
        assert!(stack.into_root().is_err());
    }

    #[test]
    fn del_shadows_earlier_put_in_same_scan() {
        let db = seeded_db();
        let dbi = Dbi(0);
        let mut snapshot = db.begin_read().unwrap();
        let mut stack = AtomicStack::new(&mut snapshot);
        stack.put(dbi, b"x", b"outer");
        stack.del(dbi, b"x");
        assert_eq!(stack.get(dbi, b"x").unwrap(), None);
    }
}
