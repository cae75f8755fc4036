//! The bounded-retry attempt engine (spec §4.8).
//!
//! Drives `atomic_fn` against a fresh read snapshot each round, validates
//! and applies its staged writes against a real write transaction, and
//! drains its intents through a caller-supplied sink. Grounded on the
//! teacher's `txn.rs` retry/commit idiom (single writer gate, snapshot
//! re-acquired per attempt) generalized to the staged-write/intent model
//! of [`crate::runner::atomic`].

use crate::btree::PutFlags;
use crate::db::Database;
use crate::error::{Error, Result};
use crate::runner::atomic::{AtomicStack, Intent, WriteKind};
use std::time::Duration;

/// Environment knobs for the attempt engine (spec §6 "Environment knobs").
#[derive(Debug, Clone, Copy)]
pub struct AttemptConfig {
    /// Maximum number of retries after the first attempt.
    pub retry_max: u32,
    /// Initial backoff, in microseconds.
    pub initial_backoff_us: u64,
    /// Backoff ceiling, in microseconds.
    pub max_backoff_us: u64,
}

impl Default for AttemptConfig {
    fn default() -> Self {
        AttemptConfig { retry_max: 8, initial_backoff_us: 1_000, max_backoff_us: 250_000 }
    }
}

/// A pluggable sleep hook (spec §9 "capability records"), so tests can
/// supply a fake clock instead of actually blocking.
pub trait SleepHook: Send + Sync {
    /// Called with the computed backoff, in microseconds.
    fn sleep(&self, micros: u64);
}

/// The real-time sleep hook used outside of tests.
pub struct RealSleep;

impl SleepHook for RealSleep {
    fn sleep(&self, micros: u64) {
        std::thread::sleep(Duration::from_micros(micros));
    }
}

/// Per-round-trip statistics, reported to the caller regardless of the
/// final outcome (spec §4.8 "Stats").
#[derive(Debug, Clone, Default)]
pub struct AttemptStats {
    /// Total number of read-phase attempts made (including the first).
    pub attempts: u32,
    /// Total number of retries taken.
    pub retries: u32,
    /// Retries attributed to `busy`.
    pub busy_retries: u32,
    /// Retries attributed to `conflict`.
    pub conflict_retries: u32,
    /// The status code of the last attempt (spec §6 numeric contract).
    pub last_status: i32,
}

/// Run `atomic_fn` to completion: optimistic read phase, validate/apply
/// write phase, intent drain, with bounded exponential-backoff retry on
/// `busy`/`conflict` (spec §4.8).
///
/// `atomic_fn` stages reads, writes, and intents against the [`AtomicStack`]
/// it's given; it must be safely re-runnable, since a retry discards its
/// prior staging and calls it again from scratch against a fresh snapshot.
/// `sink` is invoked once per root intent, in insertion order, after a
/// successful commit; the first sink failure becomes the call's result
/// (the commit itself is not rolled back).
pub fn run_attempt(
    db: &Database,
    config: &AttemptConfig,
    sleep: &dyn SleepHook,
    mut atomic_fn: impl FnMut(&mut AtomicStack) -> Result<()>,
    mut sink: impl FnMut(&Intent) -> Result<()>,
) -> (Result<()>, AttemptStats) {
    let mut stats = AttemptStats::default();
    let mut backoff = config.initial_backoff_us;

    loop {
        stats.attempts += 1;

        let read_phase: Result<(Vec<_>, Vec<_>, Vec<_>)> = (|| {
            let mut snapshot = db.begin_read()?;
            let mut stack = AtomicStack::new(&mut snapshot);
            atomic_fn(&mut stack)?;
            stack.into_root()
        })();

        let (writes, reads, intents) = match read_phase {
            Ok(staged) => staged,
            Err(e) => {
                if retry(&mut stats, &e, config, sleep, &mut backoff) {
                    continue;
                }
                stats.last_status = e.status_code();
                return (Err(e), stats);
            }
        };

        let write_phase: Result<()> = (|| {
            let mut wtxn = db.begin_write()?;
            for (dbi, key, expected) in &reads {
                let current = wtxn.get(*dbi, key)?;
                if current.as_ref() != expected.as_ref() {
                    return Err(Error::Conflict("root read set invalidated"));
                }
            }
            for (dbi, key, kind) in &writes {
                match kind {
                    WriteKind::Put(value) => {
                        wtxn.put(*dbi, key, value, PutFlags::empty())?;
                    }
                    WriteKind::Del => match wtxn.del(*dbi, key) {
                        Ok(_) | Err(Error::NotFound) => {}
                        Err(e) => return Err(e),
                    },
                }
            }
            wtxn.commit()?;
            Ok(())
        })();

        if let Err(e) = write_phase {
            if retry(&mut stats, &e, config, sleep, &mut backoff) {
                continue;
            }
            stats.last_status = e.status_code();
            return (Err(e), stats);
        }

        stats.last_status = 0;
        for intent in &intents {
            if let Err(e) = sink(intent) {
                stats.last_status = e.status_code();
                return (Err(e), stats);
            }
        }
        return (Ok(()), stats);
    }
}

/// Record a retryable failure and sleep, or report that retries are
/// exhausted / the error is terminal. Returns whether the caller should
/// retry the loop.
fn retry(stats: &mut AttemptStats, e: &Error, config: &AttemptConfig, sleep: &dyn SleepHook, backoff: &mut u64) -> bool {
    if !e.is_retryable() || stats.retries >= config.retry_max {
        return false;
    }
    stats.retries += 1;
    match e {
        Error::Busy(_) => stats.busy_retries += 1,
        Error::Conflict(_) => stats.conflict_retries += 1,
        _ => {}
    }
    sleep.sleep(*backoff);
    *backoff = backoff.saturating_mul(2).min(config.max_backoff_us);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{DbBuilder, Dbi};
    use std::cell::Cell;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NoopSleep;
    impl SleepHook for NoopSleep {
        fn sleep(&self, _micros: u64) {}
    }

    struct CountingSleep(AtomicUsize);
    impl SleepHook for CountingSleep {
        fn sleep(&self, _micros: u64) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn dbi0_db() -> crate::db::Database {
        let db = DbBuilder::new().build().unwrap();
        let mut txn = db.begin_write().unwrap();
        txn.create_dbi(0, false).unwrap();
        txn.commit().unwrap();
        db
    }

    #[test]
    fn always_succeeds_commits_once_and_delivers_intents_in_order() {
        let db = dbi0_db();
        let dbi = Dbi(0);
        let delivered = Cell::new(Vec::new());

        let (result, stats) = run_attempt(
            &db,
            &AttemptConfig::default(),
            &NoopSleep,
            |stack| {
                stack.put(dbi, b"k", b"v");
                stack.emit_outbox(b"first".to_vec());
                stack.emit_outbox(b"second".to_vec());
                Ok(())
            },
            |intent| {
                if let Intent::OutboxEmit { bytes } = intent {
                    let mut v = delivered.take();
                    v.push(bytes.clone());
                    delivered.set(v);
                }
                Ok(())
            },
        );

        assert!(result.is_ok());
        assert_eq!(stats.attempts, 1);
        assert_eq!(stats.retries, 0);
        assert_eq!(delivered.take(), vec![b"first".to_vec(), b"second".to_vec()]);

        let mut read = db.begin_read().unwrap();
        assert_eq!(read.get(dbi, b"k").unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn retries_on_conflict_then_succeeds() {
        let db = dbi0_db();
        let dbi = Dbi(0);
        {
            let mut txn = db.begin_write().unwrap();
            txn.put(dbi, b"state", b"seed", PutFlags::empty()).unwrap();
            txn.commit().unwrap();
        }

        let call_count = Cell::new(0u32);
        let sleeps = CountingSleep(AtomicUsize::new(0));

        let (result, stats) = run_attempt(
            &db,
            &AttemptConfig::default(),
            &sleeps,
            |stack| {
                let n = call_count.get() + 1;
                call_count.set(n);
                let _ = stack.get(dbi, b"state")?;
                stack.put(dbi, b"state", b"done");
                stack.emit_outbox(b"done".to_vec());
                if n == 1 {
                    // Simulate a concurrent writer racing ahead of this
                    // attempt's read phase.
                    let mut side = db.begin_write().unwrap();
                    side.put(dbi, b"state", b"other", PutFlags::empty()).unwrap();
                    side.commit().unwrap();
                }
                Ok(())
            },
            |_intent| Ok(()),
        );

        assert!(result.is_ok());
        assert_eq!(stats.attempts, 2);
        assert_eq!(stats.retries, 1);
        assert_eq!(stats.conflict_retries, 1);
        assert_eq!(sleeps.0.load(Ordering::SeqCst), 1);

        let mut read = db.begin_read().unwrap();
        assert_eq!(read.get(dbi, b"state").unwrap(), Some(b"done".to_vec()));
    }

    #[test]
    fn non_retryable_handler_error_surfaces_immediately() {
        let db = dbi0_db();
        let (result, stats) = run_attempt(
            &db,
            &AttemptConfig::default(),
            &NoopSleep,
            |_stack| Err(Error::Full("no room")),
            |_intent| Ok(()),
        );
        assert!(matches!(result, Err(Error::Full(_))));
        assert_eq!(stats.attempts, 1);
        assert_eq!(stats.retries, 0);
    }

    #[test]
    fn sink_failure_surfaces_without_rolling_back_commit() {
        let db = dbi0_db();
        let dbi = Dbi(0);
        let (result, _stats) = run_attempt(
            &db,
            &AttemptConfig::default(),
            &NoopSleep,
            |stack| {
                stack.put(dbi, b"k", b"v");
                stack.emit_outbox(b"evt".to_vec());
                Ok(())
            },
            |_intent| Err(Error::Other("sink down".into())),
        );
        assert!(result.is_err());

        let mut read = db.begin_read().unwrap();
        assert_eq!(read.get(dbi, b"k").unwrap(), Some(b"v".to_vec()));
    }
}
