//! Worker shell poll loop (spec §4.10).
//!
//! Each tick drains due timers into the worker's own inbox, claims the
//! oldest claimable inbox entry, and dispatches it through the bounded-retry
//! attempt engine. Success acks the message; a retryable failure requeues it
//! immediately for the next worker to pick up (spec's retry budget lives in
//! [`crate::runner::attempt`], not here — see `DESIGN.md` Open Question 1);
//! a handler failure past `max_attempts` is parked in the dead-letter DBI.
//! Grounded on the poll-then-dispatch shape of other_examples' index worker,
//! generalized from its async task-stream idiom to this crate's synchronous,
//! thread-based worker loop.

use crate::db::Database;
use crate::error::{Error, Result};
use crate::runner::attempt::{run_attempt, AttemptConfig, RealSleep, SleepHook};
use crate::runner::atomic::{AtomicStack, Intent};
use crate::runner::frame::MessageFrame;
use crate::runner::mailbox;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, info, warn};

/// A source of the current time, in the same unit as message/timer
/// timestamps (milliseconds since an arbitrary but consistent epoch). A
/// capability record (spec §9) so tests can drive the clock deterministically.
pub trait Clock: Send + Sync {
    /// The current time.
    fn now(&self) -> i64;
}

/// The real wall-clock time source used outside of tests.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    }
}

/// Environment knobs for a single worker (spec §6 "Environment knobs").
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// This worker's identity; also its inbox/timer partition key.
    pub worker_id: u64,
    /// How long a claimed message is leased before it's reclaimable by
    /// another dispatch attempt.
    pub lease_ms: i64,
    /// Delivery attempts (including the first) allowed before a message is
    /// moved to the dead-letter DBI instead of requeued.
    pub max_attempts: u32,
    /// How long to sleep, in microseconds, when a poll tick finds nothing
    /// to do.
    pub idle_sleep_us: u64,
    /// Upper bound on due timers promoted to the inbox in a single tick
    /// (spec §4.9 `timer_drain_due`'s `max`), so a timer flood can't make
    /// one tick do unbounded work.
    pub timer_batch_max: usize,
    /// Retry policy handed to the attempt engine for each dispatched
    /// message.
    pub attempt: AttemptConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig {
            worker_id: 0,
            lease_ms: 30_000,
            max_attempts: 5,
            idle_sleep_us: 10_000,
            timer_batch_max: 8,
            attempt: AttemptConfig::default(),
        }
    }
}

/// What a single poll tick did, for metrics/testing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    /// Nothing was claimable; the caller should back off.
    Idle,
    /// A message was claimed and the handler ran to success.
    Dispatched,
    /// A message was claimed, the handler failed, and it was requeued.
    Requeued,
    /// A message was claimed, the handler failed past `max_attempts`, and it
    /// was parked in the dead-letter DBI.
    DeadLettered,
}

/// How a failed dispatch was resolved (spec §4.10 step 5 "disposition").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Moved to a fresh sequence for a future claim attempt.
    Requeued { new_seq: u64 },
    /// Parked in the dead-letter DBI; no further delivery attempts.
    DeadLettered,
}

/// A point-in-time counter snapshot (spec §4.10 step 4). Delivered to a
/// [`MetricsSink`] synchronously on the worker thread after every tick that
/// dispatched a message.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsSnapshot {
    pub attempts: u64,
    pub successes: u64,
    pub retryable_failures: u64,
    pub non_retryable_failures: u64,
    pub busy_retries: u64,
    pub conflict_retries: u64,
    pub requeues: u64,
    pub dead_letters: u64,
    /// Duration of the most recently completed dispatch, in the same unit
    /// as [`Clock::now`] (milliseconds since an arbitrary epoch).
    pub last_latency_ms: i64,
}

/// A capability record (spec §9) that receives a metrics snapshot after
/// each dispatched tick. Must not block or re-enter runner APIs (spec §4.10).
pub trait MetricsSink: Send + Sync {
    fn record(&self, snapshot: MetricsSnapshot);
}

/// A capability record receiving structured log events (spec §4.10 step 5),
/// distinct from (and in addition to) the crate's ambient `tracing`
/// instrumentation — this is the caller-pluggable sink the spec calls for.
pub trait LogSink: Send + Sync {
    fn log(&self, event: LogEvent<'_>);
}

/// One event emitted through a [`LogSink`] (spec §4.10 step 5: "retryable
/// failures, non-retryable failures, disposition, worker errors").
#[derive(Debug)]
pub enum LogEvent<'a> {
    RetryableFailure { worker_id: u64, seq: u64, attempts: u32, error: &'a Error },
    NonRetryableFailure { worker_id: u64, seq: u64, error: &'a Error },
    Disposition { worker_id: u64, seq: u64, disposition: Disposition },
    WorkerError { worker_id: u64, error: &'a Error },
}

/// A capability record receiving replay events (spec §4.10 step 6). Payload
/// references borrowed by an event are valid only for the duration of the
/// synchronous `replay` call; the sink must not retain them.
pub trait ReplaySink: Send + Sync {
    fn replay(&self, event: ReplayEvent<'_>);
}

/// One event emitted through a [`ReplaySink`].
#[derive(Debug)]
pub enum ReplayEvent<'a> {
    InboxAttempt { worker_id: u64, seq: u64, frame: &'a MessageFrame },
    InboxResult { worker_id: u64, seq: u64, outcome: Tick },
    TimerAttempt { worker_id: u64, due_ts: i64, frame: &'a MessageFrame },
    Disposition { worker_id: u64, seq: u64, disposition: Disposition },
}

/// The optional sink bundle a worker is configured with (spec §4.10
/// "optional metrics/log/replay sinks"). Absent sinks are simply skipped;
/// all three run synchronously on the worker thread that produced the
/// event and must not re-enter runner APIs.
#[derive(Default)]
pub struct WorkerHooks<'a> {
    pub metrics: Option<&'a dyn MetricsSink>,
    pub log: Option<&'a dyn LogSink>,
    pub replay: Option<&'a dyn ReplaySink>,
}

/// Running counters backing the snapshots handed to a [`MetricsSink`].
/// Lives for the worker's whole run, not just one tick.
#[derive(Default)]
struct MetricsAccumulator {
    attempts: AtomicU64,
    successes: AtomicU64,
    retryable_failures: AtomicU64,
    non_retryable_failures: AtomicU64,
    busy_retries: AtomicU64,
    conflict_retries: AtomicU64,
    requeues: AtomicU64,
    dead_letters: AtomicU64,
}

impl MetricsAccumulator {
    fn snapshot(&self, last_latency_ms: i64) -> MetricsSnapshot {
        MetricsSnapshot {
            attempts: self.attempts.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            retryable_failures: self.retryable_failures.load(Ordering::Relaxed),
            non_retryable_failures: self.non_retryable_failures.load(Ordering::Relaxed),
            busy_retries: self.busy_retries.load(Ordering::Relaxed),
            conflict_retries: self.conflict_retries.load(Ordering::Relaxed),
            requeues: self.requeues.load(Ordering::Relaxed),
            dead_letters: self.dead_letters.load(Ordering::Relaxed),
            last_latency_ms,
        }
    }
}

/// Per-worker running counters backing [`MetricsSnapshot`]s (spec §4.10
/// "State: ... optional metrics/log/replay sinks"). Owned by the caller and
/// threaded through [`tick`]/[`run`] so counts accumulate across the whole
/// run rather than resetting every tick.
#[derive(Default)]
pub struct WorkerMetrics(MetricsAccumulator);

impl WorkerMetrics {
    pub fn new() -> Self {
        WorkerMetrics::default()
    }

    /// The current cumulative counters, with the given tick's latency.
    pub fn snapshot(&self, last_latency_ms: i64) -> MetricsSnapshot {
        self.0.snapshot(last_latency_ms)
    }
}

/// Drain due timers into `config.worker_id`'s inbox. Each timer payload is
/// treated as an already-encoded [`MessageFrame`] (spec §4.9 "a fired timer
/// is delivered like any other inbox message"). Returns the due timestamp
/// and decoded frame of every timer promoted, for replay instrumentation.
fn promote_due_timers(db: &Database, config: &WorkerConfig, clock: &dyn Clock) -> Result<Vec<(i64, MessageFrame)>> {
    let mut txn = db.begin_write()?;
    let due = mailbox::timer_drain_due(&mut txn, clock.now(), config.timer_batch_max)?;
    let mut promoted = Vec::with_capacity(due.len());
    for (due_ts, bytes) in due {
        let frame = MessageFrame::decode(&bytes)?;
        mailbox::inbox_put(&mut txn, config.worker_id, &frame)?;
        promoted.push((due_ts, frame));
    }
    txn.commit()?;
    Ok(promoted)
}

/// Translate a drained intent into its durable effect. Outbox emits append
/// raw bytes; timer arms schedule a future inbox delivery. Runs in its own
/// transaction, since intents are only ever applied after the attempt that
/// staged them has already committed (spec §4.7 "Invariant").
fn apply_intent(db: &Database, intent: &Intent) -> Result<()> {
    let mut txn = db.begin_write()?;
    match intent {
        Intent::OutboxEmit { bytes } => {
            mailbox::outbox_append(&mut txn, bytes)?;
        }
        Intent::TimerArm { due_ts, bytes } => {
            mailbox::timer_append(&mut txn, *due_ts, bytes)?;
        }
    }
    txn.commit()
}

/// Run one poll-and-dispatch tick: promote due timers, claim the next
/// message for this worker, and if one was found, run `handle` against it
/// through the bounded-retry attempt engine.
///
/// `handle` stages its work against the [`AtomicStack`] it's given, exactly
/// like any other attempt; it does not see mailbox bookkeeping (ack/requeue
/// are the worker shell's responsibility, applied only after `handle`'s
/// commit succeeds or is judged exhausted).
pub fn tick(
    db: &Database,
    config: &WorkerConfig,
    clock: &dyn Clock,
    sleep: &dyn SleepHook,
    metrics: &WorkerMetrics,
    hooks: &WorkerHooks,
    mut handle: impl FnMut(&MessageFrame, &mut AtomicStack) -> Result<()>,
) -> Result<Tick> {
    let promoted = promote_due_timers(db, config, clock)?;
    if let Some(replay) = hooks.replay {
        for (due_ts, frame) in &promoted {
            replay.replay(ReplayEvent::TimerAttempt { worker_id: config.worker_id, due_ts: *due_ts, frame });
        }
    }

    let claimed = {
        let mut txn = db.begin_write()?;
        let claimed =
            mailbox::claim_next_claimable(&mut txn, config.worker_id, config.worker_id, clock.now(), config.lease_ms)?;
        txn.commit()?;
        claimed
    };
    let claimed = match claimed {
        Some(c) => c,
        None => return Ok(Tick::Idle),
    };

    if let Some(replay) = hooks.replay {
        replay.replay(ReplayEvent::InboxAttempt { worker_id: config.worker_id, seq: claimed.seq, frame: &claimed.frame });
    }

    debug!(worker = config.worker_id, attempts = claimed.attempts, "dispatching claimed message");
    let started_at = clock.now();
    let (result, stats) = run_attempt(db, &config.attempt, sleep, |stack| handle(&claimed.frame, stack), |intent| {
        apply_intent(db, intent)
    });
    let latency_ms = clock.now().saturating_sub(started_at);

    metrics.0.attempts.fetch_add(stats.attempts as u64, Ordering::Relaxed);
    metrics.0.busy_retries.fetch_add(stats.busy_retries as u64, Ordering::Relaxed);
    metrics.0.conflict_retries.fetch_add(stats.conflict_retries as u64, Ordering::Relaxed);

    let mut txn = db.begin_write()?;
    let outcome = match result {
        Ok(()) => {
            mailbox::ack(&mut txn, config.worker_id, claimed.seq, &claimed.lease)?;
            metrics.0.successes.fetch_add(1, Ordering::Relaxed);
            Tick::Dispatched
        }
        Err(e) if claimed.attempts >= config.max_attempts => {
            warn!(worker = config.worker_id, attempts = claimed.attempts, error = %e, "message exhausted retry budget");
            metrics.0.non_retryable_failures.fetch_add(1, Ordering::Relaxed);
            if let Some(log) = hooks.log {
                log.log(LogEvent::NonRetryableFailure { worker_id: config.worker_id, seq: claimed.seq, error: &e });
            }
            mailbox::move_to_dead_letter(
                &mut txn,
                config.worker_id,
                claimed.seq,
                &claimed.lease,
                e.status_code(),
                claimed.attempts,
            )?;
            metrics.0.dead_letters.fetch_add(1, Ordering::Relaxed);
            if let Some(log) = hooks.log {
                log.log(LogEvent::Disposition {
                    worker_id: config.worker_id,
                    seq: claimed.seq,
                    disposition: Disposition::DeadLettered,
                });
            }
            if let Some(replay) = hooks.replay {
                replay.replay(ReplayEvent::Disposition {
                    worker_id: config.worker_id,
                    seq: claimed.seq,
                    disposition: Disposition::DeadLettered,
                });
            }
            Tick::DeadLettered
        }
        Err(e) => {
            info!(worker = config.worker_id, attempts = claimed.attempts, error = %e, "requeuing after handler failure");
            metrics.0.retryable_failures.fetch_add(1, Ordering::Relaxed);
            if let Some(log) = hooks.log {
                log.log(LogEvent::RetryableFailure {
                    worker_id: config.worker_id,
                    seq: claimed.seq,
                    attempts: claimed.attempts,
                    error: &e,
                });
            }
            let new_seq = mailbox::next_inbox_seq(&mut txn)?;
            mailbox::requeue(&mut txn, config.worker_id, claimed.seq, &claimed.lease, new_seq)?;
            metrics.0.requeues.fetch_add(1, Ordering::Relaxed);
            let disposition = Disposition::Requeued { new_seq };
            if let Some(log) = hooks.log {
                log.log(LogEvent::Disposition { worker_id: config.worker_id, seq: claimed.seq, disposition });
            }
            if let Some(replay) = hooks.replay {
                replay.replay(ReplayEvent::Disposition { worker_id: config.worker_id, seq: claimed.seq, disposition });
            }
            Tick::Requeued
        }
    };
    txn.commit()?;

    if let Some(replay) = hooks.replay {
        replay.replay(ReplayEvent::InboxResult { worker_id: config.worker_id, seq: claimed.seq, outcome });
    }
    if let Some(sink) = hooks.metrics {
        sink.record(metrics.snapshot(latency_ms));
    }
    debug!(worker = config.worker_id, retries = stats.retries, outcome = ?outcome, "tick complete");
    Ok(outcome)
}

/// Run [`tick`] in a loop until `stop` is set, sleeping `config.idle_sleep_us`
/// whenever a tick finds nothing to do.
pub fn run(
    db: &Database,
    config: &WorkerConfig,
    stop: &AtomicBool,
    clock: &dyn Clock,
    sleep: &dyn SleepHook,
    hooks: &WorkerHooks,
    mut handle: impl FnMut(&MessageFrame, &mut AtomicStack) -> Result<()>,
) -> Result<()> {
    mailbox::bootstrap_schema(db)?;
    let metrics = WorkerMetrics::new();
    info!(worker = config.worker_id, "worker loop starting");
    while !stop.load(Ordering::Acquire) {
        match tick(db, config, clock, sleep, &metrics, hooks, &mut handle) {
            Ok(Tick::Idle) => sleep.sleep(config.idle_sleep_us),
            Ok(_) => {}
            Err(e) => {
                warn!(worker = config.worker_id, error = %e, "worker tick failed");
                if let Some(log) = hooks.log {
                    log.log(LogEvent::WorkerError { worker_id: config.worker_id, error: &e });
                }
                return Err(e);
            }
        }
    }
    info!(worker = config.worker_id, "worker loop stopping");
    Ok(())
}

/// A `SleepHook` that never actually blocks, handed to [`run`]/[`tick`] in
/// tests so idle backoff doesn't slow the suite down.
pub fn real_sleep() -> RealSleep {
    RealSleep
}
