//! Inbox/lease/timer/dead-letter lifecycle driven through the worker shell
//! (spec §4.9, §4.10).

use sapling::db::DbBuilder;
use sapling::runner::attempt::RealSleep;
use sapling::runner::frame::{FrameFlags, MessageFrame};
use sapling::runner::mailbox;
use sapling::runner::worker::{tick, Clock, Tick, WorkerConfig, WorkerHooks, WorkerMetrics};
use std::sync::atomic::{AtomicI64, Ordering};

struct FakeClock(AtomicI64);
impl Clock for FakeClock {
    fn now(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }
}

fn frame(id: &[u8]) -> MessageFrame {
    MessageFrame {
        kind: 1,
        flags: FrameFlags::empty(),
        target_worker: 7,
        routing_worker: 0,
        routing_timestamp: 0,
        origin_worker: None,
        message_id: id.to_vec(),
        trace_id: None,
        payload: Some(b"payload".to_vec()),
    }
}

#[test]
fn a_message_dispatches_and_acks_on_first_success() {
    let db = DbBuilder::new().build().unwrap();
    mailbox::bootstrap_schema(&db).unwrap();

    let mut txn = db.begin_write().unwrap();
    mailbox::inbox_put(&mut txn, 7, &frame(b"m1")).unwrap();
    txn.commit().unwrap();

    let config = WorkerConfig { worker_id: 7, ..Default::default() };
    let clock = FakeClock(AtomicI64::new(0));
    let metrics = WorkerMetrics::new();
    let hooks = WorkerHooks::default();
    let outcome = tick(&db, &config, &clock, &RealSleep, &metrics, &hooks, |_f, _stack| Ok(())).unwrap();
    assert_eq!(outcome, Tick::Dispatched);

    let again = tick(&db, &config, &clock, &RealSleep, &metrics, &hooks, |_f, _stack| Ok(())).unwrap();
    assert_eq!(again, Tick::Idle);
}

#[test]
fn a_message_exhausting_its_retry_budget_is_dead_lettered() {
    let db = DbBuilder::new().build().unwrap();
    mailbox::bootstrap_schema(&db).unwrap();

    let mut txn = db.begin_write().unwrap();
    mailbox::inbox_put(&mut txn, 7, &frame(b"m2")).unwrap();
    txn.commit().unwrap();

    let config = WorkerConfig { worker_id: 7, max_attempts: 2, ..Default::default() };
    let clock = FakeClock(AtomicI64::new(0));
    let metrics = WorkerMetrics::new();
    let hooks = WorkerHooks::default();

    let first = tick(&db, &config, &clock, &RealSleep, &metrics, &hooks, |_f, _stack| {
        Err(sapling::error::Error::Other("boom".into()))
    })
    .unwrap();
    assert_eq!(first, Tick::Requeued);

    let second = tick(&db, &config, &clock, &RealSleep, &metrics, &hooks, |_f, _stack| {
        Err(sapling::error::Error::Other("boom".into()))
    })
    .unwrap();
    assert_eq!(second, Tick::DeadLettered);

    let idle = tick(&db, &config, &clock, &RealSleep, &metrics, &hooks, |_f, _stack| Ok(())).unwrap();
    assert_eq!(idle, Tick::Idle);

    let mut collected = Vec::new();
    let mut txn = db.begin_write().unwrap();
    mailbox::drain_dead_letter(&mut txn, 8, |_key, _header, frame| {
        collected.push(frame.message_id.clone());
        Ok(true)
    })
    .unwrap();
    txn.commit().unwrap();
    assert_eq!(collected, vec![b"m2".to_vec()]);
}

#[test]
fn a_fired_timer_is_delivered_to_the_inbox_on_a_later_tick() {
    let db = DbBuilder::new().build().unwrap();
    mailbox::bootstrap_schema(&db).unwrap();

    let mut txn = db.begin_write().unwrap();
    mailbox::timer_append(&mut txn, 1_000, &frame(b"timer-fired").encode()).unwrap();
    txn.commit().unwrap();

    let config = WorkerConfig { worker_id: 7, ..Default::default() };
    let clock = FakeClock(AtomicI64::new(0));
    let metrics = WorkerMetrics::new();
    let hooks = WorkerHooks::default();

    let too_early = tick(&db, &config, &clock, &RealSleep, &metrics, &hooks, |_f, _stack| Ok(())).unwrap();
    assert_eq!(too_early, Tick::Idle);

    clock.0.store(1_000, Ordering::SeqCst);
    let mut seen = None;
    let fired = tick(&db, &config, &clock, &RealSleep, &metrics, &hooks, |f, _stack| {
        seen = Some(f.message_id.clone());
        Ok(())
    })
    .unwrap();
    assert_eq!(fired, Tick::Dispatched);
    assert_eq!(seen, Some(b"timer-fired".to_vec()));
}

#[test]
fn duplicate_message_ids_are_rejected_by_the_dedupe_guard() {
    let db = DbBuilder::new().build().unwrap();
    mailbox::bootstrap_schema(&db).unwrap();

    let mut txn = db.begin_write().unwrap();
    let first = mailbox::dedupe_check_and_record(&mut txn, b"dup-1", 0).unwrap();
    let second = mailbox::dedupe_check_and_record(&mut txn, b"dup-1", 10).unwrap();
    txn.commit().unwrap();

    assert!(first, "first sighting of a message id should be accepted");
    assert!(!second, "a repeat message id should be rejected");
}
