//! Inbox/lease/outbox/timer/dedupe/dead-letter state machine (spec §4.9).
//!
//! Every mailbox DBI lives at a fixed index (spec §4.9 "fixed DBI
//! contract") so a worker can open a [`Database`] and start dispatching
//! without a discovery step. [`bootstrap_schema`] creates them (idempotent,
//! grounded on `txn.rs`'s `create_dbi` already tolerating a pre-existing
//! slot) and stamps a schema version into `APP_STATE`.
//!
//! Claim/ack/requeue/dead-letter/timer operations take a live
//! `&mut Transaction<'_, Write>` directly rather than staging through
//! [`crate::runner::atomic::AtomicStack`]: they need ordered cursor scans
//! and delete-after-inspect sequencing that the stack's by-key staging
//! model doesn't express (see `DESIGN.md`).

use crate::btree::PutFlags;
use crate::cursor::SeekOutcome;
use crate::db::{Database, Dbi};
use crate::error::{Error, Result};
use crate::runner::frame::MessageFrame;
use crate::txn::{Transaction, Write};

/// Schema-version / counter storage (`schema_version`, `next_inbox_seq`,
/// `next_outbox_seq`, `next_timer_seq`).
pub const APP_STATE: Dbi = Dbi(0);
/// Pending work items, keyed by `worker(8 BE) || seq(8 BE)`.
pub const INBOX: Dbi = Dbi(1);
/// Emitted events, keyed by `seq(8 BE)`.
pub const OUTBOX: Dbi = Dbi(2);
/// Active claims over inbox entries, keyed by the inbox key they lease.
pub const LEASES: Dbi = Dbi(3);
/// Scheduled wakeups, keyed by `biased_due_ts(8 BE) || seq(8 BE)`.
pub const TIMERS: Dbi = Dbi(4);
/// Seen message ids, keyed by the application message id.
pub const DEDUPE: Dbi = Dbi(5);
/// Exhausted-retry messages, keyed by their original inbox key.
pub const DEAD_LETTER: Dbi = Dbi(6);

const SCHEMA_VERSION_KEY: &[u8] = b"schema_version";
const NEXT_INBOX_SEQ_KEY: &[u8] = b"next_inbox_seq";
const NEXT_OUTBOX_SEQ_KEY: &[u8] = b"next_outbox_seq";
const NEXT_TIMER_SEQ_KEY: &[u8] = b"next_timer_seq";
const CURRENT_SCHEMA_VERSION: u32 = 1;
const LEASE_MAGIC: &[u8; 4] = b"LSE0";

/// Create the fixed mailbox DBIs if they don't already exist and stamp the
/// current schema version. Safe to call on every worker startup. A schema
/// version already present but not equal to [`CURRENT_SCHEMA_VERSION`] is a
/// hard error (SPEC_FULL §4 C9 "an unknown version is a hard corrupt error").
pub fn bootstrap_schema(db: &Database) -> Result<()> {
    let mut txn = db.begin_write()?;
    for dbi in [APP_STATE, INBOX, OUTBOX, LEASES, TIMERS, DEDUPE, DEAD_LETTER] {
        txn.create_dbi(dbi.0, false)?;
    }
    match txn.get(APP_STATE, SCHEMA_VERSION_KEY)? {
        None => {
            txn.put(APP_STATE, SCHEMA_VERSION_KEY, &CURRENT_SCHEMA_VERSION.to_le_bytes(), PutFlags::empty())?;
        }
        Some(bytes) => {
            let arr: [u8; 4] = bytes.as_slice().try_into().map_err(|_| Error::corrupt("malformed schema version"))?;
            let version = u32::from_le_bytes(arr);
            if version != CURRENT_SCHEMA_VERSION {
                return Err(Error::corrupt(format!(
                    "mailbox schema version {version} unsupported (expected {CURRENT_SCHEMA_VERSION})"
                )));
            }
        }
    }
    txn.commit()?;
    Ok(())
}

fn inbox_key(worker: u64, seq: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(16);
    key.extend_from_slice(&worker.to_be_bytes());
    key.extend_from_slice(&seq.to_be_bytes());
    key
}

fn decode_inbox_key(bytes: &[u8]) -> Result<(u64, u64)> {
    if bytes.len() != 16 {
        return Err(Error::corrupt("malformed inbox key"));
    }
    let worker = u64::from_be_bytes(bytes[0..8].try_into().unwrap());
    let seq = u64::from_be_bytes(bytes[8..16].try_into().unwrap());
    Ok((worker, seq))
}

fn timer_key(due_ts: i64, seq: u64) -> Vec<u8> {
    let biased = (due_ts as u64) ^ (1u64 << 63);
    let mut key = Vec::with_capacity(16);
    key.extend_from_slice(&biased.to_be_bytes());
    key.extend_from_slice(&seq.to_be_bytes());
    key
}

fn decode_timer_key(bytes: &[u8]) -> Result<(i64, u64)> {
    if bytes.len() != 16 {
        return Err(Error::corrupt("malformed timer key"));
    }
    let biased = u64::from_be_bytes(bytes[0..8].try_into().unwrap());
    let due_ts = (biased ^ (1u64 << 63)) as i64;
    let seq = u64::from_be_bytes(bytes[8..16].try_into().unwrap());
    Ok((due_ts, seq))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LeaseRecord {
    owner: u64,
    deadline: i64,
    attempts: u32,
}

impl LeaseRecord {
    fn encode(&self) -> [u8; 24] {
        let mut buf = [0u8; 24];
        buf[0..4].copy_from_slice(LEASE_MAGIC);
        buf[4..12].copy_from_slice(&self.owner.to_le_bytes());
        buf[12..20].copy_from_slice(&self.deadline.to_le_bytes());
        buf[20..24].copy_from_slice(&self.attempts.to_le_bytes());
        buf
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != 24 {
            return Err(Error::corrupt("malformed lease record"));
        }
        if &bytes[0..4] != LEASE_MAGIC {
            return Err(Error::corrupt("bad lease record magic"));
        }
        Ok(LeaseRecord {
            owner: u64::from_le_bytes(bytes[4..12].try_into().unwrap()),
            deadline: i64::from_le_bytes(bytes[12..20].try_into().unwrap()),
            attempts: u32::from_le_bytes(bytes[20..24].try_into().unwrap()),
        })
    }
}

const DLQ_MAGIC: &[u8; 4] = b"DLQ0";

/// A dead-letter entry's fixed header (spec §6 "Dead-letter value"), followed
/// by the original frame bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeadLetterHeader {
    /// Application-defined failure classification.
    pub failure_code: i32,
    /// How many delivery attempts were made before this message was parked.
    pub attempts: u32,
}

impl DeadLetterHeader {
    const LEN: usize = 16;

    fn encode(&self, frame_len: u32) -> [u8; Self::LEN] {
        let mut buf = [0u8; Self::LEN];
        buf[0..4].copy_from_slice(DLQ_MAGIC);
        buf[4..8].copy_from_slice(&self.failure_code.to_le_bytes());
        buf[8..12].copy_from_slice(&self.attempts.to_le_bytes());
        buf[12..16].copy_from_slice(&frame_len.to_le_bytes());
        buf
    }

    /// Decode the fixed header, returning it alongside the frame-length field
    /// so the caller can slice the trailing frame bytes exactly.
    fn decode(bytes: &[u8]) -> Result<(Self, u32)> {
        if bytes.len() < Self::LEN {
            return Err(Error::corrupt("malformed dead-letter header"));
        }
        if &bytes[0..4] != DLQ_MAGIC {
            return Err(Error::corrupt("bad dead-letter record magic"));
        }
        let failure_code = i32::from_le_bytes(bytes[4..8].try_into().unwrap());
        let attempts = u32::from_le_bytes(bytes[8..12].try_into().unwrap());
        let frame_len = u32::from_le_bytes(bytes[12..16].try_into().unwrap());
        Ok((DeadLetterHeader { failure_code, attempts }, frame_len))
    }
}

fn decode_dead_letter_frame(stored: &[u8]) -> Result<(DeadLetterHeader, MessageFrame)> {
    let (header, frame_len) = DeadLetterHeader::decode(stored)?;
    let frame_bytes = &stored[DeadLetterHeader::LEN..];
    if frame_bytes.len() != frame_len as usize {
        return Err(Error::corrupt("dead-letter frame length mismatch"));
    }
    let frame = MessageFrame::decode(frame_bytes)?;
    Ok((header, frame))
}

/// A message claimed out of the inbox, ready for dispatch.
#[derive(Debug, Clone)]
pub struct ClaimedMessage {
    /// The inbox key this message was claimed under.
    pub key: Vec<u8>,
    /// The sequence component of [`Self::key`].
    pub seq: u64,
    /// The decoded message frame.
    pub frame: MessageFrame,
    /// The delivery attempt number this claim represents (1 = first try).
    pub attempts: u32,
    /// The exact bytes of the lease record just installed, to be presented
    /// back as `expected_lease` to [`ack`]/[`requeue`]/[`move_to_dead_letter`].
    pub lease: [u8; 24],
}

fn read_seq_counter(txn: &mut Transaction<'_, Write>, dbi: Dbi, key: &[u8]) -> Result<u64> {
    match txn.get(dbi, key)? {
        Some(bytes) => {
            let arr: [u8; 8] = bytes.as_slice().try_into().map_err(|_| Error::corrupt("malformed sequence counter"))?;
            Ok(u64::from_le_bytes(arr))
        }
        None => Ok(0),
    }
}

fn take_seq(txn: &mut Transaction<'_, Write>, dbi: Dbi, key: &[u8]) -> Result<u64> {
    let current = read_seq_counter(txn, dbi, key)?;
    let next = current.checked_add(1).ok_or_else(|| Error::corrupt("sequence counter overflow"))?;
    txn.put(dbi, key, &next.to_le_bytes(), PutFlags::empty())?;
    Ok(current)
}

/// Append `frame` to `worker`'s inbox, returning the sequence it was
/// assigned.
pub fn inbox_put(txn: &mut Transaction<'_, Write>, worker: u64, frame: &MessageFrame) -> Result<u64> {
    let seq = take_seq(txn, APP_STATE, NEXT_INBOX_SEQ_KEY)?;
    txn.put(INBOX, &inbox_key(worker, seq), &frame.encode(), PutFlags::empty())?;
    Ok(seq)
}

/// Claim message `(worker, seq)` for `claimant` until `deadline` (spec §4.9
/// "claim"). If no lease exists yet, installs one with `attempts = 1` via
/// no-overwrite. If a lease exists and hasn't passed its deadline, returns
/// [`Error::Busy`]. Otherwise compare-and-swaps in a new lease with
/// `attempts = prev.attempts + 1`, owned by `claimant`.
pub fn claim(
    txn: &mut Transaction<'_, Write>,
    worker: u64,
    seq: u64,
    claimant: u64,
    now: i64,
    deadline: i64,
) -> Result<([u8; 24], u32)> {
    let key = inbox_key(worker, seq);
    if txn.get(INBOX, &key)?.is_none() {
        return Err(Error::NotFound);
    }
    match txn.get(LEASES, &key)? {
        None => {
            let lease = LeaseRecord { owner: claimant, deadline, attempts: 1 };
            let encoded = lease.encode();
            txn.put(LEASES, &key, &encoded, PutFlags::NO_OVERWRITE)?;
            Ok((encoded, 1))
        }
        Some(bytes) => {
            let prev = LeaseRecord::decode(&bytes)?;
            if now <= prev.deadline {
                return Err(Error::Busy("lease held within its deadline"));
            }
            let lease = LeaseRecord { owner: claimant, deadline, attempts: prev.attempts + 1 };
            let encoded = lease.encode();
            txn.put_if(LEASES, &key, &encoded, &bytes)?;
            Ok((encoded, lease.attempts))
        }
    }
}

/// Scan `worker`'s inbox in sequence order for the first message that is
/// either unleased or past its lease deadline, and claim it. Returns `None`
/// once no claimable entry remains. A convenience built atop [`claim`] for
/// the worker shell (spec §4.10), which dispatches "the next message" rather
/// than one already identified by sequence.
pub fn claim_next_claimable(
    txn: &mut Transaction<'_, Write>,
    worker: u64,
    claimant: u64,
    now: i64,
    lease_ms: i64,
) -> Result<Option<ClaimedMessage>> {
    let mut seq = 0u64;
    loop {
        let found = {
            let mut cursor = txn.cursor(INBOX)?;
            match cursor.seek(&inbox_key(worker, seq))? {
                SeekOutcome::NotFound => None,
                _ => cursor.current()?,
            }
        };
        let (key, value) = match found {
            Some(pair) => pair,
            None => return Ok(None),
        };
        let (found_worker, found_seq) = decode_inbox_key(&key)?;
        if found_worker != worker {
            return Ok(None);
        }

        match claim(txn, worker, found_seq, claimant, now, now + lease_ms) {
            Ok((lease, attempts)) => {
                let frame = MessageFrame::decode(&value)?;
                return Ok(Some(ClaimedMessage { key, seq: found_seq, frame, attempts, lease }));
            }
            Err(Error::Busy(_)) => {
                seq = found_seq.checked_add(1).ok_or_else(|| Error::corrupt("inbox sequence overflow"))?;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Reserve a fresh sequence in the shared inbox sequence space used by
/// [`inbox_put`]; exposed so callers of [`requeue`] can mint a `new_seq`.
pub fn next_inbox_seq(txn: &mut Transaction<'_, Write>) -> Result<u64> {
    take_seq(txn, APP_STATE, NEXT_INBOX_SEQ_KEY)
}

fn check_lease(txn: &mut Transaction<'_, Write>, key: &[u8], expected_lease: &[u8]) -> Result<()> {
    match txn.get(LEASES, key)? {
        Some(bytes) if bytes == expected_lease => Ok(()),
        Some(_) => Err(Error::Conflict("lease does not match expected value")),
        None => Err(Error::NotFound),
    }
}

/// Acknowledge successful processing of `(worker, seq)`: verifies the stored
/// lease byte-exactly matches `expected_lease`, then deletes the inbox entry
/// and the lease.
pub fn ack(txn: &mut Transaction<'_, Write>, worker: u64, seq: u64, expected_lease: &[u8]) -> Result<()> {
    let key = inbox_key(worker, seq);
    check_lease(txn, &key, expected_lease)?;
    txn.del(INBOX, &key)?;
    txn.del(LEASES, &key)?;
    Ok(())
}

/// Atomically move `(worker, old_seq)`'s frame bytes to `(worker, new_seq)`,
/// after verifying the stored lease byte-exactly matches `expected_lease`,
/// and drop the old inbox entry and lease. `old_seq == new_seq` is invalid.
pub fn requeue(
    txn: &mut Transaction<'_, Write>,
    worker: u64,
    old_seq: u64,
    expected_lease: &[u8],
    new_seq: u64,
) -> Result<()> {
    if old_seq == new_seq {
        return Err(Error::Other("requeue requires new_seq != old_seq".into()));
    }
    let old_key = inbox_key(worker, old_seq);
    check_lease(txn, &old_key, expected_lease)?;
    let frame_bytes = txn.get(INBOX, &old_key)?.ok_or(Error::NotFound)?;
    txn.put(INBOX, &inbox_key(worker, new_seq), &frame_bytes, PutFlags::NO_OVERWRITE)?;
    txn.del(INBOX, &old_key)?;
    txn.del(LEASES, &old_key)?;
    Ok(())
}

/// Move `(worker, seq)` into the dead-letter DBI after verifying the stored
/// lease byte-exactly matches `expected_lease`, removing it from the inbox
/// and releasing its lease.
pub fn move_to_dead_letter(
    txn: &mut Transaction<'_, Write>,
    worker: u64,
    seq: u64,
    expected_lease: &[u8],
    failure_code: i32,
    attempts: u32,
) -> Result<()> {
    let key = inbox_key(worker, seq);
    check_lease(txn, &key, expected_lease)?;
    let frame_bytes = txn.get(INBOX, &key)?.ok_or(Error::NotFound)?;
    let header = DeadLetterHeader { failure_code, attempts };
    let mut value = Vec::with_capacity(DeadLetterHeader::LEN + frame_bytes.len());
    value.extend_from_slice(&header.encode(frame_bytes.len() as u32));
    value.extend_from_slice(&frame_bytes);
    txn.put(DEAD_LETTER, &key, &value, PutFlags::empty())?;
    txn.del(INBOX, &key)?;
    txn.del(LEASES, &key)?;
    Ok(())
}

/// Move `(worker, seq)`'s dead-letter entry back into the inbox at
/// `(worker, replay_seq)` for another delivery attempt, clearing its
/// recorded attempt count. The inverse of [`move_to_dead_letter`] modulo the
/// sequence number (spec §8 scenario 5).
pub fn replay_dead_letter(txn: &mut Transaction<'_, Write>, worker: u64, seq: u64, replay_seq: u64) -> Result<()> {
    let key = inbox_key(worker, seq);
    let stored = txn.get(DEAD_LETTER, &key)?.ok_or(Error::NotFound)?;
    let (_header, frame_len) = DeadLetterHeader::decode(&stored)?;
    let frame_bytes = &stored[DeadLetterHeader::LEN..];
    if frame_bytes.len() != frame_len as usize {
        return Err(Error::corrupt("dead-letter frame length mismatch"));
    }
    txn.put(INBOX, &inbox_key(worker, replay_seq), frame_bytes, PutFlags::NO_OVERWRITE)?;
    txn.del(DEAD_LETTER, &key)?;
    Ok(())
}

/// Visit up to `max` dead-letter entries in key order, removing each one
/// the handler accepts (returns `Ok(true)`) via a CAS on the exact value
/// observed (spec §4.9 "drain_dead_letter"): the value is re-read
/// immediately before deletion and compared byte-exactly against the value
/// the handler was shown; a mismatch stops the drain with
/// [`Error::Conflict`] instead of deleting. Returns the number of entries
/// removed.
pub fn drain_dead_letter(
    txn: &mut Transaction<'_, Write>,
    max: usize,
    mut handler: impl FnMut(&[u8], &DeadLetterHeader, &MessageFrame) -> Result<bool>,
) -> Result<u64> {
    let mut batch = Vec::with_capacity(max.min(64));
    {
        let mut cursor = txn.cursor(DEAD_LETTER)?;
        let mut has_entry = cursor.first()?;
        while has_entry && batch.len() < max {
            let (key, value) = match cursor.current()? {
                Some(pair) => pair,
                None => break,
            };
            batch.push((key, value));
            has_entry = cursor.next()?.is_some();
        }
    }

    let mut removed = 0u64;
    for (key, observed) in batch {
        let (header, frame) = decode_dead_letter_frame(&observed)?;
        if !handler(&key, &header, &frame)? {
            continue;
        }
        let current = txn.get(DEAD_LETTER, &key)?;
        if current.as_deref() != Some(observed.as_slice()) {
            return Err(Error::Conflict("dead-letter entry changed during drain"));
        }
        txn.del(DEAD_LETTER, &key)?;
        removed += 1;
    }
    Ok(removed)
}

/// Schedule `payload` to fire at `due_ts`.
pub fn timer_append(txn: &mut Transaction<'_, Write>, due_ts: i64, payload: &[u8]) -> Result<()> {
    let seq = take_seq(txn, APP_STATE, NEXT_TIMER_SEQ_KEY)?;
    txn.put(TIMERS, &timer_key(due_ts, seq), payload, PutFlags::empty())?;
    Ok(())
}

/// Pop up to `max` timers due at or before `now`, in ascending due-time
/// order, deleting them as they're returned (spec §4.9
/// "timer_drain_due(db, now, max, handler)"). The `max` cap bounds how much
/// work one call does against a timer flood; remaining due entries are
/// left for a later call.
pub fn timer_drain_due(txn: &mut Transaction<'_, Write>, now: i64, max: usize) -> Result<Vec<(i64, Vec<u8>)>> {
    let mut due = Vec::new();
    let mut cursor = txn.cursor(TIMERS)?;
    let mut has_entry = cursor.first()?;
    while has_entry && due.len() < max {
        let (key, value) = match cursor.current()? {
            Some(pair) => pair,
            None => break,
        };
        let (due_ts, _seq) = decode_timer_key(&key)?;
        if due_ts > now {
            break;
        }
        due.push((due_ts, value));
        cursor.del()?;
        has_entry = cursor.current()?.is_some();
    }
    Ok(due)
}

/// Append raw `bytes` to the outbox, returning the sequence it was
/// assigned. The bytes are opaque to the mailbox (spec §4.7 "intents carry
/// whatever the guest staged"); callers that want a [`MessageFrame`] encode
/// it themselves first.
pub fn outbox_append(txn: &mut Transaction<'_, Write>, bytes: &[u8]) -> Result<u64> {
    let seq = take_seq(txn, APP_STATE, NEXT_OUTBOX_SEQ_KEY)?;
    txn.put(OUTBOX, &seq.to_be_bytes(), bytes, PutFlags::empty())?;
    Ok(seq)
}

/// Record `message_id` against the dedupe guard. Returns `true` if this is
/// the first time it's been seen (the caller should proceed), or `false` if
/// it's a repeat (the caller should skip dispatch).
pub fn dedupe_check_and_record(txn: &mut Transaction<'_, Write>, message_id: &[u8], now: i64) -> Result<bool> {
    if txn.get(DEDUPE, message_id)?.is_some() {
        return Ok(false);
    }
    let mut record = [0u8; 13];
    record[0] = 1;
    record[1..9].copy_from_slice(&now.to_le_bytes());
    txn.put(DEDUPE, message_id, &record, PutFlags::empty())?;
    Ok(true)
}
