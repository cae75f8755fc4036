//! The message frame wire envelope (spec §4.9 "Message frame", §6).
//!
//! A versioned binary envelope carried through the inbox/outbox. Decoding
//! is strict: an unrecognised minor version is a distinct [`Error::Version`]
//! and any length prefix that disagrees with the remaining byte count is a
//! distinct [`Error::corrupt`] ("truncated").

use crate::error::{Error, Result};
use bitflags::bitflags;
use byteorder::{ByteOrder, LittleEndian};

/// Envelope format major version this build writes and accepts.
pub const FRAME_MAJOR: u8 = 1;
/// Highest minor version this build recognises.
pub const FRAME_MINOR: u8 = 0;

bitflags! {
    /// Per-message flags (spec §4.9 "dedupe guard").
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FrameFlags: u8 {
        /// Run the dedupe guard against this message's id before dispatch.
        const DEDUPE = 0x01;
    }
}

/// The decoded contents of a message frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageFrame {
    /// Application-defined message kind.
    pub kind: u8,
    /// Envelope flags.
    pub flags: FrameFlags,
    /// The worker this message is addressed to.
    pub target_worker: u64,
    /// The worker that routed/produced this message.
    pub routing_worker: u64,
    /// The timestamp at which this message was routed.
    pub routing_timestamp: i64,
    /// The worker that originated the causal chain, if tracked.
    pub origin_worker: Option<u64>,
    /// Application-defined message identity, used by the dedupe guard.
    pub message_id: Vec<u8>,
    /// Optional distributed trace id.
    pub trace_id: Option<Vec<u8>>,
    /// Optional application payload.
    pub payload: Option<Vec<u8>>,
}

impl MessageFrame {
    /// Encode this frame into its wire form.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(32 + self.message_id.len());
        buf.push(FRAME_MAJOR);
        buf.push(FRAME_MINOR);
        buf.push(self.kind);
        buf.push(self.flags.bits());
        push_u64(&mut buf, self.target_worker);
        push_u64(&mut buf, self.routing_worker);
        push_i64(&mut buf, self.routing_timestamp);
        match self.origin_worker {
            Some(w) => {
                buf.push(1);
                push_u64(&mut buf, w);
            }
            None => buf.push(0),
        }
        push_lenvec(&mut buf, &self.message_id);
        push_option_lenvec(&mut buf, self.trace_id.as_deref());
        push_option_lenvec(&mut buf, self.payload.as_deref());
        buf
    }

    /// Decode a frame from its wire form.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut c = Cursor { bytes, pos: 0 };
        let major = c.byte()?;
        let minor = c.byte()?;
        if major != FRAME_MAJOR {
            return Err(Error::Version(format!("unsupported frame major version {major}")));
        }
        if minor > FRAME_MINOR {
            return Err(Error::Version(format!("unsupported frame minor version {minor}")));
        }
        let kind = c.byte()?;
        let flags = FrameFlags::from_bits_truncate(c.byte()?);
        let target_worker = c.u64()?;
        let routing_worker = c.u64()?;
        let routing_timestamp = c.i64()?;
        let origin_worker = if c.byte()? != 0 { Some(c.u64()?) } else { None };
        let message_id = c.lenvec()?;
        let trace_id = if c.byte()? != 0 { Some(c.lenvec()?) } else { None };
        let payload = if c.byte()? != 0 { Some(c.lenvec()?) } else { None };
        Ok(MessageFrame {
            kind,
            flags,
            target_worker,
            routing_worker,
            routing_timestamp,
            origin_worker,
            message_id,
            trace_id,
            payload,
        })
    }
}

fn push_u64(buf: &mut Vec<u8>, v: u64) {
    let mut tmp = [0u8; 8];
    LittleEndian::write_u64(&mut tmp, v);
    buf.extend_from_slice(&tmp);
}

fn push_i64(buf: &mut Vec<u8>, v: i64) {
    let mut tmp = [0u8; 8];
    LittleEndian::write_i64(&mut tmp, v);
    buf.extend_from_slice(&tmp);
}

fn push_lenvec(buf: &mut Vec<u8>, data: &[u8]) {
    let mut tmp = [0u8; 4];
    LittleEndian::write_u32(&mut tmp, data.len() as u32);
    buf.extend_from_slice(&tmp);
    buf.extend_from_slice(data);
}

fn push_option_lenvec(buf: &mut Vec<u8>, data: Option<&[u8]>) {
    match data {
        Some(d) => {
            buf.push(1);
            push_lenvec(buf, d);
        }
        None => buf.push(0),
    }
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn need(&self, n: usize) -> Result<()> {
        if self.pos + n > self.bytes.len() {
            Err(Error::corrupt("truncated message frame"))
        } else {
            Ok(())
        }
    }

    fn byte(&mut self) -> Result<u8> {
        self.need(1)?;
        let b = self.bytes[self.pos];
        self.pos += 1;
        Ok(b)
    }

    fn u64(&mut self) -> Result<u64> {
        self.need(8)?;
        let v = LittleEndian::read_u64(&self.bytes[self.pos..]);
        self.pos += 8;
        Ok(v)
    }

    fn i64(&mut self) -> Result<i64> {
        self.need(8)?;
        let v = LittleEndian::read_i64(&self.bytes[self.pos..]);
        self.pos += 8;
        Ok(v)
    }

    fn lenvec(&mut self) -> Result<Vec<u8>> {
        self.need(4)?;
        let len = LittleEndian::read_u32(&self.bytes[self.pos..]) as usize;
        self.pos += 4;
        self.need(len)?;
        let out = self.bytes[self.pos..self.pos + len].to_vec();
        self.pos += len;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> MessageFrame {
        MessageFrame {
            kind: 7,
            flags: FrameFlags::DEDUPE,
            target_worker: 42,
            routing_worker: 9,
            routing_timestamp: -100,
            origin_worker: Some(1),
            message_id: b"msg-1".to_vec(),
            trace_id: Some(b"trace-1".to_vec()),
            payload: Some(b"hello".to_vec()),
        }
    }

    #[test]
    fn round_trips() {
        let frame = sample();
        let encoded = frame.encode();
        let decoded = MessageFrame::decode(&encoded).unwrap();
        assert_eq!(frame, decoded);
    }

    #[test]
    fn round_trips_with_all_optionals_absent() {
        let frame = MessageFrame {
            kind: 1,
            flags: FrameFlags::empty(),
            target_worker: 1,
            routing_worker: 1,
            routing_timestamp: 0,
            origin_worker: None,
            message_id: b"m".to_vec(),
            trace_id: None,
            payload: None,
        };
        let encoded = frame.encode();
        assert_eq!(MessageFrame::decode(&encoded).unwrap(), frame);
    }

    #[test]
    fn rejects_unknown_minor_version() {
        let mut encoded = sample().encode();
        encoded[1] = FRAME_MINOR + 1;
        assert!(matches!(MessageFrame::decode(&encoded), Err(Error::Version(_))));
    }

    #[test]
    fn rejects_truncated_stream() {
        let encoded = sample().encode();
        let truncated = &encoded[..encoded.len() - 3];
        assert!(matches!(MessageFrame::decode(truncated), Err(Error::Corrupt { .. })));
    }
}
