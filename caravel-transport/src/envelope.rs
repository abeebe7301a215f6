//! Envelopes: the framed, typed message unit of the runtime.
//!
//! An envelope carries addressing, correlation and a payload; the payload of
//! a `Send`/`Tell` is a [`CallFrame`] (dispatch tag + codec-encoded body),
//! possibly batched. Header layout on the wire is owned by [`crate::wire`].

use crate::addr::ActorRef;
use crate::error::{ErrorKind, ErrorPayload, WireError};
use crate::wire::Cursor;
use bitflags::bitflags;
use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Envelope kind discriminant. Wire values are fixed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EnvelopeKind {
    /// Request expecting a reply.
    Send = 1,
    /// Fire-and-forget.
    Tell = 2,
    /// Successful reply, matched by correlation id.
    Reply = 3,
    /// Failed reply, matched by correlation id. Payload is [`ErrorPayload`].
    Error = 4,
    /// Cancel an in-flight request, matched by correlation id.
    Cancel = 5,
    /// Runtime control traffic (heartbeats, handshake, pool control).
    Control = 6,
}

impl EnvelopeKind {
    pub fn from_wire(value: u8) -> Result<Self, WireError> {
        Ok(match value {
            1 => Self::Send,
            2 => Self::Tell,
            3 => Self::Reply,
            4 => Self::Error,
            5 => Self::Cancel,
            6 => Self::Control,
            other => {
                return Err(WireError::MalformedHeader(format!(
                    "unknown envelope kind {other}"
                )))
            }
        })
    }
}

bitflags! {
    /// Envelope control flags.
    ///
    /// The three `HAS_*` bits record which optional header fields are
    /// present on the wire; they are derived at encode time and never set
    /// by callers.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EnvelopeFlags: u16 {
        /// `correlation_id` present.
        const HAS_CORRELATION = 1 << 0;
        /// `deadline_unix_ns` present.
        const HAS_DEADLINE = 1 << 1;
        /// `from` present.
        const HAS_FROM = 1 << 2;
        /// A `Tell` requesting an empty `Reply` once enqueued.
        const TELL_ACK = 1 << 3;
        /// Payload is a batch of calls ([`CallFrame::encode_batch`]).
        const BATCH = 1 << 4;
        /// Payload bypassed the codec (in-memory transport).
        const CODEC_BYPASS = 1 << 5;
    }
}

/// A framed message unit.
///
/// `Send` expects a reply; `Tell` is fire-and-forget; `Reply`/`Error`
/// match their request by `correlation_id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Process-unique id, allocated monotonically per process.
    pub envelope_id: u64,
    pub kind: EnvelopeKind,
    pub from: Option<ActorRef>,
    pub to: ActorRef,
    pub correlation_id: Option<u64>,
    /// Absolute deadline as Unix nanoseconds; receivers recover a
    /// monotonic remaining budget via [`Envelope::remaining`].
    pub deadline_unix_ns: Option<u64>,
    pub codec_id: u8,
    pub flags: EnvelopeFlags,
    pub payload: Bytes,
}

impl Envelope {
    /// A request expecting a reply. Correlation defaults to the envelope id.
    pub fn send(id: u64, from: ActorRef, to: ActorRef, codec_id: u8, payload: Bytes) -> Self {
        Self {
            envelope_id: id,
            kind: EnvelopeKind::Send,
            from: Some(from),
            to,
            correlation_id: Some(id),
            deadline_unix_ns: None,
            codec_id,
            flags: EnvelopeFlags::empty(),
            payload,
        }
    }

    /// A fire-and-forget message.
    pub fn tell(id: u64, from: ActorRef, to: ActorRef, codec_id: u8, payload: Bytes) -> Self {
        Self {
            envelope_id: id,
            kind: EnvelopeKind::Tell,
            from: Some(from),
            to,
            correlation_id: None,
            deadline_unix_ns: None,
            codec_id,
            flags: EnvelopeFlags::empty(),
            payload,
        }
    }

    /// A successful reply to `request`, with sender and destination swapped.
    pub fn reply(id: u64, request: &Envelope, payload: Bytes) -> Self {
        Self {
            envelope_id: id,
            kind: EnvelopeKind::Reply,
            from: Some(request.to.clone()),
            to: request.reply_target(),
            correlation_id: request.correlation_id,
            deadline_unix_ns: None,
            codec_id: request.codec_id,
            flags: EnvelopeFlags::empty(),
            payload,
        }
    }

    /// A failed reply to `request`.
    pub fn error(id: u64, request: &Envelope, kind: ErrorKind, reason: impl Into<String>) -> Self {
        Self {
            envelope_id: id,
            kind: EnvelopeKind::Error,
            from: Some(request.to.clone()),
            to: request.reply_target(),
            correlation_id: request.correlation_id,
            deadline_unix_ns: None,
            codec_id: request.codec_id,
            flags: EnvelopeFlags::empty(),
            payload: Bytes::from(ErrorPayload::new(kind, reason).encode()),
        }
    }

    /// Cancel the in-flight request identified by `correlation_id`.
    pub fn cancel(id: u64, from: ActorRef, to: ActorRef, correlation_id: u64) -> Self {
        Self {
            envelope_id: id,
            kind: EnvelopeKind::Cancel,
            from: Some(from),
            to,
            correlation_id: Some(correlation_id),
            deadline_unix_ns: None,
            codec_id: crate::codec::CODEC_ID_RAW,
            flags: EnvelopeFlags::empty(),
            payload: Bytes::new(),
        }
    }

    /// A control envelope addressed to a process's control endpoint.
    pub fn control(id: u64, to: ActorRef, payload: Bytes) -> Self {
        Self {
            envelope_id: id,
            kind: EnvelopeKind::Control,
            from: None,
            to,
            correlation_id: None,
            deadline_unix_ns: None,
            codec_id: crate::codec::CODEC_ID_JSON,
            flags: EnvelopeFlags::empty(),
            payload,
        }
    }

    /// Where a reply to this envelope should be addressed. Falls back to
    /// the destination's control endpoint when the sender is anonymous.
    pub fn reply_target(&self) -> ActorRef {
        match &self.from {
            Some(from) => from.clone(),
            None => ActorRef::control(self.to.address.endpoint()),
        }
    }

    /// Stamp an absolute deadline `budget` from now.
    pub fn with_deadline(mut self, budget: Duration) -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO);
        self.deadline_unix_ns = Some((now + budget).as_nanos() as u64);
        self
    }

    /// Remaining budget before the deadline, if one is set. `Some(ZERO)`
    /// means already expired.
    pub fn remaining(&self) -> Option<Duration> {
        let deadline = self.deadline_unix_ns?;
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_nanos() as u64;
        Some(Duration::from_nanos(deadline.saturating_sub(now)))
    }

    /// Total serialized weight used for flow-control accounting.
    pub fn weight(&self) -> usize {
        self.payload.len() + 64
    }
}

/// Dispatch frame inside `Send`/`Tell` payloads: a handler tag followed by
/// the codec-encoded body.
///
/// Wire layout: `tag_len:u16 BE | tag (UTF-8) | body`. Batches prepend a
/// `count:u32 BE` and repeat `tag_len | tag | body_len:u32 BE | body`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallFrame {
    pub tag: String,
    pub body: Bytes,
}

impl CallFrame {
    pub fn new(tag: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self {
            tag: tag.into(),
            body: body.into(),
        }
    }

    pub fn encode(&self) -> Bytes {
        let tag = self.tag.as_bytes();
        let mut out = Vec::with_capacity(2 + tag.len() + self.body.len());
        out.extend_from_slice(&(tag.len() as u16).to_be_bytes());
        out.extend_from_slice(tag);
        out.extend_from_slice(&self.body);
        Bytes::from(out)
    }

    pub fn decode(payload: &[u8]) -> Result<Self, WireError> {
        if payload.len() < 2 {
            return Err(WireError::InsufficientData {
                needed: 2,
                have: payload.len(),
            });
        }
        let tag_len = u16::from_be_bytes([payload[0], payload[1]]) as usize;
        if payload.len() < 2 + tag_len {
            return Err(WireError::InsufficientData {
                needed: 2 + tag_len,
                have: payload.len(),
            });
        }
        let tag = std::str::from_utf8(&payload[2..2 + tag_len])
            .map_err(|_| WireError::MalformedHeader("call tag is not UTF-8".into()))?
            .to_string();
        Ok(Self {
            tag,
            body: Bytes::copy_from_slice(&payload[2 + tag_len..]),
        })
    }

    /// Coalesce an ordered list of calls into one batch payload.
    pub fn encode_batch(calls: &[CallFrame]) -> Bytes {
        let mut out = Vec::new();
        out.extend_from_slice(&(calls.len() as u32).to_be_bytes());
        for call in calls {
            let tag = call.tag.as_bytes();
            out.extend_from_slice(&(tag.len() as u16).to_be_bytes());
            out.extend_from_slice(tag);
            out.extend_from_slice(&(call.body.len() as u32).to_be_bytes());
            out.extend_from_slice(&call.body);
        }
        Bytes::from(out)
    }

    /// Decode a batch payload back into its ordered sub-calls.
    pub fn decode_batch(payload: &[u8]) -> Result<Vec<CallFrame>, WireError> {
        let mut cursor = Cursor::new(payload);
        let count = cursor.read_u32()?;
        let mut calls = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let tag_len = cursor.read_u16()? as usize;
            let tag = std::str::from_utf8(cursor.read_bytes(tag_len)?)
                .map_err(|_| WireError::MalformedHeader("batch tag is not UTF-8".into()))?
                .to_string();
            let body_len = cursor.read_u32()? as usize;
            let body = Bytes::copy_from_slice(cursor.read_bytes(body_len)?);
            calls.push(CallFrame { tag, body });
        }
        Ok(calls)
    }
}

/// Per-item outcome inside a batch reply. Item failures never abort the
/// remainder of the batch.
///
/// Wire layout: `count:u32 BE`, then per item either
/// `0x00 | len:u32 | body` or `0x01 | code:u16 | reason_len:u32 | reason`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchItemReply {
    Ok(Bytes),
    Err(ErrorPayload),
}

impl BatchItemReply {
    pub fn encode_all(items: &[BatchItemReply]) -> Bytes {
        let mut out = Vec::new();
        out.extend_from_slice(&(items.len() as u32).to_be_bytes());
        for item in items {
            match item {
                BatchItemReply::Ok(body) => {
                    out.push(0);
                    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
                    out.extend_from_slice(body);
                }
                BatchItemReply::Err(err) => {
                    out.push(1);
                    out.extend_from_slice(&err.kind.code().to_be_bytes());
                    let reason = err.reason.as_bytes();
                    out.extend_from_slice(&(reason.len() as u32).to_be_bytes());
                    out.extend_from_slice(reason);
                }
            }
        }
        Bytes::from(out)
    }

    pub fn decode_all(payload: &[u8]) -> Result<Vec<BatchItemReply>, WireError> {
        let mut cursor = Cursor::new(payload);
        let count = cursor.read_u32()?;
        let mut items = Vec::with_capacity(count as usize);
        for _ in 0..count {
            match cursor.read_u8()? {
                0 => {
                    let len = cursor.read_u32()? as usize;
                    items.push(BatchItemReply::Ok(Bytes::copy_from_slice(
                        cursor.read_bytes(len)?,
                    )));
                }
                1 => {
                    let code = cursor.read_u16()?;
                    let len = cursor.read_u32()? as usize;
                    let reason = String::from_utf8_lossy(cursor.read_bytes(len)?).into_owned();
                    let kind = ErrorKind::from_code(code).unwrap_or(ErrorKind::ProtocolError);
                    items.push(BatchItemReply::Err(ErrorPayload::new(kind, reason)));
                }
                other => {
                    return Err(WireError::MalformedHeader(format!(
                        "unknown batch item status {other}"
                    )))
                }
            }
        }
        Ok(items)
    }
}

/// Monotonic envelope id allocator.
///
/// Ids double as correlation ids for `Send`. Allocation is monotonic per
/// allocator, and the starting point is derived from wall clock and pid
/// so that envelopes forwarded from different processes onto one shared
/// channel do not collide in its pending-reply table.
#[derive(Debug)]
pub struct EnvelopeIdAllocator {
    next: AtomicU64,
}

impl EnvelopeIdAllocator {
    pub fn new() -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_nanos() as u64;
        let pid = (std::process::id() as u64) << 32;
        // Zero is reserved as "no correlation".
        Self {
            next: AtomicU64::new((nanos ^ pid) | 1),
        }
    }

    pub fn next(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for EnvelopeIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::{ActorUid, Address};

    fn test_ref(uid: &str) -> ActorRef {
        ActorRef::new(ActorUid::from(uid), Address::parse("tcp://127.0.0.1:5000").unwrap())
    }

    #[test]
    fn test_reply_swaps_endpoints() {
        let request = Envelope::send(7, test_ref("caller"), test_ref("callee"), 1, Bytes::new());
        let reply = Envelope::reply(8, &request, Bytes::from_static(b"ok"));
        assert_eq!(reply.kind, EnvelopeKind::Reply);
        assert_eq!(reply.correlation_id, Some(7));
        assert_eq!(reply.to, test_ref("caller"));
        assert_eq!(reply.from, Some(test_ref("callee")));
    }

    #[test]
    fn test_error_envelope_payload() {
        let request = Envelope::send(1, test_ref("a"), test_ref("b"), 1, Bytes::new());
        let err = Envelope::error(2, &request, ErrorKind::ActorNotFound, "no such actor");
        let decoded = ErrorPayload::decode(&err.payload);
        assert_eq!(decoded.kind, ErrorKind::ActorNotFound);
        assert_eq!(decoded.reason, "no such actor");
    }

    #[test]
    fn test_deadline_remaining() {
        let env = Envelope::tell(1, test_ref("a"), test_ref("b"), 1, Bytes::new())
            .with_deadline(Duration::from_secs(60));
        let remaining = env.remaining().expect("deadline set");
        assert!(remaining > Duration::from_secs(59));
        assert!(remaining <= Duration::from_secs(60));
    }

    #[test]
    fn test_call_frame_round_trip() {
        let frame = CallFrame::new("Increment", Bytes::from_static(b"{\"by\":1}"));
        let decoded = CallFrame::decode(&frame.encode()).unwrap();
        assert_eq!(frame, decoded);
    }

    #[test]
    fn test_call_frame_truncated() {
        let frame = CallFrame::new("Increment", Bytes::from_static(b"body"));
        let encoded = frame.encode();
        assert!(matches!(
            CallFrame::decode(&encoded[..3]),
            Err(WireError::InsufficientData { .. })
        ));
    }

    #[test]
    fn test_batch_round_trip_preserves_order() {
        let calls = vec![
            CallFrame::new("A", Bytes::from_static(b"1")),
            CallFrame::new("B", Bytes::new()),
            CallFrame::new("A", Bytes::from_static(b"33")),
        ];
        let decoded = CallFrame::decode_batch(&CallFrame::encode_batch(&calls)).unwrap();
        assert_eq!(calls, decoded);
    }

    #[test]
    fn test_batch_reply_mixed_outcomes() {
        let items = vec![
            BatchItemReply::Ok(Bytes::from_static(b"r1")),
            BatchItemReply::Err(ErrorPayload::new(ErrorKind::ActorFailed, "boom")),
            BatchItemReply::Ok(Bytes::new()),
        ];
        let decoded = BatchItemReply::decode_all(&BatchItemReply::encode_all(&items)).unwrap();
        assert_eq!(items, decoded);
    }

    #[test]
    fn test_id_allocator_is_monotonic() {
        let alloc = EnvelopeIdAllocator::new();
        let a = alloc.next();
        let b = alloc.next();
        assert!(b > a);
    }
}
