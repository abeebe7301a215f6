//! Frame layout for envelopes on byte-stream transports.
//!
//! ```text
//! magic      : 4 bytes = 0x58 0x4F 0x53 0x43  ("XOSC")
//! total_len  : u32 big-endian, header + payload length
//! header_len : u16 big-endian
//! header     : header_len bytes
//!   envelope_id      : u64
//!   kind             : u8
//!   codec_id         : u8
//!   flags            : u16
//!   correlation_id   : u64, present iff HAS_CORRELATION
//!   deadline_unix_ns : u64, present iff HAS_DEADLINE
//!   from             : length-prefixed address + uid, present iff HAS_FROM
//!   to               : length-prefixed address + uid
//! payload    : total_len - header_len bytes
//! ```
//!
//! All integers are big-endian. Addresses and uids are length-prefixed
//! with a u16. The in-memory driver never frames; envelopes cross it as
//! values.

use crate::addr::{ActorRef, ActorUid, Address};
use crate::envelope::{Envelope, EnvelopeFlags, EnvelopeKind};
use crate::error::WireError;
use bytes::Bytes;

/// Frame magic: `XOSC`.
pub const MAGIC: [u8; 4] = [0x58, 0x4F, 0x53, 0x43];

/// Fixed prefix before the header: magic + total_len + header_len.
pub const PREFIX_LEN: usize = 4 + 4 + 2;

/// Default maximum envelope size: 256 MiB.
pub const DEFAULT_MAX_ENVELOPE_BYTES: usize = 256 * 1024 * 1024;

/// Stateless envelope framer with a configured size ceiling.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_envelope_bytes: usize,
}

impl FrameCodec {
    pub fn new(max_envelope_bytes: usize) -> Self {
        Self { max_envelope_bytes }
    }

    pub fn max_envelope_bytes(&self) -> usize {
        self.max_envelope_bytes
    }

    /// Encode one envelope into a ready-to-write frame.
    ///
    /// # Errors
    ///
    /// `EnvelopeTooLarge` when header + payload exceed the ceiling. This
    /// is the send-side `PayloadTooLarge` check.
    pub fn encode(&self, env: &Envelope) -> Result<Vec<u8>, WireError> {
        let mut header = Vec::with_capacity(64);

        // Presence bits are derived here, never trusted from the caller.
        let mut flags = env.flags;
        flags.remove(
            EnvelopeFlags::HAS_CORRELATION | EnvelopeFlags::HAS_DEADLINE | EnvelopeFlags::HAS_FROM,
        );
        if env.correlation_id.is_some() {
            flags |= EnvelopeFlags::HAS_CORRELATION;
        }
        if env.deadline_unix_ns.is_some() {
            flags |= EnvelopeFlags::HAS_DEADLINE;
        }
        if env.from.is_some() {
            flags |= EnvelopeFlags::HAS_FROM;
        }

        header.extend_from_slice(&env.envelope_id.to_be_bytes());
        header.push(env.kind as u8);
        header.push(env.codec_id);
        header.extend_from_slice(&flags.bits().to_be_bytes());
        if let Some(correlation) = env.correlation_id {
            header.extend_from_slice(&correlation.to_be_bytes());
        }
        if let Some(deadline) = env.deadline_unix_ns {
            header.extend_from_slice(&deadline.to_be_bytes());
        }
        if let Some(from) = &env.from {
            write_ref(&mut header, from);
        }
        write_ref(&mut header, &env.to);

        let total_len = header.len() + env.payload.len();
        if total_len > self.max_envelope_bytes {
            return Err(WireError::EnvelopeTooLarge {
                size: total_len,
                max: self.max_envelope_bytes,
            });
        }

        let mut frame = Vec::with_capacity(PREFIX_LEN + total_len);
        frame.extend_from_slice(&MAGIC);
        frame.extend_from_slice(&(total_len as u32).to_be_bytes());
        frame.extend_from_slice(&(header.len() as u16).to_be_bytes());
        frame.extend_from_slice(&header);
        frame.extend_from_slice(&env.payload);
        Ok(frame)
    }

    /// Decode a complete frame.
    pub fn decode(&self, data: &[u8]) -> Result<Envelope, WireError> {
        match self.try_decode(data)? {
            Some((env, _)) => Ok(env),
            None => Err(WireError::InsufficientData {
                needed: PREFIX_LEN,
                have: data.len(),
            }),
        }
    }

    /// Streaming decode: parse one frame from the front of `data` if it is
    /// complete.
    ///
    /// Returns `Ok(None)` when more bytes are needed; `Ok(Some((env, n)))`
    /// consumed `n` bytes.
    pub fn try_decode(&self, data: &[u8]) -> Result<Option<(Envelope, usize)>, WireError> {
        if data.len() < PREFIX_LEN {
            return Ok(None);
        }
        if data[0..4] != MAGIC {
            return Err(WireError::BadMagic(u32::from_be_bytes([
                data[0], data[1], data[2], data[3],
            ])));
        }
        let total_len = u32::from_be_bytes([data[4], data[5], data[6], data[7]]) as usize;
        let header_len = u16::from_be_bytes([data[8], data[9]]) as usize;

        if total_len > self.max_envelope_bytes {
            return Err(WireError::EnvelopeTooLarge {
                size: total_len,
                max: self.max_envelope_bytes,
            });
        }
        if header_len > total_len {
            return Err(WireError::MalformedHeader(format!(
                "header_len {header_len} exceeds total_len {total_len}"
            )));
        }
        if data.len() < PREFIX_LEN + total_len {
            return Ok(None);
        }

        let header = &data[PREFIX_LEN..PREFIX_LEN + header_len];
        let payload = &data[PREFIX_LEN + header_len..PREFIX_LEN + total_len];

        let mut cursor = Cursor::new(header);
        let envelope_id = cursor.read_u64()?;
        let kind = EnvelopeKind::from_wire(cursor.read_u8()?)?;
        let codec_id = cursor.read_u8()?;
        let flags = EnvelopeFlags::from_bits_truncate(cursor.read_u16()?);

        let correlation_id = if flags.contains(EnvelopeFlags::HAS_CORRELATION) {
            Some(cursor.read_u64()?)
        } else {
            None
        };
        let deadline_unix_ns = if flags.contains(EnvelopeFlags::HAS_DEADLINE) {
            Some(cursor.read_u64()?)
        } else {
            None
        };
        let from = if flags.contains(EnvelopeFlags::HAS_FROM) {
            Some(read_ref(&mut cursor)?)
        } else {
            None
        };
        let to = read_ref(&mut cursor)?;

        let env = Envelope {
            envelope_id,
            kind,
            from,
            to,
            correlation_id,
            deadline_unix_ns,
            codec_id,
            flags,
            payload: Bytes::copy_from_slice(payload),
        };
        Ok(Some((env, PREFIX_LEN + total_len)))
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ENVELOPE_BYTES)
    }
}

fn write_ref(buf: &mut Vec<u8>, actor_ref: &ActorRef) {
    let addr = actor_ref.address.to_string();
    buf.extend_from_slice(&(addr.len() as u16).to_be_bytes());
    buf.extend_from_slice(addr.as_bytes());
    let uid = actor_ref.uid.as_bytes();
    buf.extend_from_slice(&(uid.len() as u16).to_be_bytes());
    buf.extend_from_slice(uid);
}

fn read_ref(cursor: &mut Cursor<'_>) -> Result<ActorRef, WireError> {
    let addr_len = cursor.read_u16()? as usize;
    let addr_str = std::str::from_utf8(cursor.read_bytes(addr_len)?)
        .map_err(|_| WireError::MalformedHeader("address is not UTF-8".into()))?;
    let address = Address::parse(addr_str)
        .map_err(|e| WireError::MalformedHeader(format!("bad address {addr_str:?}: {e}")))?;
    let uid_len = cursor.read_u16()? as usize;
    let uid = ActorUid::new(cursor.read_bytes(uid_len)?.to_vec())
        .map_err(|e| WireError::MalformedHeader(e.to_string()))?;
    Ok(ActorRef::new(uid, address))
}

/// Bounds-checked big-endian reader over a byte slice.
pub(crate) struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub(crate) fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], WireError> {
        if self.data.len() - self.pos < len {
            return Err(WireError::InsufficientData {
                needed: self.pos + len,
                have: self.data.len(),
            });
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    pub(crate) fn read_u8(&mut self) -> Result<u8, WireError> {
        Ok(self.read_bytes(1)?[0])
    }

    pub(crate) fn read_u16(&mut self) -> Result<u16, WireError> {
        let b = self.read_bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub(crate) fn read_u32(&mut self) -> Result<u32, WireError> {
        let b = self.read_bytes(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub(crate) fn read_u64(&mut self) -> Result<u64, WireError> {
        let b = self.read_bytes(8)?;
        Ok(u64::from_be_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::CODEC_ID_JSON;
    use std::time::Duration;

    fn test_ref(uid: &str, addr: &str) -> ActorRef {
        ActorRef::new(ActorUid::from(uid), Address::parse(addr).unwrap())
    }

    fn sample_send() -> Envelope {
        Envelope::send(
            42,
            test_ref("caller", "tcp://10.0.0.1:5000"),
            test_ref("echo", "unix:///tmp/pool.sock/subpool/2"),
            CODEC_ID_JSON,
            Bytes::from_static(b"{\"msg\":\"hi\"}"),
        )
        .with_deadline(Duration::from_secs(30))
    }

    #[test]
    fn test_frame_round_trip() {
        let codec = FrameCodec::default();
        let env = sample_send();
        let frame = codec.encode(&env).unwrap();

        assert_eq!(&frame[0..4], &MAGIC);
        let (decoded, consumed) = codec.try_decode(&frame).unwrap().expect("complete frame");
        assert_eq!(consumed, frame.len());
        // Presence flags are derived during encode, so compare field by field.
        assert_eq!(decoded.envelope_id, env.envelope_id);
        assert_eq!(decoded.kind, env.kind);
        assert_eq!(decoded.codec_id, env.codec_id);
        assert_eq!(decoded.correlation_id, env.correlation_id);
        assert_eq!(decoded.deadline_unix_ns, env.deadline_unix_ns);
        assert_eq!(decoded.from, env.from);
        assert_eq!(decoded.to, env.to);
        assert_eq!(decoded.payload, env.payload);
    }

    #[test]
    fn test_frame_without_optional_fields() {
        let codec = FrameCodec::default();
        let env = Envelope::control(
            1,
            ActorRef::control(Address::parse("tcp://h:1").unwrap()),
            Bytes::from_static(b"{}"),
        );
        let frame = codec.encode(&env).unwrap();
        let decoded = codec.decode(&frame).unwrap();
        assert_eq!(decoded.correlation_id, None);
        assert_eq!(decoded.deadline_unix_ns, None);
        assert_eq!(decoded.from, None);
        assert_eq!(decoded.to, env.to);
    }

    #[test]
    fn test_try_decode_partial_returns_none() {
        let codec = FrameCodec::default();
        let frame = codec.encode(&sample_send()).unwrap();
        for cut in [0, 3, PREFIX_LEN, PREFIX_LEN + 5, frame.len() - 1] {
            assert!(codec.try_decode(&frame[..cut]).unwrap().is_none());
        }
    }

    #[test]
    fn test_try_decode_two_back_to_back_frames() {
        let codec = FrameCodec::default();
        let first = codec.encode(&sample_send()).unwrap();
        let mut buffer = first.clone();
        let second_env = Envelope::tell(
            9,
            test_ref("a", "tcp://h:1"),
            test_ref("b", "tcp://h:2"),
            CODEC_ID_JSON,
            Bytes::from_static(b"x"),
        );
        buffer.extend_from_slice(&codec.encode(&second_env).unwrap());

        let (env1, n1) = codec.try_decode(&buffer).unwrap().unwrap();
        assert_eq!(env1.envelope_id, 42);
        assert_eq!(n1, first.len());
        let (env2, _) = codec.try_decode(&buffer[n1..]).unwrap().unwrap();
        assert_eq!(env2.envelope_id, 9);
    }

    #[test]
    fn test_bad_magic_rejected() {
        let codec = FrameCodec::default();
        let mut frame = codec.encode(&sample_send()).unwrap();
        frame[0] = b'Y';
        assert!(matches!(
            codec.try_decode(&frame),
            Err(WireError::BadMagic(_))
        ));
    }

    #[test]
    fn test_oversized_envelope_rejected_on_encode() {
        let codec = FrameCodec::new(128);
        let mut env = sample_send();
        env.payload = Bytes::from(vec![0u8; 256]);
        assert!(matches!(
            codec.encode(&env),
            Err(WireError::EnvelopeTooLarge { .. })
        ));
    }

    #[test]
    fn test_oversized_envelope_rejected_on_decode() {
        // Receiver configured with a smaller ceiling than the sender.
        let big = FrameCodec::new(1024 * 1024);
        let small = FrameCodec::new(64);
        let frame = big.encode(&sample_send()).unwrap();
        assert!(matches!(
            small.try_decode(&frame),
            Err(WireError::EnvelopeTooLarge { .. })
        ));
    }

    #[test]
    fn test_header_len_bounds_checked() {
        let codec = FrameCodec::default();
        let mut frame = codec.encode(&sample_send()).unwrap();
        // Claim a header longer than the whole frame body.
        frame[8] = 0xFF;
        frame[9] = 0xFF;
        assert!(matches!(
            codec.try_decode(&frame),
            Err(WireError::MalformedHeader(_))
        ));
    }
}
