//! Error taxonomy shared across the runtime.
//!
//! [`ErrorKind`] is the wire-level error vocabulary: every kind has a stable
//! numeric code so that `Error` envelopes can be decoded by any peer,
//! regardless of release. Transport-internal failures ([`WireError`],
//! [`ChannelError`]) convert into `PeerGone` or `ProtocolError` before they
//! become visible to callers.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable error kinds carried in `Error` envelopes.
///
/// The numeric codes are part of the wire protocol and must never be
/// renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ErrorKind {
    /// Destination actor does not exist (or lookup retries were exhausted).
    ActorNotFound = 1,
    /// An actor with the requested uid already exists.
    Duplicate = 2,
    /// The remote process disconnected or is unreachable.
    PeerGone = 3,
    /// The call deadline expired before a reply arrived.
    Timeout = 4,
    /// The call was cancelled before it began executing.
    Cancelled = 5,
    /// The outbound queue high-water mark was exceeded on a deadline call.
    Backpressure = 6,
    /// Payload exceeds the configured maximum envelope size.
    PayloadTooLarge = 7,
    /// The envelope's codec id is not registered on the receiving side.
    UnsupportedCodec = 8,
    /// A handler attempted a synchronous call to its own actor.
    Reentrancy = 9,
    /// The sub-pool hosting the actor went down.
    SubPoolLost = 10,
    /// The actor was quarantined after repeated handler failures.
    ActorFailed = 11,
    /// Malformed frame, handshake mismatch, or other protocol violation.
    ProtocolError = 12,
    /// A runtime invariant was violated. Fatal to the current handler only.
    Internal = 13,
}

impl ErrorKind {
    /// Wire code for this kind.
    pub fn code(self) -> u16 {
        self as u16
    }

    /// Decode a wire code. Unknown codes map to `None`; receivers treat
    /// them as [`ErrorKind::ProtocolError`].
    pub fn from_code(code: u16) -> Option<Self> {
        Some(match code {
            1 => Self::ActorNotFound,
            2 => Self::Duplicate,
            3 => Self::PeerGone,
            4 => Self::Timeout,
            5 => Self::Cancelled,
            6 => Self::Backpressure,
            7 => Self::PayloadTooLarge,
            8 => Self::UnsupportedCodec,
            9 => Self::Reentrancy,
            10 => Self::SubPoolLost,
            11 => Self::ActorFailed,
            12 => Self::ProtocolError,
            13 => Self::Internal,
            _ => return None,
        })
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::ActorNotFound => "ActorNotFound",
            Self::Duplicate => "Duplicate",
            Self::PeerGone => "PeerGone",
            Self::Timeout => "Timeout",
            Self::Cancelled => "Cancelled",
            Self::Backpressure => "Backpressure",
            Self::PayloadTooLarge => "PayloadTooLarge",
            Self::UnsupportedCodec => "UnsupportedCodec",
            Self::Reentrancy => "Reentrancy",
            Self::SubPoolLost => "SubPoolLost",
            Self::ActorFailed => "ActorFailed",
            Self::ProtocolError => "ProtocolError",
            Self::Internal => "Internal",
        };
        f.write_str(name)
    }
}

impl Serialize for ErrorKind {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.code().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ErrorKind {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let code = u16::deserialize(deserializer)?;
        // Unknown codes degrade to ProtocolError rather than failing decode,
        // so a newer peer can still report errors to an older one.
        Ok(Self::from_code(code).unwrap_or(Self::ProtocolError))
    }
}

/// Payload of an `Error` envelope: a stable code plus a human-readable
/// reason. Always JSON-encoded, independent of the payload codec, so error
/// reporting never depends on codec negotiation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{kind}: {reason}")]
pub struct ErrorPayload {
    pub kind: ErrorKind,
    pub reason: String,
}

impl ErrorPayload {
    pub fn new(kind: ErrorKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
        }
    }

    /// Encode for an `Error` envelope payload.
    pub fn encode(&self) -> Vec<u8> {
        // Serialization of a code + string cannot fail.
        serde_json::to_vec(self).unwrap_or_default()
    }

    /// Decode from an `Error` envelope payload.
    pub fn decode(bytes: &[u8]) -> Self {
        serde_json::from_slice(bytes).unwrap_or_else(|e| {
            Self::new(
                ErrorKind::ProtocolError,
                format!("undecodable error payload: {e}"),
            )
        })
    }
}

/// Errors raised while framing or parsing envelopes.
#[derive(Debug, Error)]
pub enum WireError {
    /// Frame does not begin with the `XOSC` magic.
    #[error("bad magic: {0:#010x}")]
    BadMagic(u32),

    /// Not enough data to parse the frame.
    #[error("insufficient data: need {needed} bytes, have {have}")]
    InsufficientData { needed: usize, have: usize },

    /// Envelope exceeds the configured maximum size.
    #[error("envelope too large: {size} bytes (max {max})")]
    EnvelopeTooLarge { size: usize, max: usize },

    /// Header field has an invalid value.
    #[error("malformed header: {0}")]
    MalformedHeader(String),

    /// I/O failure on the underlying stream.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl WireError {
    /// Collapse into the wire-visible taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            WireError::EnvelopeTooLarge { .. } => ErrorKind::PayloadTooLarge,
            WireError::Io(_) => ErrorKind::PeerGone,
            _ => ErrorKind::ProtocolError,
        }
    }
}

/// Errors raised by channels and drivers.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The peer disconnected, the connection attempt failed, or the
    /// channel was closed by heartbeat loss.
    #[error("peer gone: {0}")]
    PeerGone(String),

    /// Handshake failed (version mismatch or malformed hello).
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// The channel is draining and refuses new outbound envelopes.
    #[error("channel draining")]
    Draining,

    /// Outbound queue exceeded the high-water mark on a deadline call.
    #[error("outbound queue over high-water mark")]
    Backpressure,

    /// The call deadline expired.
    #[error("request timed out")]
    Timeout,

    /// The request was cancelled.
    #[error("request cancelled")]
    Cancelled,

    /// Framing or parse failure.
    #[error(transparent)]
    Wire(#[from] WireError),

    /// Failed to bind a listener.
    #[error("bind failed: {0}")]
    Bind(String),

    /// No driver registered for the address scheme.
    #[error("no driver for scheme {0}")]
    UnsupportedScheme(crate::addr::Scheme),

    /// Malformed address.
    #[error(transparent)]
    Address(#[from] AddressError),
}

impl ChannelError {
    /// Collapse into the wire-visible taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ChannelError::PeerGone(_) | ChannelError::Draining => ErrorKind::PeerGone,
            ChannelError::Backpressure => ErrorKind::Backpressure,
            ChannelError::Timeout => ErrorKind::Timeout,
            ChannelError::Cancelled => ErrorKind::Cancelled,
            ChannelError::Wire(w) => w.kind(),
            ChannelError::Handshake(_)
            | ChannelError::Bind(_)
            | ChannelError::UnsupportedScheme(_)
            | ChannelError::Address(_) => ErrorKind::ProtocolError,
        }
    }
}

/// Errors raised while parsing addresses.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("invalid address format: {0:?}")]
    InvalidFormat(String),

    #[error("unknown scheme: {0:?}")]
    UnknownScheme(String),

    #[error("scheme {scheme} requires {what}")]
    Missing { scheme: &'static str, what: &'static str },

    #[error("invalid sub-pool index: {0:?}")]
    InvalidSubPool(String),

    #[error("actor uid exceeds 64 bytes: {0} bytes")]
    UidTooLong(usize),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_codes_are_stable() {
        assert_eq!(ErrorKind::ActorNotFound.code(), 1);
        assert_eq!(ErrorKind::Backpressure.code(), 6);
        assert_eq!(ErrorKind::Internal.code(), 13);
        for code in 1..=13u16 {
            let kind = ErrorKind::from_code(code).expect("known code");
            assert_eq!(kind.code(), code);
        }
        assert!(ErrorKind::from_code(0).is_none());
        assert!(ErrorKind::from_code(14).is_none());
    }

    #[test]
    fn test_error_payload_round_trip() {
        let payload = ErrorPayload::new(ErrorKind::Timeout, "deadline expired");
        let decoded = ErrorPayload::decode(&payload.encode());
        assert_eq!(payload, decoded);
    }

    #[test]
    fn test_error_payload_decode_garbage() {
        let decoded = ErrorPayload::decode(b"not json");
        assert_eq!(decoded.kind, ErrorKind::ProtocolError);
    }

    #[test]
    fn test_unknown_code_degrades_to_protocol_error() {
        let json = br#"{"kind":999,"reason":"future kind"}"#;
        let decoded = ErrorPayload::decode(json);
        assert_eq!(decoded.kind, ErrorKind::ProtocolError);
        assert_eq!(decoded.reason, "future kind");
    }
}
