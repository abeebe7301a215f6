//! Pool-level error type.
//!
//! [`PoolError`] is the caller-facing rendering of the wire taxonomy in
//! [`caravel_transport::ErrorKind`]: one variant per kind, each carrying a
//! human-readable reason. Transport failures collapse into `PeerGone` /
//! `ProtocolError` on the way in; errors travel out as `Error` envelopes
//! via [`PoolError::to_payload`].

use caravel_transport::codec::CodecError;
use caravel_transport::{ChannelError, ErrorKind, ErrorPayload, WireError};
use thiserror::Error;

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, PoolError>;

/// Errors surfaced by pool operations.
#[derive(Debug, Clone, Error)]
pub enum PoolError {
    /// Destination actor does not exist.
    #[error("actor not found: {0}")]
    ActorNotFound(String),

    /// An actor with this uid already exists.
    #[error("duplicate actor uid: {0}")]
    Duplicate(String),

    /// The remote process is gone or unreachable.
    #[error("peer gone: {0}")]
    PeerGone(String),

    /// The call deadline expired.
    #[error("timed out: {0}")]
    Timeout(String),

    /// The call was cancelled before it began executing.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// Outbound queue over the high-water mark on a deadline call.
    #[error("backpressure: {0}")]
    Backpressure(String),

    /// Payload exceeds the configured maximum envelope size.
    #[error("payload too large: {0}")]
    PayloadTooLarge(String),

    /// Envelope codec id not registered on the receiving side.
    #[error("unsupported codec: {0}")]
    UnsupportedCodec(String),

    /// Synchronous self-call from a handler.
    #[error("reentrant self-call: {0}")]
    Reentrancy(String),

    /// The sub-pool hosting the actor went down.
    #[error("sub-pool lost: {0}")]
    SubPoolLost(String),

    /// The actor was quarantined after repeated failures, or its handler
    /// reported an application error.
    #[error("actor failed: {0}")]
    ActorFailed(String),

    /// Protocol violation (malformed frame, unknown tag, bad handshake).
    #[error("protocol error: {0}")]
    ProtocolError(String),

    /// Runtime invariant violated. Fatal to the current handler only.
    #[error("internal error: {0}")]
    Internal(String),
}

impl PoolError {
    /// Wire kind for this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ActorNotFound(_) => ErrorKind::ActorNotFound,
            Self::Duplicate(_) => ErrorKind::Duplicate,
            Self::PeerGone(_) => ErrorKind::PeerGone,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Cancelled(_) => ErrorKind::Cancelled,
            Self::Backpressure(_) => ErrorKind::Backpressure,
            Self::PayloadTooLarge(_) => ErrorKind::PayloadTooLarge,
            Self::UnsupportedCodec(_) => ErrorKind::UnsupportedCodec,
            Self::Reentrancy(_) => ErrorKind::Reentrancy,
            Self::SubPoolLost(_) => ErrorKind::SubPoolLost,
            Self::ActorFailed(_) => ErrorKind::ActorFailed,
            Self::ProtocolError(_) => ErrorKind::ProtocolError,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Rebuild from a wire kind and reason.
    pub fn from_kind(kind: ErrorKind, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        match kind {
            ErrorKind::ActorNotFound => Self::ActorNotFound(reason),
            ErrorKind::Duplicate => Self::Duplicate(reason),
            ErrorKind::PeerGone => Self::PeerGone(reason),
            ErrorKind::Timeout => Self::Timeout(reason),
            ErrorKind::Cancelled => Self::Cancelled(reason),
            ErrorKind::Backpressure => Self::Backpressure(reason),
            ErrorKind::PayloadTooLarge => Self::PayloadTooLarge(reason),
            ErrorKind::UnsupportedCodec => Self::UnsupportedCodec(reason),
            ErrorKind::Reentrancy => Self::Reentrancy(reason),
            ErrorKind::SubPoolLost => Self::SubPoolLost(reason),
            ErrorKind::ActorFailed => Self::ActorFailed(reason),
            ErrorKind::ProtocolError => Self::ProtocolError(reason),
            ErrorKind::Internal => Self::Internal(reason),
        }
    }

    /// Reason string without the kind prefix.
    pub fn reason(&self) -> &str {
        match self {
            Self::ActorNotFound(r)
            | Self::Duplicate(r)
            | Self::PeerGone(r)
            | Self::Timeout(r)
            | Self::Cancelled(r)
            | Self::Backpressure(r)
            | Self::PayloadTooLarge(r)
            | Self::UnsupportedCodec(r)
            | Self::Reentrancy(r)
            | Self::SubPoolLost(r)
            | Self::ActorFailed(r)
            | Self::ProtocolError(r)
            | Self::Internal(r) => r,
        }
    }

    /// Render for an outbound `Error` envelope.
    pub fn to_payload(&self) -> ErrorPayload {
        ErrorPayload::new(self.kind(), self.reason())
    }
}

impl From<ErrorPayload> for PoolError {
    fn from(payload: ErrorPayload) -> Self {
        Self::from_kind(payload.kind, payload.reason)
    }
}

impl From<ChannelError> for PoolError {
    fn from(err: ChannelError) -> Self {
        Self::from_kind(err.kind(), err.to_string())
    }
}

impl From<WireError> for PoolError {
    fn from(err: WireError) -> Self {
        Self::from_kind(err.kind(), err.to_string())
    }
}

impl From<CodecError> for PoolError {
    fn from(err: CodecError) -> Self {
        // A codec failure on our own types is a protocol-level problem, not
        // an actor fault.
        Self::ProtocolError(err.to_string())
    }
}

impl From<caravel_transport::AddressError> for PoolError {
    fn from(err: caravel_transport::AddressError) -> Self {
        Self::ProtocolError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_round_trip() {
        let original = PoolError::SubPoolLost("subpool 2 heartbeat lost".into());
        let payload = original.to_payload();
        let back = PoolError::from(payload);
        assert_eq!(back.kind(), ErrorKind::SubPoolLost);
        assert_eq!(back.reason(), "subpool 2 heartbeat lost");
    }

    #[test]
    fn test_channel_error_collapses_to_taxonomy() {
        let err: PoolError = ChannelError::Backpressure.into();
        assert_eq!(err.kind(), ErrorKind::Backpressure);

        let err: PoolError = ChannelError::PeerGone("eof".into()).into();
        assert_eq!(err.kind(), ErrorKind::PeerGone);

        let err: PoolError = ChannelError::Handshake("version".into()).into();
        assert_eq!(err.kind(), ErrorKind::ProtocolError);
    }
}
