//! Transport layer for the caravel actor runtime.
//!
//! This crate owns everything below the actor kernel: envelope framing and
//! codecs, the channel abstraction with handshake/heartbeat/close semantics,
//! and the concrete transport drivers (in-process queues, Unix domain
//! sockets, TCP).
//!
//! # Layering
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ caravel (router, kernel, pools)              │
//! └───────────────┬──────────────────────────────┘
//!                 │ Envelope / Channel
//! ┌───────────────▼──────────────────────────────┐
//! │ Channel (handshake, heartbeat, replies,      │
//! │          flow control, drain/close)          │
//! └───────────────┬──────────────────────────────┘
//!                 │ Conduit
//! ┌───────────────▼──────────────────────────────┐
//! │ Drivers: inproc:// │ unix:// │ tcp://        │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! Envelopes on one channel are delivered in send order. There is no
//! ordering guarantee across channels.

pub mod addr;
pub mod channel;
pub mod codec;
pub mod control;
pub mod driver;
pub mod envelope;
pub mod error;
pub mod wire;

pub use addr::{ActorRef, ActorUid, Address, Scheme};
pub use channel::{
    Channel, ChannelConfig, ChannelMetrics, ChannelState, Inbound, InboundSink, PeerInfo,
};
pub use codec::{Codec, CodecError, JsonCodec, CODEC_ID_JSON, CODEC_ID_RAW};
pub use control::ControlPayload;
pub use driver::{Conduit, Driver, DriverSet, Listener};
pub use envelope::{
    BatchItemReply, CallFrame, Envelope, EnvelopeFlags, EnvelopeIdAllocator, EnvelopeKind,
};
pub use error::{AddressError, ChannelError, ErrorKind, ErrorPayload, WireError};
pub use wire::FrameCodec;

/// Protocol version exchanged during the channel handshake.
///
/// Peers with mismatched versions refuse the connection with
/// [`ErrorKind::ProtocolError`].
pub const PROTOCOL_VERSION: u32 = 1;
