//! Typed payloads for `Control` envelopes.
//!
//! Control traffic is always JSON-encoded so that the control plane works
//! before (and regardless of) payload codec negotiation.

use crate::addr::ActorUid;
use crate::error::{ErrorKind, ErrorPayload};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Control-plane message variants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ControlPayload {
    /// Liveness probe, emitted while a channel is idle.
    Ping { seq: u64 },

    /// Probe response. Sub-pools piggyback their registry view here so the
    /// supervisor's load and lookup tables stay fresh without extra RPCs.
    Pong {
        seq: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        report: Option<RegistryReport>,
    },

    /// First envelope on every channel, sent by both sides.
    Handshake {
        protocol_version: u32,
        process_id: u64,
        address: String,
    },

    /// Ask an actor to stop: finish the current message, drain, run its
    /// destroy hook, deregister.
    Stop,

    /// Ask a whole pool to shut down gracefully.
    ShutdownPool,

    /// Supervisor → sub-pool: stop accepting work and drain.
    DrainPool,

    /// Sub-pool → supervisor: ready to serve after bootstrap.
    SubPoolReady { index: u32 },
}

impl ControlPayload {
    pub fn encode(&self) -> Bytes {
        Bytes::from(serde_json::to_vec(self).unwrap_or_default())
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ErrorPayload> {
        serde_json::from_slice(bytes).map_err(|e| {
            ErrorPayload::new(
                ErrorKind::ProtocolError,
                format!("undecodable control payload: {e}"),
            )
        })
    }
}

/// A sub-pool's registry view, piggybacked on heartbeat responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryReport {
    /// Reporting sub-pool index.
    pub subpool: u32,
    /// Live actors with their queued inbox depth.
    pub actors: Vec<ActorLoad>,
}

/// One actor's load sample.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActorLoad {
    pub uid: ActorUid,
    pub inbox_len: u64,
}
