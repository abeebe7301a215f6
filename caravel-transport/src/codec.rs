//! Pluggable payload codecs.
//!
//! The envelope header carries a `codec_id` selecting how the payload body
//! is (de)serialized. The kernel refuses envelopes whose codec id is not
//! registered with `Error(UnsupportedCodec)`.
//!
//! `JsonCodec` is the default: human-readable, cross-language, and easy to
//! inspect on the wire. Binary codecs plug in by implementing [`Codec`]
//! with a distinct id.

use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

/// Codec id for raw, uncoded payloads (in-memory transport bypass).
pub const CODEC_ID_RAW: u8 = 0;

/// Codec id for [`JsonCodec`].
pub const CODEC_ID_JSON: u8 = 1;

/// Payload (de)serialization failure.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("encode failed: {0}")]
    Encode(String),

    #[error("decode failed: {0}")]
    Decode(String),
}

/// Payload serialization contract.
///
/// Implementations are cheap `Clone` values; the kernel stores one codec
/// per pool and threads it through handler dispatch.
pub trait Codec: Clone + Send + Sync + 'static {
    /// Wire id written into envelope headers.
    const CODEC_ID: u8;

    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, CodecError>;

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CodecError>;
}

/// JSON codec backed by `serde_json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    const CODEC_ID: u8 = CODEC_ID_JSON;

    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(value).map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CodecError> {
        serde_json::from_slice(bytes).map_err(|e| CodecError::Decode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Probe {
        n: u64,
        label: String,
    }

    #[test]
    fn test_json_codec_round_trip() {
        let codec = JsonCodec;
        let value = Probe {
            n: 42,
            label: "probe".into(),
        };
        let bytes = codec.encode(&value).unwrap();
        let back: Probe = codec.decode(&bytes).unwrap();
        assert_eq!(value, back);
    }

    #[test]
    fn test_json_codec_rejects_garbage() {
        let codec = JsonCodec;
        let result: Result<Probe, _> = codec.decode(b"\x00\x01");
        assert!(matches!(result, Err(CodecError::Decode(_))));
    }
}
