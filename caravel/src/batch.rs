//! Client-side batch dispatch.
//!
//! A batch coalesces K logical calls to one actor into a single envelope.
//! The receiving actor executes the sub-calls consecutively, in order, and
//! returns K per-item outcomes; one failing item never aborts the rest.

use crate::error::{PoolError, Result};
use bytes::Bytes;
use caravel_transport::{CallFrame, Codec};
use serde::{de::DeserializeOwned, Serialize};

/// An ordered set of calls being assembled for one actor.
pub struct BatchRequest<C: Codec> {
    codec: C,
    calls: Vec<CallFrame>,
}

impl<C: Codec> BatchRequest<C> {
    pub(crate) fn new(codec: C) -> Self {
        Self {
            codec,
            calls: Vec::new(),
        }
    }

    /// Append one typed call. The dispatch tag is derived from `Req`'s
    /// type name, exactly as for a plain `call`.
    pub fn push<Req: Serialize>(&mut self, req: &Req) -> Result<()> {
        let body = self.codec.encode(req)?;
        self.calls.push(CallFrame::new(
            crate::actor::message_tag::<Req>(),
            body,
        ));
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    pub(crate) fn into_calls(self) -> Vec<CallFrame> {
        self.calls
    }
}

/// Per-item outcomes of a batch, in submission order.
pub struct BatchReply<C: Codec> {
    codec: C,
    items: Vec<Result<Bytes>>,
}

impl<C: Codec> BatchReply<C> {
    pub(crate) fn new(codec: C, items: Vec<Result<Bytes>>) -> Self {
        Self { codec, items }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Decode item `index` as `Res`.
    pub fn get<Res: DeserializeOwned>(&self, index: usize) -> Result<Res> {
        match self.items.get(index) {
            Some(Ok(bytes)) => Ok(self.codec.decode(bytes)?),
            Some(Err(e)) => Err(e.clone()),
            None => Err(PoolError::Internal(format!(
                "batch item {index} out of range ({} items)",
                self.items.len()
            ))),
        }
    }

    /// Raw per-item outcomes.
    pub fn raw(&self) -> &[Result<Bytes>] {
        &self.items
    }
}
