//! Per-class handler tables.
//!
//! Message envelopes carry a string tag; each actor class registers a
//! closure per tag that decodes the body, runs the typed handler, and
//! encodes the reply. This replaces runtime method-name reflection with an
//! explicit table built once at class registration.

use crate::actor::context::ActorContext;
use crate::actor::{Actor, Handler};
use crate::error::{PoolError, Result};
use caravel_transport::{CallFrame, Codec};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

/// Dispatch tag for a message type: the unqualified type name.
///
/// `my_crate::messages::Increment` registers and dispatches as
/// `"Increment"`. Senders and receivers derive the tag the same way, so
/// it never needs to be spelled out.
pub fn message_tag<T>() -> &'static str {
    std::any::type_name::<T>()
        .rsplit("::")
        .next()
        .unwrap_or("unknown")
}

type HandlerFn<A, C> = Box<
    dyn for<'a> Fn(
            &'a mut A,
            &'a [u8],
            &'a ActorContext<C>,
        ) -> Pin<Box<dyn Future<Output = Result<Vec<u8>>> + Send + 'a>>
        + Send
        + Sync,
>;

/// Tag → handler closure table for one actor class.
pub struct HandlerTable<A, C: Codec> {
    handlers: HashMap<&'static str, HandlerFn<A, C>>,
    codec: C,
}

impl<A: Actor<C>, C: Codec> HandlerTable<A, C> {
    pub fn new(codec: C) -> Self {
        Self {
            handlers: HashMap::new(),
            codec,
        }
    }

    /// Register the handler for request type `Req` with reply type `Res`.
    ///
    /// The tag is derived from `Req`'s type name; registering two request
    /// types with the same unqualified name is a bug, and the second
    /// registration wins.
    pub fn register<Req, Res>(&mut self)
    where
        A: Handler<Req, Res, C>,
        Req: DeserializeOwned + Send + 'static,
        Res: Serialize + Send + 'static,
    {
        let tag = message_tag::<Req>();
        tracing::debug!(class = A::CLASS_ID, tag, "handler registered");

        let codec = self.codec.clone();
        let handler: HandlerFn<A, C> = Box::new(move |actor, body, ctx| {
            let codec = codec.clone();
            Box::pin(async move {
                let req: Req = codec.decode(body)?;
                let res: Res = actor.handle(req, ctx).await?;
                Ok(codec.encode(&res)?)
            })
        });
        self.handlers.insert(tag, handler);
    }

    /// Dispatch one decoded call frame.
    pub async fn dispatch(
        &self,
        actor: &mut A,
        frame: &CallFrame,
        ctx: &ActorContext<C>,
    ) -> Result<Vec<u8>> {
        let handler = self.handlers.get(frame.tag.as_str()).ok_or_else(|| {
            PoolError::ProtocolError(format!(
                "class {} has no handler for tag {:?}",
                A::CLASS_ID,
                frame.tag
            ))
        })?;
        handler(actor, &frame.body, ctx).await
    }

    pub fn has_handler(&self, tag: &str) -> bool {
        self.handlers.contains_key(tag)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::context::{CancelObserver, Messenger};
    use async_trait::async_trait;
    use bytes::Bytes;
    use caravel_transport::{ActorRef, ActorUid, Address, JsonCodec};
    use serde::Deserialize;
    use std::sync::Arc;
    use std::time::Duration;

    struct Probe {
        total: i64,
    }

    #[derive(Serialize, Deserialize)]
    struct AddRequest {
        by: i64,
    }

    #[derive(Serialize, Deserialize)]
    struct TotalRequest;

    #[async_trait]
    impl<C: Codec> Actor<C> for Probe {
        const CLASS_ID: &'static str = "Probe";
        type Init = i64;

        async fn on_create(init: i64, _ctx: &ActorContext<C>) -> Result<Self> {
            Ok(Self { total: init })
        }

        fn register_handlers(table: &mut HandlerTable<Self, C>) {
            table.register::<AddRequest, i64>();
            table.register::<TotalRequest, i64>();
        }
    }

    #[async_trait]
    impl<C: Codec> Handler<AddRequest, i64, C> for Probe {
        async fn handle(&mut self, req: AddRequest, _ctx: &ActorContext<C>) -> Result<i64> {
            self.total += req.by;
            Ok(self.total)
        }
    }

    #[async_trait]
    impl<C: Codec> Handler<TotalRequest, i64, C> for Probe {
        async fn handle(&mut self, _req: TotalRequest, _ctx: &ActorContext<C>) -> Result<i64> {
            Ok(self.total)
        }
    }

    struct NullMessenger;

    #[async_trait]
    impl Messenger for NullMessenger {
        async fn send_frame(
            &self,
            _to: ActorRef,
            _frame: CallFrame,
            _deadline: Option<Duration>,
        ) -> Result<Bytes> {
            Ok(Bytes::new())
        }

        async fn tell_frame(&self, _to: ActorRef, _frame: CallFrame) -> Result<()> {
            Ok(())
        }
    }

    fn context() -> ActorContext<JsonCodec> {
        ActorContext::new(
            ActorRef::new(
                ActorUid::from("probe"),
                Address::parse("inproc://handlers-test").unwrap(),
            ),
            JsonCodec,
            Arc::new(NullMessenger),
            CancelObserver::inert(),
        )
    }

    #[test]
    fn test_message_tag_strips_path() {
        assert_eq!(message_tag::<AddRequest>(), "AddRequest");
        assert_eq!(message_tag::<TotalRequest>(), "TotalRequest");
    }

    #[tokio::test]
    async fn test_registration_and_dispatch() {
        let codec = JsonCodec;
        let mut table = HandlerTable::<Probe, _>::new(codec);
        Probe::register_handlers(&mut table);
        assert_eq!(table.len(), 2);
        assert!(table.has_handler("AddRequest"));
        assert!(!table.has_handler("Missing"));

        let ctx = context();
        let mut actor = Probe::on_create(10, &ctx).await.unwrap();

        let frame = CallFrame::new(
            "AddRequest",
            codec.encode(&AddRequest { by: 5 }).unwrap(),
        );
        let out = table.dispatch(&mut actor, &frame, &ctx).await.unwrap();
        let total: i64 = codec.decode(&out).unwrap();
        assert_eq!(total, 15);
    }

    #[tokio::test]
    async fn test_unknown_tag_is_protocol_error() {
        let mut table = HandlerTable::<Probe, _>::new(JsonCodec);
        Probe::register_handlers(&mut table);
        let ctx = context();
        let mut actor = Probe::on_create(0, &ctx).await.unwrap();

        let frame = CallFrame::new("Nope", Bytes::new());
        let result = table.dispatch(&mut actor, &frame, &ctx).await;
        assert!(matches!(result, Err(PoolError::ProtocolError(_))));
    }
}
