//! Actor traits and per-actor execution machinery.

pub mod cell;
pub mod context;
pub mod factory;
pub mod handlers;

pub use cell::{ActorStatus, CellHandle};
pub use context::{ActorContext, Messenger};
pub use factory::ClassRegistry;
pub use handlers::{message_tag, HandlerTable};

use crate::error::Result;
use async_trait::async_trait;
use caravel_transport::{Codec, JsonCodec};
use serde::{de::DeserializeOwned, Serialize};

/// An isolated unit of state driven entirely by messages.
///
/// Implementations supply three things: a constructor (`on_create`), an
/// optional destructor (`on_destroy`), and a handler table mapping message
/// tags to typed handlers. The kernel guarantees that no two handler
/// invocations on one actor ever overlap.
///
/// # Example
///
/// ```rust,ignore
/// struct Counter {
///     value: i64,
/// }
///
/// #[async_trait]
/// impl<C: Codec> Actor<C> for Counter {
///     const CLASS_ID: &'static str = "Counter";
///     type Init = i64;
///
///     async fn on_create(init: i64, _ctx: &ActorContext<C>) -> Result<Self> {
///         Ok(Self { value: init })
///     }
///
///     fn register_handlers(table: &mut HandlerTable<Self, C>) {
///         table.register::<Add, i64>();
///         table.register::<Get, i64>();
///     }
/// }
///
/// #[async_trait]
/// impl<C: Codec> Handler<Add, i64, C> for Counter {
///     async fn handle(&mut self, req: Add, _ctx: &ActorContext<C>) -> Result<i64> {
///         self.value += req.0;
///         Ok(self.value)
///     }
/// }
/// ```
#[async_trait]
pub trait Actor<C: Codec = JsonCodec>: Sized + Send + 'static {
    /// Class id used by `create_actor` to pick the constructor. Unique per
    /// registered class within a pool.
    const CLASS_ID: &'static str;

    /// Constructor argument, encoded into the create request by the
    /// caller and decoded in the hosting process.
    type Init: Serialize + DeserializeOwned + Send;

    /// Build the actor. Runs before the actor is registered; a failure
    /// here fails the create and discards the partial instance.
    async fn on_create(init: Self::Init, ctx: &ActorContext<C>) -> Result<Self>;

    /// Teardown hook, run after the inbox has drained during destroy.
    /// Errors are logged; destruction proceeds regardless.
    async fn on_destroy(&mut self, _ctx: &ActorContext<C>) -> Result<()> {
        Ok(())
    }

    /// Register one handler per message type this class accepts.
    fn register_handlers(table: &mut HandlerTable<Self, C>);
}

/// Typed message handler, one implementation per `(actor, request)` pair.
///
/// The dispatch tag is the request's type name (see [`message_tag`]); the
/// framework decodes the body, invokes `handle`, and encodes the reply.
#[async_trait]
pub trait Handler<Req, Res, C: Codec = JsonCodec>: Actor<C>
where
    Req: DeserializeOwned + Send + 'static,
    Res: Serialize + Send + 'static,
{
    async fn handle(&mut self, req: Req, ctx: &ActorContext<C>) -> Result<Res>;
}
