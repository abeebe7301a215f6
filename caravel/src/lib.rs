//! Caravel: a distributed actor runtime.
//!
//! An actor is an isolated unit of state that communicates only through
//! asynchronous messages. Caravel schedules message delivery across a
//! cluster of processes, multiplexes actors onto worker threads, enforces
//! single-threaded execution per actor, and provides identity, lifecycle
//! and lookup services.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                       Pool                              │
//! │  (builder, dispatch loop, lifecycle)                    │
//! └──────┬─────────────┬─────────────┬──────────────────────┘
//!        │             │             │
//!        ▼             ▼             ▼
//! ┌────────────┐ ┌────────────┐ ┌──────────────┐
//! │  Kernel    │ │  Router    │ │  Supervisor  │
//! │ (cells,    │ │ (channels, │ │ (sub-pools,  │
//! │  registry, │ │  reconnect,│ │  placement,  │
//! │  director) │ │  backoff)  │ │  restart)    │
//! └─────┬──────┘ └─────┬──────┘ └──────────────┘
//!       │              │
//!       ▼              ▼
//! ┌────────────┐ ┌───────────────────────────┐
//! │ ActorCell  │ │ caravel-transport         │
//! │ (inbox,    │ │ (envelopes, channels,     │
//! │  watchdog) │ │  inproc / unix / tcp)     │
//! └────────────┘ └───────────────────────────┘
//! ```
//!
//! # Quick start
//!
//! ```rust,ignore
//! use caravel::prelude::*;
//!
//! struct Echo;
//!
//! #[derive(Serialize, Deserialize)]
//! struct Say(String);
//!
//! #[async_trait]
//! impl<C: Codec> Actor<C> for Echo {
//!     const CLASS_ID: &'static str = "Echo";
//!     type Init = ();
//!
//!     async fn on_create(_init: (), _ctx: &ActorContext<C>) -> Result<Self> {
//!         Ok(Echo)
//!     }
//!
//!     fn register_handlers(table: &mut HandlerTable<Self, C>) {
//!         table.register::<Say, String>();
//!     }
//! }
//!
//! #[async_trait]
//! impl<C: Codec> Handler<Say, String, C> for Echo {
//!     async fn handle(&mut self, req: Say, _ctx: &ActorContext<C>) -> Result<String> {
//!         Ok(req.0)
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let pool = Pool::builder()
//!         .address("inproc://p0")?
//!         .register::<Echo>()
//!         .build()
//!         .await?;
//!
//!     let echo = pool
//!         .create_actor_with::<Echo>(&(), "echo", Placement::Main)
//!         .await?;
//!     let reply: String = pool.call(&echo, &Say("hi".into()), None).await?;
//!     assert_eq!(reply, "hi");
//!     Ok(())
//! }
//! ```

pub mod actor;
pub mod batch;
pub mod config;
pub mod error;
pub mod kernel;
pub mod lookup;
pub mod pool;
pub mod router;
pub mod runtime;

pub mod prelude;

pub use actor::{Actor, ActorContext, ActorStatus, Handler, HandlerTable};
pub use batch::{BatchReply, BatchRequest};
pub use config::{PoolConfig, ReconnectConfig, RestartPolicy};
pub use error::{PoolError, Result};
pub use kernel::Kernel;
pub use pool::placement::{Placement, PlacementPolicy};
pub use runtime::{Pool, PoolBuilder, PoolRole};

// The transport layer's vocabulary is part of this crate's API surface.
pub use caravel_transport::{ActorRef, ActorUid, Address, Codec, ErrorKind, JsonCodec, Scheme};
