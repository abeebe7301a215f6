//! Convenience re-exports for implementing and driving actors.

pub use crate::actor::{Actor, ActorContext, Handler, HandlerTable};
pub use crate::error::{PoolError, Result};
pub use crate::pool::placement::{Placement, PlacementPolicy};
pub use crate::runtime::{Pool, PoolBuilder};
pub use caravel_transport::{ActorRef, ActorUid, Address, Codec, JsonCodec};

pub use async_trait::async_trait;
pub use serde::{Deserialize, Serialize};
