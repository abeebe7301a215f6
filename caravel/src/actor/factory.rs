//! Class registry: maps `class_id` to a type-erased cell spawner.
//!
//! `create_actor` names classes by string so creation can cross process
//! boundaries; registration happens once per pool at build time and
//! captures the concrete actor type in a spawn closure.

use crate::actor::cell::{spawn_cell, ActorStatus, CellConfig, CellHandle};
use crate::actor::context::Messenger;
use crate::actor::Actor;
use crate::error::{PoolError, Result};
use bytes::Bytes;
use caravel_transport::{ActorRef, Codec};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Everything a spawn closure needs to build one cell.
pub(crate) struct SpawnRequest<C: Codec> {
    pub actor_ref: ActorRef,
    pub init_body: Bytes,
    pub codec: C,
    pub messenger: Arc<dyn Messenger>,
    pub cfg: CellConfig,
    pub on_exit: Box<dyn FnOnce(ActorStatus) + Send>,
}

type SpawnFn<C> = Box<
    dyn Fn(SpawnRequest<C>) -> Pin<Box<dyn Future<Output = Result<CellHandle>> + Send>>
        + Send
        + Sync,
>;

/// Registered actor classes for one pool.
pub struct ClassRegistry<C: Codec> {
    classes: HashMap<&'static str, SpawnFn<C>>,
}

impl<C: Codec> ClassRegistry<C> {
    pub fn new() -> Self {
        Self {
            classes: HashMap::new(),
        }
    }

    /// Register class `A` under its `CLASS_ID`.
    pub fn register<A: Actor<C>>(&mut self) {
        tracing::debug!(class = A::CLASS_ID, "actor class registered");
        self.classes.insert(
            A::CLASS_ID,
            Box::new(|req: SpawnRequest<C>| {
                Box::pin(spawn_cell::<A, C>(
                    req.actor_ref,
                    req.init_body,
                    req.codec,
                    req.messenger,
                    req.cfg,
                    req.on_exit,
                ))
            }),
        );
    }

    pub fn contains(&self, class_id: &str) -> bool {
        self.classes.contains_key(class_id)
    }

    pub fn class_ids(&self) -> Vec<&'static str> {
        self.classes.keys().copied().collect()
    }

    pub(crate) async fn spawn(
        &self,
        class_id: &str,
        req: SpawnRequest<C>,
    ) -> Result<CellHandle> {
        let spawner = self.classes.get(class_id).ok_or_else(|| {
            PoolError::ProtocolError(format!("unknown actor class {class_id:?}"))
        })?;
        spawner(req).await
    }
}

impl<C: Codec> Default for ClassRegistry<C> {
    fn default() -> Self {
        Self::new()
    }
}
