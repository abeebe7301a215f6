//! Pool runtime: builder, dispatch loop, lifecycle.
//!
//! A [`Pool`] is one running process of the system, main or sub. Building
//! one wires the router, kernel and (for mains with workers) the
//! supervisor together, binds the listener, and starts the dispatch loop
//! that drains the router's inbound sink into the kernel.

use crate::actor::factory::ClassRegistry;
use crate::actor::Actor;
use crate::batch::{BatchReply, BatchRequest};
use crate::config::{PoolConfig, RestartPolicy};
use crate::error::{PoolError, Result};
use crate::kernel::{Kernel, KernelConfig};
use crate::lookup::Registry;
use crate::pool::placement::{Placement, PlacementPolicy};
use crate::pool::{LaunchFn, Supervisor};
use crate::router::{Router, RouterConfig};
use caravel_transport::channel::Inbound;
use caravel_transport::control::RegistryReport;
use caravel_transport::{
    ActorRef, ActorUid, Address, Codec, ControlPayload, Envelope, EnvelopeKind, JsonCodec, Scheme,
};
use serde::{de::DeserializeOwned, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

/// How long a main waits for its sub-pools to report ready.
const SUBPOOL_READY_DEADLINE: Duration = Duration::from_secs(30);

/// Role of this process within its pool.
#[derive(Debug, Clone)]
pub enum PoolRole {
    Main,
    Sub { index: u32, main_address: Address },
}

/// Builder for a pool process.
///
/// ```rust,ignore
/// let pool = Pool::builder()
///     .address("unix:///tmp/workers.sock")?
///     .n_subpools(4)
///     .allocation_policy(PlacementPolicy::Affinity)
///     .register::<Counter>()
///     .build()
///     .await?;
/// ```
pub struct PoolBuilder<C: Codec = JsonCodec> {
    address: Option<Address>,
    codec: C,
    classes: ClassRegistry<C>,
    role: PoolRole,
    n_subpools: u32,
    worker_threads: Option<usize>,
    allocation_policy: PlacementPolicy,
    restart_policy: RestartPolicy,
    heartbeat_interval: Option<Duration>,
    heartbeat_misses: Option<u32>,
    graceful_deadline: Option<Duration>,
    max_envelope_bytes: Option<usize>,
    high_water_envelopes: Option<usize>,
    high_water_bytes: Option<usize>,
    watchdog: Option<Duration>,
    lookup_ttl: Option<Duration>,
    drivers: caravel_transport::DriverSet,
    launch: Option<LaunchFn>,
}

impl PoolBuilder<JsonCodec> {
    pub fn new() -> Self {
        Self {
            address: None,
            codec: JsonCodec,
            classes: ClassRegistry::new(),
            role: PoolRole::Main,
            n_subpools: 0,
            worker_threads: None,
            allocation_policy: PlacementPolicy::RoundRobin,
            restart_policy: RestartPolicy::OnFailure,
            heartbeat_interval: None,
            heartbeat_misses: None,
            graceful_deadline: None,
            max_envelope_bytes: None,
            high_water_envelopes: None,
            high_water_bytes: None,
            watchdog: None,
            lookup_ttl: None,
            drivers: caravel_transport::DriverSet::standard(),
            launch: None,
        }
    }
}

impl Default for PoolBuilder<JsonCodec> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Codec> PoolBuilder<C> {
    /// This pool's endpoint. Required.
    pub fn address(mut self, address: impl AsRef<str>) -> Result<Self> {
        self.address = Some(Address::parse(address.as_ref())?);
        Ok(self)
    }

    /// Switch the payload codec. Must be called before any `register`,
    /// since registered classes are typed by the codec.
    pub fn codec<C2: Codec>(self, codec: C2) -> PoolBuilder<C2> {
        assert!(
            self.classes.class_ids().is_empty(),
            "set the codec before registering actor classes"
        );
        PoolBuilder {
            address: self.address,
            codec,
            classes: ClassRegistry::new(),
            role: self.role,
            n_subpools: self.n_subpools,
            worker_threads: self.worker_threads,
            allocation_policy: self.allocation_policy,
            restart_policy: self.restart_policy,
            heartbeat_interval: self.heartbeat_interval,
            heartbeat_misses: self.heartbeat_misses,
            graceful_deadline: self.graceful_deadline,
            max_envelope_bytes: self.max_envelope_bytes,
            high_water_envelopes: self.high_water_envelopes,
            high_water_bytes: self.high_water_bytes,
            watchdog: self.watchdog,
            lookup_ttl: self.lookup_ttl,
            drivers: self.drivers,
            launch: self.launch,
        }
    }

    /// Register an actor class for this pool.
    pub fn register<A: Actor<C>>(mut self) -> Self {
        self.classes.register::<A>();
        self
    }

    pub fn n_subpools(mut self, n: u32) -> Self {
        self.n_subpools = n;
        self
    }

    pub fn worker_threads(mut self, n: usize) -> Self {
        self.worker_threads = Some(n);
        self
    }

    pub fn allocation_policy(mut self, policy: PlacementPolicy) -> Self {
        self.allocation_policy = policy;
        self
    }

    pub fn restart_policy(mut self, policy: RestartPolicy) -> Self {
        self.restart_policy = policy;
        self
    }

    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = Some(interval);
        self
    }

    pub fn heartbeat_misses(mut self, misses: u32) -> Self {
        self.heartbeat_misses = Some(misses);
        self
    }

    pub fn graceful_deadline(mut self, deadline: Duration) -> Self {
        self.graceful_deadline = Some(deadline);
        self
    }

    pub fn max_envelope_bytes(mut self, bytes: usize) -> Self {
        self.max_envelope_bytes = Some(bytes);
        self
    }

    /// Outbound channel high-water mark in envelopes.
    pub fn high_water_envelopes(mut self, envelopes: usize) -> Self {
        self.high_water_envelopes = Some(envelopes);
        self
    }

    /// Outbound channel high-water mark in bytes.
    pub fn high_water_bytes(mut self, bytes: usize) -> Self {
        self.high_water_bytes = Some(bytes);
        self
    }

    /// Enable the per-message watchdog.
    pub fn watchdog(mut self, budget: Duration) -> Self {
        self.watchdog = Some(budget);
        self
    }

    pub fn lookup_ttl(mut self, ttl: Duration) -> Self {
        self.lookup_ttl = Some(ttl);
        self
    }

    /// Replace or extend the driver set (e.g. register a `ucx` driver).
    pub fn drivers(mut self, drivers: caravel_transport::DriverSet) -> Self {
        self.drivers = drivers;
        self
    }

    /// Run as sub-pool `index` behind `main_address` (used by the pool
    /// binary's `sub` subcommand).
    pub fn sub_role(mut self, index: u32, main_address: impl AsRef<str>) -> Result<Self> {
        self.role = PoolRole::Sub {
            index,
            main_address: Address::parse(main_address.as_ref())?,
        };
        Ok(self)
    }

    /// Override how sub-processes are launched. The default re-runs the
    /// current executable's `sub` subcommand; embedders and tests may run
    /// sub-pools in-process instead.
    pub fn launch_fn(mut self, launch: LaunchFn) -> Self {
        self.launch = Some(launch);
        self
    }

    /// Assemble and start the pool process.
    pub async fn build(self) -> Result<Pool<C>> {
        let address = self
            .address
            .ok_or_else(|| PoolError::ProtocolError("pool address is required".into()))?;
        if matches!(address.scheme, Scheme::Tcp | Scheme::Ucx) && address.port == Some(0) {
            return Err(PoolError::ProtocolError(
                "pool address must carry a concrete port".into(),
            ));
        }

        let mut config = PoolConfig::new(address.clone());
        config.n_subpools = self.n_subpools;
        config.worker_threads = self.worker_threads;
        config.allocation_policy = self.allocation_policy;
        config.restart_policy = self.restart_policy;
        config.watchdog = self.watchdog;
        if let Some(v) = self.heartbeat_interval {
            config.heartbeat_interval = v;
        }
        if let Some(v) = self.heartbeat_misses {
            config.heartbeat_misses = v;
        }
        if let Some(v) = self.graceful_deadline {
            config.graceful_deadline = v;
        }
        if let Some(v) = self.max_envelope_bytes {
            config.max_envelope_bytes = v;
        }
        if let Some(v) = self.lookup_ttl {
            config.lookup_ttl = v;
        }
        if let Some(v) = self.high_water_envelopes {
            config.high_water_envelopes = v;
        }
        if let Some(v) = self.high_water_bytes {
            config.high_water_bytes = v;
        }

        let logical = match &self.role {
            PoolRole::Main => address.clone(),
            PoolRole::Sub { index, main_address } => main_address.with_subpool(*index),
        };

        let (sink_tx, sink_rx) = mpsc::unbounded_channel();
        let router = Router::new(
            address.clone(),
            self.drivers,
            RouterConfig {
                channel: config.channel_config(),
                reconnect: config.reconnect.clone(),
            },
            sink_tx,
        );

        let kernel = Kernel::new(
            logical,
            self.codec.clone(),
            self.classes,
            router.clone(),
            KernelConfig::from(&config),
        );

        // Sub-pools piggyback their registry view on heartbeat pongs.
        if let PoolRole::Sub { index, .. } = &self.role {
            let registry: Arc<Registry> = kernel.registry().clone();
            let index = *index;
            router.set_report_fn(Arc::new(move || {
                Some(RegistryReport {
                    subpool: index,
                    actors: registry.loads(),
                })
            }));
        }

        router.bind().await?;

        let shutdown_requested = Arc::new(Notify::new());
        let dispatch_task = tokio::spawn(dispatch_loop(
            kernel.clone(),
            sink_rx,
            shutdown_requested.clone(),
        ));

        let pool = Pool {
            kernel,
            router,
            codec: self.codec,
            config,
            role: self.role.clone(),
            shutdown_requested,
            background: Mutex::new(vec![dispatch_task]),
        };

        match &self.role {
            PoolRole::Main if pool.config.n_subpools > 0 => {
                let supervisor =
                    Supervisor::new(&pool.config, pool.router.clone(), self.launch)?;
                pool.kernel.set_supervisor(supervisor.clone());
                supervisor.start(SUBPOOL_READY_DEADLINE).await?;

                // Failure detection piggybacks on channel heartbeats: a
                // closed control channel means two missed probes.
                let sweep_interval = pool.config.heartbeat_interval;
                let sweeper = supervisor.clone();
                let sweep_task = tokio::spawn(async move {
                    loop {
                        tokio::time::sleep(sweep_interval).await;
                        let lost = sweeper.sweep();
                        if !lost.is_empty() {
                            tracing::warn!(count = lost.len(), "actors lost with their sub-pool");
                        }
                    }
                });
                pool.background
                    .lock()
                    .expect("background tasks poisoned")
                    .push(sweep_task);
            }
            PoolRole::Main => {}
            PoolRole::Sub { index, main_address } => {
                // Register with the main process.
                let channel = pool.router.channel_to(&main_address.endpoint()).await?;
                let ready = Envelope::control(
                    channel.next_id(),
                    ActorRef::control(main_address.endpoint()),
                    ControlPayload::SubPoolReady { index: *index }.encode(),
                );
                channel.send(ready, false).await?;
                tracing::info!(index = *index, main = %main_address, "sub-pool registered");
            }
        }

        tracing::info!(address = %pool.kernel.address(), "pool up");
        Ok(pool)
    }
}

/// One running pool process.
pub struct Pool<C: Codec = JsonCodec> {
    kernel: Kernel<C>,
    router: Arc<Router>,
    codec: C,
    config: PoolConfig,
    role: PoolRole,
    shutdown_requested: Arc<Notify>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl Pool<JsonCodec> {
    pub fn builder() -> PoolBuilder<JsonCodec> {
        PoolBuilder::new()
    }
}

impl<C: Codec> Pool<C> {
    /// Logical address of this process.
    pub fn address(&self) -> &Address {
        self.kernel.address()
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn role(&self) -> &PoolRole {
        &self.role
    }

    /// Create an actor with an allocated uid under the default placement.
    pub async fn create_actor<A: Actor<C>>(&self, init: &A::Init) -> Result<ActorRef> {
        self.kernel
            .create_actor::<A>(init, None, Placement::Default)
            .await
    }

    /// Create an actor with an explicit uid and placement.
    pub async fn create_actor_with<A: Actor<C>>(
        &self,
        init: &A::Init,
        uid: impl Into<ActorUid>,
        placement: Placement,
    ) -> Result<ActorRef> {
        self.kernel
            .create_actor::<A>(init, Some(uid.into()), placement)
            .await
    }

    /// Destroy an actor. Idempotent: destroying an unknown ref succeeds.
    pub async fn destroy_actor(&self, actor_ref: &ActorRef) -> Result<()> {
        self.kernel.destroy_actor(actor_ref).await
    }

    /// Request/response call.
    pub async fn call<Req, Res>(
        &self,
        to: &ActorRef,
        req: &Req,
        deadline: Option<Duration>,
    ) -> Result<Res>
    where
        Req: Serialize,
        Res: DeserializeOwned,
    {
        let frame = caravel_transport::CallFrame::new(
            crate::actor::message_tag::<Req>(),
            self.codec.encode(req)?,
        );
        let reply = self.kernel.send_frame(to.clone(), frame, deadline).await?;
        Ok(self.codec.decode(&reply)?)
    }

    /// Fire-and-forget. Returns once the message is enqueued locally or
    /// handed to the channel.
    pub async fn tell<Req: Serialize>(&self, to: &ActorRef, req: &Req) -> Result<()> {
        let frame = caravel_transport::CallFrame::new(
            crate::actor::message_tag::<Req>(),
            self.codec.encode(req)?,
        );
        self.kernel.tell_frame(to.clone(), frame).await
    }

    /// Fire-and-forget with a delivery acknowledgement: resolves once the
    /// receiving kernel has accepted the message into the actor's inbox.
    pub async fn tell_acked<Req: Serialize>(
        &self,
        to: &ActorRef,
        req: &Req,
        deadline: Option<Duration>,
    ) -> Result<()> {
        let frame = caravel_transport::CallFrame::new(
            crate::actor::message_tag::<Req>(),
            self.codec.encode(req)?,
        );
        self.kernel.tell_frame_acked(to.clone(), frame, deadline).await
    }

    /// Start assembling a batch of calls to one actor.
    pub fn batch(&self) -> BatchRequest<C> {
        BatchRequest::new(self.codec.clone())
    }

    /// Dispatch an assembled batch as a single envelope.
    pub async fn send_batch(
        &self,
        to: &ActorRef,
        batch: BatchRequest<C>,
        deadline: Option<Duration>,
    ) -> Result<BatchReply<C>> {
        let items = self
            .kernel
            .send_batch(to.clone(), &batch.into_calls(), deadline)
            .await?;
        Ok(BatchReply::new(self.codec.clone(), items))
    }

    /// Cheap local existence check (after cross-node resolution).
    pub fn has_actor(&self, actor_ref: &ActorRef) -> bool {
        self.kernel.has_actor(actor_ref)
    }

    /// Reference to an actor assumed to live on this pool.
    pub fn actor_ref(&self, uid: impl Into<ActorUid>) -> ActorRef {
        ActorRef::new(uid.into(), self.kernel.address().clone())
    }

    /// Resolve a uid on another pool through its index server.
    pub async fn resolve(&self, pool: &Address, uid: impl Into<ActorUid>) -> Result<ActorRef> {
        self.kernel.resolve(pool, &uid.into()).await
    }

    /// Ask this process to shut down (same path as `Control:ShutdownPool`).
    pub fn request_shutdown(&self) {
        // notify_one stores a permit, so a request that lands before
        // run_until_shutdown subscribes is not lost.
        self.shutdown_requested.notify_one();
    }

    /// Block until shutdown is requested, then run the graceful path.
    /// Returns `true` when sub-processes had to be force-killed.
    pub async fn run_until_shutdown(&self) -> Result<bool> {
        self.shutdown_requested.notified().await;
        self.shutdown().await
    }

    /// Graceful shutdown: stop local actors, drain sub-pools, close
    /// channels.
    pub async fn shutdown(&self) -> Result<bool> {
        tracing::info!(address = %self.kernel.address(), "pool shutting down");

        // Stop local actors first so their destroy hooks can still talk
        // to peers.
        for uid in self.kernel.registry().uids() {
            let actor_ref = self.actor_ref(uid);
            if let Err(e) = self.kernel.destroy_actor(&actor_ref).await {
                tracing::warn!(actor = %actor_ref, error = %e, "destroy during shutdown failed");
            }
        }

        let forced = match self.kernel.supervisor() {
            Some(supervisor) => supervisor.shutdown().await,
            None => false,
        };

        self.router.shutdown().await;
        for task in self
            .background
            .lock()
            .expect("background tasks poisoned")
            .drain(..)
        {
            task.abort();
        }
        Ok(forced)
    }
}

impl<C: Codec> std::fmt::Debug for Pool<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("address", &self.kernel.address().to_string())
            .field("n_subpools", &self.config.n_subpools)
            .finish()
    }
}

/// Drain the router sink: control traffic is handled here, everything
/// else goes to the kernel.
async fn dispatch_loop<C: Codec>(
    kernel: Kernel<C>,
    mut sink_rx: mpsc::UnboundedReceiver<Inbound>,
    shutdown_requested: Arc<Notify>,
) {
    while let Some(inbound) = sink_rx.recv().await {
        if inbound.envelope.kind == EnvelopeKind::Control {
            match ControlPayload::decode(&inbound.envelope.payload) {
                Ok(ControlPayload::Pong {
                    report: Some(report),
                    ..
                }) => {
                    if let Some(supervisor) = kernel.supervisor() {
                        supervisor.update_report(report);
                    }
                }
                Ok(ControlPayload::SubPoolReady { index }) => {
                    if let Some(supervisor) = kernel.supervisor() {
                        supervisor.mark_ready(index);
                    }
                }
                Ok(ControlPayload::DrainPool) | Ok(ControlPayload::ShutdownPool) => {
                    tracing::info!("shutdown requested over the control plane");
                    shutdown_requested.notify_one();
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!(error = %e, "undecodable control envelope dropped");
                }
            }
            continue;
        }
        kernel.deliver(inbound);
    }
}
