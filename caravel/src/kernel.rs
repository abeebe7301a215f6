//! The actor kernel: owns actor instances, routes deliveries, and
//! enforces the concurrency discipline.
//!
//! One kernel per process. Local sends enqueue straight into the target
//! cell; sends to this pool's sub-processes are forwarded by index through
//! the supervisor; everything else goes out through the router. Two
//! built-in endpoints exist on every kernel: the pool director (remote
//! create/destroy) and the index server (cross-node lookup).

use crate::actor::cell::{ActorStatus, CellConfig, Completion, InboxItem};
use crate::actor::context::Messenger;
use crate::actor::factory::{ClassRegistry, SpawnRequest};
use crate::actor::{message_tag, Actor};
use crate::config::PoolConfig;
use crate::error::{PoolError, Result};
use crate::lookup::{LookupCache, LookupRequest, LookupResponse, Registry, INDEX_SERVER_UID};
use crate::pool::placement::Placement;
use crate::pool::Supervisor;
use crate::router::Router;
use async_trait::async_trait;
use bytes::Bytes;
use caravel_transport::channel::Inbound;
use caravel_transport::{
    ActorRef, ActorUid, Address, CallFrame, BatchItemReply, Codec, ControlPayload, Envelope,
    EnvelopeFlags, EnvelopeKind, ErrorPayload, CODEC_ID_RAW,
};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Well-known uid of the per-process director endpoint handling remote
/// create/destroy.
pub const DIRECTOR_UID: &str = ".director";

/// Deadline for internal director and lookup round trips.
const SYSTEM_CALL_DEADLINE: Duration = Duration::from_secs(30);

/// Remote create request handled by the director.
#[derive(Debug, Serialize, Deserialize)]
struct CreateActorRequest {
    class_id: String,
    uid: ActorUid,
    init: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CreateActorResponse {
    address: String,
}

/// Remote destroy request handled by the director. Idempotent.
#[derive(Debug, Serialize, Deserialize)]
struct DestroyActorRequest {
    uid: ActorUid,
}

#[derive(Debug, Serialize, Deserialize)]
struct DestroyActorResponse {}

#[derive(Debug, Clone)]
pub(crate) struct KernelConfig {
    pub watchdog: Option<Duration>,
    pub quarantine_strikes: u32,
    pub lookup_retries: u32,
    pub lookup_ttl: Duration,
    pub max_envelope_bytes: usize,
}

impl From<&PoolConfig> for KernelConfig {
    fn from(config: &PoolConfig) -> Self {
        Self {
            watchdog: config.watchdog,
            quarantine_strikes: config.quarantine_strikes,
            lookup_retries: config.lookup_retries,
            lookup_ttl: config.lookup_ttl,
            max_envelope_bytes: config.max_envelope_bytes,
        }
    }
}

/// Cheap cloneable kernel handle.
pub struct Kernel<C: Codec> {
    inner: Arc<KernelInner<C>>,
}

impl<C: Codec> Clone for Kernel<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

pub(crate) struct KernelInner<C: Codec> {
    /// Logical address of this process (sub-pools carry their index).
    address: Address,
    codec: C,
    classes: ClassRegistry<C>,
    registry: Arc<Registry>,
    cache: LookupCache,
    router: Arc<Router>,
    cfg: KernelConfig,
    uid_seq: AtomicU64,
    supervisor: Mutex<Option<Arc<Supervisor>>>,
}

impl<C: Codec> Kernel<C> {
    pub(crate) fn new(
        address: Address,
        codec: C,
        classes: ClassRegistry<C>,
        router: Arc<Router>,
        cfg: KernelConfig,
    ) -> Self {
        let cache = LookupCache::new(cfg.lookup_ttl);
        Self {
            inner: Arc::new(KernelInner {
                address,
                codec,
                classes,
                registry: Arc::new(Registry::new()),
                cache,
                router,
                cfg,
                uid_seq: AtomicU64::new(1),
                supervisor: Mutex::new(None),
            }),
        }
    }

    /// Logical address of this kernel's process.
    pub fn address(&self) -> &Address {
        &self.inner.address
    }

    pub(crate) fn registry(&self) -> &Arc<Registry> {
        &self.inner.registry
    }

    pub(crate) fn set_supervisor(&self, supervisor: Arc<Supervisor>) {
        *self
            .inner
            .supervisor
            .lock()
            .expect("supervisor slot poisoned") = Some(supervisor);
    }

    pub(crate) fn supervisor(&self) -> Option<Arc<Supervisor>> {
        self.inner
            .supervisor
            .lock()
            .expect("supervisor slot poisoned")
            .clone()
    }

    /// Create an actor of registered class `A`.
    ///
    /// Allocates a uid when none is given, resolves the target sub-pool
    /// through the placement policy, runs `on_create` there, and registers
    /// the result. Fails with `Duplicate` when the uid exists.
    pub async fn create_actor<A: Actor<C>>(
        &self,
        init: &A::Init,
        uid: Option<ActorUid>,
        placement: Placement,
    ) -> Result<ActorRef> {
        let init_body = Bytes::from(self.inner.codec.encode(init)?);
        self.create_by_class(A::CLASS_ID, uid, init_body, placement)
            .await
    }

    /// Untyped create, used by the director and by dynamic callers.
    pub async fn create_by_class(
        &self,
        class_id: &str,
        uid: Option<ActorUid>,
        init_body: Bytes,
        placement: Placement,
    ) -> Result<ActorRef> {
        let inner = &self.inner;
        let uid = match uid {
            Some(uid) => uid,
            None => ActorUid::allocated(inner.uid_seq.fetch_add(1, Ordering::Relaxed)),
        };

        let supervisor = self.supervisor();
        let target = match &supervisor {
            Some(sup) => sup.allocate(&uid, &placement)?,
            None => None,
        };

        match target {
            None => inner.create_local(class_id, uid, init_body).await,
            Some(index) => {
                let sup = supervisor.expect("target implies supervisor");
                let director = ActorRef::new(
                    ActorUid::from(DIRECTOR_UID),
                    sup.logical_address(index),
                );
                let request = CreateActorRequest {
                    class_id: class_id.to_string(),
                    uid: uid.clone(),
                    init: init_body.to_vec(),
                };
                let frame = CallFrame::new(
                    message_tag::<CreateActorRequest>(),
                    inner.codec.encode(&request)?,
                );
                let outcome = inner
                    .send_call(director, frame, Some(SYSTEM_CALL_DEADLINE), EnvelopeFlags::empty())
                    .await;
                match outcome {
                    Ok(bytes) => {
                        let response: CreateActorResponse = inner.codec.decode(&bytes)?;
                        Ok(ActorRef::new(uid, Address::parse(&response.address)?))
                    }
                    Err(e) => {
                        // A failed create must not pin the uid to a slot,
                        // except a Duplicate, where the existing assignment
                        // is the truth.
                        if !matches!(e, PoolError::Duplicate(_)) {
                            sup.release(&uid);
                        }
                        Err(e)
                    }
                }
            }
        }
    }

    /// Destroy an actor anywhere. Idempotent: unknown refs are a no-op.
    pub async fn destroy_actor(&self, actor_ref: &ActorRef) -> Result<()> {
        let inner = &self.inner;
        if inner.is_local(&actor_ref.address) {
            return inner.destroy_local(&actor_ref.uid).await;
        }

        if inner.is_sub_of_self(&actor_ref.address) {
            let result = inner.director_destroy(actor_ref).await;
            if result.is_ok() {
                if let Some(sup) = self.supervisor() {
                    sup.release(&actor_ref.uid);
                }
            }
            return result;
        }

        inner.director_destroy(actor_ref).await
    }

    /// Request/response call carrying an already-framed payload.
    pub async fn send_frame(
        &self,
        to: ActorRef,
        frame: CallFrame,
        deadline: Option<Duration>,
    ) -> Result<Bytes> {
        self.inner
            .send_call(to, frame, deadline, EnvelopeFlags::empty())
            .await
    }

    /// Fire-and-forget carrying an already-framed payload.
    pub async fn tell_frame(&self, to: ActorRef, frame: CallFrame) -> Result<()> {
        self.inner
            .tell_call(to, frame, EnvelopeFlags::empty())
            .await
    }

    /// Fire-and-forget that asks the receiving kernel for an empty reply
    /// once the message is enqueued.
    pub async fn tell_frame_acked(
        &self,
        to: ActorRef,
        frame: CallFrame,
        deadline: Option<Duration>,
    ) -> Result<()> {
        self.inner
            .send_payload(to, frame.encode(), deadline, EnvelopeFlags::TELL_ACK, EnvelopeKind::Tell)
            .await
            .map(|_| ())
    }

    /// Coalesce ordered calls into one envelope; the receiver executes
    /// them consecutively and reports per-item outcomes.
    pub async fn send_batch(
        &self,
        to: ActorRef,
        calls: &[CallFrame],
        deadline: Option<Duration>,
    ) -> Result<Vec<Result<Bytes>>> {
        let payload = CallFrame::encode_batch(calls);
        let bytes = self
            .inner
            .send_payload(to, payload, deadline, EnvelopeFlags::BATCH, EnvelopeKind::Send)
            .await?;
        let items = BatchItemReply::decode_all(&bytes)?;
        Ok(items
            .into_iter()
            .map(|item| match item {
                BatchItemReply::Ok(bytes) => Ok(bytes),
                BatchItemReply::Err(payload) => Err(payload.into()),
            })
            .collect())
    }

    /// Cheap local existence check.
    pub fn has_actor(&self, actor_ref: &ActorRef) -> bool {
        self.inner.registry.contains(&actor_ref.uid)
    }

    /// Resolve a uid on a (possibly remote) pool to a full ActorRef, via
    /// the pool's index server, with caching and a retry budget.
    pub async fn resolve(&self, pool: &Address, uid: &ActorUid) -> Result<ActorRef> {
        let inner = &self.inner;

        if pool.same_endpoint(&inner.address) {
            return inner
                .lookup_local(uid)
                .map(|address| ActorRef::new(uid.clone(), address))
                .ok_or_else(|| PoolError::ActorNotFound(uid.to_string()));
        }

        if let Some(cached) = inner.cache.get(pool, uid) {
            return Ok(cached);
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            let index_server = ActorRef::new(ActorUid::from(INDEX_SERVER_UID), pool.clone());
            let frame = CallFrame::new(
                message_tag::<LookupRequest>(),
                inner.codec.encode(&LookupRequest { uid: uid.clone() })?,
            );
            match inner
                .send_call(index_server, frame, Some(SYSTEM_CALL_DEADLINE), EnvelopeFlags::empty())
                .await
            {
                Ok(bytes) => {
                    let response: LookupResponse = inner.codec.decode(&bytes)?;
                    return match response.address {
                        Some(address) => {
                            let actor_ref =
                                ActorRef::new(uid.clone(), Address::parse(&address)?);
                            inner.cache.put(pool, actor_ref.clone());
                            Ok(actor_ref)
                        }
                        None => Err(PoolError::ActorNotFound(uid.to_string())),
                    };
                }
                Err(PoolError::PeerGone(_)) | Err(PoolError::Timeout(_))
                    if attempt < inner.cfg.lookup_retries =>
                {
                    inner.router.refresh_peer(pool);
                    continue;
                }
                Err(_) => {
                    return Err(PoolError::ActorNotFound(format!(
                        "{uid} not resolvable at {pool} after {attempt} attempts"
                    )));
                }
            }
        }
    }

    /// Route one inbound envelope from the router sink.
    pub(crate) fn deliver(&self, inbound: Inbound) {
        let inner = self.inner.clone();
        let Inbound { envelope, channel } = inbound;

        match envelope.kind {
            EnvelopeKind::Cancel => {
                if inner.is_sub_of_self(&envelope.to.address) {
                    if let Some(sup) = self.supervisor() {
                        tokio::spawn(async move { sup.forward(envelope, None).await });
                    }
                } else if let Some(correlation) = envelope.correlation_id {
                    if let Some(cell) = inner.registry.get(&envelope.to.uid) {
                        cell.request_cancel(correlation);
                    }
                }
            }
            EnvelopeKind::Send | EnvelopeKind::Tell => {
                // Unknown codec is rejected before any dispatch.
                if envelope.codec_id != C::CODEC_ID && envelope.codec_id != CODEC_ID_RAW {
                    if envelope.kind == EnvelopeKind::Send {
                        let error = Envelope::error(
                            channel.next_id(),
                            &envelope,
                            caravel_transport::ErrorKind::UnsupportedCodec,
                            format!("codec id {} is not registered", envelope.codec_id),
                        );
                        spawn_reply(channel, error);
                    }
                    return;
                }

                let wants_ack = envelope.kind == EnvelopeKind::Tell
                    && envelope.flags.contains(EnvelopeFlags::TELL_ACK)
                    && envelope.correlation_id.is_some();

                if inner.is_sub_of_self(&envelope.to.address) {
                    if let Some(sup) = self.supervisor() {
                        let completion = (envelope.kind == EnvelopeKind::Send).then(|| {
                            Completion::Remote {
                                channel: channel.clone(),
                                request: envelope.clone(),
                            }
                        });
                        if wants_ack {
                            let ack =
                                Envelope::reply(channel.next_id(), &envelope, Bytes::new());
                            spawn_reply(channel.clone(), ack);
                        }
                        tokio::spawn(async move { sup.forward(envelope, completion).await });
                    } else if envelope.kind == EnvelopeKind::Send {
                        let error = Envelope::error(
                            channel.next_id(),
                            &envelope,
                            caravel_transport::ErrorKind::ActorNotFound,
                            "no sub-pools behind this endpoint",
                        );
                        spawn_reply(channel, error);
                    }
                    return;
                }

                let uid_str = String::from_utf8_lossy(envelope.to.uid.as_bytes()).into_owned();
                if uid_str == DIRECTOR_UID || uid_str == INDEX_SERVER_UID {
                    let kernel = self.clone();
                    tokio::spawn(async move { kernel.handle_system(envelope, channel).await });
                    return;
                }

                match inner.registry.get(&envelope.to.uid) {
                    Some(cell) => {
                        let completion = (envelope.kind == EnvelopeKind::Send).then(|| {
                            Completion::Remote {
                                channel: channel.clone(),
                                request: envelope.clone(),
                            }
                        });
                        let accepted = cell
                            .enqueue(InboxItem {
                                envelope: envelope.clone(),
                                completion,
                            })
                            .is_ok();
                        if accepted && wants_ack {
                            let ack = Envelope::reply(channel.next_id(), &envelope, Bytes::new());
                            spawn_reply(channel, ack);
                        }
                    }
                    None => {
                        if envelope.kind == EnvelopeKind::Send {
                            let lost = self
                                .supervisor()
                                .map(|s| s.is_lost(&envelope.to.uid))
                                .unwrap_or(false);
                            let (kind, reason) = if lost {
                                (
                                    caravel_transport::ErrorKind::SubPoolLost,
                                    format!("{} was lost with its sub-pool", envelope.to.uid),
                                )
                            } else {
                                (
                                    caravel_transport::ErrorKind::ActorNotFound,
                                    format!("{} is not registered here", envelope.to.uid),
                                )
                            };
                            let error = Envelope::error(channel.next_id(), &envelope, kind, reason);
                            spawn_reply(channel, error);
                        }
                    }
                }
            }
            // Control is dispatched by the pool runtime; replies and
            // errors were consumed by the channel's waiter table.
            _ => {}
        }
    }

    /// Serve the built-in director and index-server endpoints.
    async fn handle_system(&self, envelope: Envelope, channel: Arc<caravel_transport::Channel>) {
        let inner = &self.inner;
        let completion = (envelope.kind == EnvelopeKind::Send).then(|| Completion::Remote {
            channel: channel.clone(),
            request: envelope.clone(),
        });

        let uid_str = String::from_utf8_lossy(envelope.to.uid.as_bytes()).into_owned();
        let result: Result<Bytes> = async {
            let frame = CallFrame::decode(&envelope.payload)?;
            if uid_str == INDEX_SERVER_UID {
                if frame.tag != message_tag::<LookupRequest>() {
                    return Err(PoolError::ProtocolError(format!(
                        "index server has no handler for tag {:?}",
                        frame.tag
                    )));
                }
                let request: LookupRequest = inner.codec.decode(&frame.body)?;
                let response = LookupResponse {
                    address: inner.lookup_local(&request.uid).map(|a| a.to_string()),
                };
                Ok(Bytes::from(inner.codec.encode(&response)?))
            } else if frame.tag == message_tag::<CreateActorRequest>() {
                let request: CreateActorRequest = inner.codec.decode(&frame.body)?;
                let actor_ref = inner
                    .create_local(&request.class_id, request.uid, Bytes::from(request.init))
                    .await?;
                Ok(Bytes::from(inner.codec.encode(&CreateActorResponse {
                    address: actor_ref.address.to_string(),
                })?))
            } else if frame.tag == message_tag::<DestroyActorRequest>() {
                let request: DestroyActorRequest = inner.codec.decode(&frame.body)?;
                inner.destroy_local(&request.uid).await?;
                Ok(Bytes::from(inner.codec.encode(&DestroyActorResponse {})?))
            } else {
                Err(PoolError::ProtocolError(format!(
                    "director has no handler for tag {:?}",
                    frame.tag
                )))
            }
        }
        .await;

        if let Some(c) = completion {
            c.resolve(result);
        }
    }
}

impl<C: Codec> KernelInner<C> {
    fn is_local(&self, address: &Address) -> bool {
        *address == self.address
    }

    /// Main-process check: the destination names one of our sub-pools.
    fn is_sub_of_self(&self, address: &Address) -> bool {
        self.address.subpool.is_none()
            && address.subpool.is_some()
            && address.same_endpoint(&self.address)
    }

    fn lookup_local(&self, uid: &ActorUid) -> Option<Address> {
        if self.registry.contains(uid) {
            return Some(self.address.clone());
        }
        let supervisor = self
            .supervisor
            .lock()
            .expect("supervisor slot poisoned")
            .clone();
        supervisor
            .and_then(|s| s.index_of(uid).map(|i| s.logical_address(i)))
    }

    async fn create_local(
        self: &Arc<Self>,
        class_id: &str,
        uid: ActorUid,
        init_body: Bytes,
    ) -> Result<ActorRef> {
        if self.registry.contains(&uid) {
            return Err(PoolError::Duplicate(uid.to_string()));
        }

        let actor_ref = ActorRef::new(uid.clone(), self.address.clone());
        let registry = self.registry.clone();
        let exit_uid = uid.clone();
        let on_exit = Box::new(move |_status: ActorStatus| {
            registry.remove(&exit_uid);
        });

        let handle = self
            .classes
            .spawn(
                class_id,
                SpawnRequest {
                    actor_ref: actor_ref.clone(),
                    init_body,
                    codec: self.codec.clone(),
                    messenger: self.clone() as Arc<dyn Messenger>,
                    cfg: CellConfig {
                        watchdog: self.cfg.watchdog,
                        quarantine_strikes: self.cfg.quarantine_strikes,
                    },
                    on_exit,
                },
            )
            .await?;

        if let Err(e) = self.registry.insert(handle.clone()) {
            // Lost a create race; stop the orphan cell.
            let stop = Envelope::control(
                self.router.ids().next(),
                actor_ref,
                ControlPayload::Stop.encode(),
            );
            let _ = handle.enqueue(InboxItem {
                envelope: stop,
                completion: None,
            });
            return Err(e);
        }
        tracing::info!(actor = %self.address, uid = %uid, class = class_id, "actor created");
        Ok(actor_ref)
    }

    async fn destroy_local(&self, uid: &ActorUid) -> Result<()> {
        let cell = match self.registry.get(uid) {
            Some(cell) => cell,
            None => return Ok(()),
        };

        let stop = Envelope::control(
            self.router.ids().next(),
            cell.actor_ref().clone(),
            ControlPayload::Stop.encode(),
        );
        let (tx, rx) = tokio::sync::oneshot::channel();
        match cell.enqueue(InboxItem {
            envelope: stop,
            completion: Some(Completion::Local(tx)),
        }) {
            Ok(()) => {
                let _ = rx.await;
                cell.wait_stopped().await;
            }
            // Already stopping or stopped: destroy is idempotent.
            Err(_) => {
                cell.wait_stopped().await;
            }
        }
        tracing::info!(uid = %uid, "actor destroyed");
        Ok(())
    }

    async fn director_destroy(&self, actor_ref: &ActorRef) -> Result<()> {
        let director = ActorRef::new(
            ActorUid::from(DIRECTOR_UID),
            actor_ref.address.clone(),
        );
        let frame = CallFrame::new(
            message_tag::<DestroyActorRequest>(),
            self.codec.encode(&DestroyActorRequest {
                uid: actor_ref.uid.clone(),
            })?,
        );
        let bytes = self
            .send_call(director, frame, Some(SYSTEM_CALL_DEADLINE), EnvelopeFlags::empty())
            .await?;
        let _: DestroyActorResponse = self.codec.decode(&bytes)?;
        Ok(())
    }

    async fn send_call(
        &self,
        to: ActorRef,
        frame: CallFrame,
        deadline: Option<Duration>,
        flags: EnvelopeFlags,
    ) -> Result<Bytes> {
        self.send_payload(to, frame.encode(), deadline, flags, EnvelopeKind::Send)
            .await
    }

    async fn send_payload(
        &self,
        to: ActorRef,
        payload: Bytes,
        deadline: Option<Duration>,
        flags: EnvelopeFlags,
        kind: EnvelopeKind,
    ) -> Result<Bytes> {
        if payload.len() > self.cfg.max_envelope_bytes {
            return Err(PoolError::PayloadTooLarge(format!(
                "{} bytes (max {})",
                payload.len(),
                self.cfg.max_envelope_bytes
            )));
        }
        let id = self.router.ids().next();
        let mut envelope = Envelope {
            envelope_id: id,
            kind,
            from: Some(ActorRef::control(self.address.clone())),
            to,
            correlation_id: Some(id),
            deadline_unix_ns: None,
            codec_id: C::CODEC_ID,
            flags,
            payload,
        };
        if let Some(budget) = deadline {
            envelope = envelope.with_deadline(budget);
        }

        if self.is_local(&envelope.to.address) {
            return self.local_request(envelope, deadline).await;
        }

        if self.is_sub_of_self(&envelope.to.address) {
            let sup = self
                .supervisor
                .lock()
                .expect("supervisor slot poisoned")
                .clone()
                .ok_or_else(|| {
                    PoolError::ActorNotFound("no sub-pools behind this endpoint".into())
                })?;
            if sup.is_lost(&envelope.to.uid) {
                return Err(PoolError::SubPoolLost(format!(
                    "{} was lost with its sub-pool",
                    envelope.to.uid
                )));
            }
            let (tx, rx) = tokio::sync::oneshot::channel();
            sup.forward(envelope, Some(Completion::Local(tx))).await;
            return rx
                .await
                .map_err(|_| PoolError::Internal("forward dropped its completion".into()))?;
        }

        let endpoint = envelope.to.address.endpoint();
        let reply = self.router.request(envelope, deadline).await.map_err(|e| {
            if matches!(e, PoolError::PeerGone(_)) {
                self.cache.invalidate_endpoint(&endpoint);
            }
            e
        })?;
        match reply.kind {
            EnvelopeKind::Reply => Ok(reply.payload),
            EnvelopeKind::Error => Err(ErrorPayload::decode(&reply.payload).into()),
            other => Err(PoolError::ProtocolError(format!(
                "unexpected reply kind {other:?}"
            ))),
        }
    }

    async fn local_request(&self, envelope: Envelope, deadline: Option<Duration>) -> Result<Bytes> {
        let correlation = envelope.correlation_id.unwrap_or(envelope.envelope_id);
        let cell = self
            .registry
            .get(&envelope.to.uid)
            .ok_or_else(|| PoolError::ActorNotFound(envelope.to.uid.to_string()))?;

        if envelope.kind == EnvelopeKind::Tell {
            // Local tells complete once enqueued; the TELL_ACK handshake
            // collapses to the enqueue result itself.
            return cell
                .enqueue(InboxItem {
                    envelope,
                    completion: None,
                })
                .map(|_| Bytes::new());
        }

        let (tx, rx) = tokio::sync::oneshot::channel();
        cell.enqueue(InboxItem {
            envelope,
            completion: Some(Completion::Local(tx)),
        })?;

        match deadline {
            Some(budget) => match tokio::time::timeout(budget, rx).await {
                Ok(done) => {
                    done.map_err(|_| PoolError::ActorFailed("actor dropped the request".into()))?
                }
                Err(_) => {
                    cell.request_cancel(correlation);
                    Err(PoolError::Timeout("no reply before deadline".into()))
                }
            },
            None => rx
                .await
                .map_err(|_| PoolError::ActorFailed("actor dropped the request".into()))?,
        }
    }

    async fn tell_call(&self, to: ActorRef, frame: CallFrame, flags: EnvelopeFlags) -> Result<()> {
        let payload = frame.encode();
        if payload.len() > self.cfg.max_envelope_bytes {
            return Err(PoolError::PayloadTooLarge(format!(
                "{} bytes (max {})",
                payload.len(),
                self.cfg.max_envelope_bytes
            )));
        }
        let id = self.router.ids().next();
        let envelope = Envelope {
            envelope_id: id,
            kind: EnvelopeKind::Tell,
            from: Some(ActorRef::control(self.address.clone())),
            to,
            correlation_id: None,
            deadline_unix_ns: None,
            codec_id: C::CODEC_ID,
            flags,
            payload,
        };

        if self.is_local(&envelope.to.address) {
            let cell = self
                .registry
                .get(&envelope.to.uid)
                .ok_or_else(|| PoolError::ActorNotFound(envelope.to.uid.to_string()))?;
            return cell.enqueue(InboxItem {
                envelope,
                completion: None,
            });
        }

        if self.is_sub_of_self(&envelope.to.address) {
            let sup = self
                .supervisor
                .lock()
                .expect("supervisor slot poisoned")
                .clone()
                .ok_or_else(|| {
                    PoolError::ActorNotFound("no sub-pools behind this endpoint".into())
                })?;
            sup.forward(envelope, None).await;
            return Ok(());
        }

        self.router.tell(envelope, false).await
    }
}

#[async_trait]
impl<C: Codec> Messenger for KernelInner<C> {
    async fn send_frame(
        &self,
        to: ActorRef,
        frame: CallFrame,
        deadline: Option<Duration>,
    ) -> Result<Bytes> {
        // Handlers reach the kernel through their context; the context
        // already rejected self-calls.
        self.send_call(to, frame, deadline, EnvelopeFlags::empty())
            .await
    }

    async fn tell_frame(&self, to: ActorRef, frame: CallFrame) -> Result<()> {
        self.tell_call(to, frame, EnvelopeFlags::empty()).await
    }
}

fn spawn_reply(channel: Arc<caravel_transport::Channel>, envelope: Envelope) {
    tokio::spawn(async move {
        if let Err(e) = channel.send(envelope, false).await {
            tracing::debug!(error = %e, "reply dropped, channel gone");
        }
    });
}
