//! Per-process router.
//!
//! The router owns the table of channels to peer processes. Outbound, it
//! resolves a destination address to a channel (connecting lazily);
//! inbound, channels complete reply waiters themselves and hand everything
//! else to the router's sink, which the pool runtime drains into the
//! kernel.
//!
//! Reconnection is the router's job: a failed endpoint gets exponential
//! backoff with full jitter (base 100 ms, cap 10 s) up to a reconnect
//! deadline; past the deadline sends fail immediately until
//! [`Router::refresh_peer`] clears the state after a fresh lookup.

use crate::config::ReconnectConfig;
use crate::error::{PoolError, Result};
use caravel_transport::channel::ReportFn;
use caravel_transport::{
    ActorRef, Address, Channel, ChannelConfig, ChannelError, Envelope, EnvelopeIdAllocator,
    InboundSink,
};
use caravel_transport::DriverSet;
use rand::Rng;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

/// Router tuning: channel behavior plus reconnect policy.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub channel: ChannelConfig,
    pub reconnect: ReconnectConfig,
}

#[derive(Debug, Clone)]
struct BackoffState {
    failures: u32,
    first_failure: Instant,
    next_attempt: Instant,
}

/// Process-wide dispatch singleton.
///
/// Initialized at pool startup and torn down at shutdown; handlers never
/// touch it directly, only through the kernel.
pub struct Router {
    local: Address,
    drivers: DriverSet,
    config: RouterConfig,
    sink: InboundSink,
    channels: Mutex<HashMap<String, Arc<Channel>>>,
    backoff: Mutex<HashMap<String, BackoffState>>,
    connect_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    report_fn: Mutex<Option<ReportFn>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    ids: Arc<EnvelopeIdAllocator>,
}

impl Router {
    pub fn new(
        local: Address,
        drivers: DriverSet,
        config: RouterConfig,
        sink: InboundSink,
    ) -> Arc<Self> {
        Arc::new(Self {
            local,
            drivers,
            config,
            sink,
            channels: Mutex::new(HashMap::new()),
            backoff: Mutex::new(HashMap::new()),
            connect_locks: Mutex::new(HashMap::new()),
            report_fn: Mutex::new(None),
            accept_task: Mutex::new(None),
            ids: Arc::new(EnvelopeIdAllocator::new()),
        })
    }

    /// This process's address.
    pub fn local_address(&self) -> &Address {
        &self.local
    }

    /// Process-wide envelope id allocator.
    pub fn ids(&self) -> &Arc<EnvelopeIdAllocator> {
        &self.ids
    }

    /// Install the registry-report callback piggybacked on heartbeats
    /// (sub-pool processes only). Must run before [`Router::bind`].
    pub fn set_report_fn(&self, report: ReportFn) {
        *self.report_fn.lock().expect("report fn poisoned") = Some(report);
    }

    /// Bind the local listener and start accepting inbound channels.
    ///
    /// Returns the resolved local address (a `tcp://…:0` bind reports the
    /// kernel-assigned port).
    pub async fn bind(self: &Arc<Self>) -> Result<Address> {
        let mut listener = self.drivers.listen(&self.local).await?;
        let resolved = listener.local.clone();
        let router = self.clone();

        let task = tokio::spawn(async move {
            loop {
                match listener.acceptor.accept().await {
                    Ok(conduit) => {
                        let router = router.clone();
                        tokio::spawn(async move {
                            let report = router
                                .report_fn
                                .lock()
                                .expect("report fn poisoned")
                                .clone();
                            match Channel::open(
                                conduit,
                                router.local.clone(),
                                router.config.channel.clone(),
                                router.sink.clone(),
                                report,
                            )
                            .await
                            {
                                Ok(channel) => {
                                    let key = channel.peer_address().endpoint_key();
                                    tracing::debug!(peer = %key, "inbound channel accepted");
                                    router
                                        .channels
                                        .lock()
                                        .expect("channel table poisoned")
                                        .insert(key, channel);
                                }
                                Err(e) => {
                                    tracing::warn!(error = %e, "inbound handshake failed");
                                }
                            }
                        });
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "listener failed, no further inbound channels");
                        break;
                    }
                }
            }
        });
        *self.accept_task.lock().expect("accept task poisoned") = Some(task);

        tracing::info!(address = %resolved, "router listening");
        Ok(resolved)
    }

    /// Resolve a destination to an open channel, connecting lazily.
    pub async fn channel_to(self: &Arc<Self>, addr: &Address) -> Result<Arc<Channel>> {
        let key = addr.endpoint_key();

        if let Some(channel) = self.lookup_open(&key) {
            return Ok(channel);
        }

        // One connect attempt per endpoint at a time; concurrent senders
        // queue on the lock and reuse the winner's channel.
        let lock = {
            let mut locks = self.connect_locks.lock().expect("connect locks poisoned");
            locks
                .entry(key.clone())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        let _guard = lock.lock().await;

        if let Some(channel) = self.lookup_open(&key) {
            return Ok(channel);
        }

        self.backoff_gate(&key).await?;

        match self.drivers.connect(addr).await {
            Ok(conduit) => {
                let report_fn = self.report_fn.lock().expect("report fn poisoned").clone();
                let channel = Channel::open(
                    conduit,
                    self.local.clone(),
                    self.config.channel.clone(),
                    self.sink.clone(),
                    report_fn,
                )
                .await;
                match channel {
                    Ok(channel) => {
                        self.backoff
                            .lock()
                            .expect("backoff poisoned")
                            .remove(&key);
                        self.channels
                            .lock()
                            .expect("channel table poisoned")
                            .insert(key, channel.clone());
                        Ok(channel)
                    }
                    Err(e) => {
                        self.note_failure(&key);
                        Err(e.into())
                    }
                }
            }
            Err(e) => {
                self.note_failure(&key);
                Err(e.into())
            }
        }
    }

    /// Send a request and await the correlated reply envelope.
    ///
    /// On deadline expiry the waiter is removed, the caller gets
    /// `Timeout`, and a `Cancel` envelope chases the request.
    pub async fn request(
        self: &Arc<Self>,
        envelope: Envelope,
        deadline: Option<Duration>,
    ) -> Result<Envelope> {
        let channel = self.channel_to(&envelope.to.address).await?;
        let correlation = envelope.correlation_id;
        let to = envelope.to.clone();
        match channel.request(envelope, deadline).await {
            Ok(reply) => Ok(reply),
            Err(ChannelError::Timeout) => {
                if let Some(correlation) = correlation {
                    self.spawn_cancel(channel, to, correlation);
                }
                Err(PoolError::Timeout("no reply before deadline".into()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Fire-and-forget dispatch. `bounded` selects Backpressure-fail
    /// behavior instead of suspending when the queue is over the mark.
    pub async fn tell(self: &Arc<Self>, envelope: Envelope, bounded: bool) -> Result<()> {
        let channel = self.channel_to(&envelope.to.address).await?;
        Ok(channel.send(envelope, bounded).await?)
    }

    fn spawn_cancel(&self, channel: Arc<Channel>, to: ActorRef, correlation: u64) {
        let from = ActorRef::control(self.local.clone());
        let cancel = Envelope::cancel(self.ids.next(), from, to, correlation);
        tokio::spawn(async move {
            if let Err(e) = channel.send(cancel, false).await {
                tracing::debug!(error = %e, "cancel not delivered");
            }
        });
    }

    /// Drop the channel to a peer and fail it, resolving its pending
    /// replies with `PeerGone`. Cached routes through this peer are stale
    /// from now on.
    pub fn fail_peer(&self, addr: &Address, reason: &str) {
        let key = addr.endpoint_key();
        let channel = self
            .channels
            .lock()
            .expect("channel table poisoned")
            .remove(&key);
        if let Some(channel) = channel {
            channel.fail(reason);
        }
    }

    /// Whether an open channel to this peer exists right now.
    pub fn peer_open(&self, addr: &Address) -> bool {
        self.lookup_open(&addr.endpoint_key()).is_some()
    }

    /// Clear reconnect state after an external lookup refreshed the
    /// address; the next send gets a fresh connect budget.
    pub fn refresh_peer(&self, addr: &Address) {
        self.backoff
            .lock()
            .expect("backoff poisoned")
            .remove(&addr.endpoint_key());
    }

    /// Channel handle for a peer, if one exists (open or not).
    pub fn channel_snapshot(&self, addr: &Address) -> Option<Arc<Channel>> {
        self.channels
            .lock()
            .expect("channel table poisoned")
            .get(&addr.endpoint_key())
            .cloned()
    }

    /// Gracefully drain every channel and stop accepting.
    pub async fn shutdown(&self) {
        if let Some(task) = self.accept_task.lock().expect("accept task poisoned").take() {
            task.abort();
        }
        let channels: Vec<_> = {
            let mut table = self.channels.lock().expect("channel table poisoned");
            table.drain().map(|(_, c)| c).collect()
        };
        for channel in channels {
            channel.close_graceful().await;
        }
    }

    fn lookup_open(&self, key: &str) -> Option<Arc<Channel>> {
        let mut table = self.channels.lock().expect("channel table poisoned");
        match table.get(key) {
            Some(channel) if channel.is_open() => Some(channel.clone()),
            Some(_) => {
                table.remove(key);
                None
            }
            None => None,
        }
    }

    /// Wait out the backoff window, or fail fast once the reconnect
    /// deadline has passed.
    async fn backoff_gate(&self, key: &str) -> Result<()> {
        let wait = {
            let backoff = self.backoff.lock().expect("backoff poisoned");
            match backoff.get(key) {
                None => None,
                Some(state) => {
                    if state.first_failure.elapsed() >= self.config.reconnect.deadline {
                        return Err(PoolError::PeerGone(format!(
                            "{key}: reconnect deadline exceeded after {} attempts",
                            state.failures
                        )));
                    }
                    let now = Instant::now();
                    (state.next_attempt > now).then(|| state.next_attempt - now)
                }
            }
        };
        if let Some(wait) = wait {
            tokio::time::sleep(wait).await;
        }
        Ok(())
    }

    fn note_failure(&self, key: &str) {
        let mut backoff = self.backoff.lock().expect("backoff poisoned");
        let now = Instant::now();
        let state = backoff.entry(key.to_string()).or_insert(BackoffState {
            failures: 0,
            first_failure: now,
            next_attempt: now,
        });
        state.failures += 1;
        let exp = self
            .config
            .reconnect
            .base
            .saturating_mul(1u32 << (state.failures - 1).min(16));
        let ceiling = exp.min(self.config.reconnect.cap);
        // Full jitter: uniform over [0, ceiling].
        let jittered = rand::thread_rng().gen_range(0..=ceiling.as_millis() as u64);
        state.next_attempt = now + Duration::from_millis(jittered);
        tracing::debug!(
            peer = key,
            failures = state.failures,
            next_attempt_ms = jittered,
            "connect failed, backing off"
        );
    }

}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("local", &self.local.to_string())
            .field(
                "channels",
                &self.channels.lock().expect("channel table poisoned").len(),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use caravel_transport::channel::Inbound;
    use caravel_transport::{ActorUid, CallFrame, Codec, EnvelopeKind, JsonCodec, CODEC_ID_JSON};
    use tokio::sync::mpsc;

    fn addr(s: &str) -> Address {
        Address::parse(s).unwrap()
    }

    fn router_config() -> RouterConfig {
        RouterConfig {
            channel: ChannelConfig::default(),
            reconnect: ReconnectConfig {
                base: Duration::from_millis(10),
                cap: Duration::from_millis(50),
                deadline: Duration::from_millis(300),
            },
        }
    }

    fn new_router(local: &str) -> (Arc<Router>, mpsc::UnboundedReceiver<Inbound>) {
        let (sink_tx, sink_rx) = mpsc::unbounded_channel();
        let router = Router::new(
            addr(local),
            DriverSet::standard(),
            router_config(),
            sink_tx,
        );
        (router, sink_rx)
    }

    #[tokio::test]
    async fn test_lazy_connect_and_request_reply() {
        let (server, mut server_rx) = new_router("inproc://router-server");
        server.bind().await.unwrap();
        let (client, _client_rx) = new_router("inproc://router-client");

        // Echo server: reply with the request payload.
        tokio::spawn(async move {
            while let Some(inbound) = server_rx.recv().await {
                if inbound.envelope.kind == EnvelopeKind::Send {
                    let reply = Envelope::reply(
                        inbound.channel.next_id(),
                        &inbound.envelope,
                        inbound.envelope.payload.clone(),
                    );
                    inbound.channel.send(reply, false).await.unwrap();
                }
            }
        });

        let to = ActorRef::new(ActorUid::from("echo"), addr("inproc://router-server"));
        let from = ActorRef::new(ActorUid::from("caller"), addr("inproc://router-client"));
        let frame = CallFrame::new("Echo", JsonCodec.encode(&"hi").unwrap());
        let env = Envelope::send(client.ids().next(), from, to, CODEC_ID_JSON, frame.encode());

        let reply = client
            .request(env, Some(Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(reply.kind, EnvelopeKind::Reply);
    }

    #[tokio::test]
    async fn test_connect_failure_backs_off_then_exhausts() {
        let (client, _rx) = new_router("inproc://router-lonely");
        let to = ActorRef::new(ActorUid::from("x"), addr("inproc://router-nowhere"));
        let from = ActorRef::new(ActorUid::from("c"), addr("inproc://router-lonely"));

        // Repeated failures against a dead peer eventually exhaust the
        // reconnect deadline and start failing fast.
        let mut exhausted = false;
        for _ in 0..40 {
            let env = Envelope::tell(
                client.ids().next(),
                from.clone(),
                to.clone(),
                CODEC_ID_JSON,
                bytes::Bytes::new(),
            );
            match client.tell(env, false).await {
                Err(PoolError::PeerGone(reason)) if reason.contains("deadline exceeded") => {
                    exhausted = true;
                    break;
                }
                Err(PoolError::PeerGone(_)) => {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
                other => panic!("unexpected outcome: {other:?}"),
            }
        }
        assert!(exhausted, "backoff never reached its deadline");

        // A lookup refresh resets the budget.
        client.refresh_peer(&addr("inproc://router-nowhere"));
        let env = Envelope::tell(
            client.ids().next(),
            from,
            to,
            CODEC_ID_JSON,
            bytes::Bytes::new(),
        );
        match client.tell(env, false).await {
            Err(PoolError::PeerGone(reason)) => {
                assert!(!reason.contains("deadline exceeded"), "budget was reset");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_fail_peer_resolves_waiters() {
        let (server, mut server_rx) = new_router("inproc://router-crash");
        server.bind().await.unwrap();
        let (client, _rx) = new_router("inproc://router-watcher");

        // Server accepts requests and never replies.
        tokio::spawn(async move { while server_rx.recv().await.is_some() {} });

        let to = ActorRef::new(ActorUid::from("dead"), addr("inproc://router-crash"));
        let from = ActorRef::new(ActorUid::from("c"), addr("inproc://router-watcher"));

        let mut waiters = Vec::new();
        for _ in 0..10 {
            let client = client.clone();
            let env = Envelope::send(
                client.ids().next(),
                from.clone(),
                to.clone(),
                CODEC_ID_JSON,
                CallFrame::new("X", bytes::Bytes::new()).encode(),
            );
            waiters.push(tokio::spawn(async move { client.request(env, None).await }));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        client.fail_peer(&addr("inproc://router-crash"), "peer killed");

        for waiter in waiters {
            let result = waiter.await.unwrap();
            assert!(matches!(result, Err(PoolError::PeerGone(_))));
        }
        assert!(!client.peer_open(&addr("inproc://router-crash")));
    }
}
