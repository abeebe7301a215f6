//! Channels: ordered, bidirectional envelope streams with liveness.
//!
//! A channel wraps a driver [`Conduit`] and layers on:
//!
//! - a handshake exchanging `{protocol_version, process_id, address}`,
//! - heartbeats (`Control:Ping` every interval while idle; two consecutive
//!   misses close the channel),
//! - a pending-reply table correlating `Send` with `Reply`/`Error`,
//! - outbound flow control against a high-water mark,
//! - graceful drain and unclean close semantics.
//!
//! State machine: `Connecting → Open → Draining → Closed`. Unclean
//! disconnects jump straight to `Closed` and fail every pending reply with
//! `PeerGone`.

use crate::addr::{ActorRef, Address};
use crate::control::{ControlPayload, RegistryReport};
use crate::driver::Conduit;
use crate::envelope::{Envelope, EnvelopeFlags, EnvelopeIdAllocator, EnvelopeKind};
use crate::error::ChannelError;
use crate::wire::FrameCodec;
use crate::PROTOCOL_VERSION;
use bytes::BytesMut;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch, Notify};

/// Channel lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    Draining,
    Closed,
}

/// Tuning knobs for channel behavior.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Idle interval between `Control:Ping` probes.
    pub heartbeat_interval: Duration,
    /// Consecutive missed heartbeats before the channel is closed.
    pub heartbeat_misses: u32,
    /// Deadline for the initial handshake exchange.
    pub handshake_timeout: Duration,
    /// Outbound high-water mark in envelopes.
    pub high_water_envelopes: usize,
    /// Outbound high-water mark in bytes.
    pub high_water_bytes: usize,
    /// How long a graceful close waits for pending replies.
    pub drain_deadline: Duration,
    /// Maximum envelope size for framing.
    pub max_envelope_bytes: usize,
    /// Tear the channel down after this long without non-control
    /// traffic. `None` keeps idle channels open indefinitely.
    pub idle_timeout: Option<Duration>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(10),
            heartbeat_misses: 2,
            handshake_timeout: Duration::from_secs(5),
            high_water_envelopes: 1024,
            high_water_bytes: 64 * 1024 * 1024,
            drain_deadline: Duration::from_secs(10),
            max_envelope_bytes: crate::wire::DEFAULT_MAX_ENVELOPE_BYTES,
            idle_timeout: Some(Duration::from_secs(300)),
        }
    }
}

/// Per-channel traffic counters.
#[derive(Debug, Default)]
pub struct ChannelMetrics {
    pub envelopes_sent: AtomicU64,
    pub envelopes_received: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,
    pub last_ping_rtt_ns: AtomicU64,
}

/// Peer identity learned from the handshake.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub protocol_version: u32,
    pub process_id: u64,
    pub address: Address,
}

/// An inbound envelope together with the channel it arrived on, so replies
/// can be sent back the same way.
pub struct Inbound {
    pub envelope: Envelope,
    pub channel: Arc<Channel>,
}

/// Sink for envelopes that are not reply completions: requests, tells,
/// cancels and control traffic the channel does not consume itself.
pub type InboundSink = mpsc::UnboundedSender<Inbound>;

/// Callback producing the registry report piggybacked on `Pong`s.
pub type ReportFn = Arc<dyn Fn() -> Option<RegistryReport> + Send + Sync>;

struct OutboundItem {
    env: Envelope,
    /// Whether this envelope was charged against the high-water mark.
    accounted: bool,
}

type PendingMap = Mutex<HashMap<u64, oneshot::Sender<Result<Envelope, ChannelError>>>>;

/// One live channel to a peer.
pub struct Channel {
    local_address: Address,
    peer_address: Address,
    peer_info: PeerInfo,
    bypass_codec: bool,

    state_tx: watch::Sender<ChannelState>,
    pending: PendingMap,
    pending_drained: Notify,

    outbound_tx: mpsc::UnboundedSender<OutboundItem>,
    queued_envelopes: AtomicUsize,
    queued_bytes: AtomicUsize,
    space_available: Notify,

    frame: FrameCodec,
    config: ChannelConfig,
    metrics: ChannelMetrics,
    ids: EnvelopeIdAllocator,
    ping_seq: AtomicU64,
    last_received_at: Mutex<Instant>,
    last_traffic_at: Mutex<Instant>,
    last_ping_sent_at: Mutex<Option<Instant>>,
    report_fn: Option<ReportFn>,
}

impl Channel {
    /// Open a channel over a fresh conduit: perform the handshake, then
    /// spawn the reader/writer/heartbeat machinery.
    ///
    /// Used identically for outbound connections and accepted conduits;
    /// both sides send their hello first and then wait for the peer's.
    pub async fn open(
        conduit: Conduit,
        local_address: Address,
        config: ChannelConfig,
        sink: InboundSink,
        report_fn: Option<ReportFn>,
    ) -> Result<Arc<Channel>, ChannelError> {
        let frame = FrameCodec::new(config.max_envelope_bytes);
        let ids = EnvelopeIdAllocator::new();

        let hello = ControlPayload::Handshake {
            protocol_version: PROTOCOL_VERSION,
            process_id: std::process::id() as u64,
            address: local_address.to_string(),
        };

        let (peer_info, parts) = match conduit {
            Conduit::Stream(io) => {
                let (mut read_half, mut write_half) = tokio::io::split(io);

                let hello_env = Envelope::control(
                    ids.next(),
                    ActorRef::control(local_address.clone()),
                    hello.encode(),
                );
                let hello_frame = frame.encode(&hello_env)?;
                write_half.write_all(&hello_frame).await.map_err(|e| {
                    ChannelError::PeerGone(format!("write during handshake: {e}"))
                })?;
                write_half.flush().await.map_err(|e| {
                    ChannelError::PeerGone(format!("flush during handshake: {e}"))
                })?;

                let peer_env = tokio::time::timeout(
                    config.handshake_timeout,
                    read_one_frame(&mut read_half, &frame),
                )
                .await
                .map_err(|_| ChannelError::Handshake("handshake timed out".into()))??;

                let info = parse_handshake(&peer_env)?;
                (info, ConduitParts::Stream(read_half, write_half))
            }
            Conduit::Pair { tx, mut rx } => {
                let hello_env = Envelope::control(
                    ids.next(),
                    ActorRef::control(local_address.clone()),
                    hello.encode(),
                );
                tx.send(hello_env)
                    .map_err(|_| ChannelError::PeerGone("pair closed during handshake".into()))?;

                let peer_env = tokio::time::timeout(config.handshake_timeout, rx.recv())
                    .await
                    .map_err(|_| ChannelError::Handshake("handshake timed out".into()))?
                    .ok_or_else(|| {
                        ChannelError::PeerGone("pair closed during handshake".into())
                    })?;

                let info = parse_handshake(&peer_env)?;
                (info, ConduitParts::Pair(tx, rx))
            }
        };

        let bypass_codec = matches!(parts, ConduitParts::Pair(_, _));
        let (state_tx, _) = watch::channel(ChannelState::Open);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        let channel = Arc::new(Channel {
            local_address,
            peer_address: peer_info.address.clone(),
            peer_info,
            bypass_codec,
            state_tx,
            pending: Mutex::new(HashMap::new()),
            pending_drained: Notify::new(),
            outbound_tx,
            queued_envelopes: AtomicUsize::new(0),
            queued_bytes: AtomicUsize::new(0),
            space_available: Notify::new(),
            frame,
            config,
            metrics: ChannelMetrics::default(),
            ids,
            ping_seq: AtomicU64::new(0),
            last_received_at: Mutex::new(Instant::now()),
            last_traffic_at: Mutex::new(Instant::now()),
            last_ping_sent_at: Mutex::new(None),
            report_fn,
        });

        channel.clone().spawn_io(parts, outbound_rx, sink);
        tracing::debug!(
            local = %channel.local_address,
            peer = %channel.peer_address,
            bypass = bypass_codec,
            "channel open"
        );
        Ok(channel)
    }

    /// Current state.
    pub fn state(&self) -> ChannelState {
        *self.state_tx.borrow()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ChannelState::Open
    }

    /// Peer address claimed in the handshake.
    pub fn peer_address(&self) -> &Address {
        &self.peer_address
    }

    pub fn peer_info(&self) -> &PeerInfo {
        &self.peer_info
    }

    pub fn metrics(&self) -> &ChannelMetrics {
        &self.metrics
    }

    /// Number of requests awaiting a reply.
    pub fn pending_len(&self) -> usize {
        self.pending.lock().expect("pending poisoned").len()
    }

    /// Allocate an envelope id from this channel's process-local allocator.
    pub fn next_id(&self) -> u64 {
        self.ids.next()
    }

    /// Enqueue an envelope for transmission, honoring flow control.
    ///
    /// With `bounded_wait = true` (deadline calls) an over-watermark queue
    /// fails immediately with `Backpressure`; otherwise the caller suspends
    /// until space frees up. Control and cancel envelopes bypass flow
    /// control so liveness never depends on queue space.
    pub async fn send(&self, mut env: Envelope, bounded_wait: bool) -> Result<(), ChannelError> {
        match self.state() {
            ChannelState::Open => {}
            ChannelState::Draining => return Err(ChannelError::Draining),
            _ => return Err(ChannelError::PeerGone("channel closed".into())),
        }

        // Oversize payloads are rejected before the envelope is queued,
        // not when the writer frames it.
        if env.payload.len() > self.config.max_envelope_bytes {
            return Err(ChannelError::Wire(crate::error::WireError::EnvelopeTooLarge {
                size: env.payload.len(),
                max: self.config.max_envelope_bytes,
            }));
        }

        if self.bypass_codec {
            env.flags |= EnvelopeFlags::CODEC_BYPASS;
        }

        let control = matches!(env.kind, EnvelopeKind::Control | EnvelopeKind::Cancel);
        if !control {
            *self.last_traffic_at.lock().expect("instant poisoned") = Instant::now();
            let weight = env.weight();
            loop {
                // Register the waiter before re-checking the mark, otherwise a
                // release between check and await is lost and the sender hangs.
                let mut notified = std::pin::pin!(self.space_available.notified());
                notified.as_mut().enable();

                let over = self.queued_envelopes.load(Ordering::Acquire)
                    >= self.config.high_water_envelopes
                    || self.queued_bytes.load(Ordering::Acquire) >= self.config.high_water_bytes;
                if !over {
                    break;
                }
                if bounded_wait {
                    return Err(ChannelError::Backpressure);
                }
                notified.await;
                if self.state() != ChannelState::Open {
                    return Err(ChannelError::PeerGone("channel closed".into()));
                }
            }
            self.queued_envelopes.fetch_add(1, Ordering::AcqRel);
            self.queued_bytes.fetch_add(weight, Ordering::AcqRel);
        }

        self.outbound_tx
            .send(OutboundItem {
                env,
                accounted: !control,
            })
            .map_err(|_| ChannelError::PeerGone("writer task gone".into()))
    }

    /// Send a request and wait for its correlated `Reply`/`Error` envelope.
    ///
    /// The waiter is registered before the envelope leaves the process and
    /// cleared exactly once: by reply, error, timeout or cancellation. On
    /// timeout the waiter is removed here; emitting the `Cancel` envelope
    /// toward the peer is the caller's job.
    pub async fn request(
        self: &Arc<Self>,
        env: Envelope,
        deadline: Option<Duration>,
    ) -> Result<Envelope, ChannelError> {
        let correlation = env
            .correlation_id
            .ok_or_else(|| ChannelError::Handshake("request without correlation id".into()))?;

        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("pending poisoned")
            .insert(correlation, tx);

        if let Err(e) = self.send(env, deadline.is_some()).await {
            self.take_waiter(correlation);
            return Err(e);
        }

        let result = match deadline {
            Some(budget) => match tokio::time::timeout(budget, rx).await {
                Ok(inner) => inner,
                Err(_) => {
                    self.take_waiter(correlation);
                    return Err(ChannelError::Timeout);
                }
            },
            None => rx.await,
        };

        match result {
            Ok(outcome) => outcome,
            // Waiter dropped without completion: the channel failed.
            Err(_) => Err(ChannelError::PeerGone("channel closed".into())),
        }
    }

    /// Graceful close: stop accepting outbound envelopes, await pending
    /// replies up to the drain deadline, then close.
    pub async fn close_graceful(&self) {
        if self.state() != ChannelState::Open {
            return;
        }
        self.state_tx.send_replace(ChannelState::Draining);
        tracing::debug!(peer = %self.peer_address, "channel draining");

        let deadline = Instant::now() + self.config.drain_deadline;
        loop {
            if self.pending_len() == 0 {
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let wait = deadline - now;
            let _ = tokio::time::timeout(wait, self.pending_drained.notified()).await;
        }
        self.fail("graceful close");
    }

    /// Unclean close: fail every pending reply with `PeerGone` and stop the
    /// io tasks.
    pub fn fail(&self, reason: &str) {
        let already_closed = {
            let mut closed = false;
            self.state_tx.send_if_modified(|state| {
                if *state == ChannelState::Closed {
                    closed = true;
                    false
                } else {
                    *state = ChannelState::Closed;
                    true
                }
            });
            closed
        };
        if already_closed {
            return;
        }

        tracing::debug!(peer = %self.peer_address, reason, "channel closed");

        let waiters: Vec<_> = {
            let mut pending = self.pending.lock().expect("pending poisoned");
            pending.drain().collect()
        };
        for (_, tx) in waiters {
            let _ = tx.send(Err(ChannelError::PeerGone(reason.to_string())));
        }
        self.pending_drained.notify_waiters();
        // Wake senders suspended on flow control so they observe the close.
        self.space_available.notify_waiters();
    }

    fn take_waiter(
        &self,
        correlation: u64,
    ) -> Option<oneshot::Sender<Result<Envelope, ChannelError>>> {
        let waiter = self
            .pending
            .lock()
            .expect("pending poisoned")
            .remove(&correlation);
        if waiter.is_some() {
            self.pending_drained.notify_waiters();
        }
        waiter
    }

    fn spawn_io(
        self: Arc<Self>,
        parts: ConduitParts,
        outbound_rx: mpsc::UnboundedReceiver<OutboundItem>,
        sink: InboundSink,
    ) {
        match parts {
            ConduitParts::Stream(read_half, write_half) => {
                tokio::spawn(self.clone().writer_loop_stream(write_half, outbound_rx));
                tokio::spawn(self.clone().reader_loop_stream(read_half, sink));
            }
            ConduitParts::Pair(tx, rx) => {
                tokio::spawn(self.clone().writer_loop_pair(tx, outbound_rx));
                tokio::spawn(self.clone().reader_loop_pair(rx, sink));
            }
        }
        tokio::spawn(self.heartbeat_loop());
    }

    async fn writer_loop_stream(
        self: Arc<Self>,
        mut write_half: tokio::io::WriteHalf<Box<dyn crate::driver::Io>>,
        mut outbound_rx: mpsc::UnboundedReceiver<OutboundItem>,
    ) {
        let mut state_rx = self.state_tx.subscribe();
        loop {
            let item = tokio::select! {
                item = outbound_rx.recv() => match item {
                    Some(item) => item,
                    None => break,
                },
                _ = state_rx.changed() => {
                    if *state_rx.borrow() == ChannelState::Closed {
                        break;
                    }
                    continue;
                }
            };

            let frame = match self.frame.encode(&item.env) {
                Ok(frame) => frame,
                Err(e) => {
                    // Oversize should have been rejected at send; anything
                    // else here is a framing bug worth surfacing.
                    tracing::warn!(peer = %self.peer_address, error = %e, "dropping unencodable envelope");
                    self.release(&item);
                    continue;
                }
            };

            let write = write_half.write_all(&frame).await;
            self.release(&item);
            match write {
                Ok(()) => {
                    self.metrics.envelopes_sent.fetch_add(1, Ordering::Relaxed);
                    self.metrics
                        .bytes_sent
                        .fetch_add(frame.len() as u64, Ordering::Relaxed);
                }
                Err(e) => {
                    self.fail(&format!("write failed: {e}"));
                    break;
                }
            }
        }
    }

    async fn writer_loop_pair(
        self: Arc<Self>,
        tx: mpsc::UnboundedSender<Envelope>,
        mut outbound_rx: mpsc::UnboundedReceiver<OutboundItem>,
    ) {
        let mut state_rx = self.state_tx.subscribe();
        loop {
            let item = tokio::select! {
                item = outbound_rx.recv() => match item {
                    Some(item) => item,
                    None => break,
                },
                _ = state_rx.changed() => {
                    if *state_rx.borrow() == ChannelState::Closed {
                        break;
                    }
                    continue;
                }
            };

            let weight = item.env.weight() as u64;
            let send = tx.send(item.env.clone());
            self.release(&item);
            match send {
                Ok(()) => {
                    self.metrics.envelopes_sent.fetch_add(1, Ordering::Relaxed);
                    self.metrics.bytes_sent.fetch_add(weight, Ordering::Relaxed);
                }
                Err(_) => {
                    self.fail("peer queue dropped");
                    break;
                }
            }
        }
    }

    fn release(&self, item: &OutboundItem) {
        if item.accounted {
            self.queued_envelopes.fetch_sub(1, Ordering::AcqRel);
            self.queued_bytes
                .fetch_sub(item.env.weight(), Ordering::AcqRel);
            self.space_available.notify_waiters();
        }
    }

    async fn reader_loop_stream(
        self: Arc<Self>,
        mut read_half: tokio::io::ReadHalf<Box<dyn crate::driver::Io>>,
        sink: InboundSink,
    ) {
        let mut buffer = BytesMut::with_capacity(16 * 1024);
        let mut state_rx = self.state_tx.subscribe();
        'outer: loop {
            // Drain every complete frame already buffered.
            loop {
                match self.frame.try_decode(&buffer) {
                    Ok(Some((env, consumed))) => {
                        let _ = buffer.split_to(consumed);
                        self.metrics
                            .bytes_received
                            .fetch_add(consumed as u64, Ordering::Relaxed);
                        self.handle_inbound(env, &sink);
                    }
                    Ok(None) => break,
                    Err(e) => {
                        self.fail(&format!("frame error: {e}"));
                        break 'outer;
                    }
                }
            }

            tokio::select! {
                read = read_half.read_buf(&mut buffer) => match read {
                    Ok(0) => {
                        self.fail("peer closed the stream");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        self.fail(&format!("read failed: {e}"));
                        break;
                    }
                },
                _ = state_rx.changed() => {
                    if *state_rx.borrow() == ChannelState::Closed {
                        break;
                    }
                }
            }
        }
    }

    async fn reader_loop_pair(
        self: Arc<Self>,
        mut rx: mpsc::UnboundedReceiver<Envelope>,
        sink: InboundSink,
    ) {
        let mut state_rx = self.state_tx.subscribe();
        loop {
            tokio::select! {
                env = rx.recv() => match env {
                    Some(env) => {
                        self.metrics
                            .bytes_received
                            .fetch_add(env.weight() as u64, Ordering::Relaxed);
                        self.handle_inbound(env, &sink);
                    }
                    None => {
                        self.fail("peer queue dropped");
                        break;
                    }
                },
                _ = state_rx.changed() => {
                    if *state_rx.borrow() == ChannelState::Closed {
                        break;
                    }
                }
            }
        }
    }

    fn handle_inbound(self: &Arc<Self>, env: Envelope, sink: &InboundSink) {
        self.metrics
            .envelopes_received
            .fetch_add(1, Ordering::Relaxed);
        *self.last_received_at.lock().expect("instant poisoned") = Instant::now();
        if env.kind != EnvelopeKind::Control {
            *self.last_traffic_at.lock().expect("instant poisoned") = Instant::now();
        }

        match env.kind {
            EnvelopeKind::Reply | EnvelopeKind::Error => {
                if let Some(correlation) = env.correlation_id {
                    if let Some(tx) = self.take_waiter(correlation) {
                        let _ = tx.send(Ok(env));
                        return;
                    }
                }
                // A reply arriving after its waiter timed out; nothing to do.
                tracing::debug!(
                    peer = %self.peer_address,
                    correlation = ?env.correlation_id,
                    "late reply dropped"
                );
            }
            EnvelopeKind::Control => self.handle_control(env, sink),
            _ => {
                let _ = sink.send(Inbound {
                    envelope: env,
                    channel: self.clone(),
                });
            }
        }
    }

    fn handle_control(self: &Arc<Self>, env: Envelope, sink: &InboundSink) {
        match ControlPayload::decode(&env.payload) {
            Ok(ControlPayload::Ping { seq }) => {
                let report = self.report_fn.as_ref().and_then(|f| f());
                let pong = ControlPayload::Pong { seq, report };
                let reply = Envelope::control(
                    self.ids.next(),
                    ActorRef::control(self.peer_address.clone()),
                    pong.encode(),
                );
                let _ = self.outbound_tx.send(OutboundItem {
                    env: reply,
                    accounted: false,
                });
            }
            Ok(ControlPayload::Pong { report, .. }) => {
                if let Some(sent_at) = *self.last_ping_sent_at.lock().expect("instant poisoned") {
                    self.metrics
                        .last_ping_rtt_ns
                        .store(sent_at.elapsed().as_nanos() as u64, Ordering::Relaxed);
                }
                // Registry reports ride on pongs; surface them to the owner.
                if report.is_some() {
                    let _ = sink.send(Inbound {
                        envelope: env,
                        channel: self.clone(),
                    });
                }
            }
            Ok(ControlPayload::Handshake { .. }) => {
                tracing::warn!(peer = %self.peer_address, "unexpected handshake on open channel");
            }
            Ok(_) => {
                // Pool control (stop, drain, shutdown) belongs to the owner.
                let _ = sink.send(Inbound {
                    envelope: env,
                    channel: self.clone(),
                });
            }
            Err(e) => {
                tracing::warn!(peer = %self.peer_address, error = %e, "undecodable control payload");
            }
        }
    }

    async fn heartbeat_loop(self: Arc<Self>) {
        let interval = self.config.heartbeat_interval;
        let allowance = interval * self.config.heartbeat_misses;
        let mut state_rx = self.state_tx.subscribe();
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = state_rx.changed() => {
                    if *state_rx.borrow() == ChannelState::Closed {
                        break;
                    }
                    continue;
                }
            }

            let silent_for = self
                .last_received_at
                .lock()
                .expect("instant poisoned")
                .elapsed();
            if silent_for > allowance + interval {
                self.fail(&format!(
                    "missed {} heartbeats ({}ms silent)",
                    self.config.heartbeat_misses,
                    silent_for.as_millis()
                ));
                break;
            }

            // A channel nobody has used for the idle interval is torn
            // down; the router reconnects lazily on the next send.
            if let Some(idle_timeout) = self.config.idle_timeout {
                let idle_for = self
                    .last_traffic_at
                    .lock()
                    .expect("instant poisoned")
                    .elapsed();
                if idle_for > idle_timeout && self.pending_len() == 0 {
                    tracing::debug!(peer = %self.peer_address, "closing idle channel");
                    self.close_graceful().await;
                    break;
                }
            }

            // Probe only when idle; regular traffic already proves liveness.
            if silent_for >= interval {
                let seq = self.ping_seq.fetch_add(1, Ordering::Relaxed);
                *self.last_ping_sent_at.lock().expect("instant poisoned") = Some(Instant::now());
                let ping = Envelope::control(
                    self.ids.next(),
                    ActorRef::control(self.peer_address.clone()),
                    ControlPayload::Ping { seq }.encode(),
                );
                let _ = self.outbound_tx.send(OutboundItem {
                    env: ping,
                    accounted: false,
                });
            }
        }
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("local", &self.local_address.to_string())
            .field("peer", &self.peer_address.to_string())
            .field("state", &self.state())
            .field("pending", &self.pending_len())
            .finish()
    }
}

enum ConduitParts {
    Stream(
        tokio::io::ReadHalf<Box<dyn crate::driver::Io>>,
        tokio::io::WriteHalf<Box<dyn crate::driver::Io>>,
    ),
    Pair(
        mpsc::UnboundedSender<Envelope>,
        mpsc::UnboundedReceiver<Envelope>,
    ),
}

fn parse_handshake(env: &Envelope) -> Result<PeerInfo, ChannelError> {
    if env.kind != EnvelopeKind::Control {
        return Err(ChannelError::Handshake(format!(
            "expected handshake, got {:?}",
            env.kind
        )));
    }
    match ControlPayload::decode(&env.payload) {
        Ok(ControlPayload::Handshake {
            protocol_version,
            process_id,
            address,
        }) => {
            if protocol_version != PROTOCOL_VERSION {
                return Err(ChannelError::Handshake(format!(
                    "protocol version mismatch: ours {PROTOCOL_VERSION}, theirs {protocol_version}"
                )));
            }
            let address = Address::parse(&address)
                .map_err(|e| ChannelError::Handshake(format!("bad peer address: {e}")))?;
            Ok(PeerInfo {
                protocol_version,
                process_id,
                address,
            })
        }
        Ok(other) => Err(ChannelError::Handshake(format!(
            "expected handshake, got {other:?}"
        ))),
        Err(e) => Err(ChannelError::Handshake(e.to_string())),
    }
}

/// Read exactly one frame from a stream half (handshake path only).
async fn read_one_frame(
    read_half: &mut tokio::io::ReadHalf<Box<dyn crate::driver::Io>>,
    frame: &FrameCodec,
) -> Result<Envelope, ChannelError> {
    let mut buffer = BytesMut::with_capacity(1024);
    loop {
        if let Some((env, _)) = frame.try_decode(&buffer)? {
            return Ok(env);
        }
        let n = read_half.read_buf(&mut buffer).await.map_err(|e| {
            ChannelError::PeerGone(format!("read during handshake: {e}"))
        })?;
        if n == 0 {
            return Err(ChannelError::PeerGone("eof during handshake".into()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::ActorUid;
    use crate::codec::CODEC_ID_JSON;
    use bytes::Bytes;

    fn addr(s: &str) -> Address {
        Address::parse(s).unwrap()
    }

    fn pair_conduits() -> (Conduit, Conduit) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        (
            Conduit::Pair { tx: a_tx, rx: a_rx },
            Conduit::Pair { tx: b_tx, rx: b_rx },
        )
    }

    fn duplex_conduits() -> (Conduit, Conduit) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        (
            Conduit::Stream(Box::new(a)),
            Conduit::Stream(Box::new(b)),
        )
    }

    async fn open_pair(
        conduits: (Conduit, Conduit),
        config: ChannelConfig,
    ) -> (
        Arc<Channel>,
        mpsc::UnboundedReceiver<Inbound>,
        Arc<Channel>,
        mpsc::UnboundedReceiver<Inbound>,
    ) {
        let (a_sink_tx, a_sink_rx) = mpsc::unbounded_channel();
        let (b_sink_tx, b_sink_rx) = mpsc::unbounded_channel();
        let (left, right) = conduits;
        let (a, b) = tokio::join!(
            Channel::open(left, addr("tcp://127.0.0.1:1000"), config.clone(), a_sink_tx, None),
            Channel::open(right, addr("tcp://127.0.0.1:2000"), config, b_sink_tx, None),
        );
        (a.unwrap(), a_sink_rx, b.unwrap(), b_sink_rx)
    }

    fn request_to(target: &Address, channel: &Channel) -> Envelope {
        let id = channel.next_id();
        Envelope::send(
            id,
            ActorRef::new(ActorUid::from("caller"), addr("tcp://127.0.0.1:1000")),
            ActorRef::new(ActorUid::from("callee"), target.clone()),
            CODEC_ID_JSON,
            Bytes::from_static(b"{}"),
        )
    }

    #[tokio::test]
    async fn test_handshake_learns_peer_address() {
        let (a, _a_rx, b, _b_rx) = open_pair(pair_conduits(), ChannelConfig::default()).await;
        assert_eq!(a.peer_address(), &addr("tcp://127.0.0.1:2000"));
        assert_eq!(b.peer_address(), &addr("tcp://127.0.0.1:1000"));
        assert!(a.is_open());
        assert!(b.is_open());
    }

    #[tokio::test]
    async fn test_request_reply_over_stream() {
        let (a, _a_rx, b, mut b_rx) = open_pair(duplex_conduits(), ChannelConfig::default()).await;

        let server = tokio::spawn(async move {
            let inbound = b_rx.recv().await.expect("request arrives");
            assert_eq!(inbound.envelope.kind, EnvelopeKind::Send);
            let reply = Envelope::reply(
                inbound.channel.next_id(),
                &inbound.envelope,
                Bytes::from_static(b"pong"),
            );
            inbound.channel.send(reply, false).await.unwrap();
        });

        let env = request_to(b.peer_address(), &a);
        let reply = a.request(env, Some(Duration::from_secs(5))).await.unwrap();
        assert_eq!(reply.kind, EnvelopeKind::Reply);
        assert_eq!(&reply.payload[..], b"pong");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_pair_sets_codec_bypass() {
        let (a, _a_rx, _b, mut b_rx) = open_pair(pair_conduits(), ChannelConfig::default()).await;
        let env = Envelope::tell(
            a.next_id(),
            ActorRef::new(ActorUid::from("x"), addr("inproc://x")),
            ActorRef::new(ActorUid::from("y"), addr("inproc://y")),
            CODEC_ID_JSON,
            Bytes::from_static(b"raw"),
        );
        a.send(env, false).await.unwrap();
        let inbound = b_rx.recv().await.unwrap();
        assert!(inbound
            .envelope
            .flags
            .contains(EnvelopeFlags::CODEC_BYPASS));
    }

    #[tokio::test]
    async fn test_request_timeout_clears_waiter() {
        let (a, _a_rx, b, _b_rx) = open_pair(duplex_conduits(), ChannelConfig::default()).await;
        let env = request_to(b.peer_address(), &a);
        let result = a.request(env, Some(Duration::from_millis(50))).await;
        assert!(matches!(result, Err(ChannelError::Timeout)));
        assert_eq!(a.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_fail_resolves_pending_with_peer_gone() {
        let (a, _a_rx, b, _b_rx) = open_pair(duplex_conduits(), ChannelConfig::default()).await;

        let mut waiters = Vec::new();
        for _ in 0..10 {
            let a = a.clone();
            let env = request_to(b.peer_address(), &a);
            waiters.push(tokio::spawn(async move { a.request(env, None).await }));
        }
        // Let the requests register before the peer dies.
        tokio::time::sleep(Duration::from_millis(50)).await;
        b.fail("test kill");
        drop(b);
        a.fail("peer lost");

        for waiter in waiters {
            let result = waiter.await.unwrap();
            assert!(matches!(result, Err(ChannelError::PeerGone(_))));
        }
        assert_eq!(a.state(), ChannelState::Closed);
    }

    #[tokio::test]
    async fn test_backpressure_with_deadline() {
        let config = ChannelConfig {
            high_water_envelopes: 2,
            ..ChannelConfig::default()
        };
        // The peer end never reads after the handshake, so the duplex
        // buffer fills and the writer stalls with envelopes still accounted.
        let (a_io, b_io) = tokio::io::duplex(256);
        let (sink_tx, _sink_rx) = mpsc::unbounded_channel();
        let frame = FrameCodec::default();
        let (mut b_read, mut b_write) =
            tokio::io::split(Box::new(b_io) as Box<dyn crate::driver::Io>);

        // Peer side handshake, done by hand so the peer never services
        // traffic afterwards.
        let hello = ControlPayload::Handshake {
            protocol_version: PROTOCOL_VERSION,
            process_id: 1,
            address: "tcp://127.0.0.1:2000".into(),
        };
        let hello_env = Envelope::control(
            1,
            ActorRef::control(addr("tcp://127.0.0.1:1000")),
            hello.encode(),
        );
        b_write.write_all(&frame.encode(&hello_env).unwrap()).await.unwrap();

        let a = Channel::open(
            Conduit::Stream(Box::new(a_io)),
            addr("tcp://127.0.0.1:1000"),
            config,
            sink_tx,
            None,
        )
        .await
        .unwrap();
        // Consume the hello from our side so the peer's buffer has room.
        let _ = read_one_frame(&mut b_read, &frame).await.unwrap();

        let payload = Bytes::from(vec![0u8; 128]);
        let mut accepted = 0;
        let mut backpressured = 0;
        for _ in 0..8 {
            let env = Envelope::tell(
                a.next_id(),
                ActorRef::new(ActorUid::from("x"), addr("tcp://127.0.0.1:1000")),
                ActorRef::new(ActorUid::from("y"), addr("tcp://127.0.0.1:2000")),
                CODEC_ID_JSON,
                payload.clone(),
            );
            match a.send(env, true).await {
                Ok(()) => accepted += 1,
                Err(ChannelError::Backpressure) => backpressured += 1,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert!(backpressured >= 1, "accepted={accepted}");
    }

    #[tokio::test]
    async fn test_heartbeat_loss_closes_channel() {
        let config = ChannelConfig {
            heartbeat_interval: Duration::from_millis(50),
            heartbeat_misses: 2,
            ..ChannelConfig::default()
        };

        // A peer that completes the handshake and then goes silent while
        // keeping its end of the conduit alive, so only the heartbeat can
        // notice.
        let (a_conduit, b_conduit) = pair_conduits();
        let (b_tx, mut b_rx) = match b_conduit {
            Conduit::Pair { tx, rx } => (tx, rx),
            _ => unreachable!(),
        };
        let hello = ControlPayload::Handshake {
            protocol_version: PROTOCOL_VERSION,
            process_id: 99,
            address: "tcp://127.0.0.1:2000".into(),
        };
        b_tx.send(Envelope::control(
            1,
            ActorRef::control(addr("tcp://127.0.0.1:1000")),
            hello.encode(),
        ))
        .unwrap();

        let (sink_tx, _sink_rx) = mpsc::unbounded_channel();
        let a = Channel::open(
            a_conduit,
            addr("tcp://127.0.0.1:1000"),
            config,
            sink_tx,
            None,
        )
        .await
        .unwrap();

        // Keep the silent peer's ends alive for the whole test.
        let hold = tokio::spawn(async move {
            while b_rx.recv().await.is_some() {
                // swallow pings, never answer
            }
        });

        let closed = tokio::time::timeout(Duration::from_secs(2), async {
            let mut state_rx = a.state_tx.subscribe();
            loop {
                if *state_rx.borrow() == ChannelState::Closed {
                    break;
                }
                if state_rx.changed().await.is_err() {
                    break;
                }
            }
        })
        .await;
        assert!(closed.is_ok(), "channel never noticed the silent peer");
        drop(b_tx);
        hold.abort();
    }

    #[tokio::test]
    async fn test_draining_refuses_new_sends() {
        let (a, _a_rx, b, _b_rx) = open_pair(pair_conduits(), ChannelConfig::default()).await;
        let drain = {
            let a = a.clone();
            tokio::spawn(async move { a.close_graceful().await })
        };
        drain.await.unwrap();
        let env = request_to(b.peer_address(), &a);
        let result = a.send(env, false).await;
        assert!(result.is_err());
    }
}
