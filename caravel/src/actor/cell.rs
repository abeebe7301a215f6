//! Actor cells: one task per live actor, owning its inbox.
//!
//! The cell loop is where the serial-execution invariant lives: items are
//! taken from the inbox one at a time and the next item is not started
//! until the previous handler future completes. Handlers may suspend, and
//! other actors run in parallel on the scheduler's worker threads, but two
//! messages of the same actor never overlap.

use crate::actor::context::{ActorContext, CancelObserver, Messenger};
use crate::actor::handlers::HandlerTable;
use crate::actor::Actor;
use crate::error::{PoolError, Result};
use bytes::Bytes;
use caravel_transport::{
    ActorRef, BatchItemReply, CallFrame, Channel, Codec, ControlPayload, Envelope, EnvelopeFlags,
    EnvelopeKind,
};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};

/// Actor lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ActorStatus {
    Creating = 0,
    Running = 1,
    Stopping = 2,
    Stopped = 3,
    Failed = 4,
}

impl ActorStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Creating,
            1 => Self::Running,
            2 => Self::Stopping,
            3 => Self::Stopped,
            _ => Self::Failed,
        }
    }
}

#[derive(Clone)]
pub(crate) struct StatusCell(Arc<AtomicU8>);

impl StatusCell {
    fn new(status: ActorStatus) -> Self {
        Self(Arc::new(AtomicU8::new(status as u8)))
    }

    pub(crate) fn get(&self) -> ActorStatus {
        ActorStatus::from_u8(self.0.load(Ordering::Acquire))
    }

    fn set(&self, status: ActorStatus) {
        self.0.store(status as u8, Ordering::Release);
    }
}

/// Cancellation bookkeeping for one actor.
///
/// Cancels for messages still queued are remembered and consumed when the
/// message is dequeued; a cancel for the message currently executing
/// raises the flag its [`CancelObserver`] watches.
pub(crate) struct CancelState {
    pending: Mutex<HashSet<u64>>,
    current: AtomicU64,
    flag: Arc<AtomicBool>,
}

impl CancelState {
    fn new() -> Self {
        Self {
            pending: Mutex::new(HashSet::new()),
            current: AtomicU64::new(0),
            flag: Arc::new(AtomicBool::new(false)),
        }
    }

    fn flag(&self) -> Arc<AtomicBool> {
        self.flag.clone()
    }

    pub(crate) fn request(&self, correlation: u64) {
        if correlation == 0 {
            return;
        }
        if self.current.load(Ordering::Acquire) == correlation {
            self.flag.store(true, Ordering::Release);
        } else {
            self.pending
                .lock()
                .expect("cancel set poisoned")
                .insert(correlation);
        }
    }

    /// Mark a step as started. Returns `true` when the message was
    /// cancelled before it began, in which case it must be dropped.
    fn begin(&self, correlation: u64) -> bool {
        if correlation != 0
            && self
                .pending
                .lock()
                .expect("cancel set poisoned")
                .remove(&correlation)
        {
            return true;
        }
        self.flag.store(false, Ordering::Release);
        self.current.store(correlation, Ordering::Release);
        false
    }

    fn finish(&self) {
        self.current.store(0, Ordering::Release);
        self.flag.store(false, Ordering::Release);
    }
}

/// How a processed message reports its outcome.
pub(crate) enum Completion {
    /// In-process caller waiting on a oneshot.
    Local(oneshot::Sender<Result<Bytes>>),
    /// Remote caller; the outcome becomes a `Reply`/`Error` envelope sent
    /// back over the channel the request arrived on.
    Remote {
        channel: Arc<Channel>,
        request: Envelope,
    },
}

impl Completion {
    pub(crate) fn resolve(self, result: Result<Bytes>) {
        match self {
            Completion::Local(tx) => {
                let _ = tx.send(result);
            }
            Completion::Remote { channel, request } => {
                let envelope = match result {
                    Ok(bytes) => Envelope::reply(channel.next_id(), &request, bytes),
                    Err(e) => {
                        Envelope::error(channel.next_id(), &request, e.kind(), e.reason())
                    }
                };
                // Replies are correlated, not ordered; sending from a task
                // keeps a slow peer from stalling the actor loop.
                tokio::spawn(async move {
                    if let Err(e) = channel.send(envelope, false).await {
                        tracing::debug!(error = %e, "reply dropped, channel gone");
                    }
                });
            }
        }
    }
}

/// One unit of inbox work.
pub(crate) struct InboxItem {
    pub envelope: Envelope,
    pub completion: Option<Completion>,
}

/// Watchdog and quarantine settings for cells.
#[derive(Debug, Clone)]
pub(crate) struct CellConfig {
    pub watchdog: Option<Duration>,
    pub quarantine_strikes: u32,
}

/// Shared handle to a live cell, held by the registry and cloned freely.
#[derive(Clone)]
pub struct CellHandle {
    actor_ref: ActorRef,
    status: StatusCell,
    inbox_tx: mpsc::UnboundedSender<InboxItem>,
    inbox_len: Arc<AtomicUsize>,
    cancel: Arc<CancelState>,
    stopped_rx: watch::Receiver<bool>,
}

impl CellHandle {
    pub fn actor_ref(&self) -> &ActorRef {
        &self.actor_ref
    }

    pub fn status(&self) -> ActorStatus {
        self.status.get()
    }

    /// Queued inbox depth, reported to the supervisor for LeastLoaded
    /// placement.
    pub fn inbox_len(&self) -> usize {
        self.inbox_len.load(Ordering::Acquire)
    }

    /// Accept a message into the inbox.
    ///
    /// A stopping or stopped actor refuses new non-control messages; a
    /// quarantined actor refuses everything with `ActorFailed`.
    pub(crate) fn enqueue(&self, item: InboxItem) -> Result<()> {
        let control = item.envelope.kind == EnvelopeKind::Control;
        match self.status.get() {
            ActorStatus::Failed => {
                let err = PoolError::ActorFailed(format!("{} is quarantined", self.actor_ref));
                if let Some(c) = item.completion {
                    c.resolve(Err(err.clone()));
                }
                return Err(err);
            }
            ActorStatus::Stopping | ActorStatus::Stopped if !control => {
                let err = PoolError::ActorNotFound(format!("{} is stopping", self.actor_ref));
                if let Some(c) = item.completion {
                    c.resolve(Err(err.clone()));
                }
                return Err(err);
            }
            _ => {}
        }

        self.inbox_len.fetch_add(1, Ordering::AcqRel);
        self.inbox_tx.send(item).map_err(|returned| {
            self.inbox_len.fetch_sub(1, Ordering::AcqRel);
            let err = PoolError::ActorNotFound(format!("{} already stopped", self.actor_ref));
            if let Some(c) = returned.0.completion {
                c.resolve(Err(err.clone()));
            }
            err
        })
    }

    /// Note a `Cancel` for one of this actor's queued or running messages.
    pub(crate) fn request_cancel(&self, correlation: u64) {
        self.cancel.request(correlation);
    }

    /// Wait until the cell loop has fully exited.
    pub(crate) async fn wait_stopped(&self) {
        let mut rx = self.stopped_rx.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl std::fmt::Debug for CellHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CellHandle")
            .field("actor", &self.actor_ref.to_string())
            .field("status", &self.status())
            .field("inbox_len", &self.inbox_len())
            .finish()
    }
}

struct CellShared {
    status: StatusCell,
    inbox_len: Arc<AtomicUsize>,
    cancel: Arc<CancelState>,
    stopped_tx: watch::Sender<bool>,
}

/// Construct the actor (running `on_create`), then start its cell task.
///
/// `on_exit` runs exactly once when the loop ends, with the final status;
/// the kernel uses it to deregister the uid.
pub(crate) async fn spawn_cell<A, C>(
    actor_ref: ActorRef,
    init_body: Bytes,
    codec: C,
    messenger: Arc<dyn Messenger>,
    cfg: CellConfig,
    on_exit: Box<dyn FnOnce(ActorStatus) + Send>,
) -> Result<CellHandle>
where
    A: Actor<C>,
    C: Codec,
{
    let init: A::Init = codec.decode(&init_body)?;

    let cancel = Arc::new(CancelState::new());
    let ctx = ActorContext::new(
        actor_ref.clone(),
        codec.clone(),
        messenger,
        CancelObserver::new(cancel.flag()),
    );

    // A failed on_create discards the partial instance and fails the
    // create; nothing was registered yet.
    let actor = A::on_create(init, &ctx).await.map_err(|e| {
        tracing::warn!(actor = %actor_ref, error = %e, "on_create failed");
        e
    })?;

    let mut table = HandlerTable::new(codec.clone());
    A::register_handlers(&mut table);

    let status = StatusCell::new(ActorStatus::Creating);
    let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
    let inbox_len = Arc::new(AtomicUsize::new(0));
    let (stopped_tx, stopped_rx) = watch::channel(false);

    let handle = CellHandle {
        actor_ref,
        status: status.clone(),
        inbox_tx,
        inbox_len: inbox_len.clone(),
        cancel: cancel.clone(),
        stopped_rx,
    };

    tokio::spawn(run_cell(
        actor,
        table,
        ctx,
        inbox_rx,
        CellShared {
            status,
            inbox_len,
            cancel,
            stopped_tx,
        },
        cfg,
        on_exit,
    ));

    Ok(handle)
}

async fn run_cell<A, C>(
    mut actor: A,
    table: HandlerTable<A, C>,
    ctx: ActorContext<C>,
    mut inbox_rx: mpsc::UnboundedReceiver<InboxItem>,
    shared: CellShared,
    cfg: CellConfig,
    on_exit: Box<dyn FnOnce(ActorStatus) + Send>,
) where
    A: Actor<C>,
    C: Codec,
{
    shared.status.set(ActorStatus::Running);
    tracing::debug!(actor = %ctx.self_ref(), "actor running");

    let mut strikes = 0u32;
    let mut stop_completion: Option<Completion> = None;
    let mut quarantined = false;

    while let Some(item) = inbox_rx.recv().await {
        shared.inbox_len.fetch_sub(1, Ordering::AcqRel);
        match item.envelope.kind {
            EnvelopeKind::Control => {
                if matches!(
                    ControlPayload::decode(&item.envelope.payload),
                    Ok(ControlPayload::Stop)
                ) {
                    shared.status.set(ActorStatus::Stopping);
                    stop_completion = item.completion;
                    break;
                }
            }
            EnvelopeKind::Send | EnvelopeKind::Tell => {
                process_item(&mut actor, &table, &ctx, &shared, &cfg, &mut strikes, item).await;
                if cfg.watchdog.is_some() && strikes >= cfg.quarantine_strikes {
                    quarantined = true;
                    break;
                }
            }
            other => {
                tracing::debug!(actor = %ctx.self_ref(), kind = ?other, "ignoring envelope kind in inbox");
            }
        }
    }

    // No new non-control work is accepted past this point; the status
    // check in enqueue() sees Stopping/Failed.
    inbox_rx.close();

    if quarantined {
        shared.status.set(ActorStatus::Failed);
        tracing::warn!(actor = %ctx.self_ref(), strikes, "actor quarantined, draining inbox");
        while let Some(item) = inbox_rx.recv().await {
            shared.inbox_len.fetch_sub(1, Ordering::AcqRel);
            if let Some(c) = item.completion {
                c.resolve(Err(PoolError::ActorFailed(format!(
                    "{} is quarantined",
                    ctx.self_ref()
                ))));
            }
        }
    } else if shared.status.get() == ActorStatus::Stopping {
        // Destroy path: work already accepted still runs to completion.
        while let Some(item) = inbox_rx.recv().await {
            shared.inbox_len.fetch_sub(1, Ordering::AcqRel);
            match item.envelope.kind {
                EnvelopeKind::Send | EnvelopeKind::Tell => {
                    process_item(&mut actor, &table, &ctx, &shared, &cfg, &mut strikes, item)
                        .await;
                }
                _ => {
                    // A second Stop during drain acks immediately.
                    if let Some(c) = item.completion {
                        c.resolve(Ok(Bytes::new()));
                    }
                }
            }
        }
        if let Err(e) = actor.on_destroy(&ctx).await {
            tracing::warn!(actor = %ctx.self_ref(), error = %e, "on_destroy failed");
        }
        shared.status.set(ActorStatus::Stopped);
        tracing::debug!(actor = %ctx.self_ref(), "actor stopped");
    } else {
        // Every sender dropped: the kernel released this cell.
        shared.status.set(ActorStatus::Stopped);
    }

    if let Some(c) = stop_completion {
        c.resolve(Ok(Bytes::new()));
    }
    on_exit(shared.status.get());
    let _ = shared.stopped_tx.send(true);
}

async fn process_item<A, C>(
    actor: &mut A,
    table: &HandlerTable<A, C>,
    ctx: &ActorContext<C>,
    shared: &CellShared,
    cfg: &CellConfig,
    strikes: &mut u32,
    item: InboxItem,
) where
    A: Actor<C>,
    C: Codec,
{
    let envelope = item.envelope;
    let mut completion = item.completion;
    let correlation = envelope.correlation_id.unwrap_or(0);

    if shared.cancel.begin(correlation) {
        if let Some(c) = completion.take() {
            c.resolve(Err(PoolError::Cancelled(
                "cancelled before execution began".into(),
            )));
        }
        return;
    }

    let fut = step(actor, table, ctx, &envelope);
    tokio::pin!(fut);

    let outcome = match cfg.watchdog {
        Some(watchdog) => {
            tokio::select! {
                result = &mut fut => Some(result),
                _ = tokio::time::sleep(watchdog) => {
                    *strikes += 1;
                    tracing::warn!(
                        actor = %ctx.self_ref(),
                        strikes = *strikes,
                        watchdog_ms = watchdog.as_millis() as u64,
                        "handler exceeded watchdog"
                    );
                    if let Some(c) = completion.take() {
                        c.resolve(Err(PoolError::Timeout(
                            "handler exceeded per-message watchdog".into(),
                        )));
                    }
                    // The step still runs to completion; the caller just
                    // stopped waiting for it.
                    if let Err(e) = (&mut fut).await {
                        tracing::debug!(actor = %ctx.self_ref(), error = %e, "late step failed");
                    }
                    None
                }
            }
        }
        None => Some(fut.await),
    };

    shared.cancel.finish();

    if let Some(result) = outcome {
        *strikes = 0;
        match completion.take() {
            Some(c) => c.resolve(result),
            None => {
                // Tell semantics: failures are logged, never surfaced.
                if let Err(e) = result {
                    tracing::warn!(actor = %ctx.self_ref(), error = %e, "tell handler failed");
                }
            }
        }
    }
}

/// Execute one envelope against the handler table: a single call, or an
/// ordered batch with per-item outcomes.
async fn step<A, C>(
    actor: &mut A,
    table: &HandlerTable<A, C>,
    ctx: &ActorContext<C>,
    envelope: &Envelope,
) -> Result<Bytes>
where
    A: Actor<C>,
    C: Codec,
{
    if envelope.flags.contains(EnvelopeFlags::BATCH) {
        let calls = CallFrame::decode_batch(&envelope.payload)?;
        let mut items = Vec::with_capacity(calls.len());
        for call in &calls {
            // Cancellation stops sub-calls that have not begun; completed
            // results are kept and a failure never aborts the remainder.
            if ctx.is_cancelled() {
                items.push(BatchItemReply::Err(
                    PoolError::Cancelled("batch cancelled".into()).to_payload(),
                ));
                continue;
            }
            match table.dispatch(actor, call, ctx).await {
                Ok(bytes) => items.push(BatchItemReply::Ok(Bytes::from(bytes))),
                Err(e) => items.push(BatchItemReply::Err(e.to_payload())),
            }
        }
        Ok(BatchItemReply::encode_all(&items))
    } else {
        let frame = CallFrame::decode(&envelope.payload)?;
        table.dispatch(actor, &frame, ctx).await.map(Bytes::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::Handler;
    use async_trait::async_trait;
    use caravel_transport::{ActorUid, Address, JsonCodec, CODEC_ID_JSON};
    use serde::{Deserialize, Serialize};
    use std::time::Instant;

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

    /// Records handler entry/exit windows to check serial execution.
    struct Recorder {
        windows: Arc<Mutex<Vec<(u64, Instant, Instant)>>>,
        destroyed: Arc<AtomicBool>,
    }

    #[derive(Serialize, Deserialize)]
    struct Work {
        seq: u64,
        sleep_ms: u64,
    }

    #[derive(Serialize, Deserialize)]
    struct Boom;

    #[derive(Clone)]
    struct RecorderProbe {
        windows: Arc<Mutex<Vec<(u64, Instant, Instant)>>>,
        destroyed: Arc<AtomicBool>,
    }

    // Tests run concurrently in one binary, so probes are keyed per test.
    static PROBES: Mutex<Option<std::collections::HashMap<String, RecorderProbe>>> =
        Mutex::new(None);

    #[async_trait]
    impl<C: Codec> Actor<C> for Recorder {
        const CLASS_ID: &'static str = "Recorder";
        type Init = String;

        async fn on_create(key: String, _ctx: &ActorContext<C>) -> Result<Self> {
            let probe = PROBES
                .lock()
                .unwrap()
                .as_ref()
                .and_then(|m| m.get(&key).cloned())
                .expect("probe installed by test");
            Ok(Self {
                windows: probe.windows,
                destroyed: probe.destroyed,
            })
        }

        async fn on_destroy(&mut self, _ctx: &ActorContext<C>) -> Result<()> {
            self.destroyed.store(true, Ordering::Release);
            Ok(())
        }

        fn register_handlers(table: &mut HandlerTable<Self, C>) {
            table.register::<Work, u64>();
            table.register::<Boom, ()>();
        }
    }

    #[async_trait]
    impl<C: Codec> Handler<Work, u64, C> for Recorder {
        async fn handle(&mut self, req: Work, _ctx: &ActorContext<C>) -> Result<u64> {
            let start = Instant::now();
            tokio::time::sleep(Duration::from_millis(req.sleep_ms)).await;
            self.windows
                .lock()
                .unwrap()
                .push((req.seq, start, Instant::now()));
            Ok(req.seq)
        }
    }

    #[async_trait]
    impl<C: Codec> Handler<Boom, (), C> for Recorder {
        async fn handle(&mut self, _req: Boom, _ctx: &ActorContext<C>) -> Result<()> {
            Err(PoolError::ActorFailed("handler exploded".into()))
        }
    }

    fn install_probe(key: &str) -> RecorderProbe {
        let probe = RecorderProbe {
            windows: Arc::new(Mutex::new(Vec::new())),
            destroyed: Arc::new(AtomicBool::new(false)),
        };
        PROBES
            .lock()
            .unwrap()
            .get_or_insert_with(Default::default)
            .insert(key.to_string(), probe.clone());
        probe
    }

    fn test_ref() -> ActorRef {
        ActorRef::new(
            ActorUid::from("recorder"),
            Address::parse("inproc://cell-test").unwrap(),
        )
    }

    async fn spawn_recorder(key: &str, cfg: CellConfig) -> (CellHandle, RecorderProbe) {
        let probe = install_probe(key);
        let handle = spawn_cell::<Recorder, JsonCodec>(
            test_ref(),
            Bytes::from(serde_json::to_vec(key).unwrap()),
            JsonCodec,
            Arc::new(NullMessenger),
            cfg,
            Box::new(|_| {}),
        )
        .await
        .unwrap();
        (handle, probe)
    }

    fn work_item(
        handle: &CellHandle,
        seq: u64,
        sleep_ms: u64,
        corr: u64,
    ) -> (InboxItem, oneshot::Receiver<Result<Bytes>>) {
        let body = JsonCodec.encode(&Work { seq, sleep_ms }).unwrap();
        let frame = CallFrame::new("Work", body);
        let mut env = Envelope::send(
            corr,
            ActorRef::new(ActorUid::from("t"), test_ref().address.clone()),
            handle.actor_ref().clone(),
            CODEC_ID_JSON,
            frame.encode(),
        );
        env.correlation_id = Some(corr);
        let (tx, rx) = oneshot::channel();
        (
            InboxItem {
                envelope: env,
                completion: Some(Completion::Local(tx)),
            },
            rx,
        )
    }

    fn stop_item(handle: &CellHandle) -> (InboxItem, oneshot::Receiver<Result<Bytes>>) {
        let env = Envelope::control(
            999,
            handle.actor_ref().clone(),
            ControlPayload::Stop.encode(),
        );
        let (tx, rx) = oneshot::channel();
        (
            InboxItem {
                envelope: env,
                completion: Some(Completion::Local(tx)),
            },
            rx,
        )
    }

    #[tokio::test]
    async fn test_serial_fifo_execution() {
        let cfg = CellConfig {
            watchdog: None,
            quarantine_strikes: 3,
        };
        let (handle, probe) = spawn_recorder("serial-fifo", cfg).await;

        let mut receivers = Vec::new();
        for seq in 1..=5u64 {
            let (item, rx) = work_item(&handle, seq, 10, seq);
            handle.enqueue(item).unwrap();
            receivers.push(rx);
        }
        for rx in receivers {
            rx.await.unwrap().unwrap();
        }

        let windows = probe.windows.lock().unwrap().clone();
        assert_eq!(
            windows.iter().map(|w| w.0).collect::<Vec<_>>(),
            vec![1, 2, 3, 4, 5],
            "inbox order must be execution order"
        );
        for pair in windows.windows(2) {
            assert!(
                pair[0].2 <= pair[1].1,
                "handler windows overlap: {:?}",
                pair
            );
        }
    }

    #[tokio::test]
    async fn test_handler_error_does_not_kill_actor() {
        let cfg = CellConfig {
            watchdog: None,
            quarantine_strikes: 3,
        };
        let (handle, _probe) = spawn_recorder("error-isolation", cfg).await;

        let frame = CallFrame::new("Boom", JsonCodec.encode(&Boom).unwrap());
        let mut env = Envelope::send(
            7,
            ActorRef::new(ActorUid::from("t"), test_ref().address.clone()),
            handle.actor_ref().clone(),
            CODEC_ID_JSON,
            frame.encode(),
        );
        env.correlation_id = Some(7);
        let (tx, rx) = oneshot::channel();
        handle
            .enqueue(InboxItem {
                envelope: env,
                completion: Some(Completion::Local(tx)),
            })
            .unwrap();
        assert!(matches!(
            rx.await.unwrap(),
            Err(PoolError::ActorFailed(_))
        ));

        // The actor keeps serving after the failure.
        let (item, rx) = work_item(&handle, 1, 0, 8);
        handle.enqueue(item).unwrap();
        assert!(rx.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_stop_drains_then_destroys() {
        let cfg = CellConfig {
            watchdog: None,
            quarantine_strikes: 3,
        };
        let (handle, probe) = spawn_recorder("stop-drain", cfg).await;

        // Queue work, then a stop, then verify the queued work still ran.
        let (w1, rx1) = work_item(&handle, 1, 20, 1);
        let (w2, rx2) = work_item(&handle, 2, 0, 2);
        handle.enqueue(w1).unwrap();
        handle.enqueue(w2).unwrap();
        let (stop, stop_rx) = stop_item(&handle);
        handle.enqueue(stop).unwrap();

        stop_rx.await.unwrap().unwrap();
        handle.wait_stopped().await;

        assert!(rx1.await.unwrap().is_ok());
        assert!(rx2.await.unwrap().is_ok());
        assert!(probe.destroyed.load(Ordering::Acquire), "on_destroy ran");
        assert_eq!(handle.status(), ActorStatus::Stopped);

        // New work after stop is refused.
        let (late, _late_rx) = work_item(&handle, 9, 0, 9);
        assert!(matches!(
            handle.enqueue(late),
            Err(PoolError::ActorNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_cancel_before_dequeue_drops_message() {
        let cfg = CellConfig {
            watchdog: None,
            quarantine_strikes: 3,
        };
        let (handle, probe) = spawn_recorder("cancel-queued", cfg).await;

        // First message occupies the actor while the second sits queued.
        let (w1, rx1) = work_item(&handle, 1, 50, 1);
        let (w2, rx2) = work_item(&handle, 2, 0, 2);
        handle.enqueue(w1).unwrap();
        handle.enqueue(w2).unwrap();
        handle.request_cancel(2);

        assert!(rx1.await.unwrap().is_ok());
        assert!(matches!(
            rx2.await.unwrap(),
            Err(PoolError::Cancelled(_))
        ));
        let windows = probe.windows.lock().unwrap().clone();
        assert_eq!(windows.len(), 1, "cancelled message never executed");
    }

    #[tokio::test]
    async fn test_watchdog_timeout_and_quarantine() {
        let cfg = CellConfig {
            watchdog: Some(Duration::from_millis(20)),
            quarantine_strikes: 2,
        };
        let (handle, _probe) = spawn_recorder("watchdog-quarantine", cfg).await;

        // Two slow messages exceed the watchdog twice → quarantine.
        let (w1, rx1) = work_item(&handle, 1, 200, 1);
        let (w2, rx2) = work_item(&handle, 2, 200, 2);
        let (w3, rx3) = work_item(&handle, 3, 0, 3);
        handle.enqueue(w1).unwrap();
        handle.enqueue(w2).unwrap();
        handle.enqueue(w3).unwrap();

        assert!(matches!(rx1.await.unwrap(), Err(PoolError::Timeout(_))));
        assert!(matches!(rx2.await.unwrap(), Err(PoolError::Timeout(_))));
        // Queued work behind the quarantine fails with ActorFailed.
        assert!(matches!(
            rx3.await.unwrap(),
            Err(PoolError::ActorFailed(_))
        ));

        handle.wait_stopped().await;
        assert_eq!(handle.status(), ActorStatus::Failed);
    }
}
