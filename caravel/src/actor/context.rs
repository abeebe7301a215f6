//! Execution context handed to actor hooks and handlers.

use crate::error::{PoolError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use caravel_transport::{ActorRef, CallFrame, Codec};
use serde::{de::DeserializeOwned, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Narrow messaging interface the kernel exposes to handler code.
///
/// Type-erased so the context does not drag the whole kernel type around;
/// the kernel is the only implementor.
#[async_trait]
pub trait Messenger: Send + Sync {
    /// Request/response to another actor.
    async fn send_frame(
        &self,
        to: ActorRef,
        frame: CallFrame,
        deadline: Option<Duration>,
    ) -> Result<Bytes>;

    /// Fire-and-forget to another actor.
    async fn tell_frame(&self, to: ActorRef, frame: CallFrame) -> Result<()>;
}

/// Observes cancellation of the message currently being handled.
#[derive(Clone)]
pub struct CancelObserver {
    flag: Arc<AtomicBool>,
}

impl CancelObserver {
    pub(crate) fn new(flag: Arc<AtomicBool>) -> Self {
        Self { flag }
    }

    /// An observer that can never fire (create/destroy hooks).
    pub(crate) fn inert() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// Per-actor context: identity, onward messaging, and cancellation.
///
/// Handlers observe cancellation cooperatively: the kernel raises the flag
/// when a `Cancel` arrives for the message being executed, and the handler
/// notices at its next [`ActorContext::checkpoint`] (or by polling
/// [`ActorContext::is_cancelled`]).
#[derive(Clone)]
pub struct ActorContext<C: Codec> {
    self_ref: ActorRef,
    codec: C,
    messenger: Arc<dyn Messenger>,
    cancel: CancelObserver,
}

impl<C: Codec> ActorContext<C> {
    pub(crate) fn new(
        self_ref: ActorRef,
        codec: C,
        messenger: Arc<dyn Messenger>,
        cancel: CancelObserver,
    ) -> Self {
        Self {
            self_ref,
            codec,
            messenger,
            cancel,
        }
    }

    /// This actor's own reference.
    pub fn self_ref(&self) -> &ActorRef {
        &self.self_ref
    }

    /// Whether the in-flight message has been cancelled by its sender.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Bail out of the current handler if the message was cancelled.
    /// Intended to be called at suspension points in long handlers.
    pub fn checkpoint(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(PoolError::Cancelled("observed at checkpoint".into()))
        } else {
            Ok(())
        }
    }

    /// Request/response call to another actor.
    ///
    /// A synchronous call back to this same actor would deadlock behind
    /// the serial-execution lock, so it is rejected with `Reentrancy`.
    pub async fn call<Req, Res>(
        &self,
        to: &ActorRef,
        req: &Req,
        deadline: Option<Duration>,
    ) -> Result<Res>
    where
        Req: Serialize + Send + Sync + 'static,
        Res: DeserializeOwned,
    {
        if to == &self.self_ref {
            return Err(PoolError::Reentrancy(format!(
                "{} called itself synchronously",
                self.self_ref
            )));
        }
        let frame = CallFrame::new(
            crate::actor::handlers::message_tag::<Req>(),
            self.codec.encode(req)?,
        );
        let reply = self.messenger.send_frame(to.clone(), frame, deadline).await?;
        Ok(self.codec.decode(&reply)?)
    }

    /// Run a blocking routine (compute, blocking I/O) on the dedicated
    /// blocking pool, so it never stalls other actors' worker threads.
    ///
    /// The per-actor serial-execution guarantee still holds: the handler
    /// suspends here until the routine finishes.
    pub async fn run_blocking<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        tokio::task::spawn_blocking(f)
            .await
            .map_err(|e| PoolError::Internal(format!("blocking task failed: {e}")))
    }

    /// Fire-and-forget message to another actor.
    pub async fn tell<Req>(&self, to: &ActorRef, req: &Req) -> Result<()>
    where
        Req: Serialize + Send + Sync + 'static,
    {
        if to == &self.self_ref {
            return Err(PoolError::Reentrancy(format!(
                "{} told itself synchronously",
                self.self_ref
            )));
        }
        let frame = CallFrame::new(
            crate::actor::handlers::message_tag::<Req>(),
            self.codec.encode(req)?,
        );
        self.messenger.tell_frame(to.clone(), frame).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use caravel_transport::{ActorUid, Address, JsonCodec};

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
        let self_ref = ActorRef::new(
            ActorUid::from("me"),
            Address::parse("inproc://ctx-test").unwrap(),
        );
        ActorContext::new(
            self_ref,
            JsonCodec,
            Arc::new(NullMessenger),
            CancelObserver::inert(),
        )
    }

    #[tokio::test]
    async fn test_self_call_is_reentrancy() {
        let ctx = context();
        let me = ctx.self_ref().clone();
        let result: Result<u64> = ctx.call(&me, &1u64, None).await;
        assert!(matches!(result, Err(PoolError::Reentrancy(_))));
        let result = ctx.tell(&me, &1u64).await;
        assert!(matches!(result, Err(PoolError::Reentrancy(_))));
    }

    #[tokio::test]
    async fn test_checkpoint_observes_cancellation() {
        let flag = Arc::new(AtomicBool::new(false));
        let ctx = ActorContext::new(
            ActorRef::new(
                ActorUid::from("me"),
                Address::parse("inproc://ctx-test-2").unwrap(),
            ),
            JsonCodec,
            Arc::new(NullMessenger),
            CancelObserver::new(flag.clone()),
        );
        assert!(ctx.checkpoint().is_ok());
        flag.store(true, Ordering::Release);
        assert!(matches!(ctx.checkpoint(), Err(PoolError::Cancelled(_))));
    }
}
