//! Transport drivers.
//!
//! A driver turns an [`Address`] into a [`Conduit`]: either a framed byte
//! stream (unix, tcp) or a paired in-memory envelope queue (inproc). The
//! [`crate::channel::Channel`] machinery above is identical for both.
//!
//! Driver selection is by address scheme. The `ucx` scheme is an external
//! collaborator slot: it parses, and a driver may be registered through
//! [`DriverSet::register`], but none ships in the core.

mod inproc;
mod tcp;
mod unix;

pub use inproc::InprocDriver;
pub use tcp::TcpDriver;
pub use unix::UnixDriver;

use crate::addr::{Address, Scheme};
use crate::envelope::Envelope;
use crate::error::ChannelError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

/// Byte-stream transports used by framed conduits.
pub trait Io: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Io for T {}

/// A raw bidirectional link to a peer, before channel semantics are layered
/// on top.
pub enum Conduit {
    /// Framed byte stream; envelopes cross it via [`crate::wire::FrameCodec`].
    Stream(Box<dyn Io>),
    /// Paired in-memory queues; envelopes cross as values with the codec
    /// bypass flag set.
    Pair {
        tx: mpsc::UnboundedSender<Envelope>,
        rx: mpsc::UnboundedReceiver<Envelope>,
    },
}

impl std::fmt::Debug for Conduit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Conduit::Stream(_) => f.write_str("Conduit::Stream"),
            Conduit::Pair { .. } => f.write_str("Conduit::Pair"),
        }
    }
}

/// Accepts inbound conduits on a bound address.
#[async_trait]
pub trait Acceptor: Send {
    /// Wait for the next inbound conduit. `Err` means the listener failed
    /// and no further conduits will arrive.
    async fn accept(&mut self) -> Result<Conduit, ChannelError>;
}

/// A bound listener together with the address it serves.
pub struct Listener {
    pub local: Address,
    pub acceptor: Box<dyn Acceptor>,
}

/// Concrete channel factory for one scheme.
#[async_trait]
pub trait Driver: Send + Sync {
    fn scheme(&self) -> Scheme;

    async fn connect(&self, addr: &Address) -> Result<Conduit, ChannelError>;

    async fn listen(&self, addr: &Address) -> Result<Listener, ChannelError>;
}

/// Scheme-indexed driver registry.
///
/// The defaults cover `inproc`, `unix` and `tcp`; additional drivers (a
/// UCX datapath, a TLS-wrapped TCP) are registered by the embedding
/// process before the router starts.
#[derive(Clone)]
pub struct DriverSet {
    drivers: HashMap<Scheme, Arc<dyn Driver>>,
}

impl DriverSet {
    /// The built-in driver set.
    pub fn standard() -> Self {
        let mut drivers: HashMap<Scheme, Arc<dyn Driver>> = HashMap::new();
        drivers.insert(Scheme::Inproc, Arc::new(InprocDriver::new()));
        drivers.insert(Scheme::Unix, Arc::new(UnixDriver));
        drivers.insert(Scheme::Tcp, Arc::new(TcpDriver));
        Self { drivers }
    }

    /// Register or replace the driver for a scheme.
    pub fn register(&mut self, driver: Arc<dyn Driver>) {
        self.drivers.insert(driver.scheme(), driver);
    }

    pub fn get(&self, scheme: Scheme) -> Result<&Arc<dyn Driver>, ChannelError> {
        self.drivers
            .get(&scheme)
            .ok_or(ChannelError::UnsupportedScheme(scheme))
    }

    pub async fn connect(&self, addr: &Address) -> Result<Conduit, ChannelError> {
        self.get(addr.scheme)?.connect(&addr.endpoint()).await
    }

    pub async fn listen(&self, addr: &Address) -> Result<Listener, ChannelError> {
        self.get(addr.scheme)?.listen(&addr.endpoint()).await
    }
}

impl std::fmt::Debug for DriverSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut schemes: Vec<_> = self.drivers.keys().map(|s| s.to_string()).collect();
        schemes.sort();
        f.debug_struct("DriverSet").field("schemes", &schemes).finish()
    }
}
