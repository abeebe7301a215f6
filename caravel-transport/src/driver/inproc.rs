//! In-process driver: paired unbounded queues, no serialization.
//!
//! Listeners register under their `inproc://<label>` name in a
//! process-wide table. Connecting creates two unbounded envelope queues
//! and hands one end to the listener. Envelopes cross as values; the
//! channel layer sets the codec bypass flag.

use super::{Acceptor, Conduit, Driver, Listener};
use crate::addr::{Address, Scheme};
use crate::error::ChannelError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};
use tokio::sync::mpsc;

type Bindings = Mutex<HashMap<String, mpsc::UnboundedSender<Conduit>>>;

fn bindings() -> &'static Bindings {
    static BINDINGS: OnceLock<Bindings> = OnceLock::new();
    BINDINGS.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Driver for the `inproc` scheme.
#[derive(Debug, Clone, Copy, Default)]
pub struct InprocDriver {
    _private: (),
}

impl InprocDriver {
    pub fn new() -> Self {
        Self { _private: () }
    }
}

#[async_trait]
impl Driver for InprocDriver {
    fn scheme(&self) -> Scheme {
        Scheme::Inproc
    }

    async fn connect(&self, addr: &Address) -> Result<Conduit, ChannelError> {
        let listener_tx = {
            let table = bindings().lock().expect("inproc bindings poisoned");
            table.get(&addr.host).cloned()
        }
        .ok_or_else(|| ChannelError::PeerGone(format!("no inproc listener at {addr}")))?;

        let (client_tx, server_rx) = mpsc::unbounded_channel();
        let (server_tx, client_rx) = mpsc::unbounded_channel();

        listener_tx
            .send(Conduit::Pair {
                tx: server_tx,
                rx: server_rx,
            })
            .map_err(|_| ChannelError::PeerGone(format!("inproc listener at {addr} closed")))?;

        Ok(Conduit::Pair {
            tx: client_tx,
            rx: client_rx,
        })
    }

    async fn listen(&self, addr: &Address) -> Result<Listener, ChannelError> {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut table = bindings().lock().expect("inproc bindings poisoned");
            if table.contains_key(&addr.host) {
                return Err(ChannelError::Bind(format!(
                    "inproc address {addr} already bound"
                )));
            }
            table.insert(addr.host.clone(), tx);
        }
        Ok(Listener {
            local: addr.clone(),
            acceptor: Box::new(InprocAcceptor {
                name: addr.host.clone(),
                rx,
            }),
        })
    }
}

struct InprocAcceptor {
    name: String,
    rx: mpsc::UnboundedReceiver<Conduit>,
}

#[async_trait]
impl Acceptor for InprocAcceptor {
    async fn accept(&mut self) -> Result<Conduit, ChannelError> {
        self.rx
            .recv()
            .await
            .ok_or_else(|| ChannelError::PeerGone(format!("inproc binding {} dropped", self.name)))
    }
}

impl Drop for InprocAcceptor {
    fn drop(&mut self) {
        if let Ok(mut table) = bindings().lock() {
            table.remove(&self.name);
        }
    }
}
