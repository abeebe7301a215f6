//! TCP driver (cross-host), with `TCP_NODELAY` on every stream.

use super::{Acceptor, Conduit, Driver, Listener};
use crate::addr::{Address, Scheme};
use crate::error::ChannelError;
use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};

/// Driver for the `tcp` scheme.
#[derive(Debug, Clone, Copy)]
pub struct TcpDriver;

impl TcpDriver {
    fn socket_addr(addr: &Address) -> String {
        match addr.port {
            Some(port) => format!("{}:{port}", addr.host),
            None => addr.host.clone(),
        }
    }
}

#[async_trait]
impl Driver for TcpDriver {
    fn scheme(&self) -> Scheme {
        Scheme::Tcp
    }

    async fn connect(&self, addr: &Address) -> Result<Conduit, ChannelError> {
        let stream = TcpStream::connect(Self::socket_addr(addr))
            .await
            .map_err(|e| ChannelError::PeerGone(format!("connect {addr}: {e}")))?;
        stream
            .set_nodelay(true)
            .map_err(|e| ChannelError::PeerGone(format!("nodelay on {addr}: {e}")))?;
        Ok(Conduit::Stream(Box::new(stream)))
    }

    async fn listen(&self, addr: &Address) -> Result<Listener, ChannelError> {
        let listener = TcpListener::bind(Self::socket_addr(addr))
            .await
            .map_err(|e| ChannelError::Bind(format!("bind {addr}: {e}")))?;
        let local = listener
            .local_addr()
            .map_err(|e| ChannelError::Bind(format!("local_addr on {addr}: {e}")))?;
        tracing::debug!(address = %addr, bound = %local, "tcp listener bound");

        // Port 0 binds resolve to the kernel-assigned port.
        let mut resolved = addr.clone();
        resolved.port = Some(local.port());

        Ok(Listener {
            local: resolved,
            acceptor: Box::new(TcpAcceptor { listener }),
        })
    }
}

struct TcpAcceptor {
    listener: TcpListener,
}

#[async_trait]
impl Acceptor for TcpAcceptor {
    async fn accept(&mut self) -> Result<Conduit, ChannelError> {
        let (stream, peer) = self
            .listener
            .accept()
            .await
            .map_err(|e| ChannelError::PeerGone(format!("tcp accept: {e}")))?;
        stream
            .set_nodelay(true)
            .map_err(|e| ChannelError::PeerGone(format!("nodelay on {peer}: {e}")))?;
        Ok(Conduit::Stream(Box::new(stream)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_tcp_connect_and_stream_bytes() {
        let driver = TcpDriver;
        let bind = Address::parse("tcp://127.0.0.1:0").unwrap();
        let mut listener = driver.listen(&bind).await.unwrap();
        let addr = listener.local.clone();
        assert_ne!(addr.port, Some(0));

        let client = driver.connect(&addr).await.unwrap();
        let server = listener.acceptor.accept().await.unwrap();

        let mut client_io = match client {
            Conduit::Stream(io) => io,
            _ => panic!("tcp must yield stream conduits"),
        };
        let mut server_io = match server {
            Conduit::Stream(io) => io,
            _ => panic!("tcp must yield stream conduits"),
        };

        server_io.write_all(b"pong").await.unwrap();
        let mut buf = [0u8; 4];
        client_io.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[tokio::test]
    async fn test_tcp_connect_refused() {
        // Reserved port with (almost certainly) no listener.
        let addr = Address::parse("tcp://127.0.0.1:1").unwrap();
        assert!(matches!(
            TcpDriver.connect(&addr).await,
            Err(ChannelError::PeerGone(_))
        ));
    }
}
