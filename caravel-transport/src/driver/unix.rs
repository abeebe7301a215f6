//! Unix domain socket driver (same host, different process).

use super::{Acceptor, Conduit, Driver, Listener};
use crate::addr::{Address, Scheme};
use crate::error::ChannelError;
use async_trait::async_trait;
use tokio::net::{UnixListener, UnixStream};

/// Driver for the `unix` scheme. The address host part is the socket path.
#[derive(Debug, Clone, Copy)]
pub struct UnixDriver;

#[async_trait]
impl Driver for UnixDriver {
    fn scheme(&self) -> Scheme {
        Scheme::Unix
    }

    async fn connect(&self, addr: &Address) -> Result<Conduit, ChannelError> {
        let stream = UnixStream::connect(&addr.host)
            .await
            .map_err(|e| ChannelError::PeerGone(format!("connect {addr}: {e}")))?;
        Ok(Conduit::Stream(Box::new(stream)))
    }

    async fn listen(&self, addr: &Address) -> Result<Listener, ChannelError> {
        // A previous unclean shutdown may have left the socket file behind.
        let _ = std::fs::remove_file(&addr.host);
        let listener = UnixListener::bind(&addr.host)
            .map_err(|e| ChannelError::Bind(format!("bind {addr}: {e}")))?;
        tracing::debug!(address = %addr, "unix listener bound");
        Ok(Listener {
            local: addr.clone(),
            acceptor: Box::new(UnixAcceptor {
                listener,
                path: addr.host.clone(),
            }),
        })
    }
}

struct UnixAcceptor {
    listener: UnixListener,
    path: String,
}

#[async_trait]
impl Acceptor for UnixAcceptor {
    async fn accept(&mut self) -> Result<Conduit, ChannelError> {
        let (stream, _) = self
            .listener
            .accept()
            .await
            .map_err(|e| ChannelError::PeerGone(format!("accept on {}: {e}", self.path)))?;
        Ok(Conduit::Stream(Box::new(stream)))
    }
}

impl Drop for UnixAcceptor {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_unix_connect_and_stream_bytes() {
        let dir = std::env::temp_dir().join(format!("caravel-unix-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("driver.sock");
        let addr = Address::parse(&format!("unix://{}", path.display())).unwrap();

        let driver = UnixDriver;
        let mut listener = driver.listen(&addr).await.unwrap();

        let client = driver.connect(&addr).await.unwrap();
        let server = listener.acceptor.accept().await.unwrap();

        let mut client_io = match client {
            Conduit::Stream(io) => io,
            _ => panic!("unix must yield stream conduits"),
        };
        let mut server_io = match server {
            Conduit::Stream(io) => io,
            _ => panic!("unix must yield stream conduits"),
        };

        client_io.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        server_io.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        drop(listener);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_unix_connect_missing_socket() {
        let addr = Address::parse("unix:///tmp/caravel-definitely-missing.sock").unwrap();
        assert!(matches!(
            UnixDriver.connect(&addr).await,
            Err(ChannelError::PeerGone(_))
        ));
    }
}
