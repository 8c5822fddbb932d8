//! Transport abstraction.
//!
//! Anything that is an ordered, reliable byte stream can carry a
//! link: a TCP socket, a TLS stream wrapping one, or an in-memory
//! duplex pipe in tests.  The [`Transport`] trait names that bound
//! once so the session and connector signatures stay short.  The
//! [`Connector`] trait produces a fresh transport for every
//! connection attempt.

use std::io;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;

/// An ordered byte stream a session can run over.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// A transport whose concrete type was chosen at runtime.
pub type BoxTransport = Box<dyn Transport>;

/// Opens transports.  Called once per connection attempt.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> io::Result<BoxTransport>;
}

/// Plain TCP to a fixed address.  `TCP_NODELAY` is set because link
/// traffic is many small frames.
#[derive(Clone, Debug)]
pub struct TcpConnector {
    addr: String,
}

impl TcpConnector {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> io::Result<BoxTransport> {
        let stream = TcpStream::connect(&self.addr).await?;
        stream.set_nodelay(true)?;
        debug!(addr = %self.addr, "tcp transport open");
        Ok(Box::new(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn tcp_connector_reaches_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let accept = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 5];
            sock.read_exact(&mut buf).await.unwrap();
            buf
        });

        let mut transport = TcpConnector::new(addr).connect().await.unwrap();
        transport.write_all(b"hello").await.unwrap();
        assert_eq!(&accept.await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn refused_connection_is_an_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        assert!(TcpConnector::new(addr).connect().await.is_err());
    }
}
