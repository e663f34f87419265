//! Connection factories for the replay target

use std::io;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;

/// Opens live connections to the replay target.
///
/// Injected into the player so tests can hand out in-memory pipes instead of
/// sockets.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Byte stream of one live connection
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Open a connection to `addr` (`host:port`)
    async fn connect(&self, addr: &str) -> io::Result<Self::Stream>;
}

/// Plain TCP connector
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    type Stream = TcpStream;

    async fn connect(&self, addr: &str) -> io::Result<TcpStream> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        debug!("Connected to {addr}");
        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_tcp_connector_connects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let accept = tokio::spawn(async move { listener.accept().await.map(|_| ()) });
        let stream = TcpConnector.connect(&addr).await.unwrap();
        assert!(stream.nodelay().unwrap());
        accept.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_tcp_connector_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        assert!(TcpConnector.connect(&addr).await.is_err());
    }
}
