//! Outbound connection to the relay.
//!
//! Provides a raw duplex stream. Framing and multiplexing happen above.

use async_trait::async_trait;
use std::io;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

/// Any duplex byte stream the tunnel can run over.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// Opens a fresh physical stream for each session.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self) -> io::Result<BoxedStream>;

    /// Address shown in logs.
    fn describe(&self) -> String;
}

/// Dials a relay over TCP.
#[derive(Debug, Clone)]
pub struct TcpDialer {
    addr: String,
}

impl TcpDialer {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self) -> io::Result<BoxedStream> {
        let stream = TcpStream::connect(&self.addr).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }

    fn describe(&self) -> String {
        self.addr.clone()
    }
}
