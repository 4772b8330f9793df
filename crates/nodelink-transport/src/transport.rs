//! Abstract transport layer for nodelink network communication.
//!
//! A [`Transport`] produces established byte streams; everything above it
//! (framing, correlation, keepalive) is stream-agnostic. The TCP and TLS
//! backends both implement these traits, and tests plug in in-memory pipes.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::Result;

/// Duplex byte stream a handler can run over.
pub trait ByteStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> ByteStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Type-erased stream.
pub type BoxedStream = Box<dyn ByteStream>;

/// An established connection, before any protocol runs on it.
pub struct Connection {
    /// The raw stream.
    pub stream: BoxedStream,
    /// Remote address as text.
    pub peer_addr: String,
    /// Local address as text.
    pub local_addr: String,
}

impl Connection {
    /// Wraps any duplex stream.
    pub fn new<S: ByteStream>(stream: S, peer_addr: impl Into<String>, local_addr: impl Into<String>) -> Self {
        Self {
            stream: Box::new(stream),
            peer_addr: peer_addr.into(),
            local_addr: local_addr.into(),
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer_addr", &self.peer_addr)
            .field("local_addr", &self.local_addr)
            .finish()
    }
}

/// Factory for outbound connections and listeners.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Connect to a remote peer at the given address (e.g. "192.168.1.1:1516").
    async fn connect(&self, addr: &str) -> Result<Connection>;

    /// Listen for incoming connections on the given address.
    async fn listen(&self, addr: &str) -> Result<Box<dyn Listener>>;
}

/// A listener that accepts incoming connections.
#[async_trait]
pub trait Listener: Send + Sync {
    /// Accept a new incoming connection.
    async fn accept(&self) -> Result<Connection>;

    /// Get the local address this listener is bound to.
    fn local_addr(&self) -> Result<String>;
}
