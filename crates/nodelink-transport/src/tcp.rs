//! TCP transport implementation

use async_trait::async_trait;

use crate::error::{Result, TransportError};
use crate::transport::{Connection, Listener, Transport};

/// TCP transport configuration
#[derive(Debug, Clone)]
pub struct TcpTransportConfig {
    /// Connection timeout in milliseconds.
    pub connect_timeout_ms: u64,
    /// Whether to enable TCP_NODELAY (disable Nagle's algorithm).
    pub nodelay: bool,
}

impl Default for TcpTransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5000,
            nodelay: true,
        }
    }
}

/// Connects with a timeout; refused connections map to `ConnectionRefused`.
pub(crate) async fn connect_stream(config: &TcpTransportConfig, addr: &str) -> Result<tokio::net::TcpStream> {
    let timeout = std::time::Duration::from_millis(config.connect_timeout_ms);
    let stream = tokio::time::timeout(timeout, tokio::net::TcpStream::connect(addr))
        .await
        .map_err(|_| TransportError::ConnectionTimeout {
            addr: addr.to_string(),
            timeout_ms: config.connect_timeout_ms,
        })?
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::ConnectionRefused => TransportError::ConnectionRefused {
                addr: addr.to_string(),
            },
            _ => TransportError::IoError(e),
        })?;
    if config.nodelay {
        stream.set_nodelay(true)?;
    }
    Ok(stream)
}

fn addrs(stream: &tokio::net::TcpStream) -> (String, String) {
    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_default();
    let local = stream
        .local_addr()
        .map(|a| a.to_string())
        .unwrap_or_default();
    (peer, local)
}

/// Plain TCP transport.
#[derive(Debug, Clone, Default)]
pub struct TcpTransport {
    config: TcpTransportConfig,
}

impl TcpTransport {
    /// Creates a new TCP transport with the given configuration.
    pub fn new(config: TcpTransportConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(&self, addr: &str) -> Result<Connection> {
        let stream = connect_stream(&self.config, addr).await?;
        let (peer, local) = addrs(&stream);
        tracing::debug!(addr = addr, "TCP connected");
        Ok(Connection::new(stream, peer, local))
    }

    async fn listen(&self, addr: &str) -> Result<Box<dyn Listener>> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::debug!(addr = addr, "TCP listening");
        Ok(Box::new(TcpListener {
            inner: listener,
            nodelay: self.config.nodelay,
        }))
    }
}

/// Listener side of [`TcpTransport`].
#[derive(Debug)]
pub struct TcpListener {
    inner: tokio::net::TcpListener,
    nodelay: bool,
}

#[async_trait]
impl Listener for TcpListener {
    async fn accept(&self) -> Result<Connection> {
        let (stream, _) = self.inner.accept().await?;
        if self.nodelay {
            stream.set_nodelay(true)?;
        }
        let (peer, local) = addrs(&stream);
        Ok(Connection::new(stream, peer, local))
    }

    fn local_addr(&self) -> Result<String> {
        Ok(self.inner.local_addr()?.to_string())
    }
}
