//! TLS-wrapped TCP transport implementation.

use async_trait::async_trait;

use crate::error::{Result, TransportError};
use crate::tcp::{connect_stream, TcpTransportConfig};
use crate::tls::{TlsAcceptor, TlsConfig, TlsConnector};
use crate::transport::{Connection, Listener, Transport};

/// TLS-wrapped TCP transport that creates secure connections.
#[derive(Debug, Clone)]
pub struct TlsTcpTransport {
    tcp_config: TcpTransportConfig,
    tls_config: TlsConfig,
    server_name: Option<String>,
}

impl TlsTcpTransport {
    /// Creates a new TLS-TCP transport with the given configurations.
    pub fn new(tcp_config: TcpTransportConfig, tls_config: TlsConfig) -> Self {
        Self {
            tcp_config,
            tls_config,
            server_name: None,
        }
    }

    /// Verifies the peer certificate against `name` instead of the host part
    /// of the dialed address.
    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }
}

#[async_trait]
impl Transport for TlsTcpTransport {
    async fn connect(&self, addr: &str) -> Result<Connection> {
        let stream = connect_stream(&self.tcp_config, addr).await?;
        let local_addr = stream
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_default();

        let connector = TlsConnector::new(&self.tls_config)?;
        let host = match &self.server_name {
            Some(name) => name.as_str(),
            None => addr
                .rsplit_once(':')
                .map(|(h, _)| h.trim_start_matches('[').trim_end_matches(']'))
                .unwrap_or(addr),
        };
        let tls_stream = connector.connect(host, stream).await?;

        tracing::debug!(addr = addr, "TLS-TCP connected");
        Ok(Connection::new(tls_stream, addr, local_addr))
    }

    async fn listen(&self, addr: &str) -> Result<Box<dyn Listener>> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::debug!(addr = addr, "TLS-TCP listening");

        let acceptor = TlsAcceptor::new(&self.tls_config)?;
        Ok(Box::new(TlsTcpListener {
            inner: listener,
            acceptor,
            nodelay: self.tcp_config.nodelay,
        }))
    }
}

/// Listener side of [`TlsTcpTransport`]; performs the TLS handshake on accept.
#[derive(Debug)]
pub struct TlsTcpListener {
    inner: tokio::net::TcpListener,
    acceptor: TlsAcceptor,
    nodelay: bool,
}

#[async_trait]
impl Listener for TlsTcpListener {
    async fn accept(&self) -> Result<Connection> {
        let (stream, peer) = self.inner.accept().await?;
        if self.nodelay {
            stream.set_nodelay(true)?;
        }
        let local_addr = stream
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_default();
        let tls_stream = self.acceptor.accept(stream).await.map_err(|e| {
            tracing::warn!(peer = %peer, error = %e, "TLS accept failed");
            e
        })?;
        Ok(Connection::new(tls_stream, peer.to_string(), local_addr))
    }

    fn local_addr(&self) -> Result<String> {
        self.inner
            .local_addr()
            .map(|a| a.to_string())
            .map_err(TransportError::IoError)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::{generate_node_cert, generate_self_signed_ca};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn configs(require_client_auth: bool) -> (TlsConfig, TlsConfig) {
        let (ca_cert, ca_key) = generate_self_signed_ca().unwrap();
        let (server_cert, server_key) =
            generate_node_cert(&ca_cert, &ca_key, &["master", "127.0.0.1"]).unwrap();
        let (client_cert, client_key) = generate_node_cert(&ca_cert, &ca_key, &["worker-1"]).unwrap();
        (
            TlsConfig::new(ca_cert.clone(), server_cert, server_key, require_client_auth),
            TlsConfig::new(ca_cert, client_cert, client_key, false),
        )
    }

    #[tokio::test]
    async fn test_tls_roundtrip() {
        let (server_tls, client_tls) = configs(true);
        let server = TlsTcpTransport::new(TcpTransportConfig::default(), server_tls);
        let listener = server.listen("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let accept = tokio::spawn(async move {
            let mut conn = listener.accept().await.unwrap();
            let mut buf = [0u8; 5];
            conn.stream.read_exact(&mut buf).await.unwrap();
            conn.stream.write_all(&buf).await.unwrap();
            conn.stream.flush().await.unwrap();
        });

        let client = TlsTcpTransport::new(TcpTransportConfig::default(), client_tls);
        let mut conn = client.connect(&addr).await.unwrap();
        conn.stream.write_all(b"hello").await.unwrap();
        conn.stream.flush().await.unwrap();
        let mut buf = [0u8; 5];
        conn.stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
        accept.await.unwrap();
    }

    #[tokio::test]
    async fn test_untrusted_server_rejected() {
        let (server_tls, _) = configs(false);
        let (_, foreign_client) = configs(false);
        let server = TlsTcpTransport::new(TcpTransportConfig::default(), server_tls);
        let listener = server.listen("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });

        let client = TlsTcpTransport::new(TcpTransportConfig::default(), foreign_client);
        let err = client.connect(&addr).await.unwrap_err();
        assert!(matches!(err, TransportError::TlsError { .. }));
    }
}
