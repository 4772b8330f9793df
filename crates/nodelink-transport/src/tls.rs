//! TLS support for the nodelink transport layer.
//!
//! Cluster links can run over TLS with certificates issued by a
//! self-contained cluster CA. Client certificates are optional; when the
//! acceptor requires them the link is mutually authenticated.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};

use crate::error::{Result, TransportError};

/// Configuration for TLS connections.
#[derive(Debug, Clone)]
pub struct TlsConfig {
    /// PEM-encoded CA certificate for verifying peer certificates.
    pub ca_cert_pem: Vec<u8>,
    /// PEM-encoded certificate chain (node cert + intermediates). May be empty
    /// on the connecting side when the acceptor does not require client auth.
    pub cert_chain_pem: Vec<u8>,
    /// PEM-encoded private key for this node.
    pub private_key_pem: Vec<u8>,
    /// Whether the acceptor requires client certificates.
    pub require_client_auth: bool,
}

impl TlsConfig {
    /// Creates a new TLS configuration.
    pub fn new(
        ca_cert_pem: Vec<u8>,
        cert_chain_pem: Vec<u8>,
        private_key_pem: Vec<u8>,
        require_client_auth: bool,
    ) -> Self {
        Self {
            ca_cert_pem,
            cert_chain_pem,
            private_key_pem,
            require_client_auth,
        }
    }

    /// Reads the PEM files from disk. `cert` and `key` may be omitted on a
    /// connecting node that does not present a client certificate.
    pub fn from_files(
        ca: &Path,
        cert: Option<&Path>,
        key: Option<&Path>,
        require_client_auth: bool,
    ) -> Result<Self> {
        let read = |p: &Path| {
            std::fs::read(p).map_err(|e| TransportError::TlsError {
                reason: format!("reading {}: {}", p.display(), e),
            })
        };
        Ok(Self {
            ca_cert_pem: read(ca)?,
            cert_chain_pem: cert.map(read).transpose()?.unwrap_or_default(),
            private_key_pem: key.map(read).transpose()?.unwrap_or_default(),
            require_client_auth,
        })
    }
}

fn install_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

fn root_store(ca_cert_pem: &[u8]) -> Result<rustls::RootCertStore> {
    let mut roots = rustls::RootCertStore::empty();
    for cert in load_certs_from_pem(ca_cert_pem)? {
        roots.add(cert).map_err(|e| TransportError::TlsError {
            reason: format!("failed to add CA cert: {}", e),
        })?;
    }
    Ok(roots)
}

/// Client-side TLS connector.
#[derive(Clone)]
pub struct TlsConnector {
    inner: tokio_rustls::TlsConnector,
}

impl fmt::Debug for TlsConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsConnector").finish()
    }
}

impl TlsConnector {
    /// Creates a new TLS connector from configuration.
    pub fn new(config: &TlsConfig) -> Result<Self> {
        install_provider();
        let builder = rustls::ClientConfig::builder().with_root_certificates(root_store(&config.ca_cert_pem)?);
        let client_config = if config.cert_chain_pem.is_empty() {
            builder.with_no_client_auth()
        } else {
            let certs = load_certs_from_pem(&config.cert_chain_pem)?;
            let key = load_private_key_from_pem(&config.private_key_pem)?;
            builder
                .with_client_auth_cert(certs, key)
                .map_err(|e| TransportError::TlsError {
                    reason: format!("failed to create client config: {}", e),
                })?
        };
        Ok(Self {
            inner: tokio_rustls::TlsConnector::from(Arc::new(client_config)),
        })
    }

    /// Establishes a TLS connection over an existing stream.
    pub async fn connect<IO>(&self, domain: &str, stream: IO) -> Result<TlsStream<IO>>
    where
        IO: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        let domain = if let Ok(ip) = domain.parse::<std::net::IpAddr>() {
            ServerName::IpAddress(ip.into())
        } else {
            ServerName::try_from(domain.to_string()).map_err(|e| TransportError::TlsError {
                reason: format!("invalid domain: {}", e),
            })?
        };
        let stream = self
            .inner
            .connect(domain, stream)
            .await
            .map_err(|e| TransportError::TlsError {
                reason: e.to_string(),
            })?;
        Ok(TlsStream::Client(stream))
    }
}

/// Server-side TLS acceptor.
#[derive(Clone)]
pub struct TlsAcceptor {
    inner: tokio_rustls::TlsAcceptor,
}

impl fmt::Debug for TlsAcceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsAcceptor").finish()
    }
}

impl TlsAcceptor {
    /// Creates a new TLS acceptor from configuration.
    pub fn new(config: &TlsConfig) -> Result<Self> {
        install_provider();
        let certs = load_certs_from_pem(&config.cert_chain_pem)?;
        let key = load_private_key_from_pem(&config.private_key_pem)?;

        let builder = if config.require_client_auth {
            let verifier =
                rustls::server::WebPkiClientVerifier::builder(Arc::new(root_store(&config.ca_cert_pem)?))
                    .build()
                    .map_err(|e| TransportError::TlsError {
                        reason: format!("failed to build client verifier: {}", e),
                    })?;
            rustls::ServerConfig::builder().with_client_cert_verifier(verifier)
        } else {
            rustls::ServerConfig::builder().with_no_client_auth()
        };
        let server_config = builder
            .with_single_cert(certs, key)
            .map_err(|e| TransportError::TlsError {
                reason: format!("failed to set server cert: {}", e),
            })?;

        Ok(Self {
            inner: tokio_rustls::TlsAcceptor::from(Arc::new(server_config)),
        })
    }

    /// Accepts a TLS connection over an existing stream.
    pub async fn accept<IO>(&self, stream: IO) -> Result<TlsStream<IO>>
    where
        IO: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        let stream = self
            .inner
            .accept(stream)
            .await
            .map_err(|e| TransportError::TlsError {
                reason: e.to_string(),
            })?;
        Ok(TlsStream::Server(stream))
    }
}

/// A TLS stream that can be either client or server side.
#[derive(Debug)]
pub enum TlsStream<IO> {
    /// Client-side TLS stream.
    Client(tokio_rustls::client::TlsStream<IO>),
    /// Server-side TLS stream.
    Server(tokio_rustls::server::TlsStream<IO>),
}

impl<IO> TlsStream<IO>
where
    IO: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    /// Returns the peer's certificate chain, if available.
    pub fn peer_certificates(&self) -> Option<Vec<Vec<u8>>> {
        let certs = match self {
            TlsStream::Client(s) => s.get_ref().1.peer_certificates(),
            TlsStream::Server(s) => s.get_ref().1.peer_certificates(),
        };
        certs.map(|certs| certs.iter().map(|c| c.as_ref().to_vec()).collect())
    }
}

impl<IO> tokio::io::AsyncRead for TlsStream<IO>
where
    IO: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    fn poll_read(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match &mut *self {
            TlsStream::Client(s) => std::pin::Pin::new(s).poll_read(cx, buf),
            TlsStream::Server(s) => std::pin::Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl<IO> tokio::io::AsyncWrite for TlsStream<IO>
where
    IO: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    fn poll_write(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::result::Result<usize, std::io::Error>> {
        match &mut *self {
            TlsStream::Client(s) => std::pin::Pin::new(s).poll_write(cx, buf),
            TlsStream::Server(s) => std::pin::Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::result::Result<(), std::io::Error>> {
        match &mut *self {
            TlsStream::Client(s) => std::pin::Pin::new(s).poll_flush(cx),
            TlsStream::Server(s) => std::pin::Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::result::Result<(), std::io::Error>> {
        match &mut *self {
            TlsStream::Client(s) => std::pin::Pin::new(s).poll_shutdown(cx),
            TlsStream::Server(s) => std::pin::Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Loads certificates from PEM-encoded data.
pub fn load_certs_from_pem(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
    let mut cursor = std::io::Cursor::new(pem);
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut cursor)
        .collect::<std::result::Result<_, _>>()
        .map_err(|e| TransportError::TlsError {
            reason: format!("invalid certificate PEM: {}", e),
        })?;

    if certs.is_empty() {
        return Err(TransportError::TlsError {
            reason: "no certificates found in PEM".to_string(),
        });
    }
    Ok(certs)
}

/// Loads a private key (PKCS#8, PKCS#1 or SEC1) from PEM-encoded data.
pub fn load_private_key_from_pem(pem: &[u8]) -> Result<PrivateKeyDer<'static>> {
    let mut cursor = std::io::Cursor::new(pem);
    rustls_pemfile::private_key(&mut cursor)
        .map_err(|e| TransportError::TlsError {
            reason: format!("invalid private key PEM: {}", e),
        })?
        .ok_or_else(|| TransportError::TlsError {
            reason: "no private key found in PEM".to_string(),
        })
}

/// Generates a self-signed CA certificate and key pair using rcgen.
///
/// Returns (CA certificate PEM, CA key PEM).
pub fn generate_self_signed_ca() -> Result<(Vec<u8>, Vec<u8>)> {
    let key_pair = rcgen::KeyPair::generate().map_err(|e| TransportError::TlsError {
        reason: format!("failed to generate CA key: {}", e),
    })?;

    let mut params = rcgen::CertificateParams::default();
    params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
    params
        .distinguished_name
        .push(rcgen::DnType::CommonName, "nodelink cluster CA");

    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| TransportError::TlsError {
            reason: format!("failed to create CA certificate: {}", e),
        })?;

    Ok((cert.pem().into_bytes(), key_pair.serialize_pem().into_bytes()))
}

/// Generates a node certificate signed by the cluster CA, valid for the
/// given host names or IP addresses.
///
/// Returns (node certificate PEM, node key PEM).
pub fn generate_node_cert(
    ca_cert_pem: &[u8],
    ca_key_pem: &[u8],
    subject_alt_names: &[&str],
) -> Result<(Vec<u8>, Vec<u8>)> {
    let tls_err = |what: &str, e: &dyn fmt::Display| TransportError::TlsError {
        reason: format!("{}: {}", what, e),
    };
    let ca_key_pem = std::str::from_utf8(ca_key_pem).map_err(|e| tls_err("invalid CA key PEM", &e))?;
    let ca_key = rcgen::KeyPair::from_pem(ca_key_pem).map_err(|e| tls_err("failed to parse CA key", &e))?;
    let ca_cert_pem = std::str::from_utf8(ca_cert_pem).map_err(|e| tls_err("invalid CA cert PEM", &e))?;
    let ca_cert = rcgen::CertificateParams::from_ca_cert_pem(ca_cert_pem)
        .map_err(|e| tls_err("failed to parse CA certificate", &e))?
        .self_signed(&ca_key)
        .map_err(|e| tls_err("failed to reconstruct CA certificate", &e))?;

    let node_key = rcgen::KeyPair::generate().map_err(|e| tls_err("failed to generate node key", &e))?;
    let names: Vec<String> = subject_alt_names.iter().map(|s| s.to_string()).collect();
    let node_cert = rcgen::CertificateParams::new(names)
        .map_err(|e| tls_err("failed to create node certificate params", &e))?
        .signed_by(&node_key, &ca_cert, &ca_key)
        .map_err(|e| tls_err("failed to sign node certificate", &e))?;

    Ok((
        node_cert.pem().into_bytes(),
        node_key.serialize_pem().into_bytes(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_self_signed_ca() {
        let (ca_cert_pem, ca_key_pem) = generate_self_signed_ca().unwrap();
        assert!(String::from_utf8_lossy(&ca_cert_pem).contains("BEGIN CERTIFICATE"));
        assert!(String::from_utf8_lossy(&ca_key_pem).contains("BEGIN PRIVATE KEY"));
    }

    #[test]
    fn test_generate_node_cert() {
        let (ca_cert_pem, ca_key_pem) = generate_self_signed_ca().unwrap();
        let (node_cert_pem, node_key_pem) =
            generate_node_cert(&ca_cert_pem, &ca_key_pem, &["master", "127.0.0.1"]).unwrap();
        assert!(String::from_utf8_lossy(&node_cert_pem).contains("BEGIN CERTIFICATE"));
        assert!(!load_private_key_from_pem(&node_key_pem)
            .unwrap()
            .secret_der()
            .is_empty());
    }

    #[test]
    fn test_connector_and_acceptor_creation() {
        let (ca_cert_pem, ca_key_pem) = generate_self_signed_ca().unwrap();
        let (cert, key) = generate_node_cert(&ca_cert_pem, &ca_key_pem, &["localhost"]).unwrap();

        let server = TlsConfig::new(ca_cert_pem.clone(), cert, key, true);
        TlsAcceptor::new(&server).unwrap();
        TlsConnector::new(&server).unwrap();

        let anonymous_client = TlsConfig::new(ca_cert_pem, Vec::new(), Vec::new(), false);
        TlsConnector::new(&anonymous_client).unwrap();
    }

    #[test]
    fn test_load_errors() {
        assert!(load_certs_from_pem(b"not a pem").is_err());
        assert!(load_private_key_from_pem(b"").is_err());
    }

    #[test]
    fn test_from_files() {
        let dir = tempfile::tempdir().unwrap();
        let (ca_cert_pem, _) = generate_self_signed_ca().unwrap();
        let ca = dir.path().join("ca.pem");
        std::fs::write(&ca, &ca_cert_pem).unwrap();

        let config = TlsConfig::from_files(&ca, None, None, false).unwrap();
        assert_eq!(config.ca_cert_pem, ca_cert_pem);
        assert!(config.cert_chain_pem.is_empty());
        assert!(TlsConfig::from_files(&dir.path().join("missing.pem"), None, None, false).is_err());
    }
}
