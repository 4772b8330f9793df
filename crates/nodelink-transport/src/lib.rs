#![warn(missing_docs)]

//! nodelink transport subsystem: framed request/response protocol over TCP or
//! TLS, per-connection handler, keepalive, file transfer, and the client and
//! server managers of a master/worker cluster.

pub mod client;
pub mod codec;
pub mod crypto;
pub mod diagnostics;
pub mod error;
pub mod file_transfer;
pub mod handler;
pub mod keepalive;
pub mod metrics;
pub mod pending;
pub mod protocol;
pub mod registry;
pub mod retry;
pub mod server;
pub mod tcp;
pub mod tls;
pub mod tls_tcp;
pub mod transport;

pub use client::{client_registry, ClientConfig, ClientEvent, ClientManager};
pub use codec::{CodecConfig, FrameCodec, Reassembler};
pub use crypto::PayloadCipher;
pub use diagnostics::{DiagnosticReport, MainTask};
pub use error::{Result, TransportError};
pub use handler::{ConnectionState, Handler, HandlerConfig, Role};
pub use keepalive::KeepAliveConfig;
pub use metrics::{MetricsSnapshot, TransportMetrics};
pub use protocol::{Command, Frame, Message};
pub use registry::{CommandHandler, CommandRegistry, Reply, RequestContext};
pub use retry::{ExponentialBackoff, FixedDelay, ReconnectPolicy};
pub use server::{ClientInfo, ServerConfig, ServerManager};
pub use tcp::{TcpTransport, TcpTransportConfig};
pub use tls::TlsConfig;
pub use tls_tcp::TlsTcpTransport;
pub use transport::{Connection, Listener, Transport};
