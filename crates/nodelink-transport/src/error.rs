use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection refused to {addr}")]
    ConnectionRefused { addr: String },

    #[error("connection timeout after {timeout_ms}ms to {addr}")]
    ConnectionTimeout { addr: String, timeout_ms: u64 },

    /// The transport closed while the operation was outstanding.
    #[error("transport closed: {reason}")]
    ConnectionLost { reason: String },

    #[error("protocol error: {reason}")]
    Protocol { reason: String },

    #[error("handshake rejected by peer: {message}")]
    Handshake { message: String },

    /// The peer answered with an error response.
    #[error("remote error: {message}")]
    Application { message: String },

    #[error("keepalive exhausted after {missed} consecutive failures")]
    KeepaliveExhausted { missed: u32 },

    #[error("connection not ready (state: {state})")]
    NotReady { state: String },

    #[error("request {counter} timed out after {timeout_ms}ms")]
    RequestTimeout { counter: u32, timeout_ms: u64 },

    #[error("payload too large: {size} bytes (max {max_size})")]
    PayloadTooLarge { size: usize, max_size: usize },

    #[error("invalid command tag: {reason}")]
    InvalidCommand { reason: String },

    #[error("cipher error: {reason}")]
    Crypto { reason: String },

    #[error("TLS handshake failed: {reason}")]
    TlsError { reason: String },

    #[error("no connected client named {name}")]
    UnknownPeer { name: String },

    #[error("configuration error: {reason}")]
    Config { reason: String },

    #[error(transparent)]
    IoError(#[from] std::io::Error),
}

impl TransportError {
    pub(crate) fn protocol(reason: impl Into<String>) -> Self {
        TransportError::Protocol {
            reason: reason.into(),
        }
    }

    pub(crate) fn lost(reason: impl Into<String>) -> Self {
        TransportError::ConnectionLost {
            reason: reason.into(),
        }
    }

    /// True for local connectivity failures, false for errors reported by the peer.
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, TransportError::ConnectionLost { .. })
    }

    /// Errors the client manager recovers from by closing and reconnecting.
    pub fn is_transport_failure(&self) -> bool {
        matches!(
            self,
            TransportError::ConnectionRefused { .. }
                | TransportError::ConnectionTimeout { .. }
                | TransportError::ConnectionLost { .. }
                | TransportError::Protocol { .. }
                | TransportError::Handshake { .. }
                | TransportError::KeepaliveExhausted { .. }
                | TransportError::TlsError { .. }
                | TransportError::IoError(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_failure_classification() {
        assert!(TransportError::lost("eof").is_transport_failure());
        assert!(TransportError::protocol("bad header").is_transport_failure());
        assert!(TransportError::KeepaliveExhausted { missed: 3 }.is_transport_failure());
        assert!(TransportError::IoError(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset"
        ))
        .is_transport_failure());

        assert!(!TransportError::Application {
            message: "boom".to_string()
        }
        .is_transport_failure());
        assert!(!TransportError::RequestTimeout {
            counter: 1,
            timeout_ms: 10
        }
        .is_transport_failure());
    }

    #[test]
    fn test_connection_lost_is_distinct_from_remote_error() {
        let lost = TransportError::lost("reset by peer");
        let remote = TransportError::Application {
            message: "Error: nope".to_string(),
        };
        assert!(lost.is_connection_lost());
        assert!(!remote.is_connection_lost());
        assert_eq!(lost.to_string(), "transport closed: reset by peer");
    }
}
