//! Error types for the batcher subsystem.

use nodelink_transport::TransportError;
use thiserror::Error;
use uuid::Uuid;

/// Errors that can occur while queueing, batching or answering events.
#[derive(Debug, Error)]
pub enum BatcherError {
    /// The mux side was closed; no more events are accepted.
    #[error("mux queue closed")]
    QueueClosed,

    /// An event with this id is already awaiting its response.
    #[error("duplicate event id {uid}")]
    DuplicateId {
        /// The colliding id.
        uid: Uuid,
    },

    /// No response arrived in time. The response slot is kept.
    #[error("no response for {uid} after {timeout_ms}ms")]
    Timeout {
        /// Event id.
        uid: Uuid,
        /// Elapsed wait.
        timeout_ms: u64,
    },

    /// A sink needed a connection and none was available.
    #[error("no connection available: {reason}")]
    NotConnected {
        /// Why no handler could be used.
        reason: String,
    },

    /// JSON encoding or decoding failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The transport request carrying a batch failed.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Result alias for batcher operations.
pub type Result<T> = std::result::Result<T, BatcherError>;
