//! Transport layer metrics collection.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Clone, Default, Serialize)]
/// Snapshot of transport metrics at a point in time.
pub struct MetricsSnapshot {
    /// Requests issued to peers.
    pub requests_sent: u64,
    /// Requests received from peers.
    pub requests_received: u64,
    /// Responses written back to peers.
    pub responses_sent: u64,
    /// Responses correlated to a pending request.
    pub responses_received: u64,
    /// Frames written.
    pub frames_sent: u64,
    /// Frames read.
    pub frames_received: u64,
    /// Wire bytes written, headers included.
    pub bytes_sent: u64,
    /// Wire bytes read, headers included.
    pub bytes_received: u64,
    /// Transport and protocol errors.
    pub errors_total: u64,
    /// Error responses received from peers.
    pub application_errors: u64,
    /// Requests that timed out locally.
    pub timeouts_total: u64,
    /// Failed keepalive round trips.
    pub keepalive_failures: u64,
    /// Connections established.
    pub connections_opened: u64,
    /// Connections torn down.
    pub connections_closed: u64,
    /// Connections currently open.
    pub active_connections: u32,
    /// Reconnect attempts made by client managers.
    pub reconnects_total: u64,
}

/// Thread-safe transport layer metrics collector.
pub struct TransportMetrics {
    requests_sent: AtomicU64,
    requests_received: AtomicU64,
    responses_sent: AtomicU64,
    responses_received: AtomicU64,
    frames_sent: AtomicU64,
    frames_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    errors_total: AtomicU64,
    application_errors: AtomicU64,
    timeouts_total: AtomicU64,
    keepalive_failures: AtomicU64,
    connections_opened: AtomicU64,
    connections_closed: AtomicU64,
    active_connections: AtomicU32,
    reconnects_total: AtomicU64,
}

impl Default for TransportMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TransportMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportMetrics")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

impl TransportMetrics {
    /// Creates a collector with every counter at zero.
    #[must_use]
    pub fn new() -> Self {
        Self {
            requests_sent: AtomicU64::new(0),
            requests_received: AtomicU64::new(0),
            responses_sent: AtomicU64::new(0),
            responses_received: AtomicU64::new(0),
            frames_sent: AtomicU64::new(0),
            frames_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            errors_total: AtomicU64::new(0),
            application_errors: AtomicU64::new(0),
            timeouts_total: AtomicU64::new(0),
            keepalive_failures: AtomicU64::new(0),
            connections_opened: AtomicU64::new(0),
            connections_closed: AtomicU64::new(0),
            active_connections: AtomicU32::new(0),
            reconnects_total: AtomicU64::new(0),
        }
    }

    /// Increments the requests sent counter.
    pub fn inc_requests_sent(&self) {
        self.requests_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Increments the requests received counter.
    pub fn inc_requests_received(&self) {
        self.requests_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Increments the responses sent counter.
    pub fn inc_responses_sent(&self) {
        self.responses_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Increments the responses received counter.
    pub fn inc_responses_received(&self) {
        self.responses_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Records `frames` written frames totalling `bytes` wire bytes.
    pub fn record_frames_sent(&self, frames: u64, bytes: u64) {
        self.frames_sent.fetch_add(frames, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Records `frames` read frames totalling `bytes` wire bytes.
    pub fn record_frames_received(&self, frames: u64, bytes: u64) {
        self.frames_received.fetch_add(frames, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Increments the errors total counter.
    pub fn inc_errors_total(&self) {
        self.errors_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Increments the application errors counter.
    pub fn inc_application_errors(&self) {
        self.application_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Increments the timeouts total counter.
    pub fn inc_timeouts_total(&self) {
        self.timeouts_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Increments the keepalive failures counter.
    pub fn inc_keepalive_failures(&self) {
        self.keepalive_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Increments the reconnects counter.
    pub fn inc_reconnects_total(&self) {
        self.reconnects_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a new connection opened, incrementing both opened counter and active connections.
    pub fn connection_opened(&self) {
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a connection closed, decrementing active connections.
    pub fn connection_closed(&self) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
        let _ = self
            .active_connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(1))
            });
    }

    /// Takes a snapshot of all current metric values.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests_sent: self.requests_sent.load(Ordering::Relaxed),
            requests_received: self.requests_received.load(Ordering::Relaxed),
            responses_sent: self.responses_sent.load(Ordering::Relaxed),
            responses_received: self.responses_received.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            errors_total: self.errors_total.load(Ordering::Relaxed),
            application_errors: self.application_errors.load(Ordering::Relaxed),
            timeouts_total: self.timeouts_total.load(Ordering::Relaxed),
            keepalive_failures: self.keepalive_failures.load(Ordering::Relaxed),
            connections_opened: self.connections_opened.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            reconnects_total: self.reconnects_total.load(Ordering::Relaxed),
        }
    }
}
