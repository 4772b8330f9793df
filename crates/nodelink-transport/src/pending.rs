//! In-flight request bookkeeping for one connection.
//!
//! Each request owns a one-shot result slot keyed by its counter. Slots are
//! removed when resolved, so a slot is resolved at most once; closing the
//! table fails every remaining slot and refuses new ones.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::{Result, TransportError};
use crate::protocol::Command;

/// What a pending request resolves to.
pub type Outcome = Result<(Command, Bytes)>;

/// One in-flight request awaiting its correlated response.
#[derive(Debug)]
pub struct PendingRequest {
    /// Request counter.
    pub id: u32,
    /// Command the request was issued with.
    pub command: Command,
    /// When the request was registered.
    pub created_at: Instant,
    slot: oneshot::Sender<Outcome>,
}

#[derive(Debug, Default)]
struct Table {
    requests: HashMap<u32, PendingRequest>,
    closed: Option<String>,
}

/// Pending requests of one connection, guarded by a mutex.
#[derive(Debug, Default)]
pub struct PendingTable {
    inner: Mutex<Table>,
    resolved: AtomicU64,
}

impl PendingTable {
    /// Creates an empty, open table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a request. Fails with `ConnectionLost` once the table is closed
    /// and with `Protocol` if the counter is still outstanding.
    pub fn register(&self, id: u32, command: Command) -> Result<oneshot::Receiver<Outcome>> {
        let mut table = self.inner.lock();
        if let Some(reason) = &table.closed {
            return Err(TransportError::lost(reason.clone()));
        }
        if table.requests.contains_key(&id) {
            return Err(TransportError::protocol(format!(
                "counter {} is still outstanding",
                id
            )));
        }
        let (tx, rx) = oneshot::channel();
        table.requests.insert(
            id,
            PendingRequest {
                id,
                command,
                created_at: Instant::now(),
                slot: tx,
            },
        );
        Ok(rx)
    }

    /// Resolves the request registered under `id`. Returns false if no such
    /// request exists (unknown, already resolved, or cancelled).
    pub fn resolve(&self, id: u32, outcome: Outcome) -> bool {
        let entry = self.inner.lock().requests.remove(&id);
        match entry {
            Some(req) => {
                self.resolved.fetch_add(1, Ordering::Relaxed);
                // The caller may have given up (timeout); that is not an error here.
                let _ = req.slot.send(outcome);
                true
            }
            None => false,
        }
    }

    /// Forgets a request without resolving it (caller timed out).
    pub fn cancel(&self, id: u32) -> Option<PendingRequest> {
        self.inner.lock().requests.remove(&id)
    }

    /// True if `id` is outstanding.
    pub fn contains(&self, id: u32) -> bool {
        self.inner.lock().requests.contains_key(&id)
    }

    /// Number of outstanding requests.
    pub fn len(&self) -> usize {
        self.inner.lock().requests.len()
    }

    /// True when nothing is outstanding.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total number of slots resolved since creation.
    pub fn resolved_total(&self) -> u64 {
        self.resolved.load(Ordering::Relaxed)
    }

    /// Closes the table and fails every outstanding request with `ConnectionLost`.
    /// Returns how many requests were failed. Closing twice is a no-op.
    pub fn fail_all(&self, reason: &str) -> usize {
        let drained: Vec<PendingRequest> = {
            let mut table = self.inner.lock();
            if table.closed.is_none() {
                table.closed = Some(reason.to_string());
            }
            table.requests.drain().map(|(_, req)| req).collect()
        };
        let count = drained.len();
        for req in drained {
            self.resolved.fetch_add(1, Ordering::Relaxed);
            let _ = req.slot.send(Err(TransportError::lost(reason)));
        }
        count
    }

    /// True once [`fail_all`](Self::fail_all) has run.
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed.is_some()
    }
}
