//! Front-end giving callers request/response semantics over the queue.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::error::{BatcherError, Result};
use crate::mux_demux::MuxDemuxQueue;

/// Submits events and collects their responses.
#[derive(Debug, Clone)]
pub struct BatcherClient {
    queue: Arc<MuxDemuxQueue>,
}

impl BatcherClient {
    /// Client over a shared queue.
    pub fn new(queue: Arc<MuxDemuxQueue>) -> Self {
        Self { queue }
    }

    /// Queues `event` under a fresh id and returns the id without waiting.
    pub fn send_event<E: Serialize>(&self, event: E) -> Result<Uuid> {
        let msg = serde_json::to_value(event)?;
        self.queue.send_to_mux(Uuid::new_v4(), msg)
    }

    /// Waits for the response to `uid` and takes it. A second call for the
    /// same id, or a call for an id never queued, returns `None`.
    pub async fn get_response(&self, uid: Uuid) -> Option<Value> {
        self.queue.wait_response(uid).await
    }

    /// [`get_response`](Self::get_response) bounded by `timeout`. On timeout
    /// the slot stays open and a later call can still collect the response.
    pub async fn get_response_timeout(&self, uid: Uuid, timeout: Duration) -> Result<Option<Value>> {
        tokio::time::timeout(timeout, self.queue.wait_response(uid))
            .await
            .map_err(|_| BatcherError::Timeout {
                uid,
                timeout_ms: timeout.as_millis() as u64,
            })
    }

    /// Underlying queue.
    pub fn queue(&self) -> &Arc<MuxDemuxQueue> {
        &self.queue
    }
}
