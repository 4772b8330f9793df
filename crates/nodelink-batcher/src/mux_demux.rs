//! Shared queue routing events out and their responses back by id.
//!
//! Producers push `(uid, event)` onto the mux side. A single consumer (the
//! [`Batcher`](crate::batcher::Batcher)) drains it and delivers responses to
//! the demux side, where each id owns one slot. A slot is created when the
//! event is queued, filled by the first response and consumed by the first
//! reader, so a response is handed out at most once. Waiters are woken through
//! a per-slot [`Notify`] rather than polling.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, Mutex as AsyncMutex, Notify};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{BatcherError, Result};

/// One event or one response, tagged with the event's id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Correlation id assigned when the event was queued.
    pub uid: Uuid,
    /// Event or response body.
    pub msg: Value,
}

impl Message {
    /// Pairs `uid` with `msg`.
    pub fn new(uid: Uuid, msg: Value) -> Self {
        Self { uid, msg }
    }
}

enum Slot {
    Pending(Arc<Notify>),
    Ready(Value),
}

enum Lookup {
    Gone,
    Ready(Value),
    Pending(Arc<Notify>),
}

/// Mux/demux queue shared by clients and the batching consumer.
pub struct MuxDemuxQueue {
    mux_tx: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    mux_rx: AsyncMutex<mpsc::UnboundedReceiver<Message>>,
    slots: Mutex<HashMap<Uuid, Slot>>,
}

impl std::fmt::Debug for MuxDemuxQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MuxDemuxQueue")
            .field("open", &self.is_open())
            .field("slots", &self.slots.lock().len())
            .finish()
    }
}

impl Default for MuxDemuxQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl MuxDemuxQueue {
    /// Empty, open queue.
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            mux_tx: Mutex::new(Some(tx)),
            mux_rx: AsyncMutex::new(rx),
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Queues `msg` under `uid` and opens its response slot.
    pub fn send_to_mux(&self, uid: Uuid, msg: Value) -> Result<Uuid> {
        let tx = self.mux_tx.lock().clone().ok_or(BatcherError::QueueClosed)?;
        {
            let mut slots = self.slots.lock();
            if slots.contains_key(&uid) {
                return Err(BatcherError::DuplicateId { uid });
            }
            slots.insert(uid, Slot::Pending(Arc::new(Notify::new())));
        }
        if tx.send(Message::new(uid, msg)).is_err() {
            self.slots.lock().remove(&uid);
            return Err(BatcherError::QueueClosed);
        }
        debug!(%uid, "event queued");
        Ok(uid)
    }

    /// Next queued event. Returns `None` once the queue is closed and drained.
    pub async fn receive_from_mux(&self) -> Option<Message> {
        self.mux_rx.lock().await.recv().await
    }

    /// Next queued event without waiting.
    pub fn try_receive_from_mux(&self) -> Option<Message> {
        self.mux_rx.try_lock().ok()?.try_recv().ok()
    }

    /// Delivers a response. Returns false if nobody is waiting for `uid`
    /// (unknown, already answered or already consumed); the response is dropped.
    pub fn send_to_demux(&self, message: Message) -> bool {
        let mut slots = self.slots.lock();
        let Some(slot) = slots.get_mut(&message.uid) else {
            warn!(uid = %message.uid, "response for unknown event dropped");
            return false;
        };
        match slot {
            Slot::Pending(notify) => {
                let notify = Arc::clone(notify);
                *slot = Slot::Ready(message.msg);
                notify.notify_waiters();
                true
            }
            Slot::Ready(_) => {
                warn!(uid = %message.uid, "duplicate response dropped");
                false
            }
        }
    }

    /// True while `uid` was queued but not yet answered.
    pub fn is_response_pending(&self, uid: Uuid) -> bool {
        matches!(self.slots.lock().get(&uid), Some(Slot::Pending(_)))
    }

    /// Takes the response for `uid` if it has arrived.
    pub fn receive_from_demux(&self, uid: Uuid) -> Option<Value> {
        match self.lookup(uid) {
            Lookup::Ready(value) => Some(value),
            _ => None,
        }
    }

    /// Waits for and takes the response for `uid`. Returns `None` right away
    /// if `uid` has no slot, which includes ids whose response was already taken.
    pub async fn wait_response(&self, uid: Uuid) -> Option<Value> {
        loop {
            let notify = match self.lookup(uid) {
                Lookup::Gone => return None,
                Lookup::Ready(value) => return Some(value),
                Lookup::Pending(notify) => notify,
            };
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            match self.lookup(uid) {
                Lookup::Gone => return None,
                Lookup::Ready(value) => return Some(value),
                Lookup::Pending(_) => notified.await,
            }
        }
    }

    fn lookup(&self, uid: Uuid) -> Lookup {
        let mut slots = self.slots.lock();
        if let Some(Slot::Pending(notify)) = slots.get(&uid) {
            return Lookup::Pending(Arc::clone(notify));
        }
        match slots.remove(&uid) {
            Some(Slot::Ready(value)) => Lookup::Ready(value),
            _ => Lookup::Gone,
        }
    }

    /// Drops the slot of an abandoned event; a late response is then ignored.
    pub fn forget(&self, uid: Uuid) -> bool {
        let removed = self.slots.lock().remove(&uid);
        if let Some(Slot::Pending(notify)) = &removed {
            notify.notify_waiters();
        }
        removed.is_some()
    }

    /// Slots not yet consumed, answered or not.
    pub fn outstanding(&self) -> usize {
        self.slots.lock().len()
    }

    /// Stops accepting events. Already queued events can still be drained.
    pub fn close(&self) {
        self.mux_tx.lock().take();
    }

    /// False after [`close`](Self::close).
    pub fn is_open(&self) -> bool {
        self.mux_tx.lock().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn test_send_to_mux_and_receive() {
        let queue = MuxDemuxQueue::new();
        let uid = Uuid::new_v4();
        queue.send_to_mux(uid, json!("test message")).unwrap();

        let message = queue.receive_from_mux().await.unwrap();
        assert_eq!(message.uid, uid);
        assert_eq!(message.msg, json!("test message"));
        assert!(queue.try_receive_from_mux().is_none());
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let queue = MuxDemuxQueue::new();
        let uid = Uuid::new_v4();
        queue.send_to_mux(uid, json!(1)).unwrap();
        assert!(matches!(
            queue.send_to_mux(uid, json!(2)),
            Err(BatcherError::DuplicateId { .. })
        ));
    }

    #[test]
    fn test_response_pending_until_demuxed() {
        let queue = MuxDemuxQueue::new();
        let uid = Uuid::new_v4();
        queue.send_to_mux(uid, json!({"a": 1})).unwrap();
        assert!(queue.is_response_pending(uid));
        assert!(queue.receive_from_demux(uid).is_none());

        assert!(queue.send_to_demux(Message::new(uid, json!("done"))));
        assert!(!queue.is_response_pending(uid));
        assert_eq!(queue.receive_from_demux(uid), Some(json!("done")));
        assert_eq!(queue.receive_from_demux(uid), None);
        assert_eq!(queue.outstanding(), 0);
    }

    #[test]
    fn test_unknown_and_duplicate_responses_dropped() {
        let queue = MuxDemuxQueue::new();
        assert!(!queue.send_to_demux(Message::new(Uuid::new_v4(), json!(0))));

        let uid = Uuid::new_v4();
        queue.send_to_mux(uid, json!(0)).unwrap();
        assert!(queue.send_to_demux(Message::new(uid, json!("first"))));
        assert!(!queue.send_to_demux(Message::new(uid, json!("second"))));
        assert_eq!(queue.receive_from_demux(uid), Some(json!("first")));
    }

    #[tokio::test]
    async fn test_waiter_woken_by_response() {
        let queue = Arc::new(MuxDemuxQueue::new());
        let uid = Uuid::new_v4();
        queue.send_to_mux(uid, json!("ping")).unwrap();

        let q = Arc::clone(&queue);
        let waiter = tokio::spawn(async move { q.wait_response(uid).await });
        tokio::task::yield_now().await;
        queue.send_to_demux(Message::new(uid, json!("pong")));

        let got = tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert_eq!(got, Some(json!("pong")));
    }

    #[tokio::test]
    async fn test_two_waiters_only_one_receives() {
        let queue = Arc::new(MuxDemuxQueue::new());
        let uid = Uuid::new_v4();
        queue.send_to_mux(uid, json!(null)).unwrap();

        let waiters: Vec<_> = (0..2)
            .map(|_| {
                let q = Arc::clone(&queue);
                tokio::spawn(async move { q.wait_response(uid).await })
            })
            .collect();
        tokio::task::yield_now().await;
        queue.send_to_demux(Message::new(uid, json!(42)));

        let mut delivered = 0;
        for waiter in waiters {
            if waiter.await.unwrap().is_some() {
                delivered += 1;
            }
        }
        assert_eq!(delivered, 1);
    }

    #[tokio::test]
    async fn test_forget_releases_waiter() {
        let queue = Arc::new(MuxDemuxQueue::new());
        let uid = Uuid::new_v4();
        queue.send_to_mux(uid, json!(1)).unwrap();
        let q = Arc::clone(&queue);
        let waiter = tokio::spawn(async move { q.wait_response(uid).await });
        tokio::task::yield_now().await;

        assert!(queue.forget(uid));
        assert_eq!(waiter.await.unwrap(), None);
        assert!(!queue.send_to_demux(Message::new(uid, json!(2))));
    }

    #[tokio::test]
    async fn test_close_drains_then_ends() {
        let queue = MuxDemuxQueue::new();
        queue.send_to_mux(Uuid::new_v4(), json!(1)).unwrap();
        queue.close();
        assert!(matches!(
            queue.send_to_mux(Uuid::new_v4(), json!(2)),
            Err(BatcherError::QueueClosed)
        ));
        assert!(queue.receive_from_mux().await.is_some());
        assert!(queue.receive_from_mux().await.is_none());
    }
}
