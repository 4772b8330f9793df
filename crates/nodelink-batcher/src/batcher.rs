//! Drain loop between the mux queue and a sink.
//!
//! The batcher takes events off the mux side, groups them and flushes a group
//! when it holds `max_elements` events, `max_size` body bytes, or when
//! `max_time` has passed since its first event. Flushes run concurrently with
//! further collection; every event of a flushed batch gets exactly one
//! response on the demux side, an error object if the sink failed or skipped it.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::buffer::Buffer;
use crate::mux_demux::{Message, MuxDemuxQueue};
use crate::sink::BatchSink;

/// Batch limits.
#[derive(Debug, Clone)]
pub struct BatcherConfig {
    /// Events per batch.
    pub max_elements: usize,
    /// Serialized body bytes per batch.
    pub max_size: usize,
    /// Longest an event waits for its batch to fill.
    pub max_time: Duration,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            max_elements: 6,
            max_size: 30_000,
            max_time: Duration::from_secs(5),
        }
    }
}

/// Consumer draining a [`MuxDemuxQueue`] into a [`BatchSink`].
pub struct Batcher<S> {
    queue: Arc<MuxDemuxQueue>,
    config: BatcherConfig,
    sink: Arc<S>,
}

impl<S: BatchSink> Batcher<S> {
    /// Batcher for `queue` flushing into `sink`.
    pub fn new(queue: Arc<MuxDemuxQueue>, config: BatcherConfig, sink: S) -> Self {
        Self {
            queue,
            config,
            sink: Arc::new(sink),
        }
    }

    /// Runs until the queue is closed and drained, then waits for flushes
    /// still in progress.
    pub async fn run(self) {
        let mut buffer = Buffer::new(self.config.max_elements, self.config.max_size);
        let mut deadline: Option<Instant> = None;
        let mut flushes: JoinSet<()> = JoinSet::new();

        loop {
            let timer = deadline.unwrap_or_else(Instant::now);
            tokio::select! {
                next = self.queue.receive_from_mux() => match next {
                    Some(message) => {
                        if buffer.is_empty() {
                            deadline = Some(Instant::now() + self.config.max_time);
                        }
                        debug!(uid = %message.uid, "event batched");
                        buffer.add_message(message);
                        if buffer.is_full() {
                            self.flush(&mut buffer, &mut flushes, "limit reached");
                            deadline = None;
                        }
                    }
                    None => break,
                },
                _ = tokio::time::sleep_until(timer), if deadline.is_some() => {
                    self.flush(&mut buffer, &mut flushes, "max time reached");
                    deadline = None;
                }
                Some(joined) = flushes.join_next(), if !flushes.is_empty() => {
                    if let Err(e) = joined {
                        warn!(error = %e, "flush task failed");
                    }
                }
            }
        }

        if !buffer.is_empty() {
            self.flush(&mut buffer, &mut flushes, "queue closed");
        }
        while let Some(joined) = flushes.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "flush task failed");
            }
        }
        info!("batcher stopped");
    }

    fn flush(&self, buffer: &mut Buffer, flushes: &mut JoinSet<()>, why: &'static str) {
        let batch = buffer.take();
        if batch.is_empty() {
            return;
        }
        debug!(events = batch.len(), reason = why, "flushing batch");
        let queue = Arc::clone(&self.queue);
        let sink = Arc::clone(&self.sink);
        flushes.spawn(async move { deliver(&queue, sink.as_ref(), batch).await });
    }
}

/// Runs `batch` through `sink` and answers every event exactly once.
async fn deliver<S: BatchSink>(queue: &MuxDemuxQueue, sink: &S, batch: Vec<Message>) {
    let mut unanswered: HashSet<Uuid> = batch.iter().map(|m| m.uid).collect();
    match sink.process(batch).await {
        Ok(responses) => {
            for response in responses {
                if unanswered.remove(&response.uid) {
                    queue.send_to_demux(response);
                } else {
                    warn!(uid = %response.uid, "sink answered an event outside the batch");
                }
            }
            for uid in unanswered {
                queue.send_to_demux(Message::new(uid, json!({"error": "no response"})));
            }
        }
        Err(e) => {
            warn!(error = %e, events = unanswered.len(), "batch failed");
            let error = e.to_string();
            for uid in unanswered {
                queue.send_to_demux(Message::new(uid, json!({ "error": error })));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::BatcherClient;
    use crate::error::{BatcherError, Result};
    use crate::sink::EchoSink;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    /// Records batch sizes and echoes.
    #[derive(Default)]
    struct Recording {
        sizes: Mutex<Vec<usize>>,
    }

    #[async_trait]
    impl BatchSink for Arc<Recording> {
        async fn process(&self, batch: Vec<Message>) -> Result<Vec<Message>> {
            self.sizes.lock().push(batch.len());
            Ok(batch)
        }
    }

    struct Failing;

    #[async_trait]
    impl BatchSink for Failing {
        async fn process(&self, _batch: Vec<Message>) -> Result<Vec<Message>> {
            Err(BatcherError::NotConnected {
                reason: "offline".to_string(),
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_on_count() {
        let queue = Arc::new(MuxDemuxQueue::new());
        let recording = Arc::new(Recording::default());
        let config = BatcherConfig {
            max_elements: 3,
            ..Default::default()
        };
        let batcher = Batcher::new(Arc::clone(&queue), config, Arc::clone(&recording));
        let run = tokio::spawn(batcher.run());

        let client = BatcherClient::new(Arc::clone(&queue));
        let ids: Vec<_> = (0..6).map(|i| client.send_event(json!({ "n": i })).unwrap()).collect();
        for (i, uid) in ids.iter().enumerate() {
            assert_eq!(client.get_response(*uid).await, Some(json!({ "n": i })));
        }
        assert_eq!(*recording.sizes.lock(), vec![3, 3]);

        queue.close();
        run.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_on_time() {
        let queue = Arc::new(MuxDemuxQueue::new());
        let batcher = Batcher::new(Arc::clone(&queue), BatcherConfig::default(), EchoSink);
        let _run = tokio::spawn(batcher.run());

        let client = BatcherClient::new(Arc::clone(&queue));
        let uid = client.send_event("lonely").unwrap();
        let started = Instant::now();
        assert_eq!(client.get_response(uid).await, Some(json!("lonely")));
        assert!(started.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_flushes_partial_batch() {
        let queue = Arc::new(MuxDemuxQueue::new());
        let batcher = Batcher::new(Arc::clone(&queue), BatcherConfig::default(), EchoSink);
        let client = BatcherClient::new(Arc::clone(&queue));
        let uid = client.send_event(7).unwrap();
        queue.close();

        batcher.run().await;
        assert_eq!(client.get_response(uid).await, Some(json!(7)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sink_failure_answers_every_event() {
        let queue = Arc::new(MuxDemuxQueue::new());
        let config = BatcherConfig {
            max_elements: 2,
            ..Default::default()
        };
        let _run = tokio::spawn(Batcher::new(Arc::clone(&queue), config, Failing).run());

        let client = BatcherClient::new(Arc::clone(&queue));
        let a = client.send_event(1).unwrap();
        let b = client.send_event(2).unwrap();
        for uid in [a, b] {
            let response = client.get_response(uid).await.unwrap();
            assert!(response["error"].as_str().unwrap().contains("offline"));
        }
        assert_eq!(queue.outstanding(), 0);
    }
}
