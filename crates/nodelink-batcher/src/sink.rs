//! Where batches go.
//!
//! A [`BatchSink`] turns a batch of events into their responses. The
//! [`HandlerSink`] ships a batch to the master as one `batch` request whose
//! payload is the JSON array of messages; the master answers through a
//! [`BatchResponder`] wrapping its own sink.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use nodelink_transport::{
    ClientManager, Command, CommandHandler, Handler, Reply, RequestContext, TransportError,
};
use tracing::debug;

use crate::error::{BatcherError, Result};
use crate::mux_demux::Message;

/// Processes one batch. Responses carry the uid of the event they answer;
/// events left without a response are answered with an error by the batcher.
#[async_trait]
pub trait BatchSink: Send + Sync + 'static {
    /// Handles `batch` and returns the responses.
    async fn process(&self, batch: Vec<Message>) -> Result<Vec<Message>>;
}

/// Answers every event with itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoSink;

#[async_trait]
impl BatchSink for EchoSink {
    async fn process(&self, batch: Vec<Message>) -> Result<Vec<Message>> {
        Ok(batch)
    }
}

#[derive(Debug, Clone)]
enum HandlerSource {
    Fixed(Handler),
    Client(Arc<ClientManager>),
}

/// Forwards batches over a cluster connection.
#[derive(Debug, Clone)]
pub struct HandlerSink {
    source: HandlerSource,
}

impl HandlerSink {
    /// Always uses `handler`.
    pub fn new(handler: Handler) -> Self {
        Self {
            source: HandlerSource::Fixed(handler),
        }
    }

    /// Uses whatever connection `client` currently holds.
    pub fn from_client(client: Arc<ClientManager>) -> Self {
        Self {
            source: HandlerSource::Client(client),
        }
    }

    fn handler(&self) -> Result<Handler> {
        match &self.source {
            HandlerSource::Fixed(handler) => Ok(handler.clone()),
            HandlerSource::Client(client) => client.handler().ok_or_else(|| BatcherError::NotConnected {
                reason: "client has no connection to the master".to_string(),
            }),
        }
    }
}

#[async_trait]
impl BatchSink for HandlerSink {
    async fn process(&self, batch: Vec<Message>) -> Result<Vec<Message>> {
        let handler = self.handler()?;
        let body = serde_json::to_vec(&batch)?;
        debug!(events = batch.len(), bytes = body.len(), "forwarding batch");
        let reply = handler.send_request(Command::BATCH, body).await?;
        Ok(serde_json::from_slice(&reply)?)
    }
}

/// `batch` command: decodes the array, runs it through a sink and answers
/// with the JSON array of responses.
#[derive(Debug, Clone)]
pub struct BatchResponder<S> {
    sink: Arc<S>,
}

impl<S: BatchSink> BatchResponder<S> {
    /// Responder backed by `sink`.
    pub fn new(sink: S) -> Self {
        Self {
            sink: Arc::new(sink),
        }
    }
}

#[async_trait]
impl<S: BatchSink> CommandHandler for BatchResponder<S> {
    async fn handle(&self, ctx: RequestContext, payload: Bytes) -> nodelink_transport::Result<Reply> {
        let batch: Vec<Message> =
            serde_json::from_slice(&payload).map_err(|e| TransportError::Protocol {
                reason: format!("batch body is not a message array: {}", e),
            })?;
        debug!(counter = ctx.counter, events = batch.len(), "batch received");
        let responses = self
            .sink
            .process(batch)
            .await
            .map_err(|e| TransportError::Application {
                message: e.to_string(),
            })?;
        let body = serde_json::to_vec(&responses).map_err(|e| TransportError::Protocol {
            reason: e.to_string(),
        })?;
        Ok(Reply::ok(body))
    }
}
