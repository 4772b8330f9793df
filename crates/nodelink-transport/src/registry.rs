//! Command dispatch table.
//!
//! Requests received from a peer are routed by command tag to a registered
//! [`CommandHandler`]. Managers populate the table at construction; the
//! [`Handler`](crate::handler::Handler) itself knows no commands.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;
use crate::handler::Handler;
use crate::protocol::Command;

/// Answer produced by a command handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Response command tag.
    pub command: Command,
    /// Response payload.
    pub payload: Bytes,
}

impl Reply {
    /// Reply with an arbitrary tag.
    pub fn new(command: Command, payload: impl Into<Bytes>) -> Self {
        Self {
            command,
            payload: payload.into(),
        }
    }

    /// Generic success reply.
    pub fn ok(payload: impl Into<Bytes>) -> Self {
        Self::new(Command::OK, payload)
    }

    /// Error reply; the peer surfaces `message` as an application error.
    pub fn error(message: impl Into<String>) -> Self {
        Self::new(Command::ERR, Bytes::from(message.into()))
    }
}

/// Per-request information handed to a command handler.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Connection the request arrived on.
    pub handler: Handler,
    /// Request counter.
    pub counter: u32,
    /// Request command tag.
    pub command: Command,
}

/// Handles one command tag.
#[async_trait]
pub trait CommandHandler: Send + Sync + 'static {
    /// Processes a request and produces the reply sent back to the peer.
    /// An `Err` is turned into an `err` reply carrying the error text.
    async fn handle(&self, ctx: RequestContext, payload: Bytes) -> Result<Reply>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> CommandHandler for FnHandler<F>
where
    F: Fn(RequestContext, Bytes) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Reply>> + Send + 'static,
{
    async fn handle(&self, ctx: RequestContext, payload: Bytes) -> Result<Reply> {
        (self.0)(ctx, payload).await
    }
}

/// `echo` → `ok` with the request payload.
#[derive(Debug, Default)]
pub struct EchoHandler;

#[async_trait]
impl CommandHandler for EchoHandler {
    async fn handle(&self, _ctx: RequestContext, payload: Bytes) -> Result<Reply> {
        Ok(Reply::ok(payload))
    }
}

/// Answers an echo with a fixed response tag, e.g. `echo-m` → `ok-c`.
#[derive(Debug)]
pub struct EchoAs(pub Command);

#[async_trait]
impl CommandHandler for EchoAs {
    async fn handle(&self, _ctx: RequestContext, payload: Bytes) -> Result<Reply> {
        Ok(Reply::new(self.0, payload))
    }
}

/// `string` → `ok` acknowledging the received length.
#[derive(Debug, Default)]
pub struct StringSink;

#[async_trait]
impl CommandHandler for StringSink {
    async fn handle(&self, ctx: RequestContext, payload: Bytes) -> Result<Reply> {
        tracing::info!(
            counter = ctx.counter,
            bytes = payload.len(),
            "received string diagnostic"
        );
        Ok(Reply::ok(format!("received {} bytes", payload.len())))
    }
}

/// Tag → handler table shared by every connection of a manager.
#[derive(Clone, Default)]
pub struct CommandRegistry {
    handlers: HashMap<Command, Arc<dyn CommandHandler>>,
}

impl std::fmt::Debug for CommandRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut tags: Vec<&str> = self.handlers.keys().map(|c| c.as_str()).collect();
        tags.sort_unstable();
        f.debug_struct("CommandRegistry").field("commands", &tags).finish()
    }
}

impl CommandRegistry {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Table with the commands every node answers: `echo` and `string`.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Command::ECHO, EchoHandler);
        registry.register(Command::STRING, StringSink);
        registry
    }

    /// Registers `handler` for `command`, replacing any previous one.
    pub fn register<H: CommandHandler>(&mut self, command: Command, handler: H) -> &mut Self {
        self.handlers.insert(command, Arc::new(handler));
        self
    }

    /// Registers an already shared handler.
    pub fn register_arc(&mut self, command: Command, handler: Arc<dyn CommandHandler>) -> &mut Self {
        self.handlers.insert(command, handler);
        self
    }

    /// Registers an async closure.
    pub fn register_fn<F, Fut>(&mut self, command: Command, f: F) -> &mut Self
    where
        F: Fn(RequestContext, Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Reply>> + Send + 'static,
    {
        self.register(command, FnHandler(f))
    }

    /// True if a handler exists for `command`.
    pub fn contains(&self, command: Command) -> bool {
        self.handlers.contains_key(&command)
    }

    /// Runs the handler for the request; never fails. Unknown tags and handler
    /// errors become `err` replies.
    pub async fn dispatch(&self, ctx: RequestContext, payload: Bytes) -> Reply {
        let command = ctx.command;
        let Some(handler) = self.handlers.get(&command).cloned() else {
            tracing::warn!(command = %command, "unknown command");
            return Reply::error(format!("unknown command '{}'", command));
        };
        match handler.handle(ctx, payload).await {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!(command = %command, error = %e, "command handler failed");
                Reply::error(format!("Error: {}", e))
            }
        }
    }
}
