//! Connection protocol engine.
//!
//! A [`Handler`] owns one established stream. A background read task decodes
//! frames, reassembles chunked messages and routes them: responses resolve the
//! matching pending request, requests are dispatched through the
//! [`CommandRegistry`] on their own tasks so a slow command never stalls the
//! read loop. Any read or write failure, protocol violation or explicit
//! [`close`](Handler::close) moves the handler to `Disconnected` and fails every
//! outstanding request with `ConnectionLost`.

use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{oneshot, watch, Mutex as AsyncMutex};
use tokio::task::JoinSet;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

use crate::codec::{ChunkSpec, CodecConfig, FrameCodec, Reassembler};
use crate::crypto::PayloadCipher;
use crate::error::{Result, TransportError};
use crate::metrics::TransportMetrics;
use crate::pending::{Outcome, PendingTable};
use crate::protocol::{Command, Message, FRAME_HEADER_SIZE};
use crate::registry::{CommandRegistry, Reply, RequestContext};
use crate::transport::{BoxedStream, Connection};

static NEXT_HANDLER_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Closed; terminal for this handler.
    Disconnected,
    /// Stream established, handshake not started.
    Connecting,
    /// `hello` exchange in progress.
    Handshaking,
    /// Handshake done; application requests are accepted.
    Ready,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Handshaking => "handshaking",
            ConnectionState::Ready => "ready",
        };
        f.write_str(s)
    }
}

/// Which side of the handshake this handler plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Sends `hello` (client, worker).
    Initiator,
    /// Waits for `hello` and refuses other requests until then (master).
    Acceptor,
}

/// Per-connection settings.
#[derive(Debug, Clone)]
pub struct HandlerConfig {
    /// Local identity sent in `hello`.
    pub name: String,
    /// Log tag of the `cluster` span wrapping this connection.
    pub tag: String,
    /// Handshake side.
    pub role: Role,
    /// Framing limits.
    pub codec: CodecConfig,
    /// Payload cipher; `None` sends plaintext.
    pub cipher: Option<PayloadCipher>,
}

impl HandlerConfig {
    /// Initiator config with default framing and no cipher.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            tag: name.clone(),
            name,
            role: Role::Initiator,
            codec: CodecConfig::default(),
            cipher: None,
        }
    }

    /// Sets the log tag.
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = tag.into();
        self
    }

    /// Sets the handshake side.
    pub fn with_role(mut self, role: Role) -> Self {
        self.role = role;
        self
    }

    /// Sets framing limits.
    pub fn with_codec(mut self, codec: CodecConfig) -> Self {
        self.codec = codec;
        self
    }

    /// Enables payload encryption.
    pub fn with_cipher(mut self, cipher: PayloadCipher) -> Self {
        self.cipher = Some(cipher);
        self
    }
}

struct Inner {
    id: u64,
    config: HandlerConfig,
    peer_addr: String,
    peer_name: Mutex<Option<String>>,
    counter: AtomicU32,
    pending: PendingTable,
    encoder: FrameCodec,
    writer: AsyncMutex<Option<WriteHalf<BoxedStream>>>,
    registry: Arc<CommandRegistry>,
    state: watch::Sender<ConnectionState>,
    shutdown: CancellationToken,
    close_reason: Mutex<Option<String>>,
    metrics: Arc<TransportMetrics>,
    span: tracing::Span,
}

/// Cheaply clonable handle to one connection.
#[derive(Clone)]
pub struct Handler {
    inner: Arc<Inner>,
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handler")
            .field("id", &self.inner.id)
            .field("name", &self.inner.config.name)
            .field("peer_addr", &self.inner.peer_addr)
            .field("state", &self.state())
            .field("pending", &self.inner.pending.len())
            .finish()
    }
}

/// A registered request awaiting its response. Dropping it forgets the
/// pending entry, so abandoned or timed-out calls never leak.
pub(crate) struct InFlight {
    handler: Handler,
    id: u32,
    rx: Option<oneshot::Receiver<Outcome>>,
}

impl InFlight {
    pub(crate) fn id(&self) -> u32 {
        self.id
    }

    pub(crate) async fn wait(mut self, timeout: Option<Duration>) -> Result<(Command, Bytes)> {
        let Some(rx) = self.rx.take() else {
            return Err(TransportError::protocol("request already awaited"));
        };
        let received = match timeout {
            None => rx.await,
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(received) => received,
                Err(_) => {
                    self.handler.inner.metrics.inc_timeouts_total();
                    return Err(TransportError::RequestTimeout {
                        counter: self.id,
                        timeout_ms: limit.as_millis() as u64,
                    });
                }
            },
        };
        received.unwrap_or_else(|_| Err(TransportError::lost("request slot dropped")))
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.handler.inner.pending.cancel(self.id);
    }
}

impl Handler {
    /// Takes ownership of an established connection and starts its read task.
    /// Initiators start in `Connecting`, acceptors in `Handshaking`.
    pub fn spawn(
        conn: Connection,
        config: HandlerConfig,
        registry: Arc<CommandRegistry>,
        metrics: Arc<TransportMetrics>,
    ) -> Handler {
        let (read_half, write_half) = tokio::io::split(conn.stream);
        let initial = match config.role {
            Role::Initiator => ConnectionState::Connecting,
            Role::Acceptor => ConnectionState::Handshaking,
        };
        let (state, _) = watch::channel(initial);
        let span = tracing::info_span!("cluster", tag = %config.tag, peer = %conn.peer_addr);
        let codec = FrameCodec::new(config.codec.clone(), config.cipher.clone());

        let handler = Handler {
            inner: Arc::new(Inner {
                id: NEXT_HANDLER_ID.fetch_add(1, Ordering::Relaxed),
                peer_addr: conn.peer_addr,
                peer_name: Mutex::new(None),
                counter: AtomicU32::new(rand::random()),
                pending: PendingTable::new(),
                encoder: codec.clone(),
                writer: AsyncMutex::new(Some(write_half)),
                registry,
                state,
                shutdown: CancellationToken::new(),
                close_reason: Mutex::new(None),
                metrics,
                span: span.clone(),
                config,
            }),
        };
        handler.inner.metrics.connection_opened();
        debug!(parent: &span, "connection established");

        let reader = FramedRead::new(read_half, codec);
        tokio::spawn(handler.clone().read_loop(reader).instrument(span));
        handler
    }

    async fn read_loop(self, mut reader: FramedRead<ReadHalf<BoxedStream>, FrameCodec>) {
        let mut reassembler = Reassembler::new(self.inner.encoder.config());
        let mut tasks: JoinSet<()> = JoinSet::new();

        let reason = loop {
            tokio::select! {
                _ = self.inner.shutdown.cancelled() => {
                    break self.close_reason().unwrap_or_else(|| "closed locally".to_string());
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            warn!("command handler panicked");
                        }
                    }
                }
                next = reader.next() => match next {
                    None => break "connection closed by peer".to_string(),
                    Some(Err(e)) => {
                        self.inner.metrics.inc_errors_total();
                        warn!(error = %e, "read failed");
                        break e.to_string();
                    }
                    Some(Ok(frame)) => {
                        let wire = FRAME_HEADER_SIZE as u64 + frame.header.payload_len as u64;
                        self.inner.metrics.record_frames_received(1, wire);
                        match reassembler.push(frame) {
                            Ok(Some(message)) => self.route(message, &mut tasks),
                            Ok(None) => {}
                            Err(e) => {
                                self.inner.metrics.inc_errors_total();
                                warn!(error = %e, "dropping connection on malformed message");
                                break e.to_string();
                            }
                        }
                    }
                },
            }
        };

        tasks.abort_all();
        reassembler.clear();
        drop(reader);
        self.close(reason.clone());
        let sink = self.inner.writer.lock().await.take();
        if let Some(mut sink) = sink {
            let _ = tokio::time::timeout(Duration::from_secs(1), sink.shutdown()).await;
        }
        self.inner.metrics.connection_closed();
        info!(reason = %reason, "connection closed");
    }

    fn route(&self, message: Message, tasks: &mut JoinSet<()>) {
        if message.response {
            self.process_response(message);
            return;
        }
        self.inner.metrics.inc_requests_received();
        let handler = self.clone();
        tasks.spawn(
            async move { handler.answer(message).await }.instrument(self.inner.span.clone()),
        );
    }

    async fn answer(&self, message: Message) {
        let counter = message.counter;
        let reply = self
            .process_request(counter, message.command, message.payload)
            .await;
        let response = Message::response(counter, reply.command, reply.payload);
        match self.write_message(&response).await {
            Ok(()) => self.inner.metrics.inc_responses_sent(),
            Err(e) => warn!(counter, error = %e, "failed to send response"),
        }
    }

    /// Computes the reply to a request issued by the peer. Unknown commands
    /// and failing handlers yield an `err` reply; this never fails.
    pub async fn process_request(&self, counter: u32, command: Command, payload: Bytes) -> Reply {
        if self.inner.config.role == Role::Acceptor
            && command != Command::HELLO
            && self.state() != ConnectionState::Ready
        {
            return Reply::error(format!("Error: '{}' received before hello", command));
        }
        debug!(counter, command = %command, bytes = payload.len(), "processing request");
        let ctx = RequestContext {
            handler: self.clone(),
            counter,
            command,
        };
        self.inner.registry.dispatch(ctx, payload).await
    }

    /// Resolves the pending request matching a response. An `err` tag resolves
    /// it with an `Application` error. Returns false for unknown counters.
    pub fn process_response(&self, message: Message) -> bool {
        let outcome = if message.command.is_error() {
            self.inner.metrics.inc_application_errors();
            Err(TransportError::Application {
                message: String::from_utf8_lossy(&message.payload).into_owned(),
            })
        } else {
            Ok((message.command, message.payload))
        };
        if self.inner.pending.resolve(message.counter, outcome) {
            self.inner.metrics.inc_responses_received();
            true
        } else {
            warn!(counter = message.counter, command = %message.command, "response for unknown request");
            false
        }
    }

    /// Sends a request and waits for its response payload. Only accepted in
    /// `Ready`. Fails with `Application` when the peer answers `err` and with
    /// `ConnectionLost` when the connection drops first.
    pub async fn send_request(&self, command: Command, data: impl Into<Bytes>) -> Result<Bytes> {
        self.ensure_ready()?;
        let (_, payload) = self.exchange(command, data.into(), None).await?;
        Ok(payload)
    }

    /// Like [`send_request`](Self::send_request) but also returns the response tag.
    pub async fn call(&self, command: Command, data: impl Into<Bytes>) -> Result<(Command, Bytes)> {
        self.ensure_ready()?;
        self.exchange(command, data.into(), None).await
    }

    /// [`send_request`](Self::send_request) bounded by `timeout`; the pending
    /// entry is removed when the deadline passes.
    pub async fn send_request_timeout(
        &self,
        command: Command,
        data: impl Into<Bytes>,
        timeout: Duration,
    ) -> Result<Bytes> {
        self.ensure_ready()?;
        let (_, payload) = self.exchange(command, data.into(), Some(timeout)).await?;
        Ok(payload)
    }

    /// Sends a `size`-byte string diagnostic; returns the peer's acknowledgement.
    pub async fn send_string(&self, size: usize) -> Result<Bytes> {
        self.send_request(Command::STRING, vec![b'a'; size]).await
    }

    async fn exchange(
        &self,
        command: Command,
        payload: Bytes,
        timeout: Option<Duration>,
    ) -> Result<(Command, Bytes)> {
        let request = self.start_request(command)?;
        self.write_message(&Message::request(request.id(), command, payload))
            .await?;
        self.inner.metrics.inc_requests_sent();
        request.wait(timeout).await
    }

    /// Allocates the next free counter and registers it.
    pub(crate) fn start_request(&self, command: Command) -> Result<InFlight> {
        loop {
            let id = self.inner.counter.fetch_add(1, Ordering::Relaxed);
            match self.inner.pending.register(id, command) {
                Ok(rx) => {
                    return Ok(InFlight {
                        handler: self.clone(),
                        id,
                        rx: Some(rx),
                    })
                }
                Err(TransportError::Protocol { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Sends `hello` with the local name and waits for the peer to accept.
    /// A reply starting with `Error` (or an `err` tag) closes the connection
    /// and fails with `Handshake`. Returns the peer's name.
    pub async fn handshake(&self) -> Result<String> {
        if !self.transition(ConnectionState::Handshaking) && !self.is_state(ConnectionState::Handshaking) {
            return Err(self.lost_error());
        }
        let hello = Bytes::from(self.inner.config.name.clone());
        let payload = match self.exchange(Command::HELLO, hello, None).await {
            Ok((_, payload)) => payload,
            Err(TransportError::Application { message }) => return Err(self.reject(message)),
            Err(e) => return Err(e),
        };
        if payload.starts_with(b"Error") {
            return Err(self.reject(String::from_utf8_lossy(&payload).into_owned()));
        }
        let peer = String::from_utf8_lossy(&payload).into_owned();
        self.mark_ready(peer.clone());
        info!(parent: &self.inner.span, peer = %peer, "handshake complete");
        Ok(peer)
    }

    fn reject(&self, message: String) -> TransportError {
        warn!(parent: &self.inner.span, message = %message, "handshake rejected");
        self.close(format!("handshake rejected: {}", message));
        TransportError::Handshake { message }
    }

    /// Records the peer's name and enters `Ready`. No-op once disconnected.
    pub fn mark_ready(&self, peer_name: impl Into<String>) {
        *self.inner.peer_name.lock() = Some(peer_name.into());
        self.transition(ConnectionState::Ready);
    }

    fn transition(&self, next: ConnectionState) -> bool {
        self.inner.state.send_if_modified(|current| {
            if *current == ConnectionState::Disconnected || *current == next {
                false
            } else {
                *current = next;
                true
            }
        })
    }

    pub(crate) fn ensure_ready(&self) -> Result<()> {
        match self.state() {
            ConnectionState::Ready => Ok(()),
            ConnectionState::Disconnected => Err(self.lost_error()),
            other => Err(TransportError::NotReady {
                state: other.to_string(),
            }),
        }
    }

    fn lost_error(&self) -> TransportError {
        TransportError::lost(
            self.close_reason()
                .unwrap_or_else(|| "connection closed".to_string()),
        )
    }

    /// Closes the connection. Every pending request fails with
    /// `ConnectionLost` carrying `reason`; later calls are no-ops.
    pub fn close(&self, reason: impl Into<String>) {
        let reason = reason.into();
        {
            let mut slot = self.inner.close_reason.lock();
            if slot.is_some() {
                return;
            }
            *slot = Some(reason.clone());
        }
        self.inner.shutdown.cancel();
        let failed = self.inner.pending.fail_all(&reason);
        if failed > 0 {
            warn!(parent: &self.inner.span, failed, reason = %reason, "failed pending requests");
        }
        self.inner.state.send_replace(ConnectionState::Disconnected);
    }

    /// Resolves once the handler is `Disconnected`.
    pub async fn closed(&self) {
        let mut rx = self.inner.state.subscribe();
        let _ = rx
            .wait_for(|s| *s == ConnectionState::Disconnected)
            .await;
    }

    /// Waits until the handshake finished; fails if the connection closes first.
    pub async fn ready(&self) -> Result<()> {
        let mut rx = self.inner.state.subscribe();
        let reached = rx
            .wait_for(|s| matches!(s, ConnectionState::Ready | ConnectionState::Disconnected))
            .await
            .map(|s| *s);
        match reached {
            Ok(ConnectionState::Ready) => Ok(()),
            _ => Err(self.lost_error()),
        }
    }

    pub(crate) async fn write_message(&self, message: &Message) -> Result<()> {
        let mut buf = BytesMut::new();
        self.inner.encoder.encode_message(message, &mut buf)?;
        let frames = self.inner.encoder.chunk_count(message.payload.len())?;
        self.write_bytes(&buf, frames as u64).await
    }

    pub(crate) async fn write_chunk(&self, spec: ChunkSpec, piece: &[u8]) -> Result<()> {
        let mut buf = BytesMut::new();
        self.inner.encoder.encode_chunk(spec, piece, &mut buf)?;
        self.write_bytes(&buf, 1).await
    }

    async fn write_bytes(&self, bytes: &[u8], frames: u64) -> Result<()> {
        let write = async {
            let mut guard = self.inner.writer.lock().await;
            let sink = guard.as_mut().ok_or_else(|| self.lost_error())?;
            sink.write_all(bytes).await?;
            sink.flush().await?;
            Ok::<(), TransportError>(())
        };
        let result = tokio::select! {
            r = write => r,
            _ = self.inner.shutdown.cancelled() => Err(self.lost_error()),
        };
        match result {
            Ok(()) => {
                self.inner.metrics.record_frames_sent(frames, bytes.len() as u64);
                Ok(())
            }
            Err(e) if e.is_connection_lost() => Err(e),
            Err(e) => {
                self.inner.metrics.inc_errors_total();
                let reason = format!("write failed: {}", e);
                self.close(reason.clone());
                Err(TransportError::lost(reason))
            }
        }
    }

    pub(crate) fn codec(&self) -> &FrameCodec {
        &self.inner.encoder
    }

    pub(crate) fn span(&self) -> &tracing::Span {
        &self.inner.span
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    fn is_state(&self, state: ConnectionState) -> bool {
        self.state() == state
    }

    /// Subscribes to state changes.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// True while the connection is usable.
    pub fn is_connected(&self) -> bool {
        self.state() != ConnectionState::Disconnected
    }

    /// Why the connection closed, once it has.
    pub fn close_reason(&self) -> Option<String> {
        self.inner.close_reason.lock().clone()
    }

    /// Local identity.
    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    /// Name the peer declared during the handshake.
    pub fn peer_name(&self) -> Option<String> {
        self.inner.peer_name.lock().clone()
    }

    /// Remote address.
    pub fn peer_addr(&self) -> &str {
        &self.inner.peer_addr
    }

    /// Number of requests awaiting a response.
    pub fn pending_requests(&self) -> usize {
        self.inner.pending.len()
    }

    /// Shared metrics sink.
    pub fn metrics(&self) -> &Arc<TransportMetrics> {
        &self.inner.metrics
    }

    /// True if both handles refer to the same connection.
    pub fn same_connection(&self, other: &Handler) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}
