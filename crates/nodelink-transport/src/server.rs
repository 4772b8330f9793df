//! Server manager: the master side of the cluster.
//!
//! Every accepted connection gets an acceptor [`Handler`] that refuses
//! application requests until the peer sent `hello`. `hello` registers the
//! peer by name; the master answers `echo-c` keepalives and periodically
//! drops clients that went silent for too long.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

use crate::codec::CodecConfig;
use crate::crypto::PayloadCipher;
use crate::error::{Result, TransportError};
use crate::file_transfer::FileReceiver;
use crate::handler::{Handler, HandlerConfig, Role};
use crate::metrics::TransportMetrics;
use crate::protocol::Command;
use crate::registry::{CommandHandler, CommandRegistry, Reply, RequestContext};
use crate::transport::{Connection, Listener, Transport};

/// Server manager configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Name returned to clients in the `hello` answer.
    pub name: String,
    /// Address [`ServerManager::run`] binds.
    pub bind_addr: String,
    /// Framing limits.
    pub codec: CodecConfig,
    /// Shared payload cipher, if the cluster uses one.
    pub cipher: Option<PayloadCipher>,
    /// Clients silent for longer than this are disconnected.
    pub client_keepalive_timeout: Duration,
    /// How often client keepalives are checked.
    pub check_interval: Duration,
    /// Connections that do not send `hello` within this are dropped.
    pub handshake_timeout: Duration,
    /// Where uploaded files land; `None` refuses uploads.
    pub receive_dir: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: "master".to_string(),
            bind_addr: "0.0.0.0:1516".to_string(),
            codec: CodecConfig::default(),
            cipher: None,
            client_keepalive_timeout: Duration::from_secs(120),
            check_interval: Duration::from_secs(60),
            handshake_timeout: Duration::from_secs(30),
            receive_dir: None,
        }
    }
}

/// One connected client as seen by the master.
#[derive(Debug, Clone, Serialize)]
pub struct ClientInfo {
    /// Name from `hello`.
    pub name: String,
    /// Remote address.
    pub addr: String,
    /// Time since the connection completed its handshake.
    pub connected_for: Duration,
    /// Time since the last `echo-c`.
    pub since_keepalive: Duration,
}

struct ClientEntry {
    handler: Handler,
    connected_at: Instant,
    last_keepalive: Instant,
}

/// Registered clients by name.
#[derive(Default)]
struct ClientTable {
    entries: Mutex<HashMap<String, ClientEntry>>,
}

impl ClientTable {
    /// Registers `handler` as `name` and marks it ready. Refused when a live
    /// client already uses `name` or `handler` is registered under another
    /// name. Both checks and the registration happen under the table lock.
    fn register(&self, name: &str, handler: &Handler) -> std::result::Result<(), String> {
        let mut entries = self.entries.lock();
        if let Some(current) = handler.peer_name() {
            return Err(format!("Error: connection already registered as {}", current));
        }
        if let Some(existing) = entries.get(name) {
            if existing.handler.is_connected() {
                return Err(format!("Error: client {} already connected", name));
            }
        }
        let now = Instant::now();
        entries.insert(
            name.to_string(),
            ClientEntry {
                handler: handler.clone(),
                connected_at: now,
                last_keepalive: now,
            },
        );
        handler.mark_ready(name);
        Ok(())
    }

    /// Removes `name` only if it still refers to `handler`'s connection.
    fn remove(&self, name: &str, handler: &Handler) -> bool {
        let mut entries = self.entries.lock();
        match entries.get(name) {
            Some(entry) if entry.handler.same_connection(handler) => {
                entries.remove(name);
                true
            }
            _ => false,
        }
    }

    fn touch(&self, name: &str) {
        if let Some(entry) = self.entries.lock().get_mut(name) {
            entry.last_keepalive = Instant::now();
        }
    }

    fn get(&self, name: &str) -> Option<Handler> {
        self.entries.lock().get(name).map(|e| e.handler.clone())
    }

    /// Removes and returns clients silent for longer than `timeout`.
    fn expire(&self, timeout: Duration) -> Vec<(String, Handler)> {
        let mut entries = self.entries.lock();
        let stale: Vec<String> = entries
            .iter()
            .filter(|(_, e)| e.last_keepalive.elapsed() > timeout)
            .map(|(name, _)| name.clone())
            .collect();
        stale
            .into_iter()
            .filter_map(|name| entries.remove(&name).map(|e| (name, e.handler)))
            .collect()
    }

    fn snapshot(&self) -> Vec<ClientInfo> {
        let mut infos: Vec<ClientInfo> = self
            .entries
            .lock()
            .iter()
            .map(|(name, e)| ClientInfo {
                name: name.clone(),
                addr: e.handler.peer_addr().to_string(),
                connected_for: e.connected_at.elapsed(),
                since_keepalive: e.last_keepalive.elapsed(),
            })
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    fn drain(&self) -> Vec<Handler> {
        self.entries.lock().drain().map(|(_, e)| e.handler).collect()
    }
}

/// `hello`: registers the client or refuses a duplicate name.
struct HelloHandler {
    master_name: String,
    clients: Arc<ClientTable>,
}

#[async_trait]
impl CommandHandler for HelloHandler {
    async fn handle(&self, ctx: RequestContext, payload: Bytes) -> Result<Reply> {
        let name = String::from_utf8_lossy(&payload).trim().to_string();
        if name.is_empty() {
            return Ok(Reply::error("Error: empty client name"));
        }
        if let Err(message) = self.clients.register(&name, &ctx.handler) {
            warn!(client = %name, addr = ctx.handler.peer_addr(), reason = %message, "hello refused");
            return Ok(Reply::error(message));
        }
        info!(client = %name, addr = ctx.handler.peer_addr(), "client connected");

        let clients = Arc::clone(&self.clients);
        let handler = ctx.handler.clone();
        tokio::spawn(async move {
            handler.closed().await;
            if clients.remove(&name, &handler) {
                info!(
                    client = %name,
                    reason = handler.close_reason().as_deref().unwrap_or("closed"),
                    "client disconnected"
                );
            }
        });
        Ok(Reply::ok(self.master_name.clone()))
    }
}

/// `echo-c`: client keepalive, answered with `ok-m`.
struct ClientKeepalive {
    clients: Arc<ClientTable>,
}

#[async_trait]
impl CommandHandler for ClientKeepalive {
    async fn handle(&self, ctx: RequestContext, payload: Bytes) -> Result<Reply> {
        if let Some(name) = ctx.handler.peer_name() {
            self.clients.touch(&name);
            debug!(client = %name, "keepalive");
        }
        Ok(Reply::new(Command::OK_M, payload))
    }
}

/// Accepts worker connections and tracks them by name.
pub struct ServerManager {
    config: ServerConfig,
    transport: Arc<dyn Transport>,
    registry: Arc<CommandRegistry>,
    metrics: Arc<TransportMetrics>,
    clients: Arc<ClientTable>,
    accepted: Mutex<Vec<Handler>>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for ServerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerManager")
            .field("name", &self.config.name)
            .field("bind_addr", &self.config.bind_addr)
            .field("registry", &self.registry)
            .field("clients", &self.clients.entries.lock().len())
            .finish()
    }
}

impl ServerManager {
    /// Master answering `hello`, `echo-c`, `echo`, `string` and, when a
    /// receive directory is configured, `file`.
    pub fn new<T: Transport>(config: ServerConfig, transport: T) -> Self {
        let clients = Arc::new(ClientTable::default());
        let mut registry = CommandRegistry::with_builtins();
        registry.register(
            Command::HELLO,
            HelloHandler {
                master_name: config.name.clone(),
                clients: Arc::clone(&clients),
            },
        );
        registry.register(
            Command::ECHO_C,
            ClientKeepalive {
                clients: Arc::clone(&clients),
            },
        );
        if let Some(dir) = &config.receive_dir {
            registry.register(Command::FILE, FileReceiver::new(dir));
        }
        Self {
            config,
            transport: Arc::new(transport),
            registry: Arc::new(registry),
            metrics: Arc::new(TransportMetrics::new()),
            clients,
            accepted: Mutex::new(Vec::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Adds or replaces a command served to clients.
    pub fn with_command<H: CommandHandler>(mut self, command: Command, handler: H) -> Self {
        Arc::make_mut(&mut self.registry).register(command, handler);
        self
    }

    /// Shares a metrics sink with other components.
    pub fn with_metrics(mut self, metrics: Arc<TransportMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Shared metrics.
    pub fn metrics(&self) -> &Arc<TransportMetrics> {
        &self.metrics
    }

    /// Configuration in use.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Binds the configured address.
    pub async fn bind(&self) -> Result<Box<dyn Listener>> {
        self.transport.listen(&self.config.bind_addr).await
    }

    /// Binds and serves until [`shutdown`](Self::shutdown).
    pub async fn run(&self) -> Result<()> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Serves connections from `listener` until [`shutdown`](Self::shutdown).
    pub async fn serve(&self, listener: Box<dyn Listener>) -> Result<()> {
        let span = tracing::info_span!("cluster", tag = "Master");
        self.accept_loop(listener).instrument(span).await
    }

    async fn accept_loop(&self, listener: Box<dyn Listener>) -> Result<()> {
        info!(addr = %listener.local_addr()?, name = %self.config.name, "master listening");
        let start = tokio::time::Instant::now() + self.config.check_interval;
        let mut check = tokio::time::interval_at(start, self.config.check_interval);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = check.tick() => self.check_keepalives(),
                accepted = listener.accept() => match accepted {
                    Ok(conn) => self.adopt(conn),
                    Err(TransportError::IoError(e)) => {
                        self.metrics.inc_errors_total();
                        warn!(error = %e, "accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                    Err(e) => {
                        self.metrics.inc_errors_total();
                        warn!(error = %e, "rejected incoming connection");
                    }
                },
            }
        }

        let mut closing = self.clients.drain();
        closing.append(&mut self.accepted.lock());
        for handler in &closing {
            handler.close("master shutting down");
        }
        info!(closed = closing.len(), "master stopped");
        Ok(())
    }

    fn adopt(&self, conn: Connection) {
        let mut config = HandlerConfig::new(self.config.name.clone())
            .with_role(Role::Acceptor)
            .with_tag("Master")
            .with_codec(self.config.codec.clone());
        if let Some(cipher) = &self.config.cipher {
            config = config.with_cipher(cipher.clone());
        }
        let peer = conn.peer_addr.clone();
        let handler = Handler::spawn(
            conn,
            config,
            Arc::clone(&self.registry),
            Arc::clone(&self.metrics),
        );
        debug!(peer = %peer, "accepted connection");

        let timeout = self.config.handshake_timeout;
        let watchdog = handler.clone();
        tokio::spawn(async move {
            if tokio::time::timeout(timeout, watchdog.ready()).await.is_err() {
                warn!(peer = %watchdog.peer_addr(), "no hello received, closing");
                watchdog.close(format!("no hello within {}ms", timeout.as_millis()));
            }
        });

        let mut accepted = self.accepted.lock();
        accepted.retain(|h| h.is_connected());
        accepted.push(handler);
    }

    /// Closes clients whose last keepalive is older than the limit.
    pub fn check_keepalives(&self) {
        for (name, handler) in self.clients.expire(self.config.client_keepalive_timeout) {
            warn!(
                client = %name,
                timeout_secs = self.config.client_keepalive_timeout.as_secs(),
                "no keepalive from client, disconnecting"
            );
            self.metrics.inc_keepalive_failures();
            handler.close("keepalive timeout");
        }
    }

    /// Connected clients, sorted by name.
    pub fn clients(&self) -> Vec<ClientInfo> {
        self.clients.snapshot()
    }

    /// Handler of the client registered as `name`.
    pub fn client(&self, name: &str) -> Option<Handler> {
        self.clients.get(name)
    }

    /// Sends a request to the client registered as `name`.
    pub async fn send_to(&self, name: &str, command: Command, data: impl Into<Bytes>) -> Result<Bytes> {
        let handler = self.client(name).ok_or_else(|| TransportError::UnknownPeer {
            name: name.to_string(),
        })?;
        handler.send_request(command, data).await
    }

    /// Stops accepting and closes every connection.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::ConnectionState;
    use crate::protocol::Message;
    use crate::tcp::TcpTransport;
    use futures::{SinkExt, StreamExt};

    async fn start(config: ServerConfig) -> (Arc<ServerManager>, String) {
        let server = Arc::new(ServerManager::new(config, TcpTransport::default()));
        let listener = TcpTransport::default().listen("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let s = Arc::clone(&server);
        tokio::spawn(async move { s.serve(listener).await });
        (server, addr)
    }

    async fn worker(addr: &str, name: &str) -> Handler {
        let conn = TcpTransport::default().connect(addr).await.unwrap();
        let handler = Handler::spawn(
            conn,
            HandlerConfig::new(name),
            Arc::new(crate::client::client_registry()),
            Arc::new(TransportMetrics::new()),
        );
        handler.handshake().await.unwrap();
        handler
    }

    #[tokio::test]
    async fn test_hello_registers_client() {
        let (server, addr) = start(ServerConfig::default()).await;
        let w = worker(&addr, "worker-1").await;
        assert_eq!(w.peer_name().as_deref(), Some("master"));

        let clients = server.clients();
        assert_eq!(clients.len(), 1);
        assert_eq!(clients[0].name, "worker-1");

        let echoed = w.call(Command::ECHO_C, &b"ka"[..]).await.unwrap();
        assert_eq!(echoed, (Command::OK_M, Bytes::from_static(b"ka")));
        server.shutdown();
    }

    #[tokio::test]
    async fn test_duplicate_name_rejected() {
        let (server, addr) = start(ServerConfig::default()).await;
        let _first = worker(&addr, "worker-1").await;

        let conn = TcpTransport::default().connect(&addr).await.unwrap();
        let second = Handler::spawn(
            conn,
            HandlerConfig::new("worker-1"),
            Arc::new(CommandRegistry::new()),
            Arc::new(TransportMetrics::new()),
        );
        match second.handshake().await {
            Err(TransportError::Handshake { message }) => {
                assert!(message.starts_with("Error"));
                assert!(message.contains("already connected"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(second.state(), ConnectionState::Disconnected);
        assert_eq!(server.clients().len(), 1);
        server.shutdown();
    }

    #[tokio::test]
    async fn test_disconnected_client_is_removed_and_name_reusable() {
        let (server, addr) = start(ServerConfig::default()).await;
        let w = worker(&addr, "worker-1").await;
        w.close("bye");
        for _ in 0..100 {
            if server.clients().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(server.clients().is_empty());
        let again = worker(&addr, "worker-1").await;
        assert!(again.is_connected());
        server.shutdown();
    }

    #[tokio::test]
    async fn test_pipelined_hellos_register_once() {
        let (server, addr) = start(ServerConfig::default()).await;
        let conn = TcpTransport::default().connect(&addr).await.unwrap();
        let mut raw = tokio_util::codec::Framed::new(
            conn.stream,
            crate::codec::FrameCodec::new(CodecConfig::default(), None),
        );
        raw.feed(Message::request(1, Command::HELLO, &b"worker-a"[..])).await.unwrap();
        raw.feed(Message::request(2, Command::HELLO, &b"worker-b"[..])).await.unwrap();
        raw.flush().await.unwrap();

        let mut accepted = 0;
        let mut refused = 0;
        for _ in 0..2 {
            let reply = raw.next().await.unwrap().unwrap();
            if reply.header.command == Command::ERR {
                assert!(String::from_utf8_lossy(&reply.payload).contains("already registered"));
                refused += 1;
            } else {
                accepted += 1;
            }
        }
        assert_eq!((accepted, refused), (1, 1));
        assert_eq!(server.clients().len(), 1);
        server.shutdown();
    }

    #[tokio::test]
    async fn test_send_to_client() {
        let (server, addr) = start(ServerConfig::default()).await;
        let _w = worker(&addr, "worker-1").await;
        let reply = server.send_to("worker-1", Command::ECHO_M, &b"ping"[..]).await.unwrap();
        assert_eq!(reply.as_ref(), b"ping");

        let err = server.send_to("nobody", Command::ECHO_M, &b"x"[..]).await.unwrap_err();
        assert!(matches!(err, TransportError::UnknownPeer { .. }));
        server.shutdown();
    }

    #[tokio::test]
    async fn test_request_before_hello_refused() {
        let (server, addr) = start(ServerConfig::default()).await;
        let conn = TcpTransport::default().connect(&addr).await.unwrap();
        let mut raw = tokio_util::codec::Framed::new(
            conn.stream,
            crate::codec::FrameCodec::new(CodecConfig::default(), None),
        );
        raw.send(Message::request(5, Command::ECHO_C, &b"ka"[..])).await.unwrap();
        let reply = raw.next().await.unwrap().unwrap();
        assert_eq!(reply.header.command, Command::ERR);
        assert!(server.clients().is_empty());
        server.shutdown();
    }

    #[tokio::test]
    async fn test_silent_client_expired() {
        let config = ServerConfig {
            client_keepalive_timeout: Duration::from_millis(50),
            check_interval: Duration::from_millis(20),
            ..Default::default()
        };
        let (server, addr) = start(config).await;
        let w = worker(&addr, "worker-1").await;
        tokio::time::timeout(Duration::from_secs(5), w.closed())
            .await
            .unwrap();
        assert!(server.clients().is_empty());
        assert!(server.metrics().snapshot().keepalive_failures >= 1);
        server.shutdown();
    }

    #[tokio::test]
    async fn test_shutdown_closes_clients() {
        let (server, addr) = start(ServerConfig::default()).await;
        let w = worker(&addr, "worker-1").await;
        server.shutdown();
        tokio::time::timeout(Duration::from_secs(5), w.closed())
            .await
            .unwrap();
    }
}
