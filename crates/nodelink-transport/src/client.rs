//! Client manager: keeps one outbound connection to the master alive.
//!
//! [`ClientManager::run`] loops: connect, handshake, then run the keepalive
//! loop next to exactly one main task until either ends or the connection
//! drops. The handler is then closed, which fails whatever the tasks still
//! had in flight, and the manager waits as long as its [`ReconnectPolicy`]
//! says before trying again.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Instrument};

use crate::codec::CodecConfig;
use crate::crypto::PayloadCipher;
use crate::diagnostics::{run_main_task, DiagnosticReport, MainTask};
use crate::error::{Result, TransportError};
use crate::handler::{Handler, HandlerConfig};
use crate::keepalive::{KeepAliveConfig, KeepAliveTask};
use crate::metrics::TransportMetrics;
use crate::protocol::Command;
use crate::registry::{CommandRegistry, EchoAs};
use crate::retry::{FixedDelay, ReconnectPolicy};
use crate::transport::Transport;

/// Client manager configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Name announced in `hello`.
    pub name: String,
    /// Master address, `host:port`.
    pub master_addr: String,
    /// Framing limits.
    pub codec: CodecConfig,
    /// Shared payload cipher, if the cluster uses one.
    pub cipher: Option<PayloadCipher>,
    /// Keepalive probing of the master.
    pub keepalive: KeepAliveConfig,
    /// Work run next to the keepalive loop on every connection.
    pub main_task: MainTask,
    /// Upper bound on the `hello` exchange.
    pub handshake_timeout: Duration,
}

impl ClientConfig {
    /// Defaults for a client called `name` dialing `master_addr`.
    pub fn new(name: impl Into<String>, master_addr: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            master_addr: master_addr.into(),
            codec: CodecConfig::default(),
            cipher: None,
            keepalive: KeepAliveConfig::default(),
            main_task: MainTask::Idle,
            handshake_timeout: Duration::from_secs(30),
        }
    }
}

/// Lifecycle notifications from a [`ClientManager`].
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// Handshake completed.
    Connected {
        /// Name the master answered with.
        peer: String,
    },
    /// An established connection ended.
    Disconnected {
        /// Why it closed.
        reason: String,
    },
    /// A connection attempt failed before reaching `Ready`.
    ConnectFailed {
        /// Rendered error.
        error: String,
    },
    /// The main task finished with a report.
    Diagnostic(DiagnosticReport),
}

/// Commands a client answers: the built-ins plus `echo-m` → `ok-c`.
pub fn client_registry() -> CommandRegistry {
    let mut registry = CommandRegistry::with_builtins();
    registry.register(Command::ECHO_M, EchoAs(Command::OK_C));
    registry
}

/// Drives the reconnect loop of one worker.
pub struct ClientManager {
    config: ClientConfig,
    transport: Arc<dyn Transport>,
    policy: Arc<dyn ReconnectPolicy>,
    registry: Arc<CommandRegistry>,
    metrics: Arc<TransportMetrics>,
    events: broadcast::Sender<ClientEvent>,
    current: Mutex<Option<Handler>>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for ClientManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientManager")
            .field("name", &self.config.name)
            .field("master_addr", &self.config.master_addr)
            .field("policy", &self.policy)
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl ClientManager {
    /// Manager with a 10 second fixed reconnect delay and [`client_registry`].
    pub fn new<T: Transport>(config: ClientConfig, transport: T) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            config,
            transport: Arc::new(transport),
            policy: Arc::new(FixedDelay::default()),
            registry: Arc::new(client_registry()),
            metrics: Arc::new(TransportMetrics::new()),
            events,
            current: Mutex::new(None),
            shutdown: CancellationToken::new(),
        }
    }

    /// Replaces the reconnect policy.
    pub fn with_policy<P: ReconnectPolicy>(mut self, policy: P) -> Self {
        self.policy = Arc::new(policy);
        self
    }

    /// Replaces the command table served to the master.
    pub fn with_registry(mut self, registry: CommandRegistry) -> Self {
        self.registry = Arc::new(registry);
        self
    }

    /// Shares a metrics sink with other components.
    pub fn with_metrics(mut self, metrics: Arc<TransportMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Subscribes to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    /// Handler of the live connection, if any.
    pub fn handler(&self) -> Option<Handler> {
        self.current.lock().clone()
    }

    /// True while a handshaken connection exists.
    pub fn is_connected(&self) -> bool {
        self.current
            .lock()
            .as_ref()
            .map(|h| h.is_connected())
            .unwrap_or(false)
    }

    /// Shared metrics.
    pub fn metrics(&self) -> &Arc<TransportMetrics> {
        &self.metrics
    }

    /// Configuration in use.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Stops the loop and closes the current connection.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        if let Some(handler) = self.current.lock().take() {
            handler.close("client shutting down");
        }
    }

    /// Runs until [`shutdown`](Self::shutdown) (returns `Ok`), the policy
    /// gives up (returns the last error) or a non-recoverable error occurs.
    pub async fn run(&self) -> Result<()> {
        let span = tracing::info_span!("cluster", tag = "Client Manager");
        self.reconnect_loop().instrument(span).await
    }

    async fn reconnect_loop(&self) -> Result<()> {
        let mut failures: u32 = 0;
        loop {
            if self.shutdown.is_cancelled() {
                return Ok(());
            }
            let attempt = tokio::select! {
                attempt = self.connect() => attempt,
                _ = self.shutdown.cancelled() => return Ok(()),
            };

            let last_error = match attempt {
                Ok(handler) => {
                    failures = 0;
                    let reason = self.run_session(handler).await;
                    if self.shutdown.is_cancelled() {
                        return Ok(());
                    }
                    self.metrics.inc_reconnects_total();
                    TransportError::lost(reason)
                }
                Err(e) if e.is_transport_failure() => {
                    failures = failures.saturating_add(1);
                    warn!(
                        addr = %self.config.master_addr,
                        error = %e,
                        failures,
                        "could not connect to master"
                    );
                    let _ = self.events.send(ClientEvent::ConnectFailed {
                        error: e.to_string(),
                    });
                    e
                }
                Err(e) => return Err(e),
            };

            let Some(delay) = self.policy.next_delay(failures) else {
                warn!(failures, "giving up reconnecting");
                return Err(last_error);
            };
            info!(delay_ms = delay.as_millis() as u64, "reconnecting");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.shutdown.cancelled() => return Ok(()),
            }
        }
    }

    /// Dials the master and completes the handshake.
    async fn connect(&self) -> Result<Handler> {
        let conn = self.transport.connect(&self.config.master_addr).await?;
        let mut handler_config = HandlerConfig::new(self.config.name.clone())
            .with_tag(format!("Client {}", self.config.name))
            .with_codec(self.config.codec.clone());
        if let Some(cipher) = &self.config.cipher {
            handler_config = handler_config.with_cipher(cipher.clone());
        }
        let handler = Handler::spawn(
            conn,
            handler_config,
            Arc::clone(&self.registry),
            Arc::clone(&self.metrics),
        );

        match tokio::time::timeout(self.config.handshake_timeout, handler.handshake()).await {
            Ok(Ok(peer)) => {
                info!(peer = %peer, addr = %self.config.master_addr, "connected to master");
                Ok(handler)
            }
            Ok(Err(e)) => {
                handler.close(e.to_string());
                Err(e)
            }
            Err(_) => {
                let message = format!(
                    "no hello answer within {}ms",
                    self.config.handshake_timeout.as_millis()
                );
                handler.close(message.clone());
                Err(TransportError::Handshake { message })
            }
        }
    }

    /// Runs keepalive and the main task on `handler` until the connection
    /// ends. Returns the close reason.
    async fn run_session(&self, handler: Handler) -> String {
        *self.current.lock() = Some(handler.clone());
        let _ = self.events.send(ClientEvent::Connected {
            peer: handler.peer_name().unwrap_or_default(),
        });

        let keepalive = KeepAliveTask::new(self.config.keepalive.clone());
        let main = async {
            match run_main_task(&handler, &self.config.main_task).await {
                Ok(Some(report)) => {
                    let _ = self.events.send(ClientEvent::Diagnostic(report));
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "main task failed"),
            }
            handler.closed().await;
        };

        let ended = tokio::select! {
            err = keepalive.run(&handler, Command::ECHO_C) => err.to_string(),
            _ = main => "connection closed".to_string(),
            _ = self.shutdown.cancelled() => "client shutting down".to_string(),
        };
        handler.close(ended.clone());
        let reason = handler.close_reason().unwrap_or(ended);

        {
            let mut current = self.current.lock();
            if current.as_ref().map(|h| h.same_connection(&handler)).unwrap_or(false) {
                *current = None;
            }
        }
        warn!(reason = %reason, "disconnected from master");
        let _ = self.events.send(ClientEvent::Disconnected {
            reason: reason.clone(),
        });
        reason
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::FrameCodec;
    use crate::protocol::Message;
    use crate::transport::{Connection, Listener};
    use async_trait::async_trait;
    use futures::{SinkExt, StreamExt};
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::io::DuplexStream;
    use tokio::sync::mpsc;
    use tokio_util::codec::Framed;

    type Peer = Framed<DuplexStream, FrameCodec>;

    /// Dials in-memory pipes and hands the far ends to the test.
    struct PipeTransport {
        peers: mpsc::UnboundedSender<Peer>,
        refuse: AtomicU32,
    }

    #[async_trait]
    impl Transport for PipeTransport {
        async fn connect(&self, addr: &str) -> Result<Connection> {
            if self
                .refuse
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(TransportError::ConnectionRefused {
                    addr: addr.to_string(),
                });
            }
            let (a, b) = tokio::io::duplex(1 << 16);
            let _ = self
                .peers
                .send(Framed::new(b, FrameCodec::new(CodecConfig::default(), None)));
            Ok(Connection::new(a, addr, "pipe"))
        }

        async fn listen(&self, _addr: &str) -> Result<Box<dyn Listener>> {
            Err(TransportError::Config {
                reason: "pipe transport only dials".to_string(),
            })
        }
    }

    fn manager(refuse: u32) -> (Arc<ClientManager>, mpsc::UnboundedReceiver<Peer>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = PipeTransport {
            peers: tx,
            refuse: AtomicU32::new(refuse),
        };
        let mut config = ClientConfig::new("worker-1", "master:1516");
        config.handshake_timeout = Duration::from_secs(5);
        let manager = ClientManager::new(config, transport)
            .with_policy(FixedDelay::new(Duration::from_secs(10)));
        (Arc::new(manager), rx)
    }

    /// Answers `hello` with `ok master` and returns the peer.
    async fn accept_hello(peer: &mut Peer) {
        let hello = peer.next().await.unwrap().unwrap();
        assert_eq!(hello.header.command, Command::HELLO);
        assert_eq!(hello.payload.as_ref(), b"worker-1");
        peer.send(Message::response(hello.header.counter, Command::OK, &b"master"[..]))
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_refused_connections() {
        let (manager, mut peers) = manager(2);
        let mut events = manager.subscribe();
        let m = Arc::clone(&manager);
        let run = tokio::spawn(async move { m.run().await });

        for _ in 0..2 {
            assert!(matches!(events.recv().await.unwrap(), ClientEvent::ConnectFailed { .. }));
        }
        let mut peer = peers.recv().await.unwrap();
        accept_hello(&mut peer).await;
        match events.recv().await.unwrap() {
            ClientEvent::Connected { peer } => assert_eq!(peer, "master"),
            other => panic!("unexpected {:?}", other),
        }
        assert!(manager.is_connected());

        manager.shutdown();
        run.await.unwrap().unwrap();
        assert!(!manager.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_exhaustion_reconnects_once() {
        let (manager, mut peers) = manager(0);
        let mut events = manager.subscribe();
        let m = Arc::clone(&manager);
        let run = tokio::spawn(async move { m.run().await });

        let mut silent = peers.recv().await.unwrap();
        accept_hello(&mut silent).await;
        assert!(matches!(events.recv().await.unwrap(), ClientEvent::Connected { .. }));

        // swallow keepalives without answering
        let drain = tokio::spawn(async move {
            let mut probes = 0;
            while let Some(Ok(frame)) = silent.next().await {
                assert_eq!(frame.header.command, Command::ECHO_C);
                probes += 1;
            }
            probes
        });

        match events.recv().await.unwrap() {
            ClientEvent::Disconnected { reason } => assert!(reason.contains("keepalive")),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(drain.await.unwrap(), 3);

        let mut second = peers.recv().await.unwrap();
        accept_hello(&mut second).await;
        assert!(matches!(events.recv().await.unwrap(), ClientEvent::Connected { .. }));
        let snapshot = manager.metrics().snapshot();
        assert_eq!(snapshot.reconnects_total, 1);
        assert_eq!(snapshot.keepalive_failures, 3);

        manager.shutdown();
        run.await.unwrap().unwrap();
        assert!(peers.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_policy_giving_up_ends_run() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let transport = PipeTransport {
            peers: tx,
            refuse: AtomicU32::new(u32::MAX),
        };
        let manager = ClientManager::new(ClientConfig::new("w", "m:1"), transport).with_policy(FixedDelay {
            delay: Duration::from_secs(1),
            max_attempts: Some(3),
        });
        let err = manager.run().await.unwrap_err();
        assert!(matches!(err, TransportError::ConnectionRefused { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_hello_is_retried() {
        let (manager, mut peers) = manager(0);
        let mut events = manager.subscribe();
        let m = Arc::clone(&manager);
        let run = tokio::spawn(async move { m.run().await });

        let mut peer = peers.recv().await.unwrap();
        let hello = peer.next().await.unwrap().unwrap();
        peer.send(Message::response(
            hello.header.counter,
            Command::ERR,
            &b"Error: client worker-1 already connected"[..],
        ))
        .await
        .unwrap();
        match events.recv().await.unwrap() {
            ClientEvent::ConnectFailed { error } => assert!(error.contains("already connected")),
            other => panic!("unexpected {:?}", other),
        }

        let mut peer = peers.recv().await.unwrap();
        accept_hello(&mut peer).await;
        assert!(matches!(events.recv().await.unwrap(), ClientEvent::Connected { .. }));
        manager.shutdown();
        run.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_client_answers_master_echo() {
        let (manager, mut peers) = manager(0);
        let m = Arc::clone(&manager);
        let _run = tokio::spawn(async move { m.run().await });

        let mut peer = peers.recv().await.unwrap();
        accept_hello(&mut peer).await;
        peer.send(Message::request(9, Command::ECHO_M, &b"ka"[..])).await.unwrap();
        let reply = peer.next().await.unwrap().unwrap();
        assert!(reply.header.is_response());
        assert_eq!(reply.header.command, Command::OK_C);
        assert_eq!(reply.payload.as_ref(), b"ka");
        manager.shutdown();
    }
}
