//! Test Harness - a master and its workers in one process

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use nodelink_transport::{
    ClientConfig, ClientEvent, ClientManager, KeepAliveConfig, Result, ServerConfig,
    ServerManager, TcpTransport, Transport, TransportError,
};
use tempfile::TempDir;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

/// Scratch directory named after the test using it.
#[derive(Debug)]
pub struct TestEnv {
    temp_dir: TempDir,
    test_name: String,
}

impl TestEnv {
    pub fn new(test_name: &str) -> std::io::Result<Self> {
        Ok(Self {
            temp_dir: tempfile::tempdir()?,
            test_name: test_name.to_string(),
        })
    }

    pub fn tempdir(&self) -> &Path {
        self.temp_dir.path()
    }

    pub fn test_name(&self) -> &str {
        &self.test_name
    }

    /// Writes `content` to `name` inside the scratch directory.
    pub fn write_file(&self, name: &str, content: &[u8]) -> std::io::Result<PathBuf> {
        let path = self.temp_dir.path().join(name);
        std::fs::write(&path, content)?;
        Ok(path)
    }
}

/// Routes `tracing` output through the test writer; `RUST_LOG` picks the level.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A running master on an ephemeral loopback port plus the workers spawned
/// against it.
pub struct TestCluster {
    server: Arc<ServerManager>,
    addr: String,
    serving: JoinHandle<Result<()>>,
    workers: Vec<(Arc<ClientManager>, JoinHandle<Result<()>>)>,
}

impl TestCluster {
    /// Plain TCP master named `master`.
    pub async fn start() -> Result<Self> {
        Self::start_with(Self::server_config(), TcpTransport::default(), |s| s).await
    }

    /// Master config bound to `127.0.0.1:0`.
    pub fn server_config() -> ServerConfig {
        ServerConfig {
            bind_addr: "127.0.0.1:0".to_string(),
            ..ServerConfig::default()
        }
    }

    /// Master over `transport`; `customize` may register extra commands.
    pub async fn start_with<T, F>(config: ServerConfig, transport: T, customize: F) -> Result<Self>
    where
        T: Transport,
        F: FnOnce(ServerManager) -> ServerManager,
    {
        let server = Arc::new(customize(ServerManager::new(config, transport)));
        let listener = server.bind().await?;
        let addr = listener.local_addr()?;
        let serving = {
            let server = Arc::clone(&server);
            tokio::spawn(async move { server.serve(listener).await })
        };
        Ok(Self {
            server,
            addr,
            serving,
            workers: Vec::new(),
        })
    }

    pub fn server(&self) -> &Arc<ServerManager> {
        &self.server
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Worker config pointing at this master with fast keepalives.
    pub fn worker_config(&self, name: &str) -> ClientConfig {
        let mut config = ClientConfig::new(name, self.addr.clone());
        config.codec = self.server.config().codec.clone();
        config.cipher = self.server.config().cipher.clone();
        config.keepalive = KeepAliveConfig {
            interval: Duration::from_millis(200),
            timeout: Duration::from_millis(500),
            ..KeepAliveConfig::default()
        };
        config
    }

    /// Runs `manager` in the background.
    pub fn spawn_worker(&mut self, manager: ClientManager) -> Arc<ClientManager> {
        let manager = Arc::new(manager);
        let running = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.run().await })
        };
        self.workers.push((Arc::clone(&manager), running));
        manager
    }

    /// Spawns a plain TCP worker named `name` and waits for it to register.
    pub async fn add_worker(&mut self, name: &str) -> Option<Arc<ClientManager>> {
        let manager = ClientManager::new(self.worker_config(name), TcpTransport::default());
        let manager = self.spawn_worker(manager);
        if wait_connected(&manager, Duration::from_secs(5)).await {
            Some(manager)
        } else {
            None
        }
    }

    /// Polls until the master lists at least `count` clients.
    pub async fn wait_for_clients(&self, count: usize, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, async {
            while self.server.clients().len() < count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .is_ok()
    }

    /// Stops every worker, then the master. Returns the master's result.
    pub async fn stop(self) -> Result<()> {
        for (manager, running) in self.workers {
            manager.shutdown();
            let _ = running.await;
        }
        self.server.shutdown();
        match self.serving.await {
            Ok(result) => result,
            Err(e) => Err(TransportError::ConnectionLost {
                reason: e.to_string(),
            }),
        }
    }
}

/// Waits until `manager` holds a ready connection.
pub async fn wait_connected(manager: &ClientManager, timeout: Duration) -> bool {
    let mut events = manager.subscribe();
    tokio::time::timeout(timeout, async {
        while !manager.is_connected() {
            match events.recv().await {
                Ok(ClientEvent::Connected { .. }) => return true,
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => return false,
            }
        }
        true
    })
    .await
    .unwrap_or(false)
}
