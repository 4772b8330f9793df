use anyhow::Context;
use nodelink_transport::codec::CodecConfig;
use nodelink_transport::keepalive::KeepAliveConfig;
use nodelink_transport::protocol::DEFAULT_CHUNK_SIZE;
use nodelink_transport::{PayloadCipher, TlsConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Role of this node in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    /// Accepts workers.
    Master,
    /// Connects to the master.
    Worker,
}

/// How a worker paces reconnection attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReconnectStrategy {
    /// Same delay every time.
    Fixed,
    /// Doubling delay with jitter, capped at `max_reconnect_delay_secs`.
    Exponential,
}

/// PEM files for TLS.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsPaths {
    /// CA certificate used to verify the peer.
    pub ca_cert: PathBuf,
    /// Node certificate chain.
    pub cert: Option<PathBuf>,
    /// Node private key.
    pub key: Option<PathBuf>,
    /// Master only: require workers to present a certificate.
    #[serde(default)]
    pub require_client_auth: bool,
}

/// Node configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub name: String,
    pub node_type: NodeType,
    pub masters: Vec<String>,
    pub port: u16,
    pub bind_addr: String,
    pub key: Option<String>,
    pub tls: Option<TlsPaths>,
    pub chunk_size: usize,
    pub keepalive_interval_secs: u64,
    pub keepalive_timeout_secs: u64,
    pub keepalive_max_missed: u32,
    pub reconnect_delay_secs: u64,
    pub reconnect_strategy: ReconnectStrategy,
    pub max_reconnect_delay_secs: u64,
    pub client_keepalive_timeout_secs: u64,
    pub client_check_interval_secs: u64,
    pub receive_dir: Option<PathBuf>,
    pub batch_max_elements: usize,
    pub batch_max_size: usize,
    pub batch_max_time_ms: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: String::from("node01"),
            node_type: NodeType::Master,
            masters: vec![String::from("127.0.0.1")],
            port: 1516,
            bind_addr: String::from("0.0.0.0"),
            key: None,
            tls: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
            keepalive_interval_secs: 29,
            keepalive_timeout_secs: 10,
            keepalive_max_missed: 3,
            reconnect_delay_secs: 10,
            reconnect_strategy: ReconnectStrategy::Fixed,
            max_reconnect_delay_secs: 60,
            client_keepalive_timeout_secs: 120,
            client_check_interval_secs: 60,
            receive_dir: None,
            batch_max_elements: 6,
            batch_max_size: 30_000,
            batch_max_time_ms: 5_000,
        }
    }
}

impl NodeConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: NodeConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents)?,
            "json" => serde_json::from_str(&contents)?,
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        };
        config.validate()?;
        Ok(config)
    }

    /// Reads `path` if it exists, defaults otherwise.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            Self::from_file(path)
        } else {
            tracing::warn!("Config file not found, using defaults: {}", path.display());
            Ok(Self::default())
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.name.trim().is_empty() {
            anyhow::bail!("name must not be empty");
        }
        if self.node_type == NodeType::Worker && self.masters.is_empty() {
            anyhow::bail!("a worker needs at least one master address");
        }
        if let Some(key) = &self.key {
            PayloadCipher::from_cluster_key(key).context("invalid cluster key")?;
        }
        self.codec_config().validate()?;
        if self.keepalive_max_missed == 0 {
            anyhow::bail!("keepalive_max_missed must be at least 1");
        }
        Ok(())
    }

    /// `host:port` of the first configured master.
    pub fn master_addr(&self) -> anyhow::Result<String> {
        let host = self
            .masters
            .first()
            .context("no master configured")?;
        Ok(format!("{}:{}", host, self.port))
    }

    /// Address the master listens on.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind_addr, self.port)
    }

    pub fn codec_config(&self) -> CodecConfig {
        CodecConfig {
            chunk_size: self.chunk_size,
            ..CodecConfig::default()
        }
    }

    pub fn keepalive_config(&self) -> KeepAliveConfig {
        KeepAliveConfig {
            interval: Duration::from_secs(self.keepalive_interval_secs),
            timeout: Duration::from_secs(self.keepalive_timeout_secs),
            max_missed: self.keepalive_max_missed,
            enabled: true,
        }
    }

    pub fn cipher(&self) -> anyhow::Result<Option<PayloadCipher>> {
        self.key
            .as_deref()
            .map(PayloadCipher::from_cluster_key)
            .transpose()
            .context("invalid cluster key")
    }

    pub fn tls_config(&self) -> anyhow::Result<Option<TlsConfig>> {
        let Some(paths) = &self.tls else {
            return Ok(None);
        };
        let config = TlsConfig::from_files(
            &paths.ca_cert,
            paths.cert.as_deref(),
            paths.key.as_deref(),
            paths.require_client_auth,
        )?;
        Ok(Some(config))
    }
}
