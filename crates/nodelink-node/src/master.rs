use crate::config::NodeConfig;
use anyhow::{Context, Result};
use nodelink_batcher::{BatchResponder, EchoSink};
use nodelink_transport::{
    Command, ServerConfig, ServerManager, TcpTransport, TcpTransportConfig, TlsTcpTransport,
};
use std::sync::Arc;
use std::time::Duration;

pub fn server_config(config: &NodeConfig) -> Result<ServerConfig> {
    Ok(ServerConfig {
        name: config.name.clone(),
        bind_addr: config.listen_addr(),
        codec: config.codec_config(),
        cipher: config.cipher()?,
        client_keepalive_timeout: Duration::from_secs(config.client_keepalive_timeout_secs),
        check_interval: Duration::from_secs(config.client_check_interval_secs),
        receive_dir: config.receive_dir.clone(),
        ..ServerConfig::default()
    })
}

/// Master over TCP, or TLS when PEM paths are configured. Serves `batch`
/// by echoing every event.
pub fn build_server(config: &NodeConfig) -> Result<ServerManager> {
    let server_config = server_config(config)?;
    let tcp = TcpTransportConfig::default();
    let server = match config.tls_config()? {
        Some(tls) => ServerManager::new(server_config, TlsTcpTransport::new(tcp, tls)),
        None => ServerManager::new(server_config, TcpTransport::new(tcp)),
    };
    Ok(server.with_command(Command::BATCH, BatchResponder::new(EchoSink)))
}

pub async fn run_master(config: NodeConfig) -> Result<()> {
    let server = Arc::new(build_server(&config)?);
    let listener = server
        .bind()
        .await
        .with_context(|| format!("binding {}", config.listen_addr()))?;

    let stopper = Arc::clone(&server);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, stopping master");
            stopper.shutdown();
        }
    });

    server.serve(listener).await?;
    let metrics = server.metrics().snapshot();
    tracing::info!(
        requests_received = metrics.requests_received,
        connections_opened = metrics.connections_opened,
        "master finished"
    );
    Ok(())
}
