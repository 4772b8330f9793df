use crate::config::{NodeConfig, ReconnectStrategy};
use anyhow::Result;
use nodelink_batcher::{Batcher, BatcherClient, BatcherConfig, HandlerSink, MuxDemuxQueue};
use nodelink_transport::{
    ClientConfig, ClientEvent, ClientManager, ExponentialBackoff, FixedDelay, MainTask,
    TcpTransport, TcpTransportConfig, TlsTcpTransport,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;

/// What a worker does besides keeping its link alive.
#[derive(Debug, Clone, Default)]
pub struct WorkerOptions {
    pub main_task: MainTask,
    /// Events pushed through the batcher once connected.
    pub batch_events: Option<u32>,
}

pub fn client_config(config: &NodeConfig, main_task: MainTask) -> Result<ClientConfig> {
    let mut client_config = ClientConfig::new(config.name.clone(), config.master_addr()?);
    client_config.codec = config.codec_config();
    client_config.cipher = config.cipher()?;
    client_config.keepalive = config.keepalive_config();
    client_config.main_task = main_task;
    Ok(client_config)
}

/// Client manager over TCP or TLS with the configured reconnect strategy.
pub fn build_client(config: &NodeConfig, main_task: MainTask) -> Result<ClientManager> {
    let client_config = client_config(config, main_task)?;
    let tcp = TcpTransportConfig::default();
    let manager = match config.tls_config()? {
        Some(tls) => ClientManager::new(client_config, TlsTcpTransport::new(tcp, tls)),
        None => ClientManager::new(client_config, TcpTransport::new(tcp)),
    };
    let delay = Duration::from_secs(config.reconnect_delay_secs);
    Ok(match config.reconnect_strategy {
        ReconnectStrategy::Fixed => manager.with_policy(FixedDelay::new(delay)),
        ReconnectStrategy::Exponential => manager.with_policy(ExponentialBackoff {
            initial: delay,
            max: Duration::from_secs(config.max_reconnect_delay_secs),
            ..ExponentialBackoff::default()
        }),
    })
}

pub fn batcher_config(config: &NodeConfig) -> BatcherConfig {
    BatcherConfig {
        max_elements: config.batch_max_elements,
        max_size: config.batch_max_size,
        max_time: Duration::from_millis(config.batch_max_time_ms),
    }
}

pub async fn run_worker(config: NodeConfig, options: WorkerOptions) -> Result<()> {
    let manager = Arc::new(build_client(&config, options.main_task)?);

    let stopper = Arc::clone(&manager);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, stopping worker");
            stopper.shutdown();
        }
    });

    if let Some(events) = options.batch_events {
        let manager = Arc::clone(&manager);
        let batcher = batcher_config(&config);
        tokio::spawn(async move { send_batch_events(manager, batcher, events).await });
    }

    manager.run().await?;
    Ok(())
}

/// Waits for the first connection, then pushes `events` events through a
/// batcher forwarding to the master and logs every response.
pub async fn send_batch_events(manager: Arc<ClientManager>, config: BatcherConfig, events: u32) -> u32 {
    let mut lifecycle = manager.subscribe();
    while !manager.is_connected() {
        match lifecycle.recv().await {
            Ok(ClientEvent::Connected { .. }) => break,
            Ok(_) | Err(RecvError::Lagged(_)) => {}
            Err(RecvError::Closed) => return 0,
        }
    }

    let queue = Arc::new(MuxDemuxQueue::new());
    let batcher = Batcher::new(Arc::clone(&queue), config, HandlerSink::from_client(Arc::clone(&manager)));
    let running = tokio::spawn(batcher.run());
    let client = BatcherClient::new(Arc::clone(&queue));

    let mut ids = Vec::with_capacity(events as usize);
    for i in 0..events {
        let event = json!({ "id": manager.config().name, "msg": format!("event {}", i) });
        match client.send_event(event) {
            Ok(uid) => ids.push(uid),
            Err(e) => tracing::warn!(error = %e, "could not queue event"),
        }
    }

    let mut answered = 0;
    for uid in ids {
        if let Some(response) = client.get_response(uid).await {
            tracing::info!(%uid, %response, "batch response");
            answered += 1;
        }
    }
    queue.close();
    let _ = running.await;
    answered
}
