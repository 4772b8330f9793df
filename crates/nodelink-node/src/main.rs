use anyhow::Result;
use clap::Parser;
use nodelink_node::cli::{Cli, Command};
use nodelink_node::config::NodeType;
use nodelink_node::{logging, run_master, run_worker, NodeConfig, WorkerOptions};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init_tracing(cli.log_format);

    let mut config = NodeConfig::load_or_default(&cli.config)?;
    tracing::info!("nodelink node starting...");

    match cli.command {
        Command::Master { bind } => {
            config.node_type = NodeType::Master;
            if let Some(bind) = bind {
                let (host, port) = split_host_port(&bind)?;
                config.bind_addr = host;
                config.port = port;
            }
            config.validate()?;
            run_master(config).await
        }
        Command::Worker {
            name,
            master,
            diagnostics,
            iterations,
            batch_events,
        } => {
            config.node_type = NodeType::Worker;
            if let Some(name) = name {
                config.name = name;
            }
            if let Some(master) = master {
                let (host, port) = split_host_port(&master)?;
                config.masters = vec![host];
                config.port = port;
            }
            config.validate()?;
            let options = WorkerOptions {
                main_task: diagnostics.main_task(iterations),
                batch_events,
            };
            run_worker(config, options).await
        }
    }
}

fn split_host_port(addr: &str) -> Result<(String, u16)> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| anyhow::anyhow!("expected host:port, got {}", addr))?;
    Ok((host.to_string(), port.parse()?))
}
