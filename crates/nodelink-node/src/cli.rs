use clap::{Parser, Subcommand, ValueEnum};
use nodelink_transport::MainTask;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "nl-node")]
#[command(about = "nodelink cluster node", long_about = None)]
pub struct Cli {
    #[arg(short, long, default_value = "/etc/nodelink/node.toml", env = "NODELINK_CONFIG")]
    pub config: PathBuf,

    #[arg(long, value_enum, default_value = "text")]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Accept worker connections.
    Master {
        #[arg(short, long)]
        bind: Option<String>,
    },
    /// Connect to the master and keep the link alive.
    Worker {
        #[arg(short, long)]
        name: Option<String>,
        #[arg(short, long)]
        master: Option<String>,
        #[command(flatten)]
        diagnostics: Diagnostics,
        /// Round trips for `--performance-test`.
        #[arg(long, default_value = "100")]
        iterations: u32,
        /// Events pushed through the batcher to the master.
        #[arg(long, value_name = "EVENTS")]
        batch_events: Option<u32>,
    },
}

/// At most one diagnostic runs per connection.
#[derive(clap::Args, Debug, Default, Clone)]
#[group(multiple = false)]
pub struct Diagnostics {
    /// Echo round trips of this many bytes.
    #[arg(long, value_name = "BYTES")]
    pub performance_test: Option<usize>,
    /// Concurrent echo requests.
    #[arg(long, value_name = "REQUESTS")]
    pub concurrency_test: Option<u32>,
    #[arg(long, value_name = "PATH")]
    pub send_file: Option<PathBuf>,
    #[arg(long, value_name = "BYTES")]
    pub send_string: Option<usize>,
}

impl Diagnostics {
    /// Main task for the client manager, in the order performance, concurrency,
    /// file, string.
    pub fn main_task(&self, iterations: u32) -> MainTask {
        if let Some(payload_size) = self.performance_test {
            MainTask::Performance {
                payload_size,
                iterations,
            }
        } else if let Some(requests) = self.concurrency_test {
            MainTask::Concurrency { requests }
        } else if let Some(path) = &self.send_file {
            MainTask::SendFile { path: path.clone() }
        } else if let Some(size) = self.send_string {
            MainTask::SendString { size }
        } else {
            MainTask::Idle
        }
    }
}
