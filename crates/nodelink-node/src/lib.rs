//! nodelink node: configuration, CLI, logging and the master/worker entry points.

pub mod cli;
pub mod config;
pub mod logging;
pub mod master;
pub mod worker;

pub use config::{NodeConfig, NodeType, ReconnectStrategy};
pub use master::run_master;
pub use worker::{run_worker, WorkerOptions};
