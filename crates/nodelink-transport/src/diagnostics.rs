//! Diagnostic workloads a client can run as its main task.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use futures::future::join_all;
use serde::Serialize;
use tracing::{info, warn};

use crate::error::{Result, TransportError};
use crate::file_transfer::FileTransferReport;
use crate::handler::Handler;
use crate::protocol::Command;

/// What a client does on a fresh connection besides keepalive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum MainTask {
    /// Nothing; the keepalive loop is the only traffic.
    #[default]
    Idle,
    /// Sequential `echo` round trips of `payload_size` bytes.
    Performance {
        /// Bytes per request.
        payload_size: usize,
        /// Round trips to time.
        iterations: u32,
    },
    /// `requests` concurrent `echo` requests on one connection.
    Concurrency {
        /// Requests in flight at once.
        requests: u32,
    },
    /// Upload of one file.
    SendFile {
        /// Local path.
        path: PathBuf,
    },
    /// One `string` request of `size` bytes.
    SendString {
        /// Payload size.
        size: usize,
    },
}

impl MainTask {
    /// True for workloads that finish on their own.
    pub fn is_idle(&self) -> bool {
        matches!(self, MainTask::Idle)
    }
}

/// Result of [`performance_test`].
#[derive(Debug, Clone, Serialize)]
pub struct PerformanceReport {
    /// Bytes per request.
    pub payload_size: usize,
    /// Completed round trips.
    pub iterations: u32,
    /// Total wall time.
    pub elapsed: Duration,
    /// Echoed bytes per second, both directions counted once.
    pub throughput_bps: f64,
}

/// Result of [`concurrency_test`].
#[derive(Debug, Clone, Serialize)]
pub struct ConcurrencyReport {
    /// Requests issued.
    pub requests: u32,
    /// Requests that failed.
    pub failures: u32,
    /// Time until every request completed.
    pub elapsed: Duration,
}

/// Sends `iterations` echo requests of `payload_size` bytes one after the
/// other and checks that every reply matches what was sent.
pub async fn performance_test(
    handler: &Handler,
    payload_size: usize,
    iterations: u32,
) -> Result<PerformanceReport> {
    let payload = bytes::Bytes::from(vec![b'a'; payload_size]);
    let started = Instant::now();
    for _ in 0..iterations {
        let echoed = handler.send_request(Command::ECHO, payload.clone()).await?;
        if echoed.len() != payload_size {
            return Err(TransportError::Application {
                message: format!("echo returned {} bytes, sent {}", echoed.len(), payload_size),
            });
        }
    }
    let elapsed = started.elapsed();
    let secs = elapsed.as_secs_f64();
    let throughput_bps = if secs > 0.0 {
        (payload_size as f64 * iterations as f64) / secs
    } else {
        0.0
    };
    info!(
        payload_size,
        iterations,
        elapsed_ms = elapsed.as_millis() as u64,
        throughput_bps,
        "performance test finished"
    );
    Ok(PerformanceReport {
        payload_size,
        iterations,
        elapsed,
        throughput_bps,
    })
}

/// Issues `requests` echo requests at once; each carries `concurrency <i>`.
/// Individual failures are counted, a lost connection fails the test.
pub async fn concurrency_test(handler: &Handler, requests: u32) -> Result<ConcurrencyReport> {
    let started = Instant::now();
    let calls = (0..requests).map(|i| {
        let handler = handler.clone();
        async move {
            let body = format!("concurrency {}", i);
            let reply = handler.send_request(Command::ECHO, body.clone()).await?;
            if reply.as_ref() != body.as_bytes() {
                return Err(TransportError::Application {
                    message: format!("request {} got a foreign reply", i),
                });
            }
            Ok(())
        }
    });

    let mut failures = 0;
    for outcome in join_all(calls).await {
        match outcome {
            Ok(()) => {}
            Err(e) if e.is_connection_lost() => return Err(e),
            Err(e) => {
                warn!(error = %e, "concurrency request failed");
                failures += 1;
            }
        }
    }
    let elapsed = started.elapsed();
    info!(requests, failures, elapsed_ms = elapsed.as_millis() as u64, "concurrency test finished");
    Ok(ConcurrencyReport {
        requests,
        failures,
        elapsed,
    })
}

/// Outcome of one diagnostic run.
#[derive(Debug, Clone)]
pub enum DiagnosticReport {
    /// See [`performance_test`].
    Performance(PerformanceReport),
    /// See [`concurrency_test`].
    Concurrency(ConcurrencyReport),
    /// See [`Handler::send_file`].
    File(FileTransferReport),
    /// Peer acknowledgement of a `string` request.
    String(String),
}

/// Runs `task` once on `handler`. `Idle` returns `None` immediately.
pub async fn run_main_task(handler: &Handler, task: &MainTask) -> Result<Option<DiagnosticReport>> {
    let report = match task {
        MainTask::Idle => return Ok(None),
        MainTask::Performance {
            payload_size,
            iterations,
        } => DiagnosticReport::Performance(performance_test(handler, *payload_size, *iterations).await?),
        MainTask::Concurrency { requests } => {
            DiagnosticReport::Concurrency(concurrency_test(handler, *requests).await?)
        }
        MainTask::SendFile { path } => DiagnosticReport::File(handler.send_file(path).await?),
        MainTask::SendString { size } => {
            let ack = handler.send_string(*size).await?;
            let ack = String::from_utf8_lossy(&ack).into_owned();
            info!(size, ack = %ack, "string sent");
            DiagnosticReport::String(ack)
        }
    };
    Ok(Some(report))
}
