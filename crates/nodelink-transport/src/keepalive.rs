//! Keep-alive probing for nodelink connections.
//!
//! The initiator of a connection periodically sends a lightweight echo
//! request. Consecutive failures (timeouts or error replies) are counted and
//! after `max_missed` of them the connection is closed, so a half-open socket
//! does not linger.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::TransportError;
use crate::handler::Handler;
use crate::protocol::Command;

const STATE_ACTIVE: u8 = 0;
const STATE_WARNING: u8 = 1;
const STATE_DEAD: u8 = 2;
const STATE_DISABLED: u8 = 3;

/// Payload carried by keepalive probes.
pub const KEEPALIVE_PAYLOAD: &[u8] = b"keepalive";

/// Connection keep-alive state indicating health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepAliveState {
    /// Connection is healthy and responsive.
    Active,
    /// At least one probe failed since the last success.
    Warning,
    /// `max_missed` consecutive probes failed.
    Dead,
    /// Keep-alive probing is disabled for this connection.
    Disabled,
}

impl From<u8> for KeepAliveState {
    fn from(raw: u8) -> Self {
        match raw {
            STATE_WARNING => KeepAliveState::Warning,
            STATE_DEAD => KeepAliveState::Dead,
            STATE_DISABLED => KeepAliveState::Disabled,
            _ => KeepAliveState::Active,
        }
    }
}

/// Configuration for keep-alive probing.
#[derive(Debug, Clone)]
pub struct KeepAliveConfig {
    /// Interval between probes.
    pub interval: Duration,
    /// How long to wait for a probe's response before counting a miss.
    pub timeout: Duration,
    /// Consecutive misses after which the connection is closed.
    pub max_missed: u32,
    /// Whether probing is enabled.
    pub enabled: bool,
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(29),
            timeout: Duration::from_secs(10),
            max_missed: 3,
            enabled: true,
        }
    }
}

/// Statistics for keep-alive tracking of a single connection.
#[derive(Debug, Clone, Default)]
pub struct KeepAliveStats {
    /// Number of consecutive failed probes.
    pub missed_count: u32,
    /// Total number of probes sent.
    pub total_sent: u64,
    /// Total number of successful probes.
    pub total_received: u64,
    /// Total number of failed probes.
    pub total_failures: u64,
    /// Average round-trip time in microseconds, if available.
    pub average_rtt_us: Option<u64>,
}

/// Tracks keep-alive state for a single connection.
#[derive(Debug)]
pub struct KeepAliveTracker {
    config: KeepAliveConfig,
    state: AtomicU8,
    missed_count: AtomicU32,
    last_sent: Mutex<Option<Instant>>,
    total_sent: AtomicU64,
    total_received: AtomicU64,
    total_failures: AtomicU64,
    rtt_sum_us: AtomicU64,
    rtt_count: AtomicU64,
}

impl KeepAliveTracker {
    /// Creates a new tracker with the given configuration.
    pub fn new(config: KeepAliveConfig) -> Self {
        let initial_state = if config.enabled {
            STATE_ACTIVE
        } else {
            STATE_DISABLED
        };
        Self {
            config,
            state: AtomicU8::new(initial_state),
            missed_count: AtomicU32::new(0),
            last_sent: Mutex::new(None),
            total_sent: AtomicU64::new(0),
            total_received: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
            rtt_sum_us: AtomicU64::new(0),
            rtt_count: AtomicU64::new(0),
        }
    }

    /// Returns the current keep-alive state.
    pub fn state(&self) -> KeepAliveState {
        KeepAliveState::from(self.state.load(Ordering::SeqCst))
    }

    /// Records that a probe was sent.
    pub fn record_sent(&self) {
        self.total_sent.fetch_add(1, Ordering::Relaxed);
        *self.last_sent.lock() = Some(Instant::now());
    }

    /// Records a successful probe; clears the miss streak.
    pub fn record_received(&self) {
        self.total_received.fetch_add(1, Ordering::Relaxed);
        self.missed_count.store(0, Ordering::SeqCst);

        if let Some(sent) = *self.last_sent.lock() {
            let rtt_us = sent.elapsed().as_micros() as u64;
            self.rtt_sum_us.fetch_add(rtt_us, Ordering::Relaxed);
            self.rtt_count.fetch_add(1, Ordering::Relaxed);
        }

        let current = self.state.load(Ordering::SeqCst);
        if current != STATE_DISABLED {
            self.state.store(STATE_ACTIVE, Ordering::SeqCst);
        }
    }

    /// Records a failed probe and returns the current miss streak.
    pub fn record_failure(&self) -> u32 {
        self.total_failures.fetch_add(1, Ordering::Relaxed);
        let missed = self.missed_count.fetch_add(1, Ordering::SeqCst) + 1;

        if self.state.load(Ordering::SeqCst) == STATE_DISABLED {
            return missed;
        }
        if missed >= self.config.max_missed {
            self.state.store(STATE_DEAD, Ordering::SeqCst);
        } else {
            self.state.store(STATE_WARNING, Ordering::SeqCst);
        }
        missed
    }

    /// Returns the number of consecutive failed probes.
    pub fn missed_count(&self) -> u32 {
        self.missed_count.load(Ordering::SeqCst)
    }

    /// True once the miss streak reached `max_missed`.
    pub fn is_dead(&self) -> bool {
        self.state() == KeepAliveState::Dead
    }

    /// Returns the average round-trip time, if RTT samples are available.
    pub fn average_rtt(&self) -> Option<Duration> {
        let count = self.rtt_count.load(Ordering::Relaxed);
        if count == 0 {
            return None;
        }
        let sum = self.rtt_sum_us.load(Ordering::Relaxed);
        Some(Duration::from_micros(sum / count))
    }

    /// Returns current keep-alive statistics.
    pub fn stats(&self) -> KeepAliveStats {
        KeepAliveStats {
            missed_count: self.missed_count(),
            total_sent: self.total_sent.load(Ordering::Relaxed),
            total_received: self.total_received.load(Ordering::Relaxed),
            total_failures: self.total_failures.load(Ordering::Relaxed),
            average_rtt_us: self.average_rtt().map(|d| d.as_micros() as u64),
        }
    }
}

/// Periodic probe loop bound to one connection.
#[derive(Debug, Clone)]
pub struct KeepAliveTask {
    config: KeepAliveConfig,
    tracker: Arc<KeepAliveTracker>,
}

impl KeepAliveTask {
    /// Creates a task with a fresh tracker.
    pub fn new(config: KeepAliveConfig) -> Self {
        let tracker = Arc::new(KeepAliveTracker::new(config.clone()));
        Self { config, tracker }
    }

    /// The tracker updated by [`run`](Self::run).
    pub fn tracker(&self) -> Arc<KeepAliveTracker> {
        Arc::clone(&self.tracker)
    }

    /// Probes `handler` with `command` until the connection is lost or the
    /// miss limit is reached; in the latter case the handler is closed. Returns
    /// the error that ended the loop.
    pub async fn run(&self, handler: &Handler, command: Command) -> TransportError {
        if !self.config.enabled {
            handler.closed().await;
            return TransportError::lost(
                handler
                    .close_reason()
                    .unwrap_or_else(|| "connection closed".to_string()),
            );
        }

        let start = tokio::time::Instant::now() + self.config.interval;
        let mut ticker = tokio::time::interval_at(start, self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = handler.closed() => {
                    return TransportError::lost(
                        handler.close_reason().unwrap_or_else(|| "connection closed".to_string()),
                    );
                }
            }

            self.tracker.record_sent();
            let probe = handler
                .send_request_timeout(command, KEEPALIVE_PAYLOAD, self.config.timeout)
                .await;
            match probe {
                Ok(_) => {
                    self.tracker.record_received();
                    debug!(command = %command, "keepalive ok");
                }
                Err(e) if e.is_connection_lost() => return e,
                Err(e) => {
                    handler.metrics().inc_keepalive_failures();
                    let missed = self.tracker.record_failure();
                    warn!(
                        error = %e,
                        missed,
                        max_missed = self.config.max_missed,
                        "keepalive failed"
                    );
                    if self.tracker.is_dead() {
                        let err = TransportError::KeepaliveExhausted { missed };
                        handler.close(err.to_string());
                        return err;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::tests::ready_pair;
    use crate::protocol::Message;
    use crate::registry::CommandRegistry;
    use futures::{SinkExt, StreamExt};

    #[test]
    fn test_tracker_three_strikes() {
        let tracker = KeepAliveTracker::new(KeepAliveConfig::default());
        assert_eq!(tracker.state(), KeepAliveState::Active);
        assert_eq!(tracker.record_failure(), 1);
        assert_eq!(tracker.state(), KeepAliveState::Warning);
        tracker.record_failure();
        assert!(!tracker.is_dead());
        tracker.record_failure();
        assert!(tracker.is_dead());
        assert_eq!(tracker.stats().total_failures, 3);
    }

    #[test]
    fn test_success_resets_streak() {
        let tracker = KeepAliveTracker::new(KeepAliveConfig::default());
        tracker.record_failure();
        tracker.record_failure();
        tracker.record_sent();
        tracker.record_received();
        assert_eq!(tracker.missed_count(), 0);
        assert_eq!(tracker.state(), KeepAliveState::Active);
        tracker.record_failure();
        assert!(!tracker.is_dead());
        assert!(tracker.average_rtt().is_some());
    }

    #[test]
    fn test_disabled_never_dies() {
        let tracker = KeepAliveTracker::new(KeepAliveConfig {
            enabled: false,
            ..Default::default()
        });
        for _ in 0..5 {
            tracker.record_failure();
        }
        assert_eq!(tracker.state(), KeepAliveState::Disabled);
        assert!(!tracker.is_dead());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_probes_close_connection() {
        let (handler, mut peer) = ready_pair(CommandRegistry::new()).await;
        let task = KeepAliveTask::new(KeepAliveConfig::default());

        let silent_peer = tokio::spawn(async move {
            let mut seen = 0;
            while let Some(Ok(frame)) = peer.next().await {
                assert_eq!(frame.header.command, Command::ECHO_C);
                seen += 1;
            }
            seen
        });

        let err = task.run(&handler, Command::ECHO_C).await;
        assert!(matches!(err, TransportError::KeepaliveExhausted { missed: 3 }));
        assert!(!handler.is_connected());
        assert_eq!(handler.metrics().snapshot().keepalive_failures, 3);
        assert_eq!(silent_peer.await.unwrap(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_answered_probes_keep_connection() {
        let (handler, mut peer) = ready_pair(CommandRegistry::new()).await;
        let task = KeepAliveTask::new(KeepAliveConfig::default());
        let tracker = task.tracker();

        tokio::spawn(async move {
            while let Some(Ok(frame)) = peer.next().await {
                let reply = Message::response(frame.header.counter, Command::OK_M, frame.payload);
                if peer.send(reply).await.is_err() {
                    break;
                }
            }
        });

        let h = handler.clone();
        let run = tokio::spawn(async move { task.run(&h, Command::ECHO_C).await });
        tokio::time::sleep(Duration::from_secs(29 * 4 + 1)).await;
        assert!(handler.is_connected());
        assert_eq!(tracker.stats().total_received, 4);
        assert_eq!(tracker.missed_count(), 0);

        handler.close("done");
        assert!(run.await.unwrap().is_connection_lost());
    }
}
