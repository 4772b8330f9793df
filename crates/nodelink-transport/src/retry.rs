//! Reconnect policies for the client manager.
//!
//! The manager asks its policy how long to wait before the next connection
//! attempt. `failures` is the number of consecutive failed attempts; it is 0
//! when a previously established session just ended.

use std::fmt;
use std::time::Duration;

use rand::Rng;

/// Strategy deciding the delay before the next connection attempt.
pub trait ReconnectPolicy: Send + Sync + fmt::Debug + 'static {
    /// Delay before the next attempt, or `None` to stop reconnecting.
    fn next_delay(&self, failures: u32) -> Option<Duration>;
}

/// Same delay every time. Retries forever unless `max_attempts` is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedDelay {
    /// Wait between attempts (default: 10 seconds).
    pub delay: Duration,
    /// Consecutive failed attempts after which the manager gives up.
    pub max_attempts: Option<u32>,
}

impl Default for FixedDelay {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(10),
            max_attempts: None,
        }
    }
}

impl FixedDelay {
    /// Unlimited retries with `delay` between them.
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy for FixedDelay {
    fn next_delay(&self, failures: u32) -> Option<Duration> {
        match self.max_attempts {
            Some(max) if failures >= max => None,
            _ => Some(self.delay),
        }
    }
}

/// Exponential backoff with optional jitter.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    /// Delay after the first failure (default: 500ms).
    pub initial: Duration,
    /// Upper bound for the delay (default: 60 seconds).
    pub max: Duration,
    /// Growth factor per failure (default: 2.0).
    pub multiplier: f64,
    /// Add up to half the computed delay at random (default: true).
    pub jitter: bool,
    /// Consecutive failed attempts after which the manager gives up.
    pub max_attempts: Option<u32>,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: true,
            max_attempts: None,
        }
    }
}

impl ExponentialBackoff {
    fn compute_backoff(&self, failures: u32) -> Duration {
        let base_ms = self.initial.as_millis() as f64;
        let max_ms = self.max.as_millis() as f64;
        let exponent = failures.saturating_sub(1).min(63) as i32;
        let capped = (base_ms * self.multiplier.powi(exponent)).min(max_ms) as u64;

        if self.jitter && capped > 1 {
            let jitter_ms = rand::thread_rng().gen_range(0..=capped / 2);
            Duration::from_millis(capped.saturating_add(jitter_ms))
        } else {
            Duration::from_millis(capped)
        }
    }
}

impl ReconnectPolicy for ExponentialBackoff {
    fn next_delay(&self, failures: u32) -> Option<Duration> {
        match self.max_attempts {
            Some(max) if failures >= max => None,
            _ => Some(self.compute_backoff(failures)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_fixed_delay_default() {
        let policy = FixedDelay::default();
        assert_eq!(policy.next_delay(0), Some(Duration::from_secs(10)));
        assert_eq!(policy.next_delay(1000), Some(Duration::from_secs(10)));
    }

    #[test]
    fn test_fixed_delay_gives_up() {
        let policy = FixedDelay {
            delay: Duration::from_millis(5),
            max_attempts: Some(2),
        };
        assert!(policy.next_delay(1).is_some());
        assert!(policy.next_delay(2).is_none());
    }

    #[test]
    fn test_exponential_growth_without_jitter() {
        let policy = ExponentialBackoff {
            initial: Duration::from_millis(100),
            max: Duration::from_millis(1000),
            multiplier: 2.0,
            jitter: false,
            max_attempts: None,
        };
        assert_eq!(policy.next_delay(0), Some(Duration::from_millis(100)));
        assert_eq!(policy.next_delay(1), Some(Duration::from_millis(100)));
        assert_eq!(policy.next_delay(2), Some(Duration::from_millis(200)));
        assert_eq!(policy.next_delay(4), Some(Duration::from_millis(800)));
        assert_eq!(policy.next_delay(5), Some(Duration::from_millis(1000)));
        assert_eq!(policy.next_delay(u32::MAX), Some(Duration::from_millis(1000)));
    }

    proptest! {
        #[test]
        fn prop_jitter_stays_within_half(failures in 0u32..64) {
            let policy = ExponentialBackoff::default();
            let plain = ExponentialBackoff { jitter: false, ..ExponentialBackoff::default() };
            let base = plain.next_delay(failures).unwrap();
            let jittered = policy.next_delay(failures).unwrap();
            prop_assert!(jittered >= base);
            prop_assert!(jittered <= base + base / 2);
        }
    }
}
