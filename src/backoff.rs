//! Bounded exponential backoff with jitter, used wherever the engine waits
//! on state instead of being woken by a notification.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub initial_ms: u64,
    pub max_ms: u64,
    pub jitter: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_ms: 25,
            max_ms: 1_000,
            jitter: true,
        }
    }
}

/// Delay for the `attempt`-th wait (1-based): `initial * 2^(attempt-1)`,
/// capped at `max`, plus up to half the capped delay of jitter.
pub fn calculate_backoff(attempt: u32, config: &BackoffConfig) -> Duration {
    let exp = attempt.saturating_sub(1).min(32);
    let base = config.initial_ms.saturating_mul(2u64.saturating_pow(exp));
    let capped = base.min(config.max_ms);
    let jitter = if config.jitter {
        let spread = (capped / 4).max(1);
        rand::random::<u64>() % (2 * spread)
    } else {
        0
    };
    Duration::from_millis(capped.saturating_add(jitter))
}

/// Stateful backoff sequence.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    pub fn next_delay(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        calculate_backoff(self.attempt, &self.config)
    }

    /// Start over after progress was observed.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter() -> BackoffConfig {
        BackoffConfig {
            initial_ms: 10,
            max_ms: 100,
            jitter: false,
        }
    }

    #[test]
    fn test_doubles_until_cap() {
        let mut backoff = Backoff::new(no_jitter());
        let delays: Vec<u64> = (0..6).map(|_| backoff.next_delay().as_millis() as u64).collect();
        assert_eq!(delays, vec![10, 20, 40, 80, 100, 100]);
    }

    #[test]
    fn test_reset() {
        let mut backoff = Backoff::new(no_jitter());
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.next_delay(), Duration::from_millis(10));
    }

    #[test]
    fn test_jitter_stays_bounded() {
        let config = BackoffConfig {
            jitter: true,
            ..no_jitter()
        };
        for attempt in 1..10 {
            let delay = calculate_backoff(attempt, &config).as_millis() as u64;
            assert!(delay >= 10);
            assert!(delay <= 150);
        }
    }

    #[test]
    fn test_huge_attempt_does_not_overflow() {
        let delay = calculate_backoff(u32::MAX, &no_jitter());
        assert_eq!(delay, Duration::from_millis(100));
    }
}
