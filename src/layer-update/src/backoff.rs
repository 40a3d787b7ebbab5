//! Retry policy with capped, jittered exponential backoff.
//!
//! Backoff is expressed as a point in time stored in the cycle state rather
//! than a sleep, so the scheduler stays free to react to other wake signals
//! while a retry is pending.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Retry configuration for the manifest and download stages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Failed attempts allowed per cycle before it ends as Failed.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay after the first failure, doubled for each further failure.
    #[serde(default = "default_base_delay_secs")]
    pub base_delay_secs: u64,
    /// Upper bound on any single delay.
    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: u64,
    /// Jitter factor (0.0 to 1.0).
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay_secs() -> u64 {
    30
}

fn default_max_delay_secs() -> u64 {
    30 * 60
}

fn default_jitter() -> f64 {
    0.2
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_secs: default_base_delay_secs(),
            max_delay_secs: default_max_delay_secs(),
            jitter: default_jitter(),
        }
    }
}

impl RetryPolicy {
    /// Whether `attempts` failures use up the retry budget.
    pub fn exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }

    /// Un-jittered delay before retrying after the `attempt`-th failure.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let delay = self.base_delay_secs.saturating_mul(1u64 << exponent);
        Duration::from_secs(delay.min(self.max_delay_secs))
    }

    /// Delay for the `attempt`-th failure with jitter applied.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if !self.jitter.is_finite() || self.jitter <= 0.0 || base.is_zero() {
            return base;
        }
        let jitter = self.jitter.min(1.0);

        let jitter_range = base.as_secs_f64() * jitter;
        let offset = rand::rng().random_range(-jitter_range..=jitter_range);
        let max = Duration::from_secs(self.max_delay_secs);
        Duration::from_secs_f64((base.as_secs_f64() + offset).max(0.0)).min(max)
    }

    /// Wall-clock time of the next automatic attempt.
    pub fn next_attempt_at(&self, attempt: u32, now: DateTime<Utc>) -> DateTime<Utc> {
        let delay = chrono::Duration::from_std(self.delay(attempt))
            .unwrap_or_else(|_| chrono::Duration::seconds(self.max_delay_secs as i64));
        now + delay
    }
}
