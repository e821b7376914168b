//! Reconnection backoff policy
//!
//! One policy drives both recovery loops: relay reconnection and transport
//! renegotiation. Exponential backoff with jitter, clamped to a maximum,
//! bounded by a retry budget.

use rand::Rng;
use std::time::Duration;

/// Controls how reconnection attempts are paced and bounded
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Maximum number of attempts before giving up
    pub max_retries: u32,
    /// Initial backoff delay in milliseconds
    pub backoff_initial_ms: u64,
    /// Maximum backoff delay in milliseconds
    pub backoff_max_ms: u64,
    /// Backoff multiplier
    pub backoff_multiplier: f64,
    /// Whether to add jitter (0-25% of the delay)
    pub jitter_enabled: bool,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            backoff_initial_ms: 1000,
            backoff_max_ms: 30000,
            backoff_multiplier: 2.0,
            jitter_enabled: true,
        }
    }
}

impl ReconnectPolicy {
    /// Policy for low-latency scenarios: fast, frequent retries
    pub fn aggressive() -> Self {
        Self {
            max_retries: 10,
            backoff_initial_ms: 100,
            backoff_max_ms: 5000,
            backoff_multiplier: 1.5,
            jitter_enabled: true,
        }
    }

    /// Policy for unstable networks: slow, patient retries
    pub fn conservative() -> Self {
        Self {
            max_retries: 3,
            backoff_initial_ms: 2000,
            backoff_max_ms: 60000,
            backoff_multiplier: 2.5,
            jitter_enabled: true,
        }
    }

    /// Backoff duration for a 0-indexed attempt number
    pub fn calculate_backoff(&self, attempt: u32) -> Duration {
        let backoff_ms =
            (self.backoff_initial_ms as f64) * self.backoff_multiplier.powi(attempt as i32);
        let backoff_ms = backoff_ms.min(self.backoff_max_ms as f64);

        let final_ms = if self.jitter_enabled {
            backoff_ms + rand::thread_rng().gen_range(0.0..=backoff_ms * 0.25)
        } else {
            backoff_ms
        };

        Duration::from_millis(final_ms as u64)
    }

    /// Whether another attempt is inside the budget
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }
}

/// Stateful backoff sequence over a policy
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: ReconnectPolicy,
    attempt: u32,
}

impl Backoff {
    /// Start a fresh sequence
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Delay before the next attempt, or `None` when the budget is spent
    pub fn next_delay(&mut self) -> Option<Duration> {
        if !self.policy.should_retry(self.attempt) {
            return None;
        }
        let delay = self.policy.calculate_backoff(self.attempt);
        self.attempt += 1;
        Some(delay)
    }

    /// Attempts consumed so far
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Reset after a success so only consecutive failures exhaust the budget
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
