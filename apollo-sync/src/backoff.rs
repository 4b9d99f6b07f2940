//! Exponential backoff with jitter for fetch retries and poll reconnects

use crate::config::{PollPolicy, RetryPolicy};
use std::time::Duration;

/// Exponential backoff calculator with jitter
#[derive(Debug)]
pub struct Backoff {
    base_ms: u64,
    max_ms: u64,
    attempt: u32,
}

impl Backoff {
    /// Create a new backoff starting at `base_ms` with a cap of `max_ms`.
    pub fn new(base_ms: u64, max_ms: u64) -> Self {
        Self {
            base_ms,
            max_ms,
            attempt: 0,
        }
    }

    /// Backoff between fetch retries.
    pub fn for_retry(policy: &RetryPolicy) -> Self {
        Self::new(policy.base_delay_ms, policy.max_delay_ms)
    }

    /// Backoff between failed long polls.
    pub fn for_poll(policy: &PollPolicy) -> Self {
        Self::new(policy.error_base_delay_ms, policy.error_max_delay_ms)
    }

    /// Get the next delay duration and increment the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let exp = self
            .base_ms
            .saturating_mul(1u64.checked_shl(self.attempt).unwrap_or(u64::MAX));
        let capped = exp.min(self.max_ms);
        let jitter = rand::random::<u64>() % (capped / 4 + 1);
        self.attempt = self.attempt.saturating_add(1);
        Duration::from_millis(capped + jitter)
    }

    /// Delays handed out since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    /// Reset the backoff (e.g., after a successful poll).
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
