//! Reconnect delay computation.
//!
//! Purely computational: the manager owns the actual timer and asks the
//! scheduler how long to wait before the next attempt.

use std::time::Duration;

/// `min(initial * 2^attempt, max)`, saturating instead of overflowing.
pub fn next_delay(initial: Duration, max: Duration, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt);
    initial.saturating_mul(factor).min(max)
}

/// Exponential backoff with a ceiling and an attempt counter.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            attempt: 0,
        }
    }

    /// Number of failed or closed connections since the last successful open.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Delay that the next reconnect would wait, without consuming an attempt.
    pub fn peek(&self) -> Duration {
        next_delay(self.initial, self.max, self.attempt)
    }

    /// Record a failed or closed connection and return the delay to wait
    /// before retrying.
    pub fn record_failure(&mut self) -> Duration {
        let delay = self.peek();
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Back to the initial delay. Called on every successful open.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
