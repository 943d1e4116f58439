//! Poll-level error backoff.

use std::time::Duration;

/// `min(base * 2^consecutive_errors, cap)`, reset on success.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    consecutive_errors: u32,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            consecutive_errors: 0,
        }
    }

    /// Delay for the current error count, then count one more error.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.delay_for(self.consecutive_errors);
        self.consecutive_errors = self.consecutive_errors.saturating_add(1);
        delay
    }

    fn delay_for(&self, errors: u32) -> Duration {
        let factor = 2u32.checked_pow(errors).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .map_or(self.cap, |d| d.min(self.cap))
    }

    pub fn reset(&mut self) {
        self.consecutive_errors = 0;
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors
    }
}
