use std::time::Duration;

use crate::Amount;
use crate::model::OrderStatus;

/// Where a worker is in its poll loop.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerState {
    /// About to ask the scoring service.
    Polling,
    /// Got a 429, backing off before the next poll.
    RateLimited,
    /// Saw `INVALID` or `PROCESSED`; only the final commit is left.
    Terminal {
        status: OrderStatus,
        accrual: Option<Amount>,
    },
}

/// Delay schedule applied after consecutive 429 responses.
///
/// Doubles from `base` up to `max`. With `base == max` the delay is fixed.
/// Retries are never capped.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    attempts: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            attempts: 0,
        }
    }

    pub fn fixed(delay: Duration) -> Self {
        Self::new(delay, delay)
    }

    /// Delay to wait now; advances the schedule.
    pub fn next_delay(&mut self) -> Duration {
        let factor = 2u32.saturating_pow(self.attempts.min(16));
        self.attempts = self.attempts.saturating_add(1);
        self.base.saturating_mul(factor).min(self.max)
    }

    /// Start over after a successful poll.
    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::fixed(Duration::from_secs(1))
    }
}
