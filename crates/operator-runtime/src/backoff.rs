//! # Fibonacci Backoff
//!
//! Progressive retry delays for failing reconciliations. Grows more slowly
//! than exponential backoff: min, min, 2·min, 3·min, 5·min, ... capped at max.

use std::time::Duration;

/// Bounds of the Fibonacci sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffConfig {
    pub min: Duration,
    pub max: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            min: Duration::from_millis(500),
            max: Duration::from_secs(300),
        }
    }
}

/// Fibonacci backoff calculator
///
/// Each delay is the sum of the previous two, capped at `max`.
#[derive(Debug, Clone)]
pub struct FibonacciBackoff {
    /// Previous delay
    prev: Duration,
    /// Current delay
    current: Duration,
    /// Maximum delay
    max: Duration,
}

impl FibonacciBackoff {
    #[must_use]
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            prev: Duration::ZERO,
            current: config.min.min(config.max),
            max: config.max,
        }
    }

    /// Get the next delay and advance the sequence
    pub fn next_backoff(&mut self) -> Duration {
        let result = self.current;

        let next = self.prev.saturating_add(self.current);
        self.prev = self.current;
        self.current = next.min(self.max);

        result
    }
}
