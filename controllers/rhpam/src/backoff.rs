//! Per-resource retry delays.
//!
//! Failed reconciliations are retried after a Fibonacci sequence of delays
//! (1m, 1m, 2m, 3m, 5m, 8m, then capped at 10m). Each resource key has its own
//! sequence, reset as soon as a pass for that key succeeds.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

/// Fibonacci sequence of retry delays with an upper bound
#[derive(Debug, Clone)]
pub struct FibonacciBackoff {
    base: Duration,
    max: Duration,
    prev: Duration,
    current: Duration,
}

impl FibonacciBackoff {
    #[must_use]
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            prev: Duration::ZERO,
            current: base,
        }
    }

    /// Returns the current delay and advances the sequence
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        let next = (self.prev + self.current).min(self.max);
        self.prev = self.current;
        self.current = next;
        delay
    }

    pub fn reset(&mut self) {
        self.prev = Duration::ZERO;
        self.current = self.base;
    }
}

/// Backoff sequences keyed by `namespace/name`
#[derive(Debug)]
pub struct BackoffTracker {
    base: Duration,
    max: Duration,
    states: Mutex<HashMap<String, FibonacciBackoff>>,
}

impl Default for BackoffTracker {
    fn default() -> Self {
        Self::new(Duration::from_secs(60), Duration::from_secs(600))
    }
}

impl BackoffTracker {
    #[must_use]
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Delay before retrying `key` after another failure
    pub fn next_delay(&self, key: &str) -> Duration {
        let mut states = match self.states.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        states
            .entry(key.to_string())
            .or_insert_with(|| FibonacciBackoff::new(self.base, self.max))
            .next_delay()
    }

    /// Forget the failure history of `key`
    pub fn reset(&self, key: &str) {
        let mut states = match self.states.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        states.remove(key);
    }
}
