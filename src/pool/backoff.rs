//! Reconnection delay.

use std::time::Duration;

use crate::config::PoolConfig;

/// Exponential reconnection delay with an upper bound.
///
/// Starts at the initial delay, multiplies by the factor after every use,
/// never exceeds the maximum. A successful connect calls [`reset`](Self::reset).
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    factor: f64,
    current: Duration,
}

impl Backoff {
    /// Creates a backoff starting at `initial`.
    #[must_use]
    pub fn new(initial: Duration, max: Duration, factor: f64) -> Self {
        let initial = initial.min(max);
        Self {
            initial,
            max,
            factor,
            current: initial,
        }
    }

    /// Creates a backoff from the pool's reconnect settings.
    #[must_use]
    pub fn from_config(config: &PoolConfig) -> Self {
        Self::new(
            config.reconnect_initial_delay,
            config.reconnect_max_delay,
            config.reconnect_factor,
        )
    }

    /// Returns the delay to wait now and grows the next one.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = Duration::try_from_secs_f64(self.current.as_secs_f64() * self.factor)
            .unwrap_or(self.max)
            .min(self.max);
        delay
    }

    /// Returns to the initial delay.
    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}
