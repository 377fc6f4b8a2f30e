use std::cmp::min;
use std::time::Duration;

use crate::config::MessengerConfig;

/// Reconnect delay that grows by a configurable factor (in eighths, i.e. 12 means 1.5x) after
///  every failed attempt, capped at a maximum, and snaps back to the initial delay on success.
#[derive(Debug)]
pub struct ExponentialBackoff {
    current: Duration,

    config_initial: Duration,
    config_max: Duration,
    config_factor_eighths: u32,
}

impl ExponentialBackoff {
    pub fn new(initial: Duration, max: Duration, factor_eighths: u32) -> Self {
        assert!(factor_eighths >= 8);

        ExponentialBackoff {
            current: initial,
            config_initial: initial,
            config_max: max,
            config_factor_eighths: factor_eighths,
        }
    }

    pub fn from_config(config: &MessengerConfig) -> Self {
        Self::new(config.initial_backoff, config.max_backoff, config.backoff_factor_eighths)
    }

    /// the delay before the next attempt - calling this grows the delay for the attempt after
    #[must_use]
    pub fn next_delay(&mut self) -> Duration {
        let result = self.current;

        let grown = self.current.checked_mul(self.config_factor_eighths)
            .map(|d| d / 8)
            .unwrap_or(self.config_max);
        self.current = min(grown, self.config_max);

        result
    }

    pub fn reset(&mut self) {
        self.current = self.config_initial;
    }

    pub fn current(&self) -> Duration {
        self.current
    }
}
