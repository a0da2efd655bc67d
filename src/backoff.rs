//! Capped exponential backoff
//!
//! Every failure-handling loop owns an independent instance; attempt state is
//! never shared across loops.

use std::time::Duration;

use crate::config::ConfigError;

/// Capped exponential retry-delay generator
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    initial: Duration,
    factor: f64,
    max: Duration,
    attempts: u32,
}

impl ExponentialBackoff {
    /// Create a backoff producing `initial * factor^n` capped at `max`
    pub fn new(initial: Duration, factor: f64, max: Duration) -> Result<Self, ConfigError> {
        if initial.is_zero() {
            return Err(ConfigError::NonPositive("initial backoff"));
        }
        if factor < 1.0 {
            return Err(ConfigError::BackoffFactorTooSmall);
        }
        if max < initial {
            return Err(ConfigError::BackoffMaxBelowInitial);
        }
        Ok(Self {
            initial,
            factor,
            max,
            attempts: 0,
        })
    }

    /// Next delay in the ladder; increments the attempt counter
    pub fn next_delay(&mut self) -> Duration {
        let raw = self.initial.as_secs_f64() * self.factor.powi(self.attempts as i32);
        let capped = raw.min(self.max.as_secs_f64());
        self.attempts = self.attempts.saturating_add(1);
        Duration::from_secs_f64(capped)
    }

    /// Restart the ladder at the initial delay
    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}
