//! Sliding-window request rate limiter
//!
//! Bounds outbound request rate over a trailing interval with weighted
//! acquisitions. One instance is shared by every loop that talks to the REST
//! API; the internal bookkeeping is serialized behind an async mutex so the
//! limiter itself is a suspension point.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};

use crate::config::ConfigError;

/// Weighted sliding-window rate limiter
///
/// `acquire(weight)` suspends the caller until `weight` more units fit within
/// the trailing `interval` given `capacity` total units. Grant timestamps are
/// kept in insertion order; entries older than the window are discarded on
/// each attempt.
pub struct RateLimiter {
    capacity: usize,
    interval: Duration,
    events: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    /// Create a limiter granting `capacity` weight units per `interval`
    pub fn new(capacity: usize, interval: Duration) -> Result<Self, ConfigError> {
        if capacity == 0 {
            return Err(ConfigError::NonPositive("rate limiter capacity"));
        }
        if interval.is_zero() {
            return Err(ConfigError::NonPositive("rate limiter interval"));
        }
        Ok(Self {
            capacity,
            interval,
            events: Mutex::new(VecDeque::new()),
        })
    }

    /// Suspend until `weight` units can be granted within the current window
    pub async fn acquire(&self, weight: usize) -> Result<(), ConfigError> {
        if weight == 0 {
            return Err(ConfigError::NonPositive("rate limiter weight"));
        }
        if weight > self.capacity {
            return Err(ConfigError::WeightExceedsCapacity {
                weight,
                capacity: self.capacity,
            });
        }

        loop {
            let wait = {
                let mut events = self.events.lock().await;
                let now = Instant::now();
                while events
                    .front()
                    .is_some_and(|&t| now.duration_since(t) >= self.interval)
                {
                    events.pop_front();
                }
                if events.len() + weight <= self.capacity {
                    for _ in 0..weight {
                        events.push_back(now);
                    }
                    return Ok(());
                }
                // Oldest entry must age out before anything more fits.
                let oldest = events[0];
                self.interval.saturating_sub(now.duration_since(oldest))
            };
            sleep(wait).await;
        }
    }
}
