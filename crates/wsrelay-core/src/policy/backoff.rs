//! Fixed and exponential reconnect delays.
//!
//! Neither policy ever gives up: the upstream connection is retried until the
//! source is stopped.

use std::fmt;
use std::time::Duration;

/// Computes the wait before each reconnect attempt.
pub trait ReconnectPolicy: Send + Sync + fmt::Debug {
    /// Returns the delay before the `attempt`-th consecutive reconnect (1-based).
    fn next_delay(&self, attempt: u32) -> Duration;
}

/// Same delay before every attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedDelay {
    pub delay: Duration,
}

impl FixedDelay {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl Default for FixedDelay {
    fn default() -> Self {
        Self::new(Duration::from_secs(2))
    }
}

impl ReconnectPolicy for FixedDelay {
    fn next_delay(&self, _attempt: u32) -> Duration {
        self.delay
    }
}

/// Configuration for [`ExponentialBackoff`].
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay before the first attempt.
    pub initial: Duration,
    /// Upper bound on any single delay.
    pub max: Duration,
    /// Multiplier applied on each consecutive failure.
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(2),
            max: Duration::from_secs(60),
            multiplier: 2.0,
        }
    }
}

/// Delay grows geometrically with the attempt number, capped at `max`.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    pub config: BackoffConfig,
}

impl ExponentialBackoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config }
    }
}

impl ReconnectPolicy for ExponentialBackoff {
    fn next_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base_ms = self.config.initial.as_millis() as f64 * self.config.multiplier.powi(exponent);
        let cap_ms = self.config.max.as_millis() as f64;
        // powi overflows to +inf for large attempts; min() keeps it at the cap
        Duration::from_millis(base_ms.min(cap_ms) as u64)
    }
}
