//! Reconnect delay policies.
//!
//! The event source consults a [`ReconnectPolicy`] before every reconnect
//! attempt. The default is a fixed delay with unbounded retries:
//! ```text
//! read error → sleep(next_delay(1)) → connect → fail → sleep(next_delay(2)) → connect → ...
//! ```

pub mod backoff;

pub use backoff::{BackoffConfig, ExponentialBackoff, FixedDelay, ReconnectPolicy};
