//! wsrelay-core — foundation traits and types for wsrelay.
//!
//! # Overview
//!
//! wsrelay bridges plain TCP clients to a push-event service that is only
//! reachable over a persistent WebSocket. The core crate defines:
//!
//! - [`EventSource`] — the trait every upstream event source implements
//! - [`EventStream`] / [`StopHandle`] — consumer and shutdown handles
//! - [`SourceConnector`] — builds one source per upstream target
//! - [`SourceError`], [`BridgeError`], [`RelayError`] — structured error types
//! - [`config`] module — explicit, serde-backed configuration
//! - [`policy`] module — reconnect delay policies
//! - [`logging`] module — `tracing` subscriber setup

pub mod config;
pub mod error;
pub mod logging;
pub mod policy;
pub mod source;

pub use config::{
    BridgeConfig, BridgeMode, LineEnding, ReconnectConfig, RelayConfig, SourceConfig,
    UpstreamConfig,
};
pub use error::{BridgeError, RelayError, SourceError};
pub use logging::{init_tracing, LogConfig};
pub use policy::{ExponentialBackoff, FixedDelay, ReconnectPolicy};
pub use source::{
    EventSource, EventStream, SourceConnector, SourceMetrics, SourceState, StopHandle,
};
