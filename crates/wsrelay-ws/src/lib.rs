//! wsrelay-ws — reconnecting WebSocket event source.
//!
//! # Features
//! - Initial connect surfaced to the caller; later failures retried forever
//! - Pluggable reconnect delay (fixed 2 s by default)
//! - Ping/pong liveness detection for silently dead connections
//! - Stop is idempotent and never starved by an in-flight read or reconnect

pub mod connector;
pub mod source;

pub use connector::WsConnector;
pub use source::{WsEventSource, WsSourceConfig};
