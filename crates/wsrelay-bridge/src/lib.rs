//! wsrelay-bridge — relay an event source to plain TCP clients.
//!
//! ## Architecture
//! ```text
//! RelayListener (accept loop)
//!       │  one task per connection
//!       ▼
//! ConnectionBridge ── token line ──▶ SourceConnector::connect(target)
//!       │                                   │
//!       │◀──────── EventStream ─────────────┘
//!       ▼
//! payload + line ending │ keepalive probe ──▶ TCP client
//! ```

pub mod bridge;
pub mod framing;
pub mod listener;
pub mod token;

pub use bridge::{BridgeExit, BridgeStats, ConnectionBridge};
pub use framing::Framer;
pub use listener::RelayListener;
pub use token::TokenReader;
