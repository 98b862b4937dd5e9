//! Error types for the upstream source, the per-connection bridge and the listener.

use thiserror::Error;

/// Errors raised by an upstream event source.
#[derive(Debug, Error)]
pub enum SourceError {
    /// The upstream address could not be built from the configured host and token.
    #[error("invalid upstream target: {0}")]
    InvalidTarget(String),

    /// The WebSocket handshake failed.
    #[error("connect to {target} failed: {reason}")]
    Connect { target: String, reason: String },

    /// The WebSocket handshake did not complete in time.
    #[error("connect timed out after {ms}ms")]
    ConnectTimeout { ms: u64 },

    /// Send/receive error on an established connection.
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// No probe response arrived within the liveness window.
    #[error("no pong received for {ms}ms")]
    LivenessTimeout { ms: u64 },

    /// The remote side closed the connection.
    #[error("upstream connection closed")]
    Closed,

    /// `start` was called on a source whose loop is already running.
    #[error("event source already started")]
    AlreadyStarted,

    /// The source was stopped before it could be started.
    #[error("event source stopped")]
    Stopped,
}

impl SourceError {
    /// Returns `true` if the reconnect loop should keep trying after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Connect { .. }
                | Self::ConnectTimeout { .. }
                | Self::WebSocket(_)
                | Self::LivenessTimeout { .. }
                | Self::Closed
        )
    }
}

/// Errors that end a single client connection.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("client I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The client disconnected before sending a token line.
    #[error("client closed the connection before sending a token")]
    NoToken,

    /// The token line was blank.
    #[error("empty token line")]
    EmptyToken,

    /// The client disconnected in the middle of the token line.
    #[error("token line not terminated by a newline")]
    UnterminatedToken,

    /// The token line was not valid UTF-8.
    #[error("token line is not valid UTF-8")]
    MalformedToken,

    #[error("token line exceeds {max} bytes")]
    TokenTooLong { max: usize },

    #[error("no token received within {ms}ms")]
    TokenTimeout { ms: u64 },

    /// The upstream source could not be constructed for this client.
    #[error(transparent)]
    Source(#[from] SourceError),
}

impl BridgeError {
    /// Returns `true` if the client violated the token handshake.
    pub fn is_client_protocol(&self) -> bool {
        matches!(
            self,
            Self::NoToken
                | Self::EmptyToken
                | Self::UnterminatedToken
                | Self::MalformedToken
                | Self::TokenTooLong { .. }
                | Self::TokenTimeout { .. }
        )
    }
}

/// Errors fatal to the listener as a whole.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("cannot bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("accept failed: {0}")]
    Accept(#[source] std::io::Error),

    #[error("invalid configuration: {0}")]
    Config(String),
}
