//! Relay configuration.
//!
//! Every value the relay needs is carried by an explicit [`RelayConfig`]
//! handed to the listener at construction. All fields have defaults so a
//! partial JSON document deserializes cleanly.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{RelayError, SourceError};
use crate::logging::LogConfig;
use crate::policy::{BackoffConfig, ExponentialBackoff, FixedDelay, ReconnectPolicy};

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// TCP listen address. A leading `:` (e.g. `:9090`) binds every interface.
    pub listen_addr: String,
    pub upstream: UpstreamConfig,
    pub bridge: BridgeConfig,
    pub source: SourceConfig,
    pub log: LogConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_addr: ":9090".into(),
            upstream: UpstreamConfig::default(),
            bridge: BridgeConfig::default(),
            source: SourceConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl RelayConfig {
    /// Parse a JSON config document.
    pub fn from_json(text: &str) -> Result<Self, RelayError> {
        serde_json::from_str(text).map_err(|e| RelayError::Config(e.to_string()))
    }

    /// The listen address in a form `TcpListener::bind` accepts.
    pub fn bind_addr(&self) -> String {
        normalize_listen_addr(&self.listen_addr)
    }

    /// Reject values that would make the relay spin or never connect.
    pub fn validate(&self) -> Result<(), RelayError> {
        if self.listen_addr.trim().is_empty() {
            return Err(RelayError::Config("listen_addr is empty".into()));
        }
        if self.upstream.host.trim().is_empty() {
            return Err(RelayError::Config("upstream.host is empty".into()));
        }
        if self.bridge.keepalive_interval_ms == 0 {
            return Err(RelayError::Config("bridge.keepalive_interval_ms must be > 0".into()));
        }
        if self.bridge.max_token_len == 0 {
            return Err(RelayError::Config("bridge.max_token_len must be > 0".into()));
        }
        if self.source.liveness_timeout_ms == 0 || self.source.ping_interval_ms == 0 {
            return Err(RelayError::Config(
                "source liveness timeout and ping interval must be > 0".into(),
            ));
        }
        if self.source.channel_capacity == 0 {
            return Err(RelayError::Config("source.channel_capacity must be > 0".into()));
        }
        if self.source.connect_timeout_ms == 0 {
            return Err(RelayError::Config("source.connect_timeout_ms must be > 0".into()));
        }
        self.source.reconnect.validate()
    }
}

/// `:9090` → `0.0.0.0:9090`; anything else is returned unchanged.
pub fn normalize_listen_addr(addr: &str) -> String {
    let addr = addr.trim();
    if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    }
}

// ─── Upstream ────────────────────────────────────────────────────────────────

/// Where the push-event service lives.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Host (optionally with port) of the event service.
    pub host: String,
    /// Fixed path of the event endpoint.
    pub path: String,
    /// `wss` when true, plain `ws` otherwise.
    pub secure: bool,
    /// Query parameter that carries the client token.
    pub token_param: String,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            host: "events.3c.fluxoti.com".into(),
            path: "/ws/company".into(),
            secure: true,
            token_param: "token".into(),
        }
    }
}

impl UpstreamConfig {
    /// Build the upstream URL for one client token, e.g.
    /// `wss://events.3c.fluxoti.com/ws/company?token=abc123`.
    pub fn target_for(&self, token: &str) -> Result<Url, SourceError> {
        let scheme = if self.secure { "wss" } else { "ws" };
        let mut url = Url::parse(&format!("{scheme}://{}", self.host))
            .map_err(|e| SourceError::InvalidTarget(format!("{}: {e}", self.host)))?;
        if url.host_str().map_or(true, str::is_empty) {
            return Err(SourceError::InvalidTarget(format!("{}: missing host", self.host)));
        }
        url.set_path(&self.path);
        url.query_pairs_mut().append_pair(&self.token_param, token);
        Ok(url)
    }
}

/// The target without its query string, safe to log.
pub fn redact_target(target: &Url) -> String {
    let mut shown = target.clone();
    shown.set_query(None);
    shown.to_string()
}

// ─── Bridge ──────────────────────────────────────────────────────────────────

/// Line delimiter appended to every frame sent to the TCP client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LineEnding {
    #[default]
    Lf,
    CrLf,
}

impl LineEnding {
    pub fn as_bytes(self) -> &'static [u8] {
        match self {
            Self::Lf => b"\n",
            Self::CrLf => b"\r\n",
        }
    }
}

impl fmt::Display for LineEnding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Lf => write!(f, "lf"),
            Self::CrLf => write!(f, "crlf"),
        }
    }
}

impl FromStr for LineEnding {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "lf" | "\\n" => Ok(Self::Lf),
            "crlf" | "\\r\\n" => Ok(Self::CrLf),
            other => Err(format!("unknown line ending `{other}` (expected lf or crlf)")),
        }
    }
}

/// How many tokens one TCP connection may present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BridgeMode {
    /// One token per connection; later client input is ignored.
    #[default]
    Single,
    /// Every further line re-subscribes the connection under a new token.
    Sequential,
}

impl fmt::Display for BridgeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Single => write!(f, "single"),
            Self::Sequential => write!(f, "sequential"),
        }
    }
}

impl FromStr for BridgeMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "single" => Ok(Self::Single),
            "sequential" => Ok(Self::Sequential),
            other => Err(format!("unknown bridge mode `{other}` (expected single or sequential)")),
        }
    }
}

/// Per-connection relay settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub line_ending: LineEnding,
    /// Period of the keepalive probe written to the client.
    pub keepalive_interval_ms: u64,
    /// Probe body, sent followed by `line_ending`.
    pub keepalive_message: String,
    pub mode: BridgeMode,
    /// How long to wait for the first token line; `None` waits forever.
    pub token_timeout_ms: Option<u64>,
    /// Longest accepted token line, delimiter included.
    pub max_token_len: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            line_ending: LineEnding::Lf,
            keepalive_interval_ms: 5_000,
            keepalive_message: "PING".into(),
            mode: BridgeMode::Single,
            token_timeout_ms: None,
            max_token_len: 4_096,
        }
    }
}

impl BridgeConfig {
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }

    pub fn token_timeout(&self) -> Option<Duration> {
        self.token_timeout_ms.map(Duration::from_millis)
    }
}

// ─── Source ──────────────────────────────────────────────────────────────────

/// Which reconnect policy the event source uses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReconnectConfig {
    Fixed { delay_ms: u64 },
    Exponential { initial_ms: u64, max_ms: u64, multiplier: f64 },
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self::Fixed { delay_ms: 2_000 }
    }
}

impl ReconnectConfig {
    /// A zero delay or a shrinking backoff would redial without pause.
    pub fn validate(&self) -> Result<(), RelayError> {
        match *self {
            Self::Fixed { delay_ms: 0 } => Err(RelayError::Config(
                "source.reconnect.delay_ms must be > 0".into(),
            )),
            Self::Fixed { .. } => Ok(()),
            Self::Exponential { initial_ms, max_ms, multiplier } => {
                if initial_ms == 0 {
                    return Err(RelayError::Config("source.reconnect.initial_ms must be > 0".into()));
                }
                if !multiplier.is_finite() || multiplier < 1.0 {
                    return Err(RelayError::Config(format!(
                        "source.reconnect.multiplier must be a finite value >= 1.0, got {multiplier}"
                    )));
                }
                if max_ms < initial_ms {
                    return Err(RelayError::Config(
                        "source.reconnect.max_ms must be >= initial_ms".into(),
                    ));
                }
                Ok(())
            }
        }
    }

    pub fn build_policy(&self) -> Arc<dyn ReconnectPolicy> {
        match *self {
            Self::Fixed { delay_ms } => Arc::new(FixedDelay::new(Duration::from_millis(delay_ms))),
            Self::Exponential { initial_ms, max_ms, multiplier } => {
                Arc::new(ExponentialBackoff::new(BackoffConfig {
                    initial: Duration::from_millis(initial_ms),
                    max: Duration::from_millis(max_ms),
                    multiplier,
                }))
            }
        }
    }
}

/// Upstream connection lifecycle settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub reconnect: ReconnectConfig,
    /// A connection with no pong for this long is considered dead.
    pub liveness_timeout_ms: u64,
    /// How often a ping is sent upstream.
    pub ping_interval_ms: u64,
    /// Upper bound on one WebSocket handshake.
    pub connect_timeout_ms: u64,
    /// Payloads buffered between the read loop and the bridge.
    pub channel_capacity: usize,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            reconnect: ReconnectConfig::default(),
            liveness_timeout_ms: 15_000,
            ping_interval_ms: 5_000,
            connect_timeout_ms: 10_000,
            channel_capacity: 1,
        }
    }
}

impl SourceConfig {
    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_millis(self.liveness_timeout_ms)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}
