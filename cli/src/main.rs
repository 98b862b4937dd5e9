//! wsrelay CLI — relay a WebSocket push-event feed to plain TCP clients.
//!
//! Usage:
//! ```bash
//! # Defaults: listen on :9090, upstream wss://events.3c.fluxoti.com/ws/company
//! wsrelay
//!
//! # Same settings through the environment
//! TC_TCP_PROXY_ADDR=:7000 TC_EVENTS_SERVER_ADDR=events.example.com TC_LOG_LEVEL=debug wsrelay
//!
//! # Windows-style clients, several tokens per connection, JSON logs
//! wsrelay --line-ending crlf --mode sequential --json-logs
//!
//! # Everything else from a JSON file (flags and env still win)
//! wsrelay --config relay.json
//! ```
//!
//! Client protocol: send one token line, then read lines forever. Each line
//! is either an upstream event or the keepalive probe `PING`.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use wsrelay_bridge::RelayListener;
use wsrelay_core::config::{BridgeMode, LineEnding, RelayConfig};
use wsrelay_core::logging::init_tracing;
use wsrelay_ws::WsConnector;

/// Relay a WebSocket push-event feed to plain TCP clients.
#[derive(Parser, Debug)]
#[command(name = "wsrelay")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TCP listen address; `:PORT` binds every interface.
    #[arg(long, env = "TC_TCP_PROXY_ADDR")]
    listen: Option<String>,

    /// Host of the upstream event service.
    #[arg(long, env = "TC_EVENTS_SERVER_ADDR")]
    upstream_host: Option<String>,

    /// Log level: trace, debug, info, warn or error.
    #[arg(long, env = "TC_LOG_LEVEL")]
    log_level: Option<String>,

    /// JSON configuration file; flags and environment override it.
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Line ending appended to every line sent to clients (lf or crlf).
    #[arg(long)]
    line_ending: Option<LineEnding>,

    /// `single`: one token per connection. `sequential`: every line is a new token.
    #[arg(long)]
    mode: Option<BridgeMode>,

    /// Seconds between keepalive probes.
    #[arg(long, value_name = "SECS")]
    keepalive_secs: Option<u64>,

    /// Connect to the upstream over plain `ws://` instead of `wss://`.
    #[arg(long)]
    insecure: bool,

    /// Emit JSON structured logs.
    #[arg(long)]
    json_logs: bool,
}

impl Args {
    fn into_config(self) -> Result<RelayConfig> {
        let mut config = match &self.config {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("reading {}", path.display()))?;
                RelayConfig::from_json(&text)
                    .with_context(|| format!("parsing {}", path.display()))?
            }
            None => RelayConfig::default(),
        };

        if let Some(listen) = self.listen {
            config.listen_addr = listen;
        }
        if let Some(host) = self.upstream_host {
            config.upstream.host = host;
        }
        if let Some(level) = self.log_level {
            config.log.level = level;
        }
        if let Some(line_ending) = self.line_ending {
            config.bridge.line_ending = line_ending;
        }
        if let Some(mode) = self.mode {
            config.bridge.mode = mode;
        }
        if let Some(secs) = self.keepalive_secs {
            config.bridge.keepalive_interval_ms = secs.saturating_mul(1_000);
        }
        if self.insecure {
            config.upstream.secure = false;
        }
        if self.json_logs {
            config.log.json = true;
        }

        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Args::parse().into_config()?;

    // Only fails if a provider is already installed, which is fine.
    let _ = rustls::crypto::ring::default_provider().install_default();

    init_tracing(&config.log).context("installing the tracing subscriber")?;

    info!(
        listen = %config.bind_addr(),
        upstream = %config.upstream.host,
        mode = %config.bridge.mode,
        line_ending = %config.bridge.line_ending,
        "starting wsrelay"
    );

    let connector = WsConnector::from(&config.source);
    let listener = RelayListener::from_config(&config, connector)
        .await
        .context("failed to start TCP listener")?;

    let shutdown = CancellationToken::new();
    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("interrupt received, shutting down"),
            Err(e) => error!(error = %e, "cannot listen for interrupt"),
        }
        on_signal.cancel();
    });

    listener.run(shutdown).await?;
    Ok(())
}
