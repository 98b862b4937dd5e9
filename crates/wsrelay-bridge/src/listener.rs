//! `RelayListener` — accept loop spawning one bridge per TCP connection.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use wsrelay_core::config::RelayConfig;
use wsrelay_core::error::RelayError;
use wsrelay_core::source::SourceConnector;

use crate::bridge::ConnectionBridge;

/// Bound TCP listener. Connections share nothing but the bridge config.
pub struct RelayListener<C> {
    listener: TcpListener,
    bridge: Arc<ConnectionBridge<C>>,
}

impl<C: SourceConnector> RelayListener<C> {
    /// Bind `addr`. Failure here is fatal to the process.
    pub async fn bind(addr: &str, bridge: ConnectionBridge<C>) -> Result<Self, RelayError> {
        let listener = TcpListener::bind(addr).await.map_err(|source| RelayError::Bind {
            addr: addr.to_string(),
            source,
        })?;
        Ok(Self {
            listener,
            bridge: Arc::new(bridge),
        })
    }

    /// Validate `config` and bind its listen address.
    pub async fn from_config(config: &RelayConfig, connector: C) -> Result<Self, RelayError> {
        config.validate()?;
        let bridge = ConnectionBridge::new(connector, config.upstream.clone(), config.bridge.clone());
        Self::bind(&config.bind_addr(), bridge).await
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept until `shutdown` fires or `accept` fails.
    ///
    /// Each connection runs in its own task under a child of `shutdown`, so
    /// cancelling it also tears down every live bridge.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), RelayError> {
        if let Ok(addr) = self.local_addr() {
            tracing::info!(%addr, "TCP server started");
        }

        loop {
            let (stream, peer) = tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("listener shutting down");
                    return Ok(());
                }
                accepted = self.listener.accept() => accepted.map_err(|e| {
                    tracing::error!(error = %e, "accept failed");
                    RelayError::Accept(e)
                })?,
            };

            let bridge = Arc::clone(&self.bridge);
            let conn_shutdown = shutdown.child_token();
            let span = tracing::info_span!("conn", %peer);

            tokio::spawn(
                async move {
                    tracing::debug!("handling connection");
                    match bridge.run(stream, conn_shutdown).await {
                        Ok(stats) => tracing::info!(
                            exit = %stats.exit,
                            payloads = stats.payloads_forwarded,
                            probes = stats.probes_sent,
                            sessions = stats.sessions,
                            "connection closed"
                        ),
                        Err(e) if e.is_client_protocol() => {
                            tracing::warn!(error = %e, "client handshake failed")
                        }
                        Err(e) => tracing::error!(error = %e, "connection aborted"),
                    }
                }
                .instrument(span),
            );
        }
    }
}
