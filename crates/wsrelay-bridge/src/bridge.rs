//! `ConnectionBridge` — relays one event source to one TCP client.
//!
//! Per connection:
//! 1. read the token line
//! 2. build the upstream target and connect an [`EventSource`] for it
//! 3. fan in {payload, keepalive tick} and write each as a line
//! 4. on write failure, source end or shutdown: stop the source and close the socket

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use wsrelay_core::config::{redact_target, BridgeConfig, BridgeMode, UpstreamConfig};
use wsrelay_core::error::BridgeError;
use wsrelay_core::source::{EventSource, EventStream, SourceConnector};

use crate::framing::Framer;
use crate::token::TokenReader;

/// Why a bridge stopped relaying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeExit {
    /// Writing to the client failed; the client is gone.
    WriteFailed,
    /// The event source ended its stream.
    SourceEnded,
    /// The listener is shutting down.
    Shutdown,
}

impl fmt::Display for BridgeExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WriteFailed => write!(f, "write-failed"),
            Self::SourceEnded => write!(f, "source-ended"),
            Self::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// Summary of a finished connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BridgeStats {
    pub payloads_forwarded: u64,
    pub probes_sent: u64,
    pub bytes_written: u64,
    /// Event sources opened (more than one only in sequential mode).
    pub sessions: u32,
    pub exit: BridgeExit,
}

impl BridgeStats {
    fn new(exit: BridgeExit) -> Self {
        Self {
            payloads_forwarded: 0,
            probes_sent: 0,
            bytes_written: 0,
            sessions: 0,
            exit,
        }
    }
}

/// One upstream subscription.
struct Session<S> {
    source: S,
    events: EventStream,
}

/// What woke the relay loop.
enum Relay {
    Shutdown,
    Payload(Option<Bytes>),
    Keepalive,
    ClientLine(Result<Option<String>, BridgeError>),
}

/// Shared, stateless per-connection driver. One instance serves every
/// connection of a listener; all per-connection state lives in [`run`](Self::run).
pub struct ConnectionBridge<C> {
    connector: Arc<C>,
    upstream: UpstreamConfig,
    config: BridgeConfig,
    framer: Framer,
}

impl<C: SourceConnector> ConnectionBridge<C> {
    pub fn new(connector: C, upstream: UpstreamConfig, config: BridgeConfig) -> Self {
        Self {
            connector: Arc::new(connector),
            framer: Framer::from(&config),
            upstream,
            config,
        }
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Serve one client until it goes away, its source ends, or `shutdown` fires.
    ///
    /// Returns `Err` when the token handshake fails or the first event source
    /// cannot be opened; in both cases no relaying happened.
    pub async fn run<S>(
        &self,
        socket: S,
        shutdown: CancellationToken,
    ) -> Result<BridgeStats, BridgeError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin,
    {
        let (reader, mut writer) = tokio::io::split(socket);
        let mut lines = TokenReader::new(reader, self.config.max_token_len);

        let token = tokio::select! {
            _ = shutdown.cancelled() => return Ok(BridgeStats::new(BridgeExit::Shutdown)),
            token = self.read_first_token(&mut lines) => token?,
        };

        let mut session = self.open_session(&token).await?;
        let mut stats = BridgeStats::new(BridgeExit::Shutdown);
        stats.sessions = 1;

        let period = self.config.keepalive_interval();
        let mut keepalive = time::interval_at(Instant::now() + period, period);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut read_tokens = self.config.mode == BridgeMode::Sequential;

        let outcome = loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => Relay::Shutdown,
                payload = session.events.recv() => Relay::Payload(payload),
                _ = keepalive.tick() => Relay::Keepalive,
                line = lines.next_line(), if read_tokens => Relay::ClientLine(line),
            };

            match event {
                Relay::Shutdown => break Ok(BridgeExit::Shutdown),
                Relay::Payload(None) => {
                    tracing::warn!("event source ended");
                    break Ok(BridgeExit::SourceEnded);
                }
                Relay::Payload(Some(payload)) => {
                    let frame = self.framer.frame(&payload);
                    if let Err(e) = write_frame(&mut writer, &frame).await {
                        tracing::warn!(error = %e, "client write failed");
                        break Ok(BridgeExit::WriteFailed);
                    }
                    stats.payloads_forwarded += 1;
                    stats.bytes_written += frame.len() as u64;
                }
                Relay::Keepalive => {
                    let probe = self.framer.probe();
                    if let Err(e) = write_frame(&mut writer, &probe).await {
                        tracing::warn!(error = %e, "client write failed");
                        break Ok(BridgeExit::WriteFailed);
                    }
                    stats.probes_sent += 1;
                    stats.bytes_written += probe.len() as u64;
                }
                Relay::ClientLine(Ok(None)) => {
                    tracing::debug!("client closed its sending side");
                    read_tokens = false;
                }
                Relay::ClientLine(Ok(Some(token))) if token.is_empty() => {}
                Relay::ClientLine(Ok(Some(token))) => {
                    session.source.stop();
                    match self.open_session(&token).await {
                        Ok(next) => {
                            session = next;
                            stats.sessions += 1;
                        }
                        Err(e) => break Err(e),
                    }
                }
                Relay::ClientLine(Err(e)) => break Err(e),
            }
        };

        session.source.stop();
        if let Err(e) = writer.shutdown().await {
            tracing::debug!(error = %e, "client shutdown failed");
        }

        outcome.map(|exit| {
            stats.exit = exit;
            stats
        })
    }

    async fn read_first_token<R>(&self, lines: &mut TokenReader<R>) -> Result<String, BridgeError>
    where
        R: AsyncRead + Unpin,
    {
        match self.config.token_timeout() {
            None => lines.read_token().await,
            Some(limit) => time::timeout(limit, lines.read_token())
                .await
                .map_err(|_| BridgeError::TokenTimeout {
                    ms: limit.as_millis() as u64,
                })?,
        }
    }

    async fn open_session(&self, token: &str) -> Result<Session<C::Source>, BridgeError> {
        let target = self.upstream.target_for(token)?;
        tracing::debug!(upstream = %redact_target(&target), "opening event source");
        let mut source = self.connector.connect(target).await?;
        let events = source.start()?;
        Ok(Session { source, events })
    }
}

async fn write_frame<W>(writer: &mut W, frame: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(frame).await?;
    writer.flush().await
}
