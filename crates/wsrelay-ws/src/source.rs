//! WebSocket event source with auto-reconnect.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures::{Sink, SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use url::Url;

use wsrelay_core::config::{redact_target, SourceConfig};
use wsrelay_core::error::SourceError;
use wsrelay_core::policy::ReconnectPolicy;
use wsrelay_core::source::{EventSource, EventStream, SourceMetrics, SourceState, StopHandle};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Upper bound on the close handshake with a stale or stopped connection.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Configuration for the WebSocket event source.
#[derive(Debug, Clone)]
pub struct WsSourceConfig {
    /// Delay before each reconnect attempt.
    pub policy: Arc<dyn ReconnectPolicy>,
    /// A connection with no pong for this long is treated as dead.
    pub liveness_timeout: Duration,
    /// How often a ping is sent upstream.
    pub ping_interval: Duration,
    /// Upper bound on one WebSocket handshake.
    pub connect_timeout: Duration,
    /// Payloads buffered between the read loop and the consumer.
    pub channel_capacity: usize,
}

impl Default for WsSourceConfig {
    fn default() -> Self {
        Self::from(&SourceConfig::default())
    }
}

impl From<&SourceConfig> for WsSourceConfig {
    fn from(config: &SourceConfig) -> Self {
        Self {
            policy: config.reconnect.build_policy(),
            liveness_timeout: config.liveness_timeout(),
            ping_interval: config.ping_interval(),
            connect_timeout: config.connect_timeout(),
            channel_capacity: config.channel_capacity.max(1),
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    payloads: AtomicU64,
    disconnects: AtomicU64,
    reconnects: AtomicU64,
    failed_reconnects: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> SourceMetrics {
        SourceMetrics {
            payloads: self.payloads.load(Ordering::Relaxed),
            disconnects: self.disconnects.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            failed_reconnects: self.failed_reconnects.load(Ordering::Relaxed),
        }
    }
}

/// Event source backed by one WebSocket connection.
///
/// The first connect happens in [`connect`](Self::connect) and its failure is
/// returned to the caller. After [`start`](EventSource::start), a background
/// task owns the connection: it forwards every Text/Binary frame, answers
/// pings, sends its own pings, and on any read error waits out the reconnect
/// delay, closes the stale connection and dials again, forever, until stopped.
pub struct WsEventSource {
    target: Url,
    config: WsSourceConfig,
    pending: Mutex<Option<WsStream>>,
    stop: StopHandle,
    state: Arc<watch::Sender<SourceState>>,
    counters: Arc<Counters>,
    started: bool,
}

impl WsEventSource {
    /// Open the upstream connection to `target`.
    pub async fn connect(target: Url, config: WsSourceConfig) -> Result<Self, SourceError> {
        tracing::info!(upstream = %redact_target(&target), "connecting upstream");
        let ws = dial(&target, config.connect_timeout).await?;
        let (state, _) = watch::channel(SourceState::Disconnected);

        Ok(Self {
            target,
            config,
            pending: Mutex::new(Some(ws)),
            stop: StopHandle::new(),
            state: Arc::new(state),
            counters: Arc::new(Counters::default()),
            started: false,
        })
    }

    pub fn target(&self) -> &Url {
        &self.target
    }

    /// Receiver that observes every state transition.
    pub fn watch_state(&self) -> watch::Receiver<SourceState> {
        self.state.subscribe()
    }

    fn take_pending(&self) -> Option<WsStream> {
        match self.pending.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }
}

impl EventSource for WsEventSource {
    fn start(&mut self) -> Result<EventStream, SourceError> {
        if self.stop.is_stopped() {
            return Err(SourceError::Stopped);
        }
        if self.started {
            return Err(SourceError::AlreadyStarted);
        }
        let ws = self.take_pending().ok_or(SourceError::Stopped)?;
        self.started = true;

        let (tx, rx) = mpsc::channel(self.config.channel_capacity);
        let ctx = LoopContext {
            target: self.target.clone(),
            shown: redact_target(&self.target),
            config: self.config.clone(),
            stop: self.stop.clone(),
            state: Arc::clone(&self.state),
            counters: Arc::clone(&self.counters),
        };

        tokio::spawn(event_loop(ws, ctx, tx));

        Ok(EventStream::new(rx, self.stop.clone()))
    }

    fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    fn stop(&self) {
        self.stop.stop();
        set_state(&self.state, SourceState::Stopped);
        // never started: nobody else will close the initial connection
        drop(self.take_pending());
    }

    fn state(&self) -> SourceState {
        if self.stop.is_stopped() {
            SourceState::Stopped
        } else {
            *self.state.borrow()
        }
    }

    fn metrics(&self) -> SourceMetrics {
        self.counters.snapshot()
    }
}

impl Drop for WsEventSource {
    fn drop(&mut self) {
        self.stop.stop();
    }
}

/// Moves to `next` unless the source is already stopped.
fn set_state(state: &watch::Sender<SourceState>, next: SourceState) {
    state.send_if_modified(|current| {
        if *current == SourceState::Stopped || *current == next {
            false
        } else {
            *current = next;
            true
        }
    });
}

async fn dial(target: &Url, connect_timeout: Duration) -> Result<WsStream, SourceError> {
    match time::timeout(connect_timeout, tokio_tungstenite::connect_async(target.as_str())).await {
        Err(_) => Err(SourceError::ConnectTimeout {
            ms: connect_timeout.as_millis() as u64,
        }),
        Ok(Err(e)) => Err(SourceError::Connect {
            target: redact_target(target),
            reason: e.to_string(),
        }),
        Ok(Ok((ws, _response))) => Ok(ws),
    }
}

async fn close_quietly(mut ws: WsStream) {
    if let Err(e) = time::timeout(CLOSE_TIMEOUT, ws.close(None)).await.unwrap_or(Ok(())) {
        tracing::debug!(error = %e, "close handshake failed");
    }
}

// ─── Background loop ─────────────────────────────────────────────────────────

struct LoopContext {
    target: Url,
    /// Target without the token, for logs.
    shown: String,
    config: WsSourceConfig,
    stop: StopHandle,
    state: Arc<watch::Sender<SourceState>>,
    counters: Arc<Counters>,
}

/// What woke the read loop.
enum Wake {
    Stop,
    Deadline,
    Probe,
    Frame(Option<Result<Message, WsError>>),
}

/// Owns the connection for the lifetime of the source. Dropping `tx` on
/// return closes the output channel.
async fn event_loop(initial: WsStream, ctx: LoopContext, tx: mpsc::Sender<Bytes>) {
    let mut ws = initial;

    loop {
        set_state(&ctx.state, SourceState::Streaming);

        let failure = match read_until_failure(&mut ws, &ctx, &tx).await {
            Ok(()) => break,
            Err(e) => e,
        };

        set_state(&ctx.state, SourceState::Disconnected);
        ctx.counters.disconnects.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(upstream = %ctx.shown, error = %failure, "upstream read failed");

        match reconnect(ws, &ctx).await {
            Some(fresh) => ws = fresh,
            None => {
                set_state(&ctx.state, SourceState::Stopped);
                tracing::debug!(upstream = %ctx.shown, "event loop stopped while reconnecting");
                return;
            }
        }
    }

    set_state(&ctx.state, SourceState::Stopped);
    close_quietly(ws).await;
    tracing::debug!(upstream = %ctx.shown, "event loop stopped");
}

/// Forward frames until the connection fails (`Err`) or the source is
/// stopped or its consumer is gone (`Ok`).
async fn read_until_failure(
    ws: &mut WsStream,
    ctx: &LoopContext,
    tx: &mpsc::Sender<Bytes>,
) -> Result<(), SourceError> {
    let liveness = ctx.config.liveness_timeout;
    let mut deadline = Instant::now() + liveness;
    let mut probe = time::interval_at(Instant::now() + ctx.config.ping_interval, ctx.config.ping_interval);
    probe.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let wake = tokio::select! {
            biased;
            _ = ctx.stop.stopped() => Wake::Stop,
            _ = time::sleep_until(deadline) => Wake::Deadline,
            _ = probe.tick() => Wake::Probe,
            frame = ws.next() => Wake::Frame(frame),
        };

        let payload = match wake {
            Wake::Stop => return Ok(()),
            Wake::Deadline => {
                return Err(SourceError::LivenessTimeout {
                    ms: liveness.as_millis() as u64,
                })
            }
            Wake::Probe => {
                if !send_control(ws, Message::Ping(Vec::new()), ctx, deadline, liveness).await? {
                    return Ok(());
                }
                continue;
            }
            Wake::Frame(None) => return Err(SourceError::Closed),
            Wake::Frame(Some(Err(e))) => return Err(SourceError::WebSocket(e.to_string())),
            Wake::Frame(Some(Ok(msg))) => match msg {
                Message::Text(text) => Bytes::from(text),
                Message::Binary(data) => Bytes::from(data),
                Message::Pong(_) => {
                    deadline = Instant::now() + liveness;
                    continue;
                }
                Message::Ping(data) => {
                    if !send_control(ws, Message::Pong(data), ctx, deadline, liveness).await? {
                        return Ok(());
                    }
                    continue;
                }
                Message::Close(frame) => {
                    tracing::debug!(upstream = %ctx.shown, ?frame, "upstream sent close");
                    return Err(SourceError::Closed);
                }
                Message::Frame(_) => continue,
            },
        };

        // blocks while the consumer is not reading; stop still gets through
        tokio::select! {
            biased;
            _ = ctx.stop.stopped() => return Ok(()),
            sent = tx.send(payload) => {
                if sent.is_err() {
                    tracing::debug!(upstream = %ctx.shown, "consumer dropped the event stream");
                    ctx.stop.stop();
                    return Ok(());
                }
                ctx.counters.payloads.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// Write a control frame. `Ok(false)` if stop came first; a write still
/// pending at the liveness deadline counts as a dead connection.
async fn send_control<S>(
    ws: &mut S,
    frame: Message,
    ctx: &LoopContext,
    deadline: Instant,
    liveness: Duration,
) -> Result<bool, SourceError>
where
    S: Sink<Message, Error = WsError> + Unpin,
{
    tokio::select! {
        biased;
        _ = ctx.stop.stopped() => Ok(false),
        _ = time::sleep_until(deadline) => Err(SourceError::LivenessTimeout {
            ms: liveness.as_millis() as u64,
        }),
        sent = ws.send(frame) => sent
            .map(|()| true)
            .map_err(|e| SourceError::WebSocket(e.to_string())),
    }
}

/// Wait, close `stale`, dial; repeat until connected. `None` if stopped first.
async fn reconnect(stale: WsStream, ctx: &LoopContext) -> Option<WsStream> {
    let mut stale = Some(stale);
    let mut attempt: u32 = 0;

    loop {
        attempt = attempt.saturating_add(1);
        let delay = ctx.config.policy.next_delay(attempt);
        tracing::debug!(upstream = %ctx.shown, attempt, ?delay, "reconnect scheduled");

        tokio::select! {
            biased;
            _ = ctx.stop.stopped() => {
                if let Some(ws) = stale.take() {
                    close_quietly(ws).await;
                }
                return None;
            }
            _ = time::sleep(delay) => {}
        }

        if let Some(ws) = stale.take() {
            close_quietly(ws).await;
        }

        let result = tokio::select! {
            biased;
            _ = ctx.stop.stopped() => return None,
            result = dial(&ctx.target, ctx.config.connect_timeout) => result,
        };

        match result {
            Ok(ws) => {
                ctx.counters.reconnects.fetch_add(1, Ordering::Relaxed);
                tracing::info!(upstream = %ctx.shown, attempt, "upstream reconnected");
                return Some(ws);
            }
            Err(e) => {
                ctx.counters.failed_reconnects.fetch_add(1, Ordering::Relaxed);
                tracing::error!(upstream = %ctx.shown, attempt, error = %e, "reconnect failed");
            }
        }
    }
}
