//! The `EventSource` trait — the core abstraction for upstream event feeds.
//!
//! A source owns one upstream connection (reopened transparently on failure)
//! and hands its payloads to exactly one consumer through an [`EventStream`].
//!
//! ```text
//! Disconnected ──connect ok──▶ Streaming ──read error──▶ Disconnected (cooldown, retry)
//!       │                          │
//!       └──────── stop ────────────┴──────▶ Stopped (terminal)
//! ```

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use url::Url;

use crate::error::SourceError;

/// Lifecycle state of an event source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceState {
    /// No live upstream connection; a reconnect is pending.
    Disconnected,
    /// Connected and reading.
    Streaming,
    /// Stop was requested. Terminal.
    Stopped,
}

impl fmt::Display for SourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Streaming => write!(f, "streaming"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Counters snapshot for one source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SourceMetrics {
    pub payloads: u64,
    pub disconnects: u64,
    pub reconnects: u64,
    pub failed_reconnects: u64,
}

/// Cloneable, idempotent stop signal for a source.
#[derive(Debug, Clone, Default)]
pub struct StopHandle {
    token: CancellationToken,
}

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request shutdown. Safe to call any number of times from any task.
    pub fn stop(&self) {
        self.token.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once [`stop`](Self::stop) has been called.
    pub async fn stopped(&self) {
        self.token.cancelled().await
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

/// Consumer side of a source's output channel.
///
/// Checks the stop signal before handing out each payload, so nothing is
/// delivered after stop even if the read loop had already queued it.
pub struct EventStream {
    rx: mpsc::Receiver<Bytes>,
    stop: StopHandle,
    /// Wakes a pending `poll_next` when stop is requested.
    stopped: Pin<Box<WaitForCancellationFutureOwned>>,
}

impl EventStream {
    pub fn new(rx: mpsc::Receiver<Bytes>, stop: StopHandle) -> Self {
        let stopped = Box::pin(stop.token().clone().cancelled_owned());
        Self { rx, stop, stopped }
    }

    /// Next payload, or `None` once the source is stopped or its loop has exited.
    ///
    /// Cancel safe.
    pub async fn recv(&mut self) -> Option<Bytes> {
        if self.stop.is_stopped() {
            self.rx.close();
            return None;
        }
        let item = tokio::select! {
            biased;
            _ = self.stop.stopped() => None,
            item = self.rx.recv() => item,
        };
        if self.stop.is_stopped() {
            self.rx.close();
            return None;
        }
        item
    }
}

impl Stream for EventStream {
    type Item = Bytes;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Bytes>> {
        let this = self.get_mut();
        if this.stop.is_stopped() || this.stopped.as_mut().poll(cx).is_ready() {
            this.rx.close();
            return Poll::Ready(None);
        }
        this.rx.poll_recv(cx)
    }
}

impl fmt::Debug for EventStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventStream")
            .field("stopped", &self.stop.is_stopped())
            .finish_non_exhaustive()
    }
}

/// A live sequence of raw event payloads with an explicit stop.
///
/// # Thread Safety
/// Implementations must be `Send` so a source can move into its bridge task.
pub trait EventSource: Send + 'static {
    /// Start the internal read loop and return the payload stream.
    ///
    /// Call once; a second call returns [`SourceError::AlreadyStarted`] and
    /// never spawns a second loop.
    fn start(&mut self) -> Result<EventStream, SourceError>;

    /// Handle that stops this source from anywhere.
    fn stop_handle(&self) -> StopHandle;

    /// Request termination: the loop exits, the stream ends and the upstream
    /// connection is closed. Idempotent.
    fn stop(&self) {
        self.stop_handle().stop();
    }

    fn state(&self) -> SourceState;

    fn metrics(&self) -> SourceMetrics {
        SourceMetrics::default()
    }
}

/// Opens one [`EventSource`] per upstream target.
#[async_trait]
pub trait SourceConnector: Send + Sync + 'static {
    type Source: EventSource;

    /// Perform the initial connect. Failure here is fatal to the source.
    async fn connect(&self, target: Url) -> Result<Self::Source, SourceError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn stream_yields_in_order_then_ends_when_sender_drops() {
        let (tx, rx) = mpsc::channel(4);
        let mut stream = EventStream::new(rx, StopHandle::new());
        tx.send(Bytes::from_static(b"a")).await.unwrap();
        tx.send(Bytes::from_static(b"b")).await.unwrap();
        drop(tx);
        assert_eq!(stream.recv().await.unwrap(), "a");
        assert_eq!(stream.recv().await.unwrap(), "b");
        assert!(stream.recv().await.is_none());
    }

    #[tokio::test]
    async fn queued_payloads_are_dropped_after_stop() {
        let (tx, rx) = mpsc::channel(4);
        let stop = StopHandle::new();
        let mut stream = EventStream::new(rx, stop.clone());
        tx.send(Bytes::from_static(b"late")).await.unwrap();
        stop.stop();
        assert!(stream.recv().await.is_none());
        assert!(stream.next().await.is_none());
        // the channel is closed for the producer as well
        assert!(tx.send(Bytes::from_static(b"x")).await.is_err());
    }

    #[tokio::test]
    async fn stop_wakes_a_pending_recv() {
        let (_tx, rx) = mpsc::channel::<Bytes>(1);
        let stop = StopHandle::new();
        let mut stream = EventStream::new(rx, stop.clone());
        let waiter = tokio::spawn(async move { stream.recv().await });
        stop.stop();
        assert!(waiter.await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stop_wakes_a_pending_next() {
        let (_tx, rx) = mpsc::channel::<Bytes>(1);
        let stop = StopHandle::new();
        let mut stream = EventStream::new(rx, stop.clone());
        let waiter = tokio::spawn(async move { stream.next().await });
        tokio::task::yield_now().await;
        stop.stop();
        let item = tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .expect("next() still pending after stop")
            .unwrap();
        assert!(item.is_none());
    }

    #[test]
    fn stop_is_idempotent() {
        let stop = StopHandle::new();
        stop.stop();
        stop.clone().stop();
        assert!(stop.is_stopped());
    }
}
