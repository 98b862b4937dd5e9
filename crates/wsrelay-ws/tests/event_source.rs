//! Integration tests against a local WebSocket server.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::time::{self, Instant};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use url::Url;

use wsrelay_core::error::SourceError;
use wsrelay_core::policy::FixedDelay;
use wsrelay_core::source::{EventSource, EventStream, SourceState};
use wsrelay_ws::{WsEventSource, WsSourceConfig};

type ServerWs = WebSocketStream<TcpStream>;

struct Upstream {
    addr: SocketAddr,
    connections: Arc<AtomicUsize>,
    uris: Arc<Mutex<Vec<String>>>,
}

impl Upstream {
    fn target(&self, token: &str) -> Url {
        Url::parse(&format!("ws://{}/ws/company?token={token}", self.addr)).unwrap()
    }

    fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

/// Local upstream. Connection `n` (0-based) is rejected at the handshake when
/// `reject(n)` is true, otherwise handed to `handler`.
async fn spawn_upstream<F, Fut>(reject: fn(usize) -> bool, handler: F) -> Upstream
where
    F: Fn(ServerWs, usize) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let connections = Arc::new(AtomicUsize::new(0));
    let uris = Arc::new(Mutex::new(Vec::new()));
    let handler = Arc::new(handler);

    let counter = Arc::clone(&connections);
    let seen = Arc::clone(&uris);
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            let handler = Arc::clone(&handler);
            let seen = Arc::clone(&seen);
            tokio::spawn(async move {
                let callback = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                    seen.lock().unwrap().push(req.uri().to_string());
                    if reject(n) {
                        let mut err = ErrorResponse::new(Some("unavailable".into()));
                        *err.status_mut() = StatusCode::SERVICE_UNAVAILABLE;
                        return Err(err);
                    }
                    Ok(resp)
                };
                if let Ok(ws) = tokio_tungstenite::accept_hdr_async(stream, callback).await {
                    (*handler)(ws, n).await;
                }
            });
        }
    });

    Upstream { addr, connections, uris }
}

fn never(_: usize) -> bool {
    false
}

/// Read (and auto-answer pings) until the client goes away.
async fn drain(mut ws: ServerWs) {
    while let Some(Ok(_)) = ws.next().await {}
}

fn fast_config() -> WsSourceConfig {
    WsSourceConfig {
        policy: Arc::new(FixedDelay::new(Duration::from_millis(100))),
        ..WsSourceConfig::default()
    }
}

async fn next(stream: &mut EventStream) -> Option<bytes::Bytes> {
    time::timeout(Duration::from_secs(5), stream.recv())
        .await
        .expect("timed out waiting for a payload")
}

#[tokio::test]
async fn forwards_payloads_in_receipt_order() {
    let upstream = spawn_upstream(never, |mut ws, _| async move {
        ws.send(Message::Text("one".into())).await.unwrap();
        ws.send(Message::Binary(vec![0, 1, 2, 255])).await.unwrap();
        ws.send(Message::Text("{\"event\":3}".into())).await.unwrap();
        drain(ws).await;
    })
    .await;

    let mut source = WsEventSource::connect(upstream.target("abc123"), fast_config())
        .await
        .unwrap();
    let mut stream = source.start().unwrap();

    assert_eq!(next(&mut stream).await.unwrap(), "one");
    assert_eq!(next(&mut stream).await.unwrap(), &[0u8, 1, 2, 255][..]);
    assert_eq!(next(&mut stream).await.unwrap(), "{\"event\":3}");
    assert_eq!(source.state(), SourceState::Streaming);
    assert_eq!(source.metrics().payloads, 3);
    assert_eq!(
        upstream.uris.lock().unwrap().as_slice(),
        ["/ws/company?token=abc123".to_string()]
    );

    source.stop();
}

#[tokio::test]
async fn stop_ends_the_stream_and_is_idempotent() {
    let upstream = spawn_upstream(never, |mut ws, _| async move {
        loop {
            if ws.send(Message::Text("tick".into())).await.is_err() {
                break;
            }
            time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;

    let mut source = WsEventSource::connect(upstream.target("t"), fast_config())
        .await
        .unwrap();
    let mut stream = source.start().unwrap();
    for _ in 0..3 {
        assert_eq!(next(&mut stream).await.unwrap(), "tick");
    }

    source.stop();
    source.stop();
    source.stop_handle().stop();

    assert!(next(&mut stream).await.is_none());
    assert!(next(&mut stream).await.is_none());
    assert_eq!(source.state(), SourceState::Stopped);
    assert!(matches!(source.start(), Err(SourceError::Stopped)));
}

#[tokio::test]
async fn dropping_the_stream_stops_the_source() {
    let closed = Arc::new(Notify::new());
    let seen_close = Arc::clone(&closed);
    let upstream = spawn_upstream(never, move |ws, _| {
        let seen_close = Arc::clone(&seen_close);
        async move {
            let (mut sink, mut frames) = ws.split();
            let ticker = tokio::spawn(async move {
                while sink.send(Message::Text("tick".into())).await.is_ok() {
                    time::sleep(Duration::from_millis(5)).await;
                }
            });
            while let Some(Ok(msg)) = frames.next().await {
                if msg.is_close() {
                    break;
                }
            }
            ticker.abort();
            seen_close.notify_one();
        }
    })
    .await;

    let mut source = WsEventSource::connect(upstream.target("t"), fast_config())
        .await
        .unwrap();
    let mut states = source.watch_state();
    let mut stream = source.start().unwrap();
    assert_eq!(next(&mut stream).await.unwrap(), "tick");
    drop(stream);

    time::timeout(Duration::from_secs(5), states.wait_for(|s| *s == SourceState::Stopped))
        .await
        .expect("source kept running without a consumer")
        .unwrap();
    assert_eq!(source.state(), SourceState::Stopped);
    time::timeout(Duration::from_secs(5), closed.notified())
        .await
        .expect("upstream never saw the connection close");
    assert_eq!(upstream.connections(), 1);
}

#[tokio::test]
async fn start_twice_is_rejected() {
    let upstream = spawn_upstream(never, |ws, _| drain(ws)).await;
    let mut source = WsEventSource::connect(upstream.target("t"), fast_config())
        .await
        .unwrap();
    let _stream = source.start().unwrap();
    assert!(matches!(source.start(), Err(SourceError::AlreadyStarted)));
    source.stop();
}

#[tokio::test]
async fn stop_before_start_closes_the_initial_connection() {
    let upstream = spawn_upstream(never, |ws, _| drain(ws)).await;
    let mut source = WsEventSource::connect(upstream.target("t"), fast_config())
        .await
        .unwrap();
    source.stop();
    assert_eq!(source.state(), SourceState::Stopped);
    assert!(matches!(source.start(), Err(SourceError::Stopped)));
}

#[tokio::test]
async fn initial_connect_failure_is_returned() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let target = Url::parse(&format!("ws://{addr}/ws/company?token=t")).unwrap();
    let err = WsEventSource::connect(target, fast_config()).await.err().unwrap();
    match err {
        SourceError::Connect { target, .. } => assert!(!target.contains("token")),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn rejected_handshake_is_returned() {
    let upstream = spawn_upstream(|_| true, |ws, _| drain(ws)).await;
    let result = WsEventSource::connect(upstream.target("t"), fast_config()).await;
    assert!(matches!(result, Err(SourceError::Connect { .. })));
}

#[tokio::test]
async fn reconnects_after_cooldown_when_upstream_drops() {
    let upstream = spawn_upstream(never, |mut ws, n| async move {
        if n == 0 {
            ws.send(Message::Text("before".into())).await.unwrap();
            // dropped without a close handshake
        } else {
            ws.send(Message::Text("after".into())).await.unwrap();
            drain(ws).await;
        }
    })
    .await;

    let mut source = WsEventSource::connect(upstream.target("t"), fast_config())
        .await
        .unwrap();
    let mut stream = source.start().unwrap();

    assert_eq!(next(&mut stream).await.unwrap(), "before");
    let dropped_at = Instant::now();
    assert_eq!(next(&mut stream).await.unwrap(), "after");
    // the cooldown may start a moment before "before" is observed here
    assert!(dropped_at.elapsed() >= Duration::from_millis(80));

    let metrics = source.metrics();
    assert_eq!(metrics.disconnects, 1);
    assert_eq!(metrics.reconnects, 1);
    assert_eq!(upstream.connections(), 2);
    source.stop();
}

#[tokio::test]
async fn keeps_retrying_while_upstream_refuses() {
    let upstream = spawn_upstream(
        |n| (1..=3).contains(&n),
        |mut ws, n| async move {
            if n == 0 {
                return;
            }
            ws.send(Message::Text("back".into())).await.unwrap();
            drain(ws).await;
        },
    )
    .await;

    let config = WsSourceConfig {
        policy: Arc::new(FixedDelay::new(Duration::from_millis(20))),
        ..WsSourceConfig::default()
    };
    let mut source = WsEventSource::connect(upstream.target("t"), config).await.unwrap();
    let mut stream = source.start().unwrap();

    assert_eq!(next(&mut stream).await.unwrap(), "back");
    let metrics = source.metrics();
    assert_eq!(metrics.failed_reconnects, 3);
    assert_eq!(metrics.reconnects, 1);
    assert_eq!(upstream.connections(), 5);
    source.stop();
}

#[tokio::test]
async fn missing_pongs_count_as_a_dead_connection() {
    let upstream = spawn_upstream(never, |mut ws, n| async move {
        if n == 0 {
            ws.send(Message::Text("first".into())).await.unwrap();
            // hold the socket open but never read, so pings go unanswered
            time::sleep(Duration::from_secs(30)).await;
            drop(ws);
        } else {
            ws.send(Message::Text("second".into())).await.unwrap();
            drain(ws).await;
        }
    })
    .await;

    let config = WsSourceConfig {
        policy: Arc::new(FixedDelay::new(Duration::from_millis(20))),
        ping_interval: Duration::from_millis(50),
        liveness_timeout: Duration::from_millis(300),
        ..WsSourceConfig::default()
    };
    let mut source = WsEventSource::connect(upstream.target("t"), config).await.unwrap();
    let mut stream = source.start().unwrap();

    assert_eq!(next(&mut stream).await.unwrap(), "first");
    assert_eq!(next(&mut stream).await.unwrap(), "second");
    assert_eq!(source.metrics().disconnects, 1);
    source.stop();
}

#[tokio::test]
async fn answered_pings_keep_the_connection_alive() {
    let upstream = spawn_upstream(never, |ws, _| drain(ws)).await;

    let config = WsSourceConfig {
        ping_interval: Duration::from_millis(20),
        liveness_timeout: Duration::from_millis(150),
        ..fast_config()
    };
    let mut source = WsEventSource::connect(upstream.target("t"), config).await.unwrap();
    let _stream = source.start().unwrap();

    time::sleep(Duration::from_millis(600)).await;
    assert_eq!(source.metrics().disconnects, 0);
    assert_eq!(source.state(), SourceState::Streaming);
    assert_eq!(upstream.connections(), 1);
    source.stop();
}

#[tokio::test]
async fn state_moves_through_disconnected_and_back() {
    let upstream = spawn_upstream(never, |mut ws, n| async move {
        if n == 0 {
            let _ = ws.close(None).await;
        } else {
            drain(ws).await;
        }
    })
    .await;

    let mut source = WsEventSource::connect(upstream.target("t"), fast_config())
        .await
        .unwrap();
    let mut states = source.watch_state();
    assert_eq!(*states.borrow(), SourceState::Disconnected);
    let _stream = source.start().unwrap();

    time::timeout(Duration::from_secs(5), async {
        while source.metrics().reconnects == 0 {
            time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    time::timeout(Duration::from_secs(5), states.wait_for(|s| *s == SourceState::Streaming))
        .await
        .unwrap()
        .unwrap();
    assert!(source.metrics().disconnects >= 1);

    source.stop();
    assert_eq!(*states.borrow(), SourceState::Stopped);
}
