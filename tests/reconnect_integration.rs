//! End-to-end supervisor scenarios against an in-process mock venue.
//!
//! The mock speaks just enough of the venue protocol to drive the session
//! manager: it accepts websocket upgrades, acks subscribe frames with
//! `subscriptionResponse`, answers pings, and streams `allMids`-shaped
//! frames on a timer. Per-connection behavior (stall after N frames, close
//! after N frames) is what lets each test force a specific failure mode.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::json;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;

use hlstream::{
    BackoffConfig, ConnectionState, ManagerConfig, SessionSupervisor, Subscription,
};

// =============================================================================
// MOCK VENUE
// =============================================================================

#[derive(Debug, Clone)]
struct VenueBehavior {
    /// Delay between streamed data frames.
    frame_period: Duration,
    /// Stop sending data after this many frames but keep the socket open
    /// (zombie-stream simulation). `None` streams forever.
    stall_after: Option<u64>,
    /// Send a close frame after this many frames (server-side disconnect).
    close_after: Option<u64>,
}

impl Default for VenueBehavior {
    fn default() -> Self {
        Self {
            frame_period: Duration::from_millis(25),
            stall_after: None,
            close_after: None,
        }
    }
}

/// Bind a mock venue; every accepted connection runs `behavior`.
async fn spawn_mock_venue(behavior: VenueBehavior) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let behavior = behavior.clone();
            tokio::spawn(async move {
                let Ok(ws) = tokio_tungstenite::accept_async(stream).await else {
                    return;
                };
                let (mut write, mut read) = ws.split();
                let mut ticker = tokio::time::interval(behavior.frame_period);
                let mut sent = 0u64;
                loop {
                    tokio::select! {
                        msg = read.next() => match msg {
                            Some(Ok(Message::Text(text))) => {
                                let v: serde_json::Value =
                                    serde_json::from_str(&text).unwrap_or_default();
                                match v.get("method").and_then(|m| m.as_str()) {
                                    Some("subscribe") => {
                                        let ack = json!({
                                            "channel": "subscriptionResponse",
                                            "data": {
                                                "method": "subscribe",
                                                "subscription": v.get("subscription"),
                                            }
                                        });
                                        if write.send(Message::Text(ack.to_string())).await.is_err() {
                                            break;
                                        }
                                    }
                                    Some("ping") => {
                                        let pong = r#"{"channel":"pong"}"#.to_string();
                                        if write.send(Message::Text(pong)).await.is_err() {
                                            break;
                                        }
                                    }
                                    _ => {}
                                }
                            }
                            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                            Some(Ok(_)) => {}
                        },
                        _ = ticker.tick() => {
                            if let Some(limit) = behavior.close_after {
                                if sent >= limit {
                                    let _ = write.send(Message::Close(None)).await;
                                    break;
                                }
                            }
                            if behavior.stall_after.map(|n| sent >= n).unwrap_or(false) {
                                continue;
                            }
                            sent += 1;
                            let frame = json!({
                                "channel": "allMids",
                                "data": { "mids": { "BTC": "97000.5" }, "seq": sent }
                            });
                            if write.send(Message::Text(frame.to_string())).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

/// A TCP listener that accepts connections but never completes the websocket
/// upgrade. Connect attempts against it can only end by deadline.
async fn spawn_stalling_listener() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });
    addr
}

// =============================================================================
// HARNESS
// =============================================================================

fn fast_config(addr: SocketAddr) -> ManagerConfig {
    ManagerConfig {
        endpoint: format!("ws://{addr}"),
        subscriptions: vec![Subscription::all_mids()],
        health_check_interval: Duration::from_millis(50),
        data_timeout: Duration::from_millis(400),
        connect_deadline: Duration::from_secs(2),
        subscribe_deadline: Duration::from_secs(2),
        close_deadline: Duration::from_secs(2),
        ping_interval: Duration::from_millis(200),
        backoff: BackoffConfig {
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_millis(400),
            multiplier: 2.0,
            max_attempts: 0,
            jitter_fraction: 0.0,
        },
        ..ManagerConfig::default()
    }
}

struct Harness {
    supervisor: Arc<SessionSupervisor>,
    delivered: Arc<AtomicU64>,
    states: Arc<Mutex<Vec<ConnectionState>>>,
    handle: tokio::task::JoinHandle<anyhow::Result<()>>,
}

fn launch(config: ManagerConfig) -> Harness {
    launch_with_callback(config, None)
}

fn launch_with_callback(
    config: ManagerConfig,
    callback: Option<hlstream::MessageCallback>,
) -> Harness {
    let delivered = Arc::new(AtomicU64::new(0));
    let message_callback: hlstream::MessageCallback = callback.unwrap_or_else(|| {
        let counter = delivered.clone();
        Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    });

    let states = Arc::new(Mutex::new(Vec::new()));
    let recorder = states.clone();
    let state_callback: hlstream::StateCallback = Arc::new(move |state| {
        recorder.lock().push(state);
    });

    let supervisor = SessionSupervisor::new(config, message_callback, Some(state_callback));
    let runner = supervisor.clone();
    let handle = tokio::spawn(async move { runner.run().await });

    Harness { supervisor, delivered, states, handle }
}

async fn wait_for<F: Fn() -> bool>(what: &str, deadline: Duration, cond: F) {
    let start = Instant::now();
    while !cond() {
        assert!(start.elapsed() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

// =============================================================================
// SCENARIOS
// =============================================================================

#[tokio::test]
async fn test_happy_path_connects_and_delivers() {
    let addr = spawn_mock_venue(VenueBehavior::default()).await;
    let h = launch(fast_config(addr));

    wait_for("first delivered message", Duration::from_secs(5), || {
        h.delivered.load(Ordering::SeqCst) >= 3
    })
    .await;

    assert_eq!(h.supervisor.state(), ConnectionState::Connected);
    let stats = h.supervisor.stats();
    assert_eq!(stats.state, "connected");
    assert_eq!(stats.intended_subscription_count, 1);
    assert!(stats.health.total_messages >= 3);
    assert_eq!(stats.health.total_reconnects, 0);

    {
        let states = h.states.lock();
        assert_eq!(
            states[..2],
            [ConnectionState::Connecting, ConnectionState::Connected]
        );
    }

    h.supervisor.stop();
    h.handle.await.unwrap().unwrap();
    assert_eq!(h.supervisor.state(), ConnectionState::Disconnected);
    assert_eq!(*h.states.lock().last().unwrap(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_graceful_stop_is_bounded() {
    let addr = spawn_mock_venue(VenueBehavior::default()).await;
    let h = launch(fast_config(addr));

    wait_for("connected", Duration::from_secs(5), || {
        h.supervisor.state() == ConnectionState::Connected
    })
    .await;

    let stop_started = Instant::now();
    h.supervisor.stop();
    let outcome = h.handle.await.unwrap();
    // close_deadline + health_check_interval + slack, all well under 5s here.
    assert!(
        stop_started.elapsed() < Duration::from_secs(5),
        "stop took {:?}",
        stop_started.elapsed()
    );
    outcome.unwrap();
    assert_eq!(h.supervisor.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_data_stall_triggers_reconnect() {
    // Each connection streams three frames then goes quiet while the socket
    // stays open: the classic zombie. The health monitor must declare death
    // and the supervisor must cycle back to Connected over a new connection.
    let addr = spawn_mock_venue(VenueBehavior {
        stall_after: Some(3),
        ..VenueBehavior::default()
    })
    .await;
    let h = launch(fast_config(addr));

    wait_for("reconnect cycle", Duration::from_secs(10), || {
        h.supervisor.stats().health.total_reconnects >= 1
    })
    .await;

    wait_for("second connected episode", Duration::from_secs(10), || {
        let states = h.states.lock();
        states.iter().filter(|s| **s == ConnectionState::Connected).count() >= 2
    })
    .await;

    {
        let states = h.states.lock();
        assert!(states.contains(&ConnectionState::Reconnecting));
        // The observed sequence never violates the transition diagram.
        for pair in states.windows(2) {
            assert!(
                pair[0].can_transition(pair[1]),
                "illegal observed transition {} -> {}",
                pair[0],
                pair[1]
            );
        }
    }

    h.supervisor.stop();
    h.handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_server_close_triggers_reconnect() {
    let addr = spawn_mock_venue(VenueBehavior {
        close_after: Some(2),
        ..VenueBehavior::default()
    })
    .await;
    let h = launch(fast_config(addr));

    wait_for("reconnect after server close", Duration::from_secs(10), || {
        let states = h.states.lock();
        states.iter().filter(|s| **s == ConnectionState::Connected).count() >= 2
    })
    .await;

    assert!(h.supervisor.stats().health.total_reconnects >= 1);

    h.supervisor.stop();
    h.handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_connect_deadline_exhausts_retry_budget() {
    // The listener accepts TCP but never answers the upgrade. With a finite
    // retry budget every attempt must end at the connect deadline and the
    // supervisor must land in Failed within a bounded wall-clock time.
    let addr = spawn_stalling_listener().await;
    let mut config = fast_config(addr);
    config.connect_deadline = Duration::from_millis(200);
    config.backoff.max_attempts = 2;

    let started = Instant::now();
    let h = launch(config);
    let outcome = h.handle.await.unwrap();

    // 3 attempts * 200ms deadline + 50ms + 100ms backoff, plus slack.
    assert!(
        started.elapsed() < Duration::from_secs(5),
        "failed run took {:?}",
        started.elapsed()
    );
    let err = outcome.unwrap_err();
    assert!(err.to_string().contains("retry budget exhausted"), "{err}");
    assert_eq!(h.supervisor.state(), ConnectionState::Failed);

    {
        let states = h.states.lock();
        let connecting = states.iter().filter(|s| **s == ConnectionState::Connecting).count();
        assert_eq!(connecting, 3, "expected exactly 3 connect attempts: {states:?}");
        assert!(!states.contains(&ConnectionState::Connected));
        assert_eq!(*states.last().unwrap(), ConnectionState::Failed);
    }

    // The final snapshot is still served after the terminal exit.
    let stats = h.supervisor.stats();
    assert_eq!(stats.state, "failed");
    assert_eq!(stats.backoff.attempt, 2);
    assert!(stats.health.total_errors >= 3);
}

#[tokio::test]
async fn test_callback_panics_are_contained() {
    let addr = spawn_mock_venue(VenueBehavior::default()).await;

    let attempts = Arc::new(AtomicU64::new(0));
    let counter = attempts.clone();
    let panicking: hlstream::MessageCallback = Arc::new(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        panic!("application bug");
    });

    let h = launch_with_callback(fast_config(addr), Some(panicking));

    wait_for("frames despite panics", Duration::from_secs(5), || {
        attempts.load(Ordering::SeqCst) >= 5
    })
    .await;

    // The reader survived every panic and the supervisor never transitioned
    // because of them.
    assert_eq!(h.supervisor.state(), ConnectionState::Connected);
    let stats = h.supervisor.stats();
    assert!(stats.health.total_messages >= 5);
    assert!(stats.health.total_errors >= 5);
    assert_eq!(stats.health.total_reconnects, 0);

    h.supervisor.stop();
    h.handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_unbounded_retries_never_fail() {
    // max_attempts = 0 must keep cycling Connecting -> Reconnecting without
    // ever reaching Failed.
    let addr = spawn_stalling_listener().await;
    let mut config = fast_config(addr);
    config.connect_deadline = Duration::from_millis(100);
    config.backoff.max_attempts = 0;
    config.backoff.max_delay = Duration::from_millis(100);

    let h = launch(config);
    tokio::time::sleep(Duration::from_millis(1500)).await;

    assert!(h.supervisor.stats().backoff.attempt >= 3);
    assert_ne!(h.supervisor.state(), ConnectionState::Failed);

    h.supervisor.stop();
    h.handle.await.unwrap().unwrap();
    assert_eq!(h.supervisor.state(), ConnectionState::Disconnected);
}
