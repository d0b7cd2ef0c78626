//! One physical connection to the venue.
//!
//! A `TransportSession` lives from the supervisor's connect request until the
//! next teardown. It owns the frame-reader task, the ping task, and the
//! per-session active subscription map. Every operation that touches the
//! socket takes an explicit wall-clock deadline and reports expiry as a typed
//! timeout: a half-open TCP connection must never be able to wedge the
//! supervisor. `close` honors its own deadline by abandoning workers that
//! refuse to join in time.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::{Duration, Instant};

use anyhow::anyhow;
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::health::HealthMonitor;
use crate::subscription::{
    normalize_endpoint, ping_frame, subscribe_frame, unsubscribe_frame, Subscription,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Per-frame delivery hook supplied by the application. Runs inline on the
/// reader task; panics are caught and never terminate the reader.
pub type MessageCallback = Arc<dyn Fn(serde_json::Value) + Send + Sync>;

// =============================================================================
// ERRORS
// =============================================================================

/// Outcome of a deadlined transport operation.
#[derive(Debug)]
pub enum TransportError {
    /// The operation did not complete within its deadline. The underlying
    /// worker is abandoned; the supervisor treats this as a normal failure.
    Timeout { op: &'static str, deadline: Duration },
    /// The transport library reported an error.
    Failed { op: &'static str, source: anyhow::Error },
}

impl TransportError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    fn failed(op: &'static str, source: impl Into<anyhow::Error>) -> Self {
        Self::Failed { op, source: source.into() }
    }
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout { op, deadline } => {
                write!(f, "{op} timed out after {deadline:?}")
            }
            Self::Failed { op, source } => write!(f, "{op} failed: {source}"),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Timeout { .. } => None,
            Self::Failed { source, .. } => Some(source.as_ref()),
        }
    }
}

// =============================================================================
// TRANSPORT SESSION
// =============================================================================

/// A single connect-to-teardown lifecycle over the venue WebSocket.
pub struct TransportSession {
    health: Arc<HealthMonitor>,
    callback: MessageCallback,
    /// Set once the socket reports open; cleared on any terminal condition.
    ready: Arc<AtomicBool>,
    /// Set by the reader task when it exits, for any reason.
    reader_done: Arc<AtomicBool>,
    /// First terminal error recorded by the reader or ping task.
    last_error: Arc<Mutex<Option<String>>>,
    stop: CancellationToken,
    writer: Option<Arc<AsyncMutex<WsSink>>>,
    reader_handle: Option<JoinHandle<()>>,
    ping_handle: Option<JoinHandle<()>>,
    /// Canonical descriptor key -> locally assigned subscription id.
    active: HashMap<String, u64>,
    next_sub_id: u64,
    #[cfg(unix)]
    raw_fd: Option<std::os::unix::io::RawFd>,
}

impl TransportSession {
    pub fn new(health: Arc<HealthMonitor>, callback: MessageCallback) -> Self {
        Self {
            health,
            callback,
            ready: Arc::new(AtomicBool::new(false)),
            reader_done: Arc::new(AtomicBool::new(false)),
            last_error: Arc::new(Mutex::new(None)),
            stop: CancellationToken::new(),
            writer: None,
            reader_handle: None,
            ping_handle: None,
            active: HashMap::new(),
            next_sub_id: 1,
            #[cfg(unix)]
            raw_fd: None,
        }
    }

    /// Establish the socket within `deadline` and start the frame reader.
    ///
    /// Returns only after the socket is open and ready to send. `http(s)`
    /// endpoints are rewritten to `ws(s)` first.
    pub async fn open(&mut self, endpoint: &str, deadline: Duration) -> Result<(), TransportError> {
        let url = normalize_endpoint(endpoint);
        debug!(url = %url, deadline_ms = deadline.as_millis() as u64, "transport_connecting");

        let (ws, _response) = match tokio::time::timeout(deadline, connect_async(url.as_str())).await {
            Err(_) => return Err(TransportError::Timeout { op: "open", deadline }),
            Ok(Err(e)) => return Err(TransportError::failed("open", e)),
            Ok(Ok(pair)) => pair,
        };

        #[cfg(unix)]
        {
            self.raw_fd = socket_fd(&ws);
        }

        let (write, read) = ws.split();
        let writer = Arc::new(AsyncMutex::new(write));
        self.writer = Some(writer.clone());
        *self.last_error.lock() = None;
        self.reader_done.store(false, Ordering::Release);
        self.ready.store(true, Ordering::Release);
        self.spawn_reader(read, writer);

        info!(url = %url, "transport_open");
        Ok(())
    }

    /// Serialize and send one subscribe frame within `deadline`.
    ///
    /// The venue sends no per-subscription ack, so a successful send is a
    /// successful subscription; the next inbound data frame is the implicit
    /// confirmation. Returns the locally assigned id recorded in the active
    /// map.
    pub async fn subscribe(
        &mut self,
        sub: &Subscription,
        deadline: Duration,
    ) -> Result<u64, TransportError> {
        self.send_text("subscribe", subscribe_frame(sub), deadline).await?;
        let id = self.next_sub_id;
        self.next_sub_id += 1;
        self.active.insert(sub.key(), id);
        debug!(subscription = %sub.key(), id, "subscribed");
        Ok(id)
    }

    /// Send one unsubscribe frame within `deadline` and drop the descriptor
    /// from the active map.
    ///
    /// Not exercised by the supervisor (reconnects rebuild the full intended
    /// set), but exposed so admin tooling can manage a live session.
    pub async fn unsubscribe(
        &mut self,
        sub: &Subscription,
        deadline: Duration,
    ) -> Result<(), TransportError> {
        self.send_text("unsubscribe", unsubscribe_frame(sub), deadline).await?;
        self.active.remove(&sub.key());
        debug!(subscription = %sub.key(), "unsubscribed");
        Ok(())
    }

    /// Launch the background ping task. The wait is event-based: a stop
    /// signal interrupts it immediately rather than after a full interval.
    /// A failed ping send marks the session dead, per the session failure
    /// semantics.
    pub fn start_ping(&mut self, interval: Duration) {
        let Some(writer) = self.writer.clone() else {
            return;
        };
        let stop = self.stop.clone();
        let ready = self.ready.clone();
        let last_error = self.last_error.clone();
        let health = self.health.clone();
        self.ping_handle = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        let result = async {
                            writer.lock().await.send(Message::Text(ping_frame().to_string())).await
                        }
                        .await;
                        match result {
                            Ok(()) => trace!("ping_sent"),
                            Err(e) => {
                                warn!(error = %e, "ping_send_failed");
                                record_error(&last_error, format!("ping send failed: {e}"));
                                health.on_error();
                                ready.store(false, Ordering::Release);
                                break;
                            }
                        }
                    }
                }
            }
        }));
    }

    /// Tear the session down, returning within `deadline` even if the socket
    /// is wedged. Workers that fail to join inside the remaining budget are
    /// aborted and abandoned.
    pub async fn close(&mut self, deadline: Duration) {
        let started = Instant::now();
        self.stop.cancel();
        self.ready.store(false, Ordering::Release);

        // Best-effort close frame; capped so a dead peer cannot eat the whole
        // deadline before the joins below run.
        if let Some(writer) = self.writer.take() {
            let budget = (deadline / 2).min(remaining(deadline, started));
            let _ = tokio::time::timeout(budget, async {
                let _ = writer.lock().await.send(Message::Close(None)).await;
            })
            .await;
        }

        let mut workers = Vec::new();
        if let Some(h) = self.ping_handle.take() {
            workers.push(("ping", h));
        }
        if let Some(h) = self.reader_handle.take() {
            workers.push(("reader", h));
        }
        for (name, mut handle) in workers {
            match tokio::time::timeout(remaining(deadline, started), &mut handle).await {
                Ok(_) => {}
                Err(_) => {
                    warn!(task = name, "close_deadline_exceeded_abandoning_worker");
                    handle.abort();
                }
            }
        }

        self.active.clear();
        #[cfg(unix)]
        {
            self.raw_fd = None;
        }
        debug!(elapsed_ms = started.elapsed().as_millis() as u64, "transport_closed");
    }

    /// Cheap composite liveness probe over the underlying session.
    ///
    /// All of the following must hold: the ready signal is set, the frame
    /// reader has not exited, no terminal error has been recorded, and the
    /// raw socket descriptor still answers a non-blocking query. A single
    /// false answer means dead; this is what catches zombie sockets that
    /// look open while nothing flows.
    pub fn is_socket_alive(&self) -> bool {
        if !self.ready.load(Ordering::Acquire) {
            return false;
        }
        if self.reader_done.load(Ordering::Acquire) {
            return false;
        }
        if self.last_error.lock().is_some() {
            return false;
        }
        #[cfg(unix)]
        if let Some(fd) = self.raw_fd {
            // fcntl(F_GETFD) fails iff the descriptor is no longer valid.
            if unsafe { libc::fcntl(fd, libc::F_GETFD) } == -1 {
                return false;
            }
        }
        true
    }

    /// Number of subscriptions in the active map.
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// First terminal error recorded by a worker task, if any.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    async fn send_text(
        &self,
        op: &'static str,
        frame: String,
        deadline: Duration,
    ) -> Result<(), TransportError> {
        let writer = self
            .writer
            .clone()
            .ok_or_else(|| TransportError::failed(op, anyhow!("session is not open")))?;
        let send = async move { writer.lock().await.send(Message::Text(frame)).await };
        match tokio::time::timeout(deadline, send).await {
            Err(_) => Err(TransportError::Timeout { op, deadline }),
            Ok(Err(e)) => Err(TransportError::failed(op, e)),
            Ok(Ok(())) => Ok(()),
        }
    }

    fn spawn_reader(&mut self, mut read: WsSource, writer: Arc<AsyncMutex<WsSink>>) {
        let ready = self.ready.clone();
        let reader_done = self.reader_done.clone();
        let last_error = self.last_error.clone();
        let stop = self.stop.clone();
        let health = self.health.clone();
        let callback = self.callback.clone();

        self.reader_handle = Some(tokio::spawn(async move {
            let mut warned_binary = false;
            loop {
                tokio::select! {
                    biased;
                    _ = stop.cancelled() => break,
                    frame = read.next() => match frame {
                        Some(Ok(Message::Text(text))) => {
                            dispatch_frame(&text, &health, &callback);
                        }
                        Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                            Ok(text) => dispatch_frame(&text, &health, &callback),
                            Err(_) => {
                                if !warned_binary {
                                    warn!("non_utf8_binary_frame");
                                    warned_binary = true;
                                }
                            }
                        },
                        Some(Ok(Message::Ping(payload))) => {
                            let _ = writer.lock().await.send(Message::Pong(payload)).await;
                        }
                        Some(Ok(Message::Close(frame))) => {
                            info!(?frame, "server_close");
                            record_error(&last_error, "server closed connection".to_string());
                            health.on_error();
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            error!(error = %e, "ws_read_error");
                            record_error(&last_error, e.to_string());
                            health.on_error();
                            break;
                        }
                        None => {
                            warn!("stream_ended");
                            record_error(&last_error, "stream ended".to_string());
                            health.on_error();
                            break;
                        }
                    }
                }
            }
            ready.store(false, Ordering::Release);
            reader_done.store(true, Ordering::Release);
        }));
    }
}

fn remaining(deadline: Duration, started: Instant) -> Duration {
    deadline.saturating_sub(started.elapsed())
}

fn record_error(slot: &Mutex<Option<String>>, message: String) {
    let mut guard = slot.lock();
    if guard.is_none() {
        *guard = Some(message);
    }
}

/// Decode one inbound text frame, swallow protocol-internal messages, and
/// hand business payloads to the application.
fn dispatch_frame(text: &str, health: &HealthMonitor, callback: &MessageCallback) {
    let value: serde_json::Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            let snippet: String = text.chars().take(200).collect();
            warn!(error = %e, snippet = %snippet, "frame_parse_error");
            return;
        }
    };

    // Pong replies and subscription acks never reach the application and do
    // not count as data-flow evidence.
    if value.get("method").and_then(|v| v.as_str()) == Some("pong") {
        return;
    }
    match value.get("channel").and_then(|v| v.as_str()) {
        Some("pong") => return,
        Some("subscriptionResponse") => {
            debug!("subscription_ack");
            return;
        }
        _ => {}
    }

    health.on_message();
    if let Err(panic) = std::panic::catch_unwind(AssertUnwindSafe(|| (callback)(value))) {
        let message = if let Some(s) = panic.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = panic.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic".to_string()
        };
        error!(error = %message, "message_callback_panicked");
        health.on_error();
    }
}

/// Raw descriptor of the underlying TCP socket, for the non-blocking
/// validity probe. `None` for stream flavors we cannot see through.
#[cfg(unix)]
fn socket_fd(ws: &WsStream) -> Option<std::os::unix::io::RawFd> {
    use std::os::unix::io::AsRawFd;
    match ws.get_ref() {
        MaybeTlsStream::Plain(tcp) => Some(tcp.as_raw_fd()),
        MaybeTlsStream::NativeTls(tls) => Some(tls.get_ref().get_ref().get_ref().as_raw_fd()),
        _ => None,
    }
}
