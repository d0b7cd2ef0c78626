//! Session supervisor: owns the state machine, the intended subscription
//! set, the health monitor, and the backoff policy; creates, observes, and
//! replaces transport sessions.
//!
//! The supervisor task is the single writer of [`ConnectionState`]. All of
//! its waits are cancellable and every call into the transport is deadlined,
//! so no code path here can block for unbounded time. An unbounded block on
//! a half-open socket is the historical failure mode this module exists to
//! prevent.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backoff::{BackoffPolicy, BackoffSnapshot};
use crate::config::ManagerConfig;
use crate::health::{HealthMonitor, HealthReport};
use crate::state::{ConnectionState, DisconnectReason};
use crate::transport::{MessageCallback, TransportSession};

/// Invoked synchronously on every state transition. Must be non-blocking;
/// offload heavy work. Panics are caught and logged.
pub type StateCallback = Arc<dyn Fn(ConnectionState) + Send + Sync>;

/// Read-only observation snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct ManagerStats {
    pub state: String,
    pub health: HealthReport,
    pub backoff: BackoffSnapshot,
    pub intended_subscription_count: usize,
}

// =============================================================================
// SUPERVISOR
// =============================================================================

/// Maintains one long-lived logical session across any number of physical
/// connections.
pub struct SessionSupervisor {
    config: ManagerConfig,
    health: Arc<HealthMonitor>,
    backoff: Mutex<BackoffPolicy>,
    state: RwLock<ConnectionState>,
    message_callback: MessageCallback,
    state_callback: Option<StateCallback>,
    stop: CancellationToken,
    running: AtomicBool,
}

impl SessionSupervisor {
    pub fn new(
        config: ManagerConfig,
        message_callback: MessageCallback,
        state_callback: Option<StateCallback>,
    ) -> Arc<Self> {
        let health = Arc::new(HealthMonitor::new(
            config.data_timeout,
            Some(config.warning_threshold()),
        ));
        let backoff = Mutex::new(BackoffPolicy::new(config.backoff.clone()));
        Arc::new(Self {
            config,
            health,
            backoff,
            state: RwLock::new(ConnectionState::Disconnected),
            message_callback,
            state_callback,
            stop: CancellationToken::new(),
            running: AtomicBool::new(false),
        })
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    /// Snapshot of state, health, backoff, and the intended set size. Keeps
    /// serving the final values after a terminal exit.
    pub fn stats(&self) -> ManagerStats {
        ManagerStats {
            state: self.state().to_string(),
            health: self.health.report(),
            backoff: self.backoff.lock().snapshot(),
            intended_subscription_count: self.config.subscriptions.len(),
        }
    }

    /// Request graceful shutdown. The run loop observes this at its next
    /// cancellable wait (worst case ≈ one `health_check_interval`) and
    /// returns after a bounded close.
    pub fn stop(&self) {
        info!("stop_requested");
        self.stop.cancel();
    }

    /// Run until `stop()` or until the retry budget is exhausted.
    ///
    /// Returns `Ok(())` after a clean stop (state `Disconnected`) and an
    /// error once the backoff policy refuses to continue (state `Failed`;
    /// the instance is not reusable until reconstructed). All recoverable
    /// failures are handled internally.
    pub async fn run(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            bail!("supervisor is already running");
        }
        if self.state() == ConnectionState::Failed {
            self.running.store(false, Ordering::SeqCst);
            bail!("supervisor has failed; construct a new instance");
        }
        let result = self.run_inner().await;
        self.running.store(false, Ordering::SeqCst);
        result
    }

    async fn run_inner(&self) -> Result<()> {
        loop {
            if self.stop.is_cancelled() {
                self.set_state(ConnectionState::Disconnected);
                return Ok(());
            }

            self.set_state(ConnectionState::Connecting);
            let mut session =
                TransportSession::new(self.health.clone(), self.message_callback.clone());

            let reason = match self.establish(&mut session).await {
                Ok(()) => {
                    // Fresh idle window, fresh retry budget.
                    self.health.reset();
                    self.backoff.lock().reset();
                    self.set_state(ConnectionState::Connected);
                    info!(
                        endpoint = %self.config.endpoint,
                        subscriptions = self.config.subscriptions.len(),
                        "session_connected"
                    );
                    session.start_ping(self.config.ping_interval);
                    self.monitor(&session).await
                }
                Err(reason) => reason,
            };

            session.close(self.config.close_deadline).await;

            if reason == DisconnectReason::StopRequested || self.stop.is_cancelled() {
                self.set_state(ConnectionState::Disconnected);
                info!("session_stopped");
                return Ok(());
            }

            self.set_state(ConnectionState::Reconnecting);
            self.health.on_reconnect();

            let (retry, delay, attempt) = {
                let mut backoff = self.backoff.lock();
                if backoff.should_retry() {
                    let delay = backoff.next_delay();
                    backoff.record_attempt();
                    (true, delay, backoff.attempt())
                } else {
                    (false, Duration::ZERO, backoff.attempt())
                }
            };

            if !retry {
                self.set_state(ConnectionState::Failed);
                let report = self.health.report();
                error!(
                    reason = %reason,
                    attempts = attempt,
                    total_messages = report.total_messages,
                    total_reconnects = report.total_reconnects,
                    total_errors = report.total_errors,
                    uptime_seconds = report.uptime_seconds,
                    "retry_budget_exhausted"
                );
                bail!("retry budget exhausted after {attempt} attempts (last failure: {reason})");
            }

            warn!(
                reason = %reason,
                attempt,
                next_delay_ms = delay.as_millis() as u64,
                "reconnect_backoff"
            );

            // The backoff sleep must not outlive a stop request.
            tokio::select! {
                _ = self.stop.cancelled() => {
                    self.set_state(ConnectionState::Disconnected);
                    return Ok(());
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Open the socket and replay the intended subscription set. Any failure
    /// aborts the whole session; no partial-subscription state may leak into
    /// `Connected`.
    async fn establish(&self, session: &mut TransportSession) -> Result<(), DisconnectReason> {
        if let Err(e) = session
            .open(&self.config.endpoint, self.config.connect_deadline)
            .await
        {
            warn!(error = %e, "connect_failed");
            self.health.on_error();
            return Err(if e.is_timeout() {
                DisconnectReason::ConnectTimeout
            } else {
                DisconnectReason::ConnectFailed
            });
        }

        debug!(count = self.config.subscriptions.len(), "subscribing_intended_set");
        for sub in &self.config.subscriptions {
            if let Err(e) = session.subscribe(sub, self.config.subscribe_deadline).await {
                warn!(error = %e, subscription = %sub.key(), "subscribe_failed");
                self.health.on_error();
                return Err(if e.is_timeout() {
                    DisconnectReason::SubscribeTimeout
                } else {
                    DisconnectReason::SubscribeFailed
                });
            }
        }

        // The socket can die mid-burst; a dead session must not reach
        // Connected with a short active map.
        if !session.is_socket_alive() {
            warn!(error = ?session.last_error(), "socket_died_during_subscribe");
            self.health.on_error();
            return Err(DisconnectReason::SocketDead);
        }
        Ok(())
    }

    /// Watch a connected session until it dies or stop is requested.
    /// Two-layer liveness: the socket probe catches dead transports, the
    /// health monitor catches zombies where the socket looks open but no
    /// data flows.
    async fn monitor(&self, session: &TransportSession) -> DisconnectReason {
        let mut check = tokio::time::interval(self.config.health_check_interval);
        check.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        check.tick().await;

        let log_every = self.config.health_log_every.max(1);
        let mut logged_bucket = self.health.total_messages() / log_every;

        loop {
            tokio::select! {
                _ = self.stop.cancelled() => return DisconnectReason::StopRequested,
                _ = check.tick() => {
                    if !session.is_socket_alive() {
                        let last_error = session.last_error();
                        warn!(error = ?last_error, "socket_probe_failed");
                        return match last_error.as_deref() {
                            Some(e) if e.contains("server closed") => DisconnectReason::ServerClose,
                            Some(_) => DisconnectReason::NetworkError,
                            None => DisconnectReason::SocketDead,
                        };
                    }
                    if !self.health.is_alive() {
                        let report = self.health.report();
                        warn!(idle_seconds = report.idle_seconds, "data_stream_dead");
                        return DisconnectReason::DataStale;
                    }
                    self.health.warning();

                    let bucket = self.health.total_messages() / log_every;
                    if bucket > logged_bucket {
                        logged_bucket = bucket;
                        let r = self.health.report();
                        info!(
                            total_messages = r.total_messages,
                            total_reconnects = r.total_reconnects,
                            total_errors = r.total_errors,
                            uptime_seconds = r.uptime_seconds,
                            idle_seconds = r.idle_seconds,
                            health_percentage = r.health_percentage,
                            "health_snapshot"
                        );
                    }
                }
            }
        }
    }

    /// Transition to `next`, log it, and fire the state callback outside the
    /// lock. Same-state writes are dropped so observers never see duplicate
    /// transitions.
    fn set_state(&self, next: ConnectionState) {
        let previous = {
            let mut guard = self.state.write();
            let previous = *guard;
            if previous == next {
                return;
            }
            debug_assert!(
                previous.can_transition(next),
                "illegal transition {previous} -> {next}"
            );
            *guard = next;
            previous
        };

        info!(from = %previous, to = %next, "session_transition");

        if let Some(callback) = &self.state_callback {
            if std::panic::catch_unwind(AssertUnwindSafe(|| (callback)(next))).is_err() {
                error!(state = %next, "state_callback_panicked");
            }
        }
    }
}
