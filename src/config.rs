//! Manager configuration.
//!
//! Plain data with production defaults. The library reads no environment
//! variables and persists no state; anything tunable arrives through this
//! struct (the demo binary maps CLI flags onto it).

use std::time::Duration;

use crate::backoff::BackoffConfig;
use crate::subscription::Subscription;

/// Hyperliquid mainnet streaming endpoint.
pub const MAINNET_WS_URL: &str = "wss://api.hyperliquid.xyz/ws";
/// Hyperliquid testnet streaming endpoint.
pub const TESTNET_WS_URL: &str = "wss://api.hyperliquid-testnet.xyz/ws";

/// Everything the supervisor needs to run one logical session.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Venue WebSocket URL. `http(s)://` is rewritten to `ws(s)://`.
    pub endpoint: String,
    /// The intended subscription set, the source of truth across reconnects.
    ///
    /// Liveness is data-driven: include at least one naturally frequent
    /// channel (e.g. `allMids`) or every `data_timeout` window without
    /// traffic will correctly trigger a reconnect.
    pub subscriptions: Vec<Subscription>,
    /// Period of the supervisor's liveness poll.
    pub health_check_interval: Duration,
    /// Idle window after which the stream is declared dead.
    pub data_timeout: Duration,
    /// Idle window after which a warning is logged without declaring death.
    /// `None` defaults to `data_timeout / 2`.
    pub warning_threshold: Option<Duration>,
    /// Bound on socket establishment.
    pub connect_deadline: Duration,
    /// Bound on each subscribe send.
    pub subscribe_deadline: Duration,
    /// Bound on session teardown.
    pub close_deadline: Duration,
    /// Cadence of the application-level `{"method":"ping"}` keepalive.
    pub ping_interval: Duration,
    /// Reconnect delay policy.
    pub backoff: BackoffConfig,
    /// Emit a health snapshot log every N delivered messages.
    pub health_log_every: u64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            endpoint: MAINNET_WS_URL.to_string(),
            subscriptions: Vec::new(),
            health_check_interval: Duration::from_secs(5),
            data_timeout: Duration::from_secs(60),
            warning_threshold: None,
            connect_deadline: Duration::from_secs(30),
            subscribe_deadline: Duration::from_secs(15),
            close_deadline: Duration::from_secs(10),
            ping_interval: Duration::from_secs(10),
            backoff: BackoffConfig::default(),
            health_log_every: 1000,
        }
    }
}

impl ManagerConfig {
    /// Effective warning threshold (explicit value or `data_timeout / 2`).
    pub fn warning_threshold(&self) -> Duration {
        self.warning_threshold.unwrap_or(self.data_timeout / 2)
    }
}
