//! # hlstream
//!
//! Resilient WebSocket session manager for the Hyperliquid streaming
//! endpoint: one long-lived logical subscription session, at most one live
//! physical connection, best-effort continuous delivery across transient
//! failures.
//!
//! The hard part is the supervision machinery, not the wire protocol:
//!
//! | Component | Responsibility |
//! |-----------|----------------|
//! | [`BackoffPolicy`] | Reconnect delays: exponential growth, cap, jitter, retry budget. |
//! | [`HealthMonitor`] | Data-flow liveness: "is the stream alive?" under a configurable idle timeout. |
//! | [`TransportSession`] | One physical connection: deadlined open/subscribe/close, frame reader, keepalive ping, zombie-socket probe. |
//! | [`SessionSupervisor`] | The state machine driving it all: connect, resubscribe, watch, back off, retry. |
//!
//! Every call into the transport runs under a wall-clock deadline, so a
//! half-open TCP connection or a stalled handshake cannot hang the
//! supervisor. Liveness is data-driven: configure at least one naturally
//! frequent subscription (e.g. [`Subscription::all_mids`]) or the idle
//! timeout will (correctly) recycle the connection forever.
//!
//! Messages are delivered in order within a session; a reconnect implies a
//! gap, and detecting or back-filling that gap is the application's concern.
//!
//! ```no_run
//! use std::sync::Arc;
//! use hlstream::{ManagerConfig, SessionSupervisor, Subscription};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = ManagerConfig {
//!         subscriptions: vec![Subscription::all_mids()],
//!         ..ManagerConfig::default()
//!     };
//!     let supervisor = SessionSupervisor::new(
//!         config,
//!         Arc::new(|msg| println!("{msg}")),
//!         None,
//!     );
//!     supervisor.run().await
//! }
//! ```

pub mod backoff;
pub mod config;
pub mod health;
pub mod state;
pub mod subscription;
pub mod supervisor;
pub mod transport;

pub use backoff::{BackoffConfig, BackoffPolicy, BackoffSnapshot};
pub use config::{ManagerConfig, MAINNET_WS_URL, TESTNET_WS_URL};
pub use health::{HealthMonitor, HealthReport};
pub use state::{ConnectionState, DisconnectReason};
pub use subscription::Subscription;
pub use supervisor::{ManagerStats, SessionSupervisor, StateCallback};
pub use transport::{MessageCallback, TransportError, TransportSession};
