//! allMids Watch CLI
//!
//! Small operational harness around the session supervisor: subscribes to
//! the venue-wide mid-price channel (plus an optional per-coin book), prints
//! a sample of the stream, and dumps a stats snapshot on a fixed cadence.
//! Ctrl-C requests a graceful stop and the final snapshot is printed before
//! exit.
//!
//! Usage:
//!   cargo run --release --bin allmids_watch
//!   cargo run --release --bin allmids_watch -- --coin BTC --data-timeout-secs 30
//!   RUST_LOG=hlstream=debug cargo run --bin allmids_watch -- --endpoint wss://api.hyperliquid-testnet.xyz/ws

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::info;

use hlstream::{ManagerConfig, SessionSupervisor, Subscription, MAINNET_WS_URL};

#[derive(Parser, Debug)]
#[command(name = "allmids_watch")]
#[command(about = "Watch the Hyperliquid allMids stream through the resilient session manager")]
struct Args {
    /// Venue WebSocket URL (http(s) schemes are rewritten to ws(s))
    #[arg(long, default_value = MAINNET_WS_URL)]
    endpoint: String,

    /// Also subscribe to the L2 book for this coin
    #[arg(long)]
    coin: Option<String>,

    /// Declare the stream dead after this many seconds without data
    #[arg(long, default_value = "60")]
    data_timeout_secs: u64,

    /// Liveness poll period in seconds
    #[arg(long, default_value = "5")]
    check_interval_secs: u64,

    /// Reconnect attempts before giving up (0 = retry forever)
    #[arg(long, default_value = "10")]
    max_attempts: u32,

    /// Print one message sample every N delivered messages
    #[arg(long, default_value = "500")]
    sample_every: u64,

    /// Print a stats snapshot every N seconds
    #[arg(long, default_value = "30")]
    stats_every_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hlstream=info,allmids_watch=info".into()),
        )
        .init();

    let args = Args::parse();

    let mut subscriptions = vec![Subscription::all_mids()];
    if let Some(coin) = &args.coin {
        subscriptions.push(Subscription::l2_book(coin));
    }

    let config = ManagerConfig {
        endpoint: args.endpoint.clone(),
        subscriptions,
        data_timeout: Duration::from_secs(args.data_timeout_secs),
        health_check_interval: Duration::from_secs(args.check_interval_secs),
        backoff: hlstream::BackoffConfig {
            max_attempts: args.max_attempts,
            ..Default::default()
        },
        ..ManagerConfig::default()
    };

    let delivered = Arc::new(AtomicU64::new(0));
    let sample_every = args.sample_every.max(1);
    let counter = delivered.clone();
    let message_callback: hlstream::MessageCallback = Arc::new(move |msg| {
        let n = counter.fetch_add(1, Ordering::Relaxed) + 1;
        if n % sample_every == 1 {
            let channel = msg.get("channel").and_then(|v| v.as_str()).unwrap_or("?");
            println!("[{n}] channel={channel} {msg}");
        }
    });

    let state_callback: hlstream::StateCallback = Arc::new(|state| {
        println!(">>> state: {state}");
    });

    let supervisor = SessionSupervisor::new(config, message_callback, Some(state_callback));

    // Periodic stats dump alongside the run loop.
    let stats_handle = {
        let supervisor = supervisor.clone();
        let every = Duration::from_secs(args.stats_every_secs.max(1));
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(every).await;
                match serde_json::to_string_pretty(&supervisor.stats()) {
                    Ok(json) => println!("--- stats ---\n{json}"),
                    Err(e) => eprintln!("stats serialization failed: {e}"),
                }
            }
        })
    };

    // Ctrl-C requests a graceful stop; run() returns once teardown is done.
    {
        let supervisor = supervisor.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt_received");
                supervisor.stop();
            }
        });
    }

    let outcome = supervisor.run().await;
    stats_handle.abort();

    println!(
        "--- final stats ---\n{}",
        serde_json::to_string_pretty(&supervisor.stats())?
    );
    outcome
}
