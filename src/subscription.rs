//! Subscription descriptors and the venue wire protocol.
//!
//! Every client->server frame is a JSON text frame:
//! - subscribe:   `{"method":"subscribe","subscription":<descriptor>}`
//! - unsubscribe: `{"method":"unsubscribe","subscription":<descriptor>}`
//! - ping:        `{"method":"ping"}`
//!
//! Unsubscribe is exposed for admin tooling but never sent by the supervisor
//! itself; a reconnect always rebuilds the full intended set.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// An opaque subscription descriptor.
///
/// The manager never interprets the payload; it only serializes it into
/// subscribe frames and uses a canonical rendering as the key of the active
/// map. Constructors cover the common Hyperliquid channels; anything else
/// goes through [`Subscription::custom`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Subscription(Value);

impl Subscription {
    /// All mid prices, venue-wide. Ticks frequently, which makes it a good heartbeat
    /// channel for liveness detection.
    pub fn all_mids() -> Self {
        Self(json!({ "type": "allMids" }))
    }

    /// L2 order book for one coin.
    pub fn l2_book(coin: &str) -> Self {
        Self(json!({ "type": "l2Book", "coin": coin }))
    }

    /// Trade prints for one coin.
    pub fn trades(coin: &str) -> Self {
        Self(json!({ "type": "trades", "coin": coin }))
    }

    /// Any descriptor the venue understands.
    pub fn custom(descriptor: Value) -> Self {
        Self(descriptor)
    }

    /// Canonical key for the active subscription map. `serde_json` object
    /// keys are sorted, so two descriptors with the same fields render
    /// identically regardless of construction order.
    pub fn key(&self) -> String {
        self.0.to_string()
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }
}

/// Serialized subscribe frame for one descriptor.
pub fn subscribe_frame(sub: &Subscription) -> String {
    json!({ "method": "subscribe", "subscription": sub.0 }).to_string()
}

/// Serialized unsubscribe frame for one descriptor.
pub fn unsubscribe_frame(sub: &Subscription) -> String {
    json!({ "method": "unsubscribe", "subscription": sub.0 }).to_string()
}

/// Application-level keepalive frame.
pub fn ping_frame() -> &'static str {
    r#"{"method":"ping"}"#
}

/// Rewrite `http(s)://` endpoints to `ws(s)://`. Already-websocket URLs pass
/// through untouched.
pub fn normalize_endpoint(endpoint: &str) -> String {
    if let Some(rest) = endpoint.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = endpoint.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        endpoint.to_string()
    }
}
