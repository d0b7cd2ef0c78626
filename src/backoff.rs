//! Reconnect backoff policy: exponential growth, cap, jitter.
//!
//! Delays grow as `initial * multiplier^attempt` up to `max_delay`, with
//! optional ± jitter so a fleet of clients does not reconnect in lockstep.
//! The policy is reset on every successful entry into the connected state, so
//! a stable session that later dies starts over from `initial_delay`.

use std::time::{Duration, Instant};

use serde::Serialize;

/// Backoff parameters.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Cap on the computed delay (jitter may not push past `(1 + jitter) * max`).
    pub max_delay: Duration,
    /// Multiplicative growth factor per attempt.
    pub multiplier: f64,
    /// Retry budget; 0 means retry forever.
    pub max_attempts: u32,
    /// Jitter as a fraction of the base delay (0.25 => ±25%). 0 disables.
    pub jitter_fraction: f64,
}

impl Default for BackoffConfig {
    /// 1s initial, 60s cap, 2x growth, 10 attempts, ±25% jitter.
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            max_attempts: 10,
            jitter_fraction: 0.25,
        }
    }
}

/// Read-only view for `stats()`.
#[derive(Debug, Clone, Serialize)]
pub struct BackoffSnapshot {
    pub attempt: u32,
    pub max_attempts: u32,
    /// Base delay the next retry would use, before jitter.
    pub next_delay_ms: u64,
    /// Seconds since the last recorded attempt, if any.
    pub seconds_since_last_attempt: Option<f64>,
}

/// Backoff state machine owned by the supervisor.
#[derive(Debug)]
pub struct BackoffPolicy {
    config: BackoffConfig,
    attempt: u32,
    last_attempt_time: Option<Instant>,
    rng_state: u64,
}

impl BackoffPolicy {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            attempt: 0,
            last_attempt_time: None,
            rng_state: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_nanos() as u64)
                .unwrap_or(0x9E37_79B9)
                | 1,
        }
    }

    /// Fast PRNG for jitter (xorshift64), uniform in [0, 1).
    #[inline]
    fn next_random(&mut self) -> f64 {
        self.rng_state ^= self.rng_state << 13;
        self.rng_state ^= self.rng_state >> 7;
        self.rng_state ^= self.rng_state << 17;
        (self.rng_state as f64) / (u64::MAX as f64)
    }

    /// True while the retry budget allows another attempt.
    pub fn should_retry(&self) -> bool {
        self.config.max_attempts == 0 || self.attempt < self.config.max_attempts
    }

    /// Delay before the next connect attempt.
    ///
    /// `base = min(initial * multiplier^attempt, max)`, then
    /// `base + U(-j*base, +j*base)` when jitter is enabled, clamped to be
    /// non-negative.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.base_delay();
        if self.config.jitter_fraction <= 0.0 {
            return base;
        }
        let base_s = base.as_secs_f64();
        let jitter = (self.next_random() * 2.0 - 1.0) * self.config.jitter_fraction * base_s;
        Duration::from_secs_f64((base_s + jitter).max(0.0))
    }

    /// Increment the attempt counter and stamp the attempt time.
    pub fn record_attempt(&mut self) {
        self.attempt = self.attempt.saturating_add(1);
        self.last_attempt_time = Some(Instant::now());
    }

    /// Called on every successful entry into the connected state.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn snapshot(&self) -> BackoffSnapshot {
        BackoffSnapshot {
            attempt: self.attempt,
            max_attempts: self.config.max_attempts,
            next_delay_ms: self.base_delay().as_millis() as u64,
            seconds_since_last_attempt: self.last_attempt_time.map(|t| t.elapsed().as_secs_f64()),
        }
    }

    fn base_delay(&self) -> Duration {
        let grown =
            self.config.initial_delay.as_secs_f64() * self.config.multiplier.powi(self.attempt as i32);
        let capped = if grown.is_finite() {
            grown.min(self.config.max_delay.as_secs_f64())
        } else {
            self.config.max_delay.as_secs_f64()
        };
        Duration::from_secs_f64(capped)
    }
}
