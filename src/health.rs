//! Data-flow liveness monitor.
//!
//! The monitor answers one question, "is the stream carrying data?", from a
//! single signal: the timestamp of the last frame forwarded to the
//! application. It is deliberately blind to which channel delivered a frame
//! and to socket-level health; the socket probe lives on the transport.
//! Counters are cumulative across reconnects; only the timestamps re-arm on
//! each new session.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::warn;

#[derive(Debug, Clone)]
struct HealthStats {
    total_messages: u64,
    total_reconnects: u64,
    total_errors: u64,
    start_time: Instant,
    last_message_time: Instant,
}

/// Snapshot for `stats()` and the periodic health log.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub is_alive: bool,
    pub idle_seconds: f64,
    pub timeout_seconds: f64,
    /// 100 at zero idle, linearly down to 0 at `timeout`.
    pub health_percentage: f64,
    pub uptime_seconds: f64,
    pub total_messages: u64,
    pub total_reconnects: u64,
    pub total_errors: u64,
}

/// Tracks message flow and answers liveness queries under a mutex.
///
/// Mutations are O(1) and called once per inbound frame; this is not a hot
/// lock.
#[derive(Debug)]
pub struct HealthMonitor {
    timeout: Duration,
    warning_threshold: Duration,
    inner: Mutex<HealthStats>,
    warned: AtomicBool,
}

impl HealthMonitor {
    /// `warning_threshold` must be below `timeout`; pass `None` to default it
    /// to `timeout / 2`.
    pub fn new(timeout: Duration, warning_threshold: Option<Duration>) -> Self {
        let now = Instant::now();
        Self {
            timeout,
            warning_threshold: warning_threshold.unwrap_or(timeout / 2),
            inner: Mutex::new(HealthStats {
                total_messages: 0,
                total_reconnects: 0,
                total_errors: 0,
                start_time: now,
                last_message_time: now,
            }),
            warned: AtomicBool::new(false),
        }
    }

    /// Record one delivered frame.
    #[inline]
    pub fn on_message(&self) {
        let mut s = self.inner.lock();
        s.last_message_time = Instant::now();
        s.total_messages += 1;
        drop(s);
        self.warned.store(false, Ordering::Relaxed);
    }

    /// Record an error seen at the transport boundary (or in the callback).
    #[inline]
    pub fn on_error(&self) {
        self.inner.lock().total_errors += 1;
    }

    /// Record the start of a reconnect cycle.
    #[inline]
    pub fn on_reconnect(&self) {
        self.inner.lock().total_reconnects += 1;
    }

    /// True while the idle window is within the data timeout.
    pub fn is_alive(&self) -> bool {
        self.idle() < self.timeout
    }

    /// True once the idle window crosses the warning threshold. Logs a single
    /// warning per stall episode; the flag re-arms on the next message.
    pub fn warning(&self) -> bool {
        let idle = self.idle();
        if idle < self.warning_threshold {
            return false;
        }
        if !self.warned.swap(true, Ordering::Relaxed) {
            warn!(
                idle_seconds = idle.as_secs_f64(),
                warning_threshold_seconds = self.warning_threshold.as_secs_f64(),
                "data_stall_warning"
            );
        }
        true
    }

    /// Re-arm the idle window for a fresh session. Counters are preserved so
    /// observers see cumulative history across reconnects.
    pub fn reset(&self) {
        self.inner.lock().last_message_time = Instant::now();
        self.warned.store(false, Ordering::Relaxed);
    }

    pub fn total_messages(&self) -> u64 {
        self.inner.lock().total_messages
    }

    /// Consistent snapshot with derived values.
    pub fn report(&self) -> HealthReport {
        let s = self.inner.lock().clone();
        let idle = s.last_message_time.elapsed();
        let timeout_s = self.timeout.as_secs_f64();
        let idle_s = idle.as_secs_f64();
        HealthReport {
            is_alive: idle < self.timeout,
            idle_seconds: idle_s,
            timeout_seconds: timeout_s,
            health_percentage: (100.0 * (1.0 - idle_s / timeout_s)).clamp(0.0, 100.0),
            uptime_seconds: s.start_time.elapsed().as_secs_f64(),
            total_messages: s.total_messages,
            total_reconnects: s.total_reconnects,
            total_errors: s.total_errors,
        }
    }

    fn idle(&self) -> Duration {
        self.inner.lock().last_message_time.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn test_counters_increment_exactly() {
        let m = HealthMonitor::new(Duration::from_secs(60), None);
        for _ in 0..5 {
            m.on_message();
        }
        m.on_error();
        m.on_reconnect();
        m.on_reconnect();
        let r = m.report();
        assert_eq!(r.total_messages, 5);
        assert_eq!(r.total_errors, 1);
        assert_eq!(r.total_reconnects, 2);
    }

    #[test]
    fn test_alive_tracks_idle_window() {
        let m = HealthMonitor::new(Duration::from_millis(50), None);
        assert!(m.is_alive());
        sleep(Duration::from_millis(70));
        assert!(!m.is_alive());
        m.on_message();
        assert!(m.is_alive());
    }

    #[test]
    fn test_warning_fires_before_death() {
        let m = HealthMonitor::new(Duration::from_millis(100), Some(Duration::from_millis(20)));
        assert!(!m.warning());
        sleep(Duration::from_millis(40));
        assert!(m.warning());
        assert!(m.is_alive(), "warning threshold must not imply death");
    }

    #[test]
    fn test_reset_preserves_counters() {
        let m = HealthMonitor::new(Duration::from_millis(40), None);
        m.on_message();
        m.on_message();
        m.on_error();
        sleep(Duration::from_millis(60));
        assert!(!m.is_alive());
        m.reset();
        assert!(m.is_alive());
        let r = m.report();
        assert_eq!(r.total_messages, 2);
        assert_eq!(r.total_errors, 1);
    }

    #[test]
    fn test_health_percentage_clamps() {
        let m = HealthMonitor::new(Duration::from_millis(30), None);
        let r = m.report();
        assert!(r.health_percentage > 90.0);
        sleep(Duration::from_millis(80));
        let r = m.report();
        assert_eq!(r.health_percentage, 0.0);
        assert!(!r.is_alive);
    }

    #[test]
    fn test_warning_default_is_half_timeout() {
        let m = HealthMonitor::new(Duration::from_millis(80), None);
        sleep(Duration::from_millis(50));
        // Past 40ms (half of 80ms) but below the timeout itself.
        assert!(m.warning());
        assert!(m.is_alive());
    }
}
