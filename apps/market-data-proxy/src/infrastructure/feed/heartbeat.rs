//! Upstream Heartbeat
//!
//! Liveness tracking for one provider socket. The connection task owns the
//! monitor, feeds it every inbound frame and polls it on a timer; the
//! monitor answers whether to ping or give up on the socket.

use std::time::{Duration, Instant};

/// Heartbeat timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatConfig {
    /// Interval between pings.
    pub ping_interval: Duration,
    /// Silence after which the socket is considered dead.
    pub timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(30),
            timeout: Duration::from_secs(60),
        }
    }
}

/// Result of polling the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatAction {
    /// Send a ping frame.
    SendPing,
    /// Nothing was heard for too long; reconnect.
    Timeout,
}

/// Tracks the last time anything arrived from the provider.
#[derive(Debug)]
pub struct HeartbeatMonitor {
    config: HeartbeatConfig,
    last_seen: Instant,
}

impl HeartbeatMonitor {
    /// Start monitoring a socket opened at `now`.
    #[must_use]
    pub const fn new(config: HeartbeatConfig, now: Instant) -> Self {
        Self {
            config,
            last_seen: now,
        }
    }

    /// Interval at which [`poll`](Self::poll) should be called.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        self.config.ping_interval
    }

    /// Record inbound traffic (data, pong or ping).
    pub const fn record_activity(&mut self, now: Instant) {
        self.last_seen = now;
    }

    /// Time since the last inbound frame.
    #[must_use]
    pub fn silence(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_seen)
    }

    /// Decide what to do on a timer tick.
    #[must_use]
    pub fn poll(&self, now: Instant) -> HeartbeatAction {
        if self.silence(now) >= self.config.timeout {
            HeartbeatAction::Timeout
        } else {
            HeartbeatAction::SendPing
        }
    }
}
