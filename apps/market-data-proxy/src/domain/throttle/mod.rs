//! Per-Key Throttling
//!
//! Enforces a minimum interval between ticks delivered for the same routing
//! key. A tick arriving inside the window is dropped, never queued, so the
//! gate adds no latency beyond one interval and never reorders.
//!
//! The gate is shared by every subscriber of a key: the first tick in a
//! window is delivered to all of them and later ones to none.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use super::market_data::RoutingKey;

/// Minimum inter-message interval gate, keyed by routing key.
#[derive(Debug)]
pub struct Throttle {
    interval: Duration,
    last_delivered: HashMap<RoutingKey, Instant>,
}

impl Throttle {
    /// Create a gate with the given interval. A zero interval disables it.
    #[must_use]
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_delivered: HashMap::new(),
        }
    }

    /// Configured interval.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        self.interval
    }

    /// Whether the gate is active.
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        !self.interval.is_zero()
    }

    /// Decide whether a tick for `key` observed at `now` may be delivered.
    ///
    /// Records `now` as the last delivery when it returns `true`.
    pub fn admit(&mut self, key: &RoutingKey, now: Instant) -> bool {
        if !self.is_enabled() {
            return true;
        }

        match self.last_delivered.get_mut(key) {
            Some(last) if now.saturating_duration_since(*last) < self.interval => false,
            Some(last) => {
                *last = now;
                true
            }
            None => {
                self.last_delivered.insert(key.clone(), now);
                true
            }
        }
    }

    /// Forget a key's window, called when the key loses its last subscriber.
    pub fn forget(&mut self, key: &RoutingKey) {
        self.last_delivered.remove(key);
    }

    /// Number of keys with a recorded delivery.
    #[must_use]
    pub fn tracked_keys(&self) -> usize {
        self.last_delivered.len()
    }
}
