//! Reconnect Backoff
//!
//! Exponential backoff with jitter between upstream connection attempts.
//! The attempt counter only resets once a connection authenticates, so a
//! provider that accepts sockets but rejects every handshake still runs out
//! of attempts.

use std::time::Duration;

use rand::Rng;

/// Backoff parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffConfig {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound on any delay.
    pub max_delay: Duration,
    /// Growth factor per attempt.
    pub multiplier: f64,
    /// Fractional jitter applied to each delay (0.1 = ±10%).
    pub jitter_factor: f64,
    /// Consecutive failures allowed before giving up (0 = unlimited).
    pub max_attempts: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter_factor: 0.1,
            max_attempts: 10,
        }
    }
}

/// Tracks consecutive failures for one connection.
#[derive(Debug)]
pub struct Backoff {
    config: BackoffConfig,
    next_base: Duration,
    attempts: u32,
}

impl Backoff {
    /// Start a fresh schedule.
    #[must_use]
    pub const fn new(config: BackoffConfig) -> Self {
        Self {
            next_base: config.initial_delay,
            config,
            attempts: 0,
        }
    }

    /// Delay before the next attempt, or `None` when attempts are exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.exhausted() {
            return None;
        }
        self.attempts += 1;

        let delay = self.jittered(self.next_base);
        self.next_base = self.grow(self.next_base);
        Some(delay)
    }

    /// Forget past failures.
    pub const fn reset(&mut self) {
        self.next_base = self.config.initial_delay;
        self.attempts = 0;
    }

    /// Failures so far.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Whether no attempts remain.
    #[must_use]
    pub const fn exhausted(&self) -> bool {
        self.config.max_attempts > 0 && self.attempts >= self.config.max_attempts
    }

    fn grow(&self, current: Duration) -> Duration {
        let scaled = current.as_secs_f64() * self.config.multiplier;
        if !scaled.is_finite() || scaled <= 0.0 {
            return self.config.max_delay;
        }
        Duration::try_from_secs_f64(scaled)
            .unwrap_or(self.config.max_delay)
            .min(self.config.max_delay)
    }

    fn jittered(&self, base: Duration) -> Duration {
        if self.config.jitter_factor <= 0.0 || base.is_zero() {
            return base;
        }
        let spread = self.config.jitter_factor.min(1.0);
        let factor = rand::rng().random_range((1.0 - spread)..=(1.0 + spread));
        base.mul_f64(factor).max(Duration::from_millis(1))
    }
}
