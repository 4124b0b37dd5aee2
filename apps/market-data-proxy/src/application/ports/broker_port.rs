//! Broker Adapter Port (Driven Port)
//!
//! Interface every upstream market data provider implements. The connection
//! pool is the only caller of `subscribe`/`unsubscribe`; adapters hand their
//! output to a [`MarketEventSink`] and never touch client state.

use std::fmt;
use std::sync::Arc;

use crate::domain::market_data::{Instrument, Mode, Tick};

// =============================================================================
// Credentials
// =============================================================================

/// Connect parameters for one provider.
///
/// `Debug` redacts both values.
#[derive(Clone, PartialEq, Eq)]
pub struct ProviderCredentials {
    api_key: String,
    api_secret: String,
}

impl ProviderCredentials {
    /// Create credentials.
    #[must_use]
    pub fn new(api_key: impl Into<String>, api_secret: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            api_secret: api_secret.into(),
        }
    }

    /// API key.
    #[must_use]
    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    /// API secret.
    #[must_use]
    pub fn api_secret(&self) -> &str {
        &self.api_secret
    }
}

impl fmt::Debug for ProviderCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderCredentials")
            .field("api_key", &"[REDACTED]")
            .field("api_secret", &"[REDACTED]")
            .finish()
    }
}

// =============================================================================
// Adapter Events
// =============================================================================

/// Lifecycle change of one upstream connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterEventKind {
    /// Connected and authenticated; bound symbols have been re-subscribed.
    Connected,
    /// The connection dropped.
    Disconnected,
    /// A reconnect attempt is scheduled.
    Reconnecting {
        /// Attempt number, starting at 1.
        attempt: u32,
    },
    /// Reconnect attempts are exhausted; the connection will not recover.
    Down {
        /// Last failure.
        reason: String,
    },
    /// The provider reported an error that did not drop the connection.
    Error {
        /// Provider message.
        message: String,
    },
}

/// Lifecycle event tagged with the connection it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterEvent {
    /// Provider name.
    pub provider: String,
    /// Index of the connection within the provider's pool.
    pub connection_index: u32,
    /// What happened.
    pub kind: AdapterEventKind,
}

/// Where adapters deliver normalized ticks and lifecycle events.
///
/// Implementations must never block the caller.
pub trait MarketEventSink: Send + Sync {
    /// Publish one normalized tick.
    fn publish_tick(&self, tick: Tick);

    /// Publish a lifecycle event. Events are never dropped.
    fn publish_event(&self, event: AdapterEvent);
}

// =============================================================================
// Broker Adapter
// =============================================================================

/// Adapter errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdapterError {
    /// The adapter has not been connected.
    #[error("adapter not connected")]
    NotConnected,

    /// The adapter's connection task has stopped.
    #[error("adapter closed")]
    Closed,

    /// Starting the connection failed.
    #[error("connect failed: {0}")]
    ConnectFailed(String),
}

/// One upstream connection to a provider's streaming endpoint.
///
/// Methods are non-blocking: they record intent and hand work to the
/// adapter's own task. An adapter re-issues subscriptions for its whole
/// bound set whenever its connection is re-established.
#[cfg_attr(test, mockall::automock)]
pub trait BrokerAdapter: Send {
    /// Start the connection.
    ///
    /// # Errors
    ///
    /// Returns `AdapterError::ConnectFailed` if the connection task cannot
    /// be started.
    fn connect(&mut self, credentials: &ProviderCredentials) -> Result<(), AdapterError>;

    /// Bind instruments at a mode and subscribe upstream.
    ///
    /// # Errors
    ///
    /// Returns an error if the adapter is not connected or has stopped.
    fn subscribe(&mut self, instruments: &[Instrument], mode: Mode) -> Result<(), AdapterError>;

    /// Unbind provider symbols at a mode and unsubscribe upstream.
    ///
    /// # Errors
    ///
    /// Returns an error if the adapter is not connected or has stopped.
    fn unsubscribe(&mut self, provider_symbols: &[String], mode: Mode)
    -> Result<(), AdapterError>;

    /// Close the connection and stop the adapter's task.
    fn disconnect(&mut self);
}

/// What a factory needs to build one adapter instance.
#[derive(Clone)]
pub struct AdapterContext {
    /// Provider name.
    pub provider: String,
    /// Index of the connection within the provider's pool.
    pub connection_index: u32,
    /// Output for ticks and lifecycle events.
    pub sink: Arc<dyn MarketEventSink>,
}

impl fmt::Debug for AdapterContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdapterContext")
            .field("provider", &self.provider)
            .field("connection_index", &self.connection_index)
            .finish_non_exhaustive()
    }
}

/// Builds adapter instances for one provider.
pub type AdapterFactory = Arc<dyn Fn(AdapterContext) -> Box<dyn BrokerAdapter> + Send + Sync>;
