//! Client Port (Driving side)
//!
//! What the proxy core hands to a connected client. The core never writes to
//! sockets; it pushes [`Outbound`] messages into a [`ClientSink`], and the
//! transport serializes them in its own task.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::domain::market_data::{Mode, Tick};
use crate::domain::subscription::ClientId;

// =============================================================================
// Subscription Results
// =============================================================================

/// A `(symbol, venue)` pair as the client sent it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionItem {
    /// Client-facing symbol.
    pub symbol: String,
    /// Venue code.
    pub venue: String,
}

impl SubscriptionItem {
    /// Create an item.
    #[must_use]
    pub fn new(symbol: impl Into<String>, venue: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            venue: venue.into(),
        }
    }
}

/// Why one entry of a subscribe request was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SubscribeRejection {
    /// The symbol resolver does not know the pair.
    #[error("unknown symbol")]
    UnknownSymbol,

    /// The resolved provider has no configured pool.
    #[error("unknown provider")]
    UnknownProvider,

    /// Every connection is full and the pool may not grow.
    #[error("connection pool exhausted")]
    PoolExhausted,

    /// The provider's adapter could not be started or has stopped.
    #[error("provider unavailable")]
    AdapterUnavailable,
}

impl SubscribeRejection {
    /// Wire code.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::UnknownSymbol => "UnknownSymbol",
            Self::UnknownProvider => "UnknownProvider",
            Self::PoolExhausted => "PoolExhausted",
            Self::AdapterUnavailable => "AdapterUnavailable",
        }
    }
}

/// A refused entry of a subscribe request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedItem {
    /// The refused pair.
    pub item: SubscriptionItem,
    /// Why it was refused.
    pub reason: SubscribeRejection,
}

// =============================================================================
// Outbound Messages
// =============================================================================

/// Response to a client request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// The session was created.
    Authenticated {
        /// Server-generated client id.
        client_id: ClientId,
        /// Identity the token resolved to.
        user_id: String,
    },
    /// Outcome of a subscribe request.
    Subscribed {
        /// Requested mode.
        mode: Mode,
        /// Entries now subscribed (including ones already held).
        accepted: Vec<SubscriptionItem>,
        /// Entries refused, with reasons.
        rejected: Vec<RejectedItem>,
    },
    /// Outcome of an unsubscribe request.
    Unsubscribed {
        /// Number of routing keys removed from the session.
        removed: usize,
    },
    /// The session was destroyed on request.
    LoggedOut,
    /// Application-level keepalive answer.
    Pong,
}

/// Anything the core sends to a client.
#[derive(Debug, Clone)]
pub enum Outbound {
    /// A market data push.
    Tick(Arc<Tick>),
    /// A response to a request.
    Reply(Reply),
}

// =============================================================================
// Client Sink
// =============================================================================

/// Why a push did not reach the client's queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PushError {
    /// The client's writer has gone; the session must be dropped.
    #[error("client queue closed")]
    Closed,

    /// The client's queue is full; this message is lost for this client.
    #[error("client queue full")]
    Full,
}

/// Non-blocking handle to one client's outbound queue.
pub trait ClientSink {
    /// Enqueue a message without waiting.
    ///
    /// # Errors
    ///
    /// Returns `PushError::Full` when the queue has no room and
    /// `PushError::Closed` when the receiving side is gone.
    fn try_push(&self, message: Outbound) -> Result<(), PushError>;
}

impl ClientSink for mpsc::Sender<Outbound> {
    fn try_push(&self, message: Outbound) -> Result<(), PushError> {
        self.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => PushError::Full,
            mpsc::error::TrySendError::Closed(_) => PushError::Closed,
        })
    }
}
