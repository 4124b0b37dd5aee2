//! Upstream Feed Adapter
//!
//! WebSocket client for streaming providers, pooled one adapter per
//! connection.
//!
//! - `adapter`: the `BrokerAdapter` implementation and its connection task
//! - `auth`: provider handshake
//! - `backoff`: reconnect schedule
//! - `codec`: JSON and `MessagePack` framing
//! - `heartbeat`: socket liveness
//! - `messages`: wire frames
//! - `registry`: provider name to adapter factory

pub mod adapter;
pub mod auth;
pub mod backoff;
pub mod codec;
pub mod heartbeat;
pub mod messages;
pub mod registry;

pub use adapter::{FeedClientConfig, FeedClientError, WsFeedAdapter};
pub use backoff::BackoffConfig;
pub use codec::WireFormat;
pub use heartbeat::HeartbeatConfig;
pub use registry::{AdapterRegistry, ws_feed_factory};
