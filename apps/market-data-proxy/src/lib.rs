#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::items_after_statements,
        clippy::panic
    )
)]

//! Market Data Proxy - Real-time Tick Fan-out
//!
//! A WebSocket proxy that keeps a small pool of upstream provider
//! connections, shards symbol subscriptions across them, and fans normalized
//! ticks out to many authenticated clients.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Routing types and bookkeeping
//!   - `market_data`: Modes, routing keys, normalized ticks
//!   - `subscription`: Subscription index and client registry
//!   - `throttle`: Per-key delivery interval
//!
//! - **Application**: Ports and the proxy core
//!   - `ports`: Broker adapter, client sink and lookup interfaces
//!   - `services`: Connection pools and the subscription router
//!
//! - **Infrastructure**: Adapters and runtime
//!   - `bus`: Drop-oldest tick lane plus lossless control lane
//!   - `feed`: Upstream WebSocket adapter (JSON or MessagePack)
//!   - `server`: Client protocol, connection tasks, event loop
//!   - `lookup`: Token, symbol master and credential collaborators
//!   - `config`, `health`, `metrics`, `telemetry`
//!
//! # Data Flow
//!
//! ```text
//! provider WS ─► WsFeedAdapter ─┐
//! provider WS ─► WsFeedAdapter ─┼─► Message Bus ─► Event Loop ─┬─► Client 1
//! provider WS ─► WsFeedAdapter ─┘   (drop-oldest)  (index,     ├─► Client 2
//!                                                   throttle)  └─► Client N
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Routing types with no I/O.
pub mod domain;

/// Application layer - Ports and the proxy core.
pub mod application;

/// Infrastructure layer - Adapters and runtime.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::market_data::{DepthLevel, Instrument, Mode, RoutingKey, Tick};
pub use domain::subscription::{ClientId, RegistryStats, SubscriptionRegistry};
pub use domain::throttle::Throttle;

// Ports
pub use application::ports::{
    AdapterContext, AdapterError, AdapterEvent, AdapterEventKind, AdapterFactory, BrokerAdapter,
    ClientSink, CredentialStore, Identity, IdentityError, IdentityValidator, LookupError,
    MarketEventSink, Outbound, ProviderCredentials, Reply, ResolvedSymbol, SubscribeRejection,
    SubscriptionItem, SymbolResolver,
};

// Core
pub use application::services::{
    ConnectionPool, ConnectionStatus, CoreConfig, PoolLimits, PoolSnapshot, ProviderPools,
    ProxyCore, RouteOutcome,
};

// Infrastructure
pub use infrastructure::bus::{
    BusConsumer, BusPublisher, BusStats, EventReceiver, TickReceiver, message_bus,
};
pub use infrastructure::config::{ConfigError, ProviderSettings, ProxyConfig};
pub use infrastructure::feed::{AdapterRegistry, FeedClientConfig, WireFormat, WsFeedAdapter};
pub use infrastructure::health::{
    HealthServer, HealthServerError, HealthServerState, HealthSnapshot, SharedHealth,
};
pub use infrastructure::lookup::{EnvCredentialStore, StaticTokenValidator, SymbolMaster};
pub use infrastructure::server::{ConnectionContext, EventLoop, ProxyServer, ServerError};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
