//! Application Services
//!
//! - `pool`: per-provider connection sharding
//! - `router`: the proxy core driven by the event loop

pub mod pool;
pub mod router;

pub use pool::{
    Binding, ConnectionPool, ConnectionSnapshot, ConnectionStatus, PoolError, PoolLimits,
    PoolSnapshot, ProviderPools,
};
pub use router::{CoreConfig, CoreError, MaintenanceReport, ProxyCore, RouteOutcome, UnsubscribeSummary};
