//! Connection Pool
//!
//! Shards a provider's symbols across upstream connections.
//!
//! # Sharding
//!
//! Binding a new symbol scans live connections in index order for one with
//! spare capacity. When every connection is full and the pool is below its
//! connection limit, a new connection is created, connected and used;
//! otherwise the bind fails with [`PoolError::Exhausted`].
//!
//! Capacity counts distinct provider symbols. A symbol bound at several
//! modes occupies one slot on one connection.
//!
//! # Shrinking
//!
//! Unbinding never closes a connection. [`ConnectionPool::compact`] closes
//! connections that have been empty for longer than a grace period, and
//! empty `Down` connections at once. Connection indices are never reused.
//!
//! # Recovery
//!
//! A `Down` connection that still holds symbols keeps its slot.
//! [`ConnectionPool::reopen_down`] gives it a fresh adapter under the same
//! index and re-subscribes everything it holds.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::application::ports::{
    AdapterContext, AdapterError, AdapterFactory, BrokerAdapter, CredentialStore, MarketEventSink,
};
use crate::domain::market_data::{Instrument, Mode};

// =============================================================================
// Types
// =============================================================================

/// Per-provider pool limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolLimits {
    /// Maximum distinct symbols bound to one connection.
    pub max_symbols_per_connection: usize,
    /// Maximum live connections.
    pub max_connections: usize,
}

impl Default for PoolLimits {
    fn default() -> Self {
        Self {
            max_symbols_per_connection: 1000,
            max_connections: 3,
        }
    }
}

/// Upstream state of one connection as last reported by its adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// Started, not yet authenticated.
    Connecting,
    /// Authenticated and streaming.
    Connected,
    /// Dropped; reconnecting with backoff.
    Reconnecting {
        /// Current attempt.
        attempt: u32,
    },
    /// Reconnect attempts exhausted.
    Down,
}

impl ConnectionStatus {
    /// Lower-case name for health output.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting { .. } => "reconnecting",
            Self::Down => "down",
        }
    }
}

/// Pool errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    /// Every connection is full and the pool is at its connection limit.
    #[error("pool exhausted for provider {provider}: {connections} connections x {capacity} symbols")]
    Exhausted {
        /// Provider name.
        provider: String,
        /// Live connections.
        connections: usize,
        /// Per-connection capacity.
        capacity: usize,
    },

    /// Credentials for a new connection could not be obtained.
    #[error("credentials unavailable: {0}")]
    Credentials(String),

    /// The adapter refused the operation.
    #[error("adapter error: {0}")]
    Adapter(#[from] AdapterError),
}

/// Where a bind landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Binding {
    /// Connection the symbol is bound to.
    pub connection_index: u32,
    /// A connection was created for this bind.
    pub new_connection: bool,
}

struct BoundSymbol {
    instrument: Instrument,
    modes: BTreeSet<Mode>,
}

/// One pooled upstream connection.
struct ProviderConnection {
    index: u32,
    adapter: Box<dyn BrokerAdapter>,
    bound: HashMap<String, BoundSymbol>,
    status: ConnectionStatus,
    empty_since: Option<Instant>,
}

impl ProviderConnection {
    fn has_room(&self, capacity: usize) -> bool {
        self.status != ConnectionStatus::Down && self.bound.len() < capacity
    }
}

/// Read-only view of one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSnapshot {
    /// Connection index.
    pub index: u32,
    /// Distinct symbols bound.
    pub bound_symbols: usize,
    /// Per-connection capacity.
    pub capacity: usize,
    /// Last reported status.
    pub status: ConnectionStatus,
}

/// Read-only view of one provider's pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolSnapshot {
    /// Provider name.
    pub provider: String,
    /// Live connections in index order.
    pub connections: Vec<ConnectionSnapshot>,
}

impl PoolSnapshot {
    /// Total bound symbols.
    #[must_use]
    pub fn bound_symbols(&self) -> usize {
        self.connections.iter().map(|c| c.bound_symbols).sum()
    }

    /// Connections currently reporting `Connected`.
    #[must_use]
    pub fn connected(&self) -> usize {
        self.connections
            .iter()
            .filter(|c| c.status == ConnectionStatus::Connected)
            .count()
    }
}

// =============================================================================
// Connection Pool
// =============================================================================

/// A provider's pooled upstream connections.
pub struct ConnectionPool {
    provider: String,
    limits: PoolLimits,
    factory: AdapterFactory,
    credentials: Arc<dyn CredentialStore>,
    sink: Arc<dyn MarketEventSink>,
    connections: Vec<ProviderConnection>,
    symbol_to_connection: HashMap<String, u32>,
    next_index: u32,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("provider", &self.provider)
            .field("limits", &self.limits)
            .field("connections", &self.connections.len())
            .field("bound_symbols", &self.symbol_to_connection.len())
            .finish_non_exhaustive()
    }
}

impl ConnectionPool {
    /// Create an empty pool. No connection is opened until the first bind.
    #[must_use]
    pub fn new(
        provider: impl Into<String>,
        limits: PoolLimits,
        factory: AdapterFactory,
        credentials: Arc<dyn CredentialStore>,
        sink: Arc<dyn MarketEventSink>,
    ) -> Self {
        Self {
            provider: provider.into(),
            limits,
            factory,
            credentials,
            sink,
            connections: Vec::new(),
            symbol_to_connection: HashMap::new(),
            next_index: 0,
        }
    }

    /// Provider name.
    #[must_use]
    pub fn provider(&self) -> &str {
        &self.provider
    }

    /// Configured limits.
    #[must_use]
    pub const fn limits(&self) -> PoolLimits {
        self.limits
    }

    /// Bind an instrument at a mode.
    ///
    /// Binding an already bound symbol at a new mode reuses its connection.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::Exhausted` when no connection has room and the
    /// pool may not grow, or an adapter/credential error when a connection
    /// cannot be started or refuses the subscription.
    pub fn bind(
        &mut self,
        instrument: &Instrument,
        mode: Mode,
        now: Instant,
    ) -> Result<Binding, PoolError> {
        let symbol = instrument.provider_symbol.as_str();

        if let Some(&index) = self.symbol_to_connection.get(symbol) {
            let conn = self.connection_mut(index).ok_or(AdapterError::Closed)?;
            let Some(bound) = conn.bound.get_mut(symbol) else {
                return Err(AdapterError::Closed.into());
            };
            if bound.modes.insert(mode) {
                if let Err(e) = conn.adapter.subscribe(std::slice::from_ref(instrument), mode) {
                    bound.modes.remove(&mode);
                    return Err(e.into());
                }
            }
            return Ok(Binding {
                connection_index: index,
                new_connection: false,
            });
        }

        let capacity = self.limits.max_symbols_per_connection;
        let (position, new_connection) =
            match self.connections.iter().position(|c| c.has_room(capacity)) {
                Some(position) => (position, false),
                None => (self.open_connection(now)?, true),
            };

        let conn = &mut self.connections[position];
        if let Err(e) = conn.adapter.subscribe(std::slice::from_ref(instrument), mode) {
            tracing::warn!(
                provider = %self.provider,
                connection_index = conn.index,
                symbol,
                error = %e,
                "Upstream subscribe refused"
            );
            return Err(e.into());
        }

        conn.bound.insert(
            symbol.to_string(),
            BoundSymbol {
                instrument: instrument.clone(),
                modes: BTreeSet::from([mode]),
            },
        );
        conn.empty_since = None;
        let index = conn.index;
        self.symbol_to_connection.insert(symbol.to_string(), index);

        tracing::debug!(
            provider = %self.provider,
            connection_index = index,
            symbol,
            mode = %mode,
            "Symbol bound"
        );

        Ok(Binding {
            connection_index: index,
            new_connection,
        })
    }

    /// Create, connect and append a connection; returns its position.
    fn open_connection(&mut self, now: Instant) -> Result<usize, PoolError> {
        let live = self.connections.len();
        if live >= self.limits.max_connections {
            return Err(PoolError::Exhausted {
                provider: self.provider.clone(),
                connections: live,
                capacity: self.limits.max_symbols_per_connection,
            });
        }

        let credentials = self
            .credentials
            .get_credentials(&self.provider)
            .map_err(|e| PoolError::Credentials(e.to_string()))?;

        let index = self.next_index;
        let mut adapter = (self.factory)(AdapterContext {
            provider: self.provider.clone(),
            connection_index: index,
            sink: Arc::clone(&self.sink),
        });
        adapter.connect(&credentials)?;
        self.next_index += 1;

        tracing::info!(
            provider = %self.provider,
            connection_index = index,
            live_connections = live + 1,
            "Opened upstream connection"
        );

        self.connections.push(ProviderConnection {
            index,
            adapter,
            bound: HashMap::new(),
            status: ConnectionStatus::Connecting,
            empty_since: Some(now),
        });
        Ok(self.connections.len() - 1)
    }

    /// Unbind provider symbols at a mode, batching one upstream unsubscribe
    /// per connection. Symbols not bound at that mode are skipped.
    ///
    /// Returns the number of `(symbol, mode)` bindings released.
    pub fn release(&mut self, provider_symbols: &[String], mode: Mode, now: Instant) -> usize {
        let mut per_connection: HashMap<u32, Vec<String>> = HashMap::new();
        for symbol in provider_symbols {
            if let Some(&index) = self.symbol_to_connection.get(symbol) {
                per_connection.entry(index).or_default().push(symbol.clone());
            }
        }

        let mut released = 0;
        for (index, symbols) in per_connection {
            let Some(conn) = self.connections.iter_mut().find(|c| c.index == index) else {
                continue;
            };

            let mut batch = Vec::with_capacity(symbols.len());
            for symbol in symbols {
                let Some(bound) = conn.bound.get_mut(&symbol) else {
                    continue;
                };
                if !bound.modes.remove(&mode) {
                    continue;
                }
                if bound.modes.is_empty() {
                    conn.bound.remove(&symbol);
                    self.symbol_to_connection.remove(&symbol);
                }
                batch.push(symbol);
            }

            if batch.is_empty() {
                continue;
            }
            released += batch.len();

            if let Err(e) = conn.adapter.unsubscribe(&batch, mode) {
                tracing::debug!(
                    provider = %self.provider,
                    connection_index = index,
                    error = %e,
                    "Upstream unsubscribe not delivered"
                );
            }

            if conn.bound.is_empty() {
                conn.empty_since = Some(now);
            }

            tracing::debug!(
                provider = %self.provider,
                connection_index = index,
                symbols = batch.len(),
                mode = %mode,
                "Symbols released"
            );
        }

        released
    }

    /// Close connections that have been empty for at least `grace`, and
    /// empty `Down` connections regardless of grace.
    ///
    /// Returns the indices closed.
    pub fn compact(&mut self, now: Instant, grace: Duration) -> Vec<u32> {
        let mut closed = Vec::new();

        self.connections.retain_mut(|conn| {
            let idle = conn.bound.is_empty()
                && (conn.status == ConnectionStatus::Down
                    || conn
                        .empty_since
                        .is_some_and(|since| now.saturating_duration_since(since) >= grace));
            if idle {
                conn.adapter.disconnect();
                closed.push(conn.index);
            }
            !idle
        });

        for index in &closed {
            tracing::info!(
                provider = %self.provider,
                connection_index = index,
                "Closed idle upstream connection"
            );
        }

        closed
    }

    /// Restart every `Down` connection that still holds symbols.
    ///
    /// A connection that cannot be restarted stays `Down` and is retried on
    /// the next call. Returns the indices restarted.
    pub fn reopen_down(&mut self) -> Vec<u32> {
        let mut reopened = Vec::new();

        for position in 0..self.connections.len() {
            let conn = &self.connections[position];
            if conn.status != ConnectionStatus::Down || conn.bound.is_empty() {
                continue;
            }
            let index = conn.index;

            match self.restart(position) {
                Ok(symbols) => {
                    tracing::info!(
                        provider = %self.provider,
                        connection_index = index,
                        symbols,
                        "Reopened upstream connection"
                    );
                    reopened.push(index);
                }
                Err(e) => tracing::warn!(
                    provider = %self.provider,
                    connection_index = index,
                    error = %e,
                    "Upstream connection still down"
                ),
            }
        }

        reopened
    }

    /// Swap in a new adapter carrying the connection's bound set.
    fn restart(&mut self, position: usize) -> Result<usize, PoolError> {
        let credentials = self
            .credentials
            .get_credentials(&self.provider)
            .map_err(|e| PoolError::Credentials(e.to_string()))?;

        let conn = &mut self.connections[position];
        let mut adapter = (self.factory)(AdapterContext {
            provider: self.provider.clone(),
            connection_index: conn.index,
            sink: Arc::clone(&self.sink),
        });
        adapter.connect(&credentials)?;

        let mut per_mode: BTreeMap<Mode, Vec<Instrument>> = BTreeMap::new();
        for bound in conn.bound.values() {
            for mode in &bound.modes {
                per_mode.entry(*mode).or_default().push(bound.instrument.clone());
            }
        }
        for (mode, instruments) in &mut per_mode {
            instruments.sort_by(|a, b| a.provider_symbol.cmp(&b.provider_symbol));
            adapter.subscribe(instruments, *mode)?;
        }

        conn.adapter.disconnect();
        conn.adapter = adapter;
        conn.status = ConnectionStatus::Connecting;
        Ok(conn.bound.len())
    }

    /// Record a status reported by a connection's adapter.
    ///
    /// Returns `false` if the connection is no longer in the pool.
    pub fn set_status(&mut self, index: u32, status: ConnectionStatus) -> bool {
        match self.connection_mut(index) {
            Some(conn) => {
                conn.status = status;
                true
            }
            None => false,
        }
    }

    /// Connection a provider symbol is bound to.
    #[must_use]
    pub fn connection_for(&self, provider_symbol: &str) -> Option<u32> {
        self.symbol_to_connection.get(provider_symbol).copied()
    }

    /// Modes a provider symbol is bound at.
    #[must_use]
    pub fn bound_modes(&self, provider_symbol: &str) -> Vec<Mode> {
        let Some(&index) = self.symbol_to_connection.get(provider_symbol) else {
            return Vec::new();
        };
        self.connections
            .iter()
            .find(|c| c.index == index)
            .and_then(|c| c.bound.get(provider_symbol))
            .map(|b| b.modes.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Instrument bound under a provider symbol.
    #[must_use]
    pub fn bound_instrument(&self, provider_symbol: &str) -> Option<&Instrument> {
        let index = *self.symbol_to_connection.get(provider_symbol)?;
        self.connections
            .iter()
            .find(|c| c.index == index)?
            .bound
            .get(provider_symbol)
            .map(|b| &b.instrument)
    }

    /// Number of live connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Number of distinct bound symbols.
    #[must_use]
    pub fn bound_symbol_count(&self) -> usize {
        self.symbol_to_connection.len()
    }

    /// Point-in-time view for health reporting.
    #[must_use]
    pub fn snapshot(&self) -> PoolSnapshot {
        PoolSnapshot {
            provider: self.provider.clone(),
            connections: self
                .connections
                .iter()
                .map(|c| ConnectionSnapshot {
                    index: c.index,
                    bound_symbols: c.bound.len(),
                    capacity: self.limits.max_symbols_per_connection,
                    status: c.status,
                })
                .collect(),
        }
    }

    /// Disconnect every connection.
    pub fn shutdown(&mut self) {
        for conn in &mut self.connections {
            conn.adapter.disconnect();
        }
        self.connections.clear();
        self.symbol_to_connection.clear();
    }

    fn connection_mut(&mut self, index: u32) -> Option<&mut ProviderConnection> {
        self.connections.iter_mut().find(|c| c.index == index)
    }
}

// =============================================================================
// Provider Pools
// =============================================================================

/// Every provider's pool, keyed by provider name.
#[derive(Debug, Default)]
pub struct ProviderPools {
    pools: HashMap<String, ConnectionPool>,
}

impl ProviderPools {
    /// Create an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a pool, replacing any pool for the same provider.
    pub fn insert(&mut self, pool: ConnectionPool) {
        self.pools.insert(pool.provider().to_string(), pool);
    }

    /// Pool for a provider.
    #[must_use]
    pub fn get(&self, provider: &str) -> Option<&ConnectionPool> {
        self.pools.get(provider)
    }

    /// Mutable pool for a provider.
    pub fn get_mut(&mut self, provider: &str) -> Option<&mut ConnectionPool> {
        self.pools.get_mut(provider)
    }

    /// Close idle connections across all pools.
    pub fn compact(&mut self, now: Instant, grace: Duration) -> usize {
        self.pools
            .values_mut()
            .map(|pool| pool.compact(now, grace).len())
            .sum()
    }

    /// Restart `Down` connections across all pools.
    pub fn reopen_down(&mut self) -> usize {
        self.pools
            .values_mut()
            .map(|pool| pool.reopen_down().len())
            .sum()
    }

    /// Snapshots of every pool, sorted by provider name.
    #[must_use]
    pub fn snapshots(&self) -> Vec<PoolSnapshot> {
        let mut snapshots: Vec<_> = self.pools.values().map(ConnectionPool::snapshot).collect();
        snapshots.sort_by(|a, b| a.provider.cmp(&b.provider));
        snapshots
    }

    /// Disconnect every pool.
    pub fn shutdown(&mut self) {
        for pool in self.pools.values_mut() {
            pool.shutdown();
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
