//! Proxy Core
//!
//! Single-writer state behind the event loop: the subscription registry,
//! every provider pool, the throttle and the routing-key to upstream map.
//! Nothing here is shared or locked; the event loop owns one `ProxyCore`
//! and calls into it from one task.
//!
//! # Upstream lifetime
//!
//! A routing key binds its upstream `(provider, provider_symbol, mode)` when
//! it gains its first subscriber anywhere. Several routing keys may resolve
//! to the same upstream, so each upstream keeps the set of routing keys it
//! serves. When the set empties, teardown is deferred by a grace period;
//! re-subscribing inside the window cancels it. Due teardowns are released
//! in batches.
//!
//! A shared upstream stamps its ticks with whichever alias bound it first,
//! so fan-out maps a tick back to its upstream and delivers a copy under
//! every routing key attached to it.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::pool::{ConnectionStatus, PoolError, PoolSnapshot, ProviderPools};
use crate::application::ports::{
    AdapterEvent, AdapterEventKind, ClientSink, Outbound, PushError, RejectedItem, Reply,
    SubscribeRejection, SubscriptionItem, SymbolResolver,
};
use crate::domain::market_data::{Instrument, Mode, RoutingKey, Tick};
use crate::domain::subscription::{
    ClientId, RegistryError, RegistryStats, SubscriptionRegistry, UnsubscribeOutcome,
};
use crate::domain::throttle::Throttle;

// =============================================================================
// Configuration
// =============================================================================

/// Timing knobs for the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoreConfig {
    /// Minimum interval between ticks delivered per routing key.
    pub throttle_interval: Duration,
    /// Delay before an unreferenced upstream is unsubscribed.
    pub unsubscribe_grace: Duration,
    /// How long a connection must stay empty before it is closed.
    pub idle_connection_grace: Duration,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            throttle_interval: Duration::from_millis(50),
            unsubscribe_grace: Duration::from_secs(5),
            idle_connection_grace: Duration::from_secs(60),
        }
    }
}

// =============================================================================
// Outcomes
// =============================================================================

/// Upstream stream a routing key is served from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct UpstreamKey {
    provider: String,
    provider_symbol: String,
    mode: Mode,
}

/// What happened to one tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// No client holds the key.
    NoSubscribers,
    /// Dropped by the per-key throttle.
    Throttled,
    /// Offered to every subscriber.
    Delivered {
        /// Clients whose queue accepted the tick.
        delivered: usize,
        /// Clients whose queue was full.
        dropped: usize,
        /// Clients whose queue was closed; their sessions were removed.
        disconnected: Vec<ClientId>,
    },
}

/// Result of an unsubscribe request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnsubscribeSummary {
    /// Routing keys removed from the session.
    pub removed: usize,
}

/// Result of a maintenance pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    /// `(symbol, mode)` bindings released upstream.
    pub released: usize,
    /// Idle connections closed.
    pub closed_connections: usize,
    /// `Down` connections restarted with their symbols.
    pub reopened_connections: usize,
}

/// Core errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoreError {
    /// Registry rejected the operation.
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

// =============================================================================
// Proxy Core
// =============================================================================

/// The event loop's state.
pub struct ProxyCore<S> {
    registry: SubscriptionRegistry<S>,
    pools: ProviderPools,
    resolver: Arc<dyn SymbolResolver>,
    throttle: Throttle,
    config: CoreConfig,
    routes: HashMap<RoutingKey, UpstreamKey>,
    upstream_routes: HashMap<UpstreamKey, HashSet<RoutingKey>>,
    pending_teardown: HashMap<UpstreamKey, Instant>,
}

impl<S> std::fmt::Debug for ProxyCore<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyCore")
            .field("registry", &self.registry.stats())
            .field("pools", &self.pools)
            .field("routes", &self.routes.len())
            .field("pending_teardown", &self.pending_teardown.len())
            .finish_non_exhaustive()
    }
}

impl<S: ClientSink> ProxyCore<S> {
    /// Create a core over the given pools and resolver.
    #[must_use]
    pub fn new(pools: ProviderPools, resolver: Arc<dyn SymbolResolver>, config: CoreConfig) -> Self {
        Self {
            registry: SubscriptionRegistry::new(),
            pools,
            resolver,
            throttle: Throttle::new(config.throttle_interval),
            config,
            routes: HashMap::new(),
            upstream_routes: HashMap::new(),
            pending_teardown: HashMap::new(),
        }
    }

    // =========================================================================
    // Sessions
    // =========================================================================

    /// Create a session for an authenticated client and acknowledge it.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Registry` if the id is already registered.
    pub fn register(&mut self, client: ClientId, user_id: &str, sink: S) -> Result<(), CoreError> {
        let session = self.registry.register(client, user_id, sink)?;
        let reply = Reply::Authenticated {
            client_id: client,
            user_id: user_id.to_string(),
        };
        // A failed push surfaces on the next delivery attempt
        let _ = session.handle().try_push(Outbound::Reply(reply));

        tracing::info!(client_id = %client, user_id, "Client session created");
        Ok(())
    }

    /// Destroy a session and release every key it held.
    ///
    /// Returns `false` if the client had no session.
    pub fn disconnect(&mut self, client: ClientId, now: Instant) -> bool {
        let Some(removed) = self.registry.remove_client(client) else {
            return false;
        };

        for key in &removed.pruned_keys {
            self.release_route(key, now);
        }

        tracing::info!(
            client_id = %client,
            keys = removed.session.subscribed_keys().len(),
            pruned = removed.pruned_keys.len(),
            "Client session removed"
        );
        true
    }

    /// Acknowledge a logout, then destroy the session.
    ///
    /// The acknowledgement is queued before the sink is dropped, so the
    /// client's writer sends it before closing.
    pub fn logout(&mut self, client: ClientId, now: Instant) -> bool {
        if let Some(session) = self.registry.session(client) {
            let _ = session.handle().try_push(Outbound::Reply(Reply::LoggedOut));
        }
        self.disconnect(client, now)
    }

    /// Answer an application-level ping.
    pub fn pong(&self, client: ClientId) {
        if let Some(session) = self.registry.session(client) {
            let _ = session.handle().try_push(Outbound::Reply(Reply::Pong));
        }
    }

    // =========================================================================
    // Subscribe / Unsubscribe
    // =========================================================================

    /// Subscribe a client to each `(symbol, venue)` at `mode`.
    ///
    /// Every entry is decided independently; refused entries do not affect
    /// the others. The reply is queued to the client and also returned.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Registry` if the client has no session.
    pub fn subscribe(
        &mut self,
        client: ClientId,
        items: &[SubscriptionItem],
        mode: Mode,
        now: Instant,
    ) -> Result<Reply, CoreError> {
        if !self.registry.contains_client(client) {
            return Err(RegistryError::UnknownClient(client).into());
        }

        let mut accepted = Vec::with_capacity(items.len());
        let mut rejected = Vec::new();

        for item in items {
            match self.subscribe_one(client, item, mode, now) {
                Ok(()) => accepted.push(item.clone()),
                Err(reason) => {
                    tracing::debug!(
                        client_id = %client,
                        symbol = %item.symbol,
                        venue = %item.venue,
                        reason = reason.code(),
                        "Subscription rejected"
                    );
                    rejected.push(RejectedItem {
                        item: item.clone(),
                        reason,
                    });
                }
            }
        }

        let reply = Reply::Subscribed {
            mode,
            accepted,
            rejected,
        };
        self.push_reply(client, reply.clone());
        Ok(reply)
    }

    fn subscribe_one(
        &mut self,
        client: ClientId,
        item: &SubscriptionItem,
        mode: Mode,
        now: Instant,
    ) -> Result<(), SubscribeRejection> {
        let resolved = self
            .resolver
            .resolve(&item.symbol, &item.venue)
            .ok_or(SubscribeRejection::UnknownSymbol)?;

        let key = RoutingKey::new(&item.symbol, &item.venue, mode);
        if self.registry.is_subscribed(client, &key) {
            return Ok(());
        }

        if !self.registry.has_subscribers(&key) {
            let upstream = UpstreamKey {
                provider: resolved.provider_name,
                provider_symbol: resolved.provider_symbol,
                mode,
            };
            let instrument = Instrument::new(key.symbol(), key.venue(), upstream.provider_symbol.clone());
            self.acquire_upstream(&upstream, &key, &instrument, now)?;
            self.routes.insert(key.clone(), upstream);
        }

        // The client is known and the key is not yet held, so this adds
        self.registry
            .subscribe(client, key)
            .map_err(|_| SubscribeRejection::AdapterUnavailable)?;
        Ok(())
    }

    /// Attach a routing key to an upstream, binding it in its pool if needed.
    fn acquire_upstream(
        &mut self,
        upstream: &UpstreamKey,
        key: &RoutingKey,
        instrument: &Instrument,
        now: Instant,
    ) -> Result<(), SubscribeRejection> {
        if let Some(keys) = self.upstream_routes.get_mut(upstream) {
            keys.insert(key.clone());
            return Ok(());
        }

        if self.pending_teardown.remove(upstream).is_none() {
            let pool = self
                .pools
                .get_mut(&upstream.provider)
                .ok_or(SubscribeRejection::UnknownProvider)?;

            pool.bind(instrument, upstream.mode, now).map_err(|e| match e {
                PoolError::Exhausted { .. } => SubscribeRejection::PoolExhausted,
                PoolError::Credentials(_) | PoolError::Adapter(_) => {
                    SubscribeRejection::AdapterUnavailable
                }
            })?;
        }

        self.upstream_routes
            .insert(upstream.clone(), HashSet::from([key.clone()]));
        Ok(())
    }

    /// Unsubscribe a client from each `(symbol, venue)`.
    ///
    /// With no `mode`, every mode the client holds for the pair is removed.
    /// Pairs the client does not hold are ignored.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Registry` if the client has no session.
    pub fn unsubscribe(
        &mut self,
        client: ClientId,
        items: &[SubscriptionItem],
        mode: Option<Mode>,
        now: Instant,
    ) -> Result<UnsubscribeSummary, CoreError> {
        if !self.registry.contains_client(client) {
            return Err(RegistryError::UnknownClient(client).into());
        }

        let mut removed = 0;
        for item in items {
            let keys = match mode {
                Some(mode) => vec![RoutingKey::new(&item.symbol, &item.venue, mode)],
                None => {
                    let probe = RoutingKey::new(&item.symbol, &item.venue, Mode::Ltp);
                    self.registry
                        .keys_for_instrument(client, probe.symbol(), probe.venue())
                }
            };

            for key in keys {
                match self.registry.unsubscribe(client, &key)? {
                    UnsubscribeOutcome::NotSubscribed => {}
                    UnsubscribeOutcome::Removed { pruned } => {
                        removed += 1;
                        if pruned {
                            self.release_route(&key, now);
                        }
                    }
                }
            }
        }

        self.push_reply(client, Reply::Unsubscribed { removed });
        Ok(UnsubscribeSummary { removed })
    }

    /// Detach a pruned key from its upstream.
    fn release_route(&mut self, key: &RoutingKey, now: Instant) {
        self.throttle.forget(key);

        let Some(upstream) = self.routes.remove(key) else {
            return;
        };

        let Some(keys) = self.upstream_routes.get_mut(&upstream) else {
            return;
        };
        keys.remove(key);
        if !keys.is_empty() {
            return;
        }
        self.upstream_routes.remove(&upstream);

        tracing::debug!(
            provider = %upstream.provider,
            symbol = %upstream.provider_symbol,
            mode = %upstream.mode,
            grace_ms = u64::try_from(self.config.unsubscribe_grace.as_millis()).unwrap_or(u64::MAX),
            "Upstream teardown scheduled"
        );
        self.pending_teardown
            .insert(upstream, now + self.config.unsubscribe_grace);

        if self.config.unsubscribe_grace.is_zero() {
            self.flush_teardowns(now);
        }
    }

    // =========================================================================
    // Fan-out
    // =========================================================================

    /// Deliver a tick to every subscriber of every routing key its upstream
    /// serves.
    ///
    /// Each routing key is throttled on its own and receives the tick under
    /// its own key. Clients whose queue is closed are disconnected; a full
    /// queue drops the tick for that client only.
    pub fn route_tick(&mut self, tick: &Arc<Tick>, now: Instant) -> RouteOutcome {
        let keys = self.fan_out_keys(&tick.key);

        let mut held = false;
        let mut admitted = false;
        let mut delivered = 0;
        let mut dropped = 0;
        let mut disconnected = Vec::new();

        for key in keys {
            let Some(subscribers) = self.registry.subscribers(&key) else {
                continue;
            };
            held = true;
            if !self.throttle.admit(&key, now) {
                continue;
            }
            admitted = true;

            let frame = if key == tick.key {
                Arc::clone(tick)
            } else {
                Arc::new(Tick {
                    key,
                    ..Tick::clone(tick)
                })
            };

            for &client in subscribers {
                let Some(session) = self.registry.session(client) else {
                    continue;
                };
                match session.handle().try_push(Outbound::Tick(Arc::clone(&frame))) {
                    Ok(()) => delivered += 1,
                    Err(PushError::Full) => dropped += 1,
                    Err(PushError::Closed) => {
                        if !disconnected.contains(&client) {
                            disconnected.push(client);
                        }
                    }
                }
            }
        }

        if !held {
            return RouteOutcome::NoSubscribers;
        }
        if !admitted {
            return RouteOutcome::Throttled;
        }

        for &client in &disconnected {
            tracing::debug!(client_id = %client, "Client queue closed during fan-out");
            self.disconnect(client, now);
        }

        RouteOutcome::Delivered {
            delivered,
            dropped,
            disconnected,
        }
    }

    /// Routing keys served by the upstream a tick key belongs to.
    fn fan_out_keys(&self, key: &RoutingKey) -> Vec<RoutingKey> {
        let upstream = self.routes.get(key).cloned().or_else(|| {
            self.resolver
                .resolve(key.symbol(), key.venue())
                .map(|resolved| UpstreamKey {
                    provider: resolved.provider_name,
                    provider_symbol: resolved.provider_symbol,
                    mode: key.mode(),
                })
        });

        upstream
            .and_then(|upstream| self.upstream_routes.get(&upstream))
            .map_or_else(|| vec![key.clone()], |keys| keys.iter().cloned().collect())
    }

    // =========================================================================
    // Upstream events & maintenance
    // =========================================================================

    /// Apply an adapter lifecycle event to its pool.
    pub fn handle_adapter_event(&mut self, event: &AdapterEvent) {
        let status = match &event.kind {
            AdapterEventKind::Connected => ConnectionStatus::Connected,
            AdapterEventKind::Disconnected => ConnectionStatus::Reconnecting { attempt: 0 },
            AdapterEventKind::Reconnecting { attempt } => {
                ConnectionStatus::Reconnecting { attempt: *attempt }
            }
            AdapterEventKind::Down { .. } => ConnectionStatus::Down,
            AdapterEventKind::Error { .. } => return,
        };

        let known = self
            .pools
            .get_mut(&event.provider)
            .is_some_and(|pool| pool.set_status(event.connection_index, status));

        if !known {
            tracing::debug!(
                provider = %event.provider,
                connection_index = event.connection_index,
                "Event for a connection no longer pooled"
            );
        }
    }

    /// Release due teardowns, close idle connections and restart `Down`
    /// ones that still carry symbols.
    pub fn run_maintenance(&mut self, now: Instant) -> MaintenanceReport {
        let released = self.flush_teardowns(now);
        let closed_connections = self
            .pools
            .compact(now, self.config.idle_connection_grace);
        let reopened_connections = self.pools.reopen_down();

        MaintenanceReport {
            released,
            closed_connections,
            reopened_connections,
        }
    }

    /// Release every teardown due at `now`, one batch per provider and mode.
    fn flush_teardowns(&mut self, now: Instant) -> usize {
        let due: Vec<UpstreamKey> = self
            .pending_teardown
            .iter()
            .filter(|(_, due)| **due <= now)
            .map(|(upstream, _)| upstream.clone())
            .collect();

        let mut batches: BTreeMap<(String, Mode), Vec<String>> = BTreeMap::new();
        for upstream in due {
            self.pending_teardown.remove(&upstream);
            batches
                .entry((upstream.provider, upstream.mode))
                .or_default()
                .push(upstream.provider_symbol);
        }

        let mut released = 0;
        for ((provider, mode), symbols) in batches {
            if let Some(pool) = self.pools.get_mut(&provider) {
                released += pool.release(&symbols, mode, now);
            }
        }
        released
    }

    /// Release everything and disconnect all pools.
    pub fn shutdown(&mut self) {
        let clients: Vec<ClientId> = self.registry.client_ids().collect();
        let now = Instant::now();
        for client in clients {
            self.disconnect(client, now);
        }
        self.pools.shutdown();
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Registry statistics.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        self.registry.stats()
    }

    /// Pool snapshots for every provider.
    #[must_use]
    pub fn pool_snapshots(&self) -> Vec<PoolSnapshot> {
        self.pools.snapshots()
    }

    /// Upstreams waiting for their grace period to end.
    #[must_use]
    pub fn pending_teardowns(&self) -> usize {
        self.pending_teardown.len()
    }

    /// Whether a client has a session.
    #[must_use]
    pub fn has_client(&self, client: ClientId) -> bool {
        self.registry.contains_client(client)
    }

    /// Read access to the registry.
    #[must_use]
    pub const fn registry(&self) -> &SubscriptionRegistry<S> {
        &self.registry
    }

    /// Read access to the pools.
    #[must_use]
    pub const fn pools(&self) -> &ProviderPools {
        &self.pools
    }

    fn push_reply(&self, client: ClientId, reply: Reply) {
        if let Some(session) = self.registry.session(client) {
            let _ = session.handle().try_push(Outbound::Reply(reply));
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
