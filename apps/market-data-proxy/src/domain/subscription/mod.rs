//! Subscription Index and Client Registry
//!
//! Bidirectional bookkeeping between connected clients and routing keys.
//!
//! # Design
//!
//! The registry keeps two maps behind a single mutation path:
//! - `index`: routing key to the set of subscribed client ids
//! - `sessions`: client id to its session, which owns the set of keys
//!
//! Every method that touches one side touches the other before returning,
//! so a client's `subscribed_keys` always equals the set of index entries
//! containing that client. Index entries whose client set becomes empty are
//! pruned eagerly; the index is bounded by active interest.
//!
//! The registry is generic over the socket handle `H` stored in each
//! session, so it has no opinion on transport.

use std::collections::{HashMap, HashSet};
use std::fmt;

use chrono::{DateTime, Utc};

use super::market_data::RoutingKey;

// =============================================================================
// Types
// =============================================================================

/// Opaque, server-generated client identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(uuid::Uuid);

impl ClientId {
    /// Generate a fresh random identifier.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    /// Build an identifier from raw parts (tests, replay tools).
    #[must_use]
    pub const fn from_u128(value: u128) -> Self {
        Self(uuid::Uuid::from_u128(value))
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.as_simple().fmt(f)
    }
}

/// State of one authenticated client connection.
#[derive(Debug)]
pub struct ClientSession<H> {
    id: ClientId,
    user_id: String,
    handle: H,
    subscribed_keys: HashSet<RoutingKey>,
    created_at: DateTime<Utc>,
}

impl<H> ClientSession<H> {
    /// Client identifier.
    #[must_use]
    pub const fn id(&self) -> ClientId {
        self.id
    }

    /// Identity the client authenticated as.
    #[must_use]
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Socket handle used to push frames to this client.
    #[must_use]
    pub const fn handle(&self) -> &H {
        &self.handle
    }

    /// Keys this client is subscribed to.
    #[must_use]
    pub const fn subscribed_keys(&self) -> &HashSet<RoutingKey> {
        &self.subscribed_keys
    }

    /// When the session was created.
    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

/// Result of adding a key to a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeOutcome {
    /// The client was already subscribed; nothing changed.
    AlreadySubscribed,
    /// The key was added to the client.
    Added {
        /// The client is the first subscriber of this key.
        first_subscriber: bool,
    },
}

/// Result of removing a key from a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnsubscribeOutcome {
    /// The client was not subscribed; nothing changed.
    NotSubscribed,
    /// The key was removed from the client.
    Removed {
        /// The key has no subscribers left and was pruned from the index.
        pruned: bool,
    },
}

/// Registry errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// No session exists for the client.
    #[error("unknown client: {0}")]
    UnknownClient(ClientId),
    /// A session already exists for the client.
    #[error("client already registered: {0}")]
    DuplicateClient(ClientId),
}

/// A session removed from the registry along with the keys it left empty.
#[derive(Debug)]
pub struct RemovedClient<H> {
    /// The removed session.
    pub session: ClientSession<H>,
    /// Keys that lost their last subscriber and were pruned.
    pub pruned_keys: Vec<RoutingKey>,
}

// =============================================================================
// Subscription Registry
// =============================================================================

/// Subscription index plus client registry, kept consistent together.
///
/// # Example
///
/// ```rust
/// use market_data_proxy::domain::market_data::{Mode, RoutingKey};
/// use market_data_proxy::domain::subscription::{
///     ClientId, SubscribeOutcome, SubscriptionRegistry, UnsubscribeOutcome,
/// };
///
/// let mut registry = SubscriptionRegistry::new();
/// let alice = ClientId::from_u128(1);
/// let bob = ClientId::from_u128(2);
/// registry.register(alice, "alice", ()).unwrap();
/// registry.register(bob, "bob", ()).unwrap();
///
/// let key = RoutingKey::new("INFY", "NSE", Mode::Ltp);
///
/// // First subscriber creates the index entry
/// let outcome = registry.subscribe(alice, key.clone()).unwrap();
/// assert_eq!(outcome, SubscribeOutcome::Added { first_subscriber: true });
///
/// // Second subscriber joins it
/// let outcome = registry.subscribe(bob, key.clone()).unwrap();
/// assert_eq!(outcome, SubscribeOutcome::Added { first_subscriber: false });
///
/// // Alice leaves - Bob still holds the key
/// let outcome = registry.unsubscribe(alice, &key).unwrap();
/// assert_eq!(outcome, UnsubscribeOutcome::Removed { pruned: false });
///
/// // Bob leaves - the key is pruned
/// let outcome = registry.unsubscribe(bob, &key).unwrap();
/// assert_eq!(outcome, UnsubscribeOutcome::Removed { pruned: true });
/// assert_eq!(registry.key_count(), 0);
/// ```
#[derive(Debug)]
pub struct SubscriptionRegistry<H> {
    index: HashMap<RoutingKey, HashSet<ClientId>>,
    sessions: HashMap<ClientId, ClientSession<H>>,
}

impl<H> Default for SubscriptionRegistry<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H> SubscriptionRegistry<H> {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            index: HashMap::new(),
            sessions: HashMap::new(),
        }
    }

    /// Create a session for an authenticated client.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::DuplicateClient` if the id is already in use.
    pub fn register(
        &mut self,
        id: ClientId,
        user_id: impl Into<String>,
        handle: H,
    ) -> Result<&ClientSession<H>, RegistryError> {
        if self.sessions.contains_key(&id) {
            return Err(RegistryError::DuplicateClient(id));
        }

        let session = ClientSession {
            id,
            user_id: user_id.into(),
            handle,
            subscribed_keys: HashSet::new(),
            created_at: Utc::now(),
        };

        Ok(self.sessions.entry(id).or_insert(session))
    }

    /// Add a key to a client. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::UnknownClient` if the client has no session.
    pub fn subscribe(
        &mut self,
        client: ClientId,
        key: RoutingKey,
    ) -> Result<SubscribeOutcome, RegistryError> {
        let session = self
            .sessions
            .get_mut(&client)
            .ok_or(RegistryError::UnknownClient(client))?;

        if session.subscribed_keys.contains(&key) {
            return Ok(SubscribeOutcome::AlreadySubscribed);
        }

        let subscribers = self.index.entry(key.clone()).or_default();
        let first_subscriber = subscribers.is_empty();
        subscribers.insert(client);
        session.subscribed_keys.insert(key);

        Ok(SubscribeOutcome::Added { first_subscriber })
    }

    /// Remove a key from a client. Removing a key the client does not hold
    /// is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::UnknownClient` if the client has no session.
    pub fn unsubscribe(
        &mut self,
        client: ClientId,
        key: &RoutingKey,
    ) -> Result<UnsubscribeOutcome, RegistryError> {
        let session = self
            .sessions
            .get_mut(&client)
            .ok_or(RegistryError::UnknownClient(client))?;

        if !session.subscribed_keys.remove(key) {
            return Ok(UnsubscribeOutcome::NotSubscribed);
        }

        let pruned = Self::detach(&mut self.index, client, key);
        Ok(UnsubscribeOutcome::Removed { pruned })
    }

    /// Remove a client and all of its memberships.
    ///
    /// Returns `None` if the client had no session.
    pub fn remove_client(&mut self, client: ClientId) -> Option<RemovedClient<H>> {
        let session = self.sessions.remove(&client)?;

        let pruned_keys = session
            .subscribed_keys
            .iter()
            .filter(|key| Self::detach(&mut self.index, client, key))
            .cloned()
            .collect();

        Some(RemovedClient {
            session,
            pruned_keys,
        })
    }

    /// Remove `client` from the index entry for `key`, pruning it if empty.
    ///
    /// Returns `true` if the entry was pruned.
    fn detach(
        index: &mut HashMap<RoutingKey, HashSet<ClientId>>,
        client: ClientId,
        key: &RoutingKey,
    ) -> bool {
        let Some(subscribers) = index.get_mut(key) else {
            return false;
        };

        subscribers.remove(&client);

        if subscribers.is_empty() {
            index.remove(key);
            true
        } else {
            false
        }
    }

    /// Clients subscribed to a key.
    #[must_use]
    pub fn subscribers(&self, key: &RoutingKey) -> Option<&HashSet<ClientId>> {
        self.index.get(key)
    }

    /// Whether any client is subscribed to a key.
    #[must_use]
    pub fn has_subscribers(&self, key: &RoutingKey) -> bool {
        self.index.contains_key(key)
    }

    /// Session for a client.
    #[must_use]
    pub fn session(&self, client: ClientId) -> Option<&ClientSession<H>> {
        self.sessions.get(&client)
    }

    /// Whether a client has a session.
    #[must_use]
    pub fn contains_client(&self, client: ClientId) -> bool {
        self.sessions.contains_key(&client)
    }

    /// Whether a client holds a key.
    #[must_use]
    pub fn is_subscribed(&self, client: ClientId, key: &RoutingKey) -> bool {
        self.sessions
            .get(&client)
            .is_some_and(|s| s.subscribed_keys.contains(key))
    }

    /// Keys a client holds for a given symbol and venue, across all modes.
    #[must_use]
    pub fn keys_for_instrument(
        &self,
        client: ClientId,
        symbol: &str,
        venue: &str,
    ) -> Vec<RoutingKey> {
        self.sessions
            .get(&client)
            .map(|session| {
                session
                    .subscribed_keys
                    .iter()
                    .filter(|k| k.symbol() == symbol && k.venue() == venue)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// All connected client ids.
    pub fn client_ids(&self) -> impl Iterator<Item = ClientId> + '_ {
        self.sessions.keys().copied()
    }

    /// Number of connected clients.
    #[must_use]
    pub fn client_count(&self) -> usize {
        self.sessions.len()
    }

    /// Number of routing keys with at least one subscriber.
    #[must_use]
    pub fn key_count(&self) -> usize {
        self.index.len()
    }

    /// Aggregate statistics.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            clients: self.sessions.len(),
            routing_keys: self.index.len(),
            memberships: self.index.values().map(HashSet::len).sum(),
        }
    }
}

/// Registry statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    /// Connected clients.
    pub clients: usize,
    /// Routing keys with at least one subscriber.
    pub routing_keys: usize,
    /// Total (client, key) memberships.
    pub memberships: usize,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::domain::market_data::Mode;

    fn key(symbol: &str) -> RoutingKey {
        RoutingKey::new(symbol, "NSE", Mode::Ltp)
    }

    fn registry_with(clients: &[u128]) -> SubscriptionRegistry<()> {
        let mut registry = SubscriptionRegistry::new();
        for &c in clients {
            registry.register(ClientId::from_u128(c), format!("user{c}"), ()).unwrap();
        }
        registry
    }

    /// Every session key appears in the index under that client, and every
    /// index membership appears in the session.
    fn assert_consistent<H>(registry: &SubscriptionRegistry<H>) {
        for (id, session) in &registry.sessions {
            for k in &session.subscribed_keys {
                assert!(
                    registry.index.get(k).is_some_and(|s| s.contains(id)),
                    "session key {k} missing from index for {id}"
                );
            }
        }
        for (k, clients) in &registry.index {
            assert!(!clients.is_empty(), "empty index entry for {k}");
            for id in clients {
                assert!(
                    registry
                        .sessions
                        .get(id)
                        .is_some_and(|s| s.subscribed_keys.contains(k)),
                    "index entry {k} references {id} without a matching session key"
                );
            }
        }
    }

    #[test]
    fn register_rejects_duplicate() {
        let mut registry = registry_with(&[1]);
        let err = registry
            .register(ClientId::from_u128(1), "again", ())
            .unwrap_err();
        assert_eq!(err, RegistryError::DuplicateClient(ClientId::from_u128(1)));
    }

    #[test]
    fn subscribe_unknown_client_fails() {
        let mut registry: SubscriptionRegistry<()> = SubscriptionRegistry::new();
        let err = registry
            .subscribe(ClientId::from_u128(9), key("INFY"))
            .unwrap_err();
        assert_eq!(err, RegistryError::UnknownClient(ClientId::from_u128(9)));
    }

    #[test]
    fn subscribe_twice_is_single_entry() {
        let mut registry = registry_with(&[1]);
        let c = ClientId::from_u128(1);

        registry.subscribe(c, key("INFY")).unwrap();
        let outcome = registry.subscribe(c, key("INFY")).unwrap();

        assert_eq!(outcome, SubscribeOutcome::AlreadySubscribed);
        assert_eq!(registry.subscribers(&key("INFY")).unwrap().len(), 1);
        assert_eq!(registry.session(c).unwrap().subscribed_keys().len(), 1);
        assert_consistent(&registry);
    }

    #[test]
    fn unsubscribe_not_subscribed_is_noop() {
        let mut registry = registry_with(&[1, 2]);
        registry.subscribe(ClientId::from_u128(2), key("INFY")).unwrap();

        let outcome = registry
            .unsubscribe(ClientId::from_u128(1), &key("INFY"))
            .unwrap();

        assert_eq!(outcome, UnsubscribeOutcome::NotSubscribed);
        assert!(registry.has_subscribers(&key("INFY")));
        assert_consistent(&registry);
    }

    #[test]
    fn last_unsubscribe_prunes_key() {
        let mut registry = registry_with(&[1]);
        let c = ClientId::from_u128(1);
        registry.subscribe(c, key("INFY")).unwrap();

        let outcome = registry.unsubscribe(c, &key("INFY")).unwrap();

        assert_eq!(outcome, UnsubscribeOutcome::Removed { pruned: true });
        assert!(registry.subscribers(&key("INFY")).is_none());
        assert_eq!(registry.key_count(), 0);
    }

    #[test]
    fn remove_client_prunes_only_orphaned_keys() {
        let mut registry = registry_with(&[1, 2]);
        let (a, b) = (ClientId::from_u128(1), ClientId::from_u128(2));

        registry.subscribe(a, key("INFY")).unwrap();
        registry.subscribe(a, key("TCS")).unwrap();
        registry.subscribe(b, key("TCS")).unwrap();

        let removed = registry.remove_client(a).unwrap();

        assert_eq!(removed.pruned_keys, vec![key("INFY")]);
        assert_eq!(removed.session.subscribed_keys().len(), 2);
        assert!(!registry.contains_client(a));
        assert!(!registry.has_subscribers(&key("INFY")));
        assert_eq!(registry.subscribers(&key("TCS")).unwrap().len(), 1);
        assert_consistent(&registry);
    }

    #[test]
    fn remove_unknown_client_returns_none() {
        let mut registry = registry_with(&[1]);
        assert!(registry.remove_client(ClientId::from_u128(5)).is_none());
        assert_eq!(registry.client_count(), 1);
    }

    #[test]
    fn keys_for_instrument_spans_modes() {
        let mut registry = registry_with(&[1]);
        let c = ClientId::from_u128(1);
        let ltp = key("INFY");
        let depth = ltp.with_mode(Mode::Depth);

        registry.subscribe(c, ltp.clone()).unwrap();
        registry.subscribe(c, depth.clone()).unwrap();
        registry.subscribe(c, key("TCS")).unwrap();

        let mut keys = registry.keys_for_instrument(c, "INFY", "NSE");
        keys.sort();
        assert_eq!(keys, vec![ltp, depth]);
    }

    #[test]
    fn stats_count_memberships() {
        let mut registry = registry_with(&[1, 2]);
        registry.subscribe(ClientId::from_u128(1), key("INFY")).unwrap();
        registry.subscribe(ClientId::from_u128(2), key("INFY")).unwrap();
        registry.subscribe(ClientId::from_u128(2), key("TCS")).unwrap();

        let stats = registry.stats();
        assert_eq!(stats.clients, 2);
        assert_eq!(stats.routing_keys, 2);
        assert_eq!(stats.memberships, 3);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Subscribe(u128, usize),
        Unsubscribe(u128, usize),
        Disconnect(u128),
        Reconnect(u128),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            4 => (1u128..4, 0usize..5).prop_map(|(c, k)| Op::Subscribe(c, k)),
            3 => (1u128..4, 0usize..5).prop_map(|(c, k)| Op::Unsubscribe(c, k)),
            1 => (1u128..4).prop_map(Op::Disconnect),
            1 => (1u128..4).prop_map(Op::Reconnect),
        ]
    }

    proptest! {
        #[test]
        fn registry_and_index_stay_consistent(ops in proptest::collection::vec(op_strategy(), 0..80)) {
            let symbols = ["INFY", "TCS", "SBIN", "HDFC", "ITC"];
            let mut registry = registry_with(&[1, 2, 3]);

            for op in ops {
                match op {
                    Op::Subscribe(c, k) => {
                        let _ = registry.subscribe(ClientId::from_u128(c), key(symbols[k]));
                    }
                    Op::Unsubscribe(c, k) => {
                        let _ = registry.unsubscribe(ClientId::from_u128(c), &key(symbols[k]));
                    }
                    Op::Disconnect(c) => {
                        registry.remove_client(ClientId::from_u128(c));
                    }
                    Op::Reconnect(c) => {
                        let _ = registry.register(ClientId::from_u128(c), "user", ());
                    }
                }
                assert_consistent(&registry);
            }

            let memberships: usize = registry
                .sessions
                .values()
                .map(|s| s.subscribed_keys.len())
                .sum();
            prop_assert_eq!(memberships, registry.stats().memberships);
        }
    }
}
