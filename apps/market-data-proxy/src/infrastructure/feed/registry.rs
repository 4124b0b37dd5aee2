//! Adapter Registry
//!
//! Maps provider names to the factory that builds their connections. The
//! binary fills it from configuration; tests register mock factories.

use std::collections::HashMap;
use std::sync::Arc;

use super::adapter::{FeedClientConfig, WsFeedAdapter};
use crate::application::ports::AdapterFactory;

/// Provider name to adapter factory.
#[derive(Default)]
pub struct AdapterRegistry {
    factories: HashMap<String, AdapterFactory>,
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("providers", &self.providers())
            .finish()
    }
}

impl AdapterRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory, replacing any existing one for the provider.
    pub fn register(&mut self, provider: impl Into<String>, factory: AdapterFactory) {
        self.factories.insert(provider.into(), factory);
    }

    /// Register the WebSocket feed adapter for a provider.
    pub fn register_ws_feed(&mut self, provider: impl Into<String>, config: FeedClientConfig) {
        self.register(provider, ws_feed_factory(config));
    }

    /// Factory for a provider.
    #[must_use]
    pub fn get(&self, provider: &str) -> Option<AdapterFactory> {
        self.factories.get(provider).cloned()
    }

    /// Registered provider names, sorted.
    #[must_use]
    pub fn providers(&self) -> Vec<String> {
        let mut names: Vec<_> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of registered providers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.factories.len()
    }

    /// Whether no provider is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

/// Factory building one [`WsFeedAdapter`] per pooled connection.
#[must_use]
pub fn ws_feed_factory(config: FeedClientConfig) -> AdapterFactory {
    let config = Arc::new(config);
    Arc::new(move |context| Box::new(WsFeedAdapter::new(Arc::clone(&config), context)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::ports::{
        AdapterContext, AdapterError, AdapterEvent, MarketEventSink, MockBrokerAdapter,
    };
    use crate::domain::market_data::{Instrument, Mode, Tick};
    use crate::infrastructure::feed::codec::WireFormat;

    struct NullSink;

    impl MarketEventSink for NullSink {
        fn publish_tick(&self, _tick: Tick) {}
        fn publish_event(&self, _event: AdapterEvent) {}
    }

    #[test]
    fn lookup_by_provider() {
        let mut registry = AdapterRegistry::new();
        registry.register_ws_feed("zeta", FeedClientConfig::new("ws://zeta", WireFormat::MsgPack));
        registry.register(
            "alpha",
            Arc::new(|_ctx| Box::new(MockBrokerAdapter::new())),
        );

        assert_eq!(registry.providers(), vec!["alpha", "zeta"]);
        assert_eq!(registry.len(), 2);
        assert!(registry.get("alpha").is_some());
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn ws_factory_builds_unconnected_adapters() {
        let factory = ws_feed_factory(FeedClientConfig::new("ws://feed", WireFormat::Json));
        let mut adapter = factory(AdapterContext {
            provider: "feed".into(),
            connection_index: 3,
            sink: Arc::new(NullSink),
        });
        let instrument = Instrument::new("INFY", "NSE", "INFY-EQ");
        assert_eq!(
            adapter.subscribe(&[instrument], Mode::Ltp),
            Err(AdapterError::NotConnected)
        );
    }
}
