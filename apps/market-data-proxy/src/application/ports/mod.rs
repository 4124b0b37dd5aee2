//! Application Ports (Driver and Driven)
//!
//! Ports define the seams between the proxy core and the outside world.
//! - **Driving**: `ClientSink` carries replies and pushes to connected clients
//! - **Driven**: `BrokerAdapter` talks to upstream providers; the lookup
//!   ports resolve identities, symbols and credentials

mod broker_port;
mod client_port;
mod lookup_port;

#[cfg(test)]
pub use broker_port::MockBrokerAdapter;
pub use broker_port::{
    AdapterContext, AdapterError, AdapterEvent, AdapterEventKind, AdapterFactory, BrokerAdapter,
    MarketEventSink, ProviderCredentials,
};
pub use client_port::{
    ClientSink, Outbound, PushError, RejectedItem, Reply, SubscribeRejection, SubscriptionItem,
};
pub use lookup_port::{
    CredentialStore, Identity, IdentityError, IdentityValidator, LookupError, ResolvedSymbol,
    SymbolResolver,
};
