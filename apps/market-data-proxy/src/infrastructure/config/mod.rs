//! Configuration Module
//!
//! Environment-driven settings for the proxy, its routing core and every
//! configured upstream provider.

mod settings;

pub use settings::{
    ConfigError, ProviderSettings, ProxyConfig, RoutingSettings, ServerSettings,
    WebSocketSettings,
};
