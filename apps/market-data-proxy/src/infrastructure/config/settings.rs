//! Proxy Configuration Settings
//!
//! Configuration types for the proxy, loaded from `MDPROXY_*` environment
//! variables. Parsing goes through a lookup function so tests can supply a
//! map instead of the process environment.

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::application::services::{CoreConfig, PoolLimits};
use crate::infrastructure::feed::{BackoffConfig, FeedClientConfig, HeartbeatConfig, WireFormat};

/// Client-facing server settings.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// WebSocket listener port.
    pub listen_port: u16,
    /// Health check and metrics HTTP port.
    pub health_port: u16,
    /// Outbound messages buffered per client before drops.
    pub client_queue_capacity: usize,
    /// Time allowed between socket open and a valid `authenticate`.
    pub auth_timeout: Duration,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            listen_port: 8765,
            health_port: 8082,
            client_queue_capacity: 1024,
            auth_timeout: Duration::from_secs(10),
        }
    }
}

/// Event loop and routing settings.
#[derive(Debug, Clone)]
pub struct RoutingSettings {
    /// Minimum spacing between delivered ticks per routing key (0 disables).
    pub throttle_interval: Duration,
    /// Ticks buffered on the bus before the oldest are dropped.
    pub bus_capacity: usize,
    /// Delay before an unreferenced upstream subscription is torn down.
    pub unsubscribe_grace: Duration,
    /// Time an empty connection stays open before it is closed.
    pub idle_connection_grace: Duration,
    /// Cadence of teardown flushes, pool compaction and gauge refresh.
    pub maintenance_interval: Duration,
}

impl Default for RoutingSettings {
    fn default() -> Self {
        Self {
            throttle_interval: Duration::from_millis(50),
            bus_capacity: 16_384,
            unsubscribe_grace: Duration::from_millis(5000),
            idle_connection_grace: Duration::from_secs(60),
            maintenance_interval: Duration::from_millis(1000),
        }
    }
}

impl RoutingSettings {
    /// Core configuration derived from these settings.
    #[must_use]
    pub const fn core_config(&self) -> CoreConfig {
        CoreConfig {
            throttle_interval: self.throttle_interval,
            unsubscribe_grace: self.unsubscribe_grace,
            idle_connection_grace: self.idle_connection_grace,
        }
    }
}

/// Upstream WebSocket connection settings shared by all providers.
#[derive(Debug, Clone)]
pub struct WebSocketSettings {
    /// Heartbeat ping interval.
    pub heartbeat_interval: Duration,
    /// Heartbeat timeout before considering connection dead.
    pub heartbeat_timeout: Duration,
    /// Bound on opening a socket.
    pub connect_timeout: Duration,
    /// Initial reconnection delay.
    pub reconnect_delay_initial: Duration,
    /// Maximum reconnection delay.
    pub reconnect_delay_max: Duration,
    /// Reconnection delay multiplier for exponential backoff.
    pub reconnect_delay_multiplier: f64,
    /// Maximum reconnection attempts before giving up (0 = unlimited).
    pub max_reconnect_attempts: u32,
}

impl Default for WebSocketSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
            reconnect_delay_initial: Duration::from_millis(500),
            reconnect_delay_max: Duration::from_secs(30),
            reconnect_delay_multiplier: 2.0,
            max_reconnect_attempts: 10,
        }
    }
}

/// One upstream provider.
#[derive(Debug, Clone)]
pub struct ProviderSettings {
    /// Lowercase provider name.
    pub name: String,
    /// WebSocket endpoint.
    pub url: String,
    /// Frame encoding.
    pub wire: WireFormat,
    /// Pool sizing.
    pub limits: PoolLimits,
}

/// Complete proxy configuration.
#[derive(Debug, Clone, Default)]
pub struct ProxyConfig {
    /// Client-facing server settings.
    pub server: ServerSettings,
    /// Event loop settings.
    pub routing: RoutingSettings,
    /// Upstream connection settings.
    pub websocket: WebSocketSettings,
    /// Configured providers, in declaration order.
    pub providers: Vec<ProviderSettings>,
    /// Accepted client tokens, `token -> user_id`.
    pub access_tokens: HashMap<String, String>,
    /// CSV symbol master location.
    pub symbol_master: Option<PathBuf>,
}

impl ProxyConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a required variable is missing or any value is
    /// malformed.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from a variable lookup function.
    ///
    /// # Errors
    ///
    /// Returns an error if a required variable is missing or any value is
    /// malformed.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Env(&lookup);

        let server_defaults = ServerSettings::default();
        let server = ServerSettings {
            listen_port: env.parse("MDPROXY_LISTEN_PORT", server_defaults.listen_port)?,
            health_port: env.parse("MDPROXY_HEALTH_PORT", server_defaults.health_port)?,
            client_queue_capacity: env.positive(
                "MDPROXY_CLIENT_QUEUE_CAPACITY",
                server_defaults.client_queue_capacity,
            )?,
            auth_timeout: env.secs("MDPROXY_AUTH_TIMEOUT_SECS", server_defaults.auth_timeout)?,
        };

        let routing_defaults = RoutingSettings::default();
        let routing = RoutingSettings {
            throttle_interval: env.millis(
                "MDPROXY_THROTTLE_INTERVAL_MS",
                routing_defaults.throttle_interval,
            )?,
            bus_capacity: env.positive("MDPROXY_BUS_CAPACITY", routing_defaults.bus_capacity)?,
            unsubscribe_grace: env.millis(
                "MDPROXY_UNSUBSCRIBE_GRACE_MS",
                routing_defaults.unsubscribe_grace,
            )?,
            idle_connection_grace: env.secs(
                "MDPROXY_IDLE_CONNECTION_GRACE_SECS",
                routing_defaults.idle_connection_grace,
            )?,
            maintenance_interval: env.millis(
                "MDPROXY_MAINTENANCE_INTERVAL_MS",
                routing_defaults.maintenance_interval,
            )?,
        };
        if routing.maintenance_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "MDPROXY_MAINTENANCE_INTERVAL_MS".to_string(),
                value: "0".to_string(),
            });
        }

        let ws_defaults = WebSocketSettings::default();
        let websocket = WebSocketSettings {
            heartbeat_interval: env.secs(
                "MDPROXY_HEARTBEAT_INTERVAL_SECS",
                ws_defaults.heartbeat_interval,
            )?,
            heartbeat_timeout: env.secs(
                "MDPROXY_HEARTBEAT_TIMEOUT_SECS",
                ws_defaults.heartbeat_timeout,
            )?,
            connect_timeout: env.secs("MDPROXY_CONNECT_TIMEOUT_SECS", ws_defaults.connect_timeout)?,
            reconnect_delay_initial: env.millis(
                "MDPROXY_RECONNECT_DELAY_INITIAL_MS",
                ws_defaults.reconnect_delay_initial,
            )?,
            reconnect_delay_max: env.secs(
                "MDPROXY_RECONNECT_DELAY_MAX_SECS",
                ws_defaults.reconnect_delay_max,
            )?,
            reconnect_delay_multiplier: env.parse(
                "MDPROXY_RECONNECT_DELAY_MULTIPLIER",
                ws_defaults.reconnect_delay_multiplier,
            )?,
            max_reconnect_attempts: env.parse(
                "MDPROXY_MAX_RECONNECT_ATTEMPTS",
                ws_defaults.max_reconnect_attempts,
            )?,
        };

        let providers = env
            .required("MDPROXY_PROVIDERS")?
            .split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(|name| provider_settings(&env, name))
            .collect::<Result<Vec<_>, _>>()?;
        if providers.is_empty() {
            return Err(ConfigError::EmptyValue("MDPROXY_PROVIDERS".to_string()));
        }

        let access_tokens = env
            .optional("MDPROXY_ACCESS_TOKENS")
            .map(|raw| parse_access_tokens(&raw))
            .transpose()?
            .unwrap_or_default();

        let symbol_master = env.optional("MDPROXY_SYMBOL_MASTER").map(PathBuf::from);

        Ok(Self {
            server,
            routing,
            websocket,
            providers,
            access_tokens,
            symbol_master,
        })
    }

    /// Connection settings for one provider's adapters.
    #[must_use]
    pub fn feed_client_config(&self, provider: &ProviderSettings) -> FeedClientConfig {
        let ws = &self.websocket;
        FeedClientConfig {
            url: provider.url.clone(),
            wire: provider.wire,
            connect_timeout: ws.connect_timeout,
            heartbeat: HeartbeatConfig {
                ping_interval: ws.heartbeat_interval,
                timeout: ws.heartbeat_timeout,
            },
            backoff: BackoffConfig {
                initial_delay: ws.reconnect_delay_initial,
                max_delay: ws.reconnect_delay_max,
                multiplier: ws.reconnect_delay_multiplier,
                max_attempts: ws.max_reconnect_attempts,
                ..BackoffConfig::default()
            },
        }
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
    /// Environment variable could not be parsed.
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue {
        /// Variable name.
        key: String,
        /// Raw value.
        value: String,
    },
    /// Provider settings are unusable.
    #[error("provider {name}: {reason}")]
    InvalidProvider {
        /// Provider name.
        name: String,
        /// What is wrong.
        reason: &'static str,
    },
}

// =============================================================================
// Parsing Helpers
// =============================================================================

struct Env<'a>(&'a dyn Fn(&str) -> Option<String>);

impl Env<'_> {
    fn optional(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn required(&self, key: &str) -> Result<String, ConfigError> {
        match (self.0)(key) {
            None => Err(ConfigError::MissingEnvVar(key.to_string())),
            Some(v) if v.trim().is_empty() => Err(ConfigError::EmptyValue(key.to_string())),
            Some(v) => Ok(v.trim().to_string()),
        }
    }

    fn parse<T: FromStr>(&self, key: &str, default: T) -> Result<T, ConfigError> {
        self.optional(key).map_or(Ok(default), |raw| {
            raw.parse().map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                value: raw,
            })
        })
    }

    fn positive(&self, key: &str, default: usize) -> Result<usize, ConfigError> {
        match self.parse(key, default)? {
            0 => Err(ConfigError::InvalidValue {
                key: key.to_string(),
                value: "0".to_string(),
            }),
            n => Ok(n),
        }
    }

    fn secs(&self, key: &str, default: Duration) -> Result<Duration, ConfigError> {
        self.parse(key, default.as_secs()).map(Duration::from_secs)
    }

    fn millis(&self, key: &str, default: Duration) -> Result<Duration, ConfigError> {
        let default = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
        self.parse(key, default).map(Duration::from_millis)
    }
}

fn provider_settings(env: &Env<'_>, name: &str) -> Result<ProviderSettings, ConfigError> {
    let prefix = format!("MDPROXY_PROVIDER_{}", name.to_uppercase());
    let defaults = PoolLimits::default();

    let url = env.required(&format!("{prefix}_URL"))?;

    let wire_key = format!("{prefix}_WIRE");
    let wire = match env.optional(&wire_key) {
        None => WireFormat::Json,
        Some(raw) => WireFormat::parse(&raw).ok_or(ConfigError::InvalidValue {
            key: wire_key,
            value: raw,
        })?,
    };

    let limits = PoolLimits {
        max_symbols_per_connection: env.parse(
            &format!("{prefix}_MAX_SYMBOLS_PER_CONNECTION"),
            defaults.max_symbols_per_connection,
        )?,
        max_connections: env.parse(
            &format!("{prefix}_MAX_CONNECTIONS"),
            defaults.max_connections,
        )?,
    };
    if limits.max_symbols_per_connection == 0 {
        return Err(ConfigError::InvalidProvider {
            name: name.to_lowercase(),
            reason: "max symbols per connection must be positive",
        });
    }
    if limits.max_connections == 0 {
        return Err(ConfigError::InvalidProvider {
            name: name.to_lowercase(),
            reason: "max connections must be positive",
        });
    }

    Ok(ProviderSettings {
        name: name.to_lowercase(),
        url,
        wire,
        limits,
    })
}

fn parse_access_tokens(raw: &str) -> Result<HashMap<String, String>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((token, user)) if !token.trim().is_empty() && !user.trim().is_empty() => {
                Ok((token.trim().to_string(), user.trim().to_string()))
            }
            _ => Err(ConfigError::InvalidValue {
                key: "MDPROXY_ACCESS_TOKENS".to_string(),
                value: "<redacted>".to_string(),
            }),
        })
        .collect()
}
