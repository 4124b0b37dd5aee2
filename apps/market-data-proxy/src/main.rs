//! Market Data Proxy Binary
//!
//! Starts the market data distribution proxy.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin market-data-proxy
//! ```
//!
//! # Environment Variables
//!
//! ## Required
//! - `MDPROXY_PROVIDERS`: Comma-separated provider names
//! - `MDPROXY_PROVIDER_<NAME>_URL`: Provider WebSocket endpoint
//! - `MDPROXY_PROVIDER_<NAME>_API_KEY` / `_API_SECRET`: Provider credentials
//!
//! ## Optional
//! - `MDPROXY_ACCESS_TOKENS`: `token=user_id` pairs accepted from clients
//! - `MDPROXY_SYMBOL_MASTER`: CSV symbol master path
//! - `MDPROXY_LISTEN_PORT`: Client WebSocket port (default: 8765)
//! - `MDPROXY_HEALTH_PORT`: Health and metrics HTTP port (default: 8082)
//! - `MDPROXY_THROTTLE_INTERVAL_MS`: Per-key delivery interval (default: 50)
//! - `OTEL_ENABLED`: Export spans over OTLP (default: false)
//! - `RUST_LOG`: Log filter (default: info)

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use market_data_proxy::application::ports::{CredentialStore, SymbolResolver};
use market_data_proxy::application::services::{ConnectionPool, ProviderPools, ProxyCore};
use market_data_proxy::infrastructure::bus::{BusPublisher, message_bus};
use market_data_proxy::infrastructure::feed::AdapterRegistry;
use market_data_proxy::infrastructure::health::{
    HealthServer, HealthServerState, HealthSnapshot, SharedHealth,
};
use market_data_proxy::infrastructure::lookup::{
    EnvCredentialStore, StaticTokenValidator, SymbolMaster,
};
use market_data_proxy::infrastructure::server::{ConnectionContext, EventLoop, ProxyServer};
use market_data_proxy::infrastructure::telemetry;
use market_data_proxy::{ProxyConfig, init_metrics};
use parking_lot::RwLock;
use tokio::signal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Graceful shutdown timeout.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Client commands buffered ahead of the event loop.
const COMMAND_QUEUE: usize = 4096;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls crypto provider"))?;

    load_dotenv();

    // Initialize telemetry (tracing + optional OTLP export)
    let _telemetry_guard = telemetry::init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting market data proxy");

    // Initialize Prometheus metrics
    let _metrics_handle = init_metrics();

    let config = ProxyConfig::from_env().context("invalid configuration")?;
    log_config(&config);

    let shutdown_token = CancellationToken::new();

    // Collaborators
    if config.access_tokens.is_empty() {
        tracing::warn!("MDPROXY_ACCESS_TOKENS is empty, no client can authenticate");
    }
    let validator = Arc::new(StaticTokenValidator::new(config.access_tokens.clone()));
    let resolver: Arc<dyn SymbolResolver> = match &config.symbol_master {
        Some(path) => Arc::new(SymbolMaster::from_path(path).context("loading symbol master")?),
        None => {
            tracing::warn!("MDPROXY_SYMBOL_MASTER not set, every subscription will be rejected");
            Arc::new(SymbolMaster::new())
        }
    };
    let credentials: Arc<dyn CredentialStore> = Arc::new(EnvCredentialStore::from_env());

    // Upstream adapters and pools
    let mut registry = AdapterRegistry::new();
    for provider in &config.providers {
        registry.register_ws_feed(provider.name.clone(), config.feed_client_config(provider));
    }

    let (publisher, consumer) = message_bus(config.routing.bus_capacity);
    let pools = build_pools(&config, &registry, &credentials, &publisher)?;
    let core = ProxyCore::new(pools, resolver, config.routing.core_config());

    // Event loop
    let health: SharedHealth = Arc::new(RwLock::new(HealthSnapshot::default()));
    let (commands_tx, commands_rx) = mpsc::channel(COMMAND_QUEUE);
    let event_loop = EventLoop::new(
        core,
        consumer,
        commands_rx,
        Arc::clone(&health),
        config.routing.maintenance_interval,
        shutdown_token.clone(),
    );
    let event_loop_handle = tokio::spawn(event_loop.run());

    // Client listener
    let context = ConnectionContext {
        validator,
        commands: commands_tx,
        queue_capacity: config.server.client_queue_capacity,
        auth_timeout: config.server.auth_timeout,
        cancel: shutdown_token.clone(),
    };
    let listen_addr = SocketAddr::from(([0, 0, 0, 0], config.server.listen_port));
    let server = ProxyServer::bind(listen_addr, context).await?;
    let server_handle = tokio::spawn(server.run());

    // Health server
    let health_state = Arc::new(HealthServerState::new(
        env!("CARGO_PKG_VERSION").to_string(),
        health,
    ));
    let health_server = HealthServer::new(
        SocketAddr::from(([0, 0, 0, 0], config.server.health_port)),
        health_state,
        shutdown_token.clone(),
    );
    let health_handle = tokio::spawn(async move {
        if let Err(e) = health_server.run().await {
            tracing::error!(error = %e, "Health server error");
        }
    });

    tracing::info!("Market data proxy ready");

    await_shutdown(shutdown_token).await;

    let stopped = tokio::time::timeout(
        SHUTDOWN_TIMEOUT,
        futures::future::join_all([event_loop_handle, server_handle, health_handle]),
    )
    .await;
    if stopped.is_err() {
        tracing::warn!("Shutdown timed out, exiting with tasks still running");
    }

    tracing::info!("Market data proxy stopped");
    Ok(())
}

/// One pool per configured provider.
fn build_pools(
    config: &ProxyConfig,
    registry: &AdapterRegistry,
    credentials: &Arc<dyn CredentialStore>,
    publisher: &BusPublisher,
) -> anyhow::Result<ProviderPools> {
    let mut pools = ProviderPools::new();
    for provider in &config.providers {
        let factory = registry
            .get(&provider.name)
            .with_context(|| format!("no adapter registered for provider {}", provider.name))?;

        if let Err(e) = credentials.get_credentials(&provider.name) {
            tracing::warn!(provider = %provider.name, error = %e, "Provider credentials missing");
        }

        pools.insert(ConnectionPool::new(
            provider.name.clone(),
            provider.limits,
            factory,
            Arc::clone(credentials),
            Arc::new(publisher.clone()),
        ));
    }
    Ok(pools)
}

/// Load the nearest `.env`, searching upward from the working directory.
fn load_dotenv() {
    let nearest = std::env::current_dir().ok().and_then(|cwd| {
        cwd.ancestors()
            .map(|dir| dir.join(".env"))
            .find(|candidate| candidate.is_file())
    });
    if let Some(path) = nearest
        && let Err(e) = dotenvy::from_path(&path)
    {
        eprintln!("ignoring unreadable {}: {e}", path.display());
    }
}

/// Log the parsed configuration.
fn log_config(config: &ProxyConfig) {
    tracing::info!(
        listen_port = config.server.listen_port,
        health_port = config.server.health_port,
        throttle_ms = u64::try_from(config.routing.throttle_interval.as_millis()).unwrap_or(u64::MAX),
        bus_capacity = config.routing.bus_capacity,
        providers = config.providers.len(),
        "Configuration loaded"
    );
    for provider in &config.providers {
        tracing::debug!(
            provider = %provider.name,
            url = %provider.url,
            wire = provider.wire.as_str(),
            max_symbols_per_connection = provider.limits.max_symbols_per_connection,
            max_connections = provider.limits.max_connections,
            "Provider configured"
        );
    }
}

/// Block until SIGINT or SIGTERM, then cancel every task.
#[allow(clippy::expect_used)]
async fn await_shutdown(shutdown_token: CancellationToken) {
    let interrupt = async {
        signal::ctrl_c()
            .await
            .expect("failed to listen for SIGINT");
        "SIGINT"
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to listen for SIGTERM")
            .recv()
            .await;
        "SIGTERM"
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<&str>();

    let received = tokio::select! {
        name = interrupt => name,
        name = terminate => name,
    };

    tracing::info!(
        signal = received,
        timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
        "Shutting down"
    );
    shutdown_token.cancel();
}
