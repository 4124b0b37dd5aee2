//! Health and Metrics Endpoint
//!
//! # Routes
//!
//! - `GET /health` - JSON report: sessions, routing keys, bus counters and
//!   every pooled upstream connection
//! - `GET /healthz` - liveness, always `OK` while the process serves HTTP
//! - `GET /readyz` - 200 once every provider holding symbols has a live
//!   connection, 503 with the providers still waiting otherwise
//! - `GET /metrics` - Prometheus exposition
//!
//! The event loop owns all routing state. It publishes a [`HealthSnapshot`]
//! into [`SharedHealth`] after every maintenance pass and adapter event;
//! handlers only read that snapshot.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::application::services::{ConnectionStatus, PoolSnapshot};
use crate::infrastructure::bus::BusStats;
use crate::infrastructure::metrics::get_metrics_handle;

// =============================================================================
// Shared Snapshot
// =============================================================================

/// Routing state as last published by the event loop.
#[derive(Debug, Clone, Default)]
pub struct HealthSnapshot {
    /// Authenticated client sessions.
    pub clients: usize,
    /// Routing keys with at least one subscriber.
    pub routing_keys: usize,
    /// Bus counters.
    pub bus: BusStats,
    /// Every configured provider's pool.
    pub pools: Vec<PoolSnapshot>,
}

/// Snapshot handle shared between the event loop and the health server.
pub type SharedHealth = Arc<RwLock<HealthSnapshot>>;

// =============================================================================
// Health Response Types
// =============================================================================

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Overall status: "healthy", "degraded", or "unhealthy".
    pub status: HealthStatus,
    /// Proxy version.
    pub version: String,
    /// Server uptime in seconds.
    pub uptime_secs: u64,
    /// Current time.
    pub current_time: DateTime<Utc>,
    /// Authenticated client sessions.
    pub clients: usize,
    /// Routing keys with at least one subscriber.
    pub routing_keys: usize,
    /// Bus counters.
    pub bus: BusInfo,
    /// Upstream pools.
    pub providers: Vec<ProviderInfo>,
}

/// Overall health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// All systems operational.
    Healthy,
    /// Some connections are recovering but every active provider streams.
    Degraded,
    /// A provider with subscribers has no live connection.
    Unhealthy,
}

/// Bus counters.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct BusInfo {
    /// Ticks accepted.
    pub published: u64,
    /// Ticks dropped on overflow.
    pub dropped: u64,
}

/// One provider's pool.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderInfo {
    /// Provider name.
    pub provider: String,
    /// Symbols bound across the pool.
    pub bound_symbols: usize,
    /// Connections reporting connected.
    pub connected: usize,
    /// Per-connection detail.
    pub connections: Vec<ConnectionInfo>,
}

/// One pooled connection.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    /// Connection index.
    pub index: u32,
    /// Connection state.
    pub state: &'static str,
    /// Symbols bound.
    pub bound_symbols: usize,
    /// Symbol capacity.
    pub capacity: usize,
    /// Current reconnect attempt (0 unless reconnecting).
    pub reconnect_attempt: u32,
}

// =============================================================================
// Server
// =============================================================================

/// Shared state for the health server.
pub struct HealthServerState {
    version: String,
    started_at: Instant,
    snapshot: SharedHealth,
}

impl HealthServerState {
    /// State reporting `version` over the event loop's snapshot.
    #[must_use]
    pub fn new(version: String, snapshot: SharedHealth) -> Self {
        Self {
            version,
            started_at: Instant::now(),
            snapshot,
        }
    }
}

/// HTTP server for probes and metrics scraping.
pub struct HealthServer {
    addr: SocketAddr,
    state: Arc<HealthServerState>,
    cancel: CancellationToken,
}

impl HealthServer {
    /// Serve on `addr` until `cancel` fires.
    #[must_use]
    pub const fn new(addr: SocketAddr, state: Arc<HealthServerState>, cancel: CancellationToken) -> Self {
        Self {
            addr,
            state,
            cancel,
        }
    }

    /// Probe and metrics routes.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/health", get(get_health))
            .route("/healthz", get(get_liveness))
            .route("/readyz", get(get_readiness))
            .route("/metrics", get(get_metrics))
            .with_state(Arc::clone(&self.state))
    }

    /// Bind and serve, draining in-flight requests on cancellation.
    ///
    /// # Errors
    ///
    /// Returns `HealthServerError::Bind` if the address is unavailable and
    /// `HealthServerError::Serve` if the accept loop fails.
    pub async fn run(self) -> Result<(), HealthServerError> {
        let routes = self.router();
        let listener = TcpListener::bind(self.addr)
            .await
            .map_err(|source| HealthServerError::Bind {
                addr: self.addr,
                source,
            })?;

        tracing::info!(addr = %self.addr, "Health endpoint listening");
        axum::serve(listener, routes)
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await
            .map_err(HealthServerError::Serve)?;
        tracing::info!("Health endpoint stopped");
        Ok(())
    }
}

// =============================================================================
// Handlers
// =============================================================================

const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Readiness probe body.
#[derive(Debug, Serialize)]
struct Readiness {
    ready: bool,
    /// Providers holding symbols without a live connection.
    waiting_on: Vec<String>,
}

async fn get_health(State(state): State<Arc<HealthServerState>>) -> Response {
    let report = build_health_response(&state);
    let code = if report.status == HealthStatus::Unhealthy {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (code, Json(report)).into_response()
}

async fn get_liveness() -> &'static str {
    "OK"
}

async fn get_readiness(State(state): State<Arc<HealthServerState>>) -> Response {
    let waiting_on = unready_providers(&state.snapshot.read().pools);
    let ready = waiting_on.is_empty();
    let code = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(Readiness { ready, waiting_on })).into_response()
}

async fn get_metrics() -> Response {
    match get_metrics_handle() {
        Some(handle) => (
            [(header::CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)],
            handle.render(),
        )
            .into_response(),
        None => (StatusCode::SERVICE_UNAVAILABLE, "metrics recorder not installed").into_response(),
    }
}

fn build_health_response(state: &HealthServerState) -> HealthResponse {
    let snapshot = state.snapshot.read().clone();

    HealthResponse {
        status: determine_health_status(&snapshot.pools),
        version: state.version.clone(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        current_time: Utc::now(),
        clients: snapshot.clients,
        routing_keys: snapshot.routing_keys,
        bus: BusInfo {
            published: snapshot.bus.published,
            dropped: snapshot.bus.dropped,
        },
        providers: snapshot.pools.iter().map(provider_info).collect(),
    }
}

fn provider_info(pool: &PoolSnapshot) -> ProviderInfo {
    ProviderInfo {
        provider: pool.provider.clone(),
        bound_symbols: pool.bound_symbols(),
        connected: pool.connected(),
        connections: pool
            .connections
            .iter()
            .map(|c| ConnectionInfo {
                index: c.index,
                state: c.status.as_str(),
                bound_symbols: c.bound_symbols,
                capacity: c.capacity,
                reconnect_attempt: match c.status {
                    ConnectionStatus::Reconnecting { attempt } => attempt,
                    _ => 0,
                },
            })
            .collect(),
    }
}

/// Providers with bound symbols but no connected connection.
fn unready_providers(pools: &[PoolSnapshot]) -> Vec<String> {
    pools
        .iter()
        .filter(|pool| pool.bound_symbols() > 0 && pool.connected() == 0)
        .map(|pool| pool.provider.clone())
        .collect()
}

fn is_ready(pools: &[PoolSnapshot]) -> bool {
    unready_providers(pools).is_empty()
}

fn determine_health_status(pools: &[PoolSnapshot]) -> HealthStatus {
    if !is_ready(pools) {
        return HealthStatus::Unhealthy;
    }

    let recovering = pools
        .iter()
        .flat_map(|pool| &pool.connections)
        .any(|c| c.status != ConnectionStatus::Connected);

    if recovering {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Health endpoint failures.
#[derive(Debug, thiserror::Error)]
pub enum HealthServerError {
    /// The listen address could not be bound.
    #[error("cannot bind health endpoint on {addr}: {source}")]
    Bind {
        /// Requested address.
        addr: SocketAddr,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The accept loop failed.
    #[error("health endpoint failed: {0}")]
    Serve(#[source] std::io::Error),
}

// =============================================================================
// Tests
// =============================================================================
