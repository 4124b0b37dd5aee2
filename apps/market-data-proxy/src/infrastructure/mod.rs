//! Infrastructure Layer - Adapters and external integrations.
//!
//! This layer contains the concrete implementations of the port interfaces
//! defined in the application layer, and the runtime that drives the core.

/// In-process message bus between adapters and the event loop.
pub mod bus;

/// Upstream WebSocket feed adapter and adapter registry.
pub mod feed;

/// Client-facing WebSocket server and event loop.
pub mod server;

/// Token, symbol and credential lookups.
pub mod lookup;

/// Configuration loading.
pub mod config;

/// Health check HTTP endpoint.
pub mod health;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// Logging and OpenTelemetry tracing.
pub mod telemetry;
