//! Domain Layer - Core market data types and bookkeeping.
//!
//! This layer contains the routing types and subscription state for the
//! proxy with no I/O. Everything here is plain Rust driven by the
//! application layer's single-writer event loop.

/// Routing keys, modes and normalized ticks.
pub mod market_data;

/// Subscription index and client registry.
pub mod subscription;

/// Per-key minimum interval gate for fan-out.
pub mod throttle;
