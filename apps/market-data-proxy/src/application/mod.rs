//! Application Layer - ports and the proxy core.
//!
//! Everything here is transport-agnostic: sockets, codecs and timers live
//! in the infrastructure layer and reach the core through the ports.

/// Port interfaces for clients, upstream providers and lookups.
pub mod ports;

/// Connection pooling and the subscription router.
pub mod services;
