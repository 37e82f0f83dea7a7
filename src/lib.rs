//! Wakegate - An activation proxy that wakes containers on demand
//!
//! This library provides an on-demand activation proxy that:
//! - Routes HTTP traffic by Host header, and TCP/UDP traffic by per-route
//!   listening sockets, to configured backend containers
//! - Lazily starts a route's container on first access, with single-flight
//!   creation under concurrent requests
//! - Bounds every lifecycle operation with a timeout that escalates to a
//!   forced kill, so a hung backend can never wedge the proxy
//! - Retires containers after a configurable idle period via a periodic
//!   sweep
//! - Dispatches container construction by image scheme through a pluggable
//!   factory registry
//! - Keeps all lifecycle timing behind a clock abstraction so the timing
//!   logic is testable on virtual time

pub mod clock;
pub mod config;
pub mod container;
pub mod docker;
pub mod error;
pub mod factory;
pub mod nursery;
pub mod pool;
pub mod proxy;
pub mod relay;
pub mod router;

/// Package name reported in the startup banner.
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
/// Package version reported in the startup banner.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
