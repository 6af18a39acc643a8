//! Broker REST invocation layer.
//!
//! [`client::RestClient`] is the single door to the broker's HTTP API; the
//! sibling modules are the stages of its resilience envelope. Components
//! higher up (auth, orders, market data) own *what* to call; this module
//! owns *how* a call survives a flaky upstream.

pub mod circuit;
pub mod endpoints;
pub mod fallback;
pub mod rate_limit;
pub mod stats;

mod client;

pub use circuit::{CircuitMetrics, CircuitState};
pub use client::{Cached, RestClient};
pub use endpoints::EndpointClass;
pub use fallback::FallbackStats;
pub use stats::EndpointStats;
