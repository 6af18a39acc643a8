//! Broker-integration gateway core for the AlgoLab REST + WebSocket APIs.
//!
//! The crate intermediates between an in-house trading platform and the
//! broker's HTTP + WebSocket surface. Three subsystems carry the weight:
//!
//! - **Authentication** ([`auth`]): the two-step login state machine
//!   (credentials → token → SMS OTP → hash) with encrypted credential
//!   transport, persistent session recovery and a keep-alive refresh loop.
//! - **REST** ([`rest`]): signed POST calls behind a resilience envelope —
//!   rate limit, circuit breaker, retry, time limiter — with typed fallback
//!   per endpoint class and at-most-once discipline on order placement.
//! - **Market data** ([`ws`], [`cache`]): a persistent WebSocket with
//!   heartbeat and backoff reconnect, an idempotent subscription set
//!   replayed after every reconnect, and bounded per-symbol caches with
//!   live metrics (optionally mirrored into Redis).
//!
//! [`Gateway`] wires everything together from a [`GatewayConfig`].
//!
//! # Example
//!
//! ```no_run
//! use algolab_gateway::{Gateway, GatewayConfig};
//! use algolab_gateway::ws::Channel;
//! use secrecy::SecretString;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config: GatewayConfig = serde_json::from_str(r#"{
//!         "api": {"key": "API-..."},
//!         "session": {"storage": "file"}
//!     }"#)?;
//!
//!     let gateway = Gateway::build(config).await?;
//!     gateway.start().await?;
//!
//!     // Two-step login: credentials, then the SMS code.
//!     gateway.login("tc11111111111", &SecretString::from("P@ss")).await?;
//!     gateway.verify_otp("123456").await?;
//!
//!     // Stream ticks; the subscription survives reconnects.
//!     let stream = gateway.connect_market_data()?;
//!     stream.subscribe(Channel::Tick, "GARAN")?;
//!
//!     gateway.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod cache;
pub mod config;
pub mod crypto;
pub mod error;
pub mod gateway;
pub mod health;
pub mod market;
pub mod orders;
pub mod rest;
pub mod session;
pub mod ws;

pub use config::GatewayConfig;
pub use error::Error;
pub use gateway::Gateway;
pub use health::{HealthReport, HealthStatus};

/// Crate-wide result alias.
pub type Result<T, E = Error> = std::result::Result<T, E>;
