//! Real-time market data over WebSocket.
//!
//! [`MarketStream`] is the public face; [`connection::ConnectionManager`]
//! owns the socket lifecycle (signed handshake, heartbeat watchdog,
//! backoff reconnect) and [`subscription::SubscriptionManager`] owns the
//! `(channel, symbol)` set and replays it after every reconnect.

pub mod connection;
pub mod error;
pub mod messages;
pub mod subscription;

mod client;

pub use client::MarketStream;
pub use connection::ConnectionState;
pub use error::WsError;
pub use messages::{
    ALL_SYMBOLS, BookLevel, Channel, MarketMessage, OrderBookDatum, OutboundFrame, TickDatum,
    TradeDatum,
};
pub use subscription::ReplayStats;
