//! Market-data frames.
//!
//! Outbound frames are subscribe/unsubscribe requests and the heartbeat
//! ping; inbound frames are tagged by their `channel` field and deserialize
//! into the three market-data shapes. Payload timestamps arrive as strings
//! or numbers depending on the broker's mood, hence the `DisplayFromStr`
//! annotations.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_with::{DisplayFromStr, serde_as};

use crate::orders::Direction;

/// Wildcard symbol: one server-side subscription covering every instrument.
pub const ALL_SYMBOLS: &str = "ALL";

/// Market-data channel.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum_macros::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Channel {
    /// Price updates.
    Tick,
    /// Top-of-book depth snapshots.
    #[serde(rename = "orderbook")]
    #[strum(serialize = "orderbook")]
    OrderBook,
    /// Executed trades.
    Trade,
}

/// Frame sent to the broker.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OutboundFrame {
    /// Start receiving `channel` data for `symbol` (`ALL` permitted).
    Subscribe {
        /// Channel to subscribe.
        channel: Channel,
        /// Instrument code or [`ALL_SYMBOLS`].
        symbol: String,
    },
    /// Stop receiving `channel` data for `symbol`.
    Unsubscribe {
        /// Channel to unsubscribe.
        channel: Channel,
        /// Instrument code or [`ALL_SYMBOLS`].
        symbol: String,
    },
    /// Keep-alive ping.
    Heartbeat,
}

/// One price-update event.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TickDatum {
    /// Instrument code.
    pub symbol: String,
    /// Last traded price.
    pub last_price: Decimal,
    /// Best bid, when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bid_price: Option<Decimal>,
    /// Best ask, when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ask_price: Option<Decimal>,
    /// Size at the best bid.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bid_size: Option<Decimal>,
    /// Size at the best ask.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ask_size: Option<Decimal>,
    /// Cumulative session volume.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<Decimal>,
    /// Event time, epoch milliseconds (string or number on the wire).
    #[serde_as(as = "DisplayFromStr")]
    pub timestamp: i64,
}

/// One price level of an order book.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookLevel {
    /// Level price.
    pub price: Decimal,
    /// Quantity resting at this price, in lots.
    pub quantity: Decimal,
    /// Orders making up the level, when the broker reports it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_count: Option<u32>,
}

/// Top-N depth snapshot.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderBookDatum {
    /// Instrument code.
    pub symbol: String,
    /// Bid levels, best first.
    #[serde(default)]
    pub bids: Vec<BookLevel>,
    /// Ask levels, best first.
    #[serde(default)]
    pub asks: Vec<BookLevel>,
    /// Event time, epoch milliseconds (string or number on the wire).
    #[serde_as(as = "DisplayFromStr")]
    pub timestamp: i64,
}

impl OrderBookDatum {
    /// Best bid price, when the bid side is not empty.
    #[must_use]
    pub fn best_bid(&self) -> Option<Decimal> {
        self.bids.first().map(|l| l.price)
    }

    /// Best ask price, when the ask side is not empty.
    #[must_use]
    pub fn best_ask(&self) -> Option<Decimal> {
        self.asks.first().map(|l| l.price)
    }

    /// `best_ask - best_bid`, when both sides are present.
    #[must_use]
    pub fn spread(&self) -> Option<Decimal> {
        Some(self.best_ask()? - self.best_bid()?)
    }

    /// `(best_ask + best_bid) / 2`, when both sides are present.
    #[must_use]
    pub fn mid_price(&self) -> Option<Decimal> {
        Some((self.best_ask()? + self.best_bid()?) / Decimal::TWO)
    }
}

/// One executed trade.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeDatum {
    /// Instrument code.
    pub symbol: String,
    /// Execution price.
    pub price: Decimal,
    /// Executed quantity, in lots.
    pub quantity: Decimal,
    /// Aggressor side.
    pub side: Direction,
    /// Event time, epoch milliseconds (string or number on the wire).
    #[serde_as(as = "DisplayFromStr")]
    pub timestamp: i64,
}

/// Inbound frame, dispatched by its `channel` tag.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "channel", rename_all = "lowercase")]
pub enum MarketMessage {
    /// A price update.
    Tick(TickDatum),
    /// A depth snapshot.
    #[serde(rename = "orderbook")]
    OrderBook(OrderBookDatum),
    /// An executed trade.
    Trade(TradeDatum),
}

impl MarketMessage {
    /// The channel this frame arrived on.
    #[must_use]
    pub const fn channel(&self) -> Channel {
        match self {
            Self::Tick(_) => Channel::Tick,
            Self::OrderBook(_) => Channel::OrderBook,
            Self::Trade(_) => Channel::Trade,
        }
    }

    /// The instrument this frame concerns.
    #[must_use]
    pub fn symbol(&self) -> &str {
        match self {
            Self::Tick(t) => &t.symbol,
            Self::OrderBook(b) => &b.symbol,
            Self::Trade(t) => &t.symbol,
        }
    }

    /// Event time, epoch milliseconds.
    #[must_use]
    pub const fn timestamp(&self) -> i64 {
        match self {
            Self::Tick(t) => t.timestamp,
            Self::OrderBook(b) => b.timestamp,
            Self::Trade(t) => t.timestamp,
        }
    }
}

/// Parse one inbound text frame.
pub(crate) fn parse_frame(text: &str) -> serde_json::Result<MarketMessage> {
    serde_json::from_str(text)
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use super::*;

    #[test]
    fn parse_tick_frame() {
        let json = r#"{
            "channel": "tick",
            "symbol": "GARAN",
            "lastPrice": "92.15",
            "bidPrice": "92.10",
            "askPrice": "92.20",
            "timestamp": "1700000000000"
        }"#;

        let msg = parse_frame(json).expect("parses");
        assert_eq!(msg.channel(), Channel::Tick);
        assert_eq!(msg.symbol(), "GARAN");
        assert_eq!(msg.timestamp(), 1_700_000_000_000);
        match msg {
            MarketMessage::Tick(tick) => {
                assert_eq!(tick.last_price, dec!(92.15));
                assert_eq!(tick.bid_price, Some(dec!(92.10)));
                assert!(tick.volume.is_none());
            }
            other => panic!("expected tick, got {other:?}"),
        }
    }

    #[test]
    fn parse_orderbook_frame_and_derive_quotes() {
        let json = r#"{
            "channel": "orderbook",
            "symbol": "AKBNK",
            "bids": [{"price": "45.40", "quantity": "100", "orderCount": 3}],
            "asks": [{"price": "45.50", "quantity": "80"}],
            "timestamp": 1700000000000
        }"#;

        let msg = parse_frame(json).expect("parses");
        match msg {
            MarketMessage::OrderBook(book) => {
                assert_eq!(book.best_bid(), Some(dec!(45.40)));
                assert_eq!(book.best_ask(), Some(dec!(45.50)));
                assert_eq!(book.spread(), Some(dec!(0.10)));
                assert_eq!(book.mid_price(), Some(dec!(45.45)));
            }
            other => panic!("expected orderbook, got {other:?}"),
        }
    }

    #[test]
    fn empty_book_has_no_derived_quotes() {
        let book = OrderBookDatum {
            symbol: "AKBNK".to_owned(),
            bids: Vec::new(),
            asks: vec![BookLevel {
                price: dec!(45.50),
                quantity: dec!(80),
                order_count: None,
            }],
            timestamp: 0,
        };
        assert_eq!(book.best_ask(), Some(dec!(45.50)));
        assert!(book.best_bid().is_none());
        assert!(book.spread().is_none());
        assert!(book.mid_price().is_none());
    }

    #[test]
    fn parse_trade_frame() {
        let json = r#"{
            "channel": "trade",
            "symbol": "THYAO",
            "price": "301.5",
            "quantity": "10",
            "side": "SELL",
            "timestamp": "1700000000001"
        }"#;

        let msg = parse_frame(json).expect("parses");
        match msg {
            MarketMessage::Trade(trade) => {
                assert_eq!(trade.side, Direction::Sell);
                assert_eq!(trade.price, dec!(301.5));
            }
            other => panic!("expected trade, got {other:?}"),
        }
    }

    #[test]
    fn unknown_channel_is_a_parse_error() {
        assert!(parse_frame(r#"{"channel": "news", "symbol": "X"}"#).is_err());
    }

    #[test]
    fn outbound_frames_serialize_with_type_tag() {
        let frame = OutboundFrame::Subscribe {
            channel: Channel::Tick,
            symbol: ALL_SYMBOLS.to_owned(),
        };
        assert_eq!(
            serde_json::to_string(&frame).expect("serializes"),
            r#"{"type":"subscribe","channel":"tick","symbol":"ALL"}"#
        );

        let heartbeat = serde_json::to_string(&OutboundFrame::Heartbeat).expect("serializes");
        assert_eq!(heartbeat, r#"{"type":"heartbeat"}"#);
    }
}
