//! Order payloads and broker order records.
//!
//! `SendOrderRequest` is the single canonical order payload builder. Its
//! field declaration order is the wire key order, and the `Checker` hash is
//! computed over exactly that serialization — reordering fields here breaks
//! request signing, which is why the order is pinned by a test.

use std::fmt;

use bon::Builder;
use rust_decimal::Decimal;
use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize};

use crate::Result;
use crate::error::Error;

/// Order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Buy side.
    Buy,
    /// Sell side.
    Sell,
}

impl Direction {
    /// Normalize a broker or caller token into a side.
    ///
    /// Accepts `0`/`BUY` and `1`/`SELL`, case-insensitive, surrounding
    /// whitespace tolerated. Anything else is a validation error.
    pub fn normalize(input: &str) -> Result<Self> {
        match input.trim().to_ascii_uppercase().as_str() {
            "0" | "BUY" => Ok(Self::Buy),
            "1" | "SELL" => Ok(Self::Sell),
            other => Err(Error::validation(format!("unknown direction: {other:?}"))),
        }
    }

    /// Wire token.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Buy => "BUY",
            Self::Sell => "SELL",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Direction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::normalize(s)
    }
}

impl Serialize for Direction {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Direction {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct DirectionVisitor;

        impl Visitor<'_> for DirectionVisitor {
            type Value = Direction;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("0, 1, BUY or SELL")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Direction, E> {
                Direction::normalize(v).map_err(|e| E::custom(e.to_string()))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Direction, E> {
                match v {
                    0 => Ok(Direction::Buy),
                    1 => Ok(Direction::Sell),
                    other => Err(E::custom(format!("unknown direction: {other}"))),
                }
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Direction, E> {
                u64::try_from(v)
                    .map_err(|_e| E::custom(format!("unknown direction: {v}")))
                    .and_then(|v| self.visit_u64(v))
            }
        }

        deserializer.deserialize_any(DirectionVisitor)
    }
}

/// Order pricing mode. The broker's wire tokens are Turkish-market flavored:
/// `limit` for limit orders, `piyasa` for market orders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PriceType {
    /// Execute at the stated price or better.
    #[serde(rename = "limit")]
    Limit,
    /// Execute at market.
    #[serde(rename = "piyasa")]
    Market,
}

/// New-order payload. Field order is the signed wire order; do not reorder.
#[derive(Debug, Clone, Serialize, Builder)]
#[builder(on(String, into))]
pub struct SendOrderRequest {
    /// Instrument code, e.g. `AKBNK`.
    pub symbol: String,
    /// Side.
    pub direction: Direction,
    /// Pricing mode.
    pub pricetype: PriceType,
    /// Limit price; ignored by the broker for market orders.
    pub price: Decimal,
    /// Quantity in lots.
    pub lot: Decimal,
    /// Ask the broker to confirm by SMS.
    #[builder(default)]
    pub sms: bool,
    /// Ask the broker to confirm by email.
    #[builder(default)]
    pub email: bool,
    /// Sub-account selector; empty string means the default account.
    #[serde(rename = "subAccount")]
    #[builder(default)]
    pub sub_account: String,
}

/// Order-modification payload.
#[derive(Debug, Clone, Serialize, Builder)]
#[builder(on(String, into))]
pub struct ModifyOrderRequest {
    /// Broker order reference.
    pub id: String,
    /// Replacement price.
    pub price: Decimal,
    /// Replacement quantity in lots.
    pub lot: Decimal,
    /// Whether this is a derivatives-market order.
    #[builder(default)]
    pub viop: bool,
    /// Sub-account selector.
    #[serde(rename = "subAccount")]
    #[builder(default)]
    pub sub_account: String,
}

/// Order-cancellation payload.
#[derive(Debug, Clone, Serialize, Builder)]
#[builder(on(String, into))]
pub struct DeleteOrderRequest {
    /// Broker order reference.
    pub id: String,
    /// Sub-account selector.
    #[serde(rename = "subAccount")]
    #[builder(default)]
    pub sub_account: String,
}

/// Sub-account scoped query payload (positions, transactions).
#[derive(Debug, Clone, Default, Serialize)]
pub struct SubAccountQuery {
    /// Sub-account selector; empty string means the default account.
    #[serde(rename = "subAccount")]
    pub sub_account: String,
}

/// One open position from `InstantPosition`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    /// Instrument code.
    pub symbol: String,
    /// Quantity held, in lots.
    pub quantity: Decimal,
    /// Average acquisition cost.
    pub cost: Decimal,
    /// Current unit price.
    pub unit_price: Decimal,
    /// Unrealized profit.
    pub profit: Decimal,
}

/// Working/filled state of a transaction record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    /// Resting on the book.
    Waiting,
    /// Fully executed.
    Filled,
    /// Cancelled before completion.
    Canceled,
    /// Anything the broker adds later.
    #[serde(other)]
    Unknown,
}

/// One row from `TodaysTransaction`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionRecord {
    /// Broker order reference.
    pub id: String,
    /// Instrument code.
    pub symbol: String,
    /// Side.
    pub direction: Direction,
    /// Order price.
    pub price: Decimal,
    /// Quantity in lots.
    pub lot: Decimal,
    /// Current state.
    pub status: TransactionStatus,
    /// Broker-formatted entry time.
    #[serde(default)]
    pub transaction_time: Option<String>,
}
