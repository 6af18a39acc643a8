//! Read-only reference data over REST.
//!
//! Quote lookups are the one REST path hit often enough to hurt under a
//! five-second permit interval, so equity info goes through a small
//! write-through cache: fresh responses are stored on the way out and
//! repeated lookups inside the freshness window never spend a permit.

use std::sync::Arc;
use std::time::Duration;

use bon::Builder;
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

use crate::Result;
use crate::rest::endpoints::{GET_CANDLE_DATA, GET_EQUITY_INFO};
use crate::rest::{Cached, RestClient};

/// How long a cached quote stays fresh. Five seconds matches the rate
/// limiter's permit interval: within one permit window the upstream could
/// not have answered again anyway.
const QUOTE_FRESHNESS: Duration = Duration::from_secs(5);

/// Reference data for one instrument.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EquityInfo {
    /// Instrument code.
    pub symbol: String,
    /// Last traded price.
    pub last_price: Decimal,
    /// Best bid, when the book is not empty.
    #[serde(default)]
    pub bid_price: Option<Decimal>,
    /// Best ask, when the book is not empty.
    #[serde(default)]
    pub ask_price: Option<Decimal>,
    /// Daily upper price bound.
    #[serde(default)]
    pub ceiling: Option<Decimal>,
    /// Daily lower price bound.
    #[serde(default)]
    pub floor: Option<Decimal>,
}

#[derive(Serialize)]
struct SymbolQuery<'a> {
    symbol: &'a str,
}

/// Candle query parameters.
#[derive(Debug, Clone, Serialize, Builder)]
#[builder(on(String, into))]
pub struct CandleRequest {
    /// Instrument code.
    pub symbol: String,
    /// Bar period in minutes.
    pub period: u32,
}

/// One OHLCV bar.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candle {
    /// Bar open time, epoch milliseconds.
    pub timestamp: i64,
    /// Open.
    pub open: Decimal,
    /// High.
    pub high: Decimal,
    /// Low.
    pub low: Decimal,
    /// Close.
    pub close: Decimal,
    /// Traded volume.
    #[serde(default)]
    pub volume: Option<Decimal>,
}

/// Reference-data client with a write-through quote cache.
#[derive(Debug)]
pub struct MarketDataService {
    rest: Arc<RestClient>,
    quotes: DashMap<String, (EquityInfo, Instant)>,
}

impl MarketDataService {
    /// Wire the service against the REST client.
    #[must_use]
    pub fn new(rest: Arc<RestClient>) -> Self {
        Self {
            rest,
            quotes: DashMap::new(),
        }
    }

    /// Reference data for `symbol`.
    ///
    /// Served from the write-through cache while fresh; otherwise fetched on
    /// the read path (which itself can fall back to the last good response
    /// when the upstream is refusing).
    pub async fn equity_info(&self, symbol: &str) -> Result<Cached<EquityInfo>> {
        if let Some(entry) = self.quotes.get(symbol) {
            let (info, stored_at) = entry.value();
            if stored_at.elapsed() <= QUOTE_FRESHNESS {
                debug!(symbol, "quote served from write-through cache");
                return Ok(Cached {
                    value: info.clone(),
                    cached: true,
                });
            }
        }

        let fetched: Cached<EquityInfo> = self
            .rest
            .post_read(GET_EQUITY_INFO, &SymbolQuery { symbol })
            .await?;
        if !fetched.cached {
            self.quotes
                .insert(symbol.to_owned(), (fetched.value.clone(), Instant::now()));
        }
        Ok(fetched)
    }

    /// Historical bars for one instrument.
    pub async fn candles(&self, request: &CandleRequest) -> Result<Cached<Vec<Candle>>> {
        self.rest.post_read(GET_CANDLE_DATA, request).await
    }
}
