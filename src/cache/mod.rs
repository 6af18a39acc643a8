//! Tick cache and live metrics.
//!
//! Two tiers. The in-process tier is always on: bounded per-symbol history
//! plus atomic counters, good enough for a single-node deployment. The
//! Redis tier is optional (`cache.enabled`) and adds shared history and
//! metrics other processes can read. Redis failures are logged and flip
//! the health flag; they never propagate into the data path.

mod buffer;
mod metrics;
mod redis;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::Result;
use crate::config::CacheConfig;
use crate::ws::{MarketMessage, OrderBookDatum, TickDatum, TradeDatum};

pub use buffer::SeriesBuffer;
pub use metrics::{RealtimeSummary, SymbolCount, SymbolStats, TickMetrics};
pub use redis::{RedisTickStore, SymbolSnapshot};

/// Both cache tiers behind one ingest/query surface.
#[derive(Debug)]
pub struct TickCacheService {
    ticks: SeriesBuffer<TickDatum>,
    books: SeriesBuffer<OrderBookDatum>,
    trades: SeriesBuffer<TradeDatum>,
    metrics: TickMetrics,
    redis: Option<RedisTickStore>,
    redis_healthy: AtomicBool,
}

impl TickCacheService {
    /// Build both tiers. Connects to Redis only when the tier is enabled.
    pub async fn new(config: &CacheConfig) -> Result<Self> {
        let max = config.max_entries_per_symbol;
        let ttl = config.ttl();

        let redis = if config.enabled {
            let url = config
                .redis_url
                .as_deref()
                .ok_or_else(|| crate::error::Error::validation("cache.redisUrl missing"))?;
            Some(RedisTickStore::connect(url, max, ttl).await?)
        } else {
            None
        };

        Ok(Self {
            ticks: SeriesBuffer::new(max, ttl),
            books: SeriesBuffer::new(max, ttl),
            trades: SeriesBuffer::new(max, ttl),
            metrics: TickMetrics::new(ttl),
            redis,
            redis_healthy: AtomicBool::new(true),
        })
    }

    /// Ingest one inbound frame into every tier.
    pub async fn ingest(&self, message: MarketMessage) {
        let channel = message.channel();
        let symbol = message.symbol().to_owned();
        let timestamp = message.timestamp();

        let payload = match &message {
            MarketMessage::Tick(tick) => {
                self.metrics.record(&symbol, timestamp);
                self.ticks.insert(&symbol, timestamp, tick.clone());
                serde_json::to_string(tick)
            }
            MarketMessage::OrderBook(book) => {
                self.books.insert(&symbol, timestamp, book.clone());
                serde_json::to_string(book)
            }
            MarketMessage::Trade(trade) => {
                self.trades.insert(&symbol, timestamp, trade.clone());
                serde_json::to_string(trade)
            }
        };

        let Some(redis) = &self.redis else { return };
        let payload = match payload {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "failed to serialize frame for redis tier");
                return;
            }
        };
        match redis.record(channel, &symbol, timestamp, &payload).await {
            Ok(()) => self.redis_healthy.store(true, Ordering::Relaxed),
            Err(e) => {
                // Degrade to the in-process tier; the feed must not stall.
                warn!(error = %e, %channel, symbol, "redis tier write failed");
                self.redis_healthy.store(false, Ordering::Relaxed);
            }
        }
    }

    /// Consume a message receiver until it closes or `cancel` fires.
    pub fn spawn_router(
        self: Arc<Self>,
        mut receiver: broadcast::Receiver<MarketMessage>,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let cache = self;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    received = receiver.recv() => match received {
                        Ok(message) => cache.ingest(message).await,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "cache router lagging, frames dropped");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
            debug!("cache router stopped");
        })
    }

    /// Recent price updates for `symbol`, oldest first.
    #[must_use]
    pub fn recent_ticks(&self, symbol: &str) -> Vec<TickDatum> {
        self.ticks.recent(symbol)
    }

    /// The newest price update for `symbol`.
    #[must_use]
    pub fn latest_tick(&self, symbol: &str) -> Option<TickDatum> {
        self.ticks.latest(symbol)
    }

    /// Recent depth snapshots for `symbol`, oldest first.
    #[must_use]
    pub fn recent_order_books(&self, symbol: &str) -> Vec<OrderBookDatum> {
        self.books.recent(symbol)
    }

    /// Recent trades for `symbol`, oldest first.
    #[must_use]
    pub fn recent_trades(&self, symbol: &str) -> Vec<TradeDatum> {
        self.trades.recent(symbol)
    }

    /// In-process realtime summary.
    #[must_use]
    pub fn summary(&self, top_n: usize) -> RealtimeSummary {
        self.metrics.summary(top_n)
    }

    /// In-process per-symbol counters.
    #[must_use]
    pub fn symbol_stats(&self, symbol: &str) -> Option<SymbolStats> {
        self.metrics.symbol_stats(symbol)
    }

    /// Redis-tier realtime summary, when the tier is enabled.
    pub async fn redis_summary(&self, top_n: usize) -> Option<Result<RealtimeSummary>> {
        match &self.redis {
            Some(redis) => Some(redis.summary(top_n).await),
            None => None,
        }
    }

    /// Redis-tier per-symbol snapshot, when the tier is enabled.
    pub async fn redis_symbol_snapshot(&self, symbol: &str) -> Option<Result<SymbolSnapshot>> {
        match &self.redis {
            Some(redis) => Some(redis.symbol_snapshot(symbol).await),
            None => None,
        }
    }

    /// Whether the Redis tier is configured at all.
    #[must_use]
    pub const fn redis_enabled(&self) -> bool {
        self.redis.is_some()
    }

    /// False only when the Redis tier is enabled and its last write failed.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.redis.is_none() || self.redis_healthy.load(Ordering::Relaxed)
    }
}
