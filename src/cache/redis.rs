//! Redis tier of the tick cache.
//!
//! Every insert is one `MULTI`/`EXEC` pipeline: the sorted-set append,
//! rank trim, TTLs, the active-symbol set and all metric counters land
//! atomically, so the stored history and the counters can never disagree.
//! Keys follow the `algolab:` namespace the monitoring tooling expects.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use redis::AsyncCommands as _;
use redis::aio::ConnectionManager;

use super::metrics::{RealtimeSummary, SymbolCount};
use crate::Result;
use crate::error::{Error, Kind};
use crate::ws::Channel;

const ACTIVE_SYMBOLS: &str = "algolab:symbols:active";
const METRIC_TOTAL: &str = "algolab:metrics:total";
const METRIC_SYMBOL_COUNTS: &str = "algolab:metrics:symbol:counts";
const METRIC_LAST_TIME: &str = "algolab:metrics:tick:last-time";
const METRIC_FIRST_TIME: &str = "algolab:metrics:tick:first-time";
const METRIC_LAST_MINUTE: &str = "algolab:metrics:tick:last-minute";

fn series_key(channel: Channel, symbol: &str) -> String {
    format!("algolab:{channel}:{symbol}")
}

fn cache_err(e: redis::RedisError) -> Error {
    Error::with_source(Kind::Cache, e)
}

/// Per-symbol snapshot out of the Redis tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolSnapshot {
    /// Instrument code.
    pub symbol: String,
    /// Ticks counted for it.
    pub count: u64,
    /// Most recent tick time, epoch milliseconds.
    pub last_timestamp: Option<i64>,
    /// Most recent raw payload, as stored.
    pub last_payload: Option<String>,
}

/// Pipelined Redis store for market-data history and tick metrics.
pub struct RedisTickStore {
    conn: ConnectionManager,
    max_entries: usize,
    ttl: Duration,
    // Disambiguates last-minute members sharing a millisecond.
    seq: AtomicU64,
}

impl RedisTickStore {
    /// Connect to `url` and keep histories bounded by `max_entries`/`ttl`.
    pub async fn connect(url: &str, max_entries: usize, ttl: Duration) -> Result<Self> {
        let client = redis::Client::open(url).map_err(cache_err)?;
        let conn = client.get_connection_manager().await.map_err(cache_err)?;
        Ok(Self {
            conn,
            max_entries,
            ttl,
            seq: AtomicU64::new(0),
        })
    }

    /// Record one datum: series append, trims, TTLs and (for ticks) the
    /// metric counters, all in one atomic pipeline.
    pub async fn record(
        &self,
        channel: Channel,
        symbol: &str,
        timestamp_ms: i64,
        payload: &str,
    ) -> Result<()> {
        let key = series_key(channel, symbol);
        let ttl_secs = i64::try_from(self.ttl.as_secs()).unwrap_or(i64::MAX);
        let trim_upto = -i64::try_from(self.max_entries).unwrap_or(i64::MAX) - 1;

        let mut pipe = redis::pipe();
        pipe.atomic()
            .zadd(&key, payload, timestamp_ms)
            .ignore()
            .zremrangebyrank(&key, 0, isize::try_from(trim_upto).unwrap_or(isize::MIN))
            .ignore()
            .expire(&key, ttl_secs)
            .ignore()
            .sadd(ACTIVE_SYMBOLS, symbol)
            .ignore()
            .expire(ACTIVE_SYMBOLS, ttl_secs)
            .ignore();

        if channel == Channel::Tick {
            let member = format!(
                "{timestamp_ms}-{}",
                self.seq.fetch_add(1, Ordering::Relaxed)
            );
            pipe.incr(METRIC_TOTAL, 1_u64)
                .ignore()
                .hincr(METRIC_SYMBOL_COUNTS, symbol, 1_i64)
                .ignore()
                .set(METRIC_LAST_TIME, timestamp_ms)
                .ignore();
            pipe.cmd("SET")
                .arg(METRIC_FIRST_TIME)
                .arg(timestamp_ms)
                .arg("NX")
                .ignore();
            pipe.zadd(METRIC_LAST_MINUTE, member, timestamp_ms)
                .ignore()
                .zrembyscore(METRIC_LAST_MINUTE, "-inf", timestamp_ms - 60_000)
                .ignore();
        }

        pipe.query_async::<()>(&mut self.conn.clone())
            .await
            .map_err(cache_err)
    }

    /// Realtime summary computed from the metric keys.
    pub async fn summary(&self, top_n: usize) -> Result<RealtimeSummary> {
        let (total, last_minute, first, counts, mut active): (
            Option<u64>,
            u64,
            Option<i64>,
            HashMap<String, u64>,
            Vec<String>,
        ) = redis::pipe()
            .get(METRIC_TOTAL)
            .zcard(METRIC_LAST_MINUTE)
            .get(METRIC_FIRST_TIME)
            .hgetall(METRIC_SYMBOL_COUNTS)
            .smembers(ACTIVE_SYMBOLS)
            .query_async(&mut self.conn.clone())
            .await
            .map_err(cache_err)?;

        let total = total.unwrap_or(0);
        let now_ms = Utc::now().timestamp_millis();
        let overall = first
            .filter(|&f| f != 0 && now_ms > f)
            .map(|f| total as f64 * 1000.0 / (now_ms - f) as f64);

        let mut top: Vec<SymbolCount> = counts
            .into_iter()
            .map(|(symbol, count)| SymbolCount { symbol, count })
            .collect();
        top.sort_by(|a, b| b.count.cmp(&a.count).then(a.symbol.cmp(&b.symbol)));
        top.truncate(top_n);
        active.sort();

        let last_minute = usize::try_from(last_minute).unwrap_or(usize::MAX);
        Ok(RealtimeSummary {
            total_ticks: total,
            last_minute_count: last_minute,
            ticks_per_second: last_minute as f64 / 60.0,
            overall_ticks_per_second: overall,
            top_symbols: top,
            active_symbols: active,
        })
    }

    /// Count, last time and last stored payload for one symbol.
    pub async fn symbol_snapshot(&self, symbol: &str) -> Result<SymbolSnapshot> {
        let mut conn = self.conn.clone();
        let count: Option<u64> = conn
            .hget(METRIC_SYMBOL_COUNTS, symbol)
            .await
            .map_err(cache_err)?;
        let last: Vec<(String, i64)> = conn
            .zrange_withscores(series_key(Channel::Tick, symbol), -1, -1)
            .await
            .map_err(cache_err)?;

        let (last_payload, last_timestamp) = last
            .into_iter()
            .next()
            .map_or((None, None), |(payload, score)| {
                (Some(payload), Some(score))
            });
        Ok(SymbolSnapshot {
            symbol: symbol.to_owned(),
            count: count.unwrap_or(0),
            last_timestamp,
            last_payload,
        })
    }
}

impl std::fmt::Debug for RedisTickStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisTickStore")
            .field("max_entries", &self.max_entries)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn series_keys_follow_the_namespace() {
        assert_eq!(series_key(Channel::Tick, "GARAN"), "algolab:tick:GARAN");
        assert_eq!(
            series_key(Channel::OrderBook, "AKBNK"),
            "algolab:orderbook:AKBNK"
        );
        assert_eq!(series_key(Channel::Trade, "THYAO"), "algolab:trade:THYAO");
    }
}
