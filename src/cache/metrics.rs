//! In-process tick metrics.
//!
//! Counters and a sliding last-minute window, updated on every tick insert.
//! The invariants the monitoring surface leans on: the total equals the sum
//! of per-symbol counts, and ticks/sec is the number of window timestamps
//! inside `[now - 60s, now]` divided by 60, inclusive of the insert that
//! triggered the query.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;

/// Length of the sliding rate window, in milliseconds.
const WINDOW_MS: i64 = 60_000;

/// One symbol's share of the tick count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SymbolCount {
    /// Instrument code.
    pub symbol: String,
    /// Ticks recorded for it.
    pub count: u64,
}

/// Live tick-flow summary.
#[derive(Debug, Clone, Serialize)]
pub struct RealtimeSummary {
    /// Ticks recorded since startup.
    pub total_ticks: u64,
    /// Timestamps currently inside the last-minute window.
    pub last_minute_count: usize,
    /// `last_minute_count / 60`.
    pub ticks_per_second: f64,
    /// Average rate since the first recorded tick, when one exists.
    pub overall_ticks_per_second: Option<f64>,
    /// Busiest symbols, descending by count.
    pub top_symbols: Vec<SymbolCount>,
    /// Symbols with recent activity.
    pub active_symbols: Vec<String>,
}

/// Per-symbol counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SymbolStats {
    /// Instrument code.
    pub symbol: String,
    /// Ticks recorded for it.
    pub count: u64,
    /// Timestamp of the most recent tick, epoch milliseconds.
    pub last_timestamp: Option<i64>,
}

/// Atomic counters plus the last-minute window.
#[derive(Debug)]
pub struct TickMetrics {
    total: AtomicU64,
    per_symbol: DashMap<String, AtomicU64>,
    last_seen: DashMap<String, i64>,
    first_tick_ms: AtomicI64,
    last_tick_ms: AtomicI64,
    window: Mutex<VecDeque<i64>>,
    active_ttl_ms: i64,
}

impl TickMetrics {
    /// Metrics treating symbols quiet for longer than `active_ttl` as
    /// inactive.
    #[must_use]
    pub fn new(active_ttl: Duration) -> Self {
        Self {
            total: AtomicU64::new(0),
            per_symbol: DashMap::new(),
            last_seen: DashMap::new(),
            first_tick_ms: AtomicI64::new(0),
            last_tick_ms: AtomicI64::new(0),
            window: Mutex::new(VecDeque::new()),
            active_ttl_ms: i64::try_from(active_ttl.as_millis()).unwrap_or(i64::MAX),
        }
    }

    /// Record one tick.
    pub fn record(&self, symbol: &str, timestamp_ms: i64) {
        self.total.fetch_add(1, Ordering::Relaxed);
        self.per_symbol
            .entry(symbol.to_owned())
            .or_default()
            .fetch_add(1, Ordering::Relaxed);
        self.last_seen.insert(symbol.to_owned(), timestamp_ms);
        self.last_tick_ms.store(timestamp_ms, Ordering::Relaxed);
        // First-tick time is set once and never overwritten.
        _ = self.first_tick_ms.compare_exchange(
            0,
            timestamp_ms,
            Ordering::Relaxed,
            Ordering::Relaxed,
        );

        let mut window = self.window.lock();
        window.push_back(timestamp_ms);
        while window
            .front()
            .is_some_and(|&ts| ts < timestamp_ms - WINDOW_MS)
        {
            window.pop_front();
        }
    }

    /// Ticks recorded since startup.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    /// Last-minute rate, evaluated now.
    #[must_use]
    pub fn ticks_per_second(&self) -> f64 {
        self.ticks_per_second_at(Utc::now().timestamp_millis())
    }

    /// Last-minute rate, evaluated at `now_ms`.
    #[must_use]
    pub fn ticks_per_second_at(&self, now_ms: i64) -> f64 {
        self.window_count_at(now_ms) as f64 / 60.0
    }

    /// Full summary, evaluated now.
    #[must_use]
    pub fn summary(&self, top_n: usize) -> RealtimeSummary {
        self.summary_at(Utc::now().timestamp_millis(), top_n)
    }

    /// Full summary, evaluated at `now_ms`.
    #[must_use]
    pub fn summary_at(&self, now_ms: i64, top_n: usize) -> RealtimeSummary {
        let total = self.total();
        let last_minute_count = self.window_count_at(now_ms);

        let first = self.first_tick_ms.load(Ordering::Relaxed);
        let overall = (first != 0 && now_ms > first)
            .then(|| total as f64 * 1000.0 / (now_ms - first) as f64);

        let mut top: Vec<SymbolCount> = self
            .per_symbol
            .iter()
            .map(|entry| SymbolCount {
                symbol: entry.key().clone(),
                count: entry.value().load(Ordering::Relaxed),
            })
            .collect();
        top.sort_by(|a, b| b.count.cmp(&a.count).then(a.symbol.cmp(&b.symbol)));
        top.truncate(top_n);

        let mut active: Vec<String> = self
            .last_seen
            .iter()
            .filter(|entry| now_ms - *entry.value() <= self.active_ttl_ms)
            .map(|entry| entry.key().clone())
            .collect();
        active.sort();

        RealtimeSummary {
            total_ticks: total,
            last_minute_count,
            ticks_per_second: last_minute_count as f64 / 60.0,
            overall_ticks_per_second: overall,
            top_symbols: top,
            active_symbols: active,
        }
    }

    /// Counters for one symbol.
    #[must_use]
    pub fn symbol_stats(&self, symbol: &str) -> Option<SymbolStats> {
        let count = self
            .per_symbol
            .get(symbol)
            .map(|c| c.load(Ordering::Relaxed))?;
        Some(SymbolStats {
            symbol: symbol.to_owned(),
            count,
            last_timestamp: self.last_seen.get(symbol).map(|ts| *ts),
        })
    }

    fn window_count_at(&self, now_ms: i64) -> usize {
        let window = self.window.lock();
        window
            .iter()
            .filter(|&&ts| ts >= now_ms - WINDOW_MS && ts <= now_ms)
            .count()
    }
}
