//! Bounded per-symbol history buffers.
//!
//! Each symbol maps to a time-sorted deque capped two ways: at most
//! `max_entries` items, and nothing older than `ttl`. Both bounds are
//! enforced lazily, on insert and again on read, so a quiet symbol ages
//! out without a sweeper task.

use std::collections::VecDeque;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct Entry<T> {
    timestamp: i64,
    arrived: Instant,
    value: T,
}

/// Per-symbol bounded, time-sorted history.
#[derive(Debug)]
pub struct SeriesBuffer<T> {
    max_entries: usize,
    ttl: Duration,
    buffers: DashMap<String, VecDeque<Entry<T>>>,
}

impl<T: Clone> SeriesBuffer<T> {
    /// A buffer keeping up to `max_entries` items per symbol, none older
    /// than `ttl`.
    #[must_use]
    pub fn new(max_entries: usize, ttl: Duration) -> Self {
        Self {
            max_entries,
            ttl,
            buffers: DashMap::new(),
        }
    }

    /// Append one item. Out-of-order timestamps are placed, not rejected;
    /// arrival order still drives eviction.
    pub fn insert(&self, symbol: &str, timestamp: i64, value: T) {
        let mut buffer = self.buffers.entry(symbol.to_owned()).or_default();
        let at = buffer.partition_point(|e| e.timestamp <= timestamp);
        buffer.insert(
            at,
            Entry {
                timestamp,
                arrived: Instant::now(),
                value,
            },
        );
        Self::trim(&mut buffer, self.max_entries, self.ttl);
    }

    /// Everything still inside both bounds for `symbol`, oldest first.
    #[must_use]
    pub fn recent(&self, symbol: &str) -> Vec<T> {
        let Some(mut buffer) = self.buffers.get_mut(symbol) else {
            return Vec::new();
        };
        Self::trim(&mut buffer, self.max_entries, self.ttl);
        buffer.iter().map(|e| e.value.clone()).collect()
    }

    /// The newest item for `symbol`, if any survives the bounds.
    #[must_use]
    pub fn latest(&self, symbol: &str) -> Option<T> {
        let mut buffer = self.buffers.get_mut(symbol)?;
        Self::trim(&mut buffer, self.max_entries, self.ttl);
        buffer.back().map(|e| e.value.clone())
    }

    /// Items currently held for `symbol` (without re-trimming).
    #[must_use]
    pub fn len(&self, symbol: &str) -> usize {
        self.buffers.get(symbol).map_or(0, |b| b.len())
    }

    /// Whether nothing is held for `symbol`.
    #[must_use]
    pub fn is_empty(&self, symbol: &str) -> bool {
        self.len(symbol) == 0
    }

    fn trim(buffer: &mut VecDeque<Entry<T>>, max_entries: usize, ttl: Duration) {
        while buffer
            .front()
            .is_some_and(|e| e.arrived.elapsed() > ttl)
        {
            buffer.pop_front();
        }
        while buffer.len() > max_entries {
            buffer.pop_front();
        }
    }
}
