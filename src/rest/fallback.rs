//! Last-good-response fallback cache.
//!
//! Read-class responses are stored here as raw JSON on every success. When
//! the circuit refuses a call or retries are exhausted, the client serves
//! the last good body if it is still inside the TTL. Entries are raw
//! `serde_json::Value` passthrough; typed decoding happens at the caller,
//! which also marks the result as cached.
//!
//! Entries are scoped to the session that fetched them: the authentication
//! service purges the cache whenever the credential pair changes, so one
//! account's positions can never be replayed into another account's
//! session.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct StoredResponse {
    body: serde_json::Value,
    stored_at: Instant,
}

/// Point-in-time fallback cache statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FallbackStats {
    /// Entries currently stored.
    pub entries: usize,
    /// Successful responses recorded.
    pub stores: u64,
    /// Calls answered from the cache.
    pub served: u64,
    /// Fallback lookups that found nothing usable.
    pub misses: u64,
}

/// Short-TTL store of last good responses, keyed by endpoint + payload.
#[derive(Debug)]
pub struct FallbackCache {
    ttl: Duration,
    entries: DashMap<String, StoredResponse>,
    stores: AtomicU64,
    served: AtomicU64,
    misses: AtomicU64,
}

impl FallbackCache {
    /// A cache serving entries no older than `ttl`.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: DashMap::new(),
            stores: AtomicU64::new(0),
            served: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Cache key for one call: same endpoint, same payload.
    #[must_use]
    pub fn key(endpoint: &str, body: &str) -> String {
        format!("{endpoint}:{body}")
    }

    /// Record a successful response body.
    pub fn store(&self, key: String, body: serde_json::Value) {
        self.stores.fetch_add(1, Ordering::Relaxed);
        self.entries.insert(
            key,
            StoredResponse {
                body,
                stored_at: Instant::now(),
            },
        );
    }

    /// Fetch the last good body for `key` if it is within the TTL.
    ///
    /// Stale entries are dropped on the way out.
    #[must_use]
    pub fn last_good(&self, key: &str) -> Option<serde_json::Value> {
        if let Some(entry) = self.entries.get(key) {
            if entry.stored_at.elapsed() <= self.ttl {
                self.served.fetch_add(1, Ordering::Relaxed);
                return Some(entry.body.clone());
            }
        }
        self.entries.remove(key);
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Drop every entry. Counters are kept; they describe lifetime traffic.
    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Current statistics.
    #[must_use]
    pub fn stats(&self) -> FallbackStats {
        FallbackStats {
            entries: self.entries.len(),
            stores: self.stores.load(Ordering::Relaxed),
            served: self.served.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn serves_within_ttl_only() {
        let cache = FallbackCache::new(Duration::from_secs(300));
        let key = FallbackCache::key("GetEquityInfo", r#"{"symbol":"AKBNK"}"#);

        cache.store(key.clone(), json!({"price": "45.50"}));
        assert_eq!(
            cache.last_good(&key),
            Some(json!({"price": "45.50"})),
            "fresh entry is served"
        );

        tokio::time::advance(Duration::from_secs(301)).await;
        assert!(cache.last_good(&key).is_none(), "stale entry is dropped");
        assert_eq!(cache.stats().entries, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn distinct_payloads_do_not_collide() {
        let cache = FallbackCache::new(Duration::from_secs(300));
        let akbnk = FallbackCache::key("GetEquityInfo", r#"{"symbol":"AKBNK"}"#);
        let garan = FallbackCache::key("GetEquityInfo", r#"{"symbol":"GARAN"}"#);

        cache.store(akbnk.clone(), json!({"symbol": "AKBNK"}));
        assert!(cache.last_good(&garan).is_none());
        assert!(cache.last_good(&akbnk).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn stats_track_traffic() {
        let cache = FallbackCache::new(Duration::from_secs(300));
        let key = FallbackCache::key("GetEquityInfo", "{}");

        cache.store(key.clone(), json!(1));
        let _ = cache.last_good(&key);
        let _ = cache.last_good("absent:{}");

        let stats = cache.stats();
        assert_eq!(stats.stores, 1);
        assert_eq!(stats.served, 1);
        assert_eq!(stats.misses, 1);
    }
}
