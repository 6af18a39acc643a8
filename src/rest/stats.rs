//! Per-endpoint call accounting.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;

#[derive(Debug, Default)]
struct Counters {
    success: AtomicU64,
    error: AtomicU64,
    retries: AtomicU64,
    fallbacks: AtomicU64,
    latency_total_ms: AtomicU64,
    latency_max_ms: AtomicU64,
}

/// Snapshot of one endpoint's counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointStats {
    /// Endpoint name.
    pub endpoint: String,
    /// Successful calls.
    pub success: u64,
    /// Failed calls (after retries, before fallback).
    pub error: u64,
    /// Retry attempts beyond the first call.
    pub retries: u64,
    /// Calls answered by the fallback handler.
    pub fallbacks: u64,
    /// Mean upstream latency over successful and failed calls, in ms.
    pub mean_latency_ms: u64,
    /// Worst observed upstream latency, in ms.
    pub max_latency_ms: u64,
}

/// Lock-free per-endpoint counters, shared with the monitoring surface.
#[derive(Debug, Default)]
pub struct CallStats {
    endpoints: DashMap<&'static str, Counters>,
}

impl CallStats {
    /// Empty stats.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a completed upstream attempt.
    pub fn record(&self, endpoint: &'static str, success: bool, elapsed: Duration) {
        let entry = self.endpoints.entry(endpoint).or_default();
        if success {
            entry.success.fetch_add(1, Ordering::Relaxed);
        } else {
            entry.error.fetch_add(1, Ordering::Relaxed);
        }
        let ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        entry.latency_total_ms.fetch_add(ms, Ordering::Relaxed);
        entry.latency_max_ms.fetch_max(ms, Ordering::Relaxed);
    }

    /// Record one retry attempt.
    pub fn record_retry(&self, endpoint: &'static str) {
        self.endpoints
            .entry(endpoint)
            .or_default()
            .retries
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Record a call answered by the fallback handler.
    pub fn record_fallback(&self, endpoint: &'static str) {
        self.endpoints
            .entry(endpoint)
            .or_default()
            .fallbacks
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot every endpoint's counters.
    #[must_use]
    pub fn snapshot(&self) -> Vec<EndpointStats> {
        let mut stats: Vec<EndpointStats> = self
            .endpoints
            .iter()
            .map(|entry| {
                let c = entry.value();
                let success = c.success.load(Ordering::Relaxed);
                let error = c.error.load(Ordering::Relaxed);
                let calls = success + error;
                EndpointStats {
                    endpoint: (*entry.key()).to_owned(),
                    success,
                    error,
                    retries: c.retries.load(Ordering::Relaxed),
                    fallbacks: c.fallbacks.load(Ordering::Relaxed),
                    mean_latency_ms: if calls == 0 {
                        0
                    } else {
                        c.latency_total_ms.load(Ordering::Relaxed) / calls
                    },
                    max_latency_ms: c.latency_max_ms.load(Ordering::Relaxed),
                }
            })
            .collect();
        stats.sort_by(|a, b| a.endpoint.cmp(&b.endpoint));
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let stats = CallStats::new();
        stats.record("SendOrder", true, Duration::from_millis(120));
        stats.record("SendOrder", false, Duration::from_millis(80));
        stats.record_retry("GetEquityInfo");
        stats.record_fallback("GetEquityInfo");

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.len(), 2);

        let send = snapshot
            .iter()
            .find(|s| s.endpoint == "SendOrder")
            .expect("recorded");
        assert_eq!(send.success, 1);
        assert_eq!(send.error, 1);
        assert_eq!(send.mean_latency_ms, 100);
        assert_eq!(send.max_latency_ms, 120);

        let equity = snapshot
            .iter()
            .find(|s| s.endpoint == "GetEquityInfo")
            .expect("recorded");
        assert_eq!(equity.retries, 1);
        assert_eq!(equity.fallbacks, 1);
    }
}
