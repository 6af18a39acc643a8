//! Circuit breaker guarding the broker upstream.
//!
//! Count-based sliding window over the most recent call outcomes. The
//! circuit opens when, with at least `minimum_number_of_calls` recorded,
//! the failure rate or the slow-call rate reaches its threshold; it stays
//! open for `wait_duration_in_open_state`, then admits a bounded set of
//! half-open probes and decides from their outcomes alone. `ForcedOpen` is
//! an operator override and never transitions on its own.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::Result;
use crate::config::CircuitBreakerConfig;
use crate::error::Error;

/// Observable circuit state.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum CircuitState {
    /// Calls pass through; outcomes feed the sliding window.
    Closed,
    /// Calls are rejected without contacting the upstream.
    Open,
    /// A bounded number of probe calls are admitted.
    HalfOpen,
    /// Operator-forced rejection; only an explicit reset leaves this state.
    ForcedOpen,
}

#[derive(Debug, Clone, Copy)]
struct Outcome {
    failure: bool,
    slow: bool,
}

#[derive(Debug)]
enum Phase {
    Closed { window: VecDeque<Outcome> },
    Open { since: Instant },
    HalfOpen { inflight: u32, outcomes: Vec<Outcome> },
    ForcedOpen,
}

/// Point-in-time circuit metrics for the observability surface.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CircuitMetrics {
    /// Current state.
    pub state: CircuitState,
    /// Failure percentage over the current window, if enough calls recorded.
    pub failure_rate: Option<f64>,
    /// Slow-call percentage over the current window, if enough calls recorded.
    pub slow_call_rate: Option<f64>,
    /// Outcomes currently in the window.
    pub recorded_calls: usize,
    /// Calls rejected without reaching the upstream, since construction.
    pub rejected_calls: u64,
    /// Open transitions since construction.
    pub times_opened: u64,
}

/// The breaker itself. One instance guards the whole broker upstream.
pub struct CircuitBreaker {
    name: &'static str,
    config: CircuitBreakerConfig,
    phase: Mutex<Phase>,
    rejected: AtomicU64,
    times_opened: AtomicU64,
}

fn rate(outcomes: &[Outcome], pick: impl Fn(&Outcome) -> bool) -> f64 {
    if outcomes.is_empty() {
        return 0.0;
    }
    let hits = outcomes.iter().filter(|o| pick(o)).count();
    hits as f64 * 100.0 / outcomes.len() as f64
}

impl CircuitBreaker {
    /// Create a breaker with the given name and thresholds.
    #[must_use]
    pub fn new(name: &'static str, config: CircuitBreakerConfig) -> Self {
        let capacity = config_window(&config);
        Self {
            name,
            config,
            phase: Mutex::new(Phase::Closed {
                window: VecDeque::with_capacity(capacity),
            }),
            rejected: AtomicU64::new(0),
            times_opened: AtomicU64::new(0),
        }
    }

    /// Ask to place one call. `Err` means the circuit refused it.
    pub fn try_acquire(&self) -> Result<()> {
        let mut phase = self.phase.lock();
        match &mut *phase {
            Phase::Closed { .. } => Ok(()),
            Phase::ForcedOpen => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                Err(Error::circuit_open(self.name))
            }
            Phase::Open { since } => {
                if since.elapsed() >= self.config.wait_duration_in_open_state() {
                    info!(circuit = self.name, "circuit half-open, probing upstream");
                    *phase = Phase::HalfOpen {
                        inflight: 1,
                        outcomes: Vec::new(),
                    };
                    Ok(())
                } else {
                    self.rejected.fetch_add(1, Ordering::Relaxed);
                    Err(Error::circuit_open(self.name))
                }
            }
            Phase::HalfOpen { inflight, outcomes } => {
                let admitted = *inflight as usize + outcomes.len();
                if admitted < self.config.permitted_number_of_calls_in_half_open_state as usize {
                    *inflight += 1;
                    Ok(())
                } else {
                    self.rejected.fetch_add(1, Ordering::Relaxed);
                    Err(Error::circuit_open(self.name))
                }
            }
        }
    }

    /// Record the outcome of a call admitted by [`try_acquire`].
    ///
    /// [`try_acquire`]: Self::try_acquire
    pub fn record(&self, success: bool, elapsed: Duration) {
        let outcome = Outcome {
            failure: !success,
            slow: elapsed >= self.config.slow_call_duration_threshold(),
        };
        let mut phase = self.phase.lock();
        match &mut *phase {
            Phase::Closed { window } => {
                if window.len() >= config_window(&self.config) {
                    window.pop_front();
                }
                window.push_back(outcome);
                if window.len() >= self.config.minimum_number_of_calls as usize
                    && self.thresholds_breached(window.make_contiguous())
                {
                    self.note_opened(window.make_contiguous());
                    *phase = Phase::Open {
                        since: Instant::now(),
                    };
                }
            }
            Phase::HalfOpen { inflight, outcomes } => {
                *inflight = inflight.saturating_sub(1);
                outcomes.push(outcome);
                if outcomes.len()
                    >= self.config.permitted_number_of_calls_in_half_open_state as usize
                {
                    if self.thresholds_breached(outcomes) {
                        self.note_opened(outcomes);
                        *phase = Phase::Open {
                            since: Instant::now(),
                        };
                    } else {
                        info!(circuit = self.name, "circuit closed after probing");
                        *phase = Phase::Closed {
                            window: VecDeque::with_capacity(config_window(&self.config)),
                        };
                    }
                }
            }
            // A late completion racing a forced transition carries no signal.
            Phase::Open { .. } | Phase::ForcedOpen => {}
        }
    }

    /// Operator override: reject everything until [`reset`](Self::reset).
    pub fn force_open(&self) {
        warn!(circuit = self.name, "circuit forced open");
        *self.phase.lock() = Phase::ForcedOpen;
    }

    /// Operator override: return to `Closed` with an empty window.
    pub fn reset(&self) {
        info!(circuit = self.name, "circuit reset to closed");
        *self.phase.lock() = Phase::Closed {
            window: VecDeque::with_capacity(config_window(&self.config)),
        };
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        match &*self.phase.lock() {
            Phase::Closed { .. } => CircuitState::Closed,
            Phase::Open { .. } => CircuitState::Open,
            Phase::HalfOpen { .. } => CircuitState::HalfOpen,
            Phase::ForcedOpen => CircuitState::ForcedOpen,
        }
    }

    /// Snapshot of state plus rolling rates.
    #[must_use]
    pub fn metrics(&self) -> CircuitMetrics {
        let mut phase = self.phase.lock();
        let (state, outcomes): (CircuitState, &[Outcome]) = match &mut *phase {
            Phase::Closed { window } => (CircuitState::Closed, window.make_contiguous()),
            Phase::Open { .. } => (CircuitState::Open, &[]),
            Phase::HalfOpen { outcomes, .. } => (CircuitState::HalfOpen, outcomes.as_slice()),
            Phase::ForcedOpen => (CircuitState::ForcedOpen, &[]),
        };
        let enough = outcomes.len() >= self.config.minimum_number_of_calls as usize;
        CircuitMetrics {
            state,
            failure_rate: enough.then(|| rate(outcomes, |o| o.failure)),
            slow_call_rate: enough.then(|| rate(outcomes, |o| o.slow)),
            recorded_calls: outcomes.len(),
            rejected_calls: self.rejected.load(Ordering::Relaxed),
            times_opened: self.times_opened.load(Ordering::Relaxed),
        }
    }

    fn thresholds_breached(&self, outcomes: &[Outcome]) -> bool {
        rate(outcomes, |o| o.failure) >= self.config.failure_rate_threshold
            || rate(outcomes, |o| o.slow) >= self.config.slow_call_rate_threshold
    }

    fn note_opened(&self, outcomes: &[Outcome]) {
        self.times_opened.fetch_add(1, Ordering::Relaxed);
        warn!(
            circuit = self.name,
            failure_rate = rate(outcomes, |o| o.failure),
            slow_call_rate = rate(outcomes, |o| o.slow),
            "circuit opened"
        );
    }
}

const fn config_window(config: &CircuitBreakerConfig) -> usize {
    config.sliding_window_size
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Kind;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new("broker", CircuitBreakerConfig::default())
    }

    fn fast() -> Duration {
        Duration::from_millis(10)
    }

    #[tokio::test(start_paused = true)]
    async fn opens_after_failure_threshold() {
        let cb = breaker();

        // Five consecutive failures: min calls met, failure rate 100%.
        for _ in 0..5 {
            cb.try_acquire().expect("closed admits");
            cb.record(false, fast());
        }
        assert_eq!(cb.state(), CircuitState::Open);

        let err = cb.try_acquire().expect_err("open rejects");
        assert_eq!(err.kind(), Kind::CircuitOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_probe_after_wait() {
        let cb = breaker();
        for _ in 0..5 {
            cb.try_acquire().expect("closed admits");
            cb.record(false, fast());
        }

        tokio::time::advance(Duration::from_secs(60)).await;

        // First call after the wait is the probe.
        cb.try_acquire().expect("probe admitted");
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        // Ten successful probes close the circuit.
        cb.record(true, fast());
        for _ in 0..9 {
            cb.try_acquire().expect("probe admitted");
            cb.record(true, fast());
        }
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_probes_reopen() {
        let cb = breaker();
        for _ in 0..5 {
            cb.try_acquire().expect("closed admits");
            cb.record(false, fast());
        }
        tokio::time::advance(Duration::from_secs(60)).await;

        for _ in 0..10 {
            cb.try_acquire().expect("probe admitted");
            cb.record(false, fast());
        }
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_admits_bounded_probes() {
        let cb = breaker();
        for _ in 0..5 {
            cb.try_acquire().expect("closed admits");
            cb.record(false, fast());
        }
        tokio::time::advance(Duration::from_secs(60)).await;

        // Ten probes in flight; the eleventh is refused.
        for _ in 0..10 {
            cb.try_acquire().expect("probe admitted");
        }
        assert!(cb.try_acquire().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_calls_open_the_circuit() {
        let cb = breaker();
        // Successes, but every one slower than the 5s threshold.
        for _ in 0..5 {
            cb.try_acquire().expect("closed admits");
            cb.record(true, Duration::from_secs(6));
        }
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn forced_open_ignores_time() {
        let cb = breaker();
        cb.force_open();
        tokio::time::advance(Duration::from_secs(600)).await;
        assert!(cb.try_acquire().is_err());
        assert_eq!(cb.state(), CircuitState::ForcedOpen);

        cb.reset();
        cb.try_acquire().expect("closed after reset");
    }

    #[tokio::test(start_paused = true)]
    async fn metrics_report_rates() {
        let cb = breaker();
        // One failure in five keeps the 50% threshold unbreached.
        for i in 0..5 {
            cb.try_acquire().expect("closed admits");
            cb.record(i != 0, fast());
        }
        let metrics = cb.metrics();
        assert_eq!(metrics.state, CircuitState::Closed);
        assert_eq!(metrics.recorded_calls, 5);
        assert_eq!(metrics.failure_rate, Some(20.0));
        assert_eq!(metrics.slow_call_rate, Some(0.0));
    }
}
