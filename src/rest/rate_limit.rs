//! Broker-side rate limiting.
//!
//! The broker allows one REST call every five seconds per session. This
//! limiter spaces dispatches by reserving slots: each caller takes the next
//! free slot under a short lock, then sleeps outside the lock until its slot
//! arrives. Reservation order is lock order, so waiters drain FIFO.

use std::time::Duration;

use tokio::time::Instant;

use crate::Result;
use crate::error::{Error, Kind};

/// Slot-reservation rate limiter.
#[derive(Debug)]
pub struct RateLimiter {
    interval: Duration,
    next_slot: tokio::sync::Mutex<Option<Instant>>,
}

impl RateLimiter {
    /// A limiter spacing permits `interval` apart.
    #[must_use]
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            next_slot: tokio::sync::Mutex::new(None),
        }
    }

    /// Spacing between permits.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        self.interval
    }

    /// Acquire a permit, waiting at most `max_wait`.
    ///
    /// When the queue is long enough that this caller's slot lies beyond
    /// `max_wait`, no slot is taken and the call fails with
    /// [`Kind::RateLimit`] instead of blocking past its own time budget.
    pub async fn acquire(&self, max_wait: Duration) -> Result<()> {
        let slot = {
            let mut next = self.next_slot.lock().await;
            let now = Instant::now();
            let slot = match *next {
                Some(at) if at > now => at,
                _ => now,
            };
            if slot.saturating_duration_since(now) > max_wait {
                return Err(Error::new(Kind::RateLimit));
            }
            *next = Some(slot + self.interval);
            slot
        };
        tokio::time::sleep_until(slot).await;
        Ok(())
    }
}
