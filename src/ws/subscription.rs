//! The active subscription set and its replay-on-reconnect discipline.
//!
//! Identity is `(channel, symbol)`. Adds and removes are idempotent: a
//! duplicate subscribe sends nothing, an unsubscribe of an absent pair
//! sends nothing. A failed subscribe frame removes the intent and surfaces
//! the error; replay failures keep the intent so the next reconnect tries
//! again.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::connection::ConnectionManager;
use super::messages::{ALL_SYMBOLS, Channel, OutboundFrame};
use crate::Result;

/// Replay bookkeeping since construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplayStats {
    /// Subscribe frames replayed successfully.
    pub replayed: u64,
    /// Replay frames that could not be queued.
    pub failed: u64,
}

/// Owns the set of active `(channel, symbol)` subscriptions.
pub struct SubscriptionManager {
    connection: ConnectionManager,
    subscriptions: DashMap<(Channel, String), ()>,
    replayed: AtomicU64,
    replay_failed: AtomicU64,
}

impl SubscriptionManager {
    /// Wire the manager to a connection.
    #[must_use]
    pub fn new(connection: ConnectionManager) -> Self {
        Self {
            connection,
            subscriptions: DashMap::new(),
            replayed: AtomicU64::new(0),
            replay_failed: AtomicU64::new(0),
        }
    }

    /// Subscribe to `channel` data for `symbol`. Duplicate adds are no-ops.
    pub fn subscribe(&self, channel: Channel, symbol: &str) -> Result<()> {
        let key = (channel, symbol.to_owned());
        if self.subscriptions.insert(key, ()).is_some() {
            debug!(%channel, symbol, "already subscribed");
            return Ok(());
        }

        let frame = OutboundFrame::Subscribe {
            channel,
            symbol: symbol.to_owned(),
        };
        if let Err(e) = self.connection.send(&frame) {
            // The intent did not make it onto the wire path; forget it so
            // the set only ever reflects what replay should restore.
            self.subscriptions.remove(&(channel, symbol.to_owned()));
            return Err(e);
        }
        info!(%channel, symbol, "subscribed");
        Ok(())
    }

    /// Unsubscribe from `channel` data for `symbol`. Removing an absent
    /// pair is a no-op.
    pub fn unsubscribe(&self, channel: Channel, symbol: &str) -> Result<()> {
        if self
            .subscriptions
            .remove(&(channel, symbol.to_owned()))
            .is_none()
        {
            return Ok(());
        }
        self.connection.send(&OutboundFrame::Unsubscribe {
            channel,
            symbol: symbol.to_owned(),
        })?;
        info!(%channel, symbol, "unsubscribed");
        Ok(())
    }

    /// Subscribe to every instrument on `channel` with one server-side
    /// wildcard subscription. Tracked as a single entry, not expanded.
    pub fn subscribe_all(&self, channel: Channel) -> Result<()> {
        self.subscribe(channel, ALL_SYMBOLS)
    }

    /// Whether the wildcard subscription is active for `channel`.
    #[must_use]
    pub fn is_subscribed_to_all(&self, channel: Channel) -> bool {
        self.contains(channel, ALL_SYMBOLS)
    }

    /// Whether `(channel, symbol)` is in the active set.
    #[must_use]
    pub fn contains(&self, channel: Channel, symbol: &str) -> bool {
        self.subscriptions
            .contains_key(&(channel, symbol.to_owned()))
    }

    /// Number of active subscriptions.
    #[must_use]
    pub fn count(&self) -> usize {
        self.subscriptions.len()
    }

    /// Snapshot of the active set.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(Channel, String)> {
        self.subscriptions
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Drop every subscription without sending unsubscribe frames; used at
    /// shutdown when the socket is going away anyway.
    pub fn clear_all(&self) {
        self.subscriptions.clear();
    }

    /// Replay counters.
    #[must_use]
    pub fn replay_stats(&self) -> ReplayStats {
        ReplayStats {
            replayed: self.replayed.load(Ordering::Relaxed),
            failed: self.replay_failed.load(Ordering::Relaxed),
        }
    }

    /// Watch the connection and replay the active set after every
    /// reconnect. The first connect is not a replay: frames queued before
    /// it flush from the sender queue on their own.
    pub fn start_replay_handler(self: Arc<Self>, cancel: CancellationToken) {
        let manager = self;
        let mut state_rx = manager.connection.state_receiver();

        tokio::spawn(async move {
            let mut was_connected = state_rx.borrow().is_connected();
            let mut had_session = was_connected;

            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    changed = state_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let connected = state_rx.borrow_and_update().is_connected();
                        let became_connected = connected && !was_connected;
                        was_connected = connected;
                        if !became_connected {
                            continue;
                        }
                        if had_session {
                            manager.replay();
                        } else {
                            had_session = true;
                        }
                    }
                }
            }
            debug!("replay handler stopped");
        });
    }

    fn replay(&self) {
        let mut ok = 0_u64;
        let mut failed = 0_u64;
        for entry in self.subscriptions.iter() {
            let (channel, symbol) = entry.key();
            let frame = OutboundFrame::Subscribe {
                channel: *channel,
                symbol: symbol.clone(),
            };
            // Failures keep the intent; the next reconnect tries again.
            match self.connection.send(&frame) {
                Ok(()) => ok += 1,
                Err(e) => {
                    warn!(%channel, symbol, error = %e, "replay frame failed");
                    failed += 1;
                }
            }
        }
        self.replayed.fetch_add(ok, Ordering::Relaxed);
        self.replay_failed.fetch_add(failed, Ordering::Relaxed);
        info!(replayed = ok, failed, "subscriptions replayed after reconnect");
    }
}

impl std::fmt::Debug for SubscriptionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionManager")
            .field("count", &self.count())
            .finish_non_exhaustive()
    }
}
