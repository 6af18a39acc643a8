//! Market-data stream facade.

use std::sync::Arc;

use async_stream::stream;
use futures::Stream;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::connection::{ConnectionManager, ConnectionState};
use super::messages::{Channel, MarketMessage, OrderBookDatum, TickDatum, TradeDatum};
use super::subscription::{ReplayStats, SubscriptionManager};
use crate::Result;
use crate::auth::tokens::TokenCell;
use crate::config::GatewayConfig;

/// The live market-data channel: one persistent authenticated WebSocket,
/// an idempotent subscription set, typed message streams.
///
/// Cloning is cheap and shares the underlying connection.
#[derive(Clone)]
pub struct MarketStream {
    inner: Arc<StreamInner>,
}

struct StreamInner {
    connection: ConnectionManager,
    subscriptions: Arc<SubscriptionManager>,
}

impl MarketStream {
    /// Open the stream. The connection loop starts immediately and requires
    /// an installed credential pair; callers gate on authentication first.
    pub fn connect(
        config: &GatewayConfig,
        tokens: Arc<TokenCell>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let connection = ConnectionManager::new(
            config.api.websocket_url.clone(),
            config.websocket.clone(),
            config.api.key.clone(),
            config.api.hostname.clone(),
            tokens,
            cancel.clone(),
        )?;
        let subscriptions = Arc::new(SubscriptionManager::new(connection.clone()));
        Arc::clone(&subscriptions).start_replay_handler(cancel);

        Ok(Self {
            inner: Arc::new(StreamInner {
                connection,
                subscriptions,
            }),
        })
    }

    /// Subscribe to `channel` data for `symbol`.
    pub fn subscribe(&self, channel: Channel, symbol: &str) -> Result<()> {
        self.inner.subscriptions.subscribe(channel, symbol)
    }

    /// Unsubscribe from `channel` data for `symbol`.
    pub fn unsubscribe(&self, channel: Channel, symbol: &str) -> Result<()> {
        self.inner.subscriptions.unsubscribe(channel, symbol)
    }

    /// One wildcard subscription covering every instrument on `channel`.
    pub fn subscribe_all(&self, channel: Channel) -> Result<()> {
        self.inner.subscriptions.subscribe_all(channel)
    }

    /// Whether the wildcard subscription is active for `channel`.
    #[must_use]
    pub fn is_subscribed_to_all(&self, channel: Channel) -> bool {
        self.inner.subscriptions.is_subscribed_to_all(channel)
    }

    /// Current connection state.
    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        self.inner.connection.state()
    }

    /// Watch connection state changes.
    #[must_use]
    pub fn state_receiver(&self) -> tokio::sync::watch::Receiver<ConnectionState> {
        self.inner.connection.state_receiver()
    }

    /// Raw firehose of every inbound market-data message.
    #[must_use]
    pub fn messages(&self) -> broadcast::Receiver<MarketMessage> {
        self.inner.connection.subscribe()
    }

    /// Typed stream of price updates.
    pub fn ticks(&self) -> impl Stream<Item = TickDatum> + use<> {
        filtered(self.messages(), |msg| match msg {
            MarketMessage::Tick(tick) => Some(tick),
            _ => None,
        })
    }

    /// Typed stream of depth snapshots.
    pub fn order_books(&self) -> impl Stream<Item = OrderBookDatum> + use<> {
        filtered(self.messages(), |msg| match msg {
            MarketMessage::OrderBook(book) => Some(book),
            _ => None,
        })
    }

    /// Typed stream of executed trades.
    pub fn trades(&self) -> impl Stream<Item = TradeDatum> + use<> {
        filtered(self.messages(), |msg| match msg {
            MarketMessage::Trade(trade) => Some(trade),
            _ => None,
        })
    }

    /// Number of active subscriptions.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.inner.subscriptions.count()
    }

    /// Snapshot of the active subscription set.
    #[must_use]
    pub fn subscription_snapshot(&self) -> Vec<(Channel, String)> {
        self.inner.subscriptions.snapshot()
    }

    /// Replay counters.
    #[must_use]
    pub fn replay_stats(&self) -> ReplayStats {
        self.inner.subscriptions.replay_stats()
    }

    /// Forget every subscription without unsubscribing; shutdown path.
    pub fn clear_subscriptions(&self) {
        self.inner.subscriptions.clear_all();
    }
}

/// Turn the broadcast receiver into a typed stream, skipping lagged gaps.
fn filtered<T>(
    mut receiver: broadcast::Receiver<MarketMessage>,
    pick: impl Fn(MarketMessage) -> Option<T>,
) -> impl Stream<Item = T> {
    stream! {
        loop {
            match receiver.recv().await {
                Ok(msg) => {
                    if let Some(item) = pick(msg) {
                        yield item;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "market stream consumer lagging, frames dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}

impl std::fmt::Debug for MarketStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarketStream")
            .field("state", &self.connection_state())
            .field("subscriptions", &self.subscription_count())
            .finish_non_exhaustive()
    }
}
