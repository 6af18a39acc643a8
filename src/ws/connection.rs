//! WebSocket connection lifecycle.
//!
//! One task owns the socket: reads, writes, and heartbeat scheduling all
//! funnel through its `select!` loop, so outbound frames are serialized
//! through a single owner and frame ordering is preserved. Reconnection is
//! the outer loop around it, driven by exponential backoff; the connection
//! is only attempted while a credential pair is installed, because the
//! handshake must be signed.

use std::sync::Arc;
use std::time::Duration;

use backoff::backoff::Backoff as _;
use futures::{SinkExt as _, StreamExt as _};
use serde::Deserialize;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{Instant, interval, sleep, timeout};
use tokio_tungstenite::tungstenite::client::IntoClientRequest as _;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::error::WsError;
use super::messages::{MarketMessage, OutboundFrame, parse_frame};
use crate::Result;
use crate::auth::tokens::TokenCell;
use crate::config::WebSocketSettings;
use crate::crypto;
use crate::error::Error;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Broadcast channel capacity for incoming messages.
const BROADCAST_CAPACITY: usize = 1024;

/// Consecutive silent heartbeat intervals before the connection is declared
/// stale and torn down for reconnect.
const MAX_MISSED_HEARTBEATS: u32 = 2;

/// Connection state tracking.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected.
    Disconnected,
    /// Attempting to connect.
    Connecting,
    /// Successfully connected.
    Connected {
        /// When the connection was established.
        since: Instant,
    },
    /// Waiting out the backoff before the next attempt.
    Reconnecting {
        /// Current reconnection attempt number.
        attempt: u32,
    },
}

impl ConnectionState {
    /// Check if the connection is currently active.
    #[must_use]
    pub const fn is_connected(self) -> bool {
        matches!(self, Self::Connected { .. })
    }
}

/// Acknowledgement and other non-data frames from the broker.
#[derive(Deserialize)]
struct ControlFrame {
    #[serde(rename = "type")]
    kind: String,
}

/// Manages the WebSocket connection: reconnect, heartbeat, fan-out.
#[derive(Clone)]
pub struct ConnectionManager {
    state_tx: watch::Sender<ConnectionState>,
    sender_tx: mpsc::UnboundedSender<String>,
    broadcast_tx: broadcast::Sender<MarketMessage>,
}

impl ConnectionManager {
    /// Start the connection loop.
    ///
    /// The loop runs until `cancel` fires, the attempt cap is reached, or
    /// the credential pair disappears (logout mid-session).
    pub fn new(
        endpoint: String,
        settings: WebSocketSettings,
        api_key: String,
        hostname: String,
        tokens: Arc<TokenCell>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let signing_path = url::Url::parse(&endpoint)?.path().to_owned();

        let (sender_tx, sender_rx) = mpsc::unbounded_channel();
        let (broadcast_tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);

        let loop_broadcast = broadcast_tx.clone();
        let loop_state = state_tx.clone();
        tokio::spawn(async move {
            Self::connection_loop(
                endpoint,
                signing_path,
                settings,
                api_key,
                hostname,
                tokens,
                sender_rx,
                loop_broadcast,
                loop_state,
                cancel,
            )
            .await;
        });

        Ok(Self {
            state_tx,
            sender_tx,
            broadcast_tx,
        })
    }

    /// Main connection loop with automatic reconnection.
    #[expect(clippy::too_many_arguments, reason = "loop owns every moving part")]
    async fn connection_loop(
        endpoint: String,
        signing_path: String,
        settings: WebSocketSettings,
        api_key: String,
        hostname: String,
        tokens: Arc<TokenCell>,
        mut sender_rx: mpsc::UnboundedReceiver<String>,
        broadcast_tx: broadcast::Sender<MarketMessage>,
        state_tx: watch::Sender<ConnectionState>,
        cancel: CancellationToken,
    ) {
        let mut attempt = 0_u32;
        let mut backoff: backoff::ExponentialBackoff = settings.reconnect.clone().into();

        loop {
            if cancel.is_cancelled() {
                break;
            }

            // The handshake is signed; without credentials there is nothing
            // to connect as.
            let Some(auth) = tokens.get() else {
                info!("no credentials installed, stopping websocket loop");
                break;
            };

            _ = state_tx.send_replace(ConnectionState::Connecting);

            match Self::open(
                &endpoint,
                &signing_path,
                &api_key,
                &hostname,
                auth.hash(),
                settings.connection_timeout(),
            )
            .await
            {
                Ok(ws_stream) => {
                    attempt = 0;
                    backoff.reset();
                    _ = state_tx.send_replace(ConnectionState::Connected {
                        since: Instant::now(),
                    });
                    info!("websocket connected");

                    if let Err(e) = Self::handle_connection(
                        ws_stream,
                        &mut sender_rx,
                        &broadcast_tx,
                        state_tx.subscribe(),
                        &settings,
                        &cancel,
                    )
                    .await
                    {
                        warn!(error = %e, "websocket session ended");
                    }
                }
                Err(e) => {
                    warn!(error = %e, attempt, "websocket connect failed");
                    attempt = attempt.saturating_add(1);
                }
            }

            if cancel.is_cancelled() || !settings.reconnect.enabled {
                break;
            }
            if let Some(max) = settings.reconnect.attempt_cap()
                && attempt >= max
            {
                warn!(attempt, "websocket attempt cap reached, giving up");
                break;
            }

            _ = state_tx.send_replace(ConnectionState::Reconnecting { attempt });

            if let Some(duration) = backoff.next_backoff() {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = sleep(duration) => {}
                }
            }
        }

        _ = state_tx.send_replace(ConnectionState::Disconnected);
        debug!("websocket loop stopped");
    }

    /// Open one signed connection.
    async fn open(
        endpoint: &str,
        signing_path: &str,
        api_key: &str,
        hostname: &str,
        hash: &str,
        handshake_timeout: Duration,
    ) -> Result<WsStream> {
        let mut request = endpoint
            .into_client_request()
            .map_err(WsError::Connection)?;
        let headers = request.headers_mut();
        headers.insert(
            "APIKEY",
            api_key
                .parse()
                .map_err(|_e| Error::validation("api key is not a valid header"))?,
        );
        headers.insert(
            "Authorization",
            hash.parse()
                .map_err(|_e| Error::validation("session hash is not a valid header"))?,
        );
        let checker = crypto::checker(api_key, hostname, signing_path, "");
        headers.insert(
            "Checker",
            checker
                .parse()
                .map_err(|_e| Error::validation("checker is not a valid header"))?,
        );

        match timeout(handshake_timeout, connect_async(request)).await {
            Ok(Ok((ws_stream, _response))) => Ok(ws_stream),
            Ok(Err(e)) => Err(WsError::Connection(e).into()),
            Err(_elapsed) => Err(WsError::HandshakeTimeout.into()),
        }
    }

    /// Drive one live connection until it ends.
    async fn handle_connection(
        ws_stream: WsStream,
        sender_rx: &mut mpsc::UnboundedReceiver<String>,
        broadcast_tx: &broadcast::Sender<MarketMessage>,
        state_rx: watch::Receiver<ConnectionState>,
        settings: &WebSocketSettings,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let (mut write, mut read) = ws_stream.split();

        // Any traffic resets the idle clock the heartbeat loop watches.
        let (activity_tx, activity_rx) = watch::channel(Instant::now());
        let (ping_tx, mut ping_rx) = mpsc::unbounded_channel();
        let (stale_tx, mut stale_rx) = mpsc::unbounded_channel::<()>();

        let heartbeat_interval = settings.heartbeat_interval();
        let heartbeat_handle = tokio::spawn(async move {
            Self::heartbeat_loop(heartbeat_interval, state_rx, activity_rx, ping_tx, stale_tx)
                .await;
        });

        let result = loop {
            tokio::select! {
                () = cancel.cancelled() => break Ok(()),

                Some(msg) = read.next() => {
                    match msg {
                        Ok(Message::Text(text)) => {
                            _ = activity_tx.send(Instant::now());
                            match parse_frame(&text) {
                                Ok(message) => {
                                    // Nobody listening is fine; the router
                                    // attaches when the cache starts.
                                    _ = broadcast_tx.send(message);
                                }
                                Err(parse_error) => {
                                    if let Ok(control) =
                                        serde_json::from_str::<ControlFrame>(&text)
                                    {
                                        debug!(kind = %control.kind, "control frame");
                                    } else {
                                        warn!(%text, error = %parse_error, "unparseable frame");
                                    }
                                }
                            }
                        }
                        Ok(Message::Ping(_) | Message::Pong(_)) => {
                            _ = activity_tx.send(Instant::now());
                        }
                        Ok(Message::Close(_)) => {
                            break Err(WsError::ConnectionClosed.into());
                        }
                        Err(e) => {
                            break Err(WsError::Connection(e).into());
                        }
                        _ => {
                            // Binary frames are not part of the feed.
                        }
                    }
                }

                Some(text) = sender_rx.recv() => {
                    _ = activity_tx.send(Instant::now());
                    if write.send(Message::Text(text.into())).await.is_err() {
                        break Err(WsError::ConnectionClosed.into());
                    }
                }

                Some(()) = ping_rx.recv() => {
                    let ping = match serde_json::to_string(&OutboundFrame::Heartbeat) {
                        Ok(ping) => ping,
                        Err(e) => break Err(e.into()),
                    };
                    if write.send(Message::Text(ping.into())).await.is_err() {
                        break Err(WsError::ConnectionClosed.into());
                    }
                }

                Some(()) = stale_rx.recv() => {
                    break Err(WsError::Stale.into());
                }

                else => break Ok(()),
            }
        };

        heartbeat_handle.abort();
        result
    }

    /// Heartbeat watchdog.
    ///
    /// Every interval with no traffic sends one ping; two consecutive silent
    /// intervals declare the connection stale and force a reconnect.
    async fn heartbeat_loop(
        heartbeat_interval: Duration,
        state_rx: watch::Receiver<ConnectionState>,
        activity_rx: watch::Receiver<Instant>,
        ping_tx: mpsc::UnboundedSender<()>,
        stale_tx: mpsc::UnboundedSender<()>,
    ) {
        let mut ticker = interval(heartbeat_interval);
        ticker.tick().await; // the immediate tick
        let mut outstanding = false;
        let mut missed = 0_u32;

        loop {
            ticker.tick().await;

            if !state_rx.borrow().is_connected() {
                break;
            }

            if activity_rx.borrow().elapsed() < heartbeat_interval {
                outstanding = false;
                missed = 0;
                continue;
            }

            if outstanding {
                missed += 1;
                if missed >= MAX_MISSED_HEARTBEATS {
                    warn!(missed, "heartbeats unanswered, forcing reconnect");
                    _ = stale_tx.send(());
                    break;
                }
            }
            if ping_tx.send(()).is_err() {
                break;
            }
            outstanding = true;
        }
    }

    /// Queue a frame for the writer.
    ///
    /// Frames queued while disconnected are flushed on the next session.
    pub fn send(&self, frame: &OutboundFrame) -> Result<()> {
        let json = serde_json::to_string(frame)?;
        self.sender_tx
            .send(json)
            .map_err(|_e| WsError::LoopStopped)?;
        Ok(())
    }

    /// Get the current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Subscribe to incoming market-data messages.
    ///
    /// Each call returns an independent receiver.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<MarketMessage> {
        self.broadcast_tx.subscribe()
    }

    /// Subscribe to connection state changes.
    ///
    /// Used to detect reconnections and re-establish subscriptions.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_predicates() {
        assert!(!ConnectionState::Disconnected.is_connected());
        assert!(!ConnectionState::Connecting.is_connected());
        assert!(!ConnectionState::Reconnecting { attempt: 3 }.is_connected());
        assert!(
            ConnectionState::Connected {
                since: Instant::now()
            }
            .is_connected()
        );
    }
}
