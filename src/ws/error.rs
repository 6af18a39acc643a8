//! WebSocket failure sources.

/// Low-level WebSocket errors, wrapped into [`crate::Error`] with
/// [`crate::error::Kind::WebSocket`].
#[derive(Debug, thiserror::Error)]
pub enum WsError {
    /// Transport-level connection failure.
    #[error("websocket connection failed: {0}")]
    Connection(#[from] tokio_tungstenite::tungstenite::Error),
    /// The peer closed the connection.
    #[error("websocket connection closed by peer")]
    ConnectionClosed,
    /// The handshake did not complete within the configured timeout.
    #[error("websocket handshake timed out")]
    HandshakeTimeout,
    /// The heartbeat watchdog saw two silent intervals in a row.
    #[error("connection stale: two consecutive heartbeats unanswered")]
    Stale,
    /// The connection loop has terminated; no frames can be sent.
    #[error("websocket connection loop is not running")]
    LoopStopped,
}

impl From<WsError> for crate::Error {
    fn from(err: WsError) -> Self {
        Self::with_source(crate::error::Kind::WebSocket, err)
    }
}
