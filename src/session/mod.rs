//! Persisted broker sessions.
//!
//! A [`Session`] is the durable record of a completed two-step login: the
//! opaque `token` from the credential step and the `hash` from the OTP step,
//! plus bookkeeping the gateway needs to restore itself after a restart.
//! Only one session is active per brokerage login; activating a new one
//! deactivates whatever came before it.
//!
//! Two interchangeable backends implement [`SessionStore`]: a Postgres
//! row-per-session store and a single-JSON-document file store. Both treat
//! a missing or malformed store as "no session" rather than an error.

mod file;
mod postgres;

use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::Result;

pub use file::FileSessionStore;
pub use postgres::PostgresSessionStore;

/// Why a session stopped being active.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum_macros::Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum TerminationReason {
    /// Explicit logout by the caller.
    Logout,
    /// Local expiry or an authoritative 401 from the broker.
    Expired,
    /// The restore-time liveness probe failed.
    ValidationFailed,
    /// A newer session replaced this one.
    Superseded,
    /// The gateway shut down.
    Shutdown,
}

impl FromStr for TerminationReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "LOGOUT" => Ok(Self::Logout),
            "EXPIRED" => Ok(Self::Expired),
            "VALIDATION_FAILED" => Ok(Self::ValidationFailed),
            "SUPERSEDED" => Ok(Self::Superseded),
            "SHUTDOWN" => Ok(Self::Shutdown),
            other => Err(format!("unknown termination reason: {other}")),
        }
    }
}

/// A persisted broker session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    /// Opaque token from the credential step.
    pub token: String,
    /// Opaque authorization hash from the OTP step.
    pub hash: String,
    /// When the session was created.
    pub created_at: DateTime<Utc>,
    /// Local expiry; the broker's own hash lifetime is not discoverable, so
    /// a 401 during refresh always overrides this.
    pub expires_at: DateTime<Utc>,
    /// Last successful refresh, if any.
    #[serde(default)]
    pub last_refresh_at: Option<DateTime<Utc>>,
    /// Whether the market-data socket is currently up.
    #[serde(default)]
    pub websocket_connected: bool,
    /// Last time the market-data socket connected.
    #[serde(default)]
    pub websocket_last_connected_at: Option<DateTime<Utc>>,
    /// Whether this is the live session.
    pub active: bool,
    /// Set when `active` goes false.
    #[serde(default)]
    pub termination_reason: Option<TerminationReason>,
}

impl Session {
    /// Create a fresh active session expiring `expiration_hours` from now.
    #[must_use]
    pub fn new(token: String, hash: String, expiration_hours: i64) -> Self {
        let now = Utc::now();
        Self {
            token,
            hash,
            created_at: now,
            expires_at: now + Duration::hours(expiration_hours),
            last_refresh_at: None,
            websocket_connected: false,
            websocket_last_connected_at: None,
            active: true,
            termination_reason: None,
        }
    }

    /// Whether the local expiry has passed.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }
}

/// Pluggable persistence for the active session.
#[async_trait::async_trait]
pub trait SessionStore: Send + Sync {
    /// Persist `session` as the active one, deactivating any prior active
    /// session for the same brokerage login.
    async fn save(&self, session: &Session) -> Result<()>;

    /// Load the most recent active session, if one exists and the store is
    /// readable. Missing or malformed stores yield `None`.
    async fn load_active(&self) -> Result<Option<Session>>;

    /// Mark the active session inactive with the given reason.
    async fn deactivate(&self, reason: TerminationReason) -> Result<()>;

    /// Record a refresh on the active session.
    async fn touch_refresh(&self) -> Result<()>;

    /// Mirror the market-data socket status onto the active session.
    async fn update_websocket(&self, connected: bool) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_session_is_active_and_unexpired() {
        let session = Session::new("T1".to_owned(), "H1".to_owned(), 24);
        assert!(session.active);
        assert!(!session.is_expired());
        assert!(session.termination_reason.is_none());
    }

    #[test]
    fn zero_hour_session_is_expired() {
        let session = Session::new("T1".to_owned(), "H1".to_owned(), 0);
        assert!(session.is_expired());
    }

    #[test]
    fn termination_reason_round_trips_text() {
        for reason in [
            TerminationReason::Logout,
            TerminationReason::Expired,
            TerminationReason::ValidationFailed,
            TerminationReason::Superseded,
            TerminationReason::Shutdown,
        ] {
            let text = reason.to_string();
            assert_eq!(text.parse::<TerminationReason>(), Ok(reason));
        }
        assert!("WHATEVER".parse::<TerminationReason>().is_err());
    }
}
