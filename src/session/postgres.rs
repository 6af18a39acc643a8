//! Postgres session store.

use std::str::FromStr as _;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use tokio_postgres::NoTls;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Session, SessionStore, TerminationReason};
use crate::Result;
use crate::error::{Error, Kind};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS algolab_sessions (
    id                          BIGSERIAL PRIMARY KEY,
    token                       TEXT        NOT NULL,
    hash                        TEXT        NOT NULL,
    created_at                  TIMESTAMPTZ NOT NULL,
    expires_at                  TIMESTAMPTZ NOT NULL,
    last_refresh_at             TIMESTAMPTZ,
    websocket_connected         BOOLEAN     NOT NULL DEFAULT FALSE,
    websocket_last_connected_at TIMESTAMPTZ,
    active                      BOOLEAN     NOT NULL,
    termination_reason          TEXT
)";

/// Row-per-session Postgres store.
///
/// Saving a session deactivates prior actives in the same transaction, so
/// the "one active session per login" invariant holds even with concurrent
/// writers. A background cleanup loop expires overdue sessions and purges
/// inactive rows past the retention window.
pub struct PostgresSessionStore {
    pool: Pool,
}

impl PostgresSessionStore {
    /// Connect to `database_url` and ensure the sessions table exists.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pg_config = database_url
            .parse::<tokio_postgres::Config>()
            .map_err(|e| Error::with_source(Kind::Session, e))?;
        let manager = Manager::from_config(
            pg_config,
            NoTls,
            ManagerConfig {
                recycling_method: RecyclingMethod::Fast,
            },
        );
        let pool = Pool::builder(manager)
            .max_size(4)
            .build()
            .map_err(|e| Error::with_source(Kind::Session, e))?;

        let store = Self { pool };
        let client = store.client().await?;
        client
            .execute(SCHEMA, &[])
            .await
            .map_err(|e| Error::with_source(Kind::Session, e))?;
        Ok(store)
    }

    async fn client(&self) -> Result<deadpool_postgres::Object> {
        self.pool
            .get()
            .await
            .map_err(|e| Error::with_source(Kind::Session, e))
    }

    /// Deactivate active sessions whose local expiry has passed.
    pub async fn deactivate_expired(&self) -> Result<u64> {
        let client = self.client().await?;
        let updated = client
            .execute(
                "UPDATE algolab_sessions
                 SET active = FALSE, termination_reason = $1
                 WHERE active AND expires_at < now()",
                &[&TerminationReason::Expired.to_string()],
            )
            .await
            .map_err(|e| Error::with_source(Kind::Session, e))?;
        Ok(updated)
    }

    /// Delete inactive rows older than the retention window.
    pub async fn purge_inactive(&self, retention_days: i64) -> Result<u64> {
        let cutoff: DateTime<Utc> = Utc::now() - chrono::Duration::days(retention_days);
        let client = self.client().await?;
        let deleted = client
            .execute(
                "DELETE FROM algolab_sessions WHERE NOT active AND created_at < $1",
                &[&cutoff],
            )
            .await
            .map_err(|e| Error::with_source(Kind::Session, e))?;
        Ok(deleted)
    }

    /// Spawn the periodic cleanup loop: expire overdue sessions, then purge
    /// rows past retention. Runs until `cancel` fires.
    pub fn spawn_cleanup(
        self: Arc<Self>,
        interval: Duration,
        retention_days: i64,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let store = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The immediate first tick would race startup; skip it.
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        match store.deactivate_expired().await {
                            Ok(0) => {}
                            Ok(n) => info!(expired = n, "deactivated expired sessions"),
                            Err(e) => warn!(error = %e, "session expiry sweep failed"),
                        }
                        match store.purge_inactive(retention_days).await {
                            Ok(0) => {}
                            Ok(n) => info!(purged = n, "purged inactive sessions"),
                            Err(e) => warn!(error = %e, "session purge failed"),
                        }
                    }
                }
            }
            debug!("session cleanup loop stopped");
        })
    }
}

fn row_to_session(row: &tokio_postgres::Row) -> Session {
    let reason: Option<String> = row.get("termination_reason");
    Session {
        token: row.get("token"),
        hash: row.get("hash"),
        created_at: row.get("created_at"),
        expires_at: row.get("expires_at"),
        last_refresh_at: row.get("last_refresh_at"),
        websocket_connected: row.get("websocket_connected"),
        websocket_last_connected_at: row.get("websocket_last_connected_at"),
        active: row.get("active"),
        termination_reason: reason.and_then(|r| TerminationReason::from_str(&r).ok()),
    }
}

#[async_trait::async_trait]
impl SessionStore for PostgresSessionStore {
    async fn save(&self, session: &Session) -> Result<()> {
        let mut client = self.client().await?;
        let tx = client
            .transaction()
            .await
            .map_err(|e| Error::with_source(Kind::Session, e))?;
        tx.execute(
            "UPDATE algolab_sessions
             SET active = FALSE, termination_reason = $1
             WHERE active",
            &[&TerminationReason::Superseded.to_string()],
        )
        .await
        .map_err(|e| Error::with_source(Kind::Session, e))?;
        tx.execute(
            "INSERT INTO algolab_sessions
             (token, hash, created_at, expires_at, last_refresh_at,
              websocket_connected, websocket_last_connected_at, active,
              termination_reason)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
            &[
                &session.token,
                &session.hash,
                &session.created_at,
                &session.expires_at,
                &session.last_refresh_at,
                &session.websocket_connected,
                &session.websocket_last_connected_at,
                &session.active,
                &session.termination_reason.map(|r| r.to_string()),
            ],
        )
        .await
        .map_err(|e| Error::with_source(Kind::Session, e))?;
        tx.commit()
            .await
            .map_err(|e| Error::with_source(Kind::Session, e))
    }

    async fn load_active(&self) -> Result<Option<Session>> {
        let client = self.client().await?;
        let row = client
            .query_opt(
                "SELECT * FROM algolab_sessions
                 WHERE active
                 ORDER BY created_at DESC
                 LIMIT 1",
                &[],
            )
            .await
            .map_err(|e| Error::with_source(Kind::Session, e))?;
        Ok(row.as_ref().map(row_to_session))
    }

    async fn deactivate(&self, reason: TerminationReason) -> Result<()> {
        let client = self.client().await?;
        client
            .execute(
                "UPDATE algolab_sessions
                 SET active = FALSE, termination_reason = $1
                 WHERE active",
                &[&reason.to_string()],
            )
            .await
            .map_err(|e| Error::with_source(Kind::Session, e))?;
        Ok(())
    }

    async fn touch_refresh(&self) -> Result<()> {
        let client = self.client().await?;
        client
            .execute(
                "UPDATE algolab_sessions SET last_refresh_at = now() WHERE active",
                &[],
            )
            .await
            .map_err(|e| Error::with_source(Kind::Session, e))?;
        Ok(())
    }

    async fn update_websocket(&self, connected: bool) -> Result<()> {
        let client = self.client().await?;
        let sql = if connected {
            "UPDATE algolab_sessions
             SET websocket_connected = TRUE, websocket_last_connected_at = now()
             WHERE active"
        } else {
            "UPDATE algolab_sessions SET websocket_connected = FALSE WHERE active"
        };
        client
            .execute(sql, &[])
            .await
            .map_err(|e| Error::with_source(Kind::Session, e))?;
        Ok(())
    }
}
