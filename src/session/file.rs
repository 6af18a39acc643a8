//! Single-document file session store.

use std::path::PathBuf;

use tracing::warn;

use super::{Session, SessionStore, TerminationReason};
use crate::Result;
use crate::error::{Error, Kind};

/// Session store backed by one JSON document on disk.
///
/// Writes replace the whole document (last writer wins); reads tolerate a
/// missing or malformed file by reporting no session. `deactivate` deletes
/// the document, matching a logout wiping local state.
#[derive(Debug, Clone)]
pub struct FileSessionStore {
    path: PathBuf,
}

impl FileSessionStore {
    /// Create a store writing to `path`. The file is created lazily on the
    /// first save.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    async fn read_document(&self) -> Option<Session> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "session file unreadable");
                return None;
            }
        };
        match serde_json::from_slice::<Session>(&bytes) {
            Ok(session) => Some(session),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "session file malformed, ignoring");
                None
            }
        }
    }

    async fn write_document(&self, session: &Session) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(session)?;
        tokio::fs::write(&self.path, bytes)
            .await
            .map_err(|e| Error::with_source(Kind::Session, e))
    }
}

#[async_trait::async_trait]
impl SessionStore for FileSessionStore {
    async fn save(&self, session: &Session) -> Result<()> {
        // One document per login: saving implicitly supersedes whatever the
        // file held before.
        self.write_document(session).await
    }

    async fn load_active(&self) -> Result<Option<Session>> {
        Ok(self.read_document().await.filter(|s| s.active))
    }

    async fn deactivate(&self, reason: TerminationReason) -> Result<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {
                tracing::debug!(%reason, path = %self.path.display(), "session file removed");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::with_source(Kind::Session, e)),
        }
    }

    async fn touch_refresh(&self) -> Result<()> {
        if let Some(mut session) = self.read_document().await {
            session.last_refresh_at = Some(chrono::Utc::now());
            self.write_document(&session).await?;
        }
        Ok(())
    }

    async fn update_websocket(&self, connected: bool) -> Result<()> {
        if let Some(mut session) = self.read_document().await {
            session.websocket_connected = connected;
            if connected {
                session.websocket_last_connected_at = Some(chrono::Utc::now());
            }
            self.write_document(&session).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_in(dir: &tempfile::TempDir) -> FileSessionStore {
        FileSessionStore::new(dir.path().join("session.json"))
    }

    #[tokio::test]
    async fn missing_file_is_no_session() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store_in(&dir);
        assert!(store.load_active().await.expect("load").is_none());
        // Deactivating a store that never existed is a no-op.
        store
            .deactivate(TerminationReason::Logout)
            .await
            .expect("deactivate");
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store_in(&dir);

        let session = Session::new("T1".to_owned(), "H1".to_owned(), 24);
        store.save(&session).await.expect("save");

        let loaded = store.load_active().await.expect("load").expect("present");
        assert_eq!(loaded.token, "T1");
        assert_eq!(loaded.hash, "H1");
        assert!(loaded.active);
    }

    #[tokio::test]
    async fn malformed_document_is_treated_as_missing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("session.json");
        tokio::fs::write(&path, b"{ not json")
            .await
            .expect("write garbage");

        let store = FileSessionStore::new(path);
        assert!(store.load_active().await.expect("load").is_none());
    }

    #[tokio::test]
    async fn deactivate_removes_document() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store_in(&dir);

        let session = Session::new("T1".to_owned(), "H1".to_owned(), 24);
        store.save(&session).await.expect("save");
        store
            .deactivate(TerminationReason::Logout)
            .await
            .expect("deactivate");

        assert!(store.load_active().await.expect("load").is_none());
    }

    #[tokio::test]
    async fn websocket_status_is_mirrored() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store_in(&dir);

        let session = Session::new("T1".to_owned(), "H1".to_owned(), 24);
        store.save(&session).await.expect("save");
        store.update_websocket(true).await.expect("update");

        let loaded = store.load_active().await.expect("load").expect("present");
        assert!(loaded.websocket_connected);
        assert!(loaded.websocket_last_connected_at.is_some());
    }
}
