//! Shared `(token, hash)` credential pair.
//!
//! The authentication service is the only writer; the REST client and the
//! WebSocket client read through [`TokenCell`], which hands out immutable
//! snapshots. Readers take a fresh snapshot per request and never cache one
//! across a retry, so a re-login mid-flight is picked up on the next call.

use std::sync::Arc;

use arc_swap::ArcSwapOption;
use secrecy::{ExposeSecret as _, SecretString};

/// The credential pair produced by a completed two-step login.
#[derive(Clone)]
pub struct AuthTokens {
    token: SecretString,
    hash: SecretString,
}

impl AuthTokens {
    /// Wrap a freshly issued pair.
    #[must_use]
    pub fn new(token: impl Into<String>, hash: impl Into<String>) -> Self {
        Self {
            token: SecretString::from(token.into()),
            hash: SecretString::from(hash.into()),
        }
    }

    /// The opaque login token (credential-step output).
    #[must_use]
    pub fn token(&self) -> &str {
        self.token.expose_secret()
    }

    /// The opaque authorization hash (OTP-step output).
    #[must_use]
    pub fn hash(&self) -> &str {
        self.hash.expose_secret()
    }
}

impl std::fmt::Debug for AuthTokens {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthTokens").finish_non_exhaustive()
    }
}

/// Atomic holder of the current credential pair.
#[derive(Debug, Default)]
pub struct TokenCell {
    inner: ArcSwapOption<AuthTokens>,
}

impl TokenCell {
    /// An empty cell.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a new credential pair, replacing any previous one.
    pub fn set(&self, tokens: AuthTokens) {
        self.inner.store(Some(Arc::new(tokens)));
    }

    /// Forget the credential pair.
    pub fn clear(&self) {
        self.inner.store(None);
    }

    /// Snapshot the current pair, if authenticated.
    #[must_use]
    pub fn get(&self) -> Option<Arc<AuthTokens>> {
        self.inner.load_full()
    }

    /// Whether a pair is currently installed.
    #[must_use]
    pub fn is_set(&self) -> bool {
        self.inner.load().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_get_clear() {
        let cell = TokenCell::new();
        assert!(!cell.is_set());
        assert!(cell.get().is_none());

        cell.set(AuthTokens::new("T1", "H1"));
        let snapshot = cell.get().expect("set");
        assert_eq!(snapshot.token(), "T1");
        assert_eq!(snapshot.hash(), "H1");

        cell.clear();
        assert!(!cell.is_set());
    }

    #[test]
    fn snapshots_survive_replacement() {
        let cell = TokenCell::new();
        cell.set(AuthTokens::new("T1", "H1"));
        let old = cell.get().expect("set");

        cell.set(AuthTokens::new("T2", "H2"));
        // The old snapshot is still readable; new reads see the new pair.
        assert_eq!(old.hash(), "H1");
        assert_eq!(cell.get().expect("set").hash(), "H2");
    }

    #[test]
    fn debug_does_not_leak_secrets() {
        let tokens = AuthTokens::new("T1", "H1");
        let rendered = format!("{tokens:?}");
        assert!(!rendered.contains("T1"));
        assert!(!rendered.contains("H1"));
    }
}
