//! The login state machine.
//!
//! Three states: `Unauthenticated → AwaitingOtp → Authenticated`. The
//! credential step yields an opaque token and triggers the broker-side SMS;
//! the OTP step trades token + code for the authorization hash. There is no
//! edge from `Authenticated` back to `AwaitingOtp`: re-authentication is a
//! full two-step login or a successful restore-plus-validate.
//!
//! This service is the only writer of the shared [`TokenCell`]; everything
//! else reads. Transport failures are never retried here — the REST
//! client's envelope already decided — and OTP-step precondition violations
//! are surfaced as typed errors, never swallowed.

use std::sync::Arc;

use secrecy::{ExposeSecret as _, SecretString};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::tokens::{AuthTokens, TokenCell};
use crate::Result;
use crate::config::GatewayConfig;
use crate::crypto;
use crate::error::{AuthKind, Error};
use crate::rest::endpoints::{GET_SUBACCOUNTS, LOGIN_USER, LOGIN_USER_CONTROL, SESSION_REFRESH};
use crate::rest::{EndpointClass, RestClient};
use crate::session::{Session, SessionStore, TerminationReason};

/// Observable authentication state. Carries no secrets.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum AuthState {
    /// No session; `login_user` is the only way forward.
    Unauthenticated,
    /// Token held, waiting for the SMS code.
    AwaitingOtp,
    /// Hash installed; signed calls and the WebSocket handshake work.
    Authenticated,
}

enum Step {
    Unauthenticated,
    AwaitingOtp { token: SecretString },
    Authenticated,
}

// Field order is the wire order; the Checker hash is computed over exactly
// this serialization.
#[derive(Serialize)]
struct LoginUserPayload {
    username: String,
    password: String,
}

#[derive(Serialize)]
struct LoginControlPayload {
    token: String,
    password: String,
}

#[derive(Deserialize)]
struct LoginUserContent {
    token: String,
}

#[derive(Deserialize)]
struct LoginControlContent {
    hash: String,
}

/// The brokerage login lifecycle.
pub struct AuthService {
    rest: Arc<RestClient>,
    store: Arc<dyn SessionStore>,
    tokens: Arc<TokenCell>,
    aes_key: [u8; 16],
    expiration_hours: i64,
    refresh_interval: std::time::Duration,
    keep_alive: bool,
    step: tokio::sync::Mutex<Step>,
    state_tx: watch::Sender<AuthState>,
}

impl AuthService {
    /// Wire the service against the REST client and session store.
    pub fn new(
        config: &GatewayConfig,
        rest: Arc<RestClient>,
        store: Arc<dyn SessionStore>,
        tokens: Arc<TokenCell>,
    ) -> Result<Self> {
        let aes_key = crypto::derive_key(&config.api.key)?;
        let (state_tx, _) = watch::channel(AuthState::Unauthenticated);
        Ok(Self {
            rest,
            store,
            tokens,
            aes_key,
            expiration_hours: config.session.expiration_hours,
            refresh_interval: config.auth.refresh_interval(),
            keep_alive: config.auth.keep_alive,
            step: tokio::sync::Mutex::new(Step::Unauthenticated),
            state_tx,
        })
    }

    /// Credential step: post encrypted username/password, hold the returned
    /// token, and wait for the broker to send the SMS code.
    ///
    /// Restarts the flow from any state; a previous session's credentials
    /// are dropped because the broker invalidates them on a fresh login.
    pub async fn login_user(&self, username: &str, password: &SecretString) -> Result<()> {
        let payload = LoginUserPayload {
            username: crypto::encrypt_field(&self.aes_key, username),
            password: crypto::encrypt_field(&self.aes_key, password.expose_secret()),
        };

        let content: LoginUserContent = self
            .rest
            .post_public(LOGIN_USER, &payload)
            .await
            .map_err(|e| {
                if e.is_broker_rejection() {
                    Error::auth(AuthKind::InvalidCredentials, format!("login rejected: {e}"))
                } else {
                    e
                }
            })?;

        self.tokens.clear();
        self.rest.purge_fallback();
        *self.step.lock().await = Step::AwaitingOtp {
            token: SecretString::from(content.token),
        };
        self.publish(AuthState::AwaitingOtp);
        info!("login accepted, awaiting SMS code");
        Ok(())
    }

    /// OTP step: post encrypted token + code, install the returned hash,
    /// and persist the session.
    pub async fn verify_otp(&self, code: &str) -> Result<()> {
        let mut step = self.step.lock().await;
        let token = match &*step {
            Step::AwaitingOtp { token } => token.expose_secret().to_owned(),
            _ => {
                return Err(Error::auth(
                    AuthKind::MissingPriorStep,
                    "verify_otp requires a successful login_user first",
                ));
            }
        };

        let payload = LoginControlPayload {
            token: crypto::encrypt_field(&self.aes_key, &token),
            password: crypto::encrypt_field(&self.aes_key, code),
        };

        let content: LoginControlContent = self
            .rest
            .post_public(LOGIN_USER_CONTROL, &payload)
            .await
            .map_err(|e| {
                if e.is_broker_rejection() {
                    Error::auth(AuthKind::BrokerRejected, format!("otp rejected: {e}"))
                } else {
                    e
                }
            })?;

        self.tokens
            .set(AuthTokens::new(token.clone(), content.hash.clone()));
        self.rest.purge_fallback();
        *step = Step::Authenticated;
        drop(step);
        self.publish(AuthState::Authenticated);

        let session = Session::new(token, content.hash, self.expiration_hours);
        if let Err(e) = self.store.save(&session).await {
            // Authentication itself succeeded; only restart-recovery is lost.
            warn!(error = %e, "failed to persist session");
        }
        info!("authentication completed");
        Ok(())
    }

    /// Load the persisted session, install it and validate it against the
    /// broker. Returns `true` only when the restored hash is alive.
    pub async fn restore_session(&self) -> Result<bool> {
        let Some(session) = self.store.load_active().await? else {
            debug!("no persisted session to restore");
            return Ok(false);
        };
        if session.is_expired() {
            debug!("persisted session is past local expiry");
            self.clear(TerminationReason::Expired).await;
            return Ok(false);
        }

        // The hash must be installed before the probe can be signed.
        self.tokens
            .set(AuthTokens::new(session.token, session.hash));
        self.rest.purge_fallback();

        if self.is_alive().await {
            *self.step.lock().await = Step::Authenticated;
            self.publish(AuthState::Authenticated);
            info!("session restored and validated");
            Ok(true)
        } else {
            info!("persisted session failed validation");
            self.clear(TerminationReason::ValidationFailed).await;
            Ok(false)
        }
    }

    /// Cheap authenticated probe; `true` iff the broker accepts the hash.
    ///
    /// Rides the auth endpoint class: never retried, never answered from the
    /// fallback cache. A stale cached body must not stand in for proof that
    /// the hash is currently accepted.
    pub async fn is_alive(&self) -> bool {
        self.rest
            .post_authed_empty::<serde_json::Value>(GET_SUBACCOUNTS, EndpointClass::Auth)
            .await
            .is_ok()
    }

    /// Refresh the session. A 401 is authoritative regardless of the local
    /// expiry and drops the session.
    pub async fn refresh(&self) -> Result<()> {
        if !self.is_authenticated() {
            return Err(Error::auth(
                AuthKind::NotAuthenticated,
                "refresh requires an authenticated session",
            ));
        }

        match self
            .rest
            .post_authed_empty::<serde_json::Value>(SESSION_REFRESH, EndpointClass::Auth)
            .await
        {
            Ok(_) => {
                debug!("session refreshed");
                if let Err(e) = self.store.touch_refresh().await {
                    warn!(error = %e, "failed to record refresh time");
                }
                Ok(())
            }
            Err(e) if e.http_status() == Some(reqwest::StatusCode::UNAUTHORIZED) => {
                warn!("refresh rejected with 401, session expired");
                self.clear(TerminationReason::Expired).await;
                Err(Error::auth(
                    AuthKind::SessionExpired,
                    "unauthorized, please log in again",
                ))
            }
            Err(e) => Err(e),
        }
    }

    /// Explicit logout.
    pub async fn logout(&self) {
        self.clear(TerminationReason::Logout).await;
    }

    /// Forget in-memory credentials and mark the persisted session inactive.
    ///
    /// Also purges the fallback cache: responses fetched under this session
    /// must not survive into the next one.
    pub async fn clear(&self, reason: TerminationReason) {
        self.tokens.clear();
        self.rest.purge_fallback();
        *self.step.lock().await = Step::Unauthenticated;
        self.publish(AuthState::Unauthenticated);
        if let Err(e) = self.store.deactivate(reason).await {
            warn!(error = %e, %reason, "failed to deactivate persisted session");
        }
    }

    /// The single boolean contract.
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        *self.state_tx.borrow() == AuthState::Authenticated
    }

    /// Current observable state.
    #[must_use]
    pub fn state(&self) -> AuthState {
        *self.state_tx.borrow()
    }

    /// Watch authentication state changes (used for WebSocket auto-connect).
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<AuthState> {
        self.state_tx.subscribe()
    }

    /// Spawn the keep-alive loop: refresh at the configured interval while
    /// authenticated. Does nothing when `auth.keepAlive` is off.
    pub fn spawn_keep_alive(
        self: Arc<Self>,
        cancel: CancellationToken,
    ) -> Option<tokio::task::JoinHandle<()>> {
        if !self.keep_alive {
            return None;
        }
        let service = self;
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(service.refresh_interval);
            ticker.tick().await; // immediate first tick
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if !service.is_authenticated() {
                            continue;
                        }
                        if let Err(e) = service.refresh().await {
                            warn!(error = %e, "keep-alive refresh failed");
                        }
                    }
                }
            }
            debug!("keep-alive loop stopped");
        }))
    }

    fn publish(&self, state: AuthState) {
        // send_replace updates the value even with no receivers attached;
        // state queries must not depend on someone watching.
        let _ = self.state_tx.send_replace(state);
    }
}

impl std::fmt::Debug for AuthService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthService")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
