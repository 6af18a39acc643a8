//! Explicit wiring of the gateway core.
//!
//! [`Gateway::build`] constructs every component from configuration alone;
//! [`Gateway::start`] brings up the long-lived tasks (keep-alive, session
//! cleanup, auto-login, auto-connect); [`Gateway::shutdown`] cancels them,
//! tears down the socket and marks the persisted session inactive. There is
//! no container magic anywhere: what talks to what is visible in `build`.

use std::sync::Arc;

use parking_lot::Mutex;
use secrecy::SecretString;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::Result;
use crate::auth::tokens::TokenCell;
use crate::auth::{AuthService, AuthState};
use crate::cache::TickCacheService;
use crate::config::{GatewayConfig, SessionStorage};
use crate::error::{AuthKind, Error};
use crate::health::HealthReport;
use crate::market::MarketDataService;
use crate::orders::OrderService;
use crate::rest::{CircuitMetrics, CircuitState, EndpointStats, FallbackStats, RestClient};
use crate::session::{
    FileSessionStore, PostgresSessionStore, SessionStore, TerminationReason,
};
use crate::ws::{Channel, MarketStream};

type StreamSlot = Arc<Mutex<Option<(MarketStream, CancellationToken)>>>;

/// The assembled gateway core.
pub struct Gateway {
    config: GatewayConfig,
    tokens: Arc<TokenCell>,
    rest: Arc<RestClient>,
    auth: Arc<AuthService>,
    orders: OrderService,
    market: MarketDataService,
    cache: Arc<TickCacheService>,
    store: Arc<dyn SessionStore>,
    postgres: Option<Arc<PostgresSessionStore>>,
    stream: StreamSlot,
    cancel: CancellationToken,
}

impl Gateway {
    /// Construct every component. Nothing is spawned yet; see [`start`].
    ///
    /// [`start`]: Self::start
    pub async fn build(config: GatewayConfig) -> Result<Self> {
        config.validate()?;

        let tokens = Arc::new(TokenCell::new());

        let (store, postgres): (Arc<dyn SessionStore>, Option<Arc<PostgresSessionStore>>) =
            match config.session.storage {
                SessionStorage::File => (
                    Arc::new(FileSessionStore::new(config.session.file_path.clone())),
                    None,
                ),
                SessionStorage::Database => {
                    let url = config.session.database_url.as_deref().ok_or_else(|| {
                        Error::validation("session.databaseUrl is required for database storage")
                    })?;
                    let pg = Arc::new(PostgresSessionStore::connect(url).await?);
                    (Arc::clone(&pg) as Arc<dyn SessionStore>, Some(pg))
                }
            };

        let rest = Arc::new(RestClient::new(&config, Arc::clone(&tokens))?);
        let auth = Arc::new(AuthService::new(
            &config,
            Arc::clone(&rest),
            Arc::clone(&store),
            Arc::clone(&tokens),
        )?);
        let cache = Arc::new(TickCacheService::new(&config.cache).await?);

        Ok(Self {
            orders: OrderService::new(Arc::clone(&rest)),
            market: MarketDataService::new(Arc::clone(&rest)),
            config,
            tokens,
            rest,
            auth,
            cache,
            store,
            postgres,
            stream: Arc::new(Mutex::new(None)),
            cancel: CancellationToken::new(),
        })
    }

    /// Bring up the long-lived tasks and, when configured, restore or start
    /// a login.
    pub async fn start(&self) -> Result<()> {
        Arc::clone(&self.auth).spawn_keep_alive(self.cancel.child_token());

        if let Some(pg) = &self.postgres
            && self.config.session.auto_cleanup
        {
            let _ = Arc::clone(pg).spawn_cleanup(
                self.config.session.cleanup_interval(),
                self.config.session.retention_days,
                self.cancel.child_token(),
            );
        }

        if self.config.websocket.enabled && self.config.websocket.auto_connect {
            self.spawn_auto_connect();
        }

        if self.config.auth.auto_login {
            match self.auth.restore_session().await {
                Ok(true) => info!("startup: session restored"),
                Ok(false) => {
                    if let (Some(username), Some(password)) =
                        (&self.config.auth.username, &self.config.auth.password)
                    {
                        self.auth.login_user(username, password).await?;
                        info!("startup: login submitted, awaiting OTP");
                    }
                }
                Err(e) => warn!(error = %e, "startup: session restore failed"),
            }
        }
        Ok(())
    }

    /// Credential step of the login flow.
    pub async fn login(&self, username: &str, password: &SecretString) -> Result<()> {
        self.auth.login_user(username, password).await
    }

    /// OTP step of the login flow.
    pub async fn verify_otp(&self, code: &str) -> Result<()> {
        self.auth.verify_otp(code).await
    }

    /// Current authentication state.
    #[must_use]
    pub fn status(&self) -> AuthState {
        self.auth.state()
    }

    /// Log out: drop credentials, deactivate the session, stop streaming.
    pub async fn logout(&self) {
        self.disconnect_market_data();
        self.auth.logout().await;
    }

    /// Open the market-data stream, or return the one already open.
    ///
    /// Requires an authenticated session; the WebSocket handshake is signed
    /// with the session hash.
    pub fn connect_market_data(&self) -> Result<MarketStream> {
        if !self.config.websocket.enabled {
            return Err(Error::validation("websocket is disabled by configuration"));
        }
        if !self.auth.is_authenticated() {
            return Err(Error::auth(
                AuthKind::NotAuthenticated,
                "market data requires an authenticated session",
            ));
        }
        open_stream_if_absent(
            &self.config,
            &self.tokens,
            &self.cache,
            &self.store,
            &self.stream,
            &self.cancel,
        )
    }

    /// Tear down the market-data stream, keeping nothing subscribed.
    pub fn disconnect_market_data(&self) {
        if let Some((stream, cancel)) = self.stream.lock().take() {
            stream.clear_subscriptions();
            cancel.cancel();
            info!("market stream disconnected");
        }
    }

    /// The open market-data stream, if any.
    #[must_use]
    pub fn market_stream(&self) -> Option<MarketStream> {
        self.stream.lock().as_ref().map(|(stream, _)| stream.clone())
    }

    /// Subscribe to `channel` data for `symbol` on the open stream.
    pub fn subscribe(&self, channel: Channel, symbol: &str) -> Result<()> {
        self.require_stream()?.subscribe(channel, symbol)
    }

    /// Unsubscribe from `channel` data for `symbol`.
    pub fn unsubscribe(&self, channel: Channel, symbol: &str) -> Result<()> {
        self.require_stream()?.unsubscribe(channel, symbol)
    }

    /// One wildcard subscription for every instrument on `channel`.
    pub fn subscribe_all(&self, channel: Channel) -> Result<()> {
        self.require_stream()?.subscribe_all(channel)
    }

    /// Order operations.
    #[must_use]
    pub fn orders(&self) -> &OrderService {
        &self.orders
    }

    /// Reference-data operations.
    #[must_use]
    pub fn market_data(&self) -> &MarketDataService {
        &self.market
    }

    /// Tick cache and metrics queries.
    #[must_use]
    pub fn cache(&self) -> &TickCacheService {
        &self.cache
    }

    /// The authentication service.
    #[must_use]
    pub fn auth(&self) -> &AuthService {
        &self.auth
    }

    /// Composite health: auth × websocket × cache × circuit.
    #[must_use]
    pub fn health(&self) -> HealthReport {
        let websocket = if self.config.websocket.enabled {
            Some(
                self.market_stream()
                    .is_some_and(|s| s.connection_state().is_connected()),
            )
        } else {
            None
        };
        HealthReport::compose(
            self.auth.is_authenticated(),
            websocket,
            self.cache.is_healthy(),
            self.rest.circuit_state(),
        )
    }

    /// Circuit-breaker state.
    #[must_use]
    pub fn circuit_state(&self) -> CircuitState {
        self.rest.circuit_state()
    }

    /// Circuit-breaker state plus rolling rates.
    #[must_use]
    pub fn circuit_metrics(&self) -> CircuitMetrics {
        self.rest.circuit_metrics()
    }

    /// Per-endpoint call counters (successes, errors, retries, fallbacks).
    #[must_use]
    pub fn endpoint_stats(&self) -> Vec<EndpointStats> {
        self.rest.endpoint_stats()
    }

    /// Fallback-cache counters.
    #[must_use]
    pub fn fallback_stats(&self) -> FallbackStats {
        self.rest.fallback_stats()
    }

    /// Operator override: force the circuit open.
    pub fn force_circuit_open(&self) {
        self.rest.force_circuit_open();
    }

    /// Operator override: reset the circuit.
    pub fn reset_circuit(&self) {
        self.rest.reset_circuit();
    }

    /// Cancel every task, tear down the socket, and mark the persisted
    /// session inactive with reason `SHUTDOWN`.
    pub async fn shutdown(&self) {
        info!("gateway shutting down");
        self.disconnect_market_data();
        self.cancel.cancel();
        self.auth.clear(TerminationReason::Shutdown).await;
    }

    fn require_stream(&self) -> Result<MarketStream> {
        self.market_stream()
            .ok_or_else(|| Error::validation("market stream is not connected"))
    }

    /// React to authentication transitions by opening the stream.
    fn spawn_auto_connect(&self) {
        let config = self.config.clone();
        let tokens = Arc::clone(&self.tokens);
        let cache = Arc::clone(&self.cache);
        let store = Arc::clone(&self.store);
        let slot = Arc::clone(&self.stream);
        let cancel = self.cancel.clone();
        let mut state_rx = self.auth.subscribe_state();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    changed = state_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        if *state_rx.borrow_and_update() != AuthState::Authenticated {
                            continue;
                        }
                        if let Err(e) =
                            open_stream_if_absent(&config, &tokens, &cache, &store, &slot, &cancel)
                        {
                            warn!(error = %e, "auto-connect failed");
                        }
                    }
                }
            }
        });
    }
}

/// Open the stream once; subsequent calls return the existing one.
fn open_stream_if_absent(
    config: &GatewayConfig,
    tokens: &Arc<TokenCell>,
    cache: &Arc<TickCacheService>,
    store: &Arc<dyn SessionStore>,
    slot: &StreamSlot,
    cancel: &CancellationToken,
) -> Result<MarketStream> {
    let mut slot = slot.lock();
    if let Some((stream, _)) = &*slot {
        return Ok(stream.clone());
    }

    let stream_cancel = cancel.child_token();
    let stream = MarketStream::connect(config, Arc::clone(tokens), stream_cancel.clone())?;

    let _ = Arc::clone(cache).spawn_router(stream.messages(), stream_cancel.clone());
    spawn_ws_status_mirror(
        Arc::clone(store),
        stream.state_receiver(),
        stream_cancel.clone(),
    );

    *slot = Some((stream.clone(), stream_cancel));
    info!("market stream connecting");
    Ok(stream)
}

/// Mirror socket up/down transitions onto the persisted session.
fn spawn_ws_status_mirror(
    store: Arc<dyn SessionStore>,
    mut state_rx: watch::Receiver<crate::ws::ConnectionState>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        let mut last = state_rx.borrow().is_connected();
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                changed = state_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let connected = state_rx.borrow_and_update().is_connected();
                    if connected == last {
                        continue;
                    }
                    last = connected;
                    if let Err(e) = store.update_websocket(connected).await {
                        warn!(error = %e, "failed to mirror websocket status");
                    }
                }
            }
        }
    });
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("auth", &self.auth.state())
            .field("circuit", &self.rest.circuit_state())
            .finish_non_exhaustive()
    }
}
