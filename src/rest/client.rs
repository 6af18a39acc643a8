//! Signed, rate-limited, circuit-broken REST client.
//!
//! Every broker call is a POST and rides the same envelope, in order:
//! rate-limit permit → circuit breaker → retry → time limiter → HTTP call.
//! The [`EndpointClass`] of the call decides which stages apply: auth and
//! order calls are never retried and never answered from cache, read calls
//! may fall back to the last good response when the upstream is refusing.
//!
//! Authenticated calls carry three headers: `APIKEY` (always set), the
//! session `Authorization` hash, and the `Checker` integrity tag computed
//! over `apiKey ‖ hostname ‖ endpoint ‖ body` — the body string hashed is
//! byte-for-byte the body sent.

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{self, HeaderMap, HeaderValue};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::time::Instant;
use tracing::{debug, warn};
use url::Url;

use super::circuit::{CircuitBreaker, CircuitMetrics, CircuitState};
use super::endpoints::{EndpointClass, INSTANT_POSITION, SEND_ORDER};
use super::fallback::{FallbackCache, FallbackStats};
use super::rate_limit::RateLimiter;
use super::stats::{CallStats, EndpointStats};
use crate::Result;
use crate::auth::tokens::TokenCell;
use crate::config::{FallbackConfig, GatewayConfig, RetryConfig, TimeLimiterConfig};
use crate::crypto;
use crate::error::{AuthKind, Error, Kind};

/// A value plus where it came from.
///
/// Read-path calls can be satisfied by the fallback cache; `cached` is the
/// caller's indicator that the data is last-good rather than live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cached<T> {
    /// Decoded response content.
    pub value: T,
    /// True when served from the fallback cache instead of the upstream.
    pub cached: bool,
}

#[derive(Debug, serde::Deserialize)]
struct BrokerEnvelope {
    success: bool,
    #[serde(default)]
    message: String,
    #[serde(default)]
    content: serde_json::Value,
}

/// The broker REST client.
pub struct RestClient {
    http: reqwest::Client,
    api_key: String,
    hostname: String,
    base: Url,
    base_path: String,
    tokens: Arc<TokenCell>,
    rate_limiter: RateLimiter,
    circuit: CircuitBreaker,
    retry: RetryConfig,
    time_limiter: TimeLimiterConfig,
    fallback: FallbackCache,
    fallback_config: FallbackConfig,
    stats: CallStats,
}

impl RestClient {
    /// Build a client from the gateway configuration.
    ///
    /// `tokens` is the read-only accessor to the credential pair owned by
    /// the authentication service.
    pub fn new(config: &GatewayConfig, tokens: Arc<TokenCell>) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            "APIKEY",
            HeaderValue::from_str(&config.api.key)
                .map_err(|e| Error::validation(format!("api key is not a valid header: {e}")))?,
        );
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        let http = reqwest::Client::builder().default_headers(headers).build()?;

        let base = Url::parse(&config.api.url)?;
        let base_path = base.path().trim_end_matches('/').to_owned();

        Ok(Self {
            http,
            api_key: config.api.key.clone(),
            hostname: config.api.hostname.clone(),
            base,
            base_path,
            tokens,
            rate_limiter: RateLimiter::new(config.api.permit_interval()),
            circuit: CircuitBreaker::new("broker", config.resilience.circuit_breaker.clone()),
            retry: config.resilience.retry.clone(),
            time_limiter: config.resilience.time_limiter.clone(),
            fallback: FallbackCache::new(config.resilience.fallback.ttl()),
            fallback_config: config.resilience.fallback.clone(),
            stats: CallStats::new(),
        })
    }

    /// POST without session headers: the two login steps.
    pub async fn post_public<P, T>(&self, endpoint: &'static str, payload: &P) -> Result<T>
    where
        P: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let body = serde_json::to_string(payload)?;
        let (content, _) = self
            .execute(endpoint, EndpointClass::Auth, body, false)
            .await?;
        decode(content)
    }

    /// Signed POST under the given class. No cached fallback.
    pub async fn post_authed<P, T>(
        &self,
        endpoint: &'static str,
        class: EndpointClass,
        payload: &P,
    ) -> Result<T>
    where
        P: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let body = serde_json::to_string(payload)?;
        let (content, _) = self.execute(endpoint, class, body, true).await?;
        decode(content)
    }

    /// Signed POST with no payload; the `Checker` hashes the empty string.
    pub async fn post_authed_empty<T>(
        &self,
        endpoint: &'static str,
        class: EndpointClass,
    ) -> Result<T>
    where
        T: DeserializeOwned,
    {
        let (content, _) = self.execute(endpoint, class, String::new(), true).await?;
        decode(content)
    }

    /// Signed read-class POST, eligible for the last-good fallback.
    pub async fn post_read<P, T>(&self, endpoint: &'static str, payload: &P) -> Result<Cached<T>>
    where
        P: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let body = serde_json::to_string(payload)?;
        let (content, cached) = self
            .execute(endpoint, EndpointClass::Read, body, true)
            .await?;
        Ok(Cached {
            value: decode(content)?,
            cached,
        })
    }

    async fn execute(
        &self,
        endpoint: &'static str,
        class: EndpointClass,
        body: String,
        authed: bool,
    ) -> Result<(serde_json::Value, bool)> {
        let budget = self.time_limiter.timeout_duration();
        self.rate_limiter
            .acquire(budget)
            .await
            .map_err(|_e| Error::rate_limited(endpoint))?;

        if let Err(e) = self.circuit.try_acquire() {
            warn!(endpoint, "circuit refused call");
            return self.fall_back(endpoint, class, &body, e);
        }

        let max_attempts = if class.retryable() {
            self.retry.max_attempts.max(1)
        } else {
            1
        };

        let mut attempt = 1_u32;
        let final_error = loop {
            let started = Instant::now();
            let result = self.send_once(endpoint, &body, authed, budget).await;
            let elapsed = started.elapsed();

            match result {
                Ok(content) => {
                    self.circuit.record(true, elapsed);
                    self.stats.record(endpoint, true, elapsed);
                    if class.cacheable() {
                        self.fallback
                            .store(FallbackCache::key(endpoint, &body), content.clone());
                    }
                    return Ok((content, false));
                }
                Err(e) => {
                    // 4xx and broker rejections mean the upstream answered;
                    // only transport-level failures count against the circuit.
                    let upstream_failure = e.is_retryable();
                    self.circuit.record(!upstream_failure, elapsed);
                    self.stats.record(endpoint, false, elapsed);

                    if upstream_failure && attempt < max_attempts {
                        debug!(endpoint, attempt, error = %e, "retrying after transient failure");
                        self.stats.record_retry(endpoint);
                        tokio::time::sleep(self.retry.wait_before(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    break e;
                }
            }
        };

        self.fall_back(endpoint, class, &body, final_error)
    }

    fn fall_back(
        &self,
        endpoint: &'static str,
        class: EndpointClass,
        body: &str,
        error: Error,
    ) -> Result<(serde_json::Value, bool)> {
        let unavailable = matches!(
            error.kind(),
            Kind::CircuitOpen | Kind::Timeout | Kind::Transport
        ) || error.is_retryable();

        match class {
            // Login and refresh failures always surface; stale credentials
            // are worse than no credentials.
            EndpointClass::Auth | EndpointClass::Write => Err(error),
            EndpointClass::Order => {
                if unavailable && endpoint == SEND_ORDER {
                    self.stats.record_fallback(endpoint);
                    Err(error.with_message(
                        "order was NOT placed: service temporarily unavailable, try again later",
                    ))
                } else {
                    Err(error)
                }
            }
            EndpointClass::Read => {
                if !unavailable {
                    return Err(error);
                }
                let key = FallbackCache::key(endpoint, body);
                if let Some(value) = self.fallback.last_good(&key) {
                    self.stats.record_fallback(endpoint);
                    debug!(endpoint, "serving last-good response from fallback cache");
                    return Ok((value, true));
                }
                if endpoint == INSTANT_POSITION && self.fallback_config.dev_mock_positions {
                    self.stats.record_fallback(endpoint);
                    warn!(endpoint, "serving dev mock positions payload");
                    return Ok((serde_json::Value::Array(Vec::new()), true));
                }
                Err(error)
            }
        }
    }

    async fn send_once(
        &self,
        endpoint: &'static str,
        body: &str,
        authed: bool,
        budget: Duration,
    ) -> Result<serde_json::Value> {
        let mut request = self
            .http
            .post(self.endpoint_url(endpoint))
            .body(body.to_owned());

        if authed {
            let tokens = self.tokens.get().ok_or_else(|| {
                Error::auth(
                    AuthKind::NotAuthenticated,
                    format!("{endpoint} requires an authenticated session"),
                )
            })?;
            let checker = crypto::checker(
                &self.api_key,
                &self.hostname,
                &self.signing_path(endpoint),
                body,
            );
            request = request
                .header(header::AUTHORIZATION, tokens.hash())
                .header("Checker", checker);
        }

        let call = async {
            let response = request.send().await?;
            let status = response.status();
            if !status.is_success() {
                let text = response.text().await.unwrap_or_default();
                return Err(Error::status(status, endpoint, text));
            }
            let envelope: BrokerEnvelope = response.json().await?;
            if !envelope.success {
                return Err(Error::status(status, endpoint, envelope.message));
            }
            Ok(envelope.content)
        };

        // Dropping the future on expiry aborts the in-flight request.
        match tokio::time::timeout(budget, call).await {
            Ok(result) => result,
            Err(_elapsed) => Err(Error::timeout(endpoint)),
        }
    }

    fn endpoint_url(&self, endpoint: &str) -> String {
        format!("{}/{endpoint}", self.base.as_str().trim_end_matches('/'))
    }

    /// Full request path as it enters the `Checker` hash.
    #[must_use]
    pub fn signing_path(&self, endpoint: &str) -> String {
        format!("{}/{endpoint}", self.base_path)
    }

    /// Current circuit state.
    #[must_use]
    pub fn circuit_state(&self) -> CircuitState {
        self.circuit.state()
    }

    /// Circuit state plus rolling rates.
    #[must_use]
    pub fn circuit_metrics(&self) -> CircuitMetrics {
        self.circuit.metrics()
    }

    /// Operator override: force the circuit open.
    pub fn force_circuit_open(&self) {
        self.circuit.force_open();
    }

    /// Operator override: reset the circuit to closed.
    pub fn reset_circuit(&self) {
        self.circuit.reset();
    }

    /// Drop every cached response.
    ///
    /// The authentication service calls this whenever the credential pair
    /// changes; a cached body must never outlive the session it was fetched
    /// under.
    pub fn purge_fallback(&self) {
        debug!("fallback cache purged");
        self.fallback.clear();
    }

    /// Fallback cache statistics.
    #[must_use]
    pub fn fallback_stats(&self) -> FallbackStats {
        self.fallback.stats()
    }

    /// Per-endpoint call counters.
    #[must_use]
    pub fn endpoint_stats(&self) -> Vec<EndpointStats> {
        self.stats.snapshot()
    }
}

fn decode<T: DeserializeOwned>(content: serde_json::Value) -> Result<T> {
    serde_json::from_value(content).map_err(Into::into)
}

impl std::fmt::Debug for RestClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestClient")
            .field("base", &self.base.as_str())
            .field("hostname", &self.hostname)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayConfig;

    fn client() -> RestClient {
        let mut config = GatewayConfig::default();
        config.api.key = "API-TESTKEY".to_owned();
        config.api.hostname = "https://broker.test".to_owned();
        config.api.url = "https://broker.test/api".to_owned();
        RestClient::new(&config, Arc::new(TokenCell::new())).expect("client")
    }

    #[test]
    fn url_and_signing_path_agree() {
        let client = client();
        assert_eq!(
            client.endpoint_url("SendOrder"),
            "https://broker.test/api/SendOrder"
        );
        assert_eq!(client.signing_path("SendOrder"), "/api/SendOrder");
    }

    #[test]
    fn base_without_path_still_produces_absolute_signing_path() {
        let mut config = GatewayConfig::default();
        config.api.key = "API-TESTKEY".to_owned();
        config.api.url = "https://broker.test".to_owned();
        let client = RestClient::new(&config, Arc::new(TokenCell::new())).expect("client");
        assert_eq!(client.signing_path("SendOrder"), "/SendOrder");
    }
}
