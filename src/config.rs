//! Gateway configuration.
//!
//! Mirrors the deployment configuration surface one section per subsystem:
//! `api`, `auth`, `session`, `websocket`, `resilience`, `cache`. Every field
//! has a production default so a config file only needs to override what it
//! cares about. Durations are expressed in milliseconds in the serialized
//! form and exposed as [`Duration`] through accessor methods.

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;
use serde::Deserialize;

use crate::error::Error;
use crate::Result;

/// Top-level gateway configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GatewayConfig {
    /// Broker API endpoints and credentials.
    pub api: ApiConfig,
    /// Login behaviour.
    pub auth: AuthConfig,
    /// Session persistence.
    pub session: SessionConfig,
    /// Market-data WebSocket behaviour.
    pub websocket: WebSocketSettings,
    /// Resilience envelope parameters.
    pub resilience: ResilienceConfig,
    /// Tick cache Redis tier.
    pub cache: CacheConfig,
}

impl GatewayConfig {
    /// Validate cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.api.key.is_empty() {
            return Err(Error::validation("api.key must be set"));
        }
        if self.api.rate_limit <= 0.0 {
            return Err(Error::validation("api.rateLimit must be positive"));
        }
        if self.cache.enabled && self.cache.redis_url.is_none() {
            return Err(Error::validation(
                "cache.enabled requires cache.redisUrl to be set",
            ));
        }
        Ok(())
    }
}

/// Broker API endpoints and the key used for header auth and signing.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ApiConfig {
    /// The broker-issued API key, sent verbatim in the `APIKEY` header and
    /// used (base64-decoded, `API-` prefix stripped) as the AES key.
    pub key: String,
    /// Hostname string fed into the request `Checker` hash.
    pub hostname: String,
    /// Base URL for REST calls.
    pub url: String,
    /// WebSocket endpoint.
    pub websocket_url: String,
    /// REST permits per second; the broker allows one call every five seconds.
    pub rate_limit: f64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            key: String::new(),
            hostname: "https://www.algolab.com.tr".to_owned(),
            url: "https://www.algolab.com.tr/api".to_owned(),
            websocket_url: "wss://www.algolab.com.tr/api/ws".to_owned(),
            rate_limit: 0.2,
        }
    }
}

impl ApiConfig {
    /// Minimum spacing between REST dispatches derived from `rate_limit`.
    #[must_use]
    pub fn permit_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.rate_limit)
    }
}

/// Login behaviour.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AuthConfig {
    /// Brokerage login, used only when auto-login runs a fresh two-step flow.
    pub username: Option<String>,
    /// Brokerage password; never logged, never persisted.
    pub password: Option<SecretString>,
    /// Restore the persisted session (and validate it) at startup.
    pub auto_login: bool,
    /// Run the session refresh loop while authenticated.
    pub keep_alive: bool,
    /// Interval between session refreshes, in milliseconds.
    pub refresh_interval_ms: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            username: None,
            password: None,
            auto_login: true,
            keep_alive: true,
            refresh_interval_ms: 300_000,
        }
    }
}

impl AuthConfig {
    /// Refresh interval as a [`Duration`].
    #[must_use]
    pub const fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }
}

/// Which session store backend to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStorage {
    /// Row-per-session Postgres store.
    Database,
    /// Single JSON document on disk.
    File,
}

/// Session persistence settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SessionConfig {
    /// Backend selection.
    pub storage: SessionStorage,
    /// JSON document path for the file backend.
    pub file_path: PathBuf,
    /// Connection string for the database backend.
    pub database_url: Option<String>,
    /// Local session expiry, independent of the broker's hash lifetime.
    pub expiration_hours: i64,
    /// How long inactive rows are kept before the cleanup job deletes them.
    pub retention_days: i64,
    /// Interval of the cleanup job, in milliseconds.
    pub cleanup_interval_ms: u64,
    /// Whether the cleanup job runs at all.
    pub auto_cleanup: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            storage: SessionStorage::Database,
            file_path: PathBuf::from("algolab-session.json"),
            database_url: None,
            expiration_hours: 24,
            retention_days: 30,
            cleanup_interval_ms: 3_600_000,
            auto_cleanup: true,
        }
    }
}

impl SessionConfig {
    /// Cleanup job interval as a [`Duration`].
    #[must_use]
    pub const fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }
}

/// Market-data WebSocket settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WebSocketSettings {
    /// Master switch; when false the gateway never opens the socket.
    pub enabled: bool,
    /// Connect automatically once authentication completes.
    pub auto_connect: bool,
    /// Heartbeat ping interval, in milliseconds.
    pub heartbeat_interval_ms: u64,
    /// Handshake timeout, in milliseconds.
    pub connection_timeout_ms: u64,
    /// Reconnection policy.
    pub reconnect: ReconnectConfig,
}

impl Default for WebSocketSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            auto_connect: true,
            heartbeat_interval_ms: 900_000,
            connection_timeout_ms: 30_000,
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl WebSocketSettings {
    /// Heartbeat interval as a [`Duration`].
    #[must_use]
    pub const fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Handshake timeout as a [`Duration`].
    #[must_use]
    pub const fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }
}

/// WebSocket reconnection policy.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ReconnectConfig {
    /// Whether to reconnect at all after a transport close.
    pub enabled: bool,
    /// First backoff delay, in milliseconds.
    pub initial_delay_ms: u64,
    /// Backoff cap, in milliseconds.
    pub max_delay_ms: u64,
    /// Backoff multiplier applied per attempt.
    pub multiplier: f64,
    /// Give up after this many attempts; `0` means retry forever.
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_delay_ms: 1_000,
            max_delay_ms: 60_000,
            multiplier: 2.0,
            max_attempts: 0,
        }
    }
}

impl ReconnectConfig {
    /// Attempt cap as an `Option`, `None` meaning unlimited.
    #[must_use]
    pub const fn attempt_cap(&self) -> Option<u32> {
        match self.max_attempts {
            0 => None,
            n => Some(n),
        }
    }
}

impl From<ReconnectConfig> for backoff::ExponentialBackoff {
    fn from(config: ReconnectConfig) -> Self {
        Self {
            initial_interval: Duration::from_millis(config.initial_delay_ms),
            max_interval: Duration::from_millis(config.max_delay_ms),
            multiplier: config.multiplier,
            // Attempts are capped by the connection loop, not by elapsed time.
            max_elapsed_time: None,
            ..Self::default()
        }
    }
}

/// Resilience envelope parameters.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ResilienceConfig {
    /// Circuit breaker guarding the broker upstream.
    pub circuit_breaker: CircuitBreakerConfig,
    /// Retry policy for transient failures.
    pub retry: RetryConfig,
    /// Per-call wall-clock cap.
    pub time_limiter: TimeLimiterConfig,
    /// Last-good-response fallback cache.
    pub fallback: FallbackConfig,
}

/// Circuit breaker parameters (count-based sliding window).
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CircuitBreakerConfig {
    /// Failure percentage at which the circuit opens.
    pub failure_rate_threshold: f64,
    /// Calls slower than this count as slow, in milliseconds.
    pub slow_call_duration_threshold_ms: u64,
    /// Slow-call percentage at which the circuit opens.
    pub slow_call_rate_threshold: f64,
    /// How long the circuit stays open before probing, in milliseconds.
    pub wait_duration_in_open_state_ms: u64,
    /// Probe calls admitted while half-open.
    pub permitted_number_of_calls_in_half_open_state: u32,
    /// Calls recorded before rates are evaluated at all.
    pub minimum_number_of_calls: u32,
    /// Size of the count-based sliding window.
    pub sliding_window_size: usize,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_rate_threshold: 50.0,
            slow_call_duration_threshold_ms: 5_000,
            slow_call_rate_threshold: 100.0,
            wait_duration_in_open_state_ms: 60_000,
            permitted_number_of_calls_in_half_open_state: 10,
            minimum_number_of_calls: 5,
            sliding_window_size: 100,
        }
    }
}

impl CircuitBreakerConfig {
    /// Slow-call threshold as a [`Duration`].
    #[must_use]
    pub const fn slow_call_duration_threshold(&self) -> Duration {
        Duration::from_millis(self.slow_call_duration_threshold_ms)
    }

    /// Open-state wait as a [`Duration`].
    #[must_use]
    pub const fn wait_duration_in_open_state(&self) -> Duration {
        Duration::from_millis(self.wait_duration_in_open_state_ms)
    }
}

/// Retry policy parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RetryConfig {
    /// Total attempts including the first call.
    pub max_attempts: u32,
    /// Wait before the first retry, in milliseconds.
    pub wait_duration_ms: u64,
    /// Whether subsequent waits grow exponentially.
    pub enable_exponential_backoff: bool,
    /// Growth factor when exponential backoff is enabled.
    pub exponential_backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            wait_duration_ms: 2_000,
            enable_exponential_backoff: true,
            exponential_backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Wait before retry number `retry` (1-based).
    #[must_use]
    pub fn wait_before(&self, retry: u32) -> Duration {
        let base = self.wait_duration_ms as f64;
        let millis = if self.enable_exponential_backoff {
            base * self
                .exponential_backoff_multiplier
                .powi(retry.saturating_sub(1) as i32)
        } else {
            base
        };
        Duration::from_millis(millis as u64)
    }
}

/// Per-call wall-clock cap.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TimeLimiterConfig {
    /// Per-attempt timeout, in milliseconds.
    pub timeout_duration_ms: u64,
    /// Abort the underlying future when the timeout fires.
    pub cancel_running_future: bool,
}

impl Default for TimeLimiterConfig {
    fn default() -> Self {
        Self {
            timeout_duration_ms: 10_000,
            cancel_running_future: true,
        }
    }
}

impl TimeLimiterConfig {
    /// Timeout as a [`Duration`].
    #[must_use]
    pub const fn timeout_duration(&self) -> Duration {
        Duration::from_millis(self.timeout_duration_ms)
    }
}

/// Fallback cache parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FallbackConfig {
    /// How long a last-good response may be served, in milliseconds.
    pub ttl_ms: u64,
    /// Serve a canned positions payload when the circuit is open. Dev only;
    /// production keeps the explicit `ServiceUnavailable` path.
    pub dev_mock_positions: bool,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            ttl_ms: 300_000,
            dev_mock_positions: false,
        }
    }
}

impl FallbackConfig {
    /// Fallback TTL as a [`Duration`].
    #[must_use]
    pub const fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }
}

/// Tick cache Redis tier settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CacheConfig {
    /// Whether the Redis tier is wired in at all.
    pub enabled: bool,
    /// Redis connection URL, required when `enabled`.
    pub redis_url: Option<String>,
    /// Bound on per-symbol history, in items.
    pub max_entries_per_symbol: usize,
    /// Age bound on per-symbol history, in milliseconds.
    pub ttl_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            redis_url: None,
            max_entries_per_symbol: 100,
            ttl_ms: 300_000,
        }
    }
}

impl CacheConfig {
    /// History age bound as a [`Duration`].
    #[must_use]
    pub const fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_deployment_surface() {
        let config = GatewayConfig::default();
        assert!((config.api.rate_limit - 0.2).abs() < f64::EPSILON);
        assert_eq!(config.api.permit_interval(), Duration::from_secs(5));
        assert!(config.auth.auto_login);
        assert!(config.auth.keep_alive);
        assert_eq!(config.auth.refresh_interval(), Duration::from_secs(300));
        assert_eq!(config.session.storage, SessionStorage::Database);
        assert_eq!(config.session.expiration_hours, 24);
        assert_eq!(config.session.retention_days, 30);
        assert_eq!(
            config.websocket.heartbeat_interval(),
            Duration::from_secs(900)
        );
        assert_eq!(config.websocket.reconnect.attempt_cap(), None);
        assert_eq!(config.resilience.retry.max_attempts, 3);
        assert_eq!(config.resilience.circuit_breaker.sliding_window_size, 100);
        assert_eq!(
            config.resilience.time_limiter.timeout_duration(),
            Duration::from_secs(10)
        );
        assert!(!config.cache.enabled);
    }

    #[test]
    fn retry_backoff_grows_exponentially() {
        let retry = RetryConfig::default();
        assert_eq!(retry.wait_before(1), Duration::from_secs(2));
        assert_eq!(retry.wait_before(2), Duration::from_secs(4));
    }

    #[test]
    fn deserializes_camel_case_overrides() {
        let json = r#"{
            "api": {"key": "API-TESTKEY", "rateLimit": 1.0},
            "websocket": {"heartbeatIntervalMs": 5000,
                          "reconnect": {"maxAttempts": 3}},
            "session": {"storage": "file", "expirationHours": 12}
        }"#;
        let config: GatewayConfig = serde_json::from_str(json).expect("valid config");
        assert_eq!(config.api.key, "API-TESTKEY");
        assert_eq!(config.api.permit_interval(), Duration::from_secs(1));
        assert_eq!(
            config.websocket.heartbeat_interval(),
            Duration::from_secs(5)
        );
        assert_eq!(config.websocket.reconnect.attempt_cap(), Some(3));
        assert_eq!(config.session.storage, SessionStorage::File);
        assert_eq!(config.session.expiration_hours, 12);
    }

    #[test]
    fn validate_rejects_bad_config() {
        let mut config = GatewayConfig::default();
        assert!(config.validate().is_err()); // missing api key

        config.api.key = "API-TESTKEY".to_owned();
        config.validate().expect("valid");

        config.cache.enabled = true;
        assert!(config.validate().is_err()); // redis url required
    }
}
