//! Crate-wide error type.
//!
//! Every fallible operation in the gateway returns [`crate::Result`], which
//! carries this [`Error`]. The [`Kind`] taxonomy is what callers dispatch on:
//! authentication failures, broker API rejections, transport problems, and
//! the resilience-envelope outcomes (timeout, rate limit, open circuit) are
//! all distinct so the surrounding platform can map them to user-visible
//! messages without string matching.

use std::fmt;

use reqwest::StatusCode;

/// Authentication failure classes.
///
/// These mirror the login state machine: a missing prior step is a caller
/// bug, a broker rejection is an upstream decision, an expired session is a
/// signal to run the two-step login again.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthKind {
    /// The broker rejected the supplied username/password.
    InvalidCredentials,
    /// An operation was called out of order (e.g. OTP before login).
    MissingPriorStep,
    /// The broker returned `success: false` for an auth call.
    BrokerRejected,
    /// The session hash is no longer accepted by the broker.
    SessionExpired,
    /// An authenticated operation was attempted without a session.
    NotAuthenticated,
}

/// Error classification.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// Authentication state machine failure.
    Auth(AuthKind),
    /// Non-2xx HTTP response from the broker; never retried.
    Api {
        /// HTTP status returned by the broker.
        status: StatusCode,
    },
    /// IO, DNS or TLS failure before a response was received.
    Transport,
    /// The per-call time limiter expired.
    Timeout,
    /// A rate-limit permit could not be acquired within the call budget.
    RateLimit,
    /// The circuit breaker refused the call.
    CircuitOpen,
    /// Client-side input validation failure.
    Validation,
    /// A response body did not match the expected shape.
    Decode,
    /// Cache-tier failure; callers degrade, never abort.
    Cache,
    /// WebSocket connection or protocol failure.
    WebSocket,
    /// Session store failure.
    Session,
}

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// The gateway error type.
pub struct Error {
    kind: Kind,
    message: Option<String>,
    source: Option<BoxError>,
}

impl Error {
    /// Create an error from a kind and an underlying source.
    pub fn with_source(kind: Kind, source: impl Into<BoxError>) -> Self {
        Self {
            kind,
            message: None,
            source: Some(source.into()),
        }
    }

    /// Create a bare error from a kind.
    #[must_use]
    pub const fn new(kind: Kind) -> Self {
        Self {
            kind,
            message: None,
            source: None,
        }
    }

    /// Client-side validation failure with a human-readable reason.
    pub fn validation(message: impl Into<String>) -> Self {
        Self {
            kind: Kind::Validation,
            message: Some(message.into()),
            source: None,
        }
    }

    /// Authentication failure of the given class.
    pub fn auth(kind: AuthKind, message: impl Into<String>) -> Self {
        Self {
            kind: Kind::Auth(kind),
            message: Some(message.into()),
            source: None,
        }
    }

    /// Non-2xx broker response, carrying the status and raw body.
    pub fn status(status: StatusCode, endpoint: &str, body: impl Into<String>) -> Self {
        let body = body.into();
        Self {
            kind: Kind::Api { status },
            message: Some(format!("{endpoint} returned {status}: {body}")),
            source: None,
        }
    }

    /// Time-limiter expiry for the named endpoint.
    pub fn timeout(endpoint: &str) -> Self {
        Self {
            kind: Kind::Timeout,
            message: Some(format!("{endpoint} timed out")),
            source: None,
        }
    }

    /// Circuit-breaker rejection for the named endpoint.
    pub fn circuit_open(endpoint: &str) -> Self {
        Self {
            kind: Kind::CircuitOpen,
            message: Some(format!(
                "{endpoint}: service temporarily unavailable, try again later"
            )),
            source: None,
        }
    }

    /// Rate-limit permit wait exceeded the call budget.
    pub fn rate_limited(endpoint: &str) -> Self {
        Self {
            kind: Kind::RateLimit,
            message: Some(format!("{endpoint}: rate limit wait exceeded call budget")),
            source: None,
        }
    }

    /// Attach or replace the human-readable message.
    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// The error classification.
    #[must_use]
    pub const fn kind(&self) -> Kind {
        self.kind
    }

    /// HTTP status, when this is an API error.
    #[must_use]
    pub const fn http_status(&self) -> Option<StatusCode> {
        match self.kind {
            Kind::Api { status } => Some(status),
            _ => None,
        }
    }

    /// Whether this is a 2xx response whose body carried `success: false`.
    ///
    /// The upstream is healthy in that case; the broker just said no.
    #[must_use]
    pub fn is_broker_rejection(&self) -> bool {
        match self.kind {
            Kind::Api { status } => status.is_success(),
            _ => false,
        }
    }

    /// Whether the resilience envelope may retry this failure.
    ///
    /// Transport errors, timeouts and 5xx responses are transient; everything
    /// else (4xx, validation, auth, open circuit) is not.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self.kind {
            Kind::Transport | Kind::Timeout => true,
            Kind::Api { status } => status.is_server_error(),
            _ => false,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(message) = &self.message {
            return write!(f, "{message}");
        }
        match self.kind {
            Kind::Auth(AuthKind::InvalidCredentials) => write!(f, "invalid credentials"),
            Kind::Auth(AuthKind::MissingPriorStep) => {
                write!(f, "operation requires a prior login step")
            }
            Kind::Auth(AuthKind::BrokerRejected) => write!(f, "broker rejected the request"),
            Kind::Auth(AuthKind::SessionExpired) => {
                write!(f, "unauthorized, please log in again")
            }
            Kind::Auth(AuthKind::NotAuthenticated) => write!(f, "not authenticated"),
            Kind::Api { status } => write!(f, "broker returned {status}"),
            Kind::Transport => write!(f, "network unreachable"),
            Kind::Timeout => write!(f, "timed out"),
            Kind::RateLimit => write!(f, "rate limit exceeded"),
            Kind::CircuitOpen => write!(f, "service temporarily unavailable, try again later"),
            Kind::Validation => write!(f, "validation failed"),
            Kind::Decode => write!(f, "unexpected response body"),
            Kind::Cache => write!(f, "cache tier failure"),
            Kind::WebSocket => write!(f, "websocket failure"),
            Kind::Session => write!(f, "session store failure"),
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Error");
        s.field("kind", &self.kind);
        if let Some(message) = &self.message {
            s.field("message", message);
        }
        if let Some(source) = &self.source {
            s.field("source", source);
        }
        s.finish()
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_deref()
            .map(|s| s as &(dyn std::error::Error + 'static))
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            Kind::Timeout
        } else if err.is_decode() {
            Kind::Decode
        } else {
            Kind::Transport
        };
        Self::with_source(kind, err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::with_source(Kind::Decode, err)
    }
}

impl From<url::ParseError> for Error {
    fn from(err: url::ParseError) -> Self {
        Self::with_source(Kind::Validation, err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(Error::new(Kind::Transport).is_retryable());
        assert!(Error::timeout("/api/GetEquityInfo").is_retryable());
        assert!(
            Error::status(StatusCode::INTERNAL_SERVER_ERROR, "/api/SendOrder", "")
                .is_retryable()
        );
        assert!(!Error::status(StatusCode::BAD_REQUEST, "/api/SendOrder", "").is_retryable());
        assert!(!Error::validation("bad direction").is_retryable());
        assert!(!Error::circuit_open("/api/SendOrder").is_retryable());
        assert!(!Error::auth(AuthKind::SessionExpired, "expired").is_retryable());
    }

    #[test]
    fn display_distinguishes_failure_classes() {
        assert_eq!(Error::new(Kind::Transport).to_string(), "network unreachable");
        assert_eq!(Error::new(Kind::Timeout).to_string(), "timed out");
        assert!(
            Error::new(Kind::CircuitOpen)
                .to_string()
                .contains("temporarily unavailable")
        );
        assert!(
            Error::new(Kind::Auth(AuthKind::SessionExpired))
                .to_string()
                .contains("log in again")
        );
    }
}
