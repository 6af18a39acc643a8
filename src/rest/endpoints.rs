//! Broker endpoint names and resilience classes.
//!
//! Endpoint constants are the bare operation names; the REST client joins
//! them onto the configured API base and derives the full path that goes
//! into the `Checker` hash. Each call declares an [`EndpointClass`], which
//! selects the resilience policy it rides under.

/// Credential step of the two-step login.
pub const LOGIN_USER: &str = "LoginUser";
/// OTP step of the two-step login.
pub const LOGIN_USER_CONTROL: &str = "LoginUserControl";
/// Session keep-alive refresh.
pub const SESSION_REFRESH: &str = "SessionRefresh";
/// Cheap authenticated call used as a liveness probe.
pub const GET_SUBACCOUNTS: &str = "GetSubAccounts";
/// Place a new order.
pub const SEND_ORDER: &str = "SendOrder";
/// Modify a resting order.
pub const MODIFY_ORDER: &str = "ModifyOrder";
/// Cancel a resting order.
pub const DELETE_ORDER: &str = "DeleteOrder";
/// Current positions snapshot.
pub const INSTANT_POSITION: &str = "InstantPosition";
/// Today's executions and working orders.
pub const TODAYS_TRANSACTION: &str = "TodaysTransaction";
/// Reference data for one instrument.
pub const GET_EQUITY_INFO: &str = "GetEquityInfo";
/// Historical candles for one instrument.
pub const GET_CANDLE_DATA: &str = "GetCandleData";

/// Resilience policy class of an endpoint.
///
/// - `Auth`: login/refresh steps and the liveness probe. Never retried (a
///   duplicate OTP post would invalidate the flow), never served from cache
///   (a cached answer cannot prove a session is alive).
/// - `Read`: reference and quote lookups. Retried on transient failures and
///   eligible for the last-good fallback cache.
/// - `Write`: non-order mutations. Retried, but never cached.
/// - `Order`: order placement and amendment. Never retried and never served
///   from cache; failures must reach the caller so the at-most-once
///   discipline holds.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum EndpointClass {
    /// Login, OTP, refresh and liveness-probe calls.
    Auth,
    /// Read-only reference/quote calls.
    Read,
    /// Non-order mutations.
    Write,
    /// Order placement, modification and cancellation.
    Order,
}

impl EndpointClass {
    /// Whether transient failures of this class may be retried.
    #[must_use]
    pub const fn retryable(self) -> bool {
        matches!(self, Self::Read | Self::Write)
    }

    /// Whether successful responses feed the last-good fallback cache.
    #[must_use]
    pub const fn cacheable(self) -> bool {
        matches!(self, Self::Read)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_and_auth_are_never_retried() {
        assert!(!EndpointClass::Order.retryable());
        assert!(!EndpointClass::Auth.retryable());
        assert!(EndpointClass::Read.retryable());
        assert!(EndpointClass::Write.retryable());
    }

    #[test]
    fn only_reads_are_cacheable() {
        assert!(EndpointClass::Read.cacheable());
        assert!(!EndpointClass::Auth.cacheable());
        assert!(!EndpointClass::Write.cacheable());
        assert!(!EndpointClass::Order.cacheable());
    }
}
