//! The resilience envelope: retry, circuit breaker, fallback, rate limit.

use std::sync::Arc;
use std::time::Duration;

use algolab_gateway::GatewayConfig;
use algolab_gateway::auth::tokens::{AuthTokens, TokenCell};
use algolab_gateway::orders::{Direction, OrderService, PriceType, SendOrderRequest};
use algolab_gateway::rest::endpoints::GET_CANDLE_DATA;
use algolab_gateway::rest::{CircuitState, RestClient};
use httpmock::Method::POST;
use httpmock::MockServer;
use reqwest::StatusCode;
use rust_decimal_macros::dec;
use serde_json::json;

const API_KEY: &str = "API-MDEyMzQ1Njc4OWFiY2RlZg==";

fn test_config(server: &MockServer) -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.api.key = API_KEY.to_owned();
    config.api.hostname = server.base_url();
    config.api.url = format!("{}/api", server.base_url());
    config.api.rate_limit = 1_000.0;
    config.resilience.retry.wait_duration_ms = 10;
    config
}

fn authed_client(config: &GatewayConfig) -> Arc<RestClient> {
    let tokens = Arc::new(TokenCell::new());
    tokens.set(AuthTokens::new("T1", "H1"));
    Arc::new(RestClient::new(config, tokens).expect("client builds"))
}

fn order() -> SendOrderRequest {
    SendOrderRequest::builder()
        .symbol("AKBNK")
        .direction(Direction::Buy)
        .pricetype(PriceType::Limit)
        .price(dec!(45.50))
        .lot(dec!(10))
        .build()
}

#[tokio::test]
async fn transient_5xx_is_retried_three_times() -> anyhow::Result<()> {
    let server = MockServer::start();
    let rest = authed_client(&test_config(&server));

    let mock = server.mock(|when, then| {
        when.method(POST).path("/api/GetCandleData");
        then.status(500).body("boom");
    });

    let err = rest
        .post_read::<_, serde_json::Value>(GET_CANDLE_DATA, &json!({"symbol": "AKBNK"}))
        .await
        .expect_err("upstream kept failing");
    assert_eq!(err.http_status(), Some(StatusCode::INTERNAL_SERVER_ERROR));
    mock.assert_hits(3);

    Ok(())
}

#[tokio::test]
async fn client_errors_are_never_retried() -> anyhow::Result<()> {
    let server = MockServer::start();
    let rest = authed_client(&test_config(&server));

    let mock = server.mock(|when, then| {
        when.method(POST).path("/api/GetCandleData");
        then.status(400).body("bad request");
    });

    let err = rest
        .post_read::<_, serde_json::Value>(GET_CANDLE_DATA, &json!({"symbol": "AKBNK"}))
        .await
        .expect_err("caller error");
    assert_eq!(err.http_status(), Some(StatusCode::BAD_REQUEST));
    mock.assert_hits(1);

    Ok(())
}

#[tokio::test]
async fn failed_order_send_is_never_retried_and_says_so() -> anyhow::Result<()> {
    let server = MockServer::start();
    let config = test_config(&server);
    let orders = OrderService::new(authed_client(&config));

    let mock = server.mock(|when, then| {
        when.method(POST).path("/api/SendOrder");
        then.status(500).body("boom");
    });

    let err = orders.send(&order()).await.expect_err("order must fail");
    assert!(
        err.to_string().contains("order was NOT placed"),
        "caller must see an explicit not-placed message, got: {err}"
    );
    // At-most-once: exactly one attempt reached the upstream.
    mock.assert_hits(1);

    Ok(())
}

#[tokio::test]
async fn circuit_opens_after_consecutive_failures_and_probes_after_wait() -> anyhow::Result<()> {
    let server = MockServer::start();
    let mut config = test_config(&server);
    config.resilience.circuit_breaker.minimum_number_of_calls = 2;
    config.resilience.circuit_breaker.wait_duration_in_open_state_ms = 200;
    config.resilience.circuit_breaker.permitted_number_of_calls_in_half_open_state = 2;
    let rest = authed_client(&config);
    let orders = OrderService::new(Arc::clone(&rest));

    let mut failing = server.mock(|when, then| {
        when.method(POST).path("/api/SendOrder");
        then.status(500).body("boom");
    });

    // Two recorded failures trip the breaker (min calls = 2, rate 100%).
    for _ in 0..2 {
        let _ = orders.send(&order()).await.expect_err("upstream down");
    }
    assert_eq!(rest.circuit_state(), CircuitState::Open);

    // While open, calls never reach the upstream.
    let _ = orders.send(&order()).await.expect_err("circuit open");
    failing.assert_hits(2);

    failing.delete();
    let healthy = server.mock(|when, then| {
        when.method(POST).path("/api/SendOrder");
        then.status(200)
            .json_body(json!({"success": true, "message": "", "content": "REF-1"}));
    });

    // After the open-state wait, one probing call reaches the upstream.
    tokio::time::sleep(Duration::from_millis(250)).await;
    let reference = orders.send(&order()).await?;
    assert_eq!(reference, "REF-1");
    assert_eq!(rest.circuit_state(), CircuitState::HalfOpen);
    healthy.assert_hits(1);

    Ok(())
}

#[tokio::test]
async fn read_calls_fall_back_to_last_good_within_ttl() -> anyhow::Result<()> {
    let server = MockServer::start();
    let mut config = test_config(&server);
    config.resilience.retry.max_attempts = 1;
    let rest = authed_client(&config);

    let mut healthy = server.mock(|when, then| {
        when.method(POST).path("/api/GetCandleData");
        then.status(200).json_body(json!({
            "success": true,
            "message": "",
            "content": [{"timestamp": 1, "open": "1", "high": "2", "low": "1", "close": "2"}]
        }));
    });

    let live = rest
        .post_read::<_, serde_json::Value>(GET_CANDLE_DATA, &json!({"symbol": "AKBNK"}))
        .await?;
    assert!(!live.cached);
    healthy.assert();
    healthy.delete();

    let _failing = server.mock(|when, then| {
        when.method(POST).path("/api/GetCandleData");
        then.status(503).body("down");
    });

    // Same endpoint, same payload: the last good body is served, marked.
    let cached = rest
        .post_read::<_, serde_json::Value>(GET_CANDLE_DATA, &json!({"symbol": "AKBNK"}))
        .await?;
    assert!(cached.cached);
    assert_eq!(cached.value, live.value);
    assert_eq!(rest.fallback_stats().served, 1);

    // A different payload has no last-good entry and fails outright.
    let err = rest
        .post_read::<_, serde_json::Value>(GET_CANDLE_DATA, &json!({"symbol": "GARAN"}))
        .await
        .expect_err("nothing cached for GARAN");
    assert_eq!(err.http_status(), Some(StatusCode::SERVICE_UNAVAILABLE));

    Ok(())
}

#[tokio::test]
async fn sequential_calls_respect_the_permit_interval() -> anyhow::Result<()> {
    let server = MockServer::start();
    let mut config = test_config(&server);
    // Two permits per second; three calls need at least one second.
    config.api.rate_limit = 2.0;
    let rest = authed_client(&config);

    let mock = server.mock(|when, then| {
        when.method(POST).path("/api/GetCandleData");
        then.status(200)
            .json_body(json!({"success": true, "message": "", "content": []}));
    });

    let started = std::time::Instant::now();
    for _ in 0..3 {
        let _: algolab_gateway::rest::Cached<serde_json::Value> = rest
            .post_read(GET_CANDLE_DATA, &json!({"symbol": "AKBNK"}))
            .await?;
    }
    assert!(
        started.elapsed() >= Duration::from_secs(1),
        "three dispatches at 2/s must take at least 1s, took {:?}",
        started.elapsed()
    );
    mock.assert_hits(3);

    Ok(())
}

#[tokio::test]
async fn forced_open_rejects_without_contacting_upstream() -> anyhow::Result<()> {
    let server = MockServer::start();
    let config = test_config(&server);
    let rest = authed_client(&config);

    let mock = server.mock(|when, then| {
        when.method(POST).path("/api/GetCandleData");
        then.status(200)
            .json_body(json!({"success": true, "message": "", "content": []}));
    });

    rest.force_circuit_open();
    assert_eq!(rest.circuit_state(), CircuitState::ForcedOpen);

    let err = rest
        .post_read::<_, serde_json::Value>(GET_CANDLE_DATA, &json!({"symbol": "AKBNK"}))
        .await
        .expect_err("forced open, nothing cached");
    assert_eq!(err.kind(), algolab_gateway::error::Kind::CircuitOpen);
    mock.assert_hits(0);

    rest.reset_circuit();
    let _: algolab_gateway::rest::Cached<serde_json::Value> = rest
        .post_read(GET_CANDLE_DATA, &json!({"symbol": "AKBNK"}))
        .await?;
    mock.assert_hits(1);

    Ok(())
}
