//! End-to-end request signing.
//!
//! The `Checker` header must be the SHA-256 of
//! `apiKey ‖ hostname ‖ endpoint ‖ body` where `body` is byte-for-byte the
//! compact JSON that goes on the wire, keys in payload-builder order.

use std::sync::Arc;

use algolab_gateway::GatewayConfig;
use algolab_gateway::auth::tokens::{AuthTokens, TokenCell};
use algolab_gateway::crypto;
use algolab_gateway::orders::{Direction, OrderService, PriceType, SendOrderRequest};
use algolab_gateway::rest::RestClient;
use httpmock::Method::POST;
use httpmock::MockServer;
use rust_decimal_macros::dec;
use serde_json::json;

const API_KEY: &str = "API-MDEyMzQ1Njc4OWFiY2RlZg==";

fn test_config(server: &MockServer) -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.api.key = API_KEY.to_owned();
    config.api.hostname = server.base_url();
    config.api.url = format!("{}/api", server.base_url());
    // Keep the suite fast; rate limiting has its own tests.
    config.api.rate_limit = 1_000.0;
    config.resilience.retry.wait_duration_ms = 10;
    config
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

#[test]
fn payload_serializes_to_the_canonical_compact_form() {
    let body = serde_json::to_string(&order()).expect("serializes");
    assert_eq!(
        body,
        r#"{"symbol":"AKBNK","direction":"BUY","pricetype":"limit","price":"45.50","lot":"10","sms":false,"email":false,"subAccount":""}"#
    );

    let checker = crypto::checker("K", "https://broker.test", "/api/SendOrder", &body);
    assert_eq!(checker.len(), 64);
    assert!(
        checker
            .chars()
            .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
    );
}

#[tokio::test]
async fn send_order_carries_matching_checker_and_body() -> anyhow::Result<()> {
    let server = MockServer::start();
    let config = test_config(&server);

    let tokens = Arc::new(TokenCell::new());
    tokens.set(AuthTokens::new("T1", "H1"));

    let body = serde_json::to_string(&order())?;
    let expected_checker = crypto::checker(API_KEY, &server.base_url(), "/api/SendOrder", &body);

    let mock = server.mock(|when, then| {
        when.method(POST)
            .path("/api/SendOrder")
            .header("APIKEY", API_KEY)
            .header("Authorization", "H1")
            .header("Checker", expected_checker.as_str())
            .body(body.as_str());
        then.status(200).json_body(json!({
            "success": true,
            "message": "",
            "content": "REF-0001"
        }));
    });

    let rest = Arc::new(RestClient::new(&config, tokens)?);
    let orders = OrderService::new(rest);

    let reference = orders.send(&order()).await?;
    assert_eq!(reference, "REF-0001");
    mock.assert();

    Ok(())
}

#[tokio::test]
async fn empty_payload_signs_the_empty_string() -> anyhow::Result<()> {
    let server = MockServer::start();
    let config = test_config(&server);

    let tokens = Arc::new(TokenCell::new());
    tokens.set(AuthTokens::new("T1", "H1"));

    let expected_checker =
        crypto::checker(API_KEY, &server.base_url(), "/api/GetSubAccounts", "");

    let mock = server.mock(|when, then| {
        when.method(POST)
            .path("/api/GetSubAccounts")
            .header("Checker", expected_checker.as_str());
        then.status(200).json_body(json!({
            "success": true,
            "message": "",
            "content": []
        }));
    });

    let rest = RestClient::new(&config, tokens)?;
    let _: serde_json::Value = rest
        .post_authed_empty(
            algolab_gateway::rest::endpoints::GET_SUBACCOUNTS,
            algolab_gateway::rest::EndpointClass::Auth,
        )
        .await?;
    mock.assert();

    Ok(())
}
