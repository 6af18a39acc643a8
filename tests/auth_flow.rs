//! The two-step login state machine against a mock broker.

use algolab_gateway::auth::AuthState;
use algolab_gateway::config::SessionStorage;
use algolab_gateway::error::{AuthKind, Kind};
use algolab_gateway::session::Session;
use algolab_gateway::{Gateway, GatewayConfig};
use httpmock::Method::POST;
use httpmock::MockServer;
use reqwest::StatusCode;
use secrecy::SecretString;
use serde_json::json;

const API_KEY: &str = "API-MDEyMzQ1Njc4OWFiY2RlZg==";

fn test_config(server: &MockServer, dir: &tempfile::TempDir) -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.api.key = API_KEY.to_owned();
    config.api.hostname = server.base_url();
    config.api.url = format!("{}/api", server.base_url());
    config.api.rate_limit = 1_000.0;
    config.session.storage = SessionStorage::File;
    config.session.file_path = dir.path().join("session.json");
    config.auth.auto_login = false;
    config.auth.keep_alive = false;
    config.websocket.enabled = false;
    config.resilience.retry.wait_duration_ms = 10;
    config
}

fn encrypt(plaintext: &str) -> String {
    let key = algolab_gateway::crypto::derive_key(API_KEY).expect("valid key");
    algolab_gateway::crypto::encrypt_field(&key, plaintext)
}

#[tokio::test]
async fn login_happy_path_persists_the_session() -> anyhow::Result<()> {
    let server = MockServer::start();
    let dir = tempfile::tempdir()?;
    let gateway = Gateway::build(test_config(&server, &dir)).await?;

    // Credentials go out encrypted, never in plaintext.
    let login_mock = server.mock(|when, then| {
        when.method(POST).path("/api/LoginUser").json_body(json!({
            "username": encrypt("tc11111111111"),
            "password": encrypt("P@ss"),
        }));
        then.status(200).json_body(json!({
            "success": true,
            "message": "",
            "content": {"token": "T1"}
        }));
    });

    assert_eq!(gateway.status(), AuthState::Unauthenticated);
    gateway
        .login("tc11111111111", &SecretString::from("P@ss"))
        .await?;
    assert_eq!(gateway.status(), AuthState::AwaitingOtp);
    login_mock.assert();

    let otp_mock = server.mock(|when, then| {
        when.method(POST)
            .path("/api/LoginUserControl")
            .json_body(json!({
                "token": encrypt("T1"),
                "password": encrypt("123456"),
            }));
        then.status(200).json_body(json!({
            "success": true,
            "message": "",
            "content": {"hash": "H1"}
        }));
    });

    gateway.verify_otp("123456").await?;
    assert_eq!(gateway.status(), AuthState::Authenticated);
    otp_mock.assert();

    // The persisted document carries the pair and is active.
    let raw = std::fs::read(dir.path().join("session.json"))?;
    let session: Session = serde_json::from_slice(&raw)?;
    assert_eq!(session.token, "T1");
    assert_eq!(session.hash, "H1");
    assert!(session.active);

    Ok(())
}

#[tokio::test]
async fn otp_without_login_is_a_missing_prior_step() -> anyhow::Result<()> {
    let server = MockServer::start();
    let dir = tempfile::tempdir()?;
    let gateway = Gateway::build(test_config(&server, &dir)).await?;

    let err = gateway.verify_otp("123456").await.expect_err("no login yet");
    assert_eq!(err.kind(), Kind::Auth(AuthKind::MissingPriorStep));
    assert_eq!(gateway.status(), AuthState::Unauthenticated);

    Ok(())
}

#[tokio::test]
async fn rejected_credentials_surface_as_invalid_credentials() -> anyhow::Result<()> {
    let server = MockServer::start();
    let dir = tempfile::tempdir()?;
    let gateway = Gateway::build(test_config(&server, &dir)).await?;

    let mock = server.mock(|when, then| {
        when.method(POST).path("/api/LoginUser");
        then.status(200).json_body(json!({
            "success": false,
            "message": "invalid credentials",
            "content": null
        }));
    });

    let err = gateway
        .login("tc11111111111", &SecretString::from("wrong"))
        .await
        .expect_err("broker said no");
    assert_eq!(err.kind(), Kind::Auth(AuthKind::InvalidCredentials));
    assert_eq!(gateway.status(), AuthState::Unauthenticated);
    mock.assert();

    Ok(())
}

#[tokio::test]
async fn restore_validates_against_the_broker() -> anyhow::Result<()> {
    let server = MockServer::start();
    let dir = tempfile::tempdir()?;
    let config = test_config(&server, &dir);

    // A prior run left a valid session document behind.
    let session = Session::new("T1".to_owned(), "H1".to_owned(), 24);
    std::fs::write(&config.session.file_path, serde_json::to_vec(&session)?)?;

    let alive_mock = server.mock(|when, then| {
        when.method(POST)
            .path("/api/GetSubAccounts")
            .header("Authorization", "H1");
        then.status(200).json_body(json!({
            "success": true,
            "message": "",
            "content": []
        }));
    });

    let gateway = Gateway::build(config).await?;
    assert!(gateway.auth().restore_session().await?);
    assert_eq!(gateway.status(), AuthState::Authenticated);
    alive_mock.assert();

    Ok(())
}

#[tokio::test]
async fn restore_clears_state_when_validation_fails() -> anyhow::Result<()> {
    let server = MockServer::start();
    let dir = tempfile::tempdir()?;
    let config = test_config(&server, &dir);

    let session = Session::new("T1".to_owned(), "H-stale".to_owned(), 24);
    std::fs::write(&config.session.file_path, serde_json::to_vec(&session)?)?;

    // The broker no longer accepts the hash.
    let mock = server.mock(|when, then| {
        when.method(POST).path("/api/GetSubAccounts");
        then.status(200).json_body(json!({
            "success": false,
            "message": "session not found",
            "content": null
        }));
    });

    let gateway = Gateway::build(config.clone()).await?;
    assert!(!gateway.auth().restore_session().await?);
    assert_eq!(gateway.status(), AuthState::Unauthenticated);
    // The stale document is gone; the next restore finds nothing.
    assert!(!config.session.file_path.exists());
    mock.assert();

    Ok(())
}

#[tokio::test]
async fn refresh_401_is_authoritative() -> anyhow::Result<()> {
    let server = MockServer::start();
    let dir = tempfile::tempdir()?;
    let config = test_config(&server, &dir);

    let session = Session::new("T1".to_owned(), "H1".to_owned(), 24);
    std::fs::write(&config.session.file_path, serde_json::to_vec(&session)?)?;

    let alive_mock = server.mock(|when, then| {
        when.method(POST).path("/api/GetSubAccounts");
        then.status(200)
            .json_body(json!({"success": true, "message": "", "content": []}));
    });

    let gateway = Gateway::build(config).await?;
    assert!(gateway.auth().restore_session().await?);
    alive_mock.assert();

    let refresh_mock = server.mock(|when, then| {
        when.method(POST).path("/api/SessionRefresh");
        then.status(401).body("unauthorized");
    });

    let err = gateway.auth().refresh().await.expect_err("session expired");
    assert_eq!(err.kind(), Kind::Auth(AuthKind::SessionExpired));
    assert_eq!(gateway.status(), AuthState::Unauthenticated);
    refresh_mock.assert();

    Ok(())
}

#[tokio::test]
async fn liveness_probe_is_never_answered_from_cache() -> anyhow::Result<()> {
    let server = MockServer::start();
    let dir = tempfile::tempdir()?;
    let config = test_config(&server, &dir);

    let session = Session::new("T1".to_owned(), "H1".to_owned(), 24);
    std::fs::write(&config.session.file_path, serde_json::to_vec(&session)?)?;

    let alive_mock = server.mock(|when, then| {
        when.method(POST).path("/api/GetSubAccounts");
        then.status(200)
            .json_body(json!({"success": true, "message": "", "content": []}));
    });

    // One live probe succeeds; whatever it answered must not be reusable.
    let gateway = Gateway::build(config).await?;
    assert!(gateway.auth().restore_session().await?);
    alive_mock.assert();

    // The upstream is now refusing everything. A probe that cannot reach
    // the broker cannot report the session alive.
    gateway.force_circuit_open();
    assert!(!gateway.auth().is_alive().await);

    // Restore runs the same mandatory validation and must fail with it.
    assert!(!gateway.auth().restore_session().await?);
    assert_eq!(gateway.status(), AuthState::Unauthenticated);
    // The upstream was never contacted again.
    alive_mock.assert_hits(1);

    Ok(())
}

#[tokio::test]
async fn fallback_cache_does_not_outlive_the_session() -> anyhow::Result<()> {
    let server = MockServer::start();
    let dir = tempfile::tempdir()?;
    let mut config = test_config(&server, &dir);
    config.resilience.retry.max_attempts = 1;

    let session = Session::new("T1".to_owned(), "H1".to_owned(), 24);
    std::fs::write(&config.session.file_path, serde_json::to_vec(&session)?)?;

    let _alive = server.mock(|when, then| {
        when.method(POST).path("/api/GetSubAccounts");
        then.status(200)
            .json_body(json!({"success": true, "message": "", "content": []}));
    });

    let gateway = Gateway::build(config.clone()).await?;
    assert!(gateway.auth().restore_session().await?);

    // The first session reads its positions; the response lands in the
    // fallback cache.
    let mut positions_ok = server.mock(|when, then| {
        when.method(POST).path("/api/InstantPosition");
        then.status(200).json_body(json!({
            "success": true,
            "message": "",
            "content": [{
                "symbol": "AKBNK",
                "quantity": "10",
                "cost": "45.0",
                "unitPrice": "46.0",
                "profit": "10.0"
            }]
        }));
    });
    let first = gateway.orders().positions().await?;
    assert!(!first.cached);
    assert_eq!(first.value.len(), 1);
    positions_ok.assert();
    positions_ok.delete();

    // A different brokerage login takes over the same gateway process.
    gateway.logout().await;
    let session = Session::new("T2".to_owned(), "H2".to_owned(), 24);
    std::fs::write(&config.session.file_path, serde_json::to_vec(&session)?)?;
    assert!(gateway.auth().restore_session().await?);

    // The upstream refuses positions for the new session. The previous
    // account's cached positions must not be served in its place.
    let _failing = server.mock(|when, then| {
        when.method(POST).path("/api/InstantPosition");
        then.status(503).body("down");
    });
    let err = gateway
        .orders()
        .positions()
        .await
        .expect_err("nothing cached for this session");
    assert_eq!(err.http_status(), Some(StatusCode::SERVICE_UNAVAILABLE));

    Ok(())
}

#[tokio::test]
async fn logout_clears_memory_and_disk() -> anyhow::Result<()> {
    let server = MockServer::start();
    let dir = tempfile::tempdir()?;
    let config = test_config(&server, &dir);

    let session = Session::new("T1".to_owned(), "H1".to_owned(), 24);
    std::fs::write(&config.session.file_path, serde_json::to_vec(&session)?)?;
    let _alive = server.mock(|when, then| {
        when.method(POST).path("/api/GetSubAccounts");
        then.status(200)
            .json_body(json!({"success": true, "message": "", "content": []}));
    });

    let gateway = Gateway::build(config.clone()).await?;
    assert!(gateway.auth().restore_session().await?);

    gateway.logout().await;
    assert_eq!(gateway.status(), AuthState::Unauthenticated);
    assert!(!config.session.file_path.exists());

    Ok(())
}
