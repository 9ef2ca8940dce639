//! End-to-end OAuth2 connect flow against a mock broker token endpoint:
//! authorize URL issuance, code exchange, encrypted persistence, and the
//! single-use state guarantee.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::{extract::Form, routing::post, Json, Router};
use chrono::Utc;

use tradelink::credentials::cipher::CredentialCipher;
use tradelink::credentials::manager::CredentialManager;
use tradelink::credentials::oauth1::FixedNonceSource;
use tradelink::credentials::oauth2::Oauth2Provider;
use tradelink::credentials::CredentialError;
use tradelink::domain::entities::broker::{BrokerKind, TradingMode};
use tradelink::domain::entities::credentials::BrokerCredentials;
use tradelink::domain::services::connection_service::ConnectionService;
use tradelink::domain::services::ServiceError;
use tradelink::infrastructure::broker_client_factory::BrokerClientFactory;
use tradelink::persistence::repository::{ConnectionRepository, PositionRepository};
use tradelink::persistence::{init_database, DbPool};

const TEST_KEY: &str = "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=";

/// Minimal broker-side token endpoint: accepts any code and returns a
/// fresh token pair.
async fn spawn_token_server() -> String {
    async fn token(Form(params): Form<HashMap<String, String>>) -> Json<serde_json::Value> {
        assert_eq!(params.get("grant_type").map(String::as_str), Some("authorization_code"));
        let code = params.get("code").cloned().unwrap_or_default();
        Json(serde_json::json!({
            "access_token": format!("access-for-{}", code),
            "refresh_token": format!("refresh-for-{}", code),
            "expires_in": 3600,
        }))
    }

    let app = Router::new().route("/oauth/token", post(token));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

async fn temp_database() -> DbPool {
    let path = std::env::temp_dir().join(format!("tradelink-e2e-{}.db", uuid::Uuid::new_v4()));
    init_database(&format!("sqlite://{}", path.display()))
        .await
        .expect("e2e database")
}

fn build_service(pool: DbPool, token_base: &str) -> (Arc<ConnectionService>, Arc<CredentialManager>) {
    let nonces = Arc::new(FixedNonceSource {
        timestamp: 1700000000,
        nonce: "e2e-nonce".to_string(),
    });
    let provider = Oauth2Provider {
        client_id: "e2e-client".to_string(),
        client_secret: "e2e-client-secret".to_string(),
        authorize_url: "https://broker.test/oauth/authorize".to_string(),
        token_url: format!("{}/oauth/token", token_base),
        redirect_uri: "https://app.test/oauth/callback".to_string(),
        scope: "trading".to_string(),
    };
    let manager = Arc::new(CredentialManager::new(
        pool.clone(),
        CredentialCipher::new(TEST_KEY).unwrap(),
        reqwest::Client::new(),
        Duration::from_secs(600),
        Some(provider),
        None,
        nonces.clone(),
    ));
    let factory = Arc::new(BrokerClientFactory::new(Duration::from_secs(5), None, nonces));
    let service = Arc::new(ConnectionService::new(pool, manager.clone(), factory));
    (service, manager)
}

#[tokio::test]
async fn test_oauth2_connect_creates_paper_connection_with_tokens() {
    let token_base = spawn_token_server().await;
    let pool = temp_database().await;
    let (service, manager) = build_service(pool.clone(), &token_base);

    let start = service
        .begin_oauth("user-1", BrokerKind::Alpaca, TradingMode::Paper)
        .await
        .unwrap();
    assert!(start.redirect_url.contains("client_id=e2e-client"));
    assert!(start.redirect_url.contains(&start.state));

    let connection = service
        .complete_oauth2("abc123", &start.state)
        .await
        .unwrap();
    assert_eq!(connection.broker, BrokerKind::Alpaca);
    assert!(connection.mode.is_paper());
    assert!(connection.is_active);

    // Stored credentials decrypt to the non-empty token pair
    let record = ConnectionRepository::new(pool)
        .get(&connection.id)
        .await
        .unwrap()
        .unwrap();
    assert_ne!(record.credentials_enc, "");
    match manager.open(&record.credentials_enc).unwrap() {
        BrokerCredentials::OAuth2 {
            ref access_token,
            ref refresh_token,
            expires_at,
        } => {
            assert_eq!(access_token, "access-for-abc123");
            assert_eq!(refresh_token, "refresh-for-abc123");
            assert!(expires_at > Utc::now());
        }
        other => panic!("expected OAuth2 credentials, got {:?}", other),
    }
}

#[tokio::test]
async fn test_oauth_state_is_single_use() {
    let token_base = spawn_token_server().await;
    let pool = temp_database().await;
    let (service, _manager) = build_service(pool, &token_base);

    let start = service
        .begin_oauth("user-1", BrokerKind::Alpaca, TradingMode::Paper)
        .await
        .unwrap();
    service.complete_oauth2("abc123", &start.state).await.unwrap();

    // Second redemption of the same state must fail with a client error
    let err = service
        .complete_oauth2("abc123", &start.state)
        .await
        .unwrap_err();
    match err {
        ServiceError::Credential(e) => {
            assert!(matches!(e, CredentialError::StateNotFound));
            assert!(e.is_client_error());
        }
        other => panic!("expected credential error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_reauthorization_relinks_existing_connection() {
    let token_base = spawn_token_server().await;
    let pool = temp_database().await;
    let (service, _manager) = build_service(pool, &token_base);

    let start = service
        .begin_oauth("user-1", BrokerKind::Alpaca, TradingMode::Paper)
        .await
        .unwrap();
    let first = service.complete_oauth2("abc123", &start.state).await.unwrap();

    let start = service
        .begin_oauth("user-1", BrokerKind::Alpaca, TradingMode::Paper)
        .await
        .unwrap();
    let second = service.complete_oauth2("def456", &start.state).await.unwrap();

    // One broker account, one connection
    assert_eq!(first.id, second.id);
    assert_eq!(service.list("user-1").await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_disconnect_purges_connection_and_positions() {
    let token_base = spawn_token_server().await;
    let pool = temp_database().await;
    let (service, _manager) = build_service(pool.clone(), &token_base);

    let start = service
        .begin_oauth("user-1", BrokerKind::Alpaca, TradingMode::Paper)
        .await
        .unwrap();
    let connection = service.complete_oauth2("abc123", &start.state).await.unwrap();

    // Simulate a previous sync having cached positions
    use tradelink::domain::entities::position::{Position, PositionSide};
    let positions = PositionRepository::new(pool.clone());
    positions
        .replace_for_connection(
            &connection.id,
            "user-1",
            &[Position {
                symbol: "AAPL".to_string(),
                side: PositionSide::Long,
                quantity: 10.0,
                avg_entry_price: 100.0,
                cost_basis: 1000.0,
                market_value: 1100.0,
                unrealized_pnl: 100.0,
                current_price: 110.0,
            }],
            Utc::now(),
        )
        .await
        .unwrap();

    service.disconnect("user-1", &connection.id).await.unwrap();

    // Connection, credentials, and cache are all gone
    let err = service.get("user-1", &connection.id).await.unwrap_err();
    assert!(matches!(err, ServiceError::NotFound(_)));
    assert!(ConnectionRepository::new(pool.clone())
        .get(&connection.id)
        .await
        .unwrap()
        .is_none());
    assert!(positions
        .list_by_connection(&connection.id)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_disconnect_requires_ownership() {
    let token_base = spawn_token_server().await;
    let pool = temp_database().await;
    let (service, _manager) = build_service(pool, &token_base);

    let start = service
        .begin_oauth("user-1", BrokerKind::Alpaca, TradingMode::Live)
        .await
        .unwrap();
    let connection = service.complete_oauth2("abc123", &start.state).await.unwrap();

    let err = service.disconnect("user-2", &connection.id).await.unwrap_err();
    assert!(matches!(err, ServiceError::NotFound(_)));
    assert!(service.get("user-1", &connection.id).await.is_ok());
}
