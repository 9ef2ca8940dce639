//! Concurrency specifications
//!
//! Exactly one sync per connection at a time, serialized duplicate order
//! submissions, and independent parallelism across connections.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use crate::credentials::cipher::CredentialCipher;
use crate::credentials::manager::CredentialManager;
use crate::credentials::oauth1::FixedNonceSource;
use crate::domain::entities::broker::BrokerKind;
use crate::domain::entities::order::{OrderSide, OrderType, TimeInForce};
use crate::domain::services::connection_service::ConnectionService;
use crate::domain::services::order_executor::{OrderExecutor, PlaceOrderRequest};
use crate::domain::services::position_sync::{PositionSyncEngine, SyncOutcome};
use crate::domain::services::ServiceError;
use crate::domain::test_support::{
    broker_position, seed_connection, MockBrokerClient, MockClientProvider,
};
use crate::infrastructure::broker_client_factory::BrokerClientFactory;
use crate::persistence::init_test_database;
use crate::persistence::DbPool;

const TEST_KEY: &str = "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=";

fn connection_service(pool: DbPool) -> Arc<ConnectionService> {
    let nonces = Arc::new(FixedNonceSource {
        timestamp: 1700000000,
        nonce: "n".to_string(),
    });
    let manager = Arc::new(CredentialManager::new(
        pool.clone(),
        CredentialCipher::new(TEST_KEY).unwrap(),
        reqwest::Client::new(),
        Duration::from_secs(600),
        None,
        None,
        nonces.clone(),
    ));
    let factory = Arc::new(BrokerClientFactory::new(Duration::from_secs(5), None, nonces));
    Arc::new(ConnectionService::new(pool, manager, factory))
}

#[tokio::test]
async fn test_concurrent_syncs_single_broker_call() {
    let pool = init_test_database().await;
    seed_connection(&pool, "conn-1", "user-1", BrokerKind::Alpaca).await;

    let mock = Arc::new(MockBrokerClient::with_delay(
        BrokerKind::Alpaca,
        Duration::from_millis(100),
    ));
    mock.set_positions(vec![broker_position("AAPL", 10.0, 100.0, 110.0)])
        .await;
    let provider = Arc::new(MockClientProvider::new(mock.clone()));
    let engine = Arc::new(PositionSyncEngine::new(
        pool.clone(),
        connection_service(pool.clone()),
        provider,
    ));

    let first = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.sync_connection("conn-1").await })
    };
    // Give the first sync time to take the lock
    tokio::time::sleep(Duration::from_millis(20)).await;
    let second = engine.sync_connection("conn-1").await.unwrap();

    let first = first.await.unwrap().unwrap();
    assert_eq!(first, SyncOutcome::Completed { position_count: 1 });
    assert_eq!(second, SyncOutcome::Skipped);
    // Only one call performed broker I/O
    assert_eq!(mock.list_position_calls.load(Ordering::SeqCst), 1);

    // The final cache matches the single consistent broker response
    let cached = engine.positions("user-1", "conn-1").await.unwrap();
    assert_eq!(cached.len(), 1);
    assert_eq!(cached[0].symbol, "AAPL");
}

#[tokio::test]
async fn test_syncs_on_distinct_connections_run_independently() {
    let pool = init_test_database().await;
    seed_connection(&pool, "conn-1", "user-1", BrokerKind::Alpaca).await;
    seed_connection(&pool, "conn-2", "user-1", BrokerKind::InteractiveBrokers).await;

    let first_client = Arc::new(MockBrokerClient::with_delay(
        BrokerKind::Alpaca,
        Duration::from_millis(50),
    ));
    let second_client = Arc::new(MockBrokerClient::with_delay(
        BrokerKind::InteractiveBrokers,
        Duration::from_millis(50),
    ));
    first_client
        .set_positions(vec![broker_position("AAPL", 1.0, 100.0, 100.0)])
        .await;
    second_client
        .set_positions(vec![broker_position("IBM", 2.0, 140.0, 140.0)])
        .await;

    let provider = Arc::new(MockClientProvider::new(first_client.clone()));
    provider.register("conn-2", second_client.clone()).await;
    let engine = Arc::new(PositionSyncEngine::new(
        pool.clone(),
        connection_service(pool.clone()),
        provider,
    ));

    let a = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.sync_connection("conn-1").await })
    };
    let b = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.sync_connection("conn-2").await })
    };

    assert_eq!(
        a.await.unwrap().unwrap(),
        SyncOutcome::Completed { position_count: 1 }
    );
    assert_eq!(
        b.await.unwrap().unwrap(),
        SyncOutcome::Completed { position_count: 1 }
    );
    assert_eq!(first_client.list_position_calls.load(Ordering::SeqCst), 1);
    assert_eq!(second_client.list_position_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_concurrent_duplicate_submission_places_once() {
    let pool = init_test_database().await;
    seed_connection(&pool, "conn-1", "user-1", BrokerKind::Alpaca).await;

    let mock = Arc::new(MockBrokerClient::with_delay(
        BrokerKind::Alpaca,
        Duration::from_millis(100),
    ));
    let provider = Arc::new(MockClientProvider::new(mock.clone()));
    let executor = Arc::new(OrderExecutor::new(pool.clone(), provider));

    let request = PlaceOrderRequest {
        connection_id: "conn-1".to_string(),
        symbol: "AAPL".to_string(),
        side: OrderSide::Buy,
        order_type: OrderType::Market,
        quantity: 10.0,
        limit_price: None,
        stop_price: None,
        time_in_force: TimeInForce::Day,
        client_order_id: Some("cid-race".to_string()),
    };

    let first = {
        let executor = executor.clone();
        let request = request.clone();
        tokio::spawn(async move { executor.place_order("user-1", request).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    let second = executor.place_order("user-1", request).await;

    // The in-flight submission wins; the racing duplicate is refused
    assert!(matches!(
        second.unwrap_err(),
        ServiceError::DuplicateOrder(_)
    ));
    let first = first.await.unwrap().unwrap();
    assert_eq!(first.client_order_id, "cid-race");
    assert_eq!(mock.place_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_distinct_orders_submit_in_parallel() {
    let pool = init_test_database().await;
    seed_connection(&pool, "conn-1", "user-1", BrokerKind::Alpaca).await;

    let mock = Arc::new(MockBrokerClient::with_delay(
        BrokerKind::Alpaca,
        Duration::from_millis(50),
    ));
    let provider = Arc::new(MockClientProvider::new(mock.clone()));
    let executor = Arc::new(OrderExecutor::new(pool.clone(), provider));

    let mut handles = Vec::new();
    for i in 0..4 {
        let executor = executor.clone();
        handles.push(tokio::spawn(async move {
            executor
                .place_order(
                    "user-1",
                    PlaceOrderRequest {
                        connection_id: "conn-1".to_string(),
                        symbol: "AAPL".to_string(),
                        side: OrderSide::Buy,
                        order_type: OrderType::Market,
                        quantity: 1.0,
                        limit_price: None,
                        stop_price: None,
                        time_in_force: TimeInForce::Day,
                        client_order_id: Some(format!("cid-par-{}", i)),
                    },
                )
                .await
        }));
    }

    for handle in handles {
        assert!(handle.await.unwrap().is_ok());
    }
    assert_eq!(mock.place_calls.load(Ordering::SeqCst), 4);
}
