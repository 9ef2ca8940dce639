//! Order lifecycle specifications
//!
//! Exercises the execution engine against the programmable broker
//! double: status monotonicity, idempotent submission, terminal-state
//! protection, and the recovery path for lost submissions.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::domain::entities::broker::BrokerKind;
use crate::domain::entities::order::{OrderSide, OrderStatus, OrderType, TimeInForce};
use crate::domain::errors::BrokerError;
use crate::domain::services::order_executor::{
    ModifyOrderRequest, OrderExecutor, PlaceOrderRequest,
};
use crate::domain::services::ServiceError;
use crate::domain::test_support::{accepted_snapshot, seed_connection, MockBrokerClient, MockClientProvider};
use crate::persistence::init_test_database;
use crate::persistence::repository::{ConnectionRepository, OrderRepository};

struct Harness {
    executor: OrderExecutor,
    mock: Arc<MockBrokerClient>,
    orders: OrderRepository,
    connections: ConnectionRepository,
}

async fn harness() -> Harness {
    let pool = init_test_database().await;
    seed_connection(&pool, "conn-1", "user-1", BrokerKind::Alpaca).await;
    let mock = Arc::new(MockBrokerClient::new(BrokerKind::Alpaca));
    let provider = Arc::new(MockClientProvider::new(mock.clone()));
    Harness {
        executor: OrderExecutor::new(pool.clone(), provider),
        mock,
        orders: OrderRepository::new(pool.clone()),
        connections: ConnectionRepository::new(pool),
    }
}

fn market_buy(client_order_id: Option<&str>) -> PlaceOrderRequest {
    PlaceOrderRequest {
        connection_id: "conn-1".to_string(),
        symbol: "AAPL".to_string(),
        side: OrderSide::Buy,
        order_type: OrderType::Market,
        quantity: 10.0,
        limit_price: None,
        stop_price: None,
        time_in_force: TimeInForce::Day,
        client_order_id: client_order_id.map(|s| s.to_string()),
    }
}

#[tokio::test]
async fn test_place_order_reaches_accepted_with_broker_id() {
    let h = harness().await;
    let record = h
        .executor
        .place_order("user-1", market_buy(Some("cid-1")))
        .await
        .unwrap();

    assert_eq!(record.order_status(), Some(OrderStatus::Accepted));
    assert_eq!(record.broker_order_id.as_deref(), Some("broker-cid-1"));
    assert_eq!(record.client_order_id, "cid-1");
    assert_eq!(h.mock.place_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_duplicate_client_order_id_is_short_circuited() {
    let h = harness().await;
    let first = h
        .executor
        .place_order("user-1", market_buy(Some("cid-dup")))
        .await
        .unwrap();
    let second = h
        .executor
        .place_order("user-1", market_buy(Some("cid-dup")))
        .await
        .unwrap();

    assert_eq!(first.id, second.id);
    // The broker saw exactly one submission
    assert_eq!(h.mock.place_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_generated_client_order_ids_are_unique() {
    let h = harness().await;
    let a = h.executor.place_order("user-1", market_buy(None)).await.unwrap();
    let b = h.executor.place_order("user-1", market_buy(None)).await.unwrap();
    assert_ne!(a.client_order_id, b.client_order_id);
    assert_eq!(h.mock.place_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_cancel_filled_order_fails_locally() {
    let h = harness().await;
    h.mock
        .script_place(Ok({
            let mut snapshot = accepted_snapshot("broker-1", "cid-fill");
            snapshot.status = OrderStatus::Filled;
            snapshot.filled_quantity = 10.0;
            snapshot.avg_fill_price = Some(190.0);
            snapshot
        }))
        .await;

    let record = h
        .executor
        .place_order("user-1", market_buy(Some("cid-fill")))
        .await
        .unwrap();
    assert_eq!(record.order_status(), Some(OrderStatus::Filled));

    let err = h.executor.cancel_order("user-1", &record.id).await.unwrap_err();
    assert!(matches!(err, ServiceError::TerminalOrder { .. }));

    // Status unchanged, and the broker was never asked
    let after = h.orders.get(&record.id).await.unwrap().unwrap();
    assert_eq!(after.order_status(), Some(OrderStatus::Filled));
    assert_eq!(h.mock.cancel_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_cancel_accepted_order() {
    let h = harness().await;
    let record = h
        .executor
        .place_order("user-1", market_buy(Some("cid-c")))
        .await
        .unwrap();

    let cancelled = h.executor.cancel_order("user-1", &record.id).await.unwrap();
    assert_eq!(cancelled.order_status(), Some(OrderStatus::Cancelled));
    assert_eq!(h.mock.cancel_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_broker_rejection_is_terminal_locally() {
    let h = harness().await;
    h.mock
        .script_place(Err(BrokerError::OrderRejected {
            broker: BrokerKind::Alpaca,
            detail: "insufficient margin".to_string(),
        }))
        .await;

    let err = h
        .executor
        .place_order("user-1", market_buy(Some("cid-rej")))
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Broker(BrokerError::OrderRejected { .. })));

    let record = h
        .orders
        .get_by_client_order_id("cid-rej")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.order_status(), Some(OrderStatus::Rejected));
    assert!(record.last_error.as_deref().unwrap_or("").contains("margin"));
}

#[tokio::test]
async fn test_transient_failure_leaves_order_pending() {
    let h = harness().await;
    h.mock
        .script_place(Err(BrokerError::ConnectionError {
            broker: BrokerKind::Alpaca,
            detail: "timeout".to_string(),
        }))
        .await;

    let err = h
        .executor
        .place_order("user-1", market_buy(Some("cid-lost")))
        .await
        .unwrap_err();
    assert!(err.is_retryable());

    let record = h
        .orders
        .get_by_client_order_id("cid-lost")
        .await
        .unwrap()
        .unwrap();
    // Recoverable, not terminal: the broker may or may not have it
    assert_eq!(record.order_status(), Some(OrderStatus::Pending));
}

#[tokio::test]
async fn test_recover_adopts_broker_state() {
    let h = harness().await;
    h.mock
        .script_place(Err(BrokerError::ConnectionError {
            broker: BrokerKind::Alpaca,
            detail: "timeout".to_string(),
        }))
        .await;
    let _ = h
        .executor
        .place_order("user-1", market_buy(Some("cid-rec")))
        .await;
    let record = h
        .orders
        .get_by_client_order_id("cid-rec")
        .await
        .unwrap()
        .unwrap();

    // The submission actually reached the broker
    *h.mock.recovery_snapshot.lock().await = Some(accepted_snapshot("broker-rec", "cid-rec"));

    let recovered = h.executor.recover_order("user-1", &record.id).await.unwrap();
    assert_eq!(recovered.order_status(), Some(OrderStatus::Accepted));
    assert_eq!(recovered.broker_order_id.as_deref(), Some("broker-rec"));
    // Recovery queries; it never re-submits
    assert_eq!(h.mock.place_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_recover_unknown_submission_rejects_locally() {
    let h = harness().await;
    h.mock
        .script_place(Err(BrokerError::ConnectionError {
            broker: BrokerKind::Alpaca,
            detail: "timeout".to_string(),
        }))
        .await;
    let _ = h
        .executor
        .place_order("user-1", market_buy(Some("cid-gone")))
        .await;
    let record = h
        .orders
        .get_by_client_order_id("cid-gone")
        .await
        .unwrap()
        .unwrap();

    let recovered = h.executor.recover_order("user-1", &record.id).await.unwrap();
    assert_eq!(recovered.order_status(), Some(OrderStatus::Rejected));
}

#[tokio::test]
async fn test_modify_replaces_order() {
    let h = harness().await;
    let request = PlaceOrderRequest {
        order_type: OrderType::Limit,
        limit_price: Some(180.0),
        ..market_buy(Some("cid-mod"))
    };
    let original = h.executor.place_order("user-1", request).await.unwrap();

    let replacement = h
        .executor
        .modify_order(
            "user-1",
            &original.id,
            ModifyOrderRequest {
                quantity: Some(20.0),
                limit_price: Some(175.0),
                stop_price: None,
            },
        )
        .await
        .unwrap();

    assert_ne!(replacement.id, original.id);
    assert_ne!(replacement.client_order_id, original.client_order_id);
    assert_eq!(replacement.quantity, 20.0);
    assert_eq!(replacement.limit_price, Some(175.0));
    assert_eq!(replacement.order_status(), Some(OrderStatus::Accepted));

    let retired = h.orders.get(&original.id).await.unwrap().unwrap();
    assert_eq!(retired.order_status(), Some(OrderStatus::Replaced));
}

#[tokio::test]
async fn test_modify_terminal_order_fails() {
    let h = harness().await;
    let record = h
        .executor
        .place_order("user-1", market_buy(Some("cid-t")))
        .await
        .unwrap();
    h.executor.cancel_order("user-1", &record.id).await.unwrap();

    let err = h
        .executor
        .modify_order(
            "user-1",
            &record.id,
            ModifyOrderRequest {
                quantity: Some(5.0),
                limit_price: None,
                stop_price: None,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::TerminalOrder { .. }));
}

#[tokio::test]
async fn test_invalid_order_never_persisted() {
    let h = harness().await;
    let request = PlaceOrderRequest {
        order_type: OrderType::Limit,
        limit_price: None, // limit without a price
        ..market_buy(Some("cid-bad"))
    };
    let err = h.executor.place_order("user-1", request).await.unwrap_err();
    assert!(matches!(err, ServiceError::Validation(_)));

    assert!(h
        .orders
        .get_by_client_order_id("cid-bad")
        .await
        .unwrap()
        .is_none());
    assert_eq!(h.mock.place_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_foreign_user_cannot_touch_order() {
    let h = harness().await;
    let record = h
        .executor
        .place_order("user-1", market_buy(Some("cid-own")))
        .await
        .unwrap();

    let err = h.executor.cancel_order("user-2", &record.id).await.unwrap_err();
    assert!(matches!(err, ServiceError::NotFound(_)));
}

#[tokio::test]
async fn test_auth_failure_deactivates_connection() {
    let h = harness().await;
    h.mock
        .script_place(Err(BrokerError::AuthenticationFailed {
            broker: BrokerKind::Alpaca,
            detail: "token revoked".to_string(),
        }))
        .await;

    let err = h
        .executor
        .place_order("user-1", market_buy(Some("cid-auth")))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ServiceError::Broker(BrokerError::AuthenticationFailed { .. })
    ));

    let connection = h.connections.get("conn-1").await.unwrap().unwrap();
    assert!(!connection.is_active);
    assert!(connection.last_error.is_some());
    // Flagged, not deleted
    assert_eq!(connection.user_id, "user-1");
}
