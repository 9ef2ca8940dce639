//! Shared test doubles: a programmable in-memory broker client and a
//! provider that hands it out, plus fixture helpers for connection rows.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use crate::domain::entities::balance::AccountBalance;
use crate::domain::entities::broker::BrokerKind;
use crate::domain::entities::order::{OrderSnapshot, OrderStatus, UnifiedOrder};
use crate::domain::entities::position::Position;
use crate::domain::errors::BrokerError;
use crate::domain::repositories::broker_client::{
    Bar, BrokerClient, BrokerResult, MarketSnapshot, PortfolioHistory, Quote,
};
use crate::domain::services::{ClientProvider, ServiceError};
use crate::persistence::models::ConnectionRecord;
use crate::persistence::repository::ConnectionRepository;
use crate::persistence::DbPool;

/// Programmable broker double. Every queue pops one scripted result per
/// call; an empty queue falls back to a benign default.
pub struct MockBrokerClient {
    pub broker: BrokerKind,
    /// What list_positions returns
    pub positions: Mutex<Vec<Position>>,
    /// Scripted results for place_order, consumed in order
    pub place_results: Mutex<VecDeque<BrokerResult<OrderSnapshot>>>,
    /// Scripted error for the next cancel_order call
    pub cancel_error: Mutex<Option<BrokerError>>,
    /// Scripted error for the next list_positions call
    pub positions_error: Mutex<Option<BrokerError>>,
    /// Result for get_order_by_client_id
    pub recovery_snapshot: Mutex<Option<OrderSnapshot>>,
    /// Artificial latency inside broker calls, for interleaving tests
    pub call_delay: Option<Duration>,
    /// Counters observable by tests
    pub place_calls: AtomicUsize,
    pub cancel_calls: AtomicUsize,
    pub list_position_calls: AtomicUsize,
}

impl MockBrokerClient {
    pub fn new(broker: BrokerKind) -> Self {
        Self {
            broker,
            positions: Mutex::new(Vec::new()),
            place_results: Mutex::new(VecDeque::new()),
            cancel_error: Mutex::new(None),
            positions_error: Mutex::new(None),
            recovery_snapshot: Mutex::new(None),
            call_delay: None,
            place_calls: AtomicUsize::new(0),
            cancel_calls: AtomicUsize::new(0),
            list_position_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(broker: BrokerKind, delay: Duration) -> Self {
        let mut mock = Self::new(broker);
        mock.call_delay = Some(delay);
        mock
    }

    pub async fn script_place(&self, result: BrokerResult<OrderSnapshot>) {
        self.place_results.lock().await.push_back(result);
    }

    pub async fn set_positions(&self, positions: Vec<Position>) {
        *self.positions.lock().await = positions;
    }

    async fn delay(&self) {
        if let Some(d) = self.call_delay {
            tokio::time::sleep(d).await;
        }
    }
}

/// An accepted-order snapshot as a broker would report right after
/// submission.
pub fn accepted_snapshot(broker_order_id: &str, client_order_id: &str) -> OrderSnapshot {
    OrderSnapshot {
        broker_order_id: broker_order_id.to_string(),
        client_order_id: Some(client_order_id.to_string()),
        status: OrderStatus::Accepted,
        filled_quantity: 0.0,
        avg_fill_price: None,
        submitted_at: Some(Utc::now()),
        updated_at: Some(Utc::now()),
    }
}

#[async_trait]
impl BrokerClient for MockBrokerClient {
    fn broker(&self) -> BrokerKind {
        self.broker
    }

    async fn test_auth(&self) -> BrokerResult<()> {
        Ok(())
    }

    async fn get_balance(&self) -> BrokerResult<AccountBalance> {
        Ok(AccountBalance {
            cash: 10_000.0,
            buying_power: 20_000.0,
            equity: 15_000.0,
            initial_margin: 0.0,
            maintenance_margin: 0.0,
            currency: "USD".to_string(),
        })
    }

    async fn get_portfolio_history(&self) -> BrokerResult<PortfolioHistory> {
        Ok(PortfolioHistory {
            timestamps: Vec::new(),
            equity: Vec::new(),
            profit_loss: Vec::new(),
        })
    }

    async fn place_order(&self, order: &UnifiedOrder) -> BrokerResult<OrderSnapshot> {
        self.delay().await;
        self.place_calls.fetch_add(1, Ordering::SeqCst);
        match self.place_results.lock().await.pop_front() {
            Some(result) => result,
            None => Ok(accepted_snapshot(
                &format!("broker-{}", order.client_order_id),
                &order.client_order_id,
            )),
        }
    }

    async fn cancel_order(&self, _broker_order_id: &str) -> BrokerResult<()> {
        self.delay().await;
        self.cancel_calls.fetch_add(1, Ordering::SeqCst);
        match self.cancel_error.lock().await.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn replace_order(
        &self,
        broker_order_id: &str,
        order: &UnifiedOrder,
    ) -> BrokerResult<OrderSnapshot> {
        self.delay().await;
        Ok(accepted_snapshot(
            &format!("{}-replacement", broker_order_id),
            &order.client_order_id,
        ))
    }

    async fn get_order(&self, broker_order_id: &str) -> BrokerResult<OrderSnapshot> {
        Ok(accepted_snapshot(broker_order_id, "unknown"))
    }

    async fn get_order_by_client_id(
        &self,
        _client_order_id: &str,
    ) -> BrokerResult<Option<OrderSnapshot>> {
        Ok(self.recovery_snapshot.lock().await.clone())
    }

    async fn list_open_orders(&self) -> BrokerResult<Vec<OrderSnapshot>> {
        Ok(Vec::new())
    }

    async fn list_positions(&self) -> BrokerResult<Vec<Position>> {
        self.delay().await;
        self.list_position_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(e) = self.positions_error.lock().await.take() {
            return Err(e);
        }
        Ok(self.positions.lock().await.clone())
    }

    async fn get_position(&self, symbol: &str) -> BrokerResult<Position> {
        self.positions
            .lock()
            .await
            .iter()
            .find(|p| p.symbol == symbol)
            .cloned()
            .ok_or_else(|| BrokerError::PositionNotFound {
                broker: self.broker,
                symbol: symbol.to_string(),
            })
    }

    async fn close_position(&self, symbol: &str) -> BrokerResult<OrderSnapshot> {
        Ok(accepted_snapshot(&format!("close-{}", symbol), "close"))
    }

    async fn get_quote(&self, symbol: &str) -> BrokerResult<Quote> {
        Ok(Quote {
            symbol: symbol.to_string(),
            bid: 99.0,
            ask: 101.0,
            last: 100.0,
            timestamp: Utc::now(),
        })
    }

    async fn get_snapshot(&self, symbol: &str) -> BrokerResult<MarketSnapshot> {
        Ok(MarketSnapshot {
            quote: self.get_quote(symbol).await?,
            daily_bar: None,
        })
    }

    async fn get_bars(
        &self,
        _symbol: &str,
        _timeframe: &str,
        _limit: u32,
    ) -> BrokerResult<Vec<Bar>> {
        Ok(Vec::new())
    }
}

/// Provider handing out one shared mock per connection id; unknown ids
/// fall back to the default mock.
pub struct MockClientProvider {
    pub default_client: Arc<MockBrokerClient>,
    pub by_connection: Mutex<std::collections::HashMap<String, Arc<MockBrokerClient>>>,
}

impl MockClientProvider {
    pub fn new(default_client: Arc<MockBrokerClient>) -> Self {
        Self {
            default_client,
            by_connection: Mutex::new(std::collections::HashMap::new()),
        }
    }

    pub async fn register(&self, connection_id: &str, client: Arc<MockBrokerClient>) {
        self.by_connection
            .lock()
            .await
            .insert(connection_id.to_string(), client);
    }
}

#[async_trait]
impl ClientProvider for MockClientProvider {
    async fn client_for(
        &self,
        record: &ConnectionRecord,
    ) -> Result<Arc<dyn BrokerClient>, ServiceError> {
        if !record.is_active {
            return Err(ServiceError::ConnectionInactive(record.id.clone()));
        }
        let clients = self.by_connection.lock().await;
        Ok(clients
            .get(&record.id)
            .cloned()
            .unwrap_or_else(|| self.default_client.clone()))
    }
}

/// Insert an active connection row for tests and return it
pub async fn seed_connection(
    pool: &DbPool,
    id: &str,
    user_id: &str,
    broker: BrokerKind,
) -> ConnectionRecord {
    let now = Utc::now();
    let record = ConnectionRecord {
        id: id.to_string(),
        user_id: user_id.to_string(),
        broker: broker.name().to_string(),
        mode: "paper".to_string(),
        credentials_enc: "sealed-under-test".to_string(),
        is_active: true,
        last_connected_at: Some(now),
        last_synced_at: None,
        last_error: None,
        created_at: now,
        updated_at: now,
    };
    ConnectionRepository::new(pool.clone())
        .create(&record)
        .await
        .expect("seed connection");
    record
}

/// Build a broker-reported position fixture
pub fn broker_position(symbol: &str, qty: f64, entry: f64, current: f64) -> Position {
    use crate::domain::entities::position::PositionSide;
    Position {
        symbol: symbol.to_string(),
        side: PositionSide::Long,
        quantity: qty,
        avg_entry_price: entry,
        cost_basis: qty * entry,
        market_value: qty * current,
        unrealized_pnl: qty * (current - entry),
        current_price: current,
    }
}
