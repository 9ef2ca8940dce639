//! Order execution engine
//!
//! Owns the local order state machine and the idempotency guarantee. The
//! local row is inserted in status `new` before any broker I/O, so a
//! crash between insert and submission leaves a recoverable record, and
//! a duplicate client order id can never produce two broker-side orders.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::{capabilities, ClientProvider, ServiceError};
use crate::domain::entities::order::{
    OrderSide, OrderSnapshot, OrderStatus, OrderType, TimeInForce, UnifiedOrder,
};
use crate::persistence::models::{ConnectionRecord, OrderRecord};
use crate::persistence::repository::{ConnectionRepository, OrderRepository};
use crate::persistence::DbPool;

/// Inbound order parameters, before validation
#[derive(Debug, Clone)]
pub struct PlaceOrderRequest {
    pub connection_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: f64,
    pub limit_price: Option<f64>,
    pub stop_price: Option<f64>,
    pub time_in_force: TimeInForce,
    /// Caller-supplied idempotency key; generated when absent
    pub client_order_id: Option<String>,
}

/// Replacement parameters for an open order
#[derive(Debug, Clone)]
pub struct ModifyOrderRequest {
    pub quantity: Option<f64>,
    pub limit_price: Option<f64>,
    pub stop_price: Option<f64>,
}

pub struct OrderExecutor {
    orders: OrderRepository,
    connections: ConnectionRepository,
    provider: Arc<dyn ClientProvider>,
    /// (user id, client order id) pairs currently being submitted.
    /// Serializes duplicate submissions; distinct orders run in
    /// parallel.
    in_flight: Mutex<HashSet<(String, String)>>,
}

impl OrderExecutor {
    pub fn new(pool: DbPool, provider: Arc<dyn ClientProvider>) -> Self {
        Self {
            orders: OrderRepository::new(pool.clone()),
            connections: ConnectionRepository::new(pool),
            provider,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Place an order. Idempotent on (user, client order id): a repeat
    /// call returns the existing local record without touching the
    /// broker; a concurrent repeat is refused.
    pub async fn place_order(
        &self,
        user_id: &str,
        request: PlaceOrderRequest,
    ) -> Result<OrderRecord, ServiceError> {
        let client_order_id = request
            .client_order_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let key = (user_id.to_string(), client_order_id.clone());
        {
            let mut in_flight = self.in_flight.lock().await;
            if !in_flight.insert(key.clone()) {
                return Err(ServiceError::DuplicateOrder(client_order_id));
            }
        }

        let result = self.place_order_inner(user_id, request, &client_order_id).await;
        self.in_flight.lock().await.remove(&key);
        result
    }

    async fn place_order_inner(
        &self,
        user_id: &str,
        request: PlaceOrderRequest,
        client_order_id: &str,
    ) -> Result<OrderRecord, ServiceError> {
        // Idempotency short-circuit: a previous submission with this id
        // already owns the broker side.
        if let Some(existing) = self.orders.get_by_client_order_id(client_order_id).await? {
            if existing.user_id != user_id {
                return Err(ServiceError::NotFound(format!("order {}", client_order_id)));
            }
            info!(
                "Duplicate submission for client order {} short-circuited",
                client_order_id
            );
            return Ok(existing);
        }

        let connection = self.owned_connection(user_id, &request.connection_id).await?;
        let broker = connection
            .broker_kind()
            .ok_or_else(|| ServiceError::Validation("corrupt connection record".to_string()))?;

        let order = UnifiedOrder::new(
            client_order_id.to_string(),
            request.symbol.clone(),
            request.side,
            request.order_type,
            request.quantity,
            request.limit_price,
            request.stop_price,
            request.time_in_force,
        )
        .map_err(ServiceError::Validation)?;
        capabilities::validate_order(broker, &order).map_err(ServiceError::Validation)?;

        // Durable local record before any network call
        let record = self.insert_new(user_id, &connection, &order).await?;
        self.transition(&record, OrderStatus::Pending, None, 0.0, None)
            .await?;

        let client = self.provider.client_for(&connection).await?;
        match client.place_order(&order).await {
            Ok(snapshot) => {
                self.apply_snapshot(&record.id, OrderStatus::Pending, &snapshot)
                    .await?;
                self.require(&record.id).await
            }
            Err(e) => {
                self.orders.set_error(&record.id, &e.to_string()).await?;
                if e.is_retryable() {
                    // Outcome unknown: leave the order pending so
                    // recover_order can query the broker by client id
                    // instead of double-submitting.
                    warn!(
                        "Submission of {} failed transiently: {}; order left pending",
                        client_order_id, e
                    );
                } else {
                    let current = self.require(&record.id).await?;
                    let status = current.order_status().unwrap_or(OrderStatus::Pending);
                    if status.can_transition_to(OrderStatus::Rejected) {
                        self.transition(&current, OrderStatus::Rejected, None, 0.0, None)
                            .await?;
                    }
                    if e.is_auth_failure() {
                        self.connections.set_active(&connection.id, false).await?;
                        self.connections
                            .record_error(&connection.id, &e.to_string())
                            .await?;
                    }
                }
                Err(e.into())
            }
        }
    }

    /// Cancel an order. Known-terminal orders are refused locally
    /// without a broker round-trip and are never moved backward.
    pub async fn cancel_order(
        &self,
        user_id: &str,
        order_id: &str,
    ) -> Result<OrderRecord, ServiceError> {
        let record = self.owned_order(user_id, order_id).await?;
        let status = record
            .order_status()
            .ok_or_else(|| ServiceError::Validation("corrupt order record".to_string()))?;

        if status.is_terminal() {
            return Err(ServiceError::TerminalOrder {
                id: record.id.clone(),
                status,
            });
        }

        let broker_order_id = record.broker_order_id.clone().ok_or_else(|| {
            ServiceError::Validation(
                "order has no broker id yet; recover it before cancelling".to_string(),
            )
        })?;

        let connection = self.owned_connection(user_id, &record.connection_id).await?;
        let client = self.provider.client_for(&connection).await?;
        client.cancel_order(&broker_order_id).await?;

        self.transition(&record, OrderStatus::Cancelled, None, record.filled_quantity, None)
            .await?;
        info!("Cancelled order {} ({})", record.id, broker_order_id);
        self.require(&record.id).await
    }

    /// Replace an open order. The replacement gets its own client order
    /// id and record; the original is marked `replaced`.
    pub async fn modify_order(
        &self,
        user_id: &str,
        order_id: &str,
        changes: ModifyOrderRequest,
    ) -> Result<OrderRecord, ServiceError> {
        let record = self.owned_order(user_id, order_id).await?;
        let status = record
            .order_status()
            .ok_or_else(|| ServiceError::Validation("corrupt order record".to_string()))?;
        if status.is_terminal() {
            return Err(ServiceError::TerminalOrder {
                id: record.id.clone(),
                status,
            });
        }
        let broker_order_id = record.broker_order_id.clone().ok_or_else(|| {
            ServiceError::Validation("order has no broker id yet; nothing to replace".to_string())
        })?;

        let connection = self.owned_connection(user_id, &record.connection_id).await?;
        let broker = connection
            .broker_kind()
            .ok_or_else(|| ServiceError::Validation("corrupt connection record".to_string()))?;

        let side = parse_side(&record.side)?;
        let order_type = parse_order_type(&record.order_type)?;
        let time_in_force = parse_tif(&record.time_in_force)?;
        let replacement = UnifiedOrder::new(
            uuid::Uuid::new_v4().to_string(),
            record.symbol.clone(),
            side,
            order_type,
            changes.quantity.unwrap_or(record.quantity),
            changes.limit_price.or(record.limit_price),
            changes.stop_price.or(record.stop_price),
            time_in_force,
        )
        .map_err(ServiceError::Validation)?;
        capabilities::validate_order(broker, &replacement).map_err(ServiceError::Validation)?;

        let client = self.provider.client_for(&connection).await?;
        let snapshot = client.replace_order(&broker_order_id, &replacement).await?;

        // The broker accepted the replacement; record it, then retire
        // the original.
        let new_record = self
            .insert_new(user_id, &connection, &replacement)
            .await?;
        self.transition(&new_record, OrderStatus::Pending, None, 0.0, None)
            .await?;
        self.apply_snapshot(&new_record.id, OrderStatus::Pending, &snapshot)
            .await?;
        self.transition(&record, OrderStatus::Replaced, None, record.filled_quantity, None)
            .await?;

        info!(
            "Replaced order {} with {} ({})",
            record.id, new_record.id, snapshot.broker_order_id
        );
        self.require(&new_record.id).await
    }

    /// Re-query the broker for an order whose submission outcome was
    /// lost (crash or transient failure between insert and response).
    /// If the broker knows the client order id, its state is adopted;
    /// otherwise the submission never happened and the order is closed
    /// out as rejected.
    pub async fn recover_order(
        &self,
        user_id: &str,
        order_id: &str,
    ) -> Result<OrderRecord, ServiceError> {
        let record = self.owned_order(user_id, order_id).await?;
        let status = record
            .order_status()
            .ok_or_else(|| ServiceError::Validation("corrupt order record".to_string()))?;
        if status.is_terminal() {
            return Ok(record);
        }

        let connection = self.owned_connection(user_id, &record.connection_id).await?;
        let client = self.provider.client_for(&connection).await?;

        match client.get_order_by_client_id(&record.client_order_id).await? {
            Some(snapshot) => {
                self.apply_snapshot(&record.id, status, &snapshot).await?;
            }
            None => {
                info!(
                    "Broker has no order for client id {}; marking rejected",
                    record.client_order_id
                );
                if status.can_transition_to(OrderStatus::Rejected) {
                    self.transition(&record, OrderStatus::Rejected, None, record.filled_quantity, None)
                        .await?;
                }
            }
        }
        self.require(&record.id).await
    }

    /// Refresh an order's status from the broker (the broker is
    /// authoritative; the local record is the audit trail).
    pub async fn refresh_order(
        &self,
        user_id: &str,
        order_id: &str,
    ) -> Result<OrderRecord, ServiceError> {
        let record = self.owned_order(user_id, order_id).await?;
        let status = record
            .order_status()
            .ok_or_else(|| ServiceError::Validation("corrupt order record".to_string()))?;
        if status.is_terminal() {
            return Ok(record);
        }
        let broker_order_id = match &record.broker_order_id {
            Some(id) => id.clone(),
            None => return Ok(record),
        };

        let connection = self.owned_connection(user_id, &record.connection_id).await?;
        let client = self.provider.client_for(&connection).await?;
        let snapshot = client.get_order(&broker_order_id).await?;
        self.apply_snapshot(&record.id, status, &snapshot).await?;
        self.require(&record.id).await
    }

    pub async fn get_order(
        &self,
        user_id: &str,
        order_id: &str,
    ) -> Result<OrderRecord, ServiceError> {
        self.owned_order(user_id, order_id).await
    }

    pub async fn list_orders(&self, user_id: &str) -> Result<Vec<OrderRecord>, ServiceError> {
        Ok(self.orders.list_by_user(user_id).await?)
    }

    /// Apply a broker snapshot under the state machine: illegal
    /// transitions (including anything out of a terminal state) are
    /// refused and the local record is left untouched.
    async fn apply_snapshot(
        &self,
        order_id: &str,
        current: OrderStatus,
        snapshot: &OrderSnapshot,
    ) -> Result<(), ServiceError> {
        let record = self.require(order_id).await?;
        let from = record.order_status().unwrap_or(current);
        if !from.can_transition_to(snapshot.status) {
            return Err(ServiceError::IllegalTransition {
                from,
                to: snapshot.status,
            });
        }
        self.orders
            .apply_update(
                order_id,
                snapshot.status.as_str(),
                Some(&snapshot.broker_order_id),
                snapshot.filled_quantity,
                snapshot.avg_fill_price,
            )
            .await?;
        Ok(())
    }

    async fn transition(
        &self,
        record: &OrderRecord,
        next: OrderStatus,
        broker_order_id: Option<&str>,
        filled_quantity: f64,
        avg_fill_price: Option<f64>,
    ) -> Result<(), ServiceError> {
        let from = record
            .order_status()
            .ok_or_else(|| ServiceError::Validation("corrupt order record".to_string()))?;
        if !from.can_transition_to(next) {
            return Err(ServiceError::IllegalTransition { from, to: next });
        }
        self.orders
            .apply_update(
                &record.id,
                next.as_str(),
                broker_order_id,
                filled_quantity,
                avg_fill_price,
            )
            .await?;
        Ok(())
    }

    async fn insert_new(
        &self,
        user_id: &str,
        connection: &ConnectionRecord,
        order: &UnifiedOrder,
    ) -> Result<OrderRecord, ServiceError> {
        let now = Utc::now();
        let record = OrderRecord {
            id: uuid::Uuid::new_v4().to_string(),
            connection_id: connection.id.clone(),
            user_id: user_id.to_string(),
            client_order_id: order.client_order_id.clone(),
            broker_order_id: None,
            symbol: order.symbol.clone(),
            side: match order.side {
                OrderSide::Buy => "buy",
                OrderSide::Sell => "sell",
            }
            .to_string(),
            order_type: order_type_str(order.order_type).to_string(),
            quantity: order.quantity.value(),
            limit_price: order.limit_price.map(|p| p.value()),
            stop_price: order.stop_price.map(|p| p.value()),
            time_in_force: tif_str(order.time_in_force).to_string(),
            status: OrderStatus::New.as_str().to_string(),
            filled_quantity: 0.0,
            avg_fill_price: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        };
        self.orders.insert(&record).await?;
        Ok(record)
    }

    async fn require(&self, order_id: &str) -> Result<OrderRecord, ServiceError> {
        self.orders
            .get(order_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("order {}", order_id)))
    }

    async fn owned_order(
        &self,
        user_id: &str,
        order_id: &str,
    ) -> Result<OrderRecord, ServiceError> {
        let record = self.require(order_id).await?;
        if record.user_id != user_id {
            return Err(ServiceError::NotFound(format!("order {}", order_id)));
        }
        Ok(record)
    }

    async fn owned_connection(
        &self,
        user_id: &str,
        connection_id: &str,
    ) -> Result<ConnectionRecord, ServiceError> {
        self.connections
            .get_owned(connection_id, user_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("connection {}", connection_id)))
    }
}

fn order_type_str(order_type: OrderType) -> &'static str {
    match order_type {
        OrderType::Market => "market",
        OrderType::Limit => "limit",
        OrderType::Stop => "stop",
        OrderType::StopLimit => "stop_limit",
    }
}

fn tif_str(tif: TimeInForce) -> &'static str {
    match tif {
        TimeInForce::Day => "day",
        TimeInForce::Gtc => "gtc",
        TimeInForce::Ioc => "ioc",
        TimeInForce::Fok => "fok",
    }
}

fn parse_side(side: &str) -> Result<OrderSide, ServiceError> {
    match side {
        "buy" => Ok(OrderSide::Buy),
        "sell" => Ok(OrderSide::Sell),
        _ => Err(ServiceError::Validation(format!("unknown side: {}", side))),
    }
}

fn parse_order_type(order_type: &str) -> Result<OrderType, ServiceError> {
    match order_type {
        "market" => Ok(OrderType::Market),
        "limit" => Ok(OrderType::Limit),
        "stop" => Ok(OrderType::Stop),
        "stop_limit" => Ok(OrderType::StopLimit),
        _ => Err(ServiceError::Validation(format!(
            "unknown order type: {}",
            order_type
        ))),
    }
}

fn parse_tif(tif: &str) -> Result<TimeInForce, ServiceError> {
    match tif {
        "day" => Ok(TimeInForce::Day),
        "gtc" => Ok(TimeInForce::Gtc),
        "ioc" => Ok(TimeInForce::Ioc),
        "fok" => Ok(TimeInForce::Fok),
        _ => Err(ServiceError::Validation(format!(
            "unknown time in force: {}",
            tif
        ))),
    }
}
