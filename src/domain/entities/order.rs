//! Unified order model and status state machine
//!
//! Every broker speaks its own order vocabulary; this module is the one
//! the rest of the system uses. Status transitions are validated here so
//! no caller can move an order out of a terminal state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::value_objects::{price::Price, quantity::Quantity};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    Market,
    Limit,
    Stop,
    StopLimit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeInForce {
    /// Valid for the current trading day
    Day,
    /// Good till cancelled
    Gtc,
    /// Immediate or cancel
    Ioc,
    /// Fill or kill
    Fok,
}

/// Local order lifecycle.
///
/// `New → Pending → Accepted → {PartiallyFilled → Filled | Cancelled |
/// Rejected | Expired | Replaced}`. The four broker-terminal states plus
/// `Replaced` admit no further transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    New,
    Pending,
    Accepted,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
    Expired,
    Replaced,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled
                | OrderStatus::Cancelled
                | OrderStatus::Rejected
                | OrderStatus::Expired
                | OrderStatus::Replaced
        )
    }

    /// Whether moving from `self` to `next` is a legal transition.
    ///
    /// A same-status refresh (e.g. a second partial fill report) is legal;
    /// it updates fill figures without changing lifecycle position.
    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        if *self == next {
            return true;
        }
        match self {
            OrderStatus::New => matches!(next, OrderStatus::Pending | OrderStatus::Rejected),
            OrderStatus::Pending => matches!(
                next,
                OrderStatus::Accepted
                    | OrderStatus::PartiallyFilled
                    | OrderStatus::Filled
                    | OrderStatus::Cancelled
                    | OrderStatus::Rejected
                    | OrderStatus::Expired
            ),
            OrderStatus::Accepted => matches!(
                next,
                OrderStatus::PartiallyFilled
                    | OrderStatus::Filled
                    | OrderStatus::Cancelled
                    | OrderStatus::Rejected
                    | OrderStatus::Expired
                    | OrderStatus::Replaced
            ),
            OrderStatus::PartiallyFilled => matches!(
                next,
                OrderStatus::Filled
                    | OrderStatus::Cancelled
                    | OrderStatus::Expired
                    | OrderStatus::Replaced
            ),
            // Terminal states admit nothing
            OrderStatus::Filled
            | OrderStatus::Cancelled
            | OrderStatus::Rejected
            | OrderStatus::Expired
            | OrderStatus::Replaced => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::New => "new",
            OrderStatus::Pending => "pending",
            OrderStatus::Accepted => "accepted",
            OrderStatus::PartiallyFilled => "partially_filled",
            OrderStatus::Filled => "filled",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Rejected => "rejected",
            OrderStatus::Expired => "expired",
            OrderStatus::Replaced => "replaced",
        }
    }

    pub fn parse(s: &str) -> Option<OrderStatus> {
        match s {
            "new" => Some(OrderStatus::New),
            "pending" => Some(OrderStatus::Pending),
            "accepted" => Some(OrderStatus::Accepted),
            "partially_filled" => Some(OrderStatus::PartiallyFilled),
            "filled" => Some(OrderStatus::Filled),
            "cancelled" => Some(OrderStatus::Cancelled),
            "rejected" => Some(OrderStatus::Rejected),
            "expired" => Some(OrderStatus::Expired),
            "replaced" => Some(OrderStatus::Replaced),
            _ => None,
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An order as the caller submits it, before any broker call.
#[derive(Debug, Clone)]
pub struct UnifiedOrder {
    /// Caller-generated idempotency key, assigned before submission
    pub client_order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: Quantity,
    pub limit_price: Option<Price>,
    pub stop_price: Option<Price>,
    pub time_in_force: TimeInForce,
}

impl UnifiedOrder {
    pub fn new(
        client_order_id: String,
        symbol: String,
        side: OrderSide,
        order_type: OrderType,
        quantity: f64,
        limit_price: Option<f64>,
        stop_price: Option<f64>,
        time_in_force: TimeInForce,
    ) -> Result<Self, String> {
        let quantity = Quantity::new(quantity)?;
        if quantity.value() == 0.0 {
            return Err("Quantity must be positive".to_string());
        }
        let limit_price = limit_price.map(Price::new).transpose()?;
        let stop_price = stop_price.map(Price::new).transpose()?;

        match order_type {
            OrderType::Limit if limit_price.is_none() => {
                return Err("Limit orders must have a limit price".to_string());
            }
            OrderType::Stop if stop_price.is_none() => {
                return Err("Stop orders must have a stop price".to_string());
            }
            OrderType::StopLimit if limit_price.is_none() || stop_price.is_none() => {
                return Err("Stop-limit orders must have both limit and stop prices".to_string());
            }
            _ => {}
        }

        if symbol.trim().is_empty() {
            return Err("Symbol must not be empty".to_string());
        }

        Ok(UnifiedOrder {
            client_order_id,
            symbol,
            side,
            order_type,
            quantity,
            limit_price,
            stop_price,
            time_in_force,
        })
    }
}

/// Broker-reported view of an order, normalized by an adapter.
#[derive(Debug, Clone)]
pub struct OrderSnapshot {
    pub broker_order_id: String,
    pub client_order_id: Option<String>,
    pub status: OrderStatus,
    pub filled_quantity: f64,
    pub avg_fill_price: Option<f64>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}
