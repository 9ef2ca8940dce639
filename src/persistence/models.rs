//! Database Models
//!
//! Persistent rows for connections, orders, the position cache, and OAuth
//! state. Enum-typed domain fields are stored as their string form and
//! re-parsed on the way out.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::domain::entities::broker::{BrokerKind, TradingMode};
use crate::domain::entities::connection::BrokerConnection;
use crate::domain::entities::order::OrderStatus;
use crate::domain::entities::position::{Position, PositionSide};

/// Connection record in database. `credentials_enc` is the AES-GCM
/// ciphertext produced by the credential manager.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ConnectionRecord {
    pub id: String,
    pub user_id: String,
    pub broker: String,
    pub mode: String, // "paper" or "live"
    #[serde(skip_serializing)]
    pub credentials_enc: String,
    pub is_active: bool,
    pub last_connected_at: Option<DateTime<Utc>>,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ConnectionRecord {
    pub fn broker_kind(&self) -> Option<BrokerKind> {
        BrokerKind::parse(&self.broker)
    }

    pub fn trading_mode(&self) -> TradingMode {
        if self.mode == "paper" {
            TradingMode::Paper
        } else {
            TradingMode::Live
        }
    }

    /// Domain view without the credentials blob
    pub fn to_entity(&self) -> Option<BrokerConnection> {
        Some(BrokerConnection {
            id: self.id.clone(),
            user_id: self.user_id.clone(),
            broker: self.broker_kind()?,
            mode: self.trading_mode(),
            is_active: self.is_active,
            last_connected_at: self.last_connected_at,
            last_synced_at: self.last_synced_at,
            last_error: self.last_error.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

/// Order record in database: the durable audit trail
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct OrderRecord {
    pub id: String,
    pub connection_id: String,
    pub user_id: String,
    pub client_order_id: String,
    pub broker_order_id: Option<String>,
    pub symbol: String,
    pub side: String, // "buy" or "sell"
    pub order_type: String,
    pub quantity: f64,
    pub limit_price: Option<f64>,
    pub stop_price: Option<f64>,
    pub time_in_force: String,
    pub status: String,
    pub filled_quantity: f64,
    pub avg_fill_price: Option<f64>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OrderRecord {
    pub fn order_status(&self) -> Option<OrderStatus> {
        OrderStatus::parse(&self.status)
    }
}

/// Cached position row, rebuilt on every sync
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PositionRecord {
    pub id: String,
    pub connection_id: String,
    pub user_id: String,
    pub symbol: String,
    pub side: String, // "long" or "short"
    pub quantity: f64,
    pub avg_entry_price: f64,
    pub cost_basis: f64,
    pub market_value: f64,
    pub unrealized_pnl: f64,
    pub current_price: f64,
    pub synced_at: DateTime<Utc>,
}

impl PositionRecord {
    pub fn to_entity(&self) -> Option<Position> {
        Some(Position {
            symbol: self.symbol.clone(),
            side: PositionSide::parse(&self.side)?,
            quantity: self.quantity,
            avg_entry_price: self.avg_entry_price,
            cost_basis: self.cost_basis,
            market_value: self.market_value,
            unrealized_pnl: self.unrealized_pnl,
            current_price: self.current_price,
        })
    }
}

/// Ephemeral OAuth authorization state. For OAuth1 flows the temporary
/// request token/secret pair is carried here between the two legs.
#[derive(Debug, Clone, FromRow)]
pub struct OAuthStateRecord {
    pub state: String,
    pub broker: String,
    pub user_id: String,
    pub is_paper: bool,
    pub request_token: Option<String>,
    pub request_token_secret: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl OAuthStateRecord {
    pub fn broker_kind(&self) -> Option<BrokerKind> {
        BrokerKind::parse(&self.broker)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}
