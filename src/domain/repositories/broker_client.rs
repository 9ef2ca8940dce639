//! Broker Client Trait
//!
//! This module defines the `BrokerClient` trait, the single contract every
//! broker adapter implements. The engines above it (order execution,
//! position sync, connection service) only ever see this interface.
//!
//! ## Rules for implementors
//! - Map unified enums to the broker's wire vocabulary and back.
//! - Normalize every broker failure into a `BrokerError` variant tagged
//!   with the originating broker; keep the original error text as detail.
//! - Never retry internally. Retry policy belongs to the caller so adapter
//!   behavior stays deterministic and testable.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::entities::balance::AccountBalance;
use crate::domain::entities::broker::BrokerKind;
use crate::domain::entities::order::{OrderSnapshot, UnifiedOrder};
use crate::domain::entities::position::Position;
use crate::domain::errors::BrokerError;

/// Common result type for broker operations
pub type BrokerResult<T> = Result<T, BrokerError>;

/// Top-of-book quote for one symbol
#[derive(Debug, Clone)]
pub struct Quote {
    pub symbol: String,
    pub bid: f64,
    pub ask: f64,
    pub last: f64,
    pub timestamp: DateTime<Utc>,
}

/// One OHLCV bar
#[derive(Debug, Clone)]
pub struct Bar {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Current market snapshot: latest quote plus the running daily bar
#[derive(Debug, Clone)]
pub struct MarketSnapshot {
    pub quote: Quote,
    pub daily_bar: Option<Bar>,
}

/// Equity curve over a lookback window
#[derive(Debug, Clone)]
pub struct PortfolioHistory {
    pub timestamps: Vec<DateTime<Utc>>,
    pub equity: Vec<f64>,
    pub profit_loss: Vec<f64>,
}

/// One contract row from an options chain
#[derive(Debug, Clone)]
pub struct OptionContract {
    pub symbol: String,
    pub underlying: String,
    pub expiration: String,
    pub strike: f64,
    pub is_call: bool,
    pub bid: f64,
    pub ask: f64,
    pub open_interest: u64,
}

/// A news headline attached to one or more symbols
#[derive(Debug, Clone)]
pub struct NewsItem {
    pub headline: String,
    pub summary: String,
    pub source: String,
    pub symbols: Vec<String>,
    pub published_at: DateTime<Utc>,
}

/// Broker client trait providing the common adapter interface
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Which broker this adapter talks to
    fn broker(&self) -> BrokerKind;

    /// Verify the stored credentials with a lightweight account call.
    /// Used by connect and test-connection; must not mutate anything.
    async fn test_auth(&self) -> BrokerResult<()>;

    /// Account balance snapshot
    async fn get_balance(&self) -> BrokerResult<AccountBalance>;

    /// Equity curve for the account over the broker's default window
    async fn get_portfolio_history(&self) -> BrokerResult<PortfolioHistory>;

    /// Submit an order. Returns the broker-reported snapshot; the broker
    /// order id in it is the handle for cancel/replace.
    async fn place_order(&self, order: &UnifiedOrder) -> BrokerResult<OrderSnapshot>;

    /// Cancel an open order by broker order id
    async fn cancel_order(&self, broker_order_id: &str) -> BrokerResult<()>;

    /// Replace an open order's quantity/prices. Returns the snapshot of
    /// the replacement order.
    async fn replace_order(
        &self,
        broker_order_id: &str,
        order: &UnifiedOrder,
    ) -> BrokerResult<OrderSnapshot>;

    /// Fetch one order by broker order id
    async fn get_order(&self, broker_order_id: &str) -> BrokerResult<OrderSnapshot>;

    /// Look an order up by the caller-assigned client order id. This is
    /// the recovery path after a submission whose response was lost.
    async fn get_order_by_client_id(&self, client_order_id: &str)
        -> BrokerResult<Option<OrderSnapshot>>;

    /// All open orders
    async fn list_open_orders(&self) -> BrokerResult<Vec<OrderSnapshot>>;

    /// All current positions
    async fn list_positions(&self) -> BrokerResult<Vec<Position>>;

    /// One position by symbol
    async fn get_position(&self, symbol: &str) -> BrokerResult<Position>;

    /// Close a position (market order for the full quantity). Returns the
    /// snapshot of the closing order.
    async fn close_position(&self, symbol: &str) -> BrokerResult<OrderSnapshot>;

    /// Latest quote for a symbol
    async fn get_quote(&self, symbol: &str) -> BrokerResult<Quote>;

    /// Market snapshot for a symbol
    async fn get_snapshot(&self, symbol: &str) -> BrokerResult<MarketSnapshot>;

    /// Historical bars
    async fn get_bars(&self, symbol: &str, timeframe: &str, limit: u32) -> BrokerResult<Vec<Bar>>;

    /// Options chain for an underlying. Brokers without options support
    /// return an empty chain.
    async fn get_options_chain(&self, _underlying: &str) -> BrokerResult<Vec<OptionContract>> {
        Ok(Vec::new())
    }

    /// News for a symbol. Default: none.
    async fn get_news(&self, _symbol: &str, _limit: u32) -> BrokerResult<Vec<NewsItem>> {
        Ok(Vec::new())
    }
}
