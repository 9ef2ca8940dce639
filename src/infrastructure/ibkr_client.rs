//! # Interactive Brokers Web API Client
//!
//! Adapter for IBKR-style OAuth1 brokers. Every request carries an HMAC
//! signed `Authorization: OAuth ...` header built from the consumer
//! credentials and the connection's access token/secret. Query parameters
//! participate in the signature; JSON bodies do not, per OAuth 1.0a.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::credentials::oauth1::{authorization_header, NonceSource, SigningInput};
use crate::domain::entities::balance::AccountBalance;
use crate::domain::entities::broker::{BrokerKind, TradingMode};
use crate::domain::entities::credentials::BrokerCredentials;
use crate::domain::entities::order::{
    OrderSide, OrderSnapshot, OrderStatus, OrderType, TimeInForce, UnifiedOrder,
};
use crate::domain::entities::position::{Position, PositionSide};
use crate::domain::errors::BrokerError;
use crate::domain::repositories::broker_client::{
    Bar, BrokerClient, BrokerResult, MarketSnapshot, OptionContract, PortfolioHistory, Quote,
};

const IBKR_LIVE_BASE: &str = "https://api.ibkr.com/v1/api";
const IBKR_PAPER_BASE: &str = "https://api.ibkr.com/v1/api/paper";

const BROKER: BrokerKind = BrokerKind::InteractiveBrokers;

/// IBKR network configuration
#[derive(Clone)]
pub struct IbkrConfig {
    api_base: String,
    consumer_key: String,
    consumer_secret: String,
    token: String,
    token_secret: String,
}

impl IbkrConfig {
    pub fn new(
        credentials: &BrokerCredentials,
        consumer_secret: &str,
        mode: TradingMode,
    ) -> Result<Self, BrokerError> {
        match credentials {
            BrokerCredentials::OAuth1 {
                consumer_key,
                token,
                token_secret,
                ..
            } => Ok(Self {
                api_base: match mode {
                    TradingMode::Paper => IBKR_PAPER_BASE.to_string(),
                    TradingMode::Live => IBKR_LIVE_BASE.to_string(),
                },
                consumer_key: consumer_key.clone(),
                consumer_secret: consumer_secret.to_string(),
                token: token.clone(),
                token_secret: token_secret.clone(),
            }),
            _ => Err(BrokerError::AuthenticationFailed {
                broker: BROKER,
                detail: "Interactive Brokers requires OAuth1 credentials".to_string(),
            }),
        }
    }
}

#[derive(Debug, Serialize)]
struct IbkrOrderRequest {
    symbol: String,
    side: String,
    #[serde(rename = "orderType")]
    order_type: String,
    quantity: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(rename = "limitPrice")]
    limit_price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(rename = "stopPrice")]
    stop_price: Option<f64>,
    tif: String,
    #[serde(rename = "clientOrderId")]
    client_order_id: String,
}

#[derive(Debug, Deserialize)]
struct IbkrOrder {
    #[serde(rename = "orderId")]
    order_id: String,
    #[serde(rename = "clientOrderId")]
    client_order_id: Option<String>,
    status: String,
    #[serde(default)]
    #[serde(rename = "filledQuantity")]
    filled_quantity: f64,
    #[serde(default)]
    #[serde(rename = "avgFillPrice")]
    avg_fill_price: Option<f64>,
    #[serde(default)]
    #[serde(rename = "submittedAt")]
    submitted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    #[serde(rename = "updatedAt")]
    updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct IbkrAccountSummary {
    #[serde(rename = "totalCash")]
    total_cash: f64,
    #[serde(rename = "buyingPower")]
    buying_power: f64,
    #[serde(rename = "netLiquidation")]
    net_liquidation: f64,
    #[serde(default)]
    #[serde(rename = "initMargin")]
    init_margin: f64,
    #[serde(default)]
    #[serde(rename = "maintMargin")]
    maint_margin: f64,
    #[serde(default = "default_currency")]
    currency: String,
}

fn default_currency() -> String {
    "USD".to_string()
}

#[derive(Debug, Deserialize)]
struct IbkrPosition {
    symbol: String,
    position: f64,
    #[serde(rename = "avgCost")]
    avg_cost: f64,
    #[serde(rename = "marketValue")]
    market_value: f64,
    #[serde(rename = "unrealizedPnl")]
    unrealized_pnl: f64,
    #[serde(rename = "marketPrice")]
    market_price: f64,
}

#[derive(Debug, Deserialize)]
struct IbkrHistoryPoint {
    timestamp: DateTime<Utc>,
    equity: f64,
    #[serde(rename = "profitLoss")]
    profit_loss: f64,
}

#[derive(Debug, Deserialize)]
struct IbkrQuote {
    bid: f64,
    ask: f64,
    last: f64,
    timestamp: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct IbkrBar {
    timestamp: DateTime<Utc>,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
}

#[derive(Debug, Deserialize)]
struct IbkrOptionRow {
    symbol: String,
    expiration: String,
    strike: f64,
    right: String, // "C" or "P"
    bid: f64,
    ask: f64,
    #[serde(default)]
    #[serde(rename = "openInterest")]
    open_interest: u64,
}

/// IBKR client for Web API interactions
pub struct IbkrClient {
    client: Client,
    config: IbkrConfig,
    nonces: Arc<dyn NonceSource>,
}

impl IbkrClient {
    pub fn new(
        credentials: &BrokerCredentials,
        consumer_secret: &str,
        mode: TradingMode,
        timeout: Duration,
        nonces: Arc<dyn NonceSource>,
    ) -> Result<Self, BrokerError> {
        let config = IbkrConfig::new(credentials, consumer_secret, mode)?;
        let client = Client::builder().timeout(timeout).build().map_err(|e| {
            BrokerError::ConnectionError {
                broker: BROKER,
                detail: format!("failed to build HTTP client: {}", e),
            }
        })?;
        Ok(Self {
            client,
            config,
            nonces,
        })
    }

    /// Sign one request. Query parameters are included in the signature
    /// base string and appended to the URL.
    fn sign(
        &self,
        method: &str,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<String, BrokerError> {
        let nonce = self.nonces.nonce();
        authorization_header(&SigningInput {
            method,
            url,
            consumer_key: &self.config.consumer_key,
            consumer_secret: &self.config.consumer_secret,
            token: Some((&self.config.token, &self.config.token_secret)),
            extra_params: query,
            timestamp: self.nonces.timestamp(),
            nonce: &nonce,
        })
        .map_err(|e| BrokerError::AuthenticationFailed {
            broker: BROKER,
            detail: format!("request signing failed: {}", e),
        })
    }

    async fn send<T: serde::de::DeserializeOwned>(
        &self,
        method: reqwest::Method,
        path: &str,
        query: &[(&str, &str)],
        body: Option<serde_json::Value>,
    ) -> BrokerResult<T> {
        let url = format!("{}{}", self.config.api_base, path);
        let auth = self.sign(method.as_str(), &url, query)?;

        let mut request = self
            .client
            .request(method, &url)
            .header("Authorization", auth);
        if !query.is_empty() {
            request = request.query(query);
        }
        if let Some(json) = body {
            request = request.json(&json);
        }

        let response = request
            .send()
            .await
            .map_err(|e| BrokerError::from_transport(BROKER, &e))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(classify_error(status.as_u16(), &text));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| BrokerError::Unknown {
                broker: BROKER,
                detail: format!("failed to parse response: {}", e),
            })
    }

    fn convert_order(&self, order: &UnifiedOrder) -> Result<IbkrOrderRequest, BrokerError> {
        let order_type = match order.order_type {
            OrderType::Market => "MKT",
            OrderType::Limit => "LMT",
            OrderType::Stop => "STP",
            OrderType::StopLimit => {
                return Err(BrokerError::InvalidOrder {
                    broker: BROKER,
                    detail: "stop-limit orders are not supported".to_string(),
                })
            }
        };
        let tif = match order.time_in_force {
            TimeInForce::Day => "DAY",
            TimeInForce::Gtc => "GTC",
            TimeInForce::Ioc => "IOC",
            TimeInForce::Fok => {
                return Err(BrokerError::InvalidOrder {
                    broker: BROKER,
                    detail: "fill-or-kill is not supported".to_string(),
                })
            }
        };
        Ok(IbkrOrderRequest {
            symbol: order.symbol.clone(),
            side: match order.side {
                OrderSide::Buy => "BUY",
                OrderSide::Sell => "SELL",
            }
            .to_string(),
            order_type: order_type.to_string(),
            quantity: order.quantity.value(),
            limit_price: order.limit_price.map(|p| p.value()),
            stop_price: order.stop_price.map(|p| p.value()),
            tif: tif.to_string(),
            client_order_id: order.client_order_id.clone(),
        })
    }
}

/// Convert IBKR's order status vocabulary to the unified one
fn parse_order_status(status: &str) -> OrderStatus {
    match status {
        "PendingSubmit" | "PreSubmitted" => OrderStatus::Pending,
        "Submitted" => OrderStatus::Accepted,
        "PartiallyFilled" => OrderStatus::PartiallyFilled,
        "Filled" => OrderStatus::Filled,
        "Cancelled" | "ApiCancelled" => OrderStatus::Cancelled,
        "Inactive" => OrderStatus::Rejected,
        "Expired" => OrderStatus::Expired,
        "Replaced" => OrderStatus::Replaced,
        _ => OrderStatus::Accepted,
    }
}

/// Normalize an IBKR error response into the unified taxonomy
fn classify_error(status: u16, body: &str) -> BrokerError {
    let lowered = body.to_lowercase();
    if lowered.contains("insufficient funds") || lowered.contains("margin requirement") {
        return BrokerError::InsufficientFunds {
            broker: BROKER,
            detail: body.to_string(),
        };
    }
    if lowered.contains("invalid contract") || lowered.contains("unknown symbol") {
        return BrokerError::InvalidSymbol {
            broker: BROKER,
            symbol: String::new(),
        };
    }
    if lowered.contains("outside regular trading hours") || lowered.contains("market closed") {
        return BrokerError::MarketClosed { broker: BROKER };
    }
    if lowered.contains("order rejected") {
        return BrokerError::OrderRejected {
            broker: BROKER,
            detail: body.to_string(),
        };
    }
    BrokerError::from_status(BROKER, status, body)
}

fn to_snapshot(order: IbkrOrder) -> OrderSnapshot {
    OrderSnapshot {
        broker_order_id: order.order_id,
        client_order_id: order.client_order_id,
        status: parse_order_status(&order.status),
        filled_quantity: order.filled_quantity,
        avg_fill_price: order.avg_fill_price,
        submitted_at: order.submitted_at,
        updated_at: order.updated_at,
    }
}

fn to_position(position: IbkrPosition) -> Position {
    let side = if position.position < 0.0 {
        PositionSide::Short
    } else {
        PositionSide::Long
    };
    let quantity = position.position.abs();
    Position {
        symbol: position.symbol,
        side,
        quantity,
        avg_entry_price: position.avg_cost,
        cost_basis: quantity * position.avg_cost,
        market_value: position.market_value,
        unrealized_pnl: position.unrealized_pnl,
        current_price: position.market_price,
    }
}

#[async_trait]
impl BrokerClient for IbkrClient {
    fn broker(&self) -> BrokerKind {
        BROKER
    }

    async fn test_auth(&self) -> BrokerResult<()> {
        let _: IbkrAccountSummary = self
            .send(reqwest::Method::GET, "/portfolio/summary", &[], None)
            .await?;
        debug!("IBKR auth check passed");
        Ok(())
    }

    async fn get_balance(&self) -> BrokerResult<AccountBalance> {
        let summary: IbkrAccountSummary = self
            .send(reqwest::Method::GET, "/portfolio/summary", &[], None)
            .await?;
        Ok(AccountBalance {
            cash: summary.total_cash,
            buying_power: summary.buying_power,
            equity: summary.net_liquidation,
            initial_margin: summary.init_margin,
            maintenance_margin: summary.maint_margin,
            currency: summary.currency,
        })
    }

    async fn get_portfolio_history(&self) -> BrokerResult<PortfolioHistory> {
        let points: Vec<IbkrHistoryPoint> = self
            .send(reqwest::Method::GET, "/portfolio/history", &[], None)
            .await?;
        let mut history = PortfolioHistory {
            timestamps: Vec::with_capacity(points.len()),
            equity: Vec::with_capacity(points.len()),
            profit_loss: Vec::with_capacity(points.len()),
        };
        for point in points {
            history.timestamps.push(point.timestamp);
            history.equity.push(point.equity);
            history.profit_loss.push(point.profit_loss);
        }
        Ok(history)
    }

    async fn place_order(&self, order: &UnifiedOrder) -> BrokerResult<OrderSnapshot> {
        let payload = self.convert_order(order)?;
        let body = serde_json::to_value(&payload).map_err(|e| BrokerError::InvalidOrder {
            broker: BROKER,
            detail: format!("failed to serialize order: {}", e),
        })?;
        let placed: IbkrOrder = self
            .send(reqwest::Method::POST, "/orders", &[], Some(body))
            .await?;
        info!(
            "IBKR accepted order {} (client id {})",
            placed.order_id, order.client_order_id
        );
        Ok(to_snapshot(placed))
    }

    async fn cancel_order(&self, broker_order_id: &str) -> BrokerResult<()> {
        let path = format!("/orders/{}", broker_order_id);
        let _: serde_json::Value = self
            .send(reqwest::Method::DELETE, &path, &[], None)
            .await?;
        Ok(())
    }

    async fn replace_order(
        &self,
        broker_order_id: &str,
        order: &UnifiedOrder,
    ) -> BrokerResult<OrderSnapshot> {
        let payload = self.convert_order(order)?;
        let body = serde_json::to_value(&payload).map_err(|e| BrokerError::InvalidOrder {
            broker: BROKER,
            detail: format!("failed to serialize order: {}", e),
        })?;
        let path = format!("/orders/{}/replace", broker_order_id);
        let replaced: IbkrOrder = self
            .send(reqwest::Method::POST, &path, &[], Some(body))
            .await?;
        Ok(to_snapshot(replaced))
    }

    async fn get_order(&self, broker_order_id: &str) -> BrokerResult<OrderSnapshot> {
        let path = format!("/orders/{}", broker_order_id);
        let order: IbkrOrder = self.send(reqwest::Method::GET, &path, &[], None).await?;
        Ok(to_snapshot(order))
    }

    async fn get_order_by_client_id(
        &self,
        client_order_id: &str,
    ) -> BrokerResult<Option<OrderSnapshot>> {
        let orders: Vec<IbkrOrder> = self
            .send(
                reqwest::Method::GET,
                "/orders",
                &[("clientOrderId", client_order_id)],
                None,
            )
            .await?;
        Ok(orders.into_iter().next().map(to_snapshot))
    }

    async fn list_open_orders(&self) -> BrokerResult<Vec<OrderSnapshot>> {
        let orders: Vec<IbkrOrder> = self
            .send(reqwest::Method::GET, "/orders", &[("status", "open")], None)
            .await?;
        Ok(orders.into_iter().map(to_snapshot).collect())
    }

    async fn list_positions(&self) -> BrokerResult<Vec<Position>> {
        let positions: Vec<IbkrPosition> = self
            .send(reqwest::Method::GET, "/portfolio/positions", &[], None)
            .await?;
        Ok(positions.into_iter().map(to_position).collect())
    }

    async fn get_position(&self, symbol: &str) -> BrokerResult<Position> {
        let positions = self.list_positions().await?;
        positions
            .into_iter()
            .find(|p| p.symbol == symbol)
            .ok_or_else(|| BrokerError::PositionNotFound {
                broker: BROKER,
                symbol: symbol.to_string(),
            })
    }

    async fn close_position(&self, symbol: &str) -> BrokerResult<OrderSnapshot> {
        let path = format!("/portfolio/positions/{}/close", symbol);
        let result: Result<IbkrOrder, BrokerError> =
            self.send(reqwest::Method::POST, &path, &[], None).await;
        match result {
            Ok(order) => Ok(to_snapshot(order)),
            Err(BrokerError::Unknown { detail, .. }) if detail.contains("404") => {
                Err(BrokerError::PositionNotFound {
                    broker: BROKER,
                    symbol: symbol.to_string(),
                })
            }
            Err(e) => Err(e),
        }
    }

    async fn get_quote(&self, symbol: &str) -> BrokerResult<Quote> {
        let path = format!("/marketdata/{}/quote", symbol);
        let quote: IbkrQuote = self.send(reqwest::Method::GET, &path, &[], None).await?;
        Ok(Quote {
            symbol: symbol.to_string(),
            bid: quote.bid,
            ask: quote.ask,
            last: quote.last,
            timestamp: quote.timestamp,
        })
    }

    async fn get_snapshot(&self, symbol: &str) -> BrokerResult<MarketSnapshot> {
        let quote = self.get_quote(symbol).await?;
        let bars = self.get_bars(symbol, "1Day", 1).await?;
        Ok(MarketSnapshot {
            quote,
            daily_bar: bars.into_iter().next(),
        })
    }

    async fn get_bars(&self, symbol: &str, timeframe: &str, limit: u32) -> BrokerResult<Vec<Bar>> {
        let path = format!("/marketdata/{}/bars", symbol);
        let limit_string = limit.to_string();
        let bars: Vec<IbkrBar> = self
            .send(
                reqwest::Method::GET,
                &path,
                &[("timeframe", timeframe), ("limit", &limit_string)],
                None,
            )
            .await?;
        Ok(bars
            .into_iter()
            .map(|b| Bar {
                timestamp: b.timestamp,
                open: b.open,
                high: b.high,
                low: b.low,
                close: b.close,
                volume: b.volume,
            })
            .collect())
    }

    async fn get_options_chain(&self, underlying: &str) -> BrokerResult<Vec<OptionContract>> {
        let path = format!("/options/{}/chain", underlying);
        let rows: Vec<IbkrOptionRow> = self.send(reqwest::Method::GET, &path, &[], None).await?;
        Ok(rows
            .into_iter()
            .map(|row| OptionContract {
                symbol: row.symbol,
                underlying: underlying.to_string(),
                expiration: row.expiration,
                strike: row.strike,
                is_call: row.right == "C",
                bid: row.bid,
                ask: row.ask,
                open_interest: row.open_interest,
            })
            .collect())
    }
}
