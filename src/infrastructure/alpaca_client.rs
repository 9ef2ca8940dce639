//! # Alpaca Trading API Client
//!
//! Adapter for Alpaca-style REST brokers. Trading endpoints live on the
//! paper or live API base depending on the connection's mode; market data
//! comes from the separate data host.
//!
//! ## Authentication
//!
//! Two header styles, chosen by the credential variant:
//! - API key: `APCA-API-KEY-ID` / `APCA-API-SECRET-KEY`
//! - OAuth2: `Authorization: Bearer <access token>`
//!
//! The adapter never refreshes tokens itself; the credential manager
//! hands it a fresh access token before each use.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

use crate::domain::entities::balance::AccountBalance;
use crate::domain::entities::broker::{BrokerKind, TradingMode};
use crate::domain::entities::credentials::BrokerCredentials;
use crate::domain::entities::order::{
    OrderSide, OrderSnapshot, OrderStatus, OrderType, TimeInForce, UnifiedOrder,
};
use crate::domain::entities::position::{Position, PositionSide};
use crate::domain::errors::BrokerError;
use crate::domain::repositories::broker_client::{
    Bar, BrokerClient, BrokerResult, MarketSnapshot, NewsItem, PortfolioHistory, Quote,
};

const ALPACA_LIVE_BASE: &str = "https://api.alpaca.markets";
const ALPACA_PAPER_BASE: &str = "https://paper-api.alpaca.markets";
const ALPACA_DATA_BASE: &str = "https://data.alpaca.markets";

const BROKER: BrokerKind = BrokerKind::Alpaca;

/// Auth header style for one connection
#[derive(Clone)]
enum AlpacaAuth {
    ApiKey { key: String, secret: String },
    Bearer { token: String },
}

/// Alpaca network configuration
#[derive(Clone)]
pub struct AlpacaConfig {
    api_base: String,
    data_base: String,
    auth: AlpacaAuth,
}

impl AlpacaConfig {
    pub fn new(credentials: &BrokerCredentials, mode: TradingMode) -> Result<Self, BrokerError> {
        let auth = match credentials {
            BrokerCredentials::ApiKey { key, secret, .. } => AlpacaAuth::ApiKey {
                key: key.clone(),
                secret: secret.clone(),
            },
            BrokerCredentials::OAuth2 { access_token, .. } => AlpacaAuth::Bearer {
                token: access_token.clone(),
            },
            BrokerCredentials::OAuth1 { .. } => {
                return Err(BrokerError::AuthenticationFailed {
                    broker: BROKER,
                    detail: "Alpaca does not accept OAuth1 credentials".to_string(),
                })
            }
        };
        Ok(Self {
            api_base: match mode {
                TradingMode::Paper => ALPACA_PAPER_BASE.to_string(),
                TradingMode::Live => ALPACA_LIVE_BASE.to_string(),
            },
            data_base: ALPACA_DATA_BASE.to_string(),
            auth,
        })
    }
}

/// Order payload in Alpaca's wire format. Numeric fields are strings, as
/// the API expects.
#[derive(Debug, Serialize)]
struct AlpacaOrderRequest {
    symbol: String,
    qty: String,
    side: String,
    #[serde(rename = "type")]
    order_type: String,
    time_in_force: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    limit_price: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop_price: Option<String>,
    client_order_id: String,
}

#[derive(Debug, Serialize)]
struct AlpacaReplaceRequest {
    qty: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    limit_price: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop_price: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AlpacaOrder {
    id: String,
    client_order_id: Option<String>,
    status: String,
    #[serde(default)]
    filled_qty: Option<String>,
    #[serde(default)]
    filled_avg_price: Option<String>,
    #[serde(default)]
    submitted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct AlpacaAccount {
    cash: String,
    buying_power: String,
    equity: String,
    #[serde(default)]
    initial_margin: Option<String>,
    #[serde(default)]
    maintenance_margin: Option<String>,
    #[serde(default)]
    currency: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AlpacaPosition {
    symbol: String,
    qty: String,
    side: String,
    avg_entry_price: String,
    cost_basis: String,
    market_value: String,
    unrealized_pl: String,
    current_price: String,
}

#[derive(Debug, Deserialize)]
struct AlpacaPortfolioHistory {
    timestamp: Vec<i64>,
    equity: Vec<f64>,
    profit_loss: Vec<f64>,
}

#[derive(Debug, Deserialize)]
struct AlpacaQuote {
    #[serde(rename = "bp")]
    bid_price: f64,
    #[serde(rename = "ap")]
    ask_price: f64,
    #[serde(rename = "t")]
    timestamp: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct AlpacaTrade {
    #[serde(rename = "p")]
    price: f64,
}

#[derive(Debug, Deserialize)]
struct AlpacaLatestQuoteResponse {
    quote: AlpacaQuote,
}

#[derive(Debug, Deserialize)]
struct AlpacaBar {
    #[serde(rename = "t")]
    timestamp: DateTime<Utc>,
    #[serde(rename = "o")]
    open: f64,
    #[serde(rename = "h")]
    high: f64,
    #[serde(rename = "l")]
    low: f64,
    #[serde(rename = "c")]
    close: f64,
    #[serde(rename = "v")]
    volume: f64,
}

#[derive(Debug, Deserialize)]
struct AlpacaBarsResponse {
    #[serde(default)]
    bars: Vec<AlpacaBar>,
}

#[derive(Debug, Deserialize)]
struct AlpacaSnapshotResponse {
    #[serde(rename = "latestQuote")]
    latest_quote: AlpacaQuote,
    #[serde(rename = "latestTrade")]
    latest_trade: Option<AlpacaTrade>,
    #[serde(rename = "dailyBar")]
    daily_bar: Option<AlpacaBar>,
}

#[derive(Debug, Deserialize)]
struct AlpacaNewsItem {
    headline: String,
    #[serde(default)]
    summary: String,
    #[serde(default)]
    source: String,
    #[serde(default)]
    symbols: Vec<String>,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct AlpacaNewsResponse {
    #[serde(default)]
    news: Vec<AlpacaNewsItem>,
}

/// Alpaca client for REST API interactions
pub struct AlpacaClient {
    client: Client,
    config: AlpacaConfig,
}

impl AlpacaClient {
    pub fn new(
        credentials: &BrokerCredentials,
        mode: TradingMode,
        timeout: Duration,
    ) -> Result<Self, BrokerError> {
        let config = AlpacaConfig::new(credentials, mode)?;
        let client = Client::builder().timeout(timeout).build().map_err(|e| {
            BrokerError::ConnectionError {
                broker: BROKER,
                detail: format!("failed to build HTTP client: {}", e),
            }
        })?;
        Ok(Self { client, config })
    }

    /// Point the client at explicit base URLs. Used against test
    /// doubles and self-hosted gateway deployments.
    pub fn with_base_urls(
        credentials: &BrokerCredentials,
        mode: TradingMode,
        api_base: &str,
        data_base: &str,
        timeout: Duration,
    ) -> Result<Self, BrokerError> {
        let mut client = Self::new(credentials, mode, timeout)?;
        client.config.api_base = api_base.trim_end_matches('/').to_string();
        client.config.data_base = data_base.trim_end_matches('/').to_string();
        Ok(client)
    }

    fn authed(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.auth {
            AlpacaAuth::ApiKey { key, secret } => request
                .header("APCA-API-KEY-ID", key)
                .header("APCA-API-SECRET-KEY", secret),
            AlpacaAuth::Bearer { token } => {
                request.header("Authorization", format!("Bearer {}", token))
            }
        }
    }

    async fn send<T: serde::de::DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> BrokerResult<T> {
        let response = self
            .authed(request)
            .send()
            .await
            .map_err(|e| BrokerError::from_transport(BROKER, &e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_error(status.as_u16(), &body));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| BrokerError::Unknown {
                broker: BROKER,
                detail: format!("failed to parse response: {}", e),
            })
    }

    async fn send_no_body(&self, request: reqwest::RequestBuilder) -> BrokerResult<()> {
        let response = self
            .authed(request)
            .send()
            .await
            .map_err(|e| BrokerError::from_transport(BROKER, &e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_error(status.as_u16(), &body));
        }
        Ok(())
    }

    /// Convert a unified order to Alpaca's wire format
    fn convert_order(&self, order: &UnifiedOrder) -> AlpacaOrderRequest {
        AlpacaOrderRequest {
            symbol: order.symbol.clone(),
            qty: order.quantity.value().to_string(),
            side: match order.side {
                OrderSide::Buy => "buy",
                OrderSide::Sell => "sell",
            }
            .to_string(),
            order_type: match order.order_type {
                OrderType::Market => "market",
                OrderType::Limit => "limit",
                OrderType::Stop => "stop",
                OrderType::StopLimit => "stop_limit",
            }
            .to_string(),
            time_in_force: match order.time_in_force {
                TimeInForce::Day => "day",
                TimeInForce::Gtc => "gtc",
                TimeInForce::Ioc => "ioc",
                TimeInForce::Fok => "fok",
            }
            .to_string(),
            limit_price: order.limit_price.map(|p| p.value().to_string()),
            stop_price: order.stop_price.map(|p| p.value().to_string()),
            client_order_id: order.client_order_id.clone(),
        }
    }
}

/// Convert Alpaca's order status vocabulary to the unified one
fn parse_order_status(status: &str) -> OrderStatus {
    match status {
        "new" | "accepted" | "accepted_for_bidding" | "pending_cancel" | "pending_replace" => {
            OrderStatus::Accepted
        }
        "pending_new" => OrderStatus::Pending,
        "partially_filled" => OrderStatus::PartiallyFilled,
        "filled" => OrderStatus::Filled,
        "canceled" | "cancelled" => OrderStatus::Cancelled,
        "expired" | "done_for_day" => OrderStatus::Expired,
        "rejected" => OrderStatus::Rejected,
        "replaced" => OrderStatus::Replaced,
        // Rare intermediate statuses (stopped, suspended, calculated)
        // are still open orders from our perspective
        _ => OrderStatus::Accepted,
    }
}

/// Normalize an Alpaca error response into the unified taxonomy
fn classify_error(status: u16, body: &str) -> BrokerError {
    let lowered = body.to_lowercase();
    if lowered.contains("insufficient") || lowered.contains("buying power") {
        return BrokerError::InsufficientFunds {
            broker: BROKER,
            detail: body.to_string(),
        };
    }
    if lowered.contains("market is closed") || lowered.contains("market closed") {
        return BrokerError::MarketClosed { broker: BROKER };
    }
    if lowered.contains("asset not found")
        || lowered.contains("could not find asset")
        || lowered.contains("invalid symbol")
    {
        return BrokerError::InvalidSymbol {
            broker: BROKER,
            symbol: String::new(),
        };
    }
    if status == 403 && lowered.contains("order") {
        return BrokerError::OrderRejected {
            broker: BROKER,
            detail: body.to_string(),
        };
    }
    BrokerError::from_status(BROKER, status, body)
}

fn parse_num(value: &str) -> f64 {
    value.parse::<f64>().unwrap_or(0.0)
}

fn to_snapshot(order: AlpacaOrder) -> OrderSnapshot {
    OrderSnapshot {
        broker_order_id: order.id,
        client_order_id: order.client_order_id,
        status: parse_order_status(&order.status),
        filled_quantity: order.filled_qty.as_deref().map(parse_num).unwrap_or(0.0),
        avg_fill_price: order
            .filled_avg_price
            .as_deref()
            .map(parse_num)
            .filter(|p| *p > 0.0),
        submitted_at: order.submitted_at,
        updated_at: order.updated_at,
    }
}

fn to_position(position: AlpacaPosition) -> Position {
    let side = if position.side == "short" {
        PositionSide::Short
    } else {
        PositionSide::Long
    };
    Position {
        symbol: position.symbol,
        side,
        quantity: parse_num(&position.qty).abs(),
        avg_entry_price: parse_num(&position.avg_entry_price),
        cost_basis: parse_num(&position.cost_basis),
        market_value: parse_num(&position.market_value),
        unrealized_pnl: parse_num(&position.unrealized_pl),
        current_price: parse_num(&position.current_price),
    }
}

#[async_trait]
impl BrokerClient for AlpacaClient {
    fn broker(&self) -> BrokerKind {
        BROKER
    }

    async fn test_auth(&self) -> BrokerResult<()> {
        let url = format!("{}/v2/account", self.config.api_base);
        let _: AlpacaAccount = self.send(self.client.get(&url)).await?;
        debug!("Alpaca auth check passed");
        Ok(())
    }

    async fn get_balance(&self) -> BrokerResult<AccountBalance> {
        let url = format!("{}/v2/account", self.config.api_base);
        let account: AlpacaAccount = self.send(self.client.get(&url)).await?;
        Ok(AccountBalance {
            cash: parse_num(&account.cash),
            buying_power: parse_num(&account.buying_power),
            equity: parse_num(&account.equity),
            initial_margin: account.initial_margin.as_deref().map(parse_num).unwrap_or(0.0),
            maintenance_margin: account
                .maintenance_margin
                .as_deref()
                .map(parse_num)
                .unwrap_or(0.0),
            currency: account.currency.unwrap_or_else(|| "USD".to_string()),
        })
    }

    async fn get_portfolio_history(&self) -> BrokerResult<PortfolioHistory> {
        let url = format!("{}/v2/account/portfolio/history", self.config.api_base);
        let history: AlpacaPortfolioHistory = self.send(self.client.get(&url)).await?;
        let timestamps = history
            .timestamp
            .iter()
            .filter_map(|t| Utc.timestamp_opt(*t, 0).single())
            .collect();
        Ok(PortfolioHistory {
            timestamps,
            equity: history.equity,
            profit_loss: history.profit_loss,
        })
    }

    async fn place_order(&self, order: &UnifiedOrder) -> BrokerResult<OrderSnapshot> {
        let url = format!("{}/v2/orders", self.config.api_base);
        let payload = self.convert_order(order);
        let placed: AlpacaOrder = self.send(self.client.post(&url).json(&payload)).await?;
        info!(
            "Alpaca accepted order {} (client id {})",
            placed.id, order.client_order_id
        );
        Ok(to_snapshot(placed))
    }

    async fn cancel_order(&self, broker_order_id: &str) -> BrokerResult<()> {
        let url = format!("{}/v2/orders/{}", self.config.api_base, broker_order_id);
        self.send_no_body(self.client.delete(&url)).await
    }

    async fn replace_order(
        &self,
        broker_order_id: &str,
        order: &UnifiedOrder,
    ) -> BrokerResult<OrderSnapshot> {
        let url = format!("{}/v2/orders/{}", self.config.api_base, broker_order_id);
        let payload = AlpacaReplaceRequest {
            qty: order.quantity.value().to_string(),
            limit_price: order.limit_price.map(|p| p.value().to_string()),
            stop_price: order.stop_price.map(|p| p.value().to_string()),
        };
        let replaced: AlpacaOrder = self.send(self.client.patch(&url).json(&payload)).await?;
        Ok(to_snapshot(replaced))
    }

    async fn get_order(&self, broker_order_id: &str) -> BrokerResult<OrderSnapshot> {
        let url = format!("{}/v2/orders/{}", self.config.api_base, broker_order_id);
        let order: AlpacaOrder = self.send(self.client.get(&url)).await?;
        Ok(to_snapshot(order))
    }

    async fn get_order_by_client_id(
        &self,
        client_order_id: &str,
    ) -> BrokerResult<Option<OrderSnapshot>> {
        let url = format!(
            "{}/v2/orders:by_client_order_id",
            self.config.api_base
        );
        let result: Result<AlpacaOrder, BrokerError> = self
            .send(
                self.client
                    .get(&url)
                    .query(&[("client_order_id", client_order_id)]),
            )
            .await;
        match result {
            Ok(order) => Ok(Some(to_snapshot(order))),
            Err(BrokerError::Unknown { detail, .. }) if detail.contains("404") => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn list_open_orders(&self) -> BrokerResult<Vec<OrderSnapshot>> {
        let url = format!("{}/v2/orders", self.config.api_base);
        let orders: Vec<AlpacaOrder> = self
            .send(self.client.get(&url).query(&[("status", "open")]))
            .await?;
        Ok(orders.into_iter().map(to_snapshot).collect())
    }

    async fn list_positions(&self) -> BrokerResult<Vec<Position>> {
        let url = format!("{}/v2/positions", self.config.api_base);
        let positions: Vec<AlpacaPosition> = self.send(self.client.get(&url)).await?;
        Ok(positions.into_iter().map(to_position).collect())
    }

    async fn get_position(&self, symbol: &str) -> BrokerResult<Position> {
        let url = format!("{}/v2/positions/{}", self.config.api_base, symbol);
        let result: Result<AlpacaPosition, BrokerError> = self.send(self.client.get(&url)).await;
        match result {
            Ok(position) => Ok(to_position(position)),
            Err(BrokerError::Unknown { detail, .. }) if detail.contains("404") => {
                Err(BrokerError::PositionNotFound {
                    broker: BROKER,
                    symbol: symbol.to_string(),
                })
            }
            Err(e) => Err(e),
        }
    }

    async fn close_position(&self, symbol: &str) -> BrokerResult<OrderSnapshot> {
        let url = format!("{}/v2/positions/{}", self.config.api_base, symbol);
        let result: Result<AlpacaOrder, BrokerError> = self.send(self.client.delete(&url)).await;
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
        let url = format!(
            "{}/v2/stocks/{}/quotes/latest",
            self.config.data_base, symbol
        );
        let response: AlpacaLatestQuoteResponse = self.send(self.client.get(&url)).await?;
        Ok(Quote {
            symbol: symbol.to_string(),
            bid: response.quote.bid_price,
            ask: response.quote.ask_price,
            last: (response.quote.bid_price + response.quote.ask_price) / 2.0,
            timestamp: response.quote.timestamp,
        })
    }

    async fn get_snapshot(&self, symbol: &str) -> BrokerResult<MarketSnapshot> {
        let url = format!("{}/v2/stocks/{}/snapshot", self.config.data_base, symbol);
        let snapshot: AlpacaSnapshotResponse = self.send(self.client.get(&url)).await?;
        let last = snapshot
            .latest_trade
            .map(|t| t.price)
            .unwrap_or((snapshot.latest_quote.bid_price + snapshot.latest_quote.ask_price) / 2.0);
        Ok(MarketSnapshot {
            quote: Quote {
                symbol: symbol.to_string(),
                bid: snapshot.latest_quote.bid_price,
                ask: snapshot.latest_quote.ask_price,
                last,
                timestamp: snapshot.latest_quote.timestamp,
            },
            daily_bar: snapshot.daily_bar.map(|b| Bar {
                timestamp: b.timestamp,
                open: b.open,
                high: b.high,
                low: b.low,
                close: b.close,
                volume: b.volume,
            }),
        })
    }

    async fn get_bars(&self, symbol: &str, timeframe: &str, limit: u32) -> BrokerResult<Vec<Bar>> {
        let url = format!("{}/v2/stocks/{}/bars", self.config.data_base, symbol);
        let response: AlpacaBarsResponse = self
            .send(self.client.get(&url).query(&[
                ("timeframe", timeframe),
                ("limit", &limit.to_string()),
            ]))
            .await?;
        Ok(response
            .bars
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

    async fn get_news(&self, symbol: &str, limit: u32) -> BrokerResult<Vec<NewsItem>> {
        let url = format!("{}/v1beta1/news", self.config.data_base);
        let response: AlpacaNewsResponse = self
            .send(
                self.client
                    .get(&url)
                    .query(&[("symbols", symbol), ("limit", &limit.to_string())]),
            )
            .await?;
        Ok(response
            .news
            .into_iter()
            .map(|n| NewsItem {
                headline: n.headline,
                summary: n.summary,
                source: n.source,
                symbols: n.symbols,
                published_at: n.created_at,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::value_objects::{price::Price, quantity::Quantity};

    fn credentials() -> BrokerCredentials {
        BrokerCredentials::ApiKey {
            key: "key".to_string(),
            secret: "secret".to_string(),
            passphrase: None,
        }
    }

    fn client() -> AlpacaClient {
        AlpacaClient::new(&credentials(), TradingMode::Paper, Duration::from_secs(5)).unwrap()
    }

    fn limit_order() -> UnifiedOrder {
        UnifiedOrder {
            client_order_id: "cid-42".to_string(),
            symbol: "AAPL".to_string(),
            side: OrderSide::Buy,
            order_type: OrderType::Limit,
            quantity: Quantity::new(10.0).unwrap(),
            limit_price: Some(Price::new(185.5).unwrap()),
            stop_price: None,
            time_in_force: TimeInForce::Gtc,
        }
    }

    #[test]
    fn test_config_paper_base() {
        let config = AlpacaConfig::new(&credentials(), TradingMode::Paper).unwrap();
        assert_eq!(config.api_base, ALPACA_PAPER_BASE);
        let config = AlpacaConfig::new(&credentials(), TradingMode::Live).unwrap();
        assert_eq!(config.api_base, ALPACA_LIVE_BASE);
    }

    #[test]
    fn test_config_rejects_oauth1_credentials() {
        let creds = BrokerCredentials::OAuth1 {
            consumer_key: "ck".to_string(),
            token: "t".to_string(),
            token_secret: "ts".to_string(),
            session_token: None,
        };
        assert!(matches!(
            AlpacaConfig::new(&creds, TradingMode::Paper),
            Err(BrokerError::AuthenticationFailed { .. })
        ));
    }

    #[test]
    fn test_convert_limit_order() {
        let converted = client().convert_order(&limit_order());
        assert_eq!(converted.symbol, "AAPL");
        assert_eq!(converted.qty, "10");
        assert_eq!(converted.side, "buy");
        assert_eq!(converted.order_type, "limit");
        assert_eq!(converted.time_in_force, "gtc");
        assert_eq!(converted.limit_price.as_deref(), Some("185.5"));
        assert!(converted.stop_price.is_none());
        assert_eq!(converted.client_order_id, "cid-42");
    }

    #[test]
    fn test_parse_order_status_vocabulary() {
        assert_eq!(parse_order_status("new"), OrderStatus::Accepted);
        assert_eq!(parse_order_status("pending_new"), OrderStatus::Pending);
        assert_eq!(
            parse_order_status("partially_filled"),
            OrderStatus::PartiallyFilled
        );
        assert_eq!(parse_order_status("filled"), OrderStatus::Filled);
        assert_eq!(parse_order_status("canceled"), OrderStatus::Cancelled);
        assert_eq!(parse_order_status("expired"), OrderStatus::Expired);
        assert_eq!(parse_order_status("rejected"), OrderStatus::Rejected);
        assert_eq!(parse_order_status("replaced"), OrderStatus::Replaced);
    }

    #[test]
    fn test_classify_insufficient_funds() {
        let err = classify_error(403, r#"{"message": "insufficient buying power"}"#);
        assert!(matches!(err, BrokerError::InsufficientFunds { .. }));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_classify_rate_limit_retryable() {
        let err = classify_error(429, "too many requests");
        assert!(matches!(err, BrokerError::RateLimited { .. }));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_classify_market_closed() {
        let err = classify_error(422, r#"{"message": "market is closed"}"#);
        assert!(matches!(err, BrokerError::MarketClosed { .. }));
    }

    #[test]
    fn test_classify_auth_failure() {
        let err = classify_error(401, "unauthorized");
        assert!(err.is_auth_failure());
    }

    #[test]
    fn test_snapshot_fill_figures() {
        let order = AlpacaOrder {
            id: "broker-1".to_string(),
            client_order_id: Some("cid-1".to_string()),
            status: "partially_filled".to_string(),
            filled_qty: Some("4".to_string()),
            filled_avg_price: Some("185.2".to_string()),
            submitted_at: None,
            updated_at: None,
        };
        let snapshot = to_snapshot(order);
        assert_eq!(snapshot.status, OrderStatus::PartiallyFilled);
        assert_eq!(snapshot.filled_quantity, 4.0);
        assert_eq!(snapshot.avg_fill_price, Some(185.2));
    }

    #[test]
    fn test_position_conversion_short() {
        let position = AlpacaPosition {
            symbol: "TSLA".to_string(),
            qty: "-5".to_string(),
            side: "short".to_string(),
            avg_entry_price: "200".to_string(),
            cost_basis: "1000".to_string(),
            market_value: "-950".to_string(),
            unrealized_pl: "50".to_string(),
            current_price: "190".to_string(),
        };
        let converted = to_position(position);
        assert_eq!(converted.side, PositionSide::Short);
        assert_eq!(converted.quantity, 5.0);
        assert_eq!(converted.unrealized_pnl, 50.0);
    }
}
