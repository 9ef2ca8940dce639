mod auth;
mod config;
mod credentials;
mod domain;
mod infrastructure;
mod persistence;
mod rate_limit;
mod secrets;

use axum::{
    extract::{Extension, Path, Query, State},
    http::StatusCode,
    middleware,
    routing::{get, post},
    Json, Router,
};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::auth::{ApiKeys, RequestUser};
use crate::config::AppConfig;
use crate::credentials::cipher::CredentialCipher;
use crate::credentials::manager::CredentialManager;
use crate::credentials::oauth1::SystemNonceSource;
use crate::credentials::CredentialError;
use crate::domain::entities::broker::{BrokerKind, TradingMode};
use crate::domain::entities::order::{OrderSide, OrderType, TimeInForce};
use crate::domain::errors::BrokerError;
use crate::domain::services::connection_service::ConnectionService;
use crate::domain::services::order_executor::{ModifyOrderRequest, OrderExecutor, PlaceOrderRequest};
use crate::domain::services::position_sync::PositionSyncEngine;
use crate::domain::services::sync_scheduler::SyncScheduler;
use crate::domain::services::ServiceError;
use crate::infrastructure::broker_client_factory::BrokerClientFactory;

#[derive(Clone)]
struct AppState {
    connections: Arc<ConnectionService>,
    orders: Arc<OrderExecutor>,
    sync: Arc<PositionSyncEngine>,
    scheduler: Arc<SyncScheduler>,
}

type ApiResult = Result<Json<serde_json::Value>, (StatusCode, Json<serde_json::Value>)>;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tradelink=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Broker integration service starting...");
    info!(
        "Supported brokers: {}",
        BrokerKind::all()
            .iter()
            .map(|b| b.name())
            .collect::<Vec<_>>()
            .join(", ")
    );

    let app_config = AppConfig::from_env();

    let api_keys = ApiKeys::from_env_value(&secrets::require_secret("API_KEYS")?)
        .map_err(|e| format!("API key configuration error: {}", e))?;
    let encryption_key = secrets::require_encryption_key("CREDENTIALS_ENCRYPTION_KEY")?;
    let cipher = CredentialCipher::new(&encryption_key)
        .map_err(|e| format!("Encryption key error: {}", e))?;

    let pool = persistence::init_database(&app_config.database_url).await?;

    let http = reqwest::Client::builder()
        .timeout(app_config.http_timeout)
        .build()?;
    let nonces = Arc::new(SystemNonceSource);

    let credential_manager = Arc::new(CredentialManager::new(
        pool.clone(),
        cipher,
        http,
        app_config.oauth_state_ttl,
        app_config.alpaca_oauth.clone(),
        app_config.ibkr_oauth.clone(),
        nonces.clone(),
    ));

    let factory = Arc::new(BrokerClientFactory::new(
        app_config.http_timeout,
        app_config.ibkr_oauth.as_ref().map(|p| p.consumer_secret.clone()),
        nonces,
    ));

    let connections = Arc::new(ConnectionService::new(
        pool.clone(),
        credential_manager.clone(),
        factory,
    ));
    let orders = Arc::new(OrderExecutor::new(pool.clone(), connections.clone()));
    let sync = Arc::new(PositionSyncEngine::new(
        pool.clone(),
        connections.clone(),
        connections.clone(),
    ));
    let scheduler = Arc::new(SyncScheduler::new(
        sync.clone(),
        app_config.default_sync_interval,
    ));

    let state = AppState {
        connections,
        orders,
        sync,
        scheduler: scheduler.clone(),
    };

    let limiter = rate_limit::create_rate_limiter(rate_limit::RateLimiterConfig::default());

    let protected = Router::new()
        .route("/connections", get(list_connections).post(create_connection))
        .route("/connections/:id", get(get_connection).delete(disconnect))
        .route("/connections/:id/test", post(test_connection))
        .route("/connections/:id/balance", get(get_balance))
        .route("/connections/:id/positions", get(get_positions))
        .route("/connections/:id/sync", post(sync_now))
        .route("/connections/:id/autosync/start", post(start_autosync))
        .route("/connections/:id/autosync/stop", post(stop_autosync))
        .route("/oauth/:broker/authorize", get(oauth_authorize))
        .route("/orders", get(list_orders).post(place_order))
        .route(
            "/orders/:id",
            get(get_order).delete(cancel_order).patch(modify_order),
        )
        .route("/orders/:id/refresh", post(refresh_order))
        .route("/positions", get(aggregate_positions))
        .route("/sync", post(sync_all))
        .layer(middleware::from_fn_with_state(
            api_keys.clone(),
            auth::require_auth,
        ));

    // Callbacks are reached by browser redirect from the broker and
    // carry their own proof (code/verifier + single-use state).
    let app = Router::new()
        .route("/health", get(health_check))
        .route("/oauth/callback", get(oauth2_callback))
        .route("/oauth1/callback", get(oauth1_callback))
        .merge(protected)
        .layer(middleware::from_fn(move |req, next| {
            rate_limit::rate_limit_middleware(limiter.clone(), req, next)
        }))
        .layer(
            tower::ServiceBuilder::new()
                .layer(tower_http::trace::TraceLayer::new_for_http())
                .layer(tower_http::limit::RequestBodyLimitLayer::new(64 * 1024)),
        )
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&app_config.bind_addr).await?;
    info!("Listening on {}", app_config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(scheduler))
        .await?;

    Ok(())
}

/// Wait for ctrl-c, then cancel every auto-sync timer before the server
/// stops accepting work.
async fn shutdown_signal(scheduler: Arc<SyncScheduler>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        return;
    }
    info!("Shutdown requested; cancelling auto-sync timers");
    scheduler.shutdown().await;
}

async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

fn bad_request(message: impl Into<String>) -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({"error": message.into()})),
    )
}

/// Map service failures onto HTTP statuses. Broker-side failures keep
/// their taxonomy in the payload so the web layer can decide whether to
/// retry.
fn map_error(e: ServiceError) -> (StatusCode, Json<serde_json::Value>) {
    let status = match &e {
        ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
        ServiceError::Validation(_) => StatusCode::BAD_REQUEST,
        ServiceError::ConnectionInactive(_)
        | ServiceError::DuplicateOrder(_)
        | ServiceError::TerminalOrder { .. }
        | ServiceError::IllegalTransition { .. } => StatusCode::CONFLICT,
        ServiceError::Credential(c) if c.is_client_error() => StatusCode::BAD_REQUEST,
        ServiceError::Credential(CredentialError::Broker(_)) => StatusCode::UNAUTHORIZED,
        ServiceError::Credential(_) => StatusCode::BAD_GATEWAY,
        ServiceError::Broker(BrokerError::RateLimited { .. }) => StatusCode::TOO_MANY_REQUESTS,
        ServiceError::Broker(BrokerError::AuthenticationFailed { .. }) => StatusCode::UNAUTHORIZED,
        ServiceError::Broker(b) if b.is_retryable() => StatusCode::BAD_GATEWAY,
        ServiceError::Broker(_) => StatusCode::UNPROCESSABLE_ENTITY,
        ServiceError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let retryable = e.is_retryable();
    (
        status,
        Json(serde_json::json!({"error": e.to_string(), "retryable": retryable})),
    )
}

async fn list_connections(
    State(state): State<AppState>,
    Extension(user): Extension<RequestUser>,
) -> ApiResult {
    let connections = state.connections.list(&user.0).await.map_err(map_error)?;
    Ok(Json(serde_json::json!({"connections": connections})))
}

async fn create_connection(
    State(state): State<AppState>,
    Extension(user): Extension<RequestUser>,
    Json(payload): Json<serde_json::Value>,
) -> ApiResult {
    let broker = payload
        .get("broker")
        .and_then(|v| v.as_str())
        .and_then(BrokerKind::parse)
        .ok_or_else(|| bad_request("Missing or unknown broker field"))?;
    let paper = payload.get("paper").and_then(|v| v.as_bool()).unwrap_or(true);
    let key = payload
        .get("api_key")
        .and_then(|v| v.as_str())
        .ok_or_else(|| bad_request("Missing api_key field"))?;
    let secret = payload
        .get("api_secret")
        .and_then(|v| v.as_str())
        .ok_or_else(|| bad_request("Missing api_secret field"))?;
    let passphrase = payload.get("passphrase").and_then(|v| v.as_str());

    let connection = state
        .connections
        .connect_api_key(
            &user.0,
            broker,
            TradingMode::from_paper_flag(paper),
            key,
            secret,
            passphrase,
        )
        .await
        .map_err(map_error)?;
    Ok(Json(serde_json::json!({"connection": connection})))
}

async fn get_connection(
    State(state): State<AppState>,
    Extension(user): Extension<RequestUser>,
    Path(id): Path<String>,
) -> ApiResult {
    let connection = state.connections.get(&user.0, &id).await.map_err(map_error)?;
    Ok(Json(serde_json::json!({"connection": connection})))
}

async fn disconnect(
    State(state): State<AppState>,
    Extension(user): Extension<RequestUser>,
    Path(id): Path<String>,
) -> ApiResult {
    // A disconnected connection must not keep a live timer
    state.scheduler.stop(&id).await;
    state.connections.disconnect(&user.0, &id).await.map_err(map_error)?;
    Ok(Json(serde_json::json!({"success": true})))
}

async fn test_connection(
    State(state): State<AppState>,
    Extension(user): Extension<RequestUser>,
    Path(id): Path<String>,
) -> ApiResult {
    state
        .connections
        .test_connection(&user.0, &id)
        .await
        .map_err(map_error)?;
    Ok(Json(serde_json::json!({"success": true})))
}

async fn oauth_authorize(
    State(state): State<AppState>,
    Extension(user): Extension<RequestUser>,
    Path(broker): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> ApiResult {
    let broker = BrokerKind::parse(&broker).ok_or_else(|| bad_request("Unknown broker"))?;
    let paper = params
        .get("paper")
        .map(|v| v == "true" || v == "1")
        .unwrap_or(true);

    let start = state
        .connections
        .begin_oauth(&user.0, broker, TradingMode::from_paper_flag(paper))
        .await
        .map_err(map_error)?;
    Ok(Json(serde_json::json!({
        "redirect_url": start.redirect_url,
        "state": start.state,
    })))
}

async fn oauth2_callback(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> ApiResult {
    let code = params
        .get("code")
        .ok_or_else(|| bad_request("Missing code parameter"))?;
    let oauth_state = params
        .get("state")
        .ok_or_else(|| bad_request("Missing state parameter"))?;

    let connection = state
        .connections
        .complete_oauth2(code, oauth_state)
        .await
        .map_err(map_error)?;
    Ok(Json(serde_json::json!({"connection": connection})))
}

async fn oauth1_callback(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> ApiResult {
    let oauth_token = params
        .get("oauth_token")
        .ok_or_else(|| bad_request("Missing oauth_token parameter"))?;
    let oauth_verifier = params
        .get("oauth_verifier")
        .ok_or_else(|| bad_request("Missing oauth_verifier parameter"))?;
    let oauth_state = params
        .get("state")
        .ok_or_else(|| bad_request("Missing state parameter"))?;

    let connection = state
        .connections
        .complete_oauth1(oauth_token, oauth_verifier, oauth_state)
        .await
        .map_err(map_error)?;
    Ok(Json(serde_json::json!({"connection": connection})))
}

async fn place_order(
    State(state): State<AppState>,
    Extension(user): Extension<RequestUser>,
    Json(payload): Json<serde_json::Value>,
) -> ApiResult {
    let connection_id = payload
        .get("connection_id")
        .and_then(|v| v.as_str())
        .ok_or_else(|| bad_request("Missing connection_id field"))?;
    let symbol = payload
        .get("symbol")
        .and_then(|v| v.as_str())
        .ok_or_else(|| bad_request("Missing symbol field"))?;
    let side = match payload.get("side").and_then(|v| v.as_str()) {
        Some("buy") | Some("BUY") => OrderSide::Buy,
        Some("sell") | Some("SELL") => OrderSide::Sell,
        _ => return Err(bad_request("Invalid side. Must be 'buy' or 'sell'")),
    };
    let order_type = match payload.get("type").and_then(|v| v.as_str()) {
        Some("market") | None => OrderType::Market,
        Some("limit") => OrderType::Limit,
        Some("stop") => OrderType::Stop,
        Some("stop_limit") => OrderType::StopLimit,
        Some(other) => return Err(bad_request(format!("Invalid order type: {}", other))),
    };
    let quantity = payload
        .get("quantity")
        .and_then(|v| v.as_f64())
        .ok_or_else(|| bad_request("Missing or invalid quantity field"))?;
    let time_in_force = match payload.get("time_in_force").and_then(|v| v.as_str()) {
        Some("day") | None => TimeInForce::Day,
        Some("gtc") => TimeInForce::Gtc,
        Some("ioc") => TimeInForce::Ioc,
        Some("fok") => TimeInForce::Fok,
        Some(other) => return Err(bad_request(format!("Invalid time_in_force: {}", other))),
    };

    let request = PlaceOrderRequest {
        connection_id: connection_id.to_string(),
        symbol: symbol.to_string(),
        side,
        order_type,
        quantity,
        limit_price: payload.get("limit_price").and_then(|v| v.as_f64()),
        stop_price: payload.get("stop_price").and_then(|v| v.as_f64()),
        time_in_force,
        client_order_id: payload
            .get("client_order_id")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
    };

    let order = state
        .orders
        .place_order(&user.0, request)
        .await
        .map_err(map_error)?;
    Ok(Json(serde_json::json!({"order": order})))
}

async fn list_orders(
    State(state): State<AppState>,
    Extension(user): Extension<RequestUser>,
) -> ApiResult {
    let orders = state.orders.list_orders(&user.0).await.map_err(map_error)?;
    Ok(Json(serde_json::json!({"orders": orders})))
}

async fn get_order(
    State(state): State<AppState>,
    Extension(user): Extension<RequestUser>,
    Path(id): Path<String>,
) -> ApiResult {
    let order = state.orders.get_order(&user.0, &id).await.map_err(map_error)?;
    Ok(Json(serde_json::json!({"order": order})))
}

async fn cancel_order(
    State(state): State<AppState>,
    Extension(user): Extension<RequestUser>,
    Path(id): Path<String>,
) -> ApiResult {
    let order = state
        .orders
        .cancel_order(&user.0, &id)
        .await
        .map_err(map_error)?;
    Ok(Json(serde_json::json!({"order": order})))
}

async fn modify_order(
    State(state): State<AppState>,
    Extension(user): Extension<RequestUser>,
    Path(id): Path<String>,
    Json(payload): Json<serde_json::Value>,
) -> ApiResult {
    let changes = ModifyOrderRequest {
        quantity: payload.get("quantity").and_then(|v| v.as_f64()),
        limit_price: payload.get("limit_price").and_then(|v| v.as_f64()),
        stop_price: payload.get("stop_price").and_then(|v| v.as_f64()),
    };
    let order = state
        .orders
        .modify_order(&user.0, &id, changes)
        .await
        .map_err(map_error)?;
    Ok(Json(serde_json::json!({"order": order})))
}

/// Bring an order's local state in line with the broker: refresh by
/// broker id when one exists, otherwise recover by client order id.
async fn refresh_order(
    State(state): State<AppState>,
    Extension(user): Extension<RequestUser>,
    Path(id): Path<String>,
) -> ApiResult {
    let current = state.orders.get_order(&user.0, &id).await.map_err(map_error)?;
    let order = if current.broker_order_id.is_some() {
        state.orders.refresh_order(&user.0, &id).await
    } else {
        state.orders.recover_order(&user.0, &id).await
    }
    .map_err(map_error)?;
    Ok(Json(serde_json::json!({"order": order})))
}

async fn get_balance(
    State(state): State<AppState>,
    Extension(user): Extension<RequestUser>,
    Path(id): Path<String>,
) -> ApiResult {
    let balance = state.sync.balance(&user.0, &id).await.map_err(map_error)?;
    Ok(Json(serde_json::json!({"balance": balance})))
}

async fn get_positions(
    State(state): State<AppState>,
    Extension(user): Extension<RequestUser>,
    Path(id): Path<String>,
) -> ApiResult {
    let positions = state.sync.positions(&user.0, &id).await.map_err(map_error)?;
    Ok(Json(serde_json::json!({"positions": positions})))
}

async fn aggregate_positions(
    State(state): State<AppState>,
    Extension(user): Extension<RequestUser>,
) -> ApiResult {
    let positions = state
        .sync
        .aggregate_positions(&user.0)
        .await
        .map_err(map_error)?;
    Ok(Json(serde_json::json!({"positions": positions})))
}

/// Sync every active connection of the user in parallel
async fn sync_all(
    State(state): State<AppState>,
    Extension(user): Extension<RequestUser>,
) -> ApiResult {
    let outcomes = state
        .sync
        .clone()
        .sync_user_connections(&user.0)
        .await
        .map_err(map_error)?;
    let results: Vec<serde_json::Value> = outcomes
        .into_iter()
        .map(|(id, outcome)| match outcome {
            Ok(o) => serde_json::json!({"connection_id": id, "result": o}),
            Err(e) => serde_json::json!({"connection_id": id, "error": e.to_string()}),
        })
        .collect();
    Ok(Json(serde_json::json!({"results": results})))
}

async fn sync_now(
    State(state): State<AppState>,
    Extension(user): Extension<RequestUser>,
    Path(id): Path<String>,
) -> ApiResult {
    // Ownership check before handing the id to the engine
    state.connections.owned(&user.0, &id).await.map_err(map_error)?;
    let outcome = state.sync.sync_connection(&id).await.map_err(map_error)?;
    Ok(Json(serde_json::json!({"result": outcome})))
}

async fn start_autosync(
    State(state): State<AppState>,
    Extension(user): Extension<RequestUser>,
    Path(id): Path<String>,
    payload: Option<Json<serde_json::Value>>,
) -> ApiResult {
    state.connections.owned(&user.0, &id).await.map_err(map_error)?;
    let interval = payload
        .as_ref()
        .and_then(|p| p.get("interval_secs"))
        .and_then(|v| v.as_u64())
        .map(std::time::Duration::from_secs);

    let started = state.scheduler.start(&id, interval).await;
    if !started {
        warn!("Auto-sync start requested for {} but already running", id);
    }
    Ok(Json(serde_json::json!({"running": true, "started": started})))
}

async fn stop_autosync(
    State(state): State<AppState>,
    Extension(user): Extension<RequestUser>,
    Path(id): Path<String>,
) -> ApiResult {
    state.connections.owned(&user.0, &id).await.map_err(map_error)?;
    let stopped = state.scheduler.stop(&id).await;
    Ok(Json(serde_json::json!({"running": false, "stopped": stopped})))
}
