//! Persistence Layer
//!
//! SQLite storage for broker connections, the order audit trail, the
//! position cache, and ephemeral OAuth state, with async operations via
//! sqlx.
//!
//! # Database Schema
//!
//! ## Connections Table
//! One row per (user, broker account). Credentials are stored as an
//! encrypted blob; the plaintext never reaches the database.
//!
//! ## Orders Table
//! Durable audit trail. A row is inserted in status `new` before any
//! broker call; the `client_order_id` unique index is what makes
//! submission idempotent.
//!
//! ## Positions Table
//! Derived cache, replaced wholesale on every sync. UNIQUE(connection_id,
//! symbol) so reconciliation can upsert per symbol.
//!
//! ## OAuth States Table
//! Single-use, TTL-bounded authorization state. Redemption deletes the
//! row in the same statement that reads it.

pub mod models;
pub mod repository;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::ConnectOptions;
use std::path::Path;
use std::str::FromStr;
use tracing::info;

/// Database connection pool
pub type DbPool = SqlitePool;

/// Database initialization error
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Database connection error: {0}")]
    ConnectionError(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    MigrationError(String),

    #[error("Query error: {0}")]
    QueryError(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

/// Initialize the database connection pool and run migrations
///
/// # Arguments
/// - `database_url`: Path to SQLite database file (e.g., "sqlite://data/tradelink.db")
pub async fn init_database(database_url: &str) -> Result<DbPool, DatabaseError> {
    info!("Initializing database: {}", database_url);

    // Ensure data directory exists
    if let Some(db_path) = database_url.strip_prefix("sqlite://") {
        if let Some(parent) = Path::new(db_path).parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::ConnectionError(sqlx::Error::Configuration(Box::new(e)))
            })?;
        }
    }

    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .log_statements(tracing::log::LevelFilter::Debug);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    run_migrations(&pool).await?;

    info!("✓ Database initialized successfully");

    Ok(pool)
}

/// Run database migrations
async fn run_migrations(pool: &DbPool) -> Result<(), DatabaseError> {
    info!("Running database migrations...");

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS connections (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            broker TEXT NOT NULL,
            mode TEXT NOT NULL CHECK(mode IN ('paper', 'live')),
            credentials_enc TEXT NOT NULL,
            is_active INTEGER NOT NULL DEFAULT 1,
            last_connected_at DATETIME,
            last_synced_at DATETIME,
            last_error TEXT,
            created_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
            updated_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| DatabaseError::MigrationError(format!("connections table: {}", e)))?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_connections_user ON connections(user_id)",
    )
    .execute(pool)
    .await
    .map_err(|e| DatabaseError::MigrationError(format!("connections index: {}", e)))?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS orders (
            id TEXT PRIMARY KEY,
            connection_id TEXT NOT NULL,
            user_id TEXT NOT NULL,
            client_order_id TEXT NOT NULL UNIQUE,
            broker_order_id TEXT,
            symbol TEXT NOT NULL,
            side TEXT NOT NULL CHECK(side IN ('buy', 'sell')),
            order_type TEXT NOT NULL,
            quantity REAL NOT NULL,
            limit_price REAL,
            stop_price REAL,
            time_in_force TEXT NOT NULL,
            status TEXT NOT NULL,
            filled_quantity REAL NOT NULL DEFAULT 0.0,
            avg_fill_price REAL,
            last_error TEXT,
            created_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
            updated_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| DatabaseError::MigrationError(format!("orders table: {}", e)))?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_orders_user ON orders(user_id)")
        .execute(pool)
        .await
        .map_err(|e| DatabaseError::MigrationError(format!("orders index: {}", e)))?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS positions (
            id TEXT PRIMARY KEY,
            connection_id TEXT NOT NULL,
            user_id TEXT NOT NULL,
            symbol TEXT NOT NULL,
            side TEXT NOT NULL CHECK(side IN ('long', 'short')),
            quantity REAL NOT NULL,
            avg_entry_price REAL NOT NULL,
            cost_basis REAL NOT NULL,
            market_value REAL NOT NULL,
            unrealized_pnl REAL NOT NULL,
            current_price REAL NOT NULL,
            synced_at DATETIME NOT NULL,
            UNIQUE(connection_id, symbol)
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| DatabaseError::MigrationError(format!("positions table: {}", e)))?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS oauth_states (
            state TEXT PRIMARY KEY,
            broker TEXT NOT NULL,
            user_id TEXT NOT NULL,
            is_paper INTEGER NOT NULL,
            request_token TEXT,
            request_token_secret TEXT,
            created_at DATETIME NOT NULL,
            expires_at DATETIME NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| DatabaseError::MigrationError(format!("oauth_states table: {}", e)))?;

    info!("✓ Migrations complete");
    Ok(())
}

#[cfg(test)]
pub async fn init_test_database() -> DbPool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory database");
    run_migrations(&pool).await.expect("migrations");
    pool
}
