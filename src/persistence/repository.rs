//! Database Repository
//!
//! Data access for connections, orders, the position cache, and OAuth
//! state. All writes that must be atomic per operation (position
//! reconciliation, state redemption) happen in a single transaction or
//! statement here.

use chrono::{DateTime, Utc};
use tracing::{debug, error};

use super::models::*;
use super::{DatabaseError, DbPool};
use crate::domain::entities::position::Position;

/// Connection repository
pub struct ConnectionRepository {
    pool: DbPool,
}

impl ConnectionRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Insert a new connection row
    pub async fn create(&self, record: &ConnectionRecord) -> Result<(), DatabaseError> {
        sqlx::query(
            r#"
            INSERT INTO connections (
                id, user_id, broker, mode, credentials_enc, is_active,
                last_connected_at, last_synced_at, last_error, created_at, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
        )
        .bind(&record.id)
        .bind(&record.user_id)
        .bind(&record.broker)
        .bind(&record.mode)
        .bind(&record.credentials_enc)
        .bind(record.is_active)
        .bind(record.last_connected_at)
        .bind(record.last_synced_at)
        .bind(&record.last_error)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to create connection: {}", e);
            DatabaseError::QueryError(format!("Failed to create connection: {}", e))
        })?;

        debug!("Created connection {} for user {}", record.id, record.user_id);
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Option<ConnectionRecord>, DatabaseError> {
        sqlx::query_as::<_, ConnectionRecord>("SELECT * FROM connections WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to get connection {}: {}", id, e);
                DatabaseError::QueryError(format!("Failed to get connection: {}", e))
            })
    }

    /// Fetch a connection only if it belongs to the given user
    pub async fn get_owned(
        &self,
        id: &str,
        user_id: &str,
    ) -> Result<Option<ConnectionRecord>, DatabaseError> {
        sqlx::query_as::<_, ConnectionRecord>(
            "SELECT * FROM connections WHERE id = ?1 AND user_id = ?2",
        )
        .bind(id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| DatabaseError::QueryError(format!("Failed to get connection: {}", e)))
    }

    pub async fn list_by_user(&self, user_id: &str) -> Result<Vec<ConnectionRecord>, DatabaseError> {
        sqlx::query_as::<_, ConnectionRecord>(
            "SELECT * FROM connections WHERE user_id = ?1 ORDER BY created_at DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| DatabaseError::QueryError(format!("Failed to list connections: {}", e)))
    }

    /// Overwrite the encrypted credential blob (token refresh, re-auth)
    pub async fn update_credentials(
        &self,
        id: &str,
        credentials_enc: &str,
    ) -> Result<(), DatabaseError> {
        let rows = sqlx::query(
            "UPDATE connections SET credentials_enc = ?1, updated_at = ?2 WHERE id = ?3",
        )
        .bind(credentials_enc)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| DatabaseError::QueryError(format!("Failed to update credentials: {}", e)))?
        .rows_affected();

        if rows == 0 {
            return Err(DatabaseError::NotFound(format!("connection {}", id)));
        }
        Ok(())
    }

    /// Flag or unflag the connection. Deactivation keeps the row so the
    /// user sees why the broker link stopped working.
    pub async fn set_active(&self, id: &str, active: bool) -> Result<(), DatabaseError> {
        sqlx::query("UPDATE connections SET is_active = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(active)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| DatabaseError::QueryError(format!("Failed to set active: {}", e)))?;
        Ok(())
    }

    /// Record a successful test/connect: clears last_error
    pub async fn record_success(&self, id: &str) -> Result<(), DatabaseError> {
        let now = Utc::now();
        sqlx::query(
            r#"
            UPDATE connections
            SET last_error = NULL, last_connected_at = ?1, updated_at = ?1
            WHERE id = ?2
            "#,
        )
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| DatabaseError::QueryError(format!("Failed to record success: {}", e)))?;
        Ok(())
    }

    /// Record a successful sync: stamps last_synced_at and clears last_error
    pub async fn record_sync_success(&self, id: &str) -> Result<(), DatabaseError> {
        let now = Utc::now();
        sqlx::query(
            r#"
            UPDATE connections
            SET last_error = NULL, last_synced_at = ?1, updated_at = ?1
            WHERE id = ?2
            "#,
        )
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| DatabaseError::QueryError(format!("Failed to record sync: {}", e)))?;
        Ok(())
    }

    /// Record a failure as the user-visible health signal
    pub async fn record_error(&self, id: &str, message: &str) -> Result<(), DatabaseError> {
        sqlx::query("UPDATE connections SET last_error = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(message)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| DatabaseError::QueryError(format!("Failed to record error: {}", e)))?;
        Ok(())
    }

    /// Delete the connection and its credentials. Returns false if the
    /// row did not exist.
    pub async fn delete(&self, id: &str) -> Result<bool, DatabaseError> {
        let rows = sqlx::query("DELETE FROM connections WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| DatabaseError::QueryError(format!("Failed to delete connection: {}", e)))?
            .rows_affected();
        Ok(rows > 0)
    }
}

/// Order repository
pub struct OrderRepository {
    pool: DbPool,
}

impl OrderRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Insert the local order row. Called before any broker I/O; the
    /// UNIQUE constraint on client_order_id is the idempotency backstop.
    pub async fn insert(&self, record: &OrderRecord) -> Result<(), DatabaseError> {
        sqlx::query(
            r#"
            INSERT INTO orders (
                id, connection_id, user_id, client_order_id, broker_order_id,
                symbol, side, order_type, quantity, limit_price, stop_price,
                time_in_force, status, filled_quantity, avg_fill_price,
                last_error, created_at, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)
            "#,
        )
        .bind(&record.id)
        .bind(&record.connection_id)
        .bind(&record.user_id)
        .bind(&record.client_order_id)
        .bind(&record.broker_order_id)
        .bind(&record.symbol)
        .bind(&record.side)
        .bind(&record.order_type)
        .bind(record.quantity)
        .bind(record.limit_price)
        .bind(record.stop_price)
        .bind(&record.time_in_force)
        .bind(&record.status)
        .bind(record.filled_quantity)
        .bind(record.avg_fill_price)
        .bind(&record.last_error)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to insert order {}: {}", record.client_order_id, e);
            DatabaseError::QueryError(format!("Failed to insert order: {}", e))
        })?;

        debug!("Inserted order {} ({})", record.id, record.client_order_id);
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Option<OrderRecord>, DatabaseError> {
        sqlx::query_as::<_, OrderRecord>("SELECT * FROM orders WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| DatabaseError::QueryError(format!("Failed to get order: {}", e)))
    }

    pub async fn get_by_client_order_id(
        &self,
        client_order_id: &str,
    ) -> Result<Option<OrderRecord>, DatabaseError> {
        sqlx::query_as::<_, OrderRecord>("SELECT * FROM orders WHERE client_order_id = ?1")
            .bind(client_order_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| DatabaseError::QueryError(format!("Failed to get order: {}", e)))
    }

    pub async fn list_by_user(&self, user_id: &str) -> Result<Vec<OrderRecord>, DatabaseError> {
        sqlx::query_as::<_, OrderRecord>(
            "SELECT * FROM orders WHERE user_id = ?1 ORDER BY created_at DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| DatabaseError::QueryError(format!("Failed to list orders: {}", e)))
    }

    pub async fn list_by_connection(
        &self,
        connection_id: &str,
    ) -> Result<Vec<OrderRecord>, DatabaseError> {
        sqlx::query_as::<_, OrderRecord>(
            "SELECT * FROM orders WHERE connection_id = ?1 ORDER BY created_at DESC",
        )
        .bind(connection_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| DatabaseError::QueryError(format!("Failed to list orders: {}", e)))
    }

    /// Apply a status change plus broker-reported fill figures in one
    /// update. The caller has already validated the transition against
    /// the state machine.
    pub async fn apply_update(
        &self,
        id: &str,
        status: &str,
        broker_order_id: Option<&str>,
        filled_quantity: f64,
        avg_fill_price: Option<f64>,
    ) -> Result<(), DatabaseError> {
        let rows = sqlx::query(
            r#"
            UPDATE orders
            SET status = ?1,
                broker_order_id = COALESCE(?2, broker_order_id),
                filled_quantity = ?3,
                avg_fill_price = COALESCE(?4, avg_fill_price),
                updated_at = ?5
            WHERE id = ?6
            "#,
        )
        .bind(status)
        .bind(broker_order_id)
        .bind(filled_quantity)
        .bind(avg_fill_price)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to update order {}: {}", id, e);
            DatabaseError::QueryError(format!("Failed to update order: {}", e))
        })?
        .rows_affected();

        if rows == 0 {
            return Err(DatabaseError::NotFound(format!("order {}", id)));
        }
        Ok(())
    }

    /// Attach an error message to the order without changing its status
    pub async fn set_error(&self, id: &str, message: &str) -> Result<(), DatabaseError> {
        sqlx::query("UPDATE orders SET last_error = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(message)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| DatabaseError::QueryError(format!("Failed to set order error: {}", e)))?;
        Ok(())
    }
}

/// Position cache repository
pub struct PositionRepository {
    pool: DbPool,
}

impl PositionRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Replace the cached positions of one connection with the broker's
    /// latest response. Upserts every reported symbol and deletes rows
    /// the broker no longer reports, in one transaction, so a failed sync
    /// never leaves a half-written cache.
    pub async fn replace_for_connection(
        &self,
        connection_id: &str,
        user_id: &str,
        positions: &[Position],
        synced_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        let mut tx = self.pool.begin().await.map_err(|e| {
            DatabaseError::QueryError(format!("Failed to begin transaction: {}", e))
        })?;

        for position in positions {
            sqlx::query(
                r#"
                INSERT INTO positions (
                    id, connection_id, user_id, symbol, side, quantity,
                    avg_entry_price, cost_basis, market_value, unrealized_pnl,
                    current_price, synced_at
                )
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                ON CONFLICT(connection_id, symbol) DO UPDATE SET
                    side = excluded.side,
                    quantity = excluded.quantity,
                    avg_entry_price = excluded.avg_entry_price,
                    cost_basis = excluded.cost_basis,
                    market_value = excluded.market_value,
                    unrealized_pnl = excluded.unrealized_pnl,
                    current_price = excluded.current_price,
                    synced_at = excluded.synced_at
                "#,
            )
            .bind(uuid::Uuid::new_v4().to_string())
            .bind(connection_id)
            .bind(user_id)
            .bind(&position.symbol)
            .bind(position.side.as_str())
            .bind(position.quantity)
            .bind(position.avg_entry_price)
            .bind(position.cost_basis)
            .bind(position.market_value)
            .bind(position.unrealized_pnl)
            .bind(position.current_price)
            .bind(synced_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                error!("Failed to upsert position {}: {}", position.symbol, e);
                DatabaseError::QueryError(format!("Failed to upsert position: {}", e))
            })?;
        }

        // Rows not stamped this round are stale: the broker stopped
        // reporting them.
        sqlx::query("DELETE FROM positions WHERE connection_id = ?1 AND synced_at < ?2")
            .bind(connection_id)
            .bind(synced_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                error!("Failed to prune stale positions: {}", e);
                DatabaseError::QueryError(format!("Failed to prune stale positions: {}", e))
            })?;

        tx.commit().await.map_err(|e| {
            DatabaseError::QueryError(format!("Failed to commit reconciliation: {}", e))
        })?;

        debug!(
            "Reconciled {} positions for connection {}",
            positions.len(),
            connection_id
        );
        Ok(())
    }

    pub async fn list_by_connection(
        &self,
        connection_id: &str,
    ) -> Result<Vec<PositionRecord>, DatabaseError> {
        sqlx::query_as::<_, PositionRecord>(
            "SELECT * FROM positions WHERE connection_id = ?1 ORDER BY symbol",
        )
        .bind(connection_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| DatabaseError::QueryError(format!("Failed to list positions: {}", e)))
    }

    pub async fn list_by_user(&self, user_id: &str) -> Result<Vec<PositionRecord>, DatabaseError> {
        sqlx::query_as::<_, PositionRecord>(
            "SELECT * FROM positions WHERE user_id = ?1 ORDER BY symbol",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| DatabaseError::QueryError(format!("Failed to list positions: {}", e)))
    }

    /// Drop the cache for a disconnected connection
    pub async fn delete_for_connection(&self, connection_id: &str) -> Result<(), DatabaseError> {
        sqlx::query("DELETE FROM positions WHERE connection_id = ?1")
            .bind(connection_id)
            .execute(&self.pool)
            .await
            .map_err(|e| DatabaseError::QueryError(format!("Failed to delete positions: {}", e)))?;
        Ok(())
    }
}

/// OAuth state repository
pub struct OAuthStateRepository {
    pool: DbPool,
}

impl OAuthStateRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, record: &OAuthStateRecord) -> Result<(), DatabaseError> {
        sqlx::query(
            r#"
            INSERT INTO oauth_states (
                state, broker, user_id, is_paper, request_token,
                request_token_secret, created_at, expires_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
        )
        .bind(&record.state)
        .bind(&record.broker)
        .bind(&record.user_id)
        .bind(record.is_paper)
        .bind(&record.request_token)
        .bind(&record.request_token_secret)
        .bind(record.created_at)
        .bind(record.expires_at)
        .execute(&self.pool)
        .await
        .map_err(|e| DatabaseError::QueryError(format!("Failed to insert oauth state: {}", e)))?;
        Ok(())
    }

    /// Redeem a state token: read and delete in one statement so a second
    /// redemption can never observe the row.
    pub async fn take(&self, state: &str) -> Result<Option<OAuthStateRecord>, DatabaseError> {
        sqlx::query_as::<_, OAuthStateRecord>(
            "DELETE FROM oauth_states WHERE state = ?1 RETURNING *",
        )
        .bind(state)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| DatabaseError::QueryError(format!("Failed to redeem oauth state: {}", e)))
    }

    /// Drop expired states. Called opportunistically from the credential
    /// manager; a state that slips past this is still rejected at
    /// redemption by its expires_at check.
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, DatabaseError> {
        let rows = sqlx::query("DELETE FROM oauth_states WHERE expires_at <= ?1")
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(|e| DatabaseError::QueryError(format!("Failed to purge oauth states: {}", e)))?
            .rows_affected();
        Ok(rows)
    }
}
