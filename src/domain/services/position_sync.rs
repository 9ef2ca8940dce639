//! Position synchronization engine
//!
//! Pulls positions and balances from a broker and reconciles them into
//! the local cache. Reconciliation is "broker wins": every reported
//! position is upserted and anything the broker stopped reporting is
//! deleted, atomically per sync. At most one sync runs per connection at
//! a time; a concurrent request is skipped rather than interleaved.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::connection_service::ConnectionService;
use super::{ClientProvider, ServiceError};
use crate::domain::entities::balance::AccountBalance;
use crate::domain::entities::position::{Position, PositionSide};
use crate::persistence::repository::{ConnectionRepository, PositionRepository};
use crate::persistence::DbPool;

/// Result of one sync request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum SyncOutcome {
    /// Broker I/O happened and the cache was replaced
    Completed { position_count: usize },
    /// Another sync for the same connection was already running
    Skipped,
}

/// A user's holdings in one symbol summed across brokers. Short
/// positions contribute negative quantity to the net figure.
#[derive(Debug, Clone, Serialize)]
pub struct AggregatedPosition {
    pub symbol: String,
    pub net_quantity: f64,
    pub total_market_value: f64,
    pub total_unrealized_pnl: f64,
    pub connection_count: usize,
}

pub struct PositionSyncEngine {
    connections: Arc<ConnectionService>,
    provider: Arc<dyn ClientProvider>,
    positions: PositionRepository,
    connection_repo: ConnectionRepository,
    /// Per-connection sync locks. try_lock failure means a sync is in
    /// flight; the second caller is skipped, never interleaved.
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl PositionSyncEngine {
    pub fn new(
        pool: DbPool,
        connections: Arc<ConnectionService>,
        provider: Arc<dyn ClientProvider>,
    ) -> Self {
        Self {
            connections,
            provider,
            positions: PositionRepository::new(pool.clone()),
            connection_repo: ConnectionRepository::new(pool),
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Sync one connection now. Manual and scheduled calls share this
    /// path and the same per-connection lock.
    pub async fn sync_connection(&self, connection_id: &str) -> Result<SyncOutcome, ServiceError> {
        let lock = self.lock_for(connection_id).await;
        let guard = match lock.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                info!("Sync already running for connection {}; skipping", connection_id);
                return Ok(SyncOutcome::Skipped);
            }
        };

        let result = self.sync_locked(connection_id).await;
        drop(guard);
        result
    }

    async fn sync_locked(&self, connection_id: &str) -> Result<SyncOutcome, ServiceError> {
        let record = self.connections.record(connection_id).await?;
        let client = self.provider.client_for(&record).await?;

        match client.list_positions().await {
            Ok(positions) => {
                self.positions
                    .replace_for_connection(&record.id, &record.user_id, &positions, Utc::now())
                    .await?;
                self.connection_repo.record_sync_success(&record.id).await?;
                info!(
                    "Synced {} positions for connection {}",
                    positions.len(),
                    connection_id
                );
                Ok(SyncOutcome::Completed {
                    position_count: positions.len(),
                })
            }
            Err(e) => {
                warn!("Sync failed for connection {}: {}", connection_id, e);
                self.connection_repo
                    .record_error(&record.id, &e.to_string())
                    .await?;
                if e.is_auth_failure() {
                    self.connection_repo.set_active(&record.id, false).await?;
                }
                Err(e.into())
            }
        }
    }

    /// Cached positions for one connection
    pub async fn positions(
        &self,
        user_id: &str,
        connection_id: &str,
    ) -> Result<Vec<Position>, ServiceError> {
        let record = self.connections.owned(user_id, connection_id).await?;
        let rows = self.positions.list_by_connection(&record.id).await?;
        Ok(rows.iter().filter_map(|r| r.to_entity()).collect())
    }

    /// Live balance snapshot from the broker (never cached)
    pub async fn balance(
        &self,
        user_id: &str,
        connection_id: &str,
    ) -> Result<AccountBalance, ServiceError> {
        let record = self.connections.owned(user_id, connection_id).await?;
        let client = self.provider.client_for(&record).await?;
        match client.get_balance().await {
            Ok(balance) => Ok(balance),
            Err(e) => {
                self.connection_repo
                    .record_error(&record.id, &e.to_string())
                    .await?;
                Err(e.into())
            }
        }
    }

    /// Sync every active connection of a user. Connections run in
    /// parallel; each still honors its own per-connection lock. Returns
    /// one outcome per connection id.
    pub async fn sync_user_connections(
        self: Arc<Self>,
        user_id: &str,
    ) -> Result<Vec<(String, Result<SyncOutcome, ServiceError>)>, ServiceError> {
        let records = self.connections.list(user_id).await?;
        let futures = records.iter().filter(|c| c.is_active).map(|c| {
            let engine = self.clone();
            let id = c.id.clone();
            async move {
                let outcome = engine.sync_connection(&id).await;
                (id, outcome)
            }
        });
        Ok(futures_util::future::join_all(futures).await)
    }

    /// Read-only cross-broker view: cached positions summed by symbol
    /// across every connection of the user.
    pub async fn aggregate_positions(
        &self,
        user_id: &str,
    ) -> Result<Vec<AggregatedPosition>, ServiceError> {
        let rows = self.positions.list_by_user(user_id).await?;

        let mut by_symbol: HashMap<String, AggregatedPosition> = HashMap::new();
        for row in rows {
            let position = match row.to_entity() {
                Some(p) => p,
                None => continue,
            };
            let signed_quantity = match position.side {
                PositionSide::Long => position.quantity,
                PositionSide::Short => -position.quantity,
            };
            let entry = by_symbol
                .entry(position.symbol.clone())
                .or_insert_with(|| AggregatedPosition {
                    symbol: position.symbol.clone(),
                    net_quantity: 0.0,
                    total_market_value: 0.0,
                    total_unrealized_pnl: 0.0,
                    connection_count: 0,
                });
            entry.net_quantity += signed_quantity;
            entry.total_market_value += position.market_value;
            entry.total_unrealized_pnl += position.unrealized_pnl;
            entry.connection_count += 1;
        }

        let mut aggregated: Vec<AggregatedPosition> = by_symbol.into_values().collect();
        aggregated.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        Ok(aggregated)
    }

    async fn lock_for(&self, connection_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(connection_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}
