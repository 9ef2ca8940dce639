//! BrokerConnection entity
//!
//! A connection links one user to one broker account. It is created only
//! after a successful OAuth callback or a verified API-key check, updated
//! on every sync or error, and deleted (credentials purged) on disconnect.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::entities::broker::{BrokerKind, TradingMode};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConnection {
    pub id: String,
    pub user_id: String,
    pub broker: BrokerKind,
    pub mode: TradingMode,
    /// Whether the connection is usable. Cleared (not deleted) when
    /// authentication fails until the user re-authorizes.
    pub is_active: bool,
    pub last_connected_at: Option<DateTime<Utc>>,
    pub last_synced_at: Option<DateTime<Utc>>,
    /// Most recent failure from test-connection or sync; cleared on the
    /// next success. Observable health signal for the dashboard.
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BrokerConnection {
    pub fn new(user_id: &str, broker: BrokerKind, mode: TradingMode) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            broker,
            mode,
            is_active: true,
            last_connected_at: Some(now),
            last_synced_at: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }
}
