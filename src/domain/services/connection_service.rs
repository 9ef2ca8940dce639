//! Connection service
//!
//! Owns `BrokerConnection` records end to end: API-key connects (verified
//! against the broker before anything is persisted), OAuth callback
//! completion, disconnect with credential purge, and health checks. Also
//! the production `ClientProvider`: it decrypts stored credentials,
//! refreshes expired tokens through the credential manager, and hands
//! out ready adapters.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{info, warn};

use super::{capabilities, ClientProvider, ServiceError};
use crate::credentials::manager::{AuthorizationStart, CredentialManager};
use crate::domain::entities::broker::{AuthScheme, BrokerKind, TradingMode};
use crate::domain::entities::connection::BrokerConnection;
use crate::domain::entities::credentials::BrokerCredentials;
use crate::domain::repositories::broker_client::BrokerClient;
use crate::infrastructure::broker_client_factory::BrokerClientFactory;
use crate::persistence::models::ConnectionRecord;
use crate::persistence::repository::{ConnectionRepository, PositionRepository};
use crate::persistence::DbPool;

pub struct ConnectionService {
    connections: ConnectionRepository,
    positions: PositionRepository,
    credentials: Arc<CredentialManager>,
    factory: Arc<BrokerClientFactory>,
}

impl ConnectionService {
    pub fn new(
        pool: DbPool,
        credentials: Arc<CredentialManager>,
        factory: Arc<BrokerClientFactory>,
    ) -> Self {
        Self {
            connections: ConnectionRepository::new(pool.clone()),
            positions: PositionRepository::new(pool),
            credentials,
            factory,
        }
    }

    /// Connect with a raw API key/secret. The credentials are verified
    /// with a real account call before anything is persisted; an invalid
    /// key never produces a connection row.
    pub async fn connect_api_key(
        &self,
        user_id: &str,
        broker: BrokerKind,
        mode: TradingMode,
        key: &str,
        secret: &str,
        passphrase: Option<&str>,
    ) -> Result<BrokerConnection, ServiceError> {
        if !capabilities::supports_auth(broker, AuthScheme::ApiKey) {
            return Err(ServiceError::Validation(format!(
                "{} does not accept API-key connections",
                broker
            )));
        }

        let credentials = BrokerCredentials::ApiKey {
            key: key.to_string(),
            secret: secret.to_string(),
            passphrase: passphrase.map(|s| s.to_string()),
        };

        let client = self.factory.create(broker, mode, &credentials)?;
        client.test_auth().await?;

        let connection = self.persist_connection(user_id, broker, mode, &credentials).await?;
        info!(
            "Connected {} ({:?}) for user {} via API key",
            broker, mode, user_id
        );
        Ok(connection)
    }

    /// Start an OAuth flow; the caller redirects the user to the
    /// returned URL.
    pub async fn begin_oauth(
        &self,
        user_id: &str,
        broker: BrokerKind,
        mode: TradingMode,
    ) -> Result<AuthorizationStart, ServiceError> {
        Ok(self
            .credentials
            .begin_authorization(broker, user_id, mode)
            .await?)
    }

    /// Complete an OAuth2 callback and create (or re-link) the connection
    pub async fn complete_oauth2(
        &self,
        code: &str,
        state: &str,
    ) -> Result<BrokerConnection, ServiceError> {
        let redeemed = self.credentials.complete_oauth2(code, state).await?;
        let connection = self
            .persist_connection(
                &redeemed.user_id,
                redeemed.broker,
                redeemed.mode,
                &redeemed.credentials,
            )
            .await?;
        info!(
            "Connected {} ({:?}) for user {} via OAuth2",
            redeemed.broker, redeemed.mode, redeemed.user_id
        );
        Ok(connection)
    }

    /// Complete an OAuth1 callback and create (or re-link) the connection
    pub async fn complete_oauth1(
        &self,
        oauth_token: &str,
        oauth_verifier: &str,
        state: &str,
    ) -> Result<BrokerConnection, ServiceError> {
        let redeemed = self
            .credentials
            .complete_oauth1(oauth_token, oauth_verifier, state)
            .await?;
        let connection = self
            .persist_connection(
                &redeemed.user_id,
                redeemed.broker,
                redeemed.mode,
                &redeemed.credentials,
            )
            .await?;
        info!(
            "Connected {} ({:?}) for user {} via OAuth1",
            redeemed.broker, redeemed.mode, redeemed.user_id
        );
        Ok(connection)
    }

    /// One broker account maps to one connection: a fresh authorization
    /// for an existing (user, broker, mode) re-links that connection
    /// instead of creating a sibling.
    async fn persist_connection(
        &self,
        user_id: &str,
        broker: BrokerKind,
        mode: TradingMode,
        credentials: &BrokerCredentials,
    ) -> Result<BrokerConnection, ServiceError> {
        let blob = self.credentials.seal(credentials)?;

        let existing = self
            .connections
            .list_by_user(user_id)
            .await?
            .into_iter()
            .find(|c| c.broker_kind() == Some(broker) && c.trading_mode() == mode);

        if let Some(record) = existing {
            self.connections
                .update_credentials(&record.id, &blob)
                .await?;
            self.connections.set_active(&record.id, true).await?;
            self.connections.record_success(&record.id).await?;
            let refreshed = self
                .connections
                .get(&record.id)
                .await?
                .ok_or_else(|| ServiceError::NotFound(format!("connection {}", record.id)))?;
            return refreshed
                .to_entity()
                .ok_or_else(|| ServiceError::Validation("corrupt connection record".to_string()));
        }

        let entity = BrokerConnection::new(user_id, broker, mode);
        let record = ConnectionRecord {
            id: entity.id.clone(),
            user_id: entity.user_id.clone(),
            broker: broker.name().to_string(),
            mode: if mode.is_paper() { "paper" } else { "live" }.to_string(),
            credentials_enc: blob,
            is_active: true,
            last_connected_at: entity.last_connected_at,
            last_synced_at: None,
            last_error: None,
            created_at: entity.created_at,
            updated_at: entity.updated_at,
        };
        self.connections.create(&record).await?;
        Ok(entity)
    }

    pub async fn get(
        &self,
        user_id: &str,
        connection_id: &str,
    ) -> Result<BrokerConnection, ServiceError> {
        let record = self.owned(user_id, connection_id).await?;
        record
            .to_entity()
            .ok_or_else(|| ServiceError::Validation("corrupt connection record".to_string()))
    }

    pub async fn list(&self, user_id: &str) -> Result<Vec<BrokerConnection>, ServiceError> {
        let records = self.connections.list_by_user(user_id).await?;
        Ok(records.iter().filter_map(|r| r.to_entity()).collect())
    }

    /// Disconnect: remove the connection row (credentials go with it)
    /// and drop the cached positions.
    pub async fn disconnect(
        &self,
        user_id: &str,
        connection_id: &str,
    ) -> Result<(), ServiceError> {
        let record = self.owned(user_id, connection_id).await?;
        self.positions.delete_for_connection(&record.id).await?;
        self.connections.delete(&record.id).await?;
        info!("Disconnected connection {} for user {}", connection_id, user_id);
        Ok(())
    }

    /// Health check against the broker. Updates the connection's
    /// last-error signal either way.
    pub async fn test_connection(
        &self,
        user_id: &str,
        connection_id: &str,
    ) -> Result<(), ServiceError> {
        let record = self.owned(user_id, connection_id).await?;
        let client = self.client_for(&record).await?;

        match client.test_auth().await {
            Ok(()) => {
                self.connections.record_success(&record.id).await?;
                Ok(())
            }
            Err(e) => {
                warn!("Connection test failed for {}: {}", connection_id, e);
                self.connections.record_error(&record.id, &e.to_string()).await?;
                if e.is_auth_failure() {
                    self.connections.set_active(&record.id, false).await?;
                }
                Err(e.into())
            }
        }
    }

    /// Look a record up without an ownership check. Used by background
    /// sync, which operates on connection ids it already validated.
    pub async fn record(&self, connection_id: &str) -> Result<ConnectionRecord, ServiceError> {
        self.connections
            .get(connection_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("connection {}", connection_id)))
    }

    pub async fn owned(
        &self,
        user_id: &str,
        connection_id: &str,
    ) -> Result<ConnectionRecord, ServiceError> {
        self.connections
            .get_owned(connection_id, user_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("connection {}", connection_id)))
    }
}

#[async_trait]
impl ClientProvider for ConnectionService {
    /// Decrypt the stored credentials (refreshing an expired OAuth2
    /// token in place) and build the adapter. Inactive connections are
    /// refused before any decryption happens.
    async fn client_for(
        &self,
        record: &ConnectionRecord,
    ) -> Result<Arc<dyn BrokerClient>, ServiceError> {
        if !record.is_active {
            return Err(ServiceError::ConnectionInactive(record.id.clone()));
        }
        let broker = record
            .broker_kind()
            .ok_or_else(|| ServiceError::Validation("corrupt connection record".to_string()))?;

        let credentials = self
            .credentials
            .open_fresh(&record.id, broker, &record.credentials_enc)
            .await?;
        debug_assert!(!credentials.is_expired(Utc::now()));

        Ok(self.factory.create(broker, record.trading_mode(), &credentials)?)
    }
}
