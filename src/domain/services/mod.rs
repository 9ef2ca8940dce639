//! Domain services: connection lifecycle, order execution, position
//! synchronization, and the auto-sync scheduler.

pub mod capabilities;
pub mod connection_service;
pub mod order_executor;
pub mod position_sync;
pub mod sync_scheduler;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::credentials::CredentialError;
use crate::domain::entities::order::OrderStatus;
use crate::domain::errors::BrokerError;
use crate::domain::repositories::broker_client::BrokerClient;
use crate::persistence::models::ConnectionRecord;
use crate::persistence::DatabaseError;

/// Failures surfaced by the services in this module
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Connection {0} is inactive; re-authorize to continue")]
    ConnectionInactive(String),

    #[error("Order {0} is already being submitted")]
    DuplicateOrder(String),

    #[error("Order {id} is {status}; no further transitions are allowed")]
    TerminalOrder { id: String, status: OrderStatus },

    #[error("Illegal order transition {from} -> {to}")]
    IllegalTransition { from: OrderStatus, to: OrderStatus },

    #[error(transparent)]
    Credential(#[from] CredentialError),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

impl ServiceError {
    /// Whether a caller may retry the operation with backoff
    pub fn is_retryable(&self) -> bool {
        matches!(self, ServiceError::Broker(e) if e.is_retryable())
    }
}

/// Source of ready-to-use broker clients for a connection. The
/// connection service is the production implementation (decrypt
/// credentials, refresh tokens, build the adapter); tests substitute a
/// mock returning an in-memory client.
#[async_trait]
pub trait ClientProvider: Send + Sync {
    async fn client_for(
        &self,
        record: &ConnectionRecord,
    ) -> Result<Arc<dyn BrokerClient>, ServiceError>;
}
