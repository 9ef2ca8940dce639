//! Credential Manager
//!
//! Everything that touches broker secrets lives here: the OAuth1 and
//! OAuth2 flows, one-time authorization state, and encryption of stored
//! tokens. Adapters receive decrypted credentials for the duration of a
//! call; nothing outside this module sees plaintext at rest.

pub mod cipher;
pub mod manager;
pub mod oauth1;
pub mod oauth2;

use thiserror::Error;

use crate::domain::errors::BrokerError;
use crate::persistence::DatabaseError;

/// Errors from the credential lifecycle
#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("Invalid encryption key: {0}")]
    InvalidKey(String),

    #[error("Encryption failed: {0}")]
    Encryption(String),

    #[error("Decryption failed: {0}")]
    Decryption(String),

    #[error("Credential serialization failed: {0}")]
    Serialization(String),

    /// Unknown or already-redeemed state token. Client error: the
    /// authorization must be restarted.
    #[error("Authorization state not found or already used")]
    StateNotFound,

    /// The state token outlived its TTL. Client error.
    #[error("Authorization state expired")]
    StateExpired,

    #[error("Token exchange failed: {0}")]
    TokenExchange(String),

    #[error("Unsupported auth scheme for broker: {0}")]
    UnsupportedScheme(String),

    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

impl CredentialError {
    /// Whether the failure is the caller's to fix (restart authorization)
    /// rather than a server-side fault.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            CredentialError::StateNotFound
                | CredentialError::StateExpired
                | CredentialError::UnsupportedScheme(_)
        )
    }
}
