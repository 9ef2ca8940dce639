//! Broker credential variants
//!
//! One shape per auth scheme, dispatched by the broker's `AuthScheme`.
//! Credentials are serialized to JSON only for encryption at rest and are
//! never logged: `Debug` output redacts every secret field, and the
//! contained strings are zeroed on drop.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::domain::entities::broker::AuthScheme;

/// Credentials for one broker connection.
///
/// The `kind` tag keeps the stored JSON self-describing so a record written
/// by one auth scheme can never be deserialized as another.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(tag = "kind")]
pub enum BrokerCredentials {
    #[serde(rename = "api_key")]
    ApiKey {
        key: String,
        secret: String,
        passphrase: Option<String>,
    },
    #[serde(rename = "oauth2")]
    OAuth2 {
        access_token: String,
        refresh_token: String,
        #[zeroize(skip)]
        expires_at: DateTime<Utc>,
    },
    #[serde(rename = "oauth1")]
    OAuth1 {
        consumer_key: String,
        token: String,
        token_secret: String,
        session_token: Option<String>,
    },
}

impl BrokerCredentials {
    pub fn scheme(&self) -> AuthScheme {
        match self {
            BrokerCredentials::ApiKey { .. } => AuthScheme::ApiKey,
            BrokerCredentials::OAuth2 { .. } => AuthScheme::OAuth2,
            BrokerCredentials::OAuth1 { .. } => AuthScheme::OAuth1,
        }
    }

    /// Whether an OAuth2 access token needs a refresh before use.
    ///
    /// Tokens are treated as expired 60 seconds early to absorb clock
    /// drift between this process and the broker.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self {
            BrokerCredentials::OAuth2 { expires_at, .. } => {
                now + Duration::seconds(60) >= *expires_at
            }
            _ => false,
        }
    }
}

impl std::fmt::Debug for BrokerCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BrokerCredentials::ApiKey { .. } => write!(f, "BrokerCredentials::ApiKey {{ <redacted> }}"),
            BrokerCredentials::OAuth2 { expires_at, .. } => write!(
                f,
                "BrokerCredentials::OAuth2 {{ <redacted>, expires_at: {} }}",
                expires_at
            ),
            BrokerCredentials::OAuth1 { .. } => write!(f, "BrokerCredentials::OAuth1 {{ <redacted> }}"),
        }
    }
}
