//! Broker Client Factory
//!
//! Builds the right adapter for a connection from its broker kind, mode,
//! and decrypted credentials. The factory is the only place that knows
//! which concrete client backs which `BrokerKind`; everything above it
//! works against the `BrokerClient` trait.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::credentials::oauth1::NonceSource;
use crate::domain::entities::broker::{BrokerKind, TradingMode};
use crate::domain::entities::credentials::BrokerCredentials;
use crate::domain::errors::BrokerError;
use crate::domain::repositories::broker_client::BrokerClient;
use crate::infrastructure::alpaca_client::AlpacaClient;
use crate::infrastructure::ibkr_client::IbkrClient;

pub struct BrokerClientFactory {
    http_timeout: Duration,
    /// OAuth1 consumer secret for IBKR request signing. The stored user
    /// credentials carry the consumer key only; the secret stays
    /// app-side.
    ibkr_consumer_secret: Option<String>,
    nonces: Arc<dyn NonceSource>,
}

impl BrokerClientFactory {
    pub fn new(
        http_timeout: Duration,
        ibkr_consumer_secret: Option<String>,
        nonces: Arc<dyn NonceSource>,
    ) -> Self {
        Self {
            http_timeout,
            ibkr_consumer_secret,
            nonces,
        }
    }

    /// Instantiate an adapter for one connection
    pub fn create(
        &self,
        broker: BrokerKind,
        mode: TradingMode,
        credentials: &BrokerCredentials,
    ) -> Result<Arc<dyn BrokerClient>, BrokerError> {
        debug!("Creating {} client ({:?})", broker, mode);
        match broker {
            BrokerKind::Alpaca => {
                let client = AlpacaClient::new(credentials, mode, self.http_timeout)?;
                Ok(Arc::new(client))
            }
            BrokerKind::InteractiveBrokers => {
                let consumer_secret = self.ibkr_consumer_secret.as_deref().ok_or_else(|| {
                    BrokerError::AuthenticationFailed {
                        broker,
                        detail: "IBKR consumer secret is not configured".to_string(),
                    }
                })?;
                let client = IbkrClient::new(
                    credentials,
                    consumer_secret,
                    mode,
                    self.http_timeout,
                    self.nonces.clone(),
                )?;
                Ok(Arc::new(client))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::oauth1::FixedNonceSource;

    fn factory(with_ibkr: bool) -> BrokerClientFactory {
        BrokerClientFactory::new(
            Duration::from_secs(5),
            with_ibkr.then(|| "consumer-secret".to_string()),
            Arc::new(FixedNonceSource {
                timestamp: 1700000000,
                nonce: "n".to_string(),
            }),
        )
    }

    #[test]
    fn test_creates_alpaca_for_api_key() {
        let creds = BrokerCredentials::ApiKey {
            key: "k".to_string(),
            secret: "s".to_string(),
            passphrase: None,
        };
        let client = factory(false)
            .create(BrokerKind::Alpaca, TradingMode::Paper, &creds)
            .unwrap();
        assert_eq!(client.broker(), BrokerKind::Alpaca);
    }

    #[test]
    fn test_creates_ibkr_for_oauth1() {
        let creds = BrokerCredentials::OAuth1 {
            consumer_key: "ck".to_string(),
            token: "t".to_string(),
            token_secret: "ts".to_string(),
            session_token: None,
        };
        let client = factory(true)
            .create(BrokerKind::InteractiveBrokers, TradingMode::Live, &creds)
            .unwrap();
        assert_eq!(client.broker(), BrokerKind::InteractiveBrokers);
    }

    #[test]
    fn test_ibkr_requires_consumer_secret() {
        let creds = BrokerCredentials::OAuth1 {
            consumer_key: "ck".to_string(),
            token: "t".to_string(),
            token_secret: "ts".to_string(),
            session_token: None,
        };
        assert!(matches!(
            factory(false).create(BrokerKind::InteractiveBrokers, TradingMode::Live, &creds),
            Err(BrokerError::AuthenticationFailed { .. })
        ));
    }

    #[test]
    fn test_mismatched_credentials_rejected() {
        let creds = BrokerCredentials::ApiKey {
            key: "k".to_string(),
            secret: "s".to_string(),
            passphrase: None,
        };
        assert!(factory(true)
            .create(BrokerKind::InteractiveBrokers, TradingMode::Paper, &creds)
            .is_err());
    }
}
