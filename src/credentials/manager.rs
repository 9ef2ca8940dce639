//! Credential manager service
//!
//! Orchestrates the OAuth flows end to end: issues single-use state,
//! runs the token exchanges, encrypts what comes back, and transparently
//! refreshes expired OAuth2 access tokens. A refresh failure deactivates
//! the owning connection; it is never auto-retried with the same
//! credentials.

use std::sync::Arc;

use chrono::{Duration, Utc};
use tracing::{info, warn};

use super::cipher::CredentialCipher;
use super::oauth1::{self, NonceSource, Oauth1Provider};
use super::oauth2::{self, Oauth2Provider};
use super::CredentialError;
use crate::domain::entities::broker::{AuthScheme, BrokerKind, TradingMode};
use crate::domain::entities::credentials::BrokerCredentials;
use crate::domain::errors::BrokerError;
use crate::domain::services::capabilities;
use crate::persistence::models::OAuthStateRecord;
use crate::persistence::repository::{ConnectionRepository, OAuthStateRepository};
use crate::persistence::DbPool;

/// Where to send the user to authorize, plus the state that must come
/// back on the callback.
#[derive(Debug, Clone)]
pub struct AuthorizationStart {
    pub redirect_url: String,
    pub state: String,
}

/// A successfully redeemed authorization: who it was for and the tokens
/// obtained.
#[derive(Debug)]
pub struct RedeemedAuthorization {
    pub user_id: String,
    pub broker: BrokerKind,
    pub mode: TradingMode,
    pub credentials: BrokerCredentials,
}

pub struct CredentialManager {
    cipher: CredentialCipher,
    http: reqwest::Client,
    states: OAuthStateRepository,
    connections: ConnectionRepository,
    state_ttl: Duration,
    alpaca_oauth: Option<Oauth2Provider>,
    ibkr_oauth: Option<Oauth1Provider>,
    nonces: Arc<dyn NonceSource>,
}

impl CredentialManager {
    pub fn new(
        pool: DbPool,
        cipher: CredentialCipher,
        http: reqwest::Client,
        state_ttl: std::time::Duration,
        alpaca_oauth: Option<Oauth2Provider>,
        ibkr_oauth: Option<Oauth1Provider>,
        nonces: Arc<dyn NonceSource>,
    ) -> Self {
        Self {
            cipher,
            http,
            states: OAuthStateRepository::new(pool.clone()),
            connections: ConnectionRepository::new(pool),
            state_ttl: Duration::from_std(state_ttl).unwrap_or_else(|_| Duration::seconds(600)),
            alpaca_oauth,
            ibkr_oauth,
            nonces,
        }
    }

    pub fn seal(&self, credentials: &BrokerCredentials) -> Result<String, CredentialError> {
        self.cipher.seal(credentials)
    }

    pub fn open(&self, blob: &str) -> Result<BrokerCredentials, CredentialError> {
        self.cipher.open(blob)
    }

    /// Start an authorization flow for a broker, dispatched by its
    /// preferred auth scheme. Returns the redirect URL for the user.
    pub async fn begin_authorization(
        &self,
        broker: BrokerKind,
        user_id: &str,
        mode: TradingMode,
    ) -> Result<AuthorizationStart, CredentialError> {
        // Opportunistic cleanup; an expired state that survives this is
        // still rejected at redemption.
        let _ = self.states.purge_expired(Utc::now()).await;

        match capabilities::capabilities(broker).auth_schemes.first() {
            Some(AuthScheme::OAuth2) => self.begin_oauth2(broker, user_id, mode).await,
            Some(AuthScheme::OAuth1) => self.begin_oauth1(broker, user_id, mode).await,
            _ => Err(CredentialError::UnsupportedScheme(broker.name().to_string())),
        }
    }

    async fn begin_oauth2(
        &self,
        broker: BrokerKind,
        user_id: &str,
        mode: TradingMode,
    ) -> Result<AuthorizationStart, CredentialError> {
        let provider = self.oauth2_provider(broker)?;
        let state = uuid::Uuid::new_v4().to_string();
        self.insert_state(broker, user_id, mode, &state, None).await?;

        let redirect_url = oauth2::authorization_url(provider, &state)?;
        info!("Issued OAuth2 state for user {} on {}", user_id, broker);
        Ok(AuthorizationStart { redirect_url, state })
    }

    async fn begin_oauth1(
        &self,
        broker: BrokerKind,
        user_id: &str,
        mode: TradingMode,
    ) -> Result<AuthorizationStart, CredentialError> {
        let provider = self.oauth1_provider(broker)?;

        let (request_token, request_secret) =
            oauth1::request_token(&self.http, provider, self.nonces.as_ref()).await?;

        let state = uuid::Uuid::new_v4().to_string();
        self.insert_state(
            broker,
            user_id,
            mode,
            &state,
            Some((request_token.clone(), request_secret)),
        )
        .await?;

        let redirect_url = oauth1::user_authorize_url(provider, &request_token)?;
        info!("Issued OAuth1 request token for user {} on {}", user_id, broker);
        Ok(AuthorizationStart { redirect_url, state })
    }

    /// Redeem an OAuth2 callback. The state is consumed whether or not
    /// the exchange succeeds; a retry must restart the flow.
    pub async fn complete_oauth2(
        &self,
        code: &str,
        state: &str,
    ) -> Result<RedeemedAuthorization, CredentialError> {
        let record = self.redeem_state(state).await?;
        let broker = record
            .broker_kind()
            .ok_or(CredentialError::StateNotFound)?;
        let provider = self.oauth2_provider(broker)?;

        let credentials = oauth2::exchange_code(&self.http, provider, code).await?;
        Ok(RedeemedAuthorization {
            user_id: record.user_id,
            broker,
            mode: TradingMode::from_paper_flag(record.is_paper),
            credentials,
        })
    }

    /// Redeem an OAuth1 callback: the returned `oauth_token` must match
    /// the request token stored with the state.
    pub async fn complete_oauth1(
        &self,
        oauth_token: &str,
        oauth_verifier: &str,
        state: &str,
    ) -> Result<RedeemedAuthorization, CredentialError> {
        let record = self.redeem_state(state).await?;
        let broker = record
            .broker_kind()
            .ok_or(CredentialError::StateNotFound)?;
        let provider = self.oauth1_provider(broker)?;

        let (request_token, request_secret) = match (
            record.request_token.as_deref(),
            record.request_token_secret.as_deref(),
        ) {
            (Some(t), Some(s)) => (t, s),
            _ => return Err(CredentialError::StateNotFound),
        };
        if request_token != oauth_token {
            warn!("OAuth1 callback token does not match issued request token");
            return Err(CredentialError::StateNotFound);
        }

        let (token, token_secret) = oauth1::access_token(
            &self.http,
            provider,
            (request_token, request_secret),
            oauth_verifier,
            self.nonces.as_ref(),
        )
        .await?;

        Ok(RedeemedAuthorization {
            user_id: record.user_id,
            broker,
            mode: TradingMode::from_paper_flag(record.is_paper),
            credentials: BrokerCredentials::OAuth1 {
                consumer_key: provider.consumer_key.clone(),
                token,
                token_secret,
                session_token: None,
            },
        })
    }

    /// Decrypt a connection's credentials, refreshing an expired OAuth2
    /// access token in place. A failed refresh deactivates the
    /// connection and surfaces as `AuthenticationFailed`.
    pub async fn open_fresh(
        &self,
        connection_id: &str,
        broker: BrokerKind,
        credentials_enc: &str,
    ) -> Result<BrokerCredentials, CredentialError> {
        let credentials = self.open(credentials_enc)?;
        if !credentials.is_expired(Utc::now()) {
            return Ok(credentials);
        }

        let refresh_token = match &credentials {
            BrokerCredentials::OAuth2 { refresh_token, .. } => refresh_token.clone(),
            _ => return Ok(credentials),
        };

        info!("Access token expired for connection {}, refreshing", connection_id);
        let provider = self.oauth2_provider(broker)?;
        match oauth2::refresh(&self.http, provider, &refresh_token).await {
            Ok(fresh) => {
                let blob = self.seal(&fresh)?;
                self.connections
                    .update_credentials(connection_id, &blob)
                    .await?;
                Ok(fresh)
            }
            Err(e) => {
                warn!(
                    "Token refresh failed for connection {}: {}; deactivating",
                    connection_id, e
                );
                self.connections.set_active(connection_id, false).await?;
                self.connections
                    .record_error(connection_id, &format!("token refresh failed: {}", e))
                    .await?;
                Err(CredentialError::Broker(BrokerError::AuthenticationFailed {
                    broker,
                    detail: format!("token refresh failed: {}", e),
                }))
            }
        }
    }

    async fn insert_state(
        &self,
        broker: BrokerKind,
        user_id: &str,
        mode: TradingMode,
        state: &str,
        request_token: Option<(String, String)>,
    ) -> Result<(), CredentialError> {
        let now = Utc::now();
        let (token, secret) = match request_token {
            Some((t, s)) => (Some(t), Some(s)),
            None => (None, None),
        };
        let record = OAuthStateRecord {
            state: state.to_string(),
            broker: broker.name().to_string(),
            user_id: user_id.to_string(),
            is_paper: mode.is_paper(),
            request_token: token,
            request_token_secret: secret,
            created_at: now,
            expires_at: now + self.state_ttl,
        };
        self.states.insert(&record).await?;
        Ok(())
    }

    /// Consume a state token. Missing or already-used states and expired
    /// states both fail with client errors; the row is gone afterward
    /// either way.
    async fn redeem_state(&self, state: &str) -> Result<OAuthStateRecord, CredentialError> {
        let record = self
            .states
            .take(state)
            .await?
            .ok_or(CredentialError::StateNotFound)?;
        if record.is_expired(Utc::now()) {
            return Err(CredentialError::StateExpired);
        }
        Ok(record)
    }

    fn oauth2_provider(&self, broker: BrokerKind) -> Result<&Oauth2Provider, CredentialError> {
        match broker {
            BrokerKind::Alpaca => self.alpaca_oauth.as_ref().ok_or_else(|| {
                CredentialError::TokenExchange("Alpaca OAuth2 is not configured".to_string())
            }),
            _ => Err(CredentialError::UnsupportedScheme(broker.name().to_string())),
        }
    }

    fn oauth1_provider(&self, broker: BrokerKind) -> Result<&Oauth1Provider, CredentialError> {
        match broker {
            BrokerKind::InteractiveBrokers => self.ibkr_oauth.as_ref().ok_or_else(|| {
                CredentialError::TokenExchange(
                    "Interactive Brokers OAuth1 is not configured".to_string(),
                )
            }),
            _ => Err(CredentialError::UnsupportedScheme(broker.name().to_string())),
        }
    }

    pub async fn purge_expired_states(&self) -> Result<u64, CredentialError> {
        Ok(self.states.purge_expired(Utc::now()).await?)
    }
}
