//! OAuth 2.0 authorization-code flow
//!
//! Builds the broker authorization URL, exchanges the callback code for
//! tokens, and refreshes expired access tokens. Endpoint URLs and client
//! credentials come from per-broker configuration; nothing here is
//! broker-specific beyond that.

use chrono::{Duration, Utc};
use serde::Deserialize;
use tracing::debug;

use super::CredentialError;
use crate::domain::entities::credentials::BrokerCredentials;

/// Per-broker OAuth2 endpoints and app credentials
#[derive(Debug, Clone)]
pub struct Oauth2Provider {
    pub client_id: String,
    pub client_secret: String,
    pub authorize_url: String,
    pub token_url: String,
    pub redirect_uri: String,
    pub scope: String,
}

/// Token endpoint response. `refresh_token` is optional on refresh
/// responses; the previous one is kept in that case.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    expires_in: i64,
}

/// Build the URL the user is redirected to for authorization
pub fn authorization_url(provider: &Oauth2Provider, state: &str) -> Result<String, CredentialError> {
    let mut url = url::Url::parse(&provider.authorize_url)
        .map_err(|e| CredentialError::TokenExchange(format!("bad authorize URL: {}", e)))?;
    url.query_pairs_mut()
        .append_pair("response_type", "code")
        .append_pair("client_id", &provider.client_id)
        .append_pair("redirect_uri", &provider.redirect_uri)
        .append_pair("state", state)
        .append_pair("scope", &provider.scope);
    Ok(url.to_string())
}

/// Exchange an authorization code for access/refresh tokens
pub async fn exchange_code(
    http: &reqwest::Client,
    provider: &Oauth2Provider,
    code: &str,
) -> Result<BrokerCredentials, CredentialError> {
    let params = [
        ("grant_type", "authorization_code"),
        ("code", code),
        ("client_id", &provider.client_id),
        ("client_secret", &provider.client_secret),
        ("redirect_uri", &provider.redirect_uri),
    ];
    request_tokens(http, provider, &params, None).await
}

/// Trade a refresh token for a fresh access token. The caller decides
/// what a failure means (deactivate the connection); this function only
/// reports it.
pub async fn refresh(
    http: &reqwest::Client,
    provider: &Oauth2Provider,
    refresh_token: &str,
) -> Result<BrokerCredentials, CredentialError> {
    let params = [
        ("grant_type", "refresh_token"),
        ("refresh_token", refresh_token),
        ("client_id", &provider.client_id),
        ("client_secret", &provider.client_secret),
    ];
    request_tokens(http, provider, &params, Some(refresh_token)).await
}

async fn request_tokens(
    http: &reqwest::Client,
    provider: &Oauth2Provider,
    params: &[(&str, &str)],
    fallback_refresh_token: Option<&str>,
) -> Result<BrokerCredentials, CredentialError> {
    let response = http
        .post(&provider.token_url)
        .form(params)
        .send()
        .await
        .map_err(|e| CredentialError::TokenExchange(format!("token request failed: {}", e)))?;

    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| CredentialError::TokenExchange(format!("token response unreadable: {}", e)))?;

    if !status.is_success() {
        return Err(CredentialError::TokenExchange(format!(
            "token endpoint returned {}: {}",
            status, body
        )));
    }

    let tokens: TokenResponse = serde_json::from_str(&body)
        .map_err(|e| CredentialError::TokenExchange(format!("malformed token response: {}", e)))?;

    if tokens.access_token.is_empty() {
        return Err(CredentialError::TokenExchange(
            "token endpoint returned empty access token".to_string(),
        ));
    }

    let refresh_token = tokens
        .refresh_token
        .or_else(|| fallback_refresh_token.map(|s| s.to_string()))
        .ok_or_else(|| {
            CredentialError::TokenExchange("token endpoint returned no refresh token".to_string())
        })?;

    debug!("Obtained tokens expiring in {}s", tokens.expires_in);

    Ok(BrokerCredentials::OAuth2 {
        access_token: tokens.access_token,
        refresh_token,
        expires_at: Utc::now() + Duration::seconds(tokens.expires_in),
    })
}
