//! Application configuration
//!
//! Per-broker app credentials and endpoints come from the environment;
//! everything broker-specific is keyed by the closed `BrokerKind` enum,
//! never by runtime-built field names. Bad numeric values warn and fall
//! back to defaults rather than aborting startup.

use std::time::Duration;

use crate::credentials::oauth1::Oauth1Provider;
use crate::credentials::oauth2::Oauth2Provider;

/// Legal bounds for the auto-sync interval
pub const MIN_SYNC_INTERVAL: Duration = Duration::from_secs(60);
pub const MAX_SYNC_INTERVAL: Duration = Duration::from_secs(3600);

const DEFAULT_SYNC_INTERVAL_SECS: u64 = 300;
const DEFAULT_OAUTH_STATE_TTL_SECS: u64 = 600;
const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 10;

/// Alpaca OAuth2 endpoints
const ALPACA_AUTHORIZE_URL: &str = "https://app.alpaca.markets/oauth/authorize";
const ALPACA_TOKEN_URL: &str = "https://api.alpaca.markets/oauth/token";

/// Interactive-Brokers-style OAuth1 endpoints
const IBKR_REQUEST_TOKEN_URL: &str = "https://api.ibkr.com/v1/api/oauth/request_token";
const IBKR_AUTHORIZE_URL: &str = "https://www.interactivebrokers.com/authorize";
const IBKR_ACCESS_TOKEN_URL: &str = "https://api.ibkr.com/v1/api/oauth/access_token";

#[derive(Clone)]
pub struct AppConfig {
    pub bind_addr: String,
    pub database_url: String,
    pub http_timeout: Duration,
    /// How long an issued OAuth state stays redeemable
    pub oauth_state_ttl: Duration,
    /// Default auto-sync interval, already clamped to the legal bounds
    pub default_sync_interval: Duration,
    /// OAuth2 app registration for Alpaca; None if unconfigured
    pub alpaca_oauth: Option<Oauth2Provider>,
    /// OAuth1 consumer registration for Interactive Brokers; None if
    /// unconfigured
    pub ibkr_oauth: Option<Oauth1Provider>,
}

impl AppConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> AppConfig {
        let bind_addr =
            std::env::var("BIND_ADDR").unwrap_or_else(|_| "127.0.0.1:3000".to_string());
        let database_url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://data/tradelink.db".to_string());

        let http_timeout =
            Duration::from_secs(env_u64("HTTP_TIMEOUT_SECS", DEFAULT_HTTP_TIMEOUT_SECS));
        let oauth_state_ttl =
            Duration::from_secs(env_u64("OAUTH_STATE_TTL_SECS", DEFAULT_OAUTH_STATE_TTL_SECS));
        let default_sync_interval = clamp_sync_interval(Duration::from_secs(env_u64(
            "SYNC_INTERVAL_SECS",
            DEFAULT_SYNC_INTERVAL_SECS,
        )));

        AppConfig {
            bind_addr,
            database_url,
            http_timeout,
            oauth_state_ttl,
            default_sync_interval,
            alpaca_oauth: alpaca_oauth_from_env(),
            ibkr_oauth: ibkr_oauth_from_env(),
        }
    }
}

/// Clamp an interval into the legal auto-sync range, warning when the
/// requested value is out of bounds.
pub fn clamp_sync_interval(requested: Duration) -> Duration {
    if requested < MIN_SYNC_INTERVAL {
        tracing::warn!(
            "Sync interval {:?} below minimum, clamping to {:?}",
            requested,
            MIN_SYNC_INTERVAL
        );
        MIN_SYNC_INTERVAL
    } else if requested > MAX_SYNC_INTERVAL {
        tracing::warn!(
            "Sync interval {:?} above maximum, clamping to {:?}",
            requested,
            MAX_SYNC_INTERVAL
        );
        MAX_SYNC_INTERVAL
    } else {
        requested
    }
}

fn env_u64(name: &str, default: u64) -> u64 {
    match std::env::var(name) {
        Ok(raw) => match raw.parse::<u64>() {
            Ok(value) if value > 0 => value,
            Ok(value) => {
                tracing::warn!("Invalid {} value: {} (must be positive), using default: {}", name, value, default);
                default
            }
            Err(e) => {
                tracing::warn!("Failed to parse {} '{}': {}, using default: {}", name, raw, e, default);
                default
            }
        },
        Err(_) => default,
    }
}

fn alpaca_oauth_from_env() -> Option<Oauth2Provider> {
    let client_id = std::env::var("ALPACA_CLIENT_ID").ok()?;
    let client_secret = crate::secrets::optional_secret("ALPACA_CLIENT_SECRET")?;
    let redirect_uri = std::env::var("ALPACA_REDIRECT_URI").ok()?;

    Some(Oauth2Provider {
        client_id,
        client_secret: client_secret.to_string(),
        authorize_url: std::env::var("ALPACA_AUTHORIZE_URL")
            .unwrap_or_else(|_| ALPACA_AUTHORIZE_URL.to_string()),
        token_url: std::env::var("ALPACA_TOKEN_URL")
            .unwrap_or_else(|_| ALPACA_TOKEN_URL.to_string()),
        redirect_uri,
        scope: std::env::var("ALPACA_OAUTH_SCOPE")
            .unwrap_or_else(|_| "account:write trading data".to_string()),
    })
}

fn ibkr_oauth_from_env() -> Option<Oauth1Provider> {
    let consumer_key = std::env::var("IBKR_CONSUMER_KEY").ok()?;
    let consumer_secret = crate::secrets::optional_secret("IBKR_CONSUMER_SECRET")?;
    let callback_url = std::env::var("IBKR_CALLBACK_URI").ok()?;

    Some(Oauth1Provider {
        consumer_key,
        consumer_secret: consumer_secret.to_string(),
        request_token_url: std::env::var("IBKR_REQUEST_TOKEN_URL")
            .unwrap_or_else(|_| IBKR_REQUEST_TOKEN_URL.to_string()),
        authorize_url: std::env::var("IBKR_AUTHORIZE_URL")
            .unwrap_or_else(|_| IBKR_AUTHORIZE_URL.to_string()),
        access_token_url: std::env::var("IBKR_ACCESS_TOKEN_URL")
            .unwrap_or_else(|_| IBKR_ACCESS_TOKEN_URL.to_string()),
        callback_url,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamp_sync_interval_bounds() {
        assert_eq!(
            clamp_sync_interval(Duration::from_secs(10)),
            MIN_SYNC_INTERVAL
        );
        assert_eq!(
            clamp_sync_interval(Duration::from_secs(7200)),
            MAX_SYNC_INTERVAL
        );
        assert_eq!(
            clamp_sync_interval(Duration::from_secs(300)),
            Duration::from_secs(300)
        );
    }

    #[test]
    fn test_clamp_sync_interval_edges() {
        assert_eq!(clamp_sync_interval(MIN_SYNC_INTERVAL), MIN_SYNC_INTERVAL);
        assert_eq!(clamp_sync_interval(MAX_SYNC_INTERVAL), MAX_SYNC_INTERVAL);
    }
}
