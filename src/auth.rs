//! Inbound API authentication
//!
//! The HTTP surface is consumed by the web application layer, which
//! authenticates with a service API key (`Authorization: Bearer ...`)
//! and forwards the acting end user in `X-User-Id`. Both are required on
//! every protected route.

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::Response,
};
use std::collections::HashSet;
use std::sync::Arc;

/// Minimum accepted API key length (256 bits of entropy, base64-ish)
const MIN_KEY_LENGTH: usize = 32;

/// Set of accepted service API keys, loaded once at startup
#[derive(Clone)]
pub struct ApiKeys {
    keys: Arc<HashSet<String>>,
}

impl ApiKeys {
    /// Parse a comma-separated key list. Keys shorter than the minimum
    /// are refused outright; running with a weak key is worse than not
    /// starting.
    pub fn from_env_value(raw: &str) -> Result<Self, String> {
        let mut keys = HashSet::new();
        for key in raw.split(',') {
            let key = key.trim();
            if key.is_empty() {
                continue;
            }
            if key.len() < MIN_KEY_LENGTH {
                return Err(format!(
                    "API key too weak: {} characters (minimum {})",
                    key.len(),
                    MIN_KEY_LENGTH
                ));
            }
            keys.insert(key.to_string());
        }
        if keys.is_empty() {
            return Err("no API keys configured; set API_KEYS".to_string());
        }
        tracing::info!("API authentication initialized with {} key(s)", keys.len());
        Ok(Self { keys: Arc::new(keys) })
    }

    fn contains(&self, key: &str) -> bool {
        self.keys.contains(key)
    }
}

/// The authenticated end user a request acts for
#[derive(Debug, Clone)]
pub struct RequestUser(pub String);

/// Middleware guarding every protected route: validates the bearer key
/// and attaches the forwarded user id to the request.
pub async fn require_auth(
    State(keys): State<ApiKeys>,
    mut request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let bearer = request
        .headers()
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match bearer {
        Some(key) if keys.contains(key) => {}
        _ => {
            tracing::warn!("Rejected request with missing or invalid API key");
            return Err(StatusCode::UNAUTHORIZED);
        }
    }

    let user_id = request
        .headers()
        .get("X-User-Id")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty());

    match user_id {
        Some(id) => {
            request.extensions_mut().insert(RequestUser(id));
            Ok(next.run(request).await)
        }
        None => Err(StatusCode::BAD_REQUEST),
    }
}
