//! OAuth 1.0a signing and token exchange
//!
//! Signing is a pure function of (method, URL, parameters, secrets,
//! timestamp, nonce). Timestamp and nonce come from an injected
//! `NonceSource` so signatures are deterministic under test. The HMAC
//! algorithm is HMAC-SHA256 (`oauth_signature_method=HMAC-SHA256`), as
//! required by IBKR-style brokers.

use base64::{engine::general_purpose, Engine as _};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use super::CredentialError;

type HmacSha256 = Hmac<Sha256>;

/// Source of per-request timestamp and nonce. Production uses the system
/// clock and an RNG; tests pin both.
pub trait NonceSource: Send + Sync {
    fn timestamp(&self) -> u64;
    fn nonce(&self) -> String;
}

/// Wall-clock + RNG source
pub struct SystemNonceSource;

impl NonceSource for SystemNonceSource {
    fn timestamp(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }

    fn nonce(&self) -> String {
        let mut bytes = [0u8; 16];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        hex::encode(bytes)
    }
}

/// Fixed source for tests
#[derive(Debug, Clone)]
pub struct FixedNonceSource {
    pub timestamp: u64,
    pub nonce: String,
}

impl NonceSource for FixedNonceSource {
    fn timestamp(&self) -> u64 {
        self.timestamp
    }

    fn nonce(&self) -> String {
        self.nonce.clone()
    }
}

/// RFC 5849 percent encoding: unreserved characters pass through,
/// everything else becomes %XX.
pub fn percent_encode(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

/// Build the signature base string: METHOD & encoded-URL &
/// encoded-sorted-parameters.
pub fn signature_base_string(method: &str, url: &str, params: &BTreeMap<String, String>) -> String {
    let param_string = params
        .iter()
        .map(|(k, v)| format!("{}={}", percent_encode(k), percent_encode(v)))
        .collect::<Vec<_>>()
        .join("&");

    format!(
        "{}&{}&{}",
        method.to_uppercase(),
        percent_encode(url),
        percent_encode(&param_string)
    )
}

/// Sign a base string with `consumer_secret&token_secret`. Pure function;
/// no clock, no randomness.
pub fn sign(
    base_string: &str,
    consumer_secret: &str,
    token_secret: Option<&str>,
) -> Result<String, CredentialError> {
    let signing_key = format!(
        "{}&{}",
        percent_encode(consumer_secret),
        percent_encode(token_secret.unwrap_or(""))
    );
    let mut mac = HmacSha256::new_from_slice(signing_key.as_bytes())
        .map_err(|e| CredentialError::Encryption(format!("HMAC key error: {}", e)))?;
    mac.update(base_string.as_bytes());
    Ok(general_purpose::STANDARD.encode(mac.finalize().into_bytes()))
}

/// Everything needed to produce one signed request
pub struct SigningInput<'a> {
    pub method: &'a str,
    pub url: &'a str,
    pub consumer_key: &'a str,
    pub consumer_secret: &'a str,
    /// (token, token_secret) once past the request-token leg
    pub token: Option<(&'a str, &'a str)>,
    /// Additional oauth_* or query parameters included in the signature
    pub extra_params: &'a [(&'a str, &'a str)],
    pub timestamp: u64,
    pub nonce: &'a str,
}

/// Produce the `Authorization: OAuth ...` header value for a request.
/// Deterministic given the input; callers feed timestamp/nonce from a
/// `NonceSource`.
pub fn authorization_header(input: &SigningInput<'_>) -> Result<String, CredentialError> {
    let mut params: BTreeMap<String, String> = BTreeMap::new();
    params.insert("oauth_consumer_key".to_string(), input.consumer_key.to_string());
    params.insert("oauth_nonce".to_string(), input.nonce.to_string());
    params.insert(
        "oauth_signature_method".to_string(),
        "HMAC-SHA256".to_string(),
    );
    params.insert("oauth_timestamp".to_string(), input.timestamp.to_string());
    params.insert("oauth_version".to_string(), "1.0".to_string());
    if let Some((token, _)) = input.token {
        params.insert("oauth_token".to_string(), token.to_string());
    }
    for (key, value) in input.extra_params {
        params.insert((*key).to_string(), (*value).to_string());
    }

    let base = signature_base_string(input.method, input.url, &params);
    let signature = sign(
        &base,
        input.consumer_secret,
        input.token.map(|(_, secret)| secret),
    )?;
    params.insert("oauth_signature".to_string(), signature);

    let header = params
        .iter()
        .filter(|(k, _)| k.starts_with("oauth_"))
        .map(|(k, v)| format!("{}=\"{}\"", percent_encode(k), percent_encode(v)))
        .collect::<Vec<_>>()
        .join(", ");

    Ok(format!("OAuth {}", header))
}

/// Per-broker OAuth1 endpoints and consumer credentials
#[derive(Debug, Clone)]
pub struct Oauth1Provider {
    pub consumer_key: String,
    pub consumer_secret: String,
    pub request_token_url: String,
    pub authorize_url: String,
    pub access_token_url: String,
    pub callback_url: String,
}

/// First leg: obtain a temporary request token/secret pair
pub async fn request_token(
    http: &reqwest::Client,
    provider: &Oauth1Provider,
    nonces: &dyn NonceSource,
) -> Result<(String, String), CredentialError> {
    let nonce = nonces.nonce();
    let header = authorization_header(&SigningInput {
        method: "POST",
        url: &provider.request_token_url,
        consumer_key: &provider.consumer_key,
        consumer_secret: &provider.consumer_secret,
        token: None,
        extra_params: &[("oauth_callback", provider.callback_url.as_str())],
        timestamp: nonces.timestamp(),
        nonce: &nonce,
    })?;

    let body = send_signed(http, &provider.request_token_url, header).await?;
    parse_token_response(&body)
}

/// URL the user is redirected to with the request token attached
pub fn user_authorize_url(
    provider: &Oauth1Provider,
    request_token: &str,
) -> Result<String, CredentialError> {
    let mut url = url::Url::parse(&provider.authorize_url)
        .map_err(|e| CredentialError::TokenExchange(format!("bad authorize URL: {}", e)))?;
    url.query_pairs_mut().append_pair("oauth_token", request_token);
    Ok(url.to_string())
}

/// Second leg: trade the authorized request token + verifier for the
/// permanent access token/secret pair
pub async fn access_token(
    http: &reqwest::Client,
    provider: &Oauth1Provider,
    request_token_pair: (&str, &str),
    verifier: &str,
    nonces: &dyn NonceSource,
) -> Result<(String, String), CredentialError> {
    let nonce = nonces.nonce();
    let header = authorization_header(&SigningInput {
        method: "POST",
        url: &provider.access_token_url,
        consumer_key: &provider.consumer_key,
        consumer_secret: &provider.consumer_secret,
        token: Some(request_token_pair),
        extra_params: &[("oauth_verifier", verifier)],
        timestamp: nonces.timestamp(),
        nonce: &nonce,
    })?;

    let body = send_signed(http, &provider.access_token_url, header).await?;
    parse_token_response(&body)
}

async fn send_signed(
    http: &reqwest::Client,
    url: &str,
    auth_header: String,
) -> Result<String, CredentialError> {
    let response = http
        .post(url)
        .header("Authorization", auth_header)
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
    Ok(body)
}

/// Parse a form-encoded token response body
/// (`oauth_token=...&oauth_token_secret=...`).
pub fn parse_token_response(body: &str) -> Result<(String, String), CredentialError> {
    let mut token = None;
    let mut secret = None;
    for (key, value) in url::form_urlencoded::parse(body.as_bytes()) {
        match key.as_ref() {
            "oauth_token" => token = Some(value.into_owned()),
            "oauth_token_secret" => secret = Some(value.into_owned()),
            _ => {}
        }
    }
    match (token, secret) {
        (Some(t), Some(s)) => Ok((t, s)),
        _ => Err(CredentialError::TokenExchange(format!(
            "missing oauth_token/oauth_token_secret in response: {}",
            body
        ))),
    }
}
