//! Secure secret loading
//!
//! Application-level secrets (OAuth client secrets, consumer secrets, the
//! credential encryption key) are loaded from the environment into
//! `Zeroizing` wrappers so they are wiped from memory when dropped.
//! Broker *user* credentials never pass through here; those live
//! encrypted in the database and are handled by the credential manager.

use base64::{engine::general_purpose, Engine as _};
use std::env;
use zeroize::Zeroizing;

/// Error type for secret loading operations
#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    #[error("Environment variable not set: {0}")]
    EnvVarNotSet(String),

    #[error("Secret validation failed: {0}")]
    ValidationFailed(String),
}

/// Load a required secret from an environment variable
pub fn require_secret(env_var_name: &str) -> Result<Zeroizing<String>, SecretError> {
    env::var(env_var_name)
        .map(Zeroizing::new)
        .map_err(|_| SecretError::EnvVarNotSet(env_var_name.to_string()))
}

/// Load an optional secret; absent means the corresponding broker flow
/// stays unconfigured.
pub fn optional_secret(env_var_name: &str) -> Option<Zeroizing<String>> {
    env::var(env_var_name).ok().map(Zeroizing::new)
}

/// Validate that a secret meets minimum security requirements
pub fn validate_secret_strength(secret: &str, min_length: usize) -> Result<(), SecretError> {
    if secret.len() < min_length {
        return Err(SecretError::ValidationFailed(format!(
            "Secret too short: {} characters (minimum: {})",
            secret.len(),
            min_length
        )));
    }

    let weak_patterns = ["test", "demo", "example", "placeholder", "changeme", "12345"];
    let secret_lower = secret.to_lowercase();
    for pattern in &weak_patterns {
        if secret_lower.contains(pattern) {
            return Err(SecretError::ValidationFailed(format!(
                "Secret contains weak pattern: {}",
                pattern
            )));
        }
    }

    Ok(())
}

/// Load the credential encryption key: base64-encoded, exactly 32 bytes
/// once decoded.
pub fn require_encryption_key(env_var_name: &str) -> Result<Zeroizing<String>, SecretError> {
    let key = require_secret(env_var_name)?;
    let decoded = Zeroizing::new(general_purpose::STANDARD.decode(key.trim()).map_err(|e| {
        SecretError::ValidationFailed(format!("{} is not valid base64: {}", env_var_name, e))
    })?);
    if decoded.len() != 32 {
        return Err(SecretError::ValidationFailed(format!(
            "{} must decode to 32 bytes, got {}",
            env_var_name,
            decoded.len()
        )));
    }
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_require_secret_missing() {
        assert!(require_secret("TRADELINK_NONEXISTENT_SECRET").is_err());
    }

    #[test]
    fn test_require_secret_present() {
        env::set_var("TRADELINK_SECRET_UNDER_TEST", "value-1234567890");
        let secret = require_secret("TRADELINK_SECRET_UNDER_TEST").unwrap();
        assert_eq!(&*secret, "value-1234567890");
        env::remove_var("TRADELINK_SECRET_UNDER_TEST");
    }

    #[test]
    fn test_validate_secret_strength() {
        assert!(validate_secret_strength("short", 32).is_err());
        assert!(validate_secret_strength(&"test".repeat(10), 32).is_err());
        assert!(validate_secret_strength(&"a".repeat(32), 32).is_ok());
    }

    #[test]
    fn test_encryption_key_length_check() {
        env::set_var(
            "TRADELINK_ENC_KEY_UNDER_TEST",
            base64::engine::general_purpose::STANDARD.encode([7u8; 32]),
        );
        assert!(require_encryption_key("TRADELINK_ENC_KEY_UNDER_TEST").is_ok());

        env::set_var(
            "TRADELINK_ENC_KEY_UNDER_TEST",
            base64::engine::general_purpose::STANDARD.encode([7u8; 16]),
        );
        assert!(require_encryption_key("TRADELINK_ENC_KEY_UNDER_TEST").is_err());
        env::remove_var("TRADELINK_ENC_KEY_UNDER_TEST");
    }
}
