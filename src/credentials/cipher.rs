//! Credential encryption at rest
//!
//! AES-256-GCM over the serialized credential JSON. The output blob is
//! `base64(nonce || ciphertext)` with a fresh 96-bit nonce per
//! encryption, so identical credentials never produce identical blobs.
//! The key comes from `CREDENTIALS_ENCRYPTION_KEY` (base64, 32 bytes).

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::{engine::general_purpose, Engine as _};
use zeroize::Zeroizing;

use super::CredentialError;
use crate::domain::entities::credentials::BrokerCredentials;

const NONCE_LEN: usize = 12;

pub struct CredentialCipher {
    cipher: Aes256Gcm,
}

impl CredentialCipher {
    /// Build a cipher from a base64-encoded 256-bit key
    pub fn new(key_b64: &str) -> Result<Self, CredentialError> {
        let key_bytes = Zeroizing::new(
            general_purpose::STANDARD
                .decode(key_b64.trim())
                .map_err(|e| CredentialError::InvalidKey(format!("not valid base64: {}", e)))?,
        );
        if key_bytes.len() != 32 {
            return Err(CredentialError::InvalidKey(format!(
                "expected 32 bytes, got {}",
                key_bytes.len()
            )));
        }
        let key = Key::<Aes256Gcm>::from_slice(&key_bytes);
        Ok(Self {
            cipher: Aes256Gcm::new(key),
        })
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<String, CredentialError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|e| CredentialError::Encryption(e.to_string()))?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);
        Ok(general_purpose::STANDARD.encode(blob))
    }

    pub fn decrypt(&self, blob_b64: &str) -> Result<Zeroizing<Vec<u8>>, CredentialError> {
        let blob = general_purpose::STANDARD
            .decode(blob_b64)
            .map_err(|e| CredentialError::Decryption(format!("not valid base64: {}", e)))?;
        if blob.len() <= NONCE_LEN {
            return Err(CredentialError::Decryption("blob too short".to_string()));
        }
        let (nonce, ciphertext) = blob.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| {
                CredentialError::Decryption("authentication tag mismatch".to_string())
            })?;
        Ok(Zeroizing::new(plaintext))
    }

    /// Serialize and encrypt a credential set for storage
    pub fn seal(&self, credentials: &BrokerCredentials) -> Result<String, CredentialError> {
        let json = Zeroizing::new(
            serde_json::to_vec(credentials)
                .map_err(|e| CredentialError::Serialization(e.to_string()))?,
        );
        self.encrypt(&json)
    }

    /// Decrypt and deserialize a stored credential blob
    pub fn open(&self, blob_b64: &str) -> Result<BrokerCredentials, CredentialError> {
        let plaintext = self.decrypt(blob_b64)?;
        serde_json::from_slice(&plaintext)
            .map_err(|e| CredentialError::Serialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // 32 zero bytes, base64
    const TEST_KEY: &str = "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=";

    fn cipher() -> CredentialCipher {
        CredentialCipher::new(TEST_KEY).unwrap()
    }

    #[test]
    fn test_rejects_short_key() {
        let short = general_purpose::STANDARD.encode([0u8; 16]);
        assert!(CredentialCipher::new(&short).is_err());
    }

    #[test]
    fn test_rejects_garbage_key() {
        assert!(CredentialCipher::new("not base64 at all!!!").is_err());
    }

    #[test]
    fn test_roundtrip() {
        let c = cipher();
        let blob = c.encrypt(b"hello").unwrap();
        let back = c.decrypt(&blob).unwrap();
        assert_eq!(&*back, b"hello");
    }

    #[test]
    fn test_fresh_nonce_per_encryption() {
        let c = cipher();
        let a = c.encrypt(b"same plaintext").unwrap();
        let b = c.encrypt(b"same plaintext").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_tamper_detected() {
        let c = cipher();
        let blob = c.encrypt(b"secret").unwrap();
        let mut bytes = general_purpose::STANDARD.decode(&blob).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        let tampered = general_purpose::STANDARD.encode(bytes);
        assert!(c.decrypt(&tampered).is_err());
    }

    #[test]
    fn test_seal_open_credentials() {
        let c = cipher();
        let creds = BrokerCredentials::ApiKey {
            key: "alpaca_key_abcdef".to_string(),
            secret: "alpaca_secret_123456".to_string(),
            passphrase: Some("pp".to_string()),
        };
        let blob = c.seal(&creds).unwrap();
        // Ciphertext must not leak the plaintext
        assert!(!blob.contains("alpaca_key_abcdef"));
        let back = c.open(&blob).unwrap();
        match back {
            BrokerCredentials::ApiKey { ref key, ref secret, ref passphrase } => {
                assert_eq!(key, "alpaca_key_abcdef");
                assert_eq!(secret, "alpaca_secret_123456");
                assert_eq!(passphrase.as_deref(), Some("pp"));
            }
            _ => panic!("wrong variant"),
        }
    }
}
