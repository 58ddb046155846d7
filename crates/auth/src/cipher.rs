//! Encryption at rest for virtual key tokens and BYOK provider keys.
//!
//! Format: `base64(nonce(12) || AES-256-GCM(plaintext) || tag(16))`, with a
//! fresh random nonce per encryption.

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use rand::RngCore as _;
use secrecy::{ExposeSecret as _, SecretString};
use std::fmt;
use thiserror::Error;
use vkgate_types::GateError;
use zeroize::Zeroizing;

const KEY_SIZE: usize = 32;
const NONCE_SIZE: usize = 12;
const TAG_SIZE: usize = 16;

#[derive(Debug, Error)]
pub enum CipherError {
    /// The environment variable naming the master key is unset or empty.
    #[error("master key variable {0} is not set")]
    MissingKey(String),

    #[error("invalid master key: {0}")]
    InvalidKey(String),

    #[error("encryption failed")]
    Encrypt,

    /// Wrong key, truncated input, or tampered ciphertext.
    #[error("decryption failed: {0}")]
    Decrypt(String),
}

impl From<CipherError> for GateError {
    fn from(e: CipherError) -> Self {
        Self::Crypto(e.to_string())
    }
}

/// Symmetric cipher for secrets persisted in the credential store.
pub struct TokenCipher {
    cipher: Aes256Gcm,
}

impl fmt::Debug for TokenCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TokenCipher([REDACTED])")
    }
}

impl TokenCipher {
    /// Builds a cipher from raw key bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CipherError::InvalidKey`] unless `key` is exactly 32 bytes.
    pub fn from_bytes(key: &[u8]) -> Result<Self, CipherError> {
        if key.len() != KEY_SIZE {
            return Err(CipherError::InvalidKey(format!(
                "expected {KEY_SIZE} bytes, got {}",
                key.len()
            )));
        }
        let cipher =
            Aes256Gcm::new_from_slice(key).map_err(|e| CipherError::InvalidKey(e.to_string()))?;
        Ok(Self { cipher })
    }

    /// Builds a cipher from a base64-encoded 32-byte key.
    ///
    /// # Errors
    ///
    /// Returns [`CipherError::InvalidKey`] if the value is not valid base64
    /// or does not decode to 32 bytes.
    pub fn from_base64(encoded: &str) -> Result<Self, CipherError> {
        let key = Zeroizing::new(
            BASE64
                .decode(encoded.trim())
                .map_err(|e| CipherError::InvalidKey(e.to_string()))?,
        );
        Self::from_bytes(&key)
    }

    /// Reads a base64 master key from the environment variable `var`.
    ///
    /// # Errors
    ///
    /// Returns [`CipherError::MissingKey`] if the variable is unset or empty,
    /// or [`CipherError::InvalidKey`] if its value is malformed.
    pub fn from_env(var: &str) -> Result<Self, CipherError> {
        let value = Zeroizing::new(std::env::var(var).unwrap_or_default());
        if value.trim().is_empty() {
            return Err(CipherError::MissingKey(var.to_string()));
        }
        Self::from_base64(&value)
    }

    /// Generates a fresh random master key, base64-encoded.
    #[must_use]
    pub fn generate_key() -> SecretString {
        let mut key = Zeroizing::new([0u8; KEY_SIZE]);
        OsRng.fill_bytes(&mut *key);
        SecretString::from(BASE64.encode(&*key))
    }

    /// Encrypts `plaintext` with a fresh nonce.
    ///
    /// # Errors
    ///
    /// Returns [`CipherError::Encrypt`] if the AEAD operation fails.
    pub fn encrypt(&self, plaintext: &str) -> Result<String, CipherError> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| CipherError::Encrypt)?;

        let mut blob = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(blob))
    }

    /// Encrypts a secret without exposing it beyond this call.
    ///
    /// # Errors
    ///
    /// Returns [`CipherError::Encrypt`] if the AEAD operation fails.
    pub fn encrypt_secret(&self, secret: &SecretString) -> Result<String, CipherError> {
        self.encrypt(secret.expose_secret())
    }

    /// Decrypts a value produced by [`encrypt`](Self::encrypt).
    ///
    /// # Errors
    ///
    /// Returns [`CipherError::Decrypt`] if the input is malformed, was
    /// encrypted under another key, or has been tampered with.
    pub fn decrypt(&self, encoded: &str) -> Result<SecretString, CipherError> {
        let data = BASE64
            .decode(encoded.trim())
            .map_err(|e| CipherError::Decrypt(format!("invalid base64: {e}")))?;
        if data.len() < NONCE_SIZE + TAG_SIZE {
            return Err(CipherError::Decrypt("ciphertext too short".into()));
        }
        let (nonce_bytes, ciphertext) = data.split_at(NONCE_SIZE);
        let nonce = Nonce::from_slice(nonce_bytes);

        let plaintext = Zeroizing::new(
            self.cipher
                .decrypt(nonce, ciphertext)
                .map_err(|_| CipherError::Decrypt("authentication failed".into()))?,
        );
        let text = std::str::from_utf8(&plaintext)
            .map_err(|_| CipherError::Decrypt("plaintext is not UTF-8".into()))?;
        Ok(SecretString::from(text.to_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret as _;

    fn cipher() -> TokenCipher {
        TokenCipher::from_bytes(&[7u8; KEY_SIZE]).unwrap()
    }

    #[test]
    fn test_encrypt_decrypt() {
        let c = cipher();
        let enc = c.encrypt("sk-virtual-123").unwrap();
        assert!(!enc.contains("sk-virtual-123"));
        assert_eq!(c.decrypt(&enc).unwrap().expose_secret(), "sk-virtual-123");
    }

    #[test]
    fn test_nonce_is_fresh() {
        let c = cipher();
        assert_ne!(c.encrypt("same").unwrap(), c.encrypt("same").unwrap());
    }

    #[test]
    fn test_wrong_key_fails() {
        let enc = cipher().encrypt("secret").unwrap();
        let other = TokenCipher::from_bytes(&[8u8; KEY_SIZE]).unwrap();
        assert!(matches!(other.decrypt(&enc), Err(CipherError::Decrypt(_))));
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let c = cipher();
        let enc = c.encrypt("secret").unwrap();
        let mut raw = BASE64.decode(&enc).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x01;
        assert!(c.decrypt(&BASE64.encode(raw)).is_err());
    }

    #[test]
    fn test_short_input_fails() {
        let err = cipher().decrypt(&BASE64.encode([0u8; 8])).unwrap_err();
        assert!(err.to_string().contains("too short"));
        assert!(cipher().decrypt("not base64!!").is_err());
    }

    #[test]
    fn test_from_base64_validates_length() {
        assert!(TokenCipher::from_base64(&BASE64.encode([1u8; 16])).is_err());
        let key = TokenCipher::generate_key();
        let c = TokenCipher::from_base64(key.expose_secret()).unwrap();
        let enc = c.encrypt("x").unwrap();
        assert_eq!(c.decrypt(&enc).unwrap().expose_secret(), "x");
    }

    #[test]
    fn test_from_env_missing() {
        let err = TokenCipher::from_env("VKGATE_TEST_UNSET_MASTER_KEY_9f3a").unwrap_err();
        assert!(matches!(err, CipherError::MissingKey(_)));
    }

    #[test]
    fn test_debug_is_redacted() {
        assert_eq!(format!("{:?}", cipher()), "TokenCipher([REDACTED])");
    }

    #[test]
    fn test_into_gate_error() {
        let err: GateError = CipherError::Encrypt.into();
        assert!(matches!(err, GateError::Crypto(_)));
    }
}
