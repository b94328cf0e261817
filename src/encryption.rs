//! At-rest encryption of the stored chat history.
//!
//! Payloads are AES-256-GCM encrypted JSON, stored as
//! `cg1:` + base64(nonce || ciphertext). A fresh random nonce is drawn for
//! every call, so encrypting the same history twice gives different output.

use std::sync::Arc;

use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, KeyInit},
};
use base64::{Engine as _, engine::general_purpose};
use rand::RngCore;
use serde::Serialize;
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};

use crate::config::SecurityConfig;
use crate::error::{ChatGuardError, Result};
use crate::monitor::{SecurityEventKind, SecurityMonitor, Severity};

/// Marks an encrypted payload and its format version.
pub const CIPHERTEXT_PREFIX: &str = "cg1:";

const NONCE_LEN: usize = 12;

/// Used outside production when no key is configured. Anyone with the crate
/// source can decrypt data protected by it.
const DEVELOPMENT_PLACEHOLDER_KEY: &str = "chat-guard-development-placeholder-key";

const KEY_SALT: &[u8] = b"chat_guard/history/v1";

/// Derive the 256-bit cipher key from the configured passphrase.
fn derive_key(passphrase: &str) -> [u8; 32] {
    Sha256::new()
        .chain_update(passphrase.as_bytes())
        .chain_update(KEY_SALT)
        .finalize()
        .into()
}

/// Serializes and (optionally) encrypts values for storage.
///
/// ```
/// use chat_guard::{ContentGuard, HistoryCipher, SecurityConfig};
///
/// let guard = ContentGuard::new(SecurityConfig::builder().encryption_key("s3cret").build().unwrap());
/// let cipher = HistoryCipher::new(guard.config(), guard.monitor().clone());
///
/// let blob = cipher.encrypt(&vec!["bonjour".to_string()]).unwrap();
/// assert!(blob.starts_with("cg1:"));
/// assert_eq!(cipher.decrypt::<Vec<String>>(&blob), Some(vec!["bonjour".to_string()]));
/// assert_eq!(cipher.decrypt::<Vec<String>>("garbage"), None);
/// ```
pub struct HistoryCipher {
    cipher: Option<Aes256Gcm>,
    monitor: Arc<SecurityMonitor>,
}

impl HistoryCipher {
    /// Build a cipher from the configuration. When history encryption is
    /// disabled every payload is plain JSON.
    pub fn new(config: &SecurityConfig, monitor: Arc<SecurityMonitor>) -> Self {
        let cipher = config.enable_history_encryption().then(|| {
            let passphrase = config.encryption_key().unwrap_or(DEVELOPMENT_PLACEHOLDER_KEY);
            Aes256Gcm::new(&derive_key(passphrase).into())
        });
        Self { cipher, monitor }
    }

    pub fn is_enabled(&self) -> bool {
        self.cipher.is_some()
    }

    /// Serialize `data` to JSON and encrypt it.
    pub fn encrypt<T: Serialize + ?Sized>(&self, data: &T) -> Result<String> {
        let json = serde_json::to_string(data)?;
        let Some(cipher) = &self.cipher else {
            return Ok(json);
        };

        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);

        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), json.as_bytes())
            .map_err(|e| {
                self.monitor.log_event(
                    SecurityEventKind::EncryptionFailure,
                    Severity::High,
                    format!("History encryption failed: {e}"),
                );
                ChatGuardError::Encryption(e.to_string())
            })?;

        let mut combined = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        combined.extend_from_slice(&nonce_bytes);
        combined.extend_from_slice(&ciphertext);

        Ok(format!(
            "{CIPHERTEXT_PREFIX}{}",
            general_purpose::STANDARD.encode(&combined)
        ))
    }

    /// Decrypt and deserialize a payload produced by [`encrypt`](Self::encrypt).
    ///
    /// Malformed, foreign or tampered payloads yield `None` and a
    /// medium-severity event rather than an error.
    pub fn decrypt<T: DeserializeOwned>(&self, payload: &str) -> Option<T> {
        match self.try_decrypt(payload) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!("Discarding undecryptable payload: {e}");
                self.monitor.log_event(
                    SecurityEventKind::DecryptionFailure,
                    Severity::Medium,
                    e.to_string(),
                );
                None
            }
        }
    }

    fn try_decrypt<T: DeserializeOwned>(&self, payload: &str) -> Result<T> {
        let Some(cipher) = &self.cipher else {
            return serde_json::from_str(payload)
                .map_err(|e| ChatGuardError::Decryption(format!("invalid JSON: {e}")));
        };

        let encoded = payload
            .trim()
            .strip_prefix(CIPHERTEXT_PREFIX)
            .ok_or_else(|| ChatGuardError::Decryption("payload is not encrypted".into()))?;

        let combined = general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| ChatGuardError::Decryption(format!("invalid base64: {e}")))?;

        if combined.len() <= NONCE_LEN {
            return Err(ChatGuardError::Decryption("ciphertext too short".into()));
        }

        let (nonce_bytes, ciphertext) = combined.split_at(NONCE_LEN);
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| ChatGuardError::Decryption("authentication failed".into()))?;

        serde_json::from_slice(&plaintext)
            .map_err(|e| ChatGuardError::Decryption(format!("invalid JSON: {e}")))
    }
}
