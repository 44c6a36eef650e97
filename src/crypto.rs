//! Payload encryption using AES-256-GCM
//!
//! Provider payloads carry learner PII, so the columns that keep them
//! (`external_credentials.raw_payload`, `pending_matches.credential` and
//! `dlq_items.job_id`) hold a sealed envelope instead of the plain JSON.
//! The additional authenticated data binds each envelope to the row it was
//! written for, so a ciphertext copied onto another row fails to open.

#![allow(deprecated)]

use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, AeadCore, KeyInit, OsRng, Payload},
};
use base64::{Engine as _, engine::general_purpose};
use serde_json::{Value as JsonValue, json};
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::config::AppConfig;

const VERSION_ENCRYPTED: u8 = 0x01;
const VERSION_FIELD_LEN: usize = 1;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const MIN_ENCRYPTED_LEN: usize = VERSION_FIELD_LEN + NONCE_LEN + TAG_LEN;

/// Marker field of a sealed JSON envelope
const ENVELOPE_ALG: &str = "aes-256-gcm";

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),
    #[error("decryption failed: {0}")]
    DecryptionFailed(String),
    #[error("invalid ciphertext format")]
    InvalidFormat,
    #[error("empty ciphertext")]
    EmptyCiphertext,
    #[error("payload is encrypted but no crypto key is configured")]
    MissingKey,
    #[error("sealed payload is not valid JSON: {0}")]
    InvalidJson(String),
}

/// Secure wrapper for encryption keys with zeroization
#[derive(Debug, Clone, Zeroize, ZeroizeOnDrop)]
pub struct ZeroizingKey(Vec<u8>);

pub type CryptoKey = ZeroizingKey;

impl CryptoKey {
    /// Create a new crypto key from bytes
    pub fn new(bytes: Vec<u8>) -> Result<Self, CryptoError> {
        if bytes.len() != 32 {
            return Err(CryptoError::EncryptionFailed(
                "Invalid key length: expected 32 bytes".to_string(),
            ));
        }
        Ok(ZeroizingKey(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Encrypt bytes using AES-256-GCM
pub fn encrypt_bytes(
    key: &CryptoKey,
    aad: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

    let mut ciphertext = cipher
        .encrypt(
            &nonce,
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

    // version || nonce || ciphertext+tag
    let mut result = Vec::with_capacity(VERSION_FIELD_LEN + NONCE_LEN + ciphertext.len());
    result.push(VERSION_ENCRYPTED);
    result.extend_from_slice(&nonce);
    result.append(&mut ciphertext);

    Ok(result)
}

/// Decrypt bytes using AES-256-GCM
pub fn decrypt_bytes(
    key: &CryptoKey,
    aad: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if ciphertext.is_empty() {
        return Err(CryptoError::EmptyCiphertext);
    }
    if !is_encrypted_payload(ciphertext) {
        return Err(CryptoError::InvalidFormat);
    }

    let nonce = Nonce::from_slice(&ciphertext[VERSION_FIELD_LEN..VERSION_FIELD_LEN + NONCE_LEN]);
    let tag_and_ct = &ciphertext[VERSION_FIELD_LEN + NONCE_LEN..];

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
    cipher
        .decrypt(
            nonce,
            Payload {
                msg: tag_and_ct,
                aad,
            },
        )
        .map_err(|e| CryptoError::DecryptionFailed(e.to_string()))
}

/// Determine if a payload is using the encrypted format
pub fn is_encrypted_payload(ciphertext: &[u8]) -> bool {
    ciphertext.len() >= MIN_ENCRYPTED_LEN && ciphertext[0] == VERSION_ENCRYPTED
}

/// Seals and opens JSON column values.
///
/// Without a key values are stored as they are; this is only allowed for the
/// `local` and `test` profiles. Opening passes plain values through, so rows
/// written before a key was configured stay readable.
#[derive(Debug, Clone, Default)]
pub struct PayloadCipher {
    key: Option<CryptoKey>,
}

impl PayloadCipher {
    pub fn new(key: Option<CryptoKey>) -> Self {
        Self { key }
    }

    pub fn from_config(config: &AppConfig) -> Result<Self, CryptoError> {
        let key = config.crypto_key.clone().map(CryptoKey::new).transpose()?;
        if key.is_none() {
            tracing::warn!(
                profile = %config.profile,
                "No crypto key configured; provider payloads are stored unencrypted"
            );
        }
        Ok(Self::new(key))
    }

    pub fn is_enabled(&self) -> bool {
        self.key.is_some()
    }

    /// Wraps a value as `{"alg": "aes-256-gcm", "sealed": "<base64>"}`.
    pub fn seal(&self, aad: &str, value: &JsonValue) -> Result<JsonValue, CryptoError> {
        let Some(key) = &self.key else {
            return Ok(value.clone());
        };
        let plaintext =
            serde_json::to_vec(value).map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;
        let sealed = encrypt_bytes(key, aad.as_bytes(), &plaintext)?;
        Ok(json!({
            "alg": ENVELOPE_ALG,
            "sealed": general_purpose::STANDARD.encode(sealed),
        }))
    }

    pub fn open(&self, aad: &str, stored: &JsonValue) -> Result<JsonValue, CryptoError> {
        let Some(encoded) = sealed_body(stored) else {
            return Ok(stored.clone());
        };
        let key = self.key.as_ref().ok_or(CryptoError::MissingKey)?;
        let bytes = general_purpose::STANDARD
            .decode(encoded)
            .map_err(|_| CryptoError::InvalidFormat)?;
        let plaintext = decrypt_bytes(key, aad.as_bytes(), &bytes)?;
        serde_json::from_slice(&plaintext).map_err(|e| CryptoError::InvalidJson(e.to_string()))
    }
}

/// Whether a stored column value is a sealed envelope
pub fn is_sealed(stored: &JsonValue) -> bool {
    sealed_body(stored).is_some()
}

fn sealed_body(stored: &JsonValue) -> Option<&str> {
    let object = stored.as_object()?;
    if object.len() != 2 || object.get("alg")?.as_str()? != ENVELOPE_ALG {
        return None;
    }
    object.get("sealed")?.as_str()
}
