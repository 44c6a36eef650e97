//! # Webhook Signature Verification
//!
//! HMAC-SHA256 signature checks for provider-pushed payloads, using
//! constant-time comparison to prevent timing attacks.

use axum::http::{HeaderMap, StatusCode};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::debug;

type HmacSha256 = Hmac<Sha256>;

/// Headers a provider may use to carry the payload signature, in lookup order
pub const SIGNATURE_HEADERS: &[&str] = &["x-signature", "x-webhook-signature"];

const SIGNATURE_PREFIX: &str = "sha256=";

/// Errors that can occur during webhook signature verification
#[derive(Debug, thiserror::Error)]
pub enum VerificationError {
    #[error("Missing required signature header")]
    MissingSignature,

    #[error("Invalid signature format: {reason}")]
    InvalidSignatureFormat { reason: String },

    #[error("Signature verification failed")]
    VerificationFailed,

    #[error("Webhook verification not configured for provider: {provider}")]
    NotConfigured { provider: String },
}

impl VerificationError {
    /// Returns the appropriate HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            VerificationError::MissingSignature
            | VerificationError::InvalidSignatureFormat { .. }
            | VerificationError::VerificationFailed
            | VerificationError::NotConfigured { .. } => StatusCode::UNAUTHORIZED,
        }
    }
}

/// Result type for webhook verification
pub type VerificationResult<T> = Result<T, VerificationError>;

/// Verifies a hex HMAC-SHA256 signature (optionally prefixed with `sha256=`)
/// over the raw request body.
pub fn verify_hmac_sha256(
    body: &[u8],
    signature: Option<&str>,
    secret: &str,
) -> VerificationResult<()> {
    debug!(body_size = body.len(), "Starting HMAC signature verification");

    let signature = signature
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or(VerificationError::MissingSignature)?;
    let provided_hex = signature.strip_prefix(SIGNATURE_PREFIX).unwrap_or(signature);

    let provided_bytes =
        hex::decode(provided_hex).map_err(|_| VerificationError::InvalidSignatureFormat {
            reason: "signature contains invalid hex".to_string(),
        })?;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| VerificationError::VerificationFailed)?;
    mac.update(body);
    let expected_bytes = mac.finalize().into_bytes();

    let expected: &[u8] = expected_bytes.as_ref();
    if subtle::ConstantTimeEq::ct_eq(expected, &provided_bytes[..]).into() {
        Ok(())
    } else {
        Err(VerificationError::VerificationFailed)
    }
}

/// Computes the hex HMAC-SHA256 of `body`; the counterpart of [`verify_hmac_sha256`].
pub fn sign_hmac_sha256(body: &[u8], secret: &str) -> String {
    // HMAC accepts keys of any length, so this cannot fail.
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

/// Returns the first signature header present on the request.
pub fn signature_from_headers(headers: &HeaderMap) -> Option<String> {
    SIGNATURE_HEADERS.iter().find_map(|name| {
        headers
            .get(*name)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
    })
}
