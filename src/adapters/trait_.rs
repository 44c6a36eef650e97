//! Provider adapter trait definition
//!
//! Defines the interface every external credential registry adapter implements,
//! along with the normalized record it produces.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::metadata::ProviderMetadata;

/// Adapter errors, classified by whether retrying can help
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    /// Credential exchange or token use was refused
    #[error("authentication failed: {message}")]
    Authentication { message: String, transient: bool },
    /// Non-success HTTP status from the provider
    #[error("provider returned HTTP {status}: {message}")]
    Http { status: u16, message: String },
    /// Connection, DNS or timeout failure
    #[error("network error: {0}")]
    Network(String),
    /// Response body could not be decoded
    #[error("malformed provider response: {0}")]
    Malformed(String),
    /// A payload is missing required fields or carries invalid values
    #[error("invalid credential payload: {0}")]
    Validation(String),
    /// Adapter is missing settings it needs
    #[error("provider not configured: {0}")]
    Configuration(String),
}

impl ProviderError {
    /// Whether the failure is worth retrying
    pub fn transient(&self) -> bool {
        match self {
            ProviderError::Authentication { transient, .. } => *transient,
            ProviderError::Http { status, .. } => *status >= 500 || matches!(*status, 408 | 429),
            ProviderError::Network(_) => true,
            ProviderError::Malformed(_)
            | ProviderError::Validation(_)
            | ProviderError::Configuration(_) => false,
        }
    }

    /// Upstream HTTP status, when the failure carried one
    pub fn upstream_status(&self) -> Option<u16> {
        match self {
            ProviderError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Error taxonomy bucket recorded on DLQ items
    pub fn kind(&self) -> &'static str {
        match self {
            ProviderError::Authentication { .. } => "authentication",
            ProviderError::Validation(_) | ProviderError::Malformed(_) => "validation",
            ProviderError::Configuration(_) => "internal",
            _ if self.transient() => "transient",
            _ => "provider",
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(error: reqwest::Error) -> Self {
        if let Some(status) = error.status() {
            ProviderError::Http {
                status: status.as_u16(),
                message: error.to_string(),
            }
        } else if error.is_decode() {
            ProviderError::Malformed(error.to_string())
        } else {
            ProviderError::Network(error.to_string())
        }
    }
}

/// An authenticated provider session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub access_token: String,
    pub expires_at: DateTime<Utc>,
}

impl Session {
    /// True when the session expires within `margin_seconds`
    pub fn expires_within(&self, margin_seconds: i64) -> bool {
        self.expires_at - chrono::Duration::seconds(margin_seconds) <= Utc::now()
    }
}

/// Position in a provider's credential feed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCursor {
    /// Only credentials changed at or after this instant are requested
    pub since: DateTime<Utc>,
    /// Opaque provider page token; `None` means the first page
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_token: Option<String>,
}

impl SyncCursor {
    /// Cursor used for a full resync
    pub fn epoch() -> Self {
        Self {
            since: DateTime::<Utc>::UNIX_EPOCH,
            page_token: None,
        }
    }

    pub fn since(since: DateTime<Utc>) -> Self {
        Self {
            since,
            page_token: None,
        }
    }
}

/// A feed item the adapter could not normalize
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectedRecord {
    pub provider_credential_id: Option<String>,
    pub reason: String,
    pub payload: serde_json::Value,
}

/// One page of a provider feed
#[derive(Debug, Clone, Default)]
pub struct FetchedPage {
    pub items: Vec<RawExternalCredential>,
    pub rejected: Vec<RejectedRecord>,
    pub next_cursor: Option<SyncCursor>,
    pub has_more: bool,
}

/// A provider credential normalized into the platform's vocabulary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawExternalCredential {
    pub provider_id: String,
    pub provider_credential_id: String,
    /// Registry identifier of the issuing partner, when the payload names one
    #[serde(default)]
    pub issuer_registry_id: Option<String>,
    pub candidate_name: String,
    #[serde(default)]
    pub candidate_email: Option<String>,
    #[serde(default)]
    pub candidate_phone: Option<String>,
    /// Learner identifier within the provider's registry
    #[serde(default)]
    pub candidate_registry_id: Option<String>,
    pub title: String,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub issue_date: Option<NaiveDate>,
    #[serde(default)]
    pub sector: Option<String>,
    #[serde(default)]
    pub nsqf_level: Option<i32>,
    #[serde(default)]
    pub training_hours_max: Option<u32>,
    #[serde(default)]
    pub awarding_bodies: Vec<String>,
    #[serde(default)]
    pub certificate_url: Option<String>,
    pub raw_payload: serde_json::Value,
    /// Signature delivered alongside the payload, if any
    #[serde(default)]
    pub signature: Option<String>,
    /// How authenticity is established (e.g. `nsdc_api`, `hmac_sha256`)
    pub verification_method: String,
    #[serde(default)]
    pub signature_verified: bool,
}

impl RawExternalCredential {
    /// `provider:issuer_registry_id:credential_id`, falling back to the
    /// provider id when the payload names no issuer
    pub fn idempotency_key(&self) -> String {
        format!(
            "{}:{}:{}",
            self.provider_id,
            self.issuer_registry_id
                .as_deref()
                .unwrap_or(&self.provider_id),
            self.provider_credential_id
        )
    }
}

/// Capability interface implemented once per external registry.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Stable provider id used as the registry key and database key
    fn provider_id(&self) -> &str;

    /// Descriptive metadata for listing and registration
    fn metadata(&self) -> ProviderMetadata;

    /// Obtain a session, reusing a cached one while it stays valid.
    async fn authenticate(&self) -> Result<Session, ProviderError>;

    /// Fetch one page of credentials changed since `cursor`.
    async fn fetch_since(
        &self,
        session: &Session,
        cursor: &SyncCursor,
        page_size: u32,
    ) -> Result<FetchedPage, ProviderError>;

    /// Check a pushed payload's signature against the adapter's key material.
    fn verify_signature(&self, raw_payload: &[u8], signature_header: Option<&str>) -> bool;

    /// Normalize a pushed webhook body.
    fn parse_webhook(&self, body: &[u8]) -> Result<RawExternalCredential, ProviderError>;

    /// Normalize one raw feed item, as `fetch_since` does for each page entry.
    /// Used to replay feed items that were rejected during a poll.
    fn parse_feed_item(
        &self,
        item: &serde_json::Value,
    ) -> Result<RawExternalCredential, ProviderError>;
}
