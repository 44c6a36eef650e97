//! # Dead Letter Queue
//!
//! Failed units of ingestion work. Each item stores a [`JobHandle`] holding
//! the complete input of the failed step, so a retry re-enters the pipeline
//! with exactly what the first attempt saw. Replay itself lives on the
//! orchestrator; this module owns the handle format and bookkeeping.
//!
//! A unit of work has at most one item. Failing again before the item is
//! resolved bumps its attempt count instead of adding another row.

use std::fmt;

use metrics::counter;
use sea_orm::DbErr;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::adapters::{ProviderError, RawExternalCredential};
use crate::crypto::PayloadCipher;
use crate::models::dlq_item;
use crate::repositories::{DlqRepository, NewDlqItem};
use crate::telemetry::metric;

/// Job type labels stored in `dlq_items.job_type`
pub mod job_type {
    pub const WEBHOOK_INGEST: &str = "webhook-ingest";
    pub const POLL_RECORD: &str = "poll-record";
    pub const POLL_ITEM: &str = "poll-item";
    pub const POLL_SYNC: &str = "poll-sync";
}

/// Failure reasons stored in `dlq_items.reason`
pub mod reason {
    pub const SIGNATURE_INVALID: &str = "signature_invalid";
    pub const VALIDATION_FAILED: &str = "validation_failed";
    pub const PROVIDER_UNAVAILABLE: &str = "provider_unavailable";
    pub const PROCESSING_FAILED: &str = "processing_failed";
}

/// Everything needed to replay a failed unit of work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobHandle {
    /// A pushed webhook, kept byte-for-byte with the signature it arrived with
    WebhookIngest {
        provider_id: String,
        #[serde(rename = "body_base64", with = "base64_body")]
        body: Vec<u8>,
        signature: Option<String>,
    },
    /// A feed item the adapter could not normalize
    PollRecord {
        provider_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        provider_credential_id: Option<String>,
        payload: JsonValue,
    },
    /// A normalized feed item whose ingestion failed
    PollItem {
        provider_id: String,
        credential: Box<RawExternalCredential>,
    },
    /// A provider sync that exhausted its transient retry budget
    PollSync { provider_id: String, full_sync: bool },
}

impl JobHandle {
    pub fn job_type(&self) -> &'static str {
        match self {
            JobHandle::WebhookIngest { .. } => job_type::WEBHOOK_INGEST,
            JobHandle::PollRecord { .. } => job_type::POLL_RECORD,
            JobHandle::PollItem { .. } => job_type::POLL_ITEM,
            JobHandle::PollSync { .. } => job_type::POLL_SYNC,
        }
    }

    pub fn provider_id(&self) -> &str {
        match self {
            JobHandle::WebhookIngest { provider_id, .. }
            | JobHandle::PollRecord { provider_id, .. }
            | JobHandle::PollItem { provider_id, .. }
            | JobHandle::PollSync { provider_id, .. } => provider_id,
        }
    }

    /// Identity of the unit of work: `job_type:provider_id:subject`, where
    /// the subject is the provider credential id when one is known and a
    /// SHA-256 of the payload otherwise.
    pub fn dedupe_key(&self) -> String {
        let subject = match self {
            JobHandle::WebhookIngest { body, .. } => digest(body),
            JobHandle::PollRecord {
                provider_credential_id: Some(id),
                ..
            } => id.clone(),
            JobHandle::PollRecord { payload, .. } => {
                digest(&serde_json::to_vec(payload).unwrap_or_default())
            }
            JobHandle::PollItem { credential, .. } => credential.provider_credential_id.clone(),
            JobHandle::PollSync { full_sync: true, .. } => "full".to_string(),
            JobHandle::PollSync { full_sync: false, .. } => "incremental".to_string(),
        };
        format!("{}:{}:{subject}", self.job_type(), self.provider_id())
    }
}

fn digest(bytes: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(bytes)))
}

/// Webhook bodies are stored as standard base64 so non-UTF-8 bytes replay intact.
mod base64_body {
    use base64::{Engine as _, engine::general_purpose};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&general_purpose::STANDARD.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        general_purpose::STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

/// Error taxonomy recorded on each item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transient,
    Authentication,
    Validation,
    Integrity,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Transient => "transient",
            ErrorKind::Authentication => "authentication",
            ErrorKind::Validation => "validation",
            ErrorKind::Integrity => "integrity",
            ErrorKind::Internal => "internal",
        }
    }

    pub fn from_provider_error(error: &ProviderError) -> Self {
        match error.kind() {
            "authentication" => ErrorKind::Authentication,
            "validation" => ErrorKind::Validation,
            "transient" => ErrorKind::Transient,
            _ => ErrorKind::Internal,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DlqError {
    #[error("DLQ item {0} not found")]
    NotFound(Uuid),
    #[error("DLQ item {id} cannot be replayed: {message}")]
    InvalidJob { id: Uuid, message: String },
    #[error(transparent)]
    Database(#[from] DbErr),
}

/// Result of a manual retry
#[derive(Debug, Clone)]
pub enum RetryOutcome {
    /// The job succeeded and the item was removed
    Resolved { detail: String },
    /// The job failed again; the item stays with its attempt count bumped
    Failed { item: dlq_item::Model, error: String },
}

/// Bookkeeping over [`DlqRepository`]
#[derive(Debug, Clone)]
pub struct DeadLetterQueue {
    repo: DlqRepository,
    cipher: PayloadCipher,
}

impl DeadLetterQueue {
    pub fn new(repo: DlqRepository, cipher: PayloadCipher) -> Self {
        Self { repo, cipher }
    }

    /// Persists a failed job, or records another failure on the unresolved
    /// item for the same unit of work.
    pub async fn push(
        &self,
        handle: &JobHandle,
        reason: &str,
        kind: ErrorKind,
        error: &str,
    ) -> Result<dlq_item::Model, DbErr> {
        let dedupe_key = handle.dedupe_key();

        if let Some(existing) = self.repo.find_by_dedupe_key(&dedupe_key).await? {
            return self.record_redelivery(existing, reason, kind, error).await;
        }

        let job_id = serde_json::to_value(handle)
            .map_err(|e| DbErr::Custom(format!("failed to encode job handle: {e}")))?;
        let job_id = self
            .cipher
            .seal(&job_aad(&dedupe_key), &job_id)
            .map_err(|e| DbErr::Custom(format!("failed to seal job handle: {e}")))?;

        let inserted = self
            .repo
            .insert(NewDlqItem {
                job_type: handle.job_type().to_string(),
                job_id,
                dedupe_key: dedupe_key.clone(),
                provider_id: Some(handle.provider_id().to_string()),
                reason: reason.to_string(),
                error_kind: kind.as_str().to_string(),
                last_error: Some(error.to_string()),
            })
            .await?;
        let item = match inserted {
            Some(item) => item,
            None => {
                // A concurrent failure of the same job inserted first.
                let existing = self
                    .repo
                    .find_by_dedupe_key(&dedupe_key)
                    .await?
                    .ok_or_else(|| DbErr::RecordNotFound(format!("dlq item {dedupe_key}")))?;
                return self.record_redelivery(existing, reason, kind, error).await;
            }
        };

        counter!(metric::DLQ_TOTAL, "reason" => reason.to_string()).increment(1);
        tracing::warn!(
            dlq_item_id = %item.id,
            job_type = %item.job_type,
            provider_id = %handle.provider_id(),
            reason,
            error_kind = %kind,
            error,
            "Job moved to dead letter queue"
        );

        Ok(item)
    }

    async fn record_redelivery(
        &self,
        existing: dlq_item::Model,
        reason: &str,
        kind: ErrorKind,
        error: &str,
    ) -> Result<dlq_item::Model, DbErr> {
        let item = self
            .repo
            .record_repeat_failure(existing, reason, kind.as_str(), error)
            .await?;
        tracing::warn!(
            dlq_item_id = %item.id,
            job_type = %item.job_type,
            attempts = item.attempts,
            reason,
            error,
            "Job failed again while dead-lettered"
        );
        Ok(item)
    }

    pub async fn get(&self, id: Uuid) -> Result<dlq_item::Model, DlqError> {
        self.repo
            .find_by_id(id)
            .await?
            .ok_or(DlqError::NotFound(id))
    }

    /// Decodes the stored handle of an item.
    pub fn handle_of(&self, item: &dlq_item::Model) -> Result<JobHandle, DlqError> {
        let invalid = |message: String| DlqError::InvalidJob {
            id: item.id,
            message,
        };
        let job_id = self
            .cipher
            .open(&job_aad(&item.dedupe_key), &item.job_id)
            .map_err(|e| invalid(e.to_string()))?;
        serde_json::from_value(job_id).map_err(|e| invalid(e.to_string()))
    }

    /// The item with its job handle decrypted, for operator views. An item
    /// that cannot be opened is returned as stored.
    pub fn reveal(&self, mut item: dlq_item::Model) -> dlq_item::Model {
        match self.cipher.open(&job_aad(&item.dedupe_key), &item.job_id) {
            Ok(job_id) => item.job_id = job_id,
            Err(err) => {
                tracing::warn!(dlq_item_id = %item.id, error = %err, "Cannot open DLQ job handle");
            }
        }
        item
    }

    pub async fn list(&self, limit: u64, offset: u64) -> Result<(Vec<dlq_item::Model>, u64), DbErr> {
        self.repo.list(limit, offset).await
    }

    pub async fn count(&self) -> Result<u64, DbErr> {
        self.repo.count().await
    }

    /// Records a failed retry. There is no attempt cap.
    pub async fn record_failure(
        &self,
        item: dlq_item::Model,
        error: &str,
    ) -> Result<dlq_item::Model, DbErr> {
        let updated = self.repo.record_attempt(item, Some(error)).await?;
        tracing::warn!(
            dlq_item_id = %updated.id,
            attempts = updated.attempts,
            error,
            "DLQ retry failed"
        );
        Ok(updated)
    }

    /// Records a successful retry and removes the item.
    pub async fn resolve(&self, item: dlq_item::Model) -> Result<(), DbErr> {
        let item = self.repo.record_attempt(item, None).await?;
        self.repo.delete(item.id).await?;
        tracing::info!(
            dlq_item_id = %item.id,
            attempts = item.attempts,
            "DLQ item resolved"
        );
        Ok(())
    }
}

fn job_aad(dedupe_key: &str) -> String {
    format!("dlq_items:{dedupe_key}")
}
