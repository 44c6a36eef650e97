//! # Common API Types
//!
//! Response shapes shared by the admin and webhook handlers, converted from the
//! SeaORM models so the wire format stays independent of the schema.

use chrono::{DateTime, FixedOffset, NaiveDate};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::models::{
    dlq_item, external_credential, issuer, pending_match, provider, sync_job_result, sync_state,
};

/// Offset-paginated list wrapper
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct PaginatedResponse<T> {
    pub data: Vec<T>,
    /// Total rows matching the filter
    pub total: u64,
    pub limit: u64,
    pub offset: u64,
}

impl<T> PaginatedResponse<T> {
    pub fn new(data: Vec<T>, total: u64, limit: u64, offset: u64) -> Self {
        Self {
            data,
            total,
            limit,
            offset,
        }
    }
}

/// Clamp a requested page size into `1..=max`
pub fn clamp_limit(limit: Option<u64>, default: u64, max: u64) -> u64 {
    limit.unwrap_or(default).clamp(1, max)
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SyncStateView {
    pub status: String,
    #[schema(value_type = Option<String>, format = DateTime)]
    pub last_sync_at: Option<DateTime<FixedOffset>>,
    #[schema(value_type = Option<String>, format = DateTime)]
    pub last_successful_sync_at: Option<DateTime<FixedOffset>>,
    pub credentials_synced: i64,
    pub errors: Vec<String>,
}

impl From<sync_state::Model> for SyncStateView {
    fn from(state: sync_state::Model) -> Self {
        Self {
            errors: state.error_list(),
            status: state.status,
            last_sync_at: state.last_sync_at,
            last_successful_sync_at: state.last_successful_sync_at,
            credentials_synced: state.credentials_synced,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ProviderView {
    pub id: String,
    pub name: String,
    pub enabled: bool,
    pub has_issuer: bool,
    /// Whether an adapter is registered for this provider in this process
    pub adapter_registered: bool,
    pub sync_state: Option<SyncStateView>,
}

impl ProviderView {
    pub fn new(
        provider: provider::Model,
        state: Option<sync_state::Model>,
        adapter_registered: bool,
    ) -> Self {
        Self {
            id: provider.id,
            name: provider.name,
            enabled: provider.enabled,
            has_issuer: provider.has_issuer,
            adapter_registered,
            sync_state: state.map(SyncStateView::from),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SyncJobResultView {
    pub id: Uuid,
    pub provider_id: String,
    pub trigger: String,
    pub full_sync: bool,
    pub status: String,
    pub processed: i32,
    pub created: i32,
    pub updated: i32,
    pub skipped: i32,
    pub pending_review: i32,
    pub rejected: i32,
    pub dead_lettered: i32,
    pub errors: Vec<String>,
    #[schema(value_type = String, format = DateTime)]
    pub started_at: DateTime<FixedOffset>,
    #[schema(value_type = String, format = DateTime)]
    pub finished_at: DateTime<FixedOffset>,
    pub duration_ms: i64,
}

impl From<sync_job_result::Model> for SyncJobResultView {
    fn from(result: sync_job_result::Model) -> Self {
        let errors = serde_json::from_value(result.errors).unwrap_or_default();
        Self {
            id: result.id,
            provider_id: result.provider_id,
            trigger: result.trigger,
            full_sync: result.full_sync,
            status: result.status,
            processed: result.processed,
            created: result.created,
            updated: result.updated,
            skipped: result.skipped,
            pending_review: result.pending_review,
            rejected: result.rejected,
            dead_lettered: result.dead_lettered,
            errors,
            started_at: result.started_at,
            finished_at: result.finished_at,
            duration_ms: result.duration_ms,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ExternalCredentialView {
    pub id: Uuid,
    pub provider_id: String,
    pub provider_credential_id: String,
    pub issuer_id: Option<Uuid>,
    pub learner_id: Option<Uuid>,
    pub status: String,
    pub signature_verified: bool,
    pub verification_method: String,
    pub match_confidence: Option<f64>,
    pub candidate_name: String,
    pub candidate_email: Option<String>,
    pub title: String,
    pub code: Option<String>,
    pub sector: Option<String>,
    pub nsqf_level: Option<i32>,
    #[schema(value_type = Option<String>, format = Date)]
    pub issue_date: Option<NaiveDate>,
    pub certificate_url: Option<String>,
    pub anchor_tx_hash: Option<String>,
    #[schema(value_type = String, format = DateTime)]
    pub created_at: DateTime<FixedOffset>,
    #[schema(value_type = Option<String>, format = DateTime)]
    pub processed_at: Option<DateTime<FixedOffset>>,
}

impl From<external_credential::Model> for ExternalCredentialView {
    fn from(c: external_credential::Model) -> Self {
        Self {
            id: c.id,
            provider_id: c.provider_id,
            provider_credential_id: c.provider_credential_id,
            issuer_id: c.issuer_id,
            learner_id: c.learner_id,
            status: c.status,
            signature_verified: c.signature_verified,
            verification_method: c.verification_method,
            match_confidence: c.match_confidence,
            candidate_name: c.candidate_name,
            candidate_email: c.candidate_email,
            title: c.title,
            code: c.code,
            sector: c.sector,
            nsqf_level: c.nsqf_level,
            issue_date: c.issue_date,
            certificate_url: c.certificate_url,
            anchor_tx_hash: c.anchor_tx_hash,
            created_at: c.created_at,
            processed_at: c.processed_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct DlqItemView {
    pub id: Uuid,
    pub job_type: String,
    /// Replay handle, decrypted for display
    pub job_id: JsonValue,
    /// Identity of the failed unit of work
    pub dedupe_key: String,
    pub provider_id: Option<String>,
    pub reason: String,
    pub error_kind: String,
    pub attempts: i32,
    pub last_error: Option<String>,
    #[schema(value_type = String, format = DateTime)]
    pub created_at: DateTime<FixedOffset>,
    #[schema(value_type = String, format = DateTime)]
    pub updated_at: DateTime<FixedOffset>,
}

impl From<dlq_item::Model> for DlqItemView {
    fn from(item: dlq_item::Model) -> Self {
        Self {
            id: item.id,
            job_type: item.job_type,
            job_id: item.job_id,
            dedupe_key: item.dedupe_key,
            provider_id: item.provider_id,
            reason: item.reason,
            error_kind: item.error_kind,
            attempts: item.attempts,
            last_error: item.last_error,
            created_at: item.created_at,
            updated_at: item.updated_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PendingMatchView {
    pub id: Uuid,
    pub provider_id: String,
    pub provider_credential_id: String,
    pub issuer_id: Option<Uuid>,
    /// Normalized credential awaiting review
    pub credential: JsonValue,
    /// Ordered candidates, best first
    pub candidates: JsonValue,
    pub top_confidence: f64,
    pub status: String,
    pub resolved_learner_id: Option<Uuid>,
    #[schema(value_type = Option<String>, format = DateTime)]
    pub resolved_at: Option<DateTime<FixedOffset>>,
    #[schema(value_type = String, format = DateTime)]
    pub created_at: DateTime<FixedOffset>,
}

impl From<pending_match::Model> for PendingMatchView {
    fn from(m: pending_match::Model) -> Self {
        Self {
            id: m.id,
            provider_id: m.provider_id,
            provider_credential_id: m.provider_credential_id,
            issuer_id: m.issuer_id,
            credential: m.credential,
            candidates: m.candidates,
            top_confidence: m.top_confidence,
            status: m.status,
            resolved_learner_id: m.resolved_learner_id,
            resolved_at: m.resolved_at,
            created_at: m.created_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct IssuerView {
    pub id: Uuid,
    pub name: String,
    pub registry_id: Option<String>,
    pub accept_external: bool,
    #[schema(value_type = Option<String>, format = DateTime)]
    pub last_sync_at: Option<DateTime<FixedOffset>>,
}

impl From<issuer::Model> for IssuerView {
    fn from(i: issuer::Model) -> Self {
        Self {
            id: i.id,
            name: i.name,
            registry_id: i.registry_id,
            accept_external: i.accept_external,
            last_sync_at: i.last_sync_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limit_is_clamped() {
        assert_eq!(clamp_limit(None, 50, 100), 50);
        assert_eq!(clamp_limit(Some(0), 50, 100), 1);
        assert_eq!(clamp_limit(Some(500), 50, 100), 100);
    }
}
