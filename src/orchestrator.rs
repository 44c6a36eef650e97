//! # Ingestion Orchestrator
//!
//! Single consumer for every producer of external credentials. Webhooks, poll
//! pages and DLQ replays all funnel into [`Orchestrator::process_credential`],
//! so idempotency and matching behave the same whichever way a credential
//! arrives.
//!
//! Provider syncs are serialized per provider by the compare-and-set on
//! `sync_states.status`; runs for different providers are independent.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use metrics::{counter, histogram};
use sea_orm::{DatabaseConnection, DbErr, Set};
use serde::Serialize;
use serde_json::{Value as JsonValue, json};
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::adapters::{
    AdapterRegistry, ProviderAdapter, ProviderError, RawExternalCredential, Session, SyncCursor,
};
use crate::anchoring::AnchorClient;
use crate::config::AppConfig;
use crate::crypto::{CryptoError, PayloadCipher};
use crate::dlq::{DeadLetterQueue, DlqError, ErrorKind, JobHandle, RetryOutcome, reason};
use crate::matching::{LearnerDirectory, MatchDecision, MatchOutcome, MatchingEngine};
use crate::models::external_credential::{self, CredentialStatus};
use crate::models::sync_state::SyncStatus;
use crate::models::{dlq_item, pending_match, provider, sync_job_result};
use crate::repositories::{
    CredentialWrite, DlqRepository, ExternalCredentialRepository, IssuerRepository,
    LearnerRepository, PendingMatchRepository, ProviderRepository, RunCompletion,
    SyncJobResultRepository, SyncStateRepository, WriteEffect,
};
use crate::retry::RetryPolicy;
use crate::telemetry::metric;

/// What started a sync run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncTrigger {
    Scheduler,
    Manual,
    Cli,
    DlqReplay,
}

impl SyncTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncTrigger::Scheduler => "scheduler",
            SyncTrigger::Manual => "manual",
            SyncTrigger::Cli => "cli",
            SyncTrigger::DlqReplay => "dlq_replay",
        }
    }
}

/// Why a credential was deliberately not persisted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    ProviderDisabled,
    IssuerOptedOut,
    ImplausibleTrainingHours,
}

/// Result of ingesting one credential
#[derive(Debug, Clone)]
pub enum IngestOutcome {
    Credential {
        credential: external_credential::Model,
        effect: WriteEffect,
    },
    PendingMatch(pending_match::Model),
    Skipped(SkipReason),
    DeadLettered(dlq_item::Model),
}

impl IngestOutcome {
    /// Metric label and log field
    pub fn label(&self) -> &'static str {
        match self {
            IngestOutcome::Credential {
                effect: WriteEffect::Unchanged,
                ..
            } => "duplicate",
            IngestOutcome::Credential { credential, .. } => {
                match credential.credential_status() {
                    CredentialStatus::Verified => "verified",
                    CredentialStatus::Rejected => "rejected",
                    CredentialStatus::Pending => "pending",
                }
            }
            IngestOutcome::PendingMatch(_) => "pending_match",
            IngestOutcome::Skipped(_) => "skipped",
            IngestOutcome::DeadLettered(_) => "dead_lettered",
        }
    }
}

/// Failure of one ingestion step. Each variant maps onto a DLQ reason.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("payload signature verification failed")]
    SignatureInvalid,
    #[error("no adapter registered for provider '{0}'")]
    UnknownProvider(String),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("learner matching failed: {0}")]
    Matching(anyhow::Error),
    #[error("sync run did not complete: {0}")]
    SyncFailed(String),
    #[error("payload encryption failed: {0}")]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Database(#[from] DbErr),
}

impl IngestError {
    pub fn reason(&self) -> &'static str {
        match self {
            IngestError::SignatureInvalid => reason::SIGNATURE_INVALID,
            IngestError::Provider(err) if err.kind() == "validation" => reason::VALIDATION_FAILED,
            IngestError::Provider(err) if err.transient() || err.kind() == "authentication" => {
                reason::PROVIDER_UNAVAILABLE
            }
            IngestError::SyncFailed(_) => reason::PROVIDER_UNAVAILABLE,
            IngestError::Provider(_) => reason::PROCESSING_FAILED,
            IngestError::UnknownProvider(_)
            | IngestError::Matching(_)
            | IngestError::Crypto(_)
            | IngestError::Database(_) => reason::PROCESSING_FAILED,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            IngestError::SignatureInvalid => ErrorKind::Integrity,
            IngestError::Provider(err) => ErrorKind::from_provider_error(err),
            IngestError::SyncFailed(_) => ErrorKind::Transient,
            IngestError::UnknownProvider(_)
            | IngestError::Matching(_)
            | IngestError::Crypto(_)
            | IngestError::Database(_) => ErrorKind::Internal,
        }
    }
}

/// Errors returned to callers that ask for a sync run
#[derive(Debug, thiserror::Error)]
pub enum SyncRunError {
    #[error("sync already in progress for provider '{provider_id}'")]
    AlreadyRunning { provider_id: String },
    #[error("provider '{provider_id}' not found")]
    ProviderNotFound { provider_id: String },
    #[error("provider '{provider_id}' is disabled")]
    ProviderDisabled { provider_id: String },
    #[error("no adapter registered for provider '{provider_id}'")]
    AdapterMissing { provider_id: String },
    #[error(transparent)]
    Database(#[from] DbErr),
    #[error("sync task failed: {0}")]
    Join(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("pending match {0} not found")]
    NotFound(Uuid),
    #[error("pending match {0} is already resolved")]
    AlreadyResolved(Uuid),
    #[error("learner {0} not found")]
    LearnerNotFound(Uuid),
    #[error("pending match payload is unreadable: {0}")]
    InvalidPayload(String),
    #[error("payload encryption failed: {0}")]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Database(#[from] DbErr),
}

/// Result of an operator resolving a pending match
#[derive(Debug, Clone)]
pub struct ResolvedMatch {
    pub pending_match: pending_match::Model,
    pub credential: external_credential::Model,
}

#[derive(Debug, Default)]
struct RunCounters {
    processed: i32,
    created: i32,
    updated: i32,
    skipped: i32,
    pending_review: i32,
    rejected: i32,
    dead_lettered: i32,
}

impl RunCounters {
    fn tally(&mut self, outcome: &IngestOutcome) {
        match outcome {
            IngestOutcome::Credential {
                effect: WriteEffect::Unchanged,
                ..
            }
            | IngestOutcome::Skipped(_) => self.skipped += 1,
            IngestOutcome::Credential { credential, .. }
                if credential.credential_status() == CredentialStatus::Rejected =>
            {
                self.rejected += 1
            }
            IngestOutcome::Credential {
                effect: WriteEffect::Created,
                ..
            } => self.created += 1,
            IngestOutcome::Credential { .. } => self.updated += 1,
            IngestOutcome::PendingMatch(_) => self.pending_review += 1,
            IngestOutcome::DeadLettered(_) => self.dead_lettered += 1,
        }
    }

    fn synced(&self) -> i64 {
        i64::from(self.created + self.updated + self.rejected)
    }
}

/// Where a run stopped reading the feed
enum FeedEnd {
    /// The provider reported no further pages
    Exhausted,
    /// The per-run item cap was hit; resume from this cursor next time
    Capped(SyncCursor),
    /// Authentication or a page fetch failed for good
    Failed,
}

pub struct Orchestrator {
    config: Arc<AppConfig>,
    registry: Arc<AdapterRegistry>,
    matcher: MatchingEngine,
    anchor: Option<Arc<dyn AnchorClient>>,
    retry: RetryPolicy,
    cipher: PayloadCipher,
    dlq: DeadLetterQueue,
    providers: ProviderRepository,
    issuers: IssuerRepository,
    learners: LearnerRepository,
    sync_states: SyncStateRepository,
    credentials: ExternalCredentialRepository,
    pending: PendingMatchRepository,
    results: SyncJobResultRepository,
    /// Provider sync runs currently holding their `running` state
    active_runs: AtomicUsize,
}

impl Orchestrator {
    /// Wires the pipeline. Fails only when the configured crypto key is unusable.
    pub fn new(
        db: Arc<DatabaseConnection>,
        config: Arc<AppConfig>,
        registry: Arc<AdapterRegistry>,
    ) -> Result<Self, CryptoError> {
        let learners = LearnerRepository::new(Arc::clone(&db));
        let directory: Arc<dyn LearnerDirectory> = Arc::new(learners.clone());
        let cipher = PayloadCipher::from_config(&config)?;

        Ok(Self {
            matcher: MatchingEngine::new(directory, config.matching.clone()),
            retry: RetryPolicy::from(&config.retry),
            anchor: None,
            dlq: DeadLetterQueue::new(DlqRepository::new(Arc::clone(&db)), cipher.clone()),
            cipher,
            providers: ProviderRepository::new(Arc::clone(&db)),
            issuers: IssuerRepository::new(Arc::clone(&db)),
            learners,
            sync_states: SyncStateRepository::new(Arc::clone(&db)),
            credentials: ExternalCredentialRepository::new(Arc::clone(&db)),
            pending: PendingMatchRepository::new(Arc::clone(&db)),
            results: SyncJobResultRepository::new(db),
            active_runs: AtomicUsize::new(0),
            config,
            registry,
        })
    }

    pub fn with_anchor_client(mut self, anchor: Arc<dyn AnchorClient>) -> Self {
        self.anchor = Some(anchor);
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<AdapterRegistry> {
        &self.registry
    }

    pub fn dlq(&self) -> &DeadLetterQueue {
        &self.dlq
    }

    pub fn providers(&self) -> &ProviderRepository {
        &self.providers
    }

    pub fn issuers(&self) -> &IssuerRepository {
        &self.issuers
    }

    pub fn sync_states(&self) -> &SyncStateRepository {
        &self.sync_states
    }

    pub fn credentials(&self) -> &ExternalCredentialRepository {
        &self.credentials
    }

    pub fn pending_matches(&self) -> &PendingMatchRepository {
        &self.pending
    }

    pub fn results(&self) -> &SyncJobResultRepository {
        &self.results
    }

    /// Number of provider sync runs in flight, whatever triggered them
    pub fn active_runs(&self) -> usize {
        self.active_runs.load(Ordering::SeqCst)
    }

    /// The pending match with its credential decrypted, for operator views.
    /// An item that cannot be opened is returned as stored.
    pub fn reveal_pending(&self, mut item: pending_match::Model) -> pending_match::Model {
        let aad = pending_aad(&item.provider_id, &item.provider_credential_id);
        match self.cipher.open(&aad, &item.credential) {
            Ok(credential) => item.credential = credential,
            Err(err) => {
                warn!(pending_match_id = %item.id, error = %err, "Cannot open pending match payload");
            }
        }
        item
    }

    /// Decrypts the provider payload stored with a credential.
    pub fn open_raw_payload(
        &self,
        credential: &external_credential::Model,
    ) -> Result<JsonValue, CryptoError> {
        self.cipher.open(
            &credential_aad(&credential.provider_id, &credential.provider_credential_id),
            &credential.raw_payload,
        )
    }

    // ------------------------------------------------------------------
    // Single-credential path
    // ------------------------------------------------------------------

    /// Ingests one normalized credential, dead-lettering it on failure.
    ///
    /// Only fails when the DLQ itself cannot be written.
    #[instrument(
        skip_all,
        fields(
            provider_id = %raw.provider_id,
            provider_credential_id = %raw.provider_credential_id
        )
    )]
    pub async fn ingest(&self, raw: RawExternalCredential) -> Result<IngestOutcome, DbErr> {
        match self.process_credential(&raw).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                let handle = JobHandle::PollItem {
                    provider_id: raw.provider_id.clone(),
                    credential: Box::new(raw),
                };
                self.dead_letter(&handle, &err).await
            }
        }
    }

    /// Verifies, normalizes and ingests a pushed webhook.
    ///
    /// A bad signature is dead-lettered immediately with reason
    /// `signature_invalid`; so is any payload that fails normalization.
    #[instrument(skip(self, body, signature), fields(body_size = body.len()))]
    pub async fn ingest_webhook(
        &self,
        provider_id: &str,
        body: &[u8],
        signature: Option<&str>,
    ) -> Result<IngestOutcome, DbErr> {
        match self.attempt_webhook(provider_id, body, signature).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                let handle = JobHandle::WebhookIngest {
                    provider_id: provider_id.to_string(),
                    body: body.to_vec(),
                    signature: signature.map(str::to_string),
                };
                self.dead_letter(&handle, &err).await
            }
        }
    }

    async fn attempt_webhook(
        &self,
        provider_id: &str,
        body: &[u8],
        signature: Option<&str>,
    ) -> Result<IngestOutcome, IngestError> {
        let adapter = self
            .registry
            .get(provider_id)
            .map_err(|_| IngestError::UnknownProvider(provider_id.to_string()))?;

        if !adapter.verify_signature(body, signature) {
            return Err(IngestError::SignatureInvalid);
        }

        let mut raw = adapter.parse_webhook(body)?;
        raw.signature = signature.map(str::to_string);
        raw.signature_verified = true;

        self.process_credential(&raw).await
    }

    /// Applies poll-side authenticity rules to a normalized feed item.
    fn authenticate_polled(
        &self,
        adapter: &dyn ProviderAdapter,
        mut raw: RawExternalCredential,
    ) -> Result<RawExternalCredential, IngestError> {
        if adapter.metadata().signs_polled_payloads {
            let body = serde_json::to_vec(&raw.raw_payload)
                .map_err(|e| ProviderError::Validation(format!("unencodable payload: {e}")))?;
            if !adapter.verify_signature(&body, raw.signature.as_deref()) {
                return Err(IngestError::SignatureInvalid);
            }
        }
        // Otherwise the authenticated API session vouches for the payload.
        raw.signature_verified = true;
        Ok(raw)
    }

    /// Shared consumer: gating, idempotency, matching and persistence.
    /// Never writes to the DLQ.
    pub async fn process_credential(
        &self,
        raw: &RawExternalCredential,
    ) -> Result<IngestOutcome, IngestError> {
        let provider = self
            .providers
            .find_by_id(&raw.provider_id)
            .await?
            .ok_or_else(|| IngestError::UnknownProvider(raw.provider_id.clone()))?;

        let outcome = self.process_for_provider(&provider, raw).await?;

        counter!(metric::INGEST_TOTAL, "outcome" => outcome.label()).increment(1);
        debug!(
            provider_id = %raw.provider_id,
            provider_credential_id = %raw.provider_credential_id,
            outcome = outcome.label(),
            "Credential processed"
        );
        Ok(outcome)
    }

    async fn process_for_provider(
        &self,
        provider: &provider::Model,
        raw: &RawExternalCredential,
    ) -> Result<IngestOutcome, IngestError> {
        if !provider.enabled {
            return Ok(IngestOutcome::Skipped(SkipReason::ProviderDisabled));
        }

        // Redelivery of an accepted credential is absorbed before any matching work.
        let existing = self
            .credentials
            .find_by_key(&raw.provider_id, &raw.provider_credential_id)
            .await?;
        if let Some(existing) = &existing
            && existing.credential_status() == CredentialStatus::Verified
        {
            return Ok(IngestOutcome::Credential {
                credential: existing.clone(),
                effect: WriteEffect::Unchanged,
            });
        }

        // So is redelivery of a credential an operator already decided on.
        if let Some(decided) = self
            .pending
            .find_by_key(&raw.provider_id, &raw.provider_credential_id)
            .await?
            && decided.status == pending_match::STATUS_RESOLVED
        {
            debug!(
                provider_id = %raw.provider_id,
                provider_credential_id = %raw.provider_credential_id,
                pending_match_id = %decided.id,
                "Credential already resolved by an operator; ignoring redelivery"
            );
            return Ok(match existing {
                Some(credential) => IngestOutcome::Credential {
                    credential,
                    effect: WriteEffect::Unchanged,
                },
                None => IngestOutcome::PendingMatch(decided),
            });
        }

        if let Some(hours) = raw.training_hours_max
            && hours > self.config.sync.max_training_hours
        {
            warn!(
                provider_id = %raw.provider_id,
                provider_credential_id = %raw.provider_credential_id,
                training_hours = hours,
                "Skipping credential with implausible training hours"
            );
            return Ok(IngestOutcome::Skipped(SkipReason::ImplausibleTrainingHours));
        }

        let issuer = if provider.has_issuer {
            self.issuers.find_by_registry_id(&provider.id).await?
        } else {
            None
        };
        if let Some(issuer) = &issuer
            && !issuer.accept_external
        {
            return Ok(IngestOutcome::Skipped(SkipReason::IssuerOptedOut));
        }
        let issuer_id = issuer.as_ref().map(|i| i.id);

        let matched = self
            .matcher
            .evaluate(raw)
            .await
            .map_err(IngestError::Matching)?;

        let outcome = match matched.decision {
            MatchDecision::AutoAccept => {
                let (credential, effect) = self
                    .credentials
                    .upsert(self.credential_write(
                        raw,
                        issuer_id,
                        matched.learner_id,
                        CredentialStatus::Verified,
                        Some(matched.confidence),
                    )?)
                    .await?;
                self.pending
                    .resolve_by_key(&raw.provider_id, &raw.provider_credential_id, matched.learner_id)
                    .await?;
                let credential = self.anchor_if_needed(credential, effect).await;
                IngestOutcome::Credential { credential, effect }
            }
            MatchDecision::PendingReview => {
                let credential = self.cipher.seal(
                    &pending_aad(&raw.provider_id, &raw.provider_credential_id),
                    &serde_json::to_value(raw).unwrap_or(JsonValue::Null),
                )?;
                let pending = self
                    .pending
                    .upsert_open(
                        &raw.provider_id,
                        &raw.provider_credential_id,
                        issuer_id,
                        credential,
                        candidates_json(&matched),
                        matched.confidence,
                    )
                    .await?;
                IngestOutcome::PendingMatch(pending)
            }
            MatchDecision::Reject => {
                let confidence = (!matched.candidates.is_empty()).then_some(matched.confidence);
                let (credential, effect) = self
                    .credentials
                    .upsert(self.credential_write(
                        raw,
                        issuer_id,
                        None,
                        CredentialStatus::Rejected,
                        confidence,
                    )?)
                    .await?;
                IngestOutcome::Credential { credential, effect }
            }
        };

        if let Some(issuer_id) = issuer_id {
            self.issuers.touch_last_sync(issuer_id).await?;
        }

        Ok(outcome)
    }

    /// Best-effort anchoring of a newly verified credential.
    async fn anchor_if_needed(
        &self,
        credential: external_credential::Model,
        effect: WriteEffect,
    ) -> external_credential::Model {
        let Some(anchor) = &self.anchor else {
            return credential;
        };
        if effect == WriteEffect::Unchanged
            || credential.anchor_tx_hash.is_some()
            || credential.credential_status() != CredentialStatus::Verified
        {
            return credential;
        }

        match anchor.anchor(&credential).await {
            Ok(tx_hash) => match self.credentials.set_anchor_tx_hash(credential.id, &tx_hash).await
            {
                Ok(updated) => updated,
                Err(err) => {
                    warn!(credential_id = %credential.id, error = %err, "Failed to store anchor hash");
                    credential
                }
            },
            Err(err) => {
                warn!(credential_id = %credential.id, error = %err, "Credential anchoring failed");
                credential
            }
        }
    }

    async fn dead_letter(
        &self,
        handle: &JobHandle,
        err: &IngestError,
    ) -> Result<IngestOutcome, DbErr> {
        let item = self
            .dlq
            .push(handle, err.reason(), err.kind(), &err.to_string())
            .await?;
        counter!(metric::INGEST_TOTAL, "outcome" => "dead_lettered").increment(1);
        Ok(IngestOutcome::DeadLettered(item))
    }

    // ------------------------------------------------------------------
    // DLQ replay
    // ------------------------------------------------------------------

    /// Re-dispatches a DLQ item through the path that first failed.
    ///
    /// Success removes the item; failure increments `attempts` and keeps it.
    #[instrument(skip(self), fields(dlq_item_id = %id))]
    pub async fn retry_dlq_item(self: &Arc<Self>, id: Uuid) -> Result<RetryOutcome, DlqError> {
        let item = self.dlq.get(id).await?;
        let handle = self.dlq.handle_of(&item)?;

        match self.replay(&handle).await {
            Ok(detail) => {
                self.dlq.resolve(item).await?;
                Ok(RetryOutcome::Resolved { detail })
            }
            Err(err) => {
                let message = err.to_string();
                let item = self.dlq.record_failure(item, &message).await?;
                Ok(RetryOutcome::Failed {
                    item,
                    error: message,
                })
            }
        }
    }

    async fn replay(self: &Arc<Self>, handle: &JobHandle) -> Result<String, IngestError> {
        let outcome = match handle {
            JobHandle::WebhookIngest {
                provider_id,
                body,
                signature,
            } => {
                self.attempt_webhook(provider_id, body, signature.as_deref())
                    .await?
            }
            JobHandle::PollRecord {
                provider_id,
                payload,
                ..
            } => {
                let adapter = self
                    .registry
                    .get(provider_id)
                    .map_err(|_| IngestError::UnknownProvider(provider_id.clone()))?;
                let raw = adapter.parse_feed_item(payload)?;
                let raw = self.authenticate_polled(adapter.as_ref(), raw)?;
                self.process_credential(&raw).await?
            }
            JobHandle::PollItem { credential, .. } => self.process_credential(credential).await?,
            JobHandle::PollSync {
                provider_id,
                full_sync,
            } => {
                let result = self
                    .spawn_run(provider_id, *full_sync, SyncTrigger::DlqReplay, false)
                    .await
                    .map_err(|e| IngestError::SyncFailed(e.to_string()))?;
                if result.status != SyncStatus::Completed.as_str() {
                    return Err(IngestError::SyncFailed(format!(
                        "run {} finished {}",
                        result.id, result.status
                    )));
                }
                return Ok(format!("sync run {} completed", result.id));
            }
        };

        Ok(outcome.label().to_string())
    }

    // ------------------------------------------------------------------
    // Pending match resolution
    // ------------------------------------------------------------------

    /// Resolves a pending match. With a learner the credential is stored as
    /// verified for that learner; without one it is stored as rejected.
    #[instrument(skip(self), fields(pending_match_id = %id))]
    pub async fn resolve_pending(
        &self,
        id: Uuid,
        learner_id: Option<Uuid>,
    ) -> Result<ResolvedMatch, ResolveError> {
        let item = self
            .pending
            .find_by_id(id)
            .await?
            .ok_or(ResolveError::NotFound(id))?;
        if item.status != pending_match::STATUS_OPEN {
            return Err(ResolveError::AlreadyResolved(id));
        }

        let credential = self
            .cipher
            .open(
                &pending_aad(&item.provider_id, &item.provider_credential_id),
                &item.credential,
            )
            .map_err(|e| ResolveError::InvalidPayload(e.to_string()))?;
        let raw: RawExternalCredential = serde_json::from_value(credential)
            .map_err(|e| ResolveError::InvalidPayload(e.to_string()))?;

        if let Some(learner_id) = learner_id
            && self.learners.find_by_id(learner_id).await?.is_none()
        {
            return Err(ResolveError::LearnerNotFound(learner_id));
        }

        let (status, confidence) = match learner_id {
            Some(learner_id) => (
                CredentialStatus::Verified,
                candidate_confidence(&item.candidates, learner_id),
            ),
            None => (CredentialStatus::Rejected, Some(item.top_confidence)),
        };

        let (credential, effect) = self
            .credentials
            .upsert(self.credential_write(
                &raw,
                item.issuer_id,
                learner_id,
                status,
                confidence,
            )?)
            .await?;
        let credential = self.anchor_if_needed(credential, effect).await;
        let pending_match = self.pending.mark_resolved(item, learner_id).await?;

        info!(
            pending_match_id = %id,
            credential_id = %credential.id,
            learner_id = ?learner_id,
            status = %credential.status,
            "Pending match resolved"
        );

        Ok(ResolvedMatch {
            pending_match,
            credential,
        })
    }

    // ------------------------------------------------------------------
    // Provider sync runs
    // ------------------------------------------------------------------

    /// Moves `running` sync states abandoned by a previous process to `failed`.
    pub async fn recover_stale(&self) -> Result<Vec<String>, DbErr> {
        let minutes = i64::try_from(self.config.sync.stale_running_minutes).unwrap_or(i64::MAX);
        self.sync_states
            .recover_stale(Duration::minutes(minutes))
            .await
    }

    /// Runs a full or incremental sync for one provider.
    ///
    /// The run executes on its own task: dropping the caller (a disconnected
    /// HTTP client, a stopping scheduler) never aborts it, so the sync state
    /// always reaches a terminal status.
    pub async fn force_sync(
        self: &Arc<Self>,
        provider_id: &str,
        full_sync: bool,
        trigger: SyncTrigger,
    ) -> Result<sync_job_result::Model, SyncRunError> {
        self.spawn_run(provider_id, full_sync, trigger, true).await
    }

    /// Syncs every enabled provider concurrently.
    pub async fn sync_enabled(
        self: &Arc<Self>,
        full_sync: bool,
        trigger: SyncTrigger,
    ) -> Result<Vec<(String, Result<sync_job_result::Model, SyncRunError>)>, DbErr> {
        let providers = self.providers.list_enabled().await?;

        let mut runs = JoinSet::new();
        for provider in providers {
            let orchestrator = Arc::clone(self);
            runs.spawn(async move {
                let result = orchestrator
                    .force_sync(&provider.id, full_sync, trigger)
                    .await;
                (provider.id, result)
            });
        }

        let mut results = Vec::new();
        while let Some(joined) = runs.join_next().await {
            match joined {
                Ok(entry) => results.push(entry),
                Err(err) => error!(error = %err, "Provider sync task panicked"),
            }
        }
        results.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(results)
    }

    async fn spawn_run(
        self: &Arc<Self>,
        provider_id: &str,
        full_sync: bool,
        trigger: SyncTrigger,
        dead_letter_exhausted: bool,
    ) -> Result<sync_job_result::Model, SyncRunError> {
        let orchestrator = Arc::clone(self);
        let provider_id = provider_id.to_string();
        tokio::spawn(async move {
            orchestrator
                .run_sync(&provider_id, full_sync, trigger, dead_letter_exhausted)
                .await
        })
        .await
        .map_err(|e| SyncRunError::Join(e.to_string()))?
    }

    #[instrument(skip(self), fields(trigger = trigger.as_str()))]
    async fn run_sync(
        &self,
        provider_id: &str,
        full_sync: bool,
        trigger: SyncTrigger,
        dead_letter_exhausted: bool,
    ) -> Result<sync_job_result::Model, SyncRunError> {
        let provider = self.providers.find_by_id(provider_id).await?.ok_or_else(|| {
            SyncRunError::ProviderNotFound {
                provider_id: provider_id.to_string(),
            }
        })?;
        if !provider.enabled {
            return Err(SyncRunError::ProviderDisabled {
                provider_id: provider_id.to_string(),
            });
        }
        let adapter =
            self.registry
                .get(provider_id)
                .map_err(|_| SyncRunError::AdapterMissing {
                    provider_id: provider_id.to_string(),
                })?;

        if !self.sync_states.try_begin(provider_id).await? {
            info!(provider_id, "Sync already in progress; refusing to start another");
            return Err(SyncRunError::AlreadyRunning {
                provider_id: provider_id.to_string(),
            });
        }

        self.active_runs.fetch_add(1, Ordering::SeqCst);
        let _active = scopeguard::guard(&self.active_runs, |runs| {
            runs.fetch_sub(1, Ordering::SeqCst);
        });

        let started_at = Utc::now();
        let clock = Instant::now();
        info!(provider_id, full_sync, "Sync run started");

        let start_cursor = match self.start_cursor(provider_id, full_sync).await {
            Ok(cursor) => cursor,
            Err(err) => {
                // The lock is held; release it before reporting.
                self.finalize(
                    &provider,
                    trigger,
                    full_sync,
                    started_at,
                    clock,
                    RunCounters::default(),
                    vec![format!("failed to load sync state: {err}")],
                    FeedEnd::Failed,
                )
                .await?;
                return Err(err.into());
            }
        };

        let mut counters = RunCounters::default();
        let mut run_errors = Vec::new();
        let end = self
            .consume_feed(
                &provider,
                adapter.as_ref(),
                start_cursor,
                full_sync,
                dead_letter_exhausted,
                &mut counters,
                &mut run_errors,
            )
            .await;

        self.finalize(
            &provider, trigger, full_sync, started_at, clock, counters, run_errors, end,
        )
        .await
    }

    async fn start_cursor(&self, provider_id: &str, full_sync: bool) -> Result<SyncCursor, DbErr> {
        if full_sync {
            return Ok(SyncCursor::epoch());
        }
        let state = self.sync_states.get(provider_id).await?;
        let resumed = state
            .as_ref()
            .and_then(|s| s.cursor.clone())
            .and_then(|c| serde_json::from_value::<SyncCursor>(c).ok());
        if let Some(cursor) = resumed {
            return Ok(cursor);
        }
        Ok(state
            .and_then(|s| s.last_successful_sync_at)
            .map(|at| SyncCursor::since(at.with_timezone(&Utc)))
            .unwrap_or_else(SyncCursor::epoch))
    }

    #[allow(clippy::too_many_arguments)]
    async fn consume_feed(
        &self,
        provider: &provider::Model,
        adapter: &dyn ProviderAdapter,
        mut cursor: SyncCursor,
        full_sync: bool,
        dead_letter_exhausted: bool,
        counters: &mut RunCounters,
        run_errors: &mut Vec<String>,
    ) -> FeedEnd {
        let page_size = self.config.sync.page_size;
        let max_items = i32::try_from(self.config.sync.max_items_per_run).unwrap_or(i32::MAX);
        let sync_handle = JobHandle::PollSync {
            provider_id: provider.id.clone(),
            full_sync,
        };

        let session: Session = match self.retry.run(|| adapter.authenticate()).await {
            Ok(session) => session,
            Err((err, attempts)) => {
                self.record_feed_failure(&sync_handle, err, attempts, dead_letter_exhausted, counters, run_errors)
                    .await;
                return FeedEnd::Failed;
            }
        };

        loop {
            let page = match self
                .retry
                .run(|| adapter.fetch_since(&session, &cursor, page_size))
                .await
            {
                Ok(page) => page,
                Err((err, attempts)) => {
                    self.record_feed_failure(&sync_handle, err, attempts, dead_letter_exhausted, counters, run_errors)
                        .await;
                    return FeedEnd::Failed;
                }
            };

            for record in page.rejected {
                counters.processed += 1;
                let handle = JobHandle::PollRecord {
                    provider_id: provider.id.clone(),
                    provider_credential_id: record.provider_credential_id.clone(),
                    payload: record.payload,
                };
                let err = IngestError::Provider(ProviderError::Validation(record.reason));
                run_errors.push(format!(
                    "{}: {}",
                    record.provider_credential_id.as_deref().unwrap_or("<unknown>"),
                    err
                ));
                match self.dead_letter(&handle, &err).await {
                    Ok(outcome) => counters.tally(&outcome),
                    Err(db_err) => run_errors.push(format!("failed to dead-letter record: {db_err}")),
                }
            }

            for raw in page.items {
                if counters.processed >= max_items {
                    warn!(
                        provider_id = %provider.id,
                        max_items,
                        "Per-run item cap reached; remaining items deferred to next run"
                    );
                    return FeedEnd::Capped(cursor);
                }
                counters.processed += 1;

                let credential_id = raw.provider_credential_id.clone();
                let outcome = match self.authenticate_polled(adapter, raw.clone()) {
                    Ok(prepared) => self.ingest(prepared).await,
                    Err(err) => {
                        let handle = JobHandle::PollRecord {
                            provider_id: provider.id.clone(),
                            provider_credential_id: Some(credential_id.clone()),
                            payload: raw.raw_payload,
                        };
                        self.dead_letter(&handle, &err).await
                    }
                };

                match outcome {
                    Ok(outcome) => {
                        if let IngestOutcome::DeadLettered(item) = &outcome {
                            run_errors.push(format!(
                                "{credential_id}: {}",
                                item.last_error.as_deref().unwrap_or(&item.reason)
                            ));
                        }
                        counters.tally(&outcome);
                    }
                    Err(db_err) => {
                        error!(
                            provider_id = %provider.id,
                            provider_credential_id = %credential_id,
                            error = %db_err,
                            "Failed to ingest or dead-letter credential"
                        );
                        run_errors.push(format!("{credential_id}: {db_err}"));
                    }
                }
            }

            match page.next_cursor {
                Some(next) if page.has_more => cursor = next,
                _ => return FeedEnd::Exhausted,
            }
        }
    }

    async fn record_feed_failure(
        &self,
        sync_handle: &JobHandle,
        err: ProviderError,
        attempts: u32,
        dead_letter_exhausted: bool,
        counters: &mut RunCounters,
        run_errors: &mut Vec<String>,
    ) {
        warn!(
            provider_id = %sync_handle.provider_id(),
            attempts,
            transient = err.transient(),
            error = %err,
            "Provider feed failed"
        );
        let message = if err.transient() {
            format!("{err} (gave up after {attempts} attempts)")
        } else {
            err.to_string()
        };
        run_errors.push(message);

        if err.transient() && dead_letter_exhausted {
            match self.dead_letter(sync_handle, &IngestError::Provider(err)).await {
                Ok(outcome) => counters.tally(&outcome),
                Err(db_err) => run_errors.push(format!("failed to dead-letter sync: {db_err}")),
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn finalize(
        &self,
        provider: &provider::Model,
        trigger: SyncTrigger,
        full_sync: bool,
        started_at: DateTime<Utc>,
        clock: Instant,
        counters: RunCounters,
        run_errors: Vec<String>,
        end: FeedEnd,
    ) -> Result<sync_job_result::Model, SyncRunError> {
        let (status, cursor, synced_through) = match end {
            FeedEnd::Exhausted => (SyncStatus::Completed, None, Some(started_at)),
            FeedEnd::Capped(cursor) => (
                SyncStatus::Completed,
                serde_json::to_value(&cursor).ok(),
                None,
            ),
            FeedEnd::Failed => (SyncStatus::Failed, None, None),
        };

        self.sync_states
            .finish(
                &provider.id,
                RunCompletion {
                    status,
                    credentials_synced: counters.synced(),
                    cursor,
                    synced_through: synced_through.map(|at| at.fixed_offset()),
                    errors: run_errors.clone(),
                },
            )
            .await?;

        let finished_at = Utc::now();
        let duration_ms = i64::try_from(clock.elapsed().as_millis()).unwrap_or(i64::MAX);
        let result = self
            .results
            .append(sync_job_result::ActiveModel {
                id: Set(Uuid::new_v4()),
                provider_id: Set(provider.id.clone()),
                trigger: Set(trigger.as_str().to_string()),
                full_sync: Set(full_sync),
                status: Set(status.as_str().to_string()),
                processed: Set(counters.processed),
                created: Set(counters.created),
                updated: Set(counters.updated),
                skipped: Set(counters.skipped),
                pending_review: Set(counters.pending_review),
                rejected: Set(counters.rejected),
                dead_lettered: Set(counters.dead_lettered),
                errors: Set(json!(run_errors)),
                started_at: Set(started_at.fixed_offset()),
                finished_at: Set(finished_at.fixed_offset()),
                duration_ms: Set(duration_ms),
            })
            .await?;

        counter!(metric::RUNS_TOTAL, "status" => status.as_str()).increment(1);
        histogram!(metric::RUN_DURATION_MS).record(duration_ms as f64);
        info!(
            provider_id = %provider.id,
            status = %status,
            processed = result.processed,
            created = result.created,
            updated = result.updated,
            skipped = result.skipped,
            pending_review = result.pending_review,
            rejected = result.rejected,
            dead_lettered = result.dead_lettered,
            duration_ms,
            "Sync run finished"
        );

        Ok(result)
    }

    fn credential_write(
        &self,
        raw: &RawExternalCredential,
        issuer_id: Option<Uuid>,
        learner_id: Option<Uuid>,
        status: CredentialStatus,
        match_confidence: Option<f64>,
    ) -> Result<CredentialWrite, CryptoError> {
        let raw_payload = self.cipher.seal(
            &credential_aad(&raw.provider_id, &raw.provider_credential_id),
            &raw.raw_payload,
        )?;
        Ok(CredentialWrite {
            provider_id: raw.provider_id.clone(),
            provider_credential_id: raw.provider_credential_id.clone(),
            idempotency_key: raw.idempotency_key(),
            issuer_id,
            learner_id,
            status,
            signature_verified: raw.signature_verified,
            verification_method: raw.verification_method.clone(),
            match_confidence,
            candidate_name: raw.candidate_name.clone(),
            candidate_email: raw.candidate_email.clone(),
            title: raw.title.clone(),
            code: raw.code.clone(),
            sector: raw.sector.clone(),
            nsqf_level: raw.nsqf_level,
            issue_date: raw.issue_date,
            certificate_url: raw.certificate_url.clone(),
            raw_payload,
        })
    }
}

fn credential_aad(provider_id: &str, provider_credential_id: &str) -> String {
    format!("external_credentials:{provider_id}:{provider_credential_id}")
}

fn pending_aad(provider_id: &str, provider_credential_id: &str) -> String {
    format!("pending_matches:{provider_id}:{provider_credential_id}")
}

fn candidates_json(matched: &MatchOutcome) -> JsonValue {
    serde_json::to_value(&matched.candidates).unwrap_or_else(|_| json!([]))
}

fn candidate_confidence(candidates: &JsonValue, learner_id: Uuid) -> Option<f64> {
    let wanted = learner_id.to_string();
    candidates.as_array()?.iter().find_map(|c| {
        (c.get("learner_id")?.as_str()? == wanted)
            .then(|| c.get("confidence").and_then(JsonValue::as_f64))
            .flatten()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ingest_errors_map_to_dlq_taxonomy() {
        assert_eq!(IngestError::SignatureInvalid.reason(), "signature_invalid");
        assert_eq!(IngestError::SignatureInvalid.kind(), ErrorKind::Integrity);

        let invalid = IngestError::Provider(ProviderError::Validation("missing id".into()));
        assert_eq!(invalid.reason(), "validation_failed");
        assert_eq!(invalid.kind(), ErrorKind::Validation);

        let outage = IngestError::Provider(ProviderError::Network("reset".into()));
        assert_eq!(outage.reason(), "provider_unavailable");
        assert_eq!(outage.kind(), ErrorKind::Transient);
    }

    #[test]
    fn candidate_confidence_reads_stored_candidates() {
        let learner = Uuid::new_v4();
        let candidates = json!([
            {"learner_id": Uuid::new_v4().to_string(), "confidence": 0.7},
            {"learner_id": learner.to_string(), "confidence": 0.6},
        ]);
        assert_eq!(candidate_confidence(&candidates, learner), Some(0.6));
        assert_eq!(candidate_confidence(&candidates, Uuid::new_v4()), None);
    }

    #[test]
    fn counters_split_outcomes() {
        let mut counters = RunCounters::default();
        counters.tally(&IngestOutcome::Skipped(SkipReason::IssuerOptedOut));
        assert_eq!(counters.skipped, 1);
        assert_eq!(counters.synced(), 0);
    }
}
