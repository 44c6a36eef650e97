//! External credential repository
//!
//! The `(provider_id, provider_credential_id)` unique index is the only
//! concurrency control for credential writes: inserts use
//! `ON CONFLICT DO NOTHING` and a losing writer falls back to updating the
//! row that won.

use chrono::{NaiveDate, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, PaginatorTrait,
    QueryFilter, QueryOrder, QuerySelect, Set, sea_query::OnConflict,
};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use uuid::Uuid;

use crate::models::external_credential::{self, CredentialStatus, Entity as ExternalCredential};

/// Everything needed to write one credential row
#[derive(Debug, Clone)]
pub struct CredentialWrite {
    pub provider_id: String,
    pub provider_credential_id: String,
    pub idempotency_key: String,
    pub issuer_id: Option<Uuid>,
    pub learner_id: Option<Uuid>,
    pub status: CredentialStatus,
    pub signature_verified: bool,
    pub verification_method: String,
    pub match_confidence: Option<f64>,
    pub candidate_name: String,
    pub candidate_email: Option<String>,
    pub title: String,
    pub code: Option<String>,
    pub sector: Option<String>,
    pub nsqf_level: Option<i32>,
    pub issue_date: Option<NaiveDate>,
    pub certificate_url: Option<String>,
    pub raw_payload: JsonValue,
}

/// What a write did to the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteEffect {
    Created,
    Updated,
    /// The row was already verified and was left untouched
    Unchanged,
}

/// Filters for the admin listing
#[derive(Debug, Clone, Default)]
pub struct CredentialFilter {
    pub status: Option<CredentialStatus>,
    pub issuer_id: Option<Uuid>,
    pub provider_id: Option<String>,
    pub limit: u64,
    pub offset: u64,
}

/// Row counts per processing status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CredentialCounts {
    pub total: u64,
    pub verified: u64,
    pub pending: u64,
    pub rejected: u64,
}

#[derive(Debug, Clone)]
pub struct ExternalCredentialRepository {
    pub db: Arc<DatabaseConnection>,
}

impl ExternalCredentialRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    pub async fn find_by_id(&self, id: Uuid) -> Result<Option<external_credential::Model>, DbErr> {
        ExternalCredential::find_by_id(id).one(&*self.db).await
    }

    /// Looks a credential up by its unique provider-side key
    pub async fn find_by_key(
        &self,
        provider_id: &str,
        provider_credential_id: &str,
    ) -> Result<Option<external_credential::Model>, DbErr> {
        ExternalCredential::find()
            .filter(external_credential::Column::ProviderId.eq(provider_id))
            .filter(external_credential::Column::ProviderCredentialId.eq(provider_credential_id))
            .one(&*self.db)
            .await
    }

    /// Inserts the credential, or updates the existing row for the same key.
    ///
    /// A `verified` row is never modified: redelivery of an accepted credential
    /// is a no-op. Any other existing row is updated in place.
    ///
    /// # Returns
    ///
    /// The stored row and what the write did
    pub async fn upsert(
        &self,
        write: CredentialWrite,
    ) -> Result<(external_credential::Model, WriteEffect), DbErr> {
        if let Some(existing) = self
            .find_by_key(&write.provider_id, &write.provider_credential_id)
            .await?
        {
            return self.update_existing(existing, write).await;
        }
        self.insert_or_adopt(write).await
    }

    /// Inserts a new row; when another writer already holds the key, falls
    /// back to updating that row.
    async fn insert_or_adopt(
        &self,
        write: CredentialWrite,
    ) -> Result<(external_credential::Model, WriteEffect), DbErr> {
        let now = Utc::now().fixed_offset();
        let id = Uuid::new_v4();
        let active = external_credential::ActiveModel {
            id: Set(id),
            provider_id: Set(write.provider_id.clone()),
            provider_credential_id: Set(write.provider_credential_id.clone()),
            idempotency_key: Set(write.idempotency_key.clone()),
            issuer_id: Set(write.issuer_id),
            learner_id: Set(write.learner_id),
            status: Set(write.status.as_str().to_string()),
            signature_verified: Set(write.signature_verified),
            verification_method: Set(write.verification_method.clone()),
            match_confidence: Set(write.match_confidence),
            candidate_name: Set(write.candidate_name.clone()),
            candidate_email: Set(write.candidate_email.clone()),
            title: Set(write.title.clone()),
            code: Set(write.code.clone()),
            sector: Set(write.sector.clone()),
            nsqf_level: Set(write.nsqf_level),
            issue_date: Set(write.issue_date),
            certificate_url: Set(write.certificate_url.clone()),
            raw_payload: Set(write.raw_payload.clone()),
            anchor_tx_hash: Set(None),
            created_at: Set(now),
            processed_at: Set(Some(now)),
            updated_at: Set(now),
        };

        let inserted = ExternalCredential::insert(active)
            .on_conflict(
                OnConflict::columns([
                    external_credential::Column::ProviderId,
                    external_credential::Column::ProviderCredentialId,
                ])
                .do_nothing()
                .to_owned(),
            )
            .exec(&*self.db)
            .await;

        match inserted {
            Ok(_) => {
                let model = self
                    .find_by_id(id)
                    .await?
                    .ok_or_else(|| DbErr::RecordNotFound(format!("external credential {id}")))?;
                Ok((model, WriteEffect::Created))
            }
            Err(DbErr::RecordNotInserted) => {
                // A concurrent delivery inserted the same key first.
                let existing = self
                    .find_by_key(&write.provider_id, &write.provider_credential_id)
                    .await?
                    .ok_or_else(|| {
                        DbErr::RecordNotFound(format!(
                            "external credential {}:{}",
                            write.provider_id, write.provider_credential_id
                        ))
                    })?;
                tracing::debug!(
                    provider_id = %write.provider_id,
                    provider_credential_id = %write.provider_credential_id,
                    "Insert lost race on credential key; updating winner"
                );
                self.update_existing(existing, write).await
            }
            Err(err) => Err(err),
        }
    }

    async fn update_existing(
        &self,
        existing: external_credential::Model,
        write: CredentialWrite,
    ) -> Result<(external_credential::Model, WriteEffect), DbErr> {
        if existing.credential_status() == CredentialStatus::Verified {
            return Ok((existing, WriteEffect::Unchanged));
        }

        let now = Utc::now().fixed_offset();
        let mut active: external_credential::ActiveModel = existing.into();
        active.issuer_id = Set(write.issuer_id);
        active.learner_id = Set(write.learner_id);
        active.status = Set(write.status.as_str().to_string());
        active.signature_verified = Set(write.signature_verified);
        active.verification_method = Set(write.verification_method);
        active.match_confidence = Set(write.match_confidence);
        active.candidate_name = Set(write.candidate_name);
        active.candidate_email = Set(write.candidate_email);
        active.title = Set(write.title);
        active.code = Set(write.code);
        active.sector = Set(write.sector);
        active.nsqf_level = Set(write.nsqf_level);
        active.issue_date = Set(write.issue_date);
        active.certificate_url = Set(write.certificate_url);
        active.raw_payload = Set(write.raw_payload);
        active.processed_at = Set(Some(now));
        active.updated_at = Set(now);

        let updated = active.update(&*self.db).await?;
        Ok((updated, WriteEffect::Updated))
    }

    /// Stores the anchoring transaction hash for a credential
    pub async fn set_anchor_tx_hash(
        &self,
        id: Uuid,
        tx_hash: &str,
    ) -> Result<external_credential::Model, DbErr> {
        let existing = self
            .find_by_id(id)
            .await?
            .ok_or_else(|| DbErr::RecordNotFound(format!("external credential {id}")))?;
        let mut active: external_credential::ActiveModel = existing.into();
        active.anchor_tx_hash = Set(Some(tx_hash.to_string()));
        active.updated_at = Set(Utc::now().fixed_offset());
        active.update(&*self.db).await
    }

    /// Lists credentials newest first
    ///
    /// # Returns
    ///
    /// The requested page and the total number of matching rows
    pub async fn list(
        &self,
        filter: &CredentialFilter,
    ) -> Result<(Vec<external_credential::Model>, u64), DbErr> {
        let mut query = ExternalCredential::find();
        if let Some(status) = filter.status {
            query = query.filter(external_credential::Column::Status.eq(status.as_str()));
        }
        if let Some(issuer_id) = filter.issuer_id {
            query = query.filter(external_credential::Column::IssuerId.eq(issuer_id));
        }
        if let Some(provider_id) = &filter.provider_id {
            query = query.filter(external_credential::Column::ProviderId.eq(provider_id.as_str()));
        }

        let total = query.clone().count(&*self.db).await?;
        let rows = query
            .order_by_desc(external_credential::Column::CreatedAt)
            .offset(filter.offset)
            .limit(filter.limit)
            .all(&*self.db)
            .await?;

        Ok((rows, total))
    }

    pub async fn counts(&self) -> Result<CredentialCounts, DbErr> {
        let by_status = |status: CredentialStatus| {
            ExternalCredential::find()
                .filter(external_credential::Column::Status.eq(status.as_str()))
                .count(&*self.db)
        };

        Ok(CredentialCounts {
            total: ExternalCredential::find().count(&*self.db).await?,
            verified: by_status(CredentialStatus::Verified).await?,
            pending: by_status(CredentialStatus::Pending).await?,
            rejected: by_status(CredentialStatus::Rejected).await?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::memory_db;
    use crate::repositories::ProviderRepository;
    use serde_json::json;

    async fn setup() -> ExternalCredentialRepository {
        let db = Arc::new(memory_db().await);
        ProviderRepository::new(Arc::clone(&db))
            .register("nsdc", "NSDC", true)
            .await
            .unwrap();
        ExternalCredentialRepository::new(db)
    }

    fn write(status: CredentialStatus, learner_id: Option<Uuid>) -> CredentialWrite {
        CredentialWrite {
            provider_id: "nsdc".to_string(),
            provider_credential_id: "C-1".to_string(),
            idempotency_key: "nsdc:nsdc:C-1".to_string(),
            issuer_id: None,
            learner_id,
            status,
            signature_verified: true,
            verification_method: "nsdc_api".to_string(),
            match_confidence: Some(0.2),
            candidate_name: "Asha Verma".to_string(),
            candidate_email: None,
            title: "Retail Sales Associate".to_string(),
            code: None,
            sector: None,
            nsqf_level: Some(4),
            issue_date: None,
            certificate_url: None,
            raw_payload: json!({"credential_id": "C-1"}),
        }
    }

    #[tokio::test]
    async fn rejected_row_is_updated_in_place_then_frozen_once_verified() {
        let repo = setup().await;

        let (first, effect) = repo.upsert(write(CredentialStatus::Rejected, None)).await.unwrap();
        assert_eq!(effect, WriteEffect::Created);

        let learner = Uuid::new_v4();
        let (second, effect) = repo
            .upsert(write(CredentialStatus::Verified, Some(learner)))
            .await
            .unwrap();
        assert_eq!(effect, WriteEffect::Updated);
        assert_eq!(second.id, first.id);
        assert_eq!(second.learner_id, Some(learner));

        let (third, effect) = repo.upsert(write(CredentialStatus::Rejected, None)).await.unwrap();
        assert_eq!(effect, WriteEffect::Unchanged);
        assert_eq!(third.credential_status(), CredentialStatus::Verified);

        let counts = repo.counts().await.unwrap();
        assert_eq!(counts.total, 1);
        assert_eq!(counts.verified, 1);
    }

    #[tokio::test]
    async fn list_filters_by_status() {
        let repo = setup().await;
        repo.upsert(write(CredentialStatus::Rejected, None)).await.unwrap();

        let (rows, total) = repo
            .list(&CredentialFilter {
                status: Some(CredentialStatus::Verified),
                limit: 10,
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(rows.is_empty());
        assert_eq!(total, 0);

        let (rows, total) = repo
            .list(&CredentialFilter {
                status: Some(CredentialStatus::Rejected),
                limit: 10,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(total, 1);
    }

    #[tokio::test]
    async fn losing_insert_updates_the_winning_row() {
        let repo = setup().await;
        let (winner, _) = repo.upsert(write(CredentialStatus::Rejected, None)).await.unwrap();

        // The second writer missed the row on lookup and goes straight to insert.
        let learner = Uuid::new_v4();
        let (adopted, effect) = repo
            .insert_or_adopt(write(CredentialStatus::Verified, Some(learner)))
            .await
            .unwrap();
        assert_eq!(effect, WriteEffect::Updated);
        assert_eq!(adopted.id, winner.id);
        assert_eq!(adopted.learner_id, Some(learner));

        let (frozen, effect) = repo
            .insert_or_adopt(write(CredentialStatus::Rejected, None))
            .await
            .unwrap();
        assert_eq!(effect, WriteEffect::Unchanged);
        assert_eq!(frozen.credential_status(), CredentialStatus::Verified);

        assert_eq!(repo.counts().await.unwrap().total, 1);
    }
}
