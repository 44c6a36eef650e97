//! Pending match repository
//!
//! At most one row exists per `(provider_id, provider_credential_id)`;
//! redelivering an ambiguous credential refreshes the open row instead of
//! queueing it twice. A resolved row is final and is never reopened.

use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, PaginatorTrait,
    QueryFilter, QueryOrder, QuerySelect, Set, sea_query::OnConflict,
};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use uuid::Uuid;

use crate::models::pending_match::{self, Entity as PendingMatch, STATUS_OPEN, STATUS_RESOLVED};

/// Fields a redelivery may change on an open item
struct OpenRefresh {
    issuer_id: Option<Uuid>,
    credential: JsonValue,
    candidates: JsonValue,
    top_confidence: f64,
}

#[derive(Debug, Clone)]
pub struct PendingMatchRepository {
    pub db: Arc<DatabaseConnection>,
}

impl PendingMatchRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    pub async fn find_by_id(&self, id: Uuid) -> Result<Option<pending_match::Model>, DbErr> {
        PendingMatch::find_by_id(id).one(&*self.db).await
    }

    pub async fn find_by_key(
        &self,
        provider_id: &str,
        provider_credential_id: &str,
    ) -> Result<Option<pending_match::Model>, DbErr> {
        PendingMatch::find()
            .filter(pending_match::Column::ProviderId.eq(provider_id))
            .filter(pending_match::Column::ProviderCredentialId.eq(provider_credential_id))
            .one(&*self.db)
            .await
    }

    /// Creates or refreshes the open review item for a credential.
    ///
    /// An existing resolved item is returned untouched.
    ///
    /// # Arguments
    ///
    /// * `credential` - The serialized normalized credential
    /// * `candidates` - Ordered `(learner_id, confidence)` candidates, best first
    pub async fn upsert_open(
        &self,
        provider_id: &str,
        provider_credential_id: &str,
        issuer_id: Option<Uuid>,
        credential: JsonValue,
        candidates: JsonValue,
        top_confidence: f64,
    ) -> Result<pending_match::Model, DbErr> {
        let refresh = OpenRefresh {
            issuer_id,
            credential,
            candidates,
            top_confidence,
        };

        if let Some(existing) = self.find_by_key(provider_id, provider_credential_id).await? {
            return self.refresh_open(existing, refresh).await;
        }

        let now = Utc::now().fixed_offset();
        let id = Uuid::new_v4();
        let active = pending_match::ActiveModel {
            id: Set(id),
            provider_id: Set(provider_id.to_string()),
            provider_credential_id: Set(provider_credential_id.to_string()),
            issuer_id: Set(refresh.issuer_id),
            credential: Set(refresh.credential.clone()),
            candidates: Set(refresh.candidates.clone()),
            top_confidence: Set(refresh.top_confidence),
            status: Set(STATUS_OPEN.to_string()),
            resolved_learner_id: Set(None),
            resolved_at: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        };

        let inserted = PendingMatch::insert(active)
            .on_conflict(
                OnConflict::columns([
                    pending_match::Column::ProviderId,
                    pending_match::Column::ProviderCredentialId,
                ])
                .do_nothing()
                .to_owned(),
            )
            .exec_without_returning(&*self.db)
            .await;
        let lost_race = match inserted {
            Ok(0) | Err(DbErr::RecordNotInserted) => true,
            Ok(_) => false,
            Err(err) => return Err(err),
        };

        let stored = self
            .find_by_key(provider_id, provider_credential_id)
            .await?
            .ok_or_else(|| {
                DbErr::RecordNotFound(format!(
                    "pending match {provider_id}:{provider_credential_id}"
                ))
            })?;
        if lost_race {
            return self.refresh_open(stored, refresh).await;
        }
        Ok(stored)
    }

    async fn refresh_open(
        &self,
        existing: pending_match::Model,
        refresh: OpenRefresh,
    ) -> Result<pending_match::Model, DbErr> {
        if existing.status != STATUS_OPEN {
            return Ok(existing);
        }
        let mut active: pending_match::ActiveModel = existing.into();
        active.issuer_id = Set(refresh.issuer_id);
        active.credential = Set(refresh.credential);
        active.candidates = Set(refresh.candidates);
        active.top_confidence = Set(refresh.top_confidence);
        active.updated_at = Set(Utc::now().fixed_offset());
        active.update(&*self.db).await
    }

    /// Lists open review items, most ambiguous last
    pub async fn list_open(&self, limit: u64) -> Result<Vec<pending_match::Model>, DbErr> {
        PendingMatch::find()
            .filter(pending_match::Column::Status.eq(STATUS_OPEN))
            .order_by_desc(pending_match::Column::TopConfidence)
            .order_by_asc(pending_match::Column::CreatedAt)
            .limit(limit)
            .all(&*self.db)
            .await
    }

    pub async fn count_open(&self) -> Result<u64, DbErr> {
        PendingMatch::find()
            .filter(pending_match::Column::Status.eq(STATUS_OPEN))
            .count(&*self.db)
            .await
    }

    /// Marks the open item for a key resolved
    ///
    /// # Returns
    ///
    /// `true` when an open item existed
    pub async fn resolve_by_key(
        &self,
        provider_id: &str,
        provider_credential_id: &str,
        learner_id: Option<Uuid>,
    ) -> Result<bool, DbErr> {
        match self.find_by_key(provider_id, provider_credential_id).await? {
            Some(open) if open.status == STATUS_OPEN => {
                self.mark_resolved(open, learner_id).await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    pub async fn mark_resolved(
        &self,
        item: pending_match::Model,
        learner_id: Option<Uuid>,
    ) -> Result<pending_match::Model, DbErr> {
        let now = Utc::now().fixed_offset();
        let mut active: pending_match::ActiveModel = item.into();
        active.status = Set(STATUS_RESOLVED.to_string());
        active.resolved_learner_id = Set(learner_id);
        active.resolved_at = Set(Some(now));
        active.updated_at = Set(now);
        active.update(&*self.db).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::memory_db;
    use serde_json::json;

    #[tokio::test]
    async fn redelivery_refreshes_single_open_row() {
        let repo = PendingMatchRepository::new(Arc::new(memory_db().await));

        let first = repo
            .upsert_open("nsdc", "C-1", None, json!({}), json!([]), 0.55)
            .await
            .unwrap();
        let second = repo
            .upsert_open("nsdc", "C-1", None, json!({}), json!([]), 0.6)
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.top_confidence, 0.6);
        assert_eq!(repo.count_open().await.unwrap(), 1);

        assert!(repo.resolve_by_key("nsdc", "C-1", None).await.unwrap());
        assert!(!repo.resolve_by_key("nsdc", "C-1", None).await.unwrap());
        assert!(repo.list_open(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn resolved_row_is_not_reopened() {
        let repo = PendingMatchRepository::new(Arc::new(memory_db().await));

        let open = repo
            .upsert_open("nsdc", "C-2", None, json!({"v": 1}), json!([]), 0.55)
            .await
            .unwrap();
        let resolved = repo.mark_resolved(open, None).await.unwrap();

        let again = repo
            .upsert_open("nsdc", "C-2", None, json!({"v": 2}), json!([]), 0.7)
            .await
            .unwrap();

        assert_eq!(again.id, resolved.id);
        assert_eq!(again.status, STATUS_RESOLVED);
        assert!(again.resolved_at.is_some());
        assert_eq!(again.top_confidence, 0.55);
        assert_eq!(again.credential, json!({"v": 1}));
        assert_eq!(repo.count_open().await.unwrap(), 0);
    }
}
