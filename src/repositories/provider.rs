//! Provider repository for database operations
//!
//! Registration writes the provider row together with its idle sync state so
//! every registered provider always has exactly one `sync_states` row.

use anyhow::Result;
use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter, QueryOrder, Set,
    TransactionTrait,
};
use serde_json::json;
use std::sync::Arc;

use crate::models::provider::{self, Entity as Provider};
use crate::models::sync_state::{self, Entity as SyncState, SyncStatus};

/// Repository for provider database operations
#[derive(Debug, Clone)]
pub struct ProviderRepository {
    /// Database connection pool
    pub db: Arc<DatabaseConnection>,
}

impl ProviderRepository {
    /// Creates a new ProviderRepository instance
    ///
    /// # Arguments
    ///
    /// * `db` - Database connection pool
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Finds a provider by its registry identifier
    ///
    /// # Arguments
    ///
    /// * `id` - Provider id, also the adapter lookup key
    ///
    /// # Returns
    ///
    /// Returns a Result containing the provider model if found
    pub async fn find_by_id(&self, id: &str) -> Result<Option<provider::Model>, DbErr> {
        let provider = Provider::find_by_id(id.to_string()).one(&*self.db).await?;
        Ok(provider)
    }

    /// Lists every registered provider ordered by id
    pub async fn list_all(&self) -> Result<Vec<provider::Model>, DbErr> {
        let providers = Provider::find()
            .order_by_asc(provider::Column::Id)
            .all(&*self.db)
            .await?;
        Ok(providers)
    }

    /// Lists providers that scheduled and manual syncs may run for
    pub async fn list_enabled(&self) -> Result<Vec<provider::Model>, DbErr> {
        let providers = Provider::find()
            .filter(provider::Column::Enabled.eq(true))
            .order_by_asc(provider::Column::Id)
            .all(&*self.db)
            .await?;
        Ok(providers)
    }

    /// Lists providers together with their sync state rows
    pub async fn list_with_state(
        &self,
    ) -> Result<Vec<(provider::Model, Option<sync_state::Model>)>, DbErr> {
        let rows = Provider::find()
            .find_also_related(SyncState)
            .order_by_asc(provider::Column::Id)
            .all(&*self.db)
            .await?;
        Ok(rows)
    }

    /// Registers a provider and its idle sync state.
    ///
    /// Registration is idempotent: an existing provider is returned unchanged
    /// (providers are immutable once registered), and a missing sync state row
    /// is created if an earlier registration was interrupted.
    ///
    /// # Arguments
    ///
    /// * `id` - Provider id
    /// * `name` - Human readable name
    /// * `has_issuer` - Whether a platform issuer represents this provider
    ///
    /// # Returns
    ///
    /// Returns the stored provider model
    pub async fn register(&self, id: &str, name: &str, has_issuer: bool) -> Result<provider::Model> {
        let txn = self.db.begin().await?;
        let now = Utc::now().fixed_offset();

        let provider = match Provider::find_by_id(id.to_string()).one(&txn).await? {
            Some(existing) => existing,
            None => {
                provider::ActiveModel {
                    id: Set(id.to_string()),
                    name: Set(name.to_string()),
                    enabled: Set(true),
                    has_issuer: Set(has_issuer),
                    created_at: Set(now),
                    updated_at: Set(now),
                }
                .insert(&txn)
                .await?
            }
        };

        if SyncState::find_by_id(id.to_string())
            .one(&txn)
            .await?
            .is_none()
        {
            sync_state::ActiveModel {
                provider_id: Set(id.to_string()),
                status: Set(SyncStatus::Idle.as_str().to_string()),
                last_sync_at: Set(None),
                last_successful_sync_at: Set(None),
                credentials_synced: Set(0),
                errors: Set(json!([])),
                cursor: Set(None),
                updated_at: Set(now),
            }
            .insert(&txn)
            .await?;
        }

        txn.commit().await?;
        Ok(provider)
    }

    /// Enables or disables a provider; the only mutation a provider accepts
    ///
    /// # Returns
    ///
    /// Returns the updated provider model, or an error if not found
    pub async fn set_enabled(&self, id: &str, enabled: bool) -> Result<provider::Model> {
        let existing = Provider::find_by_id(id.to_string())
            .one(&*self.db)
            .await?
            .ok_or_else(|| anyhow::anyhow!("Provider '{}' not found", id))?;

        let mut active: provider::ActiveModel = existing.into();
        active.enabled = Set(enabled);
        active.updated_at = Set(Utc::now().fixed_offset());
        let updated = active.update(&*self.db).await?;

        tracing::info!(provider_id = %id, enabled, "Provider enablement changed");
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::memory_db;

    async fn setup() -> ProviderRepository {
        ProviderRepository::new(Arc::new(memory_db().await))
    }

    #[tokio::test]
    async fn register_creates_provider_and_idle_state_once() {
        let repo = setup().await;

        let first = repo.register("nsdc", "NSDC", true).await.unwrap();
        let second = repo.register("nsdc", "Renamed", false).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(second.name, "NSDC");

        let rows = repo.list_with_state().await.unwrap();
        assert_eq!(rows.len(), 1);
        let state = rows[0].1.as_ref().unwrap();
        assert_eq!(state.sync_status(), SyncStatus::Idle);
        assert!(state.error_list().is_empty());
    }

    #[tokio::test]
    async fn set_enabled_filters_enabled_list() {
        let repo = setup().await;
        repo.register("nsdc", "NSDC", true).await.unwrap();
        repo.register("other", "Other", false).await.unwrap();

        repo.set_enabled("other", false).await.unwrap();

        let enabled = repo.list_enabled().await.unwrap();
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].id, "nsdc");
        assert!(repo.set_enabled("missing", true).await.is_err());
    }
}
