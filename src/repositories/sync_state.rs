//! Sync state repository
//!
//! The `status` column doubles as the per-provider run lock. Every transition
//! into `running` is a single conditional UPDATE, so two callers racing for
//! the same provider cannot both win, across processes as well as tasks.

use chrono::{DateTime, Duration, FixedOffset, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter, Set,
    sea_query::Expr,
};
use serde_json::Value as JsonValue;
use std::sync::Arc;

use crate::models::sync_state::{self, Entity as SyncState, SyncStatus, push_bounded_error};

/// Terminal bookkeeping for a finished run
#[derive(Debug, Clone)]
pub struct RunCompletion {
    pub status: SyncStatus,
    /// Credentials created or updated during the run
    pub credentials_synced: i64,
    /// Page cursor to resume from on the next incremental run. Stored only
    /// when the run completed; `None` clears it.
    pub cursor: Option<JsonValue>,
    /// New `last_successful_sync_at`, when the run consumed the whole feed
    pub synced_through: Option<DateTime<FixedOffset>>,
    /// New errors to append to the bounded error list
    pub errors: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct SyncStateRepository {
    pub db: Arc<DatabaseConnection>,
}

impl SyncStateRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    pub async fn get(&self, provider_id: &str) -> Result<Option<sync_state::Model>, DbErr> {
        SyncState::find_by_id(provider_id.to_string())
            .one(&*self.db)
            .await
    }

    /// Compare-and-set from any non-running status to `running`.
    ///
    /// # Returns
    ///
    /// `true` when this caller acquired the run, `false` when the provider is
    /// already running (or has no sync state row)
    pub async fn try_begin(&self, provider_id: &str) -> Result<bool, DbErr> {
        let now = Utc::now().fixed_offset();
        let result = SyncState::update_many()
            .col_expr(
                sync_state::Column::Status,
                Expr::value(SyncStatus::Running.as_str()),
            )
            .col_expr(sync_state::Column::LastSyncAt, Expr::value(now))
            .col_expr(sync_state::Column::UpdatedAt, Expr::value(now))
            .filter(sync_state::Column::ProviderId.eq(provider_id))
            .filter(sync_state::Column::Status.ne(SyncStatus::Running.as_str()))
            .exec(&*self.db)
            .await?;

        Ok(result.rows_affected == 1)
    }

    /// Moves a running provider to its terminal status.
    pub async fn finish(
        &self,
        provider_id: &str,
        completion: RunCompletion,
    ) -> Result<sync_state::Model, DbErr> {
        let existing = self
            .get(provider_id)
            .await?
            .ok_or_else(|| DbErr::RecordNotFound(format!("sync state '{provider_id}'")))?;

        let mut errors = existing.errors.clone();
        for message in &completion.errors {
            errors = push_bounded_error(&errors, message);
        }
        let credentials_synced = existing.credentials_synced + completion.credentials_synced;

        let mut active: sync_state::ActiveModel = existing.into();
        active.status = Set(completion.status.as_str().to_string());
        active.errors = Set(errors);
        active.credentials_synced = Set(credentials_synced);
        active.updated_at = Set(Utc::now().fixed_offset());
        if completion.status == SyncStatus::Completed {
            active.cursor = Set(completion.cursor);
            if let Some(synced_through) = completion.synced_through {
                active.last_successful_sync_at = Set(Some(synced_through));
            }
        }

        active.update(&*self.db).await
    }

    /// Fails `running` rows whose run started more than `stale_after` ago,
    /// i.e. runs abandoned by a process that exited mid-sync.
    ///
    /// # Returns
    ///
    /// The provider ids that were recovered
    pub async fn recover_stale(&self, stale_after: Duration) -> Result<Vec<String>, DbErr> {
        let cutoff = (Utc::now() - stale_after).fixed_offset();
        let stale = SyncState::find()
            .filter(sync_state::Column::Status.eq(SyncStatus::Running.as_str()))
            .filter(
                sync_state::Column::LastSyncAt
                    .lt(cutoff)
                    .or(sync_state::Column::LastSyncAt.is_null()),
            )
            .all(&*self.db)
            .await?;

        let mut recovered = Vec::with_capacity(stale.len());
        for row in stale {
            let provider_id = row.provider_id.clone();
            let errors = push_bounded_error(&row.errors, "sync interrupted before completion");
            let mut active: sync_state::ActiveModel = row.into();
            active.status = Set(SyncStatus::Failed.as_str().to_string());
            active.errors = Set(errors);
            active.updated_at = Set(Utc::now().fixed_offset());
            active.update(&*self.db).await?;

            tracing::warn!(provider_id = %provider_id, "Recovered stale running sync state");
            recovered.push(provider_id);
        }

        Ok(recovered)
    }
}
