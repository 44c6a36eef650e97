//! Sync job result repository; an append-only audit log of sync runs.

use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter, QueryOrder,
    QuerySelect,
};
use std::sync::Arc;

use crate::models::sync_job_result::{self, Entity as SyncJobResult};

#[derive(Debug, Clone)]
pub struct SyncJobResultRepository {
    pub db: Arc<DatabaseConnection>,
}

impl SyncJobResultRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    pub async fn append(
        &self,
        result: sync_job_result::ActiveModel,
    ) -> Result<sync_job_result::Model, DbErr> {
        result.insert(&*self.db).await
    }

    /// Most recent runs first, optionally for one provider
    pub async fn list_recent(
        &self,
        provider_id: Option<&str>,
        limit: u64,
    ) -> Result<Vec<sync_job_result::Model>, DbErr> {
        let mut query = SyncJobResult::find();
        if let Some(provider_id) = provider_id {
            query = query.filter(sync_job_result::Column::ProviderId.eq(provider_id));
        }
        query
            .order_by_desc(sync_job_result::Column::StartedAt)
            .limit(limit)
            .all(&*self.db)
            .await
    }
}
