//! Dead letter queue repository

use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, PaginatorTrait,
    QueryFilter, QueryOrder, QuerySelect, Set, sea_query::OnConflict,
};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use uuid::Uuid;

use crate::models::dlq_item::{self, Entity as DlqItem};

/// Fields of a new dead-lettered job
#[derive(Debug, Clone)]
pub struct NewDlqItem {
    pub job_type: String,
    pub job_id: JsonValue,
    pub dedupe_key: String,
    pub provider_id: Option<String>,
    pub reason: String,
    pub error_kind: String,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DlqRepository {
    pub db: Arc<DatabaseConnection>,
}

impl DlqRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Inserts a new item.
    ///
    /// # Returns
    ///
    /// `None` when an item with the same dedupe key already exists
    pub async fn insert(&self, item: NewDlqItem) -> Result<Option<dlq_item::Model>, DbErr> {
        let now = Utc::now().fixed_offset();
        let id = Uuid::new_v4();
        let active = dlq_item::ActiveModel {
            id: Set(id),
            job_type: Set(item.job_type),
            job_id: Set(item.job_id),
            dedupe_key: Set(item.dedupe_key),
            provider_id: Set(item.provider_id),
            reason: Set(item.reason),
            error_kind: Set(item.error_kind),
            attempts: Set(0),
            last_error: Set(item.last_error),
            created_at: Set(now),
            updated_at: Set(now),
        };

        let inserted = DlqItem::insert(active)
            .on_conflict(
                OnConflict::column(dlq_item::Column::DedupeKey)
                    .do_nothing()
                    .to_owned(),
            )
            .exec_without_returning(&*self.db)
            .await;

        match inserted {
            Ok(0) | Err(DbErr::RecordNotInserted) => Ok(None),
            Ok(_) => self.find_by_id(id).await,
            Err(err) => Err(err),
        }
    }

    pub async fn find_by_id(&self, id: Uuid) -> Result<Option<dlq_item::Model>, DbErr> {
        DlqItem::find_by_id(id).one(&*self.db).await
    }

    pub async fn find_by_dedupe_key(&self, key: &str) -> Result<Option<dlq_item::Model>, DbErr> {
        DlqItem::find()
            .filter(dlq_item::Column::DedupeKey.eq(key))
            .one(&*self.db)
            .await
    }

    /// Lists items oldest first
    pub async fn list(&self, limit: u64, offset: u64) -> Result<(Vec<dlq_item::Model>, u64), DbErr> {
        let total = DlqItem::find().count(&*self.db).await?;
        let items = DlqItem::find()
            .order_by_asc(dlq_item::Column::CreatedAt)
            .offset(offset)
            .limit(limit)
            .all(&*self.db)
            .await?;
        Ok((items, total))
    }

    pub async fn count(&self) -> Result<u64, DbErr> {
        DlqItem::find().count(&*self.db).await
    }

    /// Records a retry attempt and its outcome
    pub async fn record_attempt(
        &self,
        item: dlq_item::Model,
        error: Option<&str>,
    ) -> Result<dlq_item::Model, DbErr> {
        let attempts = item.attempts + 1;
        let mut active: dlq_item::ActiveModel = item.into();
        active.attempts = Set(attempts);
        if let Some(error) = error {
            active.last_error = Set(Some(error.to_string()));
        }
        active.updated_at = Set(Utc::now().fixed_offset());
        active.update(&*self.db).await
    }

    /// Records that the same job failed again before its item was resolved
    pub async fn record_repeat_failure(
        &self,
        item: dlq_item::Model,
        reason: &str,
        error_kind: &str,
        error: &str,
    ) -> Result<dlq_item::Model, DbErr> {
        let attempts = item.attempts + 1;
        let mut active: dlq_item::ActiveModel = item.into();
        active.attempts = Set(attempts);
        active.reason = Set(reason.to_string());
        active.error_kind = Set(error_kind.to_string());
        active.last_error = Set(Some(error.to_string()));
        active.updated_at = Set(Utc::now().fixed_offset());
        active.update(&*self.db).await
    }

    pub async fn delete(&self, id: Uuid) -> Result<(), DbErr> {
        let result = DlqItem::delete_by_id(id).exec(&*self.db).await?;
        if result.rows_affected == 0 {
            return Err(DbErr::RecordNotFound(format!("dlq item {id}")));
        }
        Ok(())
    }
}
