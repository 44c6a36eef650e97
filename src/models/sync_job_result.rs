//! SyncJobResult entity model
//!
//! Append-only audit row written at the end of every sync invocation.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde_json::Value as JsonValue;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "sync_job_results")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub provider_id: String,
    /// scheduler, manual, cli or dlq_replay
    pub trigger: String,
    pub full_sync: bool,
    /// completed or failed
    pub status: String,
    pub processed: i32,
    pub created: i32,
    pub updated: i32,
    pub skipped: i32,
    pub pending_review: i32,
    pub rejected: i32,
    pub dead_lettered: i32,
    #[sea_orm(column_type = "JsonBinary")]
    pub errors: JsonValue,
    pub started_at: DateTimeWithTimeZone,
    pub finished_at: DateTimeWithTimeZone,
    pub duration_ms: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
