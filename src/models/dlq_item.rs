//! DLQ item entity model
//!
//! A failed unit of ingestion work together with the handle needed to replay it.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde_json::Value as JsonValue;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "dlq_items")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// webhook-ingest, poll-record, poll-item or poll-sync
    pub job_type: String,

    /// Serialized job handle used for replay, sealed when a crypto key is configured
    #[sea_orm(column_type = "JsonBinary")]
    pub job_id: JsonValue,

    /// `job_type:provider_id:subject`; one unresolved item per key
    #[sea_orm(unique)]
    pub dedupe_key: String,

    pub provider_id: Option<String>,

    /// Machine readable reason, e.g. signature_invalid
    pub reason: String,

    /// Error taxonomy bucket: integrity, validation, transient, internal
    pub error_kind: String,

    /// Number of processing attempts, including manual retries
    pub attempts: i32,

    /// Message from the most recent failure
    pub last_error: Option<String>,

    pub created_at: DateTimeWithTimeZone,

    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
