//! PendingMatch entity model
//!
//! A normalized credential whose best learner match fell inside the ambiguous
//! confidence band, waiting for an operator decision.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde_json::Value as JsonValue;
use uuid::Uuid;

pub const STATUS_OPEN: &str = "open";
pub const STATUS_RESOLVED: &str = "resolved";

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "pending_matches")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub provider_id: String,

    pub provider_credential_id: String,

    pub issuer_id: Option<Uuid>,

    /// Serialized `RawExternalCredential`
    #[sea_orm(column_type = "JsonBinary")]
    pub credential: JsonValue,

    /// Ordered `[{learner_id, confidence}]`, best first
    #[sea_orm(column_type = "JsonBinary")]
    pub candidates: JsonValue,

    pub top_confidence: f64,

    /// open or resolved
    pub status: String,

    pub resolved_learner_id: Option<Uuid>,

    pub resolved_at: Option<DateTimeWithTimeZone>,

    pub created_at: DateTimeWithTimeZone,

    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
