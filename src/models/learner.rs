//! Learner entity model
//!
//! Identity fields of internal learners used by the matching engine.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "learners")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub full_name: String,

    /// Primary contact email (stored lowercase)
    pub email: Option<String>,

    /// Alternate email the learner has verified
    pub secondary_email: Option<String>,

    /// Phone number in E.164 form
    pub phone: Option<String>,

    /// Candidate identifier assigned by an external registry
    pub registry_id: Option<String>,

    /// Last time the learner was active on the platform; used for tie-breaks
    pub last_active_at: Option<DateTimeWithTimeZone>,

    pub created_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
