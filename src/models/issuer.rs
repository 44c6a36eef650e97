//! Issuer entity model
//!
//! Read-mostly projection of platform issuers. The sync pipeline only needs the
//! registry link, the opt-in flag and the last sync timestamp.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "issuers")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub name: String,

    /// Provider id this issuer represents, if it is an external registry
    pub registry_id: Option<String>,

    /// Whether credentials from the linked registry may be ingested
    pub accept_external: bool,

    pub last_sync_at: Option<DateTimeWithTimeZone>,

    pub created_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
