//! Provider entity model
//!
//! SeaORM entity for the providers table: the catalog of external skill
//! registries credentials are synchronized from.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;

/// Provider entity representing an external credential registry
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "providers")]
pub struct Model {
    /// Registry identifier, also the adapter lookup key (primary key)
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,

    /// Human readable provider name
    pub name: String,

    /// Whether scheduled and manual syncs may run for this provider
    pub enabled: bool,

    /// Whether a platform issuer record represents this provider
    pub has_issuer: bool,

    /// Timestamp when the provider was registered
    pub created_at: DateTimeWithTimeZone,

    /// Timestamp when the provider was last updated
    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_one = "super::sync_state::Entity")]
    SyncState,
}

impl Related<super::sync_state::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::SyncState.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
