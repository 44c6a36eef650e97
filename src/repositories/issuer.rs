//! Issuer repository
//!
//! Read access to the platform issuer projection plus the sync timestamp the
//! pipeline maintains.

use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter,
    QueryOrder, Set, sea_query::Expr,
};
use std::sync::Arc;
use uuid::Uuid;

use crate::models::issuer::{self, Entity as Issuer};

#[derive(Debug, Clone)]
pub struct IssuerRepository {
    pub db: Arc<DatabaseConnection>,
}

impl IssuerRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    pub async fn find_by_id(&self, id: Uuid) -> Result<Option<issuer::Model>, DbErr> {
        Issuer::find_by_id(id).one(&*self.db).await
    }

    /// Finds the issuer that represents an external registry
    ///
    /// # Arguments
    ///
    /// * `registry_id` - Provider id the issuer is linked to
    pub async fn find_by_registry_id(
        &self,
        registry_id: &str,
    ) -> Result<Option<issuer::Model>, DbErr> {
        let issuer = Issuer::find()
            .filter(issuer::Column::RegistryId.eq(registry_id))
            .order_by_asc(issuer::Column::CreatedAt)
            .one(&*self.db)
            .await?;
        Ok(issuer)
    }

    /// Lists issuers linked to an external registry
    pub async fn list_external(&self) -> Result<Vec<issuer::Model>, DbErr> {
        let issuers = Issuer::find()
            .filter(issuer::Column::RegistryId.is_not_null())
            .order_by_asc(issuer::Column::Name)
            .all(&*self.db)
            .await?;
        Ok(issuers)
    }

    /// Records that credentials were ingested for this issuer
    pub async fn touch_last_sync(&self, id: Uuid) -> Result<(), DbErr> {
        let now = Utc::now().fixed_offset();
        Issuer::update_many()
            .col_expr(issuer::Column::LastSyncAt, Expr::value(now))
            .filter(issuer::Column::Id.eq(id))
            .exec(&*self.db)
            .await?;
        Ok(())
    }

    /// Inserts an issuer row. The platform owns issuer onboarding; this exists
    /// for seeding and tests.
    pub async fn insert(
        &self,
        name: &str,
        registry_id: Option<&str>,
        accept_external: bool,
    ) -> Result<issuer::Model, DbErr> {
        let model = issuer::ActiveModel {
            id: Set(Uuid::new_v4()),
            name: Set(name.to_string()),
            registry_id: Set(registry_id.map(str::to_string)),
            accept_external: Set(accept_external),
            last_sync_at: Set(None),
            created_at: Set(Utc::now().fixed_offset()),
        };
        model.insert(&*self.db).await
    }
}
