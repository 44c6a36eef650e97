//! Migration to create the issuers projection.
//!
//! Only the columns the sync pipeline reads or updates are declared here; the
//! rest of the issuer profile lives with the platform's onboarding service.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Issuers::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(Issuers::Id).uuid().not_null().primary_key())
                    .col(ColumnDef::new(Issuers::Name).text().not_null())
                    .col(ColumnDef::new(Issuers::RegistryId).text().null())
                    .col(
                        ColumnDef::new(Issuers::AcceptExternal)
                            .boolean()
                            .not_null()
                            .default(true),
                    )
                    .col(
                        ColumnDef::new(Issuers::LastSyncAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(Issuers::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_issuers_registry_id")
                    .table(Issuers::Table)
                    .col(Issuers::RegistryId)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(Index::drop().name("idx_issuers_registry_id").to_owned())
            .await?;

        manager
            .drop_table(Table::drop().table(Issuers::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Issuers {
    Table,
    Id,
    Name,
    RegistryId,
    AcceptExternal,
    LastSyncAt,
    CreatedAt,
}
