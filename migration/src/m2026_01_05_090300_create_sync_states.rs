//! Migration to create the sync_states table.
//!
//! One row per provider. The `status` column doubles as the per-provider
//! mutex: a run may only start through a conditional update away from
//! `running`.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(SyncStates::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(SyncStates::ProviderId)
                            .text()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(SyncStates::Status)
                            .text()
                            .not_null()
                            .default("idle"),
                    )
                    .col(
                        ColumnDef::new(SyncStates::LastSyncAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(SyncStates::LastSuccessfulSyncAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(SyncStates::CredentialsSynced)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(ColumnDef::new(SyncStates::Errors).json_binary().not_null())
                    .col(ColumnDef::new(SyncStates::Cursor).json_binary().null())
                    .col(
                        ColumnDef::new(SyncStates::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_sync_states_provider_id")
                            .from(SyncStates::Table, SyncStates::ProviderId)
                            .to(Providers::Table, Providers::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(SyncStates::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum SyncStates {
    Table,
    ProviderId,
    Status,
    LastSyncAt,
    LastSuccessfulSyncAt,
    CredentialsSynced,
    Errors,
    Cursor,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum Providers {
    Table,
    Id,
}
