//! Migration to create the dead letter queue table.
//!
//! `job_id` stores the serialized job handle needed to replay the failed unit
//! of work through the same ingestion path. `dedupe_key` is unique so a job
//! that keeps failing stays a single row.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(DlqItems::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(DlqItems::Id).uuid().not_null().primary_key())
                    .col(ColumnDef::new(DlqItems::JobType).text().not_null())
                    .col(ColumnDef::new(DlqItems::JobId).json_binary().not_null())
                    .col(ColumnDef::new(DlqItems::DedupeKey).text().not_null())
                    .col(ColumnDef::new(DlqItems::ProviderId).text().null())
                    .col(ColumnDef::new(DlqItems::Reason).text().not_null())
                    .col(ColumnDef::new(DlqItems::ErrorKind).text().not_null())
                    .col(
                        ColumnDef::new(DlqItems::Attempts)
                            .integer()
                            .not_null()
                            .default(1),
                    )
                    .col(ColumnDef::new(DlqItems::LastError).text().null())
                    .col(
                        ColumnDef::new(DlqItems::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(DlqItems::UpdatedAt)
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
                    .name("uq_dlq_items_dedupe_key")
                    .table(DlqItems::Table)
                    .col(DlqItems::DedupeKey)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_dlq_items_created_at")
                    .table(DlqItems::Table)
                    .col(DlqItems::CreatedAt)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(DlqItems::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum DlqItems {
    Table,
    Id,
    JobType,
    JobId,
    DedupeKey,
    ProviderId,
    Reason,
    ErrorKind,
    Attempts,
    LastError,
    CreatedAt,
    UpdatedAt,
}
