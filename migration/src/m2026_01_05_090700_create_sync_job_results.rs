//! Migration to create the append-only sync_job_results audit log.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(SyncJobResults::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(SyncJobResults::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(SyncJobResults::ProviderId).text().not_null())
                    .col(ColumnDef::new(SyncJobResults::Trigger).text().not_null())
                    .col(
                        ColumnDef::new(SyncJobResults::FullSync)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(ColumnDef::new(SyncJobResults::Status).text().not_null())
                    .col(
                        ColumnDef::new(SyncJobResults::Processed)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(SyncJobResults::Created)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(SyncJobResults::Updated)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(SyncJobResults::Skipped)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(SyncJobResults::PendingReview)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(SyncJobResults::Rejected)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(SyncJobResults::DeadLettered)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(ColumnDef::new(SyncJobResults::Errors).json_binary().not_null())
                    .col(
                        ColumnDef::new(SyncJobResults::StartedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(SyncJobResults::FinishedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(SyncJobResults::DurationMs)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_sync_job_results_provider_started")
                    .table(SyncJobResults::Table)
                    .col(SyncJobResults::ProviderId)
                    .col(SyncJobResults::StartedAt)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(SyncJobResults::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum SyncJobResults {
    Table,
    Id,
    ProviderId,
    Trigger,
    FullSync,
    Status,
    Processed,
    Created,
    Updated,
    Skipped,
    PendingReview,
    Rejected,
    DeadLettered,
    Errors,
    StartedAt,
    FinishedAt,
    DurationMs,
}
