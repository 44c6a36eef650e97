//! Migration to create the pending_matches review queue.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(PendingMatches::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(PendingMatches::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(PendingMatches::ProviderId).text().not_null())
                    .col(
                        ColumnDef::new(PendingMatches::ProviderCredentialId)
                            .text()
                            .not_null(),
                    )
                    .col(ColumnDef::new(PendingMatches::IssuerId).uuid().null())
                    .col(ColumnDef::new(PendingMatches::Credential).json_binary().not_null())
                    .col(ColumnDef::new(PendingMatches::Candidates).json_binary().not_null())
                    .col(
                        ColumnDef::new(PendingMatches::TopConfidence)
                            .double()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(PendingMatches::Status)
                            .text()
                            .not_null()
                            .default("open"),
                    )
                    .col(ColumnDef::new(PendingMatches::ResolvedLearnerId).uuid().null())
                    .col(
                        ColumnDef::new(PendingMatches::ResolvedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(PendingMatches::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(PendingMatches::UpdatedAt)
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
                    .name("idx_pending_matches_provider_credential")
                    .table(PendingMatches::Table)
                    .col(PendingMatches::ProviderId)
                    .col(PendingMatches::ProviderCredentialId)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_pending_matches_status_created")
                    .table(PendingMatches::Table)
                    .col(PendingMatches::Status)
                    .col(PendingMatches::CreatedAt)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(PendingMatches::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum PendingMatches {
    Table,
    Id,
    ProviderId,
    ProviderCredentialId,
    IssuerId,
    Credential,
    Candidates,
    TopConfidence,
    Status,
    ResolvedLearnerId,
    ResolvedAt,
    CreatedAt,
    UpdatedAt,
}
