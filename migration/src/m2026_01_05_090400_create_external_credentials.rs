//! Migration to create the external_credentials table.
//!
//! The unique index on `(provider_id, provider_credential_id)` is the only
//! concurrency control for credential persistence: racing deliveries of the same
//! credential resolve through insert-or-ignore against it.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(ExternalCredentials::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(ExternalCredentials::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(ExternalCredentials::ProviderId).text().not_null())
                    .col(
                        ColumnDef::new(ExternalCredentials::ProviderCredentialId)
                            .text()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ExternalCredentials::IdempotencyKey)
                            .text()
                            .not_null(),
                    )
                    .col(ColumnDef::new(ExternalCredentials::IssuerId).uuid().null())
                    .col(ColumnDef::new(ExternalCredentials::LearnerId).uuid().null())
                    .col(
                        ColumnDef::new(ExternalCredentials::Status)
                            .text()
                            .not_null()
                            .default("pending"),
                    )
                    .col(
                        ColumnDef::new(ExternalCredentials::SignatureVerified)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(
                        ColumnDef::new(ExternalCredentials::VerificationMethod)
                            .text()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ExternalCredentials::MatchConfidence)
                            .double()
                            .null(),
                    )
                    .col(ColumnDef::new(ExternalCredentials::CandidateName).text().not_null())
                    .col(ColumnDef::new(ExternalCredentials::CandidateEmail).text().null())
                    .col(ColumnDef::new(ExternalCredentials::Title).text().not_null())
                    .col(ColumnDef::new(ExternalCredentials::Code).text().null())
                    .col(ColumnDef::new(ExternalCredentials::Sector).text().null())
                    .col(ColumnDef::new(ExternalCredentials::NsqfLevel).integer().null())
                    .col(ColumnDef::new(ExternalCredentials::IssueDate).date().null())
                    .col(ColumnDef::new(ExternalCredentials::CertificateUrl).text().null())
                    .col(
                        ColumnDef::new(ExternalCredentials::RawPayload)
                            .json_binary()
                            .not_null(),
                    )
                    .col(ColumnDef::new(ExternalCredentials::AnchorTxHash).text().null())
                    .col(
                        ColumnDef::new(ExternalCredentials::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(ExternalCredentials::ProcessedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(ExternalCredentials::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_external_credentials_provider_id")
                            .from(ExternalCredentials::Table, ExternalCredentials::ProviderId)
                            .to(Providers::Table, Providers::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_external_credentials_provider_credential")
                    .table(ExternalCredentials::Table)
                    .col(ExternalCredentials::ProviderId)
                    .col(ExternalCredentials::ProviderCredentialId)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_external_credentials_issuer_status")
                    .table(ExternalCredentials::Table)
                    .col(ExternalCredentials::IssuerId)
                    .col(ExternalCredentials::Status)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_external_credentials_issuer_status")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_index(
                Index::drop()
                    .name("idx_external_credentials_provider_credential")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_table(Table::drop().table(ExternalCredentials::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum ExternalCredentials {
    Table,
    Id,
    ProviderId,
    ProviderCredentialId,
    IdempotencyKey,
    IssuerId,
    LearnerId,
    Status,
    SignatureVerified,
    VerificationMethod,
    MatchConfidence,
    CandidateName,
    CandidateEmail,
    Title,
    Code,
    Sector,
    NsqfLevel,
    IssueDate,
    CertificateUrl,
    RawPayload,
    AnchorTxHash,
    CreatedAt,
    ProcessedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum Providers {
    Table,
    Id,
}
