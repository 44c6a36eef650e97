//! Migration to create the learners projection used for identity matching.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Learners::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(Learners::Id).uuid().not_null().primary_key())
                    .col(ColumnDef::new(Learners::FullName).text().not_null())
                    .col(ColumnDef::new(Learners::Email).text().null())
                    .col(ColumnDef::new(Learners::SecondaryEmail).text().null())
                    .col(ColumnDef::new(Learners::Phone).text().null())
                    .col(ColumnDef::new(Learners::RegistryId).text().null())
                    .col(
                        ColumnDef::new(Learners::LastActiveAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(Learners::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        for (name, column) in [
            ("idx_learners_email", Learners::Email),
            ("idx_learners_secondary_email", Learners::SecondaryEmail),
            ("idx_learners_phone", Learners::Phone),
        ] {
            manager
                .create_index(
                    Index::create()
                        .name(name)
                        .table(Learners::Table)
                        .col(column)
                        .to_owned(),
                )
                .await?;
        }

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Learners::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Learners {
    Table,
    Id,
    FullName,
    Email,
    SecondaryEmail,
    Phone,
    RegistryId,
    LastActiveAt,
    CreatedAt,
}
