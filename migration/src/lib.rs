//! Database migrations for the credential sync service.

pub use sea_orm_migration::prelude::*;

mod m2026_01_05_090000_create_providers;
mod m2026_01_05_090100_create_issuers;
mod m2026_01_05_090200_create_learners;
mod m2026_01_05_090300_create_sync_states;
mod m2026_01_05_090400_create_external_credentials;
mod m2026_01_05_090500_create_pending_matches;
mod m2026_01_05_090600_create_dlq_items;
mod m2026_01_05_090700_create_sync_job_results;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m2026_01_05_090000_create_providers::Migration),
            Box::new(m2026_01_05_090100_create_issuers::Migration),
            Box::new(m2026_01_05_090200_create_learners::Migration),
            Box::new(m2026_01_05_090300_create_sync_states::Migration),
            Box::new(m2026_01_05_090400_create_external_credentials::Migration),
            Box::new(m2026_01_05_090500_create_pending_matches::Migration),
            Box::new(m2026_01_05_090600_create_dlq_items::Migration),
            Box::new(m2026_01_05_090700_create_sync_job_results::Migration),
        ]
    }
}
