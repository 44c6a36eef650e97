//! Provider seeding functionality
//!
//! Registers every configured adapter as a provider (with its idle sync state)
//! and, for registries represented by a platform issuer, creates that issuer
//! when it does not exist yet.

use anyhow::Result;
use sea_orm::DatabaseConnection;
use std::sync::Arc;

use crate::adapters::AdapterRegistry;
use crate::repositories::{IssuerRepository, ProviderRepository};

/// Seeds providers and their issuers from the adapter registry
///
/// # Arguments
///
/// * `db` - Database connection
/// * `registry` - Adapters configured for this process
///
/// # Returns
///
/// Returns a Result indicating success or failure
pub async fn seed_providers(db: &Arc<DatabaseConnection>, registry: &AdapterRegistry) -> Result<()> {
    let providers = ProviderRepository::new(Arc::clone(db));
    let issuers = IssuerRepository::new(Arc::clone(db));

    for metadata in registry.list_metadata() {
        let provider = providers
            .register(&metadata.id, &metadata.display_name, metadata.has_issuer)
            .await?;
        log::info!("Provider '{}' registered", provider.id);

        if !provider.has_issuer {
            continue;
        }
        if issuers.find_by_registry_id(&provider.id).await?.is_none() {
            let issuer = issuers.insert(&provider.name, Some(&provider.id), true).await?;
            log::info!(
                "Created issuer '{}' ({}) for provider '{}'",
                issuer.name,
                issuer.id,
                provider.id
            );
        }
    }

    Ok(())
}
