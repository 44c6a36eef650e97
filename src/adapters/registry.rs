//! Adapter registry
//!
//! Lookup table from provider id to its adapter. Registering an id that is
//! already present replaces the adapter, which is how key material is rotated.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::{info, warn};

use super::{NsdcAdapter, ProviderAdapter, ProviderError, ProviderMetadata};
use crate::config::AppConfig;

/// Error type for registry operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum RegistryError {
    #[error("Provider '{0}' not found")]
    ProviderNotFound(String),
}

/// Registry of provider adapters
#[derive(Default)]
pub struct AdapterRegistry {
    adapters: RwLock<HashMap<String, Arc<dyn ProviderAdapter>>>,
}

impl AdapterRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry holding every adapter the configuration enables
    pub fn from_config(config: &AppConfig) -> Result<Self, ProviderError> {
        let registry = Self::new();

        if config.nsdc.is_configured() {
            let adapter = NsdcAdapter::from_config(&config.nsdc)?;
            registry.register(Arc::new(adapter));
        } else {
            warn!("NSDC adapter not registered: CREDSYNC_NSDC_BASE_URL is not set");
        }

        Ok(registry)
    }

    /// Register an adapter, returning the one it replaced
    pub fn register(&self, adapter: Arc<dyn ProviderAdapter>) -> Option<Arc<dyn ProviderAdapter>> {
        let provider_id = adapter.provider_id().to_string();
        let previous = self.write().insert(provider_id.clone(), adapter);
        info!(
            provider_id = %provider_id,
            replaced = previous.is_some(),
            "Registered provider adapter"
        );
        previous
    }

    /// Get an adapter by provider id
    pub fn get(&self, provider_id: &str) -> Result<Arc<dyn ProviderAdapter>, RegistryError> {
        self.read()
            .get(provider_id)
            .cloned()
            .ok_or_else(|| RegistryError::ProviderNotFound(provider_id.to_string()))
    }

    /// Whether an adapter is registered for `provider_id`
    pub fn contains(&self, provider_id: &str) -> bool {
        self.read().contains_key(provider_id)
    }

    /// Metadata for all adapters, sorted by id for stable ordering
    pub fn list_metadata(&self) -> Vec<ProviderMetadata> {
        let mut metadata: Vec<_> = self.read().values().map(|a| a.metadata()).collect();
        metadata.sort_by(|a, b| a.id.cmp(&b.id));
        metadata
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<dyn ProviderAdapter>>> {
        self.adapters
            .read()
            .unwrap_or_else(|poison| poison.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<dyn ProviderAdapter>>> {
        self.adapters
            .write()
            .unwrap_or_else(|poison| poison.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NsdcConfig;

    fn nsdc(secret: &str) -> Arc<dyn ProviderAdapter> {
        let config = NsdcConfig {
            base_url: Some("http://localhost:9".to_string()),
            client_id: Some("id".to_string()),
            client_secret: Some("secret".to_string()),
            webhook_secret: Some(secret.to_string()),
            display_name: "NSDC".to_string(),
        };
        Arc::new(NsdcAdapter::from_config(&config).unwrap())
    }

    #[test]
    fn unknown_provider_is_an_error() {
        let registry = AdapterRegistry::new();
        assert!(matches!(
            registry.get("nope"),
            Err(RegistryError::ProviderNotFound(id)) if id == "nope"
        ));
    }

    #[test]
    fn register_replaces_existing_adapter() {
        let registry = AdapterRegistry::new();
        assert!(registry.register(nsdc("old")).is_none());
        assert!(registry.register(nsdc("new")).is_some());

        let body = b"{}";
        let signature = crate::webhook_verification::sign_hmac_sha256(body, "new");
        let adapter = registry.get("nsdc").unwrap();
        assert!(adapter.verify_signature(body, Some(&signature)));
        assert_eq!(registry.list_metadata().len(), 1);
    }

    #[test]
    fn from_config_skips_unconfigured_providers() {
        let registry = AdapterRegistry::from_config(&AppConfig::default()).unwrap();
        assert!(registry.list_metadata().is_empty());
        assert!(!registry.contains("nsdc"));
    }
}
