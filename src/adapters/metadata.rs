//! Provider metadata types

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Authentication scheme a provider uses
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum AuthType {
    /// Client-credentials token exchange
    ClientCredentials,
    /// Static API key
    ApiKey,
    /// Push-only provider without an API session
    None,
}

/// Metadata about a provider adapter
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ProviderMetadata {
    /// Unique provider id
    pub id: String,
    /// Human readable name
    pub display_name: String,
    pub auth_type: AuthType,
    /// Whether the provider pushes credentials by webhook
    pub webhooks: bool,
    /// Whether polled payloads carry a signature that must be checked
    pub signs_polled_payloads: bool,
    /// Whether a platform issuer record represents this provider
    pub has_issuer: bool,
}

impl ProviderMetadata {
    /// Metadata for a client-credentials provider with webhooks
    pub fn new(id: &str, display_name: &str) -> Self {
        Self {
            id: id.to_string(),
            display_name: display_name.to_string(),
            auth_type: AuthType::ClientCredentials,
            webhooks: true,
            signs_polled_payloads: false,
            has_issuer: true,
        }
    }
}
