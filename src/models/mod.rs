//! # Data Models
//!
//! SeaORM entities for the credential sync pipeline plus small shared response types.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

pub mod dlq_item;
pub mod external_credential;
pub mod issuer;
pub mod learner;
pub mod pending_match;
pub mod provider;
pub mod sync_job_result;
pub mod sync_state;

pub use dlq_item::Entity as DlqItem;
pub use external_credential::Entity as ExternalCredential;
pub use issuer::Entity as Issuer;
pub use learner::Entity as Learner;
pub use pending_match::Entity as PendingMatch;
pub use provider::Entity as Provider;
pub use sync_job_result::Entity as SyncJobResult;
pub use sync_state::Entity as SyncState;

/// Basic service information response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ServiceInfo {
    /// The name of the service
    pub service: String,
    /// The version of the service
    pub version: String,
}

impl Default for ServiceInfo {
    fn default() -> Self {
        Self {
            service: "credential-sync".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}
