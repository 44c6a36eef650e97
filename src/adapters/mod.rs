//! Provider adapters
//!
//! - The `ProviderAdapter` trait every external registry integration implements
//! - Provider metadata and the adapter registry used for lookup by provider id
//! - The NSDC reference adapter

pub mod metadata;
pub mod nsdc;
pub mod registry;
pub mod trait_;

pub use metadata::{AuthType, ProviderMetadata};
pub use nsdc::{NSDC_PROVIDER_ID, NsdcAdapter};
pub use registry::{AdapterRegistry, RegistryError};
pub use trait_::{
    FetchedPage, ProviderAdapter, ProviderError, RawExternalCredential, RejectedRecord, Session,
    SyncCursor,
};
