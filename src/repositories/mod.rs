//! # Repository Layer
//!
//! Repository implementations that encapsulate SeaORM operations for the sync
//! pipeline's tables.

pub mod dlq;
pub mod external_credential;
pub mod issuer;
pub mod learner;
pub mod pending_match;
pub mod provider;
pub mod sync_job_result;
pub mod sync_state;

pub use dlq::{DlqRepository, NewDlqItem};
pub use external_credential::{
    CredentialCounts, CredentialFilter, CredentialWrite, ExternalCredentialRepository, WriteEffect,
};
pub use issuer::IssuerRepository;
pub use learner::{LearnerRepository, NewLearner};
pub use pending_match::PendingMatchRepository;
pub use provider::ProviderRepository;
pub use sync_job_result::SyncJobResultRepository;
pub use sync_state::{RunCompletion, SyncStateRepository};
