//! Credential anchoring client
//!
//! The anchoring service is an external collaborator: given a verified
//! credential it returns a transaction hash. Anchoring is best-effort and
//! never blocks ingestion.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::external_credential;

const ANCHOR_TIMEOUT_SECONDS: u64 = 15;

#[derive(Debug, thiserror::Error)]
pub enum AnchorError {
    #[error("anchoring request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("anchoring service returned {status}: {message}")]
    Rejected { status: u16, message: String },
}

/// Anchors a verified credential and returns the transaction hash.
#[async_trait]
pub trait AnchorClient: Send + Sync {
    async fn anchor(&self, credential: &external_credential::Model) -> Result<String, AnchorError>;
}

#[derive(Debug, Serialize)]
struct AnchorRequest<'a> {
    credential_id: Uuid,
    provider_id: &'a str,
    provider_credential_id: &'a str,
    idempotency_key: &'a str,
    learner_id: Option<Uuid>,
    title: &'a str,
}

#[derive(Debug, Deserialize)]
struct AnchorResponse {
    tx_hash: String,
}

/// `POST {base_url}/anchor`
pub struct HttpAnchorClient {
    base_url: String,
    http_client: Client,
}

impl HttpAnchorClient {
    pub fn new(base_url: &str) -> Result<Self, AnchorError> {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(ANCHOR_TIMEOUT_SECONDS))
            .build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http_client,
        })
    }
}

#[async_trait]
impl AnchorClient for HttpAnchorClient {
    async fn anchor(&self, credential: &external_credential::Model) -> Result<String, AnchorError> {
        let request = AnchorRequest {
            credential_id: credential.id,
            provider_id: &credential.provider_id,
            provider_credential_id: &credential.provider_credential_id,
            idempotency_key: &credential.idempotency_key,
            learner_id: credential.learner_id,
            title: &credential.title,
        };

        let response = self
            .http_client
            .post(format!("{}/anchor", self.base_url))
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(AnchorError::Rejected {
                status: status.as_u16(),
                message,
            });
        }

        let body: AnchorResponse = response.json().await?;
        Ok(body.tx_hash)
    }
}
