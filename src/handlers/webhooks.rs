//! # Webhook Handlers
//!
//! Public ingress for provider-pushed credential events. Authenticity comes
//! from the payload signature, not operator auth; every payload that gets past
//! routing is either ingested or written to the dead letter queue before the
//! response is sent.

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use crate::dlq::reason;
use crate::error::{ApiError, not_found, service_unavailable, unauthorized};
use crate::orchestrator::IngestOutcome;
use crate::server::AppState;
use crate::webhook_verification::signature_from_headers;

/// Path parameter for the provider id
#[derive(Debug, Deserialize, IntoParams)]
pub struct ProviderPathParam {
    /// Provider id (e.g. "nsdc")
    #[param(min_length = 1, example = "nsdc")]
    pub provider: String,
}

/// Webhook accept response
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct WebhookAcceptResponse {
    /// verified, rejected, pending_match, duplicate, skipped or dead_lettered
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_match_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dlq_item_id: Option<Uuid>,
}

impl WebhookAcceptResponse {
    fn from_outcome(outcome: &IngestOutcome) -> Self {
        let mut response = Self {
            status: outcome.label().to_string(),
            credential_id: None,
            pending_match_id: None,
            dlq_item_id: None,
        };
        match outcome {
            IngestOutcome::Credential { credential, .. } => {
                response.credential_id = Some(credential.id)
            }
            IngestOutcome::PendingMatch(pending) => response.pending_match_id = Some(pending.id),
            IngestOutcome::DeadLettered(item) => response.dlq_item_id = Some(item.id),
            IngestOutcome::Skipped(_) => {}
        }
        response
    }
}

/// Accept a signed credential event from an external registry
#[utoipa::path(
    post,
    path = "/webhooks/{provider}",
    params(
        ProviderPathParam,
        ("x-signature" = Option<String>, Header, description = "Hex HMAC-SHA256 of the raw body, optional sha256= prefix"),
        ("x-webhook-signature" = Option<String>, Header, description = "Alternative signature header")
    ),
    request_body(content = serde_json::Value, description = "Provider credential payload", content_type = "application/json"),
    responses(
        (status = 200, description = "Payload processed or dead-lettered", body = WebhookAcceptResponse),
        (status = 401, description = "Signature invalid; payload dead-lettered", body = ApiError),
        (status = 404, description = "Unknown provider", body = ApiError),
        (status = 503, description = "External sync disabled", body = ApiError)
    ),
    tag = "webhooks"
)]
pub async fn ingest_webhook(
    State(state): State<AppState>,
    Path(path): Path<ProviderPathParam>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookAcceptResponse>, ApiError> {
    let provider_id = path.provider;

    if !state.config.sync.enabled {
        return Err(service_unavailable(
            "EXTERNAL_SYNC_DISABLED",
            "External credential sync is disabled",
        ));
    }
    if !state.orchestrator.registry().contains(&provider_id) {
        return Err(not_found(&format!("Provider {provider_id} not found")));
    }

    debug!(provider_id = %provider_id, body_size = body.len(), "Webhook received");

    let signature = signature_from_headers(&headers);
    let outcome = state
        .orchestrator
        .ingest_webhook(&provider_id, &body, signature.as_deref())
        .await?;

    if let IngestOutcome::DeadLettered(item) = &outcome
        && item.reason == reason::SIGNATURE_INVALID
    {
        warn!(
            provider_id = %provider_id,
            dlq_item_id = %item.id,
            "Webhook signature invalid"
        );
        return Err(unauthorized(Some("Invalid webhook signature"))
            .with_details(json!({ "dlq_item_id": item.id })));
    }

    info!(provider_id = %provider_id, outcome = outcome.label(), "Webhook processed");
    Ok(Json(WebhookAcceptResponse::from_outcome(&outcome)))
}

/// Webhook ingress health
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct WebhookHealthResponse {
    pub status: String,
    pub enabled: bool,
    /// Provider ids that accept pushed payloads
    pub providers: Vec<String>,
}

#[utoipa::path(
    get,
    path = "/webhooks/health",
    responses(
        (status = 200, description = "Webhook ingress health", body = WebhookHealthResponse)
    ),
    tag = "webhooks"
)]
pub async fn webhook_health(State(state): State<AppState>) -> (StatusCode, Json<WebhookHealthResponse>) {
    let providers = state
        .orchestrator
        .registry()
        .list_metadata()
        .into_iter()
        .filter(|m| m.webhooks)
        .map(|m| m.id)
        .collect();

    (
        StatusCode::OK,
        Json(WebhookHealthResponse {
            status: "ok".to_string(),
            enabled: state.config.sync.enabled,
            providers,
        }),
    )
}
