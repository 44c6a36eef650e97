//! # External Sync Control Handlers
//!
//! Scheduler status, provider listing and manual sync triggers consumed by the
//! operator UI. All routes sit behind operator authentication.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
};
use serde::{Deserialize, Serialize};
use tracing::info;
use utoipa::{IntoParams, ToSchema};

use crate::auth::OperatorAuth;
use crate::error::{ApiError, not_found};
use crate::handlers::types::{ProviderView, SyncJobResultView};
use crate::orchestrator::SyncTrigger;
use crate::scheduler::SchedulerStatus;
use crate::server::AppState;

/// Scheduler and per-provider status
#[derive(Debug, Serialize, ToSchema)]
pub struct ExternalSyncStatus {
    pub scheduler: SchedulerStatus,
    pub providers: Vec<ProviderView>,
}

/// Manual sync request. Omitting `provider_id` syncs every enabled provider.
#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct TriggerSyncRequest {
    #[serde(default, alias = "providerId")]
    pub provider_id: Option<String>,
    #[serde(default, alias = "fullSync")]
    pub full_sync: bool,
}

/// Per-provider outcome of a trigger call
#[derive(Debug, Serialize, ToSchema)]
pub struct TriggerSyncResult {
    pub provider_id: String,
    /// Present when the run started and finished
    pub result: Option<SyncJobResultView>,
    /// Present when the run could not start
    pub error: Option<String>,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct ProviderIdPath {
    /// Provider id (e.g. "nsdc")
    pub provider_id: String,
}

async fn provider_views(state: &AppState) -> Result<Vec<ProviderView>, ApiError> {
    let registry = state.orchestrator.registry();
    let providers = state.orchestrator.providers().list_with_state().await?;
    Ok(providers
        .into_iter()
        .map(|(provider, sync_state)| {
            let registered = registry.contains(&provider.id);
            ProviderView::new(provider, sync_state, registered)
        })
        .collect())
}

#[utoipa::path(
    get,
    path = "/admin/external-sync/status",
    security(("bearer_auth" = [])),
    responses(
        (status = 200, description = "Scheduler and provider status", body = ExternalSyncStatus),
        (status = 401, description = "Missing or invalid operator token", body = ApiError)
    ),
    tag = "external-sync"
)]
pub async fn get_status(
    State(state): State<AppState>,
    _auth: OperatorAuth,
) -> Result<Json<ExternalSyncStatus>, ApiError> {
    Ok(Json(ExternalSyncStatus {
        scheduler: state.scheduler.status(),
        providers: provider_views(&state).await?,
    }))
}

#[utoipa::path(
    get,
    path = "/admin/external-sync/providers",
    security(("bearer_auth" = [])),
    responses(
        (status = 200, description = "Registered providers", body = [ProviderView]),
        (status = 401, description = "Missing or invalid operator token", body = ApiError)
    ),
    tag = "external-sync"
)]
pub async fn list_providers(
    State(state): State<AppState>,
    _auth: OperatorAuth,
) -> Result<Json<Vec<ProviderView>>, ApiError> {
    Ok(Json(provider_views(&state).await?))
}

/// Runs a sync now and returns once it finishes.
///
/// With a `provider_id` a refusal (already running, disabled, unknown) is the
/// response status; without one every enabled provider is attempted and each
/// refusal is reported inline.
#[utoipa::path(
    post,
    path = "/admin/external-sync/trigger",
    security(("bearer_auth" = [])),
    request_body(content = Option<TriggerSyncRequest>, content_type = "application/json"),
    responses(
        (status = 200, description = "Sync results", body = [TriggerSyncResult]),
        (status = 404, description = "Provider not found", body = ApiError),
        (status = 409, description = "Sync already in progress", body = ApiError)
    ),
    tag = "external-sync"
)]
pub async fn trigger_sync(
    State(state): State<AppState>,
    _auth: OperatorAuth,
    body: Option<Json<TriggerSyncRequest>>,
) -> Result<Json<Vec<TriggerSyncResult>>, ApiError> {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    info!(
        provider_id = ?request.provider_id,
        full_sync = request.full_sync,
        "Manual sync requested"
    );

    if let Some(provider_id) = request.provider_id {
        let result = state
            .orchestrator
            .force_sync(&provider_id, request.full_sync, SyncTrigger::Manual)
            .await?;
        return Ok(Json(vec![TriggerSyncResult {
            provider_id,
            result: Some(result.into()),
            error: None,
        }]));
    }

    let results = state
        .orchestrator
        .sync_enabled(request.full_sync, SyncTrigger::Manual)
        .await?;
    Ok(Json(
        results
            .into_iter()
            .map(|(provider_id, result)| match result {
                Ok(run) => TriggerSyncResult {
                    provider_id,
                    result: Some(run.into()),
                    error: None,
                },
                Err(err) => TriggerSyncResult {
                    provider_id,
                    result: None,
                    error: Some(err.to_string()),
                },
            })
            .collect(),
    ))
}

#[utoipa::path(
    post,
    path = "/admin/external-sync/scheduler/start",
    security(("bearer_auth" = [])),
    responses(
        (status = 200, description = "Scheduler status after start", body = SchedulerStatus)
    ),
    tag = "external-sync"
)]
pub async fn start_scheduler(
    State(state): State<AppState>,
    _auth: OperatorAuth,
) -> Json<SchedulerStatus> {
    Json(state.scheduler.start())
}

#[utoipa::path(
    post,
    path = "/admin/external-sync/scheduler/stop",
    security(("bearer_auth" = [])),
    responses(
        (status = 200, description = "Scheduler status after stop", body = SchedulerStatus)
    ),
    tag = "external-sync"
)]
pub async fn stop_scheduler(
    State(state): State<AppState>,
    _auth: OperatorAuth,
) -> Json<SchedulerStatus> {
    Json(state.scheduler.stop())
}

/// Body for enabling or disabling a provider
#[derive(Debug, Deserialize, ToSchema)]
pub struct SetProviderEnabledRequest {
    pub enabled: bool,
}

#[utoipa::path(
    put,
    path = "/admin/external-sync/providers/{provider_id}/enabled",
    security(("bearer_auth" = [])),
    params(ProviderIdPath),
    request_body = SetProviderEnabledRequest,
    responses(
        (status = 200, description = "Updated provider", body = ProviderView),
        (status = 404, description = "Provider not found", body = ApiError)
    ),
    tag = "external-sync"
)]
pub async fn set_provider_enabled(
    State(state): State<AppState>,
    _auth: OperatorAuth,
    Path(path): Path<ProviderIdPath>,
    Json(request): Json<SetProviderEnabledRequest>,
) -> Result<(StatusCode, Json<ProviderView>), ApiError> {
    let providers = state.orchestrator.providers();
    if providers.find_by_id(&path.provider_id).await?.is_none() {
        return Err(not_found(&format!("Provider {} not found", path.provider_id)));
    }

    let provider = providers
        .set_enabled(&path.provider_id, request.enabled)
        .await?;
    let sync_state = state.orchestrator.sync_states().get(&provider.id).await?;
    let registered = state.orchestrator.registry().contains(&provider.id);
    info!(provider_id = %provider.id, enabled = provider.enabled, "Provider toggled");

    Ok((
        StatusCode::OK,
        Json(ProviderView::new(provider, sync_state, registered)),
    ))
}
