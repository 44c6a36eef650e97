//! # Sync Administration Handlers
//!
//! Read and repair endpoints over the pipeline's durable state: statistics,
//! issuers, ingested credentials, the dead letter queue and pending matches.

use axum::{
    extract::{Path, Query, State},
    response::Json,
};
use serde::{Deserialize, Serialize};
use tracing::info;
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use crate::auth::OperatorAuth;
use crate::dlq::RetryOutcome;
use crate::error::{ApiError, not_found, validation_error};
use crate::handlers::types::{
    DlqItemView, ExternalCredentialView, IssuerView, PaginatedResponse, PendingMatchView,
    SyncJobResultView, clamp_limit,
};
use crate::models::external_credential::CredentialStatus;
use crate::orchestrator::SyncTrigger;
use crate::repositories::CredentialFilter;
use crate::server::AppState;

const DEFAULT_LIMIT: u64 = 50;
const MAX_LIMIT: u64 = 200;

/// Pipeline counters for the admin dashboard
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct SyncStats {
    pub total_external: u64,
    pub verified: u64,
    pub pending: u64,
    pub rejected: u64,
    /// Open pending matches awaiting review
    pub pending_matches: u64,
    pub dlq_count: u64,
    /// Whether webhooks and scheduled syncs are enabled
    pub feature_enabled: bool,
    /// Auto-accept confidence threshold
    pub match_threshold: f64,
}

#[utoipa::path(
    get,
    path = "/admin/sync/stats",
    security(("bearer_auth" = [])),
    responses(
        (status = 200, description = "Pipeline statistics", body = SyncStats),
        (status = 401, description = "Missing or invalid operator token", body = ApiError)
    ),
    tag = "admin-sync"
)]
pub async fn get_stats(
    State(state): State<AppState>,
    _auth: OperatorAuth,
) -> Result<Json<SyncStats>, ApiError> {
    let orchestrator = &state.orchestrator;
    let counts = orchestrator.credentials().counts().await?;
    let pending_matches = orchestrator.pending_matches().count_open().await?;
    let dlq_count = orchestrator.dlq().count().await?;

    Ok(Json(SyncStats {
        total_external: counts.total,
        verified: counts.verified,
        pending: counts.pending,
        rejected: counts.rejected,
        pending_matches,
        dlq_count,
        feature_enabled: state.config.sync.enabled,
        match_threshold: state.config.matching.threshold_high,
    }))
}

#[utoipa::path(
    get,
    path = "/admin/sync/issuers",
    security(("bearer_auth" = [])),
    responses(
        (status = 200, description = "Issuers linked to an external registry", body = [IssuerView])
    ),
    tag = "admin-sync"
)]
pub async fn list_issuers(
    State(state): State<AppState>,
    _auth: OperatorAuth,
) -> Result<Json<Vec<IssuerView>>, ApiError> {
    let issuers = state.orchestrator.issuers().list_external().await?;
    Ok(Json(issuers.into_iter().map(IssuerView::from).collect()))
}

#[derive(Debug, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct CredentialListQuery {
    /// pending, verified or rejected
    pub status: Option<String>,
    #[serde(alias = "issuerId")]
    pub issuer_id: Option<Uuid>,
    #[serde(alias = "providerId")]
    pub provider_id: Option<String>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

#[utoipa::path(
    get,
    path = "/admin/sync/external-credentials",
    security(("bearer_auth" = [])),
    params(CredentialListQuery),
    responses(
        (status = 200, description = "Ingested credentials, newest first", body = PaginatedResponse<ExternalCredentialView>),
        (status = 400, description = "Invalid filter", body = ApiError)
    ),
    tag = "admin-sync"
)]
pub async fn list_external_credentials(
    State(state): State<AppState>,
    _auth: OperatorAuth,
    Query(query): Query<CredentialListQuery>,
) -> Result<Json<PaginatedResponse<ExternalCredentialView>>, ApiError> {
    let status = query
        .status
        .as_deref()
        .map(str::parse::<CredentialStatus>)
        .transpose()
        .map_err(|err| validation_error("Invalid status filter", serde_json::json!({ "status": err })))?;

    let filter = CredentialFilter {
        status,
        issuer_id: query.issuer_id,
        provider_id: query.provider_id,
        limit: clamp_limit(query.limit, DEFAULT_LIMIT, MAX_LIMIT),
        offset: query.offset.unwrap_or(0),
    };

    let (rows, total) = state.orchestrator.credentials().list(&filter).await?;
    Ok(Json(PaginatedResponse::new(
        rows.into_iter().map(ExternalCredentialView::from).collect(),
        total,
        filter.limit,
        filter.offset,
    )))
}

#[derive(Debug, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct PageQuery {
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

#[utoipa::path(
    get,
    path = "/admin/sync/dlq",
    security(("bearer_auth" = [])),
    params(PageQuery),
    responses(
        (status = 200, description = "Dead letter items, oldest first", body = PaginatedResponse<DlqItemView>)
    ),
    tag = "admin-sync"
)]
pub async fn list_dlq(
    State(state): State<AppState>,
    _auth: OperatorAuth,
    Query(query): Query<PageQuery>,
) -> Result<Json<PaginatedResponse<DlqItemView>>, ApiError> {
    let limit = clamp_limit(query.limit, DEFAULT_LIMIT, MAX_LIMIT);
    let offset = query.offset.unwrap_or(0);
    let dlq = state.orchestrator.dlq();
    let (items, total) = dlq.list(limit, offset).await?;
    Ok(Json(PaginatedResponse::new(
        items
            .into_iter()
            .map(|item| DlqItemView::from(dlq.reveal(item)))
            .collect(),
        total,
        limit,
        offset,
    )))
}

/// Result of a manual DLQ retry
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct DlqRetryResponse {
    /// resolved or failed
    pub status: String,
    pub detail: String,
    /// The item as it stands after a failed retry
    pub item: Option<DlqItemView>,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct IdPath {
    pub id: Uuid,
}

#[utoipa::path(
    post,
    path = "/admin/sync/dlq/{id}/retry",
    security(("bearer_auth" = [])),
    params(IdPath),
    responses(
        (status = 200, description = "Retry attempted; see status", body = DlqRetryResponse),
        (status = 404, description = "DLQ item not found", body = ApiError),
        (status = 422, description = "Stored job handle is unreadable", body = ApiError)
    ),
    tag = "admin-sync"
)]
pub async fn retry_dlq_item(
    State(state): State<AppState>,
    _auth: OperatorAuth,
    Path(path): Path<IdPath>,
) -> Result<Json<DlqRetryResponse>, ApiError> {
    let response = match state.orchestrator.retry_dlq_item(path.id).await? {
        RetryOutcome::Resolved { detail } => DlqRetryResponse {
            status: "resolved".to_string(),
            detail,
            item: None,
        },
        RetryOutcome::Failed { item, error } => DlqRetryResponse {
            status: "failed".to_string(),
            detail: error,
            item: Some(state.orchestrator.dlq().reveal(item).into()),
        },
    };
    info!(dlq_item_id = %path.id, status = %response.status, "Manual DLQ retry");
    Ok(Json(response))
}

#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct IssuerSyncRequest {
    #[serde(default, alias = "fullSync")]
    pub full_sync: bool,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct IssuerIdPath {
    pub issuer_id: Uuid,
}

/// Syncs the external registry an issuer is linked to.
#[utoipa::path(
    post,
    path = "/admin/sync/issuers/{issuer_id}/sync",
    security(("bearer_auth" = [])),
    params(IssuerIdPath),
    request_body(content = Option<IssuerSyncRequest>, content_type = "application/json"),
    responses(
        (status = 200, description = "Finished sync run", body = SyncJobResultView),
        (status = 404, description = "Issuer or provider not found", body = ApiError),
        (status = 409, description = "Sync already in progress", body = ApiError)
    ),
    tag = "admin-sync"
)]
pub async fn sync_issuer(
    State(state): State<AppState>,
    _auth: OperatorAuth,
    Path(path): Path<IssuerIdPath>,
    body: Option<Json<IssuerSyncRequest>>,
) -> Result<Json<SyncJobResultView>, ApiError> {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let issuer = state
        .orchestrator
        .issuers()
        .find_by_id(path.issuer_id)
        .await?
        .ok_or_else(|| not_found(&format!("Issuer {} not found", path.issuer_id)))?;
    let provider_id = issuer.registry_id.ok_or_else(|| {
        not_found(&format!(
            "Issuer {} is not linked to an external registry",
            path.issuer_id
        ))
    })?;

    let result = state
        .orchestrator
        .force_sync(&provider_id, request.full_sync, SyncTrigger::Manual)
        .await?;
    Ok(Json(result.into()))
}

#[derive(Debug, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct RunsQuery {
    #[serde(alias = "providerId")]
    pub provider_id: Option<String>,
    pub limit: Option<u64>,
}

#[utoipa::path(
    get,
    path = "/admin/sync/runs",
    security(("bearer_auth" = [])),
    params(RunsQuery),
    responses(
        (status = 200, description = "Recent sync runs, newest first", body = [SyncJobResultView])
    ),
    tag = "admin-sync"
)]
pub async fn list_runs(
    State(state): State<AppState>,
    _auth: OperatorAuth,
    Query(query): Query<RunsQuery>,
) -> Result<Json<Vec<SyncJobResultView>>, ApiError> {
    let runs = state
        .orchestrator
        .results()
        .list_recent(
            query.provider_id.as_deref(),
            clamp_limit(query.limit, DEFAULT_LIMIT, MAX_LIMIT),
        )
        .await?;
    Ok(Json(runs.into_iter().map(SyncJobResultView::from).collect()))
}

#[derive(Debug, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct LimitQuery {
    pub limit: Option<u64>,
}

#[utoipa::path(
    get,
    path = "/admin/sync/pending-matches",
    security(("bearer_auth" = [])),
    params(LimitQuery),
    responses(
        (status = 200, description = "Open pending matches", body = PaginatedResponse<PendingMatchView>)
    ),
    tag = "admin-sync"
)]
pub async fn list_pending_matches(
    State(state): State<AppState>,
    _auth: OperatorAuth,
    Query(query): Query<LimitQuery>,
) -> Result<Json<PaginatedResponse<PendingMatchView>>, ApiError> {
    let limit = clamp_limit(query.limit, DEFAULT_LIMIT, MAX_LIMIT);
    let pending = state.orchestrator.pending_matches();
    let items = pending.list_open(limit).await?;
    let total = pending.count_open().await?;
    Ok(Json(PaginatedResponse::new(
        items
            .into_iter()
            .map(|item| PendingMatchView::from(state.orchestrator.reveal_pending(item)))
            .collect(),
        total,
        limit,
        0,
    )))
}

/// Operator decision on a pending match. Omitting the learner rejects it.
#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct ResolvePendingMatchRequest {
    #[serde(default, alias = "learnerId")]
    pub learner_id: Option<Uuid>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ResolvePendingMatchResponse {
    pub pending_match: PendingMatchView,
    pub credential: ExternalCredentialView,
}

#[utoipa::path(
    post,
    path = "/admin/sync/pending-matches/{id}/resolve",
    security(("bearer_auth" = [])),
    params(IdPath),
    request_body(content = Option<ResolvePendingMatchRequest>, content_type = "application/json"),
    responses(
        (status = 200, description = "Pending match resolved", body = ResolvePendingMatchResponse),
        (status = 400, description = "Unknown learner", body = ApiError),
        (status = 404, description = "Pending match not found", body = ApiError),
        (status = 409, description = "Already resolved", body = ApiError)
    ),
    tag = "admin-sync"
)]
pub async fn resolve_pending_match(
    State(state): State<AppState>,
    _auth: OperatorAuth,
    Path(path): Path<IdPath>,
    body: Option<Json<ResolvePendingMatchRequest>>,
) -> Result<Json<ResolvePendingMatchResponse>, ApiError> {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let resolved = state
        .orchestrator
        .resolve_pending(path.id, request.learner_id)
        .await?;
    Ok(Json(ResolvePendingMatchResponse {
        pending_match: state
            .orchestrator
            .reveal_pending(resolved.pending_match)
            .into(),
        credential: resolved.credential.into(),
    }))
}
