//! # Server Configuration
//!
//! Router assembly, shared state and startup for the credential sync API.

use std::sync::Arc;

use anyhow::Context;
use axum::{
    Router, middleware,
    routing::{get, post, put},
};
use sea_orm::DatabaseConnection;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};
use utoipa::{
    Modify, OpenApi,
    openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme},
};
use utoipa_swagger_ui::SwaggerUi;

use crate::adapters::AdapterRegistry;
use crate::anchoring::HttpAnchorClient;
use crate::auth::auth_middleware;
use crate::config::AppConfig;
use crate::handlers::{self, admin_sync, external_sync, webhooks};
use crate::orchestrator::Orchestrator;
use crate::scheduler::Scheduler;
use crate::seeds;
use crate::telemetry;

/// Application state containing shared resources
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub db: Arc<DatabaseConnection>,
    pub orchestrator: Arc<Orchestrator>,
    pub scheduler: Arc<Scheduler>,
}

impl AppState {
    /// Wires the pipeline over an already-migrated database.
    pub fn new(
        config: Arc<AppConfig>,
        db: Arc<DatabaseConnection>,
        registry: Arc<AdapterRegistry>,
    ) -> anyhow::Result<Self> {
        let mut orchestrator = Orchestrator::new(Arc::clone(&db), Arc::clone(&config), registry)
            .context("failed to build ingestion pipeline")?;
        if let Some(base_url) = config.anchor_base_url.as_deref() {
            let client = HttpAnchorClient::new(base_url).context("failed to build anchor client")?;
            orchestrator = orchestrator.with_anchor_client(Arc::new(client));
        }
        let orchestrator = Arc::new(orchestrator);
        let scheduler = Arc::new(Scheduler::new(&config, Arc::clone(&orchestrator)));

        Ok(Self {
            config,
            db,
            orchestrator,
            scheduler,
        })
    }
}

/// Creates and configures the Axum application router
pub fn create_app(state: AppState) -> Router {
    let admin = Router::new()
        .route("/external-sync/status", get(external_sync::get_status))
        .route("/external-sync/providers", get(external_sync::list_providers))
        .route(
            "/external-sync/providers/{provider_id}/enabled",
            put(external_sync::set_provider_enabled),
        )
        .route("/external-sync/trigger", post(external_sync::trigger_sync))
        .route(
            "/external-sync/scheduler/start",
            post(external_sync::start_scheduler),
        )
        .route(
            "/external-sync/scheduler/stop",
            post(external_sync::stop_scheduler),
        )
        .route("/sync/stats", get(admin_sync::get_stats))
        .route("/sync/issuers", get(admin_sync::list_issuers))
        .route("/sync/issuers/{issuer_id}/sync", post(admin_sync::sync_issuer))
        .route(
            "/sync/external-credentials",
            get(admin_sync::list_external_credentials),
        )
        .route("/sync/runs", get(admin_sync::list_runs))
        .route("/sync/dlq", get(admin_sync::list_dlq))
        .route("/sync/dlq/{id}/retry", post(admin_sync::retry_dlq_item))
        .route(
            "/sync/pending-matches",
            get(admin_sync::list_pending_matches),
        )
        .route(
            "/sync/pending-matches/{id}/resolve",
            post(admin_sync::resolve_pending_match),
        )
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    Router::new()
        .route("/", get(handlers::root))
        .route("/healthz", get(handlers::healthz))
        .route("/webhooks/health", get(webhooks::webhook_health))
        .route("/webhooks/{provider}", post(webhooks::ingest_webhook))
        .nest("/admin", admin)
        .with_state(state)
        .merge(SwaggerUi::new("/docs").url("/openapi.json", ApiDoc::openapi()))
        .layer(middleware::from_fn(telemetry::trace_id_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Starts the server with the given configuration.
///
/// Recovers abandoned sync states, registers configured providers and starts
/// the scheduler (when autostart is on) before accepting requests.
pub async fn run_server(config: AppConfig, db: DatabaseConnection) -> anyhow::Result<()> {
    let config = Arc::new(config);
    let db = Arc::new(db);

    let registry =
        Arc::new(AdapterRegistry::from_config(&config).context("failed to build provider adapters")?);
    seeds::seed_providers(&db, &registry).await?;

    let state = AppState::new(Arc::clone(&config), Arc::clone(&db), registry)?;
    let recovered = state.orchestrator.recover_stale().await?;
    if !recovered.is_empty() {
        warn!(providers = ?recovered, "Recovered sync states left running by a previous process");
    }

    if config.sync.enabled && config.sync.autostart {
        state.scheduler.start();
    }

    let addr = config.bind_addr().context("invalid CREDSYNC_API_BIND_ADDR")?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, profile = %config.profile, "Server listening");

    let scheduler = Arc::clone(&state.scheduler);
    let app = create_app(state);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = %err, "Failed to listen for shutdown signal");
            }
        })
        .await?;

    scheduler.stop();
    info!("Server stopped");
    Ok(())
}

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        let components = openapi.components.get_or_insert_with(Default::default);
        components.add_security_scheme(
            "bearer_auth",
            SecurityScheme::Http(HttpBuilder::new().scheme(HttpAuthScheme::Bearer).build()),
        );
    }
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    paths(
        crate::handlers::root,
        crate::handlers::healthz,
        crate::handlers::webhooks::ingest_webhook,
        crate::handlers::webhooks::webhook_health,
        crate::handlers::external_sync::get_status,
        crate::handlers::external_sync::list_providers,
        crate::handlers::external_sync::set_provider_enabled,
        crate::handlers::external_sync::trigger_sync,
        crate::handlers::external_sync::start_scheduler,
        crate::handlers::external_sync::stop_scheduler,
        crate::handlers::admin_sync::get_stats,
        crate::handlers::admin_sync::list_issuers,
        crate::handlers::admin_sync::list_external_credentials,
        crate::handlers::admin_sync::list_dlq,
        crate::handlers::admin_sync::retry_dlq_item,
        crate::handlers::admin_sync::sync_issuer,
        crate::handlers::admin_sync::list_runs,
        crate::handlers::admin_sync::list_pending_matches,
        crate::handlers::admin_sync::resolve_pending_match,
    ),
    components(
        schemas(
            crate::models::ServiceInfo,
            crate::handlers::HealthResponse,
            crate::error::ApiError,
            crate::scheduler::SchedulerStatus,
            crate::handlers::types::ProviderView,
            crate::handlers::types::SyncStateView,
            crate::handlers::types::SyncJobResultView,
            crate::handlers::types::ExternalCredentialView,
            crate::handlers::types::DlqItemView,
            crate::handlers::types::PendingMatchView,
            crate::handlers::types::IssuerView,
            crate::handlers::external_sync::ExternalSyncStatus,
            crate::handlers::external_sync::TriggerSyncRequest,
            crate::handlers::external_sync::TriggerSyncResult,
            crate::handlers::external_sync::SetProviderEnabledRequest,
            crate::handlers::admin_sync::SyncStats,
            crate::handlers::admin_sync::DlqRetryResponse,
            crate::handlers::admin_sync::IssuerSyncRequest,
            crate::handlers::admin_sync::ResolvePendingMatchRequest,
            crate::handlers::admin_sync::ResolvePendingMatchResponse,
            crate::handlers::webhooks::WebhookAcceptResponse,
            crate::handlers::webhooks::WebhookHealthResponse,
        )
    ),
    modifiers(&SecurityAddon),
    info(
        title = "Credential Sync API",
        description = "External credential ingestion, matching and dead letter administration",
        version = env!("CARGO_PKG_VERSION"),
    )
)]
pub struct ApiDoc;
