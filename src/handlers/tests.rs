//! # Tests for Handlers
//!
//! Router-level tests driven through `tower::ServiceExt::oneshot`.

use std::sync::Arc;

use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode},
};
use serde_json::{Value, json};
use tower::ServiceExt;

use crate::adapters::{AdapterRegistry, NsdcAdapter};
use crate::config::{AppConfig, NsdcConfig};
use crate::db::test_support::memory_db;
use crate::seeds;
use crate::server::{AppState, create_app};
use crate::webhook_verification::sign_hmac_sha256;

const TOKEN: &str = "operator-test-token";
const WEBHOOK_SECRET: &str = "whsec_handlers";

fn test_config(sync_enabled: bool) -> AppConfig {
    let mut config = AppConfig {
        profile: "test".to_string(),
        database_url: "sqlite::memory:".to_string(),
        operator_tokens: vec![TOKEN.to_string()],
        ..AppConfig::default()
    };
    config.sync.enabled = sync_enabled;
    config.sync.initial_delay_seconds = 3600;
    config.retry.base_delay_ms = 1;
    config.retry.max_delay_ms = 2;
    config.nsdc = NsdcConfig {
        base_url: Some("http://127.0.0.1:9".to_string()),
        client_id: Some("client".to_string()),
        client_secret: Some("secret".to_string()),
        webhook_secret: Some(WEBHOOK_SECRET.to_string()),
        display_name: "NSDC".to_string(),
    };
    config
}

async fn test_app(sync_enabled: bool) -> (Router, AppState) {
    let config = Arc::new(test_config(sync_enabled));
    let db = Arc::new(memory_db().await);
    let registry = AdapterRegistry::new();
    registry.register(Arc::new(NsdcAdapter::from_config(&config.nsdc).unwrap()));
    let registry = Arc::new(registry);
    seeds::seed_providers(&db, &registry).await.unwrap();

    let state = AppState::new(config, db, registry).unwrap();
    (create_app(state.clone()), state)
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn admin_request(method: &str, uri: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("Authorization", format!("Bearer {TOKEN}"))
        .body(Body::empty())
        .unwrap()
}

fn webhook_request(provider: &str, body: &[u8], signature: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(format!("/webhooks/{provider}"))
        .header("Content-Type", "application/json");
    if let Some(signature) = signature {
        builder = builder.header("X-Signature", signature);
    }
    builder.body(Body::from(body.to_vec())).unwrap()
}

fn credential_body(credential_id: &str) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "credential_id": credential_id,
        "candidate_name": "Meera Iyer",
        "candidate_email": "meera@example.com",
        "qualification_title": "Field Technician",
        "issue_date": "2024-05-01"
    }))
    .unwrap()
}

#[tokio::test]
async fn root_returns_service_info() {
    let (app, _) = test_app(true).await;

    let response = app
        .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["service"], "credential-sync");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn healthz_reports_database_ok() {
    let (app, _) = test_app(true).await;

    let response = app
        .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["database"], "ok");
}

#[tokio::test]
async fn admin_routes_require_bearer_token() {
    let (app, _) = test_app(true).await;

    let response = app
        .oneshot(
            Request::builder()
                .uri("/admin/external-sync/status")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(body_json(response).await["code"], "UNAUTHORIZED");
}

#[tokio::test]
async fn status_lists_seeded_provider() {
    let (app, _) = test_app(true).await;

    let response = app
        .oneshot(admin_request("GET", "/admin/external-sync/status"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["scheduler"]["running"], false);
    let providers = body["providers"].as_array().unwrap();
    assert_eq!(providers.len(), 1);
    assert_eq!(providers[0]["id"], "nsdc");
}

#[tokio::test]
async fn scheduler_start_and_stop_endpoints() {
    let (app, state) = test_app(true).await;

    let response = app
        .clone()
        .oneshot(admin_request("POST", "/admin/external-sync/scheduler/start"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["running"], true);
    assert!(state.scheduler.status().running);

    let response = app
        .oneshot(admin_request("POST", "/admin/external-sync/scheduler/stop"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["running"], false);
    assert!(!state.scheduler.status().running);
}

#[tokio::test]
async fn trigger_for_unknown_provider_is_not_found() {
    let (app, _) = test_app(true).await;

    let request = Request::builder()
        .method("POST")
        .uri("/admin/external-sync/trigger")
        .header("Authorization", format!("Bearer {TOKEN}"))
        .header("Content-Type", "application/json")
        .body(Body::from(r#"{"providerId":"nope"}"#))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn webhook_is_unavailable_when_sync_disabled() {
    let (app, state) = test_app(false).await;
    let body = credential_body("NSDC-H1");
    let signature = sign_hmac_sha256(&body, WEBHOOK_SECRET);

    let response = app
        .oneshot(webhook_request("nsdc", &body, Some(&signature)))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(state.orchestrator.dlq().count().await.unwrap(), 0);
}

#[tokio::test]
async fn webhook_for_unknown_provider_is_not_found() {
    let (app, _) = test_app(true).await;

    let response = app
        .oneshot(webhook_request("unknown", b"{}", Some("deadbeef")))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn webhook_with_bad_signature_is_dead_lettered() {
    let (app, state) = test_app(true).await;
    let body = credential_body("NSDC-H2");
    let forged = sign_hmac_sha256(&body, "someone-else");

    let response = app
        .oneshot(webhook_request("nsdc", &body, Some(&forged)))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let payload = body_json(response).await;
    assert!(payload["details"]["dlq_item_id"].is_string());

    let (items, total) = state.orchestrator.dlq().list(10, 0).await.unwrap();
    assert_eq!(total, 1);
    assert_eq!(items[0].reason, "signature_invalid");
    assert_eq!(items[0].job_type, "webhook-ingest");
}

#[tokio::test]
async fn signed_webhook_without_matching_learner_is_rejected() {
    let (app, state) = test_app(true).await;
    let body = credential_body("NSDC-H3");
    let signature = sign_hmac_sha256(&body, WEBHOOK_SECRET);

    let response = app
        .oneshot(webhook_request("nsdc", &body, Some(&signature)))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let payload = body_json(response).await;
    assert_eq!(payload["status"], "rejected");
    assert!(payload["credential_id"].is_string());

    let stored = state
        .orchestrator
        .credentials()
        .find_by_key("nsdc", "NSDC-H3")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, "rejected");
    assert!(stored.signature_verified);
}

#[tokio::test]
async fn dlq_listing_requires_auth_and_returns_page() {
    let (app, state) = test_app(true).await;
    state
        .orchestrator
        .ingest_webhook("nsdc", b"not json", None)
        .await
        .unwrap();

    let response = app
        .oneshot(admin_request("GET", "/admin/sync/dlq?limit=5"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["total"], 1);
    assert_eq!(body["limit"], 5);
    assert_eq!(body["data"][0]["reason"], "signature_invalid");
}
