//! Test utilities for the credential sync integration tests.
//!
//! Provides an in-memory SQLite database with migrations applied, a wired
//! orchestrator, learner fixtures and a scriptable provider adapter.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use sea_orm::DatabaseConnection;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::Notify;

use credential_sync::adapters::{
    AdapterRegistry, FetchedPage, ProviderAdapter, ProviderError, ProviderMetadata,
    RawExternalCredential, RejectedRecord, Session, SyncCursor,
};
use credential_sync::config::AppConfig;
use credential_sync::db;
use credential_sync::models::learner;
use credential_sync::orchestrator::Orchestrator;
use credential_sync::repositories::{LearnerRepository, NewLearner};
use credential_sync::seeds;
use credential_sync::webhook_verification::verify_hmac_sha256;

/// Config suited to tests: in-memory database and near-instant retries.
pub fn test_config() -> AppConfig {
    let mut config = AppConfig {
        profile: "test".to_string(),
        database_url: "sqlite::memory:".to_string(),
        operator_tokens: vec!["test-token".to_string()],
        ..AppConfig::default()
    };
    config.retry.max_attempts = 2;
    config.retry.base_delay_ms = 1;
    config.retry.max_delay_ms = 2;
    config.retry.jitter_factor = 0.0;
    config.sync.initial_delay_seconds = 3600;
    config
}

/// Sets up an in-memory SQLite database with all migrations applied.
pub async fn setup_test_db() -> Result<Arc<DatabaseConnection>> {
    setup_db(&test_config()).await
}

/// Opens and migrates the database named by `config.database_url`.
pub async fn setup_db(config: &AppConfig) -> Result<Arc<DatabaseConnection>> {
    let db = db::init_pool(config).await?;
    db::run_migrations(&db).await?;
    Ok(Arc::new(db))
}

/// Everything a pipeline test needs
pub struct Harness {
    pub db: Arc<DatabaseConnection>,
    pub config: Arc<AppConfig>,
    pub registry: Arc<AdapterRegistry>,
    pub orchestrator: Arc<Orchestrator>,
}

impl Harness {
    pub async fn new(config: AppConfig, adapters: Vec<Arc<FakeAdapter>>) -> Result<Self> {
        let db = setup_db(&config).await?;
        let config = Arc::new(config);
        let registry = AdapterRegistry::new();
        for adapter in adapters {
            registry.register(adapter);
        }
        let registry = Arc::new(registry);
        seeds::seed_providers(&db, &registry).await?;

        let orchestrator = Arc::new(Orchestrator::new(
            Arc::clone(&db),
            Arc::clone(&config),
            Arc::clone(&registry),
        )?);

        Ok(Self {
            db,
            config,
            registry,
            orchestrator,
        })
    }

    pub fn learners(&self) -> LearnerRepository {
        LearnerRepository::new(Arc::clone(&self.db))
    }

    /// Inserts a learner; `active_days_ago` orders learners for tie-breaks.
    pub async fn insert_learner(
        &self,
        full_name: &str,
        email: Option<&str>,
        active_days_ago: i64,
    ) -> Result<learner::Model> {
        Ok(self
            .learners()
            .insert(NewLearner {
                full_name: full_name.to_string(),
                email: email.map(str::to_string),
                last_active_at: Some((Utc::now() - Duration::days(active_days_ago)).fixed_offset()),
                ..NewLearner::default()
            })
            .await?)
    }

    pub async fn insert_learner_with(&self, new: NewLearner) -> Result<learner::Model> {
        Ok(self.learners().insert(new).await?)
    }
}

/// Webhook and feed item shape understood by [`FakeAdapter`]
#[derive(Debug, Deserialize)]
struct FakePayload {
    id: String,
    name: String,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    phone: Option<String>,
    title: String,
    #[serde(default)]
    training_hours: Option<u32>,
}

/// Builds a fake payload body
pub fn fake_payload(id: &str, name: &str, email: Option<&str>) -> Value {
    json!({
        "id": id,
        "name": name,
        "email": email,
        "title": "Solar PV Installer"
    })
}

/// Builds a normalized credential as [`FakeAdapter`] would produce it
pub fn raw_credential(
    provider_id: &str,
    id: &str,
    name: &str,
    email: Option<&str>,
) -> RawExternalCredential {
    RawExternalCredential {
        provider_id: provider_id.to_string(),
        provider_credential_id: id.to_string(),
        issuer_registry_id: None,
        candidate_name: name.to_string(),
        candidate_email: email.map(str::to_string),
        candidate_phone: None,
        candidate_registry_id: None,
        title: "Solar PV Installer".to_string(),
        code: None,
        issue_date: None,
        sector: None,
        nsqf_level: None,
        training_hours_max: None,
        awarding_bodies: Vec::new(),
        certificate_url: None,
        raw_payload: fake_payload(id, name, email),
        signature: None,
        verification_method: "fake_api".to_string(),
        signature_verified: true,
    }
}

/// Holds one `fetch_since` call open until the test releases it
#[derive(Default)]
pub struct FetchGate {
    /// Notified once the held fetch has started
    pub entered: Notify,
    pub release: Notify,
}

impl FetchGate {
    /// Waits until the held fetch has started, failing after two seconds.
    pub async fn wait_entered(&self) {
        tokio::time::timeout(std::time::Duration::from_secs(2), self.entered.notified())
            .await
            .expect("fetch did not start within 2s");
    }
}

/// Scriptable adapter: serves queued pages and checks HMAC signatures with a
/// fixed secret.
pub struct FakeAdapter {
    id: String,
    secret: String,
    auth_failure: Option<ProviderError>,
    pages: Mutex<VecDeque<Result<FetchedPage, ProviderError>>>,
    fetches: AtomicUsize,
    cursors: Mutex<Vec<SyncCursor>>,
    gate: Mutex<Option<Arc<FetchGate>>>,
}

impl FakeAdapter {
    pub fn new(id: &str, secret: &str) -> Self {
        Self {
            id: id.to_string(),
            secret: secret.to_string(),
            auth_failure: None,
            pages: Mutex::new(VecDeque::new()),
            fetches: AtomicUsize::new(0),
            cursors: Mutex::new(Vec::new()),
            gate: Mutex::new(None),
        }
    }

    /// Makes the next `fetch_since` block until the returned gate is released.
    pub fn hold_next_fetch(&self) -> Arc<FetchGate> {
        let gate = Arc::new(FetchGate::default());
        *self.gate.lock().unwrap_or_else(|poison| poison.into_inner()) = Some(Arc::clone(&gate));
        gate
    }

    pub fn failing_auth(mut self, error: ProviderError) -> Self {
        self.auth_failure = Some(error);
        self
    }

    /// Queues a page of items; `next` is the page token of the following page.
    pub fn push_page(&self, items: Vec<RawExternalCredential>, next: Option<&str>) {
        let page = FetchedPage {
            items,
            rejected: Vec::new(),
            next_cursor: next.map(|token| SyncCursor {
                since: chrono::DateTime::<Utc>::UNIX_EPOCH,
                page_token: Some(token.to_string()),
            }),
            has_more: next.is_some(),
        };
        self.lock_pages().push_back(Ok(page));
    }

    /// Queues a final page holding one record the adapter refused to normalize.
    pub fn push_rejected(&self, provider_credential_id: &str, reason: &str, payload: Value) {
        let page = FetchedPage {
            rejected: vec![RejectedRecord {
                provider_credential_id: Some(provider_credential_id.to_string()),
                reason: reason.to_string(),
                payload,
            }],
            ..FetchedPage::default()
        };
        self.lock_pages().push_back(Ok(page));
    }

    pub fn push_error(&self, error: ProviderError) {
        self.lock_pages().push_back(Err(error));
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    /// Cursors passed to `fetch_since`, in call order
    pub fn seen_cursors(&self) -> Vec<SyncCursor> {
        self.cursors
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .clone()
    }

    fn lock_pages(&self) -> std::sync::MutexGuard<'_, VecDeque<Result<FetchedPage, ProviderError>>> {
        self.pages.lock().unwrap_or_else(|poison| poison.into_inner())
    }

    fn normalize(&self, payload: &Value, method: &str) -> Result<RawExternalCredential, ProviderError> {
        let wire: FakePayload = serde_json::from_value(payload.clone())
            .map_err(|e| ProviderError::Validation(e.to_string()))?;
        let mut raw = raw_credential(&self.id, &wire.id, &wire.name, wire.email.as_deref());
        raw.title = wire.title;
        raw.candidate_phone = wire.phone;
        raw.training_hours_max = wire.training_hours;
        raw.raw_payload = payload.clone();
        raw.verification_method = method.to_string();
        raw.signature_verified = false;
        Ok(raw)
    }
}

#[async_trait]
impl ProviderAdapter for FakeAdapter {
    fn provider_id(&self) -> &str {
        &self.id
    }

    fn metadata(&self) -> ProviderMetadata {
        ProviderMetadata::new(&self.id, &format!("Fake {}", self.id))
    }

    async fn authenticate(&self) -> Result<Session, ProviderError> {
        if let Some(error) = &self.auth_failure {
            return Err(error.clone());
        }
        Ok(Session {
            access_token: "fake-token".to_string(),
            expires_at: Utc::now() + Duration::hours(1),
        })
    }

    async fn fetch_since(
        &self,
        _session: &Session,
        cursor: &SyncCursor,
        _page_size: u32,
    ) -> Result<FetchedPage, ProviderError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.cursors
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .push(cursor.clone());

        let gate = self
            .gate
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .take();
        if let Some(gate) = gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }
        self.lock_pages()
            .pop_front()
            .unwrap_or_else(|| Ok(FetchedPage::default()))
    }

    fn verify_signature(&self, raw_payload: &[u8], signature_header: Option<&str>) -> bool {
        verify_hmac_sha256(raw_payload, signature_header, &self.secret).is_ok()
    }

    fn parse_webhook(&self, body: &[u8]) -> Result<RawExternalCredential, ProviderError> {
        let payload: Value =
            serde_json::from_slice(body).map_err(|e| ProviderError::Validation(e.to_string()))?;
        self.normalize(&payload, "hmac_sha256")
    }

    fn parse_feed_item(&self, item: &Value) -> Result<RawExternalCredential, ProviderError> {
        self.normalize(item, "fake_api")
    }
}
