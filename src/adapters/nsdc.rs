//! NSDC registry adapter
//!
//! Client-credentials auth against `POST /auth`, page-numbered credential feed
//! at `GET /credentials`, and HMAC-SHA256 signed webhooks.

use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use regex::Regex;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{
    FetchedPage, ProviderAdapter, ProviderError, ProviderMetadata, RawExternalCredential,
    RejectedRecord, Session, SyncCursor,
};
use crate::config::NsdcConfig;
use crate::webhook_verification::verify_hmac_sha256;

/// Provider id under which the adapter registers
pub const NSDC_PROVIDER_ID: &str = "nsdc";

/// Verification method recorded for credentials pulled over the API session
pub const VERIFICATION_API: &str = "nsdc_api";
/// Verification method recorded for HMAC-signed webhook credentials
pub const VERIFICATION_HMAC: &str = "hmac_sha256";

const TOKEN_REFRESH_MARGIN_SECONDS: i64 = 60;
const DEFAULT_TOKEN_TTL_SECONDS: i64 = 3600;
const HTTP_TIMEOUT_SECONDS: u64 = 30;

/// NSDC adapter
pub struct NsdcAdapter {
    display_name: String,
    base_url: String,
    client_id: String,
    client_secret: String,
    webhook_secret: Option<String>,
    http_client: Client,
    token_cache: Mutex<Option<Session>>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct CredentialPage {
    #[serde(default)]
    data: Vec<Value>,
    pagination: Pagination,
}

#[derive(Debug, Deserialize)]
struct Pagination {
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct TrainingHours {
    #[serde(default)]
    max: Option<u32>,
}

/// Wire shape shared by the feed and webhook payloads
#[derive(Debug, Default, Deserialize)]
struct NsdcCredential {
    #[serde(default)]
    credential_id: Option<String>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    partner_id: Option<String>,
    #[serde(default)]
    provider_id: Option<String>,
    #[serde(default)]
    candidate_name: Option<String>,
    #[serde(default)]
    candidate_email: Option<String>,
    #[serde(default)]
    candidate_phone: Option<String>,
    #[serde(default)]
    candidate_id: Option<String>,
    #[serde(default)]
    qualification_title: Option<String>,
    #[serde(default)]
    qp_code: Option<String>,
    #[serde(default)]
    sector: Option<String>,
    #[serde(default)]
    nsqf_level: Option<i32>,
    #[serde(default)]
    training_hours: Option<TrainingHours>,
    #[serde(default)]
    awarding_body: Option<String>,
    #[serde(default)]
    awarding_bodies: Option<Vec<String>>,
    #[serde(default)]
    issue_date: Option<String>,
    #[serde(default)]
    certificate_url: Option<String>,
}

impl NsdcAdapter {
    /// Build the adapter from configuration
    pub fn from_config(config: &NsdcConfig) -> Result<Self, ProviderError> {
        let base_url = config
            .base_url
            .as_deref()
            .filter(|url| !url.is_empty())
            .ok_or_else(|| ProviderError::Configuration("NSDC base URL is not set".into()))?;
        url::Url::parse(base_url)
            .map_err(|e| ProviderError::Configuration(format!("invalid NSDC base URL: {e}")))?;

        let http_client = Client::builder()
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECONDS))
            .build()
            .map_err(|e| ProviderError::Configuration(format!("HTTP client: {e}")))?;

        Ok(Self {
            display_name: config.display_name.clone(),
            base_url: base_url.trim_end_matches('/').to_string(),
            client_id: config.client_id.clone().unwrap_or_default(),
            client_secret: config.client_secret.clone().unwrap_or_default(),
            webhook_secret: config.webhook_secret.clone(),
            http_client,
            token_cache: Mutex::new(None),
        })
    }

    async fn request_token(&self) -> Result<Session, ProviderError> {
        let response = self
            .http_client
            .post(format!("{}/auth", self.base_url))
            .json(&serde_json::json!({
                "client_id": self.client_id,
                "client_secret": self.client_secret,
            }))
            .send()
            .await?;

        let status = response.status();
        if matches!(
            status,
            StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN
        ) {
            return Err(ProviderError::Authentication {
                message: format!("token exchange rejected with HTTP {}", status.as_u16()),
                transient: false,
            });
        }
        if !status.is_success() {
            return Err(http_error(response).await);
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Malformed(format!("token response: {e}")))?;
        let ttl = token.expires_in.unwrap_or(DEFAULT_TOKEN_TTL_SECONDS).max(0);

        Ok(Session {
            access_token: token.access_token,
            expires_at: Utc::now() + chrono::Duration::seconds(ttl),
        })
    }

    async fn invalidate_token(&self) {
        *self.token_cache.lock().await = None;
    }

    async fn get_page(
        &self,
        access_token: &str,
        cursor: &SyncCursor,
        page: u32,
        page_size: u32,
    ) -> Result<reqwest::Response, ProviderError> {
        let since = cursor.since.to_rfc3339_opts(SecondsFormat::Secs, true);
        let response = self
            .http_client
            .get(format!("{}/credentials", self.base_url))
            .bearer_auth(access_token)
            .query(&[
                ("since", since),
                ("page", page.to_string()),
                ("per_page", page_size.to_string()),
            ])
            .send()
            .await?;
        Ok(response)
    }
}

#[async_trait]
impl ProviderAdapter for NsdcAdapter {
    fn provider_id(&self) -> &str {
        NSDC_PROVIDER_ID
    }

    fn metadata(&self) -> ProviderMetadata {
        ProviderMetadata::new(NSDC_PROVIDER_ID, &self.display_name)
    }

    async fn authenticate(&self) -> Result<Session, ProviderError> {
        let mut cache = self.token_cache.lock().await;
        if let Some(session) = cache.as_ref()
            && !session.expires_within(TOKEN_REFRESH_MARGIN_SECONDS)
        {
            return Ok(session.clone());
        }

        debug!(provider_id = NSDC_PROVIDER_ID, "Requesting access token");
        let session = self.request_token().await?;
        info!(
            provider_id = NSDC_PROVIDER_ID,
            expires_at = %session.expires_at,
            "Authenticated with provider"
        );
        *cache = Some(session.clone());
        Ok(session)
    }

    async fn fetch_since(
        &self,
        session: &Session,
        cursor: &SyncCursor,
        page_size: u32,
    ) -> Result<FetchedPage, ProviderError> {
        let page = parse_page_token(cursor.page_token.as_deref())?;

        let mut response = self
            .get_page(&session.access_token, cursor, page, page_size)
            .await?;

        if response.status() == StatusCode::UNAUTHORIZED {
            warn!(
                provider_id = NSDC_PROVIDER_ID,
                "Access token rejected; re-authenticating once"
            );
            self.invalidate_token().await;
            let fresh = self.authenticate().await?;
            response = self
                .get_page(&fresh.access_token, cursor, page, page_size)
                .await?;
            if response.status() == StatusCode::UNAUTHORIZED {
                return Err(ProviderError::Authentication {
                    message: "access token rejected after re-authentication".into(),
                    transient: true,
                });
            }
        }

        if !response.status().is_success() {
            return Err(http_error(response).await);
        }

        let body: CredentialPage = response
            .json()
            .await
            .map_err(|e| ProviderError::Malformed(format!("credential page: {e}")))?;

        let mut fetched = FetchedPage::default();
        for item in body.data {
            match normalize(&item, VERIFICATION_API) {
                Ok(credential) => fetched.items.push(credential),
                Err(reason) => fetched.rejected.push(RejectedRecord {
                    provider_credential_id: item_id(&item),
                    reason,
                    payload: item,
                }),
            }
        }

        if let Some(token) = body.pagination.next_page_token.filter(|t| !t.is_empty()) {
            fetched.has_more = true;
            fetched.next_cursor = Some(SyncCursor {
                since: cursor.since,
                page_token: Some(token),
            });
        }

        debug!(
            provider_id = NSDC_PROVIDER_ID,
            page,
            items = fetched.items.len(),
            rejected = fetched.rejected.len(),
            has_more = fetched.has_more,
            "Fetched credential page"
        );
        Ok(fetched)
    }

    fn verify_signature(&self, raw_payload: &[u8], signature_header: Option<&str>) -> bool {
        let Some(secret) = self.webhook_secret.as_deref() else {
            warn!(
                provider_id = NSDC_PROVIDER_ID,
                "Webhook secret not configured; rejecting signature"
            );
            return false;
        };

        match verify_hmac_sha256(raw_payload, signature_header, secret) {
            Ok(()) => true,
            Err(err) => {
                debug!(provider_id = NSDC_PROVIDER_ID, error = %err, "Signature check failed");
                false
            }
        }
    }

    fn parse_webhook(&self, body: &[u8]) -> Result<RawExternalCredential, ProviderError> {
        let payload: Value = serde_json::from_slice(body)
            .map_err(|e| ProviderError::Validation(format!("webhook body is not JSON: {e}")))?;
        normalize(&payload, VERIFICATION_HMAC).map_err(ProviderError::Validation)
    }

    fn parse_feed_item(&self, item: &Value) -> Result<RawExternalCredential, ProviderError> {
        normalize(item, VERIFICATION_API).map_err(ProviderError::Validation)
    }
}

async fn http_error(response: reqwest::Response) -> ProviderError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    let message: String = body.chars().take(200).collect();
    ProviderError::Http { status, message }
}

fn parse_page_token(token: Option<&str>) -> Result<u32, ProviderError> {
    match token {
        None => Ok(1),
        Some(token) => token
            .strip_prefix("page_")
            .and_then(|n| n.parse::<u32>().ok())
            .filter(|n| *n >= 1)
            .ok_or_else(|| ProviderError::Malformed(format!("unrecognized page token '{token}'"))),
    }
}

fn item_id(item: &Value) -> Option<String> {
    ["credential_id", "id"]
        .iter()
        .find_map(|key| item.get(*key))
        .and_then(|v| match v {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
}

static EMAIL_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("EMAIL_REGEX is a valid regex pattern")
});

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_issue_date(raw: &str) -> Option<NaiveDate> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.date_naive())
        .ok()
        .or_else(|| NaiveDate::parse_from_str(raw, "%Y-%m-%d").ok())
}

/// Map one NSDC payload onto a normalized credential, or explain why it is unusable.
fn normalize(payload: &Value, verification_method: &str) -> Result<RawExternalCredential, String> {
    let wire: NsdcCredential = serde_json::from_value(payload.clone())
        .map_err(|e| format!("payload does not match the NSDC schema: {e}"))?;

    let provider_credential_id = non_empty(wire.credential_id)
        .or_else(|| non_empty(wire.id))
        .ok_or_else(|| "missing credential_id".to_string())?;
    let candidate_name =
        non_empty(wire.candidate_name).ok_or_else(|| "missing candidate_name".to_string())?;
    let title = non_empty(wire.qualification_title)
        .ok_or_else(|| "missing qualification_title".to_string())?;

    let candidate_email = non_empty(wire.candidate_email).map(|e| e.to_lowercase());
    if let Some(email) = &candidate_email
        && !EMAIL_REGEX.is_match(email)
    {
        return Err(format!("invalid candidate_email '{email}'"));
    }

    let issue_date = match non_empty(wire.issue_date) {
        Some(raw) => {
            Some(parse_issue_date(&raw).ok_or_else(|| format!("invalid issue_date '{raw}'"))?)
        }
        None => None,
    };

    let mut awarding_bodies = wire.awarding_bodies.unwrap_or_default();
    if let Some(body) = non_empty(wire.awarding_body)
        && !awarding_bodies.contains(&body)
    {
        awarding_bodies.push(body);
    }

    Ok(RawExternalCredential {
        provider_id: NSDC_PROVIDER_ID.to_string(),
        provider_credential_id,
        issuer_registry_id: non_empty(wire.partner_id).or_else(|| non_empty(wire.provider_id)),
        candidate_name,
        candidate_email,
        candidate_phone: non_empty(wire.candidate_phone),
        candidate_registry_id: non_empty(wire.candidate_id),
        title,
        code: non_empty(wire.qp_code),
        issue_date,
        sector: non_empty(wire.sector),
        nsqf_level: wire.nsqf_level,
        training_hours_max: wire.training_hours.and_then(|h| h.max),
        awarding_bodies,
        certificate_url: non_empty(wire.certificate_url),
        raw_payload: payload.clone(),
        signature: None,
        verification_method: verification_method.to_string(),
        signature_verified: false,
    })
}
