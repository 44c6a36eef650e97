//! # Error Handling
//!
//! Unified HTTP error handling for the credential sync service: a problem+json
//! response body with trace ID propagation, plus the mappings from domain errors
//! raised by the pipeline.

use axum::{
    extract::rejection::JsonRejection,
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use utoipa::ToSchema;

use crate::adapters::{ProviderError, RegistryError};
use crate::dlq::DlqError;
use crate::orchestrator::{ResolveError, SyncRunError};
use crate::telemetry;

/// Unified API error response structure
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ApiError {
    /// HTTP status code for the response
    #[serde(skip_serializing, skip_deserializing)]
    pub status: StatusCode,
    /// Error code for programmatic handling
    pub code: Box<str>,
    /// Human-readable error message
    pub message: Box<str>,
    /// Additional error details (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Box<serde_json::Value>>,
    /// Suggested retry delay in seconds (optional)
    pub retry_after: Option<u64>,
    /// Correlation trace ID for debugging (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<Box<str>>,
}

impl ApiError {
    /// Create a new API error with the given status code and message
    pub fn new<S: Into<String>>(status: StatusCode, code: S, message: S) -> Self {
        Self {
            status,
            code: code.into().into_boxed_str(),
            message: message.into().into_boxed_str(),
            details: None,
            retry_after: None,
            trace_id: Self::current_trace_id(),
        }
    }

    /// Add details to the error
    pub fn with_details<V: Into<serde_json::Value>>(mut self, details: V) -> Self {
        self.details = Some(Box::new(details.into()));
        self
    }

    /// Set retry after delay
    pub fn with_retry_after(mut self, seconds: u64) -> Self {
        self.retry_after = Some(seconds);
        self
    }

    /// Current request trace ID, or a generated correlation ID outside a request
    fn current_trace_id() -> Option<Box<str>> {
        telemetry::current_trace_id()
            .map(|trace_id| trace_id.into_boxed_str())
            .or_else(|| {
                Some(format!("corr-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]).into_boxed_str())
            })
    }
}

/// Whether `error` is a unique-constraint violation on Postgres or SQLite
pub fn is_unique_violation(error: &sea_orm::DbErr) -> bool {
    use sea_orm::RuntimeErr;

    const PG_UNIQUE: &str = "23505";
    const SQLITE_DUPLICATE_CODES: &[&str] = &["1555", "2067"];

    let runtime_err = match error {
        sea_orm::DbErr::Query(RuntimeErr::SqlxError(sqlx_err))
        | sea_orm::DbErr::Exec(RuntimeErr::SqlxError(sqlx_err)) => sqlx_err,
        _ => return false,
    };

    let Some(db_error) = runtime_err.as_database_error() else {
        return false;
    };

    if db_error.is_unique_violation() {
        return true;
    }

    db_error.code().is_some_and(|code| {
        let code_str = code.as_ref();
        code_str == PG_UNIQUE || SQLITE_DUPLICATE_CODES.contains(&code_str)
    })
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut headers = HeaderMap::new();
        headers.insert(
            "content-type",
            HeaderValue::from_static("application/problem+json"),
        );

        if let Some(retry_after) = self.retry_after
            && let Ok(header_value) = HeaderValue::from_str(&retry_after.to_string())
        {
            headers.insert("retry-after", header_value);
        }

        (self.status, headers, axum::Json(self)).into_response()
    }
}

// Error mappers for common sources

impl From<anyhow::Error> for ApiError {
    fn from(error: anyhow::Error) -> Self {
        tracing::error!("Internal error: {:?}", error);

        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "INTERNAL_SERVER_ERROR",
            "An internal error occurred",
        )
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        let message = match rejection {
            JsonRejection::JsonDataError(err) => format!("Invalid JSON: {}", err),
            JsonRejection::JsonSyntaxError(err) => format!("JSON syntax error: {}", err),
            JsonRejection::MissingJsonContentType(_) => {
                "Missing 'Content-Type: application/json' header".to_string()
            }
            _ => "Invalid request body".to_string(),
        };

        Self::new(StatusCode::BAD_REQUEST, "VALIDATION_FAILED", &message)
    }
}

impl From<sea_orm::DbErr> for ApiError {
    fn from(error: sea_orm::DbErr) -> Self {
        if is_unique_violation(&error) {
            tracing::debug!(?error, "Unique constraint violation detected");
            return conflict("CONFLICT", "Resource already exists");
        }

        match error {
            sea_orm::DbErr::RecordNotFound(record) => {
                not_found(&format!("Record not found: {}", record))
            }
            sea_orm::DbErr::Conn(connection_err) => {
                tracing::error!("Database connection error: {:?}", connection_err);
                Self::new(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "SERVICE_UNAVAILABLE",
                    "Database service unavailable",
                )
            }
            _ => {
                tracing::error!("Database error: {:?}", error);
                Self::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_SERVER_ERROR",
                    "Database error occurred",
                )
            }
        }
    }
}

impl From<SyncRunError> for ApiError {
    fn from(error: SyncRunError) -> Self {
        match error {
            SyncRunError::AlreadyRunning { provider_id } => conflict(
                "SYNC_IN_PROGRESS",
                &format!("Sync already in progress for provider {provider_id}"),
            )
            .with_details(json!({ "provider_id": provider_id })),
            SyncRunError::ProviderNotFound { provider_id } => {
                not_found(&format!("Provider {provider_id} not found"))
            }
            SyncRunError::ProviderDisabled { provider_id } => conflict(
                "PROVIDER_DISABLED",
                &format!("Provider {provider_id} is disabled"),
            ),
            SyncRunError::AdapterMissing { provider_id } => ApiError::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "ADAPTER_UNAVAILABLE",
                &format!("No adapter registered for provider {provider_id}"),
            ),
            SyncRunError::Database(err) => err.into(),
            SyncRunError::Join(message) => anyhow::anyhow!(message).into(),
        }
    }
}

impl From<DlqError> for ApiError {
    fn from(error: DlqError) -> Self {
        match error {
            DlqError::NotFound(id) => not_found(&format!("DLQ item {id} not found")),
            DlqError::InvalidJob { id, message } => ApiError::new(
                StatusCode::UNPROCESSABLE_ENTITY,
                "INVALID_DLQ_JOB",
                &format!("DLQ item {id} cannot be replayed: {message}"),
            ),
            DlqError::Database(err) => err.into(),
        }
    }
}

impl From<ResolveError> for ApiError {
    fn from(error: ResolveError) -> Self {
        match error {
            ResolveError::NotFound(id) => not_found(&format!("Pending match {id} not found")),
            ResolveError::AlreadyResolved(id) => conflict(
                "ALREADY_RESOLVED",
                &format!("Pending match {id} is already resolved"),
            ),
            ResolveError::LearnerNotFound(id) => validation_error(
                "Unknown learner",
                json!({ "learner_id": format!("learner {id} does not exist") }),
            ),
            ResolveError::InvalidPayload(message) => validation_error(
                "Stored credential payload is invalid",
                json!({ "credential": message }),
            ),
            ResolveError::Crypto(err) => anyhow::Error::from(err).into(),
            ResolveError::Database(err) => err.into(),
        }
    }
}

impl From<RegistryError> for ApiError {
    fn from(error: RegistryError) -> Self {
        match error {
            RegistryError::ProviderNotFound(provider_id) => {
                not_found(&format!("Provider {provider_id} not found"))
            }
        }
    }
}

impl From<ProviderError> for ApiError {
    fn from(error: ProviderError) -> Self {
        provider_error(&error)
    }
}

/// Upstream provider error details
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ProviderErrorDetails {
    /// Whether the failure is expected to clear on retry
    pub transient: bool,
    /// HTTP status code from upstream, when there was one
    pub status: Option<u16>,
}

/// Create a provider upstream error (502)
pub fn provider_error(error: &ProviderError) -> ApiError {
    ApiError::new(
        StatusCode::BAD_GATEWAY,
        "PROVIDER_ERROR",
        &truncate(&error.to_string(), 200),
    )
    .with_details(json!(ProviderErrorDetails {
        transient: error.transient(),
        status: error.upstream_status(),
    }))
}

fn truncate(message: &str, max_chars: usize) -> String {
    if message.chars().count() > max_chars {
        let truncated: String = message.chars().take(max_chars).collect();
        format!("{}...", truncated)
    } else {
        message.to_string()
    }
}

/// Create an unauthorized error (401)
pub fn unauthorized(message: Option<&str>) -> ApiError {
    let msg = message.unwrap_or("Authentication required");
    ApiError::new(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", msg)
}

/// Create a not found error (404)
pub fn not_found(message: &str) -> ApiError {
    ApiError::new(StatusCode::NOT_FOUND, "NOT_FOUND", message)
}

/// Create a conflict error (409) with a specific code
pub fn conflict(code: &str, message: &str) -> ApiError {
    ApiError::new(StatusCode::CONFLICT, code, message)
}

/// Create a service unavailable error (503)
pub fn service_unavailable(code: &str, message: &str) -> ApiError {
    ApiError::new(StatusCode::SERVICE_UNAVAILABLE, code, message)
}

/// Create a validation error with field details
pub fn validation_error(message: &str, field_errors: serde_json::Value) -> ApiError {
    ApiError::new(StatusCode::BAD_REQUEST, "VALIDATION_FAILED", message).with_details(field_errors)
}
