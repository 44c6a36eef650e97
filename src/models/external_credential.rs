//! ExternalCredential entity model
//!
//! The persisted platform-side record of a credential issued by an external
//! registry. Unique on `(provider_id, provider_credential_id)`.

use std::fmt;
use std::str::FromStr;

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::{Date, DateTimeWithTimeZone};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use utoipa::ToSchema;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "external_credentials")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Provider the credential was pulled or pushed from
    pub provider_id: String,

    /// Provider-local credential identifier
    pub provider_credential_id: String,

    /// `provider:registry:credential` key recorded for audit
    pub idempotency_key: String,

    pub issuer_id: Option<Uuid>,

    /// Resolved internal learner, if matched
    pub learner_id: Option<Uuid>,

    /// One of pending, verified, rejected
    pub status: String,

    pub signature_verified: bool,

    /// How authenticity was established (e.g. nsdc_api, hmac_sha256)
    pub verification_method: String,

    /// Confidence of the chosen learner match in [0, 1]
    pub match_confidence: Option<f64>,

    pub candidate_name: String,
    pub candidate_email: Option<String>,
    pub title: String,
    pub code: Option<String>,
    pub sector: Option<String>,
    pub nsqf_level: Option<i32>,
    pub issue_date: Option<Date>,
    pub certificate_url: Option<String>,

    /// Provider payload as received
    #[sea_orm(column_type = "JsonBinary")]
    pub raw_payload: JsonValue,

    /// Transaction hash returned by the anchoring service
    pub anchor_tx_hash: Option<String>,

    pub created_at: DateTimeWithTimeZone,
    pub processed_at: Option<DateTimeWithTimeZone>,
    pub updated_at: DateTimeWithTimeZone,
}

impl Model {
    pub fn credential_status(&self) -> CredentialStatus {
        self.status.parse().unwrap_or(CredentialStatus::Pending)
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::provider::Entity",
        from = "Column::ProviderId",
        to = "super::provider::Column::Id"
    )]
    Provider,
}

impl Related<super::provider::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Provider.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

/// Processing status of an external credential
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum CredentialStatus {
    Pending,
    Verified,
    Rejected,
}

impl CredentialStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CredentialStatus::Pending => "pending",
            CredentialStatus::Verified => "verified",
            CredentialStatus::Rejected => "rejected",
        }
    }
}

impl fmt::Display for CredentialStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CredentialStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending" => Ok(CredentialStatus::Pending),
            "verified" => Ok(CredentialStatus::Verified),
            "rejected" => Ok(CredentialStatus::Rejected),
            other => Err(format!("unknown credential status '{other}'")),
        }
    }
}
