//! SyncState entity model
//!
//! One row per provider holding run status, the last successful cursor and a
//! bounded list of recent errors. The status column is the per-provider mutex.

use std::fmt;
use std::str::FromStr;

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use utoipa::ToSchema;

/// Maximum number of error strings retained on a sync state row
pub const MAX_RECENT_ERRORS: usize = 10;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "sync_states")]
pub struct Model {
    /// Provider this state belongs to (primary key)
    #[sea_orm(primary_key, auto_increment = false)]
    pub provider_id: String,

    /// One of idle, running, completed, failed
    pub status: String,

    /// When the most recent run started
    pub last_sync_at: Option<DateTimeWithTimeZone>,

    /// Start time of the most recent run that completed
    pub last_successful_sync_at: Option<DateTimeWithTimeZone>,

    /// Running total of credentials created by syncs
    pub credentials_synced: i64,

    /// JSON array of recent failure strings, newest last
    #[sea_orm(column_type = "JsonBinary")]
    pub errors: JsonValue,

    /// Cursor recorded at the end of the last successful run
    #[sea_orm(column_type = "JsonBinary", nullable)]
    pub cursor: Option<JsonValue>,

    pub updated_at: DateTimeWithTimeZone,
}

impl Model {
    /// Parsed status, falling back to idle for unknown values
    pub fn sync_status(&self) -> SyncStatus {
        self.status.parse().unwrap_or(SyncStatus::Idle)
    }

    /// Error strings as a vector
    pub fn error_list(&self) -> Vec<String> {
        self.errors
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
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

/// Run status of a provider sync
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Idle,
    Running,
    Completed,
    Failed,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Idle => "idle",
            SyncStatus::Running => "running",
            SyncStatus::Completed => "completed",
            SyncStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "idle" => Ok(SyncStatus::Idle),
            "running" => Ok(SyncStatus::Running),
            "completed" => Ok(SyncStatus::Completed),
            "failed" => Ok(SyncStatus::Failed),
            other => Err(format!("unknown sync status '{other}'")),
        }
    }
}

/// Append `message` to `errors`, keeping only the newest [`MAX_RECENT_ERRORS`]
pub fn push_bounded_error(errors: &JsonValue, message: &str) -> JsonValue {
    let mut list: Vec<JsonValue> = errors.as_array().cloned().unwrap_or_default();
    list.push(JsonValue::String(message.to_string()));
    if list.len() > MAX_RECENT_ERRORS {
        let overflow = list.len() - MAX_RECENT_ERRORS;
        list.drain(..overflow);
    }
    JsonValue::Array(list)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            SyncStatus::Idle,
            SyncStatus::Running,
            SyncStatus::Completed,
            SyncStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<SyncStatus>().unwrap(), status);
        }
        assert!("paused".parse::<SyncStatus>().is_err());
    }

    #[test]
    fn error_list_is_bounded() {
        let mut errors = json!([]);
        for i in 0..15 {
            errors = push_bounded_error(&errors, &format!("error {i}"));
        }
        let list = errors.as_array().unwrap();
        assert_eq!(list.len(), MAX_RECENT_ERRORS);
        assert_eq!(list[0], "error 5");
        assert_eq!(list[MAX_RECENT_ERRORS - 1], "error 14");
    }
}
