use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Latest known full state of a document.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SnapshotRecord {
    pub document_id: uuid::Uuid,
    pub state: Vec<u8>,
    pub version: i64,
    pub modified_by: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Presence row, last write wins per (document, user).
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, sqlx::FromRow)]
pub struct PresenceRecord {
    pub document_id: uuid::Uuid,
    pub user_id: String,
    #[schema(value_type = Option<Object>)]
    pub cursor_position: Option<serde_json::Value>,
    pub last_seen: DateTime<Utc>,
}

/// Response for the presence listing
#[derive(Serialize, Deserialize, ToSchema)]
pub struct PresenceResponse {
    pub document_id: uuid::Uuid,
    pub presence: Vec<PresenceRecord>,
}
