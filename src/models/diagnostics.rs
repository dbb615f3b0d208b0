use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// One live document hub
#[derive(Serialize, Deserialize, ToSchema)]
pub struct HubDiagnostics {
    pub document_id: uuid::Uuid,
    pub n_conn: u32,
    pub version: i64,
    pub last_updated: DateTime<Utc>,
}

/// Response for diagnostics information
#[derive(Serialize, Deserialize, ToSchema)]
pub struct DiagnosticsResponse {
    pub n_conn: u32,
    pub n_hubs: u32,
    pub payload_codec: String,
    pub hubs: Vec<HubDiagnostics>,
    pub cpu_usage: f32,
    pub memory_alloc: u64,
    pub memory_total: u64,
    pub memory_free: u64,
}
