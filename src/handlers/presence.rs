use axum::{extract::{Extension, Path, State}, http::StatusCode, Json};
use std::sync::Arc;
use tracing::error;
use uuid::Uuid;

use crate::auth::auth::{ensure_document_access, CallerIdentity};
use crate::models::{api_error, ApiError, PresenceResponse};
use crate::AppState;

/// List who is present in a document
pub async fn document_presence(
    State(state): State<Arc<AppState>>,
    Path(doc_id): Path<String>,
    Extension(identity): Extension<CallerIdentity>,
) -> Result<Json<PresenceResponse>, ApiError> {
    let document_id = Uuid::parse_str(&doc_id)
        .map_err(|_| api_error(StatusCode::BAD_REQUEST, "Invalid document id"))?;
    ensure_document_access(state.access.as_ref(), &identity, document_id).await?;

    let presence = match state.hubs.persistence() {
        Some(gateway) => gateway.list_presence(document_id).await.map_err(|e| {
            error!("Failed to list presence for document {}: {}", document_id, e);
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "Failed to list presence")
        })?,
        None => Vec::new(),
    };

    Ok(Json(PresenceResponse { document_id, presence }))
}
