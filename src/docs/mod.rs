use utoipa::OpenApi;
use crate::models::*;

/// Health check endpoint
#[utoipa::path(
    get,
    path = "/api/health",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse)
    )
)]
#[allow(dead_code)]
pub async fn health_check_doc() {}

/// Readiness check endpoint
#[utoipa::path(
    get,
    path = "/api/ready",
    responses(
        (status = 200, description = "Service is ready", body = HealthResponse)
    )
)]
#[allow(dead_code)]
pub async fn ready_check_doc() {}

/// Live hubs and process load, for cloud admins
#[utoipa::path(
    get,
    path = "/api/v1/diagnostics",
    responses(
        (status = 200, description = "Diagnostics snapshot", body = DiagnosticsResponse),
        (status = 401, description = "Missing or invalid token", body = ErrorResponse),
        (status = 403, description = "Cloud Admin access required", body = ErrorResponse)
    ),
    security(("bearer" = []))
)]
#[allow(dead_code)]
pub async fn diagnostics_doc() {}

/// Users present in a document
#[utoipa::path(
    get,
    path = "/api/v1/documents/{doc_id}/presence",
    params(("doc_id" = String, Path, description = "Document id")),
    responses(
        (status = 200, description = "Presence rows", body = PresenceResponse),
        (status = 400, description = "Invalid document id", body = ErrorResponse),
        (status = 403, description = "Access to document denied", body = ErrorResponse),
        (status = 404, description = "Document not found", body = ErrorResponse)
    ),
    security(("bearer" = []))
)]
#[allow(dead_code)]
pub async fn presence_doc() {}

/// Open a collaboration socket on a document
#[utoipa::path(
    get,
    path = "/ws/documents/{doc_id}",
    params(("doc_id" = String, Path, description = "Document id")),
    responses(
        (status = 101, description = "Switching to the WebSocket protocol"),
        (status = 400, description = "Invalid document id", body = ErrorResponse),
        (status = 401, description = "Missing or invalid token", body = ErrorResponse),
        (status = 403, description = "Forbidden", body = ErrorResponse),
        (status = 404, description = "Document not found", body = ErrorResponse),
        (status = 500, description = "Access check failed", body = ErrorResponse)
    ),
    security(("bearer" = []))
)]
#[allow(dead_code)]
pub async fn ws_document_doc() {}

/// Open a read-only guest socket through a share link
#[utoipa::path(
    get,
    path = "/ws/public/documents/{doc_id}",
    params(
        ("doc_id" = String, Path, description = "Document id"),
        ("sig" = String, Query, description = "Hex HMAC-SHA256 signature"),
        ("exp" = i64, Query, description = "Expiry in unix seconds")
    ),
    responses(
        (status = 101, description = "Switching to the WebSocket protocol"),
        (status = 400, description = "Invalid document id or missing parameters", body = ErrorResponse),
        (status = 404, description = "Share link not found", body = ErrorResponse),
        (status = 410, description = "Share link expired", body = ErrorResponse)
    )
)]
#[allow(dead_code)]
pub async fn ws_public_document_doc() {}

#[derive(OpenApi)]
#[openapi(
    paths(
        health_check_doc,
        ready_check_doc,
        diagnostics_doc,
        presence_doc,
        ws_document_doc,
        ws_public_document_doc,
    ),
    components(
        schemas(HealthResponse, ErrorResponse, DiagnosticsResponse, HubDiagnostics, PresenceRecord, PresenceResponse)
    ),
    tags(
        (name = "api", description = "API endpoints")
    )
)]
pub struct ApiDoc;
