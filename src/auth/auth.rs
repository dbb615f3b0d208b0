use axum::http::StatusCode;
use tracing::error;
use uuid::Uuid;
use crate::models::{api_error, ApiError};
use crate::services::access_service::{AccessChecker, DocumentAccess};

const CLOUD_ADMIN_PRPL: &str = "r/Colabri-CloudAdmin";

/// Caller resolved from a validated JWT by the auth middleware.
#[derive(Clone, Debug)]
pub struct CallerIdentity {
    pub uid: String,
    pub prpls: Vec<String>,
}

impl CallerIdentity {
    pub fn is_service(&self) -> bool {
        self.prpls.iter().any(|p| p.starts_with("s/"))
    }
}

pub fn is_cloud_admin(prpls: &[String]) -> bool {
    prpls.iter().any(|p| p == CLOUD_ADMIN_PRPL)
}

pub fn ensure_cloud_admin(prpls: &[String]) -> Result<String, ApiError> {
    if is_cloud_admin(prpls) {
        return Ok(CLOUD_ADMIN_PRPL.to_string());
    }
    Err(api_error(StatusCode::FORBIDDEN, "Cloud Admin access required"))
}

/// Resolve what the caller may do with a document, mapping refusals to
/// HTTP errors. Services are trusted with edit access.
pub async fn ensure_document_access(
    access: &dyn AccessChecker,
    identity: &CallerIdentity,
    document_id: Uuid,
) -> Result<DocumentAccess, ApiError> {
    if identity.is_service() {
        return Ok(DocumentAccess::Edit);
    }
    match access.check(identity.uid.clone(), document_id).await {
        Ok(DocumentAccess::NotFound) => Err(api_error(StatusCode::NOT_FOUND, "Document not found")),
        Ok(DocumentAccess::Denied) => Err(api_error(StatusCode::FORBIDDEN, "Access to document denied")),
        Ok(level) => Ok(level),
        Err(e) => {
            error!("Access check for {} on document {} failed: {}", identity.uid, document_id, e);
            Err(api_error(StatusCode::INTERNAL_SERVER_ERROR, "Failed to check document access"))
        }
    }
}

/// Principals for a user token: the user itself plus one per role.
pub fn user_prpls(uid: &str, roles: &[String]) -> Vec<String> {
    let mut prpls = vec![format!("u/{}", uid)];
    for role in roles {
        let role_prpl = format!("r/{}", role);
        if !prpls.contains(&role_prpl) {
            prpls.push(role_prpl);
        }
    }
    prpls
}
