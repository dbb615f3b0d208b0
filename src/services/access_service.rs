use moka::future::Cache;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, warn};
use uuid::Uuid;

use crate::clients::app_service_client::AppServiceClient;

/// What a caller may do with a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentAccess {
    Edit,
    View,
    Denied,
    NotFound,
}

impl DocumentAccess {
    pub fn from_permission(permission: &str) -> Self {
        match permission.to_ascii_lowercase().as_str() {
            "edit" | "write" | "owner" => DocumentAccess::Edit,
            "view" | "read" => DocumentAccess::View,
            _ => DocumentAccess::Denied,
        }
    }

    pub fn can_connect(self) -> bool {
        matches!(self, DocumentAccess::Edit | DocumentAccess::View)
    }

    pub fn can_edit(self) -> bool {
        self == DocumentAccess::Edit
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessError {
    Unavailable(String),
}

impl std::fmt::Display for AccessError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AccessError::Unavailable(msg) => write!(f, "Access check unavailable: {}", msg),
        }
    }
}

impl std::error::Error for AccessError {}

pub type AccessFuture = Pin<Box<dyn Future<Output = Result<DocumentAccess, AccessError>> + Send>>;

/// Answers document access questions for the upgrade and REST handlers.
pub trait AccessChecker: Send + Sync {
    fn check(&self, uid: String, document_id: Uuid) -> AccessFuture;
}

/// Access checks backed by the app service, cached per (user, document).
pub struct AccessService {
    client: Option<Arc<AppServiceClient>>,
    allow_without_service: bool,
    cache: Cache<(String, Uuid), DocumentAccess>,
}

impl AccessService {
    /// Without a client, `allow_without_service` decides between granting
    /// edit access (development) and failing every check.
    pub fn new(client: Option<AppServiceClient>, allow_without_service: bool, ttl: Duration) -> Self {
        if client.is_none() {
            if allow_without_service {
                warn!("No app service configured - every authenticated caller gets edit access");
            } else {
                error!("No app service configured - document access checks will fail");
            }
        }
        Self {
            client: client.map(Arc::new),
            allow_without_service,
            cache: Cache::builder()
                .max_capacity(100_000)
                .time_to_live(ttl)
                .build(),
        }
    }
}

impl AccessChecker for AccessService {
    fn check(&self, uid: String, document_id: Uuid) -> AccessFuture {
        let client = self.client.clone();
        let allow_without_service = self.allow_without_service;
        let cache = self.cache.clone();
        Box::pin(async move {
            let Some(client) = client else {
                return if allow_without_service {
                    Ok(DocumentAccess::Edit)
                } else {
                    Err(AccessError::Unavailable("app service not configured".to_string()))
                };
            };

            let key = (uid, document_id);
            if let Some(access) = cache.get(&key).await {
                return Ok(access);
            }
            // Failures are not cached so the next attempt asks again
            let access = client
                .get_document_access(&key.0, document_id)
                .await
                .map_err(AccessError::Unavailable)?;
            cache.insert(key, access).await;
            Ok(access)
        })
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::collections::HashMap;

    /// Fixed answers per user, `Denied` for anyone else.
    pub struct StaticAccess(pub HashMap<String, DocumentAccess>);

    impl StaticAccess {
        pub fn with(entries: &[(&str, DocumentAccess)]) -> Self {
            Self(entries.iter().map(|(u, a)| (u.to_string(), *a)).collect())
        }
    }

    impl AccessChecker for StaticAccess {
        fn check(&self, uid: String, _document_id: Uuid) -> AccessFuture {
            let access = self.0.get(&uid).copied().unwrap_or(DocumentAccess::Denied);
            Box::pin(async move { Ok(access) })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permissions_map_to_access_levels() {
        assert_eq!(DocumentAccess::from_permission("Edit"), DocumentAccess::Edit);
        assert_eq!(DocumentAccess::from_permission("view"), DocumentAccess::View);
        assert_eq!(DocumentAccess::from_permission("none"), DocumentAccess::Denied);
        assert!(DocumentAccess::View.can_connect());
        assert!(!DocumentAccess::View.can_edit());
        assert!(!DocumentAccess::NotFound.can_connect());
    }

    #[tokio::test]
    async fn development_without_app_service_allows_edit() {
        let service = AccessService::new(None, true, Duration::from_secs(60));
        let access = service.check("alice".into(), Uuid::new_v4()).await;
        assert_eq!(access, Ok(DocumentAccess::Edit));
    }

    #[tokio::test]
    async fn production_without_app_service_fails() {
        let service = AccessService::new(None, false, Duration::from_secs(60));
        let access = service.check("alice".into(), Uuid::new_v4()).await;
        assert!(matches!(access, Err(AccessError::Unavailable(_))));
    }

    #[tokio::test]
    async fn unreachable_app_service_is_an_error() {
        let client = AppServiceClient::new(
            "http://127.0.0.1:9".to_string(),
            "secret".to_string(),
            "colabri-realtime".to_string(),
        )
        .unwrap();
        let service = AccessService::new(Some(client), false, Duration::from_secs(60));
        let access = service.check("alice".into(), Uuid::new_v4()).await;
        assert!(access.is_err());
    }
}
