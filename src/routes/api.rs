use crate::{
    handlers::{diagnostics, document_presence, health_check, ready_check, ws_document, ws_public_document},
    routes::auth_middleware::auth_middleware,
    AppState,
};
use axum::{middleware, routing::get, Router};
use std::sync::Arc;

/// Create API routes
pub fn create_api_routes(state: Arc<AppState>) -> Router {
    let protected = Router::new()
        .route("/v1/diagnostics", get(diagnostics))
        .route("/v1/documents/:doc_id/presence", get(document_presence))
        .route_layer(middleware::from_fn_with_state(state.clone(), auth_middleware)); // Applies to all routes added above

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(ready_check))
        .merge(protected)
        .with_state(state)
}

/// Create WebSocket upgrade routes
pub fn create_ws_routes(state: Arc<AppState>) -> Router {
    let authenticated = Router::new()
        .route("/documents/:doc_id", get(ws_document))
        .route_layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    Router::new()
        .route("/public/documents/:doc_id", get(ws_public_document))
        .merge(authenticated)
        .with_state(state)
}

/// All routes served by the process, without the outer layers
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .nest("/api", create_api_routes(state.clone()))
        .nest("/ws", create_ws_routes(state))
}
