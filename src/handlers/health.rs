use axum::{extract::State, Json};
use std::sync::Arc;
use crate::models::HealthResponse;
use crate::AppState;
use tracing::debug;

/// Health check endpoint
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    debug!("Health check requested");
    Json(HealthResponse {
        status: "ok".to_string(),
        message: "Server is running".to_string(),
        hubs: state.hubs.hub_count() as u32,
    })
}

/// Readiness check endpoint
pub async fn ready_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    debug!("Readiness check requested");
    let message = match state.hubs.persistence() {
        Some(_) => "Service is ready",
        None => "Service is ready without persistence",
    };
    Json(HealthResponse {
        status: "ok".to_string(),
        message: message.to_string(),
        hubs: state.hubs.hub_count() as u32,
    })
}
