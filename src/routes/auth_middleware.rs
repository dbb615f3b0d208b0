use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::Response,
};
use std::sync::Arc;
use tracing::{debug, error};
use crate::models::{api_error, ApiError};
use crate::services::auth_service::{get_auth_token, identity_from_claims, validate_jwt};
use crate::AppState;

pub async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {

    // 1. Get the auth token from the header or cookie
    let token = match get_auth_token(&req) {
        Ok(token) => token,
        Err(e) => return Err(api_error(StatusCode::UNAUTHORIZED, e)),
    };

    // 2. Validate Token
    let secret = match &state.config.cloud_auth_jwt_secret {
        Some(secret) => secret,
        None => {
            error!("Cloud auth JWT secret not configured");
            return Err(api_error(StatusCode::INTERNAL_SERVER_ERROR, "Authentication not configured"));
        }
    };
    let token_data = match validate_jwt(&token, secret) {
        Ok(token_data) => token_data,
        Err(e) => {
            error!("JWT validation failed: {}", e);
            return Err(api_error(StatusCode::UNAUTHORIZED, "Invalid token"));
        }
    };

    // 3. Resolve the caller (user or service)
    let identity = identity_from_claims(&token_data.claims).map_err(|e| {
        error!("{}", e);
        api_error(StatusCode::UNAUTHORIZED, "Invalid token")
    })?;
    debug!("Token validated for {}", identity.uid);

    // 4. Hand the identity to downstream handlers
    req.extensions_mut().insert(identity);
    Ok(next.run(req).await)
}
