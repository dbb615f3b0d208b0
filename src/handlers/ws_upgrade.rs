use axum::{
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, Message, WebSocket, WebSocketUpgrade},
        Extension, Path, Query, State,
    },
    http::{header, HeaderMap, StatusCode},
    response::Response,
};
use futures_util::SinkExt;
use serde::Deserialize;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::auth::{ensure_document_access, CallerIdentity};
use crate::models::{api_error, ApiError};
use crate::services::share_link::ShareLinkError;
use crate::ws::client::ClientConnection;
use crate::ws::codec::Payload;
use crate::ws::hub::DocumentHub;
use crate::ws::manager::HubManager;
use crate::ws::pumps::run_connection;
use crate::AppState;

/// A hub can shut down between lookup and registration; retry on a fresh one.
const REGISTER_ATTEMPTS: usize = 3;

#[derive(Debug, Deserialize)]
pub struct ShareLinkQuery {
    pub sig: Option<String>,
    pub exp: Option<String>,
}

/// Authenticated upgrade for a document the caller has access to
pub async fn ws_document(
    State(state): State<Arc<AppState>>,
    Path(doc_id): Path<String>,
    identity: Option<Extension<CallerIdentity>>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Result<Response, ApiError> {
    let Some(Extension(identity)) = identity else {
        return Err(api_error(StatusCode::UNAUTHORIZED, "Missing caller identity"));
    };
    let document_id = parse_document_id(&doc_id)?;
    check_origin(&headers, &state.config.allowed_origins())?;

    let access = ensure_document_access(state.access.as_ref(), &identity, document_id).await?;
    let ws = ws.map_err(|e| api_error(StatusCode::BAD_REQUEST, e.body_text()))?;

    info!(
        "Upgrading connection for user {} on document {} (edit: {})",
        identity.uid,
        document_id,
        access.can_edit()
    );
    Ok(upgrade(ws, state, identity.uid, document_id, access.can_edit()))
}

/// Guest upgrade through a signed share link. Guests are read-only.
pub async fn ws_public_document(
    State(state): State<Arc<AppState>>,
    Path(doc_id): Path<String>,
    Query(link): Query<ShareLinkQuery>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Result<Response, ApiError> {
    let document_id = parse_document_id(&doc_id)?;
    let (Some(sig), Some(exp)) = (link.sig, link.exp) else {
        return Err(api_error(StatusCode::BAD_REQUEST, "Missing sig or exp parameter"));
    };
    let exp: i64 = exp
        .parse()
        .map_err(|_| api_error(StatusCode::BAD_REQUEST, "Invalid exp parameter"))?;
    check_origin(&headers, &state.config.allowed_origins())?;

    let signer = state
        .share_links
        .as_ref()
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "Share links are not enabled"))?;
    signer
        .verify(document_id, &sig, exp, chrono::Utc::now().timestamp())
        .map_err(|e| match e {
            ShareLinkError::Expired => api_error(StatusCode::GONE, e.to_string()),
            ShareLinkError::InvalidSignature => api_error(StatusCode::NOT_FOUND, e.to_string()),
        })?;
    let ws = ws.map_err(|e| api_error(StatusCode::BAD_REQUEST, e.body_text()))?;

    let guest = format!("guest-{}", Uuid::new_v4());
    info!("Upgrading guest {} on document {}", guest, document_id);
    Ok(upgrade(ws, state, guest, document_id, false))
}

fn parse_document_id(raw: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw).map_err(|_| api_error(StatusCode::BAD_REQUEST, "Invalid document id"))
}

fn check_origin(headers: &HeaderMap, allowed: &[String]) -> Result<(), ApiError> {
    let origin = headers.get(header::ORIGIN).and_then(|v| v.to_str().ok());
    if origin_allowed(origin, allowed) {
        Ok(())
    } else {
        warn!("Rejected WebSocket origin {:?}", origin);
        Err(api_error(StatusCode::FORBIDDEN, "Origin not allowed"))
    }
}

/// An empty allow-list or `*` allows everything. Requests without an
/// `Origin` header come from non-browser clients and are allowed.
pub fn origin_allowed(origin: Option<&str>, allowed: &[String]) -> bool {
    if allowed.is_empty() || allowed.iter().any(|a| a == "*") {
        return true;
    }
    let Some(origin) = origin else {
        return true;
    };
    let origin = origin.trim_end_matches('/');
    allowed
        .iter()
        .any(|a| a.trim_end_matches('/').eq_ignore_ascii_case(origin))
}

fn upgrade(
    ws: WebSocketUpgrade,
    state: Arc<AppState>,
    user_id: String,
    document_id: Uuid,
    can_edit: bool,
) -> Response {
    let settings = state.config.pump_settings();
    let (client, outbound) = ClientConnection::new(user_id, document_id, can_edit, settings.queue_size);
    ws.max_frame_size(settings.max_frame_bytes)
        .max_message_size(settings.max_frame_bytes)
        .on_upgrade(move |socket| serve_socket(socket, state, client, outbound))
}

async fn serve_socket(
    mut socket: WebSocket,
    state: Arc<AppState>,
    client: Arc<ClientConnection>,
    outbound: mpsc::Receiver<Payload>,
) {
    let window = tokio::time::sleep(state.config.register_timeout());
    let Some(hub) = register_connection(&state.hubs, client.clone(), window).await else {
        warn!(
            "Connection {} for document {} was not registered, closing",
            client.id, client.document_id
        );
        client.close_outbound();
        let _ = socket.send(Message::Close(None)).await;
        return;
    };

    let persistence = state.hubs.persistence().cloned();
    run_connection(socket, client, outbound, hub, persistence, state.config.pump_settings()).await;
}

/// Register `client` with its document's hub unless `cancel` fires first.
///
/// When canceled, the client is unregistered from the hub it was joining, so
/// it never stays a member and an empty hub does not outlive the handshake.
pub async fn register_connection<C>(
    hubs: &HubManager,
    client: Arc<ClientConnection>,
    cancel: C,
) -> Option<DocumentHub>
where
    C: Future<Output = ()>,
{
    tokio::pin!(cancel);
    let mut client = client;
    for attempt in 1..=REGISTER_ATTEMPTS {
        let hub = tokio::select! {
            biased;
            _ = &mut cancel => return None,
            hub = hubs.get_or_create_hub(client.document_id) => hub,
        };
        let result = tokio::select! {
            biased;
            _ = &mut cancel => {
                // Undo a registration that may have landed, and let a hub
                // created for this client close if it is still empty.
                hub.unregister(client).await;
                return None;
            }
            result = hub.register(client.clone()) => result,
        };
        match result {
            Ok(()) => return Some(hub),
            Err(returned) => {
                debug!(
                    "Hub for document {} closed during registration (attempt {})",
                    returned.document_id, attempt
                );
                client = returned;
            }
        }
    }
    None
}
