use crate::{auth::auth::{self, CallerIdentity}, models::{ApiError, DiagnosticsResponse, HubDiagnostics}, AppState};
use axum::{extract::{State, Extension}, http::StatusCode, Json};
use std::sync::Arc;
use std::sync::{Mutex, OnceLock};
use sysinfo::System;
use tracing::info;

static SYSTEM_MONITOR: OnceLock<Mutex<System>> = OnceLock::new();

/// Report live hubs, connections and process load
pub async fn diagnostics(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<CallerIdentity>,
) -> Result<(StatusCode, Json<DiagnosticsResponse>), ApiError> {

    // Only cloud admins may look inside the hubs
    let _ = auth::ensure_cloud_admin(&identity.prpls)?;

    let hubs: Vec<HubDiagnostics> = state.hubs.summaries()
        .into_iter()
        .map(|summary| HubDiagnostics {
            document_id: summary.document_id,
            n_conn: summary.members as u32,
            version: summary.version,
            last_updated: summary.last_updated,
        })
        .collect();
    let n_conn: u32 = hubs.iter().map(|h| h.n_conn).sum();
    let n_hubs = hubs.len() as u32;

    // System stats
    let (cpu_usage, memory_alloc, memory_free, memory_total) = {
        let sys_lock = SYSTEM_MONITOR.get_or_init(|| {
            Mutex::new(System::new_all())
        });
        match sys_lock.lock() {
            Ok(mut sys) => {
                sys.refresh_cpu();
                sys.refresh_memory();
                (
                    sys.global_cpu_info().cpu_usage(),
                    sys.used_memory(),
                    sys.free_memory(),
                    sys.total_memory(),
                )
            }
            Err(_) => (0.0, 0, 0, 0)
        }
    };

    info!(
        "Diagnostics: CPU: {:.2}%, Mem: {}/{} MB (Free: {} MB), Conn: {}, Hubs: {}",
        cpu_usage,
        memory_alloc / 1024 / 1024,
        memory_total / 1024 / 1024,
        memory_free / 1024 / 1024,
        n_conn,
        n_hubs
    );

    Ok((
        StatusCode::OK,
        Json(DiagnosticsResponse {
            n_conn,
            n_hubs,
            payload_codec: state.hubs.codec().name().to_string(),
            hubs,
            cpu_usage,
            memory_alloc,
            memory_total,
            memory_free,
        }),
    ))
}
