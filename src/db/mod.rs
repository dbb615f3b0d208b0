pub mod dbcolab;
#[cfg(test)]
pub mod memory;

use std::future::Future;
use std::pin::Pin;
use uuid::Uuid;

use crate::models::{PresenceRecord, SnapshotRecord};

/// Boxed future returned by the persistence hooks.
pub type GatewayFuture<T> = Pin<Box<dyn Future<Output = Result<T, String>> + Send>>;

/// Durable storage of snapshots, incremental updates and presence rows.
///
/// The realtime core only logs the outcome of these calls; nothing on the
/// broadcast path waits for them.
pub trait PersistenceGateway: Send + Sync + 'static {
    fn load_snapshot(&self, document_id: Uuid) -> GatewayFuture<Option<SnapshotRecord>>;

    /// Idempotent upsert of the latest state.
    fn save_snapshot(
        &self,
        document_id: Uuid,
        state: Vec<u8>,
        version: i64,
        modified_by: Option<String>,
    ) -> GatewayFuture<()>;

    /// Append one update to the log.
    fn save_update(
        &self,
        document_id: Uuid,
        user_id: String,
        update: Vec<u8>,
        version: i64,
    ) -> GatewayFuture<()>;

    fn upsert_presence(
        &self,
        document_id: Uuid,
        user_id: String,
        cursor_position: Option<serde_json::Value>,
    ) -> GatewayFuture<()>;

    fn list_presence(&self, document_id: Uuid) -> GatewayFuture<Vec<PresenceRecord>>;

    fn remove_presence(&self, document_id: Uuid, user_id: String) -> GatewayFuture<()>;
}
