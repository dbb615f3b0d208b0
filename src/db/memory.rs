use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use super::{GatewayFuture, PersistenceGateway};
use crate::models::{PresenceRecord, SnapshotRecord};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedUpdate {
    pub document_id: Uuid,
    pub user_id: String,
    pub update: Vec<u8>,
    pub version: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedSnapshot {
    pub document_id: Uuid,
    pub state: Vec<u8>,
    pub version: i64,
    pub modified_by: Option<String>,
}

#[derive(Default)]
struct Inner {
    snapshots: HashMap<Uuid, SnapshotRecord>,
    snapshot_calls: Vec<SavedSnapshot>,
    updates: Vec<SavedUpdate>,
    presence: HashMap<(Uuid, String), PresenceRecord>,
}

/// In-memory gateway recording every call, for tests.
#[derive(Clone, Default)]
pub struct MemoryGateway {
    inner: Arc<Mutex<Inner>>,
    fail_loads: Arc<AtomicBool>,
    fail_writes: Arc<AtomicBool>,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed_snapshot(&self, document_id: Uuid, state: Vec<u8>, version: i64) {
        self.lock().snapshots.insert(
            document_id,
            SnapshotRecord {
                document_id,
                state,
                version,
                modified_by: None,
                updated_at: Utc::now(),
            },
        );
    }

    pub fn set_fail_loads(&self, fail: bool) {
        self.fail_loads.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn snapshot_calls(&self) -> Vec<SavedSnapshot> {
        self.lock().snapshot_calls.clone()
    }

    pub fn updates(&self) -> Vec<SavedUpdate> {
        self.lock().updates.clone()
    }

    pub fn presence_users(&self, document_id: Uuid) -> Vec<String> {
        let mut users: Vec<String> = self
            .lock()
            .presence
            .keys()
            .filter(|(doc, _)| *doc == document_id)
            .map(|(_, user)| user.clone())
            .collect();
        users.sort();
        users
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn write_error(&self) -> Option<String> {
        self.fail_writes
            .load(Ordering::SeqCst)
            .then(|| "storage unavailable".to_string())
    }
}

impl PersistenceGateway for MemoryGateway {
    fn load_snapshot(&self, document_id: Uuid) -> GatewayFuture<Option<SnapshotRecord>> {
        let result = if self.fail_loads.load(Ordering::SeqCst) {
            Err("storage unavailable".to_string())
        } else {
            Ok(self.lock().snapshots.get(&document_id).cloned())
        };
        Box::pin(async move { result })
    }

    fn save_snapshot(
        &self,
        document_id: Uuid,
        state: Vec<u8>,
        version: i64,
        modified_by: Option<String>,
    ) -> GatewayFuture<()> {
        let result = match self.write_error() {
            Some(e) => Err(e),
            None => {
                let mut inner = self.lock();
                inner.snapshot_calls.push(SavedSnapshot {
                    document_id,
                    state: state.clone(),
                    version,
                    modified_by: modified_by.clone(),
                });
                inner.snapshots.insert(
                    document_id,
                    SnapshotRecord {
                        document_id,
                        state,
                        version,
                        modified_by,
                        updated_at: Utc::now(),
                    },
                );
                Ok(())
            }
        };
        Box::pin(async move { result })
    }

    fn save_update(&self, document_id: Uuid, user_id: String, update: Vec<u8>, version: i64) -> GatewayFuture<()> {
        let result = match self.write_error() {
            Some(e) => Err(e),
            None => {
                self.lock().updates.push(SavedUpdate {
                    document_id,
                    user_id,
                    update,
                    version,
                });
                Ok(())
            }
        };
        Box::pin(async move { result })
    }

    fn upsert_presence(
        &self,
        document_id: Uuid,
        user_id: String,
        cursor_position: Option<serde_json::Value>,
    ) -> GatewayFuture<()> {
        self.lock().presence.insert(
            (document_id, user_id.clone()),
            PresenceRecord {
                document_id,
                user_id,
                cursor_position,
                last_seen: Utc::now(),
            },
        );
        Box::pin(async { Ok(()) })
    }

    fn list_presence(&self, document_id: Uuid) -> GatewayFuture<Vec<PresenceRecord>> {
        let rows = self
            .lock()
            .presence
            .values()
            .filter(|p| p.document_id == document_id)
            .cloned()
            .collect();
        Box::pin(async move { Ok(rows) })
    }

    fn remove_presence(&self, document_id: Uuid, user_id: String) -> GatewayFuture<()> {
        self.lock().presence.remove(&(document_id, user_id));
        Box::pin(async { Ok(()) })
    }
}
