use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};
use uuid::Uuid;

use super::codec::PayloadCodec;
use super::hub::{DocumentHub, HubSettings};
use crate::db::PersistenceGateway;

/// Summary of a live hub, for diagnostics.
#[derive(Debug, Clone)]
pub struct HubSummary {
    pub document_id: Uuid,
    pub members: usize,
    pub version: i64,
    pub last_updated: DateTime<Utc>,
}

/// Registry of live hubs, one per document.
///
/// Only the map is locked, and never across an await. Hub internals belong
/// to each hub's own loop.
pub struct HubManager {
    hubs: Mutex<HashMap<Uuid, DocumentHub>>,
    codec: Arc<dyn PayloadCodec>,
    persistence: Option<Arc<dyn PersistenceGateway>>,
    settings: HubSettings,
    next_instance: AtomicU64,
    tasks: TaskTracker,
    self_ref: Weak<HubManager>,
}

impl HubManager {
    pub fn new(
        codec: Arc<dyn PayloadCodec>,
        persistence: Option<Arc<dyn PersistenceGateway>>,
        settings: HubSettings,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            hubs: Mutex::new(HashMap::new()),
            codec,
            persistence,
            settings,
            next_instance: AtomicU64::new(1),
            tasks: TaskTracker::new(),
            self_ref: self_ref.clone(),
        })
    }

    pub fn codec(&self) -> &Arc<dyn PayloadCodec> {
        &self.codec
    }

    pub fn persistence(&self) -> Option<&Arc<dyn PersistenceGateway>> {
        self.persistence.as_ref()
    }

    fn registry(&self) -> MutexGuard<'_, HashMap<Uuid, DocumentHub>> {
        self.hubs.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Return the live hub for `document_id`, creating it if needed.
    ///
    /// The snapshot is loaded outside the lock. If two callers race on the
    /// same document, the first to re-take the lock wins and the other's
    /// load is discarded, so there is never more than one hub per document.
    pub async fn get_or_create_hub(&self, document_id: Uuid) -> DocumentHub {
        if let Some(hub) = self.get_hub(document_id) {
            return hub;
        }

        let seed = match &self.persistence {
            Some(gateway) => match gateway.load_snapshot(document_id).await {
                Ok(seed) => seed,
                Err(e) => {
                    warn!(
                        "Failed to load snapshot for document {}, starting empty: {}",
                        document_id, e
                    );
                    None
                }
            },
            None => None,
        };

        let mut hubs = self.registry();
        if let Some(hub) = hubs.get(&document_id).filter(|h| !h.is_closed()) {
            return hub.clone();
        }
        let loaded = seed.as_ref().map(|s| s.version);
        let hub = DocumentHub::spawn(
            document_id,
            self.next_instance.fetch_add(1, Ordering::Relaxed),
            seed,
            self.codec.clone(),
            self.persistence.clone(),
            self.settings.clone(),
            self.self_ref.clone(),
            &self.tasks,
        );
        hubs.insert(document_id, hub.clone());
        match loaded {
            Some(version) => info!("Created hub for document {} from snapshot version {}", document_id, version),
            None => info!("Created hub for document {} without prior state", document_id),
        }
        hub
    }

    pub fn get_hub(&self, document_id: Uuid) -> Option<DocumentHub> {
        self.registry()
            .get(&document_id)
            .filter(|h| !h.is_closed())
            .cloned()
    }

    /// Remove the hub for `document_id` and tell its loop to stop.
    pub fn close_hub(&self, document_id: Uuid) -> bool {
        let removed = self.registry().remove(&document_id);
        match removed {
            Some(hub) => {
                hub.signal_done();
                info!("Closed hub for document {}", document_id);
                true
            }
            None => false,
        }
    }

    /// Called by a hub that emptied out. Only removes the registry entry if it
    /// still points at that very hub instance; a newer hub for the same
    /// document is left alone.
    pub(crate) fn release_hub(&self, document_id: Uuid, instance: u64) -> bool {
        let mut hubs = self.registry();
        let current = hubs.get(&document_id).map(|h| h.instance());
        if current != Some(instance) {
            return false;
        }
        if let Some(hub) = hubs.remove(&document_id) {
            hub.signal_done();
        }
        true
    }

    /// Stop every hub, used on shutdown.
    pub fn close_all(&self) {
        let hubs: Vec<DocumentHub> = self.registry().drain().map(|(_, h)| h).collect();
        info!("Closing {} hubs", hubs.len());
        for hub in hubs {
            hub.signal_done();
        }
    }

    /// Stop every hub and wait up to `grace` for their final saves.
    pub async fn shutdown(&self, grace: Duration) {
        self.close_all();
        self.tasks.close();
        if tokio::time::timeout(grace, self.tasks.wait()).await.is_err() {
            warn!("{} hubs still running after {:?}", self.tasks.len(), grace);
        }
    }

    pub fn hub_count(&self) -> usize {
        self.registry().len()
    }

    pub fn summaries(&self) -> Vec<HubSummary> {
        let hubs: Vec<DocumentHub> = self.registry().values().cloned().collect();
        hubs.iter()
            .map(|hub| HubSummary {
                document_id: hub.document_id(),
                members: hub.member_count(),
                version: hub.version(),
                last_updated: hub.last_updated(),
            })
            .collect()
    }
}
