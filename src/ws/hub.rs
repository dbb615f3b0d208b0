//! Per-document fan-out hub.
//!
//! Every live document session is owned by exactly one task running
//! [`HubLoop::run`]. Membership, the cached state and the version are only
//! touched from that task; the outside world talks to it through bounded
//! channels held by the cloneable [`DocumentHub`] handle.

use chrono::{DateTime, TimeZone, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::oneshot;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::client::{ClientConnection, EnqueueError};
use super::codec::{Payload, PayloadCodec};
use super::manager::HubManager;
use crate::db::PersistenceGateway;
use crate::models::SnapshotRecord;

/// Version of a document that has never been persisted.
pub const INITIAL_VERSION: i64 = 1;

#[derive(Debug, Clone)]
pub struct HubSettings {
    /// How often the cached state is written back while the hub is live.
    pub persist_interval: Duration,
    /// Capacity of the register, unregister and broadcast channels.
    pub channel_size: usize,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            persist_interval: Duration::from_secs(60),
            channel_size: 256,
        }
    }
}

/// A pending membership request. The hub answers on `ack` once the client
/// is a member; dropping `ack` means the hub closed first.
struct Registration {
    client: Arc<ClientConnection>,
    ack: oneshot::Sender<()>,
}

/// A payload submitted for fan-out, tagged with who sent it.
#[derive(Debug, Clone)]
pub struct HubMessage {
    pub sender: Uuid,
    pub user_id: String,
    pub payload: Payload,
}

impl HubMessage {
    pub fn from_client(client: &ClientConnection, payload: Payload) -> Self {
        Self {
            sender: client.id,
            user_id: client.user_id.clone(),
            payload,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastError {
    Full,
    Closed,
}

impl std::fmt::Display for BroadcastError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BroadcastError::Full => write!(f, "hub broadcast channel is full"),
            BroadcastError::Closed => write!(f, "hub is closed"),
        }
    }
}

impl std::error::Error for BroadcastError {}

/// Values published by the hub loop for readers outside it.
#[derive(Debug)]
struct HubStats {
    version: AtomicI64,
    members: AtomicUsize,
    last_updated_ms: AtomicI64,
}

/// Handle to a running hub.
#[derive(Clone)]
pub struct DocumentHub {
    document_id: Uuid,
    instance: u64,
    register_tx: mpsc::Sender<Registration>,
    unregister_tx: mpsc::Sender<Arc<ClientConnection>>,
    broadcast_tx: mpsc::Sender<HubMessage>,
    done: CancellationToken,
    stats: Arc<HubStats>,
    codec: Arc<dyn PayloadCodec>,
}

impl std::fmt::Debug for DocumentHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentHub")
            .field("document_id", &self.document_id)
            .field("instance", &self.instance)
            .field("codec", &self.codec.name())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl DocumentHub {
    /// Start the owning loop for `document_id`, seeded with `seed` if a
    /// snapshot was loaded.
    pub(crate) fn spawn(
        document_id: Uuid,
        instance: u64,
        seed: Option<SnapshotRecord>,
        codec: Arc<dyn PayloadCodec>,
        persistence: Option<Arc<dyn PersistenceGateway>>,
        settings: HubSettings,
        manager: Weak<HubManager>,
        tasks: &TaskTracker,
    ) -> Self {
        let channel_size = settings.channel_size.max(1);
        let (register_tx, register_rx) = mpsc::channel(channel_size);
        let (unregister_tx, unregister_rx) = mpsc::channel(channel_size);
        let (broadcast_tx, broadcast_rx) = mpsc::channel(channel_size);
        let done = CancellationToken::new();

        let (state, version, modified_by, last_updated) = match seed {
            Some(snapshot) => {
                let state = (!snapshot.state.is_empty()).then(|| Payload::from(snapshot.state));
                (state, snapshot.version.max(INITIAL_VERSION), snapshot.modified_by, snapshot.updated_at)
            }
            None => (None, INITIAL_VERSION, None, Utc::now()),
        };

        let stats = Arc::new(HubStats {
            version: AtomicI64::new(version),
            members: AtomicUsize::new(0),
            last_updated_ms: AtomicI64::new(last_updated.timestamp_millis()),
        });

        let hub_loop = HubLoop {
            document_id,
            instance,
            codec: codec.clone(),
            persistence,
            persist_interval: settings.persist_interval,
            members: HashMap::new(),
            state,
            version,
            modified_by,
            last_updated,
            stats: stats.clone(),
            manager,
            register_rx,
            unregister_rx,
            broadcast_rx,
            done: done.clone(),
        };
        tasks.spawn(hub_loop.run());

        Self {
            document_id,
            instance,
            register_tx,
            unregister_tx,
            broadcast_tx,
            done,
            stats,
            codec,
        }
    }

    pub fn document_id(&self) -> Uuid {
        self.document_id
    }

    pub(crate) fn instance(&self) -> u64 {
        self.instance
    }

    pub fn codec(&self) -> &Arc<dyn PayloadCodec> {
        &self.codec
    }

    /// Submit a client and wait until the hub has made it a member. Gives the
    /// client back if the hub shut down before accepting it.
    ///
    /// Dropping the future after the request was sent may still leave the
    /// client registered; callers that give up must `unregister` it.
    pub async fn register(&self, client: Arc<ClientConnection>) -> Result<(), Arc<ClientConnection>> {
        let (ack, accepted) = oneshot::channel();
        if let Err(e) = self.register_tx.send(Registration { client: client.clone(), ack }).await {
            return Err(e.0.client);
        }
        accepted.await.map_err(|_| client)
    }

    pub async fn unregister(&self, client: Arc<ClientConnection>) {
        if let Err(e) = self.unregister_tx.send(client).await {
            // Hub already gone; make sure the queue is closed anyway.
            e.0.close_outbound();
            debug!("Unregister for document {} after hub shutdown", self.document_id);
        }
    }

    /// Non-blocking submit for fan-out.
    pub fn try_broadcast(&self, message: HubMessage) -> Result<(), BroadcastError> {
        self.broadcast_tx.try_send(message).map_err(|e| match e {
            TrySendError::Full(_) => BroadcastError::Full,
            TrySendError::Closed(_) => BroadcastError::Closed,
        })
    }

    pub fn version(&self) -> i64 {
        self.stats.version.load(Ordering::Acquire)
    }

    pub fn member_count(&self) -> usize {
        self.stats.members.load(Ordering::Acquire)
    }

    pub fn last_updated(&self) -> DateTime<Utc> {
        let ms = self.stats.last_updated_ms.load(Ordering::Relaxed);
        Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
    }

    pub fn is_closed(&self) -> bool {
        self.done.is_cancelled()
    }

    /// Ask the loop to drain its members and exit.
    pub(crate) fn signal_done(&self) {
        self.done.cancel();
    }
}

struct HubLoop {
    document_id: Uuid,
    instance: u64,
    codec: Arc<dyn PayloadCodec>,
    persistence: Option<Arc<dyn PersistenceGateway>>,
    persist_interval: Duration,
    members: HashMap<Uuid, Arc<ClientConnection>>,
    /// Latest content update, relayed verbatim to late joiners.
    state: Option<Payload>,
    version: i64,
    modified_by: Option<String>,
    last_updated: DateTime<Utc>,
    stats: Arc<HubStats>,
    manager: Weak<HubManager>,
    register_rx: mpsc::Receiver<Registration>,
    unregister_rx: mpsc::Receiver<Arc<ClientConnection>>,
    broadcast_rx: mpsc::Receiver<HubMessage>,
    done: CancellationToken,
}

impl HubLoop {
    async fn run(mut self) {
        info!(
            "Hub started for document {} (version {}, codec {})",
            self.document_id,
            self.version,
            self.codec.name()
        );
        let period = self.persist_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            // Registrations go first so an unregister can never overtake the
            // registration of the same client.
            tokio::select! {
                biased;
                _ = self.done.cancelled() => {
                    self.shutdown().await;
                    return;
                }
                Some(registration) = self.register_rx.recv() => self.handle_register(registration),
                Some(client) = self.unregister_rx.recv() => {
                    if self.handle_unregister(client) && self.terminate().await {
                        return;
                    }
                }
                _ = ticker.tick() => self.persist_in_background(),
                Some(message) = self.broadcast_rx.recv() => self.handle_broadcast(message),
            }
        }
    }

    fn handle_register(&mut self, registration: Registration) {
        let Registration { client, ack } = registration;
        if let Some(state) = &self.state {
            match client.try_enqueue(state.clone()) {
                Ok(()) => {}
                Err(EnqueueError::Full) => warn!(
                    "Outbound queue full, client {} on document {} skips the initial state",
                    client.id, self.document_id
                ),
                Err(EnqueueError::Closed) => debug!(
                    "Client {} on document {} closed before receiving the initial state",
                    client.id, self.document_id
                ),
            }
        }

        if let Some(gateway) = &self.persistence {
            let gateway = gateway.clone();
            let document_id = self.document_id;
            let user_id = client.user_id.clone();
            tokio::spawn(async move {
                if let Err(e) = gateway.upsert_presence(document_id, user_id, None).await {
                    warn!("Failed to record presence on document {}: {}", document_id, e);
                }
            });
        }

        info!(
            "Client {} (user {}, awareness {}) joined document {}",
            client.id, client.user_id, client.awareness_id, self.document_id
        );
        self.members.insert(client.id, client);
        self.publish();
        // The requester may have given up; it unregisters in that case.
        let _ = ack.send(());
    }

    /// Returns `true` when membership is now empty.
    fn handle_unregister(&mut self, client: Arc<ClientConnection>) -> bool {
        client.close_outbound();
        if self.members.remove(&client.id).is_some() {
            info!(
                "Client {} (user {}) left document {}, last seen {}",
                client.id,
                client.user_id,
                self.document_id,
                client.last_seen().to_rfc3339()
            );
            self.forget_presence(&client.user_id);
        }
        self.publish();
        self.members.is_empty()
    }

    fn handle_broadcast(&mut self, message: HubMessage) {
        self.last_updated = Utc::now();
        self.apply(&message);

        let mut evicted = Vec::new();
        for (id, member) in &self.members {
            if let Err(e) = member.try_enqueue(message.payload.clone()) {
                debug!("Cannot deliver to client {}: {}", id, e);
                evicted.push(*id);
            }
        }
        for id in evicted {
            if let Some(member) = self.members.remove(&id) {
                member.close_outbound();
                warn!(
                    "Evicted slow client {} (user {}) from document {}",
                    member.id, member.user_id, self.document_id
                );
                self.forget_presence(&member.user_id);
            }
        }
        self.publish();
    }

    /// Track version and cached state for content updates.
    fn apply(&mut self, message: &HubMessage) {
        if self.codec.classify(&message.payload).is_content_update() {
            self.version += 1;
            self.state = Some(message.payload.clone());
            self.modified_by = Some(message.user_id.clone());
            debug!(
                "Document {} at version {} after update from client {}",
                self.document_id, self.version, message.sender
            );
        }
    }

    fn persist_in_background(&self) {
        let (Some(gateway), Some(state)) = (&self.persistence, &self.state) else {
            return;
        };
        let gateway = gateway.clone();
        let document_id = self.document_id;
        let state = state.to_vec();
        let version = self.version;
        let modified_by = self.modified_by.clone();
        tokio::spawn(async move {
            match gateway.save_snapshot(document_id, state, version, modified_by).await {
                Ok(()) => debug!("Periodic save of document {} at version {}", document_id, version),
                Err(e) => warn!("Periodic save of document {} failed: {}", document_id, e),
            }
        });
    }

    async fn flush(&self) {
        let (Some(gateway), Some(state)) = (&self.persistence, &self.state) else {
            return;
        };
        match gateway
            .save_snapshot(self.document_id, state.to_vec(), self.version, self.modified_by.clone())
            .await
        {
            Ok(()) => info!("Saved document {} at version {}", self.document_id, self.version),
            Err(e) => warn!("Final save of document {} failed: {}", self.document_id, e),
        }
    }

    /// Runs once membership is empty. Returns `false` if a registration
    /// arrived in the meantime and the hub stays alive.
    async fn terminate(&mut self) -> bool {
        // Updates still queued carry state the snapshot must include.
        while let Ok(message) = self.broadcast_rx.try_recv() {
            self.apply(&message);
        }
        self.flush().await;

        if let Ok(registration) = self.register_rx.try_recv() {
            self.handle_register(registration);
            return false;
        }

        match self.manager.upgrade() {
            Some(manager) => {
                manager.release_hub(self.document_id, self.instance);
            }
            None => self.done.cancel(),
        }

        // Anyone who raced past the registry lookup is refused and retries
        // on a fresh hub.
        self.refuse_pending();
        info!("Hub for document {} closed", self.document_id);
        true
    }

    async fn shutdown(&mut self) {
        while let Ok(message) = self.broadcast_rx.try_recv() {
            self.apply(&message);
        }
        self.flush().await;
        for (_, member) in self.members.drain() {
            member.close_outbound();
        }
        self.refuse_pending();
        self.publish();
        info!("Hub for document {} shut down", self.document_id);
    }

    /// Stop accepting registrations and refuse the queued ones by dropping
    /// their acks.
    fn refuse_pending(&mut self) {
        self.register_rx.close();
        while let Ok(Registration { client, .. }) = self.register_rx.try_recv() {
            debug!(
                "Hub for document {} closed while client {} was joining",
                self.document_id, client.id
            );
        }
    }

    fn forget_presence(&self, user_id: &str) {
        let Some(gateway) = &self.persistence else {
            return;
        };
        // Same user may still be connected from another tab.
        if self.members.values().any(|m| m.user_id == user_id) {
            return;
        }
        let gateway = gateway.clone();
        let document_id = self.document_id;
        let user_id = user_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = gateway.remove_presence(document_id, user_id).await {
                warn!("Failed to clear presence on document {}: {}", document_id, e);
            }
        });
    }

    fn publish(&self) {
        self.stats.version.store(self.version, Ordering::Release);
        self.stats.members.store(self.members.len(), Ordering::Release);
        self.stats
            .last_updated_ms
            .store(self.last_updated.timestamp_millis(), Ordering::Relaxed);
    }
}
