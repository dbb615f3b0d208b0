use chrono::{DateTime, TimeZone, Utc};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::codec::Payload;

/// State of one live WebSocket connection.
///
/// The socket itself is split between the read and write pumps; this struct
/// carries what the hub and both pumps share: identity, the sending half of
/// the outbound queue, the done signal and liveness markers.
#[derive(Debug)]
pub struct ClientConnection {
    pub id: Uuid,
    pub user_id: String,
    pub document_id: Uuid,
    /// Random per-connection tag for presence protocols.
    pub awareness_id: u32,
    pub can_edit: bool,
    outbound: Mutex<Option<mpsc::Sender<Payload>>>,
    done: CancellationToken,
    last_seen_ms: AtomicI64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueError {
    /// The queue is at capacity; the consumer is too slow.
    Full,
    /// The queue was already closed.
    Closed,
}

impl std::fmt::Display for EnqueueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EnqueueError::Full => write!(f, "outbound queue is full"),
            EnqueueError::Closed => write!(f, "outbound queue is closed"),
        }
    }
}

impl std::error::Error for EnqueueError {}

impl ClientConnection {
    /// Create a connection and the receiving half of its outbound queue,
    /// which belongs to the write pump.
    pub fn new(
        user_id: impl Into<String>,
        document_id: Uuid,
        can_edit: bool,
        queue_size: usize,
    ) -> (Arc<Self>, mpsc::Receiver<Payload>) {
        let (tx, rx) = mpsc::channel(queue_size.max(1));
        let client = Arc::new(Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            document_id,
            awareness_id: rand::random::<u32>(),
            can_edit,
            outbound: Mutex::new(Some(tx)),
            done: CancellationToken::new(),
            last_seen_ms: AtomicI64::new(Utc::now().timestamp_millis()),
        });
        (client, rx)
    }

    /// Non-blocking enqueue onto the outbound queue.
    pub fn try_enqueue(&self, payload: Payload) -> Result<(), EnqueueError> {
        let guard = self.outbound.lock().unwrap_or_else(|e| e.into_inner());
        let Some(tx) = guard.as_ref() else {
            return Err(EnqueueError::Closed);
        };
        tx.try_send(payload).map_err(|e| match e {
            TrySendError::Full(_) => EnqueueError::Full,
            TrySendError::Closed(_) => EnqueueError::Closed,
        })
    }

    /// Close the outbound queue. Returns `true` only for the call that
    /// actually closed it; later calls are no-ops.
    ///
    /// Messages already queued are still delivered before the write pump
    /// observes the close.
    pub fn close_outbound(&self) -> bool {
        let mut guard = self.outbound.lock().unwrap_or_else(|e| e.into_inner());
        guard.take().is_some()
    }

    pub fn is_outbound_closed(&self) -> bool {
        self.outbound.lock().unwrap_or_else(|e| e.into_inner()).is_none()
    }

    /// One-shot signal that ends both pumps.
    pub fn done(&self) -> &CancellationToken {
        &self.done
    }

    pub fn touch(&self) {
        self.last_seen_ms.store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn last_seen(&self) -> DateTime<Utc> {
        let ms = self.last_seen_ms.load(Ordering::Relaxed);
        Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
    }
}
