//! Read and write pumps for one WebSocket connection.
//!
//! Both pumps are generic over `Stream`/`Sink` of axum messages so the
//! upgraded socket halves plug in directly.

use axum::extract::ws::{Message, WebSocket};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval_at, timeout, timeout_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::client::ClientConnection;
use super::codec::{Payload, PayloadCodec};
use super::hub::{BroadcastError, DocumentHub, HubMessage};
use crate::db::PersistenceGateway;
use crate::utils::scope_guard::defer;

#[derive(Debug, Clone)]
pub struct PumpSettings {
    /// Keepalive ping period, strictly shorter than `idle_timeout`.
    pub ping_interval: Duration,
    /// A connection without a pong for this long is dropped.
    pub idle_timeout: Duration,
    pub write_timeout: Duration,
    pub max_frame_bytes: usize,
    pub queue_size: usize,
}

impl Default for PumpSettings {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(60),
            write_timeout: Duration::from_secs(10),
            max_frame_bytes: 1024 * 1024,
            queue_size: 128,
        }
    }
}

/// Drive a registered connection until it ends. The write pump gets its own
/// task; the read pump runs on the caller's task.
pub async fn run_connection(
    socket: WebSocket,
    client: Arc<ClientConnection>,
    outbound: mpsc::Receiver<Payload>,
    hub: DocumentHub,
    persistence: Option<Arc<dyn PersistenceGateway>>,
    settings: PumpSettings,
) {
    let (sink, stream) = socket.split();
    let writer = tokio::spawn(write_pump(
        sink,
        outbound,
        client.clone(),
        hub.codec().clone(),
        settings.clone(),
    ));
    read_pump(stream, client.clone(), hub, persistence, settings).await;
    if let Err(e) = writer.await {
        warn!("Write pump for client {} ended abnormally: {}", client.id, e);
    }
    info!(
        "Connection {} (user {}) closed on document {}",
        client.id, client.user_id, client.document_id
    );
}

/// Read frames from the client and hand them to the hub.
pub async fn read_pump<S, E>(
    mut stream: S,
    client: Arc<ClientConnection>,
    hub: DocumentHub,
    persistence: Option<Arc<dyn PersistenceGateway>>,
    settings: PumpSettings,
) where
    S: Stream<Item = Result<Message, E>> + Unpin,
    E: std::fmt::Display,
{
    // Stops the write pump however this function is left.
    let _stop_writer = defer({
        let client = client.clone();
        move || client.done().cancel()
    });

    let mut deadline = Instant::now() + settings.idle_timeout;
    loop {
        let next = tokio::select! {
            _ = client.done().cancelled() => break,
            next = timeout_at(deadline, stream.next()) => next,
        };
        let message = match next {
            Err(_) => {
                info!("Client {} timed out waiting for pong", client.id);
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                debug!("Read error on client {}: {}", client.id, e);
                break;
            }
            Ok(Some(Ok(message))) => message,
        };

        let keep_going = match message {
            Message::Pong(_) => {
                deadline = Instant::now() + settings.idle_timeout;
                client.touch();
                true
            }
            // Answered by the socket itself.
            Message::Ping(_) => true,
            Message::Close(_) => {
                debug!("Client {} sent close", client.id);
                false
            }
            Message::Binary(data) => handle_frame(data, &client, &hub, persistence.as_ref(), &settings),
            Message::Text(text) => handle_frame(text.into_bytes(), &client, &hub, persistence.as_ref(), &settings),
        };
        if !keep_going {
            break;
        }
    }

    hub.unregister(client.clone()).await;
}

/// Route one data frame. Returns `false` when the connection should end.
fn handle_frame(
    data: Vec<u8>,
    client: &Arc<ClientConnection>,
    hub: &DocumentHub,
    persistence: Option<&Arc<dyn PersistenceGateway>>,
    settings: &PumpSettings,
) -> bool {
    if data.is_empty() {
        return true;
    }
    if data.len() > settings.max_frame_bytes {
        warn!(
            "Client {} sent a {} byte frame, limit is {}",
            client.id,
            data.len(),
            settings.max_frame_bytes
        );
        return false;
    }

    if !hub.codec().accepts(&data) {
        debug!(
            "Dropping malformed {} frame from client {}",
            hub.codec().name(),
            client.id
        );
        return true;
    }

    let kind = hub.codec().classify(&data);
    if kind.requires_edit() && !client.can_edit {
        debug!("Dropping {:?} from read-only client {}", kind, client.id);
        return true;
    }

    let payload = Payload::from(data);
    if kind.is_awareness() {
        return hub.try_broadcast(HubMessage::from_client(client, payload)) != Err(BroadcastError::Closed);
    }

    // Read before submitting so the tag matches the version this update produces.
    let next_version = hub.version() + 1;
    match hub.try_broadcast(HubMessage::from_client(client, payload.clone())) {
        Ok(()) => {}
        Err(BroadcastError::Full) => {
            warn!(
                "Hub for document {} is saturated, dropping {:?} from client {}",
                hub.document_id(),
                kind,
                client.id
            );
            return true;
        }
        Err(BroadcastError::Closed) => {
            debug!("Hub for document {} is gone, ending client {}", hub.document_id(), client.id);
            return false;
        }
    }

    if kind.is_content_update() {
        if let Some(gateway) = persistence {
            let gateway = gateway.clone();
            let document_id = hub.document_id();
            let user_id = client.user_id.clone();
            tokio::spawn(async move {
                if let Err(e) = gateway
                    .save_update(document_id, user_id, payload.to_vec(), next_version)
                    .await
                {
                    warn!("Failed to log update {} for document {}: {}", next_version, document_id, e);
                }
            });
        }
    }
    true
}

/// Write queued payloads and keepalive pings to the client.
pub async fn write_pump<S>(
    mut sink: S,
    mut outbound: mpsc::Receiver<Payload>,
    client: Arc<ClientConnection>,
    codec: Arc<dyn PayloadCodec>,
    settings: PumpSettings,
) where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    let mut ping = interval_at(Instant::now() + settings.ping_interval, settings.ping_interval);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let frame = tokio::select! {
            _ = client.done().cancelled() => break,
            _ = ping.tick() => Message::Ping(Vec::new()),
            next = outbound.recv() => match next {
                Some(payload) => codec.to_frame(&payload),
                None => {
                    debug!("Outbound queue closed for client {}", client.id);
                    let _ = timeout(settings.write_timeout, sink.send(Message::Close(None))).await;
                    break;
                }
            },
        };

        match timeout(settings.write_timeout, sink.send(frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!("Write to client {} failed: {}", client.id, e);
                break;
            }
            Err(_) => {
                warn!("Write to client {} exceeded {:?}", client.id, settings.write_timeout);
                break;
            }
        }
    }

    client.done().cancel();
    client.close_outbound();
    let _ = timeout(settings.write_timeout, sink.close()).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::MemoryGateway;
    use crate::ws::hub::{HubSettings, INITIAL_VERSION};
    use crate::ws::manager::HubManager;
    use crate::ws::codec::{JsonCodec, YjsCodec};
    use futures_util::stream;
    use std::pin::Pin;
    use uuid::Uuid;

    const WAIT: Duration = Duration::from_secs(2);

    type Inbound = mpsc::UnboundedSender<Result<Message, String>>;

    fn inbound() -> (Inbound, Pin<Box<dyn Stream<Item = Result<Message, String>> + Send>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let stream = stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|m| (m, rx)) });
        (tx, Box::pin(stream))
    }

    fn outbound_sink() -> (
        mpsc::UnboundedReceiver<Message>,
        Pin<Box<dyn Sink<Message, Error = String> + Send>>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel::<Message>();
        let sink = futures_util::sink::unfold(tx, |tx, message: Message| async move {
            tx.send(message).map_err(|e| e.to_string())?;
            Ok::<_, String>(tx)
        });
        (rx, Box::pin(sink))
    }

    fn fast_settings() -> PumpSettings {
        PumpSettings {
            ping_interval: Duration::from_millis(40),
            idle_timeout: Duration::from_millis(100),
            write_timeout: Duration::from_millis(200),
            max_frame_bytes: 64,
            queue_size: 16,
        }
    }

    fn slow_settings() -> PumpSettings {
        PumpSettings {
            ping_interval: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(60),
            ..fast_settings()
        }
    }

    fn manager(gateway: &MemoryGateway) -> Arc<HubManager> {
        HubManager::new(
            Arc::new(YjsCodec),
            Some(Arc::new(gateway.clone())),
            HubSettings {
                persist_interval: Duration::from_secs(3600),
                channel_size: 64,
            },
        )
    }

    async fn recv(rx: &mut mpsc::Receiver<Payload>) -> Vec<u8> {
        timeout(WAIT, rx.recv()).await.unwrap().unwrap().to_vec()
    }

    async fn wait_for<F: Fn() -> bool>(check: F) {
        timeout(WAIT, async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn content_update_is_relayed_versioned_and_logged() {
        let gateway = MemoryGateway::new();
        let manager = manager(&gateway);
        let doc = Uuid::new_v4();
        let hub = manager.get_or_create_hub(doc).await;

        let (a, mut a_rx) = ClientConnection::new("alice", doc, true, 16);
        hub.register(a.clone()).await.unwrap();
        let (tx, stream) = inbound();
        let reader = tokio::spawn(read_pump(stream, a.clone(), hub.clone(), manager.persistence().cloned(), slow_settings()));

        tx.send(Ok(Message::Binary(vec![2, 10, 20]))).unwrap();
        assert_eq!(recv(&mut a_rx).await, vec![2, 10, 20]);
        assert_eq!(hub.version(), INITIAL_VERSION + 1);

        wait_for(|| !gateway.updates().is_empty()).await;
        let logged = &gateway.updates()[0];
        assert_eq!(logged.document_id, doc);
        assert_eq!(logged.user_id, "alice");
        assert_eq!(logged.update, vec![2, 10, 20]);
        assert_eq!(logged.version, 2);

        let (b, mut b_rx) = ClientConnection::new("bob", doc, true, 16);
        hub.register(b).await.unwrap();
        assert_eq!(recv(&mut b_rx).await, vec![2, 10, 20]);

        drop(tx);
        timeout(WAIT, reader).await.unwrap().unwrap();
        assert!(a.done().is_cancelled());
    }

    #[tokio::test]
    async fn json_documents_relay_as_text_and_drop_invalid_utf8() {
        let gateway = MemoryGateway::new();
        let manager = HubManager::new(
            Arc::new(JsonCodec),
            Some(Arc::new(gateway.clone())),
            HubSettings {
                persist_interval: Duration::from_secs(3600),
                channel_size: 64,
            },
        );
        let doc = Uuid::new_v4();
        let hub = manager.get_or_create_hub(doc).await;

        let (a, a_queue) = ClientConnection::new("alice", doc, true, 16);
        hub.register(a.clone()).await.unwrap();
        let (mut frames, sink) = outbound_sink();
        tokio::spawn(write_pump(sink, a_queue, a.clone(), hub.codec().clone(), slow_settings()));
        let (tx, stream) = inbound();
        tokio::spawn(read_pump(stream, a.clone(), hub.clone(), manager.persistence().cloned(), slow_settings()));

        let update = r#"{"type":"update","ops":[1]}"#;
        tx.send(Ok(Message::Binary(vec![0x7b, 0xff, 0x7d]))).unwrap();
        tx.send(Ok(Message::Text(update.to_string()))).unwrap();

        let frame = timeout(WAIT, frames.recv()).await.unwrap();
        assert!(matches!(frame, Some(Message::Text(t)) if t == update));
        wait_for(|| hub.version() == INITIAL_VERSION + 1).await;

        wait_for(|| !gateway.updates().is_empty()).await;
        let logged = gateway.updates();
        assert_eq!(logged.len(), 1);
        assert_eq!(logged[0].update, update.as_bytes().to_vec());
        assert_eq!(logged[0].version, 2);
    }

    #[tokio::test]
    async fn awareness_is_relayed_but_never_logged() {
        let gateway = MemoryGateway::new();
        let manager = manager(&gateway);
        let doc = Uuid::new_v4();
        let hub = manager.get_or_create_hub(doc).await;

        let (a, mut a_rx) = ClientConnection::new("alice", doc, true, 16);
        hub.register(a.clone()).await.unwrap();
        let (tx, stream) = inbound();
        tokio::spawn(read_pump(stream, a.clone(), hub.clone(), manager.persistence().cloned(), slow_settings()));

        tx.send(Ok(Message::Binary(vec![]))).unwrap();
        tx.send(Ok(Message::Binary(vec![101, 1, 2]))).unwrap();
        assert_eq!(recv(&mut a_rx).await, vec![101, 1, 2]);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(hub.version(), INITIAL_VERSION);
        assert!(gateway.updates().is_empty());
    }

    #[tokio::test]
    async fn read_only_client_cannot_push_content() {
        let gateway = MemoryGateway::new();
        let manager = manager(&gateway);
        let doc = Uuid::new_v4();
        let hub = manager.get_or_create_hub(doc).await;

        let (editor, mut editor_rx) = ClientConnection::new("alice", doc, true, 16);
        let (guest, _guest_rx) = ClientConnection::new("guest-1", doc, false, 16);
        hub.register(editor).await.unwrap();
        hub.register(guest.clone()).await.unwrap();
        let (tx, stream) = inbound();
        tokio::spawn(read_pump(stream, guest, hub.clone(), manager.persistence().cloned(), slow_settings()));

        tx.send(Ok(Message::Binary(vec![2, 6, 6]))).unwrap();
        tx.send(Ok(Message::Binary(vec![1, 6]))).unwrap();
        tx.send(Ok(Message::Binary(vec![101, 3]))).unwrap();
        assert_eq!(recv(&mut editor_rx).await, vec![101, 3]);
        assert_eq!(hub.version(), INITIAL_VERSION);
        assert!(gateway.updates().is_empty());
    }

    #[tokio::test]
    async fn close_frame_unregisters_and_empties_the_hub() {
        let gateway = MemoryGateway::new();
        let manager = manager(&gateway);
        let doc = Uuid::new_v4();
        let hub = manager.get_or_create_hub(doc).await;

        let (a, _a_rx) = ClientConnection::new("alice", doc, true, 16);
        hub.register(a.clone()).await.unwrap();
        let (tx, stream) = inbound();
        let reader = tokio::spawn(read_pump(stream, a.clone(), hub.clone(), manager.persistence().cloned(), slow_settings()));

        tx.send(Ok(Message::Close(None))).unwrap();
        timeout(WAIT, reader).await.unwrap().unwrap();
        wait_for(|| manager.get_hub(doc).is_none()).await;
        assert!(a.is_outbound_closed());
    }

    #[tokio::test]
    async fn oversized_frame_ends_the_connection() {
        let gateway = MemoryGateway::new();
        let manager = manager(&gateway);
        let doc = Uuid::new_v4();
        let hub = manager.get_or_create_hub(doc).await;

        let (a, _a_rx) = ClientConnection::new("alice", doc, true, 16);
        hub.register(a.clone()).await.unwrap();
        let (tx, stream) = inbound();
        let reader = tokio::spawn(read_pump(stream, a.clone(), hub.clone(), None, slow_settings()));

        let mut frame = vec![2u8];
        frame.resize(65, 0);
        tx.send(Ok(Message::Binary(frame))).unwrap();
        timeout(WAIT, reader).await.unwrap().unwrap();
        assert_eq!(hub.version(), INITIAL_VERSION);
    }

    #[tokio::test]
    async fn missing_pong_times_out_and_pong_extends_the_deadline() {
        let gateway = MemoryGateway::new();
        let manager = manager(&gateway);
        let doc = Uuid::new_v4();
        let hub = manager.get_or_create_hub(doc).await;

        let (a, _a_rx) = ClientConnection::new("alice", doc, true, 16);
        hub.register(a.clone()).await.unwrap();
        let (tx, stream) = inbound();
        let started = Instant::now();
        let reader = tokio::spawn(read_pump(stream, a.clone(), hub.clone(), None, fast_settings()));

        for _ in 0..3 {
            tokio::time::sleep(Duration::from_millis(60)).await;
            tx.send(Ok(Message::Pong(Vec::new()))).unwrap();
        }
        timeout(WAIT, reader).await.unwrap().unwrap();
        assert!(started.elapsed() >= Duration::from_millis(260));
        assert!(a.done().is_cancelled());
    }

    #[tokio::test]
    async fn write_pump_relays_queue_then_sends_close() {
        let doc = Uuid::new_v4();
        let (client, queue) = ClientConnection::new("alice", doc, true, 8);
        let (mut frames, sink) = outbound_sink();
        let writer = tokio::spawn(write_pump(sink, queue, client.clone(), Arc::new(YjsCodec), slow_settings()));

        client.try_enqueue(Payload::from(&[2u8, 1][..])).unwrap();
        client.try_enqueue(Payload::from(&[101u8, 2][..])).unwrap();
        assert!(client.close_outbound());

        timeout(WAIT, writer).await.unwrap().unwrap();
        assert!(matches!(frames.recv().await, Some(Message::Binary(b)) if b == vec![2, 1]));
        assert!(matches!(frames.recv().await, Some(Message::Binary(b)) if b == vec![101, 2]));
        assert!(matches!(frames.recv().await, Some(Message::Close(None))));
        assert!(client.done().is_cancelled());
    }

    #[tokio::test]
    async fn write_pump_pings_on_the_keepalive_interval() {
        let doc = Uuid::new_v4();
        let (client, queue) = ClientConnection::new("alice", doc, true, 8);
        let (mut frames, sink) = outbound_sink();
        let writer = tokio::spawn(write_pump(sink, queue, client.clone(), Arc::new(YjsCodec), fast_settings()));

        let first = timeout(WAIT, frames.recv()).await.unwrap();
        assert!(matches!(first, Some(Message::Ping(_))));

        client.done().cancel();
        timeout(WAIT, writer).await.unwrap().unwrap();
        assert!(client.is_outbound_closed());
    }

    #[tokio::test]
    async fn write_failure_stops_both_pumps() {
        let gateway = MemoryGateway::new();
        let manager = manager(&gateway);
        let doc = Uuid::new_v4();
        let hub = manager.get_or_create_hub(doc).await;

        let (a, queue) = ClientConnection::new("alice", doc, true, 8);
        hub.register(a.clone()).await.unwrap();
        let (frames, sink) = outbound_sink();
        drop(frames);
        let (_tx, stream) = inbound();
        let reader = tokio::spawn(read_pump(stream, a.clone(), hub.clone(), None, slow_settings()));
        let writer = tokio::spawn(write_pump(sink, queue, a.clone(), Arc::new(YjsCodec), slow_settings()));

        a.try_enqueue(Payload::from(&[2u8, 1][..])).unwrap();
        timeout(WAIT, writer).await.unwrap().unwrap();
        timeout(WAIT, reader).await.unwrap().unwrap();
        wait_for(|| manager.get_hub(doc).is_none()).await;
    }
}
