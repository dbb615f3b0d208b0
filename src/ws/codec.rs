use axum::extract::ws::Message;
use serde::Deserialize;
use std::sync::Arc;

/// Raw payload relayed through a hub. Shared between every member queue.
pub type Payload = Arc<[u8]>;

pub const TAG_SYNC_STEP_1: u8 = 0;
pub const TAG_SYNC_STEP_2: u8 = 1;
pub const TAG_UPDATE: u8 = 2;
pub const TAG_AWARENESS: u8 = 101;

/// What a relayed message means to the hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    SyncStep1,
    SyncStep2,
    /// Content update: bumps the hub version and replaces the cached state.
    Update,
    /// Presence metadata: relayed, never persisted, never versioned.
    Awareness,
    /// Unknown tag, relayed as-is.
    Opaque,
}

impl MessageKind {
    pub fn is_content_update(self) -> bool {
        self == MessageKind::Update
    }

    pub fn is_awareness(self) -> bool {
        self == MessageKind::Awareness
    }

    /// Kinds that carry document content and need edit permission.
    pub fn requires_edit(self) -> bool {
        matches!(self, MessageKind::Update | MessageKind::SyncStep2)
    }
}

/// Wire format of the payloads a hub relays.
///
/// The hub never looks inside a payload beyond `classify`; it stores and
/// forwards bytes verbatim, so one hub implementation serves every codec.
pub trait PayloadCodec: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn classify(&self, payload: &[u8]) -> MessageKind;

    /// Whether a client frame is well-formed for this codec. Rejected frames
    /// are dropped before they reach the hub.
    fn accepts(&self, _payload: &[u8]) -> bool {
        true
    }

    /// Build the WebSocket frame carrying `payload` to a client.
    fn to_frame(&self, payload: &[u8]) -> Message;
}

/// Binary CRDT sync protocol: the first byte is the message type tag.
#[derive(Debug, Default, Clone, Copy)]
pub struct YjsCodec;

impl PayloadCodec for YjsCodec {
    fn name(&self) -> &'static str {
        "yjs"
    }

    fn classify(&self, payload: &[u8]) -> MessageKind {
        match payload.first() {
            Some(&TAG_SYNC_STEP_1) => MessageKind::SyncStep1,
            Some(&TAG_SYNC_STEP_2) => MessageKind::SyncStep2,
            Some(&TAG_UPDATE) => MessageKind::Update,
            Some(&TAG_AWARENESS) => MessageKind::Awareness,
            _ => MessageKind::Opaque,
        }
    }

    fn to_frame(&self, payload: &[u8]) -> Message {
        Message::Binary(payload.to_vec())
    }
}

/// JSON document relay: text frames with a `type` discriminator.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

#[derive(Deserialize)]
struct JsonEnvelope {
    #[serde(rename = "type")]
    kind: String,
}

impl PayloadCodec for JsonCodec {
    fn name(&self) -> &'static str {
        "json"
    }

    fn classify(&self, payload: &[u8]) -> MessageKind {
        let Ok(envelope) = serde_json::from_slice::<JsonEnvelope>(payload) else {
            return MessageKind::Opaque;
        };
        match envelope.kind.as_str() {
            "sync-step-1" => MessageKind::SyncStep1,
            "sync-step-2" => MessageKind::SyncStep2,
            "update" => MessageKind::Update,
            "awareness" => MessageKind::Awareness,
            _ => MessageKind::Opaque,
        }
    }

    fn accepts(&self, payload: &[u8]) -> bool {
        std::str::from_utf8(payload).is_ok()
    }

    /// Text frame for UTF-8 payloads. Anything else (a stored snapshot from
    /// another codec) goes out as binary, never rewritten.
    fn to_frame(&self, payload: &[u8]) -> Message {
        match std::str::from_utf8(payload) {
            Ok(text) => Message::Text(text.to_string()),
            Err(_) => Message::Binary(payload.to_vec()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecKind {
    Yjs,
    Json,
}

impl CodecKind {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "yjs" | "binary" => Some(CodecKind::Yjs),
            "json" => Some(CodecKind::Json),
            _ => None,
        }
    }

    pub fn build(self) -> Arc<dyn PayloadCodec> {
        match self {
            CodecKind::Yjs => Arc::new(YjsCodec),
            CodecKind::Json => Arc::new(JsonCodec),
        }
    }
}
