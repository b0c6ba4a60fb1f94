//! Wire and storage types for the duplex session protocol.
//!
//! Frames are the on-the-wire JSON envelope exchanged over the WebSocket.
//! Events are the durable, append-only log rows each frame is derived from
//! (or recorded into) on the server side.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Current protocol version advertised in the HELLO frame and checked
/// against nothing yet — reserved for future negotiation.
pub const PROTOCOL_VERSION: i32 = 1;

/// A durable event row in the per-(user, save) append-only log.
#[derive(Debug, Clone, FromRow)]
pub struct Event {
    pub user_id: String,
    pub save_id: String,
    pub seq: i64,
    pub frame_type: String,
    pub payload_json: Option<serde_json::Value>,
    pub ack_required: bool,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl Event {
    /// Build the wire frame for this event, as sent during replay or live tail.
    pub fn to_frame(&self) -> Frame {
        Frame {
            protocol_version: PROTOCOL_VERSION,
            frame_type: self.frame_type.clone(),
            seq: self.seq,
            cursor: self.seq,
            server_event_id: Some(format!("{}:{}:{}", self.user_id, self.save_id, self.seq)),
            ack_required: self.ack_required,
            payload: self.payload_json.clone(),
        }
    }
}

/// Per-(user, save) stream counters: the next sequence number to assign
/// and how far the log has been trimmed (garbage-collected) so far.
#[derive(Debug, Clone, FromRow)]
pub struct Stream {
    pub user_id: String,
    pub save_id: String,
    pub next_seq: i64,
    pub trimmed_upto_seq: i64,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

/// Per-device read cursor on a stream: the highest seq that device has
/// acknowledged receiving.
#[derive(Debug, Clone, FromRow)]
pub struct DeviceCursor {
    pub user_id: String,
    pub save_id: String,
    pub device_id: String,
    pub last_acked_seq: i64,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

/// A completed chat-stream usage record, persisted once per CHAT_SEND
/// regardless of how the stream ended (completed, interrupted, errored).
#[derive(Debug, Clone, FromRow)]
pub struct UsageRow {
    pub id: String,
    pub user_id: String,
    pub save_id: String,
    pub provider: String,
    pub api: String,
    pub model: String,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub ended_at: chrono::DateTime<chrono::Utc>,
    pub latency_ms: i64,
    pub time_to_first_token_ms: Option<i64>,
    pub output_chunks: i64,
    pub output_chars: i64,
    pub interrupted: bool,
    pub error: Option<String>,
    pub prompt_tokens: Option<i64>,
    pub completion_tokens: Option<i64>,
    pub total_tokens: Option<i64>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// The external, owning entity a stream lives under. Rows live in a table
/// this subsystem does not own and never mutates.
#[derive(Debug, Clone, FromRow)]
pub struct Save {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub deleted_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl Save {
    pub fn is_owned_by(&self, user_id: &str) -> bool {
        self.deleted_at.is_none() && self.user_id == user_id
    }
}

/// The duplex wire envelope, both directions.
///
/// Control frames (HELLO, PONG) set `seq: 0` and carry the device's
/// current ack cursor in `cursor`. Log-backed frames (EVENT, CHAT_TOKEN,
/// CHAT_DONE, ...) carry the seq they were appended under and repeat it
/// in `cursor`. `server_event_id` and `payload` are always present on
/// the wire, `null` when absent, never omitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    pub protocol_version: i32,
    #[serde(rename = "type")]
    pub frame_type: String,
    pub seq: i64,
    pub cursor: i64,
    pub server_event_id: Option<String>,
    pub ack_required: bool,
    pub payload: Option<serde_json::Value>,
}

impl Frame {
    /// A control frame: not part of the durable log, always seq 0.
    /// `cursor` carries the device's current ack watermark.
    pub fn control(
        frame_type: impl Into<String>,
        cursor: i64,
        payload: Option<serde_json::Value>,
    ) -> Self {
        Frame {
            protocol_version: PROTOCOL_VERSION,
            frame_type: frame_type.into(),
            seq: 0,
            cursor,
            server_event_id: None,
            ack_required: false,
            payload,
        }
    }

    pub fn hello(cursor: i64, user_id: &str, save_id: &str) -> Self {
        Self::control(
            frame_type::HELLO,
            cursor,
            Some(serde_json::json!({ "user_id": user_id, "save_id": save_id })),
        )
    }

    pub fn pong(cursor: i64, payload: Option<serde_json::Value>) -> Self {
        Self::control(frame_type::PONG, cursor, payload)
    }
}

/// One item pushed through a connection's outbound channel: either a
/// frame to send, or a request to close the socket with a specific WS
/// close code. Kept as one channel so a close is ordered correctly
/// relative to whatever frames were already queued ahead of it.
#[derive(Debug, Clone)]
pub enum OutboundMsg {
    Frame(Frame),
    Close(u16),
}

impl From<Frame> for OutboundMsg {
    fn from(frame: Frame) -> Self {
        OutboundMsg::Frame(frame)
    }
}

/// Well-known frame_type values. The log also accepts arbitrary
/// application-defined types (e.g. TIMELINE_EVENT, ROOM_EVENT, SUGGESTION)
/// appended by collaborators outside this subsystem; those are opaque here.
pub mod frame_type {
    pub const EVENT: &str = "EVENT";
    pub const CHAT_TOKEN: &str = "CHAT_TOKEN";
    pub const CHAT_DONE: &str = "CHAT_DONE";
    pub const HELLO: &str = "HELLO";
    pub const PONG: &str = "PONG";
}

/// Client -> server message types, parsed from incoming WS text frames.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "ACK")]
    Ack {
        #[serde(default)]
        cursor: Option<i64>,
        #[serde(default)]
        seq: Option<i64>,
    },
    #[serde(rename = "PING")]
    Ping {
        #[serde(default)]
        payload: Option<serde_json::Value>,
    },
    #[serde(rename = "INTERRUPT")]
    Interrupt,
    #[serde(rename = "CHAT_SEND")]
    ChatSend { payload: ChatSendPayload },
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatSendPayload {
    pub text: String,
    #[serde(default)]
    pub client_request_id: Option<String>,
}
