//! Wire messages exchanged between sync clients and the server.
//!
//! Every frame is one JSON object tagged by `type`. Server messages that
//! change client state (`entry`, `compaction_complete`, `compaction_error`)
//! carry a per-connection `msg_id` and are retransmitted until the client
//! answers with `ack`.

use crate::error::{Result, SyncError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tether_log::{Entry, EntryId, EntryKind};

/// Messages sent by a client.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Authenticate the connection.
    Hello {
        #[serde(default)]
        token: Option<String>,
    },
    /// Append one entry to a session.
    Append {
        session_id: String,
        kind: EntryKind,
        payload: Value,
        #[serde(default)]
        create: bool,
    },
    /// Ask the server to compact a session. Answered asynchronously.
    CompactSession {
        session_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
    /// Start delta sync after `last_message_id`, then live-tail.
    Subscribe {
        session_id: String,
        #[serde(default)]
        last_message_id: Option<EntryId>,
    },
    /// Acknowledge a reliable server message.
    Ack { msg_id: u64 },
    Ping {
        #[serde(default)]
        nonce: Option<u64>,
    },
}

impl ClientMessage {
    pub fn session_id(&self) -> Option<&str> {
        match self {
            ClientMessage::Append { session_id, .. }
            | ClientMessage::CompactSession { session_id, .. }
            | ClientMessage::Subscribe { session_id, .. } => Some(session_id),
            _ => None,
        }
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Messages sent by the server.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Handshake accepted.
    Connected { heartbeat_interval_ms: u64 },
    /// One log entry, from delta sync or live tail.
    Entry {
        msg_id: u64,
        #[serde(flatten)]
        entry: Entry,
    },
    CompactionComplete {
        msg_id: u64,
        session_id: String,
        #[serde(default)]
        request_id: Option<String>,
        old_message_count: usize,
        new_message_count: usize,
        messages_removed: usize,
        pre_tokens: Option<u64>,
    },
    CompactionError {
        msg_id: u64,
        session_id: String,
        #[serde(default)]
        request_id: Option<String>,
        error: String,
    },
    Error {
        code: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
    Heartbeat { ts: DateTime<Utc>, interval_ms: u64 },
    Pong {
        #[serde(default)]
        nonce: Option<u64>,
    },
}

impl ServerMessage {
    pub fn entry(entry: Entry) -> Self {
        ServerMessage::Entry { msg_id: 0, entry }
    }

    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            code: code.into(),
            message: message.into(),
            session_id: None,
        }
    }

    pub fn session_error(
        session_id: impl Into<String>,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        ServerMessage::Error {
            code: code.into(),
            message: message.into(),
            session_id: Some(session_id.into()),
        }
    }

    /// Whether the message must be acknowledged by the client.
    pub fn is_reliable(&self) -> bool {
        self.msg_id().is_some()
    }

    pub fn msg_id(&self) -> Option<u64> {
        match self {
            ServerMessage::Entry { msg_id, .. }
            | ServerMessage::CompactionComplete { msg_id, .. }
            | ServerMessage::CompactionError { msg_id, .. } => Some(*msg_id),
            _ => None,
        }
    }

    /// Stamp a reliable message with its transport id. No-op otherwise.
    pub fn set_msg_id(&mut self, id: u64) {
        match self {
            ServerMessage::Entry { msg_id, .. }
            | ServerMessage::CompactionComplete { msg_id, .. }
            | ServerMessage::CompactionError { msg_id, .. } => *msg_id = id,
            _ => {}
        }
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Best-effort extraction of `session_id` from a frame that failed to parse.
pub fn sniff_session_id(text: &str) -> Option<String> {
    let value: Value = serde_json::from_str(text).ok()?;
    value
        .get("session_id")
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Reject frames that are not JSON objects before trying the typed decode.
pub fn decode_client_frame(text: &str) -> Result<ClientMessage> {
    match ClientMessage::decode(text) {
        Ok(message) => Ok(message),
        Err(SyncError::MalformedMessage(detail)) => {
            let kind = serde_json::from_str::<Value>(text)
                .ok()
                .and_then(|v| v.get("type").and_then(Value::as_str).map(str::to_string));
            Err(SyncError::MalformedMessage(match kind {
                Some(kind) => format!("bad '{}' message: {}", kind, detail),
                None => detail,
            }))
        }
        Err(e) => Err(e),
    }
}
