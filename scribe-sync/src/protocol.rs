//! JSON wire protocol for document synchronization.
//!
//! Every frame is a JSON text message tagged by `type`, field names in camelCase:
//! ```text
//! client → {"type":"sync","operations":[{"kind":"insert","target":"body","baseVersion":0}]}
//! server → {"type":"ack","version":1,"operations":[{"kind":"insert",...,"version":1}]}
//! server → {"type":"sync","clientId":"…","operations":[…]}          (to everyone else)
//! ```
//!
//! Operations carry the version the client based them on (`baseVersion`);
//! `version` is only ever assigned by the server.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Opaque identifier assigned to a connection at accept time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Logical document identifier chosen by clients.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(String);

impl DocumentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for DocumentId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for DocumentId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// User identity resolved by the authentication gate.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for UserId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Milliseconds since the Unix epoch. Advisory only, never used for ordering.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Edit kinds the engine understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpKind {
    Insert,
    Delete,
    Update,
}

/// One atomic edit intent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    pub kind: OpKind,
    /// Logical path of the edited resource. Conflicts are detected per target.
    #[serde(default)]
    pub target: String,
    /// Kind-specific content: inserted text, deleted length, updated value.
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Assigned by the engine on acceptance; ignored when sent by a client.
    #[serde(default)]
    pub version: u64,
    pub base_version: u64,
    #[serde(default)]
    pub timestamp: u64,
}

impl Operation {
    pub fn new(
        kind: OpKind,
        target: impl Into<String>,
        payload: serde_json::Value,
        base_version: u64,
    ) -> Self {
        Self {
            kind,
            target: target.into(),
            payload,
            version: 0,
            base_version,
            timestamp: now_millis(),
        }
    }

    pub fn insert(target: impl Into<String>, text: impl Into<String>, base_version: u64) -> Self {
        Self::new(
            OpKind::Insert,
            target,
            serde_json::Value::String(text.into()),
            base_version,
        )
    }

    pub fn delete(target: impl Into<String>, length: u64, base_version: u64) -> Self {
        Self::new(OpKind::Delete, target, serde_json::Value::from(length), base_version)
    }

    pub fn update(target: impl Into<String>, value: serde_json::Value, base_version: u64) -> Self {
        Self::new(OpKind::Update, target, value, base_version)
    }

    /// Shape checks that serde cannot express.
    pub fn validate(&self, index: usize) -> Result<(), ProtocolError> {
        if self.target.trim().is_empty() {
            return Err(ProtocolError::MissingTarget { index });
        }
        Ok(())
    }
}

/// Cursor position inside a target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    pub target: String,
    pub position: u64,
}

/// Selected range inside a target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    pub target: String,
    pub start: u64,
    pub end: u64,
}

/// Presence payload sent by a client.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<Cursor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection: Option<Selection>,
}

/// Broadcastable presence of one connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    pub client_id: ConnectionId,
    pub user_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<Cursor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection: Option<Selection>,
    pub last_update: u64,
}

/// A client's reconciliation of a conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resolution {
    pub operations: Vec<Operation>,
    pub new_version: u64,
}

/// Frames sent by clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    Join { document_id: DocumentId },
    Sync { operations: Vec<Operation> },
    ConflictResolution { resolution: Resolution },
    Presence { presence: PresenceState },
    History { since_version: u64 },
    Ping,
    Pong,
}

impl ClientMessage {
    pub fn decode(frame: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(frame).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }
}

/// Frames sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    Connected {
        client_id: ConnectionId,
        document_id: DocumentId,
        version: u64,
    },
    Joined {
        document_id: DocumentId,
        version: u64,
    },
    /// Operations accepted from another connection.
    Sync {
        client_id: ConnectionId,
        operations: Vec<Operation>,
    },
    /// Acceptance of the receiver's own batch.
    Ack {
        version: u64,
        operations: Vec<Operation>,
    },
    Conflict {
        operations: Vec<Operation>,
        current_version: u64,
    },
    ConflictResolved {
        client_id: ConnectionId,
        resolution: Resolution,
    },
    PresenceUpdate {
        presence: Vec<PresenceRecord>,
    },
    History {
        operations: Vec<Operation>,
        current_version: u64,
    },
    Ping,
    Pong,
    Error {
        error: String,
    },
}

impl ServerMessage {
    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            error: message.into(),
        }
    }

    pub fn decode(frame: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(frame).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }
}

/// Malformed or unacceptable input from a client.
///
/// Reported to the sender only; the connection stays open.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("operation {index} is missing a target")]
    MissingTarget { index: usize },
    #[error("sync frame carries no operations")]
    EmptyBatch,
    #[error("base version {base} is ahead of document version {current}")]
    BaseVersionAhead { base: u64, current: u64 },
    #[error("resolution carries no operations")]
    EmptyResolution,
    #[error("resolution declares version {new_version}, more than its operations can reach from {current}")]
    ResolutionAhead { new_version: u64, current: u64 },
}
