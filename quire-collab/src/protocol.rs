//! JSON wire protocol between clients and the sync server.
//!
//! Every frame is a WebSocket text frame holding one JSON object with a
//! `type` tag and camelCase fields:
//!
//! ```text
//! → {"type":"op","docId":"…","participantId":"…","baseRevision":4,"seq":7,
//!    "primitives":[{"retain":2},{"insert":"X"}]}
//! ← {"type":"op-ack","docId":"…","revision":5,"seq":7}
//! ```
//!
//! Offsets and lengths count Unicode scalar values.

use quire_core::ChangeSet;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::comments::Comment;
use crate::presence::{CursorColor, PresenceState, Selection};

/// Client → server messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Attach this connection to a document.
    Join {
        doc_id: Uuid,
        participant_id: Uuid,
        #[serde(default)]
        known_revision: Option<u64>,
        #[serde(default)]
        label: Option<String>,
    },
    /// Submit an edit made against `base_revision`.
    Op {
        doc_id: Uuid,
        participant_id: Uuid,
        base_revision: u64,
        /// 0 = unsequenced (never deduplicated)
        #[serde(default)]
        seq: u64,
        #[serde(default)]
        priority: u32,
        primitives: ChangeSet,
    },
    Presence {
        doc_id: Uuid,
        participant_id: Uuid,
        cursor: usize,
        #[serde(default)]
        selection: Option<Selection>,
        /// Revision the offsets refer to (defaults to the current one).
        #[serde(default)]
        revision: Option<u64>,
        #[serde(default)]
        label: Option<String>,
        #[serde(default)]
        color: Option<CursorColor>,
    },
    SnapshotRequest {
        doc_id: Uuid,
    },
    CommentAdd {
        doc_id: Uuid,
        participant_id: Uuid,
        revision: u64,
        start: usize,
        end: usize,
        body: String,
    },
    CommentResolve {
        doc_id: Uuid,
        comment_id: Uuid,
        resolved: bool,
    },
    CommentDelete {
        doc_id: Uuid,
        comment_id: Uuid,
    },
    Leave {
        doc_id: Uuid,
        participant_id: Uuid,
    },
    Ping,
}

impl ClientMessage {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Document this message targets, if any.
    pub fn doc_id(&self) -> Option<Uuid> {
        match self {
            ClientMessage::Join { doc_id, .. }
            | ClientMessage::Op { doc_id, .. }
            | ClientMessage::Presence { doc_id, .. }
            | ClientMessage::SnapshotRequest { doc_id }
            | ClientMessage::CommentAdd { doc_id, .. }
            | ClientMessage::CommentResolve { doc_id, .. }
            | ClientMessage::CommentDelete { doc_id, .. }
            | ClientMessage::Leave { doc_id, .. } => Some(*doc_id),
            ClientMessage::Ping => None,
        }
    }
}

/// Server → client messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// The sender's own operation became canonical at `revision`.
    OpAck {
        doc_id: Uuid,
        revision: u64,
        seq: u64,
    },
    /// Another participant's canonical operation.
    OpBroadcast {
        doc_id: Uuid,
        revision: u64,
        participant_id: Uuid,
        seq: u64,
        #[serde(default)]
        priority: u32,
        primitives: ChangeSet,
    },
    /// Local state can no longer be reconciled; a snapshot follows.
    ResyncRequired {
        doc_id: Uuid,
    },
    /// Full document state. Always followed by a `presence-update` for
    /// every other participant and a `comment-update` for every comment;
    /// together they replace whatever the client held before.
    Snapshot {
        doc_id: Uuid,
        revision: u64,
        content: String,
    },
    PresenceUpdate {
        doc_id: Uuid,
        participant_id: Uuid,
        cursor: usize,
        selection: Option<Selection>,
        color: CursorColor,
        label: Option<String>,
    },
    PresenceLeft {
        doc_id: Uuid,
        participant_id: Uuid,
    },
    CommentUpdate {
        doc_id: Uuid,
        comment: Comment,
    },
    CommentRemoved {
        doc_id: Uuid,
        comment_id: Uuid,
    },
    Error {
        code: ErrorCode,
        message: String,
    },
    Pong,
}

impl ServerMessage {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn presence(doc_id: Uuid, state: &PresenceState) -> Self {
        ServerMessage::PresenceUpdate {
            doc_id,
            participant_id: state.participant_id,
            cursor: state.cursor,
            selection: state.selection,
            color: state.color,
            label: state.label.clone(),
        }
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            code,
            message: message.into(),
        }
    }
}

/// Error codes carried by `error` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCode {
    MalformedOperation,
    PersistenceFailure,
    ProtocolViolation,
    DocumentUnavailable,
    DocumentFull,
    DocumentDeleted,
    UnknownComment,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorCode::MalformedOperation => "malformed-operation",
            ErrorCode::PersistenceFailure => "persistence-failure",
            ErrorCode::ProtocolViolation => "protocol-violation",
            ErrorCode::DocumentUnavailable => "document-unavailable",
            ErrorCode::DocumentFull => "document-full",
            ErrorCode::DocumentDeleted => "document-deleted",
            ErrorCode::UnknownComment => "unknown-comment",
        };
        f.write_str(s)
    }
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    /// Well-formed JSON that breaks the protocol (wrong document, wrong
    /// participant, message before join, oversized or binary frame).
    Violation(String),
    ConnectionClosed,
    Transport(String),
    Timeout,
    /// A local edit did not fit the client's copy of the document.
    InvalidEdit(String),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::Violation(e) => write!(f, "Protocol violation: {e}"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::Transport(e) => write!(f, "Transport error: {e}"),
            Self::Timeout => write!(f, "Connection timeout"),
            Self::InvalidEdit(e) => write!(f, "Invalid edit: {e}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

impl From<serde_json::Error> for ProtocolError {
    fn from(e: serde_json::Error) -> Self {
        if e.is_io() {
            ProtocolError::SerializationError(e.to_string())
        } else {
            ProtocolError::DeserializationError(e.to_string())
        }
    }
}

impl From<quire_core::OtError> for ProtocolError {
    fn from(e: quire_core::OtError) -> Self {
        ProtocolError::InvalidEdit(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ProtocolError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error;
        match e {
            Error::ConnectionClosed | Error::AlreadyClosed => ProtocolError::ConnectionClosed,
            other => ProtocolError::Transport(other.to_string()),
        }
    }
}
