//! Persistent storage layer for collaborative documents.
//!
//! Architecture:
//! ```text
//! ┌─────────────────┐  append_op_log   ┌───────────────────┐
//! │ DocumentSession │ ───────────────► │ SnapshotStore     │
//! │ (actor)         │  save_snapshot   │ (trait)           │
//! └────────┬────────┘ ───────────────► └─────────┬─────────┘
//!          │                                     │
//!          │ on load: snapshot + op log replay   ├── MemoryStore
//!          ▼                                     └── DocumentStore (RocksDB)
//! ┌─────────────────┐                              │
//! │ Document        │              ┌───────────────┴──────────────────┐
//! │ (restored)      │              │ CF "documents": snapshots        │
//! └─────────────────┘              │ CF "oplog"    : canonical ops    │
//!                                  │ CF "metadata" : doc metadata     │
//!                                  └──────────────────────────────────┘
//! ```
//!
//! Every canonical operation is appended to the op log before it is applied
//! in memory. Snapshots are taken periodically, after which the log is
//! compacted up to the snapshot revision. Loading a document replays the
//! log tail on top of the latest snapshot.

pub mod memory;
pub mod rocks;

pub use memory::MemoryStore;
pub use rocks::{DocumentMetadata, DocumentStore, StoreConfig};

use quire_core::{Operation, VersionVector};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::comments::Comment;

/// Full persisted state of one document at one revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub revision: u64,
    pub content: String,
    pub versions: VersionVector,
    pub comments: Vec<Comment>,
}

impl Snapshot {
    pub fn empty() -> Self {
        Self {
            revision: 0,
            content: String::new(),
            versions: VersionVector::new(),
            comments: Vec::new(),
        }
    }

    /// bincode encoding used by the persistent backends.
    pub fn encode(&self) -> Result<Vec<u8>, StoreError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        decode(bytes)
    }
}

/// Save/load interface the document sessions persist through.
///
/// Calls are synchronous: a session performs them from its own task and
/// never holds a lock across them.
pub trait SnapshotStore: Send + Sync {
    /// Latest snapshot, or `None` for a document that was never saved.
    fn load_snapshot(&self, doc_id: Uuid) -> Result<Option<Snapshot>, StoreError>;

    fn save_snapshot(&self, doc_id: Uuid, snapshot: &Snapshot) -> Result<(), StoreError>;

    /// Durably record one canonical operation.
    fn append_op_log(&self, doc_id: Uuid, op: &Operation) -> Result<(), StoreError>;

    /// Logged operations with a revision above `revision`, in order.
    fn load_op_log_since(&self, _doc_id: Uuid, _revision: u64) -> Result<Vec<Operation>, StoreError> {
        Ok(Vec::new())
    }

    /// Drop logged operations up to and including `up_to`. Returns how many.
    fn compact_op_log(&self, _doc_id: Uuid, _up_to: u64) -> Result<u64, StoreError> {
        Ok(0)
    }

    fn delete_document(&self, _doc_id: Uuid) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Storage errors.
#[derive(Debug, Clone)]
pub enum StoreError {
    /// Backend error
    DatabaseError(String),
    /// Document not found
    NotFound(Uuid),
    SerializationError(String),
    DeserializationError(String),
    CompressionError(String),
    /// Logged operations do not line up with the snapshot
    Corrupted(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::DatabaseError(e) => write!(f, "Database error: {e}"),
            StoreError::NotFound(id) => write!(f, "Document not found: {id}"),
            StoreError::SerializationError(e) => write!(f, "Serialization error: {e}"),
            StoreError::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            StoreError::CompressionError(e) => write!(f, "Compression error: {e}"),
            StoreError::Corrupted(e) => write!(f, "Corrupted store: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

/// LZ4-compressed bincode.
pub(crate) fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    let raw = bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| StoreError::SerializationError(e.to_string()))?;
    Ok(lz4_flex::compress_prepend_size(&raw))
}

pub(crate) fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    let raw = lz4_flex::decompress_size_prepended(bytes)
        .map_err(|e| StoreError::CompressionError(e.to_string()))?;
    let (value, _) = bincode::serde::borrow_decode_from_slice(&raw, bincode::config::standard())
        .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
    Ok(value)
}
