//! In-memory store for tests and servers started without a storage path.

use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

use quire_core::Operation;

use super::{Snapshot, SnapshotStore, StoreError};

#[derive(Debug, Default)]
struct Entry {
    snapshot: Option<Snapshot>,
    log: Vec<Operation>,
}

/// Volatile [`SnapshotStore`]: everything is lost with the process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    docs: Mutex<HashMap<Uuid, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_docs<R>(&self, f: impl FnOnce(&mut HashMap<Uuid, Entry>) -> R) -> Result<R, StoreError> {
        let mut docs = self
            .docs
            .lock()
            .map_err(|_| StoreError::DatabaseError("memory store lock poisoned".into()))?;
        Ok(f(&mut docs))
    }

    /// Number of logged operations currently held for `doc_id`.
    pub fn op_log_len(&self, doc_id: Uuid) -> usize {
        self.with_docs(|docs| docs.get(&doc_id).map_or(0, |e| e.log.len()))
            .unwrap_or(0)
    }

    pub fn document_count(&self) -> usize {
        self.with_docs(|docs| docs.len()).unwrap_or(0)
    }
}

impl SnapshotStore for MemoryStore {
    fn load_snapshot(&self, doc_id: Uuid) -> Result<Option<Snapshot>, StoreError> {
        self.with_docs(|docs| docs.get(&doc_id).and_then(|e| e.snapshot.clone()))
    }

    fn save_snapshot(&self, doc_id: Uuid, snapshot: &Snapshot) -> Result<(), StoreError> {
        self.with_docs(|docs| {
            docs.entry(doc_id).or_default().snapshot = Some(snapshot.clone());
        })
    }

    fn append_op_log(&self, doc_id: Uuid, op: &Operation) -> Result<(), StoreError> {
        self.with_docs(|docs| docs.entry(doc_id).or_default().log.push(op.clone()))
    }

    fn load_op_log_since(&self, doc_id: Uuid, revision: u64) -> Result<Vec<Operation>, StoreError> {
        self.with_docs(|docs| {
            docs.get(&doc_id)
                .map(|e| {
                    e.log
                        .iter()
                        .filter(|op| op.revision() > revision)
                        .cloned()
                        .collect()
                })
                .unwrap_or_default()
        })
    }

    fn compact_op_log(&self, doc_id: Uuid, up_to: u64) -> Result<u64, StoreError> {
        self.with_docs(|docs| match docs.get_mut(&doc_id) {
            Some(entry) => {
                let before = entry.log.len();
                entry.log.retain(|op| op.revision() > up_to);
                (before - entry.log.len()) as u64
            }
            None => 0,
        })
    }

    fn delete_document(&self, doc_id: Uuid) -> Result<(), StoreError> {
        self.with_docs(|docs| {
            docs.remove(&doc_id);
        })
    }
}
