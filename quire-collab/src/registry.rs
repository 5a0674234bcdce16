//! Document registry: maps document IDs to running sessions.
//!
//! Each document gets at most one live session. A session that drained
//! (idle, unloaded, deleted, failed) is replaced on next access, but only
//! after it reached `Unloaded` so the new one loads the final snapshot.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::broadcast::{BusCounters, BusStats};
use crate::session::{DocumentHandle, DocumentSession, SessionConfig, SessionError, SessionState};
use crate::storage::SnapshotStore;

pub struct DocumentRegistry {
    sessions: RwLock<HashMap<Uuid, DocumentHandle>>,
    store: Arc<dyn SnapshotStore>,
    config: SessionConfig,
    /// Shared by the event bus of every session spawned here
    bus_counters: Arc<BusCounters>,
}

impl DocumentRegistry {
    pub fn new(store: Arc<dyn SnapshotStore>, config: SessionConfig) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            store,
            config,
            bus_counters: Arc::default(),
        }
    }

    /// Get the live session for `doc_id`, loading it if needed.
    pub async fn get_or_spawn(&self, doc_id: Uuid) -> DocumentHandle {
        // Fast path: read lock
        {
            let sessions = self.sessions.read().await;
            if let Some(handle) = sessions.get(&doc_id) {
                if !handle.is_closed() {
                    return handle.clone();
                }
            }
        }

        // Slow path: write lock to create
        let stale = {
            let mut sessions = self.sessions.write().await;
            // Double-check after acquiring write lock
            match sessions.get(&doc_id) {
                Some(handle) if !handle.is_closed() => return handle.clone(),
                Some(handle) => handle.clone(),
                None => return self.spawn_locked(&mut sessions, doc_id),
            }
        };

        // Outside the lock: the old session may still be saving.
        stale.wait_unloaded().await;

        let mut sessions = self.sessions.write().await;
        match sessions.get(&doc_id) {
            Some(handle) if !handle.is_closed() => handle.clone(),
            _ => self.spawn_locked(&mut sessions, doc_id),
        }
    }

    fn spawn_locked(&self, sessions: &mut HashMap<Uuid, DocumentHandle>, doc_id: Uuid) -> DocumentHandle {
        log::debug!("Spawning session for doc {doc_id}");
        let handle = DocumentSession::spawn_with_counters(
            doc_id,
            self.store.clone(),
            self.config.clone(),
            self.bus_counters.clone(),
        );
        sessions.insert(doc_id, handle.clone());
        handle
    }

    /// Live session for `doc_id`, without loading one.
    pub async fn get(&self, doc_id: &Uuid) -> Option<DocumentHandle> {
        self.sessions
            .read()
            .await
            .get(doc_id)
            .filter(|h| !h.is_closed())
            .cloned()
    }

    /// Forget sessions that stopped. Returns how many were removed.
    pub async fn reap(&self) -> usize {
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, handle| handle.state() != SessionState::Unloaded);
        before - sessions.len()
    }

    /// Number of documents with a live session.
    pub async fn document_count(&self) -> usize {
        self.sessions
            .read()
            .await
            .values()
            .filter(|h| !h.is_closed())
            .count()
    }

    /// Event counts across every session this registry has spawned.
    pub fn bus_stats(&self) -> BusStats {
        self.bus_counters.stats()
    }

    pub async fn active_documents(&self) -> Vec<Uuid> {
        self.sessions
            .read()
            .await
            .iter()
            .filter(|(_, h)| !h.is_closed())
            .map(|(id, _)| *id)
            .collect()
    }

    /// Unload every live session, saving final snapshots.
    pub async fn unload_all(&self) -> Vec<(Uuid, SessionError)> {
        let handles: Vec<DocumentHandle> = self.sessions.read().await.values().cloned().collect();

        let mut failures = Vec::new();
        for handle in handles {
            match handle.unload().await {
                Ok(()) | Err(SessionError::Unavailable) => {}
                Err(e) => failures.push((handle.doc_id(), e)),
            }
        }
        self.reap().await;
        failures
    }

    pub fn store(&self) -> &Arc<dyn SnapshotStore> {
        &self.store
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }
}
