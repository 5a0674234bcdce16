//! Per-document event bus with backpressure.
//!
//! Uses a tokio broadcast channel for O(1) send to all subscribers. Each
//! connection gets an independent receiver that buffers up to `capacity`
//! events; a receiver that falls further behind observes
//! `RecvError::Lagged` and must resynchronise from a snapshot.
//!
//! Acks and broadcasts are both derived from [`SessionEvent::Applied`], so
//! every connection sees canonical operations in revision order.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

use quire_core::Operation;

use crate::comments::Comment;
use crate::presence::PresenceState;

/// Identifies one client connection (not one participant: a participant
/// may hold several connections).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Why a session stopped serving its document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Idle,
    Unloaded,
    Deleted,
    PersistenceFailure,
}

/// Everything a session tells its connections.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A canonical operation was applied. `origin` submitted it.
    Applied {
        op: Arc<Operation>,
        origin: ConnectionId,
    },
    PresenceChanged(PresenceState),
    PresenceLeft {
        participant_id: Uuid,
    },
    CommentChanged(Comment),
    CommentRemoved {
        comment_id: Uuid,
    },
    Closed(CloseReason),
}

/// Statistics for monitoring bus health.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BusStats {
    pub events_published: u64,
    /// Published while nobody was subscribed.
    pub events_undelivered: u64,
}

/// Lock-free counters updated on the publish path. One set may be shared
/// by many buses to aggregate across documents.
#[derive(Debug, Default)]
pub struct BusCounters {
    events_published: AtomicU64,
    events_undelivered: AtomicU64,
}

impl BusCounters {
    pub fn stats(&self) -> BusStats {
        BusStats {
            events_published: self.events_published.load(Ordering::Relaxed),
            events_undelivered: self.events_undelivered.load(Ordering::Relaxed),
        }
    }
}

/// Fan-out channel for one document session.
pub struct EventBus {
    sender: broadcast::Sender<Arc<SessionEvent>>,
    counters: Arc<BusCounters>,
}

impl EventBus {
    /// `capacity` bounds how far a subscriber may lag before it is told
    /// it missed events.
    pub fn new(capacity: usize) -> Self {
        Self::with_counters(capacity, Arc::default())
    }

    pub fn with_counters(capacity: usize, counters: Arc<BusCounters>) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender, counters }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<SessionEvent>> {
        self.sender.subscribe()
    }

    /// Publish to every current subscriber. Returns how many received it.
    pub fn publish(&self, event: SessionEvent) -> usize {
        self.counters.events_published.fetch_add(1, Ordering::Relaxed);
        match self.sender.send(Arc::new(event)) {
            Ok(count) => count,
            Err(_) => {
                self.counters.events_undelivered.fetch_add(1, Ordering::Relaxed);
                0
            }
        }
    }
}
