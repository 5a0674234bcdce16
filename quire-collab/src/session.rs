//! Document session: the single writer of one document.
//!
//! Each loaded document is owned by one actor task. Connections talk to it
//! through a cloneable [`DocumentHandle`] (commands over `mpsc`, replies
//! over `oneshot`) and hear back through the session's [`EventBus`].
//!
//! ```text
//!            ┌──────────── DocumentHandle (clone per connection) ───────────┐
//!            │ join / submit / presence / leave / snapshot / comments / … │
//!            └──────────────────────────────┬────────────────────────────────┘
//!                                           │ mpsc<Command>
//!                                           ▼
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │ DocumentSession (tokio task)                                             │
//! │  Loading ─► Active ─► Draining ─► Unloaded      (watch<SessionState>)    │
//! │                                                                          │
//! │  op ─► dedupe ─► pad ─► transform vs History ─► append_op_log ─► apply   │
//! │                                        │                                 │
//! │                                        ▼                                 │
//! │            PresenceTracker / CommentAnchors / EventBus::publish          │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The actor never awaits while an operation is in flight: a command is
//! handled synchronously from start to finish, so every observer sees
//! canonical operations in exactly revision order.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{sleep_until, Instant};
use uuid::Uuid;

use quire_core::{transform_against, Document, Operation, OtError};

use crate::broadcast::{BusCounters, CloseReason, ConnectionId, EventBus, SessionEvent};
use crate::comments::{Anchor, Comment, CommentAnchors};
use crate::history::History;
use crate::presence::{CursorColor, PresenceState, PresenceTracker, Selection};
use crate::storage::{Snapshot, SnapshotStore, StoreError};

// ─── Configuration ────────────────────────────────────────────────────

/// Per-document session tuning.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Canonical operations retained for late ops and catch-up (default: 1024)
    pub history_capacity: usize,
    /// How long a document with no connections stays loaded (default: 30s)
    pub idle_timeout: Duration,
    /// Save a snapshot every N applied operations, 0 = only on unload (default: 100)
    pub snapshot_interval: u64,
    /// Events a connection may lag behind before it must resync (default: 256)
    pub broadcast_capacity: usize,
    /// Maximum simultaneous connections (default: 100)
    pub max_participants: usize,
    /// Queued commands before senders wait (default: 256)
    pub command_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            history_capacity: 1024,
            idle_timeout: Duration::from_secs(30),
            snapshot_interval: 100,
            broadcast_capacity: 256,
            max_participants: 100,
            command_capacity: 256,
        }
    }
}

impl SessionConfig {
    /// Small limits and a short idle timeout.
    pub fn for_testing() -> Self {
        Self {
            history_capacity: 8,
            idle_timeout: Duration::from_millis(200),
            snapshot_interval: 4,
            broadcast_capacity: 64,
            max_participants: 4,
            command_capacity: 64,
        }
    }
}

// ─── Public types ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Loading,
    Active,
    Draining,
    Unloaded,
}

/// Session errors, as seen by a caller of [`DocumentHandle`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// The operation is out of range or otherwise invalid. Nothing changed.
    MalformedOperation(String),
    /// The caller's view can no longer be reconciled; it needs a snapshot.
    ResyncRequired,
    /// The store rejected a write, or the document could not be loaded.
    PersistenceFailure(String),
    /// The session is draining or gone.
    Unavailable,
    DocumentFull,
    Deleted,
    UnknownComment(Uuid),
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::MalformedOperation(e) => write!(f, "Malformed operation: {e}"),
            SessionError::ResyncRequired => write!(f, "Resync required"),
            SessionError::PersistenceFailure(e) => write!(f, "Persistence failure: {e}"),
            SessionError::Unavailable => write!(f, "Document unavailable"),
            SessionError::DocumentFull => write!(f, "Document is full"),
            SessionError::Deleted => write!(f, "Document deleted"),
            SessionError::UnknownComment(id) => write!(f, "Unknown comment: {id}"),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<OtError> for SessionError {
    fn from(e: OtError) -> Self {
        match e {
            OtError::MalformedOperation(reason) => SessionError::MalformedOperation(reason),
            OtError::BaseRevisionMismatch { .. } => SessionError::ResyncRequired,
        }
    }
}

impl From<StoreError> for SessionError {
    fn from(e: StoreError) -> Self {
        SessionError::PersistenceFailure(e.to_string())
    }
}

/// Result of a successful submit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Became canonical at `revision`; an `Applied` event follows.
    Applied { revision: u64 },
    /// Already applied earlier at `revision`; nothing was published.
    Duplicate { revision: u64 },
}

/// How a joining connection gets up to date.
#[derive(Debug, Clone)]
pub enum CatchUp {
    UpToDate,
    /// Canonical operations after the known revision, oldest first.
    Replay(Vec<Arc<Operation>>),
    /// No known revision: send the current state.
    Snapshot(Snapshot),
    /// The known revision is ahead or evicted: resync from this state.
    Resync(Snapshot),
}

/// Everything a connection needs right after joining.
#[derive(Debug)]
pub struct JoinOutcome {
    /// Subscribed before the catch-up was computed: no event is missed.
    pub events: broadcast::Receiver<Arc<SessionEvent>>,
    pub revision: u64,
    pub catch_up: CatchUp,
    /// Presence of every other participant.
    pub presence: Vec<PresenceState>,
    pub comments: Vec<Comment>,
}

/// Cursor report from a participant.
#[derive(Debug, Clone, PartialEq)]
pub struct PresenceUpdate {
    pub participant_id: Uuid,
    pub cursor: usize,
    pub selection: Option<Selection>,
    /// Revision the offsets were composed at (`None` = current).
    pub revision: Option<u64>,
    pub label: Option<String>,
    pub color: Option<CursorColor>,
}

impl PresenceUpdate {
    pub fn cursor(participant_id: Uuid, cursor: usize) -> Self {
        Self {
            participant_id,
            cursor,
            selection: None,
            revision: None,
            label: None,
            color: None,
        }
    }
}

// ─── Commands ─────────────────────────────────────────────────────────

type Reply<T> = oneshot::Sender<Result<T, SessionError>>;

enum Command {
    Join {
        connection: ConnectionId,
        participant_id: Uuid,
        known_revision: Option<u64>,
        label: Option<String>,
        reply: Reply<JoinOutcome>,
    },
    Submit {
        connection: ConnectionId,
        op: Operation,
        reply: Reply<SubmitOutcome>,
    },
    Presence {
        connection: ConnectionId,
        update: PresenceUpdate,
    },
    Leave {
        connection: ConnectionId,
    },
    Snapshot {
        reply: Reply<Snapshot>,
    },
    Resubscribe {
        connection: ConnectionId,
        reply: Reply<JoinOutcome>,
    },
    AddComment {
        author: Uuid,
        revision: u64,
        anchor: Anchor,
        body: String,
        reply: Reply<Comment>,
    },
    ResolveComment {
        comment_id: Uuid,
        resolved: bool,
        reply: Reply<Comment>,
    },
    DeleteComment {
        comment_id: Uuid,
        reply: Reply<()>,
    },
    Unload {
        reply: Reply<()>,
    },
    Delete {
        reply: Reply<()>,
    },
}

impl Command {
    /// Answer a command that will never be processed.
    fn fail(self, err: SessionError) {
        match self {
            Command::Join { reply, .. } | Command::Resubscribe { reply, .. } => {
                let _ = reply.send(Err(err));
            }
            Command::Submit { reply, .. } => {
                let _ = reply.send(Err(err));
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(Err(err));
            }
            Command::AddComment { reply, .. } | Command::ResolveComment { reply, .. } => {
                let _ = reply.send(Err(err));
            }
            Command::DeleteComment { reply, .. }
            | Command::Unload { reply }
            | Command::Delete { reply } => {
                let _ = reply.send(Err(err));
            }
            Command::Presence { .. } | Command::Leave { .. } => {}
        }
    }
}

/// Why the actor loop stopped.
enum Shutdown {
    Idle,
    /// Every handle was dropped.
    Abandoned,
    Unload(Reply<()>),
    Delete(Reply<()>),
    PersistenceFailure,
}

// ─── Handle ───────────────────────────────────────────────────────────

/// Cloneable entry point to a running session.
#[derive(Clone)]
pub struct DocumentHandle {
    doc_id: Uuid,
    tx: mpsc::Sender<Command>,
    state: watch::Receiver<SessionState>,
}

impl DocumentHandle {
    pub fn doc_id(&self) -> Uuid {
        self.doc_id
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// True once the session stopped taking commands.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
            || matches!(self.state(), SessionState::Draining | SessionState::Unloaded)
    }

    /// Resolve once the session has fully stopped (final snapshot saved).
    pub async fn wait_unloaded(&self) {
        let mut state = self.state.clone();
        // A dropped sender means the task is gone, which is just as final.
        let _ = state.wait_for(|s| *s == SessionState::Unloaded).await;
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| SessionError::Unavailable)?;
        rx.await.map_err(|_| SessionError::Unavailable)?
    }

    pub async fn join(
        &self,
        connection: ConnectionId,
        participant_id: Uuid,
        known_revision: Option<u64>,
        label: Option<String>,
    ) -> Result<JoinOutcome, SessionError> {
        self.request(|reply| Command::Join {
            connection,
            participant_id,
            known_revision,
            label,
            reply,
        })
        .await
    }

    pub async fn submit(
        &self,
        connection: ConnectionId,
        op: Operation,
    ) -> Result<SubmitOutcome, SessionError> {
        self.request(|reply| Command::Submit {
            connection,
            op,
            reply,
        })
        .await
    }

    /// Fire-and-forget: presence is last-write-wins and never answered.
    pub async fn update_presence(
        &self,
        connection: ConnectionId,
        update: PresenceUpdate,
    ) -> Result<(), SessionError> {
        self.tx
            .send(Command::Presence { connection, update })
            .await
            .map_err(|_| SessionError::Unavailable)
    }

    pub async fn leave(&self, connection: ConnectionId) -> Result<(), SessionError> {
        self.tx
            .send(Command::Leave { connection })
            .await
            .map_err(|_| SessionError::Unavailable)
    }

    pub async fn snapshot(&self) -> Result<Snapshot, SessionError> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    /// Fresh subscription plus the full current state for an already
    /// joined connection. Events published before the returned snapshot
    /// are not delivered on the new receiver.
    pub async fn resubscribe(&self, connection: ConnectionId) -> Result<JoinOutcome, SessionError> {
        self.request(|reply| Command::Resubscribe { connection, reply })
            .await
    }

    /// Anchor a comment to `[anchor.start, anchor.end)` as of `revision`.
    pub async fn add_comment(
        &self,
        author: Uuid,
        revision: u64,
        anchor: Anchor,
        body: impl Into<String>,
    ) -> Result<Comment, SessionError> {
        let body = body.into();
        self.request(|reply| Command::AddComment {
            author,
            revision,
            anchor,
            body,
            reply,
        })
        .await
    }

    pub async fn resolve_comment(
        &self,
        comment_id: Uuid,
        resolved: bool,
    ) -> Result<Comment, SessionError> {
        self.request(|reply| Command::ResolveComment {
            comment_id,
            resolved,
            reply,
        })
        .await
    }

    pub async fn delete_comment(&self, comment_id: Uuid) -> Result<(), SessionError> {
        self.request(|reply| Command::DeleteComment { comment_id, reply })
            .await
    }

    /// Drain and unload. Resolves after the final snapshot is saved.
    pub async fn unload(&self) -> Result<(), SessionError> {
        self.request(|reply| Command::Unload { reply }).await
    }

    /// Drain and remove the document from the store.
    pub async fn delete(&self) -> Result<(), SessionError> {
        self.request(|reply| Command::Delete { reply }).await
    }
}

// ─── Actor ────────────────────────────────────────────────────────────

pub struct DocumentSession {
    doc: Document,
    history: History,
    presence: PresenceTracker,
    comments: CommentAnchors,
    /// Joined connections and the participant each one speaks for.
    connections: HashMap<ConnectionId, Uuid>,
    bus: EventBus,
    store: Arc<dyn SnapshotStore>,
    config: SessionConfig,
    state: watch::Sender<SessionState>,
    ops_since_snapshot: u64,
    idle_deadline: Option<Instant>,
}

impl DocumentSession {
    /// Start the actor for `doc_id`. Loading happens on the spawned task.
    pub fn spawn(
        doc_id: Uuid,
        store: Arc<dyn SnapshotStore>,
        config: SessionConfig,
    ) -> DocumentHandle {
        Self::spawn_with_counters(doc_id, store, config, Arc::default())
    }

    /// Like [`spawn`](Self::spawn), counting published events into `counters`.
    pub fn spawn_with_counters(
        doc_id: Uuid,
        store: Arc<dyn SnapshotStore>,
        config: SessionConfig,
        counters: Arc<BusCounters>,
    ) -> DocumentHandle {
        let (tx, rx) = mpsc::channel(config.command_capacity.max(1));
        let (state_tx, state_rx) = watch::channel(SessionState::Loading);

        tokio::spawn(async move {
            match restore(doc_id, store.as_ref(), &config) {
                Ok((doc, history, comments)) => {
                    let session = DocumentSession {
                        bus: EventBus::with_counters(config.broadcast_capacity, counters),
                        doc,
                        history,
                        presence: PresenceTracker::new(),
                        comments,
                        connections: HashMap::new(),
                        store,
                        idle_deadline: Some(Instant::now() + config.idle_timeout),
                        config,
                        state: state_tx,
                        ops_since_snapshot: 0,
                    };
                    session.run(rx).await;
                }
                Err(e) => {
                    log::error!("Failed to load doc {doc_id}: {e}");
                    state_tx.send_replace(SessionState::Unloaded);
                    let mut rx = rx;
                    rx.close();
                    while let Some(cmd) = rx.recv().await {
                        cmd.fail(SessionError::PersistenceFailure(e.to_string()));
                    }
                }
            }
        });

        DocumentHandle {
            doc_id,
            tx,
            state: state_rx,
        }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        self.state.send_replace(SessionState::Active);
        log::info!(
            "Loaded doc {} at rev {} ({} units, {} comments)",
            self.doc.id(),
            self.doc.revision(),
            self.doc.len(),
            self.comments.len()
        );

        let shutdown = loop {
            let deadline = self.idle_deadline;
            tokio::select! {
                cmd = rx.recv() => match cmd {
                    Some(cmd) => {
                        if let Some(shutdown) = self.handle(cmd) {
                            break shutdown;
                        }
                    }
                    None => break Shutdown::Abandoned,
                },
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    if self.connections.is_empty() {
                        break Shutdown::Idle;
                    }
                    self.idle_deadline = None;
                }
            }
        };

        self.drain(rx, shutdown).await;
    }

    fn handle(&mut self, cmd: Command) -> Option<Shutdown> {
        match cmd {
            Command::Join {
                connection,
                participant_id,
                known_revision,
                label,
                reply,
            } => {
                let _ = reply.send(self.join(connection, participant_id, known_revision, label));
            }
            Command::Submit {
                connection,
                op,
                reply,
            } => {
                let result = self.submit(connection, op);
                let fatal = matches!(result, Err(SessionError::PersistenceFailure(_)));
                let _ = reply.send(result);
                if fatal {
                    return Some(Shutdown::PersistenceFailure);
                }
            }
            Command::Presence { connection, update } => self.update_presence(connection, update),
            Command::Leave { connection } => self.leave(connection),
            Command::Snapshot { reply } => {
                let _ = reply.send(Ok(self.snapshot()));
            }
            Command::Resubscribe { connection, reply } => {
                let _ = reply.send(self.resubscribe(connection));
            }
            Command::AddComment {
                author,
                revision,
                anchor,
                body,
                reply,
            } => {
                let _ = reply.send(self.add_comment(author, revision, anchor, body));
            }
            Command::ResolveComment {
                comment_id,
                resolved,
                reply,
            } => {
                let _ = reply.send(self.resolve_comment(comment_id, resolved));
            }
            Command::DeleteComment { comment_id, reply } => {
                let _ = reply.send(self.delete_comment(comment_id));
            }
            Command::Unload { reply } => return Some(Shutdown::Unload(reply)),
            Command::Delete { reply } => return Some(Shutdown::Delete(reply)),
        }
        None
    }

    // ─── Participants ─────────────────────────────────────────────

    fn join(
        &mut self,
        connection: ConnectionId,
        participant_id: Uuid,
        known_revision: Option<u64>,
        label: Option<String>,
    ) -> Result<JoinOutcome, SessionError> {
        if !self.connections.contains_key(&connection)
            && self.connections.len() >= self.config.max_participants
        {
            log::warn!(
                "Rejecting {participant_id} on doc {}: {} connections",
                self.doc.id(),
                self.connections.len()
            );
            return Err(SessionError::DocumentFull);
        }

        let events = self.bus.subscribe();
        let revision = self.doc.revision();
        let catch_up = match known_revision {
            None => CatchUp::Snapshot(self.snapshot()),
            Some(known) if known == revision => CatchUp::UpToDate,
            Some(known) => match self.history.since(known).filter(|_| known < revision) {
                Some(ops) => CatchUp::Replay(ops.cloned().collect()),
                None => {
                    log::debug!(
                        "{participant_id} known rev {known} not replayable on doc {} (rev {revision})",
                        self.doc.id()
                    );
                    CatchUp::Resync(self.snapshot())
                }
            },
        };

        self.connections.insert(connection, participant_id);
        self.idle_deadline = None;

        let mut state = self
            .presence
            .get(&participant_id)
            .cloned()
            .unwrap_or_else(|| PresenceState::new(participant_id, None));
        if label.is_some() {
            state.label = label;
        }
        let state = self.presence.update(state, self.doc.len());
        self.bus.publish(SessionEvent::PresenceChanged(state));

        log::info!(
            "{participant_id} joined doc {} via {connection} at rev {revision}",
            self.doc.id()
        );

        Ok(JoinOutcome {
            events,
            revision,
            catch_up,
            presence: self.presence.others(&participant_id),
            comments: self.comments.to_vec(),
        })
    }

    fn resubscribe(&mut self, connection: ConnectionId) -> Result<JoinOutcome, SessionError> {
        let Some(participant_id) = self.connections.get(&connection).copied() else {
            return Err(SessionError::Unavailable);
        };
        let snapshot = self.snapshot();
        log::debug!(
            "Resubscribed {connection} on doc {} at rev {}",
            self.doc.id(),
            snapshot.revision
        );

        Ok(JoinOutcome {
            events: self.bus.subscribe(),
            revision: snapshot.revision,
            catch_up: CatchUp::Snapshot(snapshot),
            presence: self.presence.others(&participant_id),
            comments: self.comments.to_vec(),
        })
    }

    fn leave(&mut self, connection: ConnectionId) {
        let Some(participant_id) = self.connections.remove(&connection) else {
            return;
        };

        let still_connected = self.connections.values().any(|p| *p == participant_id);
        if !still_connected && self.presence.remove(&participant_id).is_some() {
            self.bus.publish(SessionEvent::PresenceLeft { participant_id });
        }
        if self.connections.is_empty() {
            self.idle_deadline = Some(Instant::now() + self.config.idle_timeout);
        }

        log::info!("{participant_id} left doc {} ({connection})", self.doc.id());
    }

    // ─── Operations ───────────────────────────────────────────────

    fn submit(
        &mut self,
        origin: ConnectionId,
        op: Operation,
    ) -> Result<SubmitOutcome, SessionError> {
        if op.doc_id() != self.doc.id() {
            return Err(SessionError::MalformedOperation(format!(
                "operation targets document {}",
                op.doc_id()
            )));
        }

        let participant = op.participant_id();
        if self.doc.versions().has_seen(&participant, op.seq()) {
            return match self.history.find(participant, op.seq()) {
                Some(canonical) => {
                    log::debug!(
                        "Duplicate op {participant}#{} on doc {} (rev {})",
                        op.seq(),
                        self.doc.id(),
                        canonical.revision()
                    );
                    Ok(SubmitOutcome::Duplicate {
                        revision: canonical.revision(),
                    })
                }
                None => Err(SessionError::ResyncRequired),
            };
        }

        let base = op.base_revision();
        if base > self.doc.revision() {
            return Err(SessionError::ResyncRequired);
        }

        let canonical = {
            let mut concurrent = self
                .history
                .since(base)
                .ok_or(SessionError::ResyncRequired)?
                .peekable();
            // Length of the document as the submitter saw it.
            let base_len = concurrent
                .peek()
                .map_or(self.doc.len(), |c| c.changes().len());

            let mut changes = op.changes().clone();
            changes.extend_to(base_len)?;
            transform_against(&op.rebased(changes, base), concurrent.map(|c| c.as_ref()))?
        };
        self.doc.check(&canonical)?;

        if let Err(e) = self.store.append_op_log(self.doc.id(), &canonical) {
            log::error!(
                "Failed to log op at rev {} on doc {}: {e}",
                canonical.revision(),
                self.doc.id()
            );
            return Err(e.into());
        }

        let revision = self.doc.apply(&canonical)?;
        let op = Arc::new(canonical);
        self.history.push(op.clone());
        self.presence.transform(op.changes());
        let orphaned = self.comments.transform(op.changes());

        log::debug!(
            "Applied {participant}#{} on doc {} as rev {revision} (base {base})",
            op.seq(),
            self.doc.id()
        );
        self.bus.publish(SessionEvent::Applied { op, origin });
        for comment in orphaned {
            self.bus.publish(SessionEvent::CommentChanged(comment));
        }

        self.ops_since_snapshot += 1;
        if self.config.snapshot_interval > 0
            && self.ops_since_snapshot >= self.config.snapshot_interval
        {
            self.checkpoint();
        }

        Ok(SubmitOutcome::Applied { revision })
    }

    fn update_presence(&mut self, connection: ConnectionId, update: PresenceUpdate) {
        match self.connections.get(&connection) {
            Some(participant) if *participant == update.participant_id => {}
            _ => {
                log::debug!("Ignoring presence from unjoined {connection}");
                return;
            }
        }

        let previous = self.presence.get(&update.participant_id);
        let mut state = PresenceState {
            participant_id: update.participant_id,
            cursor: update.cursor,
            selection: update.selection,
            color: update
                .color
                .or(previous.map(|p| p.color))
                .unwrap_or_else(|| CursorColor::from_uuid(update.participant_id)),
            label: update.label.or_else(|| previous.and_then(|p| p.label.clone())),
        };

        // Best effort: an evicted or future revision is clamped as-is.
        if let Some(ops) = update.revision.and_then(|rev| self.history.since(rev)) {
            for op in ops {
                state.map(op.changes());
            }
        }

        let state = self.presence.update(state, self.doc.len());
        self.bus.publish(SessionEvent::PresenceChanged(state));
    }

    /// Current state, as persisted.
    fn snapshot(&self) -> Snapshot {
        Snapshot {
            revision: self.doc.revision(),
            content: self.doc.content().to_string(),
            versions: self.doc.versions().clone(),
            comments: self.comments.to_vec(),
        }
    }

    /// Periodic snapshot. A failure here loses nothing: the op log still
    /// holds every operation since the last good snapshot.
    fn checkpoint(&mut self) {
        let doc_id = self.doc.id();
        let snapshot = self.snapshot();
        match self.store.save_snapshot(doc_id, &snapshot) {
            Ok(()) => {
                self.ops_since_snapshot = 0;
                match self.store.compact_op_log(doc_id, snapshot.revision) {
                    Ok(removed) => log::debug!(
                        "Snapshot of doc {doc_id} at rev {}, compacted {removed} ops",
                        snapshot.revision
                    ),
                    Err(e) => log::warn!("Failed to compact op log of doc {doc_id}: {e}"),
                }
            }
            Err(e) => log::error!(
                "Failed to snapshot doc {doc_id} at rev {}: {e}",
                snapshot.revision
            ),
        }
    }

    // ─── Comments ─────────────────────────────────────────────────

    fn add_comment(
        &mut self,
        author: Uuid,
        revision: u64,
        anchor: Anchor,
        body: String,
    ) -> Result<Comment, SessionError> {
        let mut since = self
            .history
            .since(revision)
            .ok_or(SessionError::ResyncRequired)?
            .peekable();
        let len_at = since.peek().map_or(self.doc.len(), |op| op.changes().len());
        if anchor.start > anchor.end || anchor.end > len_at {
            return Err(SessionError::MalformedOperation(format!(
                "comment anchor [{}, {}) outside document of {len_at} units",
                anchor.start, anchor.end
            )));
        }

        let mut comment = Comment::new(author, body, anchor, self.doc.revision());
        for op in since {
            comment.map(op.changes());
        }

        self.comments.insert(comment.clone());
        self.bus.publish(SessionEvent::CommentChanged(comment.clone()));
        log::debug!("Comment {} added to doc {}", comment.id, self.doc.id());
        Ok(comment)
    }

    fn resolve_comment(&mut self, comment_id: Uuid, resolved: bool) -> Result<Comment, SessionError> {
        let comment = self
            .comments
            .set_resolved(&comment_id, resolved)
            .cloned()
            .ok_or(SessionError::UnknownComment(comment_id))?;
        self.bus.publish(SessionEvent::CommentChanged(comment.clone()));
        Ok(comment)
    }

    fn delete_comment(&mut self, comment_id: Uuid) -> Result<(), SessionError> {
        self.comments
            .remove(&comment_id)
            .ok_or(SessionError::UnknownComment(comment_id))?;
        self.bus.publish(SessionEvent::CommentRemoved { comment_id });
        Ok(())
    }

    // ─── Shutdown ─────────────────────────────────────────────────

    async fn drain(self, mut rx: mpsc::Receiver<Command>, shutdown: Shutdown) {
        let doc_id = self.doc.id();
        self.state.send_replace(SessionState::Draining);

        let queued_err = match shutdown {
            Shutdown::Delete(_) => SessionError::Deleted,
            _ => SessionError::Unavailable,
        };
        rx.close();
        while let Some(cmd) = rx.recv().await {
            cmd.fail(queued_err.clone());
        }

        let (reason, reply) = match shutdown {
            Shutdown::Idle => (CloseReason::Idle, None),
            Shutdown::Abandoned => (CloseReason::Unloaded, None),
            Shutdown::Unload(reply) => (CloseReason::Unloaded, Some(reply)),
            Shutdown::Delete(reply) => (CloseReason::Deleted, Some(reply)),
            Shutdown::PersistenceFailure => (CloseReason::PersistenceFailure, None),
        };

        let result = match reason {
            CloseReason::Deleted => self.store.delete_document(doc_id).map_err(SessionError::from),
            // The store just failed a write; the op log is the source of truth.
            CloseReason::PersistenceFailure => Ok(()),
            CloseReason::Idle | CloseReason::Unloaded => self.save_final_snapshot(),
        };

        self.bus.publish(SessionEvent::Closed(reason));
        self.state.send_replace(SessionState::Unloaded);
        log::info!(
            "Unloaded doc {doc_id} at rev {} ({reason:?})",
            self.doc.revision()
        );

        if let Some(reply) = reply {
            let _ = reply.send(result);
        }
    }

    fn save_final_snapshot(&self) -> Result<(), SessionError> {
        let doc_id = self.doc.id();
        let snapshot = self.snapshot();
        if let Err(e) = self.store.save_snapshot(doc_id, &snapshot) {
            log::error!("Failed to save final snapshot of doc {doc_id}: {e}");
            return Err(e.into());
        }
        if let Err(e) = self.store.compact_op_log(doc_id, snapshot.revision) {
            log::warn!("Failed to compact op log of doc {doc_id}: {e}");
        }
        Ok(())
    }
}

/// Latest snapshot plus the op log written after it.
fn restore(
    doc_id: Uuid,
    store: &dyn SnapshotStore,
    config: &SessionConfig,
) -> Result<(Document, History, CommentAnchors), StoreError> {
    let snapshot = store.load_snapshot(doc_id)?.unwrap_or_else(Snapshot::empty);
    let tail = store.load_op_log_since(doc_id, snapshot.revision)?;

    let mut doc = Document::from_snapshot(doc_id, snapshot.content, snapshot.revision, snapshot.versions);
    let mut history = History::new(config.history_capacity, doc.revision());
    let mut comments = CommentAnchors::from_comments(snapshot.comments);

    for op in tail {
        doc.apply(&op).map_err(|e| {
            StoreError::Corrupted(format!("op log of doc {doc_id} at rev {}: {e}", op.revision()))
        })?;
        comments.transform(op.changes());
        history.push(Arc::new(op));
    }

    Ok((doc, history, comments))
}
