//! WebSocket sync client for connecting to the collaboration server.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect, reconnect with catch-up)
//! - The client half of the OT protocol ([`ClientDocument`])
//! - Presence updates, throttled client-side
//! - Comment and snapshot requests
//!
//! ## Client state machine
//!
//! At most one operation is in flight. Edits made while it is unacknowledged
//! are composed into a single buffered operation that goes out with the ack.
//!
//! ```text
//!                 local edit                    local edit
//! Synchronized ───────────────► AwaitingAck ─────────────────► AwaitingWithBuffer
//!      ▲          (send op)        │    ▲        (buffer)              │
//!      │                           │    │                              │
//!      └────────── op-ack ─────────┘    └──── op-ack (send buffer) ────┘
//! ```
//!
//! Remote operations are transformed against the pending and buffered
//! operations with the same insert tie-break the server uses, so every
//! replica converges on the canonical content.

use std::sync::Arc;
use futures_util::{SinkExt, StreamExt};
use quire_core::{insert_order, transform_changes, ChangeSet, OtError, Operation};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::comments::Comment;
use crate::presence::{CursorColor, PresenceState, PresenceThrottle, Selection};
use crate::protocol::{ClientMessage, ErrorCode, ProtocolError, ServerMessage};

// ───────────────────────────────────────────────────────────────────
// OT client state
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum ClientState {
    Synchronized,
    AwaitingAck { pending: Operation },
    AwaitingWithBuffer { pending: Operation, buffer: Operation },
}

/// What an incoming canonical operation did to the local replica.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteOutcome {
    /// A remote edit, transformed past local unacknowledged edits and
    /// applied. The change set is what the editor should apply.
    Applied(ChangeSet),
    /// Our own pending operation came back. Carries the buffered
    /// operation that must be sent next, if any.
    Acknowledged(Option<Operation>),
    /// Already reflected locally.
    Stale,
}

/// Local replica of one document plus its unacknowledged edits.
///
/// Pure state: no I/O. [`SyncClient`] drives it from the socket.
#[derive(Debug, Clone)]
pub struct ClientDocument {
    doc_id: Uuid,
    participant_id: Uuid,
    priority: u32,
    content: String,
    len: usize,
    revision: u64,
    next_seq: u64,
    synced: bool,
    state: ClientState,
}

impl ClientDocument {
    pub fn new(doc_id: Uuid, participant_id: Uuid) -> Self {
        Self {
            doc_id,
            participant_id,
            priority: 0,
            content: String::new(),
            len: 0,
            revision: 0,
            next_seq: 0,
            synced: false,
            state: ClientState::Synchronized,
        }
    }

    /// Same-offset insert priority stamped on every outgoing operation.
    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn doc_id(&self) -> Uuid {
        self.doc_id
    }

    pub fn participant_id(&self) -> Uuid {
        self.participant_id
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Last canonical revision reflected locally.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Revision to announce on join, once a snapshot has been received.
    pub fn known_revision(&self) -> Option<u64> {
        self.synced.then_some(self.revision)
    }

    /// Whether local edits are waiting on the server.
    pub fn has_pending(&self) -> bool {
        self.state != ClientState::Synchronized
    }

    /// The in-flight operation, to resend after a reconnect.
    ///
    /// Its base is the current local revision, so the server either
    /// recognises it as a duplicate or transforms it from there.
    pub fn pending(&self) -> Option<&Operation> {
        match &self.state {
            ClientState::Synchronized => None,
            ClientState::AwaitingAck { pending } | ClientState::AwaitingWithBuffer { pending, .. } => {
                Some(pending)
            }
        }
    }

    /// Apply a local edit.
    ///
    /// `changes` may stop short of the end of the document; the rest is
    /// retained. Returns the operation to send now, if any. Before the
    /// first snapshot nothing is sent: the edits are held and re-issued
    /// on top of it by [`reset`](Self::reset).
    pub fn local_edit(&mut self, mut changes: ChangeSet) -> Result<Option<Operation>, OtError> {
        changes.extend_to(self.len)?;
        if changes.is_noop() {
            return Ok(None);
        }

        let content = changes.apply(&self.content)?;
        let composed = match &self.state {
            ClientState::AwaitingWithBuffer { buffer, .. } => Some(buffer.changes().compose(&changes)?),
            _ => None,
        };

        self.content = content;
        self.len = changes.len_after();

        let state = std::mem::replace(&mut self.state, ClientState::Synchronized);
        let (state, outgoing) = match (state, composed) {
            (ClientState::Synchronized, _) => {
                let op = self.next_op(changes);
                let outgoing = self.synced.then(|| op.clone());
                (ClientState::AwaitingAck { pending: op }, outgoing)
            }
            (ClientState::AwaitingAck { pending }, _) => {
                let buffer = self.next_op(changes);
                (ClientState::AwaitingWithBuffer { pending, buffer }, None)
            }
            (ClientState::AwaitingWithBuffer { pending, buffer }, Some(composed)) => {
                let buffer = buffer.rebased(composed, self.revision);
                (ClientState::AwaitingWithBuffer { pending, buffer }, None)
            }
            (ClientState::AwaitingWithBuffer { .. }, None) => {
                return Err(OtError::MalformedOperation("buffer lost during compose".into()));
            }
        };
        self.state = state;
        Ok(outgoing)
    }

    fn next_op(&mut self, changes: ChangeSet) -> Operation {
        self.next_seq += 1;
        Operation::new(self.doc_id, self.participant_id, self.next_seq, self.revision, changes)
            .with_priority(self.priority)
    }

    /// The server made our pending operation canonical at `revision`.
    ///
    /// Returns [`RemoteOutcome::Acknowledged`] carrying the buffered
    /// operation to send next, if any. Acks at or below the local revision
    /// are [`RemoteOutcome::Stale`]. An ack past the local revision for
    /// anything other than the pending operation means the replica missed
    /// a canonical revision it has no content for: the caller should ask
    /// for a snapshot.
    pub fn server_ack(&mut self, revision: u64, seq: u64) -> Result<RemoteOutcome, OtError> {
        if revision <= self.revision {
            return Ok(RemoteOutcome::Stale);
        }
        let expected = self.revision + 1;
        if revision != expected || self.pending().map(Operation::seq) != Some(seq) {
            return Err(OtError::BaseRevisionMismatch { expected, found: revision });
        }

        self.revision = revision;
        let next = match std::mem::replace(&mut self.state, ClientState::Synchronized) {
            ClientState::AwaitingWithBuffer { buffer, .. } => {
                let next = buffer.rebased(buffer.changes().clone(), revision);
                self.state = ClientState::AwaitingAck { pending: next.clone() };
                Some(next)
            }
            ClientState::AwaitingAck { .. } | ClientState::Synchronized => None,
        };
        Ok(RemoteOutcome::Acknowledged(next))
    }

    /// Integrate a canonical operation broadcast by the server.
    ///
    /// Operations must arrive in revision order. A gap is an error: the
    /// caller should ask for a snapshot.
    pub fn apply_remote(&mut self, op: &Operation) -> Result<RemoteOutcome, OtError> {
        let revision = op.revision();
        if revision <= self.revision {
            return Ok(RemoteOutcome::Stale);
        }
        if op.participant_id() == self.participant_id
            && self.pending().map(Operation::seq) == Some(op.seq())
        {
            return self.server_ack(revision, op.seq());
        }
        if revision != self.revision + 1 {
            return Err(OtError::BaseRevisionMismatch {
                expected: self.revision + 1,
                found: revision,
            });
        }

        let remote = op.changes();
        let (rebased, applied) = match &self.state {
            ClientState::Synchronized => ((None, None), remote.clone()),
            ClientState::AwaitingAck { pending } => {
                let (p, r) = transform_changes(pending.changes(), remote, insert_order(pending, op))?;
                ((Some(p), None), r)
            }
            ClientState::AwaitingWithBuffer { pending, buffer } => {
                let (p, r) = transform_changes(pending.changes(), remote, insert_order(pending, op))?;
                let (b, r) = transform_changes(buffer.changes(), &r, insert_order(buffer, op))?;
                ((Some(p), Some(b)), r)
            }
        };
        let content = applied.apply(&self.content)?;

        self.content = content;
        self.len = applied.len_after();
        self.revision = revision;
        self.state = match (std::mem::replace(&mut self.state, ClientState::Synchronized), rebased) {
            (ClientState::AwaitingAck { pending }, (Some(p), _)) => ClientState::AwaitingAck {
                pending: pending.rebased(p, revision),
            },
            (ClientState::AwaitingWithBuffer { pending, buffer }, (Some(p), Some(b))) => {
                ClientState::AwaitingWithBuffer {
                    pending: pending.rebased(p, revision),
                    buffer: buffer.rebased(b, revision),
                }
            }
            _ => ClientState::Synchronized,
        };

        Ok(RemoteOutcome::Applied(applied))
    }

    /// Replace the replica with a server snapshot.
    ///
    /// Edits made before the first snapshot were never sent. They are
    /// re-issued as one fresh local edit on top of it, available from
    /// [`pending`](Self::pending). After that, unacknowledged edits may
    /// already be part of the snapshot and are dropped. Returns how many
    /// operations were discarded.
    pub fn reset(&mut self, revision: u64, content: String) -> usize {
        let (discarded, unsent) = match std::mem::replace(&mut self.state, ClientState::Synchronized) {
            ClientState::Synchronized => (0, None),
            ClientState::AwaitingAck { pending } => (1, Some(Ok(pending.changes().clone()))),
            ClientState::AwaitingWithBuffer { pending, buffer } => {
                (2, Some(pending.changes().compose(buffer.changes())))
            }
        };
        let first_sync = !self.synced;
        self.len = content.chars().count();
        self.content = content;
        self.revision = revision;
        self.synced = true;

        match unsent {
            Some(Ok(changes)) if first_sync => match self.local_edit(changes) {
                Ok(_) => 0,
                Err(e) => {
                    log::warn!("Offline edits do not fit snapshot at revision {revision}: {e}");
                    self.state = ClientState::Synchronized;
                    discarded
                }
            },
            _ => discarded,
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// WebSocket client
// ───────────────────────────────────────────────────────────────────

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// Connection established and join sent
    Connected,
    /// Connection lost
    Disconnected,
    /// A remote edit was applied to the local replica
    RemoteEdit {
        participant_id: Uuid,
        revision: u64,
        changes: ChangeSet,
    },
    /// Our operation became canonical
    Acknowledged { revision: u64, seq: u64 },
    /// The replica was replaced by a snapshot
    Resynced { revision: u64, discarded: usize },
    Presence(PresenceState),
    PresenceLeft(Uuid),
    Comment(Comment),
    CommentRemoved(Uuid),
    ServerError { code: ErrorCode, message: String },
    Pong,
}

/// The sync client.
///
/// Manages a WebSocket connection to the collaboration server and keeps a
/// [`ClientDocument`] in step with the canonical document.
pub struct SyncClient {
    participant_id: Uuid,

    /// Document we're editing
    doc_id: Uuid,

    label: Option<String>,

    color: Option<CursorColor>,

    /// Connection state
    state: Arc<RwLock<ConnectionState>>,

    /// Local replica and unacknowledged edits
    document: Arc<Mutex<ClientDocument>>,

    throttle: Mutex<PresenceThrottle>,

    /// Channel to send messages to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<ClientMessage>>,

    /// Event receiver for the application
    event_rx: Option<mpsc::Receiver<SyncEvent>>,

    /// Event sender (held by connection task)
    event_tx: mpsc::Sender<SyncEvent>,

    /// Server URL
    server_url: String,
}

impl SyncClient {
    /// Create a new sync client.
    pub fn new(participant_id: Uuid, doc_id: Uuid, server_url: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            participant_id,
            doc_id,
            label: None,
            color: None,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            document: Arc::new(Mutex::new(ClientDocument::new(doc_id, participant_id))),
            throttle: Mutex::new(PresenceThrottle::new()),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
            server_url: server_url.into(),
        }
    }

    /// Display name shown to other participants.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_color(mut self, color: CursorColor) -> Self {
        self.color = Some(color);
        self
    }

    pub fn with_presence_throttle(mut self, throttle: PresenceThrottle) -> Self {
        self.throttle = Mutex::new(throttle);
        self
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Connect (or reconnect) to the server.
    ///
    /// Joins the document announcing the last known revision, then resends
    /// the in-flight operation, if any. A client that never received a
    /// snapshot sends its offline edits once the first one arrives. Spawns background tasks for
    /// reading/writing WebSocket messages.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        {
            let mut state = self.state.write().await;
            *state = match *state {
                ConnectionState::Disconnected if self.outgoing_tx.is_some() => {
                    ConnectionState::Reconnecting
                }
                _ => ConnectionState::Connecting,
            };
        }

        let ws_stream = match tokio_tungstenite::connect_async(self.server_url.as_str()).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                *self.state.write().await = ConnectionState::Disconnected;
                log::warn!("Connection to {} failed: {e}", self.server_url);
                return Err(ProtocolError::from(e));
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Outgoing message channel
        let (out_tx, mut out_rx) = mpsc::channel::<ClientMessage>(256);
        self.outgoing_tx = Some(out_tx.clone());

        // Writer task: forward outgoing channel to WebSocket
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let text = match msg.encode() {
                    Ok(text) => text,
                    Err(e) => {
                        log::error!("Failed to encode outgoing message: {e}");
                        continue;
                    }
                };
                if ws_writer.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        // Join first: the server answers with catch-up before anything else
        let (known_revision, pending) = {
            let document = self.document.lock().await;
            let known_revision = document.known_revision();
            // Edits made before the first snapshot wait for it
            let pending = known_revision.and(document.pending().cloned());
            (known_revision, pending)
        };
        let join = ClientMessage::Join {
            doc_id: self.doc_id,
            participant_id: self.participant_id,
            known_revision,
            label: self.label.clone(),
        };
        out_tx
            .send(join)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)?;
        if let Some(op) = pending {
            log::info!("Resending pending op seq {} after reconnect", op.seq());
            out_tx
                .send(op_message(&op))
                .await
                .map_err(|_| ProtocolError::ConnectionClosed)?;
        }

        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(SyncEvent::Connected).await;

        // Reader task: process incoming WebSocket messages
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        let document = self.document.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => match ServerMessage::decode(text.as_str()) {
                        Ok(server_msg) => {
                            dispatch(server_msg, &document, &out_tx, &event_tx).await;
                        }
                        Err(e) => log::warn!("Dropping undecodable server frame: {e}"),
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            // Connection lost
            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(SyncEvent::Disconnected).await;
        });

        Ok(())
    }

    /// Apply a local edit and send it if nothing else is in flight.
    ///
    /// Works offline too: the edit stays pending and goes out on the next
    /// [`connect`](Self::connect).
    pub async fn edit(&self, changes: ChangeSet) -> Result<(), ProtocolError> {
        let outgoing = self.document.lock().await.local_edit(changes)?;
        match outgoing {
            Some(op) if self.is_connected().await => self.send(op_message(&op)).await,
            _ => Ok(()),
        }
    }

    /// Insert `text` at character offset `pos`.
    pub async fn insert(&self, pos: usize, text: &str) -> Result<(), ProtocolError> {
        let mut changes = ChangeSet::new();
        changes.retain(pos).insert(text);
        self.edit(changes).await
    }

    /// Delete `len` characters starting at `pos`.
    pub async fn delete(&self, pos: usize, len: usize) -> Result<(), ProtocolError> {
        let mut changes = ChangeSet::new();
        changes.retain(pos).delete(len);
        self.edit(changes).await
    }

    /// Send a cursor/selection update.
    ///
    /// Dropped silently when offline or when throttled. Offsets refer to
    /// the local replica, which may include unacknowledged edits; the
    /// server treats them as best effort.
    pub async fn update_presence(
        &self,
        cursor: usize,
        selection: Option<Selection>,
    ) -> Result<(), ProtocolError> {
        if !self.is_connected().await || !self.throttle.lock().await.should_send() {
            return Ok(());
        }

        let revision = self.document.lock().await.revision();
        self.send(ClientMessage::Presence {
            doc_id: self.doc_id,
            participant_id: self.participant_id,
            cursor,
            selection,
            revision: Some(revision),
            label: self.label.clone(),
            color: self.color,
        })
        .await
    }

    /// Ask for a fresh snapshot. Local unacknowledged edits are dropped
    /// when it arrives.
    pub async fn request_snapshot(&self) -> Result<(), ProtocolError> {
        self.send(ClientMessage::SnapshotRequest { doc_id: self.doc_id })
            .await
    }

    /// Comment on `[start, end)` of the current local revision.
    pub async fn add_comment(
        &self,
        start: usize,
        end: usize,
        body: impl Into<String>,
    ) -> Result<(), ProtocolError> {
        let revision = self.document.lock().await.revision();
        self.send(ClientMessage::CommentAdd {
            doc_id: self.doc_id,
            participant_id: self.participant_id,
            revision,
            start,
            end,
            body: body.into(),
        })
        .await
    }

    pub async fn resolve_comment(&self, comment_id: Uuid, resolved: bool) -> Result<(), ProtocolError> {
        self.send(ClientMessage::CommentResolve {
            doc_id: self.doc_id,
            comment_id,
            resolved,
        })
        .await
    }

    pub async fn delete_comment(&self, comment_id: Uuid) -> Result<(), ProtocolError> {
        self.send(ClientMessage::CommentDelete {
            doc_id: self.doc_id,
            comment_id,
        })
        .await
    }

    /// Send a ping to the server.
    pub async fn send_ping(&self) -> Result<(), ProtocolError> {
        self.send(ClientMessage::Ping).await
    }

    /// Leave the document and close the connection.
    pub async fn disconnect(&mut self) -> Result<(), ProtocolError> {
        if self.is_connected().await {
            self.send(ClientMessage::Leave {
                doc_id: self.doc_id,
                participant_id: self.participant_id,
            })
            .await?;
        }
        // Dropping the sender stops the writer task, which closes the socket
        self.outgoing_tx = None;
        *self.state.write().await = ConnectionState::Disconnected;
        Ok(())
    }

    async fn send(&self, msg: ClientMessage) -> Result<(), ProtocolError> {
        match self.outgoing_tx {
            Some(ref tx) => tx.send(msg).await.map_err(|_| ProtocolError::ConnectionClosed),
            None => Err(ProtocolError::ConnectionClosed),
        }
    }

    async fn is_connected(&self) -> bool {
        *self.state.read().await == ConnectionState::Connected
    }

    /// Get the current connection state.
    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Current local content, including unacknowledged edits.
    pub async fn content(&self) -> String {
        self.document.lock().await.content().to_string()
    }

    /// Last canonical revision reflected locally.
    pub async fn revision(&self) -> u64 {
        self.document.lock().await.revision()
    }

    pub async fn has_pending(&self) -> bool {
        self.document.lock().await.has_pending()
    }

    pub fn participant_id(&self) -> Uuid {
        self.participant_id
    }

    /// Get the document ID.
    pub fn doc_id(&self) -> Uuid {
        self.doc_id
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}

fn op_message(op: &Operation) -> ClientMessage {
    ClientMessage::Op {
        doc_id: op.doc_id(),
        participant_id: op.participant_id(),
        base_revision: op.base_revision(),
        seq: op.seq(),
        priority: op.priority(),
        primitives: op.changes().clone(),
    }
}

/// Handle one server frame on the reader task.
async fn dispatch(
    msg: ServerMessage,
    document: &Mutex<ClientDocument>,
    out_tx: &mpsc::Sender<ClientMessage>,
    event_tx: &mpsc::Sender<SyncEvent>,
) {
    let mut outgoing = None;
    let event = match msg {
        ServerMessage::OpAck { doc_id, revision, seq } => {
            let acked = document.lock().await.server_ack(revision, seq);
            match acked {
                Ok(RemoteOutcome::Acknowledged(next)) => {
                    outgoing = next.as_ref().map(op_message);
                    Some(SyncEvent::Acknowledged { revision, seq })
                }
                Ok(_) => None,
                Err(e) => {
                    log::warn!("Ack for seq {seq} at revision {revision} does not match ({e}), requesting snapshot");
                    outgoing = Some(ClientMessage::SnapshotRequest { doc_id });
                    None
                }
            }
        }
        ServerMessage::OpBroadcast {
            doc_id,
            revision,
            participant_id,
            seq,
            priority,
            primitives,
        } => {
            let op = Operation::new(doc_id, participant_id, seq, revision.saturating_sub(1), primitives)
                .with_priority(priority);
            let outcome = document.lock().await.apply_remote(&op);
            match outcome {
                Ok(RemoteOutcome::Applied(changes)) => Some(SyncEvent::RemoteEdit {
                    participant_id,
                    revision,
                    changes,
                }),
                Ok(RemoteOutcome::Acknowledged(next)) => {
                    outgoing = next.as_ref().map(op_message);
                    Some(SyncEvent::Acknowledged { revision, seq })
                }
                Ok(RemoteOutcome::Stale) => None,
                Err(e) => {
                    log::warn!("Cannot integrate revision {revision} ({e}), requesting snapshot");
                    outgoing = Some(ClientMessage::SnapshotRequest { doc_id });
                    None
                }
            }
        }
        ServerMessage::ResyncRequired { doc_id } => {
            log::info!("Server requested resync of doc {doc_id}");
            None
        }
        ServerMessage::Snapshot { revision, content, .. } => {
            let mut document = document.lock().await;
            let discarded = document.reset(revision, content);
            if discarded > 0 {
                log::warn!("Discarded {discarded} unacknowledged ops on resync");
            }
            if let Some(op) = document.pending() {
                log::info!("Sending offline edits as seq {} on revision {revision}", op.seq());
                outgoing = Some(op_message(op));
            }
            Some(SyncEvent::Resynced { revision, discarded })
        }
        ServerMessage::PresenceUpdate {
            participant_id,
            cursor,
            selection,
            color,
            label,
            ..
        } => Some(SyncEvent::Presence(PresenceState {
            participant_id,
            cursor,
            selection,
            color,
            label,
        })),
        ServerMessage::PresenceLeft { participant_id, .. } => Some(SyncEvent::PresenceLeft(participant_id)),
        ServerMessage::CommentUpdate { comment, .. } => Some(SyncEvent::Comment(comment)),
        ServerMessage::CommentRemoved { comment_id, .. } => Some(SyncEvent::CommentRemoved(comment_id)),
        ServerMessage::Error { code, message } => {
            log::warn!("Server error {code}: {message}");
            Some(SyncEvent::ServerError { code, message })
        }
        ServerMessage::Pong => Some(SyncEvent::Pong),
    };

    if let Some(msg) = outgoing {
        let _ = out_tx.send(msg).await;
    }
    if let Some(evt) = event {
        let _ = event_tx.send(evt).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quire_core::{transform_against, Document};

    fn insert_at(pos: usize, text: &str) -> ChangeSet {
        let mut changes = ChangeSet::new();
        changes.retain(pos).insert(text);
        changes
    }

    fn delete_at(pos: usize, len: usize) -> ChangeSet {
        let mut changes = ChangeSet::new();
        changes.retain(pos).delete(len);
        changes
    }

    fn synced(doc: Uuid, content: &str, revision: u64) -> ClientDocument {
        let mut client = ClientDocument::new(doc, Uuid::new_v4());
        client.reset(revision, content.to_string());
        client
    }

    /// Minimal stand-in for the session's submit pipeline.
    struct Server {
        doc: Document,
        log: Vec<Operation>,
    }

    impl Server {
        fn new(id: Uuid) -> Self {
            Self {
                doc: Document::new(id),
                log: Vec::new(),
            }
        }

        fn submit(&mut self, op: &Operation) -> Operation {
            let mut op = op.clone();
            let mut changes = op.changes().clone();
            let base_len = match self.log.get(op.base_revision() as usize) {
                Some(later) => later.changes().len(),
                None => self.doc.len(),
            };
            changes.extend_to(base_len).unwrap();
            op = op.rebased(changes, op.base_revision());
            let canonical =
                transform_against(&op, &self.log[op.base_revision() as usize..]).unwrap();
            self.doc.apply(&canonical).unwrap();
            self.log.push(canonical.clone());
            canonical
        }
    }

    #[test]
    fn test_edit_buffering_and_ack() {
        let doc = Uuid::new_v4();
        let mut client = synced(doc, "", 0);

        let first = client.local_edit(insert_at(0, "a")).unwrap().unwrap();
        assert_eq!(first.seq(), 1);
        assert_eq!(first.base_revision(), 0);

        // In flight: later edits are composed into one buffer
        assert!(client.local_edit(insert_at(1, "b")).unwrap().is_none());
        assert!(client.local_edit(insert_at(2, "c")).unwrap().is_none());
        assert_eq!(client.content(), "abc");

        let next = match client.server_ack(1, 1).unwrap() {
            RemoteOutcome::Acknowledged(Some(next)) => next,
            other => panic!("Expected ack with buffered op, got {other:?}"),
        };
        assert_eq!(next.seq(), 2);
        assert_eq!(next.base_revision(), 1);
        assert_eq!(next.changes().apply("a").unwrap(), "abc");

        assert_eq!(client.server_ack(2, 2).unwrap(), RemoteOutcome::Acknowledged(None));
        assert_eq!(client.server_ack(2, 2).unwrap(), RemoteOutcome::Stale);
        assert!(!client.has_pending());
        assert_eq!(client.revision(), 2);
    }

    #[test]
    fn test_noop_edit_is_not_sent() {
        let mut client = synced(Uuid::new_v4(), "abc", 3);
        assert!(client.local_edit(ChangeSet::new()).unwrap().is_none());
        assert!(!client.has_pending());
    }

    #[test]
    fn test_edit_past_end_is_rejected() {
        let mut client = synced(Uuid::new_v4(), "abc", 3);
        assert!(client.local_edit(delete_at(2, 5)).is_err());
        assert_eq!(client.content(), "abc");
        assert!(!client.has_pending());
    }

    #[test]
    fn test_remote_op_transformed_past_pending() {
        let doc = Uuid::new_v4();
        let mut client = synced(doc, "ab", 1);
        client.local_edit(insert_at(0, "X")).unwrap();

        let remote = Operation::new(doc, Uuid::new_v4(), 1, 1, insert_at(2, "Y"));
        let outcome = client.apply_remote(&remote).unwrap();

        assert_eq!(outcome, RemoteOutcome::Applied(insert_at(3, "Y")));
        assert_eq!(client.content(), "XabY");
        assert_eq!(client.revision(), 2);
        let pending = client.pending().unwrap();
        assert_eq!(pending.base_revision(), 2);
        assert_eq!(pending.changes().apply("abY").unwrap(), "XabY");
    }

    #[test]
    fn test_own_broadcast_counts_as_ack() {
        let doc = Uuid::new_v4();
        let mut client = synced(doc, "", 0);
        let op = client.local_edit(insert_at(0, "hi")).unwrap().unwrap();
        client.local_edit(insert_at(2, "!")).unwrap();

        let echoed = Operation::new(doc, client.participant_id(), op.seq(), 0, op.changes().clone());
        match client.apply_remote(&echoed).unwrap() {
            RemoteOutcome::Acknowledged(Some(next)) => assert_eq!(next.base_revision(), 1),
            other => panic!("Expected ack with buffered op, got {other:?}"),
        }
        assert_eq!(client.content(), "hi!");
    }

    #[test]
    fn test_stale_and_gapped_broadcasts() {
        let doc = Uuid::new_v4();
        let mut client = synced(doc, "abc", 5);
        let peer = Uuid::new_v4();

        let stale = Operation::new(doc, peer, 1, 4, insert_at(0, "x"));
        assert_eq!(client.apply_remote(&stale).unwrap(), RemoteOutcome::Stale);

        let gapped = Operation::new(doc, peer, 2, 7, insert_at(0, "x"));
        assert!(matches!(
            client.apply_remote(&gapped),
            Err(OtError::BaseRevisionMismatch { expected: 6, found: 8 })
        ));
        assert_eq!(client.content(), "abc");
    }

    #[test]
    fn test_reset_discards_pending() {
        let doc = Uuid::new_v4();
        let mut client = synced(doc, "", 0);
        assert_eq!(client.known_revision(), Some(0));
        client.local_edit(insert_at(0, "a")).unwrap();
        client.local_edit(insert_at(1, "b")).unwrap();

        assert_eq!(client.reset(9, "server".into()), 2);
        assert_eq!(client.content(), "server");
        assert_eq!(client.len(), 6);
        assert_eq!(client.revision(), 9);
        assert!(!client.has_pending());

        // Sequence numbers keep increasing after a reset
        let op = client.local_edit(insert_at(0, "c")).unwrap().unwrap();
        assert_eq!(op.seq(), 3);
    }

    #[test]
    fn test_ack_for_discarded_op_requires_snapshot() {
        let doc = Uuid::new_v4();
        let mut client = synced(doc, "abc", 4);
        let lost = client.local_edit(insert_at(0, "x")).unwrap().unwrap();

        // Snapshot taken before the server applied the in-flight op
        assert_eq!(client.reset(4, "abc".into()), 1);
        assert!(matches!(
            client.server_ack(5, lost.seq()),
            Err(OtError::BaseRevisionMismatch { expected: 5, found: 5 })
        ));
        assert_eq!(client.revision(), 4);

        // No pending op at all: an ack ahead of the replica is still a gap
        let mut idle = synced(doc, "abc", 4);
        assert!(idle.server_ack(5, 1).is_err());
        assert_eq!(idle.server_ack(4, 1).unwrap(), RemoteOutcome::Stale);
    }

    #[test]
    fn test_ack_for_older_seq_does_not_acknowledge_pending() {
        let doc = Uuid::new_v4();
        let mut client = synced(doc, "", 0);
        let first = client.local_edit(insert_at(0, "a")).unwrap().unwrap();
        client.reset(0, String::new());
        let second = client.local_edit(insert_at(0, "b")).unwrap().unwrap();
        assert_ne!(first.seq(), second.seq());

        assert!(client.server_ack(1, first.seq()).is_err());
        assert_eq!(client.pending(), Some(&second));
    }

    #[test]
    fn test_own_broadcast_for_discarded_op_is_applied() {
        let doc = Uuid::new_v4();
        let mut client = synced(doc, "abc", 2);
        let lost = client.local_edit(insert_at(3, "!")).unwrap().unwrap();
        client.reset(2, "abc".into());

        // Echoed from another connection of the same participant
        let echoed = Operation::new(doc, client.participant_id(), lost.seq(), 2, lost.changes().clone());
        assert_eq!(client.apply_remote(&echoed).unwrap(), RemoteOutcome::Applied(insert_at(3, "!")));
        assert_eq!(client.content(), "abc!");
        assert_eq!(client.revision(), 3);
    }

    #[test]
    fn test_offline_edits_replayed_on_first_snapshot() {
        let doc = Uuid::new_v4();
        let mut client = ClientDocument::new(doc, Uuid::new_v4());

        // Held until the first snapshot
        assert!(client.local_edit(insert_at(0, "draft")).unwrap().is_none());
        assert!(client.local_edit(insert_at(5, "!")).unwrap().is_none());
        assert_eq!(client.known_revision(), None);

        assert_eq!(client.reset(3, "hello".into()), 0);
        assert_eq!(client.content(), "draft!hello");
        assert_eq!(client.known_revision(), Some(3));

        let op = client.pending().unwrap().clone();
        assert_eq!(op.base_revision(), 3);
        assert_eq!(op.seq(), 3);
        assert_eq!(op.changes().apply("hello").unwrap(), "draft!hello");

        assert_eq!(client.server_ack(4, op.seq()).unwrap(), RemoteOutcome::Acknowledged(None));
        assert!(!client.has_pending());
    }

    #[test]
    fn test_unsynced_client_announces_no_revision() {
        let client = ClientDocument::new(Uuid::new_v4(), Uuid::new_v4());
        assert_eq!(client.known_revision(), None);
        assert!(client.is_empty());
    }

    #[test]
    fn test_two_clients_converge_with_server() {
        let doc = Uuid::new_v4();
        let mut server = Server::new(doc);
        let mut alice = synced(doc, "", 0);
        let mut bob = synced(doc, "", 0);

        // Concurrent inserts at the same offset plus a buffered edit
        let a1 = alice.local_edit(insert_at(0, "alice")).unwrap().unwrap();
        alice.local_edit(delete_at(0, 1)).unwrap();
        let b1 = bob.local_edit(insert_at(0, "bob")).unwrap().unwrap();

        let c1 = server.submit(&b1);
        let c2 = server.submit(&a1);

        assert!(matches!(bob.apply_remote(&c1).unwrap(), RemoteOutcome::Acknowledged(None)));
        let a2 = match alice.apply_remote(&c1).unwrap() {
            RemoteOutcome::Applied(_) => match alice.server_ack(c2.revision(), c2.seq()).unwrap() {
                RemoteOutcome::Acknowledged(Some(next)) => next,
                other => panic!("Expected ack with buffered op, got {other:?}"),
            },
            other => panic!("Expected remote apply, got {other:?}"),
        };
        bob.apply_remote(&c2).unwrap();

        let c3 = server.submit(&a2);
        assert!(matches!(alice.apply_remote(&c3).unwrap(), RemoteOutcome::Acknowledged(None)));
        bob.apply_remote(&c3).unwrap();

        assert_eq!(alice.content(), server.doc.content());
        assert_eq!(bob.content(), server.doc.content());
        assert_eq!(alice.revision(), 3);
        assert_eq!(bob.revision(), 3);
    }

    #[test]
    fn test_sync_client_creation() {
        let participant = Uuid::new_v4();
        let doc = Uuid::new_v4();
        let client = SyncClient::new(participant, doc, "ws://localhost:9090").with_label("alice");

        assert_eq!(client.participant_id(), participant);
        assert_eq!(client.doc_id(), doc);
        assert_eq!(client.server_url(), "ws://localhost:9090");
    }

    #[tokio::test]
    async fn test_initial_state() {
        let client = SyncClient::new(Uuid::new_v4(), Uuid::new_v4(), "ws://localhost:9090");
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
        assert_eq!(client.revision().await, 0);
        assert_eq!(client.content().await, "");
    }

    #[tokio::test]
    async fn test_offline_edits_stay_pending() {
        let client = SyncClient::new(Uuid::new_v4(), Uuid::new_v4(), "ws://localhost:9090");

        client.insert(0, "draft").await.unwrap();
        client.delete(0, 1).await.unwrap();

        assert_eq!(client.content().await, "raft");
        assert!(client.has_pending().await);
        assert!(client.update_presence(2, None).await.is_ok());
        assert!(matches!(client.send_ping().await, Err(ProtocolError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_take_event_rx() {
        let mut client = SyncClient::new(Uuid::new_v4(), Uuid::new_v4(), "ws://localhost:9090");

        let rx = client.take_event_rx();
        assert!(rx.is_some());

        // Second take returns None
        let rx2 = client.take_event_rx();
        assert!(rx2.is_none());
    }
}
