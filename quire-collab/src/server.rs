//! WebSocket sync server: the connection manager.
//!
//! Architecture:
//! ```text
//! Client A ──┐                         ┌── DocumentSession (doc 1) ── SnapshotStore
//!             ├── connection tasks ────┤
//! Client B ──┘   (one per socket)      └── DocumentSession (doc 2) ── SnapshotStore
//!                      ▲                          │
//!                      └──── EventBus (Applied, presence, comments, Closed)
//! ```
//!
//! Each connection task:
//! - decodes JSON text frames into [`ClientMessage`]s and forwards them to
//!   its document's session,
//! - turns session events into `op-ack` / `op-broadcast` / presence /
//!   comment frames, skipping anything at or below the last revision it
//!   already sent,
//! - answers a lagging event receiver with `resync-required` + `snapshot`
//!   on a fresh subscription,
//! - pings the client every `heartbeat_interval_secs`.

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use quire_core::Operation;

use crate::broadcast::{CloseReason, ConnectionId, SessionEvent};
use crate::comments::Anchor;
use crate::protocol::{ClientMessage, ErrorCode, ProtocolError, ServerMessage};
use crate::registry::DocumentRegistry;
use crate::session::{
    CatchUp, DocumentHandle, JoinOutcome, PresenceUpdate, SessionConfig, SessionError,
    SubmitOutcome,
};
use crate::storage::{DocumentStore, MemoryStore, SnapshotStore, StoreConfig, StoreError};

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type EventRx = broadcast::Receiver<Arc<SessionEvent>>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum connections per document
    pub max_participants_per_document: usize,
    /// Event bus capacity per document
    pub broadcast_capacity: usize,
    /// Heartbeat interval in seconds
    pub heartbeat_interval_secs: u64,
    /// Largest accepted text frame in bytes
    pub max_message_bytes: usize,
    /// Persistence storage path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
    /// Session tuning. `max_participants_per_document` and
    /// `broadcast_capacity` above take precedence over the same fields here.
    pub session: SessionConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_participants_per_document: 100,
            broadcast_capacity: 256,
            heartbeat_interval_secs: 30,
            max_message_bytes: 1024 * 1024,
            storage_path: None,
            session: SessionConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Ephemeral port, in-memory store, test session limits.
    pub fn for_testing() -> Self {
        let session = SessionConfig::for_testing();
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            max_participants_per_document: session.max_participants,
            broadcast_capacity: session.broadcast_capacity,
            heartbeat_interval_secs: 30,
            max_message_bytes: 64 * 1024,
            storage_path: None,
            session,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_documents: usize,
    pub protocol_violations: u64,
    pub lagged_resyncs: u64,
    /// Session events published across every document
    pub events_published: u64,
    /// Session events published while no connection was listening
    pub events_undelivered: u64,
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    registry: Arc<DocumentRegistry>,
    /// Server-wide statistics
    stats: Arc<RwLock<ServerStats>>,
    next_connection: Arc<AtomicU64>,
}

impl SyncServer {
    /// Create a server, opening the RocksDB store if `storage_path` is set.
    pub fn new(config: ServerConfig) -> Result<Self, StoreError> {
        let store: Arc<dyn SnapshotStore> = match &config.storage_path {
            Some(path) => Arc::new(DocumentStore::open(StoreConfig {
                path: path.clone(),
                ..StoreConfig::default()
            })?),
            None => Arc::new(MemoryStore::new()),
        };
        Ok(Self::with_store(config, store))
    }

    /// Create a server over an already opened store.
    pub fn with_store(config: ServerConfig, store: Arc<dyn SnapshotStore>) -> Self {
        let mut session = config.session.clone();
        session.max_participants = config.max_participants_per_document;
        session.broadcast_capacity = config.broadcast_capacity;

        Self {
            registry: Arc::new(DocumentRegistry::new(store, session)),
            config,
            stats: Arc::new(RwLock::new(ServerStats::default())),
            next_connection: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Create with default configuration (in-memory, no persistence).
    pub fn with_defaults() -> Self {
        Self::with_store(ServerConfig::default(), Arc::new(MemoryStore::new()))
    }

    /// Bind `bind_addr` and serve until the listener fails.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Sync server listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(
        &self,
        listener: TcpListener,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let mut reaper = tokio::time::interval(
            self.config.session.idle_timeout.max(Duration::from_secs(1)),
        );

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, addr) = accepted?;
                    log::debug!("New TCP connection from {addr}");

                    let id = ConnectionId(self.next_connection.fetch_add(1, Ordering::Relaxed));
                    let connection = Connection::new(
                        id,
                        addr,
                        self.registry.clone(),
                        self.stats.clone(),
                    );
                    let config = self.config.clone();

                    tokio::spawn(async move {
                        if let Err(e) = connection.run(stream, config).await {
                            log::error!("Connection error from {addr}: {e}");
                        }
                    });
                }
                _ = reaper.tick() => {
                    let reaped = self.registry.reap().await;
                    if reaped > 0 {
                        log::debug!("Reaped {reaped} unloaded sessions");
                    }
                }
            }
        }
    }

    /// Unload every document, saving final snapshots.
    pub async fn shutdown(&self) {
        for (doc_id, e) in self.registry.unload_all().await {
            log::error!("Failed to unload doc {doc_id}: {e}");
        }
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.stats.read().await.clone();
        stats.active_documents = self.registry.document_count().await;
        let bus = self.registry.bus_stats();
        stats.events_published = bus.events_published;
        stats.events_undelivered = bus.events_undelivered;
        stats
    }

    pub async fn connection_count(&self) -> u64 {
        self.stats.read().await.active_connections
    }

    pub async fn document_count(&self) -> usize {
        self.registry.document_count().await
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn registry(&self) -> &Arc<DocumentRegistry> {
        &self.registry
    }
}

// ─── Connection task ──────────────────────────────────────────────────

enum Flow {
    Continue,
    Close,
}

struct Joined {
    doc_id: Uuid,
    participant_id: Uuid,
    handle: DocumentHandle,
}

/// State of one client connection.
struct Connection {
    id: ConnectionId,
    addr: SocketAddr,
    registry: Arc<DocumentRegistry>,
    stats: Arc<RwLock<ServerStats>>,
    joined: Option<Joined>,
    /// Receiver from a join handled in the current message.
    subscribed: Option<EventRx>,
    /// Highest revision sent as `op-ack`, `op-broadcast` or `snapshot`.
    last_sent: u64,
    /// Revisions of our own re-sent ops that must go out as `op-ack`.
    deferred_acks: BTreeSet<u64>,
}

impl Connection {
    fn new(
        id: ConnectionId,
        addr: SocketAddr,
        registry: Arc<DocumentRegistry>,
        stats: Arc<RwLock<ServerStats>>,
    ) -> Self {
        Self {
            id,
            addr,
            registry,
            stats,
            joined: None,
            subscribed: None,
            last_sent: 0,
            deferred_acks: BTreeSet::new(),
        }
    }

    async fn run(
        mut self,
        stream: TcpStream,
        config: ServerConfig,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut sink, mut ws_receiver) = ws_stream.split();
        let addr = self.addr;

        log::info!("WebSocket connection {} established from {addr}", self.id);

        {
            let mut s = self.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let period = Duration::from_secs(config.heartbeat_interval_secs.max(1));
        let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        let mut events: Option<EventRx> = None;

        let result = loop {
            let flow = tokio::select! {
                // Incoming WebSocket message
                msg = ws_receiver.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        let text = text.as_str();
                        {
                            let mut s = self.stats.write().await;
                            s.total_messages += 1;
                            s.total_bytes += text.len() as u64;
                        }
                        if text.len() > config.max_message_bytes {
                            self.violation(&mut sink, format!("message of {} bytes", text.len())).await
                        } else {
                            match ClientMessage::decode(text) {
                                Ok(msg) => self.handle_message(msg, &mut sink).await,
                                Err(e) => self.violation(&mut sink, e.to_string()).await,
                            }
                        }
                    }
                    Some(Ok(Message::Binary(_))) => {
                        self.violation(&mut sink, "binary frames are not supported".to_string()).await
                    }
                    Some(Ok(Message::Ping(data))) => {
                        sink.send(Message::Pong(data)).await.map(|_| Flow::Continue).map_err(ProtocolError::from)
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        log::info!("Connection {} closed from {addr}", self.id);
                        Ok(Flow::Close)
                    }
                    Some(Ok(_)) => Ok(Flow::Continue),
                    Some(Err(e)) => {
                        log::warn!("WebSocket error from {addr}: {e}");
                        Ok(Flow::Close)
                    }
                },

                // Session events
                event = async {
                    match events.as_mut() {
                        Some(rx) => rx.recv().await,
                        // Not joined yet: wait forever
                        None => std::future::pending().await,
                    }
                } => match event {
                    Ok(event) => self.forward(&event, &mut sink).await,
                    Err(RecvError::Lagged(n)) => {
                        log::warn!("{} lagged by {n} events, resyncing", self.id);
                        self.stats.write().await.lagged_resyncs += 1;
                        self.send_state(true, &mut sink).await
                    }
                    Err(RecvError::Closed) => Ok(Flow::Close),
                },

                _ = heartbeat.tick() => {
                    sink.send(Message::Ping(Vec::new().into())).await.map(|_| Flow::Continue).map_err(ProtocolError::from)
                }
            };

            if let Some(rx) = self.subscribed.take() {
                events = Some(rx);
            } else if self.joined.is_none() {
                events = None;
            }

            match flow {
                Ok(Flow::Continue) => {}
                Ok(Flow::Close) => break Ok(()),
                Err(e) => break Err(e),
            }
        };

        // Cleanup: leave the document
        if let Some(joined) = self.joined.take() {
            let _ = joined.handle.leave(self.id).await;
        }
        let _ = sink.close().await;

        {
            let mut s = self.stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
        }

        result.map_err(Into::into)
    }

    async fn handle_message(
        &mut self,
        msg: ClientMessage,
        sink: &mut WsSink,
    ) -> Result<Flow, ProtocolError> {
        let (doc_id, participant_id, handle) = match msg {
            ClientMessage::Ping => {
                send(sink, &ServerMessage::Pong).await?;
                return Ok(Flow::Continue);
            }
            ClientMessage::Join {
                doc_id,
                participant_id,
                known_revision,
                label,
            } => return self.join(doc_id, participant_id, known_revision, label, sink).await,
            ref other => match self.check_joined(other) {
                Ok(joined) => joined,
                Err(reason) => return self.violation(sink, reason).await,
            },
        };

        match msg {
            ClientMessage::Op {
                base_revision,
                seq,
                priority,
                primitives,
                ..
            } => {
                let op = Operation::new(doc_id, participant_id, seq, base_revision, primitives)
                    .with_priority(priority);
                match handle.submit(self.id, op).await {
                    Ok(SubmitOutcome::Applied { .. }) => Ok(Flow::Continue),
                    Ok(SubmitOutcome::Duplicate { revision }) => {
                        if revision > self.last_sent {
                            self.deferred_acks.insert(revision);
                        } else {
                            log::debug!(
                                "{} re-sent op already delivered at rev {revision}",
                                self.id
                            );
                        }
                        Ok(Flow::Continue)
                    }
                    Err(e) => self.session_error(e, sink).await,
                }
            }

            ClientMessage::Presence {
                cursor,
                selection,
                revision,
                label,
                color,
                ..
            } => {
                let update = PresenceUpdate {
                    participant_id,
                    cursor,
                    selection,
                    revision,
                    label,
                    color,
                };
                match handle.update_presence(self.id, update).await {
                    Ok(()) => Ok(Flow::Continue),
                    Err(e) => self.session_error(e, sink).await,
                }
            }

            ClientMessage::SnapshotRequest { .. } => self.send_state(false, sink).await,

            ClientMessage::CommentAdd {
                revision,
                start,
                end,
                body,
                ..
            } => {
                let anchor = Anchor::new(start, end);
                match handle.add_comment(participant_id, revision, anchor, body).await {
                    Ok(_) => Ok(Flow::Continue),
                    Err(e) => self.session_error(e, sink).await,
                }
            }

            ClientMessage::CommentResolve {
                comment_id,
                resolved,
                ..
            } => match handle.resolve_comment(comment_id, resolved).await {
                Ok(_) => Ok(Flow::Continue),
                Err(e) => self.session_error(e, sink).await,
            },

            ClientMessage::CommentDelete { comment_id, .. } => {
                match handle.delete_comment(comment_id).await {
                    Ok(()) => Ok(Flow::Continue),
                    Err(e) => self.session_error(e, sink).await,
                }
            }

            ClientMessage::Leave { .. } => {
                let _ = handle.leave(self.id).await;
                self.joined = None;
                self.deferred_acks.clear();
                log::info!("{participant_id} left doc {doc_id} ({})", self.id);
                Ok(Flow::Continue)
            }

            ClientMessage::Join { .. } | ClientMessage::Ping => Ok(Flow::Continue),
        }
    }

    /// The joined document, if `msg` targets it on behalf of the joined participant.
    fn check_joined(&self, msg: &ClientMessage) -> Result<(Uuid, Uuid, DocumentHandle), String> {
        let Some(joined) = &self.joined else {
            return Err("message before join".to_string());
        };
        if msg.doc_id() != Some(joined.doc_id) {
            return Err(format!("message for a document other than {}", joined.doc_id));
        }

        let participant = match msg {
            ClientMessage::Op { participant_id, .. }
            | ClientMessage::Presence { participant_id, .. }
            | ClientMessage::CommentAdd { participant_id, .. }
            | ClientMessage::Leave { participant_id, .. } => Some(*participant_id),
            _ => None,
        };
        if participant.is_some_and(|p| p != joined.participant_id) {
            return Err("message on behalf of another participant".to_string());
        }

        Ok((joined.doc_id, joined.participant_id, joined.handle.clone()))
    }

    async fn join(
        &mut self,
        doc_id: Uuid,
        participant_id: Uuid,
        known_revision: Option<u64>,
        label: Option<String>,
        sink: &mut WsSink,
    ) -> Result<Flow, ProtocolError> {
        if let Some(previous) = self.joined.take() {
            let _ = previous.handle.leave(self.id).await;
            self.deferred_acks.clear();
        }

        let mut retried = false;
        let (handle, outcome) = loop {
            let handle = self.registry.get_or_spawn(doc_id).await;
            match handle
                .join(self.id, participant_id, known_revision, label.clone())
                .await
            {
                Ok(outcome) => break (handle, outcome),
                // The session drained between lookup and join
                Err(SessionError::Unavailable) if !retried => retried = true,
                Err(e) => {
                    log::warn!("{participant_id} could not join doc {doc_id}: {e}");
                    if let Some(code) = error_code(&e) {
                        send(sink, &ServerMessage::error(code, e.to_string())).await?;
                    }
                    return Ok(Flow::Continue);
                }
            }
        };

        self.last_sent = outcome.revision;
        self.joined = Some(Joined {
            doc_id,
            participant_id,
            handle,
        });
        self.catch_up(doc_id, outcome, sink).await?;

        let active = self.registry.document_count().await;
        self.stats.write().await.active_documents = active;
        Ok(Flow::Continue)
    }

    /// Switch to the outcome's receiver, then send its catch-up frames and
    /// the complete presence and comment sets.
    async fn catch_up(
        &mut self,
        doc_id: Uuid,
        outcome: JoinOutcome,
        sink: &mut WsSink,
    ) -> Result<(), ProtocolError> {
        let JoinOutcome {
            events,
            catch_up,
            presence,
            comments,
            ..
        } = outcome;
        self.subscribed = Some(events);

        match catch_up {
            CatchUp::UpToDate => {}
            CatchUp::Replay(ops) => {
                for op in ops {
                    send(sink, &op_broadcast(doc_id, &op)).await?;
                }
            }
            CatchUp::Snapshot(snapshot) => {
                self.send_snapshot(doc_id, snapshot.revision, snapshot.content, sink)
                    .await?;
            }
            CatchUp::Resync(snapshot) => {
                send(sink, &ServerMessage::ResyncRequired { doc_id }).await?;
                self.send_snapshot(doc_id, snapshot.revision, snapshot.content, sink)
                    .await?;
            }
        }

        for state in &presence {
            send(sink, &ServerMessage::presence(doc_id, state)).await?;
        }
        for comment in comments {
            send(sink, &ServerMessage::CommentUpdate { doc_id, comment }).await?;
        }
        Ok(())
    }

    /// Turn one session event into frames for this client.
    async fn forward(&mut self, event: &SessionEvent, sink: &mut WsSink) -> Result<Flow, ProtocolError> {
        let Some(joined) = &self.joined else {
            return Ok(Flow::Continue);
        };
        let doc_id = joined.doc_id;
        let me = joined.participant_id;

        let msg = match event {
            SessionEvent::Applied { op, origin } => {
                let revision = op.revision();
                if revision <= self.last_sent {
                    // Already covered by a snapshot
                    return Ok(Flow::Continue);
                }
                self.last_sent = revision;
                if *origin == self.id || self.deferred_acks.remove(&revision) {
                    ServerMessage::OpAck {
                        doc_id,
                        revision,
                        seq: op.seq(),
                    }
                } else {
                    op_broadcast(doc_id, op)
                }
            }
            SessionEvent::PresenceChanged(state) if state.participant_id != me => {
                ServerMessage::presence(doc_id, state)
            }
            SessionEvent::PresenceLeft { participant_id } if *participant_id != me => {
                ServerMessage::PresenceLeft {
                    doc_id,
                    participant_id: *participant_id,
                }
            }
            SessionEvent::PresenceChanged(_) | SessionEvent::PresenceLeft { .. } => {
                return Ok(Flow::Continue);
            }
            SessionEvent::CommentChanged(comment) => ServerMessage::CommentUpdate {
                doc_id,
                comment: comment.clone(),
            },
            SessionEvent::CommentRemoved { comment_id } => ServerMessage::CommentRemoved {
                doc_id,
                comment_id: *comment_id,
            },
            SessionEvent::Closed(reason) => {
                let (code, message) = match reason {
                    CloseReason::Idle | CloseReason::Unloaded => {
                        (ErrorCode::DocumentUnavailable, "document unloaded")
                    }
                    CloseReason::Deleted => (ErrorCode::DocumentDeleted, "document deleted"),
                    CloseReason::PersistenceFailure => {
                        (ErrorCode::PersistenceFailure, "document storage failed")
                    }
                };
                log::info!("Closing {}: doc {doc_id} closed ({reason:?})", self.id);
                send(sink, &ServerMessage::error(code, message)).await?;
                self.joined = None;
                return Ok(Flow::Close);
            }
        };

        send(sink, &msg).await?;
        Ok(Flow::Continue)
    }

    /// Snapshot plus full presence and comments on a fresh subscription,
    /// preceded by `resync-required` when `resync` is set. Events the old
    /// receiver still holds are dropped with it.
    async fn send_state(&mut self, resync: bool, sink: &mut WsSink) -> Result<Flow, ProtocolError> {
        let Some(joined) = &self.joined else {
            return Ok(Flow::Continue);
        };
        let doc_id = joined.doc_id;
        let handle = joined.handle.clone();

        match handle.resubscribe(self.id).await {
            Ok(outcome) => {
                if resync {
                    send(sink, &ServerMessage::ResyncRequired { doc_id }).await?;
                }
                self.catch_up(doc_id, outcome, sink).await?;
                Ok(Flow::Continue)
            }
            Err(e) => {
                if let Some(code) = error_code(&e) {
                    send(sink, &ServerMessage::error(code, e.to_string())).await?;
                }
                Ok(Flow::Close)
            }
        }
    }

    async fn send_snapshot(
        &mut self,
        doc_id: Uuid,
        revision: u64,
        content: String,
        sink: &mut WsSink,
    ) -> Result<(), ProtocolError> {
        self.last_sent = self.last_sent.max(revision);
        let last_sent = self.last_sent;
        self.deferred_acks.retain(|rev| *rev > last_sent);
        send(
            sink,
            &ServerMessage::Snapshot {
                doc_id,
                revision,
                content,
            },
        )
        .await
    }

    async fn session_error(&mut self, e: SessionError, sink: &mut WsSink) -> Result<Flow, ProtocolError> {
        match e {
            SessionError::ResyncRequired => self.send_state(true, sink).await,
            SessionError::MalformedOperation(_)
            | SessionError::UnknownComment(_)
            | SessionError::DocumentFull => {
                log::debug!("{} rejected: {e}", self.id);
                if let Some(code) = error_code(&e) {
                    send(sink, &ServerMessage::error(code, e.to_string())).await?;
                }
                Ok(Flow::Continue)
            }
            SessionError::PersistenceFailure(_) | SessionError::Unavailable | SessionError::Deleted => {
                if let Some(code) = error_code(&e) {
                    send(sink, &ServerMessage::error(code, e.to_string())).await?;
                }
                Ok(Flow::Close)
            }
        }
    }

    async fn violation(&mut self, sink: &mut WsSink, reason: String) -> Result<Flow, ProtocolError> {
        log::warn!("Protocol violation from {} ({}): {reason}", self.id, self.addr);
        self.stats.write().await.protocol_violations += 1;
        send(sink, &ServerMessage::error(ErrorCode::ProtocolViolation, reason)).await?;
        Ok(Flow::Close)
    }
}

async fn send(sink: &mut WsSink, msg: &ServerMessage) -> Result<(), ProtocolError> {
    let text = msg.encode()?;
    sink.send(Message::Text(text.into())).await?;
    Ok(())
}

fn op_broadcast(doc_id: Uuid, op: &Operation) -> ServerMessage {
    ServerMessage::OpBroadcast {
        doc_id,
        revision: op.revision(),
        participant_id: op.participant_id(),
        seq: op.seq(),
        priority: op.priority(),
        primitives: op.changes().clone(),
    }
}

/// Wire error code for a session error. `ResyncRequired` has its own frame.
fn error_code(e: &SessionError) -> Option<ErrorCode> {
    match e {
        SessionError::MalformedOperation(_) => Some(ErrorCode::MalformedOperation),
        SessionError::ResyncRequired => None,
        SessionError::PersistenceFailure(_) => Some(ErrorCode::PersistenceFailure),
        SessionError::Unavailable => Some(ErrorCode::DocumentUnavailable),
        SessionError::DocumentFull => Some(ErrorCode::DocumentFull),
        SessionError::Deleted => Some(ErrorCode::DocumentDeleted),
        SessionError::UnknownComment(_) => Some(ErrorCode::UnknownComment),
    }
}
