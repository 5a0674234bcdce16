//! # quire-collab — Real-time collaboration layer for Quire
//!
//! Hosts documents edited concurrently over WebSocket. Every document is
//! owned by one session actor that orders edits into a single canonical
//! history using the transform engine from `quire-core`.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌──────────────────┐
//! │ SyncClient  │ ◄─────────────────► │ SyncServer       │
//! │ (per user)  │     JSON frames     │ (per connection) │
//! └──────┬──────┘                     └────────┬─────────┘
//!        │                                     │ commands (mpsc)
//!        ▼                                     ▼
//! ┌──────────────┐                    ┌──────────────────┐
//! │ClientDocument│                    │ DocumentSession  │
//! │ (pending +   │                    │ (single writer)  │
//! │  buffer)     │                    └───┬──────────┬───┘
//! └──────────────┘                        │          │
//!                                 ┌───────┴──┐   ┌───┴──────────┐
//!                                 │ EventBus │   │ SnapshotStore│
//!                                 │ (fan-out)│   │ (RocksDB)    │
//!                                 └──────────┘   └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: JSON wire protocol
//! - [`session`]: Per-document actor: ordering, transform, persistence
//! - [`registry`]: Document ID → live session
//! - [`history`]: Bounded ring of recent canonical operations
//! - [`broadcast`]: Session event bus
//! - [`presence`]: Cursors and selections
//! - [`comments`]: Comments anchored to text ranges
//! - [`server`]: WebSocket sync server
//! - [`client`]: WebSocket sync client and OT client state
//! - [`storage`]: Snapshot + op-log persistence

pub mod broadcast;
pub mod client;
pub mod comments;
pub mod history;
pub mod presence;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;
pub mod storage;

// Re-exports for convenience
pub use broadcast::{BusCounters, BusStats, CloseReason, ConnectionId, EventBus, SessionEvent};
pub use client::{ClientDocument, ConnectionState, RemoteOutcome, SyncClient, SyncEvent};
pub use comments::{Anchor, Comment, CommentAnchors};
pub use history::History;
pub use presence::{CursorColor, PresenceState, PresenceThrottle, PresenceTracker, Selection};
pub use protocol::{ClientMessage, ErrorCode, ProtocolError, ServerMessage};
pub use registry::DocumentRegistry;
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use session::{
    CatchUp, DocumentHandle, DocumentSession, JoinOutcome, PresenceUpdate, SessionConfig,
    SessionError, SessionState, SubmitOutcome,
};
pub use storage::{
    DocumentMetadata, DocumentStore, MemoryStore, Snapshot, SnapshotStore, StoreConfig, StoreError,
};
