//! Integration tests for presence and comment synchronization.
//!
//! These tests start a real server and connect several clients,
//! verifying cursor broadcast, cursor transformation through remote
//! edits, and comment anchoring through the full network stack.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use quire_collab::broadcast::ConnectionId;
use quire_collab::client::{SyncClient, SyncEvent};
use quire_collab::comments::{Anchor, Comment};
use quire_collab::presence::{PresenceThrottle, Selection};
use quire_collab::protocol::{ClientMessage, ErrorCode, ServerMessage};
use quire_collab::server::{ServerConfig, SyncServer};
use quire_collab::session::PresenceUpdate;
use quire_collab::storage::MemoryStore;
use quire_core::{ChangeSet, Operation};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn start_test_server() -> String {
    start_server_with(ServerConfig::for_testing()).await.1
}

async fn start_server_with(config: ServerConfig) -> (Arc<SyncServer>, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let server = Arc::new(SyncServer::with_store(config, Arc::new(MemoryStore::new())));
    let serving = server.clone();
    tokio::spawn(async move {
        let _ = serving.serve(listener).await;
    });
    (server, url)
}

async fn send(ws: &mut Ws, msg: &ClientMessage) {
    ws.send(Message::Text(msg.encode().unwrap().into())).await.unwrap();
}

/// Read frames until one matches `want`.
async fn recv_until<F>(ws: &mut Ws, mut want: F) -> ServerMessage
where
    F: FnMut(&ServerMessage) -> bool,
{
    loop {
        let frame = timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("timed out waiting for a server frame");
        match frame {
            Some(Ok(Message::Text(text))) => {
                let msg = ServerMessage::decode(text.as_str()).unwrap();
                if want(&msg) {
                    return msg;
                }
            }
            Some(Ok(_)) => {}
            other => panic!("connection ended: {other:?}"),
        }
    }
}

/// Connect and join; returns once the join snapshot arrived.
async fn join(url: &str, doc_id: Uuid, participant_id: Uuid, label: &str) -> Ws {
    let (mut ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    send(
        &mut ws,
        &ClientMessage::Join {
            doc_id,
            participant_id,
            known_revision: None,
            label: Some(label.to_string()),
        },
    )
    .await;
    recv_until(&mut ws, |m| matches!(m, ServerMessage::Snapshot { .. })).await;
    ws
}

async fn edit(ws: &mut Ws, doc_id: Uuid, participant_id: Uuid, base_revision: u64, seq: u64, changes: ChangeSet) {
    send(
        ws,
        &ClientMessage::Op {
            doc_id,
            participant_id,
            base_revision,
            seq,
            priority: 0,
            primitives: changes,
        },
    )
    .await;
    recv_until(ws, |m| matches!(m, ServerMessage::OpAck { .. })).await;
}

fn presence_of(participant: Uuid) -> impl FnMut(&ServerMessage) -> bool {
    move |m| matches!(m, ServerMessage::PresenceUpdate { participant_id, .. } if *participant_id == participant)
}

fn comment_update(m: &ServerMessage) -> bool {
    matches!(m, ServerMessage::CommentUpdate { .. })
}

#[tokio::test]
async fn test_join_announces_presence() {
    let url = start_test_server().await;
    let doc_id = Uuid::new_v4();
    let alice = Uuid::new_v4();
    let bob = Uuid::new_v4();

    let mut ws_a = join(&url, doc_id, alice, "Alice").await;
    let (mut ws_b, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
    send(
        &mut ws_b,
        &ClientMessage::Join {
            doc_id,
            participant_id: bob,
            known_revision: None,
            label: Some("Bob".into()),
        },
    )
    .await;

    // The joiner is told who is already here
    match recv_until(&mut ws_b, presence_of(alice)).await {
        ServerMessage::PresenceUpdate { label, cursor, .. } => {
            assert_eq!(label.as_deref(), Some("Alice"));
            assert_eq!(cursor, 0);
        }
        other => panic!("Expected presence, got {other:?}"),
    }

    // ... and everyone else hears about the joiner
    match recv_until(&mut ws_a, presence_of(bob)).await {
        ServerMessage::PresenceUpdate { label, .. } => assert_eq!(label.as_deref(), Some("Bob")),
        other => panic!("Expected presence, got {other:?}"),
    }
}

#[tokio::test]
async fn test_cursor_follows_remote_edits() {
    let url = start_test_server().await;
    let doc_id = Uuid::new_v4();
    let alice = Uuid::new_v4();
    let bob = Uuid::new_v4();

    let mut ws_a = join(&url, doc_id, alice, "Alice").await;
    let mut hello = ChangeSet::new();
    hello.insert("hello");
    edit(&mut ws_a, doc_id, alice, 0, 1, hello).await;

    let mut ws_b = join(&url, doc_id, bob, "Bob").await;

    send(
        &mut ws_a,
        &ClientMessage::Presence {
            doc_id,
            participant_id: alice,
            cursor: 2,
            selection: Some(Selection::new(1, 3)),
            revision: Some(1),
            label: None,
            color: None,
        },
    )
    .await;
    match recv_until(&mut ws_b, |m| {
        matches!(m, ServerMessage::PresenceUpdate { participant_id, cursor: 2, .. } if *participant_id == alice)
    })
    .await
    {
        ServerMessage::PresenceUpdate { selection, label, .. } => {
            assert_eq!(selection, Some(Selection::new(1, 3)));
            // Label from the join is kept
            assert_eq!(label.as_deref(), Some("Alice"));
        }
        other => panic!("Expected presence, got {other:?}"),
    }

    // Bob types in front of Alice's cursor
    let mut prefix = ChangeSet::new();
    prefix.insert("XY");
    edit(&mut ws_b, doc_id, bob, 1, 1, prefix).await;

    // A late joiner sees the cursor where it is now
    let carol = Uuid::new_v4();
    let (mut ws_c, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
    send(
        &mut ws_c,
        &ClientMessage::Join {
            doc_id,
            participant_id: carol,
            known_revision: None,
            label: None,
        },
    )
    .await;
    match recv_until(&mut ws_c, presence_of(alice)).await {
        ServerMessage::PresenceUpdate { cursor, selection, .. } => {
            assert_eq!(cursor, 4);
            assert_eq!(selection, Some(Selection::new(3, 5)));
        }
        other => panic!("Expected presence, got {other:?}"),
    }

    // Offsets past the end are clamped
    send(
        &mut ws_a,
        &ClientMessage::Presence {
            doc_id,
            participant_id: alice,
            cursor: 100,
            selection: None,
            revision: None,
            label: None,
            color: None,
        },
    )
    .await;
    match recv_until(&mut ws_c, presence_of(alice)).await {
        ServerMessage::PresenceUpdate { cursor, .. } => assert_eq!(cursor, 7),
        other => panic!("Expected presence, got {other:?}"),
    }
}

#[tokio::test]
async fn test_leave_removes_presence() {
    let url = start_test_server().await;
    let doc_id = Uuid::new_v4();
    let alice = Uuid::new_v4();
    let bob = Uuid::new_v4();

    let mut ws_a = join(&url, doc_id, alice, "Alice").await;
    let mut ws_b = join(&url, doc_id, bob, "Bob").await;

    send(&mut ws_a, &ClientMessage::Leave { doc_id, participant_id: alice }).await;
    match recv_until(&mut ws_b, |m| matches!(m, ServerMessage::PresenceLeft { .. })).await {
        ServerMessage::PresenceLeft { participant_id, .. } => assert_eq!(participant_id, alice),
        other => panic!("Expected presence-left, got {other:?}"),
    }

    // Dropping the socket counts as leaving too
    let carol = Uuid::new_v4();
    let ws_c = join(&url, doc_id, carol, "Carol").await;
    drop(ws_c);
    match recv_until(&mut ws_b, |m| {
        matches!(m, ServerMessage::PresenceLeft { participant_id, .. } if *participant_id == carol)
    })
    .await
    {
        ServerMessage::PresenceLeft { doc_id: left_doc, .. } => assert_eq!(left_doc, doc_id),
        other => panic!("Expected presence-left, got {other:?}"),
    }
}

#[tokio::test]
async fn test_comment_lifecycle() {
    let url = start_test_server().await;
    let doc_id = Uuid::new_v4();
    let alice = Uuid::new_v4();
    let bob = Uuid::new_v4();

    let mut ws_a = join(&url, doc_id, alice, "Alice").await;
    let mut text = ChangeSet::new();
    text.insert("hello world");
    edit(&mut ws_a, doc_id, alice, 0, 1, text).await;
    let mut ws_b = join(&url, doc_id, bob, "Bob").await;

    send(
        &mut ws_a,
        &ClientMessage::CommentAdd {
            doc_id,
            participant_id: alice,
            revision: 1,
            start: 6,
            end: 11,
            body: "which world?".into(),
        },
    )
    .await;
    let comment = match recv_until(&mut ws_b, comment_update).await {
        ServerMessage::CommentUpdate { comment, .. } => comment,
        other => panic!("Expected comment, got {other:?}"),
    };
    assert_eq!(comment.author, alice);
    assert_eq!(comment.anchor, Anchor::new(6, 11));
    recv_until(&mut ws_a, comment_update).await;

    // Text typed before the range shifts the anchor
    let mut prefix = ChangeSet::new();
    prefix.insert("Oh, ");
    edit(&mut ws_b, doc_id, bob, 1, 1, prefix).await;

    let carol = Uuid::new_v4();
    let mut ws_c = join(&url, doc_id, carol, "Carol").await;
    match recv_until(&mut ws_c, comment_update).await {
        ServerMessage::CommentUpdate { comment: seen, .. } => {
            assert_eq!(seen.id, comment.id);
            assert_eq!(seen.anchor, Anchor::new(10, 15));
            assert!(!seen.orphaned);
        }
        other => panic!("Expected comment, got {other:?}"),
    }

    // Deleting the anchored text orphans the comment
    let mut cut = ChangeSet::new();
    cut.retain(10).delete(5);
    edit(&mut ws_b, doc_id, bob, 2, 2, cut).await;
    match recv_until(&mut ws_a, comment_update).await {
        ServerMessage::CommentUpdate { comment: seen, .. } => {
            assert!(seen.orphaned);
            assert!(seen.anchor.is_point());
        }
        other => panic!("Expected orphaned comment, got {other:?}"),
    }

    send(
        &mut ws_b,
        &ClientMessage::CommentResolve {
            doc_id,
            comment_id: comment.id,
            resolved: true,
        },
    )
    .await;
    match recv_until(&mut ws_c, |m| {
        matches!(m, ServerMessage::CommentUpdate { comment, .. } if comment.resolved)
    })
    .await
    {
        ServerMessage::CommentUpdate { comment: seen, .. } => assert!(seen.orphaned),
        other => panic!("Expected resolved comment, got {other:?}"),
    }

    send(&mut ws_a, &ClientMessage::CommentDelete { doc_id, comment_id: comment.id }).await;
    match recv_until(&mut ws_c, |m| matches!(m, ServerMessage::CommentRemoved { .. })).await {
        ServerMessage::CommentRemoved { comment_id, .. } => assert_eq!(comment_id, comment.id),
        other => panic!("Expected comment removal, got {other:?}"),
    }

    // Gone for good
    send(&mut ws_a, &ClientMessage::CommentDelete { doc_id, comment_id: comment.id }).await;
    match recv_until(&mut ws_a, |m| matches!(m, ServerMessage::Error { .. })).await {
        ServerMessage::Error { code, .. } => assert_eq!(code, ErrorCode::UnknownComment),
        other => panic!("Expected error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_comment_outside_document_is_rejected() {
    let url = start_test_server().await;
    let doc_id = Uuid::new_v4();
    let alice = Uuid::new_v4();

    let mut ws = join(&url, doc_id, alice, "Alice").await;
    send(
        &mut ws,
        &ClientMessage::CommentAdd {
            doc_id,
            participant_id: alice,
            revision: 0,
            start: 0,
            end: 4,
            body: "nothing here".into(),
        },
    )
    .await;
    match recv_until(&mut ws, |m| matches!(m, ServerMessage::Error { .. })).await {
        ServerMessage::Error { code, .. } => assert_eq!(code, ErrorCode::MalformedOperation),
        other => panic!("Expected error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_sync_client_presence_events() {
    let url = start_test_server().await;
    let doc_id = Uuid::new_v4();

    let mut alice = SyncClient::new(Uuid::new_v4(), doc_id, url.as_str())
        .with_label("Alice")
        .with_presence_throttle(PresenceThrottle::with_interval(Duration::from_millis(0)));
    alice.connect().await.unwrap();

    let mut bob = SyncClient::new(Uuid::new_v4(), doc_id, url.as_str()).with_label("Bob");
    let mut events = bob.take_event_rx().unwrap();
    bob.connect().await.unwrap();

    alice.insert(0, "abc").await.unwrap();
    for _ in 0..100 {
        if !alice.has_pending().await {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    alice.update_presence(2, None).await.unwrap();

    let alice_id = alice.participant_id();
    let cursor = timeout(Duration::from_secs(2), async {
        loop {
            match events.recv().await {
                Some(SyncEvent::Presence(state)) if state.participant_id == alice_id && state.cursor == 2 => {
                    return state;
                }
                Some(_) => continue,
                None => panic!("event channel closed"),
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(cursor.label.as_deref(), Some("Alice"));
}

/// What a client believes about the document, rebuilt from frames.
#[derive(Default)]
struct ClientView {
    content: String,
    comments: HashMap<Uuid, Comment>,
    cursors: HashMap<Uuid, usize>,
    resyncs: usize,
}

impl ClientView {
    fn apply(&mut self, msg: &ServerMessage) {
        match msg {
            ServerMessage::ResyncRequired { .. } => self.resyncs += 1,
            ServerMessage::Snapshot { content, .. } => {
                self.content = content.clone();
                self.comments.clear();
                self.cursors.clear();
            }
            ServerMessage::OpBroadcast { primitives, .. } => {
                self.content = primitives.apply(&self.content).unwrap();
            }
            ServerMessage::CommentUpdate { comment, .. } => {
                self.comments.insert(comment.id, comment.clone());
            }
            ServerMessage::CommentRemoved { comment_id, .. } => {
                self.comments.remove(comment_id);
            }
            ServerMessage::PresenceUpdate {
                participant_id, cursor, ..
            } => {
                self.cursors.insert(*participant_id, *cursor);
            }
            ServerMessage::PresenceLeft { participant_id, .. } => {
                self.cursors.remove(participant_id);
            }
            _ => {}
        }
    }
}

#[tokio::test]
async fn test_lagging_client_recovers_comments_and_presence() {
    let mut config = ServerConfig::for_testing();
    config.broadcast_capacity = 2;
    config.session.idle_timeout = Duration::from_secs(30);
    let (server, url) = start_server_with(config).await;
    let doc_id = Uuid::new_v4();
    let alice = Uuid::new_v4();
    let bob = Uuid::new_v4();
    let bob_conn = ConnectionId(u64::MAX);

    let mut ws = join(&url, doc_id, alice, "Alice").await;
    let mut view = ClientView::default();

    // Bob talks to the session directly, without a socket of his own
    let handle = server.registry().get_or_spawn(doc_id).await;
    handle.join(bob_conn, bob, Some(0), Some("Bob".into())).await.unwrap();
    let mut hello = ChangeSet::new();
    hello.insert("hello");
    handle
        .submit(bob_conn, Operation::new(doc_id, bob, 1, 0, hello))
        .await
        .unwrap();
    let kept = handle.add_comment(bob, 1, Anchor::new(0, 2), "keep").await.unwrap();
    let dropped = handle.add_comment(bob, 1, Anchor::new(2, 4), "drop").await.unwrap();

    // A burst far larger than the event buffer, then the removal
    for cursor in 0..=20 {
        handle
            .update_presence(bob_conn, PresenceUpdate::cursor(bob, cursor % 6))
            .await
            .unwrap();
    }
    handle.delete_comment(dropped.id).await.unwrap();

    // The removal is lost with the lagged events; only the recovery
    // frames can bring the view back in line
    while !(view.resyncs > 0
        && view.content == "hello"
        && view.comments.len() == 1
        && view.cursors.get(&bob) == Some(&2))
    {
        let msg = recv_until(&mut ws, |_| true).await;
        view.apply(&msg);
    }

    assert!(server.stats().await.lagged_resyncs >= 1);
    assert_eq!(view.content, "hello");
    assert_eq!(view.comments.len(), 1);
    assert_eq!(view.comments.get(&kept.id), Some(&kept));
    assert!(!view.comments.contains_key(&dropped.id));
}
