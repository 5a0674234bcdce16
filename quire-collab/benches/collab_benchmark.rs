use criterion::{black_box, criterion_group, criterion_main, Criterion};
use quire_collab::broadcast::ConnectionId;
use quire_collab::comments::{Anchor, Comment, CommentAnchors};
use quire_collab::presence::{PresenceState, PresenceTracker};
use quire_collab::protocol::{ClientMessage, ServerMessage};
use quire_collab::session::{DocumentSession, SessionConfig};
use quire_collab::storage::{DocumentStore, MemoryStore, Snapshot, SnapshotStore, StoreConfig};
use quire_core::{ChangeSet, Operation};
use std::sync::Arc;
use uuid::Uuid;

fn keystroke(at: usize, len: usize) -> ChangeSet {
    let mut changes = ChangeSet::new();
    changes.retain(at).insert("x").retain(len - at);
    changes
}

fn bench_op_encode(c: &mut Criterion) {
    let msg = ClientMessage::Op {
        doc_id: Uuid::new_v4(),
        participant_id: Uuid::new_v4(),
        base_revision: 42,
        seq: 7,
        priority: 0,
        primitives: keystroke(100, 4096),
    };

    c.bench_function("op_encode_keystroke", |b| {
        b.iter(|| black_box(black_box(&msg).encode().unwrap()))
    });
}

fn bench_broadcast_decode(c: &mut Criterion) {
    let msg = ServerMessage::OpBroadcast {
        doc_id: Uuid::new_v4(),
        revision: 43,
        participant_id: Uuid::new_v4(),
        seq: 7,
        priority: 0,
        primitives: keystroke(100, 4096),
    };
    let encoded = msg.encode().unwrap();

    c.bench_function("broadcast_decode_keystroke", |b| {
        b.iter(|| black_box(ServerMessage::decode(black_box(&encoded)).unwrap()))
    });
}

fn bench_session_submit(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap();

    // Each participant types 100 characters against a stale base so every
    // op is transformed past the others.
    c.bench_function("session_submit_4x100_concurrent", |b| {
        b.iter(|| {
            rt.block_on(async {
                let doc = Uuid::new_v4();
                let config = SessionConfig {
                    snapshot_interval: 0,
                    ..SessionConfig::default()
                };
                let handle = DocumentSession::spawn(doc, Arc::new(MemoryStore::new()), config);
                let peers: Vec<Uuid> = (0..4).map(|_| Uuid::new_v4()).collect();

                for round in 0..100u64 {
                    for (i, peer) in peers.iter().enumerate() {
                        let base = round * peers.len() as u64;
                        let op = Operation::new(doc, *peer, round + 1, base, keystroke(0, base as usize));
                        handle.submit(ConnectionId(i as u64), op).await.unwrap();
                    }
                }
                black_box(handle.unload().await.unwrap());
            })
        })
    });
}

fn bench_presence_transform(c: &mut Criterion) {
    let mut tracker = PresenceTracker::new();
    for i in 0..100 {
        let mut state = PresenceState::new(Uuid::new_v4(), None);
        state.cursor = i * 40;
        tracker.update(state, 4096);
    }
    let changes = keystroke(2000, 4096);

    c.bench_function("presence_transform_100_cursors", |b| {
        b.iter(|| {
            let mut tracker = tracker.clone();
            tracker.transform(black_box(&changes));
            black_box(tracker)
        })
    });
}

fn bench_comment_transform(c: &mut Criterion) {
    let author = Uuid::new_v4();
    let comments = (0..200)
        .map(|i| Comment::new(author, "note", Anchor::new(i * 20, i * 20 + 10), 0))
        .collect();
    let anchors = CommentAnchors::from_comments(comments);
    let mut cut = ChangeSet::new();
    cut.retain(1000).delete(500).retain(2596);

    c.bench_function("comment_transform_200_anchors", |b| {
        b.iter(|| {
            let mut anchors = anchors.clone();
            black_box(anchors.transform(black_box(&cut)))
        })
    });
}

fn bench_rocksdb_append(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let store = DocumentStore::open(StoreConfig::for_testing(dir.path())).unwrap();
    let doc = Uuid::new_v4();
    let peer = Uuid::new_v4();
    let mut base = 0u64;

    c.bench_function("rocksdb_append_op", |b| {
        b.iter(|| {
            let op = Operation::new(doc, peer, base + 1, base, keystroke(0, 0));
            store.append_op_log(doc, black_box(&op)).unwrap();
            base += 1;
        })
    });
}

fn bench_snapshot_encode(c: &mut Criterion) {
    let mut snapshot = Snapshot::empty();
    snapshot.revision = 1000;
    snapshot.content = "lorem ipsum dolor sit amet ".repeat(400);

    c.bench_function("snapshot_encode_10k", |b| {
        b.iter(|| black_box(black_box(&snapshot).encode().unwrap()))
    });
}

criterion_group!(
    benches,
    bench_op_encode,
    bench_broadcast_decode,
    bench_session_submit,
    bench_presence_transform,
    bench_comment_transform,
    bench_rocksdb_append,
    bench_snapshot_encode,
);
criterion_main!(benches);
