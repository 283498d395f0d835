use std::hint::black_box;
use std::sync::Arc;

use criterion::{criterion_group, criterion_main, Criterion};
use notes_collab::{apply, Edit, Envelope, Hub, MemoryStore, NoteId, Peer};
use serde_json::json;

fn bench_apply_insert(c: &mut Criterion) {
    let content = "lorem ipsum dolor sit amet ".repeat(400);
    let edit = Edit::Insert {
        position: content.len() / 2,
        content: "consectetur".into(),
    };

    c.bench_function("apply_insert_10KB", |b| {
        b.iter(|| black_box(apply(black_box(&content), black_box(&edit))))
    });
}

fn bench_apply_delete_clamped(c: &mut Criterion) {
    let content = "lorem ipsum dolor sit amet ".repeat(400);
    let edit = Edit::Delete {
        position: 100,
        length: usize::MAX,
    };

    c.bench_function("apply_delete_clamped_10KB", |b| {
        b.iter(|| black_box(apply(black_box(&content), black_box(&edit))))
    });
}

fn bench_envelope_encode(c: &mut Criterion) {
    let env = Envelope::operation(
        NoteId::from("bench-note"),
        42,
        Edit::Insert {
            position: 128,
            content: "hello".into(),
        },
        7,
    );

    c.bench_function("envelope_encode_operation", |b| {
        b.iter(|| black_box(env.encode().unwrap()))
    });
}

fn bench_envelope_decode(c: &mut Criterion) {
    let frame = json!({
        "type": "cursor",
        "note_id": "bench-note",
        "user_id": 42,
        "data": {"line": 10, "column": 4, "selection": [1, 2]}
    })
    .to_string();

    c.bench_function("envelope_decode_cursor", |b| {
        b.iter(|| black_box(Envelope::decode(black_box(&frame)).unwrap()))
    });
}

fn bench_hub_fan_out(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let note = NoteId::from("bench-note");

    let (hub, mut receivers) = rt.block_on(async {
        let store = MemoryStore::new().with_document("bench-note", "", 1).await;
        let hub = Hub::spawn(Arc::new(store), 1024);
        let mut receivers = Vec::new();
        for participant in 0..100 {
            let (peer, rx) = Peer::new(note.clone(), participant, 1024);
            hub.register(peer).await;
            receivers.push(rx);
        }
        // Consume each snapshot
        for rx in receivers.iter_mut() {
            rx.recv().await;
        }
        (hub, receivers)
    });

    let frame: Arc<str> = Envelope::cursor(note.clone(), 0, json!({"pos": 1}))
        .encode()
        .unwrap()
        .into();

    // 100 frames to 100 peers per iteration, drained so queues never fill
    c.bench_function("hub_broadcast_100x100", |b| {
        b.iter(|| {
            rt.block_on(async {
                for _ in 0..100 {
                    hub.broadcast(Arc::clone(&frame), None).await;
                }
                for rx in receivers.iter_mut() {
                    for _ in 0..100 {
                        black_box(rx.recv().await);
                    }
                }
            })
        })
    });
}

criterion_group!(
    benches,
    bench_apply_insert,
    bench_apply_delete_clamped,
    bench_envelope_encode,
    bench_envelope_decode,
    bench_hub_fan_out,
);
criterion_main!(benches);
