use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use lectern_collab::{
    DocumentPayload, Envelope, FileSnapshotStore, MemorySnapshotStore, MessageKind,
    SnapshotRecord, SnapshotStore,
};
use lectern_core::{ReplicatedText, SHARED_DOCUMENT_KEY};
use std::hint::black_box;

fn populated(chars: usize) -> ReplicatedText {
    let text = ReplicatedText::new(SHARED_DOCUMENT_KEY);
    for i in 0..chars / 16 {
        text.insert((i * 16) as u32, "print(i * 2)  \n");
    }
    text
}

fn bench_envelope(c: &mut Criterion) {
    let mut group = c.benchmark_group("Envelope");

    let keystroke = ReplicatedText::new(SHARED_DOCUMENT_KEY)
        .insert(0, "a")
        .unwrap_or_default();
    let full_state = populated(4 * 1024).encode_state();

    for (name, update) in [("keystroke", keystroke), ("full_state_4k", full_state)] {
        let payload = DocumentPayload::update(SHARED_DOCUMENT_KEY, update.clone());
        group.throughput(Throughput::Bytes(update.len() as u64));

        group.bench_function(format!("encode_{name}"), |b| {
            b.iter(|| {
                let envelope =
                    Envelope::wrap(MessageKind::Update.as_str(), black_box(&payload), "t1")
                        .unwrap();
                black_box(envelope.encode().unwrap());
            })
        });

        let frame = Envelope::wrap(MessageKind::Update.as_str(), &payload, "t1")
            .unwrap()
            .encode()
            .unwrap();
        group.bench_function(format!("decode_{name}"), |b| {
            b.iter(|| {
                let envelope = Envelope::decode(black_box(&frame)).unwrap();
                black_box(envelope.payload::<DocumentPayload>().unwrap());
            })
        });
    }

    group.finish();
}

fn bench_snapshot_put(c: &mut Criterion) {
    let mut group = c.benchmark_group("Snapshot Store");
    let record = SnapshotRecord {
        update: populated(16 * 1024).encode_state(),
        timestamp: 0,
    };
    group.throughput(Throughput::Bytes(record.update.len() as u64));

    let memory = MemorySnapshotStore::new();
    group.bench_function("memory_put", |b| {
        b.iter(|| memory.put(SHARED_DOCUMENT_KEY, black_box(&record)).unwrap())
    });

    let dir = tempfile::tempdir().unwrap();
    let file = FileSnapshotStore::open(dir.path()).unwrap();
    group.bench_function("file_put", |b| {
        b.iter(|| file.put(SHARED_DOCUMENT_KEY, black_box(&record)).unwrap())
    });
    group.bench_function("file_get", |b| {
        b.iter(|| black_box(file.get(SHARED_DOCUMENT_KEY).unwrap()))
    });

    group.finish();
}

criterion_group!(benches, bench_envelope, bench_snapshot_put);
criterion_main!(benches);
