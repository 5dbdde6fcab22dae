use criterion::{criterion_group, criterion_main, Criterion};
use scribe_sync::broadcast::BroadcastRouter;
use scribe_sync::engine::DocumentState;
use scribe_sync::protocol::{
    ClientMessage, ConnectionId, DocumentId, Operation, ServerMessage, UserId,
};
use scribe_sync::registry::{ConnectionRegistry, TransportHandle};
use scribe_sync::storage::{OperationStore, RocksStore, StoreConfig};
use std::hint::black_box;
use std::sync::Arc;
use uuid::Uuid;

fn sync_frame() -> String {
    ClientMessage::Sync {
        operations: vec![
            Operation::insert("body", "The quick brown fox", 41),
            Operation::delete("body", 3, 41),
        ],
    }
    .encode()
    .unwrap()
}

fn bench_decode_sync_frame(c: &mut Criterion) {
    let frame = sync_frame();

    c.bench_function("decode_sync_frame", |b| {
        b.iter(|| {
            black_box(ClientMessage::decode(black_box(&frame)).unwrap());
        })
    });
}

fn bench_encode_broadcast(c: &mut Criterion) {
    let msg = ServerMessage::Sync {
        client_id: ConnectionId::new(),
        operations: vec![Operation::insert("body", "The quick brown fox", 41); 4],
    };

    c.bench_function("encode_sync_broadcast", |b| {
        b.iter(|| {
            black_box(black_box(&msg).encode().unwrap());
        })
    });
}

fn bench_fast_forward(c: &mut Criterion) {
    let author = ConnectionId::new();

    c.bench_function("engine_fast_forward_1000", |b| {
        b.iter(|| {
            let mut state = DocumentState::new(10_000);
            for base in 0..1000u64 {
                let outcome = state
                    .submit(author, vec![Operation::insert("body", "x", base)])
                    .unwrap();
                black_box(outcome);
            }
        })
    });
}

fn bench_conflict_detection(c: &mut Criterion) {
    let author = ConnectionId::new();
    let mut state = DocumentState::new(10_000);
    for base in 0..10_000u64 {
        let target = format!("t{}", base % 100);
        state
            .submit(author, vec![Operation::insert(target, "x", base)])
            .unwrap();
    }

    c.bench_function("engine_conflict_scan_10k_log", |b| {
        b.iter(|| {
            // Base 0 forces a scan of the whole log; the target conflicts
            let outcome = state
                .submit(author, vec![Operation::insert("t7", "late", black_box(0))])
                .unwrap();
            black_box(outcome);
        })
    });
}

fn bench_router_fan_out(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let registry = Arc::new(ConnectionRegistry::new(1024));
    let router = BroadcastRouter::new(registry.clone());
    let doc = DocumentId::from("bench");

    // 100 connections with large queues, drained after each iteration
    let mut receivers = Vec::new();
    rt.block_on(async {
        for i in 0..100 {
            let (handle, rx) = TransportHandle::channel(2048);
            registry
                .admit(handle, UserId::new(format!("user{i}")), doc.clone(), 0)
                .await;
            receivers.push(rx);
        }
    });

    let msg = ServerMessage::Sync {
        client_id: ConnectionId::new(),
        operations: vec![Operation::insert("body", "x", 0)],
    };

    c.bench_function("router_fan_out_100_connections", |b| {
        b.iter(|| {
            let delivered = rt.block_on(router.to_all(&doc, black_box(&msg)));
            black_box(delivered);
            for rx in &mut receivers {
                while rx.try_recv().is_ok() {}
            }
        })
    });
}

fn bench_store_append(c: &mut Criterion) {
    let dir = std::env::temp_dir().join(format!("scribe_bench_store_append_{}", Uuid::new_v4()));
    let store = RocksStore::open(StoreConfig::at(dir.clone())).unwrap();
    let doc = DocumentId::from("bench");

    c.bench_function("store_append_1_op", |b| {
        let mut version = 0u64;
        b.iter(|| {
            version += 1;
            let mut op = Operation::insert("body", "The quick brown fox", version - 1);
            op.version = version;
            store
                .append_operations(&doc, black_box(std::slice::from_ref(&op)))
                .unwrap();
        })
    });

    drop(store);
    let _ = std::fs::remove_dir_all(&dir);
}

criterion_group!(
    benches,
    bench_decode_sync_frame,
    bench_encode_broadcast,
    bench_fast_forward,
    bench_conflict_detection,
    bench_router_fan_out,
    bench_store_append,
);
criterion_main!(benches);
