use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use serde_json::json;
use sheetshare_collab::broadcast::BroadcastBus;
use sheetshare_collab::presence::SessionRegistry;
use sheetshare_collab::protocol::{ClientMessage, ServerMessage};
use std::time::{Duration, Instant};
use uuid::Uuid;

fn edit(user_id: Uuid, value: i64) -> ServerMessage {
    ServerMessage::CellEdit {
        row_id: 12,
        column: "score".into(),
        value: json!(value),
        user_id,
        operation_id: Some("op-1".into()),
    }
}

fn bench_message_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("Wire Codec");
    let inbound = r#"{"type":"cell_edit","rowId":12,"column":"score","value":"42","operationId":"op-1"}"#;
    let outbound = edit(Uuid::new_v4(), 42);

    group.bench_function("decode_cell_edit", |b| {
        b.iter(|| black_box(ClientMessage::decode(black_box(inbound)).unwrap()))
    });
    group.bench_function("encode_cell_edit", |b| {
        b.iter(|| black_box(outbound.encode().unwrap()))
    });
    group.bench_function("signature_cell_edit", |b| {
        b.iter(|| black_box(outbound.signature()))
    });
    group.finish();
}

fn bench_fanout(c: &mut Criterion) {
    let mut group = c.benchmark_group("Broadcast Fan-out");

    for editors in [2usize, 10, 100] {
        group.throughput(Throughput::Elements(editors as u64));
        group.bench_with_input(BenchmarkId::from_parameter(editors), &editors, |b, &editors| {
            let mut bus = BroadcastBus::new(1024);
            let mut receivers: Vec<_> = (0..editors).map(|_| bus.subscribe(Uuid::new_v4())).collect();
            let author = Uuid::new_v4();
            let start = Instant::now();
            let mut n = 0i64;
            b.iter(|| {
                n += 1;
                // Step past the dedup window so every publish is delivered.
                let now = start + Duration::from_secs(n as u64);
                bus.publish_at(&edit(author, n), None, now).unwrap();
                for rx in receivers.iter_mut() {
                    black_box(rx.try_recv().ok());
                }
            })
        });
    }
    group.finish();
}

fn bench_dedup_suppression(c: &mut Criterion) {
    let mut bus = BroadcastBus::new(16);
    let _rx = bus.subscribe(Uuid::new_v4());
    let author = Uuid::new_v4();
    let now = Instant::now();
    bus.publish_at(&edit(author, 1), None, now).unwrap();

    c.bench_function("publish_duplicate_suppressed", |b| {
        b.iter(|| black_box(bus.publish_at(&edit(author, 1), None, now).unwrap()))
    });
}

fn bench_registry(c: &mut Criterion) {
    let mut group = c.benchmark_group("Session Registry");

    group.bench_function("register_unregister", |b| {
        let mut registry = SessionRegistry::new();
        b.iter(|| {
            let id = registry.register();
            registry.focus("3:score", &id);
            black_box(registry.unregister(&id));
        })
    });

    group.bench_function("roster_100", |b| {
        let mut registry = SessionRegistry::new();
        for _ in 0..100 {
            registry.register();
        }
        b.iter(|| black_box(registry.roster()))
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_message_codec,
    bench_fanout,
    bench_dedup_suppression,
    bench_registry,
);
criterion_main!(benches);
