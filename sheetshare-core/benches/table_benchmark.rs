use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use serde_json::{json, Value};
use sheetshare_core::{DType, DtypeGuard, Record, Table, TableStore};

fn sample_records(rows: usize) -> Vec<Record> {
    (0..rows)
        .map(|i| {
            let value = json!({"id": i, "name": format!("row {i}"), "score": i as f64 * 0.5, "active": i % 2 == 0});
            match value {
                Value::Object(map) => map,
                _ => unreachable!(),
            }
        })
        .collect()
}

fn bench_coerce(c: &mut Criterion) {
    let mut group = c.benchmark_group("Coercion");
    group.throughput(Throughput::Elements(1));
    let guard = DtypeGuard::strict();

    group.bench_function("integer_from_string", |b| {
        let raw = json!("12345");
        b.iter(|| black_box(guard.coerce("col", black_box(&raw), DType::Integer).unwrap()))
    });

    group.bench_function("datetime_from_string", |b| {
        let raw = json!("2024-03-01 08:15:00");
        b.iter(|| black_box(guard.coerce("col", black_box(&raw), DType::DateTime).unwrap()))
    });

    group.finish();
}

fn bench_table_ops(c: &mut Criterion) {
    let mut group = c.benchmark_group("Table Operations");
    let records = sample_records(10_000);

    group.bench_function("edit_cell", |b| {
        let mut store = TableStore::new(Table::from_records(&records));
        let guard = DtypeGuard::strict();
        let raw = json!("7");
        b.iter(|| {
            store.edit_cell(black_box(5_000), "id", &raw, &guard).unwrap();
        })
    });

    group.throughput(Throughput::Elements(records.len() as u64));
    group.bench_function("snapshot_10k_rows", |b| {
        let store = TableStore::new(Table::from_records(&records));
        b.iter(|| black_box(store.snapshot()))
    });

    group.bench_function("replace_all_10k_rows", |b| {
        let mut store = TableStore::new(Table::from_records(&records));
        b.iter(|| store.replace_all(black_box(records.clone())).unwrap())
    });

    group.finish();
}

criterion_group!(benches, bench_coerce, bench_table_ops);
criterion_main!(benches);
