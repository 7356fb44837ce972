use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::sync::Arc;
use stratum::btree::BPlusTree;
use stratum::engine::{EngineOptions, StorageEngine};
use stratum::table_heap::TableHeap;
use stratum::transaction::IsolationLevel;
use stratum::Tuple;
use tempfile::TempDir;

fn setup_engine() -> (TempDir, Arc<StorageEngine>, Arc<TableHeap>, Arc<BPlusTree>) {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("bench.db");
    let log_path = temp_dir.path().join("bench.log");
    let engine = StorageEngine::open(&db_path, &log_path, EngineOptions::default()).unwrap();

    let txn = engine.begin(IsolationLevel::RepeatableRead);
    let heap = engine.create_table("bench", &txn).unwrap();
    let index = engine.open_index("bench_pk").unwrap();
    for i in 0..1000 {
        let rid = heap
            .insert_tuple(Tuple::from(format!("row-{i}").into_bytes()), &txn)
            .unwrap();
        index.insert(i, rid).unwrap();
    }
    engine.transaction_manager().commit(&txn).unwrap();

    (temp_dir, engine, heap, index)
}

fn benchmark_heap_insert(c: &mut Criterion) {
    let (_dir, engine, heap, _index) = setup_engine();

    c.bench_function("heap_insert_commit", |b| {
        b.iter(|| {
            let txn = engine.begin(IsolationLevel::RepeatableRead);
            let rid = heap
                .insert_tuple(black_box(Tuple::from(&b"benchmark payload"[..])), &txn)
                .unwrap();
            engine.transaction_manager().commit(&txn).unwrap();
            rid
        })
    });
}

fn benchmark_index_lookup(c: &mut Criterion) {
    let (_dir, _engine, _heap, index) = setup_engine();

    c.bench_function("btree_point_lookup", |b| {
        let mut key = 0;
        b.iter(|| {
            key = (key + 7) % 1000;
            index.get(black_box(key)).unwrap()
        })
    });
}

fn benchmark_index_scan(c: &mut Criterion) {
    let (_dir, _engine, _heap, index) = setup_engine();

    c.bench_function("btree_full_scan", |b| {
        b.iter(|| {
            let count = index.iter().unwrap().count();
            assert_eq!(count, 1000);
            count
        })
    });
}

fn benchmark_heap_scan(c: &mut Criterion) {
    let (_dir, engine, heap, _index) = setup_engine();

    c.bench_function("heap_full_scan", |b| {
        b.iter(|| {
            let txn = engine.begin(IsolationLevel::RepeatableRead);
            let count = heap.iter(&txn).count();
            engine.transaction_manager().commit(&txn).unwrap();
            count
        })
    });
}

criterion_group!(
    benches,
    benchmark_heap_insert,
    benchmark_index_lookup,
    benchmark_index_scan,
    benchmark_heap_scan
);
criterion_main!(benches);
