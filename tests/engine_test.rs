mod common;

use std::sync::Arc;

use stratum::errors::StorageError;
use stratum::transaction::IsolationLevel;
use stratum::Tuple;

use common::{lazy_flush_options, open_engine, small_tree_options, test_db};

fn tuple(text: &str) -> Tuple {
    Tuple::from(text.as_bytes())
}

/// The WAL invariant: a dirty page never reaches disk before the log
/// record that dirtied it.
#[test]
fn test_log_forced_before_page_write() {
    let db = test_db("engine_wal");
    let engine = open_engine(&db, lazy_flush_options());
    let log = Arc::clone(engine.log_manager());

    let txn = engine.begin(IsolationLevel::RepeatableRead);
    let heap = engine.create_table("t", &txn).unwrap();
    let rid = heap.insert_tuple(tuple("payload"), &txn).unwrap();

    let page_lsn = {
        let page_ref = engine.buffer_pool().fetch_page(rid.page_id).unwrap();
        let lsn = page_ref.read().lsn();
        lsn
    };
    // The flusher is effectively asleep, so the record is still buffered.
    assert!(log.persistent_lsn() < page_lsn);

    engine.buffer_pool().flush_page(rid.page_id).unwrap();
    assert!(log.persistent_lsn() >= page_lsn);

    engine.commit(&txn).unwrap();
    engine.shutdown().unwrap();
}

#[test]
fn test_pool_exhaustion_is_reported() {
    let db = test_db("engine_frames");
    let engine = open_engine(
        &db,
        stratum::engine::EngineOptions {
            buffer_pool_size: 2,
            ..small_tree_options()
        },
    );
    let bpm = engine.buffer_pool();

    let _held_a = bpm.fetch_page(0).unwrap();
    let _held_b = bpm.new_page().unwrap();
    assert!(matches!(bpm.new_page(), Err(StorageError::OutOfMemory)));
    assert!(matches!(bpm.fetch_page(50), Err(StorageError::OutOfFrames)));

    drop(_held_a);
    assert!(bpm.fetch_page(50).is_ok());
    engine.shutdown().unwrap();
}

#[test]
fn test_heap_scan_spans_pages() {
    let db = test_db("engine_scan");
    let engine = open_engine(&db, small_tree_options());

    let txn = engine.begin(IsolationLevel::RepeatableRead);
    let heap = engine.create_table("t", &txn).unwrap();
    let payload = Tuple::from(vec![b'v'; 512]);
    let mut rids = Vec::new();
    for _ in 0..50 {
        rids.push(heap.insert_tuple(payload.clone(), &txn).unwrap());
    }
    engine.commit(&txn).unwrap();

    // 50 half-KB tuples cannot share one 4 KB page.
    assert!(rids.iter().any(|rid| rid.page_id != rids[0].page_id));

    let check = engine.begin(IsolationLevel::RepeatableRead);
    let scanned: Vec<_> = heap.iter(&check).map(|(rid, _)| rid).collect();
    assert_eq!(scanned, rids);
    engine.commit(&check).unwrap();
    engine.shutdown().unwrap();
}

/// Checkpoint flushes everything, so even a crash right after it loses
/// nothing, including the header-page registrations.
#[test]
fn test_checkpoint_then_crash() {
    let db = test_db("engine_checkpoint");
    let rid;
    {
        let engine = open_engine(&db, small_tree_options());
        let txn = engine.begin(IsolationLevel::RepeatableRead);
        let heap = engine.create_table("inventory", &txn).unwrap();
        rid = heap.insert_tuple(tuple("widget"), &txn).unwrap();
        engine.commit(&txn).unwrap();
        engine.checkpoint().unwrap();
        // Crash without shutdown.
    }

    let engine = open_engine(&db, small_tree_options());
    let heap = engine
        .open_table("inventory")
        .unwrap()
        .expect("checkpoint persisted the table registration");
    let txn = engine.begin(IsolationLevel::RepeatableRead);
    assert_eq!(heap.get_tuple(rid, &txn).unwrap(), tuple("widget"));
    engine.commit(&txn).unwrap();
    engine.shutdown().unwrap();
}

#[test]
fn test_open_table_round_trip() {
    let db = test_db("engine_tables");
    let engine = open_engine(&db, small_tree_options());

    assert!(engine.open_table("nope").unwrap().is_none());

    let txn = engine.begin(IsolationLevel::RepeatableRead);
    let heap = engine.create_table("users", &txn).unwrap();
    let rid = heap.insert_tuple(tuple("ada"), &txn).unwrap();
    engine.commit(&txn).unwrap();

    let reopened = engine.open_table("users").unwrap().unwrap();
    assert_eq!(reopened.first_page_id(), heap.first_page_id());
    let check = engine.begin(IsolationLevel::RepeatableRead);
    assert_eq!(reopened.get_tuple(rid, &check).unwrap(), tuple("ada"));
    engine.commit(&check).unwrap();
    engine.shutdown().unwrap();
}
