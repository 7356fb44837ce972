mod common;

use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serial_test::serial;
use stratum::errors::{AbortReason, StorageError};
use stratum::failpoint;
use stratum::transaction::{IsolationLevel, TransactionState};
use stratum::{Rid, Tuple};

use common::{open_engine, small_tree_options, test_db};

fn tuple(text: &str) -> Tuple {
    Tuple::from(text.as_bytes())
}

#[test]
#[serial]
fn test_shared_blocks_behind_exclusive() {
    let db = test_db("lock_sx");
    let engine = open_engine(&db, small_tree_options());
    let lm = Arc::clone(engine.lock_manager());
    let rid = Rid::new(1, 1);

    let txn_a = engine.begin(IsolationLevel::RepeatableRead);
    let txn_b = engine.begin(IsolationLevel::RepeatableRead);
    assert!(lm.lock_exclusive(&txn_a, rid).unwrap());

    let (granted_tx, granted_rx) = mpsc::channel();
    let waiter = {
        let lm = Arc::clone(&lm);
        let txn_b = Arc::clone(&txn_b);
        thread::spawn(move || {
            let granted = lm.lock_shared(&txn_b, rid).unwrap();
            granted_tx.send(granted).unwrap();
        })
    };

    // B stays parked while A owns the exclusive lock.
    assert!(granted_rx.recv_timeout(Duration::from_millis(200)).is_err());
    lm.unlock(&txn_a, rid);
    assert!(granted_rx.recv_timeout(Duration::from_secs(5)).unwrap());
    waiter.join().unwrap();
    assert!(txn_b.is_shared_locked(rid));

    engine.commit(&txn_a).unwrap();
    engine.commit(&txn_b).unwrap();
    engine.shutdown().unwrap();
}

#[test]
fn test_repeatable_read_is_two_phase() {
    let db = test_db("lock_2pl");
    let engine = open_engine(&db, small_tree_options());
    let lm = engine.lock_manager();

    let txn = engine.begin(IsolationLevel::RepeatableRead);
    assert!(lm.lock_shared(&txn, Rid::new(1, 0)).unwrap());
    lm.unlock(&txn, Rid::new(1, 0));
    assert_eq!(txn.state(), TransactionState::Shrinking);

    let err = lm.lock_shared(&txn, Rid::new(1, 1)).unwrap_err();
    assert!(matches!(
        err,
        StorageError::Abort {
            reason: AbortReason::LockOnShrinking,
            ..
        }
    ));
    assert_eq!(txn.state(), TransactionState::Aborted);
    engine.abort(&txn).unwrap();
    engine.shutdown().unwrap();
}

#[test]
fn test_read_uncommitted_rejects_shared_locks() {
    let db = test_db("lock_ru");
    let engine = open_engine(&db, small_tree_options());

    let txn = engine.begin(IsolationLevel::ReadUncommitted);
    let err = engine
        .lock_manager()
        .lock_shared(&txn, Rid::new(1, 0))
        .unwrap_err();
    assert!(matches!(
        err,
        StorageError::Abort {
            reason: AbortReason::LockSharedOnReadUncommitted,
            ..
        }
    ));
    engine.abort(&txn).unwrap();
    engine.shutdown().unwrap();
}

#[test]
#[serial]
fn test_upgrade_waits_for_other_sharers() {
    let db = test_db("lock_upgrade");
    let engine = open_engine(&db, small_tree_options());
    let lm = Arc::clone(engine.lock_manager());
    let rid = Rid::new(2, 0);

    let txn_a = engine.begin(IsolationLevel::RepeatableRead);
    let txn_b = engine.begin(IsolationLevel::RepeatableRead);
    assert!(lm.lock_shared(&txn_a, rid).unwrap());
    assert!(lm.lock_shared(&txn_b, rid).unwrap());

    let (done_tx, done_rx) = mpsc::channel();
    let upgrader = {
        let lm = Arc::clone(&lm);
        let txn_a = Arc::clone(&txn_a);
        thread::spawn(move || {
            let granted = lm.lock_upgrade(&txn_a, rid).unwrap();
            done_tx.send(granted).unwrap();
        })
    };

    assert!(done_rx.recv_timeout(Duration::from_millis(200)).is_err());
    lm.unlock(&txn_b, rid);
    assert!(done_rx.recv_timeout(Duration::from_secs(5)).unwrap());
    upgrader.join().unwrap();
    assert!(txn_a.is_exclusive_locked(rid));
    assert!(!txn_a.is_shared_locked(rid));

    engine.commit(&txn_a).unwrap();
    engine.commit(&txn_b).unwrap();
    engine.shutdown().unwrap();
}

#[test]
#[serial]
fn test_second_upgrade_conflicts() {
    let db = test_db("lock_upgrade_conflict");
    let engine = open_engine(&db, small_tree_options());
    let lm = Arc::clone(engine.lock_manager());
    let rid = Rid::new(2, 1);

    let txn_a = engine.begin(IsolationLevel::RepeatableRead);
    let txn_b = engine.begin(IsolationLevel::RepeatableRead);
    assert!(lm.lock_shared(&txn_a, rid).unwrap());
    assert!(lm.lock_shared(&txn_b, rid).unwrap());

    let first = {
        let lm = Arc::clone(&lm);
        let txn_a = Arc::clone(&txn_a);
        thread::spawn(move || lm.lock_upgrade(&txn_a, rid))
    };
    thread::sleep(Duration::from_millis(100));

    let err = lm.lock_upgrade(&txn_b, rid).unwrap_err();
    assert!(matches!(
        err,
        StorageError::Abort {
            reason: AbortReason::UpgradeConflict,
            ..
        }
    ));
    engine.abort(&txn_b).unwrap();

    // With B gone, A's upgrade completes.
    assert!(first.join().unwrap().unwrap());
    engine.commit(&txn_a).unwrap();
    engine.shutdown().unwrap();
}

#[test]
#[serial]
fn test_deadlock_aborts_youngest() {
    let db = test_db("lock_deadlock");
    let engine = open_engine(&db, small_tree_options());
    let lm = Arc::clone(engine.lock_manager());
    let r1 = Rid::new(3, 0);
    let r2 = Rid::new(3, 1);

    let txn_a = engine.begin(IsolationLevel::RepeatableRead);
    let txn_b = engine.begin(IsolationLevel::RepeatableRead);
    assert!(txn_a.id() < txn_b.id());
    assert!(lm.lock_exclusive(&txn_a, r1).unwrap());
    assert!(lm.lock_exclusive(&txn_b, r2).unwrap());

    let older = {
        let lm = Arc::clone(&lm);
        let txn_a = Arc::clone(&txn_a);
        thread::spawn(move || lm.lock_exclusive(&txn_a, r2))
    };
    thread::sleep(Duration::from_millis(50));
    let younger = {
        let lm = Arc::clone(&lm);
        let txn_b = Arc::clone(&txn_b);
        thread::spawn(move || lm.lock_exclusive(&txn_b, r1))
    };

    // The detector victimizes the larger transaction id.
    let err = younger.join().unwrap().unwrap_err();
    assert!(matches!(
        err,
        StorageError::Abort {
            reason: AbortReason::Deadlock,
            ..
        }
    ));
    assert_eq!(txn_b.state(), TransactionState::Aborted);
    engine.abort(&txn_b).unwrap();

    assert!(older.join().unwrap().unwrap());
    engine.commit(&txn_a).unwrap();
    engine.shutdown().unwrap();
}

#[test]
fn test_commit_keeps_writes_and_applies_deletes() {
    let db = test_db("txn_commit");
    let engine = open_engine(&db, small_tree_options());

    let setup = engine.begin(IsolationLevel::RepeatableRead);
    let heap = engine.create_table("accounts", &setup).unwrap();
    let r1 = heap.insert_tuple(tuple("alice"), &setup).unwrap();
    let r2 = heap.insert_tuple(tuple("bob"), &setup).unwrap();
    engine.commit(&setup).unwrap();

    let txn = engine.begin(IsolationLevel::RepeatableRead);
    heap.mark_delete(r2, &txn).unwrap();
    // Still tombstoned, not yet compacted.
    assert!(matches!(
        heap.get_tuple(r2, &txn),
        Err(StorageError::SlotDeleted)
    ));
    engine.commit(&txn).unwrap();

    let check = engine.begin(IsolationLevel::RepeatableRead);
    assert_eq!(heap.get_tuple(r1, &check).unwrap(), tuple("alice"));
    assert!(matches!(
        heap.get_tuple(r2, &check),
        Err(StorageError::SlotDeleted)
    ));
    let live: Vec<_> = heap.iter(&check).collect();
    assert_eq!(live, vec![(r1, tuple("alice"))]);
    engine.commit(&check).unwrap();
    engine.shutdown().unwrap();
}

#[test]
fn test_abort_rolls_back_table_writes() {
    let db = test_db("txn_abort");
    let engine = open_engine(&db, small_tree_options());

    let setup = engine.begin(IsolationLevel::RepeatableRead);
    let heap = engine.create_table("accounts", &setup).unwrap();
    let r1 = heap.insert_tuple(tuple("original"), &setup).unwrap();
    let r2 = heap.insert_tuple(tuple("victim"), &setup).unwrap();
    engine.commit(&setup).unwrap();

    let txn = engine.begin(IsolationLevel::RepeatableRead);
    let r3 = heap.insert_tuple(tuple("phantom"), &txn).unwrap();
    heap.update_tuple(tuple("scribbled"), r1, &txn).unwrap();
    heap.mark_delete(r2, &txn).unwrap();
    assert_eq!(txn.table_write_count(), 3);
    engine.abort(&txn).unwrap();

    let check = engine.begin(IsolationLevel::RepeatableRead);
    assert_eq!(heap.get_tuple(r1, &check).unwrap(), tuple("original"));
    assert_eq!(heap.get_tuple(r2, &check).unwrap(), tuple("victim"));
    assert!(matches!(
        heap.get_tuple(r3, &check),
        Err(StorageError::SlotDeleted)
    ));
    engine.commit(&check).unwrap();
    engine.shutdown().unwrap();
}

#[test]
fn test_abort_reverses_index_writes() {
    let db = test_db("txn_index_abort");
    let engine = open_engine(&db, small_tree_options());
    let tree = engine.open_index("pk").unwrap();

    let setup = engine.begin(IsolationLevel::RepeatableRead);
    tree.insert_entry(1, Rid::new(10, 0), &setup).unwrap();
    tree.insert_entry(2, Rid::new(10, 1), &setup).unwrap();
    engine.commit(&setup).unwrap();

    let txn = engine.begin(IsolationLevel::RepeatableRead);
    tree.insert_entry(3, Rid::new(10, 2), &txn).unwrap();
    tree.delete_entry(1, Rid::new(10, 0), &txn).unwrap();
    tree.update_entry(2, 20, Rid::new(10, 1), &txn).unwrap();
    engine.abort(&txn).unwrap();

    assert_eq!(tree.get(3).unwrap(), None);
    assert_eq!(tree.get(1).unwrap(), Some(Rid::new(10, 0)));
    assert_eq!(tree.get(2).unwrap(), Some(Rid::new(10, 1)));
    assert_eq!(tree.get(20).unwrap(), None);
    tree.validate().unwrap();
    engine.shutdown().unwrap();
}

#[test]
fn test_update_preserves_rid_or_reports_overflow() {
    let db = test_db("txn_update");
    let engine = open_engine(&db, small_tree_options());

    let setup = engine.begin(IsolationLevel::RepeatableRead);
    let heap = engine.create_table("t", &setup).unwrap();
    let rid = heap.insert_tuple(tuple("short"), &setup).unwrap();
    engine.commit(&setup).unwrap();

    let txn = engine.begin(IsolationLevel::RepeatableRead);
    heap.update_tuple(tuple("a bit longer value"), rid, &txn)
        .unwrap();
    assert_eq!(
        heap.get_tuple(rid, &txn).unwrap(),
        tuple("a bit longer value")
    );

    // A tuple that cannot fit any page is refused outright.
    let huge = Tuple::from(vec![0u8; stratum::PAGE_SIZE]);
    assert!(matches!(
        heap.update_tuple(huge, rid, &txn),
        Err(StorageError::SlotSizeExceeded)
    ));
    engine.commit(&txn).unwrap();
    engine.shutdown().unwrap();
}

#[test]
fn test_commit_failpoints_keep_transaction_alive() {
    let db = test_db("txn_failpoint");
    let engine = open_engine(&db, small_tree_options());

    let txn = engine.begin(IsolationLevel::RepeatableRead);
    failpoint::disarm_all();
    failpoint::arm("txn.commit.before_log");
    assert!(engine.commit(&txn).is_err());
    assert_eq!(txn.state(), TransactionState::Growing);

    failpoint::arm("txn.commit.after_log");
    assert!(engine.commit(&txn).is_err());
    assert_eq!(txn.state(), TransactionState::Growing);

    // Both shots are spent, so the same transaction now commits.
    engine.commit(&txn).unwrap();
    engine.shutdown().unwrap();
}
