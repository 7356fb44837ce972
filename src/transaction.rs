//! Transactions and their lifecycle: lock sets, undo write sets, and the
//! manager that applies commit and rollback logic.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};

use parking_lot::lock_api::RawRwLock as RawRwLockApi;
use parking_lot::RawRwLock;

use crate::btree::{BPlusTree, Key};
use crate::errors::StorageResult;
use crate::failpoint;
use crate::lock_manager::LockManager;
use crate::table_heap::TableHeap;
use crate::tuple::Tuple;
use crate::wal::{LogManager, LogRecord};
use crate::{Lsn, Rid, TxnId, INVALID_LSN};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Growing,
    Shrinking,
    Committed,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteType {
    Insert,
    Delete,
    Update,
}

/// One undoable table mutation. For updates `tuple` holds the old image;
/// for deletes it holds the tuple under the tombstone.
pub struct TableWriteRecord {
    pub rid: Rid,
    pub wtype: WriteType,
    pub tuple: Tuple,
    pub table: Arc<TableHeap>,
}

/// One undoable index mutation. For updates `key` is the new key and
/// `old_key` the one it replaced.
pub struct IndexWriteRecord {
    pub rid: Rid,
    pub wtype: WriteType,
    pub key: Key,
    pub old_key: Option<Key>,
    pub index: Arc<BPlusTree>,
}

pub struct Transaction {
    id: TxnId,
    isolation_level: IsolationLevel,
    state: Mutex<TransactionState>,
    prev_lsn: AtomicI32,
    shared_lock_set: Mutex<HashSet<Rid>>,
    exclusive_lock_set: Mutex<HashSet<Rid>>,
    table_write_set: Mutex<Vec<TableWriteRecord>>,
    index_write_set: Mutex<Vec<IndexWriteRecord>>,
}

impl Transaction {
    fn new(id: TxnId, isolation_level: IsolationLevel) -> Self {
        Self {
            id,
            isolation_level,
            state: Mutex::new(TransactionState::Growing),
            prev_lsn: AtomicI32::new(INVALID_LSN),
            shared_lock_set: Mutex::new(HashSet::new()),
            exclusive_lock_set: Mutex::new(HashSet::new()),
            table_write_set: Mutex::new(Vec::new()),
            index_write_set: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn isolation_level(&self) -> IsolationLevel {
        self.isolation_level
    }

    pub fn state(&self) -> TransactionState {
        *self.state.lock().unwrap()
    }

    pub fn set_state(&self, state: TransactionState) {
        *self.state.lock().unwrap() = state;
    }

    pub fn prev_lsn(&self) -> Lsn {
        self.prev_lsn.load(Ordering::SeqCst)
    }

    pub fn set_prev_lsn(&self, lsn: Lsn) {
        self.prev_lsn.store(lsn, Ordering::SeqCst);
    }

    pub fn is_shared_locked(&self, rid: Rid) -> bool {
        self.shared_lock_set.lock().unwrap().contains(&rid)
    }

    pub fn is_exclusive_locked(&self, rid: Rid) -> bool {
        self.exclusive_lock_set.lock().unwrap().contains(&rid)
    }

    pub(crate) fn add_shared_lock(&self, rid: Rid) {
        self.shared_lock_set.lock().unwrap().insert(rid);
    }

    pub(crate) fn add_exclusive_lock(&self, rid: Rid) {
        self.exclusive_lock_set.lock().unwrap().insert(rid);
    }

    pub(crate) fn promote_lock(&self, rid: Rid) {
        self.shared_lock_set.lock().unwrap().remove(&rid);
        self.exclusive_lock_set.lock().unwrap().insert(rid);
    }

    pub(crate) fn forget_lock(&self, rid: Rid) {
        self.shared_lock_set.lock().unwrap().remove(&rid);
        self.exclusive_lock_set.lock().unwrap().remove(&rid);
    }

    /// Every rid this transaction currently holds in either mode.
    pub fn locked_rids(&self) -> Vec<Rid> {
        let mut rids: Vec<Rid> = self
            .shared_lock_set
            .lock()
            .unwrap()
            .iter()
            .chain(self.exclusive_lock_set.lock().unwrap().iter())
            .copied()
            .collect();
        rids.sort();
        rids.dedup();
        rids
    }

    pub fn append_table_write(&self, record: TableWriteRecord) {
        self.table_write_set.lock().unwrap().push(record);
    }

    pub fn append_index_write(&self, record: IndexWriteRecord) {
        self.index_write_set.lock().unwrap().push(record);
    }

    pub fn table_write_count(&self) -> usize {
        self.table_write_set.lock().unwrap().len()
    }

    fn take_table_writes(&self) -> Vec<TableWriteRecord> {
        std::mem::take(&mut *self.table_write_set.lock().unwrap())
    }

    fn take_index_writes(&self) -> Vec<IndexWriteRecord> {
        std::mem::take(&mut *self.index_write_set.lock().unwrap())
    }

    fn clear_write_sets(&self) {
        self.table_write_set.lock().unwrap().clear();
        self.index_write_set.lock().unwrap().clear();
    }
}

/// The live transaction table, shared between the transaction manager and
/// the deadlock detector.
#[derive(Default)]
pub struct TransactionRegistry {
    map: Mutex<HashMap<TxnId, Arc<Transaction>>>,
}

impl TransactionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, txn_id: TxnId) -> Option<Arc<Transaction>> {
        self.map.lock().unwrap().get(&txn_id).cloned()
    }

    fn insert(&self, txn: Arc<Transaction>) {
        self.map.lock().unwrap().insert(txn.id(), txn);
    }

    fn remove(&self, txn_id: TxnId) {
        self.map.lock().unwrap().remove(&txn_id);
    }

    pub fn active_count(&self) -> usize {
        self.map.lock().unwrap().len()
    }
}

pub struct TransactionManager {
    next_txn_id: AtomicI32,
    registry: Arc<TransactionRegistry>,
    lock_manager: Arc<LockManager>,
    log_manager: Arc<LogManager>,
    /// Held shared from begin() to commit()/abort(); held exclusive to
    /// quiesce every transaction. The hold spans function calls, so the
    /// raw lock is used instead of a scoped guard.
    global_txn_latch: RawRwLock,
}

impl TransactionManager {
    pub fn new(
        registry: Arc<TransactionRegistry>,
        lock_manager: Arc<LockManager>,
        log_manager: Arc<LogManager>,
    ) -> Self {
        Self {
            next_txn_id: AtomicI32::new(0),
            registry,
            lock_manager,
            log_manager,
            global_txn_latch: RawRwLock::INIT,
        }
    }

    pub fn set_next_txn_id(&self, txn_id: TxnId) {
        self.next_txn_id.store(txn_id, Ordering::SeqCst);
    }

    pub fn begin(&self, isolation_level: IsolationLevel) -> Arc<Transaction> {
        self.global_txn_latch.lock_shared();
        let txn_id = self.next_txn_id.fetch_add(1, Ordering::SeqCst);
        let txn = Arc::new(Transaction::new(txn_id, isolation_level));

        if self.log_manager.logging_enabled() {
            let mut record = LogRecord::new_begin(txn_id, txn.prev_lsn());
            let lsn = self.log_manager.append(&mut record);
            txn.set_prev_lsn(lsn);
        }

        self.registry.insert(Arc::clone(&txn));
        crate::stratum_debug_log!("[TxnManager::begin] started txn {txn_id}");
        txn
    }

    /// Commits: the COMMIT record is durable before this returns, then
    /// deferred deletes are applied and every lock is dropped.
    pub fn commit(&self, txn: &Arc<Transaction>) -> StorageResult<()> {
        if let Err(err) = failpoint::trip("txn.commit.before_log") {
            return Err(err.into());
        }
        txn.set_state(TransactionState::Committed);

        if self.log_manager.logging_enabled() {
            let mut record = LogRecord::new_commit(txn.id(), txn.prev_lsn());
            let lsn = self.log_manager.append(&mut record);
            txn.set_prev_lsn(lsn);
            self.log_manager.flush(true);
        }
        if let Err(err) = failpoint::trip("txn.commit.after_log") {
            txn.set_state(TransactionState::Growing);
            return Err(err.into());
        }

        // Mark-deleted tuples become physical deletes now that the commit
        // is durable.
        let writes = txn.take_table_writes();
        for record in writes.iter() {
            if record.wtype == WriteType::Delete {
                record.table.apply_delete(record.rid, txn)?;
            }
        }
        txn.clear_write_sets();

        self.release_locks(txn);
        unsafe { self.global_txn_latch.unlock_shared() };
        self.registry.remove(txn.id());
        crate::stratum_debug_log!("[TxnManager::commit] committed txn {}", txn.id());
        Ok(())
    }

    /// Aborts: table writes are undone newest-first, then index writes,
    /// then locks drop.
    pub fn abort(&self, txn: &Arc<Transaction>) -> StorageResult<()> {
        txn.set_state(TransactionState::Aborted);

        if self.log_manager.logging_enabled() {
            let mut record = LogRecord::new_abort(txn.id(), txn.prev_lsn());
            let lsn = self.log_manager.append(&mut record);
            txn.set_prev_lsn(lsn);
            self.log_manager.flush(true);
        }

        let writes = txn.take_table_writes();
        for record in writes.iter().rev() {
            match record.wtype {
                WriteType::Insert => {
                    record.table.apply_delete(record.rid, txn)?;
                }
                WriteType::Delete => {
                    record.table.rollback_delete(record.rid, txn)?;
                }
                WriteType::Update => {
                    record.table.update_tuple(record.tuple.clone(), record.rid, txn)?;
                }
            }
        }

        let index_writes = txn.take_index_writes();
        for record in index_writes.iter().rev() {
            match record.wtype {
                WriteType::Insert => {
                    record.index.remove(record.key)?;
                }
                WriteType::Delete => {
                    record.index.insert(record.key, record.rid)?;
                }
                WriteType::Update => {
                    record.index.remove(record.key)?;
                    if let Some(old_key) = record.old_key {
                        record.index.insert(old_key, record.rid)?;
                    }
                }
            }
        }
        // The rollback calls above queue fresh undo entries; this
        // transaction is finished with them.
        txn.clear_write_sets();

        self.release_locks(txn);
        unsafe { self.global_txn_latch.unlock_shared() };
        self.registry.remove(txn.id());
        crate::stratum_debug_log!("[TxnManager::abort] aborted txn {}", txn.id());
        Ok(())
    }

    /// Quiesces the system: blocks until every in-flight transaction has
    /// finished and holds off new ones until `resume_all`.
    pub fn block_all(&self) {
        self.global_txn_latch.lock_exclusive();
    }

    pub fn resume_all(&self) {
        unsafe { self.global_txn_latch.unlock_exclusive() };
    }

    fn release_locks(&self, txn: &Arc<Transaction>) {
        for rid in txn.locked_rids() {
            self.lock_manager.unlock(txn, rid);
        }
    }
}
