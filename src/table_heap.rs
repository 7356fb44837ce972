//! The table heap: a doubly linked list of slot pages with tuple-level
//! operations threaded through transactions, the lock manager and the log.

use std::sync::Arc;

use crate::buffer_pool::BufferPoolManager;
use crate::errors::{StorageError, StorageResult};
use crate::lock_manager::LockManager;
use crate::transaction::{TableWriteRecord, Transaction, WriteType};
use crate::tuple::Tuple;
use crate::wal::{LogManager, LogRecord, LogRecordType};
use crate::{Page, PageId, Rid, INVALID_PAGE_ID};

pub struct TableHeap {
    bpm: Arc<BufferPoolManager>,
    log: Arc<LogManager>,
    lock: Arc<LockManager>,
    first_page_id: PageId,
}

impl TableHeap {
    /// Creates a heap with one empty page, logged as a NEW_PAGE so crash
    /// recovery can rebuild or unwind it.
    pub fn create(
        bpm: Arc<BufferPoolManager>,
        log: Arc<LogManager>,
        lock: Arc<LockManager>,
        txn: &Arc<Transaction>,
    ) -> StorageResult<Arc<Self>> {
        let page_ref = bpm.new_page()?;
        let first_page_id = page_ref.page_id();
        {
            let mut page = page_ref.write();
            page.init_table_page(first_page_id, INVALID_PAGE_ID);
            if log.logging_enabled() {
                let mut record =
                    LogRecord::new_new_page(txn.id(), txn.prev_lsn(), INVALID_PAGE_ID, first_page_id);
                let lsn = log.append(&mut record);
                page.set_lsn(lsn);
                txn.set_prev_lsn(lsn);
            }
        }
        crate::stratum_debug_log!("[TableHeap::create] first page {first_page_id}");
        Ok(Arc::new(Self {
            bpm,
            log,
            lock,
            first_page_id,
        }))
    }

    /// Re-opens an existing heap by its first page id.
    pub fn open(
        bpm: Arc<BufferPoolManager>,
        log: Arc<LogManager>,
        lock: Arc<LockManager>,
        first_page_id: PageId,
    ) -> Arc<Self> {
        Arc::new(Self {
            bpm,
            log,
            lock,
            first_page_id,
        })
    }

    pub fn first_page_id(&self) -> PageId {
        self.first_page_id
    }

    /// Inserts the tuple into the first page with room, extending the page
    /// chain if none has any. On success the rid is X-locked and an undo
    /// entry is queued on the transaction.
    pub fn insert_tuple(
        self: &Arc<Self>,
        tuple: Tuple,
        txn: &Arc<Transaction>,
    ) -> StorageResult<Rid> {
        if tuple.len() > crate::table_page::MAX_TUPLE_SIZE {
            return Err(StorageError::SlotSizeExceeded);
        }

        let mut page_ref = self.bpm.fetch_page(self.first_page_id)?;
        let rid = loop {
            let mut page = page_ref.write();
            if let Some(slot_num) = page.insert_table_tuple(&tuple) {
                let rid = Rid::new(page_ref.page_id(), slot_num);
                self.log_tuple_op(txn, LogRecordType::Insert, rid, tuple.clone(), &mut page);
                break rid;
            }

            let next_page_id = page.table_next_page_id();
            if next_page_id != INVALID_PAGE_ID {
                drop(page);
                page_ref = self.bpm.fetch_page(next_page_id)?;
                continue;
            }

            // End of the chain: splice in a fresh page while still holding
            // the tail's latch so no one else extends it concurrently.
            let new_ref = self.bpm.new_page()?;
            {
                let mut new_page = new_ref.write();
                new_page.init_table_page(new_ref.page_id(), page_ref.page_id());
                if self.log.logging_enabled() {
                    let mut record = LogRecord::new_new_page(
                        txn.id(),
                        txn.prev_lsn(),
                        page_ref.page_id(),
                        new_ref.page_id(),
                    );
                    let lsn = self.log.append(&mut record);
                    new_page.set_lsn(lsn);
                    txn.set_prev_lsn(lsn);
                }
            }
            page.set_table_next_page_id(new_ref.page_id());
            drop(page);
            page_ref = new_ref;
        };

        self.lock.lock_exclusive(txn, rid)?;
        txn.append_table_write(TableWriteRecord {
            rid,
            wtype: WriteType::Insert,
            tuple,
            table: Arc::clone(self),
        });
        Ok(rid)
    }

    /// Reads the tuple at `rid`. The caller is responsible for holding a
    /// lock appropriate to its isolation level.
    pub fn get_tuple(&self, rid: Rid, _txn: &Arc<Transaction>) -> StorageResult<Tuple> {
        let page_ref = self.bpm.fetch_page(rid.page_id)?;
        let page = page_ref.read();
        page.get_table_tuple(rid.slot_num)
    }

    /// Logically deletes the tuple: the slot is tombstoned, the physical
    /// removal happens at commit.
    pub fn mark_delete(self: &Arc<Self>, rid: Rid, txn: &Arc<Transaction>) -> StorageResult<()> {
        self.acquire_exclusive(txn, rid)?;

        let page_ref = self.bpm.fetch_page(rid.page_id)?;
        let mut page = page_ref.write();
        let tuple = page.get_table_tuple(rid.slot_num)?;
        page.mark_table_delete(rid.slot_num)?;
        self.log_tuple_op(txn, LogRecordType::MarkDelete, rid, tuple.clone(), &mut page);
        drop(page);

        txn.append_table_write(TableWriteRecord {
            rid,
            wtype: WriteType::Delete,
            tuple,
            table: Arc::clone(self),
        });
        Ok(())
    }

    /// Commit-time physical removal of a mark-deleted tuple. Also the undo
    /// of an insert, in which case the slot was never tombstoned.
    pub fn apply_delete(&self, rid: Rid, txn: &Arc<Transaction>) -> StorageResult<()> {
        let page_ref = self.bpm.fetch_page(rid.page_id)?;
        let mut page = page_ref.write();
        let tuple = page.get_table_tuple_any(rid.slot_num)?;
        page.apply_table_delete(rid.slot_num)?;
        self.log_tuple_op(txn, LogRecordType::ApplyDelete, rid, tuple, &mut page);
        Ok(())
    }

    /// Abort-time reversal of a mark-delete.
    pub fn rollback_delete(&self, rid: Rid, txn: &Arc<Transaction>) -> StorageResult<()> {
        let page_ref = self.bpm.fetch_page(rid.page_id)?;
        let mut page = page_ref.write();
        page.rollback_table_delete(rid.slot_num)?;
        let tuple = page.get_table_tuple(rid.slot_num)?;
        self.log_tuple_op(txn, LogRecordType::RollbackDelete, rid, tuple, &mut page);
        Ok(())
    }

    /// Replaces the tuple in place. The rid is preserved; if the page
    /// cannot absorb the new length this fails with `SlotSizeExceeded` and
    /// the caller may fall back to delete + insert under a fresh rid.
    pub fn update_tuple(
        self: &Arc<Self>,
        new_tuple: Tuple,
        rid: Rid,
        txn: &Arc<Transaction>,
    ) -> StorageResult<()> {
        self.acquire_exclusive(txn, rid)?;

        let page_ref = self.bpm.fetch_page(rid.page_id)?;
        let mut page = page_ref.write();
        let old_tuple = page.update_table_tuple(rid.slot_num, &new_tuple)?;
        if self.log.logging_enabled() {
            let mut record = LogRecord::new_update(
                txn.id(),
                txn.prev_lsn(),
                rid,
                old_tuple.clone(),
                new_tuple,
            );
            let lsn = self.log.append(&mut record);
            page.set_lsn(lsn);
            txn.set_prev_lsn(lsn);
        }
        drop(page);

        txn.append_table_write(TableWriteRecord {
            rid,
            wtype: WriteType::Update,
            tuple: old_tuple,
            table: Arc::clone(self),
        });
        Ok(())
    }

    /// A pull-based cursor over every live tuple, in page-chain order.
    pub fn iter(self: &Arc<Self>, _txn: &Arc<Transaction>) -> TableIterator {
        TableIterator {
            heap: Arc::clone(self),
            page_id: self.first_page_id,
            slot_num: 0,
        }
    }

    fn acquire_exclusive(&self, txn: &Arc<Transaction>, rid: Rid) -> StorageResult<()> {
        if txn.is_exclusive_locked(rid) {
            return Ok(());
        }
        if txn.is_shared_locked(rid) {
            self.lock.lock_upgrade(txn, rid)?;
        } else {
            self.lock.lock_exclusive(txn, rid)?;
        }
        Ok(())
    }

    fn log_tuple_op(
        &self,
        txn: &Arc<Transaction>,
        record_type: LogRecordType,
        rid: Rid,
        tuple: Tuple,
        page: &mut Page,
    ) {
        if !self.log.logging_enabled() {
            return;
        }
        let mut record = LogRecord::new_tuple_op(txn.id(), txn.prev_lsn(), record_type, rid, tuple);
        let lsn = self.log.append(&mut record);
        page.set_lsn(lsn);
        txn.set_prev_lsn(lsn);
    }
}

/// Iterates `(rid, tuple)` pairs, skipping tombstoned and vacated slots.
/// Pages are pinned only for the duration of each step.
pub struct TableIterator {
    heap: Arc<TableHeap>,
    page_id: PageId,
    slot_num: u32,
}

impl Iterator for TableIterator {
    type Item = (Rid, Tuple);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.page_id == INVALID_PAGE_ID {
                return None;
            }
            let page_ref = match self.heap.bpm.fetch_page(self.page_id) {
                Ok(page_ref) => page_ref,
                Err(err) => {
                    crate::stratum_debug_log!("[TableIterator] fetch failed: {err}");
                    return None;
                }
            };
            let page = page_ref.read();
            let count = page.table_tuple_count();
            while self.slot_num < count {
                let slot_num = self.slot_num;
                self.slot_num += 1;
                if let Ok(tuple) = page.get_table_tuple(slot_num) {
                    return Some((Rid::new(self.page_id, slot_num), tuple));
                }
            }
            self.page_id = page.table_next_page_id();
            self.slot_num = 0;
        }
    }
}
