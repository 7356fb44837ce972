//! Crash recovery: a forward redo pass over the whole log rebuilds page
//! state idempotently (guarded by page LSNs), then an undo pass walks the
//! prev-LSN chain of every transaction that neither committed nor aborted
//! and applies inverse operations.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::buffer_pool::BufferPoolManager;
use crate::disk::DiskManager;
use crate::errors::{StorageError, StorageResult};
use crate::wal::{LogPayload, LogRecord, LogRecordType, DEFAULT_LOG_BUFFER_SIZE};
use crate::{Lsn, Rid, TxnId, INVALID_LSN, INVALID_PAGE_ID, INVALID_TXN_ID};

fn ignore_already_undone(result: StorageResult<()>) -> StorageResult<()> {
    match result {
        Err(StorageError::SlotDeleted) => Ok(()),
        other => other,
    }
}

pub struct LogRecovery {
    disk: Arc<DiskManager>,
    bpm: Arc<BufferPoolManager>,
    /// Transactions with no COMMIT/ABORT on disk, mapped to their last LSN.
    active_txn: HashMap<TxnId, Lsn>,
    /// Transactions that finished; their trailing records (deferred
    /// deletes after COMMIT, rollback writes after ABORT) must not
    /// resurrect them.
    finished_txn: HashSet<TxnId>,
    /// LSN -> byte offset in the log file, for the backward undo walk.
    lsn_mapping: HashMap<Lsn, u64>,
    max_lsn: Lsn,
    max_txn_id: TxnId,
}

impl LogRecovery {
    pub fn new(disk: Arc<DiskManager>, bpm: Arc<BufferPoolManager>) -> Self {
        Self {
            disk,
            bpm,
            active_txn: HashMap::new(),
            finished_txn: HashSet::new(),
            lsn_mapping: HashMap::new(),
            max_lsn: INVALID_LSN,
            max_txn_id: INVALID_TXN_ID,
        }
    }

    /// Highest LSN seen in the log; LSN assignment resumes above it.
    pub fn max_lsn(&self) -> Lsn {
        self.max_lsn
    }

    /// Highest transaction id seen in the log.
    pub fn max_txn_id(&self) -> TxnId {
        self.max_txn_id
    }

    pub fn active_txn_count(&self) -> usize {
        self.active_txn.len()
    }

    /// Scans the log front to back, replaying every page effect whose LSN
    /// is newer than the page's. A record that does not deserialize ends
    /// the scan (torn tail).
    pub fn redo(&mut self) -> StorageResult<()> {
        let mut buffer = vec![0u8; DEFAULT_LOG_BUFFER_SIZE];
        let mut buffer_file_offset: u64 = 0;
        let mut valid = self.disk.read_log(&mut buffer, 0)?;
        let mut pos = 0usize;

        loop {
            match LogRecord::deserialize_from(&buffer[pos..valid]) {
                Some(record) => {
                    self.lsn_mapping
                        .insert(record.lsn, buffer_file_offset + pos as u64);
                    pos += record.size as usize;
                    self.replay(&record)?;
                }
                None => {
                    if pos == 0 {
                        break;
                    }
                    // Slide the unread tail to the front and refill.
                    buffer.copy_within(pos..valid, 0);
                    buffer_file_offset += pos as u64;
                    valid -= pos;
                    pos = 0;
                    let read = self
                        .disk
                        .read_log(&mut buffer[valid..], buffer_file_offset + valid as u64)?;
                    if read == 0 {
                        break;
                    }
                    valid += read;
                }
            }
        }

        // Anything left at the front of the buffer that still does not
        // parse is a torn tail; recovery treats it as never written.
        Ok(())
    }

    fn replay(&mut self, record: &LogRecord) -> StorageResult<()> {
        self.max_lsn = self.max_lsn.max(record.lsn);
        self.max_txn_id = self.max_txn_id.max(record.txn_id);
        if !self.finished_txn.contains(&record.txn_id) {
            self.active_txn.insert(record.txn_id, record.lsn);
        }

        match record.record_type {
            LogRecordType::Begin => Ok(()),
            LogRecordType::Commit | LogRecordType::Abort => {
                self.active_txn.remove(&record.txn_id);
                self.finished_txn.insert(record.txn_id);
                Ok(())
            }
            LogRecordType::NewPage => {
                let LogPayload::NewPage {
                    prev_page_id,
                    page_id,
                } = &record.payload
                else {
                    unreachable!("new-page record without a new-page payload");
                };
                let (prev_page_id, page_id) = (*prev_page_id, *page_id);
                let page_ref = self.bpm.fetch_page(page_id)?;
                let mut page = page_ref.write();
                if record.lsn > page.lsn() {
                    page.init_table_page(page_id, prev_page_id);
                    page.set_lsn(record.lsn);
                    drop(page);
                    if prev_page_id != INVALID_PAGE_ID {
                        let prev_ref = self.bpm.fetch_page(prev_page_id)?;
                        let mut prev = prev_ref.write();
                        if prev.table_next_page_id() != page_id {
                            prev.set_table_next_page_id(page_id);
                        }
                    }
                }
                Ok(())
            }
            LogRecordType::Insert
            | LogRecordType::MarkDelete
            | LogRecordType::ApplyDelete
            | LogRecordType::RollbackDelete => {
                let LogPayload::TupleOp { rid, tuple } = &record.payload else {
                    unreachable!("tuple record without a tuple payload");
                };
                let page_ref = self.bpm.fetch_page(rid.page_id)?;
                let mut page = page_ref.write();
                if record.lsn > page.lsn() {
                    match record.record_type {
                        LogRecordType::Insert => {
                            let slot = page.insert_table_tuple(tuple);
                            debug_assert_eq!(slot, Some(rid.slot_num), "redo drifted from the rid");
                        }
                        LogRecordType::MarkDelete => page.mark_table_delete(rid.slot_num)?,
                        LogRecordType::ApplyDelete => page.apply_table_delete(rid.slot_num)?,
                        LogRecordType::RollbackDelete => page.rollback_table_delete(rid.slot_num)?,
                        _ => unreachable!(),
                    }
                    page.set_lsn(record.lsn);
                }
                Ok(())
            }
            LogRecordType::Update => {
                let LogPayload::Update { rid, new_tuple, .. } = &record.payload else {
                    unreachable!("update record without an update payload");
                };
                let page_ref = self.bpm.fetch_page(rid.page_id)?;
                let mut page = page_ref.write();
                if record.lsn > page.lsn() {
                    page.update_table_tuple(rid.slot_num, new_tuple)?;
                    page.set_lsn(record.lsn);
                }
                Ok(())
            }
            LogRecordType::Invalid => unreachable!("invalid record survived deserialization"),
        }
    }

    /// Rolls back every transaction still active after redo by walking its
    /// prev-LSN chain newest to oldest, stopping at BEGIN. Each rolled-back
    /// transaction gets an ABORT record appended so the next restart does
    /// not undo it again on top of younger committed work.
    pub fn undo(&mut self) -> StorageResult<()> {
        let chains: Vec<(TxnId, Lsn)> = self.active_txn.iter().map(|(&t, &l)| (t, l)).collect();
        for (txn_id, last_lsn) in chains {
            crate::stratum_debug_log!("[LogRecovery::undo] rolling back txn {txn_id}");
            let mut lsn = last_lsn;
            while lsn != INVALID_LSN {
                let offset = *self
                    .lsn_mapping
                    .get(&lsn)
                    .expect("undo chain points at an unscanned lsn");
                let record = self.read_record_at(offset)?;
                assert_eq!(record.lsn, lsn, "lsn mapping out of sync with the log");
                lsn = record.prev_lsn;
                self.apply_inverse(&record)?;
            }
            self.append_abort_record(txn_id, last_lsn)?;
        }
        self.active_txn.clear();
        self.lsn_mapping.clear();
        Ok(())
    }

    fn append_abort_record(&mut self, txn_id: TxnId, prev_lsn: Lsn) -> StorageResult<()> {
        let mut record = LogRecord::new_abort(txn_id, prev_lsn);
        self.max_lsn += 1;
        record.lsn = self.max_lsn;
        let mut buf = vec![0u8; record.size as usize];
        record.serialize_to(&mut buf);
        self.disk.write_log(&buf)?;
        Ok(())
    }

    fn read_record_at(&self, offset: u64) -> StorageResult<LogRecord> {
        // Large enough for the biggest record: an update carrying two
        // page-sized tuple images.
        let mut buffer = vec![0u8; crate::PAGE_SIZE * 3];
        let read = self.disk.read_log(&mut buffer, offset)?;
        Ok(LogRecord::deserialize_from(&buffer[..read])
            .expect("mapped log record no longer parses"))
    }

    fn apply_inverse(&mut self, record: &LogRecord) -> StorageResult<()> {
        match record.record_type {
            LogRecordType::Begin => {
                assert_eq!(record.prev_lsn, INVALID_LSN);
                Ok(())
            }
            LogRecordType::Commit | LogRecordType::Abort => {
                unreachable!("finished transaction in the undo set")
            }
            LogRecordType::NewPage => {
                let LogPayload::NewPage {
                    prev_page_id,
                    page_id,
                } = &record.payload
                else {
                    unreachable!();
                };
                let (prev_page_id, page_id) = (*prev_page_id, *page_id);
                if !self.bpm.delete_page(page_id)? {
                    self.bpm.disk().deallocate_page(page_id);
                }
                if prev_page_id != INVALID_PAGE_ID {
                    let prev_ref = self.bpm.fetch_page(prev_page_id)?;
                    let mut prev = prev_ref.write();
                    if prev.table_next_page_id() == page_id {
                        prev.set_table_next_page_id(INVALID_PAGE_ID);
                    }
                }
                Ok(())
            }
            // The same log is replayed by every restart until a checkpoint
            // truncates it, so undoing an already-undone slot is expected
            // and must be a no-op.
            LogRecordType::Insert => self.with_page(record, |page, rid, _| {
                ignore_already_undone(page.apply_table_delete(rid.slot_num))
            }),
            LogRecordType::MarkDelete => self.with_page(record, |page, rid, _| {
                page.rollback_table_delete(rid.slot_num)
            }),
            LogRecordType::ApplyDelete => self.with_page(record, |page, rid, tuple| {
                let slot = page.insert_table_tuple(tuple);
                debug_assert!(slot.is_some(), "undo of a physical delete found no room");
                Ok(())
            }),
            LogRecordType::RollbackDelete => self.with_page(record, |page, rid, _| {
                ignore_already_undone(page.mark_table_delete(rid.slot_num))
            }),
            LogRecordType::Update => {
                let LogPayload::Update { rid, old_tuple, .. } = &record.payload else {
                    unreachable!();
                };
                let page_ref = self.bpm.fetch_page(rid.page_id)?;
                let mut page = page_ref.write();
                page.update_table_tuple(rid.slot_num, old_tuple)?;
                Ok(())
            }
            LogRecordType::Invalid => unreachable!(),
        }
    }

    fn with_page<F>(&self, record: &LogRecord, op: F) -> StorageResult<()>
    where
        F: FnOnce(&mut crate::Page, Rid, &crate::Tuple) -> StorageResult<()>,
    {
        let LogPayload::TupleOp { rid, tuple } = &record.payload else {
            unreachable!("tuple record without a tuple payload");
        };
        let page_ref = self.bpm.fetch_page(rid.page_id)?;
        let mut page = page_ref.write();
        op(&mut page, *rid, tuple)
    }
}
