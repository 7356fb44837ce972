//! The engine root object: owns every subsystem, runs recovery on open,
//! and provides the shutdown/checkpoint hooks.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::btree::{BPlusTree, INTERNAL_PAGE_CAPACITY, LEAF_PAGE_CAPACITY};
use crate::buffer_pool::{BufferPoolManager, DEFAULT_POOL_SIZE};
use crate::disk::DiskManager;
use crate::errors::StorageResult;
use crate::header_page;
use crate::lock_manager::{LockManager, DEFAULT_CYCLE_DETECTION_INTERVAL};
use crate::recovery::LogRecovery;
use crate::table_heap::TableHeap;
use crate::transaction::{
    IsolationLevel, Transaction, TransactionManager, TransactionRegistry,
};
use crate::wal::{LogManager, DEFAULT_LOG_BUFFER_SIZE, DEFAULT_LOG_TIMEOUT};

#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub buffer_pool_size: usize,
    pub log_buffer_size: usize,
    pub log_timeout: Duration,
    pub leaf_max_size: i32,
    pub internal_max_size: i32,
    pub cycle_detection_interval: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            buffer_pool_size: DEFAULT_POOL_SIZE,
            log_buffer_size: DEFAULT_LOG_BUFFER_SIZE,
            log_timeout: DEFAULT_LOG_TIMEOUT,
            leaf_max_size: LEAF_PAGE_CAPACITY as i32,
            internal_max_size: INTERNAL_PAGE_CAPACITY as i32,
            cycle_detection_interval: DEFAULT_CYCLE_DETECTION_INTERVAL,
        }
    }
}

pub struct StorageEngine {
    disk: Arc<DiskManager>,
    log: Arc<LogManager>,
    bpm: Arc<BufferPoolManager>,
    registry: Arc<TransactionRegistry>,
    lock: Arc<LockManager>,
    txn_manager: Arc<TransactionManager>,
    options: EngineOptions,
}

impl StorageEngine {
    /// Opens the database, replaying the log (redo then undo) with
    /// logging disabled, then starts the log flusher and the deadlock
    /// detector.
    pub fn open<P: AsRef<Path>>(
        db_path: P,
        log_path: P,
        options: EngineOptions,
    ) -> StorageResult<Arc<Self>> {
        let disk = Arc::new(DiskManager::open(&db_path, &log_path)?);
        let log = Arc::new(LogManager::with_config(
            Arc::clone(&disk),
            options.log_buffer_size,
            options.log_timeout,
        ));
        let bpm = Arc::new(BufferPoolManager::new(
            options.buffer_pool_size,
            Arc::clone(&disk),
            Arc::clone(&log),
        ));

        if disk.num_pages() == 0 {
            let header = bpm.new_page()?;
            assert_eq!(header.page_id(), header_page::HEADER_PAGE_ID);
        }

        let mut recovery = LogRecovery::new(Arc::clone(&disk), Arc::clone(&bpm));
        recovery.redo()?;
        let in_flight = recovery.active_txn_count();
        recovery.undo()?;
        bpm.flush_all_pages()?;
        crate::stratum_debug_log!(
            "[StorageEngine::open] recovery done, rolled back {in_flight} transactions"
        );

        log.set_next_lsn(recovery.max_lsn() + 1);
        log.run_flush_thread();

        let registry = Arc::new(TransactionRegistry::new());
        let lock = LockManager::with_interval(
            Arc::clone(&registry),
            options.cycle_detection_interval,
        );
        let txn_manager = Arc::new(TransactionManager::new(
            Arc::clone(&registry),
            Arc::clone(&lock),
            Arc::clone(&log),
        ));
        txn_manager.set_next_txn_id(recovery.max_txn_id() + 1);

        Ok(Arc::new(Self {
            disk,
            log,
            bpm,
            registry,
            lock,
            txn_manager,
            options,
        }))
    }

    pub fn buffer_pool(&self) -> &Arc<BufferPoolManager> {
        &self.bpm
    }

    pub fn disk_manager(&self) -> &Arc<DiskManager> {
        &self.disk
    }

    pub fn log_manager(&self) -> &Arc<LogManager> {
        &self.log
    }

    pub fn lock_manager(&self) -> &Arc<LockManager> {
        &self.lock
    }

    pub fn transaction_manager(&self) -> &Arc<TransactionManager> {
        &self.txn_manager
    }

    pub fn registry(&self) -> &Arc<TransactionRegistry> {
        &self.registry
    }

    pub fn begin(&self, isolation_level: IsolationLevel) -> Arc<Transaction> {
        self.txn_manager.begin(isolation_level)
    }

    pub fn commit(&self, txn: &Arc<Transaction>) -> StorageResult<()> {
        self.txn_manager.commit(txn)
    }

    pub fn abort(&self, txn: &Arc<Transaction>) -> StorageResult<()> {
        self.txn_manager.abort(txn)
    }

    /// Creates a heap and registers its first page under `name` so it can
    /// be reopened after a restart.
    pub fn create_table(
        &self,
        name: &str,
        txn: &Arc<Transaction>,
    ) -> StorageResult<Arc<TableHeap>> {
        let heap = TableHeap::create(
            Arc::clone(&self.bpm),
            Arc::clone(&self.log),
            Arc::clone(&self.lock),
            txn,
        )?;
        header_page::set_record(&self.bpm, name, heap.first_page_id())?;
        Ok(heap)
    }

    pub fn open_table(&self, name: &str) -> StorageResult<Option<Arc<TableHeap>>> {
        Ok(header_page::get_record(&self.bpm, name)?.map(|first_page_id| {
            TableHeap::open(
                Arc::clone(&self.bpm),
                Arc::clone(&self.log),
                Arc::clone(&self.lock),
                first_page_id,
            )
        }))
    }

    /// Opens the named index, creating it on first use. Its root pointer
    /// lives on the header page.
    pub fn open_index(&self, name: &str) -> StorageResult<Arc<BPlusTree>> {
        BPlusTree::new(
            name,
            Arc::clone(&self.bpm),
            self.options.leaf_max_size,
            self.options.internal_max_size,
        )
    }

    /// Quiesce-and-flush checkpoint hook: no new transactions, log forced,
    /// every dirty page written. Must not be called from a thread that
    /// still owns an open transaction.
    pub fn checkpoint(&self) -> StorageResult<()> {
        self.txn_manager.block_all();
        self.log.flush(true);
        let result = self.bpm.flush_all_pages();
        self.txn_manager.resume_all();
        result
    }

    /// Flushes everything and stops the background threads. The engine is
    /// unusable afterwards; dropping without calling this simulates a
    /// crash (the log survives, unflushed pages do not).
    pub fn shutdown(&self) -> StorageResult<()> {
        self.log.flush(true);
        self.bpm.flush_all_pages()?;
        self.lock.stop_cycle_detection();
        self.log.stop_flush_thread();
        Ok(())
    }
}
