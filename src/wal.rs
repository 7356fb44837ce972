//! The write-ahead log: record format, LSN assignment and the background
//! flusher that moves the append buffer to disk.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use crate::disk::DiskManager;
use crate::tuple::Tuple;
use crate::{Lsn, PageId, Rid, TxnId, INVALID_LSN};

/// Fixed header in front of every log record:
/// `{size, lsn, txn_id, prev_lsn, type}` as five native-endian i32s.
pub const LOG_HEADER_SIZE: usize = 20;

pub const DEFAULT_LOG_BUFFER_SIZE: usize = 32 * crate::PAGE_SIZE;
pub const DEFAULT_LOG_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum LogRecordType {
    Invalid = 0,
    Insert = 1,
    MarkDelete = 2,
    ApplyDelete = 3,
    RollbackDelete = 4,
    Update = 5,
    Begin = 6,
    Commit = 7,
    Abort = 8,
    NewPage = 9,
}

impl LogRecordType {
    fn from_i32(value: i32) -> Option<Self> {
        Some(match value {
            1 => LogRecordType::Insert,
            2 => LogRecordType::MarkDelete,
            3 => LogRecordType::ApplyDelete,
            4 => LogRecordType::RollbackDelete,
            5 => LogRecordType::Update,
            6 => LogRecordType::Begin,
            7 => LogRecordType::Commit,
            8 => LogRecordType::Abort,
            9 => LogRecordType::NewPage,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LogPayload {
    /// BEGIN / COMMIT / ABORT carry no payload.
    Empty,
    /// INSERT, MARK_DELETE, APPLY_DELETE, ROLLBACK_DELETE.
    TupleOp { rid: Rid, tuple: Tuple },
    Update {
        rid: Rid,
        old_tuple: Tuple,
        new_tuple: Tuple,
    },
    NewPage {
        prev_page_id: PageId,
        page_id: PageId,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    pub size: i32,
    pub lsn: Lsn,
    pub txn_id: TxnId,
    pub prev_lsn: Lsn,
    pub record_type: LogRecordType,
    pub payload: LogPayload,
}

impl LogRecord {
    fn with_payload(
        txn_id: TxnId,
        prev_lsn: Lsn,
        record_type: LogRecordType,
        payload: LogPayload,
    ) -> Self {
        let payload_size = match &payload {
            LogPayload::Empty => 0,
            LogPayload::TupleOp { tuple, .. } => Rid::SERIALIZED_SIZE + tuple.serialized_size(),
            LogPayload::Update {
                old_tuple,
                new_tuple,
                ..
            } => Rid::SERIALIZED_SIZE + old_tuple.serialized_size() + new_tuple.serialized_size(),
            LogPayload::NewPage { .. } => 8,
        };
        Self {
            size: (LOG_HEADER_SIZE + payload_size) as i32,
            lsn: INVALID_LSN,
            txn_id,
            prev_lsn,
            record_type,
            payload,
        }
    }

    pub fn new_begin(txn_id: TxnId, prev_lsn: Lsn) -> Self {
        Self::with_payload(txn_id, prev_lsn, LogRecordType::Begin, LogPayload::Empty)
    }

    pub fn new_commit(txn_id: TxnId, prev_lsn: Lsn) -> Self {
        Self::with_payload(txn_id, prev_lsn, LogRecordType::Commit, LogPayload::Empty)
    }

    pub fn new_abort(txn_id: TxnId, prev_lsn: Lsn) -> Self {
        Self::with_payload(txn_id, prev_lsn, LogRecordType::Abort, LogPayload::Empty)
    }

    /// INSERT / MARK_DELETE / APPLY_DELETE / ROLLBACK_DELETE all carry the
    /// affected rid plus the tuple image.
    pub fn new_tuple_op(
        txn_id: TxnId,
        prev_lsn: Lsn,
        record_type: LogRecordType,
        rid: Rid,
        tuple: Tuple,
    ) -> Self {
        debug_assert!(matches!(
            record_type,
            LogRecordType::Insert
                | LogRecordType::MarkDelete
                | LogRecordType::ApplyDelete
                | LogRecordType::RollbackDelete
        ));
        Self::with_payload(
            txn_id,
            prev_lsn,
            record_type,
            LogPayload::TupleOp { rid, tuple },
        )
    }

    pub fn new_update(
        txn_id: TxnId,
        prev_lsn: Lsn,
        rid: Rid,
        old_tuple: Tuple,
        new_tuple: Tuple,
    ) -> Self {
        Self::with_payload(
            txn_id,
            prev_lsn,
            LogRecordType::Update,
            LogPayload::Update {
                rid,
                old_tuple,
                new_tuple,
            },
        )
    }

    pub fn new_new_page(txn_id: TxnId, prev_lsn: Lsn, prev_page_id: PageId, page_id: PageId) -> Self {
        Self::with_payload(
            txn_id,
            prev_lsn,
            LogRecordType::NewPage,
            LogPayload::NewPage {
                prev_page_id,
                page_id,
            },
        )
    }

    pub fn serialize_to(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= self.size as usize);
        buf[0..4].copy_from_slice(&self.size.to_ne_bytes());
        buf[4..8].copy_from_slice(&self.lsn.to_ne_bytes());
        buf[8..12].copy_from_slice(&self.txn_id.to_ne_bytes());
        buf[12..16].copy_from_slice(&self.prev_lsn.to_ne_bytes());
        buf[16..20].copy_from_slice(&(self.record_type as i32).to_ne_bytes());

        let mut pos = LOG_HEADER_SIZE;
        match &self.payload {
            LogPayload::Empty => {}
            LogPayload::TupleOp { rid, tuple } => {
                rid.serialize_to(&mut buf[pos..pos + Rid::SERIALIZED_SIZE]);
                pos += Rid::SERIALIZED_SIZE;
                tuple.serialize_to(&mut buf[pos..pos + tuple.serialized_size()]);
            }
            LogPayload::Update {
                rid,
                old_tuple,
                new_tuple,
            } => {
                rid.serialize_to(&mut buf[pos..pos + Rid::SERIALIZED_SIZE]);
                pos += Rid::SERIALIZED_SIZE;
                old_tuple.serialize_to(&mut buf[pos..pos + old_tuple.serialized_size()]);
                pos += old_tuple.serialized_size();
                new_tuple.serialize_to(&mut buf[pos..pos + new_tuple.serialized_size()]);
            }
            LogPayload::NewPage {
                prev_page_id,
                page_id,
            } => {
                buf[pos..pos + 4].copy_from_slice(&prev_page_id.to_ne_bytes());
                buf[pos + 4..pos + 8].copy_from_slice(&page_id.to_ne_bytes());
            }
        }
    }

    /// Reads one record off the front of `buf`. Returns None on a torn or
    /// incomplete record, which ends a recovery scan.
    pub fn deserialize_from(buf: &[u8]) -> Option<LogRecord> {
        if buf.len() < LOG_HEADER_SIZE {
            return None;
        }
        let size = i32::from_ne_bytes(buf[0..4].try_into().unwrap());
        if size < LOG_HEADER_SIZE as i32 || size as usize > buf.len() {
            return None;
        }
        let lsn = i32::from_ne_bytes(buf[4..8].try_into().unwrap());
        let txn_id = i32::from_ne_bytes(buf[8..12].try_into().unwrap());
        let prev_lsn = i32::from_ne_bytes(buf[12..16].try_into().unwrap());
        let record_type =
            LogRecordType::from_i32(i32::from_ne_bytes(buf[16..20].try_into().unwrap()))?;

        let body = &buf[LOG_HEADER_SIZE..size as usize];
        let payload = match record_type {
            LogRecordType::Begin | LogRecordType::Commit | LogRecordType::Abort => {
                LogPayload::Empty
            }
            LogRecordType::Insert
            | LogRecordType::MarkDelete
            | LogRecordType::ApplyDelete
            | LogRecordType::RollbackDelete => {
                if body.len() < Rid::SERIALIZED_SIZE {
                    return None;
                }
                let rid = Rid::deserialize_from(&body[0..Rid::SERIALIZED_SIZE]);
                let tuple = Tuple::deserialize_from(&body[Rid::SERIALIZED_SIZE..])?;
                LogPayload::TupleOp { rid, tuple }
            }
            LogRecordType::Update => {
                if body.len() < Rid::SERIALIZED_SIZE {
                    return None;
                }
                let rid = Rid::deserialize_from(&body[0..Rid::SERIALIZED_SIZE]);
                let old_tuple = Tuple::deserialize_from(&body[Rid::SERIALIZED_SIZE..])?;
                let new_tuple = Tuple::deserialize_from(
                    &body[Rid::SERIALIZED_SIZE + old_tuple.serialized_size()..],
                )?;
                LogPayload::Update {
                    rid,
                    old_tuple,
                    new_tuple,
                }
            }
            LogRecordType::NewPage => {
                if body.len() < 8 {
                    return None;
                }
                let prev_page_id = i32::from_ne_bytes(body[0..4].try_into().unwrap());
                let page_id = i32::from_ne_bytes(body[4..8].try_into().unwrap());
                LogPayload::NewPage {
                    prev_page_id,
                    page_id,
                }
            }
            LogRecordType::Invalid => return None,
        };

        Some(LogRecord {
            size,
            lsn,
            txn_id,
            prev_lsn,
            record_type,
            payload,
        })
    }
}

struct LogBuffers {
    log_buffer: Vec<u8>,
    log_offset: usize,
    flush_buffer: Vec<u8>,
    last_lsn: Lsn,
}

/// Serializes records into a double-buffered ring. A background thread
/// wakes on timeout, on buffer pressure, or when forced, swaps the buffers
/// and writes the full one through the disk manager.
pub struct LogManager {
    disk: Arc<DiskManager>,
    log_buffer_size: usize,
    timeout: Duration,
    inner: Mutex<LogBuffers>,
    /// Wakes the flusher.
    flush_cv: Condvar,
    /// Wakes appenders waiting for space and force-flush callers.
    append_cv: Condvar,
    need_flush: AtomicBool,
    next_lsn: AtomicI32,
    persistent_lsn: AtomicI32,
    enabled: AtomicBool,
    running: AtomicBool,
    flush_thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl LogManager {
    pub fn new(disk: Arc<DiskManager>) -> Self {
        Self::with_config(disk, DEFAULT_LOG_BUFFER_SIZE, DEFAULT_LOG_TIMEOUT)
    }

    pub fn with_config(disk: Arc<DiskManager>, log_buffer_size: usize, timeout: Duration) -> Self {
        Self {
            disk,
            log_buffer_size,
            timeout,
            inner: Mutex::new(LogBuffers {
                log_buffer: vec![0; log_buffer_size],
                log_offset: 0,
                flush_buffer: vec![0; log_buffer_size],
                last_lsn: INVALID_LSN,
            }),
            flush_cv: Condvar::new(),
            append_cv: Condvar::new(),
            need_flush: AtomicBool::new(false),
            next_lsn: AtomicI32::new(0),
            persistent_lsn: AtomicI32::new(INVALID_LSN),
            enabled: AtomicBool::new(false),
            running: AtomicBool::new(false),
            flush_thread: Mutex::new(None),
        }
    }

    pub fn persistent_lsn(&self) -> Lsn {
        self.persistent_lsn.load(Ordering::SeqCst)
    }

    pub fn next_lsn(&self) -> Lsn {
        self.next_lsn.load(Ordering::SeqCst)
    }

    /// Recovery resumes LSN assignment above everything already on disk.
    pub fn set_next_lsn(&self, lsn: Lsn) {
        self.next_lsn.store(lsn, Ordering::SeqCst);
    }

    pub fn logging_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Starts the background flusher and enables logging. No-op when
    /// already running.
    pub fn run_flush_thread(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        self.enabled.store(true, Ordering::SeqCst);
        let manager = Arc::clone(self);
        let handle = thread::spawn(move || manager.flush_loop());
        *self.flush_thread.lock().unwrap() = Some(handle);
    }

    /// Stops the flusher after one final drain and disables logging.
    pub fn stop_flush_thread(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.enabled.store(false, Ordering::SeqCst);
        self.flush_cv.notify_all();
        if let Some(handle) = self.flush_thread.lock().unwrap().take() {
            handle.join().unwrap();
        }
    }

    fn flush_loop(&self) {
        loop {
            let inner = self.inner.lock().unwrap();
            let (mut inner, _timeout) = self
                .flush_cv
                .wait_timeout_while(inner, self.timeout, |_| {
                    !self.need_flush.load(Ordering::SeqCst) && self.running.load(Ordering::SeqCst)
                })
                .unwrap();
            let stopping = !self.running.load(Ordering::SeqCst);
            self.flush_locked(&mut inner);
            self.need_flush.store(false, Ordering::SeqCst);
            self.append_cv.notify_all();
            if stopping {
                return;
            }
        }
    }

    /// Swaps the buffers and writes the full one out. The latch is held
    /// across the disk write so appenders queue up behind the swap.
    fn flush_locked(&self, inner: &mut LogBuffers) {
        if inner.log_offset == 0 {
            return;
        }
        let flush_size = inner.log_offset;
        let last_lsn = inner.last_lsn;
        std::mem::swap(&mut inner.log_buffer, &mut inner.flush_buffer);
        inner.log_offset = 0;

        // An unwritable log makes every future commit a lie; stop here.
        if let Err(err) = self.disk.write_log(&inner.flush_buffer[..flush_size]) {
            panic!("log flush failed, cannot guarantee durability: {err}");
        }
        self.persistent_lsn.store(last_lsn, Ordering::SeqCst);
        crate::stratum_debug_log!(
            "[LogManager] flushed {flush_size} bytes, persistent_lsn = {last_lsn}"
        );
    }

    /// Assigns the record its LSN and copies it into the append buffer,
    /// waiting for the flusher if the record would overflow.
    ///
    /// Callers must not hold any latch the flusher could need (the flusher
    /// only touches the log file, so page latches are fine).
    pub fn append(&self, record: &mut LogRecord) -> Lsn {
        let record_size = record.size as usize;
        assert!(
            record_size < self.log_buffer_size,
            "log record of {record_size} bytes exceeds the log buffer"
        );
        let mut inner = self.inner.lock().unwrap();
        while inner.log_offset + record_size >= self.log_buffer_size {
            self.need_flush.store(true, Ordering::SeqCst);
            self.flush_cv.notify_one();
            if !self.running.load(Ordering::SeqCst) {
                // No flusher to make room; drain inline.
                self.flush_locked(&mut inner);
                continue;
            }
            inner = self.append_cv.wait(inner).unwrap();
        }

        record.lsn = self.next_lsn.fetch_add(1, Ordering::SeqCst);
        let offset = inner.log_offset;
        record.serialize_to(&mut inner.log_buffer[offset..offset + record_size]);
        inner.log_offset += record_size;
        inner.last_lsn = record.lsn;
        record.lsn
    }

    /// With `force`, blocks until everything appended so far is durable.
    /// Without it, this is only a hint; the flusher runs on its own clock.
    pub fn flush(&self, force: bool) {
        if !force {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        if !self.running.load(Ordering::SeqCst) {
            self.flush_locked(&mut inner);
            return;
        }
        self.need_flush.store(true, Ordering::SeqCst);
        self.flush_cv.notify_one();
        while self.need_flush.load(Ordering::SeqCst) {
            inner = self.append_cv.wait(inner).unwrap();
        }
        drop(inner);
    }
}

impl Drop for LogManager {
    fn drop(&mut self) {
        if self.running.swap(false, Ordering::SeqCst) {
            self.flush_cv.notify_all();
            if let Some(handle) = self.flush_thread.lock().unwrap().take() {
                let _ = handle.join();
            }
        }
    }
}
