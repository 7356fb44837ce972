//! The buffer pool: a bounded array of frames caching disk pages, with
//! pin-counted RAII access and LRU victim selection.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::RwLock;

use crate::disk::DiskManager;
use crate::errors::{StorageError, StorageResult};
use crate::replacer::LruReplacer;
use crate::wal::LogManager;
use crate::{FrameId, Page, PageId, INVALID_PAGE_ID};

pub type PageReadGuard = ArcRwLockReadGuard<parking_lot::RawRwLock, Page>;
pub type PageWriteGuard = ArcRwLockWriteGuard<parking_lot::RawRwLock, Page>;

pub const DEFAULT_POOL_SIZE: usize = 256;

#[derive(Debug)]
struct FrameMeta {
    page_id: PageId,
    pin_count: u32,
    is_dirty: bool,
}

struct Frame {
    page: Arc<RwLock<Page>>,
    meta: Mutex<FrameMeta>,
}

struct PoolInner {
    page_table: HashMap<PageId, FrameId>,
    free_list: VecDeque<FrameId>,
}

/// A pinned page. Holding one keeps the frame out of victim selection;
/// `read()`/`write()` latch the page, and `write()` marks the frame dirty.
/// The pin is released (and the frame handed to the replacer at pin zero)
/// when the guard drops.
pub struct PageRef {
    bpm: Arc<BufferPoolManager>,
    page_id: PageId,
    frame_id: FrameId,
    page: Arc<RwLock<Page>>,
}

impl PageRef {
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    pub fn read(&self) -> PageReadGuard {
        self.page.read_arc()
    }

    pub fn write(&self) -> PageWriteGuard {
        {
            let mut meta = self.bpm.frames[self.frame_id].meta.lock().unwrap();
            meta.is_dirty = true;
        }
        self.page.write_arc()
    }
}

impl Drop for PageRef {
    fn drop(&mut self) {
        self.bpm.unpin_page(self.page_id, self.frame_id);
    }
}

pub struct BufferPoolManager {
    disk: Arc<DiskManager>,
    log: Arc<LogManager>,
    frames: Vec<Frame>,
    replacer: LruReplacer,
    /// The pool latch. Every pool operation holds it for its full duration.
    inner: Mutex<PoolInner>,
}

impl BufferPoolManager {
    pub fn new(pool_size: usize, disk: Arc<DiskManager>, log: Arc<LogManager>) -> Self {
        assert!(pool_size > 0);
        let mut frames = Vec::with_capacity(pool_size);
        let mut free_list = VecDeque::with_capacity(pool_size);
        for frame_id in 0..pool_size {
            frames.push(Frame {
                page: Arc::new(RwLock::new(Page::new(INVALID_PAGE_ID))),
                meta: Mutex::new(FrameMeta {
                    page_id: INVALID_PAGE_ID,
                    pin_count: 0,
                    is_dirty: false,
                }),
            });
            free_list.push_back(frame_id);
        }
        Self {
            disk,
            log,
            frames,
            replacer: LruReplacer::new(pool_size),
            inner: Mutex::new(PoolInner {
                page_table: HashMap::with_capacity(pool_size),
                free_list,
            }),
        }
    }

    pub fn pool_size(&self) -> usize {
        self.frames.len()
    }

    pub fn disk(&self) -> &Arc<DiskManager> {
        &self.disk
    }

    /// Pins the page, reading it from disk if it is not resident.
    pub fn fetch_page(self: &Arc<Self>, page_id: PageId) -> StorageResult<PageRef> {
        if page_id < 0 {
            return Err(StorageError::InvalidPageId(page_id));
        }
        let mut inner = self.inner.lock().unwrap();

        if let Some(&frame_id) = inner.page_table.get(&page_id) {
            let mut meta = self.frames[frame_id].meta.lock().unwrap();
            meta.pin_count += 1;
            drop(meta);
            self.replacer.pin(frame_id);
            return Ok(self.page_ref(page_id, frame_id));
        }

        let frame_id = self
            .take_victim_frame(&mut inner)
            .ok_or(StorageError::OutOfFrames)?;
        self.recycle_frame(&mut inner, frame_id)?;

        let new_page = self.disk.read_page(page_id)?;
        *self.frames[frame_id].page.write() = new_page;
        {
            let mut meta = self.frames[frame_id].meta.lock().unwrap();
            meta.page_id = page_id;
            meta.pin_count = 1;
            meta.is_dirty = false;
        }
        inner.page_table.insert(page_id, frame_id);
        crate::stratum_debug_log!("[BufferPool::fetch_page] page {page_id} -> frame {frame_id}");
        Ok(self.page_ref(page_id, frame_id))
    }

    /// Allocates a fresh page on disk and pins a zeroed frame for it.
    pub fn new_page(self: &Arc<Self>) -> StorageResult<PageRef> {
        let mut inner = self.inner.lock().unwrap();
        let frame_id = self
            .take_victim_frame(&mut inner)
            .ok_or(StorageError::OutOfMemory)?;
        self.recycle_frame(&mut inner, frame_id)?;

        let page_id = self.disk.allocate_page();
        *self.frames[frame_id].page.write() = Page::new(page_id);
        {
            let mut meta = self.frames[frame_id].meta.lock().unwrap();
            meta.page_id = page_id;
            // The drop-guard owns the pin, so a fresh page starts at one.
            meta.pin_count = 1;
            meta.is_dirty = false;
        }
        inner.page_table.insert(page_id, frame_id);
        crate::stratum_debug_log!("[BufferPool::new_page] page {page_id} -> frame {frame_id}");
        Ok(self.page_ref(page_id, frame_id))
    }

    /// Writes the page back (honoring the WAL invariant) and clears its
    /// dirty bit. The pin count is unchanged. Returns false if the page is
    /// not resident.
    pub fn flush_page(&self, page_id: PageId) -> StorageResult<bool> {
        let inner = self.inner.lock().unwrap();
        let Some(&frame_id) = inner.page_table.get(&page_id) else {
            return Ok(false);
        };
        let mut meta = self.frames[frame_id].meta.lock().unwrap();
        self.write_back_if_dirty(frame_id, &mut meta)?;
        Ok(true)
    }

    /// Flushes every dirty resident page, whatever its page id.
    pub fn flush_all_pages(&self) -> StorageResult<()> {
        let inner = self.inner.lock().unwrap();
        for &frame_id in inner.page_table.values() {
            let mut meta = self.frames[frame_id].meta.lock().unwrap();
            self.write_back_if_dirty(frame_id, &mut meta)?;
        }
        self.disk.sync_db()?;
        Ok(())
    }

    /// Drops the page from the pool and deallocates it on disk. Returns
    /// false (and does nothing) if the page is currently pinned. A page
    /// that is not resident is reported deleted without handing its id to
    /// the disk manager's free list.
    pub fn delete_page(&self, page_id: PageId) -> StorageResult<bool> {
        let mut inner = self.inner.lock().unwrap();
        let Some(&frame_id) = inner.page_table.get(&page_id) else {
            return Ok(true);
        };
        let mut meta = self.frames[frame_id].meta.lock().unwrap();
        if meta.pin_count > 0 {
            crate::stratum_debug_log!("[BufferPool::delete_page] page {page_id} is pinned");
            return Ok(false);
        }
        self.write_back_if_dirty(frame_id, &mut meta)?;
        meta.page_id = INVALID_PAGE_ID;
        meta.is_dirty = false;
        drop(meta);
        self.frames[frame_id].page.write().reset();

        inner.page_table.remove(&page_id);
        self.replacer.pin(frame_id);
        inner.free_list.push_back(frame_id);
        self.disk.deallocate_page(page_id);
        Ok(true)
    }

    fn page_ref(self: &Arc<Self>, page_id: PageId, frame_id: FrameId) -> PageRef {
        PageRef {
            bpm: Arc::clone(self),
            page_id,
            frame_id,
            page: Arc::clone(&self.frames[frame_id].page),
        }
    }

    /// Free-list frames are preferred; otherwise the replacer picks the
    /// least recently unpinned frame.
    fn take_victim_frame(&self, inner: &mut PoolInner) -> Option<FrameId> {
        if let Some(frame_id) = inner.free_list.pop_front() {
            return Some(frame_id);
        }
        self.replacer.victim()
    }

    /// Evicts whatever page the frame currently holds. The frame must have
    /// come from the free list or the replacer, so its pin count is zero
    /// and nobody holds its latch.
    fn recycle_frame(&self, inner: &mut PoolInner, frame_id: FrameId) -> StorageResult<()> {
        let mut meta = self.frames[frame_id].meta.lock().unwrap();
        debug_assert_eq!(meta.pin_count, 0);
        if meta.page_id != INVALID_PAGE_ID {
            self.write_back_if_dirty(frame_id, &mut meta)?;
            inner.page_table.remove(&meta.page_id);
            meta.page_id = INVALID_PAGE_ID;
        }
        Ok(())
    }

    /// The dirty-page write path. Never bypasses the persistent-LSN check:
    /// the log covering this page's LSN must be on disk before the page is.
    fn write_back_if_dirty(&self, frame_id: FrameId, meta: &mut FrameMeta) -> StorageResult<()> {
        if meta.page_id == INVALID_PAGE_ID || !meta.is_dirty {
            return Ok(());
        }
        let page = self.frames[frame_id].page.read();
        if self.log.logging_enabled() && self.log.persistent_lsn() < page.lsn() {
            crate::stratum_debug_log!(
                "[BufferPool] forcing log flush before writing page {} (lsn {})",
                meta.page_id,
                page.lsn()
            );
            self.log.flush(true);
        }
        self.disk.write_page(&page)?;
        meta.is_dirty = false;
        Ok(())
    }

    fn unpin_page(&self, page_id: PageId, frame_id: FrameId) {
        let _inner = self.inner.lock().unwrap();
        let mut meta = self.frames[frame_id].meta.lock().unwrap();
        if meta.page_id != page_id {
            return;
        }
        if meta.pin_count > 0 {
            meta.pin_count -= 1;
        }
        if meta.pin_count == 0 {
            self.replacer.unpin(frame_id);
        }
    }

    #[cfg(test)]
    fn pin_count(&self, page_id: PageId) -> Option<u32> {
        let inner = self.inner.lock().unwrap();
        let frame_id = *inner.page_table.get(&page_id)?;
        Some(self.frames[frame_id].meta.lock().unwrap().pin_count)
    }
}
