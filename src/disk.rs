use std::fs::{create_dir_all, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Mutex;

use crate::{Page, PageId, PAGE_SIZE};

struct DbFile {
    file: File,
    next_page_id: PageId,
    free_pages: Vec<PageId>,
}

struct LogFile {
    file: File,
    len: u64,
}

/// Maps logical page ids to offsets in the database file and appends raw
/// bytes to the log file. Log writes are durable when `write_log` returns;
/// page writes rely on the WAL discipline enforced by the buffer pool.
pub struct DiskManager {
    db: Mutex<DbFile>,
    log: Mutex<LogFile>,
}

fn open_rw<P: AsRef<Path>>(path: P) -> io::Result<File> {
    let path_ref = path.as_ref();
    if let Some(parent) = path_ref.parent() {
        create_dir_all(parent)?;
    }
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path_ref)
}

impl DiskManager {
    pub fn open<P: AsRef<Path>>(db_path: P, log_path: P) -> io::Result<Self> {
        let db_file = open_rw(&db_path)?;
        let file_size = db_file.metadata()?.len();
        let next_page_id = (file_size / PAGE_SIZE as u64) as PageId;
        crate::stratum_debug_log!(
            "[DiskManager::open] db size: {file_size}, next_page_id: {next_page_id}"
        );

        let log_file = open_rw(&log_path)?;
        let log_len = log_file.metadata()?.len();

        Ok(Self {
            db: Mutex::new(DbFile {
                file: db_file,
                next_page_id,
                free_pages: Vec::new(),
            }),
            log: Mutex::new(LogFile {
                file: log_file,
                len: log_len,
            }),
        })
    }

    pub fn read_page(&self, page_id: PageId) -> io::Result<Page> {
        let mut db = self.db.lock().unwrap();
        let mut page = Page::new(page_id);
        if page_id < 0 || page_id >= db.next_page_id {
            crate::stratum_debug_log!("[DiskManager::read_page] page {page_id} is new");
            return Ok(page);
        }

        let offset = page_id as u64 * PAGE_SIZE as u64;
        db.file.seek(SeekFrom::Start(offset))?;
        let bytes_read = db.file.read(&mut page.data)?;
        if bytes_read < PAGE_SIZE {
            // The tail of the file can be short after a crash; the missing
            // bytes were never written and read back as zeroes.
            for byte in page.data[bytes_read..].iter_mut() {
                *byte = 0;
            }
        }
        Ok(page)
    }

    pub fn write_page(&self, page: &Page) -> io::Result<()> {
        let mut db = self.db.lock().unwrap();
        let offset = page.id as u64 * PAGE_SIZE as u64;
        db.file.seek(SeekFrom::Start(offset))?;
        db.file.write_all(&page.data)?;
        if page.id >= db.next_page_id {
            db.next_page_id = page.id + 1;
        }
        Ok(())
    }

    /// Allocates a page id, preferring deallocated ids over extending the file.
    pub fn allocate_page(&self) -> PageId {
        let mut db = self.db.lock().unwrap();
        if let Some(page_id) = db.free_pages.pop() {
            crate::stratum_debug_log!("[DiskManager::allocate_page] reusing page {page_id}");
            return page_id;
        }
        let page_id = db.next_page_id;
        db.next_page_id += 1;
        crate::stratum_debug_log!("[DiskManager::allocate_page] new page {page_id}");
        page_id
    }

    pub fn deallocate_page(&self, page_id: PageId) {
        let mut db = self.db.lock().unwrap();
        if !db.free_pages.contains(&page_id) {
            db.free_pages.push(page_id);
        }
    }

    pub fn num_pages(&self) -> PageId {
        self.db.lock().unwrap().next_page_id
    }

    pub fn sync_db(&self) -> io::Result<()> {
        self.db.lock().unwrap().file.sync_all()
    }

    /// Appends `data` to the log file. Durable when this returns.
    pub fn write_log(&self, data: &[u8]) -> io::Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let mut log = self.log.lock().unwrap();
        let offset = log.len;
        log.file.seek(SeekFrom::Start(offset))?;
        log.file.write_all(data)?;
        log.file.sync_data()?;
        log.len += data.len() as u64;
        Ok(())
    }

    /// Reads up to `buf.len()` log bytes starting at `offset`.
    /// Returns the number of bytes read; 0 means the offset is at or past
    /// the end of the log.
    pub fn read_log(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let mut log = self.log.lock().unwrap();
        if offset >= log.len {
            return Ok(0);
        }
        log.file.seek(SeekFrom::Start(offset))?;
        let mut total = 0;
        while total < buf.len() {
            let n = log.file.read(&mut buf[total..])?;
            if n == 0 {
                break;
            }
            total += n;
        }
        Ok(total)
    }

    pub fn log_len(&self) -> u64 {
        self.log.lock().unwrap().len
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_page_round_trip() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        let log_path = dir.path().join("test.log");

        let disk = DiskManager::open(&db_path, &log_path).unwrap();
        let page_id = disk.allocate_page();
        assert_eq!(page_id, 0);

        let mut page = Page::new(page_id);
        page.data[100] = 0xAB;
        page.set_lsn(7);
        disk.write_page(&page).unwrap();

        drop(disk);
        let disk = DiskManager::open(&db_path, &log_path).unwrap();
        let page = disk.read_page(page_id).unwrap();
        assert_eq!(page.data[100], 0xAB);
        assert_eq!(page.lsn(), 7);
    }

    #[test]
    fn test_deallocated_page_is_reused() {
        let dir = tempdir().unwrap();
        let disk =
            DiskManager::open(dir.path().join("a.db"), dir.path().join("a.log")).unwrap();
        let p0 = disk.allocate_page();
        let p1 = disk.allocate_page();
        disk.deallocate_page(p0);
        assert_eq!(disk.allocate_page(), p0);
        assert_eq!(disk.allocate_page(), p1 + 1);
    }

    #[test]
    fn test_log_append_and_read_back() {
        let dir = tempdir().unwrap();
        let disk =
            DiskManager::open(dir.path().join("b.db"), dir.path().join("b.log")).unwrap();

        disk.write_log(b"hello").unwrap();
        disk.write_log(b" world").unwrap();

        let mut buf = [0u8; 32];
        let n = disk.read_log(&mut buf, 0).unwrap();
        assert_eq!(&buf[..n], b"hello world");

        let n = disk.read_log(&mut buf, 6).unwrap();
        assert_eq!(&buf[..n], b"world");

        assert_eq!(disk.read_log(&mut buf, 100).unwrap(), 0);
    }
}
