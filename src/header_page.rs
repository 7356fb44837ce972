//! Page 0 of the database file: a small registry mapping names to page
//! ids. Index roots are persisted here so a reopened database can find
//! its trees; table heaps may register their first page the same way.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::buffer_pool::BufferPoolManager;
use crate::errors::StorageResult;
use crate::{PageId, PAGE_SIZE};

pub const HEADER_PAGE_ID: PageId = 0;

/// The serialized map starts after the 8-byte page prelude (reserved word
/// + LSN), prefixed with its bincode length.
const PAYLOAD_OFFSET: usize = 8;
const MAX_PAYLOAD: usize = PAGE_SIZE - PAYLOAD_OFFSET - 4;

#[derive(Debug, Default, Serialize, Deserialize)]
struct Registry {
    records: HashMap<String, PageId>,
}

fn load(data: &[u8]) -> Registry {
    let len = u32::from_ne_bytes(
        data[PAYLOAD_OFFSET..PAYLOAD_OFFSET + 4]
            .try_into()
            .unwrap(),
    ) as usize;
    if len == 0 || len > MAX_PAYLOAD {
        return Registry::default();
    }
    bincode::deserialize(&data[PAYLOAD_OFFSET + 4..PAYLOAD_OFFSET + 4 + len]).unwrap_or_default()
}

fn store(data: &mut [u8], registry: &Registry) {
    let bytes = bincode::serialize(registry).expect("registry serialization cannot fail");
    assert!(bytes.len() <= MAX_PAYLOAD, "header page registry overflow");
    data[PAYLOAD_OFFSET..PAYLOAD_OFFSET + 4]
        .copy_from_slice(&(bytes.len() as u32).to_ne_bytes());
    data[PAYLOAD_OFFSET + 4..PAYLOAD_OFFSET + 4 + bytes.len()].copy_from_slice(&bytes);
}

pub fn get_record(bpm: &Arc<BufferPoolManager>, name: &str) -> StorageResult<Option<PageId>> {
    let page_ref = bpm.fetch_page(HEADER_PAGE_ID)?;
    let page = page_ref.read();
    Ok(load(&page.data).records.get(name).copied())
}

pub fn set_record(bpm: &Arc<BufferPoolManager>, name: &str, page_id: PageId) -> StorageResult<()> {
    let page_ref = bpm.fetch_page(HEADER_PAGE_ID)?;
    let mut page = page_ref.write();
    let mut registry = load(&page.data);
    registry.records.insert(name.to_string(), page_id);
    store(&mut page.data, &registry);
    Ok(())
}

pub fn delete_record(bpm: &Arc<BufferPoolManager>, name: &str) -> StorageResult<()> {
    let page_ref = bpm.fetch_page(HEADER_PAGE_ID)?;
    let mut page = page_ref.write();
    let mut registry = load(&page.data);
    registry.records.remove(name);
    store(&mut page.data, &registry);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::DiskManager;
    use crate::wal::LogManager;
    use tempfile::tempdir;

    #[test]
    fn test_records_survive_reopen() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("h.db");
        let log_path = dir.path().join("h.log");
        {
            let disk = Arc::new(DiskManager::open(&db_path, &log_path).unwrap());
            assert_eq!(disk.allocate_page(), HEADER_PAGE_ID);
            let log = Arc::new(LogManager::new(Arc::clone(&disk)));
            let bpm = Arc::new(BufferPoolManager::new(8, disk, log));
            set_record(&bpm, "orders_pk", 7).unwrap();
            set_record(&bpm, "orders", 3).unwrap();
            set_record(&bpm, "orders_pk", 9).unwrap();
            bpm.flush_all_pages().unwrap();
        }

        let disk = Arc::new(DiskManager::open(&db_path, &log_path).unwrap());
        let log = Arc::new(LogManager::new(Arc::clone(&disk)));
        let bpm = Arc::new(BufferPoolManager::new(8, disk, log));
        assert_eq!(get_record(&bpm, "orders_pk").unwrap(), Some(9));
        assert_eq!(get_record(&bpm, "orders").unwrap(), Some(3));
        delete_record(&bpm, "orders").unwrap();
        assert_eq!(get_record(&bpm, "orders").unwrap(), None);
    }
}
