//! The slot-directory heap page format.
//!
//! ```text
//! | header | slot[0] .. slot[n-1] | ... free ... | tuple[n-1] .. tuple[0] |
//! ```
//!
//! Slots grow from the front, tuple bytes from the back. A mark-deleted
//! slot keeps its length under the tombstone bit so the delete can be
//! rolled back; an apply-deleted slot is compacted to size zero and never
//! reused.

use crate::errors::{StorageError, StorageResult};
use crate::tuple::Tuple;
use crate::{Page, PageId, INVALID_PAGE_ID, PAGE_SIZE};

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct TablePageHeader {
    page_id: PageId,
    lsn: i32,
    prev_page_id: PageId,
    next_page_id: PageId,
    /// Offset of the lowest tuple byte; data grows down toward the slots.
    free_space_pointer: u32,
    tuple_count: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct Slot {
    offset: u32,
    size: u32,
}

const HEADER_SIZE: usize = std::mem::size_of::<TablePageHeader>();
const SLOT_SIZE: usize = std::mem::size_of::<Slot>();

/// The largest payload a single (empty) page can hold.
pub const MAX_TUPLE_SIZE: usize = PAGE_SIZE - HEADER_SIZE - SLOT_SIZE;

/// Tombstone bit on the slot size; the remaining bits keep the length so
/// the same delete can be rolled back.
const DELETE_FLAG: u32 = 1 << 31;

fn is_marked(size: u32) -> bool {
    size & DELETE_FLAG != 0
}

fn unmask(size: u32) -> u32 {
    size & !DELETE_FLAG
}

/// A slot is unreadable when it was never written, was compacted away
/// (size 0), or carries the tombstone.
fn is_vacant_or_marked(size: u32) -> bool {
    size == 0 || is_marked(size)
}

impl Page {
    pub fn init_table_page(&mut self, page_id: PageId, prev_page_id: PageId) {
        self.reset();
        self.write_table_header(&TablePageHeader {
            page_id,
            lsn: 0,
            prev_page_id,
            next_page_id: INVALID_PAGE_ID,
            free_space_pointer: PAGE_SIZE as u32,
            tuple_count: 0,
        });
    }

    fn table_header(&self) -> TablePageHeader {
        self.read_at::<TablePageHeader>(0)
    }

    fn write_table_header(&mut self, header: &TablePageHeader) {
        self.write_at(0, header);
    }

    fn slot(&self, slot_num: u32) -> Slot {
        self.read_at::<Slot>(HEADER_SIZE + slot_num as usize * SLOT_SIZE)
    }

    fn write_slot(&mut self, slot_num: u32, slot: &Slot) {
        self.write_at(HEADER_SIZE + slot_num as usize * SLOT_SIZE, slot);
    }

    pub fn table_page_id(&self) -> PageId {
        self.table_header().page_id
    }

    pub fn table_prev_page_id(&self) -> PageId {
        self.table_header().prev_page_id
    }

    pub fn table_next_page_id(&self) -> PageId {
        self.table_header().next_page_id
    }

    pub fn set_table_prev_page_id(&mut self, prev_page_id: PageId) {
        let mut header = self.table_header();
        header.prev_page_id = prev_page_id;
        self.write_table_header(&header);
    }

    pub fn set_table_next_page_id(&mut self, next_page_id: PageId) {
        let mut header = self.table_header();
        header.next_page_id = next_page_id;
        self.write_table_header(&header);
    }

    pub fn table_tuple_count(&self) -> u32 {
        self.table_header().tuple_count
    }

    pub fn table_free_space(&self) -> usize {
        let header = self.table_header();
        header.free_space_pointer as usize - HEADER_SIZE - header.tuple_count as usize * SLOT_SIZE
    }

    /// Appends the tuple, returning its slot number, or None when it does
    /// not fit. Vacated slots are never reused by inserts.
    pub fn insert_table_tuple(&mut self, tuple: &Tuple) -> Option<u32> {
        assert!(!tuple.is_empty(), "empty tuples cannot be stored");
        if self.table_free_space() < tuple.len() + SLOT_SIZE {
            return None;
        }
        let mut header = self.table_header();
        let slot_num = header.tuple_count;
        header.free_space_pointer -= tuple.len() as u32;
        let offset = header.free_space_pointer;
        header.tuple_count += 1;
        self.write_table_header(&header);
        self.data[offset as usize..offset as usize + tuple.len()].copy_from_slice(tuple.data());
        self.write_slot(
            slot_num,
            &Slot {
                offset,
                size: tuple.len() as u32,
            },
        );
        Some(slot_num)
    }

    pub fn get_table_tuple(&self, slot_num: u32) -> StorageResult<Tuple> {
        if slot_num >= self.table_tuple_count() {
            return Err(StorageError::SlotOutOfRange);
        }
        let slot = self.slot(slot_num);
        if is_vacant_or_marked(slot.size) {
            return Err(StorageError::SlotDeleted);
        }
        Ok(Tuple::from(
            &self.data[slot.offset as usize..(slot.offset + slot.size) as usize],
        ))
    }

    /// Reads the tuple whether or not it carries the tombstone. Used where
    /// the image of a mark-deleted tuple is still needed (logging the
    /// physical delete).
    pub(crate) fn get_table_tuple_any(&self, slot_num: u32) -> StorageResult<Tuple> {
        if slot_num >= self.table_tuple_count() {
            return Err(StorageError::SlotOutOfRange);
        }
        let slot = self.slot(slot_num);
        let size = unmask(slot.size);
        if size == 0 {
            return Err(StorageError::SlotDeleted);
        }
        Ok(Tuple::from(
            &self.data[slot.offset as usize..slot.offset as usize + size as usize],
        ))
    }

    /// Sets the tombstone. The tuple bytes stay in place until the delete
    /// is applied at commit.
    pub fn mark_table_delete(&mut self, slot_num: u32) -> StorageResult<()> {
        if slot_num >= self.table_tuple_count() {
            return Err(StorageError::SlotOutOfRange);
        }
        let mut slot = self.slot(slot_num);
        if slot.size == 0 {
            return Err(StorageError::SlotDeleted);
        }
        slot.size |= DELETE_FLAG;
        self.write_slot(slot_num, &slot);
        Ok(())
    }

    /// Clears the tombstone set by `mark_table_delete`.
    pub fn rollback_table_delete(&mut self, slot_num: u32) -> StorageResult<()> {
        if slot_num >= self.table_tuple_count() {
            return Err(StorageError::SlotOutOfRange);
        }
        let mut slot = self.slot(slot_num);
        slot.size = unmask(slot.size);
        self.write_slot(slot_num, &slot);
        Ok(())
    }

    /// Physically removes the tuple, compacting the data area. The slot
    /// stays allocated with size zero.
    pub fn apply_table_delete(&mut self, slot_num: u32) -> StorageResult<()> {
        if slot_num >= self.table_tuple_count() {
            return Err(StorageError::SlotOutOfRange);
        }
        let slot = self.slot(slot_num);
        let size = unmask(slot.size);
        if size == 0 {
            return Err(StorageError::SlotDeleted);
        }
        let offset = slot.offset;
        let mut header = self.table_header();
        let free_ptr = header.free_space_pointer;

        // Shift everything below the victim up over it.
        self.data.copy_within(
            free_ptr as usize..offset as usize,
            (free_ptr + size) as usize,
        );
        header.free_space_pointer += size;
        self.write_table_header(&header);
        self.write_slot(slot_num, &Slot { offset: 0, size: 0 });

        for i in 0..self.table_tuple_count() {
            let mut other = self.slot(i);
            if unmask(other.size) != 0 && other.offset < offset {
                other.offset += size;
                self.write_slot(i, &other);
            }
        }
        Ok(())
    }

    /// Replaces the tuple in place, moving neighbors when the length
    /// changes. Fails with `SlotSizeExceeded` when the page cannot absorb
    /// the growth, and returns the old image on success.
    pub fn update_table_tuple(&mut self, slot_num: u32, new_tuple: &Tuple) -> StorageResult<Tuple> {
        assert!(!new_tuple.is_empty(), "empty tuples cannot be stored");
        if slot_num >= self.table_tuple_count() {
            return Err(StorageError::SlotOutOfRange);
        }
        let slot = self.slot(slot_num);
        if is_vacant_or_marked(slot.size) {
            return Err(StorageError::SlotDeleted);
        }
        let old_size = slot.size as usize;
        let new_size = new_tuple.len();
        if self.table_free_space() + old_size < new_size {
            return Err(StorageError::SlotSizeExceeded);
        }

        let old_tuple = Tuple::from(&self.data[slot.offset as usize..slot.offset as usize + old_size]);

        let offset = slot.offset as usize;
        let mut header = self.table_header();
        let free_ptr = header.free_space_pointer as usize;
        let new_free_ptr = free_ptr + old_size - new_size;

        // Move the data below the slot so the new payload ends where the
        // old one did.
        self.data.copy_within(free_ptr..offset, new_free_ptr);
        header.free_space_pointer = new_free_ptr as u32;
        self.write_table_header(&header);

        let new_offset = offset + old_size - new_size;
        self.data[new_offset..new_offset + new_size].copy_from_slice(new_tuple.data());
        self.write_slot(
            slot_num,
            &Slot {
                offset: new_offset as u32,
                size: new_size as u32,
            },
        );

        let delta = old_size as i64 - new_size as i64;
        for i in 0..self.table_tuple_count() {
            if i == slot_num {
                continue;
            }
            let mut other = self.slot(i);
            if unmask(other.size) != 0 && (other.offset as usize) < offset {
                other.offset = (other.offset as i64 + delta) as u32;
                self.write_slot(i, &other);
            }
        }
        Ok(old_tuple)
    }
}
