//! A cursor over the leaf chain. Holds one read-latched, pinned leaf at a
//! time; stepping past the end of a leaf latches the next leaf before
//! releasing the current one, and never re-ascends.

use std::sync::Arc;

use super::Key;
use crate::buffer_pool::{BufferPoolManager, PageReadGuard, PageRef};
use crate::{Rid, INVALID_PAGE_ID};

/// Field order releases the latch before the pin.
struct LeafPosition {
    guard: PageReadGuard,
    page_ref: PageRef,
}

pub struct BTreeIterator {
    bpm: Arc<BufferPoolManager>,
    current: Option<LeafPosition>,
    index: usize,
}

impl BTreeIterator {
    pub(super) fn new(
        bpm: Arc<BufferPoolManager>,
        guard: PageReadGuard,
        page_ref: PageRef,
        index: usize,
    ) -> Self {
        Self {
            bpm,
            current: Some(LeafPosition { guard, page_ref }),
            index,
        }
    }

    pub(super) fn empty(bpm: Arc<BufferPoolManager>) -> Self {
        Self {
            bpm,
            current: None,
            index: 0,
        }
    }
}

impl Iterator for BTreeIterator {
    type Item = (Key, Rid);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let leaf = self.current.as_ref()?;
            if self.index < leaf.guard.btree_size() as usize {
                let item = leaf.guard.leaf_item_at(self.index);
                self.index += 1;
                return Some(item);
            }

            let next_page_id = leaf.guard.leaf_next_page_id();
            if next_page_id == INVALID_PAGE_ID {
                self.current = None;
                return None;
            }
            let next_ref = match self.bpm.fetch_page(next_page_id) {
                Ok(next_ref) => next_ref,
                Err(err) => {
                    crate::stratum_debug_log!("[BTreeIterator] fetch failed: {err}");
                    self.current = None;
                    return None;
                }
            };
            // Latch the next leaf before dropping the current one.
            let next_guard = next_ref.read();
            self.current = Some(LeafPosition {
                guard: next_guard,
                page_ref: next_ref,
            });
            self.index = 0;
        }
    }
}
