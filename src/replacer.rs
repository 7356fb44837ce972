use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;

use crate::FrameId;

struct LruState {
    // Most recently unpinned at the front; the victim comes off the back.
    order: VecDeque<FrameId>,
    present: HashSet<FrameId>,
}

/// Tracks replaceable (unpinned) frames in unpin order and hands out the
/// least recently unpinned one as the eviction victim.
pub struct LruReplacer {
    capacity: usize,
    state: Mutex<LruState>,
}

impl LruReplacer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: Mutex::new(LruState {
                order: VecDeque::with_capacity(capacity),
                present: HashSet::with_capacity(capacity),
            }),
        }
    }

    /// Marks a frame replaceable. No-op if it is already tracked or the
    /// replacer is full.
    pub fn unpin(&self, frame_id: FrameId) {
        let mut state = self.state.lock().unwrap();
        if state.present.len() >= self.capacity || state.present.contains(&frame_id) {
            return;
        }
        state.order.push_front(frame_id);
        state.present.insert(frame_id);
    }

    /// Removes a frame from the replaceable set because it was pinned.
    pub fn pin(&self, frame_id: FrameId) {
        let mut state = self.state.lock().unwrap();
        if state.present.remove(&frame_id) {
            state.order.retain(|&id| id != frame_id);
        }
    }

    /// Pops the least recently unpinned frame, or None if every frame is
    /// pinned.
    pub fn victim(&self) -> Option<FrameId> {
        let mut state = self.state.lock().unwrap();
        let frame_id = state.order.pop_back()?;
        state.present.remove(&frame_id);
        Some(frame_id)
    }

    pub fn size(&self) -> usize {
        self.state.lock().unwrap().present.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lru_victim_order() {
        let replacer = LruReplacer::new(7);
        for frame in [1, 2, 3, 4, 5, 6] {
            replacer.unpin(frame);
        }
        // Duplicate unpin is a no-op.
        replacer.unpin(1);
        assert_eq!(replacer.size(), 6);

        assert_eq!(replacer.victim(), Some(1));
        assert_eq!(replacer.victim(), Some(2));
        assert_eq!(replacer.victim(), Some(3));

        // Pinning an absent frame does nothing; pinning a present one
        // removes it from the candidate set.
        replacer.pin(3);
        replacer.pin(4);
        assert_eq!(replacer.size(), 2);

        replacer.unpin(4);
        assert_eq!(replacer.victim(), Some(5));
        assert_eq!(replacer.victim(), Some(6));
        assert_eq!(replacer.victim(), Some(4));
        assert_eq!(replacer.victim(), None);
        assert_eq!(replacer.size(), 0);
    }

    #[test]
    fn test_full_replacer_ignores_unpin() {
        let replacer = LruReplacer::new(2);
        replacer.unpin(0);
        replacer.unpin(1);
        replacer.unpin(2);
        assert_eq!(replacer.size(), 2);
        assert_eq!(replacer.victim(), Some(0));
        assert_eq!(replacer.victim(), Some(1));
        assert_eq!(replacer.victim(), None);
    }
}
