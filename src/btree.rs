//! A concurrent B+Tree index over buffer-pool pages.
//!
//! Writers descend with latch crabbing: ancestors stay write-latched only
//! while a structure change could still propagate into them, and the root
//! pointer has its own latch that is released as soon as the operation can
//! no longer move the root.

use std::ops::Range;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::buffer_pool::{BufferPoolManager, PageRef, PageWriteGuard};
use crate::errors::{StorageError, StorageResult};
use crate::header_page;
use crate::transaction::{IndexWriteRecord, Transaction, WriteType};
use crate::{Page, PageId, Rid, INVALID_PAGE_ID};

pub mod iterator;
pub mod page;

pub use iterator::BTreeIterator;
pub use page::{INTERNAL_PAGE_CAPACITY, LEAF_PAGE_CAPACITY};

pub type Key = i32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteOp {
    Insert,
    Delete,
}

/// A write-latched, pinned node. Field order releases the latch before
/// the pin.
struct WLatched {
    guard: PageWriteGuard,
    page_ref: PageRef,
}

impl WLatched {
    fn page_id(&self) -> PageId {
        self.page_ref.page_id()
    }
}

/// Latches held on behalf of one write operation: the root-pointer latch
/// and the still-unsafe ancestor chain. Dropping the context releases
/// everything in reverse acquisition order.
struct WriteContext<'a> {
    root_guard: Option<MutexGuard<'a, PageId>>,
    ancestors: Vec<WLatched>,
    deleted: Vec<PageId>,
}

pub struct BPlusTree {
    name: String,
    bpm: Arc<BufferPoolManager>,
    /// The root pointer; the mutex guarding it doubles as the root latch.
    root_page_id: Mutex<PageId>,
    leaf_max_size: i32,
    internal_max_size: i32,
}

impl BPlusTree {
    /// Opens (or creates) the named index, recovering its root pointer
    /// from the header page.
    pub fn new(
        name: impl Into<String>,
        bpm: Arc<BufferPoolManager>,
        leaf_max_size: i32,
        internal_max_size: i32,
    ) -> StorageResult<Arc<Self>> {
        assert!(
            (2..=LEAF_PAGE_CAPACITY as i32).contains(&leaf_max_size),
            "leaf max size out of range"
        );
        assert!(
            (3..=INTERNAL_PAGE_CAPACITY as i32).contains(&internal_max_size),
            "internal max size out of range"
        );
        let name = name.into();
        let root_page_id = header_page::get_record(&bpm, &name)?.unwrap_or(INVALID_PAGE_ID);
        Ok(Arc::new(Self {
            name,
            bpm,
            root_page_id: Mutex::new(root_page_id),
            leaf_max_size,
            internal_max_size,
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_empty(&self) -> bool {
        *self.root_page_id.lock().unwrap() == INVALID_PAGE_ID
    }

    fn persist_root(&self, root_page_id: PageId) -> StorageResult<()> {
        header_page::set_record(&self.bpm, &self.name, root_page_id)
    }

    fn is_safe(page: &Page, op: WriteOp) -> bool {
        match op {
            WriteOp::Insert => page.btree_size() < page.btree_max_size() - 1,
            WriteOp::Delete => {
                if page.btree_is_root() {
                    page.btree_size() > 2
                } else {
                    page.btree_size() > page.btree_min_size()
                }
            }
        }
    }

    // --- point lookup ----------------------------------------------------

    /// Read-crabs down to the leaf: the child is read-latched before the
    /// parent's latch is released.
    pub fn get(&self, key: Key) -> StorageResult<Option<Rid>> {
        let root_guard = self.root_page_id.lock().unwrap();
        if *root_guard == INVALID_PAGE_ID {
            return Ok(None);
        }
        let page_ref = self.bpm.fetch_page(*root_guard)?;
        let guard = page_ref.read();
        drop(root_guard);

        let mut current = (guard, page_ref);
        loop {
            if current.0.is_btree_leaf() {
                return Ok(current.0.leaf_lookup(key));
            }
            let child_id = current.0.internal_lookup(key);
            let child_ref = self.bpm.fetch_page(child_id)?;
            let child_guard = child_ref.read();
            current = (child_guard, child_ref);
        }
    }

    // --- insertion -------------------------------------------------------

    /// Inserts a unique key. Returns false (tree unchanged) on duplicates.
    pub fn insert(&self, key: Key, rid: Rid) -> StorageResult<bool> {
        let mut root_guard = self.root_page_id.lock().unwrap();
        if *root_guard == INVALID_PAGE_ID {
            let page_ref = self.bpm.new_page()?;
            {
                let mut page = page_ref.write();
                page.init_btree_leaf(page_ref.page_id(), INVALID_PAGE_ID, self.leaf_max_size);
                page.leaf_insert(key, rid);
            }
            *root_guard = page_ref.page_id();
            self.persist_root(*root_guard)?;
            return Ok(true);
        }

        let (mut ctx, mut leaf) = self.descend_for_write(root_guard, key, WriteOp::Insert)?;
        let old_size = leaf.guard.btree_size();
        let new_size = leaf.guard.leaf_insert(key, rid);
        if new_size == old_size {
            return Ok(false);
        }
        if new_size < leaf.guard.btree_max_size() {
            return Ok(true);
        }

        // The leaf is full: move its upper half into a fresh sibling and
        // thread the new sibling into the leaf chain.
        let new_ref = self.bpm.new_page()?;
        let mut new_guard = new_ref.write();
        new_guard.init_btree_leaf(
            new_ref.page_id(),
            leaf.guard.btree_parent_page_id(),
            self.leaf_max_size,
        );
        leaf.guard.leaf_move_half_to(&mut new_guard);
        new_guard.set_leaf_next_page_id(leaf.guard.leaf_next_page_id());
        leaf.guard.set_leaf_next_page_id(new_ref.page_id());

        let separator = new_guard.leaf_key_at(0);
        let right = WLatched {
            guard: new_guard,
            page_ref: new_ref,
        };
        self.insert_into_parent(&mut ctx, leaf, separator, right)?;
        Ok(true)
    }

    /// Pushes a separator up the latched ancestor chain, splitting
    /// internal nodes as they fill and growing a new root when the old
    /// one splits.
    fn insert_into_parent(
        &self,
        ctx: &mut WriteContext<'_>,
        mut left: WLatched,
        mut key: Key,
        mut right: WLatched,
    ) -> StorageResult<()> {
        loop {
            if left.guard.btree_is_root() {
                let root_ref = self.bpm.new_page()?;
                {
                    let mut root_page = root_ref.write();
                    root_page.init_btree_internal(
                        root_ref.page_id(),
                        INVALID_PAGE_ID,
                        self.internal_max_size,
                    );
                    root_page.internal_populate_new_root(
                        left.page_id(),
                        key,
                        right.page_id(),
                    );
                }
                left.guard.set_btree_parent_page_id(root_ref.page_id());
                right.guard.set_btree_parent_page_id(root_ref.page_id());

                let root_guard = ctx
                    .root_guard
                    .as_mut()
                    .expect("root split without holding the root latch");
                **root_guard = root_ref.page_id();
                self.persist_root(root_ref.page_id())?;
                return Ok(());
            }

            let mut parent = ctx
                .ancestors
                .pop()
                .expect("unsafe node without a latched parent");
            right
                .guard
                .set_btree_parent_page_id(parent.page_id());
            let new_size = parent.guard.internal_insert_node_after(
                left.page_id(),
                key,
                right.page_id(),
            );
            drop(left);
            drop(right);

            if new_size < parent.guard.btree_max_size() {
                return Ok(());
            }

            let new_ref = self.bpm.new_page()?;
            let mut new_guard = new_ref.write();
            new_guard.init_btree_internal(
                new_ref.page_id(),
                parent.guard.btree_parent_page_id(),
                self.internal_max_size,
            );
            let moved = parent.guard.internal_move_half_to(&mut new_guard);
            self.adopt_children(&new_guard, 0..moved)?;

            key = new_guard.internal_key_at(0);
            left = parent;
            right = WLatched {
                guard: new_guard,
                page_ref: new_ref,
            };
        }
    }

    // --- removal ---------------------------------------------------------

    /// Removes the key if present; underfull nodes borrow from or merge
    /// with a sibling, cascading up the latched chain.
    pub fn remove(&self, key: Key) -> StorageResult<bool> {
        let root_guard = self.root_page_id.lock().unwrap();
        if *root_guard == INVALID_PAGE_ID {
            return Ok(false);
        }
        let (mut ctx, mut leaf) = self.descend_for_write(root_guard, key, WriteOp::Delete)?;
        let old_size = leaf.guard.btree_size();
        let new_size = leaf.guard.leaf_remove(key);
        if new_size == old_size {
            return Ok(false);
        }

        self.coalesce_or_redistribute(&mut ctx, &mut leaf)?;

        let deleted = std::mem::take(&mut ctx.deleted);
        drop(leaf);
        drop(ctx);
        for page_id in deleted {
            self.bpm.delete_page(page_id)?;
        }
        Ok(true)
    }

    fn coalesce_or_redistribute(
        &self,
        ctx: &mut WriteContext<'_>,
        node: &mut WLatched,
    ) -> StorageResult<()> {
        if node.guard.btree_is_root() {
            return self.adjust_root(ctx, node);
        }
        if node.guard.btree_size() >= node.guard.btree_min_size() {
            return Ok(());
        }

        let mut parent = ctx
            .ancestors
            .pop()
            .expect("underfull node without a latched parent");
        let index = parent
            .guard
            .internal_value_index(node.page_id())
            .expect("node missing from its parent");
        let sibling_index = if index == 0 { 1 } else { index - 1 };
        let sibling_ref = self
            .bpm
            .fetch_page(parent.guard.internal_value_at(sibling_index))?;
        let sibling_guard = sibling_ref.write();
        let mut sibling = WLatched {
            guard: sibling_guard,
            page_ref: sibling_ref,
        };

        if node.guard.btree_size() + sibling.guard.btree_size() > node.guard.btree_max_size() {
            self.redistribute(&mut sibling, node, &mut parent, index)?;
            return Ok(());
        }

        // Merge into the left page of the pair; the right one dies.
        if index == 0 {
            let victim_id = sibling.page_id();
            self.merge_into(node, &mut sibling, &mut parent, 1)?;
            ctx.deleted.push(victim_id);
        } else {
            let victim_id = node.page_id();
            self.merge_into(&mut sibling, node, &mut parent, index)?;
            ctx.deleted.push(victim_id);
        }
        drop(sibling);
        self.coalesce_or_redistribute(ctx, &mut parent)
    }

    fn merge_into(
        &self,
        survivor: &mut WLatched,
        victim: &mut WLatched,
        parent: &mut WLatched,
        right_index: usize,
    ) -> StorageResult<()> {
        if victim.guard.is_btree_leaf() {
            victim.guard.leaf_move_all_to(&mut survivor.guard);
        } else {
            let middle_key = parent.guard.internal_key_at(right_index);
            let moved = victim
                .guard
                .internal_move_all_to(&mut survivor.guard, middle_key);
            let total = survivor.guard.btree_size() as usize;
            self.adopt_children(&survivor.guard, total - moved..total)?;
        }
        parent.guard.internal_remove(right_index);
        Ok(())
    }

    fn redistribute(
        &self,
        sibling: &mut WLatched,
        node: &mut WLatched,
        parent: &mut WLatched,
        index: usize,
    ) -> StorageResult<()> {
        if node.guard.is_btree_leaf() {
            if index == 0 {
                // Sibling is the right neighbor; borrow its first entry.
                sibling.guard.leaf_move_first_to_end_of(&mut node.guard);
                parent
                    .guard
                    .set_internal_key_at(1, sibling.guard.leaf_key_at(0));
            } else {
                sibling.guard.leaf_move_last_to_front_of(&mut node.guard);
                parent
                    .guard
                    .set_internal_key_at(index, node.guard.leaf_key_at(0));
            }
        } else if index == 0 {
            let middle_key = parent.guard.internal_key_at(1);
            let adopted = sibling
                .guard
                .internal_move_first_to_end_of(&mut node.guard, middle_key);
            self.adopt_child(adopted, node.page_id())?;
            parent
                .guard
                .set_internal_key_at(1, sibling.guard.internal_key_at(0));
        } else {
            let middle_key = parent.guard.internal_key_at(index);
            let adopted = sibling
                .guard
                .internal_move_last_to_front_of(&mut node.guard, middle_key);
            self.adopt_child(adopted, node.page_id())?;
            parent
                .guard
                .set_internal_key_at(index, node.guard.internal_key_at(0));
        }
        Ok(())
    }

    /// Shrinks the root: an internal root with a single child hands the
    /// tree to that child; an empty root leaf empties the tree.
    fn adjust_root(&self, ctx: &mut WriteContext<'_>, root: &mut WLatched) -> StorageResult<()> {
        if !root.guard.is_btree_leaf() && root.guard.btree_size() == 1 {
            let only_child = root.guard.internal_value_at(0);
            {
                let child_ref = self.bpm.fetch_page(only_child)?;
                child_ref.write().set_btree_parent_page_id(INVALID_PAGE_ID);
            }
            let root_guard = ctx
                .root_guard
                .as_mut()
                .expect("root change without holding the root latch");
            **root_guard = only_child;
            self.persist_root(only_child)?;
            ctx.deleted.push(root.page_id());
        } else if root.guard.is_btree_leaf() && root.guard.btree_size() == 0 {
            let root_guard = ctx
                .root_guard
                .as_mut()
                .expect("root change without holding the root latch");
            **root_guard = INVALID_PAGE_ID;
            self.persist_root(INVALID_PAGE_ID)?;
            ctx.deleted.push(root.page_id());
        }
        Ok(())
    }

    // --- descent ---------------------------------------------------------

    fn descend_for_write<'a>(
        &self,
        root_guard: MutexGuard<'a, PageId>,
        key: Key,
        op: WriteOp,
    ) -> StorageResult<(WriteContext<'a>, WLatched)> {
        let root_id = *root_guard;
        let mut ctx = WriteContext {
            root_guard: Some(root_guard),
            ancestors: Vec::new(),
            deleted: Vec::new(),
        };

        let page_ref = self.bpm.fetch_page(root_id)?;
        let guard = page_ref.write();
        let mut current = WLatched {
            guard,
            page_ref,
        };
        if Self::is_safe(&current.guard, op) {
            ctx.root_guard = None;
        }

        while !current.guard.is_btree_leaf() {
            let child_id = current.guard.internal_lookup(key);
            let child_ref = self.bpm.fetch_page(child_id)?;
            let child_guard = child_ref.write();
            ctx.ancestors.push(current);
            current = WLatched {
                guard: child_guard,
                page_ref: child_ref,
            };
            if Self::is_safe(&current.guard, op) {
                ctx.root_guard = None;
                ctx.ancestors.clear();
            }
        }
        Ok((ctx, current))
    }

    fn adopt_children(&self, node: &Page, range: Range<usize>) -> StorageResult<()> {
        let parent_id = node.btree_page_id();
        for index in range {
            self.adopt_child(node.internal_value_at(index), parent_id)?;
        }
        Ok(())
    }

    /// Parent pointers are fix-up data: refresh the moved child's parent id
    /// through the buffer pool.
    fn adopt_child(&self, child: PageId, parent_id: PageId) -> StorageResult<()> {
        let child_ref = self.bpm.fetch_page(child)?;
        child_ref.write().set_btree_parent_page_id(parent_id);
        Ok(())
    }

    // --- iteration -------------------------------------------------------

    /// Cursor positioned at the smallest key.
    pub fn iter(&self) -> StorageResult<BTreeIterator> {
        self.make_iterator(None)
    }

    /// Cursor positioned at the first key >= `key`.
    pub fn iter_from(&self, key: Key) -> StorageResult<BTreeIterator> {
        self.make_iterator(Some(key))
    }

    fn make_iterator(&self, start: Option<Key>) -> StorageResult<BTreeIterator> {
        let root_guard = self.root_page_id.lock().unwrap();
        if *root_guard == INVALID_PAGE_ID {
            return Ok(BTreeIterator::empty(Arc::clone(&self.bpm)));
        }
        let page_ref = self.bpm.fetch_page(*root_guard)?;
        let guard = page_ref.read();
        drop(root_guard);

        let mut current = (guard, page_ref);
        loop {
            if current.0.is_btree_leaf() {
                let index = match start {
                    Some(key) => current.0.leaf_key_index(key),
                    None => 0,
                };
                return Ok(BTreeIterator::new(
                    Arc::clone(&self.bpm),
                    current.0,
                    current.1,
                    index,
                ));
            }
            let child_id = match start {
                Some(key) => current.0.internal_lookup(key),
                None => current.0.internal_value_at(0),
            };
            let child_ref = self.bpm.fetch_page(child_id)?;
            let child_guard = child_ref.read();
            current = (child_guard, child_ref);
        }
    }

    // --- transactional entry points --------------------------------------

    /// Inserts and records the change on the transaction so abort can
    /// reverse it.
    pub fn insert_entry(
        self: &Arc<Self>,
        key: Key,
        rid: Rid,
        txn: &Arc<Transaction>,
    ) -> StorageResult<()> {
        if !self.insert(key, rid)? {
            return Err(StorageError::DuplicateKey);
        }
        txn.append_index_write(IndexWriteRecord {
            rid,
            wtype: WriteType::Insert,
            key,
            old_key: None,
            index: Arc::clone(self),
        });
        Ok(())
    }

    pub fn delete_entry(
        self: &Arc<Self>,
        key: Key,
        rid: Rid,
        txn: &Arc<Transaction>,
    ) -> StorageResult<()> {
        if !self.remove(key)? {
            return Err(StorageError::NotFound);
        }
        txn.append_index_write(IndexWriteRecord {
            rid,
            wtype: WriteType::Delete,
            key,
            old_key: None,
            index: Arc::clone(self),
        });
        Ok(())
    }

    pub fn update_entry(
        self: &Arc<Self>,
        old_key: Key,
        new_key: Key,
        rid: Rid,
        txn: &Arc<Transaction>,
    ) -> StorageResult<()> {
        if !self.remove(old_key)? {
            return Err(StorageError::NotFound);
        }
        if !self.insert(new_key, rid)? {
            // Put the old entry back before reporting the conflict.
            self.insert(old_key, rid)?;
            return Err(StorageError::DuplicateKey);
        }
        txn.append_index_write(IndexWriteRecord {
            rid,
            wtype: WriteType::Update,
            key: new_key,
            old_key: Some(old_key),
            index: Arc::clone(self),
        });
        Ok(())
    }

    /// Point lookup for executors: matching rids are appended to `out`.
    pub fn scan_key(
        &self,
        key: Key,
        out: &mut Vec<Rid>,
        _txn: &Arc<Transaction>,
    ) -> StorageResult<()> {
        if let Some(rid) = self.get(key)? {
            out.push(rid);
        }
        Ok(())
    }

    // --- integrity -------------------------------------------------------

    /// Walks the whole tree checking ordering, sizing, parent pointers and
    /// uniform leaf depth. Meant for quiesced trees (tests); panics on a
    /// violated invariant.
    pub fn validate(&self) -> StorageResult<()> {
        let root_id = *self.root_page_id.lock().unwrap();
        if root_id == INVALID_PAGE_ID {
            return Ok(());
        }
        self.validate_node(root_id, INVALID_PAGE_ID, None, None)?;
        Ok(())
    }

    /// Returns the leaf depth below this node; bounds are exclusive on the
    /// upper end.
    fn validate_node(
        &self,
        page_id: PageId,
        expected_parent: PageId,
        lower: Option<Key>,
        upper: Option<Key>,
    ) -> StorageResult<usize> {
        let page_ref = self.bpm.fetch_page(page_id)?;
        let page = page_ref.read();
        let size = page.btree_size() as usize;
        assert_eq!(page.btree_parent_page_id(), expected_parent, "parent pointer mismatch");

        let is_root = expected_parent == INVALID_PAGE_ID;
        if is_root {
            assert!(size >= 1, "empty root left in the tree");
        } else {
            assert!(
                size >= page.btree_min_size() as usize,
                "underfull node {page_id}"
            );
        }
        assert!(
            size <= page.btree_max_size() as usize,
            "overfull node {page_id}"
        );

        if page.is_btree_leaf() {
            for i in 0..size {
                let key = page.leaf_key_at(i);
                if i > 0 {
                    assert!(page.leaf_key_at(i - 1) < key, "leaf keys out of order");
                }
                if let Some(lower) = lower {
                    assert!(key >= lower, "leaf key below its subtree bound");
                }
                if let Some(upper) = upper {
                    assert!(key < upper, "leaf key above its subtree bound");
                }
            }
            return Ok(0);
        }

        assert!(size >= 2 || is_root, "internal node with a single child");
        let mut depth = None;
        for i in 0..size {
            if i > 1 {
                assert!(
                    page.internal_key_at(i - 1) < page.internal_key_at(i),
                    "separator keys out of order"
                );
            }
            let child_lower = if i == 0 { lower } else { Some(page.internal_key_at(i)) };
            let child_upper = if i + 1 < size {
                Some(page.internal_key_at(i + 1))
            } else {
                upper
            };
            let child_depth =
                self.validate_node(page.internal_value_at(i), page_id, child_lower, child_upper)?;
            if let Some(depth) = depth {
                assert_eq!(depth, child_depth, "leaves at unequal depth");
            }
            depth = Some(child_depth);
        }
        Ok(depth.unwrap_or(0) + 1)
    }
}
