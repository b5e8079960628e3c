//! Tree traversal and copy-on-write mutation.
//!
//! A cursor remembers the path from the root to its current leaf as a stack
//! of [`NodePtr`]s: `path[0]` is the root slot and every later entry is the
//! child slot leading one level down. Writers use the same path to install
//! cloned pages bottom-up and to propagate splits.

use std::sync::atomic::Ordering;

use log::debug;

use crate::manager::{CheckpointRoot, NodePtr, PageManager};
use crate::page::{PageId, PageType, RawPage, Version, NULL_PAGE};
use crate::txn::TxnState;
use crate::{Result, StorageError, MAX_KEY_SIZE, MAX_VALUE_SIZE};

/// Deepest tree a cursor will follow. With a fan-out of at least two this is
/// far beyond any real tree, so hitting it means the pages form a cycle.
pub const MAX_DEPTH: usize = 64;

pub struct Cursor<'a> {
    pm: &'a PageManager,
    checkpoint: &'a CheckpointRoot,
    table: usize,
    version: Version,
    path: Vec<NodePtr>,
    leaf: Option<(PageId, usize)>,
}

impl<'a> Cursor<'a> {
    pub(crate) fn new(
        pm: &'a PageManager,
        checkpoint: &'a CheckpointRoot,
        table: usize,
        version: Version,
    ) -> Self {
        Self {
            pm,
            checkpoint,
            table,
            version,
            path: Vec::with_capacity(MAX_DEPTH),
            leaf: None,
        }
    }

    pub fn version(&self) -> Version {
        self.version
    }

    /// Levels on the current path, leaf included.
    pub fn depth(&self) -> usize {
        self.path.len()
    }

    fn push(&mut self, ptr: NodePtr) -> Result<()> {
        if self.path.len() >= MAX_DEPTH {
            let page = match ptr {
                NodePtr::Child { parent, .. } => parent,
                NodePtr::Root { .. } => NULL_PAGE,
            };
            return Err(StorageError::corrupted(
                page,
                format!("tree is deeper than {MAX_DEPTH} levels"),
            ));
        }
        self.path.push(ptr);
        Ok(())
    }

    /// Descends to the leaf that covers `key` and stops at the first record
    /// `>= key` in it, which may be one past its end. Returns false for an
    /// empty table.
    fn seek(&mut self, key: &[u8]) -> Result<bool> {
        self.path.clear();
        self.leaf = None;
        let mut ptr = NodePtr::Root { table: self.table };
        loop {
            self.push(ptr)?;
            let Some((id, page)) = self.pm.get_page_at(ptr, self.checkpoint, self.version)? else {
                return Ok(false);
            };
            match page.page_type() {
                Some(PageType::Node) => {
                    // SAFETY: pages visible at the cursor's version are not
                    // mutated while it reads them.
                    let slot = unsafe { page.node() }.lower_bound(key);
                    ptr = NodePtr::Child {
                        parent: id,
                        slot: slot as u16,
                    };
                }
                Some(PageType::Leaf) => {
                    // SAFETY: as above.
                    let index = unsafe { page.leaf() }.lower_bound(key);
                    self.leaf = Some((id, index));
                    return Ok(true);
                }
                other => {
                    return Err(StorageError::corrupted(
                        id,
                        format!("unexpected {other:?} page in a tree"),
                    ))
                }
            }
        }
    }

    fn current_leaf(&self) -> Option<(RawPage<'a>, usize)> {
        let (id, index) = self.leaf?;
        let page = self.pm.get_page(id).ok()?;
        Some((page, index))
    }

    fn at_record(&self) -> bool {
        match self.current_leaf() {
            // SAFETY: the cursor only holds leaves visible at its version.
            Some((page, index)) => index < unsafe { page.leaf() }.len(),
            None => false,
        }
    }

    /// Positions at the first record with a key `>= key`.
    pub fn lower_bound(&mut self, key: &[u8]) -> Result<bool> {
        if !self.seek(key)? {
            return Ok(false);
        }
        if self.at_record() {
            return Ok(true);
        }
        self.advance_leaf()
    }

    /// Positions at the smallest key.
    pub fn first(&mut self) -> Result<bool> {
        self.lower_bound(&[])
    }

    pub fn next(&mut self) -> Result<bool> {
        let Some((id, index)) = self.leaf else {
            return Ok(false);
        };
        self.leaf = Some((id, index + 1));
        if self.at_record() {
            return Ok(true);
        }
        self.advance_leaf()
    }

    pub fn is_valid(&self) -> bool {
        self.at_record()
    }

    pub fn key(&self) -> Option<&[u8]> {
        let (page, index) = self.current_leaf()?;
        // SAFETY: as in `at_record`.
        let leaf = unsafe { page.leaf() };
        (index < leaf.len()).then(|| leaf.key_at(index))
    }

    pub fn value(&self) -> Option<&[u8]> {
        let (page, index) = self.current_leaf()?;
        // SAFETY: as in `at_record`.
        let leaf = unsafe { page.leaf() };
        (index < leaf.len()).then(|| leaf.value_at(index))
    }

    /// Moves to the first record of the next non-empty leaf.
    fn advance_leaf(&mut self) -> Result<bool> {
        loop {
            // climb to the nearest ancestor that has a child to the right
            let mut level = self.path.len();
            loop {
                if level <= 1 {
                    self.leaf = None;
                    return Ok(false);
                }
                level -= 1;
                let NodePtr::Child { parent, slot } = self.path[level] else {
                    return Err(StorageError::corrupted(NULL_PAGE, "root pointer inside a path"));
                };
                // SAFETY: as in `at_record`.
                let count = unsafe { self.pm.get_page(parent)?.node() }.len();
                if (slot as usize) < count {
                    self.path[level] = NodePtr::Child {
                        parent,
                        slot: slot + 1,
                    };
                    self.path.truncate(level + 1);
                    break;
                }
            }

            // then down the leftmost edge
            let mut ptr = self.path[self.path.len() - 1];
            loop {
                let Some((id, page)) = self.pm.get_page_at(ptr, self.checkpoint, self.version)?
                else {
                    return Err(StorageError::corrupted(NULL_PAGE, "missing child page"));
                };
                match page.page_type() {
                    Some(PageType::Node) => {
                        ptr = NodePtr::Child {
                            parent: id,
                            slot: 0,
                        };
                        self.push(ptr)?;
                    }
                    Some(PageType::Leaf) => {
                        self.leaf = Some((id, 0));
                        // SAFETY: as in `at_record`.
                        if !unsafe { page.leaf() }.is_empty() {
                            return Ok(true);
                        }
                        // empty leaf, keep going right
                        break;
                    }
                    other => {
                        return Err(StorageError::corrupted(
                            id,
                            format!("unexpected {other:?} page in a tree"),
                        ))
                    }
                }
            }
        }
    }

    /// Inserts or replaces `key`.
    pub(crate) fn insert(&mut self, txn: &mut TxnState, key: &[u8], value: &[u8]) -> Result<()> {
        if key.len() > MAX_KEY_SIZE {
            return Err(StorageError::KeyTooLarge(key.len()));
        }
        if value.len() > MAX_VALUE_SIZE {
            return Err(StorageError::ValueTooLarge(value.len()));
        }
        if !self.seek(key)? {
            return self.create_root(txn, key, value);
        }
        let Some((_, index)) = self.leaf else {
            return Err(StorageError::corrupted(NULL_PAGE, "seek found no leaf"));
        };

        let depth = self.path.len() - 1;
        let leaf_id = self.make_writable(txn, depth)?;
        // SAFETY: make_writable returns a page owned by this transaction and
        // the writer lock is held.
        let mut leaf = unsafe { self.pm.get_page(leaf_id)?.leaf_mut() };
        if index < leaf.len() && leaf.key(index) == key {
            leaf.remove(index);
        }
        if leaf.insert(index, key, value) {
            return Ok(());
        }

        let (right_id, right_page) = self.new_page(txn, PageType::Leaf, NULL_PAGE)?;
        // SAFETY: freshly allocated by this transaction.
        let mut right = unsafe { right_page.leaf_mut() };
        let mut separator = leaf.split(&mut right, index, key, value);
        let mut child = right_id;

        for level in (0..depth).rev() {
            let slot = match self.path[level + 1] {
                NodePtr::Child { slot, .. } => slot as usize,
                NodePtr::Root { .. } => {
                    return Err(StorageError::corrupted(NULL_PAGE, "root pointer inside a path"))
                }
            };
            let node_id = self.make_writable(txn, level)?;
            // SAFETY: as for the leaf.
            let mut node = unsafe { self.pm.get_page(node_id)?.node_mut() };
            if node.insert(slot, &separator, child) {
                return Ok(());
            }
            let (sibling_id, sibling_page) = self.new_page(txn, PageType::Node, NULL_PAGE)?;
            // SAFETY: freshly allocated by this transaction.
            let mut sibling = unsafe { sibling_page.node_mut() };
            separator = node.split(&mut sibling, slot, &separator, child);
            child = sibling_id;
        }

        // the root itself split
        let root_slot = self.checkpoint.root_slot(self.table);
        let old_root = root_slot.load(Ordering::Acquire);
        let (root_id, root_page) = self.new_page(txn, PageType::Node, old_root)?;
        // SAFETY: freshly allocated by this transaction.
        unsafe { root_page.node_mut() }.init_with(old_root, &separator, child);
        root_slot.store(root_id, Ordering::Release);
        debug!(
            "table {} grew to {} levels at version {}",
            self.table,
            depth + 2,
            txn.version
        );
        Ok(())
    }

    /// Removes `key`. Leaves are never merged; an emptied leaf stays in the
    /// tree and is skipped by iteration.
    pub(crate) fn erase(&mut self, txn: &mut TxnState, key: &[u8]) -> Result<bool> {
        if !self.seek(key)? {
            return Ok(false);
        }
        let Some((page, index)) = self.current_leaf() else {
            return Ok(false);
        };
        {
            // SAFETY: as in `at_record`.
            let leaf = unsafe { page.leaf() };
            if index >= leaf.len() || leaf.key(index) != key {
                return Ok(false);
            }
        }
        let depth = self.path.len() - 1;
        let leaf_id = self.make_writable(txn, depth)?;
        // SAFETY: as in `insert`.
        unsafe { self.pm.get_page(leaf_id)?.leaf_mut() }.remove(index);
        Ok(true)
    }

    fn create_root(&mut self, txn: &mut TxnState, key: &[u8], value: &[u8]) -> Result<()> {
        let slot = self.checkpoint.root_slot(self.table);
        let (id, page) = self.new_page(txn, PageType::Leaf, slot.load(Ordering::Acquire))?;
        // SAFETY: freshly allocated by this transaction.
        if !unsafe { page.leaf_mut() }.insert(0, key, value) {
            return Err(StorageError::corrupted(id, "record does not fit an empty leaf"));
        }
        slot.store(id, Ordering::Release);
        self.path.clear();
        self.path.push(NodePtr::Root { table: self.table });
        self.leaf = Some((id, 0));
        Ok(())
    }

    /// Allocates and initializes a page owned by `txn`.
    fn new_page(
        &self,
        txn: &mut TxnState,
        page_type: PageType,
        prev: PageId,
    ) -> Result<(PageId, RawPage<'a>)> {
        let pm: &'a PageManager = self.pm;
        let (id, page) = pm.allocate_page()?;
        page.init_header(page_type, prev, txn.version);
        // SAFETY: nobody else knows about the page yet.
        match page_type {
            PageType::Leaf => unsafe { page.leaf_mut() }.clear(),
            PageType::Node => unsafe { page.node_mut() }.init(NULL_PAGE),
            _ => {}
        }
        txn.new_pages.push(id);
        pm.touch_page(page, txn.version);
        Ok((id, page))
    }

    /// Makes the page at `path[level]` writable by this transaction and
    /// returns its id, cloning it (and installing the clone) if it belongs
    /// to an older version.
    fn make_writable(&mut self, txn: &mut TxnState, level: usize) -> Result<PageId> {
        let ptr = self.path[level];
        let Some((id, page)) = self.pm.get_page_at(ptr, self.checkpoint, txn.version)? else {
            return Err(StorageError::corrupted(NULL_PAGE, "missing page on the cursor path"));
        };
        if page.version() == txn.version {
            return Ok(id);
        }
        let page_type = page
            .page_type()
            .ok_or_else(|| StorageError::corrupted(id, "page has no type"))?;

        let (new_id, copy) = self.pm.allocate_page()?;
        // SAFETY: `copy` is unpublished and `page` belongs to an older
        // version, so only its child slots can change, and those are copied
        // atomically.
        unsafe { page.clone_into(copy) };
        copy.init_header(page_type, id, txn.version);
        txn.new_pages.push(new_id);
        self.pm.touch_page(copy, txn.version);

        self.install(txn, level, new_id)?;
        txn.obsolete.push(id);

        if let Some(NodePtr::Child { parent, .. }) = self.path.get_mut(level + 1) {
            *parent = new_id;
        }
        if level + 1 == self.path.len() {
            if let Some((leaf, _)) = self.leaf.as_mut() {
                *leaf = new_id;
            }
        }
        Ok(new_id)
    }

    /// Points the slot at `path[level]` to `new_id`.
    fn install(&mut self, txn: &mut TxnState, level: usize, new_id: PageId) -> Result<()> {
        match self.path[level] {
            NodePtr::Root { table } => {
                // the head's root slots are private to it
                self.checkpoint
                    .root_slot(table)
                    .store(new_id, Ordering::Release);
            }
            ptr @ NodePtr::Child { parent, slot } => {
                let parent_page = self.pm.get_page(parent)?;
                let parent_version = parent_page.version();
                if parent_version == txn.version {
                    parent_page
                        .child_slot(slot as usize)
                        .store(new_id, Ordering::Release);
                } else if parent_version > txn.clone_version {
                    // not part of any pending flush, so the slot can be
                    // swung in place; readers follow the clone's prev
                    parent_page
                        .child_slot(slot as usize)
                        .store(new_id, Ordering::Release);
                    txn.modified.push(ptr);
                    self.pm.touch_page(parent_page, txn.version);
                } else {
                    let parent_level = level
                        .checked_sub(1)
                        .ok_or_else(|| StorageError::corrupted(parent, "child pointer at the root"))?;
                    let parent_id = self.make_writable(txn, parent_level)?;
                    self.pm
                        .get_page(parent_id)?
                        .child_slot(slot as usize)
                        .store(new_id, Ordering::Release);
                }
            }
        }
        Ok(())
    }
}
