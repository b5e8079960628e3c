//! Internal nodes: separator keys and child pointers.
//!
//! Page-relative layout:
//!
//! ```text
//! [16..18]     key count
//! [18..20]     used key buffer words
//! [20..764]    NODE_CAPACITY + 1 child page ids (atomic)
//! [764..1134]  key directory, {offset_words, size_words} per key
//! [1136..]     key buffer of padded separator keys
//! ```
//!
//! Child `i` holds the keys below separator `i`; the last child holds the
//! keys at or above the last separator.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU32, Ordering};

use super::{unpad, PageId, HEADER_SIZE, NULL_PAGE, PAGE_SIZE, WORD_SIZE};

pub const NODE_CAPACITY: usize = 185;

pub(crate) const CHILDREN_OFFSET: usize = HEADER_SIZE + 4;
pub(crate) const KEYS_OFFSET: usize = CHILDREN_OFFSET + (NODE_CAPACITY + 1) * 4;

// Offsets inside the keys region.
const KEY_DIR_ENTRY_SIZE: usize = 2;
const KEY_BUF_OFFSET: usize = 372;

pub const NODE_BUF_SIZE: usize = PAGE_SIZE - KEYS_OFFSET - KEY_BUF_OFFSET;
const BUF_WORDS: usize = NODE_BUF_SIZE / WORD_SIZE;

/// Typed view over an internal node. The byte regions and the child slots
/// are kept apart so that the slots are never covered by a byte slice.
pub struct NodePage<'a, B> {
    meta: B,
    children: &'a [AtomicU32],
    keys: B,
}

impl<'a, B: Deref<Target = [u8]>> NodePage<'a, B> {
    pub fn from_parts(meta: B, children: &'a [AtomicU32], keys: B) -> Self {
        debug_assert_eq!(meta.len(), 4);
        debug_assert_eq!(children.len(), NODE_CAPACITY + 1);
        debug_assert_eq!(keys.len(), PAGE_SIZE - KEYS_OFFSET);
        Self {
            meta,
            children,
            keys,
        }
    }

    pub fn len(&self) -> usize {
        u16::from_le_bytes([self.meta[0], self.meta[1]]) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn key_words(&self) -> usize {
        u16::from_le_bytes([self.meta[2], self.meta[3]]) as usize
    }

    pub fn padded_key(&self, index: usize) -> &[u8] {
        let at = index * KEY_DIR_ENTRY_SIZE;
        let offset = self.keys[at] as usize * WORD_SIZE;
        let size = self.keys[at + 1] as usize * WORD_SIZE;
        &self.keys[KEY_BUF_OFFSET + offset..KEY_BUF_OFFSET + offset + size]
    }

    pub fn key(&self, index: usize) -> &[u8] {
        unpad(self.padded_key(index))
    }

    pub fn child(&self, index: usize) -> PageId {
        self.children[index].load(Ordering::Acquire)
    }

    /// Index of the child whose subtree may contain `key`: the first `i`
    /// with `key < key(i)`, or `len()`.
    pub fn lower_bound(&self, key: &[u8]) -> usize {
        let (mut lo, mut hi) = (0, self.len());
        while lo < hi {
            let mid = (lo + hi) / 2;
            if key < self.key(mid) {
                hi = mid;
            } else {
                lo = mid + 1;
            }
        }
        lo
    }

    pub fn fits(&self, padded_len: usize) -> bool {
        self.len() < NODE_CAPACITY && self.key_words() + padded_len / WORD_SIZE <= BUF_WORDS
    }

    pub fn validate(&self) -> Result<(), &'static str> {
        let count = self.len();
        if count > NODE_CAPACITY {
            return Err("node key count exceeds capacity");
        }
        let used = self.key_words();
        if used > BUF_WORDS {
            return Err("node key buffer usage exceeds page");
        }
        for index in 0..count {
            let at = index * KEY_DIR_ENTRY_SIZE;
            let (offset, size) = (self.keys[at] as usize, self.keys[at + 1] as usize);
            if size == 0 || offset + size > used {
                return Err("node key directory entry points outside the buffer");
            }
        }
        if (0..=count).any(|i| self.child(i) == NULL_PAGE) {
            return Err("node has a null child");
        }
        Ok(())
    }
}

impl<'a, B: DerefMut<Target = [u8]>> NodePage<'a, B> {
    fn set_len(&mut self, count: usize) {
        self.meta[0..2].copy_from_slice(&(count as u16).to_le_bytes());
    }

    fn set_key_words(&mut self, words: usize) {
        self.meta[2..4].copy_from_slice(&(words as u16).to_le_bytes());
    }

    pub fn set_child(&mut self, index: usize, child: PageId) {
        self.children[index].store(child, Ordering::Release);
    }

    /// Resets the node to a single child and no keys.
    pub fn init(&mut self, leftmost: PageId) {
        self.set_len(0);
        self.set_key_words(0);
        self.set_child(0, leftmost);
    }

    /// A fresh root with two children.
    pub fn init_with(&mut self, left: PageId, padded_key: &[u8], right: PageId) {
        self.init(left);
        self.append(padded_key, right);
    }

    fn write_key(&mut self, index: usize, padded_key: &[u8]) {
        let words = self.key_words();
        let size = padded_key.len() / WORD_SIZE;
        let at = index * KEY_DIR_ENTRY_SIZE;
        self.keys[at] = words as u8;
        self.keys[at + 1] = size as u8;
        let start = KEY_BUF_OFFSET + words * WORD_SIZE;
        self.keys[start..start + padded_key.len()].copy_from_slice(padded_key);
        self.set_key_words(words + size);
    }

    fn append(&mut self, padded_key: &[u8], child: PageId) {
        let count = self.len();
        self.write_key(count, padded_key);
        self.set_child(count + 1, child);
        self.set_len(count + 1);
    }

    /// Inserts `padded_key` at `index` with `child` to its right. Returns
    /// false if the node is full.
    pub fn insert(&mut self, index: usize, padded_key: &[u8], child: PageId) -> bool {
        if !self.fits(padded_key.len()) {
            return false;
        }
        let count = self.len();
        debug_assert!(index <= count);
        self.keys.copy_within(
            index * KEY_DIR_ENTRY_SIZE..count * KEY_DIR_ENTRY_SIZE,
            (index + 1) * KEY_DIR_ENTRY_SIZE,
        );
        for slot in (index + 1..=count).rev() {
            let moved = self.child(slot);
            self.set_child(slot + 1, moved);
        }
        self.write_key(index, padded_key);
        self.set_child(index + 1, child);
        self.set_len(count + 1);
        true
    }

    /// Splits this node while inserting `padded_key`/`child` at `index`.
    ///
    /// The middle key moves up: this node keeps the keys before it, `right`
    /// starts with the middle key's child and takes the keys after it.
    /// Returns the padded middle key.
    pub fn split<O: DerefMut<Target = [u8]>>(
        &mut self,
        right: &mut NodePage<'_, O>,
        index: usize,
        padded_key: &[u8],
        child: PageId,
    ) -> Vec<u8> {
        let leftmost = self.child(0);
        let mut items: Vec<(Vec<u8>, PageId)> = (0..self.len())
            .map(|i| (self.padded_key(i).to_vec(), self.child(i + 1)))
            .collect();
        items.insert(index.min(items.len()), (padded_key.to_vec(), child));

        let mut total = 0;
        let mut mid = items.len() - 1;
        for (i, (key, _)) in items.iter().enumerate() {
            total += key.len();
            if total > NODE_BUF_SIZE / 2 {
                mid = i;
                break;
            }
        }

        self.init(leftmost);
        for (key, child) in &items[..mid] {
            self.append(key, *child);
        }
        let (separator, right_leftmost) = &items[mid];
        right.init(*right_leftmost);
        for (key, child) in &items[mid + 1..] {
            right.append(key, *child);
        }
        separator.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::pad;

    struct NodeBuf {
        meta: Vec<u8>,
        children: Vec<AtomicU32>,
        keys: Vec<u8>,
    }

    impl NodeBuf {
        fn new() -> Self {
            Self {
                meta: vec![0; 4],
                children: (0..=NODE_CAPACITY).map(|_| AtomicU32::new(NULL_PAGE)).collect(),
                keys: vec![0; PAGE_SIZE - KEYS_OFFSET],
            }
        }

        fn view(&mut self) -> NodePage<'_, &mut [u8]> {
            NodePage::from_parts(&mut self.meta[..], &self.children, &mut self.keys[..])
        }
    }

    fn keys_of(node: &NodePage<'_, &mut [u8]>) -> Vec<Vec<u8>> {
        (0..node.len()).map(|i| node.key(i).to_vec()).collect()
    }

    #[test]
    fn test_node_layout_constants() {
        assert_eq!(CHILDREN_OFFSET, 20);
        assert_eq!(KEYS_OFFSET, 764);
        assert_eq!(NODE_BUF_SIZE, 2960);
        assert_eq!((KEYS_OFFSET + KEY_BUF_OFFSET) % WORD_SIZE, 0);
        assert!(NODE_CAPACITY * KEY_DIR_ENTRY_SIZE <= KEY_BUF_OFFSET);
    }

    #[test]
    fn test_init_with_and_lower_bound() {
        let mut buf = NodeBuf::new();
        let mut node = buf.view();
        node.init_with(10, &pad(b"m"), 20);

        assert_eq!(node.len(), 1);
        assert_eq!(node.child(0), 10);
        assert_eq!(node.child(1), 20);
        assert_eq!(node.lower_bound(b"a"), 0);
        // keys equal to a separator belong to its right
        assert_eq!(node.lower_bound(b"m"), 1);
        assert_eq!(node.lower_bound(b"z"), 1);
        assert!(node.validate().is_ok());
    }

    #[test]
    fn test_insert_shifts_children() {
        let mut buf = NodeBuf::new();
        let mut node = buf.view();
        node.init_with(1, &pad(b"d"), 4);
        // child 1 split into 1 | 2 at "b"
        assert!(node.insert(0, &pad(b"b"), 2));
        // child 4 split into 4 | 5 at "f"
        assert!(node.insert(2, &pad(b"f"), 5));

        assert_eq!(keys_of(&node), vec![b"b".to_vec(), b"d".to_vec(), b"f".to_vec()]);
        let children: Vec<PageId> = (0..=node.len()).map(|i| node.child(i)).collect();
        assert_eq!(children, vec![1, 2, 4, 5]);
        assert_eq!(node.lower_bound(b"c"), 1);
        assert_eq!(node.lower_bound(b"e"), 2);
    }

    #[test]
    fn test_fill_and_split() {
        let mut buf = NodeBuf::new();
        let mut node = buf.view();
        node.init(0);
        let mut count = 0u32;
        while node.insert(count as usize, &pad(&count.to_be_bytes()), count + 1) {
            count += 1;
        }
        assert_eq!(count as usize, NODE_CAPACITY);

        let mut other = NodeBuf::new();
        let mut right = other.view();
        let new_key = pad(&count.to_be_bytes());
        let separator = node.split(&mut right, count as usize, &new_key, count + 1);

        assert_eq!(node.len() + right.len() + 1, NODE_CAPACITY + 1);
        let sep = u32::from_be_bytes(unpad(&separator).try_into().unwrap());
        assert_eq!(node.len() as u32, sep);
        // the separator's child becomes the right node's leftmost
        assert_eq!(right.child(0), sep + 1);
        assert_eq!(node.child(node.len()), sep);
        assert!(node.key(node.len() - 1) < unpad(&separator));
        assert!(unpad(&separator) < right.key(0));
        assert!(node.validate().is_ok());
        assert!(right.validate().is_ok());
    }
}
