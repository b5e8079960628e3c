//! Leaf pages: sorted key/value records.
//!
//! The body (everything after the page header) is laid out as:
//!
//! ```text
//! [0..2]      record count
//! [2..4]      used buffer words
//! [4..456]    directory, LEAF_CAPACITY entries of
//!             {offset_words, key_words, value_words, flags}
//! [464..]     record buffer; each record is a padded key directly followed
//!             by its padded value
//! ```
//!
//! Directory entries are kept in key order. The buffer is append-only and is
//! compacted whenever a record is removed.

use std::ops::{Deref, DerefMut, Range};

use super::{padded_len, unpad, write_padded, HEADER_SIZE, PAGE_SIZE, WORD_SIZE};

const COUNT_OFFSET: usize = 0;
const USED_OFFSET: usize = 2;
const DIR_OFFSET: usize = 4;
const DIR_ENTRY_SIZE: usize = 4;
const BUF_OFFSET: usize = 464;

pub const LEAF_CAPACITY: usize = 113;
pub const LEAF_BUF_SIZE: usize = PAGE_SIZE - HEADER_SIZE - BUF_OFFSET;
const BUF_WORDS: usize = LEAF_BUF_SIZE / WORD_SIZE;

#[derive(Debug, Clone, Copy)]
struct LeafEntry {
    offset_words: u8,
    key_words: u8,
    value_words: u8,
}

impl LeafEntry {
    fn key_range(&self) -> Range<usize> {
        let start = self.offset_words as usize * WORD_SIZE;
        start..start + self.key_words as usize * WORD_SIZE
    }

    fn value_range(&self) -> Range<usize> {
        let start = (self.offset_words as usize + self.key_words as usize) * WORD_SIZE;
        start..start + self.value_words as usize * WORD_SIZE
    }

    fn words(&self) -> usize {
        self.key_words as usize + self.value_words as usize
    }
}

/// Typed view over a leaf body.
pub struct LeafPage<B> {
    body: B,
}

impl<B: Deref<Target = [u8]>> LeafPage<B> {
    pub fn new(body: B) -> Self {
        debug_assert_eq!(body.len(), PAGE_SIZE - HEADER_SIZE);
        Self { body }
    }

    fn read_u16(&self, offset: usize) -> usize {
        u16::from_le_bytes([self.body[offset], self.body[offset + 1]]) as usize
    }

    pub fn len(&self) -> usize {
        self.read_u16(COUNT_OFFSET)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn used_words(&self) -> usize {
        self.read_u16(USED_OFFSET)
    }

    fn entry(&self, index: usize) -> LeafEntry {
        let at = DIR_OFFSET + index * DIR_ENTRY_SIZE;
        LeafEntry {
            offset_words: self.body[at],
            key_words: self.body[at + 1],
            value_words: self.body[at + 2],
        }
    }

    fn buffer(&self) -> &[u8] {
        &self.body[BUF_OFFSET..]
    }

    pub fn padded_key(&self, index: usize) -> &[u8] {
        &self.buffer()[self.entry(index).key_range()]
    }

    pub fn key(&self, index: usize) -> &[u8] {
        unpad(self.padded_key(index))
    }

    pub fn value(&self, index: usize) -> &[u8] {
        unpad(&self.buffer()[self.entry(index).value_range()])
    }

    /// First index whose key is `>= key`, or `len()`.
    pub fn lower_bound(&self, key: &[u8]) -> usize {
        let (mut lo, mut hi) = (0, self.len());
        while lo < hi {
            let mid = (lo + hi) / 2;
            if self.key(mid) < key {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }

    pub fn fits(&self, key_len: usize, value_len: usize) -> bool {
        let words = (padded_len(key_len) + padded_len(value_len)) / WORD_SIZE;
        self.len() < LEAF_CAPACITY && self.used_words() + words <= BUF_WORDS
    }

    /// Checks that every directory entry points inside the used buffer.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.len() > LEAF_CAPACITY {
            return Err("leaf record count exceeds capacity");
        }
        let used = self.used_words();
        if used > BUF_WORDS {
            return Err("leaf buffer usage exceeds page");
        }
        for index in 0..self.len() {
            let entry = self.entry(index);
            if entry.key_words == 0 || entry.value_words == 0 {
                return Err("leaf directory entry has empty record");
            }
            if entry.offset_words as usize + entry.words() > used {
                return Err("leaf directory entry points outside the buffer");
            }
        }
        Ok(())
    }
}

impl<'a> LeafPage<&'a [u8]> {
    /// Key `index`, borrowed from the page rather than the view.
    pub fn key_at(&self, index: usize) -> &'a [u8] {
        let body: &'a [u8] = self.body;
        unpad(&body[BUF_OFFSET..][self.entry(index).key_range()])
    }

    pub fn value_at(&self, index: usize) -> &'a [u8] {
        let body: &'a [u8] = self.body;
        unpad(&body[BUF_OFFSET..][self.entry(index).value_range()])
    }
}

impl<B: DerefMut<Target = [u8]>> LeafPage<B> {
    fn write_u16(&mut self, offset: usize, value: usize) {
        self.body[offset..offset + 2].copy_from_slice(&(value as u16).to_le_bytes());
    }

    pub fn clear(&mut self) {
        self.write_u16(COUNT_OFFSET, 0);
        self.write_u16(USED_OFFSET, 0);
    }

    fn set_entry(&mut self, index: usize, entry: LeafEntry) {
        let at = DIR_OFFSET + index * DIR_ENTRY_SIZE;
        self.body[at] = entry.offset_words;
        self.body[at + 1] = entry.key_words;
        self.body[at + 2] = entry.value_words;
        self.body[at + 3] = 0;
    }

    /// Appends a record to the buffer and returns its directory entry.
    fn write_record(&mut self, key: &[u8], value: &[u8]) -> LeafEntry {
        let used = self.used_words();
        let entry = LeafEntry {
            offset_words: used as u8,
            key_words: (padded_len(key.len()) / WORD_SIZE) as u8,
            value_words: (padded_len(value.len()) / WORD_SIZE) as u8,
        };
        let key_range = entry.key_range();
        let value_range = entry.value_range();
        write_padded(&mut self.body[BUF_OFFSET..][key_range], key);
        write_padded(&mut self.body[BUF_OFFSET..][value_range], value);
        self.write_u16(USED_OFFSET, used + entry.words());
        entry
    }

    /// Appends already padded data at the end of the directory.
    fn append_padded(&mut self, padded_key: &[u8], padded_value: &[u8]) {
        let used = self.used_words();
        let count = self.len();
        let entry = LeafEntry {
            offset_words: used as u8,
            key_words: (padded_key.len() / WORD_SIZE) as u8,
            value_words: (padded_value.len() / WORD_SIZE) as u8,
        };
        let key_range = entry.key_range();
        let value_range = entry.value_range();
        self.body[BUF_OFFSET..][key_range].copy_from_slice(padded_key);
        self.body[BUF_OFFSET..][value_range].copy_from_slice(padded_value);
        self.set_entry(count, entry);
        self.write_u16(USED_OFFSET, used + entry.words());
        self.write_u16(COUNT_OFFSET, count + 1);
    }

    /// Inserts a record at `index`. Returns false if it does not fit.
    pub fn insert(&mut self, index: usize, key: &[u8], value: &[u8]) -> bool {
        if !self.fits(key.len(), value.len()) {
            return false;
        }
        let count = self.len();
        debug_assert!(index <= count);
        self.body.copy_within(
            DIR_OFFSET + index * DIR_ENTRY_SIZE..DIR_OFFSET + count * DIR_ENTRY_SIZE,
            DIR_OFFSET + (index + 1) * DIR_ENTRY_SIZE,
        );
        let entry = self.write_record(key, value);
        self.set_entry(index, entry);
        self.write_u16(COUNT_OFFSET, count + 1);
        true
    }

    /// Removes the record at `index` and compacts the buffer.
    pub fn remove(&mut self, index: usize) {
        let buffer = self.buffer().to_vec();
        let entries: Vec<LeafEntry> = (0..self.len()).map(|i| self.entry(i)).collect();
        self.clear();
        for (i, entry) in entries.iter().enumerate() {
            if i != index {
                self.append_padded(&buffer[entry.key_range()], &buffer[entry.value_range()]);
            }
        }
    }

    /// Splits this leaf while inserting a record at `index`.
    ///
    /// The records (including the new one) are divided at the first position
    /// where the accumulated size passes half the buffer. This page keeps the
    /// lower half, `right` (which must be empty) receives the rest. Returns
    /// the padded first key of `right`, which separates the two.
    pub fn split<O: DerefMut<Target = [u8]>>(
        &mut self,
        right: &mut LeafPage<O>,
        index: usize,
        key: &[u8],
        value: &[u8],
    ) -> Vec<u8> {
        let buffer = self.buffer().to_vec();
        let new_key = super::pad(key);
        let new_value = super::pad(value);

        let mut records: Vec<(&[u8], &[u8])> = Vec::with_capacity(self.len() + 1);
        for i in 0..self.len() {
            if i == index {
                records.push((new_key.as_slice(), new_value.as_slice()));
            }
            let entry = self.entry(i);
            records.push((&buffer[entry.key_range()], &buffer[entry.value_range()]));
        }
        if index >= self.len() {
            records.push((new_key.as_slice(), new_value.as_slice()));
        }

        let mut total = 0;
        let mut mid = records.len() - 1;
        for (i, (k, v)) in records.iter().enumerate() {
            total += k.len() + v.len();
            if total > LEAF_BUF_SIZE / 2 {
                mid = i;
                break;
            }
        }
        let mid = mid.clamp(1, records.len() - 1);

        self.clear();
        for (k, v) in &records[..mid] {
            self.append_padded(k, v);
        }
        right.clear();
        for (k, v) in &records[mid..] {
            right.append_padded(k, v);
        }
        records[mid].0.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::pad;

    fn empty_leaf() -> LeafPage<Vec<u8>> {
        let mut leaf = LeafPage::new(vec![0u8; PAGE_SIZE - HEADER_SIZE]);
        leaf.clear();
        leaf
    }

    fn insert_sorted(leaf: &mut LeafPage<Vec<u8>>, key: &[u8], value: &[u8]) -> bool {
        let index = leaf.lower_bound(key);
        leaf.insert(index, key, value)
    }

    #[test]
    fn test_leaf_layout_constants() {
        assert_eq!(LEAF_BUF_SIZE, 3616);
        assert_eq!(BUF_WORDS, 226);
        assert!(DIR_OFFSET + LEAF_CAPACITY * DIR_ENTRY_SIZE <= BUF_OFFSET);
        // page-relative buffer start is 16-byte aligned
        assert_eq!((HEADER_SIZE + BUF_OFFSET) % WORD_SIZE, 0);
    }

    #[test]
    fn test_insert_and_lookup() {
        let mut leaf = empty_leaf();
        assert!(insert_sorted(&mut leaf, b"banana", b"yellow"));
        assert!(insert_sorted(&mut leaf, b"apple", b"red"));
        assert!(insert_sorted(&mut leaf, b"cherry", b""));

        assert_eq!(leaf.len(), 3);
        assert_eq!(leaf.key(0), b"apple");
        assert_eq!(leaf.value(0), b"red");
        assert_eq!(leaf.key(1), b"banana");
        assert_eq!(leaf.key(2), b"cherry");
        assert_eq!(leaf.value(2), b"");

        assert_eq!(leaf.lower_bound(b"banana"), 1);
        assert_eq!(leaf.lower_bound(b"b"), 1);
        assert_eq!(leaf.lower_bound(b"zzz"), 3);
        assert_eq!(leaf.lower_bound(b""), 0);
        assert!(leaf.validate().is_ok());
    }

    #[test]
    fn test_remove_compacts_buffer() {
        let mut leaf = empty_leaf();
        for key in [b"a", b"b", b"c"] {
            assert!(insert_sorted(&mut leaf, key, &[7u8; 40]));
        }
        let used = leaf.used_words();

        leaf.remove(1);
        assert_eq!(leaf.len(), 2);
        assert_eq!(leaf.key(0), b"a");
        assert_eq!(leaf.key(1), b"c");
        assert_eq!(leaf.value(1), &[7u8; 40]);
        assert_eq!(leaf.used_words(), used - 4);
    }

    #[test]
    fn test_insert_reports_full() {
        let mut leaf = empty_leaf();
        let mut inserted = 0u32;
        loop {
            let key = inserted.to_be_bytes();
            if !insert_sorted(&mut leaf, &key, &[1u8; 100]) {
                break;
            }
            inserted += 1;
        }
        // 16 + 112 bytes per record
        assert_eq!(inserted as usize, LEAF_BUF_SIZE / 128);
        assert!(!leaf.fits(4, 100));
        assert!(leaf.validate().is_ok());
    }

    #[test]
    fn test_directory_limit() {
        let mut leaf = empty_leaf();
        for i in 0..LEAF_CAPACITY as u16 {
            assert!(insert_sorted(&mut leaf, &i.to_be_bytes(), b""));
        }
        assert!(!leaf.fits(1, 0));
    }

    #[test]
    fn test_split_balances_and_orders() {
        let mut leaf = empty_leaf();
        let mut keys = Vec::new();
        let mut i = 0u32;
        while insert_sorted(&mut leaf, &(i * 2).to_be_bytes(), &[3u8; 60]) {
            keys.push((i * 2).to_be_bytes().to_vec());
            i += 1;
        }

        let new_key = 5u32.to_be_bytes();
        let index = leaf.lower_bound(&new_key);
        let mut right = empty_leaf();
        let separator = leaf.split(&mut right, index, &new_key, &[9u8; 60]);
        keys.push(new_key.to_vec());
        keys.sort();

        assert_eq!(leaf.len() + right.len(), keys.len());
        assert_eq!(separator, pad(right.key(0)));
        assert!(leaf.key(leaf.len() - 1) < right.key(0));

        let merged: Vec<Vec<u8>> = (0..leaf.len())
            .map(|i| leaf.key(i).to_vec())
            .chain((0..right.len()).map(|i| right.key(i).to_vec()))
            .collect();
        assert_eq!(merged, keys);

        let left_bytes = leaf.used_words() * WORD_SIZE;
        let right_bytes = right.used_words() * WORD_SIZE;
        assert!(left_bytes > LEAF_BUF_SIZE / 2 - 128);
        assert!(right_bytes < LEAF_BUF_SIZE);
        assert!(leaf.validate().is_ok());
        assert!(right.validate().is_ok());
    }

    #[test]
    fn test_validate_detects_bad_directory() {
        let mut leaf = empty_leaf();
        assert!(insert_sorted(&mut leaf, b"k", b"v"));
        // point the record past the used area
        leaf.body[DIR_OFFSET] = 200;
        assert!(leaf.validate().is_err());
    }
}
