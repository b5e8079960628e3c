//! Pages that hold lists of page ids waiting to be freed.
//!
//! ```text
//! [0..4]   number of ids
//! [4..8]   next free-list page
//! [8..]    ids
//! ```

use std::ops::{Deref, DerefMut};

use super::{PageId, HEADER_SIZE, PAGE_SIZE};

const LEN_OFFSET: usize = 0;
const LINK_OFFSET: usize = 4;
const IDS_OFFSET: usize = 8;

pub const FREE_LIST_CAPACITY: usize = (PAGE_SIZE - HEADER_SIZE - IDS_OFFSET) / 4;

pub struct FreeListPage<B> {
    body: B,
}

impl<B: Deref<Target = [u8]>> FreeListPage<B> {
    pub fn new(body: B) -> Self {
        debug_assert_eq!(body.len(), PAGE_SIZE - HEADER_SIZE);
        Self { body }
    }

    fn read_u32(&self, offset: usize) -> u32 {
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&self.body[offset..offset + 4]);
        u32::from_le_bytes(bytes)
    }

    pub fn len(&self) -> usize {
        self.read_u32(LEN_OFFSET) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() >= FREE_LIST_CAPACITY
    }

    pub fn link(&self) -> PageId {
        self.read_u32(LINK_OFFSET)
    }

    pub fn get(&self, index: usize) -> PageId {
        self.read_u32(IDS_OFFSET + index * 4)
    }
}

impl<B: DerefMut<Target = [u8]>> FreeListPage<B> {
    fn write_u32(&mut self, offset: usize, value: u32) {
        self.body[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    pub fn init(&mut self, link: PageId) {
        self.write_u32(LEN_OFFSET, 0);
        self.write_u32(LINK_OFFSET, link);
    }

    /// Returns false when the page is full.
    pub fn push(&mut self, id: PageId) -> bool {
        let len = self.len();
        if len >= FREE_LIST_CAPACITY {
            return false;
        }
        self.write_u32(IDS_OFFSET + len * 4, id);
        self.write_u32(LEN_OFFSET, len as u32 + 1);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::NULL_PAGE;

    #[test]
    fn test_free_list_capacity() {
        assert_eq!(FREE_LIST_CAPACITY, 1018);

        let mut page = FreeListPage::new(vec![0u8; PAGE_SIZE - HEADER_SIZE]);
        page.init(NULL_PAGE);
        assert!(page.is_empty());
        assert_eq!(page.link(), NULL_PAGE);

        for id in 0..FREE_LIST_CAPACITY as u32 {
            assert!(page.push(id * 3));
        }
        assert!(page.is_full());
        assert!(!page.push(1));
        assert_eq!(page.get(0), 0);
        assert_eq!(page.get(FREE_LIST_CAPACITY - 1), (FREE_LIST_CAPACITY as u32 - 1) * 3);
    }
}
