//! Page arena.
//!
//! Memory pages live in one anonymous mapping. Slots are handed out by a bump
//! pointer; released slots are chained into an intrusive free list through
//! their `prev` header field.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};

use log::debug;
use memmap2::MmapMut;
use parking_lot::Mutex;

use crate::page::{PageId, PageType, RawPage, NULL_PAGE, PAGE_SIZE};
use crate::{Result, StorageError};

struct FreeSlots {
    head: PageId,
    len: u32,
}

pub struct Allocator {
    // Keeps the arena mapped; all access goes through `base`.
    _map: MmapMut,
    base: NonNull<u8>,
    capacity: u32,
    next: AtomicU32,
    free: Mutex<FreeSlots>,
}

// SAFETY: the mapping is never remapped or unmapped while the allocator is
// alive. Concurrent access to page contents follows the rules on RawPage.
unsafe impl Send for Allocator {}
unsafe impl Sync for Allocator {}

impl Allocator {
    pub fn new(capacity: u32) -> Result<Self> {
        if capacity == 0 {
            return Err(StorageError::Config(
                "page arena needs at least one page".to_string(),
            ));
        }
        let mut map = MmapMut::map_anon(capacity as usize * PAGE_SIZE)?;
        let base = NonNull::new(map.as_mut_ptr())
            .ok_or_else(|| StorageError::Config("anonymous mapping returned null".to_string()))?;
        debug!("mapped page arena of {} pages", capacity);
        Ok(Self {
            _map: map,
            base,
            capacity,
            next: AtomicU32::new(0),
            free: Mutex::new(FreeSlots {
                head: NULL_PAGE,
                len: 0,
            }),
        })
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Translates a memory page id into a handle on its slot.
    pub fn page(&self, id: PageId) -> Result<RawPage<'_>> {
        if id >= self.next.load(Ordering::Acquire) {
            return Err(StorageError::corrupted(id, "page id outside the arena"));
        }
        // SAFETY: id is below the bump pointer, hence below capacity, so the
        // slot lies inside the mapping, which lives as long as &self. Slots
        // are PAGE_SIZE apart from a page-aligned base.
        Ok(unsafe {
            RawPage::from_ptr(NonNull::new_unchecked(
                self.base.as_ptr().add(id as usize * PAGE_SIZE),
            ))
        })
    }

    pub fn allocate(&self) -> Result<PageId> {
        {
            let mut free = self.free.lock();
            if free.head != NULL_PAGE {
                let id = free.head;
                free.head = self.page(id)?.prev();
                free.len -= 1;
                return Ok(id);
            }
        }
        self.next
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |next| {
                (next < self.capacity).then_some(next + 1)
            })
            .map_err(|_| StorageError::OutOfPages {
                capacity: self.capacity,
            })
    }

    /// Returns a slot to the free list. The caller guarantees nothing can
    /// reach the page any more.
    pub fn deallocate(&self, id: PageId) -> Result<()> {
        let page = self.page(id)?;
        let mut free = self.free.lock();
        page.init_header(PageType::Free, free.head, 0);
        free.head = id;
        free.len += 1;
        Ok(())
    }

    /// Slots currently handed out.
    pub fn allocated(&self) -> u32 {
        let free = self.free.lock();
        self.next.load(Ordering::Acquire) - free.len
    }

    /// Slots available without growing into untouched arena space.
    pub fn free_slots(&self) -> u32 {
        self.free.lock().len
    }

    /// Slots that can still be allocated.
    pub fn available(&self) -> u32 {
        let free = self.free.lock();
        self.capacity - self.next.load(Ordering::Acquire) + free.len
    }
}
