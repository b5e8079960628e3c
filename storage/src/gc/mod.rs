//! Generational reclamation of obsolete pages.
//!
//! Pages that became unreachable at some version are appended to the current
//! pending list. A list is closed by flipping to the other one; a closed list
//! is freed as a whole once its highest version is no longer observable by
//! any live reader.
//!
//! Pending ids are stored on free-list pages taken from the arena itself, so
//! queueing reserves every list page it will need before touching the list.
//! One spare list page is kept allocated so a queue can still start a fresh
//! list after the arena has run dry.

use log::{debug, warn};
use parking_lot::Mutex;

use crate::alloc::Allocator;
use crate::page::{PageId, PageType, Version, FREE_LIST_CAPACITY, NULL_PAGE};
use crate::{Result, StorageError};

#[derive(Debug)]
struct PendingList {
    head: PageId,
    pages: usize,
    list_pages: usize,
    max_version: Version,
}

impl PendingList {
    fn new() -> Self {
        Self {
            head: NULL_PAGE,
            pages: 0,
            list_pages: 0,
            max_version: 0,
        }
    }

    fn room(&self, alloc: &Allocator) -> Result<usize> {
        if self.head == NULL_PAGE {
            return Ok(0);
        }
        let page = alloc.page(self.head)?;
        // SAFETY: free-list pages are only touched under the GC lock, which
        // the caller holds.
        let list = unsafe { page.free_list_mut() };
        Ok(FREE_LIST_CAPACITY - list.len())
    }

    fn push(&mut self, alloc: &Allocator, id: PageId) -> Result<bool> {
        if self.head == NULL_PAGE {
            return Ok(false);
        }
        let page = alloc.page(self.head)?;
        // SAFETY: as in `room`.
        let mut list = unsafe { page.free_list_mut() };
        if !list.push(id) {
            return Ok(false);
        }
        self.pages += 1;
        Ok(true)
    }

    fn link(&mut self, alloc: &Allocator, id: PageId) -> Result<()> {
        let page = alloc.page(id)?;
        page.init_header(PageType::FreeList, NULL_PAGE, 0);
        // SAFETY: the page was just reserved for this list.
        unsafe { page.free_list_mut() }.init(self.head);
        self.head = id;
        self.list_pages += 1;
        Ok(())
    }

    fn drain(
        &mut self,
        alloc: &Allocator,
        release: &mut dyn FnMut(PageId) -> Result<()>,
    ) -> Result<usize> {
        let mut freed = 0;
        let mut cursor = self.head;
        while cursor != NULL_PAGE {
            let page = alloc.page(cursor)?;
            if page.page_type() != Some(PageType::FreeList) {
                return Err(StorageError::corrupted(cursor, "expected a free-list page"));
            }
            // SAFETY: as in `room`.
            let list = unsafe { page.free_list_mut() };
            let next = list.link();
            for i in 0..list.len() {
                release(list.get(i))?;
                freed += 1;
            }
            alloc.deallocate(cursor)?;
            cursor = next;
        }
        *self = PendingList::new();
        Ok(freed)
    }
}

struct GcState {
    current: usize,
    lists: [PendingList; 2],
    spare: Option<PageId>,
}

pub struct GcManager {
    state: Mutex<GcState>,
}

impl Default for GcManager {
    fn default() -> Self {
        Self::new()
    }
}

impl GcManager {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(GcState {
                current: 0,
                lists: [PendingList::new(), PendingList::new()],
                spare: None,
            }),
        }
    }

    /// Queues `pages`, which stopped being observable at `version`. Either
    /// every page is queued or none is.
    pub fn queue(&self, alloc: &Allocator, pages: &[PageId], version: Version) -> Result<()> {
        if pages.is_empty() {
            return Ok(());
        }
        let mut state = self.state.lock();
        let GcState {
            current,
            lists,
            spare,
        } = &mut *state;
        let current = *current;
        let list = &mut lists[current];

        let room = list.room(alloc)?;
        let needed = pages.len().saturating_sub(room).div_ceil(FREE_LIST_CAPACITY);
        let mut reserved = Vec::with_capacity(needed);
        let mut from_spare = None;
        for _ in 0..needed {
            let id = match alloc.allocate() {
                Ok(id) => id,
                Err(e) => match spare.take() {
                    Some(id) => {
                        from_spare = Some(id);
                        id
                    }
                    None => {
                        warn!(
                            "cannot reserve free-list pages for {} obsolete pages: {}",
                            pages.len(),
                            e
                        );
                        for id in reserved {
                            if Some(id) == from_spare {
                                *spare = Some(id);
                            } else {
                                alloc.deallocate(id)?;
                            }
                        }
                        return Err(e);
                    }
                },
            };
            reserved.push(id);
        }

        let mut reserved = reserved.into_iter();
        for &id in pages {
            if !list.push(alloc, id)? {
                let fresh = reserved
                    .next()
                    .ok_or_else(|| StorageError::corrupted(id, "free-list reservation too small"))?;
                list.link(alloc, fresh)?;
                list.push(alloc, id)?;
            }
        }
        list.max_version = list.max_version.max(version);
        if spare.is_none() {
            *spare = alloc.allocate().ok();
        }
        debug!(
            "queued {} pages at version {} in generation {}",
            pages.len(),
            version,
            current
        );
        Ok(())
    }

    /// Frees the closed generation if nothing at or below `oldest_live` can
    /// still see it, then flips generations. Never blocks: returns 0 when
    /// another thread is already collecting.
    pub fn process(
        &self,
        alloc: &Allocator,
        oldest_live: Version,
        mut release: impl FnMut(PageId) -> Result<()>,
    ) -> Result<usize> {
        let Some(mut state) = self.state.try_lock() else {
            return Ok(0);
        };
        let other = state.current ^ 1;
        let closed = &mut state.lists[other];
        if closed.pages > 0 && closed.max_version > oldest_live {
            return Ok(0);
        }
        let freed = closed.drain(alloc, &mut release)?;
        state.current = other;
        if freed > 0 {
            debug!(
                "freed {} pages from generation {} (oldest live version {})",
                freed, other, oldest_live
            );
        }
        Ok(freed)
    }

    /// Pages waiting in either generation.
    pub fn pending(&self) -> usize {
        let state = self.state.lock();
        state.lists.iter().map(|list| list.pages).sum()
    }

    /// Arena pages used to hold the pending lists.
    pub fn list_pages(&self) -> usize {
        let state = self.state.lock();
        state.lists.iter().map(|list| list.list_pages).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocate(alloc: &Allocator, n: usize) -> Vec<PageId> {
        (0..n).map(|_| alloc.allocate().unwrap()).collect()
    }

    fn release(alloc: &Allocator) -> impl FnMut(PageId) -> Result<()> + '_ {
        move |id| alloc.deallocate(id)
    }

    #[test]
    fn test_generation_waits_for_readers() {
        let alloc = Allocator::new(64).unwrap();
        let gc = GcManager::new();
        let pages = allocate(&alloc, 2);

        gc.queue(&alloc, &pages, 5).unwrap();
        assert_eq!(gc.pending(), 2);

        // closes generation 0
        assert_eq!(gc.process(&alloc, 10, release(&alloc)).unwrap(), 0);
        // a reader at version 3 can still see the pages
        assert_eq!(gc.process(&alloc, 3, release(&alloc)).unwrap(), 0);
        assert_eq!(gc.pending(), 2);

        assert_eq!(gc.process(&alloc, 5, release(&alloc)).unwrap(), 2);
        assert_eq!(gc.pending(), 0);
        assert_eq!(gc.list_pages(), 0);
        // two pages plus the free-list page went back to the arena
        assert_eq!(alloc.free_slots(), 3);
    }

    #[test]
    fn test_queue_spans_several_list_pages() {
        let alloc = Allocator::new(4096).unwrap();
        let gc = GcManager::new();
        let pages = allocate(&alloc, FREE_LIST_CAPACITY * 2 + 5);

        gc.queue(&alloc, &pages, 1).unwrap();
        assert_eq!(gc.pending(), pages.len());
        assert_eq!(gc.list_pages(), 3);

        gc.process(&alloc, 1, release(&alloc)).unwrap();
        assert_eq!(gc.process(&alloc, 1, release(&alloc)).unwrap(), pages.len());
        // only the spare list page is left
        assert_eq!(alloc.allocated(), 1);
    }

    #[test]
    fn test_queue_is_all_or_nothing() {
        let alloc = Allocator::new(16).unwrap();
        let gc = GcManager::new();
        // fill the arena so no free-list page can be reserved
        let pages = allocate(&alloc, 16);

        assert!(matches!(
            gc.queue(&alloc, &pages, 1),
            Err(StorageError::OutOfPages { .. })
        ));
        assert_eq!(gc.pending(), 0);
        assert_eq!(gc.list_pages(), 0);

        alloc.deallocate(pages[15]).unwrap();
        gc.queue(&alloc, &pages[..15], 1).unwrap();
        assert_eq!(gc.pending(), 15);
    }

    #[test]
    fn test_spare_page_starts_list_when_arena_is_full() {
        let alloc = Allocator::new(16).unwrap();
        let gc = GcManager::new();
        let first = allocate(&alloc, 1);
        gc.queue(&alloc, &first, 1).unwrap();
        // the list page and the spare
        assert_eq!(alloc.allocated(), 3);

        // move to the empty generation, which has no list page yet
        assert_eq!(gc.process(&alloc, 0, release(&alloc)).unwrap(), 0);
        let rest = allocate(&alloc, 13);
        assert!(alloc.allocate().is_err());

        gc.queue(&alloc, &rest[..4], 2).unwrap();
        assert_eq!(gc.pending(), 5);
        assert_eq!(gc.list_pages(), 2);

        // the spare is gone; the next fresh list cannot be started
        assert_eq!(gc.process(&alloc, 1, release(&alloc)).unwrap(), 1);
        alloc.allocate().unwrap();
        alloc.allocate().unwrap();
        assert!(matches!(
            gc.queue(&alloc, &rest[4..], 3),
            Err(StorageError::OutOfPages { .. })
        ));
        assert_eq!(gc.pending(), 4);
    }

    #[test]
    fn test_process_does_not_block() {
        let alloc = Allocator::new(16).unwrap();
        let gc = GcManager::new();
        let _held = gc.state.lock();
        assert_eq!(gc.process(&alloc, 0, release(&alloc)).unwrap(), 0);
    }
}
