//! The page manager.
//!
//! Owns the page arena, the page file and the version registry. It resolves
//! slots to pages (reading file-resident pages into memory on demand), serves
//! versioned reads by walking `prev` chains, decides flush boundaries and
//! turns committed trees into page images for the write-back worker.

pub mod checkpoint;
pub(crate) mod writer;

pub use checkpoint::CheckpointRoot;

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use log::{debug, error, info, warn};
use parking_lot::{Mutex, MutexGuard};

use crate::alloc::Allocator;
use crate::config::EngineConfig;
use crate::file::PageFile;
use crate::gc::GcManager;
use crate::page::{self, PageId, PageType, RawPage, Version, NODE_CAPACITY, NULL_PAGE, PAGE_SIZE};
use crate::sync::MutexSet;
use crate::{Result, StorageError, NUM_TABLES};

use checkpoint::{FlushJob, Versions};
use writer::{Durability, FlushHeader, FlushTicket, WriteBack};

/// Where a page is referenced from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodePtr {
    /// A root slot of the checkpoint.
    Root { table: usize },
    /// Child slot `slot` of internal node `parent`.
    Child { parent: PageId, slot: u16 },
}

/// What a new transaction is bound to.
pub(crate) struct TxnStart {
    pub checkpoint: Arc<CheckpointRoot>,
    pub prev_head: Arc<CheckpointRoot>,
    pub clone_version: Version,
}

#[derive(Default)]
struct Locations {
    /// Memory page -> file page holding its latest image, with the flush
    /// that writes it. `None` means the image was read from the file.
    persisted: HashMap<PageId, (PageId, Option<Arc<FlushTicket>>)>,
    /// File page -> memory page it was read into.
    loaded: HashMap<PageId, PageId>,
}

pub struct PageManager {
    // Dropped first so the worker drains its queue before anything else goes.
    writer: WriteBack,
    config: EngineConfig,
    alloc: Allocator,
    file: Arc<PageFile>,
    versions: Mutex<Versions>,
    writer_lock: Mutex<()>,
    flush_lock: Mutex<()>,
    next_file_page: AtomicU32,
    locations: Mutex<Locations>,
    page_loads: MutexSet<PageId>,
    gc: GcManager,
    durable: Arc<Durability>,
}

impl PageManager {
    pub fn open(dir: &Path, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(dir)?;
        let file = Arc::new(PageFile::open_or_create(
            &dir.join(&config.file_name),
            config.max_memory_pages,
            config.fsync,
        )?);
        let header = file.header();
        let alloc = Allocator::new(config.memory_pages)?;
        let root = Arc::new(CheckpointRoot::new(header.durable_version, header.roots));
        let durable = Arc::new(Durability::new(header.durable_version));
        let writer = WriteBack::start(file.clone(), durable.clone())?;

        info!(
            "opened {} at version {} ({} memory pages, {} file pages)",
            dir.display(),
            header.durable_version,
            config.memory_pages,
            header.next_file_page - header.max_memory_pages
        );
        Ok(Self {
            writer,
            alloc,
            file,
            versions: Mutex::new(Versions::new(root)),
            writer_lock: Mutex::new(()),
            flush_lock: Mutex::new(()),
            next_file_page: AtomicU32::new(header.next_file_page),
            locations: Mutex::new(Locations::default()),
            page_loads: MutexSet::new(),
            gc: GcManager::new(),
            durable,
            config,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Serializes mutation. Held for every write operation and for
    /// starting, committing and aborting transactions.
    pub(crate) fn writer_guard(&self) -> MutexGuard<'_, ()> {
        self.writer_lock.lock()
    }

    pub fn is_memory_page(&self, id: PageId) -> bool {
        id < self.config.max_memory_pages
    }

    /// The latest version of a memory-resident page.
    pub fn get_page(&self, id: PageId) -> Result<RawPage<'_>> {
        if !self.is_memory_page(id) {
            return Err(StorageError::corrupted(id, "file page used as a memory page"));
        }
        self.alloc.page(id)
    }

    pub fn allocate_page(&self) -> Result<(PageId, RawPage<'_>)> {
        let id = self.alloc.allocate()?;
        Ok((id, self.alloc.page(id)?))
    }

    /// The slot `ptr` refers to.
    pub fn slot<'a>(
        &'a self,
        ptr: NodePtr,
        checkpoint: &'a CheckpointRoot,
    ) -> Result<&'a AtomicU32> {
        match ptr {
            NodePtr::Root { table } => {
                if table >= NUM_TABLES {
                    return Err(StorageError::InvalidTable(table));
                }
                Ok(checkpoint.root_slot(table))
            }
            NodePtr::Child { parent, slot } => {
                let page = self.get_page(parent)?;
                if page.page_type() != Some(PageType::Node) {
                    return Err(StorageError::corrupted(parent, "child slot of a non-node page"));
                }
                if slot as usize > NODE_CAPACITY {
                    return Err(StorageError::corrupted(
                        parent,
                        format!("child slot {slot} out of range"),
                    ));
                }
                Ok(page.child_slot(slot as usize))
            }
        }
    }

    /// The version of the page behind `ptr` visible at `version`.
    ///
    /// Returns `None` when a root chain ends before reaching `version`, which
    /// means the table was empty then.
    pub fn get_page_at<'a>(
        &'a self,
        ptr: NodePtr,
        checkpoint: &'a CheckpointRoot,
        version: Version,
    ) -> Result<Option<(PageId, RawPage<'a>)>> {
        let slot = self.slot(ptr, checkpoint)?;
        let mut id = slot.load(Ordering::Acquire);
        if id == NULL_PAGE {
            return match ptr {
                NodePtr::Root { .. } => Ok(None),
                NodePtr::Child { parent, .. } => {
                    Err(StorageError::corrupted(parent, "null child slot"))
                }
            };
        }
        if !self.is_memory_page(id) {
            id = self.read_in(slot, id)?;
        }

        let mut page = self.get_page(id)?;
        while page.version() > version {
            let prev = page.prev();
            if prev == NULL_PAGE {
                return match ptr {
                    NodePtr::Root { .. } => Ok(None),
                    NodePtr::Child { .. } => Err(StorageError::corrupted(
                        id,
                        format!("no version at or below {version}"),
                    )),
                };
            }
            let older = self.get_page(prev)?;
            if older.version() > page.version() {
                return Err(StorageError::corrupted(prev, "version chain is increasing"));
            }
            id = prev;
            page = older;
        }
        Ok(Some((id, page)))
    }

    /// Loads file page `file_id` into memory and swings `slot` to it.
    fn read_in(&self, slot: &AtomicU32, file_id: PageId) -> Result<PageId> {
        let _load = self.page_loads.lock(file_id);
        let current = slot.load(Ordering::Acquire);
        if current != file_id {
            return Ok(current);
        }
        if let Some(&id) = self.locations.lock().loaded.get(&file_id) {
            let _ = slot.compare_exchange(file_id, id, Ordering::AcqRel, Ordering::Acquire);
            return Ok(id);
        }

        let mut image = BytesMut::zeroed(PAGE_SIZE);
        self.file.read_page(file_id, &mut image)?;
        if self.config.verify_checksums && !page::verify_image(&image) {
            error!("checksum mismatch reading file page {}", file_id);
            return Err(StorageError::ChecksumMismatch(file_id));
        }

        let (id, page) = self.allocate_page()?;
        // SAFETY: the page was just allocated and is not reachable yet.
        unsafe { page.load_image(&image) };
        if let Err(reason) = validate_page(page) {
            self.alloc.deallocate(id)?;
            return Err(StorageError::corrupted(file_id, reason));
        }
        {
            let mut locations = self.locations.lock();
            locations.loaded.insert(file_id, id);
            locations.persisted.insert(id, (file_id, None));
        }
        let _ = slot.compare_exchange(file_id, id, Ordering::AcqRel, Ordering::Acquire);
        debug!("read file page {} into memory page {}", file_id, id);
        Ok(id)
    }

    /// Marks `page`, modified at `version`, dirty for the generation that
    /// will persist it.
    pub fn touch_page(&self, page: RawPage<'_>, version: Version) {
        let flag = {
            let versions = self.versions.lock();
            if version > versions.flush_version {
                versions.dirty_flag
            } else {
                versions.dirty_flag.other()
            }
        };
        page.set_dirty(flag, true);
    }

    pub(crate) fn start_transaction(&self) -> Result<TxnStart> {
        let (start, job) = {
            let mut versions = self.versions.lock();
            let job = if versions.flush_pending {
                versions.flush_boundary()
            } else {
                None
            };
            let next = versions.head.version() + 1;
            let checkpoint = Arc::new(versions.head.with_version(next));
            versions.active.insert(next, checkpoint.clone());
            let prev_head = std::mem::replace(&mut versions.head, checkpoint.clone());
            let start = TxnStart {
                checkpoint,
                prev_head,
                clone_version: versions.flush_version,
            };
            (start, job)
        };
        if let Some(job) = job {
            self.run_flush(job);
        }
        if self.config.gc_on_start_transaction {
            self.collect_garbage()?;
        }
        debug!(
            "started transaction {} (clone version {})",
            start.checkpoint.version(),
            start.clone_version
        );
        Ok(start)
    }

    pub fn is_head(&self, checkpoint: &Arc<CheckpointRoot>) -> bool {
        Arc::ptr_eq(&self.versions.lock().head, checkpoint)
    }

    pub fn head_version(&self) -> Version {
        self.versions.lock().head.version()
    }

    pub(crate) fn commit_transaction(
        &self,
        checkpoint: &Arc<CheckpointRoot>,
        obsolete: &[PageId],
    ) -> Result<()> {
        if !self.is_head(checkpoint) {
            return Err(StorageError::NotHead);
        }
        let job = {
            let mut versions = self.versions.lock();
            versions.last_commit = checkpoint.clone();
            let ready = versions
                .flush_target
                .as_ref()
                .is_some_and(|target| target.checkpoint.version() <= checkpoint.version());
            let job = if ready { versions.flush_target.take() } else { None };
            versions.prune();
            job
        };
        debug!(
            "committed version {} ({} obsolete pages)",
            checkpoint.version(),
            obsolete.len()
        );
        self.queue_or_leak(obsolete, checkpoint.version(), "committed");
        if let Some(job) = job {
            self.run_flush(job);
        }
        Ok(())
    }

    /// Moves the head back to `prev_head`. Only fails if `checkpoint` is not
    /// the head; once the head is reverted the abort always completes.
    ///
    /// `exposed` says whether any new page was ever stored in a slot readers
    /// follow. If not, no reader can hold one and they are freed at once.
    pub(crate) fn abort_transaction(
        &self,
        checkpoint: &Arc<CheckpointRoot>,
        prev_head: Arc<CheckpointRoot>,
        new_pages: &[PageId],
        exposed: bool,
    ) -> Result<()> {
        {
            let mut versions = self.versions.lock();
            if !Arc::ptr_eq(&versions.head, checkpoint) {
                return Err(StorageError::NotHead);
            }
            versions.head = prev_head;
            versions.active.remove(&checkpoint.version());
            let abandoned = versions
                .flush_target
                .as_ref()
                .is_some_and(|target| Arc::ptr_eq(&target.checkpoint, checkpoint));
            if abandoned {
                // its version will be handed out again
                versions.flush_target = None;
                versions.flush_version = checkpoint.version() - 1;
                versions.flush_pending = true;
            }
        }
        debug!(
            "aborted version {} ({} new pages released)",
            checkpoint.version(),
            new_pages.len()
        );
        if exposed {
            self.queue_or_leak(new_pages, checkpoint.version(), "aborted");
            return Ok(());
        }
        for &id in new_pages {
            if let Err(e) = self.release_page(id) {
                warn!("leaking page {} of aborted version {}: {}", id, checkpoint.version(), e);
            }
        }
        Ok(())
    }

    /// A transaction that lost the head was dropped; its changes live on in
    /// later checkpoints.
    pub(crate) fn fold_transaction(&self, checkpoint: &CheckpointRoot, obsolete: &[PageId]) {
        self.queue_or_leak(obsolete, checkpoint.version(), "folded");
    }

    /// Hands `pages` to the collector. Unreachable pages that cannot be
    /// queued stay allocated for the life of the process.
    fn queue_or_leak(&self, pages: &[PageId], version: Version, what: &str) {
        if let Err(e) = self.gc.queue(&self.alloc, pages, version) {
            warn!(
                "leaking {} pages of {} version {}: {}",
                pages.len(),
                what,
                version,
                e
            );
        }
    }

    pub fn latest(&self) -> Arc<CheckpointRoot> {
        self.versions.lock().last_commit.clone()
    }

    /// A read handle on committed version `version`.
    pub fn checkpoint_at(&self, version: Version) -> Result<Arc<CheckpointRoot>> {
        let mut versions = self.versions.lock();
        let latest = versions.last_commit.version();
        let oldest = versions.oldest_live();
        if version > latest || version < oldest {
            return Err(StorageError::VersionUnavailable {
                requested: version,
                oldest,
                latest,
            });
        }
        if let Some(checkpoint) = versions.active.get(&version) {
            return Ok(checkpoint.clone());
        }
        // roots at any version since the oldest live one are reachable
        // through the prev chains of the latest roots
        let checkpoint = Arc::new(versions.last_commit.with_version(version));
        versions.active.insert(version, checkpoint.clone());
        Ok(checkpoint)
    }

    pub fn oldest_live_version(&self) -> Version {
        self.versions.lock().oldest_live()
    }

    pub fn live_checkpoints(&self) -> usize {
        let mut versions = self.versions.lock();
        versions.prune();
        versions.active.len()
    }

    /// Frees the closed GC generation if no live reader can see it.
    pub fn collect_garbage(&self) -> Result<usize> {
        let oldest = self.oldest_live_version();
        self.gc
            .process(&self.alloc, oldest, |id| self.release_page(id))
    }

    fn release_page(&self, id: PageId) -> Result<()> {
        {
            let mut locations = self.locations.lock();
            if let Some((file_id, _)) = locations.persisted.remove(&id) {
                if locations.loaded.get(&file_id) == Some(&id) {
                    locations.loaded.remove(&file_id);
                }
            }
        }
        self.alloc.deallocate(id)
    }

    /// Requests that the committed state be written back. Deferred until the
    /// head commits if a transaction is running.
    pub fn async_flush(&self) {
        let job = {
            let mut versions = self.versions.lock();
            if versions.head_is_committed() {
                versions.flush_boundary()
            } else {
                versions.flush_pending = true;
                None
            }
        };
        if let Some(job) = job {
            self.run_flush(job);
        }
    }

    /// Flushes the last committed version and waits until it is durable.
    pub fn sync(&self) -> Result<Version> {
        let (target, job) = {
            let mut versions = self.versions.lock();
            let target = versions.last_commit.version();
            if self.durable.version() >= target {
                return Ok(target);
            }
            if versions.head_is_committed() {
                let job = match versions.flush_boundary() {
                    Some(job) => Some(job),
                    // the boundary for this version exists but its flush failed
                    None if self.durable.failed_at(target) => {
                        self.durable.clear_failure();
                        versions.retry_flush()
                    }
                    None => None,
                };
                (target, job)
            } else if versions.flush_target.is_none() && versions.flush_version >= target {
                (target, None)
            } else {
                return Err(StorageError::TransactionActive(versions.head.version()));
            }
        };
        if let Some(job) = job {
            self.run_flush(job);
        }
        self.durable.wait_for(target)?;
        Ok(target)
    }

    pub fn durable_version(&self) -> Version {
        self.durable.version()
    }

    fn run_flush(&self, job: FlushJob) {
        let version = job.checkpoint.version();
        if let Err(e) = self.flush_checkpoint(&job) {
            self.durable
                .fail(version, format!("flush of version {version} failed: {e}"));
        }
    }

    fn flush_checkpoint(&self, job: &FlushJob) -> Result<()> {
        let _serial = self.flush_lock.lock();
        let checkpoint = &job.checkpoint;
        let ticket = Arc::new(FlushTicket::new(checkpoint.version()));
        let mut roots = [NULL_PAGE; NUM_TABLES];
        for (table, root) in roots.iter_mut().enumerate() {
            match self.write_tree(NodePtr::Root { table }, checkpoint, job, &ticket) {
                Ok(id) => *root = id,
                Err(e) => {
                    // images already queued must not be reused by later flushes
                    ticket.abandon();
                    return Err(e);
                }
            }
        }
        let header = FlushHeader {
            roots,
            next_file_page: self.next_file_page.load(Ordering::Acquire),
        };
        debug!(
            "flush of version {} queued ({} requests pending)",
            checkpoint.version(),
            self.writer.queued()
        );
        self.writer.submit_header(header, ticket);
        Ok(())
    }

    /// Queues images for every page of the tree behind `ptr` that is not
    /// already on disk, and returns the file id of its root.
    fn write_tree(
        &self,
        ptr: NodePtr,
        checkpoint: &CheckpointRoot,
        job: &FlushJob,
        ticket: &Arc<FlushTicket>,
    ) -> Result<PageId> {
        let id = self.slot(ptr, checkpoint)?.load(Ordering::Acquire);
        if id != NULL_PAGE && !self.is_memory_page(id) {
            return Ok(id);
        }
        let Some((id, page)) = self.get_page_at(ptr, checkpoint, checkpoint.version())? else {
            return Ok(NULL_PAGE);
        };
        if !page.is_dirty(job.flag) {
            if let Some(file_id) = self.reusable_location(id, ticket) {
                return Ok(file_id);
            }
        }

        let mut image = BytesMut::zeroed(PAGE_SIZE);
        // SAFETY: pages at or below a flush boundary are no longer mutated;
        // child slots are read atomically.
        unsafe { page.write_image(&mut image) };
        match page.page_type() {
            Some(PageType::Node) => {
                // SAFETY: as above.
                let count = unsafe { page.node() }.len();
                for index in 0..=count {
                    let child = NodePtr::Child {
                        parent: id,
                        slot: index as u16,
                    };
                    let file_id = self.write_tree(child, checkpoint, job, ticket)?;
                    page::set_image_child(&mut image, index, file_id);
                }
            }
            Some(PageType::Leaf) => {}
            other => {
                return Err(StorageError::corrupted(
                    id,
                    format!("unexpected {other:?} page in a tree"),
                ))
            }
        }

        let dest = self.allocate_file_page()?;
        page::seal_image(&mut image);
        self.writer.submit_page(dest, image.freeze(), ticket);
        page.set_dirty(job.flag, false);
        self.locations
            .lock()
            .persisted
            .insert(id, (dest, Some(ticket.clone())));
        Ok(dest)
    }

    /// The file page already holding `id`, unless the flush that wrote it
    /// failed. A location whose flush is still in flight makes `ticket`
    /// depend on that flush.
    fn reusable_location(&self, id: PageId, ticket: &FlushTicket) -> Option<PageId> {
        let locations = self.locations.lock();
        let (file_id, flush) = locations.persisted.get(&id)?;
        match flush {
            Some(flush) if flush.has_failed() => None,
            Some(flush) => {
                ticket.depend_on(flush);
                Some(*file_id)
            }
            None => Some(*file_id),
        }
    }

    fn allocate_file_page(&self) -> Result<PageId> {
        self.next_file_page
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |next| {
                (next < NULL_PAGE - 1).then_some(next + 1)
            })
            .map_err(|_| StorageError::FilePagesExhausted)
    }

    pub fn allocated_pages(&self) -> u32 {
        self.alloc.allocated()
    }

    pub fn available_pages(&self) -> u32 {
        self.alloc.available()
    }

    pub fn gc_pending(&self) -> usize {
        self.gc.pending()
    }

    pub fn file_pages(&self) -> u32 {
        self.next_file_page.load(Ordering::Acquire) - self.config.max_memory_pages
    }

    pub fn last_commit_version(&self) -> Version {
        self.versions.lock().last_commit.version()
    }

    #[cfg(test)]
    pub(crate) fn page_file(&self) -> &PageFile {
        &self.file
    }
}

fn validate_page(page: RawPage<'_>) -> std::result::Result<(), &'static str> {
    // SAFETY: callers only validate pages they own exclusively.
    match page.page_type() {
        Some(PageType::Leaf) => unsafe { page.leaf() }.validate(),
        Some(PageType::Node) => unsafe { page.node() }.validate(),
        _ => Err("unexpected page type"),
    }
}
