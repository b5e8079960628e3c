//! Background write-back.
//!
//! A flush produces one `Page` request per page image and a final `Header`
//! request. The worker writes images in queue order; when it reaches the
//! header it checks that every page of that flush made it to the file, syncs,
//! and writes the durable header. A flush with a failed page never gets a
//! header, so the previous durable state stays intact.
//!
//! A flush may reuse file pages queued by an earlier flush that is still in
//! flight. Its header then also waits on that flush having succeeded.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use bytes::Bytes;
use log::{debug, error, info};
use parking_lot::{Condvar, Mutex};

use crate::file::PageFile;
use crate::page::{PageId, Version};
use crate::sync::WorkQueue;
use crate::{Result, StorageError, NUM_TABLES};

/// Completion state shared by all requests of one flush.
#[derive(Debug)]
pub(crate) struct FlushTicket {
    pub version: Version,
    pending: AtomicUsize,
    failed: AtomicBool,
    finished: AtomicBool,
    /// Earlier flushes whose pages this one references.
    depends: Mutex<Vec<Arc<FlushTicket>>>,
}

impl FlushTicket {
    pub fn new(version: Version) -> Self {
        Self {
            version,
            pending: AtomicUsize::new(0),
            failed: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            depends: Mutex::new(Vec::new()),
        }
    }

    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    fn succeeded(&self) -> bool {
        self.finished.load(Ordering::Acquire) && !self.has_failed()
    }

    /// Marks the flush as failed; none of its pages may be referenced.
    pub fn abandon(&self) {
        self.failed.store(true, Ordering::Release);
        self.finished.store(true, Ordering::Release);
        self.depends.lock().clear();
    }

    fn finish(&self) {
        self.finished.store(true, Ordering::Release);
        self.depends.lock().clear();
    }

    /// Records that this flush reuses a page written by `other`.
    pub fn depend_on(&self, other: &Arc<FlushTicket>) {
        if std::ptr::eq(self, Arc::as_ptr(other)) || other.succeeded() {
            return;
        }
        let mut depends = self.depends.lock();
        if !depends.iter().any(|dep| Arc::ptr_eq(dep, other)) {
            depends.push(other.clone());
        }
    }

    fn add_page(&self) {
        self.pending.fetch_add(1, Ordering::AcqRel);
    }

    fn page_done(&self, ok: bool) {
        if !ok {
            self.failed.store(true, Ordering::Release);
        }
        self.pending.fetch_sub(1, Ordering::AcqRel);
    }

    /// Every page of this flush and of the flushes it depends on is on disk.
    fn is_complete(&self) -> bool {
        self.pending.load(Ordering::Acquire) == 0
            && !self.has_failed()
            && self.depends.lock().iter().all(|dep| dep.succeeded())
    }
}

/// Header contents of a finished flush.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FlushHeader {
    pub roots: [PageId; NUM_TABLES],
    pub next_file_page: PageId,
}

pub(crate) enum WriteRequest {
    Page {
        dest: PageId,
        image: Bytes,
        ticket: Arc<FlushTicket>,
    },
    Header {
        header: FlushHeader,
        ticket: Arc<FlushTicket>,
    },
    Shutdown,
}

#[derive(Debug, Default)]
struct DurableState {
    version: Version,
    /// The newest failed flush not yet superseded by a durable version.
    failed: Option<(Version, String)>,
}

/// Durable version tracking; `sync` callers wait here.
#[derive(Debug, Default)]
pub(crate) struct Durability {
    state: Mutex<DurableState>,
    changed: Condvar,
}

impl Durability {
    pub fn new(version: Version) -> Self {
        Self {
            state: Mutex::new(DurableState {
                version,
                failed: None,
            }),
            changed: Condvar::new(),
        }
    }

    pub fn version(&self) -> Version {
        self.state.lock().version
    }

    fn advance(&self, version: Version) {
        let mut state = self.state.lock();
        if version > state.version {
            state.version = version;
        }
        if state.failed.as_ref().is_some_and(|(failed, _)| *failed <= version) {
            state.failed = None;
        }
        self.changed.notify_all();
    }

    pub fn fail(&self, version: Version, message: String) {
        error!("flush failed: {}", message);
        let mut state = self.state.lock();
        if state.failed.as_ref().map_or(true, |(failed, _)| *failed <= version) {
            state.failed = Some((version, message));
        }
        self.changed.notify_all();
    }

    /// Whether the newest flush covering `version` failed.
    pub fn failed_at(&self, version: Version) -> bool {
        let state = self.state.lock();
        state.version < version
            && state
                .failed
                .as_ref()
                .is_some_and(|(failed, _)| *failed >= version)
    }

    pub fn clear_failure(&self) {
        self.state.lock().failed = None;
    }

    /// Blocks until `version` is durable or a flush covering it fails.
    pub fn wait_for(&self, version: Version) -> Result<()> {
        let mut state = self.state.lock();
        loop {
            if state.version >= version {
                return Ok(());
            }
            if let Some((failed, message)) = &state.failed {
                if *failed >= version {
                    return Err(StorageError::FlushFailed(message.clone()));
                }
            }
            self.changed.wait(&mut state);
        }
    }
}

pub(crate) struct WriteBack {
    queue: Arc<WorkQueue<WriteRequest>>,
    handle: Option<JoinHandle<()>>,
}

impl WriteBack {
    pub fn start(file: Arc<PageFile>, durable: Arc<Durability>) -> Result<Self> {
        let queue = Arc::new(WorkQueue::new());
        let worker_queue = queue.clone();
        let handle = thread::Builder::new()
            .name("stratadb-writer".to_string())
            .spawn(move || write_worker(&worker_queue, &file, &durable))?;
        Ok(Self {
            queue,
            handle: Some(handle),
        })
    }

    pub fn submit_page(&self, dest: PageId, image: Bytes, ticket: &Arc<FlushTicket>) {
        ticket.add_page();
        self.queue.push(WriteRequest::Page {
            dest,
            image,
            ticket: ticket.clone(),
        });
    }

    pub fn submit_header(&self, header: FlushHeader, ticket: Arc<FlushTicket>) {
        self.queue.push(WriteRequest::Header { header, ticket });
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }
}

impl Drop for WriteBack {
    fn drop(&mut self) {
        self.queue.push(WriteRequest::Shutdown);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("write-back worker panicked");
            }
        }
    }
}

fn write_worker(queue: &WorkQueue<WriteRequest>, file: &PageFile, durable: &Durability) {
    debug!("write-back worker started");
    loop {
        match queue.pop() {
            WriteRequest::Page {
                dest,
                image,
                ticket,
            } => {
                let result = file.write_page(dest, &image);
                if let Err(e) = &result {
                    error!(
                        "writing page {} for version {} failed: {}",
                        dest, ticket.version, e
                    );
                }
                ticket.page_done(result.is_ok());
            }
            WriteRequest::Header { header, ticket } => {
                if !ticket.is_complete() {
                    ticket.abandon();
                    durable.fail(
                        ticket.version,
                        format!(
                            "pages of version {} were not written, header skipped",
                            ticket.version
                        ),
                    );
                    continue;
                }
                if ticket.version <= durable.version() {
                    ticket.finish();
                    continue;
                }
                let result = file.sync().and_then(|_| {
                    file.commit_header(ticket.version, header.roots, header.next_file_page)
                });
                match result {
                    Ok(sequence) => {
                        info!(
                            "version {} is durable (header sequence {})",
                            ticket.version, sequence
                        );
                        ticket.finish();
                        durable.advance(ticket.version);
                    }
                    Err(e) => {
                        ticket.abandon();
                        durable.fail(
                            ticket.version,
                            format!("header for version {} not written: {}", ticket.version, e),
                        );
                    }
                }
            }
            WriteRequest::Shutdown => break,
        }
    }
    debug!("write-back worker stopped");
}
