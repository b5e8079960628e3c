//! Checkpoints and the registry of versions that may still be read.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::page::{DirtyFlag, PageId, Version, NULL_PAGE};
use crate::NUM_TABLES;

/// The roots of every table at one version.
///
/// Root slots are atomic: the head transaction rewrites them while it runs,
/// and readers swap file ids for memory ids when they load a root from disk.
#[derive(Debug)]
pub struct CheckpointRoot {
    version: Version,
    roots: [AtomicU32; NUM_TABLES],
}

impl CheckpointRoot {
    pub fn new(version: Version, roots: [PageId; NUM_TABLES]) -> Self {
        Self {
            version,
            roots: roots.map(AtomicU32::new),
        }
    }

    pub fn empty(version: Version) -> Self {
        Self::new(version, [NULL_PAGE; NUM_TABLES])
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn root(&self, table: usize) -> PageId {
        self.roots[table].load(Ordering::Acquire)
    }

    pub fn root_slot(&self, table: usize) -> &AtomicU32 {
        &self.roots[table]
    }

    pub fn roots(&self) -> [PageId; NUM_TABLES] {
        std::array::from_fn(|table| self.root(table))
    }

    /// A checkpoint with the same roots at another version.
    pub fn with_version(&self, version: Version) -> Self {
        Self::new(version, self.roots())
    }
}

/// A flush that has been decided but not started yet.
pub(crate) struct FlushJob {
    pub checkpoint: Arc<CheckpointRoot>,
    pub flag: DirtyFlag,
}

/// Version bookkeeping of the page manager, guarded by one mutex.
pub(crate) struct Versions {
    pub head: Arc<CheckpointRoot>,
    pub last_commit: Arc<CheckpointRoot>,
    /// Every checkpoint that may still be referenced, by version. An entry
    /// whose only reference is this map is dead.
    pub active: BTreeMap<Version, Arc<CheckpointRoot>>,
    /// Generation new modifications are marked with.
    pub dirty_flag: DirtyFlag,
    /// Version of the latest flush boundary.
    pub flush_version: Version,
    /// A flush was requested while the head was uncommitted.
    pub flush_pending: bool,
    /// Flush boundary waiting for its version to commit.
    pub flush_target: Option<FlushJob>,
}

impl Versions {
    pub fn new(root: Arc<CheckpointRoot>) -> Self {
        let version = root.version();
        let mut active = BTreeMap::new();
        active.insert(version, root.clone());
        Self {
            head: root.clone(),
            last_commit: root,
            active,
            dirty_flag: DirtyFlag::Dirty0,
            flush_version: version,
            flush_pending: false,
            flush_target: None,
        }
    }

    pub fn head_is_committed(&self) -> bool {
        Arc::ptr_eq(&self.head, &self.last_commit)
    }

    /// Places a flush boundary at the head version. Returns the flush to run
    /// now if the head is committed; otherwise the flush waits for the head
    /// to commit.
    pub fn flush_boundary(&mut self) -> Option<FlushJob> {
        if self.flush_target.is_some() {
            // the earlier boundary has not been flushed yet
            self.flush_pending = true;
            return None;
        }
        self.flush_pending = false;
        if self.head.version() == self.flush_version {
            return None;
        }
        self.flush_version = self.head.version();
        let job = FlushJob {
            checkpoint: self.head.clone(),
            flag: self.dirty_flag,
        };
        self.dirty_flag = self.dirty_flag.other();
        if self.head_is_committed() {
            Some(job)
        } else {
            self.flush_target = Some(job);
            None
        }
    }

    /// Runs the flush of the current boundary again after it failed. Pages
    /// it already cleared are rewritten because their recorded file
    /// location belongs to the failed flush.
    pub fn retry_flush(&self) -> Option<FlushJob> {
        if !self.head_is_committed()
            || self.flush_target.is_some()
            || self.head.version() != self.flush_version
        {
            return None;
        }
        Some(FlushJob {
            checkpoint: self.head.clone(),
            flag: self.dirty_flag.other(),
        })
    }

    /// Drops registry entries nobody holds.
    pub fn prune(&mut self) {
        self.active.retain(|_, checkpoint| Arc::strong_count(checkpoint) > 1);
    }

    /// Lowest version any live handle can observe.
    pub fn oldest_live(&mut self) -> Version {
        self.prune();
        self.active
            .keys()
            .next()
            .copied()
            .unwrap_or_else(|| self.last_commit.version())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkpoint_roots() {
        let mut roots = [NULL_PAGE; NUM_TABLES];
        roots[2] = 17;
        let checkpoint = CheckpointRoot::new(4, roots);
        assert_eq!(checkpoint.root(2), 17);
        assert_eq!(checkpoint.root(0), NULL_PAGE);

        checkpoint.root_slot(0).store(9, Ordering::Release);
        let next = checkpoint.with_version(5);
        assert_eq!(next.version(), 5);
        assert_eq!(next.root(0), 9);
        assert_eq!(next.root(2), 17);
    }

    #[test]
    fn test_oldest_live_follows_handles() {
        let root = Arc::new(CheckpointRoot::empty(1));
        let mut versions = Versions::new(root);

        let reader = Arc::new(CheckpointRoot::empty(2));
        versions.active.insert(2, reader.clone());
        let committed = Arc::new(CheckpointRoot::empty(3));
        versions.active.insert(3, committed.clone());
        versions.last_commit = committed.clone();
        versions.head = committed;

        // version 1 is only referenced by the registry now
        assert_eq!(versions.oldest_live(), 2);
        drop(reader);
        assert_eq!(versions.oldest_live(), 3);
        assert_eq!(versions.active.len(), 1);
    }

    #[test]
    fn test_flush_boundary_waits_for_commit() {
        let root = Arc::new(CheckpointRoot::empty(1));
        let mut versions = Versions::new(root);
        let head = Arc::new(CheckpointRoot::empty(2));
        versions.head = head.clone();

        assert!(versions.flush_boundary().is_none());
        assert_eq!(versions.flush_version, 2);
        assert_eq!(versions.dirty_flag, DirtyFlag::Dirty1);
        let target = versions.flush_target.as_ref().unwrap();
        assert_eq!(target.flag, DirtyFlag::Dirty0);

        // a second request while the first is outstanding is remembered
        assert!(versions.flush_boundary().is_none());
        assert!(versions.flush_pending);
        assert_eq!(versions.dirty_flag, DirtyFlag::Dirty1);
    }

    #[test]
    fn test_retry_reuses_boundary_flag() {
        let root = Arc::new(CheckpointRoot::empty(1));
        let mut versions = Versions::new(root);
        let committed = Arc::new(CheckpointRoot::empty(2));
        versions.head = committed.clone();
        versions.last_commit = committed;
        assert!(versions.retry_flush().is_none());
        let job = versions.flush_boundary().unwrap();
        let retry = versions.retry_flush().unwrap();
        assert_eq!(retry.flag, job.flag);
        assert_eq!(retry.checkpoint.version(), 2);

        // an uncommitted head has nothing to retry
        versions.head = Arc::new(CheckpointRoot::empty(3));
        assert!(versions.retry_flush().is_none());
    }

    #[test]
    fn test_flush_boundary_on_committed_head() {
        let root = Arc::new(CheckpointRoot::empty(1));
        let mut versions = Versions::new(root);
        // nothing new since the last boundary
        assert!(versions.flush_boundary().is_none());

        let committed = Arc::new(CheckpointRoot::empty(2));
        versions.head = committed.clone();
        versions.last_commit = committed;
        let job = versions.flush_boundary().unwrap();
        assert_eq!(job.checkpoint.version(), 2);
        assert_eq!(job.flag, DirtyFlag::Dirty0);
        assert!(versions.flush_boundary().is_none());
    }
}
