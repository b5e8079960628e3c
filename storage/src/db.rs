//! Public entry point.

use std::path::Path;
use std::sync::Arc;

use log::info;

use crate::config::EngineConfig;
use crate::manager::PageManager;
use crate::page::Version;
use crate::txn::{Snapshot, Transaction};
use crate::Result;

/// Point-in-time engine counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Stats {
    pub allocated_pages: u32,
    pub free_pages: u32,
    pub pending_gc_pages: usize,
    pub file_pages: u32,
    pub live_checkpoints: usize,
    pub last_commit_version: Version,
    pub durable_version: Version,
}

/// An open database directory.
pub struct Database {
    pm: Arc<PageManager>,
}

impl Database {
    /// Opens (or creates) the database in `dir` with an arena of
    /// `page_budget` memory pages.
    pub fn open(dir: impl AsRef<Path>, page_budget: u32) -> Result<Self> {
        let config = EngineConfig::default().with_memory_pages(page_budget);
        Self::open_with_config(dir, config)
    }

    pub fn open_with_config(dir: impl AsRef<Path>, config: EngineConfig) -> Result<Self> {
        let pm = PageManager::open(dir.as_ref(), config)?;
        Ok(Self { pm: Arc::new(pm) })
    }

    pub fn config(&self) -> &EngineConfig {
        self.pm.config()
    }

    /// Starts a transaction on top of the current head. Any transaction
    /// still holding the head loses it.
    pub fn start_transaction(&self) -> Result<Transaction> {
        let _guard = self.pm.writer_guard();
        let start = self.pm.start_transaction()?;
        Ok(Transaction::new(self.pm.clone(), start))
    }

    /// A snapshot of committed version `version`.
    pub fn checkpoint_at(&self, version: Version) -> Result<Snapshot> {
        let checkpoint = self.pm.checkpoint_at(version)?;
        Ok(Snapshot::new(self.pm.clone(), checkpoint))
    }

    /// A snapshot of the latest committed version.
    pub fn latest(&self) -> Snapshot {
        Snapshot::new(self.pm.clone(), self.pm.latest())
    }

    /// Starts writing back the committed state without waiting for it.
    pub fn async_flush(&self) {
        self.pm.async_flush()
    }

    /// Writes back the latest committed version and waits until it is
    /// durable. Returns that version.
    pub fn sync(&self) -> Result<Version> {
        let version = self.pm.sync()?;
        info!("synced version {}", version);
        Ok(version)
    }

    pub fn durable_version(&self) -> Version {
        self.pm.durable_version()
    }

    /// Runs one collection pass. Returns the number of pages freed.
    pub fn collect_garbage(&self) -> Result<usize> {
        self.pm.collect_garbage()
    }

    pub fn stats(&self) -> Stats {
        Stats {
            allocated_pages: self.pm.allocated_pages(),
            free_pages: self.pm.available_pages(),
            pending_gc_pages: self.pm.gc_pending(),
            file_pages: self.pm.file_pages(),
            live_checkpoints: self.pm.live_checkpoints(),
            last_commit_version: self.pm.last_commit_version(),
            durable_version: self.pm.durable_version(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::init_logging;
    use crate::StorageError;
    use tempfile::tempdir;

    #[test]
    fn test_open_rejects_bad_config() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            Database::open(dir.path(), 4),
            Err(StorageError::Config(_))
        ));
    }

    #[test]
    fn test_stats_track_commits() {
        init_logging();
        let dir = tempdir().unwrap();
        let db = Database::open_with_config(
            dir.path(),
            EngineConfig::default().with_memory_pages(256).with_fsync(false),
        )
        .unwrap();
        let before = db.stats();
        assert_eq!(before.allocated_pages, 0);
        assert_eq!(before.last_commit_version, 0);

        let mut txn = db.start_transaction().unwrap();
        txn.insert(b"k", b"v").unwrap();
        txn.commit().unwrap();

        let after = db.stats();
        assert_eq!(after.allocated_pages, 1);
        assert_eq!(after.last_commit_version, 1);
        assert_eq!(after.durable_version, 0);
    }

    #[test]
    fn test_sync_with_active_transaction() {
        let dir = tempdir().unwrap();
        let db = Database::open_with_config(
            dir.path(),
            EngineConfig::default().with_memory_pages(256).with_fsync(false),
        )
        .unwrap();
        let mut txn = db.start_transaction().unwrap();
        txn.insert(b"k", b"v").unwrap();
        txn.commit().unwrap();

        let _open = db.start_transaction().unwrap();
        assert!(matches!(db.sync(), Err(StorageError::TransactionActive(2))));
    }

    fn flush_config() -> EngineConfig {
        EngineConfig::default()
            .with_memory_pages(1024)
            .with_fsync(false)
    }

    fn key(i: u32) -> Vec<u8> {
        format!("{i:06}").into_bytes()
    }

    #[test]
    fn test_flush_after_failed_write_rewrites_pages() {
        init_logging();
        let dir = tempdir().unwrap();
        {
            let db = Database::open_with_config(dir.path(), flush_config()).unwrap();
            let mut txn = db.start_transaction().unwrap();
            for i in 0..300 {
                txn.insert(&key(i), b"one").unwrap();
            }
            txn.commit().unwrap();
            assert_eq!(db.sync().unwrap(), 1);

            let mut txn = db.start_transaction().unwrap();
            txn.insert(&key(0), b"two").unwrap();
            txn.commit().unwrap();
            // the first image of the flush is the changed leaf
            db.pm.page_file().fail_page_writes(1);
            assert!(matches!(db.sync(), Err(StorageError::FlushFailed(_))));
            assert_eq!(db.durable_version(), 1);

            // the next flush runs on the other dirty generation and must not
            // point at the leaf that never reached the file
            let mut txn = db.start_transaction().unwrap();
            txn.insert(&key(299), b"three").unwrap();
            txn.commit().unwrap();
            assert_eq!(db.sync().unwrap(), 3);
        }

        let db = Database::open_with_config(dir.path(), flush_config()).unwrap();
        assert_eq!(db.durable_version(), 3);
        let snapshot = db.latest();
        assert_eq!(snapshot.get(&key(0)).unwrap(), Some(b"two".to_vec()));
        assert_eq!(snapshot.get(&key(299)).unwrap(), Some(b"three".to_vec()));
        for i in 1..299 {
            assert_eq!(snapshot.get(&key(i)).unwrap(), Some(b"one".to_vec()), "key {i}");
        }
    }

    #[test]
    fn test_sync_retries_failed_flush() {
        init_logging();
        let dir = tempdir().unwrap();
        {
            let db = Database::open_with_config(dir.path(), flush_config()).unwrap();
            let mut txn = db.start_transaction().unwrap();
            for i in 0..300 {
                txn.insert(&key(i), b"v").unwrap();
            }
            txn.commit().unwrap();

            db.pm.page_file().fail_page_writes(2);
            assert!(matches!(db.sync(), Err(StorageError::FlushFailed(_))));
            assert_eq!(db.durable_version(), 0);
            assert_eq!(db.sync().unwrap(), 1);
            assert_eq!(db.durable_version(), 1);
        }

        let db = Database::open_with_config(dir.path(), flush_config()).unwrap();
        assert_eq!(db.durable_version(), 1);
        let snapshot = db.latest();
        for i in 0..300 {
            assert_eq!(snapshot.get(&key(i)).unwrap(), Some(b"v".to_vec()), "key {i}");
        }
    }
}

