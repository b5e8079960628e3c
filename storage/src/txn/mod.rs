//! Write transactions.
//!
//! A transaction is bound to the head checkpoint. It mutates pages it owns in
//! place, clones everything else, and either commits (publishing its
//! checkpoint) or aborts (putting back every shared slot it swung and handing
//! its pages to the collector). Starting a newer transaction takes the head
//! away; the older one can then neither commit nor write, and dropping it
//! folds its changes into the newer head.

mod snapshot;

pub use snapshot::Snapshot;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use log::{debug, warn};

use crate::cursor::Cursor;
use crate::manager::{CheckpointRoot, NodePtr, PageManager, TxnStart};
use crate::page::{PageId, Version};
use crate::{Result, StorageError, NUM_TABLES};

/// Bookkeeping of the pages a transaction touched.
#[derive(Debug)]
pub(crate) struct TxnState {
    pub version: Version,
    /// Pages at or below this version are part of a pending flush and are
    /// always cloned.
    pub clone_version: Version,
    /// Shared child slots swung in place.
    pub modified: Vec<NodePtr>,
    /// Pages replaced by a clone; released once no reader can see them.
    pub obsolete: Vec<PageId>,
    /// Pages allocated by this transaction; released on abort.
    pub new_pages: Vec<PageId>,
}

impl TxnState {
    fn new(version: Version, clone_version: Version) -> Self {
        Self {
            version,
            clone_version,
            modified: Vec::new(),
            obsolete: Vec::new(),
            new_pages: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnStatus {
    Active,
    Committed,
    Aborted,
    /// Dropped after losing the head; its changes belong to the newer head.
    Folded,
}

pub struct Transaction {
    pm: Arc<PageManager>,
    /// Released once the transaction finishes so it stops pinning its
    /// version.
    checkpoint: Option<Arc<CheckpointRoot>>,
    prev_head: Option<Arc<CheckpointRoot>>,
    state: TxnState,
    status: TxnStatus,
}

pub(crate) fn check_table(table: usize) -> Result<()> {
    if table >= NUM_TABLES {
        return Err(StorageError::InvalidTable(table));
    }
    Ok(())
}

impl Transaction {
    pub(crate) fn new(pm: Arc<PageManager>, start: TxnStart) -> Self {
        let state = TxnState::new(start.checkpoint.version(), start.clone_version);
        Self {
            pm,
            checkpoint: Some(start.checkpoint),
            prev_head: Some(start.prev_head),
            state,
            status: TxnStatus::Active,
        }
    }

    pub fn version(&self) -> Version {
        self.state.version
    }

    pub fn status(&self) -> TxnStatus {
        self.status
    }

    /// Whether this transaction still owns the head.
    pub fn is_head(&self) -> bool {
        self.active_checkpoint()
            .is_ok_and(|checkpoint| self.pm.is_head(checkpoint))
    }

    fn active_checkpoint(&self) -> Result<&Arc<CheckpointRoot>> {
        match (self.status, &self.checkpoint) {
            (TxnStatus::Active, Some(checkpoint)) => Ok(checkpoint),
            _ => Err(StorageError::TransactionFinished),
        }
    }

    /// Runs `op` on a cursor over `table` while holding the writer lock.
    fn write<R>(
        &mut self,
        table: usize,
        op: impl FnOnce(&mut Cursor<'_>, &mut TxnState) -> Result<R>,
    ) -> Result<R> {
        check_table(table)?;
        let Self {
            pm,
            checkpoint,
            state,
            status,
            ..
        } = self;
        let checkpoint = match (*status, checkpoint.as_ref()) {
            (TxnStatus::Active, Some(checkpoint)) => checkpoint,
            _ => return Err(StorageError::TransactionFinished),
        };
        let _guard = pm.writer_guard();
        if !pm.is_head(checkpoint) {
            return Err(StorageError::NotHead);
        }
        let mut cursor = Cursor::new(pm, checkpoint, table, state.version);
        op(&mut cursor, state)
    }

    pub fn insert(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.insert_in(0, key, value)
    }

    /// Inserts `key` into `table`, replacing any existing value.
    pub fn insert_in(&mut self, table: usize, key: &[u8], value: &[u8]) -> Result<()> {
        self.write(table, |cursor, state| cursor.insert(state, key, value))
    }

    pub fn erase(&mut self, key: &[u8]) -> Result<bool> {
        self.erase_in(0, key)
    }

    /// Removes `key` from `table`. Returns whether it was present.
    pub fn erase_in(&mut self, table: usize, key: &[u8]) -> Result<bool> {
        self.write(table, |cursor, state| cursor.erase(state, key))
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.get_in(0, key)
    }

    /// Reads `key` as this transaction sees it, uncommitted writes included.
    pub fn get_in(&self, table: usize, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut cursor = self.cursor_in(table)?;
        lookup(&mut cursor, key)
    }

    pub fn cursor(&self) -> Result<Cursor<'_>> {
        self.cursor_in(0)
    }

    /// A cursor over `table`. It is not positioned until one of its seek
    /// methods is called.
    pub fn cursor_in(&self, table: usize) -> Result<Cursor<'_>> {
        check_table(table)?;
        let checkpoint = self.active_checkpoint()?;
        Ok(Cursor::new(&self.pm, checkpoint, table, self.state.version))
    }

    /// Publishes this transaction's checkpoint as the latest committed
    /// version.
    pub fn commit(&mut self) -> Result<Version> {
        let checkpoint = self.active_checkpoint()?.clone();
        let pm = self.pm.clone();
        let _guard = pm.writer_guard();
        pm.commit_transaction(&checkpoint, &self.state.obsolete)?;
        self.finish(TxnStatus::Committed);
        Ok(self.state.version)
    }

    /// Discards every change made by this transaction.
    pub fn abort(&mut self) -> Result<()> {
        self.active_checkpoint()?;
        let pm = self.pm.clone();
        let _guard = pm.writer_guard();
        self.abort_locked()
    }

    fn finish(&mut self, status: TxnStatus) {
        self.status = status;
        self.checkpoint = None;
        self.prev_head = None;
    }

    /// Caller holds the writer lock.
    fn abort_locked(&mut self) -> Result<()> {
        let checkpoint = self.active_checkpoint()?.clone();
        if !self.pm.is_head(&checkpoint) {
            return Err(StorageError::NotHead);
        }
        let prev_head = self
            .prev_head
            .clone()
            .ok_or(StorageError::TransactionFinished)?;
        // undo in-place swings that still point at our clone
        for ptr in self.state.modified.iter().rev() {
            let slot = self.pm.slot(*ptr, &checkpoint)?;
            let clone = self.pm.get_page(slot.load(Ordering::Acquire))?;
            if clone.version() == self.state.version {
                slot.store(clone.prev(), Ordering::Release);
            }
        }
        let exposed = !self.state.modified.is_empty();
        self.pm
            .abort_transaction(&checkpoint, prev_head, &self.state.new_pages, exposed)?;
        self.finish(TxnStatus::Aborted);
        Ok(())
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        let Ok(checkpoint) = self.active_checkpoint().cloned() else {
            return;
        };
        let pm = self.pm.clone();
        let _guard = pm.writer_guard();
        if pm.is_head(&checkpoint) {
            if let Err(e) = self.abort_locked() {
                warn!(
                    "aborting dropped transaction {} failed: {}",
                    self.state.version, e
                );
            }
        } else {
            pm.fold_transaction(&checkpoint, &self.state.obsolete);
            self.finish(TxnStatus::Folded);
            debug!("folded transaction {}", self.state.version);
        }
    }
}

/// Point lookup through a fresh cursor.
pub(crate) fn lookup(cursor: &mut Cursor<'_>, key: &[u8]) -> Result<Option<Vec<u8>>> {
    if !cursor.lower_bound(key)? {
        return Ok(None);
    }
    if cursor.key() != Some(key) {
        return Ok(None);
    }
    Ok(cursor.value().map(<[u8]>::to_vec))
}
