use std::sync::Arc;

use crate::cursor::Cursor;
use crate::manager::{CheckpointRoot, PageManager};
use crate::page::Version;
use crate::Result;

use super::{check_table, lookup};

/// Read-only view of one committed version.
///
/// Holding a snapshot keeps every page visible at its version alive; the
/// collector will not free them until the snapshot is dropped.
pub struct Snapshot {
    pm: Arc<PageManager>,
    checkpoint: Arc<CheckpointRoot>,
}

impl Snapshot {
    pub(crate) fn new(pm: Arc<PageManager>, checkpoint: Arc<CheckpointRoot>) -> Self {
        Self { pm, checkpoint }
    }

    pub fn version(&self) -> Version {
        self.checkpoint.version()
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.get_in(0, key)
    }

    pub fn get_in(&self, table: usize, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut cursor = self.cursor_in(table)?;
        lookup(&mut cursor, key)
    }

    pub fn cursor(&self) -> Result<Cursor<'_>> {
        self.cursor_in(0)
    }

    pub fn cursor_in(&self, table: usize) -> Result<Cursor<'_>> {
        check_table(table)?;
        Ok(Cursor::new(
            &self.pm,
            &self.checkpoint,
            table,
            self.checkpoint.version(),
        ))
    }
}

impl std::fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Snapshot")
            .field("version", &self.version())
            .finish()
    }
}
