//! Engine configuration.

use crate::page::PageId;
use crate::{Result, StorageError};

/// Default boundary between memory-resident and file-resident page ids.
pub const DEFAULT_MAX_MEMORY_PAGES: PageId = 0x1000_0000;

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct EngineConfig {
    /// Size of the in-memory page arena, in pages.
    pub memory_pages: u32,
    /// Page ids below this address the arena, ids at or above it the page
    /// file. Fixed for the lifetime of a database file.
    pub max_memory_pages: PageId,
    /// Name of the page file inside the database directory.
    pub file_name: String,
    /// Call fsync around durable header writes.
    pub fsync: bool,
    /// Verify page checksums when reading pages back from disk.
    pub verify_checksums: bool,
    /// Run a non-blocking collection pass whenever a transaction starts.
    pub gc_on_start_transaction: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            memory_pages: 16 * 1024, // 64 MB
            max_memory_pages: DEFAULT_MAX_MEMORY_PAGES,
            file_name: "pages.db".to_string(),
            fsync: true,
            verify_checksums: true,
            gc_on_start_transaction: true,
        }
    }
}

impl EngineConfig {
    pub fn with_memory_pages(mut self, pages: u32) -> Self {
        self.memory_pages = pages;
        self
    }

    pub fn with_max_memory_pages(mut self, max: PageId) -> Self {
        self.max_memory_pages = max;
        self
    }

    pub fn with_file_name(mut self, name: impl Into<String>) -> Self {
        self.file_name = name.into();
        self
    }

    pub fn with_fsync(mut self, fsync: bool) -> Self {
        self.fsync = fsync;
        self
    }

    pub fn with_verify_checksums(mut self, verify: bool) -> Self {
        self.verify_checksums = verify;
        self
    }

    pub fn with_gc_on_start_transaction(mut self, enabled: bool) -> Self {
        self.gc_on_start_transaction = enabled;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.memory_pages < 16 {
            return Err(StorageError::Config(format!(
                "memory_pages must be at least 16, got {}",
                self.memory_pages
            )));
        }
        if self.memory_pages > self.max_memory_pages {
            return Err(StorageError::Config(format!(
                "memory_pages ({}) exceeds max_memory_pages ({})",
                self.memory_pages, self.max_memory_pages
            )));
        }
        if self.max_memory_pages == 0 || self.max_memory_pages >= crate::NULL_PAGE - 1 {
            return Err(StorageError::Config(format!(
                "max_memory_pages {:#x} leaves no room for file pages",
                self.max_memory_pages
            )));
        }
        if self.file_name.is_empty() {
            return Err(StorageError::Config("file_name is empty".to_string()));
        }
        Ok(())
    }
}
