//! Storage engine for stratadb
//!
//! A versioned copy-on-write B-tree. Every committed transaction produces a
//! new checkpoint; readers pin a checkpoint and see a stable snapshot while a
//! single writer keeps mutating the head. Superseded pages are reclaimed once
//! no reader can observe them, and committed state is written back to a page
//! file in the background.

pub mod alloc;
pub mod config;
pub mod cursor;
pub mod db;
pub mod file;
pub mod gc;
pub mod manager;
pub mod page;
pub mod sync;
pub mod txn;

pub use config::EngineConfig;
pub use cursor::Cursor;
pub use db::{Database, Stats};
pub use page::{PageId, PageType, Version, NULL_PAGE, PAGE_SIZE};
pub use txn::{Snapshot, Transaction, TxnStatus};

use thiserror::Error;

/// Number of independent trees in every checkpoint.
pub const NUM_TABLES: usize = 8;

pub const MAX_KEY_SIZE: usize = 256;
pub const MAX_VALUE_SIZE: usize = 512;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Out of memory pages ({capacity} allocated)")]
    OutOfPages { capacity: u32 },

    #[error("Page file has no free page ids left")]
    FilePagesExhausted,

    #[error("Key of {0} bytes exceeds the maximum of {MAX_KEY_SIZE}")]
    KeyTooLarge(usize),

    #[error("Value of {0} bytes exceeds the maximum of {MAX_VALUE_SIZE}")]
    ValueTooLarge(usize),

    #[error("Page {page} is corrupted: {reason}")]
    Corrupted { page: PageId, reason: String },

    #[error("Checksum mismatch for page {0}")]
    ChecksumMismatch(PageId),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Flush failed: {0}")]
    FlushFailed(String),

    #[error("Transaction is no longer the head")]
    NotHead,

    #[error("Transaction already finished")]
    TransactionFinished,

    #[error("Version {requested} is not available (oldest {oldest}, latest {latest})")]
    VersionUnavailable {
        requested: Version,
        oldest: Version,
        latest: Version,
    },

    #[error("Invalid table index {0}")]
    InvalidTable(usize),

    #[error("Transaction {0} is still active")]
    TransactionActive(Version),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl StorageError {
    pub(crate) fn corrupted(page: PageId, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        log::error!("page {} is corrupted: {}", page, reason);
        StorageError::Corrupted { page, reason }
    }

    /// Errors after which the engine state can no longer be trusted.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            StorageError::Corrupted { .. } | StorageError::ChecksumMismatch(_) | StorageError::Io(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;
