#![allow(dead_code)]

use std::path::Path;
use std::sync::Once;

use stratadb::{Database, EngineConfig};

static INIT: Once = Once::new();

pub fn init_logging() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub fn test_config(memory_pages: u32) -> EngineConfig {
    EngineConfig::default()
        .with_memory_pages(memory_pages)
        .with_fsync(false)
}

pub fn open_db(dir: &Path, memory_pages: u32) -> anyhow::Result<Database> {
    Ok(Database::open_with_config(dir, test_config(memory_pages))?)
}

/// Fixed-width decimal key, so byte order matches numeric order.
pub fn key(i: u32) -> Vec<u8> {
    format!("{i:010}").into_bytes()
}

pub fn value(i: u32, tag: &str) -> Vec<u8> {
    format!("{tag}-{i}").into_bytes()
}

/// Every record visible through `cursor`, in order.
pub fn collect(mut cursor: stratadb::Cursor<'_>) -> anyhow::Result<Vec<(Vec<u8>, Vec<u8>)>> {
    let mut records = Vec::new();
    let mut valid = cursor.first()?;
    while valid {
        let key = cursor.key().map(<[u8]>::to_vec).unwrap_or_default();
        let value = cursor.value().map(<[u8]>::to_vec).unwrap_or_default();
        records.push((key, value));
        valid = cursor.next()?;
    }
    Ok(records)
}
