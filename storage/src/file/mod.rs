// storage/src/file/mod.rs

use crate::page::{PageId, Version, NULL_PAGE, PAGE_SIZE};
use crate::{Result, StorageError, NUM_TABLES};
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

/// Magic number to identify our page files
const DB_MAGIC: [u8; 4] = *b"STR1";

const FILE_VERSION: u32 = 1;

const HEADER_SIZE: usize = 512;

/// Page 0 holds two header slots; commits alternate between them so the
/// previous durable header survives a torn write.
const HEADER_SLOTS: u64 = 2;

const CHECKSUM_RANGE: std::ops::Range<usize> = 56..60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    // Core identification (16 bytes)
    pub magic: [u8; 4],
    pub version: u32,
    pub header_size: u32,
    pub page_size: u32,

    // Page id space (8 bytes)
    pub max_memory_pages: PageId,
    pub next_file_page: PageId, // next file page id to hand out

    // Durable state (16 bytes)
    pub sequence: u64,         // bumped on every header write
    pub durable_version: Version,

    // Timestamps (16 bytes)
    pub created_at: u64,
    pub last_modified: u64,

    // Integrity (4 bytes)
    pub header_checksum: u32,

    // Tables (4 + 4 * NUM_TABLES bytes)
    pub roots: [PageId; NUM_TABLES],
}

fn now_secs() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};

    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(buf)
}

fn read_u64(bytes: &[u8], at: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(buf)
}

fn invalid_data(message: impl Into<String>) -> StorageError {
    StorageError::Io(io::Error::new(io::ErrorKind::InvalidData, message.into()))
}

impl FileHeader {
    fn new(max_memory_pages: PageId) -> Self {
        let now = now_secs();

        Self {
            magic: DB_MAGIC,
            version: FILE_VERSION,
            header_size: HEADER_SIZE as u32,
            page_size: PAGE_SIZE as u32,

            max_memory_pages,
            next_file_page: max_memory_pages,

            sequence: 0,
            durable_version: 0,

            created_at: now,
            last_modified: now,

            header_checksum: 0,

            roots: [NULL_PAGE; NUM_TABLES],
        }
    }

    fn validate(&self) -> Result<()> {
        if self.magic != DB_MAGIC {
            return Err(invalid_data("Invalid page file: wrong magic number"));
        }

        if self.version > FILE_VERSION {
            return Err(invalid_data(format!(
                "Unsupported file version: {}",
                self.version
            )));
        }

        if self.page_size != PAGE_SIZE as u32 {
            return Err(invalid_data(format!(
                "Invalid page size: expected {}, got {}",
                PAGE_SIZE, self.page_size
            )));
        }

        if self.next_file_page < self.max_memory_pages {
            return Err(invalid_data("Next file page lies in the memory id range"));
        }

        Ok(())
    }

    fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];

        bytes[0..4].copy_from_slice(&self.magic);
        bytes[4..8].copy_from_slice(&self.version.to_le_bytes());
        bytes[8..12].copy_from_slice(&self.header_size.to_le_bytes());
        bytes[12..16].copy_from_slice(&self.page_size.to_le_bytes());

        bytes[16..20].copy_from_slice(&self.max_memory_pages.to_le_bytes());
        bytes[20..24].copy_from_slice(&self.next_file_page.to_le_bytes());

        bytes[24..32].copy_from_slice(&self.sequence.to_le_bytes());
        bytes[32..40].copy_from_slice(&self.durable_version.to_le_bytes());

        bytes[40..48].copy_from_slice(&self.created_at.to_le_bytes());
        bytes[48..56].copy_from_slice(&self.last_modified.to_le_bytes());

        bytes[CHECKSUM_RANGE].copy_from_slice(&self.header_checksum.to_le_bytes());

        bytes[60..64].copy_from_slice(&(NUM_TABLES as u32).to_le_bytes());
        for (i, root) in self.roots.iter().enumerate() {
            let at = 64 + i * 4;
            bytes[at..at + 4].copy_from_slice(&root.to_le_bytes());
        }

        bytes
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(invalid_data("Invalid file header size"));
        }

        if read_u32(bytes, 60) as usize != NUM_TABLES {
            return Err(invalid_data(format!(
                "File has {} tables, expected {}",
                read_u32(bytes, 60),
                NUM_TABLES
            )));
        }

        let mut roots = [NULL_PAGE; NUM_TABLES];
        for (i, root) in roots.iter_mut().enumerate() {
            *root = read_u32(bytes, 64 + i * 4);
        }

        let header = Self {
            magic: [bytes[0], bytes[1], bytes[2], bytes[3]],
            version: read_u32(bytes, 4),
            header_size: read_u32(bytes, 8),
            page_size: read_u32(bytes, 12),

            max_memory_pages: read_u32(bytes, 16),
            next_file_page: read_u32(bytes, 20),

            sequence: read_u64(bytes, 24),
            durable_version: read_u64(bytes, 32),

            created_at: read_u64(bytes, 40),
            last_modified: read_u64(bytes, 48),

            header_checksum: read_u32(bytes, CHECKSUM_RANGE.start),

            roots,
        };

        header.validate()?;
        Ok(header)
    }

    fn compute_checksum(&self) -> u32 {
        let bytes = self.to_bytes();
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&bytes[..CHECKSUM_RANGE.start]); // Hash everything before checksum field
        hasher.update(&bytes[CHECKSUM_RANGE.end..]); // Hash everything after checksum field
        hasher.finalize()
    }

    fn update_checksum(&mut self) {
        self.header_checksum = self.compute_checksum();
    }

    fn verify_checksum(&self) -> bool {
        self.compute_checksum() == self.header_checksum
    }
}

/// The on-disk page file: page 0 holds the durable headers, every other page
/// is a sealed page image written by the write-back worker.
pub struct PageFile {
    file: File,
    path: PathBuf,
    fsync: bool,
    header: Mutex<FileHeader>,
    #[cfg(test)]
    failing_writes: std::sync::atomic::AtomicUsize,
}

impl PageFile {
    /// Opens `path`, creating an empty page file if it does not exist.
    pub fn open_or_create(path: &Path, max_memory_pages: PageId, fsync: bool) -> Result<Self> {
        match std::fs::metadata(path) {
            Ok(meta) if meta.len() > 0 => Self::open(path, max_memory_pages, fsync),
            Ok(_) => {
                warn!("page file {} is empty, reinitializing", path.display());
                std::fs::remove_file(path)?;
                Self::create_new(path, max_memory_pages, fsync)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Self::create_new(path, max_memory_pages, fsync)
            }
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    pub fn create_new(path: &Path, max_memory_pages: PageId, fsync: bool) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;

        let mut header = FileHeader::new(max_memory_pages);
        header.update_checksum();

        // Create a full page for the headers (for alignment)
        let mut header_page = [0u8; PAGE_SIZE];
        header_page[0..HEADER_SIZE].copy_from_slice(&header.to_bytes());
        file.write_all_at(&header_page, 0)?;
        if fsync {
            file.sync_all()?;
        }

        info!("created page file {}", path.display());
        Ok(Self {
            file,
            path: path.to_path_buf(),
            fsync,
            header: Mutex::new(header),
            #[cfg(test)]
            failing_writes: std::sync::atomic::AtomicUsize::new(0),
        })
    }

    pub fn open(path: &Path, max_memory_pages: PageId, fsync: bool) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;

        let header = Self::read_header(&file)?;
        if header.max_memory_pages != max_memory_pages {
            return Err(StorageError::Config(format!(
                "page file was created with max_memory_pages {:#x}, configured {:#x}",
                header.max_memory_pages, max_memory_pages
            )));
        }

        info!(
            "opened page file {} at durable version {} (sequence {})",
            path.display(),
            header.durable_version,
            header.sequence
        );
        Ok(Self {
            file,
            path: path.to_path_buf(),
            fsync,
            header: Mutex::new(header),
            #[cfg(test)]
            failing_writes: std::sync::atomic::AtomicUsize::new(0),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The most recent durable header.
    pub fn header(&self) -> FileHeader {
        *self.header.lock()
    }

    /// Byte offset of file page `page_id`, which is
    /// `(page_id - max_memory_pages + 1) * PAGE_SIZE`.
    ///
    /// File ids share one id space with memory ids and start at
    /// `max_memory_pages`, so the offset is not simply `page_id * PAGE_SIZE`.
    /// Page 0 of the file holds the header pair, which shifts every page by
    /// one.
    fn offset_of(&self, page_id: PageId) -> Result<u64> {
        let max_memory_pages = self.header.lock().max_memory_pages;
        if page_id < max_memory_pages || page_id == NULL_PAGE {
            return Err(StorageError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("Page {page_id} is not a file page"),
            )));
        }
        Ok((page_id - max_memory_pages) as u64 * PAGE_SIZE as u64 + PAGE_SIZE as u64)
    }

    pub fn write_page(&self, page_id: PageId, image: &[u8]) -> Result<()> {
        debug_assert_eq!(image.len(), PAGE_SIZE);
        let offset = self.offset_of(page_id)?;
        #[cfg(test)]
        self.injected_write_failure()?;
        self.file.write_all_at(image, offset)?;
        Ok(())
    }

    /// Makes the next `count` page writes fail.
    #[cfg(test)]
    pub(crate) fn fail_page_writes(&self, count: usize) {
        self.failing_writes
            .store(count, std::sync::atomic::Ordering::Release);
    }

    #[cfg(test)]
    fn injected_write_failure(&self) -> Result<()> {
        use std::sync::atomic::Ordering;
        let failing = self
            .failing_writes
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(StorageError::Io(io::Error::new(
                io::ErrorKind::Other,
                "injected write failure",
            )));
        }
        Ok(())
    }

    pub fn read_page(&self, page_id: PageId, buffer: &mut [u8]) -> Result<()> {
        debug_assert_eq!(buffer.len(), PAGE_SIZE);
        let offset = self.offset_of(page_id)?;
        self.file.read_exact_at(buffer, offset)?;
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        if self.fsync {
            self.file.sync_data()?;
        }
        Ok(())
    }

    /// Writes a new durable header into the slot not holding the current
    /// one, then syncs. Returns the new sequence number.
    pub fn commit_header(
        &self,
        durable_version: Version,
        roots: [PageId; NUM_TABLES],
        next_file_page: PageId,
    ) -> Result<u64> {
        let mut current = self.header.lock();
        let mut header = *current;
        header.sequence += 1;
        header.durable_version = durable_version;
        header.roots = roots;
        header.next_file_page = next_file_page;
        header.last_modified = now_secs();
        header.update_checksum();

        let slot = header.sequence % HEADER_SLOTS;
        self.file
            .write_all_at(&header.to_bytes(), slot * HEADER_SIZE as u64)?;
        self.sync()?;

        debug!(
            "header sequence {} written to slot {} (durable version {})",
            header.sequence, slot, durable_version
        );
        *current = header;
        Ok(header.sequence)
    }

    /// Reads both header slots and returns the valid one with the highest
    /// sequence.
    fn read_header(file: &File) -> Result<FileHeader> {
        let mut buffer = [0u8; PAGE_SIZE];
        file.read_exact_at(&mut buffer, 0)?;

        let mut best: Option<FileHeader> = None;
        for slot in 0..HEADER_SLOTS as usize {
            let bytes = &buffer[slot * HEADER_SIZE..(slot + 1) * HEADER_SIZE];
            let header = match FileHeader::from_bytes(bytes) {
                Ok(header) if header.verify_checksum() => header,
                Ok(_) => {
                    warn!("header slot {} has a bad checksum, ignoring", slot);
                    continue;
                }
                Err(_) => continue,
            };
            if best.map_or(true, |b| header.sequence > b.sequence) {
                best = Some(header);
            }
        }

        best.ok_or_else(|| invalid_data("No valid file header found"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const MAX_MEMORY: PageId = 0x1000;

    #[test]
    fn test_create_and_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pages.db");
        {
            let file = PageFile::create_new(&path, MAX_MEMORY, true).unwrap();
            let header = file.header();
            assert_eq!(header.sequence, 0);
            assert_eq!(header.next_file_page, MAX_MEMORY);
            assert_eq!(header.roots, [NULL_PAGE; NUM_TABLES]);
        }
        let file = PageFile::open(&path, MAX_MEMORY, true).unwrap();
        assert_eq!(file.header().durable_version, 0);
    }

    #[test]
    fn test_header_slots_alternate() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pages.db");
        let file = PageFile::create_new(&path, MAX_MEMORY, false).unwrap();

        let mut roots = [NULL_PAGE; NUM_TABLES];
        roots[0] = MAX_MEMORY + 3;
        assert_eq!(file.commit_header(5, roots, MAX_MEMORY + 4).unwrap(), 1);
        roots[1] = MAX_MEMORY + 7;
        assert_eq!(file.commit_header(9, roots, MAX_MEMORY + 8).unwrap(), 2);
        drop(file);

        let file = PageFile::open(&path, MAX_MEMORY, false).unwrap();
        let header = file.header();
        assert_eq!(header.sequence, 2);
        assert_eq!(header.durable_version, 9);
        assert_eq!(header.roots[1], MAX_MEMORY + 7);
        assert_eq!(header.next_file_page, MAX_MEMORY + 8);
    }

    #[test]
    fn test_torn_header_falls_back() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pages.db");
        let file = PageFile::create_new(&path, MAX_MEMORY, false).unwrap();
        let roots = [NULL_PAGE; NUM_TABLES];
        file.commit_header(3, roots, MAX_MEMORY).unwrap(); // slot 1
        file.commit_header(4, roots, MAX_MEMORY).unwrap(); // slot 0
        drop(file);

        // damage slot 0, which holds sequence 2
        let raw = OpenOptions::new().write(true).open(&path).unwrap();
        raw.write_all_at(&[0xAB; 8], 24).unwrap();
        drop(raw);

        let file = PageFile::open(&path, MAX_MEMORY, false).unwrap();
        assert_eq!(file.header().sequence, 1);
        assert_eq!(file.header().durable_version, 3);
    }

    #[test]
    fn test_page_io_uses_offset_mapping() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pages.db");
        let file = PageFile::create_new(&path, MAX_MEMORY, false).unwrap();

        let image = [0x5Au8; PAGE_SIZE];
        file.write_page(MAX_MEMORY + 1, &image).unwrap();
        assert_eq!(
            std::fs::metadata(&path).unwrap().len(),
            3 * PAGE_SIZE as u64
        );

        let mut buffer = [0u8; PAGE_SIZE];
        file.read_page(MAX_MEMORY + 1, &mut buffer).unwrap();
        assert_eq!(buffer, image);

        assert!(file.write_page(MAX_MEMORY - 1, &image).is_err());
        assert!(file.read_page(MAX_MEMORY + 50, &mut buffer).is_err());
    }

    #[test]
    fn test_mismatched_id_space_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pages.db");
        PageFile::create_new(&path, MAX_MEMORY, false).unwrap();
        assert!(matches!(
            PageFile::open(&path, MAX_MEMORY * 2, false),
            Err(StorageError::Config(_))
        ));
    }
}
