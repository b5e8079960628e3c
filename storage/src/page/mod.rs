//! Fixed-size page layout.
//!
//! Every page is `PAGE_SIZE` bytes and starts with a 16-byte header:
//!
//! ```text
//! [0]      page type
//! [1]      flags (one dirty bit per dirty generation)
//! [2..4]   reserved
//! [4..8]   previous version page id (CRC32 of the image on disk)
//! [8..16]  version
//! ```
//!
//! Header fields that other threads may look at while a page is live (flags,
//! prev, version) and the child slots of internal nodes are only ever touched
//! through atomics. Everything else is accessed through the typed views in
//! [`leaf`], [`node`] and [`free_list`], which are the only places that turn
//! arena memory into byte slices.

pub mod free_list;
pub mod leaf;
pub mod node;

pub use free_list::{FreeListPage, FREE_LIST_CAPACITY};
pub use leaf::{LeafPage, LEAF_BUF_SIZE, LEAF_CAPACITY};
pub use node::{NodePage, NODE_BUF_SIZE, NODE_CAPACITY};

use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};

pub const PAGE_SIZE: usize = 4096;
pub const HEADER_SIZE: usize = 16;

/// Keys and values are stored padded to this alignment.
pub const WORD_SIZE: usize = 16;

pub type PageId = u32;
pub type Version = u64;

/// Marks an absent page: an empty table root or the end of a version chain.
pub const NULL_PAGE: PageId = u32::MAX;

const TYPE_OFFSET: usize = 0;
const FLAGS_OFFSET: usize = 1;
const PREV_OFFSET: usize = 4;
const VERSION_OFFSET: usize = 8;

#[repr(u8)] // 1 byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageType {
    Leaf = 1,
    Node = 2,
    FreeList = 3,
    Free = 4,
}

impl PageType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(PageType::Leaf),
            2 => Some(PageType::Node),
            3 => Some(PageType::FreeList),
            4 => Some(PageType::Free),
            _ => None,
        }
    }
}

/// The two alternating dirty generations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirtyFlag {
    Dirty0,
    Dirty1,
}

impl DirtyFlag {
    pub fn other(self) -> Self {
        match self {
            DirtyFlag::Dirty0 => DirtyFlag::Dirty1,
            DirtyFlag::Dirty1 => DirtyFlag::Dirty0,
        }
    }

    fn bit(self) -> u8 {
        match self {
            DirtyFlag::Dirty0 => 0b01,
            DirtyFlag::Dirty1 => 0b10,
        }
    }
}

/// Number of padded bytes `len` bytes occupy.
pub fn padded_len(len: usize) -> usize {
    (len / WORD_SIZE + 1) * WORD_SIZE
}

/// Pads `data` to a multiple of 16 bytes. The last byte of the padded run
/// holds `data.len() % 16`, so an exact multiple of 16 still gets one extra
/// word.
pub fn pad(data: &[u8]) -> Vec<u8> {
    let mut out = vec![0u8; padded_len(data.len())];
    write_padded(&mut out, data);
    out
}

/// Writes `data` in padded form into `out`, which must be exactly
/// `padded_len(data.len())` bytes.
pub(crate) fn write_padded(out: &mut [u8], data: &[u8]) {
    debug_assert_eq!(out.len(), padded_len(data.len()));
    out[..data.len()].copy_from_slice(data);
    out[data.len()..].fill(0);
    let last = out.len() - 1;
    out[last] = (data.len() % WORD_SIZE) as u8;
}

/// Strips the padding added by [`pad`].
pub fn unpad(padded: &[u8]) -> &[u8] {
    match padded.last() {
        Some(&tail) => {
            let len = padded.len() - WORD_SIZE + (tail as usize % WORD_SIZE);
            &padded[..len]
        }
        None => padded,
    }
}

/// Stores a CRC32 of the image in its `prev` field. On disk a page has no
/// predecessor, so the field is free.
pub fn seal_image(image: &mut [u8]) {
    image[PREV_OFFSET..PREV_OFFSET + 4].fill(0);
    let checksum = crc32fast::hash(image);
    image[PREV_OFFSET..PREV_OFFSET + 4].copy_from_slice(&checksum.to_le_bytes());
}

pub fn verify_image(image: &[u8]) -> bool {
    let stored = u32::from_le_bytes([
        image[PREV_OFFSET],
        image[PREV_OFFSET + 1],
        image[PREV_OFFSET + 2],
        image[PREV_OFFSET + 3],
    ]);
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&image[..PREV_OFFSET]);
    hasher.update(&[0u8; 4]);
    hasher.update(&image[PREV_OFFSET + 4..]);
    hasher.finalize() == stored
}

pub fn image_type(image: &[u8]) -> Option<PageType> {
    PageType::from_u8(image[TYPE_OFFSET])
}

pub fn image_version(image: &[u8]) -> Version {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&image[VERSION_OFFSET..VERSION_OFFSET + 8]);
    u64::from_le_bytes(bytes)
}

/// Replaces child `index` of an internal node image.
pub fn set_image_child(image: &mut [u8], index: usize, child: PageId) {
    let offset = node::CHILDREN_OFFSET + index * 4;
    image[offset..offset + 4].copy_from_slice(&child.to_le_bytes());
}

/// A handle to one page slot of the arena.
///
/// Only the allocator's translation layer creates these. The lifetime ties the
/// handle to the arena it points into.
#[derive(Clone, Copy)]
pub struct RawPage<'a> {
    ptr: NonNull<u8>,
    _arena: PhantomData<&'a [u8]>,
}

// SAFETY: a RawPage is a plain address into a shared arena. All concurrently
// mutated fields are atomics; byte views are only created under the rules
// documented on the view constructors.
unsafe impl Send for RawPage<'_> {}
unsafe impl Sync for RawPage<'_> {}

impl std::fmt::Debug for RawPage<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawPage")
            .field("type", &self.page_type())
            .field("prev", &self.prev())
            .field("version", &self.version())
            .finish()
    }
}

impl<'a> RawPage<'a> {
    /// # Safety
    ///
    /// `ptr` must point to `PAGE_SIZE` bytes, 8-byte aligned, that stay mapped
    /// for `'a`.
    pub(crate) unsafe fn from_ptr(ptr: NonNull<u8>) -> Self {
        debug_assert_eq!(ptr.as_ptr() as usize % 8, 0);
        Self {
            ptr,
            _arena: PhantomData,
        }
    }

    fn atomic_u8(self, offset: usize) -> &'a AtomicU8 {
        // SAFETY: offset is a header constant inside the page, AtomicU8 has
        // alignment 1 and the page outlives 'a.
        unsafe { &*(self.ptr.as_ptr().add(offset) as *const AtomicU8) }
    }

    fn atomic_u32(self, offset: usize) -> &'a AtomicU32 {
        debug_assert_eq!(offset % 4, 0);
        // SAFETY: the page base is 8-byte aligned and offset is a multiple of
        // 4 below PAGE_SIZE, so the AtomicU32 is aligned and in bounds.
        unsafe { &*(self.ptr.as_ptr().add(offset) as *const AtomicU32) }
    }

    fn atomic_u64(self, offset: usize) -> &'a AtomicU64 {
        debug_assert_eq!(offset % 8, 0);
        // SAFETY: as atomic_u32 with 8-byte alignment.
        unsafe { &*(self.ptr.as_ptr().add(offset) as *const AtomicU64) }
    }

    /// # Safety
    ///
    /// No `&mut` view may overlap `range` for the lifetime of the slice.
    unsafe fn bytes(self, start: usize, end: usize) -> &'a [u8] {
        debug_assert!(start <= end && end <= PAGE_SIZE);
        std::slice::from_raw_parts(self.ptr.as_ptr().add(start), end - start)
    }

    /// # Safety
    ///
    /// The caller must have exclusive access to `range` for the lifetime of
    /// the slice.
    #[allow(clippy::mut_from_ref)]
    unsafe fn bytes_mut(self, start: usize, end: usize) -> &'a mut [u8] {
        debug_assert!(start <= end && end <= PAGE_SIZE);
        std::slice::from_raw_parts_mut(self.ptr.as_ptr().add(start), end - start)
    }

    pub fn page_type(self) -> Option<PageType> {
        PageType::from_u8(self.atomic_u8(TYPE_OFFSET).load(Ordering::Acquire))
    }

    pub fn prev(self) -> PageId {
        self.atomic_u32(PREV_OFFSET).load(Ordering::Acquire)
    }

    pub fn set_prev(self, prev: PageId) {
        self.atomic_u32(PREV_OFFSET).store(prev, Ordering::Release);
    }

    pub fn version(self) -> Version {
        self.atomic_u64(VERSION_OFFSET).load(Ordering::Acquire)
    }

    /// Initializes the header of a page nobody else can see yet.
    pub fn init_header(self, page_type: PageType, prev: PageId, version: Version) {
        self.atomic_u8(FLAGS_OFFSET).store(0, Ordering::Relaxed);
        self.atomic_u32(PREV_OFFSET).store(prev, Ordering::Relaxed);
        self.atomic_u64(VERSION_OFFSET)
            .store(version, Ordering::Relaxed);
        self.atomic_u8(TYPE_OFFSET)
            .store(page_type as u8, Ordering::Release);
    }

    pub fn is_dirty(self, flag: DirtyFlag) -> bool {
        self.atomic_u8(FLAGS_OFFSET).load(Ordering::Acquire) & flag.bit() != 0
    }

    pub fn set_dirty(self, flag: DirtyFlag, dirty: bool) {
        let flags = self.atomic_u8(FLAGS_OFFSET);
        if dirty {
            flags.fetch_or(flag.bit(), Ordering::AcqRel);
        } else {
            flags.fetch_and(!flag.bit(), Ordering::AcqRel);
        }
    }

    /// Child slot `index` of an internal node. Slots are rewritten in place
    /// by copy-on-write installs and read-ins, so they are only accessed
    /// atomically.
    pub fn child_slot(self, index: usize) -> &'a AtomicU32 {
        assert!(index <= NODE_CAPACITY, "child slot {index} out of range");
        self.atomic_u32(node::CHILDREN_OFFSET + index * 4)
    }

    fn children(self) -> &'a [AtomicU32] {
        // SAFETY: the children array is 4-byte aligned at CHILDREN_OFFSET and
        // NODE_CAPACITY + 1 entries long, inside the page. Shared references
        // to atomics may alias freely.
        unsafe {
            std::slice::from_raw_parts(
                self.ptr.as_ptr().add(node::CHILDREN_OFFSET) as *const AtomicU32,
                NODE_CAPACITY + 1,
            )
        }
    }

    /// Read view of a leaf.
    ///
    /// # Safety
    ///
    /// The page must be a leaf that is not being mutated: its version is at
    /// or below the reader's version, or the caller is the head transaction
    /// that owns it and holds no mutable view.
    pub unsafe fn leaf(self) -> LeafPage<&'a [u8]> {
        LeafPage::new(self.bytes(HEADER_SIZE, PAGE_SIZE))
    }

    /// Write view of a leaf.
    ///
    /// # Safety
    ///
    /// The caller must own the page exclusively: it was allocated by the
    /// head transaction (`version == head version`) and no other view of its
    /// body is alive.
    pub unsafe fn leaf_mut(self) -> LeafPage<&'a mut [u8]> {
        LeafPage::new(self.bytes_mut(HEADER_SIZE, PAGE_SIZE))
    }

    /// Read view of an internal node. Same contract as [`RawPage::leaf`].
    pub unsafe fn node(self) -> NodePage<'a, &'a [u8]> {
        NodePage::from_parts(
            self.bytes(HEADER_SIZE, node::CHILDREN_OFFSET),
            self.children(),
            self.bytes(node::KEYS_OFFSET, PAGE_SIZE),
        )
    }

    /// Write view of an internal node. Same contract as
    /// [`RawPage::leaf_mut`].
    pub unsafe fn node_mut(self) -> NodePage<'a, &'a mut [u8]> {
        NodePage::from_parts(
            self.bytes_mut(HEADER_SIZE, node::CHILDREN_OFFSET),
            self.children(),
            self.bytes_mut(node::KEYS_OFFSET, PAGE_SIZE),
        )
    }

    /// # Safety
    ///
    /// Free-list pages belong to the garbage collector, which must hold its
    /// lock while the view is alive.
    pub unsafe fn free_list_mut(self) -> FreeListPage<&'a mut [u8]> {
        FreeListPage::new(self.bytes_mut(HEADER_SIZE, PAGE_SIZE))
    }

    /// Copies the body of this page into `dst`. The caller sets the header of
    /// `dst` afterwards.
    ///
    /// # Safety
    ///
    /// `dst` must be exclusively owned by the caller and this page must not
    /// be mutated concurrently (child slots excepted).
    pub unsafe fn clone_into(self, dst: RawPage<'_>) {
        match self.page_type() {
            Some(PageType::Node) => {
                dst.bytes_mut(HEADER_SIZE, node::CHILDREN_OFFSET)
                    .copy_from_slice(self.bytes(HEADER_SIZE, node::CHILDREN_OFFSET));
                dst.bytes_mut(node::KEYS_OFFSET, PAGE_SIZE)
                    .copy_from_slice(self.bytes(node::KEYS_OFFSET, PAGE_SIZE));
                for (to, from) in dst.children().iter().zip(self.children()) {
                    to.store(from.load(Ordering::Acquire), Ordering::Relaxed);
                }
            }
            _ => {
                dst.bytes_mut(HEADER_SIZE, PAGE_SIZE)
                    .copy_from_slice(self.bytes(HEADER_SIZE, PAGE_SIZE));
            }
        }
    }

    /// Serializes the page into `out` in its on-disk form: little-endian
    /// header without flags or predecessor.
    ///
    /// # Safety
    ///
    /// Same contract as [`RawPage::leaf`].
    pub unsafe fn write_image(self, out: &mut [u8]) {
        debug_assert_eq!(out.len(), PAGE_SIZE);
        out[..HEADER_SIZE].fill(0);
        out[TYPE_OFFSET] = self.atomic_u8(TYPE_OFFSET).load(Ordering::Acquire);
        out[VERSION_OFFSET..VERSION_OFFSET + 8].copy_from_slice(&self.version().to_le_bytes());
        match self.page_type() {
            Some(PageType::Node) => {
                out[HEADER_SIZE..node::CHILDREN_OFFSET]
                    .copy_from_slice(self.bytes(HEADER_SIZE, node::CHILDREN_OFFSET));
                for (index, child) in self.children().iter().enumerate() {
                    set_image_child(out, index, child.load(Ordering::Acquire));
                }
                out[node::KEYS_OFFSET..].copy_from_slice(self.bytes(node::KEYS_OFFSET, PAGE_SIZE));
            }
            _ => out[HEADER_SIZE..].copy_from_slice(self.bytes(HEADER_SIZE, PAGE_SIZE)),
        }
    }

    /// Fills this page from an on-disk image. The loaded page has no
    /// predecessor and is clean.
    ///
    /// # Safety
    ///
    /// The caller must own the page exclusively (freshly allocated, not yet
    /// published).
    pub unsafe fn load_image(self, image: &[u8]) {
        debug_assert_eq!(image.len(), PAGE_SIZE);
        let page_type = image_type(image).unwrap_or(PageType::Free);
        if page_type == PageType::Node {
            self.bytes_mut(HEADER_SIZE, node::CHILDREN_OFFSET)
                .copy_from_slice(&image[HEADER_SIZE..node::CHILDREN_OFFSET]);
            for (index, child) in self.children().iter().enumerate() {
                let offset = node::CHILDREN_OFFSET + index * 4;
                let id = u32::from_le_bytes([
                    image[offset],
                    image[offset + 1],
                    image[offset + 2],
                    image[offset + 3],
                ]);
                child.store(id, Ordering::Relaxed);
            }
            self.bytes_mut(node::KEYS_OFFSET, PAGE_SIZE)
                .copy_from_slice(&image[node::KEYS_OFFSET..]);
        } else {
            self.bytes_mut(HEADER_SIZE, PAGE_SIZE)
                .copy_from_slice(&image[HEADER_SIZE..]);
        }
        self.init_header(page_type, NULL_PAGE, image_version(image));
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// A page-aligned buffer standing in for one arena slot.
    #[repr(C, align(4096))]
    pub(crate) struct TestPage(pub [u8; PAGE_SIZE]);

    impl TestPage {
        pub(crate) fn boxed() -> Box<Self> {
            Box::new(TestPage([0; PAGE_SIZE]))
        }

        pub(crate) fn raw(&mut self) -> RawPage<'_> {
            // SAFETY: the buffer is PAGE_SIZE bytes, 4096-aligned and borrowed
            // for the lifetime of the handle.
            unsafe { RawPage::from_ptr(NonNull::new_unchecked(self.0.as_mut_ptr())) }
        }
    }

    #[test]
    fn test_header_layout() {
        let mut buf = TestPage::boxed();
        let page = buf.raw();
        page.init_header(PageType::Leaf, 7, 42);

        assert_eq!(page.page_type(), Some(PageType::Leaf));
        assert_eq!(page.prev(), 7);
        assert_eq!(page.version(), 42);
        assert_eq!(buf.0[0], PageType::Leaf as u8);
        assert_eq!(&buf.0[4..8], &7u32.to_ne_bytes());
        assert_eq!(&buf.0[8..16], &42u64.to_ne_bytes());
    }

    #[test]
    fn test_dirty_flags_are_independent() {
        let mut buf = TestPage::boxed();
        let page = buf.raw();
        page.init_header(PageType::Leaf, NULL_PAGE, 1);

        page.set_dirty(DirtyFlag::Dirty0, true);
        assert!(page.is_dirty(DirtyFlag::Dirty0));
        assert!(!page.is_dirty(DirtyFlag::Dirty1));

        page.set_dirty(DirtyFlag::Dirty1, true);
        page.set_dirty(DirtyFlag::Dirty0, false);
        assert!(!page.is_dirty(DirtyFlag::Dirty0));
        assert!(page.is_dirty(DirtyFlag::Dirty1));
        assert_eq!(DirtyFlag::Dirty0.other(), DirtyFlag::Dirty1);
    }

    #[test]
    fn test_padding() {
        assert_eq!(padded_len(0), 16);
        assert_eq!(padded_len(15), 16);
        assert_eq!(padded_len(16), 32);

        for len in [0usize, 1, 15, 16, 17, 31, 32, 100] {
            let data: Vec<u8> = (0..len).map(|i| i as u8 + 1).collect();
            let padded = pad(&data);
            assert_eq!(padded.len(), padded_len(len));
            assert_eq!(padded.len() % WORD_SIZE, 0);
            assert_eq!(unpad(&padded), &data[..]);
        }
    }

    #[test]
    fn test_image_checksum() {
        let mut buf = TestPage::boxed();
        let page = buf.raw();
        page.init_header(PageType::Leaf, 3, 9);
        unsafe { page.leaf_mut() }.clear();
        assert!(unsafe { page.leaf_mut() }.insert(0, b"key", b"value"));

        let mut image = vec![0u8; PAGE_SIZE];
        unsafe { page.write_image(&mut image) };
        seal_image(&mut image);
        assert!(verify_image(&image));
        assert_eq!(image_version(&image), 9);
        assert_eq!(image_type(&image), Some(PageType::Leaf));

        image[2000] ^= 0xFF;
        assert!(!verify_image(&image));
    }

    #[test]
    fn test_image_roundtrip_resets_chain() {
        let mut src = TestPage::boxed();
        let mut dst = TestPage::boxed();
        let page = src.raw();
        page.init_header(PageType::Node, 11, 5);
        let mut node = unsafe { page.node_mut() };
        node.init_with(1, &pad(b"m"), 2);

        let mut image = vec![0u8; PAGE_SIZE];
        unsafe { page.write_image(&mut image) };
        set_image_child(&mut image, 1, 0x2000_0001);

        let loaded = dst.raw();
        unsafe { loaded.load_image(&image) };
        assert_eq!(loaded.page_type(), Some(PageType::Node));
        assert_eq!(loaded.prev(), NULL_PAGE);
        assert_eq!(loaded.version(), 5);
        let node = unsafe { loaded.node() };
        assert_eq!(node.len(), 1);
        assert_eq!(node.child(0), 1);
        assert_eq!(node.child(1), 0x2000_0001);
        assert_eq!(node.key(0), b"m");
    }
}
