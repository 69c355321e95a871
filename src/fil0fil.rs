use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Condvar, Mutex};
use std::thread::{self, ThreadId};

use crate::tablespace::DataFileNode;
use crate::univ;

/** Initial size of a single-table tablespace in pages */
pub const FIL_IBD_FILE_INITIAL_SIZE: u32 = 4;

/** 'null' (undefined) page offset in the context of file spaces */
pub const FIL_NULL: u32 = univ::ULINT32_UNDEFINED;

pub const FIL_ADDR_PAGE: u32 = 0; /* first in address is the page offset */
pub const FIL_ADDR_BYTE: u32 = 4; /* then comes 2-byte byte offset within page*/
pub const FIL_ADDR_SIZE: u32 = 6; /* address size is 6 bytes */

/** File space address: a byte position identified by page number within a
tablespace and byte offset within the page. */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilAddr {
    /** page number within a tablespace */
    pub page: u32,
    /** byte offset within the page */
    pub boffset: u16,
}

/** The null file address */
pub const FIL_ADDR_NULL: FilAddr = FilAddr {
    page: FIL_NULL,
    boffset: 0,
};

impl FilAddr {
    pub fn is_null(&self) -> bool {
        self.page == FIL_NULL
    }
}

/** The byte offsets on a file page for various variables @{ */

/// checksum of the page in the full crc32 format, or space id in ancient
/// formats.
pub const FIL_PAGE_SPACE_OR_CHKSUM: u32 = 0;
/// page offset inside space.
pub const FIL_PAGE_OFFSET: u32 = 4;
/// if there is a 'natural' predecessor of the page, its offset. Otherwise
/// FIL_NULL.
pub const FIL_PAGE_PREV: u32 = 8;
/// if there is a 'natural' successor of the page, its offset. Otherwise
/// FIL_NULL.
pub const FIL_PAGE_NEXT: u32 = 12;
/// lsn of the end of the newest modification log record to the page.
pub const FIL_PAGE_LSN: u32 = 16;
/// file page type: FIL_PAGE_TYPE_FSP_HDR, ..., 2 bytes.
pub const FIL_PAGE_TYPE: u32 = 24;
/// for the first page in a system tablespace data file: the file has been
/// flushed to disk at least up to this lsn.
pub const FIL_PAGE_FILE_FLUSH_LSN_OR_KEY_VERSION: u32 = 26;
/// starting from 4.1.x this contains the space id of the page.
pub const FIL_PAGE_ARCH_LOG_NO_OR_SPACE_ID: u32 = 34;

pub const FIL_PAGE_SPACE_ID: u32 = FIL_PAGE_ARCH_LOG_NO_OR_SPACE_ID;

pub const FIL_PAGE_DATA: u32 = 38; // start of the data on the page.

/** File page trailer @{ */

/// size of the page trailer.
pub const FIL_PAGE_DATA_END: u32 = 8;

/** Store the last 4 bytes of FIL_PAGE_LSN */
pub const FIL_PAGE_FCRC32_END_LSN: u32 = 8;

/** Store crc32 checksum at the end of the page */
pub const FIL_PAGE_FCRC32_CHECKSUM: u32 = 4;

/* @} */

/** File page types (values of FIL_PAGE_TYPE) @{ */
/** Freshly allocated page */
pub const FIL_PAGE_TYPE_ALLOCATED: u16 = 0;
/** Undo log page */
pub const FIL_PAGE_UNDO_LOG: u16 = 2;
/** Index node (of file-in-file metadata) */
pub const FIL_PAGE_INODE: u16 = 3;
/** System page */
pub const FIL_PAGE_TYPE_SYS: u16 = 6;
/** Tablespace header (page 0) */
pub const FIL_PAGE_TYPE_FSP_HDR: u16 = 8;
/** Extent descriptor page (pages n*page_size, except 0) */
pub const FIL_PAGE_TYPE_XDES: u16 = 9;
/* @} */

pub fn fil_page_get_type(page: &[u8]) -> u16 {
    crate::mach::mach_read_from_2(&page[FIL_PAGE_TYPE as usize..])
}

/// A tablespace SX latch. The owner thread is tracked so that allocator code
/// can assert ownership (`fil_space_t::is_owner()` in the original).
pub struct SpaceLatch {
    owner: Mutex<Option<ThreadId>>,
    cond: Condvar,
}

impl Default for SpaceLatch {
    fn default() -> Self {
        SpaceLatch {
            owner: Mutex::new(None),
            cond: Condvar::new(),
        }
    }
}

impl SpaceLatch {
    pub fn x_lock(&self) {
        let me = thread::current().id();
        let mut owner = self.owner.lock().unwrap();
        while owner.is_some() {
            assert_ne!(*owner, Some(me), "space latch is not recursive");
            owner = self.cond.wait(owner).unwrap();
        }
        *owner = Some(me);
    }

    pub fn x_unlock(&self) {
        let mut owner = self.owner.lock().unwrap();
        assert_eq!(*owner, Some(thread::current().id()));
        *owner = None;
        drop(owner);
        self.cond.notify_one();
    }

    pub fn is_owner(&self) -> bool {
        *self.owner.lock().unwrap() == Some(thread::current().id())
    }
}

/// In-memory tablespace object. Scalars mirrored from the FSP header are
/// only modified while the space latch is held by the modifying MTR.
pub struct FilSpace {
    pub id: u32,
    pub page_size_shift: u32,
    /// Current size of the space in pages, mirror of FSP_SIZE.
    pub size_in_header: AtomicU32,
    /// Mirror of FSP_FREE_LIMIT.
    pub free_limit: AtomicU32,
    /// Length of the FSP_FREE list.
    pub free_len: AtomicU32,
    /// Number of extents currently reserved by fsp_reserve_free_extents().
    pub n_reserved_extents: AtomicU32,
    /// Upper bound for fsp_try_extend_data_file(), in pages.
    pub max_size_in_pages: AtomicU32,
    /// Set when on-disk invariants were found violated; the space becomes
    /// read-only.
    corrupted: AtomicBool,
    pub is_temporary: bool,
    pub latch: SpaceLatch,
    /// Backing data file, if the space is attached to one.
    pub node: Mutex<Option<DataFileNode>>,
}

impl FilSpace {
    pub fn new(id: u32, page_size_shift: u32, is_temporary: bool) -> FilSpace {
        FilSpace {
            id,
            page_size_shift,
            size_in_header: AtomicU32::new(0),
            free_limit: AtomicU32::new(0),
            free_len: AtomicU32::new(0),
            n_reserved_extents: AtomicU32::new(0),
            max_size_in_pages: AtomicU32::new(u32::MAX),
            corrupted: AtomicBool::new(false),
            is_temporary,
            latch: SpaceLatch::default(),
            node: Mutex::new(None),
        }
    }

    pub fn physical_size(&self) -> u32 {
        1u32 << self.page_size_shift
    }

    pub fn size(&self) -> u32 {
        self.size_in_header.load(Ordering::Relaxed)
    }

    pub fn set_size(&self, size: u32) {
        self.size_in_header.store(size, Ordering::Relaxed)
    }

    pub fn free_limit(&self) -> u32 {
        self.free_limit.load(Ordering::Relaxed)
    }

    pub fn set_free_limit(&self, limit: u32) {
        self.free_limit.store(limit, Ordering::Relaxed)
    }

    pub fn set_corrupted(&self) {
        if !self.corrupted.swap(true, Ordering::Relaxed) {
            log::error!("tablespace {} is corrupted; it is now read-only", self.id);
        }
    }

    pub fn is_corrupted(&self) -> bool {
        self.corrupted.load(Ordering::Relaxed)
    }

    pub fn is_owner(&self) -> bool {
        self.latch.is_owner()
    }

    /// Release extents reserved earlier with fsp_reserve_free_extents().
    pub fn release_free_extents(&self, n: u32) {
        let prev = self.n_reserved_extents.fetch_sub(n, Ordering::Relaxed);
        assert!(prev >= n, "releasing more extents than reserved");
    }
}

#[cfg(test)]
mod test {
    use super::SpaceLatch;

    #[test]
    fn test_space_latch() {
        let latch = SpaceLatch::default();
        assert!(!latch.is_owner());
        latch.x_lock();
        assert!(latch.is_owner());
        latch.x_unlock();
        assert!(!latch.is_owner());
    }
}
