use crate::fil0fil;

/** All persistent tablespaces have a smaller fil_space_t::id than this. */
pub const SRV_SPACE_ID_UPPER_BOUND: u32 = 0xFFFFFFF0u32;

/** The fil_space_t::id of the temporary tablespace. */
pub const SRV_TMP_SPACE_ID: u32 = 0xFFFFFFFEu32;

/** Space id of the transaction system page (the system tablespace). */
pub const TRX_SYS_SPACE: u32 = 0;

/** The two alternating space ids of the binlog tablespaces. The active
binlog file with number file_no maps to SRV_SPACE_ID_BINLOG0 + (file_no & 1).
*/
pub const SRV_SPACE_ID_BINLOG0: u32 = 0xFFFFFFF0u32;
pub const SRV_SPACE_ID_BINLOG1: u32 = 0xFFFFFFF1u32;

/** @name Flags for inserting records in order
If records are inserted in order, there are the following
flags to tell this (their type is made byte for the compiler
to warn if direction and hint parameters are switched in
fseg_alloc_free_page_general) */
pub const FSP_UP: u8 = 111; // alphabetically upwards
pub const FSP_DOWN: u8 = 112; // alphabetically downwards
pub const FSP_NO_DIR: u8 = 113; // no order

/** File space extent size in pages
page size | file space extent size
----------+-----------------------
   4 KiB  | 256 pages = 1 MiB
   8 KiB  | 128 pages = 1 MiB
  16 KiB  |  64 pages = 1 MiB
  32 KiB  |  64 pages = 2 MiB
  64 KiB  |  64 pages = 4 MiB

  page_size_shift = log2(page_size).
*/
#[allow(non_snake_case)]
pub const fn FSP_EXTENT_SIZE(page_size_shift: u32) -> u32 {
    if page_size_shift < 14 {
        1048576u32 >> page_size_shift
    } else {
        64u32
    }
}

/** On a page of any file segment, data may be put starting from this
offset */
pub const FSEG_PAGE_DATA: u32 = fil0fil::FIL_PAGE_DATA;

/** @name File segment header
The file segment header points to the inode describing the file segment. */
/* @{ */

/// space id of the inode.
pub const FSEG_HDR_SPACE: u32 = 0;

/// page number of the inode.
pub const FSEG_HDR_PAGE_NO: u32 = 4;

/// byte offset of the inode.
pub const FSEG_HDR_OFFSET: u32 = 8;

/// Length of the file segment header, in bytes.
pub const FSEG_HEADER_SIZE: u32 = 10;

/* @} */

/** Flags for fsp_reserve_free_extents */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FspReserve {
    /// reservation during normal B-tree operations
    Normal,
    /// reservation done for undo logging
    Undo,
    /// reservation done during purge operations
    Cleaning,
    /// reservation being done for BLOB insertion
    Blob,
}
