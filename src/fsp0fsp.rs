//! File space management: free-page, free-extent and segment-inode
//! allocation over a paged tablespace, with all updates covered by
//! mini-transaction redo.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use crate::buf0buf::{Block, BufferPool, PageGet};
use crate::db0err::{DbErr, DbResult};
use crate::fil0fil::{self, FIL_NULL, FilAddr, FilSpace};
use crate::fsp0types::{self, FspReserve};
use crate::fut0lst::{self, FLST_BASE_NODE_SIZE, FLST_NODE_SIZE};
use crate::mtr::{Mtr, WriteMode};
use crate::ut0ut::UT_BITS_IN_BYTES;

/// Offset of the space header within a file page.
pub const FSP_HEADER_OFFSET: u32 = fil0fil::FIL_PAGE_DATA;

/*			SPACE HEADER
            ============

File space header data structure: this data structure is contained in the
first page of a space. The space for this header is reserved in every extent
descriptor page, but used only in the first. */

/*-------------------------------------*/
/// space id
pub const FSP_SPACE_ID: u32 = 0;
/// this field contained a value up to which we know that the
/// modifications in the database have been flushed to the file space; not used now
pub const FSP_NOT_USED: u32 = 4;
/// Current size of the space in pages
pub const FSP_SIZE: u32 = 8;
/// Minimum page number for which the free list has not been
/// initialized: the pages >= this limit are, by definition, free
pub const FSP_FREE_LIMIT: u32 = 12;
/// tablespace flags
pub const FSP_SPACE_FLAGS: u32 = 16;
/// number of used pages in the FSP_FREE_FRAG list
pub const FSP_FRAG_N_USED: u32 = 20;
/// list of free extents
pub const FSP_FREE: u32 = 24;
/// list of partially free extents not belonging to any segment
pub const FSP_FREE_FRAG: u32 = 24 + FLST_BASE_NODE_SIZE;
/// list of full extents not belonging to any segment
pub const FSP_FULL_FRAG: u32 = 24 + 2 * FLST_BASE_NODE_SIZE;
/// 8 bytes which give the first unused segment id
pub const FSP_SEG_ID: u32 = 24 + 3 * FLST_BASE_NODE_SIZE;
/// list of pages containing segment headers, where all the segment inode
/// slots are reserved
pub const FSP_SEG_INODES_FULL: u32 = 32 + 3 * FLST_BASE_NODE_SIZE;
/// list of pages containing segment headers, where not all the segment
/// header slots are reserved
pub const FSP_SEG_INODES_FREE: u32 = 32 + 4 * FLST_BASE_NODE_SIZE;

/// File space header size
pub const FSP_HEADER_SIZE: u32 = 32 + 5 * FLST_BASE_NODE_SIZE;

/// this many free extents are added to the free list from above
/// FSP_FREE_LIMIT at a time
pub const FSP_FREE_ADD: u32 = 4;

/*			FILE SEGMENT INODE
            ==================

Segment inode which is created for each segment in a tablespace. NOTE: in
purge we assume that a segment having only one currently used page can be
freed in a few steps, so that the freeing cannot fill the file buffer with
bufferfixed file pages. */

/// the list node for linking segment inode pages
pub const FSEG_INODE_PAGE_NODE: u32 = fsp0types::FSEG_PAGE_DATA;

pub const FSEG_ARR_OFFSET: u32 = fsp0types::FSEG_PAGE_DATA + FLST_NODE_SIZE;

// -------------------------------------

/// 8 bytes of segment id: if this is 0, it means that the header is unused
pub const FSEG_ID: u32 = 0;
/// number of used segment pages in the FSEG_NOT_FULL list
pub const FSEG_NOT_FULL_N_USED: u32 = 8;
/// list of free extents of this segment
pub const FSEG_FREE: u32 = 12;
/// list of partially free extents
pub const FSEG_NOT_FULL: u32 = 12 + FLST_BASE_NODE_SIZE;
/// list of full extents
pub const FSEG_FULL: u32 = 12 + 2 * FLST_BASE_NODE_SIZE;
/// magic number used in debugging
pub const FSEG_MAGIC_N: u32 = 12 + 3 * FLST_BASE_NODE_SIZE;
/// array of individual pages belonging to this segment in fsp fragment
/// extent lists
pub const FSEG_FRAG_ARR: u32 = 16 + 3 * FLST_BASE_NODE_SIZE;
/// number of slots in the array for the fragment pages
#[allow(non_snake_case)]
pub const fn FSEG_FRAG_ARR_N_SLOTS(page_size_shift: u32) -> u32 {
    fsp0types::FSP_EXTENT_SIZE(page_size_shift) / 2
}
/// a fragment page slot contains its page number within space,
/// FIL_NULL means that the slot is not in use
pub const FSEG_FRAG_SLOT_SIZE: u32 = 4;
/*-------------------------------------*/
#[allow(non_snake_case)]
pub const fn FSEG_INODE_SIZE(page_size_shift: u32) -> u32 {
    16 + 3 * FLST_BASE_NODE_SIZE
        + FSEG_FRAG_ARR_N_SLOTS(page_size_shift) * FSEG_FRAG_SLOT_SIZE
}

pub const FSEG_MAGIC_N_VALUE: u32 = 97937874;

/// If the reserved size of a segment is at least this many extents, we
/// allow extents to be put to the free list of the extent: at most
/// FSEG_FREE_LIST_MAX_LEN many
pub const FSEG_FREE_LIST_LIMIT: u32 = 40;
pub const FSEG_FREE_LIST_MAX_LEN: u32 = 4;

/*			EXTENT DESCRIPTOR
            =================

File extent descriptor data structure: contains bits to tell which pages in
the extent are free and which contain old tuple version to clean. */

/*-------------------------------------*/
/// The identifier of the segment to which this extent belongs
pub const XDES_ID: u32 = 0;
/// The list node data structure for the descriptors
pub const XDES_FLST_NODE: u32 = 8;
/// contains state information of the extent
pub const XDES_STATE: u32 = FLST_NODE_SIZE + 8;
/// Descriptor bitmap of the pages in the extent
pub const XDES_BITMAP: u32 = FLST_NODE_SIZE + 12;
/*-------------------------------------*/

pub const XDES_BITS_PER_PAGE: u32 = 2; /* How many bits are there per page */
pub const XDES_FREE_BIT: u32 = 0; /* Index of the bit which tells if
the page is free */
pub const XDES_CLEAN_BIT: u32 = 1; /* NOTE: currently not used! */

/* States of a descriptor */
pub const XDES_NOT_INITED: u32 = 0; /* extent descriptor is not initialized */
pub const XDES_FREE: u32 = 1; /* extent is in free list of space */
pub const XDES_FREE_FRAG: u32 = 2; /* extent is in free fragment list of space */
pub const XDES_FULL_FRAG: u32 = 3; /* extent is in full fragment list of space */
pub const XDES_FSEG: u32 = 4; /* extent belongs to a segment */

/// File extent data structure size in bytes.
#[allow(non_snake_case)]
pub const fn XDES_SIZE(page_size_shift: u32) -> u32 {
    XDES_BITMAP
        + UT_BITS_IN_BYTES(fsp0types::FSP_EXTENT_SIZE(page_size_shift) * XDES_BITS_PER_PAGE)
}

/// Offset of the descriptor array on a descriptor page
pub const XDES_ARR_OFFSET: u32 = FSP_HEADER_OFFSET + FSP_HEADER_SIZE;

/// Allocation context: the buffer pool the space pages live in.
pub struct Fsp {
    pub pool: Arc<BufferPool>,
}

impl Fsp {
    pub fn new(pool: Arc<BufferPool>) -> Fsp {
        Fsp { pool }
    }
}

/// A latched extent descriptor: the page holding it plus the byte offset of
/// the descriptor entry.
#[derive(Clone)]
pub struct Xdes {
    pub block: Arc<Block>,
    pub offset: u32,
}

impl Xdes {
    /// Page number of the first page in the described extent.
    pub fn extent_page(&self, page_size_shift: u32) -> u32 {
        let index = (self.offset - XDES_ARR_OFFSET) / XDES_SIZE(page_size_shift);
        self.block.page_no + index * fsp0types::FSP_EXTENT_SIZE(page_size_shift)
    }

    pub fn state(&self) -> u32 {
        self.block.read_4(self.offset + XDES_STATE)
    }

    pub fn set_state(&self, mtr: &mut Mtr, state: u32) {
        mtr.write_4(&self.block, self.offset + XDES_STATE, state, WriteMode::MaybeNop);
    }

    pub fn id(&self) -> u64 {
        self.block.read_8(self.offset + XDES_ID)
    }

    pub fn set_id(&self, mtr: &mut Mtr, id: u64) {
        mtr.write_8(&self.block, self.offset + XDES_ID, id, WriteMode::MaybeNop);
    }

    pub fn is_free(&self, bit: u32) -> bool {
        let pos = bit * XDES_BITS_PER_PAGE + XDES_FREE_BIT;
        let byte = self.block.read_1(self.offset + XDES_BITMAP + pos / 8);
        byte & (1 << (pos % 8)) != 0
    }

    pub fn set_free(&self, mtr: &mut Mtr, bit: u32, free: bool) {
        let pos = bit * XDES_BITS_PER_PAGE + XDES_FREE_BIT;
        let ofs = self.offset + XDES_BITMAP + pos / 8;
        let byte = self.block.read_1(ofs);
        let new = if free {
            byte | (1 << (pos % 8))
        } else {
            byte & !(1 << (pos % 8))
        };
        mtr.write_1(&self.block, ofs, new, WriteMode::MaybeNop);
    }

    /// Find the smallest free bit >= hint, wrapping within the extent.
    pub fn find_free(&self, hint: u32, extent_size: u32) -> Option<u32> {
        for i in 0..extent_size {
            let bit = (hint + i) % extent_size;
            if self.is_free(bit) {
                return Some(bit);
            }
        }
        None
    }

    pub fn n_used(&self, extent_size: u32) -> u32 {
        (0..extent_size).filter(|&b| !self.is_free(b)).count() as u32
    }

    pub fn is_full(&self, extent_size: u32) -> bool {
        (0..extent_size).all(|b| !self.is_free(b))
    }

    pub fn is_empty(&self, extent_size: u32) -> bool {
        (0..extent_size).all(|b| self.is_free(b))
    }

    /// Initialize the descriptor: no owner, all pages free.
    pub fn init(&self, mtr: &mut Mtr, extent_size: u32) {
        self.set_id(mtr, 0);
        mtr.memset(
            &self.block,
            self.offset + XDES_BITMAP,
            UT_BITS_IN_BYTES(extent_size * XDES_BITS_PER_PAGE),
            0xff,
        );
        self.set_state(mtr, XDES_FREE);
    }

    fn flst_node(&self) -> u32 {
        self.offset + XDES_FLST_NODE
    }
}

/// Calculate the page number of the extent descriptor page describing
/// `offset`.
pub fn xdes_calc_descriptor_page(page_size_shift: u32, offset: u32) -> u32 {
    let per_page = 1u32 << page_size_shift;
    (offset / per_page) * per_page
}

/// Calculate the descriptor index on the descriptor page.
pub fn xdes_calc_descriptor_index(page_size_shift: u32, offset: u32) -> u32 {
    let per_page = 1u32 << page_size_shift;
    (offset % per_page) / fsp0types::FSP_EXTENT_SIZE(page_size_shift)
}

/// Get the tablespace header block (page 0), latched in the MTR.
pub fn fsp_get_header(fsp: &Fsp, space: &Arc<FilSpace>, mtr: &mut Mtr) -> DbResult<Arc<Block>> {
    debug_assert!(space.is_owner());
    let _ = mtr;
    let block = fsp
        .pool
        .get(space, 0, PageGet::Get)?
        .ok_or_else(|| DbErr::corruption("missing tablespace header page"))?;
    let ptype = block.page_type();
    if ptype != fil0fil::FIL_PAGE_TYPE_FSP_HDR && ptype != fil0fil::FIL_PAGE_TYPE_ALLOCATED {
        space.set_corrupted();
        return Err(DbErr::corruption(format!(
            "page 0 of space {} has type {ptype}, expected FSP_HDR",
            space.id
        )));
    }
    Ok(block)
}

/// Get the extent descriptor of the extent containing page `offset`.
/// Returns Corruption if the page is above the free limit (unless
/// `init_space`, during header initialization).
pub fn xdes_get_descriptor(
    fsp: &Fsp,
    space: &Arc<FilSpace>,
    header: &Arc<Block>,
    offset: u32,
    init_space: bool,
    mtr: &mut Mtr,
) -> DbResult<Xdes> {
    let shift = space.page_size_shift;
    let limit = header.read_4(FSP_HEADER_OFFSET + FSP_FREE_LIMIT);
    let size = header.read_4(FSP_HEADER_OFFSET + FSP_SIZE);
    if !init_space && (offset >= limit.max(1) || offset >= size) {
        space.set_corrupted();
        return Err(DbErr::corruption(format!(
            "page {offset} of space {} has no extent descriptor (limit {limit}, size {size})",
            space.id
        )));
    }
    let descr_page_no = xdes_calc_descriptor_page(shift, offset);
    let block = if descr_page_no == 0 {
        header.clone()
    } else {
        let block = fsp
            .pool
            .get(space, descr_page_no, PageGet::Get)?
            .ok_or_else(|| DbErr::corruption("missing descriptor page"))?;
        let ptype = block.page_type();
        if ptype != fil0fil::FIL_PAGE_TYPE_XDES && ptype != fil0fil::FIL_PAGE_TYPE_ALLOCATED {
            space.set_corrupted();
            return Err(DbErr::corruption(format!(
                "descriptor page {descr_page_no} of space {} has wrong type {ptype}",
                space.id
            )));
        }
        block
    };
    let _ = mtr;
    let index = xdes_calc_descriptor_index(shift, offset);
    Ok(Xdes {
        block,
        offset: XDES_ARR_OFFSET + index * XDES_SIZE(shift),
    })
}

/// Get a descriptor from a validated list node address.
pub fn xdes_lst_get_descriptor(
    fsp: &Fsp,
    space: &Arc<FilSpace>,
    addr: FilAddr,
    mtr: &mut Mtr,
) -> DbResult<Xdes> {
    let _ = mtr;
    let block = fsp
        .pool
        .get(space, addr.page, PageGet::Get)?
        .ok_or_else(|| DbErr::corruption("missing descriptor list page"))?;
    Ok(Xdes {
        block,
        offset: addr.boffset as u32 - XDES_FLST_NODE,
    })
}

/// Create a zero-initialized page in the buffer pool for an allocated page.
pub fn fsp_page_create(
    fsp: &Fsp,
    space: &Arc<FilSpace>,
    offset: u32,
    mtr: &mut Mtr,
) -> DbResult<Arc<Block>> {
    let block = fsp
        .pool
        .get(space, offset, PageGet::Create)?
        .expect("create always returns a block");
    mtr.init_page(&block);
    Ok(block)
}

/// Initialize the space header of a newly created tablespace and fill the
/// initial free list.
pub fn fsp_header_init(
    fsp: &Fsp,
    space: &Arc<FilSpace>,
    size: u32,
    mtr: &mut Mtr,
) -> DbResult<()> {
    mtr.x_lock_space(space);
    space.set_size(size);
    space.set_free_limit(0);
    space.free_len.store(0, Ordering::Relaxed);

    let block = fsp_page_create(fsp, space, 0, mtr)?;
    mtr.write_2(
        &block,
        fil0fil::FIL_PAGE_TYPE,
        fil0fil::FIL_PAGE_TYPE_FSP_HDR,
        WriteMode::MaybeNop,
    );

    mtr.write_4(
        &block,
        FSP_HEADER_OFFSET + FSP_SPACE_ID,
        space.id,
        WriteMode::MaybeNop,
    );
    // Recovery of the shrink path reads FSP_SIZE unconditionally, so the
    // write must always be covered by redo.
    mtr.write_4(&block, FSP_HEADER_OFFSET + FSP_SIZE, size, WriteMode::Forced);
    mtr.write_4(
        &block,
        FSP_HEADER_OFFSET + FSP_FREE_LIMIT,
        0,
        WriteMode::MaybeNop,
    );
    mtr.write_4(
        &block,
        FSP_HEADER_OFFSET + FSP_FRAG_N_USED,
        0,
        WriteMode::MaybeNop,
    );

    fut0lst::flst_init(mtr, &block, FSP_HEADER_OFFSET + FSP_FREE);
    fut0lst::flst_init(mtr, &block, FSP_HEADER_OFFSET + FSP_FREE_FRAG);
    fut0lst::flst_init(mtr, &block, FSP_HEADER_OFFSET + FSP_FULL_FRAG);
    fut0lst::flst_init(mtr, &block, FSP_HEADER_OFFSET + FSP_SEG_INODES_FULL);
    fut0lst::flst_init(mtr, &block, FSP_HEADER_OFFSET + FSP_SEG_INODES_FREE);

    mtr.write_8(&block, FSP_HEADER_OFFSET + FSP_SEG_ID, 1, WriteMode::MaybeNop);

    fsp_fill_free_list(fsp, true, space, &block, mtr)
}

/// Try to extend the last data file of a tablespace by whole extents.
/// Returns the number of pages added. The system tablespace size in the
/// header is kept rounded down to whole megabytes.
pub fn fsp_try_extend_data_file(
    fsp: &Fsp,
    space: &Arc<FilSpace>,
    header: &Arc<Block>,
    mtr: &mut Mtr,
) -> DbResult<u32> {
    let _ = fsp;
    let shift = space.page_size_shift;
    let extent_size = fsp0types::FSP_EXTENT_SIZE(shift);
    let size = space.size();
    let max = space.max_size_in_pages.load(Ordering::Relaxed);
    if size >= max {
        return Ok(0);
    }

    let mut new_size = size.saturating_add(FSP_FREE_ADD * extent_size).min(max);
    if space.id == fsp0types::TRX_SYS_SPACE {
        // Round the size in the header down to whole megabytes.
        let pages_per_mb = (1024 * 1024) >> shift;
        if pages_per_mb > 0 {
            new_size -= new_size % pages_per_mb;
        }
    }
    if new_size <= size {
        return Ok(0);
    }

    if let Some(node) = space.node.lock().unwrap().as_mut() {
        node.resize(new_size)
            .map_err(|e| DbErr::Io(std::io::Error::other(e.to_string())))?;
    }
    space.set_size(new_size);
    mtr.write_4(
        header,
        FSP_HEADER_OFFSET + FSP_SIZE,
        new_size,
        WriteMode::Forced,
    );
    Ok(new_size - size)
}

/// Extend the file by single pages; used for small single-table spaces
/// whose size is still below one extent.
pub fn fsp_try_extend_data_file_with_pages(
    space: &Arc<FilSpace>,
    page_no: u32,
    header: &Arc<Block>,
    mtr: &mut Mtr,
) -> DbResult<bool> {
    let size = space.size();
    debug_assert!(page_no >= size);
    let max = space.max_size_in_pages.load(Ordering::Relaxed);
    if page_no >= max {
        return Ok(false);
    }
    let new_size = page_no + 1;
    if let Some(node) = space.node.lock().unwrap().as_mut() {
        node.resize(new_size)
            .map_err(|e| DbErr::Io(std::io::Error::other(e.to_string())))?;
    }
    space.set_size(new_size);
    mtr.write_4(
        header,
        FSP_HEADER_OFFSET + FSP_SIZE,
        new_size,
        WriteMode::Forced,
    );
    Ok(true)
}

/// Put new extents to the free list, up to FSP_FREE_ADD at a time, from
/// above the free limit. When crossing a descriptor page boundary, the
/// descriptor page and the reserved page after it are accounted as used.
pub fn fsp_fill_free_list(
    fsp: &Fsp,
    init_space: bool,
    space: &Arc<FilSpace>,
    header: &Arc<Block>,
    mtr: &mut Mtr,
) -> DbResult<()> {
    debug_assert!(space.is_owner());
    let shift = space.page_size_shift;
    let extent_size = fsp0types::FSP_EXTENT_SIZE(shift);
    let physical_per_descr = 1u32 << shift;

    let mut size = header.read_4(FSP_HEADER_OFFSET + FSP_SIZE);
    let limit = header.read_4(FSP_HEADER_OFFSET + FSP_FREE_LIMIT);

    if size < limit + extent_size * FSP_FREE_ADD && !init_space {
        fsp_try_extend_data_file(fsp, space, header, mtr)?;
        size = space.size();
    }

    let mut count = 0u32;
    let mut i = limit;
    while (init_space && i < 1)
        || (!init_space && i + extent_size <= size && count < FSP_FREE_ADD)
    {
        let init_xdes = i % physical_per_descr == 0;
        space.set_free_limit(i + extent_size);
        mtr.write_4(
            header,
            FSP_HEADER_OFFSET + FSP_FREE_LIMIT,
            i + extent_size,
            WriteMode::MaybeNop,
        );

        if init_xdes && i > 0 {
            // Initialize a new descriptor page and the reserved page
            // following it; their prior contents are ignored.
            let block = fsp_page_create(fsp, space, i, mtr)?;
            mtr.write_2(
                &block,
                fil0fil::FIL_PAGE_TYPE,
                fil0fil::FIL_PAGE_TYPE_XDES,
                WriteMode::MaybeNop,
            );
            if !space.is_temporary {
                fsp_page_create(fsp, space, i + 1, mtr)?;
            }
        }

        let descr = xdes_get_descriptor(fsp, space, header, i, init_space, mtr)?;
        descr.init(mtr, extent_size);
        let limit_now = space.free_limit();

        if init_xdes {
            // The first page of the extent is the descriptor page itself
            // and the next one is reserved: mark them used.
            descr.set_free(mtr, 0, false);
            descr.set_free(mtr, 1, false);
            descr.set_state(mtr, XDES_FREE_FRAG);
            fut0lst::flst_add_last(
                mtr,
                &fsp.pool,
                space,
                header,
                FSP_HEADER_OFFSET + FSP_FREE_FRAG,
                &descr.block,
                descr.flst_node(),
                limit_now,
            )?;
            let n_used = header.read_4(FSP_HEADER_OFFSET + FSP_FRAG_N_USED);
            mtr.write_4(
                header,
                FSP_HEADER_OFFSET + FSP_FRAG_N_USED,
                n_used + 2,
                WriteMode::MaybeNop,
            );
        } else {
            fut0lst::flst_add_last(
                mtr,
                &fsp.pool,
                space,
                header,
                FSP_HEADER_OFFSET + FSP_FREE,
                &descr.block,
                descr.flst_node(),
                limit_now,
            )?;
            count += 1;
        }

        i += extent_size;
    }

    space.free_len.fetch_add(count, Ordering::Relaxed);
    Ok(())
}

/// Allocate a new free extent: either the hinted one if it is free, or the
/// head of the FSP_FREE list (filling the list from above the free limit if
/// needed).
pub fn fsp_alloc_free_extent(
    fsp: &Fsp,
    space: &Arc<FilSpace>,
    hint: u32,
    mtr: &mut Mtr,
) -> DbResult<Xdes> {
    let header = fsp_get_header(fsp, space, mtr)?;
    let limit = space.free_limit();
    let hint = if hint < limit { hint } else { 0 };
    let descr = xdes_get_descriptor(fsp, space, &header, hint, false, mtr)?;

    let descr = if descr.state() == XDES_FREE {
        descr
    } else {
        let mut first = fut0lst::flst_get_first(&header, FSP_HEADER_OFFSET + FSP_FREE, limit)
            .inspect_err(|_| space.set_corrupted())?;
        if first.is_null() {
            fsp_fill_free_list(fsp, false, space, &header, mtr)?;
            first = fut0lst::flst_get_first(
                &header,
                FSP_HEADER_OFFSET + FSP_FREE,
                space.free_limit(),
            )
            .inspect_err(|_| space.set_corrupted())?;
            if first.is_null() {
                return Err(DbErr::OutOfFileSpace);
            }
        }
        xdes_lst_get_descriptor(fsp, space, first, mtr)?
    };

    fut0lst::flst_remove(
        mtr,
        &fsp.pool,
        space,
        &header,
        FSP_HEADER_OFFSET + FSP_FREE,
        &descr.block,
        descr.flst_node(),
        space.free_limit(),
    )?;
    space.free_len.fetch_sub(1, Ordering::Relaxed);
    Ok(descr)
}

/// Allocate one page from a FREE_FRAG extent, moving the extent to
/// FULL_FRAG when it fills up.
fn fsp_alloc_from_free_frag(
    fsp: &Fsp,
    space: &Arc<FilSpace>,
    header: &Arc<Block>,
    descr: &Xdes,
    bit: u32,
    mtr: &mut Mtr,
) -> DbResult<()> {
    let extent_size = fsp0types::FSP_EXTENT_SIZE(space.page_size_shift);
    if descr.state() != XDES_FREE_FRAG || !descr.is_free(bit) {
        space.set_corrupted();
        return Err(DbErr::corruption("allocating a used fragment page"));
    }
    descr.set_free(mtr, bit, false);

    let mut n_used = header.read_4(FSP_HEADER_OFFSET + FSP_FRAG_N_USED) + 1;
    if descr.is_full(extent_size) {
        let limit = space.free_limit();
        fut0lst::flst_remove(
            mtr,
            &fsp.pool,
            space,
            header,
            FSP_HEADER_OFFSET + FSP_FREE_FRAG,
            &descr.block,
            descr.flst_node(),
            limit,
        )?;
        fut0lst::flst_add_last(
            mtr,
            &fsp.pool,
            space,
            header,
            FSP_HEADER_OFFSET + FSP_FULL_FRAG,
            &descr.block,
            descr.flst_node(),
            limit,
        )?;
        descr.set_state(mtr, XDES_FULL_FRAG);
        n_used -= extent_size;
    }
    mtr.write_4(
        header,
        FSP_HEADER_OFFSET + FSP_FRAG_N_USED,
        n_used,
        WriteMode::MaybeNop,
    );
    Ok(())
}

/// Allocate a single free page from the space. The page is marked used and
/// created zero-initialized in the buffer pool, in the same
/// mini-transaction.
pub fn fsp_alloc_free_page(
    fsp: &Fsp,
    space: &Arc<FilSpace>,
    hint: u32,
    mtr: &mut Mtr,
) -> DbResult<Arc<Block>> {
    debug_assert!(space.is_owner());
    let shift = space.page_size_shift;
    let extent_size = fsp0types::FSP_EXTENT_SIZE(shift);
    let header = fsp_get_header(fsp, space, mtr)?;

    let limit = space.free_limit();
    let hinted = if hint < limit {
        Some(xdes_get_descriptor(fsp, space, &header, hint, false, mtr)?)
    } else {
        None
    };

    let (descr, hint) = match hinted {
        Some(d) if d.state() == XDES_FREE_FRAG => (d, hint),
        _ => {
            let first =
                fut0lst::flst_get_first(&header, FSP_HEADER_OFFSET + FSP_FREE_FRAG, limit)
                    .inspect_err(|_| space.set_corrupted())?;
            if first.is_null() {
                // No partially full fragments: allocate a free extent and
                // add it to the FREE_FRAG list.
                let descr = fsp_alloc_free_extent(fsp, space, hint, mtr)?;
                fut0lst::flst_add_last(
                    mtr,
                    &fsp.pool,
                    space,
                    &header,
                    FSP_HEADER_OFFSET + FSP_FREE_FRAG,
                    &descr.block,
                    descr.flst_node(),
                    space.free_limit(),
                )?;
                descr.set_state(mtr, XDES_FREE_FRAG);
                (descr, hint)
            } else {
                (xdes_lst_get_descriptor(fsp, space, first, mtr)?, 0)
            }
        }
    };

    let free = descr
        .find_free(hint % extent_size, extent_size)
        .ok_or_else(|| {
            space.set_corrupted();
            DbErr::corruption("free-frag extent has no free page")
        })?;
    let page_no = descr.extent_page(shift) + free;

    let space_size = header.read_4(FSP_HEADER_OFFSET + FSP_SIZE);
    if page_no >= space_size {
        // It must be that we are extending a single-table tablespace whose
        // size is still below one extent.
        if space.id == fsp0types::TRX_SYS_SPACE || page_no >= extent_size {
            space.set_corrupted();
            return Err(DbErr::corruption(format!(
                "allocated page {page_no} beyond space size {space_size}"
            )));
        }
        if !fsp_try_extend_data_file_with_pages(space, page_no, &header, mtr)? {
            return Err(DbErr::OutOfFileSpace);
        }
    }

    fsp_alloc_from_free_frag(fsp, space, &header, &descr, free, mtr)?;
    fsp_page_create(fsp, space, page_no, mtr)
}

/// Return an extent to the FSP_FREE list.
pub fn fsp_free_extent(
    fsp: &Fsp,
    space: &Arc<FilSpace>,
    offset: u32,
    mtr: &mut Mtr,
) -> DbResult<()> {
    debug_assert!(space.is_owner());
    let header = fsp_get_header(fsp, space, mtr)?;
    let descr = xdes_get_descriptor(fsp, space, &header, offset, false, mtr)?;
    if descr.state() == XDES_FREE {
        space.set_corrupted();
        return Err(DbErr::corruption("freeing an already free extent"));
    }
    let extent_size = fsp0types::FSP_EXTENT_SIZE(space.page_size_shift);
    descr.init(mtr, extent_size);
    space.free_len.fetch_add(1, Ordering::Relaxed);
    fut0lst::flst_add_last(
        mtr,
        &fsp.pool,
        space,
        &header,
        FSP_HEADER_OFFSET + FSP_FREE,
        &descr.block,
        descr.flst_node(),
        space.free_limit(),
    )
}

/// Free a single page of the space (a fragment page).
pub fn fsp_free_page(
    fsp: &Fsp,
    space: &Arc<FilSpace>,
    offset: u32,
    mtr: &mut Mtr,
) -> DbResult<()> {
    debug_assert!(space.is_owner());
    let extent_size = fsp0types::FSP_EXTENT_SIZE(space.page_size_shift);
    let header = fsp_get_header(fsp, space, mtr)?;
    let descr = xdes_get_descriptor(fsp, space, &header, offset, false, mtr)?;

    let state = descr.state();
    match state {
        XDES_FREE_FRAG | XDES_FULL_FRAG => {
            if descr.is_free(offset % extent_size) {
                space.set_corrupted();
                return Err(DbErr::corruption("double free of a fragment page"));
            }
        }
        _ => {
            space.set_corrupted();
            return Err(DbErr::corruption(format!(
                "freeing page {offset} in an extent with state {state}"
            )));
        }
    }

    let frag_n_used = header.read_4(FSP_HEADER_OFFSET + FSP_FRAG_N_USED);
    let limit = space.free_limit();
    if state == XDES_FULL_FRAG {
        // The fragment was full: move it back to FREE_FRAG.
        fut0lst::flst_remove(
            mtr,
            &fsp.pool,
            space,
            &header,
            FSP_HEADER_OFFSET + FSP_FULL_FRAG,
            &descr.block,
            descr.flst_node(),
            limit,
        )?;
        fut0lst::flst_add_last(
            mtr,
            &fsp.pool,
            space,
            &header,
            FSP_HEADER_OFFSET + FSP_FREE_FRAG,
            &descr.block,
            descr.flst_node(),
            limit,
        )?;
        descr.set_state(mtr, XDES_FREE_FRAG);
        mtr.write_4(
            &header,
            FSP_HEADER_OFFSET + FSP_FRAG_N_USED,
            frag_n_used + extent_size - 1,
            WriteMode::MaybeNop,
        );
    } else if frag_n_used == 0 {
        space.set_corrupted();
        return Err(DbErr::corruption("FRAG_N_USED underflow"));
    } else {
        mtr.write_4(
            &header,
            FSP_HEADER_OFFSET + FSP_FRAG_N_USED,
            frag_n_used - 1,
            WriteMode::MaybeNop,
        );
    }

    mtr.free_page(space.id, offset);
    fsp.pool.evict(space.id, offset);
    descr.set_free(mtr, offset % extent_size, true);

    if descr.n_used(extent_size) == 0 {
        // The extent has become wholly free: return it to the space.
        fut0lst::flst_remove(
            mtr,
            &fsp.pool,
            space,
            &header,
            FSP_HEADER_OFFSET + FSP_FREE_FRAG,
            &descr.block,
            descr.flst_node(),
            limit,
        )?;
        fsp_free_extent(fsp, space, offset, mtr)?;
    }
    Ok(())
}

/*			SEGMENT INODES
            ============== */

/// A latched segment inode: the inode page plus the byte offset of the
/// 192-byte inode record.
#[derive(Clone)]
pub struct Inode {
    pub block: Arc<Block>,
    pub offset: u32,
}

impl Inode {
    pub fn addr(&self) -> FilAddr {
        FilAddr {
            page: self.block.page_no,
            boffset: self.offset as u16,
        }
    }

    pub fn seg_id(&self) -> u64 {
        self.block.read_8(self.offset + FSEG_ID)
    }

    pub fn check_magic(&self) -> DbResult<()> {
        if self.block.read_4(self.offset + FSEG_MAGIC_N) != FSEG_MAGIC_N_VALUE {
            return Err(DbErr::corruption(format!(
                "bad segment inode magic at page {} offset {}",
                self.block.page_no, self.offset
            )));
        }
        Ok(())
    }

    pub fn not_full_n_used(&self) -> u32 {
        self.block.read_4(self.offset + FSEG_NOT_FULL_N_USED)
    }

    fn set_not_full_n_used(&self, mtr: &mut Mtr, n: u32) {
        mtr.write_4(
            &self.block,
            self.offset + FSEG_NOT_FULL_N_USED,
            n,
            WriteMode::MaybeNop,
        );
    }

    fn frag_slot_offset(&self, n: u32) -> u32 {
        self.offset + FSEG_FRAG_ARR + n * FSEG_FRAG_SLOT_SIZE
    }

    pub fn frag_page_no(&self, n: u32) -> u32 {
        self.block.read_4(self.frag_slot_offset(n))
    }

    fn set_frag_page_no(&self, mtr: &mut Mtr, n: u32, page_no: u32) {
        mtr.write_4(&self.block, self.frag_slot_offset(n), page_no, WriteMode::MaybeNop);
    }

    /// Find a free fragment page slot.
    pub fn find_free_frag_slot(&self, n_slots: u32) -> Option<u32> {
        (0..n_slots).find(|&i| self.frag_page_no(i) == FIL_NULL)
    }

    /// Find the last used fragment page slot.
    pub fn find_last_used_frag_slot(&self, n_slots: u32) -> Option<u32> {
        (0..n_slots).rev().find(|&i| self.frag_page_no(i) != FIL_NULL)
    }

    pub fn n_frag_pages(&self, n_slots: u32) -> u32 {
        (0..n_slots).filter(|&i| self.frag_page_no(i) != FIL_NULL).count() as u32
    }
}

/// Find a used inode slot on an inode page; start looking from slot `from`.
fn fsp_seg_inode_page_find_used(
    block: &Arc<Block>,
    from: u32,
    shift: u32,
    physical_size: u32,
) -> Option<u32> {
    let inode_size = FSEG_INODE_SIZE(shift);
    let n_slots = (physical_size - FSEG_ARR_OFFSET - fil0fil::FIL_PAGE_DATA_END) / inode_size;
    (from..n_slots).find(|&i| block.read_8(FSEG_ARR_OFFSET + i * inode_size + FSEG_ID) != 0)
}

fn fsp_seg_inode_page_find_free(
    block: &Arc<Block>,
    shift: u32,
    physical_size: u32,
) -> Option<u32> {
    let inode_size = FSEG_INODE_SIZE(shift);
    let n_slots = (physical_size - FSEG_ARR_OFFSET - fil0fil::FIL_PAGE_DATA_END) / inode_size;
    (0..n_slots).find(|&i| block.read_8(FSEG_ARR_OFFSET + i * inode_size + FSEG_ID) == 0)
}

/// Allocate a new inode page and put it to the SEG_INODES_FREE list.
fn fsp_alloc_seg_inode_page(
    fsp: &Fsp,
    space: &Arc<FilSpace>,
    header: &Arc<Block>,
    mtr: &mut Mtr,
) -> DbResult<()> {
    let block = fsp_alloc_free_page(fsp, space, 0, mtr)?;
    mtr.write_2(
        &block,
        fil0fil::FIL_PAGE_TYPE,
        fil0fil::FIL_PAGE_INODE,
        WriteMode::MaybeNop,
    );
    fut0lst::flst_add_last(
        mtr,
        &fsp.pool,
        space,
        header,
        FSP_HEADER_OFFSET + FSP_SEG_INODES_FREE,
        &block,
        FSEG_INODE_PAGE_NODE,
        space.free_limit(),
    )
}

/// Allocate a new segment inode slot.
fn fsp_alloc_seg_inode(
    fsp: &Fsp,
    space: &Arc<FilSpace>,
    header: &Arc<Block>,
    mtr: &mut Mtr,
) -> DbResult<Inode> {
    let shift = space.page_size_shift;
    let physical_size = space.physical_size();

    let mut first = fut0lst::flst_get_first(
        header,
        FSP_HEADER_OFFSET + FSP_SEG_INODES_FREE,
        space.free_limit(),
    )?;
    if first.is_null() {
        fsp_alloc_seg_inode_page(fsp, space, header, mtr)?;
        first = fut0lst::flst_get_first(
            header,
            FSP_HEADER_OFFSET + FSP_SEG_INODES_FREE,
            space.free_limit(),
        )?;
        if first.is_null() {
            return Err(DbErr::OutOfFileSpace);
        }
    }

    let block = fsp
        .pool
        .get(space, first.page, PageGet::Get)?
        .ok_or_else(|| DbErr::corruption("missing inode page"))?;
    if block.page_type() != fil0fil::FIL_PAGE_INODE {
        space.set_corrupted();
        return Err(DbErr::corruption("wrong inode page type"));
    }

    let inode_size = FSEG_INODE_SIZE(shift);
    let n_slots = (physical_size - FSEG_ARR_OFFSET - fil0fil::FIL_PAGE_DATA_END) / inode_size;
    let slot = fsp_seg_inode_page_find_free(&block, shift, physical_size).ok_or_else(|| {
        space.set_corrupted();
        DbErr::corruption("inode page on free list has no free slot")
    })?;
    let offset = FSEG_ARR_OFFSET + slot * inode_size;

    let used: u32 = (0..n_slots)
        .filter(|&i| block.read_8(FSEG_ARR_OFFSET + i * inode_size + FSEG_ID) != 0)
        .count() as u32;
    if used + 1 == n_slots {
        // The caller takes the last free slot: move the page to the FULL
        // list.
        fut0lst::flst_remove(
            mtr,
            &fsp.pool,
            space,
            header,
            FSP_HEADER_OFFSET + FSP_SEG_INODES_FREE,
            &block,
            FSEG_INODE_PAGE_NODE,
            space.free_limit(),
        )?;
        fut0lst::flst_add_last(
            mtr,
            &fsp.pool,
            space,
            header,
            FSP_HEADER_OFFSET + FSP_SEG_INODES_FULL,
            &block,
            FSEG_INODE_PAGE_NODE,
            space.free_limit(),
        )?;
    }

    Ok(Inode { block, offset })
}

/// Release a segment inode slot; the inode page is freed when it carries no
/// more used slots.
fn fsp_free_seg_inode(
    fsp: &Fsp,
    space: &Arc<FilSpace>,
    inode: &Inode,
    mtr: &mut Mtr,
) -> DbResult<()> {
    let shift = space.page_size_shift;
    let physical_size = space.physical_size();
    let header = fsp_get_header(fsp, space, mtr)?;
    let block = &inode.block;

    if fsp_seg_inode_page_find_free(block, shift, physical_size).is_none() {
        // There is now a free slot on the page again: move it back.
        fut0lst::flst_remove(
            mtr,
            &fsp.pool,
            space,
            &header,
            FSP_HEADER_OFFSET + FSP_SEG_INODES_FULL,
            block,
            FSEG_INODE_PAGE_NODE,
            space.free_limit(),
        )?;
        fut0lst::flst_add_last(
            mtr,
            &fsp.pool,
            space,
            &header,
            FSP_HEADER_OFFSET + FSP_SEG_INODES_FREE,
            block,
            FSEG_INODE_PAGE_NODE,
            space.free_limit(),
        )?;
    }

    inode.check_magic()?;
    mtr.write_8(block, inode.offset + FSEG_ID, 0, WriteMode::MaybeNop);
    mtr.write_4(block, inode.offset + FSEG_MAGIC_N, 0xfa051ce3, WriteMode::MaybeNop);

    if fsp_seg_inode_page_find_used(block, 0, shift, physical_size).is_none() {
        // No other used slots: free the inode page itself.
        fut0lst::flst_remove(
            mtr,
            &fsp.pool,
            space,
            &header,
            FSP_HEADER_OFFSET + FSP_SEG_INODES_FREE,
            block,
            FSEG_INODE_PAGE_NODE,
            space.free_limit(),
        )?;
        fsp_free_page(fsp, space, block.page_no, mtr)?;
    }
    Ok(())
}

/// Look up the inode a segment header points at.
pub fn fseg_inode_try_get(
    fsp: &Fsp,
    space: &Arc<FilSpace>,
    seg_header_block: &Arc<Block>,
    seg_header_offset: u32,
    mtr: &mut Mtr,
) -> DbResult<Inode> {
    let _ = mtr;
    let hdr_space =
        seg_header_block.read_4(seg_header_offset + fsp0types::FSEG_HDR_SPACE);
    if hdr_space != space.id {
        space.set_corrupted();
        return Err(DbErr::corruption("segment header names a foreign space"));
    }
    let page_no = seg_header_block.read_4(seg_header_offset + fsp0types::FSEG_HDR_PAGE_NO);
    let boffset =
        seg_header_block.read_2(seg_header_offset + fsp0types::FSEG_HDR_OFFSET) as u32;
    let block = fsp
        .pool
        .get(space, page_no, PageGet::Get)?
        .ok_or_else(|| DbErr::corruption("missing inode page"))?;
    let inode = Inode {
        block,
        offset: boffset,
    };
    if inode.seg_id() == 0 {
        space.set_corrupted();
        return Err(DbErr::corruption("segment header points at a free inode"));
    }
    inode.check_magic().inspect_err(|_| space.set_corrupted())?;
    Ok(inode)
}

/// Create a new segment. Allocates the inode and the first (header) page of
/// the segment, and writes the segment header at `byte_offset` on that page.
/// Returns the header page block.
pub fn fseg_create(
    fsp: &Fsp,
    space: &Arc<FilSpace>,
    byte_offset: u32,
    mtr: &mut Mtr,
) -> DbResult<Arc<Block>> {
    mtr.x_lock_space(space);
    let shift = space.page_size_shift;
    let n_slots = FSEG_FRAG_ARR_N_SLOTS(shift);
    let header = fsp_get_header(fsp, space, mtr)?;

    let (n_reserved, _) =
        fsp_reserve_free_extents(fsp, space, 2, FspReserve::Normal, mtr)?;

    let result = (|| {
        let inode = fsp_alloc_seg_inode(fsp, space, &header, mtr)?;

        let seg_id = header.read_8(FSP_HEADER_OFFSET + FSP_SEG_ID);
        mtr.write_8(&header, FSP_HEADER_OFFSET + FSP_SEG_ID, seg_id + 1, WriteMode::MaybeNop);
        mtr.write_8(&inode.block, inode.offset + FSEG_ID, seg_id, WriteMode::MaybeNop);
        inode.set_not_full_n_used(mtr, 0);

        fut0lst::flst_init(mtr, &inode.block, inode.offset + FSEG_FREE);
        fut0lst::flst_init(mtr, &inode.block, inode.offset + FSEG_NOT_FULL);
        fut0lst::flst_init(mtr, &inode.block, inode.offset + FSEG_FULL);

        mtr.write_4(
            &inode.block,
            inode.offset + FSEG_MAGIC_N,
            FSEG_MAGIC_N_VALUE,
            WriteMode::MaybeNop,
        );
        for i in 0..n_slots {
            inode.set_frag_page_no(mtr, i, FIL_NULL);
        }

        let block = fseg_alloc_free_page_low(fsp, space, &inode, 0, true, mtr)?;
        mtr.write_4(
            &block,
            byte_offset + fsp0types::FSEG_HDR_SPACE,
            space.id,
            WriteMode::MaybeNop,
        );
        mtr.write_4(
            &block,
            byte_offset + fsp0types::FSEG_HDR_PAGE_NO,
            inode.block.page_no,
            WriteMode::MaybeNop,
        );
        mtr.write_2(
            &block,
            byte_offset + fsp0types::FSEG_HDR_OFFSET,
            inode.offset as u16,
            WriteMode::MaybeNop,
        );
        Ok(block)
    })();

    space.release_free_extents(n_reserved);
    result
}

/// Number of pages reserved by a segment, and how many of them are used.
pub fn fseg_n_reserved_pages(
    space: &Arc<FilSpace>,
    inode: &Inode,
) -> (u32, u32) {
    let shift = space.page_size_shift;
    let extent_size = fsp0types::FSP_EXTENT_SIZE(shift);
    let n_slots = FSEG_FRAG_ARR_N_SLOTS(shift);
    let n_frag = inode.n_frag_pages(n_slots);
    let free_len = fut0lst::flst_get_len(&inode.block, inode.offset + FSEG_FREE);
    let not_full_len = fut0lst::flst_get_len(&inode.block, inode.offset + FSEG_NOT_FULL);
    let full_len = fut0lst::flst_get_len(&inode.block, inode.offset + FSEG_FULL);
    let reserved = n_frag + extent_size * (free_len + not_full_len + full_len);
    let used = n_frag + inode.not_full_n_used() + extent_size * full_len;
    (reserved, used)
}

/// Allocate a free extent for the segment: hinted if free, else from the
/// space, stamping the segment id and attaching it to the FSEG_FREE list.
fn fseg_alloc_free_extent(
    fsp: &Fsp,
    space: &Arc<FilSpace>,
    inode: &Inode,
    hint: u32,
    mtr: &mut Mtr,
) -> DbResult<Xdes> {
    let descr = fsp_alloc_free_extent(fsp, space, hint, mtr)?;
    descr.set_id(mtr, inode.seg_id());
    descr.set_state(mtr, XDES_FSEG);
    fut0lst::flst_add_last(
        mtr,
        &fsp.pool,
        space,
        &inode.block,
        inode.offset + FSEG_FREE,
        &descr.block,
        descr.flst_node(),
        space.free_limit(),
    )?;
    fseg_fill_free_list(
        fsp,
        space,
        inode,
        descr.extent_page(space.page_size_shift)
            + fsp0types::FSP_EXTENT_SIZE(space.page_size_shift),
        mtr,
    )?;
    Ok(descr)
}

/// Pre-fill the segment free list when the segment has grown big enough,
/// adding up to FSEG_FREE_LIST_MAX_LEN extents.
fn fseg_fill_free_list(
    fsp: &Fsp,
    space: &Arc<FilSpace>,
    inode: &Inode,
    hint: u32,
    mtr: &mut Mtr,
) -> DbResult<()> {
    let extent_size = fsp0types::FSP_EXTENT_SIZE(space.page_size_shift);
    let (reserved, used) = fseg_n_reserved_pages(space, inode);
    if reserved < extent_size * FSEG_FREE_LIST_LIMIT {
        return Ok(());
    }
    if used < reserved {
        // The segment already has spare pages.
        return Ok(());
    }
    let mut hint = hint;
    for _ in 0..FSEG_FREE_LIST_MAX_LEN {
        let descr = match fsp_alloc_free_extent(fsp, space, hint, mtr) {
            Ok(d) => d,
            Err(DbErr::OutOfFileSpace) => return Ok(()),
            Err(e) => return Err(e),
        };
        descr.set_id(mtr, inode.seg_id());
        descr.set_state(mtr, XDES_FSEG);
        fut0lst::flst_add_last(
            mtr,
            &fsp.pool,
            space,
            &inode.block,
            inode.offset + FSEG_FREE,
            &descr.block,
            descr.flst_node(),
            space.free_limit(),
        )?;
        hint = descr.extent_page(space.page_size_shift) + extent_size;
    }
    Ok(())
}

/// Mark a page used in a segment extent, keeping NOT_FULL_N_USED and the
/// FREE / NOT_FULL / FULL lists consistent.
fn fseg_mark_page_used(
    fsp: &Fsp,
    space: &Arc<FilSpace>,
    inode: &Inode,
    page_no: u32,
    descr: &Xdes,
    mtr: &mut Mtr,
) -> DbResult<()> {
    let extent_size = fsp0types::FSP_EXTENT_SIZE(space.page_size_shift);
    if descr.id() != inode.seg_id() {
        space.set_corrupted();
        return Err(DbErr::corruption("marking a page used in a foreign extent"));
    }
    let limit = space.free_limit();

    if descr.n_used(extent_size) == 0 {
        // The extent moves from FREE to NOT_FULL as its first page is used.
        fut0lst::flst_remove(
            mtr,
            &fsp.pool,
            space,
            &inode.block,
            inode.offset + FSEG_FREE,
            &descr.block,
            descr.flst_node(),
            limit,
        )?;
        fut0lst::flst_add_last(
            mtr,
            &fsp.pool,
            space,
            &inode.block,
            inode.offset + FSEG_NOT_FULL,
            &descr.block,
            descr.flst_node(),
            limit,
        )?;
    }

    if !descr.is_free(page_no % extent_size) {
        space.set_corrupted();
        return Err(DbErr::corruption("page already marked used"));
    }
    descr.set_free(mtr, page_no % extent_size, false);
    let n_used = inode.not_full_n_used() + 1;
    inode.set_not_full_n_used(mtr, n_used);

    if descr.is_full(extent_size) {
        // The extent is now full: move it to FSEG_FULL.
        fut0lst::flst_remove(
            mtr,
            &fsp.pool,
            space,
            &inode.block,
            inode.offset + FSEG_NOT_FULL,
            &descr.block,
            descr.flst_node(),
            limit,
        )?;
        fut0lst::flst_add_last(
            mtr,
            &fsp.pool,
            space,
            &inode.block,
            inode.offset + FSEG_FULL,
            &descr.block,
            descr.flst_node(),
            limit,
        )?;
        inode.set_not_full_n_used(mtr, n_used - extent_size);
    }
    Ok(())
}

/// Allocate a page for a segment, minimizing fragmentation.
///
/// With R = pages reserved by the segment and U = pages used, the policy:
/// 1. hinted page is free in a segment-owned extent: take it;
/// 2. the hinted extent is segment-owned and not full: take its first free;
/// 3. U >= EXTENT/2 and few spare pages: give the segment a whole extent
///    (the hinted one if free) and take the hinted/first page;
/// 4. R > U: take from NOT_FULL, then FREE;
/// 5. U < EXTENT/2: take an independent fragment page;
/// 6. otherwise allocate a new extent and take its first page.
pub fn fseg_alloc_free_page_low(
    fsp: &Fsp,
    space: &Arc<FilSpace>,
    inode: &Inode,
    hint: u32,
    has_done_reservation: bool,
    mtr: &mut Mtr,
) -> DbResult<Arc<Block>> {
    debug_assert!(space.is_owner());
    let shift = space.page_size_shift;
    let extent_size = fsp0types::FSP_EXTENT_SIZE(shift);
    let n_slots = FSEG_FRAG_ARR_N_SLOTS(shift);
    inode.check_magic().inspect_err(|_| space.set_corrupted())?;
    let seg_id = inode.seg_id();
    if seg_id == 0 {
        space.set_corrupted();
        return Err(DbErr::corruption("allocating from a free inode"));
    }

    let header = fsp_get_header(fsp, space, mtr)?;
    let (reserved, used) = fseg_n_reserved_pages(space, inode);

    let hinted_descr = if hint < space.free_limit() {
        Some(xdes_get_descriptor(fsp, space, &header, hint, false, mtr)?)
    } else {
        None
    };

    let take_hinted = hinted_descr
        .as_ref()
        .is_some_and(|d| {
            d.state() == XDES_FSEG && d.id() == seg_id && d.is_free(hint % extent_size)
        });

    let ret_page: u32;
    let ret_descr: Xdes;

    if let (true, Some(descr)) = (take_hinted, hinted_descr.as_ref()) {
        // 1. The hinted page itself is free in our own extent.
        ret_descr = descr.clone();
        ret_page = hint;
    } else if let Some(descr) = hinted_descr.as_ref().filter(|d| {
        d.state() == XDES_FSEG && d.id() == seg_id && !d.is_full(extent_size)
    }) {
        // 2. Our own hinted extent has room: take its first free page.
        let bit = descr.find_free(hint % extent_size, extent_size).unwrap();
        ret_descr = descr.clone();
        ret_page = descr.extent_page(shift) + bit;
    } else if used >= extent_size / 2
        && reserved - used < (reserved / 8).max(4 * extent_size)
    {
        // 3. The segment is big and has few spare pages: reserve a whole
        // new extent.
        if let Some(descr) = hinted_descr.as_ref().filter(|d| d.state() == XDES_FREE) {
            // 3a. The hinted extent itself is free: grab it.
            let header_descr = fsp_alloc_free_extent(fsp, space, hint, mtr)?;
            debug_assert_eq!(header_descr.extent_page(shift), descr.extent_page(shift));
            header_descr.set_id(mtr, seg_id);
            header_descr.set_state(mtr, XDES_FSEG);
            fut0lst::flst_add_last(
                mtr,
                &fsp.pool,
                space,
                &inode.block,
                inode.offset + FSEG_FREE,
                &header_descr.block,
                header_descr.flst_node(),
                space.free_limit(),
            )?;
            ret_page = hint;
            ret_descr = header_descr;
        } else {
            let descr = fseg_alloc_free_extent(fsp, space, inode, hint, mtr)?;
            ret_page = descr.extent_page(shift);
            ret_descr = descr;
        }
    } else if reserved > used {
        // 4. Take a page from one of the segment's own extents.
        let limit = space.free_limit();
        let not_full =
            fut0lst::flst_get_first(&inode.block, inode.offset + FSEG_NOT_FULL, limit)?;
        let addr = if !not_full.is_null() {
            not_full
        } else {
            fut0lst::flst_get_first(&inode.block, inode.offset + FSEG_FREE, limit)?
        };
        if addr.is_null() {
            space.set_corrupted();
            return Err(DbErr::corruption(
                "segment reserves more pages than its lists hold",
            ));
        }
        let descr = xdes_lst_get_descriptor(fsp, space, addr, mtr)?;
        let bit = descr.find_free(0, extent_size).ok_or_else(|| {
            space.set_corrupted();
            DbErr::corruption("NOT_FULL extent has no free page")
        })?;
        ret_page = descr.extent_page(shift) + bit;
        ret_descr = descr;
    } else if used < extent_size / 2 {
        // 5. The segment is small: allocate an independent fragment page.
        let slot = inode.find_free_frag_slot(n_slots).ok_or_else(|| {
            space.set_corrupted();
            DbErr::corruption("fragment array full for a small segment")
        })?;
        let block = fsp_alloc_free_page(fsp, space, hint, mtr)?;
        inode.set_frag_page_no(mtr, slot, block.page_no);
        return Ok(block);
    } else {
        // 6. Allocate a new extent for the segment.
        let descr = fseg_alloc_free_extent(fsp, space, inode, hint, mtr)?;
        ret_page = descr.extent_page(shift);
        ret_descr = descr;
    }

    if ret_page >= space.size() {
        if !has_done_reservation
            && !fsp_try_extend_data_file_with_pages(space, ret_page, &header, mtr)?
        {
            return Err(DbErr::OutOfFileSpace);
        }
    }

    fseg_mark_page_used(fsp, space, inode, ret_page, &ret_descr, mtr)?;
    fsp_page_create(fsp, space, ret_page, mtr)
}

/// Allocate a page for the segment whose header is at
/// (seg_header_block, seg_header_offset), reserving free space first if the
/// caller has not.
pub fn fseg_alloc_free_page_general(
    fsp: &Fsp,
    space: &Arc<FilSpace>,
    seg_header_block: &Arc<Block>,
    seg_header_offset: u32,
    hint: u32,
    has_done_reservation: bool,
    mtr: &mut Mtr,
) -> DbResult<Arc<Block>> {
    mtr.x_lock_space(space);
    let inode = fseg_inode_try_get(fsp, space, seg_header_block, seg_header_offset, mtr)?;
    let mut n_reserved = 0;
    if !has_done_reservation {
        (n_reserved, _) = fsp_reserve_free_extents(fsp, space, 1, FspReserve::Normal, mtr)?;
    }
    let result = fseg_alloc_free_page_low(fsp, space, &inode, hint, has_done_reservation, mtr);
    if n_reserved > 0 {
        space.release_free_extents(n_reserved);
    }
    result
}

/// Reserve free extents for a multi-page operation so that it cannot run
/// out of space midway. Returns (number reserved, pages added by a file
/// extension, if any).
pub fn fsp_reserve_free_extents(
    fsp: &Fsp,
    space: &Arc<FilSpace>,
    n_ext: u32,
    alloc_type: FspReserve,
    mtr: &mut Mtr,
) -> DbResult<(u32, u32)> {
    mtr.x_lock_space(space);
    let shift = space.page_size_shift;
    let extent_size = fsp0types::FSP_EXTENT_SIZE(shift);
    let header = fsp_get_header(fsp, space, mtr)?;
    let mut extended = 0u32;

    for attempt in 0..2 {
        let size = header.read_4(FSP_HEADER_OFFSET + FSP_SIZE);
        if size < extent_size && n_ext <= 2 {
            // A tiny single-table space: no extent bookkeeping yet.
            space.n_reserved_extents.fetch_add(n_ext, Ordering::Relaxed);
            return Ok((n_ext, extended));
        }

        let n_free_list_ext = fut0lst::flst_get_len(&header, FSP_HEADER_OFFSET + FSP_FREE);
        let free_limit = header.read_4(FSP_HEADER_OFFSET + FSP_FREE_LIMIT);
        // Extents above the free limit, minus the descriptor pages that
        // will be carved out of them.
        let n_free_up = if size > free_limit {
            let mut up = (size - free_limit) / extent_size;
            if up > 0 {
                up -= up / ((1u32 << shift) / extent_size).max(1);
            }
            up
        } else {
            0
        };
        let n_free = (n_free_list_ext + n_free_up)
            .saturating_sub(space.n_reserved_extents.load(Ordering::Relaxed));

        let reserve = match alloc_type {
            FspReserve::Normal => 2 + (size / extent_size) / 100 + n_ext,
            FspReserve::Undo => 1 + size / 200 / extent_size.max(1) + n_ext,
            FspReserve::Cleaning | FspReserve::Blob => n_ext,
        };

        if n_free > reserve {
            space.n_reserved_extents.fetch_add(n_ext, Ordering::Relaxed);
            return Ok((n_ext, extended));
        }

        if attempt == 0 {
            extended = fsp_try_extend_data_file(fsp, space, &header, mtr)?;
            if extended == 0 {
                break;
            }
        }
    }
    Err(DbErr::OutOfFileSpace)
}

/// Free a page that belongs to a segment.
fn fseg_free_page_low(
    fsp: &Fsp,
    space: &Arc<FilSpace>,
    inode: &Inode,
    page_no: u32,
    mtr: &mut Mtr,
) -> DbResult<()> {
    let shift = space.page_size_shift;
    let extent_size = fsp0types::FSP_EXTENT_SIZE(shift);
    let n_slots = FSEG_FRAG_ARR_N_SLOTS(shift);
    inode.check_magic().inspect_err(|_| space.set_corrupted())?;

    let header = fsp_get_header(fsp, space, mtr)?;
    let descr = xdes_get_descriptor(fsp, space, &header, page_no, false, mtr)?;

    if descr.is_free(page_no % extent_size) {
        space.set_corrupted();
        return Err(DbErr::corruption(format!(
            "freeing an already free page {page_no}"
        )));
    }

    if descr.state() != XDES_FSEG {
        // The page is a fragment page of the segment.
        let slot = (0..n_slots)
            .find(|&i| inode.frag_page_no(i) == page_no)
            .ok_or_else(|| {
                space.set_corrupted();
                DbErr::corruption(format!("page {page_no} not in the fragment array"))
            })?;
        inode.set_frag_page_no(mtr, slot, FIL_NULL);
        return fsp_free_page(fsp, space, page_no, mtr);
    }

    if descr.id() != inode.seg_id() {
        space.set_corrupted();
        return Err(DbErr::corruption(format!(
            "page {page_no} belongs to segment {} not {}",
            descr.id(),
            inode.seg_id()
        )));
    }

    let limit = space.free_limit();
    let not_full_n_used = inode.not_full_n_used();
    if descr.is_full(extent_size) {
        // The extent leaves the FULL list.
        fut0lst::flst_remove(
            mtr,
            &fsp.pool,
            space,
            &inode.block,
            inode.offset + FSEG_FULL,
            &descr.block,
            descr.flst_node(),
            limit,
        )?;
        fut0lst::flst_add_last(
            mtr,
            &fsp.pool,
            space,
            &inode.block,
            inode.offset + FSEG_NOT_FULL,
            &descr.block,
            descr.flst_node(),
            limit,
        )?;
        inode.set_not_full_n_used(mtr, not_full_n_used + extent_size - 1);
    } else {
        if not_full_n_used == 0 {
            space.set_corrupted();
            return Err(DbErr::corruption("NOT_FULL_N_USED underflow"));
        }
        inode.set_not_full_n_used(mtr, not_full_n_used - 1);
    }

    mtr.free_page(space.id, page_no);
    fsp.pool.evict(space.id, page_no);
    descr.set_free(mtr, page_no % extent_size, true);

    if descr.n_used(extent_size) == 0 {
        // The extent has become wholly free: return it to the space.
        fut0lst::flst_remove(
            mtr,
            &fsp.pool,
            space,
            &inode.block,
            inode.offset + FSEG_NOT_FULL,
            &descr.block,
            descr.flst_node(),
            limit,
        )?;
        fsp_free_extent(fsp, space, page_no, mtr)?;
    }
    Ok(())
}

/// Free a page that belongs to the segment whose header is given.
pub fn fseg_free_page(
    fsp: &Fsp,
    space: &Arc<FilSpace>,
    seg_header_block: &Arc<Block>,
    seg_header_offset: u32,
    page_no: u32,
    mtr: &mut Mtr,
) -> DbResult<()> {
    mtr.x_lock_space(space);
    let inode = fseg_inode_try_get(fsp, space, seg_header_block, seg_header_offset, mtr)?;
    fseg_free_page_low(fsp, space, &inode, page_no, mtr)
}

/// Free one whole extent of a segment.
fn fseg_free_extent(
    fsp: &Fsp,
    space: &Arc<FilSpace>,
    inode: &Inode,
    descr: &Xdes,
    mtr: &mut Mtr,
) -> DbResult<()> {
    let shift = space.page_size_shift;
    let extent_size = fsp0types::FSP_EXTENT_SIZE(shift);
    if descr.state() != XDES_FSEG || descr.id() != inode.seg_id() {
        space.set_corrupted();
        return Err(DbErr::corruption("freeing a foreign extent"));
    }
    let first_page = descr.extent_page(shift);
    let limit = space.free_limit();
    let n_used = descr.n_used(extent_size);

    let list = if descr.is_full(extent_size) {
        FSEG_FULL
    } else if n_used == 0 {
        FSEG_FREE
    } else {
        FSEG_NOT_FULL
    };
    fut0lst::flst_remove(
        mtr,
        &fsp.pool,
        space,
        &inode.block,
        inode.offset + list,
        &descr.block,
        descr.flst_node(),
        limit,
    )?;
    if list == FSEG_NOT_FULL {
        inode.set_not_full_n_used(mtr, inode.not_full_n_used() - n_used);
    }

    for bit in 0..extent_size {
        if !descr.is_free(bit) {
            mtr.free_page(space.id, first_page + bit);
            fsp.pool.evict(space.id, first_page + bit);
        }
    }

    fsp_free_extent(fsp, space, first_page, mtr)
}

/// The result of one step of freeing a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreeStep {
    /// More extents or pages remain; call again.
    MoreWork,
    /// The segment is fully freed and its inode released.
    Done,
}

fn fseg_get_first_extent(
    fsp: &Fsp,
    space: &Arc<FilSpace>,
    inode: &Inode,
    mtr: &mut Mtr,
) -> DbResult<Option<Xdes>> {
    let limit = space.free_limit();
    for list in [FSEG_FULL, FSEG_NOT_FULL, FSEG_FREE] {
        let first = fut0lst::flst_get_first(&inode.block, inode.offset + list, limit)?;
        if !first.is_null() {
            return Ok(Some(xdes_lst_get_descriptor(fsp, space, first, mtr)?));
        }
    }
    Ok(None)
}

fn fseg_free_step_common(
    fsp: &Fsp,
    space: &Arc<FilSpace>,
    inode: &Inode,
    skip_page: Option<u32>,
    mtr: &mut Mtr,
) -> DbResult<FreeStep> {
    let n_slots = FSEG_FRAG_ARR_N_SLOTS(space.page_size_shift);

    if let Some(descr) = fseg_get_first_extent(fsp, space, inode, mtr)? {
        fseg_free_extent(fsp, space, inode, &descr, mtr)?;
        return Ok(FreeStep::MoreWork);
    }

    // Free fragment pages one at a time.
    let mut slot = inode.find_last_used_frag_slot(n_slots);
    if let (Some(s), Some(skip)) = (slot, skip_page) {
        if inode.frag_page_no(s) == skip {
            // Preserve the page holding the segment header for last.
            slot = (0..s).rev().find(|&i| {
                inode.frag_page_no(i) != FIL_NULL && inode.frag_page_no(i) != skip
            });
        }
    }
    if let Some(s) = slot {
        let page_no = inode.frag_page_no(s);
        fseg_free_page_low(fsp, space, inode, page_no, mtr)?;
        if inode.n_frag_pages(n_slots) > 0 {
            return Ok(FreeStep::MoreWork);
        }
    }

    if skip_page.is_some() && inode.n_frag_pages(n_slots) > 0 {
        // Only the header page remains; the caller frees it separately.
        return Ok(FreeStep::Done);
    }

    fsp_free_seg_inode(fsp, space, inode, mtr)?;
    Ok(FreeStep::Done)
}

/// Free one extent (or one fragment page) of a segment; when everything is
/// freed, releases the inode and reports Done. The caller loops, committing
/// the MTR between steps.
pub fn fseg_free_step(
    fsp: &Fsp,
    space: &Arc<FilSpace>,
    seg_header_block: &Arc<Block>,
    seg_header_offset: u32,
    mtr: &mut Mtr,
) -> DbResult<FreeStep> {
    mtr.x_lock_space(space);
    let inode = fseg_inode_try_get(fsp, space, seg_header_block, seg_header_offset, mtr)?;
    fseg_free_step_common(fsp, space, &inode, None, mtr)
}

/// Free one step of a segment identified directly by its inode; used by
/// garbage collection of leaked segments, which has no segment header page
/// to go through.
pub fn fseg_free_step_inode(
    fsp: &Fsp,
    space: &Arc<FilSpace>,
    inode: &Inode,
    mtr: &mut Mtr,
) -> DbResult<FreeStep> {
    debug_assert!(space.is_owner());
    fseg_free_step_common(fsp, space, inode, None, mtr)
}

/// Like fseg_free_step(), but preserves the page holding the segment header
/// until the final step.
pub fn fseg_free_step_not_header(
    fsp: &Fsp,
    space: &Arc<FilSpace>,
    seg_header_block: &Arc<Block>,
    seg_header_offset: u32,
    mtr: &mut Mtr,
) -> DbResult<FreeStep> {
    mtr.x_lock_space(space);
    let inode = fseg_inode_try_get(fsp, space, seg_header_block, seg_header_offset, mtr)?;
    fseg_free_step_common(fsp, space, &inode, Some(seg_header_block.page_no), mtr)
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use super::*;
    use crate::buf0buf::BufferPool;
    use crate::log::Redo;

    const SHIFT: u32 = 14; // 16 KiB pages, 64-page extents

    fn setup(size: u32) -> (Arc<Redo>, Fsp, Arc<FilSpace>) {
        let redo = Arc::new(Redo::new());
        let pool = Arc::new(BufferPool::new(1usize << SHIFT));
        let fsp = Fsp::new(pool);
        let space = Arc::new(FilSpace::new(fsp0types::TRX_SYS_SPACE, SHIFT, false));
        let mut mtr = Mtr::start(redo.clone());
        fsp_header_init(&fsp, &space, size, &mut mtr).unwrap();
        mtr.commit();
        (redo, fsp, space)
    }

    fn frag_n_used(fsp: &Fsp, space: &Arc<FilSpace>) -> u32 {
        let header = fsp
            .pool
            .get(space, 0, crate::buf0buf::PageGet::Get)
            .unwrap()
            .unwrap();
        header.read_4(FSP_HEADER_OFFSET + FSP_FRAG_N_USED)
    }

    #[test]
    fn test_header_init_fresh_space() {
        let (_redo, fsp, space) = setup(8192);
        assert_eq!(space.size(), 8192);
        assert_eq!(space.free_limit(), 64);
        let header = fsp
            .pool
            .get(&space, 0, crate::buf0buf::PageGet::Get)
            .unwrap()
            .unwrap();
        assert_eq!(header.read_8(FSP_HEADER_OFFSET + FSP_SEG_ID), 1);
        // Header page and the reserved page after it.
        assert_eq!(frag_n_used(&fsp, &space), 2);
    }

    #[test]
    fn test_fresh_segment_first_page() {
        // Fresh init: create a space of 8192 pages, allocate one segment
        // and its first page; the page lands in the first extent.
        let (redo, fsp, space) = setup(8192);
        let mut mtr = Mtr::start(redo.clone());
        let seg_block = fseg_create(&fsp, &space, 1000, &mut mtr).unwrap();
        mtr.commit();
        assert!(
            seg_block.page_no >= 2 && seg_block.page_no < 64,
            "page_no {}",
            seg_block.page_no
        );
        assert_eq!(space.free_limit(), 64);
    }

    #[test]
    fn test_alloc_free_roundtrip() {
        let (redo, fsp, space) = setup(8192);
        let mut mtr = Mtr::start(redo.clone());
        let seg_block = fseg_create(&fsp, &space, 100, &mut mtr).unwrap();
        mtr.commit();
        let seg_page = seg_block.page_no;

        let frag_before = frag_n_used(&fsp, &space);

        let mut pages = Vec::new();
        for i in 0..10 {
            let mut mtr = Mtr::start(redo.clone());
            let block = fseg_alloc_free_page_general(
                &fsp, &space, &seg_block, 100, seg_page + 1 + i, false, &mut mtr,
            )
            .unwrap();
            mtr.commit();
            pages.push(block.page_no);
        }

        for &page in pages.iter().rev() {
            let mut mtr = Mtr::start(redo.clone());
            fseg_free_page(&fsp, &space, &seg_block, 100, page, &mut mtr).unwrap();
            mtr.commit();
        }

        // Small segment: everything came from fragment pages, so the
        // space-level used count is back where it started.
        assert_eq!(frag_n_used(&fsp, &space), frag_before);
    }

    #[test]
    fn test_segment_grows_into_extents() {
        let (redo, fsp, space) = setup(8192);
        let mut mtr = Mtr::start(redo.clone());
        let seg_block = fseg_create(&fsp, &space, 100, &mut mtr).unwrap();
        mtr.commit();

        for i in 0..100u32 {
            let mut mtr = Mtr::start(redo.clone());
            fseg_alloc_free_page_general(&fsp, &space, &seg_block, 100, 3 + i, false, &mut mtr)
                .unwrap();
            mtr.commit();
        }

        let mut mtr = Mtr::start(redo.clone());
        mtr.x_lock_space(&space);
        let inode = fseg_inode_try_get(&fsp, &space, &seg_block, 100, &mut mtr).unwrap();
        let (reserved, used) = fseg_n_reserved_pages(&space, &inode);
        mtr.commit();
        assert_eq!(used, 101);
        assert!(reserved >= used);
        // After 100 allocations the segment must own whole extents.
        assert!(reserved > FSEG_FRAG_ARR_N_SLOTS(SHIFT));
    }

    #[test]
    fn test_free_step_releases_everything() {
        let (redo, fsp, space) = setup(8192);
        let mut mtr = Mtr::start(redo.clone());
        let seg_block = fseg_create(&fsp, &space, 100, &mut mtr).unwrap();
        mtr.commit();

        for i in 0..80u32 {
            let mut mtr = Mtr::start(redo.clone());
            fseg_alloc_free_page_general(&fsp, &space, &seg_block, 100, 3 + i, false, &mut mtr)
                .unwrap();
            mtr.commit();
        }

        let frag_fresh = {
            let (_r, f2, s2) = setup(8192);
            frag_n_used(&f2, &s2)
        };

        loop {
            let mut mtr = Mtr::start(redo.clone());
            let step = fseg_free_step(&fsp, &space, &seg_block, 100, &mut mtr).unwrap();
            mtr.commit();
            if step == FreeStep::Done {
                break;
            }
        }

        // The segment returned to initial emptiness: the inode page was
        // freed too and the space-level frag accounting matches a fresh
        // space again.
        assert_eq!(frag_n_used(&fsp, &space), frag_fresh);
    }

    #[test]
    fn test_reserve_free_extents() {
        let (redo, fsp, space) = setup(8192);
        let mut mtr = Mtr::start(redo.clone());
        let (n, _) =
            fsp_reserve_free_extents(&fsp, &space, 2, FspReserve::Normal, &mut mtr).unwrap();
        mtr.commit();
        assert_eq!(n, 2);
        assert_eq!(space.n_reserved_extents.load(Ordering::Relaxed), 2);
        space.release_free_extents(2);
        assert_eq!(space.n_reserved_extents.load(Ordering::Relaxed), 0);
    }
}
