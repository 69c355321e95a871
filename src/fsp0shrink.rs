//! Shrinking a tablespace: find the highest extent still in use, free
//! leaked segments, rewrite the space free lists to drop everything above
//! the threshold, and trim the data file. All list surgery happens in a
//! single mini-transaction so that recovery sees either the old or the new
//! file layout.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use crate::buf0buf::PageGet;
use crate::db0err::{DbErr, DbResult};
use crate::fil0fil::{FilAddr, FilSpace};
use crate::fsp0fsp::{
    self, FSEG_INODE_PAGE_NODE, FSEG_INODE_SIZE, FSP_FREE, FSP_FREE_LIMIT, FSP_FREE_FRAG,
    FSP_HEADER_OFFSET, FSP_SEG_INODES_FREE, FSP_SEG_INODES_FULL, FSP_SIZE, FreeStep, Fsp,
    XDES_FREE, XDES_FREE_FRAG, XDES_SIZE, xdes_calc_descriptor_page,
};
use crate::fsp0types::{self, FSEG_HDR_OFFSET, FSEG_HDR_PAGE_NO};
use crate::fut0lst;
use crate::log::Redo;
use crate::mtr::{Mtr, WriteMode};

/// An MTR whose serialized redo would exceed this is aborted and the shrink
/// retried another time (the redo parser guarantees far less than this per
/// mini-transaction).
const SHRINK_MTR_LOG_BUDGET: usize = 2 * 1024 * 1024;

/// Saved copies of the pages the shrink is about to rewrite, so the
/// operation can be rolled back if it would overflow the MTR budget.
struct ShadowPages {
    pages: Vec<(u32, Vec<u8>)>,
}

impl ShadowPages {
    fn capture(fsp: &Fsp, space: &Arc<FilSpace>, page_nos: &[u32]) -> DbResult<ShadowPages> {
        let mut pages = Vec::with_capacity(page_nos.len());
        for &page_no in page_nos {
            let block = fsp
                .pool
                .get(space, page_no, PageGet::Get)?
                .ok_or_else(|| DbErr::corruption("missing page for shadow copy"))?;
            pages.push((page_no, block.frame().to_vec()));
        }
        Ok(ShadowPages { pages })
    }

    fn restore(&self, fsp: &Fsp, space: &Arc<FilSpace>) -> DbResult<()> {
        for (page_no, saved) in &self.pages {
            let block = fsp
                .pool
                .get(space, *page_no, PageGet::Get)?
                .ok_or_else(|| DbErr::corruption("missing page for shadow restore"))?;
            block.frame_mut().copy_from_slice(saved);
        }
        Ok(())
    }
}

/// Walk used extents from high to low and return the page number at which
/// the space can be truncated: everything from there up is either a FREE
/// extent or a descriptor-page-only FREE_FRAG extent (2 used pages).
pub fn fsp_traverse_extents(
    fsp: &Fsp,
    space: &Arc<FilSpace>,
    mtr: &mut Mtr,
) -> DbResult<u32> {
    debug_assert!(space.is_owner());
    let shift = space.page_size_shift;
    let extent_size = fsp0types::FSP_EXTENT_SIZE(shift);
    let header = fsp_get_header(fsp, space, mtr)?;
    let free_limit = space.free_limit();
    if free_limit == 0 {
        return Ok(0);
    }

    // Extent 0 carries the space header and is never truncated.
    let mut threshold = free_limit;
    let mut cur = ((free_limit - 1) / extent_size) * extent_size;
    while cur >= extent_size {
        let descr = fsp0fsp::xdes_get_descriptor(fsp, space, &header, cur, false, mtr)?;
        let state = descr.state();
        let descr_page = cur % (1u32 << shift) == 0;
        if state == XDES_FREE {
            threshold = cur;
        } else if state == XDES_FREE_FRAG && descr_page && descr.n_used(extent_size) == 2 {
            // Only the descriptor page and the reserved page after it are
            // used: the extent goes away with everything above it.
            threshold = cur;
        } else {
            break;
        }
        cur -= extent_size;
    }
    Ok(threshold)
}

fn fsp_get_header(
    fsp: &Fsp,
    space: &Arc<FilSpace>,
    mtr: &mut Mtr,
) -> DbResult<Arc<crate::buf0buf::Block>> {
    fsp0fsp::fsp_get_header(fsp, space, mtr)
}

/// Collect the addresses of all used inodes in the space.
fn collect_used_inodes(
    fsp: &Fsp,
    space: &Arc<FilSpace>,
    mtr: &mut Mtr,
) -> DbResult<Vec<fsp0fsp::Inode>> {
    let shift = space.page_size_shift;
    let physical_size = space.physical_size();
    let inode_size = FSEG_INODE_SIZE(shift);
    let n_slots =
        (physical_size - fsp0fsp::FSEG_ARR_OFFSET - crate::fil0fil::FIL_PAGE_DATA_END)
            / inode_size;
    let header = fsp_get_header(fsp, space, mtr)?;
    let limit = space.free_limit();
    let mut inodes = Vec::new();

    for list in [FSP_SEG_INODES_FULL, FSP_SEG_INODES_FREE] {
        let mut addr = fut0lst::flst_get_first(&header, FSP_HEADER_OFFSET + list, limit)?;
        while !addr.is_null() {
            let block = fsp
                .pool
                .get(space, addr.page, PageGet::Get)?
                .ok_or_else(|| DbErr::corruption("missing inode page"))?;
            for i in 0..n_slots {
                let offset = fsp0fsp::FSEG_ARR_OFFSET + i * inode_size;
                if block.read_8(offset + fsp0fsp::FSEG_ID) != 0 {
                    inodes.push(fsp0fsp::Inode {
                        block: block.clone(),
                        offset,
                    });
                }
            }
            addr = fut0lst::flst_get_next_addr(&block, FSEG_INODE_PAGE_NODE, limit)?;
        }
    }
    Ok(inodes)
}

/// Free every segment whose inode is not reachable from `live_roots`
/// (segment header addresses supplied by the data dictionary and the
/// rollback segments). Such inodes are leaked undo segments from
/// interrupted DDL. Must not run while XA PREPARED transactions exist.
pub fn fsp_garbage_collect(
    fsp: &Fsp,
    redo: &Arc<Redo>,
    space: &Arc<FilSpace>,
    live_roots: impl IntoIterator<Item = FilAddr>,
) -> DbResult<u32> {
    let mut live: HashSet<(u32, u16)> = HashSet::new();
    {
        let mut mtr = Mtr::start(redo.clone());
        mtr.x_lock_space(space);
        for root in live_roots {
            // A root names the page carrying a segment header; resolve it
            // to the inode it points at.
            let block = fsp
                .pool
                .get(space, root.page, PageGet::Get)?
                .ok_or_else(|| DbErr::corruption("missing segment root page"))?;
            let page_no = block.read_4(root.boffset as u32 + FSEG_HDR_PAGE_NO);
            let boffset = block.read_2(root.boffset as u32 + FSEG_HDR_OFFSET);
            live.insert((page_no, boffset));
        }
        mtr.commit();
    }

    let mut freed = 0u32;
    loop {
        let mut mtr = Mtr::start(redo.clone());
        mtr.x_lock_space(space);
        let leaked = collect_used_inodes(fsp, space, &mut mtr)?
            .into_iter()
            .find(|inode| {
                !live.contains(&(inode.block.page_no, inode.offset as u16))
            });
        let Some(inode) = leaked else {
            mtr.commit();
            break;
        };
        log::info!(
            "freeing leaked segment {} in space {}",
            inode.seg_id(),
            space.id
        );
        // Step-wise free, one extent per mini-transaction.
        loop {
            let step = fsp_free_inode_step(fsp, space, &inode, &mut mtr)?;
            mtr.commit();
            if step == FreeStep::Done {
                break;
            }
            mtr = Mtr::start(redo.clone());
            mtr.x_lock_space(space);
        }
        freed += 1;
    }
    Ok(freed)
}

fn fsp_free_inode_step(
    fsp: &Fsp,
    space: &Arc<FilSpace>,
    inode: &fsp0fsp::Inode,
    mtr: &mut Mtr,
) -> DbResult<FreeStep> {
    fsp0fsp::fseg_free_step_inode(fsp, space, inode, mtr)
}

/// Drop all list nodes at or above `threshold` from one space list.
fn fsp_shrink_list(
    fsp: &Fsp,
    space: &Arc<FilSpace>,
    header: &Arc<crate::buf0buf::Block>,
    base: u32,
    threshold: u32,
    mtr: &mut Mtr,
) -> DbResult<u32> {
    let limit = space.free_limit();
    let mut removed = 0u32;
    let mut addr = fut0lst::flst_get_first(header, base, limit)?;
    while !addr.is_null() {
        let descr = fsp0fsp::xdes_lst_get_descriptor(fsp, space, addr, mtr)?;
        let next = fut0lst::flst_get_next_addr(
            &descr.block,
            addr.boffset as u32,
            limit,
        )?;
        if descr.extent_page(space.page_size_shift) >= threshold {
            fut0lst::flst_remove(
                mtr,
                &fsp.pool,
                space,
                header,
                base,
                &descr.block,
                addr.boffset as u32,
                limit,
            )?;
            removed += 1;
        }
        addr = next;
    }
    Ok(removed)
}

/// Zero the extent descriptor entries for the truncated page range.
fn fsp_xdes_reset(
    fsp: &Fsp,
    space: &Arc<FilSpace>,
    threshold: u32,
    old_limit: u32,
    mtr: &mut Mtr,
) -> DbResult<()> {
    let shift = space.page_size_shift;
    let extent_size = fsp0types::FSP_EXTENT_SIZE(shift);
    let xdes_size = XDES_SIZE(shift);
    let mut cur = threshold - threshold % extent_size;
    if cur < threshold {
        cur += extent_size;
    }
    while cur < old_limit {
        let descr_page_no = xdes_calc_descriptor_page(shift, cur);
        if descr_page_no >= threshold {
            // The whole descriptor page goes away with the truncation.
            cur = descr_page_no + (1u32 << shift);
            continue;
        }
        let descr = {
            let header = fsp_get_header(fsp, space, mtr)?;
            fsp0fsp::xdes_get_descriptor(fsp, space, &header, cur, true, mtr)?
        };
        mtr.memset(&descr.block, descr.offset, xdes_size, 0);
        cur += extent_size;
    }
    Ok(())
}

/// Shrink the system tablespace down to its last used extent.
/// Returns the new size in pages, or None if nothing could be trimmed or
/// the MTR budget would be exceeded.
pub fn fsp_system_shrink(
    fsp: &Fsp,
    redo: &Arc<Redo>,
    space: &Arc<FilSpace>,
) -> DbResult<Option<u32>> {
    shrink_low(fsp, space, Mtr::start(redo.clone()))
}

/// Shrink the temporary tablespace. Logs no redo and physically truncates
/// after committing.
pub fn fsp_temp_shrink(fsp: &Fsp, space: &Arc<FilSpace>) -> DbResult<Option<u32>> {
    debug_assert!(space.is_temporary);
    shrink_low(fsp, space, Mtr::start_no_redo())
}

fn shrink_low(fsp: &Fsp, space: &Arc<FilSpace>, mut mtr: Mtr) -> DbResult<Option<u32>> {
    mtr.x_lock_space(space);
    let shift = space.page_size_shift;
    let old_size = space.size();
    let old_limit = space.free_limit();

    let threshold = fsp_traverse_extents(fsp, space, &mut mtr)?;
    if threshold >= old_limit || threshold >= old_size {
        mtr.commit();
        return Ok(None);
    }

    // Save a shadow copy of every descriptor page that may be modified, so
    // an oversized MTR can be rolled back without trace.
    let mut xdes_pages = Vec::new();
    let mut p = 0u32;
    while p < old_limit {
        if xdes_calc_descriptor_page(shift, p) == p || p == 0 {
            xdes_pages.push(p);
        }
        p += 1u32 << shift;
    }
    if !xdes_pages.contains(&0) {
        xdes_pages.insert(0, 0);
    }
    let shadow = ShadowPages::capture(fsp, space, &xdes_pages)?;

    let header = fsp_get_header(fsp, space, &mut mtr)?;
    let result: DbResult<()> = (|| {
        mtr.write_4(&header, FSP_HEADER_OFFSET + FSP_SIZE, threshold, WriteMode::Forced);
        mtr.write_4(
            &header,
            FSP_HEADER_OFFSET + FSP_FREE_LIMIT,
            threshold,
            WriteMode::Forced,
        );
        let removed =
            fsp_shrink_list(fsp, space, &header, FSP_HEADER_OFFSET + FSP_FREE, threshold, &mut mtr)?;
        fsp_shrink_list(
            fsp,
            space,
            &header,
            FSP_HEADER_OFFSET + FSP_FREE_FRAG,
            threshold,
            &mut mtr,
        )?;
        fsp_xdes_reset(fsp, space, threshold, old_limit, &mut mtr)?;
        space.free_len.fetch_sub(
            removed.min(space.free_len.load(Ordering::Relaxed)),
            Ordering::Relaxed,
        );
        Ok(())
    })();

    if let Err(e) = result {
        shadow.restore(fsp, space)?;
        mtr.discard();
        return Err(e);
    }

    if mtr.estimated_log_size() > SHRINK_MTR_LOG_BUDGET {
        log::warn!(
            "tablespace {} shrink would log {} bytes in one mini-transaction, aborting",
            space.id,
            mtr.estimated_log_size()
        );
        shadow.restore(fsp, space)?;
        mtr.discard();
        return Ok(None);
    }

    mtr.commit();

    space.set_size(threshold);
    space.set_free_limit(threshold);
    fsp.pool.evict_above(space.id, threshold);
    if let Some(node) = space.node.lock().unwrap().as_mut() {
        node.resize(threshold)
            .map_err(|e| DbErr::Io(std::io::Error::other(e.to_string())))?;
    }
    log::info!(
        "tablespace {} shrunk from {} to {} pages",
        space.id,
        old_size,
        threshold
    );
    Ok(Some(threshold))
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use super::*;
    use crate::buf0buf::BufferPool;
    use crate::fsp0fsp::{fseg_alloc_free_page_general, fseg_create, fsp_header_init};

    const SHIFT: u32 = 14;

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

    #[test]
    fn test_traverse_fresh_space() {
        let (redo, fsp, space) = setup(8192);
        let mut mtr = Mtr::start(redo.clone());
        mtr.x_lock_space(&space);
        // Extent 0 holds the header and is never truncatable.
        let threshold = fsp_traverse_extents(&fsp, &space, &mut mtr).unwrap();
        mtr.commit();
        assert_eq!(threshold, 64);
    }

    #[test]
    fn test_shrink_after_grow_and_free() {
        let (redo, fsp, space) = setup(8192);
        let mut mtr = Mtr::start(redo.clone());
        let seg_block = fseg_create(&fsp, &space, 100, &mut mtr).unwrap();
        mtr.commit();

        // Grow the segment into several extents, then free it completely.
        for i in 0..200u32 {
            let mut mtr = Mtr::start(redo.clone());
            fseg_alloc_free_page_general(&fsp, &space, &seg_block, 100, 3 + i, false, &mut mtr)
                .unwrap();
            mtr.commit();
        }
        loop {
            let mut mtr = Mtr::start(redo.clone());
            let step =
                crate::fsp0fsp::fseg_free_step(&fsp, &space, &seg_block, 100, &mut mtr).unwrap();
            mtr.commit();
            if step == FreeStep::Done {
                break;
            }
        }

        let new_size = fsp_system_shrink(&fsp, &redo, &space).unwrap();
        assert_eq!(new_size, Some(64));
        assert_eq!(space.size(), 64);
        assert_eq!(space.free_limit(), 64);
    }
}
