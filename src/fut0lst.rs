//! On-page doubly linked lists of on-page structures, addressed by
//! (page number, byte offset) pairs. Used for the tablespace free / frag
//! extent lists, the segment extent lists and the inode page lists.

use std::sync::Arc;

use crate::buf0buf::{Block, BufferPool, PageGet};
use crate::db0err::{DbErr, DbResult};
use crate::fil0fil::{self, FIL_NULL, FilAddr, FilSpace};
use crate::mtr::{Mtr, WriteMode};

/// The physical size of a list base node in bytes.
pub const FLST_BASE_NODE_SIZE: u32 = 4 + 2 * fil0fil::FIL_ADDR_SIZE;

/// The physical size of a list node in bytes.
pub const FLST_NODE_SIZE: u32 = 2 * fil0fil::FIL_ADDR_SIZE;

/* Offsets within the base node. */
const FLST_LEN: u32 = 0;
const FLST_FIRST: u32 = 4;
const FLST_LAST: u32 = 4 + fil0fil::FIL_ADDR_SIZE;

/* Offsets within a node. */
const FLST_PREV: u32 = 0;
const FLST_NEXT: u32 = fil0fil::FIL_ADDR_SIZE;

/// Validate and read a file address stored on a page. `limit` is the
/// space free limit; nodes can only live on initialized pages.
fn flst_read_addr(block: &Block, ofs: u32, limit: u32) -> DbResult<FilAddr> {
    let page_size = block.frame().len() as u32;
    let (page, boffset) = block.read_addr(ofs);
    if page == FIL_NULL {
        return Ok(FilAddr { page, boffset });
    }
    if page >= limit
        || (boffset as u32) < fil0fil::FIL_PAGE_DATA
        || boffset as u32 >= page_size - fil0fil::FIL_PAGE_DATA_END
    {
        return Err(DbErr::corruption(format!(
            "invalid list node address ({page}, {boffset}) at page {} offset {ofs}, free limit {limit}",
            block.page_no
        )));
    }
    Ok(FilAddr { page, boffset })
}

fn fetch(pool: &BufferPool, space: &Arc<FilSpace>, page_no: u32) -> DbResult<Arc<Block>> {
    pool.get(space, page_no, PageGet::Get)?
        .ok_or_else(|| DbErr::corruption(format!("list node page {page_no} missing")))
}

/// Initialize an empty list base node.
pub fn flst_init(mtr: &mut Mtr, block: &Arc<Block>, base: u32) {
    mtr.write_4(block, base + FLST_LEN, 0, WriteMode::MaybeNop);
    mtr.write_addr(block, base + FLST_FIRST, FIL_NULL, 0, WriteMode::MaybeNop);
    mtr.write_addr(block, base + FLST_LAST, FIL_NULL, 0, WriteMode::MaybeNop);
}

pub fn flst_get_len(block: &Block, base: u32) -> u32 {
    block.read_4(base + FLST_LEN)
}

pub fn flst_get_first(block: &Block, base: u32, limit: u32) -> DbResult<FilAddr> {
    flst_read_addr(block, base + FLST_FIRST, limit)
}

pub fn flst_get_last(block: &Block, base: u32, limit: u32) -> DbResult<FilAddr> {
    flst_read_addr(block, base + FLST_LAST, limit)
}

pub fn flst_get_next_addr(block: &Block, node: u32, limit: u32) -> DbResult<FilAddr> {
    flst_read_addr(block, node + FLST_NEXT, limit)
}

pub fn flst_get_prev_addr(block: &Block, node: u32, limit: u32) -> DbResult<FilAddr> {
    flst_read_addr(block, node + FLST_PREV, limit)
}

fn flst_add_to_empty(
    mtr: &mut Mtr,
    base_block: &Arc<Block>,
    base: u32,
    node_block: &Arc<Block>,
    node: u32,
) {
    let addr = FilAddr {
        page: node_block.page_no,
        boffset: node as u16,
    };
    mtr.write_4(base_block, base + FLST_LEN, 1, WriteMode::MaybeNop);
    mtr.write_addr(
        base_block,
        base + FLST_FIRST,
        addr.page,
        addr.boffset,
        WriteMode::MaybeNop,
    );
    mtr.write_addr(
        base_block,
        base + FLST_LAST,
        addr.page,
        addr.boffset,
        WriteMode::MaybeNop,
    );
    mtr.write_addr(node_block, node + FLST_PREV, FIL_NULL, 0, WriteMode::MaybeNop);
    mtr.write_addr(node_block, node + FLST_NEXT, FIL_NULL, 0, WriteMode::MaybeNop);
}

/// Add a node as the last node in a list.
pub fn flst_add_last(
    mtr: &mut Mtr,
    pool: &BufferPool,
    space: &Arc<FilSpace>,
    base_block: &Arc<Block>,
    base: u32,
    node_block: &Arc<Block>,
    node: u32,
    limit: u32,
) -> DbResult<()> {
    let len = flst_get_len(base_block, base);
    let last = flst_get_last(base_block, base, limit)?;
    if len == 0 {
        if !last.is_null() {
            return Err(DbErr::corruption("empty list with a last node"));
        }
        flst_add_to_empty(mtr, base_block, base, node_block, node);
        return Ok(());
    }
    if last.is_null() {
        return Err(DbErr::corruption("non-empty list without a last node"));
    }

    let last_block = fetch(pool, space, last.page)?;
    mtr.write_addr(
        &last_block,
        last.boffset as u32 + FLST_NEXT,
        node_block.page_no,
        node as u16,
        WriteMode::MaybeNop,
    );
    mtr.write_addr(
        node_block,
        node + FLST_PREV,
        last.page,
        last.boffset,
        WriteMode::MaybeNop,
    );
    mtr.write_addr(node_block, node + FLST_NEXT, FIL_NULL, 0, WriteMode::MaybeNop);
    mtr.write_addr(
        base_block,
        base + FLST_LAST,
        node_block.page_no,
        node as u16,
        WriteMode::MaybeNop,
    );
    mtr.write_4(base_block, base + FLST_LEN, len + 1, WriteMode::MaybeNop);
    Ok(())
}

/// Add a node as the first node in a list.
pub fn flst_add_first(
    mtr: &mut Mtr,
    pool: &BufferPool,
    space: &Arc<FilSpace>,
    base_block: &Arc<Block>,
    base: u32,
    node_block: &Arc<Block>,
    node: u32,
    limit: u32,
) -> DbResult<()> {
    let len = flst_get_len(base_block, base);
    let first = flst_get_first(base_block, base, limit)?;
    if len == 0 {
        if !first.is_null() {
            return Err(DbErr::corruption("empty list with a first node"));
        }
        flst_add_to_empty(mtr, base_block, base, node_block, node);
        return Ok(());
    }
    if first.is_null() {
        return Err(DbErr::corruption("non-empty list without a first node"));
    }

    let first_block = fetch(pool, space, first.page)?;
    mtr.write_addr(
        &first_block,
        first.boffset as u32 + FLST_PREV,
        node_block.page_no,
        node as u16,
        WriteMode::MaybeNop,
    );
    mtr.write_addr(node_block, node + FLST_PREV, FIL_NULL, 0, WriteMode::MaybeNop);
    mtr.write_addr(
        node_block,
        node + FLST_NEXT,
        first.page,
        first.boffset,
        WriteMode::MaybeNop,
    );
    mtr.write_addr(
        base_block,
        base + FLST_FIRST,
        node_block.page_no,
        node as u16,
        WriteMode::MaybeNop,
    );
    mtr.write_4(base_block, base + FLST_LEN, len + 1, WriteMode::MaybeNop);
    Ok(())
}

/// Remove a node from a list.
pub fn flst_remove(
    mtr: &mut Mtr,
    pool: &BufferPool,
    space: &Arc<FilSpace>,
    base_block: &Arc<Block>,
    base: u32,
    node_block: &Arc<Block>,
    node: u32,
    limit: u32,
) -> DbResult<()> {
    let len = flst_get_len(base_block, base);
    if len == 0 {
        return Err(DbErr::corruption("removing from an empty list"));
    }
    let prev = flst_get_prev_addr(node_block, node, limit)?;
    let next = flst_get_next_addr(node_block, node, limit)?;

    if prev.is_null() {
        mtr.write_addr(
            base_block,
            base + FLST_FIRST,
            next.page,
            next.boffset,
            WriteMode::MaybeNop,
        );
    } else {
        let prev_block = fetch(pool, space, prev.page)?;
        mtr.write_addr(
            &prev_block,
            prev.boffset as u32 + FLST_NEXT,
            next.page,
            next.boffset,
            WriteMode::MaybeNop,
        );
    }

    if next.is_null() {
        mtr.write_addr(
            base_block,
            base + FLST_LAST,
            prev.page,
            prev.boffset,
            WriteMode::MaybeNop,
        );
    } else {
        let next_block = fetch(pool, space, next.page)?;
        mtr.write_addr(
            &next_block,
            next.boffset as u32 + FLST_PREV,
            prev.page,
            prev.boffset,
            WriteMode::MaybeNop,
        );
    }

    mtr.write_4(base_block, base + FLST_LEN, len - 1, WriteMode::MaybeNop);
    Ok(())
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use super::*;
    use crate::buf0buf::{BufferPool, PageGet};
    use crate::fil0fil::FilSpace;
    use crate::log::Redo;

    const BASE: u32 = 100;
    const N1: u32 = 200;
    const N2: u32 = 300;
    const N3: u32 = 400;

    fn setup() -> (Arc<Redo>, BufferPool, Arc<FilSpace>) {
        let redo = Arc::new(Redo::new());
        let pool = BufferPool::new(4096);
        let space = Arc::new(FilSpace::new(0, 12, false));
        space.set_free_limit(64);
        (redo, pool, space)
    }

    #[test]
    fn test_add_remove() {
        let (redo, pool, space) = setup();
        let b0 = pool.get(&space, 0, PageGet::Create).unwrap().unwrap();
        let b1 = pool.get(&space, 1, PageGet::Create).unwrap().unwrap();

        let mut mtr = Mtr::start(redo.clone());
        mtr.x_lock_space(&space);
        flst_init(&mut mtr, &b0, BASE);
        flst_add_last(&mut mtr, &pool, &space, &b0, BASE, &b0, N1, 64).unwrap();
        flst_add_last(&mut mtr, &pool, &space, &b0, BASE, &b1, N2, 64).unwrap();
        flst_add_first(&mut mtr, &pool, &space, &b0, BASE, &b1, N3, 64).unwrap();
        mtr.commit();

        assert_eq!(flst_get_len(&b0, BASE), 3);
        let first = flst_get_first(&b0, BASE, 64).unwrap();
        assert_eq!((first.page, first.boffset), (1, N3 as u16));
        let last = flst_get_last(&b0, BASE, 64).unwrap();
        assert_eq!((last.page, last.boffset), (1, N2 as u16));

        // N3 -> N1 -> N2
        let next = flst_get_next_addr(&b1, N3, 64).unwrap();
        assert_eq!((next.page, next.boffset), (0, N1 as u16));

        let mut mtr = Mtr::start(redo.clone());
        mtr.x_lock_space(&space);
        flst_remove(&mut mtr, &pool, &space, &b0, BASE, &b0, N1, 64).unwrap();
        mtr.commit();

        assert_eq!(flst_get_len(&b0, BASE), 2);
        let next = flst_get_next_addr(&b1, N3, 64).unwrap();
        assert_eq!((next.page, next.boffset), (1, N2 as u16));
        let prev = flst_get_prev_addr(&b1, N2, 64).unwrap();
        assert_eq!((prev.page, prev.boffset), (1, N3 as u16));
    }

    #[test]
    fn test_out_of_bounds_node_is_corruption() {
        let (redo, pool, space) = setup();
        let b0 = pool.get(&space, 0, PageGet::Create).unwrap().unwrap();
        let mut mtr = Mtr::start(redo);
        mtr.x_lock_space(&space);
        flst_init(&mut mtr, &b0, BASE);
        // Forge a last-node address above the free limit.
        mtr.write_addr(&b0, BASE + 4 + 6, 100, 200, WriteMode::MaybeNop);
        mtr.write_4(&b0, BASE, 1, WriteMode::MaybeNop);
        mtr.commit();
        assert!(flst_get_last(&b0, BASE, 64).is_err());
    }
}
