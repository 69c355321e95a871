use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::db0err::{DbErr, DbResult};
use crate::fil0fil::{self, FilSpace};
use crate::mach;

/// One page frame in the buffer pool.
pub struct Block {
    pub space_id: u32,
    pub page_no: u32,
    frame: RwLock<Box<[u8]>>,
    dirty: AtomicBool,
}

impl Block {
    fn new_zeroed(space_id: u32, page_no: u32, page_size: usize) -> Block {
        Block {
            space_id,
            page_no,
            frame: RwLock::new(vec![0u8; page_size].into_boxed_slice()),
            dirty: AtomicBool::new(false),
        }
    }

    fn from_frame(space_id: u32, page_no: u32, frame: &[u8]) -> Block {
        Block {
            space_id,
            page_no,
            frame: RwLock::new(frame.to_vec().into_boxed_slice()),
            dirty: AtomicBool::new(false),
        }
    }

    pub fn frame(&self) -> RwLockReadGuard<'_, Box<[u8]>> {
        self.frame.read().unwrap()
    }

    pub fn frame_mut(&self) -> RwLockWriteGuard<'_, Box<[u8]>> {
        self.frame.write().unwrap()
    }

    pub fn set_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub fn read_1(&self, offset: u32) -> u8 {
        self.frame()[offset as usize]
    }

    pub fn read_2(&self, offset: u32) -> u16 {
        mach::mach_read_from_2(&self.frame()[offset as usize..])
    }

    pub fn read_4(&self, offset: u32) -> u32 {
        mach::mach_read_from_4(&self.frame()[offset as usize..])
    }

    pub fn read_8(&self, offset: u32) -> u64 {
        mach::mach_read_from_8(&self.frame()[offset as usize..])
    }

    pub fn read_addr(&self, offset: u32) -> (u32, u16) {
        mach::mach_read_addr(&self.frame()[offset as usize..])
    }

    pub fn page_type(&self) -> u16 {
        self.read_2(fil0fil::FIL_PAGE_TYPE)
    }
}

/// Page fetch modes, mirroring buf_page_get_gen() callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageGet {
    /// The page must be available; read it from the data file if needed.
    Get,
    /// Only return the page if it is already cached.
    GetIfInPool,
    /// The page is being (re-)created; prior contents are ignored.
    Create,
}

/// A minimal buffer pool: pages keyed by (space id, page number).
/// Eviction is not modelled; dirty pages are written back by
/// `flush_space()`.
pub struct BufferPool {
    page_size: usize,
    pages: Mutex<HashMap<(u32, u32), Arc<Block>>>,
}

impl BufferPool {
    pub fn new(page_size: usize) -> BufferPool {
        BufferPool {
            page_size,
            pages: Mutex::new(HashMap::new()),
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn get(
        &self,
        space: &FilSpace,
        page_no: u32,
        mode: PageGet,
    ) -> DbResult<Option<Arc<Block>>> {
        let mut pages = self.pages.lock().unwrap();
        if let Some(block) = pages.get(&(space.id, page_no)) {
            return Ok(Some(block.clone()));
        }
        match mode {
            PageGet::GetIfInPool => Ok(None),
            PageGet::Create => {
                let block = Arc::new(Block::new_zeroed(space.id, page_no, self.page_size));
                pages.insert((space.id, page_no), block.clone());
                Ok(Some(block))
            }
            PageGet::Get => {
                let node = space.node.lock().unwrap();
                let block = match node.as_ref().and_then(|n| n.page(page_no)) {
                    Some(frame) => {
                        buf_page_is_corrupted(frame)?;
                        Block::from_frame(space.id, page_no, frame)
                    }
                    // Pages above the initialized part of a fresh space
                    // read as zero-filled.
                    None => Block::new_zeroed(space.id, page_no, self.page_size),
                };
                let block = Arc::new(block);
                pages.insert((space.id, page_no), block.clone());
                Ok(Some(block))
            }
        }
    }

    /// Drop a page from the pool (after FREE_PAGE or space truncation).
    pub fn evict(&self, space_id: u32, page_no: u32) {
        self.pages.lock().unwrap().remove(&(space_id, page_no));
    }

    /// Drop all pages of a space at or above `from_page`.
    pub fn evict_above(&self, space_id: u32, from_page: u32) {
        self.pages
            .lock()
            .unwrap()
            .retain(|&(sid, pno), _| sid != space_id || pno < from_page);
    }

    /// Write all dirty pages of the space back into its data file node and
    /// flush. The page checksum trailer is stamped here.
    pub fn flush_space(&self, space: &FilSpace) -> DbResult<()> {
        let blocks: Vec<Arc<Block>> = {
            let pages = self.pages.lock().unwrap();
            pages
                .values()
                .filter(|b| b.space_id == space.id && b.is_dirty())
                .cloned()
                .collect()
        };
        let mut node = space.node.lock().unwrap();
        let Some(node) = node.as_mut() else {
            return Ok(());
        };
        for block in blocks {
            if block.page_no >= node.size_in_pages() {
                continue;
            }
            let mut frame = block.frame_mut();
            buf_page_stamp_checksum(&mut frame);
            node.write_page(block.page_no, &frame)
                .map_err(|e| DbErr::Io(std::io::Error::other(e.to_string())))?;
            block.dirty.store(false, Ordering::Release);
        }
        node.flush_all()
            .map_err(|e| DbErr::Io(std::io::Error::other(e.to_string())))?;
        Ok(())
    }
}

/// Stamp the full-crc32 trailer: the low 4 bytes of FIL_PAGE_LSN just before
/// the checksum, then crc32c over everything preceding the checksum.
pub fn buf_page_stamp_checksum(frame: &mut [u8]) {
    let size = frame.len();
    let lsn_lo = mach::mach_read_from_4(&frame[(fil0fil::FIL_PAGE_LSN + 4) as usize..]);
    mach::mach_write_to_4(
        &mut frame[size - fil0fil::FIL_PAGE_FCRC32_END_LSN as usize..],
        lsn_lo,
    );
    let crc = crc32c::crc32c(&frame[..size - fil0fil::FIL_PAGE_FCRC32_CHECKSUM as usize]);
    mach::mach_write_to_4(
        &mut frame[size - fil0fil::FIL_PAGE_FCRC32_CHECKSUM as usize..],
        crc,
    );
}

/// Check whether a page read from disk is corrupted.
/// A page filled with NUL bytes is considered not corrupted and has no
/// checksum.
pub fn buf_page_is_corrupted(frame: &[u8]) -> DbResult<()> {
    let size = frame.len();
    let stored =
        mach::mach_read_from_4(&frame[size - fil0fil::FIL_PAGE_FCRC32_CHECKSUM as usize..]);
    if stored == 0 && frame.iter().all(|&b| b == 0) {
        return Ok(());
    }
    let crc = crc32c::crc32c(&frame[..size - fil0fil::FIL_PAGE_FCRC32_CHECKSUM as usize]);
    if crc != stored {
        return Err(DbErr::corruption(format!(
            "page checksum mismatch, expected {stored:#x}, computed {crc:#x}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::{BufferPool, PageGet, buf_page_is_corrupted, buf_page_stamp_checksum};
    use crate::fil0fil::FilSpace;

    #[test]
    fn test_create_and_lookup() {
        let pool = BufferPool::new(4096);
        let space = FilSpace::new(0, 12, false);
        assert!(
            pool.get(&space, 5, PageGet::GetIfInPool)
                .unwrap()
                .is_none()
        );
        let b = pool.get(&space, 5, PageGet::Create).unwrap().unwrap();
        b.frame_mut()[100] = 0xcc;
        let again = pool.get(&space, 5, PageGet::Get).unwrap().unwrap();
        assert_eq!(again.read_1(100), 0xcc);
    }

    #[test]
    fn test_checksum_roundtrip() {
        let mut frame = vec![0u8; 4096];
        frame[38] = 7;
        buf_page_stamp_checksum(&mut frame);
        buf_page_is_corrupted(&frame).unwrap();
        frame[39] ^= 1;
        assert!(buf_page_is_corrupted(&frame).is_err());
    }

    #[test]
    fn test_zero_page_not_corrupted() {
        let frame = vec![0u8; 4096];
        buf_page_is_corrupted(&frame).unwrap();
    }
}
