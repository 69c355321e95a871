//! Mini-transactions: the only mechanism by which persistent pages change.
//! An MTR stages page modifications together with the redo records that
//! describe them; commit atomically appends the redo group to the global
//! stream, stamps the modified pages with the commit LSN, and releases all
//! latches taken.

use std::sync::Arc;

use crate::Lsn;
use crate::buf0buf::Block;
use crate::fil0fil::{self, FilSpace};
use crate::log::{Redo, RedoRec};
use crate::mach;

/// How a staged write treats a value identical to what the page already
/// holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// The caller knows the value is changing.
    Normal,
    /// Writing the same value is allowed and elided.
    MaybeNop,
    /// Write and log even if the value is unchanged. Used where recovery
    /// expects full coverage of the byte range (e.g. FSP_SIZE).
    Forced,
}

pub struct Mtr {
    redo: Option<Arc<Redo>>,
    recs: Vec<RedoRec>,
    modified: Vec<Arc<Block>>,
    locked_spaces: Vec<Arc<FilSpace>>,
    commit_lsn: Lsn,
    committed: bool,
}

impl Mtr {
    pub fn start(redo: Arc<Redo>) -> Mtr {
        Mtr {
            redo: Some(redo),
            recs: Vec::new(),
            modified: Vec::new(),
            locked_spaces: Vec::new(),
            commit_lsn: 0,
            committed: false,
        }
    }

    /// An MTR that logs no redo (temporary tablespace operations).
    pub fn start_no_redo() -> Mtr {
        Mtr {
            redo: None,
            recs: Vec::new(),
            modified: Vec::new(),
            locked_spaces: Vec::new(),
            commit_lsn: 0,
            committed: false,
        }
    }

    /// Acquire the tablespace SX latch for the duration of this MTR.
    pub fn x_lock_space(&mut self, space: &Arc<FilSpace>) {
        if self
            .locked_spaces
            .iter()
            .any(|s| Arc::ptr_eq(s, space))
        {
            return;
        }
        space.latch.x_lock();
        self.locked_spaces.push(space.clone());
    }

    fn set_modified(&mut self, block: &Arc<Block>) {
        block.set_dirty();
        if !self.modified.iter().any(|b| Arc::ptr_eq(b, block)) {
            self.modified.push(block.clone());
        }
    }

    fn log_write(&mut self, block: &Block, offset: u32, data: Vec<u8>) {
        self.recs.push(RedoRec::Write {
            space_id: block.space_id,
            page_no: block.page_no,
            offset: offset as u16,
            data,
        });
    }

    fn write_n(
        &mut self,
        block: &Arc<Block>,
        offset: u32,
        bytes: &[u8],
        mode: WriteMode,
    ) {
        {
            let mut frame = block.frame_mut();
            let dst = &mut frame[offset as usize..offset as usize + bytes.len()];
            if dst == bytes {
                match mode {
                    WriteMode::MaybeNop => return,
                    WriteMode::Normal => {
                        debug_assert!(false, "no-change write at offset {offset}");
                        return;
                    }
                    WriteMode::Forced => {}
                }
            }
            dst.copy_from_slice(bytes);
        }
        self.set_modified(block);
        self.log_write(block, offset, bytes.to_vec());
    }

    pub fn write_1(&mut self, block: &Arc<Block>, offset: u32, val: u8, mode: WriteMode) {
        self.write_n(block, offset, &[val], mode);
    }

    pub fn write_2(&mut self, block: &Arc<Block>, offset: u32, val: u16, mode: WriteMode) {
        let mut buf = [0u8; 2];
        mach::mach_write_to_2(&mut buf, val);
        self.write_n(block, offset, &buf, mode);
    }

    pub fn write_4(&mut self, block: &Arc<Block>, offset: u32, val: u32, mode: WriteMode) {
        let mut buf = [0u8; 4];
        mach::mach_write_to_4(&mut buf, val);
        self.write_n(block, offset, &buf, mode);
    }

    pub fn write_8(&mut self, block: &Arc<Block>, offset: u32, val: u64, mode: WriteMode) {
        let mut buf = [0u8; 8];
        mach::mach_write_to_8(&mut buf, val);
        self.write_n(block, offset, &buf, mode);
    }

    /// Write a file list address (page number + byte offset).
    pub fn write_addr(
        &mut self,
        block: &Arc<Block>,
        offset: u32,
        page: u32,
        boffset: u16,
        mode: WriteMode,
    ) {
        let mut buf = [0u8; 6];
        mach::mach_write_addr(&mut buf, page, boffset);
        self.write_n(block, offset, &buf, mode);
    }

    /// Copy a byte string onto the page.
    pub fn memcpy(&mut self, block: &Arc<Block>, offset: u32, data: &[u8]) {
        {
            let mut frame = block.frame_mut();
            frame[offset as usize..offset as usize + data.len()].copy_from_slice(data);
        }
        self.set_modified(block);
        self.log_write(block, offset, data.to_vec());
    }

    /// Fill a byte range on the page with one value.
    pub fn memset(&mut self, block: &Arc<Block>, offset: u32, len: u32, val: u8) {
        {
            let mut frame = block.frame_mut();
            frame[offset as usize..(offset + len) as usize].fill(val);
        }
        self.set_modified(block);
        self.recs.push(RedoRec::Memset {
            space_id: block.space_id,
            page_no: block.page_no,
            offset: offset as u16,
            len: len as u16,
            val,
        });
    }

    /// Zero-initialize a freshly allocated page and stamp its id fields.
    pub fn init_page(&mut self, block: &Arc<Block>) {
        {
            let mut frame = block.frame_mut();
            frame.fill(0);
            mach::mach_write_to_4(
                &mut frame[fil0fil::FIL_PAGE_OFFSET as usize..],
                block.page_no,
            );
            mach::mach_write_to_4(
                &mut frame[fil0fil::FIL_PAGE_PREV as usize..],
                fil0fil::FIL_NULL,
            );
            mach::mach_write_to_4(
                &mut frame[fil0fil::FIL_PAGE_NEXT as usize..],
                fil0fil::FIL_NULL,
            );
            mach::mach_write_to_4(
                &mut frame[fil0fil::FIL_PAGE_SPACE_ID as usize..],
                block.space_id,
            );
        }
        self.set_modified(block);
        self.recs.push(RedoRec::InitPage {
            space_id: block.space_id,
            page_no: block.page_no,
        });
    }

    /// Log that a page was freed; the page contents may be discarded.
    pub fn free_page(&mut self, space_id: u32, page_no: u32) {
        self.recs.push(RedoRec::FreePage { space_id, page_no });
    }

    /// Log a byte write into a binlog tablespace page that is held in the
    /// binlog page fifo rather than the buffer pool. The caller has already
    /// updated the page buffer.
    pub fn binlog_write(&mut self, space_id: u32, page_no: u32, offset: u32, data: &[u8]) {
        self.recs.push(RedoRec::Write {
            space_id,
            page_no,
            offset: offset as u16,
            data: data.to_vec(),
        });
    }

    /// Rough serialized size of the staged redo, used to bound oversized
    /// MTRs (tablespace shrink).
    pub fn estimated_log_size(&self) -> usize {
        self.recs
            .iter()
            .map(|r| match r {
                RedoRec::Write { data, .. } => 16 + data.len(),
                _ => 16,
            })
            .sum()
    }

    pub fn has_modifications(&self) -> bool {
        !self.recs.is_empty()
    }

    /// Discard all staged redo without writing it. The caller is
    /// responsible for restoring the page contents (shadow pages).
    pub fn discard(&mut self) {
        self.recs.clear();
        self.release();
        self.committed = true;
    }

    fn release(&mut self) {
        for space in self.locked_spaces.drain(..) {
            space.latch.x_unlock();
        }
        self.modified.clear();
    }

    /// Atomically append the staged redo group to the global stream, stamp
    /// modified pages with the commit LSN, and release latches.
    pub fn commit(&mut self) -> Lsn {
        assert!(!self.committed, "mtr committed twice");
        self.committed = true;
        if self.recs.is_empty() {
            self.release();
            return 0;
        }
        let recs = std::mem::take(&mut self.recs);
        let end_lsn = match &self.redo {
            Some(redo) => {
                let (_, end_lsn) = redo.append_group(recs);
                end_lsn
            }
            None => 0,
        };
        self.commit_lsn = end_lsn;
        if end_lsn != 0 {
            for block in &self.modified {
                let mut frame = block.frame_mut();
                mach::mach_write_to_8(&mut frame[fil0fil::FIL_PAGE_LSN as usize..], end_lsn);
            }
        }
        self.release();
        end_lsn
    }

    pub fn commit_lsn(&self) -> Lsn {
        self.commit_lsn
    }
}

impl Drop for Mtr {
    fn drop(&mut self) {
        if !self.committed && !self.locked_spaces.is_empty() {
            // An MTR abandoned on an error path still must release latches.
            self.release();
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use super::{Mtr, WriteMode};
    use crate::buf0buf::{BufferPool, PageGet};
    use crate::fil0fil::FilSpace;
    use crate::log::Redo;

    #[test]
    fn test_write_and_commit() {
        let redo = Arc::new(Redo::new());
        let pool = BufferPool::new(4096);
        let space = Arc::new(FilSpace::new(0, 12, false));

        let block = pool.get(&space, 0, PageGet::Create).unwrap().unwrap();
        let mut mtr = Mtr::start(redo.clone());
        mtr.x_lock_space(&space);
        mtr.init_page(&block);
        mtr.write_4(&block, 100, 0xdeadbeef, WriteMode::MaybeNop);
        let lsn = mtr.commit();
        assert!(lsn > 0);
        assert_eq!(block.read_4(100), 0xdeadbeef);
        assert_eq!(block.read_8(crate::fil0fil::FIL_PAGE_LSN), lsn);
        assert!(!space.latch.is_owner());
        assert_eq!(redo.groups().len(), 1);
    }

    #[test]
    fn test_maybe_nop_elides() {
        let redo = Arc::new(Redo::new());
        let pool = BufferPool::new(4096);
        let space = Arc::new(FilSpace::new(0, 12, false));
        let block = pool.get(&space, 1, PageGet::Create).unwrap().unwrap();

        let mut mtr = Mtr::start(redo.clone());
        mtr.write_4(&block, 64, 0, WriteMode::MaybeNop);
        assert!(!mtr.has_modifications());
        mtr.write_4(&block, 64, 0, WriteMode::Forced);
        assert!(mtr.has_modifications());
        mtr.commit();
    }
}
