//! The binlog page fifo: the small in-memory cache of binlog tablespace
//! pages that have not yet been written out to the file. Binlog pages do
//! not go through the general buffer pool; the writer appends into fifo
//! pages, readers may copy them out, and flush_up_to() writes completed
//! pages to the file with their trailing CRC stamped.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};

use crate::db0err::{DbErr, DbResult};

/// One binlog page held in memory.
pub struct FifoPage {
    pub file_no: u64,
    pub page_no: u32,
    frame: RwLock<Box<[u8]>>,
}

impl FifoPage {
    pub fn frame(&self) -> std::sync::RwLockReadGuard<'_, Box<[u8]>> {
        self.frame.read().unwrap()
    }

    pub fn frame_mut(&self) -> std::sync::RwLockWriteGuard<'_, Box<[u8]>> {
        self.frame.write().unwrap()
    }
}

struct FifoFile {
    file_no: u64,
    file: File,
    size_in_pages: u32,
    pages: BTreeMap<u32, Arc<FifoPage>>,
}

struct FifoInner {
    /// At most the two most recent binlog files are open here.
    files: Vec<FifoFile>,
}

pub struct BinlogPageFifo {
    page_size: usize,
    inner: Mutex<FifoInner>,
}

/// Cached pages per file before older ones are written out and dropped;
/// the fifo is a small cache of the pages not yet flushed, not a second
/// copy of the file.
const FIFO_MAX_PAGES: usize = 128;

/// Stamp the trailing CRC and write one page at its file position.
fn crc32_pwrite_page(
    file: &mut File,
    frame: &mut [u8],
    page_no: u32,
    page_size: usize,
) -> io::Result<()> {
    let crc = crc32c::crc32c(&frame[..page_size - 4]);
    frame[page_size - 4..].copy_from_slice(&crc.to_le_bytes());
    file.seek(SeekFrom::Start(page_no as u64 * page_size as u64))?;
    file.write_all(frame)?;
    Ok(())
}

impl BinlogPageFifo {
    pub fn new(page_size: usize) -> BinlogPageFifo {
        BinlogPageFifo {
            page_size,
            inner: Mutex::new(FifoInner { files: Vec::new() }),
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Register a (pre-allocated) binlog file with the fifo.
    pub fn register_file(
        &self,
        file_no: u64,
        path: &Path,
        size_in_pages: u32,
    ) -> DbResult<()> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)?;
        let mut inner = self.inner.lock().unwrap();
        debug_assert!(inner.files.iter().all(|f| f.file_no != file_no));
        inner.files.push(FifoFile {
            file_no,
            file,
            size_in_pages,
            pages: BTreeMap::new(),
        });
        // Only the two most recent files are ever open.
        debug_assert!(inner.files.len() <= 2);
        Ok(())
    }

    pub fn is_registered(&self, file_no: u64) -> bool {
        self.inner
            .lock()
            .unwrap()
            .files
            .iter()
            .any(|f| f.file_no == file_no)
    }

    pub fn size_in_pages(&self, file_no: u64) -> u32 {
        self.inner
            .lock()
            .unwrap()
            .files
            .iter()
            .find(|f| f.file_no == file_no)
            .map(|f| f.size_in_pages)
            .unwrap_or(0)
    }

    /// Create a fresh in-memory page for the writer. Overflowing pages of
    /// the same file are written out and dropped, oldest first.
    pub fn create_page(&self, file_no: u64, page_no: u32) -> DbResult<Arc<FifoPage>> {
        let mut inner = self.inner.lock().unwrap();
        let file = inner
            .files
            .iter_mut()
            .find(|f| f.file_no == file_no)
            .ok_or_else(|| DbErr::corruption(format!("binlog file {file_no} not open")))?;
        let page = Arc::new(FifoPage {
            file_no,
            page_no,
            frame: RwLock::new(vec![0u8; self.page_size].into_boxed_slice()),
        });
        file.pages.insert(page_no, page.clone());

        while file.pages.len() > FIFO_MAX_PAGES {
            let oldest = *file.pages.keys().next().unwrap();
            if oldest == page_no {
                break;
            }
            let old = file.pages.remove(&oldest).unwrap();
            let mut frame = old.frame_mut();
            crc32_pwrite_page(&mut file.file, &mut frame, oldest, self.page_size)?;
        }
        Ok(page)
    }

    /// Insert a page whose current content was read back from disk
    /// (continuing a partially written file after restart).
    pub fn install_page(&self, file_no: u64, page_no: u32, frame: Vec<u8>) -> DbResult<()> {
        assert_eq!(frame.len(), self.page_size);
        let mut inner = self.inner.lock().unwrap();
        let file = inner
            .files
            .iter_mut()
            .find(|f| f.file_no == file_no)
            .ok_or_else(|| DbErr::corruption(format!("binlog file {file_no} not open")))?;
        file.pages.insert(
            page_no,
            Arc::new(FifoPage {
                file_no,
                page_no,
                frame: RwLock::new(frame.into_boxed_slice()),
            }),
        );
        Ok(())
    }

    /// Look up a page still cached in the fifo.
    pub fn get_page(&self, file_no: u64, page_no: u32) -> Option<Arc<FifoPage>> {
        let inner = self.inner.lock().unwrap();
        inner
            .files
            .iter()
            .find(|f| f.file_no == file_no)
            .and_then(|f| f.pages.get(&page_no).cloned())
    }

    /// Write out all cached pages of files up to `file_no`, and of
    /// `file_no` itself all pages up to and including `page_no`. Fully
    /// flushed pages are dropped from the cache, except the highest one of
    /// each file, which the writer may still be appending into.
    pub fn flush_up_to(&self, file_no: u64, page_no: u32) -> DbResult<()> {
        let mut inner = self.inner.lock().unwrap();
        for f in inner.files.iter_mut() {
            if f.file_no > file_no {
                continue;
            }
            let limit = if f.file_no < file_no {
                u32::MAX
            } else {
                page_no
            };
            let last_cached = f.pages.keys().next_back().copied();
            let to_flush: Vec<u32> =
                f.pages.keys().copied().filter(|&p| p <= limit).collect();
            for p in to_flush {
                let page = f.pages.get(&p).cloned().unwrap();
                let mut frame = page.frame_mut();
                crc32_pwrite_page(&mut f.file, &mut frame, p, self.page_size)?;
                drop(frame);
                if Some(p) != last_cached {
                    f.pages.remove(&p);
                }
            }
        }
        Ok(())
    }

    /// Flush everything of every open file.
    pub fn flush_all(&self) -> DbResult<()> {
        let max = {
            let inner = self.inner.lock().unwrap();
            inner.files.iter().map(|f| f.file_no).max()
        };
        if let Some(max) = max {
            self.flush_up_to(max, u32::MAX)?;
        }
        Ok(())
    }

    pub fn do_fdatasync(&self, file_no: u64) -> DbResult<()> {
        let inner = self.inner.lock().unwrap();
        if let Some(f) = inner.files.iter().find(|f| f.file_no == file_no) {
            f.file.sync_data()?;
        }
        Ok(())
    }

    /// Flush, sync and deregister a file after it stops being active.
    pub fn close_file(&self, file_no: u64) -> DbResult<()> {
        self.flush_up_to(file_no, u32::MAX)?;
        let mut inner = self.inner.lock().unwrap();
        if let Some(idx) = inner.files.iter().position(|f| f.file_no == file_no) {
            inner.files[idx].file.sync_data()?;
            inner.files.remove(idx);
        }
        Ok(())
    }

    /// Drop every open file without flushing (RESET MASTER).
    pub fn reset(&self) {
        self.inner.lock().unwrap().files.clear();
    }
}

#[cfg(test)]
mod test {
    use super::BinlogPageFifo;
    use crate::binlog0files::crc32_pread_page;

    #[test]
    fn test_create_flush_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("binlog-000000.ibb");
        std::fs::write(&path, vec![0u8; 4096 * 4]).unwrap();

        let fifo = BinlogPageFifo::new(4096);
        fifo.register_file(0, &path, 4).unwrap();

        let page = fifo.create_page(0, 1).unwrap();
        page.frame_mut()[38] = 0x41;
        fifo.flush_up_to(0, 1).unwrap();
        fifo.do_fdatasync(0).unwrap();

        let mut f = std::fs::File::open(&path).unwrap();
        let buf = crc32_pread_page(&mut f, 1, 4096).unwrap().unwrap();
        assert_eq!(buf[38], 0x41);
    }

    #[test]
    fn test_highest_page_stays_cached() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("binlog-000001.ibb");
        std::fs::write(&path, vec![0u8; 4096 * 4]).unwrap();

        let fifo = BinlogPageFifo::new(4096);
        fifo.register_file(1, &path, 4).unwrap();
        fifo.create_page(1, 1).unwrap();
        fifo.create_page(1, 2).unwrap();
        fifo.flush_up_to(1, 2).unwrap();
        // Page 1 was dropped after the flush, page 2 may still grow.
        assert!(fifo.get_page(1, 1).is_none());
        assert!(fifo.get_page(1, 2).is_some());
    }
}
