#![allow(clippy::len_without_is_empty)]

use std::fs::{File, OpenOptions};
use std::ops::Range;
use std::path::{Path, PathBuf};

use anyhow::Context;
use mmap_rs::{MmapMut, MmapOptions};

/// A memory-mapped data file backing one tablespace. The mapping is
/// recreated when the file grows or shrinks.
pub struct DataFileNode {
    path: PathBuf,
    file: File,
    m: MmapMut,
    page_size: usize,
}

impl DataFileNode {
    /// Create (or truncate) a data file of `size_in_pages` pages.
    pub fn create(
        file_path: &Path,
        page_size: usize,
        size_in_pages: u32,
    ) -> anyhow::Result<DataFileNode> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(file_path)
            .with_context(|| format!("create data file at {}", file_path.display()))?;
        file.set_len(size_in_pages as u64 * page_size as u64)
            .context("allocate data file")?;
        Self::map(file_path.to_path_buf(), file, page_size)
    }

    /// Open an existing data file.
    pub fn open(file_path: &Path, page_size: usize) -> anyhow::Result<DataFileNode> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(file_path)
            .with_context(|| format!("open data file at {}", file_path.display()))?;

        let size = file.metadata().context("get metadata for data file")?.len();
        if page_size == 0 || size % page_size as u64 != 0 {
            return Err(anyhow::anyhow!(
                "data file size {size} is not a multiple of page size {page_size}",
            ));
        }
        Self::map(file_path.to_path_buf(), file, page_size)
    }

    fn map(path: PathBuf, file: File, page_size: usize) -> anyhow::Result<DataFileNode> {
        let size = file.metadata().context("get metadata for data file")?.len();
        let m = unsafe {
            MmapOptions::new(size as usize)
                .context("mmap option")?
                .with_file(&file, 0u64)
                .with_flags(mmap_rs::MmapFlags::SHARED)
                .map_mut()
                .context("mmap data file")?
        };
        Ok(DataFileNode {
            path,
            file,
            m,
            page_size,
        })
    }

    pub fn len(&self) -> usize {
        self.m.len()
    }

    pub fn size_in_pages(&self) -> u32 {
        (self.m.len() / self.page_size) as u32
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn page(&self, page_no: u32) -> Option<&[u8]> {
        let pos = page_no as usize * self.page_size;
        if pos + self.page_size > self.m.len() {
            return None;
        }
        Some(&self.m.as_slice()[pos..pos + self.page_size])
    }

    pub fn write_page(&mut self, page_no: u32, frame: &[u8]) -> anyhow::Result<()> {
        assert_eq!(frame.len(), self.page_size);
        let pos = page_no as usize * self.page_size;
        if pos + self.page_size > self.m.len() {
            return Err(anyhow::anyhow!(
                "page {page_no} is beyond the end of {}",
                self.path.display()
            ));
        }
        self.m.as_mut_slice()[pos..pos + self.page_size].copy_from_slice(frame);
        Ok(())
    }

    pub fn flush(&self, range: Range<usize>) -> anyhow::Result<()> {
        self.m.flush(range)?;
        Ok(())
    }

    pub fn flush_all(&self) -> anyhow::Result<()> {
        self.m.flush(0..self.len())?;
        Ok(())
    }

    /// Grow or shrink the physical file, remapping it.
    pub fn resize(&mut self, size_in_pages: u32) -> anyhow::Result<()> {
        let new_len = size_in_pages as u64 * self.page_size as u64;
        self.file
            .set_len(new_len)
            .with_context(|| format!("resize data file {}", self.path.display()))?;
        let file = self
            .file
            .try_clone()
            .context("clone data file handle for remap")?;
        let remapped = Self::map(self.path.clone(), file, self.page_size)?;
        *self = remapped;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::DataFileNode;

    #[test]
    fn test_create_resize() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t0.ibd");
        let mut node = DataFileNode::create(&path, 4096, 4).unwrap();
        assert_eq!(node.size_in_pages(), 4);

        let frame = vec![0xabu8; 4096];
        node.write_page(3, &frame).unwrap();
        assert_eq!(node.page(3).unwrap()[100], 0xab);
        assert!(node.page(4).is_none());

        node.resize(8).unwrap();
        assert_eq!(node.size_in_pages(), 8);
        assert_eq!(node.page(3).unwrap()[100], 0xab);
        assert_eq!(node.page(7).unwrap()[0], 0);
    }
}
