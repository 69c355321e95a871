//! Binlog file naming, directory scanning and the file reference tracker
//! that keeps binlog files pinned while out-of-band data or pending XA
//! transactions still reference them.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

pub const BINLOG_NAME_BASE: &str = "binlog-";
pub const BINLOG_NAME_EXT: &str = ".ibb";

pub const NO_FILE: u64 = u64::MAX;

/// Build the path of binlog file `file_no`: zero-padded 6-digit decimal
/// number (more digits when the number outgrows six).
pub fn binlog_name_make(dir: &Path, file_no: u64) -> PathBuf {
    dir.join(format!("{BINLOG_NAME_BASE}{file_no:06}{BINLOG_NAME_EXT}"))
}

pub fn binlog_name_short(file_no: u64) -> String {
    format!("{BINLOG_NAME_BASE}{file_no:06}{BINLOG_NAME_EXT}")
}

/// Check if this is a binlog file name; return the file_no if so.
/// The middle must be all decimal digits; leading zeros beyond six digits
/// are accepted.
pub fn is_binlog_name(name: &str) -> Option<u64> {
    let rest = name.strip_prefix(BINLOG_NAME_BASE)?;
    let digits = rest.strip_suffix(BINLOG_NAME_EXT)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse::<u64>().ok()
}

/// The last, last-but-one and earliest binlog files found by a directory
/// scan, plus size accounting for purge-by-size.
#[derive(Debug, Clone, Copy)]
pub struct FoundBinlogs {
    pub last_file_no: u64,
    pub prev_file_no: u64,
    pub earliest_file_no: u64,
    pub last_size: u64,
    pub prev_size: u64,
    pub total_size: u64,
    pub num_found: u32,
}

impl Default for FoundBinlogs {
    fn default() -> Self {
        FoundBinlogs {
            last_file_no: 0,
            prev_file_no: 0,
            earliest_file_no: 0,
            last_size: 0,
            prev_size: 0,
            total_size: 0,
            num_found: 0,
        }
    }
}

/// Fold one directory entry into the scan result.
pub fn process_binlog_name(bls: &mut FoundBinlogs, idx: u64, size: u64) {
    if bls.num_found == 0 {
        bls.earliest_file_no = idx;
        bls.total_size = size;
    } else {
        if idx < bls.earliest_file_no {
            bls.earliest_file_no = idx;
        }
        bls.total_size += size;
    }

    if bls.num_found == 0 || idx > bls.last_file_no {
        if bls.num_found >= 1 && idx == bls.last_file_no + 1 {
            bls.prev_file_no = bls.last_file_no;
            bls.prev_size = bls.last_size;
            bls.num_found = 2;
        } else {
            bls.num_found = 1;
        }
        bls.last_file_no = idx;
        bls.last_size = size;
    } else if bls.num_found == 1 && idx + 1 == bls.last_file_no {
        bls.num_found = 2;
        bls.prev_file_no = idx;
        bls.prev_size = size;
    }
}

/// Scan the binlog directory. Returns None when the directory itself does
/// not exist.
pub fn scan_for_binlogs(binlog_dir: &Path) -> io::Result<Option<FoundBinlogs>> {
    let entries = match std::fs::read_dir(binlog_dir) {
        Ok(e) => e,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            log::error!(
                "could not read the binlog directory '{}': {e}",
                binlog_dir.display()
            );
            return Err(e);
        }
    };

    let mut found = FoundBinlogs::default();
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(idx) = is_binlog_name(name) else {
            continue;
        };
        let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
        process_binlog_name(&mut found, idx, size);
    }
    Ok(Some(found))
}

/// Read one page from a binlog file and verify its trailing CRC.
/// Returns Ok(None) on a short read (page beyond EOF).
pub fn crc32_pread_page(
    file: &mut File,
    page_no: u32,
    page_size: usize,
) -> io::Result<Option<Vec<u8>>> {
    let mut buf = vec![0u8; page_size];
    file.seek(SeekFrom::Start(page_no as u64 * page_size as u64))?;
    let mut read = 0;
    while read < page_size {
        match file.read(&mut buf[read..]) {
            Ok(0) => break,
            Ok(n) => read += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    if read == 0 {
        return Ok(None);
    }
    if read < page_size {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("short page read: {read} of {page_size} bytes"),
        ));
    }
    let stored = u32::from_le_bytes(buf[page_size - 4..].try_into().unwrap());
    if stored == 0 && buf.iter().all(|&b| b == 0) {
        return Ok(Some(buf));
    }
    let crc = crc32c::crc32c(&buf[..page_size - 4]);
    if crc != stored {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("page {page_no} checksum mismatch: stored {stored:#x}, computed {crc:#x}"),
        ));
    }
    Ok(Some(buf))
}

struct FileEntry {
    /// Earliest file_no referenced by OOB data from this file (from the
    /// header page, or NO_FILE when unknown/none).
    oob_ref_file_no: u64,
    /// Earliest file_no referenced by pending XA from this file.
    xa_ref_file_no: u64,
    /// Number of live references (open transactions with OOB data whose
    /// first node is here, pending XA PREPARE records) pinning this file.
    ref_count: u64,
}

/// Tracks which binlog files are pinned by live out-of-band or XA
/// references, plus the per-file header back-references. The original keeps
/// this in a lock-free hash; a mutex-protected map carries the same policy.
pub struct FileHash {
    inner: Mutex<HashMap<u64, FileEntry>>,
    /// The earliest file_no with a live reference; equals the active
    /// file_no when nothing is pinned. Published to new file headers.
    pub earliest_oob_ref: AtomicU64,
    pub earliest_xa_ref: AtomicU64,
}

impl Default for FileHash {
    fn default() -> Self {
        FileHash {
            inner: Mutex::new(HashMap::new()),
            earliest_oob_ref: AtomicU64::new(0),
            earliest_xa_ref: AtomicU64::new(NO_FILE),
        }
    }
}

impl FileHash {
    /// Record a file with the back-references found in its header page.
    pub fn record(&self, file_no: u64, oob_ref_file_no: u64, xa_ref_file_no: u64) {
        let mut inner = self.inner.lock().unwrap();
        inner.entry(file_no).or_insert(FileEntry {
            oob_ref_file_no,
            xa_ref_file_no,
            ref_count: 0,
        });
    }

    /// Pin `file_no`; returns false when the file was unknown (the caller
    /// keeps a pending-refcount flag in that case).
    pub fn oob_ref_inc(&self, file_no: u64) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner.entry(file_no).or_insert(FileEntry {
            oob_ref_file_no: NO_FILE,
            xa_ref_file_no: NO_FILE,
            ref_count: 0,
        });
        entry.ref_count += 1;
        self.earliest_oob_ref.fetch_min(file_no, Ordering::AcqRel);
        true
    }

    pub fn oob_ref_dec(&self, file_no: u64) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.get_mut(&file_no) {
            if entry.ref_count > 0 {
                entry.ref_count -= 1;
            }
        }
    }

    /// True when the file still carries live references and must not be
    /// purged.
    pub fn ref_in_use(&self, file_no: u64) -> bool {
        self.inner
            .lock()
            .unwrap()
            .get(&file_no)
            .is_some_and(|e| e.ref_count > 0)
    }

    /// True when any file in [first, last] carries a live reference.
    pub fn any_ref_in_use(&self, first: u64, last: u64) -> bool {
        self.inner
            .lock()
            .unwrap()
            .iter()
            .any(|(&f, e)| f >= first && f <= last && e.ref_count > 0)
    }

    /// The header-recorded earliest OOB reference of a file, if known.
    pub fn oob_ref_file_no(&self, file_no: u64) -> Option<u64> {
        self.inner
            .lock()
            .unwrap()
            .get(&file_no)
            .map(|e| e.oob_ref_file_no)
    }

    /// Lower the pending-XA watermark to `file_no` (XA PREPARE registered,
    /// or a header back-reference found at discovery).
    pub fn xa_ref_pin(&self, file_no: u64) {
        self.earliest_xa_ref.fetch_min(file_no, Ordering::AcqRel);
    }

    /// Recompute the pending-XA watermark after an XID completed; None
    /// means no XA PREPARE pins any file.
    pub fn xa_ref_reset(&self, earliest: Option<u64>) {
        self.earliest_xa_ref
            .store(earliest.unwrap_or(NO_FILE), Ordering::Release);
    }

    /// Refresh the earliest-reference watermarks for a new header page:
    /// with no live pins, the new file references only itself.
    pub fn update_refs(&self, file_no: u64) -> (u64, u64) {
        let inner = self.inner.lock().unwrap();
        let earliest_live = inner
            .iter()
            .filter(|(_, e)| e.ref_count > 0)
            .map(|(&f, _)| f)
            .min();
        drop(inner);
        let oob_ref = earliest_live.unwrap_or(file_no);
        self.earliest_oob_ref.store(oob_ref, Ordering::Release);
        let xa_ref = self.earliest_xa_ref.load(Ordering::Acquire);
        (oob_ref, xa_ref)
    }

    pub fn remove(&self, file_no: u64) {
        self.inner.lock().unwrap().remove(&file_no);
    }

    pub fn remove_up_to(&self, file_no: u64) {
        self.inner.lock().unwrap().retain(|&f, _| f > file_no);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_name_grammar() {
        assert_eq!(is_binlog_name("binlog-000000.ibb"), Some(0));
        assert_eq!(is_binlog_name("binlog-001234.ibb"), Some(1234));
        assert_eq!(is_binlog_name("binlog-0001234567.ibb"), Some(1234567));
        assert_eq!(is_binlog_name("binlog-.ibb"), None);
        assert_eq!(is_binlog_name("binlog-12x4.ibb"), None);
        assert_eq!(is_binlog_name("binlog-1234.IBB"), None);
        assert_eq!(is_binlog_name("mysql-bin.000001"), None);
    }

    #[test]
    fn test_name_make_roundtrip() {
        let path = binlog_name_make(Path::new("/tmp"), 42);
        let name = path.file_name().unwrap().to_str().unwrap();
        assert_eq!(name, "binlog-000042.ibb");
        assert_eq!(is_binlog_name(name), Some(42));
    }

    #[test]
    fn test_process_binlog_name() {
        let mut bls = FoundBinlogs::default();
        process_binlog_name(&mut bls, 5, 100);
        assert_eq!(bls.num_found, 1);
        process_binlog_name(&mut bls, 6, 100);
        assert_eq!(bls.num_found, 2);
        assert_eq!((bls.prev_file_no, bls.last_file_no), (5, 6));
        process_binlog_name(&mut bls, 3, 50);
        assert_eq!(bls.earliest_file_no, 3);
        assert_eq!(bls.total_size, 250);
        assert_eq!(bls.last_file_no, 6);
    }

    #[test]
    fn test_file_hash_pins() {
        let hash = FileHash::default();
        hash.record(7, NO_FILE, NO_FILE);
        assert!(!hash.ref_in_use(7));
        hash.oob_ref_inc(7);
        assert!(hash.ref_in_use(7));
        assert!(hash.any_ref_in_use(0, 10));
        hash.oob_ref_dec(7);
        assert!(!hash.ref_in_use(7));
        let (oob_ref, _) = hash.update_refs(9);
        assert_eq!(oob_ref, 9);
    }
}
