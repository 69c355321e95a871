//! Crash recovery of the binlog tablespace files, driven entirely by
//! applying redo records. The recovery object chooses which file the first
//! record belongs to (matching the alternating space id against the file
//! start LSNs), then rebuilds pages strictly in order, writing each
//! completed page out with its checksum.

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::Lsn;
use crate::binlog0files::{
    FoundBinlogs, NO_FILE, binlog_name_make, crc32_pread_page, scan_for_binlogs,
};
use crate::db0err::{DbErr, DbResult};
use crate::fsp0binlog::{
    BINLOG_PAGE_CHECKSUM, BINLOG_PAGE_DATA, BINLOG_PAGE_DATA_END, IBB_HEADER_PAGE_SIZE,
    binlog_space_id, fsp_binlog_extract_header_page, get_binlog_header,
};
use crate::fsp0types::SRV_SPACE_ID_BINLOG0;
use crate::log::{RedoGroup, RedoRec};

/// State for recovering binlog tablespace files from redo.
pub struct BinlogRecovery {
    dir: PathBuf,
    page_size: usize,
    page_size_shift: u32,
    force_recovery: bool,

    scan_result: FoundBinlogs,
    page_buf: Vec<u8>,

    cur_file_no: u64,
    cur_phys_size: u64,
    start_file_lsn: Lsn,

    prev_lsn: Lsn,
    prev_space_id: bool,
    prev_page_no: u32,
    prev_offset: u16,

    cur_file: Option<File>,
    cur_page_no: u32,
    cur_page_offset: u32,

    inited: bool,
    skip_recovery: bool,
    start_empty: bool,
    ignore_last: bool,
    skipping_early_lsn: bool,
    skipping_partial_page: bool,
}

impl BinlogRecovery {
    pub fn new(dir: &Path, page_size_shift: u32, force_recovery: bool) -> BinlogRecovery {
        BinlogRecovery {
            dir: dir.to_path_buf(),
            page_size: 1usize << page_size_shift,
            page_size_shift,
            force_recovery,
            scan_result: FoundBinlogs::default(),
            page_buf: Vec::new(),
            cur_file_no: 0,
            cur_phys_size: 0,
            start_file_lsn: 0,
            prev_lsn: 0,
            prev_space_id: false,
            prev_page_no: 0,
            prev_offset: 0,
            cur_file: None,
            cur_page_no: 0,
            cur_page_offset: 0,
            inited: false,
            skip_recovery: false,
            start_empty: false,
            ignore_last: false,
            skipping_early_lsn: false,
            skipping_partial_page: true,
        }
    }

    fn get_header(&mut self, file_no: u64) -> DbResult<(Lsn, bool, bool)> {
        let path = binlog_name_make(&self.dir, file_no);
        match get_binlog_header(&path, self.page_size)? {
            None => Ok((0, true, true)),
            Some(h) if h.is_invalid => Ok((0, true, true)),
            Some(h) if h.is_empty => Ok((0, true, false)),
            Some(h) => Ok((h.start_lsn, false, false)),
        }
    }

    /// First record seen: pick the file the recovery starts in.
    ///
    /// Before file N+2 is allocated, file N has been flushed and synced, so
    /// only the two most recent files can need recovery. When the last two
    /// files are both empty, the most recent is ignored (deleted only after
    /// successful recovery) and the two prior files considered; the third
    /// consecutive empty file is unrecoverable without force-recovery.
    fn init_recovery(
        &mut self,
        space_id: bool,
        page_no: u32,
        offset: u16,
        start_lsn: Lsn,
        data: &[u8],
    ) -> DbResult<()> {
        self.page_buf = vec![0u8; self.page_size];
        self.inited = true;

        let Some(scan) = scan_for_binlogs(&self.dir)? else {
            self.init_recovery_empty();
            return Ok(());
        };
        self.scan_result = scan;

        self.ignore_last = false;
        let mut file_no2 = self.scan_result.last_file_no;
        let mut file_no1 = self.scan_result.prev_file_no;
        let mut num_binlogs = self.scan_result.num_found;
        loop {
            let (lsn2, is_empty2, _missing2) = self.get_header(file_no2)?;

            if num_binlogs == 0 || (num_binlogs == 1 && is_empty2) {
                self.init_recovery_empty();
                return Ok(());
            }
            if num_binlogs == 1 {
                // Only one binlog file found. The record may apply to the
                // (purged) previous file, to this one, or only to the
                // following one; a record at (page 0, offset 0) with an LSN
                // at or past this file's start can only begin the next
                // file, since mini-transactions are smaller than a file.
                let mut start_file_no = file_no2;
                if space_id != (file_no2 & 1 != 0)
                    && start_lsn >= lsn2
                    && page_no == 0
                    && offset == 0
                {
                    start_file_no += 1;
                }
                return self
                    .init_recovery_from(start_file_no, lsn2, page_no, offset, start_lsn, data);
            }

            let (lsn1, is_empty1, _missing1) = self.get_header(file_no1)?;

            if is_empty1 && is_empty2 {
                if !self.ignore_last {
                    self.ignore_last = true;
                    if file_no2 > self.scan_result.earliest_file_no {
                        file_no2 -= 1;
                        if file_no1 > self.scan_result.earliest_file_no {
                            file_no1 -= 1;
                        } else {
                            num_binlogs -= 1;
                        }
                    } else {
                        num_binlogs -= 1;
                    }
                    continue;
                }
                if self.force_recovery {
                    // Three empty files leave no LSN to match records
                    // against; with force recovery, skip binlog recovery
                    // entirely.
                    log::warn!(
                        "binlog file recovery is not possible; skipped due to force recovery"
                    );
                    self.skip_recovery = true;
                    return Ok(());
                }
                return Err(DbErr::corruption(
                    "last 3 binlog files are all empty; recovery is not possible",
                ));
            }
            if is_empty2 {
                // As in the single-file case, distinguish whether the
                // record belongs before or after file_no1.
                if space_id != (file_no1 & 1 != 0)
                    && start_lsn >= lsn1
                    && page_no == 0
                    && offset == 0
                {
                    return self
                        .init_recovery_from(file_no2, lsn1, page_no, offset, start_lsn, data);
                }
                return self
                    .init_recovery_from(file_no1, lsn1, page_no, offset, start_lsn, data);
            }
            if space_id == (file_no2 & 1 != 0) && start_lsn >= lsn2 {
                // The record must apply to the most recent file.
                return self
                    .init_recovery_from(file_no2, lsn2, page_no, offset, start_lsn, data);
            }
            // Wrong space bit or too-early LSN: start from the prior file.
            return self.init_recovery_from(file_no1, lsn1, page_no, offset, start_lsn, data);
        }
    }

    fn init_recovery_from(
        &mut self,
        file_no: u64,
        file_lsn: Lsn,
        page_no: u32,
        offset: u16,
        lsn: Lsn,
        data: &[u8],
    ) -> DbResult<()> {
        self.cur_file_no = file_no;
        self.cur_phys_size = 0;
        self.start_file_lsn = file_lsn;
        self.prev_lsn = lsn;
        self.prev_space_id = file_no & 1 != 0;
        self.prev_page_no = page_no;
        self.prev_offset = offset;
        self.cur_page_no = page_no;
        self.cur_page_offset = 0;
        self.skip_recovery = false;
        self.start_empty = false;
        self.skipping_partial_page = true;
        if lsn < self.start_file_lsn {
            self.skipping_early_lsn = true;
        } else {
            self.skipping_early_lsn = false;
            if offset as u32 <= BINLOG_PAGE_DATA {
                self.skipping_partial_page = false;
                return self.update_page_from_record(offset, data);
            }
        }
        Ok(())
    }

    /// No non-empty binlog files exist: we can only be here if the crash
    /// happened right after RESET MASTER (an initial header is made durable
    /// before any new data), so recover into an empty binlog state and skip
    /// all records.
    fn init_recovery_empty(&mut self) {
        self.cur_file_no = 0;
        self.cur_phys_size = 0;
        self.start_file_lsn = 0;
        self.prev_lsn = 0;
        self.prev_space_id = false;
        self.prev_page_no = 0;
        self.prev_offset = 0;
        self.cur_page_no = 0;
        self.cur_page_offset = 0;
        self.skip_recovery = false;
        self.start_empty = true;
        self.ignore_last = false;
        self.skipping_early_lsn = false;
        self.skipping_partial_page = true;
    }

    fn open_cur_file(&mut self) -> DbResult<()> {
        let path = binlog_name_make(&self.dir, self.cur_file_no);
        let file = match OpenOptions::new().read(true).write(true).open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && self.cur_page_no == 0 => {
                // Recovering a file that was never created: recreate it
                // from page 0.
                OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(&path)?
            }
            Err(e) => {
                log::error!("cannot open '{}' during recovery: {e}", path.display());
                return Err(DbErr::Io(e));
            }
        };
        self.cur_phys_size = file.metadata()?.len();
        self.cur_file = Some(file);
        Ok(())
    }

    fn flush_page(&mut self) -> DbResult<()> {
        if self.cur_file.is_none() {
            self.open_cur_file()?;
        }
        let page_size = self.page_size;
        let crc = crc32c::crc32c(&self.page_buf[..page_size - BINLOG_PAGE_CHECKSUM as usize]);
        self.page_buf[page_size - BINLOG_PAGE_CHECKSUM as usize..]
            .copy_from_slice(&crc.to_le_bytes());
        let file = self.cur_file.as_mut().unwrap();
        file.seek(SeekFrom::Start(
            self.cur_page_no as u64 * page_size as u64,
        ))?;
        file.write_all(&self.page_buf)?;
        self.cur_page_offset = 0;
        self.page_buf.fill(0);
        Ok(())
    }

    /// Fill up (or truncate) the last recovered file to its declared page
    /// count and zero everything past the recovery point.
    fn zero_out_cur_file(&mut self) -> DbResult<()> {
        let Some(file) = self.cur_file.as_mut() else {
            return Ok(());
        };
        let Some(header_page) = crc32_pread_page(file, 0, self.page_size)? else {
            log::warn!("could not read last binlog file during recovery");
            return Ok(());
        };
        let header = fsp_binlog_extract_header_page(&header_page);
        if header.is_invalid || header.is_empty {
            log::warn!("invalid or empty header page in last binlog file during recovery");
            return Ok(());
        }
        file.set_len(header.page_count << self.page_size_shift)?;
        let zero_page = vec![0u8; self.page_size];
        for i in (self.cur_page_no + 1) as u64..header.page_count {
            let Some(page) = crc32_pread_page(file, i as u32, self.page_size).unwrap_or(None)
            else {
                break;
            };
            if page.iter().all(|&b| b == 0) {
                continue;
            }
            file.seek(SeekFrom::Start(i << self.page_size_shift))?;
            file.write_all(&zero_page)?;
        }
        Ok(())
    }

    fn close_file(&mut self) -> DbResult<()> {
        if let Some(file) = self.cur_file.take() {
            file.sync_data()?;
            self.cur_phys_size = 0;
        }
        Ok(())
    }

    fn next_file(&mut self) -> DbResult<()> {
        if self.cur_page_offset != 0 {
            self.flush_page()?;
        }
        self.close_file()?;
        self.cur_file_no += 1;
        self.cur_page_no = 0;
        Ok(())
    }

    fn next_page(&mut self) -> DbResult<()> {
        if self.cur_page_offset != 0 {
            self.flush_page()?;
        }
        self.cur_page_no += 1;
        Ok(())
    }

    /// Apply one redo record for a binlog page.
    pub fn apply_redo(
        &mut self,
        space_id: bool,
        page_no: u32,
        offset: u16,
        start_lsn: Lsn,
        end_lsn: Lsn,
        data: &[u8],
    ) -> DbResult<()> {
        if !self.inited {
            return self.init_recovery(space_id, page_no, offset, start_lsn, data);
        }
        if self.skip_recovery || self.start_empty {
            return Ok(());
        }

        // Multi-batch recovery can replay the same record twice. A
        // duplicate is in the same mini-transaction (same end LSN) and at a
        // position not after the previous one in the same space, or after
        // it in the other space (an MTR is always smaller than a file).
        let this_pos = ((page_no as u64) << 32) | offset as u64;
        let prev_pos = ((self.prev_page_no as u64) << 32) | self.prev_offset as u64;
        if end_lsn == self.prev_lsn
            && ((space_id == self.prev_space_id && this_pos <= prev_pos)
                || (space_id != self.prev_space_id && this_pos > prev_pos))
        {
            return Ok(());
        }
        self.prev_lsn = end_lsn;
        self.prev_space_id = space_id;
        self.prev_page_no = page_no;
        self.prev_offset = offset;

        if self.skipping_partial_page {
            if offset as u32 > BINLOG_PAGE_DATA {
                return Ok(());
            }
            self.skipping_partial_page = false;
        }

        if self.skipping_early_lsn {
            if start_lsn < self.start_file_lsn || space_id != (self.cur_file_no & 1 != 0) {
                // Record for an earlier file that is already durable.
                return Ok(());
            }
            self.cur_page_no = page_no;
        }

        if start_lsn < self.start_file_lsn {
            if !self.force_recovery {
                log::error!(
                    "unexpected LSN {start_lsn} during binlog recovery, expected at least {}",
                    self.start_file_lsn
                );
                return Err(DbErr::corruption("binlog redo LSN before file start"));
            }
            log::warn!("ignoring unexpected LSN {start_lsn} during binlog recovery");
            return Ok(());
        }
        self.skipping_early_lsn = false;

        let page_size = self.page_size as u32;
        if space_id != (self.cur_file_no & 1 != 0) {
            // Moving to the next file: the previous one must be complete...
            let mid_page = self.cur_page_offset > BINLOG_PAGE_DATA
                && self.cur_page_offset < page_size - BINLOG_PAGE_DATA_END;
            let file_pages = (self.cur_phys_size >> self.page_size_shift) as u32;
            let short_file = (self.cur_page_no
                + (self.cur_page_offset > BINLOG_PAGE_DATA) as u32)
                < file_pages;
            if (mid_page || short_file) && !self.force_recovery {
                return Err(DbErr::corruption(format!(
                    "missing recovery record at end of binlog file {}",
                    self.cur_file_no
                )));
            }
            // ...and the next one must start from its beginning, with its
            // header record.
            if (page_no > 0 || offset as u32 > BINLOG_PAGE_DATA) && !self.force_recovery {
                return Err(DbErr::corruption(format!(
                    "missing recovery record at start of binlog file {}",
                    self.cur_file_no + 1
                )));
            }
            self.next_file()?;
        } else if page_no != self.cur_page_no {
            let mid_page = self.cur_page_offset > BINLOG_PAGE_DATA
                && self.cur_page_offset < page_size - BINLOG_PAGE_DATA_END;
            if mid_page && !self.force_recovery {
                return Err(DbErr::corruption(format!(
                    "missing recovery record in binlog file {} page {}",
                    self.cur_file_no, self.cur_page_no
                )));
            }
            if (page_no != self.cur_page_no + 1 || offset as u32 > BINLOG_PAGE_DATA)
                && !self.force_recovery
            {
                return Err(DbErr::corruption(format!(
                    "missing recovery record in binlog file {} page {}",
                    self.cur_file_no,
                    self.cur_page_no + 1
                )));
            }
            self.next_page()?;
        } else if offset as u32 != self.cur_page_offset
            && offset as u32 > BINLOG_PAGE_DATA
            && !self.force_recovery
        {
            return Err(DbErr::corruption(format!(
                "missing recovery record in binlog file {} page {}",
                self.cur_file_no, self.cur_page_no
            )));
        }

        if offset as u32 + data.len() as u32 >= page_size {
            if self.force_recovery {
                return Ok(());
            }
            return Err(DbErr::corruption("binlog redo record overflows the page"));
        }

        self.update_page_from_record(offset, data)
    }

    fn update_page_from_record(&mut self, offset: u16, data: &[u8]) -> DbResult<()> {
        let page_size = self.page_size;
        self.page_buf[offset as usize..offset as usize + data.len()].copy_from_slice(data);
        if self.cur_page_no == 0 && offset == 0 {
            // The file header record covers only the used prefix of the
            // page; the remainder must read as zeroes, and the prefix CRC
            // at the minimal page size is restored.
            let end = data.len();
            self.page_buf[end..page_size - BINLOG_PAGE_DATA_END as usize].fill(0);
            self.cur_page_offset = page_size as u32 - BINLOG_PAGE_DATA_END;
            let payload = (IBB_HEADER_PAGE_SIZE - BINLOG_PAGE_CHECKSUM) as usize;
            let crc = crc32c::crc32c(&self.page_buf[..payload]);
            self.page_buf[payload..payload + 4].copy_from_slice(&crc.to_le_bytes());

            let header = fsp_binlog_extract_header_page(&self.page_buf);
            if header.is_invalid || header.is_empty {
                log::error!(
                    "corrupt or invalid file header recovered for binlog file {}",
                    self.cur_file_no
                );
                if !self.force_recovery {
                    return Err(DbErr::corruption("recovered binlog header is invalid"));
                }
            } else if header.file_no != self.cur_file_no {
                log::error!(
                    "recovered header in binlog file {} is for file {}",
                    self.cur_file_no,
                    header.file_no
                );
                if !self.force_recovery {
                    return Err(DbErr::corruption("recovered binlog header inconsistent"));
                }
            }
            return Ok(());
        }
        self.cur_page_offset = offset as u32 + data.len() as u32;
        Ok(())
    }

    /// Finish recovery: flush the partial page, zero-fill the rest of the
    /// last file, and delete any strictly-later binlog files (pre-allocated
    /// but never reached, or unrecovered under relaxed durability).
    pub fn end_actions(&mut self, recovery_successful: bool) -> DbResult<(u64, u32, u32)> {
        if !self.inited {
            return Ok((0, 0, 0));
        }
        let mut next_write = (self.cur_file_no, self.cur_page_no, self.cur_page_offset);
        if recovery_successful && !self.skip_recovery {
            if !self.start_empty {
                if self.cur_page_offset != 0 {
                    next_write = (
                        self.cur_file_no,
                        self.cur_page_no,
                        self.cur_page_offset,
                    );
                    self.flush_page()?;
                }
                if self.cur_file.is_some() {
                    self.zero_out_cur_file()?;
                }
                self.close_file()?;
                self.cur_file_no += 1;
            }

            if self.scan_result.num_found >= 1 {
                for i in self.cur_file_no..=self.scan_result.last_file_no {
                    let path = binlog_name_make(&self.dir, i);
                    if let Err(e) = std::fs::remove_file(&path) {
                        if e.kind() != std::io::ErrorKind::NotFound {
                            log::warn!(
                                "could not delete file '{}' after recovery: {e}",
                                path.display()
                            );
                        }
                    }
                }
            }
        }
        self.cur_file = None;
        self.inited = false;
        Ok(next_write)
    }

    pub fn is_inited(&self) -> bool {
        self.inited
    }

    pub fn recovered_empty(&self) -> bool {
        self.start_empty
    }
}

/// Replay the binlog part of a redo stream. Returns the next write
/// position (file_no, page_no, offset) recovery ended at.
pub fn binlog_recover(
    groups: &[RedoGroup],
    dir: &Path,
    page_size_shift: u32,
    force_recovery: bool,
) -> DbResult<(u64, u32, u32)> {
    let mut recovery = BinlogRecovery::new(dir, page_size_shift, force_recovery);
    for group in groups {
        for rec in &group.recs {
            let (space_id, page_no, offset, data): (u32, u32, u16, &[u8]) = match rec {
                RedoRec::Write {
                    space_id,
                    page_no,
                    offset,
                    data,
                } => (*space_id, *page_no, *offset, data),
                _ => continue,
            };
            if space_id != binlog_space_id(0) && space_id != binlog_space_id(1) {
                continue;
            }
            let space_bit = space_id != SRV_SPACE_ID_BINLOG0;
            recovery.apply_redo(
                space_bit,
                page_no,
                offset,
                group.start_lsn,
                group.end_lsn,
                data,
            )?;
        }
    }
    if recovery.is_inited() {
        recovery.end_actions(true)
    } else {
        Ok((NO_FILE, 0, 0))
    }
}
