//! Binlog engine lifecycle: discovery of existing files at startup, the
//! background pre-allocation thread, and purge of old binlog files by
//! name, date or total size.

use std::fs::File;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread::JoinHandle;
use std::time::SystemTime;

use crate::binlog0files::{
    NO_FILE, binlog_name_make, binlog_name_short, crc32_pread_page, scan_for_binlogs,
};
use crate::binlog0rd::{BinlogReader, ReadMode, read_binlog_page};
use crate::db0err::{DbErr, DbResult};
use crate::fsp0binlog::{
    BINLOG_PAGE_DATA, BINLOG_PAGE_DATA_END, BinlogConfig, BinlogHeaderData, BinlogSystem,
    FSP_BINLOG_TYPE_FILLER, get_binlog_header, read_gtid_state_from_page,
};
use crate::log::Redo;
use crate::rpl0gtid::BinlogState;

fn binlog_page_empty(page: &[u8]) -> bool {
    page[BINLOG_PAGE_DATA as usize] == 0
}

/// Create and pre-size a new binlog tablespace file. The file stays
/// all-zero (reading as empty) until the writer rotates into it and writes
/// the header page; a pre-allocated but unused file must never look like
/// binlog data to discovery or recovery.
pub fn binlog_tablespace_create(sys: &BinlogSystem, file_no: u64) -> DbResult<()> {
    let size_in_pages = sys.cfg.size_in_pages;
    let path = binlog_name_make(&sys.cfg.directory, file_no);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = File::create(&path)?;
    file.set_len(size_in_pages as u64 * sys.page_size() as u64)?;
    file.sync_data()?;
    drop(file);

    sys.fifo.register_file(file_no, &path, size_in_pages)?;
    Ok(())
}

/// Flush, sync and deregister a binlog tablespace once it stops being the
/// active one.
pub fn binlog_tablespace_close(sys: &BinlogSystem, file_no: u64) -> DbResult<()> {
    sys.fifo.close_file(file_no)?;
    sys.cur_end_offset[(file_no & 3) as usize].store(NO_FILE, Ordering::Release);
    Ok(())
}

/// Find the last written position in a binlog file: binary search for the
/// first all-zero page, then scan that page's chunks to the write cursor.
/// Returns Ok(None) when the file is empty.
fn find_pos_in_binlog(
    sys: &BinlogSystem,
    file_no: u64,
    file_size: u64,
) -> DbResult<Option<(u32, u32, Option<Vec<u8>>, BinlogHeaderData)>> {
    let page_size = sys.page_size();
    let path = binlog_name_make(&sys.cfg.directory, file_no);
    let header = get_binlog_header(&path, page_size)?
        .ok_or_else(|| DbErr::corruption("unreadable binlog file header"))?;
    if header.is_invalid {
        return Err(DbErr::corruption(format!(
            "invalid or corrupt file header in '{}'",
            path.display()
        )));
    }
    if header.is_empty {
        return Ok(None);
    }
    if header.file_no != file_no {
        return Err(DbErr::corruption(format!(
            "inconsistent file header in '{}': wrong file number {}",
            path.display(),
            header.file_no
        )));
    }

    let mut file = File::open(&path)?;
    // During the binary search, p_0 - 1 is the largest page known to be
    // non-empty and p_2 the first page known to be empty.
    let mut p_0: u32 = 1;
    let mut p_2: u32 = (file_size / page_size as u64) as u32;
    let mut last_nonempty: u32 = 0;
    while p_0 != p_2 {
        let p_1 = (p_0 + p_2) / 2;
        let page = crc32_pread_page(&mut file, p_1, page_size)?;
        match page {
            Some(page) if !binlog_page_empty(&page) => {
                p_0 = p_1 + 1;
                last_nonempty = p_1;
            }
            _ => p_2 = p_1,
        }
    }

    let page = crc32_pread_page(&mut file, last_nonempty, page_size)?
        .ok_or_else(|| DbErr::corruption("lost a binlog page during discovery"))?;

    // Scan the last non-empty page to find where to continue writing.
    let page_end = page_size - BINLOG_PAGE_DATA_END as usize;
    let mut p = BINLOG_PAGE_DATA as usize;
    while p < page_end && page[p] != 0 {
        if page[p] == FSP_BINLOG_TYPE_FILLER {
            p = page_end;
            break;
        }
        let len = page[p + 1] as usize | ((page[p + 2] as usize) << 8);
        p += 3 + len;
        if p > page_end {
            return Err(DbErr::corruption("corrupt chunk chain in last binlog page"));
        }
    }

    // Normalize: store (page_no + 1, start-of-data) rather than
    // (page_no, end-of-data).
    if p == page_end {
        Ok(Some((last_nonempty + 1, BINLOG_PAGE_DATA, None, header)))
    } else {
        Ok(Some((
            last_nonempty,
            p as u32,
            Some(page),
            header,
        )))
    }
}

fn continue_from(
    sys: &BinlogSystem,
    file_no: u64,
    file_size: u64,
    page_no: u32,
    pos_in_page: u32,
    partial_page: Option<Vec<u8>>,
    interval: u64,
) -> DbResult<()> {
    let path = binlog_name_make(&sys.cfg.directory, file_no);
    let size_in_pages = (file_size >> sys.page_size_shift()) as u32;
    sys.fifo.register_file(file_no, &path, size_in_pages)?;
    if let Some(page) = partial_page {
        sys.fifo.install_page(file_no, page_no, page)?;
    }
    let pos = ((page_no as u64) << sys.page_size_shift()) | pos_in_page as u64;
    let slot = (file_no & 3) as usize;
    sys.cur_end_offset[slot].store(pos, Ordering::Release);
    sys.cur_durable_offset[slot].store(pos, Ordering::Release);
    sys.set_active(file_no, page_no, pos_in_page, interval);
    sys.note_open(file_no, file_no);
    log::info!("continuing binlog number {file_no} from position {pos}");
    Ok(())
}

/// Scan the binlog directory and position the writer after the last
/// written byte. Returns the number of usable binlog files found (0 when
/// starting from scratch).
pub fn binlog_discover(sys: &BinlogSystem) -> DbResult<u32> {
    let Some(found) = scan_for_binlogs(&sys.cfg.directory)? else {
        sys.pending.init(0);
        return Ok(0);
    };
    if found.num_found == 0 {
        let mut purge = sys.purge.lock().unwrap();
        purge.earliest_file_no = 0;
        purge.total_used_size = 0;
        drop(purge);
        sys.pending.init(0);
        log::info!("starting a new binlog from file number 0");
        return Ok(0);
    }

    {
        let mut purge = sys.purge.lock().unwrap();
        purge.earliest_file_no = found.earliest_file_no;
        purge.total_used_size = found.total_size;
    }

    match find_pos_in_binlog(sys, found.last_file_no, found.last_size)? {
        Some((page_no, pos_in_page, partial, header)) => {
            sys.file_hash.record(
                found.last_file_no,
                header.oob_ref_file_no,
                header.xa_ref_file_no,
            );
            // XA PREPAREs pending at the time of the last header keep their
            // files pinned across the restart.
            sys.file_hash.xa_ref_pin(header.xa_ref_file_no);
            continue_from(
                sys,
                found.last_file_no,
                found.last_size,
                page_no,
                pos_in_page,
                partial,
                header.diff_state_interval,
            )?;
            Ok(found.num_found)
        }
        None if found.num_found >= 2 => {
            // The last binlog is empty; continue in the previous one. The
            // empty file is left for the pre-allocation thread to reuse.
            match find_pos_in_binlog(sys, found.prev_file_no, found.prev_size)? {
                Some((page_no, pos_in_page, partial, header)) => {
                    sys.file_hash.record(
                        found.prev_file_no,
                        header.oob_ref_file_no,
                        header.xa_ref_file_no,
                    );
                    sys.file_hash.xa_ref_pin(header.xa_ref_file_no);
                    continue_from(
                        sys,
                        found.prev_file_no,
                        found.prev_size,
                        page_no,
                        pos_in_page,
                        partial,
                        header.diff_state_interval,
                    )?;
                    // The empty last file was already pre-allocated; reuse
                    // it as the next file instead of creating another.
                    let path = binlog_name_make(&sys.cfg.directory, found.last_file_no);
                    sys.fifo.register_file(
                        found.last_file_no,
                        &path,
                        (found.last_size >> sys.page_size_shift()) as u32,
                    )?;
                    sys.note_open(found.prev_file_no, found.last_file_no);
                    Ok(found.num_found)
                }
                None => {
                    // Both most recent files are empty: continue in the
                    // previous one from its start. The writer lays down the
                    // header page on its first write.
                    sys.file_hash.record(found.prev_file_no, NO_FILE, NO_FILE);
                    continue_from(
                        sys,
                        found.prev_file_no,
                        found.prev_size,
                        0,
                        BINLOG_PAGE_DATA,
                        None,
                        0,
                    )?;
                    Ok(found.num_found)
                }
            }
        }
        None => {
            // Just one, empty binlog file; its header page is written by
            // the writer's first write.
            sys.file_hash.record(found.last_file_no, NO_FILE, NO_FILE);
            continue_from(
                sys,
                found.last_file_no,
                found.last_size,
                0,
                BINLOG_PAGE_DATA,
                None,
                0,
            )?;
            Ok(found.num_found)
        }
    }
}

/// Recover the GTID binlog state at startup: the full state at the start
/// of the active file, overlaid with the last differential snapshot at or
/// below the current write position.
pub fn binlog_state_recover(sys: &BinlogSystem) -> DbResult<()> {
    let file_no = sys.active_file_no();
    let mut state = BinlogState::new();
    let Some(page) = read_binlog_page(sys, file_no, 1)? else {
        return Ok(()); /* Continuing in an empty file. */
    };
    if read_gtid_state_from_page(&mut state, &page)?.is_none() {
        return Ok(());
    }

    let mut ws = sys.write_state.lock().unwrap();
    let interval = ws.state_interval_pages;
    let cur_page_no = ws.cur_page_no as u64;
    let mut diff = BinlogState::new();
    if interval > 1 {
        let mut page_no = cur_page_no - cur_page_no % interval;
        while page_no > 0 {
            let mut snap = BinlogState::new();
            if let Some(page) = read_binlog_page(sys, file_no, page_no as u32)? {
                if read_gtid_state_from_page(&mut snap, &page)?.is_some() {
                    diff.load(&snap);
                    break;
                }
            }
            page_no -= interval;
        }
    }
    state.load(&diff);
    ws.global_state = state;
    ws.diff_state = diff;
    Ok(())
}

/// Read the full GTID state of the earliest binlog file.
pub fn binlog_get_init_state(sys: &BinlogSystem) -> DbResult<BinlogState> {
    let earliest = sys.purge.lock().unwrap().earliest_file_no;
    let mut state = BinlogState::new();
    let Some(page) = read_binlog_page(sys, earliest, 1)? else {
        return Ok(state);
    };
    read_gtid_state_from_page(&mut state, &page)?;
    Ok(state)
}

/// Block until the binlog is durable up to `wait_offset` in `file_no`.
pub fn wait_durable_offset(sys: &Arc<BinlogSystem>, file_no: u64, wait_offset: u64) {
    loop {
        let dur = sys.cur_durable_offset[(file_no & 3) as usize].load(Ordering::Relaxed);
        if (dur != NO_FILE && dur >= wait_offset)
            || (dur == NO_FILE && file_no < sys.active_file_no())
        {
            // A closed file is fully durable; its slot reads NO_FILE.
            return;
        }
        let mut reader = BinlogReader::new(
            sys.clone(),
            ReadMode::Durable,
            file_no,
            if dur == NO_FILE { 0 } else { dur },
        );
        let _ = reader.wait_available(None, None);
    }
}

/* Purge. */

/// Purge parameters, one of the three criteria at a time.
#[derive(Debug, Clone)]
pub struct PurgeInfo {
    /// Lowest file_no that must not be purged (active readers); NO_FILE
    /// when no reader holds a position.
    pub limit_file_no: u64,
    pub purge_by_date: bool,
    pub limit_date: Option<SystemTime>,
    pub purge_by_size: bool,
    pub limit_size: u64,
    pub purge_by_name: bool,
    pub limit_name: Option<String>,
    pub nonpurge_reason: Option<&'static str>,
    pub nonpurge_filename: Option<String>,
}

impl Default for PurgeInfo {
    fn default() -> Self {
        PurgeInfo {
            limit_file_no: NO_FILE,
            purge_by_date: false,
            limit_date: None,
            purge_by_size: false,
            limit_size: 0,
            purge_by_name: false,
            limit_name: None,
            nonpurge_reason: None,
            nonpurge_filename: None,
        }
    }
}

/// Outcome of a purge request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PurgeResult {
    Done,
    /// Some files could not be purged; they are still in use.
    InUse,
    /// The named target does not exist.
    Eof,
}

/// A dump thread positioned in `limit_file_no` also needs every earlier
/// file its event groups reference out-of-band; lower the limit to the
/// earliest such file, from the reference tracker or the header page.
fn purge_adjust_limit_file_no(sys: &BinlogSystem, info: &mut PurgeInfo) -> DbResult<()> {
    let limit = info.limit_file_no;
    if limit == NO_FILE {
        return Ok(());
    }
    let referenced = match sys.file_hash.oob_ref_file_no(limit) {
        Some(r) => r,
        None => {
            let path = binlog_name_make(&sys.cfg.directory, limit);
            let header = get_binlog_header(&path, sys.page_size())?;
            match header {
                Some(h) if !h.is_empty && !h.is_invalid => {
                    sys.file_hash
                        .record(limit, h.oob_ref_file_no, h.xa_ref_file_no);
                    h.oob_ref_file_no
                }
                _ => return Err(DbErr::corruption("unreadable header while purging")),
            }
        }
    };
    if referenced < limit {
        info.limit_file_no = referenced;
    }
    Ok(())
}

/// The low-level purge loop. The caller holds the purge mutex.
/// Returns the first file that was not purged and whether purging stopped
/// early.
fn binlog_purge_low(
    sys: &BinlogSystem,
    info: &PurgeInfo,
    limit_name_file_no: u64,
) -> DbResult<(bool, u64)> {
    let active = sys.active_file_no();
    let limit_file_no = info.limit_file_no;
    let mut need_active_flush = active <= limit_file_no.saturating_add(2);

    let mut purge = sys.purge.lock().unwrap();
    let mut total_size = purge.total_used_size;
    let mut file_no = purge.earliest_file_no;
    let mut want_purge;
    loop {
        want_purge = false;
        let path = binlog_name_make(&sys.cfg.directory, file_no);
        let meta = match std::fs::metadata(&path) {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::info!(
                    "file already gone when purging binlog file '{}'",
                    path.display()
                );
                file_no += 1;
                if file_no >= limit_file_no {
                    break;
                }
                continue;
            }
            Err(e) => {
                log::warn!("failed to stat binlog file '{}': {e}", path.display());
                file_no += 1;
                if file_no >= limit_file_no {
                    break;
                }
                continue;
            }
        };

        if info.purge_by_date
            && info
                .limit_date
                .is_some_and(|limit| meta.modified().map(|m| m < limit).unwrap_or(false))
        {
            want_purge = true;
        }
        if info.purge_by_size && total_size > info.limit_size {
            want_purge = true;
        }
        if info.purge_by_name && file_no < limit_name_file_no {
            want_purge = true;
        }
        if !want_purge || file_no >= limit_file_no || sys.file_hash.ref_in_use(file_no) {
            break;
        }

        purge.earliest_file_no = file_no + 1;
        total_size = total_size.saturating_sub(meta.len());

        // Keep at least one durably non-empty file header on disk: fsync
        // the active file's first page before deleting (active - 2), so
        // recovery always has a start LSN.
        if file_no + 2 >= active && need_active_flush {
            sys.fifo.flush_up_to(active, 0)?;
            sys.fifo.do_fdatasync(active)?;
            need_active_flush = false;
        }

        sys.file_hash.remove(file_no);
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                log::warn!("delete failed while purging '{}': {e}", path.display());
                file_no += 1;
                continue;
            }
        }
        file_no += 1;
    }
    purge.total_used_size = total_size;
    Ok((want_purge, file_no))
}

/// Autopurge by date and size, run by the pre-allocation thread after
/// creating a new file.
fn binlog_autopurge(sys: &BinlogSystem, first_open_file_no: u64) {
    let mut info = PurgeInfo {
        limit_file_no: NO_FILE,
        ..Default::default()
    };
    if sys.cfg.expire_seconds > 0 {
        info.purge_by_date = true;
        info.limit_date = SystemTime::now()
            .checked_sub(std::time::Duration::from_secs(sys.cfg.expire_seconds));
    }
    if sys.cfg.max_total_size > 0 {
        info.purge_by_size = true;
        info.limit_size = sys.cfg.max_total_size;
    }
    if !info.purge_by_date && !info.purge_by_size {
        return;
    }
    if purge_adjust_limit_file_no(sys, &mut info).is_err() {
        return;
    }
    // Never purge an actively open tablespace file.
    info.limit_file_no = info
        .limit_file_no
        .min(first_open_file_no)
        .min(sys.active_file_no());

    match binlog_purge_low(sys, &info, 0) {
        Ok((stopped_early, file_no)) => {
            let mut purge = sys.purge.lock().unwrap();
            if stopped_early {
                if !purge.warning_given {
                    log::info!(
                        "binlog file {} could not be purged because it is still in use",
                        binlog_name_short(file_no)
                    );
                    purge.warning_given = true;
                }
            } else {
                purge.warning_given = false;
            }
        }
        Err(e) => log::warn!("binlog autopurge failed: {e}"),
    }
}

/// PURGE BINARY LOGS: by name, date or size.
pub fn binlog_purge(sys: &BinlogSystem, info: &mut PurgeInfo) -> DbResult<PurgeResult> {
    debug_assert!(
        (info.purge_by_name as u8 + info.purge_by_date as u8 + info.purge_by_size as u8) == 1
    );
    let active = sys.active_file_no();
    let first_open = sys.first_open_file_no();
    let last_created = sys.last_created_file_no();
    let limit_file_no = active.min(first_open);

    let mut to_file_no = NO_FILE;
    if info.purge_by_name {
        let Some(name) = info.limit_name.as_deref() else {
            return Ok(PurgeResult::Eof);
        };
        match crate::binlog0files::is_binlog_name(name) {
            Some(n) if n <= last_created => to_file_no = n,
            _ => return Ok(PurgeResult::Eof),
        }
    }

    purge_adjust_limit_file_no(sys, info)?;
    let orig_limit_file_no = info.limit_file_no;
    info.limit_file_no = orig_limit_file_no.min(limit_file_no);

    let (stopped_early, file_no) = binlog_purge_low(sys, info, to_file_no)?;

    if stopped_early {
        info.nonpurge_filename = Some(binlog_name_short(file_no));
        if info.nonpurge_reason.is_none() {
            info.nonpurge_reason = if limit_file_no == file_no {
                Some("the binlog file is in active use")
            } else if orig_limit_file_no == file_no {
                Some("it is in use by a binlog dump thread (connected slave)")
            } else {
                Some("it might still be needed")
            };
        }
        sys.purge.lock().unwrap().warning_given = false;
        return Ok(PurgeResult::InUse);
    }
    sys.purge.lock().unwrap().warning_given = false;
    Ok(PurgeResult::Done)
}

/* The pre-allocation thread and engine lifecycle. */

fn prealloc_loop(sys: &Arc<BinlogSystem>) {
    loop {
        if let Some(file_no) = sys.prealloc_wants_create() {
            let res = binlog_tablespace_create(sys, file_no);
            match res {
                Ok(()) => {
                    {
                        let mut purge = sys.purge.lock().unwrap();
                        if purge.earliest_file_no == NO_FILE {
                            purge.earliest_file_no = file_no;
                        }
                        purge.total_used_size +=
                            (sys.cfg.size_in_pages as u64) << sys.page_size_shift();
                    }
                    let first_open = sys.first_open_file_no();
                    binlog_autopurge(sys, if first_open == NO_FILE { file_no } else { first_open });
                    sys.publish_created(file_no);
                    continue;
                }
                Err(e) => {
                    // Writers waiting to rotate observe the failure flag
                    // and fail their commit instead of hanging.
                    log::error!("cannot pre-allocate binlog file {file_no}: {e}");
                    sys.mark_prealloc_failed();
                    break;
                }
            }
        }

        if let Some(file_no) = sys.prealloc_wants_close() {
            if let Err(e) = binlog_tablespace_close(sys, file_no) {
                log::error!("cannot close binlog file {file_no}: {e}");
            }
            sys.mark_first_open(file_no + 1);
            continue;
        }

        if sys.prealloc_should_end() {
            break;
        }
        sys.prealloc_wait();
    }
}

/// The binlog engine entry point: owns the system singletons and the
/// pre-allocation thread.
pub struct BinlogEngine {
    pub sys: Arc<BinlogSystem>,
    prealloc: Option<JoinHandle<()>>,
}

impl BinlogEngine {
    /// Initialize the binlog engine: discover existing files (continuing
    /// after them), recover the GTID state, start pre-allocation, and for a
    /// fresh binlog durably write the initial header and state.
    pub fn start(cfg: BinlogConfig, redo: Arc<Redo>) -> DbResult<BinlogEngine> {
        if cfg.directory.as_os_str().len()
            > crate::config::OS_FILE_MAX_PATH - crate::config::NAME_MAX
        {
            return Err(DbErr::Io(std::io::Error::other(
                "binlog directory path is too long",
            )));
        }
        let sys = Arc::new(BinlogSystem::new(cfg, redo));
        sys.init_state();
        let found = binlog_discover(&sys)?;
        if found > 0 {
            binlog_state_recover(&sys)?;
        }

        let mut engine = BinlogEngine {
            sys: sys.clone(),
            prealloc: None,
        };
        engine.start_prealloc()?;
        if found == 0 {
            sys.sync_initial()?;
        }
        Ok(engine)
    }

    fn start_prealloc(&mut self) -> DbResult<()> {
        let sys = self.sys.clone();
        self.prealloc = Some(std::thread::spawn(move || prealloc_loop(&sys)));
        self.sys.wait_first_created()
    }

    fn stop_prealloc(&mut self) {
        if let Some(handle) = self.prealloc.take() {
            self.sys.stop_prealloc();
            let _ = handle.join();
        }
    }

    /// Close open binlog tablespaces; with `shutdown`, the engine is going
    /// away entirely.
    pub fn close(&mut self, shutdown: bool) {
        self.stop_prealloc();
        let first_open = self.sys.first_open_file_no();
        let last_created = self.sys.last_created_file_no();
        if first_open != NO_FILE && last_created != NO_FILE {
            for file_no in first_open..=last_created {
                if let Err(e) = binlog_tablespace_close(&self.sys, file_no) {
                    log::warn!("error closing binlog file {file_no} at shutdown: {e}");
                }
            }
        }
        if shutdown {
            self.sys.pending.reset();
        }
    }

    /// RESET MASTER: delete all binlog files and start over from file 0.
    /// Refused while any transaction or pending XA still references binlog
    /// data.
    pub fn reset(&mut self) -> DbResult<()> {
        let sys = self.sys.clone();
        let active = sys.active_file_no();
        let earliest = sys.purge.lock().unwrap().earliest_file_no;
        if sys.file_hash.any_ref_in_use(earliest, active) || !sys.xid_hash.is_empty() {
            return Err(DbErr::corruption(
                "binlog is in use by an active transaction",
            ));
        }

        self.close(false);
        // Flushing the redo first means recovery can never stop at an LSN
        // before the reset, so there is no question of resurrecting the
        // deleted files.
        sys.redo.flush_all();
        sys.fifo.reset();
        sys.pending.reset();
        sys.file_hash.remove_up_to(sys.last_created_file_no());
        // No pending XIDs exist (checked above), so no file is XA-pinned.
        sys.file_hash.xa_ref_reset(None);

        let mut err = Ok(());
        match std::fs::read_dir(&sys.cfg.directory) {
            Ok(entries) => {
                for entry in entries.flatten() {
                    let name = entry.file_name();
                    let Some(name) = name.to_str() else { continue };
                    let Some(file_no) = crate::binlog0files::is_binlog_name(name) else {
                        continue;
                    };
                    if let Err(e) = std::fs::remove_file(entry.path()) {
                        log::error!("RESET MASTER could not delete '{name}': {e}");
                        err = Err(DbErr::Io(e));
                    }
                    sys.file_hash.remove(file_no);
                }
            }
            Err(e) => err = Err(DbErr::Io(e)),
        }

        // Even after a delete error, re-initialize an empty binlog; better
        // than leaving a non-functional binlog with stale state.
        sys.init_state();
        sys.pending.init(0);
        self.start_prealloc()?;
        sys.sync_initial()?;
        err
    }
}

impl Drop for BinlogEngine {
    fn drop(&mut self) {
        self.stop_prealloc();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::log::Redo;

    pub(crate) fn test_config(dir: &Path, pages: u32) -> BinlogConfig {
        BinlogConfig {
            directory: dir.to_path_buf(),
            page_size_shift: 12,
            size_in_pages: pages,
            state_interval_pages: 4,
            flush_log_at_trx_commit: 1,
            force_recovery: false,
            max_total_size: 0,
            expire_seconds: 0,
        }
    }

    #[test]
    fn test_fresh_start_creates_initial_files() {
        let dir = tempfile::tempdir().unwrap();
        let redo = Arc::new(Redo::new());
        let mut engine = BinlogEngine::start(test_config(dir.path(), 8), redo).unwrap();
        assert_eq!(engine.sys.active_file_no(), 0);
        let path = binlog_name_make(dir.path(), 0);
        assert!(path.exists());
        // The header must be durably on disk: a fresh header read sees it.
        let header = get_binlog_header(&path, 4096).unwrap().unwrap();
        assert!(!header.is_empty && !header.is_invalid);
        assert_eq!(header.file_no, 0);
        assert_eq!(header.page_count, 8);
        engine.close(true);
    }

    #[test]
    fn test_restart_continues_position() {
        let dir = tempfile::tempdir().unwrap();
        let redo = Arc::new(Redo::new());
        let mut engine =
            BinlogEngine::start(test_config(dir.path(), 8), redo.clone()).unwrap();
        engine
            .sys
            .write_commit_record(b"G1", b"payload-one", None, None, None)
            .unwrap();
        let (file_no, pos) = engine.sys.status();
        engine.sys.fifo.flush_all().unwrap();
        engine.close(true);
        drop(engine);

        let redo2 = Arc::new(Redo::new());
        let mut engine2 = BinlogEngine::start(test_config(dir.path(), 8), redo2).unwrap();
        let (file_no2, pos2) = engine2.sys.status();
        assert_eq!((file_no, pos), (file_no2, pos2));
        engine2.close(true);
    }

    #[test]
    fn test_reset_master() {
        let dir = tempfile::tempdir().unwrap();
        let redo = Arc::new(Redo::new());
        let mut engine = BinlogEngine::start(test_config(dir.path(), 8), redo).unwrap();
        engine
            .sys
            .write_commit_record(b"G", b"data", None, None, None)
            .unwrap();
        engine.reset().unwrap();
        assert_eq!(engine.sys.active_file_no(), 0);
        let (_, pos) = engine.sys.status();
        // Fresh file: only the initial state and filler on page 1.
        assert!(pos >= 4096);
        engine.close(true);
    }
}
