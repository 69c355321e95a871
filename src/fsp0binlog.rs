//! The binlog tablespace writer: chunked record layout, GTID state
//! snapshots, file rotation and the global binlog engine state.

use std::fs::File;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use crate::Lsn;
use crate::binlog0fifo::{BinlogPageFifo, FifoPage};
use crate::binlog0files::{FileHash, NO_FILE};
use crate::binlog0pend::PendingLsnFifo;
use crate::binlog0xa::XidHash;
use crate::compr0int::{compr_int_read, compr_int_write};
use crate::db0err::{DbErr, DbResult};
use crate::fsp0types::SRV_SPACE_ID_BINLOG0;
use crate::log::Redo;
use crate::mtr::Mtr;
use crate::rpl0gtid::{BinlogState, RplGtid};

/* Binlog chunk types. */
pub const FSP_BINLOG_TYPE_EMPTY: u8 = 0;
pub const FSP_BINLOG_TYPE_COMMIT: u8 = 1;
pub const FSP_BINLOG_TYPE_GTID_STATE: u8 = 2;
pub const FSP_BINLOG_TYPE_OOB_DATA: u8 = 3;
pub const FSP_BINLOG_TYPE_XA_PREPARE: u8 = 4;
pub const FSP_BINLOG_TYPE_XA_COMPLETE: u8 = 5;
pub const FSP_BINLOG_TYPE_FILLER: u8 = 0xff;

/* Chunk flag bits and the type mask. */
pub const FSP_BINLOG_FLAG_CONT: u8 = 0x80;
pub const FSP_BINLOG_FLAG_LAST: u8 = 0x40;
pub const FSP_BINLOG_TYPE_MASK: u8 = 0x3f;

/* XA COMPLETE type byte. */
pub const IBB_FL_XA_TYPE_COMMIT: u8 = 1;
pub const IBB_FL_XA_TYPE_ROLLBACK: u8 = 2;

/* Binlog data page layout. */
pub const BINLOG_PAGE_DATA: u32 = 38;
pub const BINLOG_PAGE_DATA_END: u32 = 8;
pub const BINLOG_PAGE_CHECKSUM: u32 = 4;

/* Binlog file header page (page 0). */
pub const IBB_MAGIC: u32 = u32::from_le_bytes(*b"IBB\x01");
pub const IBB_FILE_VERS_MAJOR: u32 = 1;
pub const IBB_FILE_VERS_MINOR: u32 = 0;
/// Fixed header fields use this many bytes of page 0.
pub const IBB_BINLOG_HEADER_SIZE: u32 = 64;
/// The header CRC sits at the end of the minimal page size prefix, so the
/// header page can be validated without knowing the configured page size.
pub const IBB_HEADER_PAGE_SIZE: u32 = 4096;

pub fn binlog_space_id(file_no: u64) -> u32 {
    SRV_SPACE_ID_BINLOG0 + (file_no & 1) as u32
}

/// Parsed binlog file header page.
#[derive(Debug, Clone, Default)]
pub struct BinlogHeaderData {
    pub file_no: u64,
    pub page_count: u64,
    pub start_lsn: Lsn,
    pub diff_state_interval: u64,
    pub oob_ref_file_no: u64,
    pub xa_ref_file_no: u64,
    pub page_size_shift: u32,
    pub vers_major: u32,
    pub vers_minor: u32,
    pub is_empty: bool,
    pub is_invalid: bool,
}

/// Decode the header page fields. All fields are little-endian.
pub fn fsp_binlog_extract_header_page(page: &[u8]) -> BinlogHeaderData {
    let mut h = BinlogHeaderData {
        is_empty: true,
        is_invalid: false,
        ..Default::default()
    };
    if page.iter().all(|&b| b == 0) {
        return h;
    }
    let rd4 = |ofs: usize| u32::from_le_bytes(page[ofs..ofs + 4].try_into().unwrap());
    let rd8 = |ofs: usize| u64::from_le_bytes(page[ofs..ofs + 8].try_into().unwrap());
    if rd4(0) != IBB_MAGIC {
        h.is_invalid = true;
        return h;
    }
    h.page_size_shift = rd4(4);
    h.vers_major = rd4(8);
    h.vers_minor = rd4(12);
    h.file_no = rd8(16);
    h.page_count = rd8(24);
    h.start_lsn = rd8(32);
    h.diff_state_interval = rd8(40);
    h.oob_ref_file_no = rd8(48);
    h.xa_ref_file_no = rd8(56);
    if h.page_size_shift < 12
        || h.page_size_shift > 16
        || h.vers_major != IBB_FILE_VERS_MAJOR
        || h.page_count == 0
    {
        h.is_invalid = true;
        return h;
    }
    h.is_empty = false;
    h
}

/// Read and validate the header page of a binlog file.
/// Returns:
///  - Err on I/O error,
///  - Ok(None) when the file is missing, unreadable as a page, or fails the
///    header checksum (treated like an empty file),
///  - Ok(Some(header)) otherwise.
pub fn get_binlog_header(
    path: &std::path::Path,
    page_size: usize,
) -> std::io::Result<Option<BinlogHeaderData>> {
    use std::io::Read;
    let mut file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    let mut buf = vec![0u8; page_size];
    let mut read = 0;
    while read < page_size {
        match file.read(&mut buf[read..]) {
            Ok(0) => break,
            Ok(n) => read += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    if read < page_size {
        return Ok(None);
    }
    // If the prefix CRC does not match, the page was not written fully:
    // treat the file as empty.
    let payload = (IBB_HEADER_PAGE_SIZE - BINLOG_PAGE_CHECKSUM) as usize;
    let stored = u32::from_le_bytes(buf[payload..payload + 4].try_into().unwrap());
    if buf.iter().all(|&b| b == 0) {
        return Ok(Some(BinlogHeaderData {
            is_empty: true,
            ..Default::default()
        }));
    }
    if stored != crc32c::crc32c(&buf[..payload]) {
        return Ok(None);
    }
    Ok(Some(fsp_binlog_extract_header_page(&buf)))
}

/// The seam between the generic chunk writer and the data being written:
/// copy up to `buf.len()` bytes and report whether this was the last of the
/// record.
pub trait ChunkData {
    fn copy_data(&mut self, buf: &mut [u8]) -> (usize, bool);
}

/// Fills whatever space remains on the current page. A FILLER chunk always
/// runs to the end of its page; readers skip the rest of the page when they
/// meet one.
struct ChunkDataFlush;

impl ChunkData for ChunkDataFlush {
    fn copy_data(&mut self, buf: &mut [u8]) -> (usize, bool) {
        buf.fill(0);
        (buf.len(), true)
    }
}

/// A record held fully in one memory buffer.
pub struct ChunkDataBuf<'a> {
    data: &'a [u8],
    sofar: usize,
}

impl<'a> ChunkDataBuf<'a> {
    pub fn new(data: &'a [u8]) -> ChunkDataBuf<'a> {
        ChunkDataBuf { data, sofar: 0 }
    }
}

impl ChunkData for ChunkDataBuf<'_> {
    fn copy_data(&mut self, buf: &mut [u8]) -> (usize, bool) {
        let remain = self.data.len() - self.sofar;
        if remain == 0 {
            return (0, true);
        }
        let size = remain.min(buf.len());
        buf[..size].copy_from_slice(&self.data[self.sofar..self.sofar + size]);
        self.sofar += size;
        (size, self.sofar == self.data.len())
    }
}

/// The commit-record producer: the out-of-band reference header, then the
/// GTID event bytes, then the statement payload.
pub struct ChunkDataCache<'a> {
    header: Vec<u8>,
    header_sofar: usize,
    gtid_event: &'a [u8],
    gtid_sofar: usize,
    main: &'a [u8],
    main_sofar: usize,
}

/// References to one OOB forest, for building the commit record header.
#[derive(Debug, Clone, Copy)]
pub struct OobRefs {
    pub num_nodes: u64,
    pub first_file_no: u64,
    pub first_offset: u64,
    pub last_file_no: u64,
    pub last_offset: u64,
}

impl<'a> ChunkDataCache<'a> {
    /// When both a non-transactional and a transactional forest exist, the
    /// non-transactional one is written first. A lone forest is followed by
    /// a zero count; no forest at all is a single zero count.
    pub fn new(
        gtid_event: &'a [u8],
        main: &'a [u8],
        primary: Option<OobRefs>,
        secondary: Option<OobRefs>,
    ) -> ChunkDataCache<'a> {
        let mut header = Vec::new();
        let mut blocks = 0;
        for refs in [secondary, primary].into_iter().flatten() {
            if refs.num_nodes == 0 {
                continue;
            }
            compr_int_write(&mut header, refs.num_nodes);
            compr_int_write(&mut header, refs.first_file_no);
            compr_int_write(&mut header, refs.first_offset);
            compr_int_write(&mut header, refs.last_file_no);
            compr_int_write(&mut header, refs.last_offset);
            blocks += 1;
        }
        if blocks < 2 {
            compr_int_write(&mut header, 0);
        }
        ChunkDataCache {
            header,
            header_sofar: 0,
            gtid_event,
            gtid_sofar: 0,
            main,
            main_sofar: 0,
        }
    }
}

impl ChunkData for ChunkDataCache<'_> {
    fn copy_data(&mut self, buf: &mut [u8]) -> (usize, bool) {
        let mut size = 0usize;
        let mut max = buf.len();

        if self.header_sofar < self.header.len() {
            let n = (self.header.len() - self.header_sofar).min(max);
            buf[..n].copy_from_slice(&self.header[self.header_sofar..self.header_sofar + n]);
            self.header_sofar += n;
            size += n;
            max -= n;
            if max == 0 {
                return (size, self.done());
            }
        }
        if self.gtid_sofar < self.gtid_event.len() {
            let n = (self.gtid_event.len() - self.gtid_sofar).min(max);
            buf[size..size + n]
                .copy_from_slice(&self.gtid_event[self.gtid_sofar..self.gtid_sofar + n]);
            self.gtid_sofar += n;
            size += n;
            max -= n;
            if max == 0 {
                return (size, self.done());
            }
        }
        if self.main_sofar < self.main.len() {
            let n = (self.main.len() - self.main_sofar).min(max);
            buf[size..size + n].copy_from_slice(&self.main[self.main_sofar..self.main_sofar + n]);
            self.main_sofar += n;
            size += n;
        }
        (size, self.done())
    }
}

impl ChunkDataCache<'_> {
    fn done(&self) -> bool {
        self.header_sofar == self.header.len()
            && self.gtid_sofar == self.gtid_event.len()
            && self.main_sofar == self.main.len()
    }
}

/// Runtime binlog configuration, validated by config::Config.
#[derive(Debug, Clone)]
pub struct BinlogConfig {
    pub directory: PathBuf,
    pub page_size_shift: u32,
    /// Per-file size in pages (max_binlog_size).
    pub size_in_pages: u32,
    /// Spacing of differential GTID state snapshots, in pages.
    pub state_interval_pages: u64,
    pub flush_log_at_trx_commit: u8,
    pub force_recovery: bool,
    /// Autopurge limits; zero disables the respective limit.
    pub max_total_size: u64,
    pub expire_seconds: u64,
}

impl BinlogConfig {
    pub fn page_size(&self) -> usize {
        1usize << self.page_size_shift
    }
}

struct ActiveState {
    first_open_file_no: u64,
    last_created_file_no: u64,
    prealloc_end: bool,
    prealloc_failed: bool,
}

pub struct WriteState {
    pub cur_page_no: u32,
    pub cur_page_offset: u32,
    cur_block: Option<Arc<FifoPage>>,
    /// GTID state relative to the start of the active file.
    pub diff_state: BinlogState,
    /// The full binlog state, snapshotted at the start of every file.
    pub global_state: BinlogState,
    /// Snapshot interval of the active file, in pages.
    pub state_interval_pages: u64,
}

pub struct PurgeState {
    pub earliest_file_no: u64,
    pub total_used_size: u64,
    pub warning_given: bool,
}

/// The binlog engine singletons: writer position, pre-allocation state,
/// durability tracking and reference registries. Created once by
/// startup_init() and shared by all threads.
pub struct BinlogSystem {
    pub cfg: BinlogConfig,
    pub redo: Arc<Redo>,
    pub fifo: Arc<BinlogPageFifo>,
    pub file_hash: FileHash,
    pub pending: PendingLsnFifo,
    pub xid_hash: XidHash,
    pub active_file_no: AtomicU64,
    /// Offset of the last valid byte in the most recent binlog files.
    /// NO_FILE means the file is not open in the fifo (valid to its end).
    pub cur_end_offset: [AtomicU64; 4],
    /// Largest offset guaranteed recoverable after a crash.
    pub cur_durable_offset: [AtomicU64; 4],
    active: Mutex<ActiveState>,
    pub active_cond: Condvar,
    pub write_state: Mutex<WriteState>,
    pub purge: Mutex<PurgeState>,
}

impl BinlogSystem {
    pub fn new(cfg: BinlogConfig, redo: Arc<Redo>) -> BinlogSystem {
        let fifo = Arc::new(BinlogPageFifo::new(cfg.page_size()));
        let interval = cfg.state_interval_pages;
        BinlogSystem {
            cfg,
            redo,
            fifo,
            file_hash: FileHash::default(),
            pending: PendingLsnFifo::default(),
            xid_hash: XidHash::default(),
            active_file_no: AtomicU64::new(NO_FILE),
            cur_end_offset: [const { AtomicU64::new(NO_FILE) }; 4],
            cur_durable_offset: [const { AtomicU64::new(NO_FILE) }; 4],
            active: Mutex::new(ActiveState {
                first_open_file_no: NO_FILE,
                last_created_file_no: NO_FILE,
                prealloc_end: false,
                prealloc_failed: false,
            }),
            active_cond: Condvar::new(),
            write_state: Mutex::new(WriteState {
                cur_page_no: 0,
                cur_page_offset: BINLOG_PAGE_DATA,
                cur_block: None,
                diff_state: BinlogState::new(),
                global_state: BinlogState::new(),
                state_interval_pages: interval,
            }),
            purge: Mutex::new(PurgeState {
                earliest_file_no: NO_FILE,
                total_used_size: 0,
                warning_given: false,
            }),
        }
    }

    pub fn page_size(&self) -> usize {
        self.cfg.page_size()
    }

    pub fn page_size_shift(&self) -> u32 {
        self.cfg.page_size_shift
    }

    pub fn active_file_no(&self) -> u64 {
        self.active_file_no.load(Ordering::Acquire)
    }

    pub fn first_open_file_no(&self) -> u64 {
        self.active.lock().unwrap().first_open_file_no
    }

    pub fn last_created_file_no(&self) -> u64 {
        self.active.lock().unwrap().last_created_file_no
    }

    /// (active file_no, write position within it).
    pub fn status(&self) -> (u64, u64) {
        let ws = self.write_state.lock().unwrap();
        let file_no = self.active_file_no.load(Ordering::Relaxed);
        let pos = ((ws.cur_page_no as u64) << self.page_size_shift()) | ws.cur_page_offset as u64;
        (file_no, pos)
    }

    pub fn first_and_last(&self) -> (u64, u64) {
        let last = self.last_created_file_no();
        let first = self.purge.lock().unwrap().earliest_file_no;
        (first, last)
    }

    /// Reinitialize the in-memory state (startup and RESET MASTER).
    pub fn init_state(&self) {
        {
            let mut active = self.active.lock().unwrap();
            active.first_open_file_no = NO_FILE;
            active.last_created_file_no = NO_FILE;
            active.prealloc_end = false;
            active.prealloc_failed = false;
        }
        for i in 0..4 {
            self.cur_end_offset[i].store(NO_FILE, Ordering::Relaxed);
            self.cur_durable_offset[i].store(NO_FILE, Ordering::Relaxed);
        }
        self.active_file_no.store(NO_FILE, Ordering::Release);
        let mut ws = self.write_state.lock().unwrap();
        ws.cur_page_no = 0;
        ws.cur_page_offset = BINLOG_PAGE_DATA;
        ws.cur_block = None;
        ws.diff_state.reset();
        ws.state_interval_pages = self.cfg.state_interval_pages;
        let mut purge = self.purge.lock().unwrap();
        purge.earliest_file_no = NO_FILE;
        purge.total_used_size = 0;
    }

    pub(crate) fn set_active(
        &self,
        file_no: u64,
        page_no: u32,
        page_offset: u32,
        interval_pages: u64,
    ) {
        self.active_file_no.store(file_no, Ordering::Release);
        self.file_hash
            .earliest_oob_ref
            .store(file_no, Ordering::Relaxed);
        let mut ws = self.write_state.lock().unwrap();
        ws.cur_page_no = page_no;
        ws.cur_page_offset = page_offset;
        ws.state_interval_pages = if interval_pages != 0 {
            interval_pages
        } else {
            self.cfg.state_interval_pages
        };
        drop(ws);
        self.pending.init(file_no);
    }

    pub(crate) fn publish_created(&self, file_no: u64) {
        let mut active = self.active.lock().unwrap();
        active.last_created_file_no = file_no;
        if self.active_file_no.load(Ordering::Relaxed) == NO_FILE {
            self.cur_end_offset[(file_no & 3) as usize].store(0, Ordering::Release);
            self.cur_durable_offset[(file_no & 3) as usize].store(0, Ordering::Release);
            self.active_file_no.store(file_no, Ordering::Relaxed);
            self.file_hash
                .earliest_oob_ref
                .store(file_no, Ordering::Relaxed);
        }
        if active.first_open_file_no == NO_FILE {
            active.first_open_file_no = file_no;
        }
        self.active_cond.notify_all();
    }

    pub(crate) fn mark_first_open(&self, file_no: u64) {
        self.active.lock().unwrap().first_open_file_no = file_no;
    }

    /// Record the open-file window found by discovery, so pre-allocation
    /// continues after the existing files instead of starting over.
    pub(crate) fn note_open(&self, first_open: u64, last_created: u64) {
        let mut active = self.active.lock().unwrap();
        active.first_open_file_no = first_open;
        active.last_created_file_no = last_created;
    }

    pub(crate) fn prealloc_wants_create(&self) -> Option<u64> {
        let active = self.active.lock().unwrap();
        let cur = self.active_file_no.load(Ordering::Relaxed);
        let last_created = active.last_created_file_no;
        if last_created == NO_FILE {
            return Some(0);
        }
        if last_created <= cur.min(active.first_open_file_no) {
            return Some(last_created + 1);
        }
        None
    }

    pub(crate) fn prealloc_wants_close(&self) -> Option<u64> {
        let active = self.active.lock().unwrap();
        let cur = self.active_file_no.load(Ordering::Relaxed);
        if active.first_open_file_no != NO_FILE && cur != NO_FILE && active.first_open_file_no < cur
        {
            Some(cur - 1)
        } else {
            None
        }
    }

    pub(crate) fn prealloc_should_end(&self) -> bool {
        self.active.lock().unwrap().prealloc_end
    }

    pub fn stop_prealloc(&self) {
        self.active.lock().unwrap().prealloc_end = true;
        self.active_cond.notify_all();
    }

    pub(crate) fn mark_prealloc_failed(&self) {
        self.active.lock().unwrap().prealloc_failed = true;
        self.active_cond.notify_all();
    }

    /// Park the pre-allocation thread until there is work or shutdown.
    pub(crate) fn prealloc_wait(&self) {
        let guard = self.active.lock().unwrap();
        if !guard.prealloc_end {
            drop(self.active_cond.wait(guard).unwrap());
        }
    }

    /// Wait at startup until the pre-allocation thread has the first
    /// binlog file available.
    pub fn wait_first_created(&self) -> DbResult<()> {
        let mut guard = self.active.lock().unwrap();
        while guard.last_created_file_no == NO_FILE {
            if guard.prealloc_failed {
                return Err(DbErr::Io(std::io::Error::other(
                    "binlog pre-allocation failed at startup",
                )));
            }
            guard = self.active_cond.wait(guard).unwrap();
        }
        Ok(())
    }

    /// Wait for the pre-allocation thread to have created a file beyond
    /// `file_no` so the writer can rotate into it.
    fn wait_for_next_file(&self, file_no: u64) -> DbResult<()> {
        let mut active = self.active.lock().unwrap();
        loop {
            if active.prealloc_failed {
                return Err(DbErr::Io(std::io::Error::other(
                    "binlog pre-allocation failed",
                )));
            }
            if active.last_created_file_no != NO_FILE && active.last_created_file_no > file_no {
                return Ok(());
            }
            self.active_cond.notify_all();
            active = self.active_cond.wait(active).unwrap();
        }
    }

    /// Append one record to the binlog as a chain of chunks, interleaving
    /// GTID state snapshot records at their page positions and rotating to
    /// the next file when the active one is full.
    /// Returns (file_no, offset) of the first chunk of the record.
    pub fn write_rec(
        &self,
        chunk_data: &mut dyn ChunkData,
        mtr: &mut Mtr,
        chunk_type: u8,
    ) -> DbResult<(u64, u64)> {
        let page_size = self.page_size() as u32;
        let shift = self.page_size_shift();
        let page_end = page_size - BINLOG_PAGE_DATA_END;

        let mut ws = self.write_state.lock().unwrap();
        let mut file_no = self.active_file_no.load(Ordering::Relaxed);
        let mut page_no = ws.cur_page_no;
        let mut page_offset = ws.cur_page_offset;
        let mut block = ws.cur_block.clone();
        let mut pending_prev_end_offset = 0u64;
        let mut start: Option<(u64, u64)> = None;
        let mut cont_flag = 0u8;
        let mut payload = vec![0u8; (page_end - BINLOG_PAGE_DATA - 3) as usize];

        loop {
            if page_offset == BINLOG_PAGE_DATA {
                if page_no >= self.fifo.size_in_pages(file_no) {
                    // The active file is full: hand it to the pre-allocation
                    // thread and move into the next, pre-created file.
                    pending_prev_end_offset = (page_no as u64) << shift;
                    self.wait_for_next_file(file_no)?;
                    file_no += 1;
                    let slot = (file_no & 3) as usize;
                    self.cur_end_offset[slot].store(0, Ordering::Relaxed);
                    self.cur_durable_offset[slot].store(0, Ordering::Relaxed);
                    self.active_file_no.store(file_no, Ordering::Release);
                    self.active_cond.notify_all();
                    page_no = 0;
                    ws.state_interval_pages = self.cfg.state_interval_pages;
                }

                let interval = ws.state_interval_pages;
                if page_no <= 1 {
                    if page_no == 0 {
                        // First write into this file: the header page goes
                        // in ahead of everything, so recovery can learn the
                        // file's start LSN.
                        self.write_header_page(
                            mtr,
                            file_no,
                            self.fifo.size_in_pages(file_no) as u64,
                            self.redo.get_lsn(),
                            ws.state_interval_pages,
                        )?;
                    }
                    // The full GTID state is the first record of every
                    // file, on page 1.
                    page_no = 1;
                    let mut full_state = ws.global_state.clone();
                    if file_no == 0 && full_state.count() == 1 {
                        // The very first GTID in a fresh binlog: write an
                        // empty state so replication can start from the
                        // position just before it.
                        let gtid = full_state.iter().next().unwrap();
                        if gtid.seq_no == 1 {
                            full_state.reset();
                        }
                    }
                    block = Some(self.binlog_gtid_state(
                        &full_state,
                        mtr,
                        file_no,
                        &mut page_no,
                        &mut page_offset,
                    )?);
                    ws.diff_state.reset();
                } else if interval != 0 && (page_no as u64) % interval == 0 {
                    let diff = ws.diff_state.clone();
                    block = Some(self.binlog_gtid_state(
                        &diff,
                        mtr,
                        file_no,
                        &mut page_no,
                        &mut page_offset,
                    )?);
                } else {
                    block = Some(self.fifo.create_page(file_no, page_no)?);
                }
            } else if block.is_none() {
                block = match self.fifo.get_page(file_no, page_no) {
                    Some(b) => Some(b),
                    None => Some(self.fifo.create_page(file_no, page_no)?),
                };
            }

            let blk = block.as_ref().unwrap().clone();
            debug_assert!(page_offset < page_end);
            let page_remain = page_end - page_offset;
            if page_remain < 4 {
                // Pad the remaining few bytes, and move to the next page.
                let fill = vec![FSP_BINLOG_TYPE_FILLER; page_remain as usize];
                blk.frame_mut()[page_offset as usize..page_end as usize]
                    .copy_from_slice(&fill);
                mtr.binlog_write(binlog_space_id(file_no), page_no, page_offset, &fill);
                block = None;
                page_no += 1;
                page_offset = BINLOG_PAGE_DATA;
                continue;
            }
            if start.is_none() {
                start = Some((file_no, ((page_no as u64) << shift) + page_offset as u64));
            }

            // The chunk length field is 16 bits.
            let max_payload = ((page_remain - 3) as usize).min(0xffff);
            let (size, last) = chunk_data.copy_data(&mut payload[..max_payload]);
            debug_assert!(last || size == max_payload);
            debug_assert!(size <= 0xffff);

            let mut chunk = Vec::with_capacity(size + 3);
            let last_flag = if last { FSP_BINLOG_FLAG_LAST } else { 0 };
            chunk.push(chunk_type | cont_flag | last_flag);
            chunk.push((size & 0xff) as u8);
            chunk.push((size >> 8) as u8);
            chunk.extend_from_slice(&payload[..size]);
            blk.frame_mut()[page_offset as usize..page_offset as usize + chunk.len()]
                .copy_from_slice(&chunk);
            mtr.binlog_write(binlog_space_id(file_no), page_no, page_offset, &chunk);
            cont_flag = FSP_BINLOG_FLAG_CONT;

            if page_remain - 3 == size as u32 {
                block = None;
                page_offset = BINLOG_PAGE_DATA;
                page_no += 1;
            } else {
                page_offset += size as u32 + 3;
            }
            if last {
                break;
            }
        }

        ws.cur_block = block;
        ws.cur_page_no = page_no;
        ws.cur_page_offset = page_offset;
        if pending_prev_end_offset != 0 {
            self.cur_end_offset[((file_no - 1) & 3) as usize]
                .store(pending_prev_end_offset, Ordering::Release);
        }
        self.cur_end_offset[(file_no & 3) as usize].store(
            ((page_no as u64) << shift) + page_offset as u64,
            Ordering::Release,
        );
        Ok(start.expect("record produced no chunk"))
    }

    /// Serialize a GTID state: entry count, the earliest pending-XA file
    /// reference (stored +1 so zero means none), then the
    /// (domain, server, seq_no) triples.
    fn serialize_gtid_state(&self, state: &BinlogState) -> Vec<u8> {
        let mut buf = Vec::new();
        compr_int_write(&mut buf, state.count() as u64);
        let xa_ref = self
            .xid_hash
            .earliest_ref()
            .unwrap_or(NO_FILE);
        compr_int_write(&mut buf, xa_ref.wrapping_add(1));
        for gtid in state.iter() {
            compr_int_write(&mut buf, gtid.domain_id as u64);
            compr_int_write(&mut buf, gtid.server_id as u64);
            compr_int_write(&mut buf, gtid.seq_no);
        }
        buf
    }

    /// Write a GTID state record at the start of the page `*page_no`,
    /// returning the page the caller should continue writing event data
    /// into. The record is only written when event data still fits behind
    /// it; a snapshot with nothing to seek to after it is useless.
    fn binlog_gtid_state(
        &self,
        state: &BinlogState,
        mtr: &mut Mtr,
        file_no: u64,
        page_no: &mut u32,
        page_offset: &mut u32,
    ) -> DbResult<Arc<FifoPage>> {
        let page_size = self.page_size() as u32;
        let page_room = page_size - (BINLOG_PAGE_DATA + BINLOG_PAGE_DATA_END);
        let buf = self.serialize_gtid_state(state);
        let needed_pages = (buf.len() as u32).div_ceil(page_room);

        debug_assert_eq!(*page_offset, BINLOG_PAGE_DATA);
        debug_assert_ne!(*page_no, 0);

        let mut block = None;
        if *page_no + needed_pages < self.fifo.size_in_pages(file_no) {
            let mut used = buf.len();
            let mut pos = 0usize;
            let mut cont_flag = 0u8;
            while used > 0 {
                let blk = self.fifo.create_page(file_no, *page_no)?;
                *page_offset = BINLOG_PAGE_DATA;
                let mut chunk_len = used;
                let mut last_flag = FSP_BINLOG_FLAG_LAST;
                if chunk_len > (page_room - 3) as usize {
                    last_flag = 0;
                    chunk_len = (page_room - 3) as usize;
                    *page_no += 1;
                }
                let mut chunk = Vec::with_capacity(chunk_len + 3);
                chunk.push(FSP_BINLOG_TYPE_GTID_STATE | cont_flag | last_flag);
                chunk.push((chunk_len & 0xff) as u8);
                chunk.push((chunk_len >> 8) as u8);
                chunk.extend_from_slice(&buf[pos..pos + chunk_len]);
                blk.frame_mut()
                    [*page_offset as usize..*page_offset as usize + chunk.len()]
                    .copy_from_slice(&chunk);
                mtr.binlog_write(
                    binlog_space_id(file_no),
                    blk.page_no,
                    *page_offset,
                    &chunk,
                );
                *page_offset += chunk.len() as u32;
                pos += chunk_len;
                used -= chunk_len;
                cont_flag = FSP_BINLOG_FLAG_CONT;
                block = Some(blk);
            }
            if *page_offset == page_size - BINLOG_PAGE_DATA_END {
                block = None;
                *page_offset = BINLOG_PAGE_DATA;
                *page_no += 1;
            }
        }

        match block {
            Some(b) => Ok(b),
            None => self.fifo.create_page(file_no, *page_no),
        }
    }

    /// Write the header page of a new binlog file and cover the used bytes
    /// with redo so recovery can rebuild it.
    pub fn write_header_page(
        &self,
        mtr: &mut Mtr,
        file_no: u64,
        size_in_pages: u64,
        start_lsn: Lsn,
        interval_pages: u64,
    ) -> DbResult<()> {
        let block = self.fifo.create_page(file_no, 0)?;
        let (oob_ref, xa_ref) = self.file_hash.update_refs(file_no);

        let mut hdr = vec![0u8; IBB_BINLOG_HEADER_SIZE as usize];
        hdr[0..4].copy_from_slice(&IBB_MAGIC.to_le_bytes());
        hdr[4..8].copy_from_slice(&self.page_size_shift().to_le_bytes());
        hdr[8..12].copy_from_slice(&IBB_FILE_VERS_MAJOR.to_le_bytes());
        hdr[12..16].copy_from_slice(&IBB_FILE_VERS_MINOR.to_le_bytes());
        hdr[16..24].copy_from_slice(&file_no.to_le_bytes());
        hdr[24..32].copy_from_slice(&size_in_pages.to_le_bytes());
        hdr[32..40].copy_from_slice(&start_lsn.to_le_bytes());
        hdr[40..48].copy_from_slice(&interval_pages.to_le_bytes());
        hdr[48..56].copy_from_slice(&oob_ref.to_le_bytes());
        hdr[56..64].copy_from_slice(&xa_ref.to_le_bytes());

        {
            let mut frame = block.frame_mut();
            frame[..hdr.len()].copy_from_slice(&hdr);
            // An extra CRC at the end of the minimal page size, so the
            // header can be validated before the page size is known.
            let payload = (IBB_HEADER_PAGE_SIZE - BINLOG_PAGE_CHECKSUM) as usize;
            let crc = crc32c::crc32c(&frame[..payload]);
            frame[payload..payload + 4].copy_from_slice(&crc.to_le_bytes());
        }
        mtr.binlog_write(binlog_space_id(file_no), 0, 0, &hdr);
        self.file_hash.record(file_no, oob_ref, xa_ref);
        Ok(())
    }

    /// Record a finished commit in the pending-LSN fifo and optionally
    /// flush the redo log, per flush_log_at_trx_commit.
    pub fn post_commit(&self, commit_lsn: Lsn, file_no: u64, end_offset: u64) {
        if commit_lsn == 0 {
            return;
        }
        if self.cfg.flush_log_at_trx_commit & 1 != 0 {
            self.redo.flush_up_to(commit_lsn);
        }
        self.pending.add_to_fifo(
            commit_lsn,
            file_no,
            end_offset,
            self.redo.get_flushed_lsn(),
            self.active_file_no.load(Ordering::Relaxed),
            &self.cur_durable_offset,
            &self.cur_end_offset,
        );
    }

    /// Write one complete event group (commit record) to the binlog.
    /// Returns the start position of the record.
    pub fn write_commit_record(
        &self,
        gtid_event: &[u8],
        main_data: &[u8],
        gtid: Option<RplGtid>,
        primary: Option<OobRefs>,
        secondary: Option<OobRefs>,
    ) -> DbResult<(u64, u64, Lsn)> {
        if let Some(gtid) = &gtid {
            let mut ws = self.write_state.lock().unwrap();
            ws.diff_state.update(gtid);
            ws.global_state.update(gtid);
        }
        let mut chunk_data = ChunkDataCache::new(gtid_event, main_data, primary, secondary);
        let mut mtr = Mtr::start(self.redo.clone());
        let pos = self.write_rec(&mut chunk_data, &mut mtr, FSP_BINLOG_TYPE_COMMIT)?;
        let commit_lsn = mtr.commit();
        let file_no = self.active_file_no.load(Ordering::Relaxed);
        let end_offset = self.cur_end_offset[(file_no & 3) as usize].load(Ordering::Relaxed);
        self.post_commit(commit_lsn, file_no, end_offset);
        Ok((pos.0, pos.1, commit_lsn))
    }

    /// Durably create the initial binlog data: a FILLER record (forcing the
    /// full GTID state onto page 1), redo flush, page flush and fsync, so
    /// that recovery always finds a non-empty file with a usable start LSN.
    pub fn sync_initial(&self) -> DbResult<()> {
        let mut dummy = ChunkDataFlush;
        let mut mtr = Mtr::start(self.redo.clone());
        self.write_rec(&mut dummy, &mut mtr, FSP_BINLOG_TYPE_FILLER)?;
        let lsn = mtr.commit();
        let file_no = self.active_file_no.load(Ordering::Relaxed);
        self.redo.flush_up_to(lsn);
        self.fifo.flush_up_to(file_no, 0)?;
        self.fifo.do_fdatasync(file_no)?;
        let end_offset = self.cur_end_offset[(file_no & 3) as usize].load(Ordering::Relaxed);
        self.pending.add_to_fifo(
            lsn,
            file_no,
            end_offset,
            self.redo.get_flushed_lsn(),
            file_no,
            &self.cur_durable_offset,
            &self.cur_end_offset,
        );
        Ok(())
    }
}

impl BinlogSystem {
    /// Write an XA PREPARE record and register the XID so the files its
    /// out-of-band data lives in stay pinned until all engines complete.
    pub fn write_xa_prepare(
        &self,
        xid: &crate::binlog0xa::Xid,
        engine_count: u8,
        oob: Option<crate::binlog0xa::XidOobRefs>,
    ) -> DbResult<Lsn> {
        let mut buf = Vec::with_capacity(8 + xid.gtrid.len() + xid.bqual.len());
        buf.push(0); // flag
        buf.push(engine_count);
        buf.extend_from_slice(&xid.format_id.to_le_bytes());
        buf.push(xid.gtrid.len() as u8);
        buf.push(xid.bqual.len() as u8);
        buf.extend_from_slice(&xid.gtrid);
        buf.extend_from_slice(&xid.bqual);

        let mut chunk_data = ChunkDataBuf::new(&buf);
        let mut mtr = Mtr::start(self.redo.clone());
        self.write_rec(&mut chunk_data, &mut mtr, FSP_BINLOG_TYPE_XA_PREPARE)?;
        let lsn = mtr.commit();

        if !self.xid_hash.add_xid(
            xid,
            oob,
            self.active_file_no.load(Ordering::Acquire),
            &self.file_hash,
        ) {
            return Err(DbErr::corruption("duplicate XA PREPARE for the same XID"));
        }
        // The prepare record must be durable before OK is returned to the
        // client, so crash recovery can resume the XA transaction.
        if self.cfg.flush_log_at_trx_commit > 0 {
            self.redo.flush_up_to(lsn);
        }
        let file_no = self.active_file_no.load(Ordering::Relaxed);
        let end_offset = self.cur_end_offset[(file_no & 3) as usize].load(Ordering::Relaxed);
        self.post_commit(lsn, file_no, end_offset);
        Ok(lsn)
    }

    /// Write an XA COMMIT or XA ROLLBACK record; recovery uses it to know
    /// the XID is no longer active. The file reference is dropped later by
    /// xa_unlog(), once all engines are durably complete.
    pub fn write_xa_complete(
        &self,
        xid: &crate::binlog0xa::Xid,
        is_commit: bool,
    ) -> DbResult<Lsn> {
        let mut buf = Vec::with_capacity(7 + xid.gtrid.len() + xid.bqual.len());
        buf.push(if is_commit {
            IBB_FL_XA_TYPE_COMMIT
        } else {
            IBB_FL_XA_TYPE_ROLLBACK
        });
        buf.extend_from_slice(&xid.format_id.to_le_bytes());
        buf.push(xid.gtrid.len() as u8);
        buf.push(xid.bqual.len() as u8);
        buf.extend_from_slice(&xid.gtrid);
        buf.extend_from_slice(&xid.bqual);

        let mut chunk_data = ChunkDataBuf::new(&buf);
        let mut mtr = Mtr::start(self.redo.clone());
        self.write_rec(&mut chunk_data, &mut mtr, FSP_BINLOG_TYPE_XA_COMPLETE)?;
        let lsn = mtr.commit();
        if self.cfg.flush_log_at_trx_commit > 0 {
            self.redo.flush_up_to(lsn);
        }
        let file_no = self.active_file_no.load(Ordering::Relaxed);
        let end_offset = self.cur_end_offset[(file_no & 3) as usize].load(Ordering::Relaxed);
        self.post_commit(lsn, file_no, end_offset);
        Ok(lsn)
    }

    /// Called once the other participating engines are durable: the XID no
    /// longer pins any binlog file.
    pub fn xa_unlog(&self, xid: &crate::binlog0xa::Xid) {
        crate::binlog0xa::xid_unlog(&self.xid_hash, &self.file_hash, xid);
    }
}

/// Parse a GTID state record found at the start of a page.
/// Returns Ok(None) when the page does not begin with a state record.
pub fn read_gtid_state_from_page(
    state: &mut BinlogState,
    page: &[u8],
) -> DbResult<Option<u64>> {
    let p = &page[BINLOG_PAGE_DATA as usize..];
    let t = p[0];
    if t & FSP_BINLOG_TYPE_MASK != FSP_BINLOG_TYPE_GTID_STATE {
        return Ok(None);
    }
    if t & FSP_BINLOG_FLAG_LAST == 0 {
        return Err(DbErr::corruption(
            "multi-page GTID state record not terminated on its page",
        ));
    }
    let len = ((p[2] as usize) << 8) | p[1] as usize;
    let mut body = &p[3..3 + len];

    let mut next = |body: &mut &[u8]| -> DbResult<u64> {
        let (v, n) = compr_int_read(body).map_err(DbErr::Io)?;
        *body = &body[n..];
        Ok(v)
    };

    let count = next(&mut body)?;
    let xa_ref = next(&mut body)?.wrapping_sub(1);
    for _ in 0..count {
        let domain_id = next(&mut body)?;
        let server_id = next(&mut body)?;
        let seq_no = next(&mut body)?;
        if domain_id > u32::MAX as u64 || server_id > u32::MAX as u64 {
            return Err(DbErr::corruption("GTID id out of range in state record"));
        }
        state.update(&RplGtid {
            domain_id: domain_id as u32,
            server_id: server_id as u32,
            seq_no,
        });
    }
    Ok(Some(xa_ref))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_header_page_roundtrip() {
        let mut page = vec![0u8; 16384];
        page[0..4].copy_from_slice(&IBB_MAGIC.to_le_bytes());
        page[4..8].copy_from_slice(&14u32.to_le_bytes());
        page[8..12].copy_from_slice(&IBB_FILE_VERS_MAJOR.to_le_bytes());
        page[16..24].copy_from_slice(&7u64.to_le_bytes());
        page[24..32].copy_from_slice(&1024u64.to_le_bytes());
        page[32..40].copy_from_slice(&0x3000u64.to_le_bytes());
        page[40..48].copy_from_slice(&4u64.to_le_bytes());
        page[48..56].copy_from_slice(&5u64.to_le_bytes());
        page[56..64].copy_from_slice(&u64::MAX.to_le_bytes());
        let h = fsp_binlog_extract_header_page(&page);
        assert!(!h.is_invalid && !h.is_empty);
        assert_eq!(h.file_no, 7);
        assert_eq!(h.page_count, 1024);
        assert_eq!(h.start_lsn, 0x3000);
        assert_eq!(h.diff_state_interval, 4);
        assert_eq!(h.oob_ref_file_no, 5);
        assert_eq!(h.xa_ref_file_no, u64::MAX);
    }

    #[test]
    fn test_header_page_empty_and_invalid() {
        let page = vec![0u8; 16384];
        let h = fsp_binlog_extract_header_page(&page);
        assert!(h.is_empty && !h.is_invalid);

        let mut page = vec![0u8; 16384];
        page[0] = 0x77;
        let h = fsp_binlog_extract_header_page(&page);
        assert!(h.is_invalid);
    }

    #[test]
    fn test_chunk_data_cache_order() {
        let refs = OobRefs {
            num_nodes: 2,
            first_file_no: 0,
            first_offset: 100,
            last_file_no: 0,
            last_offset: 200,
        };
        let mut c = ChunkDataCache::new(b"GTID", b"MAIN", Some(refs), None);
        let mut buf = [0u8; 64];
        let (n, last) = c.copy_data(&mut buf);
        assert!(last);
        // count, first_file, first_off, last_file, last_off, 0-terminator
        let expect_header = [2u8, 0, 100, 0, 0xc8, 1, 0];
        assert_eq!(&buf[..expect_header.len()], &expect_header);
        assert_eq!(&buf[n - 8..n], b"GTIDMAIN");
    }

    #[test]
    fn test_chunk_data_buf() {
        let mut c = ChunkDataBuf::new(b"hello");
        let mut buf = [0u8; 3];
        assert_eq!(c.copy_data(&mut buf), (3, false));
        assert_eq!(&buf, b"hel");
        assert_eq!(c.copy_data(&mut buf), (2, true));
        assert_eq!(&buf[..2], b"lo");
    }
}
