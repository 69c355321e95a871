//! Binlog readers: the low-level chunk reader that follows a record chain
//! across pages and files (choosing between the page fifo and the file on
//! disk), the event-group reader state machine used by replication dump
//! threads, and GTID position search.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use crate::binlog0files::{NO_FILE, binlog_name_make};
use crate::compr0int::compr_int_read;
use crate::db0err::{DbErr, DbResult};
use crate::fsp0binlog::{
    BINLOG_PAGE_DATA, BINLOG_PAGE_DATA_END, BinlogSystem, FSP_BINLOG_FLAG_CONT,
    FSP_BINLOG_FLAG_LAST, FSP_BINLOG_TYPE_COMMIT, FSP_BINLOG_TYPE_EMPTY,
    FSP_BINLOG_TYPE_FILLER, FSP_BINLOG_TYPE_MASK, FSP_BINLOG_TYPE_OOB_DATA,
    read_gtid_state_from_page,
};
use crate::rpl0gtid::{BinlogState, SlaveConnectionState};

/// Reader visibility: dirty readers see any written byte, durable readers
/// only what is guaranteed recoverable after a crash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    Dirty,
    Durable,
}

/// A resumable position in the chunk stream, including mid-record state.
#[derive(Debug, Clone, Copy, Default)]
pub struct SavedPosition {
    file_no: u64,
    offset: u64,
    cur_type: u8,
    chunk_remain: u32,
    in_record: bool,
    record_done: bool,
    saw_last: bool,
    skip_partial: bool,
}

/// Reads chunk payload bytes of one record at a time, following CONT
/// chunks across page and file boundaries and skipping interleaved records
/// of other types (GTID state snapshots).
pub struct BinlogChunkReader {
    sys: Arc<BinlogSystem>,
    mode: ReadMode,
    pub file_no: u64,
    pub offset: u64,
    /// Stop at the end of this file instead of following the stream
    /// (single-file mode); NO_FILE for no limit.
    pub stop_file_no: u64,

    page_buf: Vec<u8>,
    page_loaded: Option<(u64, u32)>,

    cur_file: Option<File>,
    cur_file_no_open: u64,
    cur_file_length: u64,

    cur_type: u8,
    chunk_remain: u32,
    in_record: bool,
    record_done: bool,
    saw_last: bool,
    skip_partial: bool,
}

impl BinlogChunkReader {
    pub fn new(sys: Arc<BinlogSystem>, mode: ReadMode) -> BinlogChunkReader {
        let page_size = sys.page_size();
        BinlogChunkReader {
            sys,
            mode,
            file_no: 0,
            offset: page_size as u64,
            stop_file_no: NO_FILE,
            page_buf: vec![0u8; page_size],
            page_loaded: None,
            cur_file: None,
            cur_file_no_open: NO_FILE,
            cur_file_length: 0,
            cur_type: FSP_BINLOG_TYPE_EMPTY,
            chunk_remain: 0,
            in_record: false,
            record_done: false,
            saw_last: false,
            skip_partial: true,
        }
    }

    pub fn sys(&self) -> &Arc<BinlogSystem> {
        &self.sys
    }

    pub fn seek(&mut self, file_no: u64, offset: u64) {
        let page_size = self.sys.page_size() as u64;
        self.file_no = file_no;
        // Page 0 is the header page; data starts on page 1.
        self.offset = offset.max(page_size);
        self.page_loaded = None;
        self.cur_type = FSP_BINLOG_TYPE_EMPTY;
        self.chunk_remain = 0;
        self.in_record = false;
        self.record_done = false;
        self.saw_last = false;
    }

    pub fn skip_partial(&mut self, skip: bool) {
        self.skip_partial = skip;
    }

    pub fn cur_type(&self) -> u8 {
        self.cur_type
    }

    pub fn end_of_record(&self) -> bool {
        self.record_done
    }

    pub fn is_end_of_page(&self) -> bool {
        let page_size = self.sys.page_size() as u64;
        let in_page = self.offset & (page_size - 1);
        in_page >= page_size - BINLOG_PAGE_DATA_END as u64
    }

    pub fn current_file_no(&self) -> u64 {
        self.file_no
    }

    pub fn current_pos(&self) -> u64 {
        self.offset
    }

    pub fn save_pos(&self) -> SavedPosition {
        SavedPosition {
            file_no: self.file_no,
            offset: self.offset,
            cur_type: self.cur_type,
            chunk_remain: self.chunk_remain,
            in_record: self.in_record,
            record_done: self.record_done,
            saw_last: self.saw_last,
            skip_partial: self.skip_partial,
        }
    }

    pub fn restore_pos(&mut self, pos: &SavedPosition) {
        self.file_no = pos.file_no;
        self.offset = pos.offset;
        self.cur_type = pos.cur_type;
        self.chunk_remain = pos.chunk_remain;
        self.in_record = pos.in_record;
        self.record_done = pos.record_done;
        self.saw_last = pos.saw_last;
        self.skip_partial = pos.skip_partial;
        self.page_loaded = None;
    }

    /// Release cached page state; when the stream was exhausted, the page
    /// must be re-fetched on the next call to observe newly appended data.
    pub fn release(&mut self, at_eof: bool) {
        if at_eof {
            self.page_loaded = None;
        }
    }

    fn end_offset_for(&self, file_no: u64) -> u64 {
        let slot = (file_no & 3) as usize;
        match self.mode {
            ReadMode::Dirty => self.sys.cur_end_offset[slot].load(Ordering::Acquire),
            ReadMode::Durable => self.sys.cur_durable_offset[slot].load(Ordering::Acquire),
        }
    }

    /// True when some data past the current position is visible.
    pub fn data_available(&self) -> bool {
        let active = self.sys.active_file_no();
        if active != self.file_no {
            return active > self.file_no;
        }
        let end_offset = self.end_offset_for(self.file_no);
        let active2 = self.sys.active_file_no();
        active2 != active || (end_offset != NO_FILE && end_offset > self.offset)
    }

    /// True when (file_no, offset) is strictly ahead of our position.
    pub fn is_before_pos(&self, file_no: u64, offset: u64) -> bool {
        self.file_no < file_no || (self.file_no == file_no && self.offset < offset && offset != NO_FILE)
    }

    fn ensure_file_open(&mut self) -> DbResult<()> {
        if self.cur_file.is_some() && self.cur_file_no_open == self.file_no {
            return Ok(());
        }
        let path = binlog_name_make(&self.sys.cfg.directory, self.file_no);
        let file = File::open(&path)?;
        self.cur_file_length = file.metadata()?.len();
        self.cur_file = Some(file);
        self.cur_file_no_open = self.file_no;
        Ok(())
    }

    fn next_file(&mut self) {
        self.cur_file = None;
        self.cur_file_no_open = NO_FILE;
        self.file_no += 1;
        self.offset = self.sys.page_size() as u64;
        self.page_loaded = None;
    }

    /// Load the page containing `self.offset` into page_buf.
    ///
    /// The page is taken from the page fifo when it may not yet be written
    /// out, else from the file. The active file number is checked before
    /// and after the fifo lookup: if it moved, the fifo entry may belong to
    /// a recycled slot and the lookup is retried.
    ///
    /// Returns the exclusive data end within the page, or None when no data
    /// is currently readable at this position (end of visible stream).
    fn load_page(&mut self) -> DbResult<Option<u32>> {
        let page_size = self.sys.page_size() as u64;
        let shift = self.sys.page_size_shift();
        loop {
            let active = self.sys.active_file_no();
            if self.file_no > active && active != NO_FILE {
                return Ok(None);
            }
            let page_no = (self.offset >> shift) as u32;
            let page_start = (page_no as u64) << shift;
            let end_offset = self.end_offset_for(self.file_no);

            if self.file_no + 1 >= active && end_offset != NO_FILE {
                if self.offset >= end_offset {
                    if self.file_no == active {
                        // Reached the visible end of the active file.
                        return Ok(None);
                    }
                    // End of a fully written prior file.
                    if self.stop_file_no != NO_FILE && self.file_no >= self.stop_file_no {
                        return Ok(None);
                    }
                    self.next_file();
                    continue;
                }
                let fifo_page = self.sys.fifo.get_page(self.file_no, page_no);
                let active2 = self.sys.active_file_no();
                if active2 != active {
                    // The active file moved while we looked; the page might
                    // belong to a recycled space slot. Retry.
                    continue;
                }
                if let Some(page) = fifo_page {
                    self.page_buf.copy_from_slice(&page.frame());
                    self.page_loaded = Some((self.file_no, page_no));
                    let page_data_end = page_size - BINLOG_PAGE_DATA_END as u64;
                    let end_in_page = if end_offset >= page_start + page_data_end {
                        page_data_end
                    } else {
                        end_offset - page_start
                    };
                    return Ok(Some(end_in_page as u32));
                }
                // Not cached: safe to read from the file.
                self.ensure_file_open()?;
                if self.offset >= self.cur_file_length {
                    return Ok(None);
                }
                self.read_file_page(page_no)?;
                let page_data_end = page_size - BINLOG_PAGE_DATA_END as u64;
                let end_in_page = if end_offset >= page_start + page_data_end {
                    page_data_end
                } else {
                    end_offset - page_start
                };
                return Ok(Some(end_in_page as u32));
            }

            // The file is not open as a tablespace: read it from disk.
            self.ensure_file_open()?;
            if self.offset >= self.cur_file_length {
                if self.stop_file_no != NO_FILE && self.file_no >= self.stop_file_no {
                    return Ok(None);
                }
                self.next_file();
                continue;
            }
            self.read_file_page(page_no)?;
            return Ok(Some((page_size - BINLOG_PAGE_DATA_END as u64) as u32));
        }
    }

    fn read_file_page(&mut self, page_no: u32) -> DbResult<()> {
        let page_size = self.sys.page_size();
        let file = self.cur_file.as_mut().expect("file is open");
        file.seek(SeekFrom::Start(page_no as u64 * page_size as u64))?;
        let mut read = 0;
        while read < page_size {
            match file.read(&mut self.page_buf[read..]) {
                Ok(0) => break,
                Ok(n) => read += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(DbErr::Io(e)),
            }
        }
        if read < page_size {
            self.page_buf[read..].fill(0);
        }
        self.page_loaded = Some((self.file_no, page_no));
        Ok(())
    }

    pub fn read_error_corruption(&self, msg: &str) -> DbErr {
        DbErr::corruption(format!(
            "binlog file {} offset {}: {msg}",
            self.file_no, self.offset
        ))
    }

    /// Read up to `len` payload bytes.
    ///
    /// With `start_new_rec`, scanning begins at the next record start
    /// (skipping records while skip_partial is set and non-matching chunk
    /// types); otherwise reading continues the current record. Returns 0 at
    /// the end of currently visible data.
    pub fn read_data(
        &mut self,
        buf: &mut [u8],
        len: usize,
        start_new_rec: bool,
    ) -> DbResult<usize> {
        let page_size = self.sys.page_size() as u64;
        let mask = page_size - 1;
        let mut sofar = 0usize;

        if start_new_rec && self.record_done {
            self.record_done = false;
            self.in_record = false;
            self.cur_type = FSP_BINLOG_TYPE_EMPTY;
        }

        'outer: while sofar < len {
            if self.record_done {
                break;
            }
            let Some(page_end) = self.load_page()? else {
                break;
            };
            let page_start = self.offset & !mask;
            let mut in_page = (self.offset & mask) as u32;
            if in_page < BINLOG_PAGE_DATA {
                in_page = BINLOG_PAGE_DATA;
            }

            while sofar < len {
                if self.chunk_remain > 0 {
                    let avail = (page_end - in_page).min(self.chunk_remain);
                    if avail == 0 {
                        // Chunk data continues past the visible end.
                        self.offset = page_start | in_page as u64;
                        break 'outer;
                    }
                    let take = (avail as usize).min(len - sofar);
                    buf[sofar..sofar + take].copy_from_slice(
                        &self.page_buf[in_page as usize..in_page as usize + take],
                    );
                    sofar += take;
                    in_page += take as u32;
                    self.chunk_remain -= take as u32;
                    if self.chunk_remain == 0 && self.saw_last {
                        self.in_record = false;
                        self.record_done = true;
                        self.offset = page_start | in_page as u64;
                        break 'outer;
                    }
                    continue;
                }

                if in_page >= page_end {
                    // Advance to the next page (or stop at visible end).
                    if page_end < (page_size - BINLOG_PAGE_DATA_END as u64) as u32 {
                        self.offset = page_start | in_page as u64;
                        break 'outer;
                    }
                    self.offset = page_start + page_size;
                    continue 'outer;
                }

                let t = self.page_buf[in_page as usize];
                if t == FSP_BINLOG_TYPE_EMPTY {
                    // No more data written to this page yet.
                    self.offset = page_start | in_page as u64;
                    break 'outer;
                }
                if t == FSP_BINLOG_TYPE_FILLER {
                    self.offset = page_start + page_size;
                    continue 'outer;
                }
                if in_page + 3 > page_end {
                    return Err(self.read_error_corruption("truncated chunk header"));
                }
                let size = self.page_buf[in_page as usize + 1] as u32
                    | ((self.page_buf[in_page as usize + 2] as u32) << 8);
                let rec_type = t & FSP_BINLOG_TYPE_MASK;
                let is_cont = t & FSP_BINLOG_FLAG_CONT != 0;
                let is_last = t & FSP_BINLOG_FLAG_LAST != 0;

                if self.in_record {
                    if rec_type != self.cur_type {
                        // An interleaved record (GTID state at an interval
                        // page); skip its chunk.
                        in_page += 3 + size;
                        continue;
                    }
                    if !is_cont {
                        return Err(self
                            .read_error_corruption("record continuation chunk missing"));
                    }
                } else {
                    if !start_new_rec {
                        self.offset = page_start | in_page as u64;
                        break 'outer;
                    }
                    if is_cont && self.skip_partial {
                        // Mid-record seek: drop chunks until a record start.
                        in_page += 3 + size;
                        continue;
                    }
                    if is_cont {
                        // A continuation of a record we did not start;
                        // skip it like an interleaved record.
                        in_page += 3 + size;
                        continue;
                    }
                    self.cur_type = rec_type;
                    self.in_record = true;
                    self.record_done = false;
                    self.skip_partial = false;
                }

                self.saw_last = is_last;
                self.chunk_remain = size;
                in_page += 3;
                if size == 0 && is_last {
                    self.in_record = false;
                    self.record_done = true;
                    self.offset = page_start | in_page as u64;
                    break 'outer;
                }
            }

            self.offset = page_start | in_page.min(page_end) as u64;
        }

        Ok(sofar)
    }

    /// Skip the remainder of the current record.
    pub fn skip_current(&mut self) -> DbResult<()> {
        let mut sink = [0u8; 4096];
        while !self.record_done {
            let n = self.read_data(&mut sink, 4096, false)?;
            if n == 0 && !self.record_done {
                // The rest is not visible yet; callers only skip records
                // that are fully written.
                return Err(self.read_error_corruption("record truncated while skipping"));
            }
        }
        Ok(())
    }

    /// Position exactly at `target` bytes into the current page by walking
    /// chunk headers from the start of the page; rejects positions inside a
    /// chunk or beyond the written part.
    pub fn find_offset_in_page(&mut self, target: u32) -> DbResult<()> {
        let page_size = self.sys.page_size() as u64;
        let page_start = self.offset & !(page_size - 1);
        let Some(page_end) = self.load_page()? else {
            return Err(DbErr::corruption("requested binlog position beyond end"));
        };
        let mut in_page = BINLOG_PAGE_DATA;
        let target = target.max(BINLOG_PAGE_DATA);
        while in_page < target {
            if in_page >= page_end {
                return Err(DbErr::corruption("requested binlog position beyond end"));
            }
            let t = self.page_buf[in_page as usize];
            if t == FSP_BINLOG_TYPE_EMPTY || t == FSP_BINLOG_TYPE_FILLER {
                return Err(DbErr::corruption("requested binlog position beyond end"));
            }
            let size = self.page_buf[in_page as usize + 1] as u32
                | ((self.page_buf[in_page as usize + 2] as u32) << 8);
            in_page += 3 + size;
        }
        if in_page != target {
            return Err(DbErr::corruption(
                "requested binlog position inside a chunk",
            ));
        }
        self.offset = page_start | in_page as u64;
        Ok(())
    }
}

/* Post-order traversal of the out-of-band forest. */

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OobState {
    /// About to visit the node for the first time.
    Initial,
    /// Leaf node while traversing the prior trees in the forest.
    TraversingPriorTrees,
    /// Non-leaf node while traversing its left subtree.
    TraversingLeftChild,
    /// Non-leaf node while traversing its right subtree.
    TraversingRightChild,
    /// Reading out this node's own payload.
    SelfData,
}

struct OobStackEntry {
    saved_pos: SavedPosition,
    right_file_no: u64,
    right_offset: u64,
    file_no: u64,
    offset: u64,
    rd_buf: [u8; 64],
    rd_buf_len: usize,
    rd_buf_sofar: usize,
    state: OobState,
    /// Reached via left-child pointers only; such a leaf follows the link
    /// to the prior tree in the forest.
    is_leftmost: bool,
}

/// Incremental post-order traversal over the forest of perfect binary
/// trees, with a software stack of O(log N) entries.
#[derive(Default)]
pub struct OobReader {
    stack: Vec<OobStackEntry>,
}

impl OobReader {
    pub fn start_traversal(&mut self, file_no: u64, offset: u64) {
        self.stack.clear();
        self.push(OobState::Initial, file_no, offset, true);
    }

    pub fn traversal_done(&self) -> bool {
        self.stack.is_empty()
    }

    fn push(&mut self, state: OobState, file_no: u64, offset: u64, is_leftmost: bool) {
        self.stack.push(OobStackEntry {
            saved_pos: SavedPosition::default(),
            right_file_no: 0,
            right_offset: 0,
            file_no,
            offset,
            rd_buf: [0u8; 64],
            rd_buf_len: 0,
            rd_buf_sofar: 0,
            state,
            is_leftmost,
        });
    }

    /// Read the next payload bytes of the traversal, in original append
    /// order.
    pub fn read_data(
        &mut self,
        chunk_rd: &mut BinlogChunkReader,
        buf: &mut [u8],
        len: usize,
    ) -> DbResult<usize> {
        loop {
            let Some(top) = self.stack.last_mut() else {
                return Ok(0);
            };
            match top.state {
                OobState::Initial => {
                    chunk_rd.seek(top.file_no, top.offset);
                    chunk_rd.skip_partial(false);
                    let mut hdr = [0u8; 64];
                    let max = hdr.len();
                    let res = chunk_rd.read_data(&mut hdr, max, true)?;
                    if res == 0 {
                        return Err(
                            chunk_rd.read_error_corruption("unexpected EOF, expected oob chunk")
                        );
                    }
                    if chunk_rd.cur_type() != FSP_BINLOG_TYPE_OOB_DATA {
                        return Err(chunk_rd.read_error_corruption("wrong chunk type"));
                    }
                    top.rd_buf[..res].copy_from_slice(&hdr[..res]);
                    top.rd_buf_len = res;

                    let mut pos = 0usize;
                    let mut next = |pos: &mut usize| -> DbResult<u64> {
                        let (v, n) =
                            compr_int_read(&hdr[*pos..res]).map_err(DbErr::Io)?;
                        *pos += n;
                        Ok(v)
                    };
                    let _node_index = next(&mut pos)?;
                    let left_file_no = next(&mut pos)?;
                    let left_offset = next(&mut pos)?;
                    top.right_file_no = next(&mut pos)?;
                    top.right_offset = next(&mut pos)?;
                    top.rd_buf_sofar = pos;

                    let is_leftmost = top.is_leftmost;
                    let right_file_no = top.right_file_no;
                    let right_offset = top.right_offset;
                    if left_file_no == 0 && left_offset == 0 {
                        // A leaf. Its right link points at the root of the
                        // prior tree; only the leftmost leaf of a tree
                        // follows it (visiting prior trees first).
                        if is_leftmost && !(right_file_no == 0 && right_offset == 0) {
                            top.state = OobState::TraversingPriorTrees;
                            top.saved_pos = chunk_rd.save_pos();
                            self.push(OobState::Initial, right_file_no, right_offset, true);
                        } else {
                            top.state = OobState::SelfData;
                        }
                    } else {
                        top.state = OobState::TraversingLeftChild;
                        top.saved_pos = chunk_rd.save_pos();
                        self.push(OobState::Initial, left_file_no, left_offset, is_leftmost);
                    }
                }
                OobState::TraversingPriorTrees => {
                    chunk_rd.restore_pos(&top.saved_pos);
                    top.state = OobState::SelfData;
                }
                OobState::TraversingLeftChild => {
                    top.state = OobState::TraversingRightChild;
                    let (f, o) = (top.right_file_no, top.right_offset);
                    self.push(OobState::Initial, f, o, false);
                }
                OobState::TraversingRightChild => {
                    chunk_rd.restore_pos(&top.saved_pos);
                    top.state = OobState::SelfData;
                }
                OobState::SelfData => {
                    let mut size = 0usize;
                    if top.rd_buf_len > top.rd_buf_sofar {
                        // Use the excess bytes read with the header.
                        size = (top.rd_buf_len - top.rd_buf_sofar).min(len);
                        buf[..size].copy_from_slice(
                            &top.rd_buf[top.rd_buf_sofar..top.rd_buf_sofar + size],
                        );
                        top.rd_buf_sofar += size;
                    }
                    if size < len && !chunk_rd.end_of_record() {
                        let n = chunk_rd.read_data(&mut buf[size..], len - size, false)?;
                        size += n;
                    }
                    if chunk_rd.end_of_record() && top.rd_buf_sofar == top.rd_buf_len {
                        self.stack.pop();
                    }
                    return Ok(size);
                }
            }
        }
    }
}

/* The event-group reader used by replication dump threads. */

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReaderState {
    ReadNextEventGroup,
    ReadCommitRecord,
    ReadOobData,
}

pub struct BinlogReader {
    chunk_rd: BinlogChunkReader,
    oob_reader: OobReader,
    state: ReaderState,
    saved_commit_pos: SavedPosition,

    oob_count: u64,
    oob_last_file_no: u64,
    oob_last_offset: u64,
    oob_count2: u64,
    oob_last_file_no2: u64,
    oob_last_offset2: u64,

    requested_file_no: u64,
    rd_buf: [u8; 64],
    rd_buf_len: usize,
    rd_buf_sofar: usize,
}

impl BinlogReader {
    pub fn new(sys: Arc<BinlogSystem>, mode: ReadMode, file_no: u64, offset: u64) -> BinlogReader {
        let mut chunk_rd = BinlogChunkReader::new(sys, mode);
        chunk_rd.seek(file_no, offset);
        chunk_rd.skip_partial(true);
        BinlogReader {
            chunk_rd,
            oob_reader: OobReader::default(),
            state: ReaderState::ReadNextEventGroup,
            saved_commit_pos: SavedPosition::default(),
            oob_count: 0,
            oob_last_file_no: 0,
            oob_last_offset: 0,
            oob_count2: 0,
            oob_last_file_no2: 0,
            oob_last_offset2: 0,
            requested_file_no: NO_FILE,
            rd_buf: [0u8; 64],
            rd_buf_len: 0,
            rd_buf_sofar: 0,
        }
    }

    pub fn position(&self) -> (u64, u64) {
        (self.chunk_rd.file_no, self.chunk_rd.offset)
    }

    pub fn seek_internal(&mut self, file_no: u64, offset: u64) {
        self.chunk_rd.seek(file_no, offset);
        self.chunk_rd.skip_partial(true);
        self.state = ReaderState::ReadNextEventGroup;
    }

    /// Restrict reading to the originally requested file (SHOW BINLOG
    /// EVENTS on a single file).
    pub fn enable_single_file(&mut self) {
        self.chunk_rd.stop_file_no = if self.requested_file_no != NO_FILE {
            self.requested_file_no
        } else {
            self.chunk_rd.file_no
        };
    }

    pub fn data_available(&self) -> bool {
        if self.state != ReaderState::ReadNextEventGroup {
            return true;
        }
        self.chunk_rd.data_available()
    }

    /// Read the next event-group bytes: commit record payload first, then
    /// any out-of-band data of the group in original order.
    pub fn read_binlog_data(&mut self, buf: &mut [u8]) -> DbResult<usize> {
        let res = self.read_data_inner(buf);
        if let Ok(n) = res {
            self.chunk_rd.release(n == 0);
        }
        res
    }

    fn parse_commit_header(&mut self, res: usize) -> DbResult<()> {
        let hdr: [u8; 64] = self.rd_buf;
        let hdr = &hdr[..res];
        let mut pos = 0usize;
        let mut next = |pos: &mut usize| -> DbResult<u64> {
            let (v, n) = compr_int_read(&hdr[*pos..]).map_err(DbErr::Io)?;
            *pos += n;
            Ok(v)
        };
        self.oob_count = next(&mut pos)?;
        self.oob_count2 = 0;
        if self.oob_count > 0 {
            let _first_file = next(&mut pos)?;
            let _first_offset = next(&mut pos)?;
            self.oob_last_file_no = next(&mut pos)?;
            self.oob_last_offset = next(&mut pos)?;
            self.oob_count2 = next(&mut pos)?;
            if self.oob_count2 > 0 {
                let _first_file2 = next(&mut pos)?;
                let _first_offset2 = next(&mut pos)?;
                self.oob_last_file_no2 = next(&mut pos)?;
                self.oob_last_offset2 = next(&mut pos)?;
            }
        }
        self.rd_buf_sofar = pos;
        Ok(())
    }

    fn read_data_inner(&mut self, buf: &mut [u8]) -> DbResult<usize> {
        let mut sofar = 0usize;
        loop {
            match self.state {
                ReaderState::ReadNextEventGroup => {
                    let mut hdr = [0u8; 64];
                    let max = hdr.len();
                    let res = self.chunk_rd.read_data(&mut hdr, max, true)?;
                    if res == 0 {
                        return Ok(sofar);
                    }
                    if self.chunk_rd.cur_type() != FSP_BINLOG_TYPE_COMMIT {
                        self.chunk_rd.skip_current()?;
                        continue;
                    }
                    // Found the start of a commit record.
                    self.chunk_rd.skip_partial(false);
                    self.rd_buf[..res].copy_from_slice(&hdr[..res]);
                    self.rd_buf_len = res;
                    self.parse_commit_header(res)?;
                    self.state = ReaderState::ReadCommitRecord;
                }
                ReaderState::ReadCommitRecord => {
                    if self.rd_buf_len > self.rd_buf_sofar {
                        let n = (self.rd_buf_len - self.rd_buf_sofar).min(buf.len() - sofar);
                        buf[sofar..sofar + n].copy_from_slice(
                            &self.rd_buf[self.rd_buf_sofar..self.rd_buf_sofar + n],
                        );
                        self.rd_buf_sofar += n;
                        sofar += n;
                    }
                    if sofar < buf.len() && !self.chunk_rd.end_of_record() {
                        let remain = buf.len() - sofar;
                        let n = self.chunk_rd.read_data(&mut buf[sofar..], remain, false)?;
                        sofar += n;
                    }
                    if self.rd_buf_sofar == self.rd_buf_len && self.chunk_rd.end_of_record() {
                        if self.oob_count == 0 {
                            self.state = ReaderState::ReadNextEventGroup;
                            if sofar < buf.len() && !self.chunk_rd.is_end_of_page() {
                                // Keep draining this page: the goal is to
                                // visit each page once when the caller's
                                // buffer is page-sized.
                                continue;
                            }
                        } else {
                            self.oob_reader
                                .start_traversal(self.oob_last_file_no, self.oob_last_offset);
                            self.saved_commit_pos = self.chunk_rd.save_pos();
                            self.state = ReaderState::ReadOobData;
                        }
                        if sofar == 0 {
                            continue;
                        }
                    }
                    return Ok(sofar);
                }
                ReaderState::ReadOobData => {
                    let remain = buf.len() - sofar;
                    let n = self.oob_reader.read_data(
                        &mut self.chunk_rd,
                        &mut buf[sofar..],
                        remain,
                    )?;
                    if self.oob_reader.traversal_done() {
                        if self.oob_count2 > 0 {
                            // Switch to the secondary forest.
                            self.oob_count = self.oob_count2;
                            self.oob_count2 = 0;
                            self.oob_last_file_no = self.oob_last_file_no2;
                            self.oob_last_offset = self.oob_last_offset2;
                            self.oob_reader
                                .start_traversal(self.oob_last_file_no, self.oob_last_offset);
                        } else {
                            self.chunk_rd.restore_pos(&self.saved_commit_pos);
                            self.state = ReaderState::ReadNextEventGroup;
                        }
                    }
                    if n == 0 && sofar == 0 {
                        if self.state == ReaderState::ReadOobData {
                            // Out-of-band data is fully written before its
                            // commit record; running dry mid-forest means
                            // the chain is broken.
                            return Err(self
                                .chunk_rd
                                .read_error_corruption("out-of-band chain truncated"));
                        }
                        continue;
                    }
                    return Ok(sofar + n);
                }
            }
        }
    }

    /// Block until data past the current position is durable, driving the
    /// redo flush when this thread is the designated flusher. Returns true
    /// on timeout.
    pub fn wait_available(
        &mut self,
        deadline: Option<Instant>,
        killed: Option<&AtomicBool>,
    ) -> DbResult<bool> {
        if self.data_available() {
            return Ok(false);
        }
        let sys = self.chunk_rd.sys().clone();
        let mut is_timeout = false;
        let mut pending_sync_lsn = 0;

        let mut inner = sys.pending.lock();
        loop {
            // Process anything that has become durable since we last looked.
            let durable_lsn = sys.redo.get_flushed_lsn();
            sys.pending.process_durable_lsn_locked(
                &mut inner,
                durable_lsn,
                sys.active_file_no(),
                &sys.cur_durable_offset,
                &sys.cur_end_offset,
            );

            pending_sync_lsn = 0;
            if !inner.is_empty() {
                let e = inner.cur_head();
                if durable_lsn < e.lsn {
                    pending_sync_lsn = e.lsn;
                }
            }

            // Is there data for us now? Holding the fifo mutex pins
            // active_binlog_file_no for this check.
            let mut cur = sys.active_file_no();
            let mut durable_offset =
                sys.cur_durable_offset[(cur & 3) as usize].load(Ordering::Relaxed);
            if durable_offset == 0 && self.chunk_rd.file_no + 1 == cur {
                // The active file has no durable data yet: the durable
                // point is still inside the prior file.
                cur = self.chunk_rd.file_no;
                durable_offset =
                    sys.cur_durable_offset[(cur & 3) as usize].load(Ordering::Relaxed);
            }
            if self.chunk_rd.is_before_pos(cur, durable_offset) {
                break;
            }

            if pending_sync_lsn != 0 && inner.flushing_lsn == 0 {
                // Data exists that only needs the redo log synced; do the
                // sync ourselves unless another thread already is.
                inner.flushing_lsn = pending_sync_lsn;
                drop(inner);
                sys.redo.flush_up_to(pending_sync_lsn);
                inner = sys.pending.lock();
                inner.flushing_lsn = 0;
                pending_sync_lsn = 0;
                continue;
            }

            if killed.is_some_and(|k| k.load(Ordering::Relaxed)) {
                break;
            }
            match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        is_timeout = true;
                        break;
                    }
                    let (guard, res) = sys
                        .pending
                        .cond
                        .wait_timeout(inner, deadline - now)
                        .unwrap();
                    inner = guard;
                    if res.timed_out() {
                        is_timeout = true;
                        break;
                    }
                }
                None => {
                    inner = sys.pending.cond.wait(inner).unwrap();
                }
            }
        }
        drop(inner);
        // A pending redo sync we did not drive ourselves: wake one other
        // thread so the signal is not lost (wake-one avoids a wakeup storm).
        if pending_sync_lsn != 0 {
            sys.pending.cond.notify_one();
        }
        Ok(is_timeout)
    }

    /// Position the reader at the requested GTID position. Returns false
    /// when the position has been purged.
    pub fn init_gtid_pos(
        &mut self,
        pos: &SlaveConnectionState,
        out_state: &mut BinlogState,
    ) -> DbResult<bool> {
        let sys = self.chunk_rd.sys().clone();

        // Wait for at least the initial GTID state record to be durable, so
        // a valid position is never refused just because nothing has been
        // synced yet.
        let earliest = sys.purge.lock().unwrap().earliest_file_no;
        self.chunk_rd.seek(earliest, sys.page_size() as u64);
        if self.chunk_rd.mode == ReadMode::Durable {
            self.wait_available(None, None)?;
        }

        let mut search = GtidSearch::new(sys);
        let Some((file_no, offset, state)) = search.find_gtid_pos(pos)? else {
            return Ok(false);
        };
        *out_state = state;
        self.requested_file_no = file_no;
        self.chunk_rd.seek(file_no, offset);
        self.chunk_rd.skip_partial(true);
        Ok(true)
    }

    /// Position the reader at a legacy (filename, byte offset) position.
    pub fn init_legacy_pos(&mut self, filename: Option<&str>, offset: u64) -> DbResult<()> {
        let sys = self.chunk_rd.sys().clone();
        let file_no = match filename {
            None => sys.purge.lock().unwrap().earliest_file_no,
            Some(name) => crate::binlog0files::is_binlog_name(name)
                .ok_or_else(|| DbErr::corruption("unknown target binlog file name"))?,
        };
        if file_no > sys.active_file_no() {
            return Err(DbErr::corruption("could not find target log"));
        }
        let shift = sys.page_size_shift();
        if offset >= (u32::MAX as u64) << shift {
            return Err(DbErr::corruption("binlog position out of range"));
        }
        self.requested_file_no = file_no;
        let offset = offset.max(sys.page_size() as u64);

        // Start at the page holding the requested position and walk chunk
        // headers forward, so a position inside a chunk is rejected rather
        // than yielding garbage.
        let page_mask = (sys.page_size() as u64) - 1;
        self.chunk_rd.seek(file_no, offset & !page_mask);
        self.chunk_rd.find_offset_in_page((offset & page_mask) as u32)?;
        self.chunk_rd.release(true);
        self.chunk_rd.skip_partial(true);
        Ok(())
    }
}

/* GTID position search. */

/// Read one page of a binlog file, preferring the page fifo when the file
/// may still be partially unwritten.
pub fn read_binlog_page(
    sys: &BinlogSystem,
    file_no: u64,
    page_no: u32,
) -> DbResult<Option<Vec<u8>>> {
    loop {
        let active = sys.active_file_no();
        if file_no + 1 >= active {
            let page = sys.fifo.get_page(file_no, page_no);
            if sys.active_file_no() != active {
                continue;
            }
            if let Some(page) = page {
                return Ok(Some(page.frame().to_vec()));
            }
        }
        let path = binlog_name_make(&sys.cfg.directory, file_no);
        let mut file = match File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(DbErr::Io(e)),
        };
        return crate::binlog0files::crc32_pread_page(&mut file, page_no, sys.page_size())
            .map_err(DbErr::Io);
    }
}

pub struct GtidSearch {
    sys: Arc<BinlogSystem>,
}

impl GtidSearch {
    pub fn new(sys: Arc<BinlogSystem>) -> GtidSearch {
        GtidSearch { sys }
    }

    /// Read the GTID state record at `page_no` of `file_no` into `state`.
    /// Returns false when the page holds no state record.
    fn read_gtid_state(
        &self,
        state: &mut BinlogState,
        file_no: u64,
        page_no: u32,
    ) -> DbResult<Option<bool>> {
        let Some(page) = read_binlog_page(&self.sys, file_no, page_no)? else {
            return Ok(None);
        };
        Ok(Some(
            read_gtid_state_from_page(state, &page)?.is_some(),
        ))
    }

    /// Find a binlog position guaranteed to be at or before the target
    /// GTID position: walk file start states backwards, then binary-search
    /// the differential snapshots within the chosen file.
    /// Returns (file_no, offset, state at that point), or None if the
    /// position has been purged.
    pub fn find_gtid_pos(
        &mut self,
        pos: &SlaveConnectionState,
    ) -> DbResult<Option<(u64, u64, BinlogState)>> {
        let shift = self.sys.page_size_shift();
        let mut file_no = self.sys.active_file_no();

        // Search backwards for the first file whose start state is not
        // past the target.
        let mut base_state = BinlogState::new();
        let header;
        loop {
            base_state.reset();
            let Some(found) = self.read_gtid_state(&mut base_state, file_no, 1)? else {
                return Ok(None); /* Purged (or never existed). */
            };
            if !found {
                if file_no == 0 {
                    // A completely empty binlog: start from the beginning.
                    return Ok(Some((0, 0, BinlogState::new())));
                }
                return Err(DbErr::corruption(
                    "binlog file has no start state record",
                ));
            }
            if base_state.is_before_pos(pos) {
                let path = binlog_name_make(&self.sys.cfg.directory, file_no);
                header = crate::fsp0binlog::get_binlog_header(&path, self.sys.page_size())?;
                break;
            }
            if file_no == 0 {
                return Ok(None);
            }
            file_no -= 1;
        }

        // Binary search the differential snapshots for the last one still
        // before the target. page0 is always a valid answer; page2 is past.
        let interval = header
            .as_ref()
            .filter(|h| !h.is_empty && !h.is_invalid)
            .map(|h| h.diff_state_interval)
            .unwrap_or(0);
        if interval == 0 {
            return Ok(Some((file_no, (1u64) << shift, base_state)));
        }

        let file_size_pages = self.sys.fifo.size_in_pages(file_no) as u64;
        let file_pages = if file_size_pages != 0 {
            file_size_pages
        } else {
            header.as_ref().map(|h| h.page_count).unwrap_or(0)
        };
        let mut page0: u64 = 0;
        let mut page2 = file_pages.div_ceil(interval) * interval;
        let mut best_state = base_state.clone();
        while page2 - page0 > interval {
            let page1 = page0 + ((page2 - page0) / 2 / interval) * interval;
            if page1 == page0 {
                break;
            }
            let mut diff_state = BinlogState::new();
            match self.read_gtid_state(&mut diff_state, file_no, page1 as u32)? {
                None | Some(false) => {
                    // Snapshot missing here; try earlier, it is safe if not
                    // optimal.
                    page2 = page1;
                    continue;
                }
                Some(true) => {}
            }
            let mut candidate = base_state.clone();
            candidate.load(&diff_state);
            if candidate.is_before_pos(pos) {
                page0 = page1;
                best_state = candidate;
            } else {
                page2 = page1;
            }
        }

        let offset = if page0 == 0 {
            1u64 << shift
        } else {
            page0 << shift
        };
        Ok(Some((file_no, offset, best_state)))
    }
}
