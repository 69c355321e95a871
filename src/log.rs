//! The redo-log collaborator: an append-only stream of mini-transaction
//! record groups. LSNs are byte positions in the serialized stream; the
//! durability frontier is `get_flushed_lsn()`.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::Lsn;
use crate::compr0int::compr_int_write;

/// Start of record payload (0x3000).
pub const START_OFFSET: Lsn = 12288;

/// Smallest possible log sequence number in the current format.
pub const FIRST_LSN: Lsn = START_OFFSET;

/// MTR termination marker.
pub const MTR_END_MARKER: u8 = 1u8;

/// Maximum guaranteed size of a mini-transaction.
pub const MTR_SIZE_MAX: u32 = 1u32 << 20;

/// Redo record types. The encoding on the wire is the opcode byte followed
/// by varint space id, page number and operation fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedoRec {
    /// Zero-initialize a page.
    InitPage { space_id: u32, page_no: u32 },
    /// Free a page; on recovery it is unnecessary to read the page.
    FreePage { space_id: u32, page_no: u32 },
    /// Write a string of bytes at a byte offset within the page.
    Write {
        space_id: u32,
        page_no: u32,
        offset: u16,
        data: Vec<u8>,
    },
    /// Repeatedly write one byte over a byte range within the page.
    Memset {
        space_id: u32,
        page_no: u32,
        offset: u16,
        len: u16,
        val: u8,
    },
}

/* Opcode bytes, high nibble; low nibble reserved for short lengths. */
const MREC_FREE_PAGE: u8 = 0x00;
const MREC_INIT_PAGE: u8 = 0x10;
const MREC_WRITE: u8 = 0x30;
const MREC_MEMSET: u8 = 0x40;

impl RedoRec {
    pub fn space_id(&self) -> u32 {
        match self {
            RedoRec::InitPage { space_id, .. }
            | RedoRec::FreePage { space_id, .. }
            | RedoRec::Write { space_id, .. }
            | RedoRec::Memset { space_id, .. } => *space_id,
        }
    }

    pub fn page_no(&self) -> u32 {
        match self {
            RedoRec::InitPage { page_no, .. }
            | RedoRec::FreePage { page_no, .. }
            | RedoRec::Write { page_no, .. }
            | RedoRec::Memset { page_no, .. } => *page_no,
        }
    }

    fn serialize(&self, out: &mut Vec<u8>) {
        match self {
            RedoRec::FreePage { space_id, page_no } => {
                out.push(MREC_FREE_PAGE);
                compr_int_write(out, *space_id as u64);
                compr_int_write(out, *page_no as u64);
            }
            RedoRec::InitPage { space_id, page_no } => {
                out.push(MREC_INIT_PAGE);
                compr_int_write(out, *space_id as u64);
                compr_int_write(out, *page_no as u64);
            }
            RedoRec::Write {
                space_id,
                page_no,
                offset,
                data,
            } => {
                out.push(MREC_WRITE);
                compr_int_write(out, *space_id as u64);
                compr_int_write(out, *page_no as u64);
                compr_int_write(out, *offset as u64);
                compr_int_write(out, data.len() as u64);
                out.extend_from_slice(data);
            }
            RedoRec::Memset {
                space_id,
                page_no,
                offset,
                len,
                val,
            } => {
                out.push(MREC_MEMSET);
                compr_int_write(out, *space_id as u64);
                compr_int_write(out, *page_no as u64);
                compr_int_write(out, *offset as u64);
                compr_int_write(out, *len as u64);
                out.push(*val);
            }
        }
    }
}

/// One committed mini-transaction: the records plus the LSN range the
/// serialized group occupies in the stream.
#[derive(Debug, Clone)]
pub struct RedoGroup {
    pub start_lsn: Lsn,
    pub end_lsn: Lsn,
    pub recs: Vec<RedoRec>,
}

struct RedoInner {
    groups: Vec<RedoGroup>,
    cur_lsn: Lsn,
}

/// The global redo stream. `append_group` assigns the commit LSN; groups are
/// retained in memory so that recovery can replay them.
pub struct Redo {
    inner: Mutex<RedoInner>,
    flushed_lsn: AtomicU64,
}

impl Default for Redo {
    fn default() -> Self {
        Redo::new()
    }
}

impl Redo {
    pub fn new() -> Redo {
        Redo {
            inner: Mutex::new(RedoInner {
                groups: Vec::new(),
                cur_lsn: FIRST_LSN,
            }),
            flushed_lsn: AtomicU64::new(FIRST_LSN),
        }
    }

    /// Atomically append one mini-transaction group to the stream.
    /// Returns (start_lsn, end_lsn); end_lsn is the commit LSN.
    pub fn append_group(&self, recs: Vec<RedoRec>) -> (Lsn, Lsn) {
        let mut buf = Vec::new();
        for rec in &recs {
            rec.serialize(&mut buf);
        }
        buf.push(MTR_END_MARKER);
        let crc = crc32c::crc32c(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());

        let mut inner = self.inner.lock().unwrap();
        let start_lsn = inner.cur_lsn;
        let end_lsn = start_lsn + buf.len() as Lsn;
        inner.cur_lsn = end_lsn;
        inner.groups.push(RedoGroup {
            start_lsn,
            end_lsn,
            recs,
        });
        (start_lsn, end_lsn)
    }

    pub fn get_lsn(&self) -> Lsn {
        self.inner.lock().unwrap().cur_lsn
    }

    pub fn get_flushed_lsn(&self) -> Lsn {
        self.flushed_lsn.load(Ordering::Acquire)
    }

    /// Make the redo stream durable up to at least `lsn`.
    pub fn flush_up_to(&self, lsn: Lsn) {
        let cur = self.get_lsn();
        let target = lsn.min(cur);
        self.flushed_lsn.fetch_max(target, Ordering::AcqRel);
    }

    pub fn flush_all(&self) {
        let cur = self.get_lsn();
        self.flushed_lsn.fetch_max(cur, Ordering::AcqRel);
    }

    /// Snapshot of groups whose end LSN is at most `lsn`. This is what a
    /// crash at durability point `lsn` leaves behind for recovery.
    pub fn groups_up_to(&self, lsn: Lsn) -> Vec<RedoGroup> {
        self.inner
            .lock()
            .unwrap()
            .groups
            .iter()
            .filter(|g| g.end_lsn <= lsn)
            .cloned()
            .collect()
    }

    /// All groups, in commit order.
    pub fn groups(&self) -> Vec<RedoGroup> {
        self.inner.lock().unwrap().groups.clone()
    }
}

#[cfg(test)]
mod test {
    use super::{FIRST_LSN, Redo, RedoRec};

    #[test]
    fn test_lsn_advance_and_flush() {
        let redo = Redo::new();
        assert_eq!(redo.get_lsn(), FIRST_LSN);
        let (start, end) = redo.append_group(vec![RedoRec::Write {
            space_id: 0,
            page_no: 1,
            offset: 38,
            data: vec![1, 2, 3],
        }]);
        assert_eq!(start, FIRST_LSN);
        assert!(end > start);
        assert_eq!(redo.get_flushed_lsn(), FIRST_LSN);
        redo.flush_up_to(end);
        assert_eq!(redo.get_flushed_lsn(), end);
        // Flushing past the current end clamps.
        redo.flush_up_to(end + 1000);
        assert_eq!(redo.get_flushed_lsn(), end);
    }

    #[test]
    fn test_groups_up_to() {
        let redo = Redo::new();
        let (_, end1) = redo.append_group(vec![RedoRec::InitPage {
            space_id: 0,
            page_no: 0,
        }]);
        let (_, end2) = redo.append_group(vec![RedoRec::InitPage {
            space_id: 0,
            page_no: 1,
        }]);
        assert_eq!(redo.groups_up_to(end1).len(), 1);
        assert_eq!(redo.groups_up_to(end2).len(), 2);
        assert_eq!(redo.groups_up_to(end1 - 1).len(), 0);
    }
}
