//! The pending-LSN fifo: maps "this binlog position was committed at redo
//! LSN L" to "the binlog is durable up to this file offset" once the redo
//! log has been flushed past L.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};

use crate::Lsn;
use crate::binlog0files::NO_FILE;

/// log2 of the fifo capacity; a power of two so head/tail arithmetic can
/// wrap freely.
const FIFO_SIZE_LOG2: u32 = 9;
const FIFO_SIZE: usize = 1 << FIFO_SIZE_LOG2;

#[derive(Debug, Clone, Copy, Default)]
pub struct PendingEntry {
    pub lsn: Lsn,
    pub file_no: u64,
    pub offset: u64,
}

pub struct PendingInner {
    entries: Box<[PendingEntry; FIFO_SIZE]>,
    /// Next insertion point; entries live in [tail, head).
    head: u64,
    tail: u64,
    last_lsn_added: Lsn,
    /// The file the durable point currently lies in.
    cur_file_no: u64,
    /// Non-zero while one thread is driving a redo flush up to this LSN;
    /// other waiters block instead of also flushing.
    pub flushing_lsn: Lsn,
}

impl PendingInner {
    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    fn is_full(&self) -> bool {
        self.head - self.tail >= FIFO_SIZE as u64
    }

    pub fn cur_head(&self) -> PendingEntry {
        debug_assert!(!self.is_empty());
        self.entries[(self.head - 1) as usize % FIFO_SIZE]
    }

    fn cur_tail(&self) -> PendingEntry {
        debug_assert!(!self.is_empty());
        self.entries[self.tail as usize % FIFO_SIZE]
    }
}

/// The fifo plus the condition variable binlog readers wait on for
/// durability progress.
pub struct PendingLsnFifo {
    inner: Mutex<PendingInner>,
    pub cond: Condvar,
}

impl Default for PendingLsnFifo {
    fn default() -> Self {
        PendingLsnFifo {
            inner: Mutex::new(PendingInner {
                entries: Box::new([PendingEntry::default(); FIFO_SIZE]),
                head: 0,
                tail: 0,
                last_lsn_added: 0,
                cur_file_no: NO_FILE,
                flushing_lsn: 0,
            }),
            cond: Condvar::new(),
        }
    }
}

impl PendingLsnFifo {
    pub fn lock(&self) -> MutexGuard<'_, PendingInner> {
        self.inner.lock().unwrap()
    }

    pub fn init(&self, start_file_no: u64) {
        let mut inner = self.lock();
        inner.cur_file_no = start_file_no;
        inner.head = 0;
        inner.tail = 0;
        inner.last_lsn_added = 0;
    }

    pub fn reset(&self) {
        self.lock().cur_file_no = NO_FILE;
    }

    /// Insert a committed binlog position. Out-of-order inserts (commits
    /// racing to record) are filtered by LSN monotonicity. When the fifo is
    /// full the head entry is overwritten; a later flush subsumes older
    /// ones.
    pub fn add_to_fifo(
        &self,
        lsn: Lsn,
        file_no: u64,
        offset: u64,
        flushed_lsn: Lsn,
        active_file_no: u64,
        durable_offset: &[AtomicU64; 4],
        end_offset: &[AtomicU64; 4],
    ) {
        let mut inner = self.lock();
        if lsn <= inner.last_lsn_added {
            return;
        }
        if !inner.is_full() {
            inner.head += 1;
        }
        let head = inner.head;
        inner.entries[(head - 1) as usize % FIFO_SIZE] = PendingEntry {
            lsn,
            file_no,
            offset,
        };
        inner.last_lsn_added = lsn;
        // An immediate check in case the LSN is already durable.
        let signalled = self.process_durable_lsn_locked(
            &mut inner,
            flushed_lsn,
            active_file_no,
            durable_offset,
            end_offset,
        );
        if !signalled && inner.flushing_lsn == 0 {
            // Nothing became durable, but a new entry exists: wake one
            // waiter to drive a redo flush, unless one is already flushing.
            self.cond.notify_one();
        }
    }

    /// Pop everything durable at `flushed_lsn`, advancing the per-slot
    /// durable offsets. Returns true when a broadcast was sent.
    pub fn process_durable_lsn(
        &self,
        flushed_lsn: Lsn,
        active_file_no: u64,
        durable_offset: &[AtomicU64; 4],
        end_offset: &[AtomicU64; 4],
    ) -> bool {
        let mut inner = self.lock();
        self.process_durable_lsn_locked(
            &mut inner,
            flushed_lsn,
            active_file_no,
            durable_offset,
            end_offset,
        )
    }

    pub fn process_durable_lsn_locked(
        &self,
        inner: &mut PendingInner,
        flushed_lsn: Lsn,
        active_file_no: u64,
        durable_offset: &[AtomicU64; 4],
        end_offset: &[AtomicU64; 4],
    ) -> bool {
        debug_assert!(inner.cur_file_no != NO_FILE);
        let mut got: Option<PendingEntry> = None;
        while !inner.is_empty() {
            let e = inner.cur_tail();
            if flushed_lsn < e.lsn {
                break;
            }
            got = Some(e);
            inner.tail += 1;
        }
        let Some(got) = got else {
            return false;
        };

        if got.file_no + 1 >= active_file_no || active_file_no == NO_FILE {
            // The durable offset per slot only ever moves forward.
            let slot = (got.file_no & 3) as usize;
            let prev = durable_offset[slot].load(Ordering::Relaxed);
            if prev == NO_FILE || prev <= got.offset {
                durable_offset[slot].store(got.offset, Ordering::Release);
            }
        }
        // Crossing into the next file makes the prior file fully durable;
        // files are made durable before their next-but-one is allocated, so
        // the point moves one file at a time.
        while inner.cur_file_no < got.file_no {
            let slot = (inner.cur_file_no & 3) as usize;
            let end = end_offset[slot].load(Ordering::Relaxed);
            durable_offset[slot].store(end, Ordering::Release);
            inner.cur_file_no += 1;
        }
        self.cond.notify_all();
        true
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicU64, Ordering};

    use super::PendingLsnFifo;

    fn slots() -> ([AtomicU64; 4], [AtomicU64; 4]) {
        (
            [const { AtomicU64::new(0) }; 4],
            [const { AtomicU64::new(0) }; 4],
        )
    }

    #[test]
    fn test_durable_offset_advances() {
        let fifo = PendingLsnFifo::default();
        fifo.init(0);
        let (durable, end) = slots();
        end[0].store(1000, Ordering::Relaxed);

        fifo.add_to_fifo(100, 0, 500, 0, 0, &durable, &end);
        assert_eq!(durable[0].load(Ordering::Relaxed), 0);

        // Redo flushed past the commit: the offset becomes durable.
        fifo.process_durable_lsn(150, 0, &durable, &end);
        assert_eq!(durable[0].load(Ordering::Relaxed), 500);

        // Reprocessing the same durable LSN changes nothing.
        fifo.process_durable_lsn(150, 0, &durable, &end);
        assert_eq!(durable[0].load(Ordering::Relaxed), 500);
        assert!(fifo.lock().is_empty());
    }

    #[test]
    fn test_out_of_order_insert_filtered() {
        let fifo = PendingLsnFifo::default();
        fifo.init(0);
        let (durable, end) = slots();

        fifo.add_to_fifo(200, 0, 800, 0, 0, &durable, &end);
        fifo.add_to_fifo(100, 0, 400, 0, 0, &durable, &end);
        fifo.process_durable_lsn(300, 0, &durable, &end);
        assert_eq!(durable[0].load(Ordering::Relaxed), 800);
    }

    #[test]
    fn test_file_change_snapshots_prior_end() {
        let fifo = PendingLsnFifo::default();
        fifo.init(0);
        let (durable, end) = slots();
        end[0].store(4096, Ordering::Relaxed);

        fifo.add_to_fifo(10, 0, 2000, 0, 0, &durable, &end);
        fifo.process_durable_lsn(50, 0, &durable, &end);
        assert_eq!(durable[0].load(Ordering::Relaxed), 2000);

        // The next commit lands in file 1: file 0 snaps to its end offset.
        fifo.add_to_fifo(60, 1, 128, 0, 1, &durable, &end);
        fifo.process_durable_lsn(100, 1, &durable, &end);
        assert_eq!(durable[0].load(Ordering::Relaxed), 4096);
        assert_eq!(durable[1].load(Ordering::Relaxed), 128);
    }
}
