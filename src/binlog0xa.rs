//! Registry of XA PREPAREd transactions recorded in the binlog. Each entry
//! pins a binlog file (via the file reference tracker) until the other
//! participating engines have durably completed and unlog() is called.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::binlog0files::FileHash;

/// An X/Open XA transaction identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Xid {
    pub format_id: u32,
    pub gtrid: Vec<u8>,
    pub bqual: Vec<u8>,
}

impl Xid {
    pub fn new(format_id: u32, gtrid: &[u8], bqual: &[u8]) -> Xid {
        assert!(gtrid.len() <= 64 && bqual.len() <= 64);
        Xid {
            format_id,
            gtrid: gtrid.to_vec(),
            bqual: bqual.to_vec(),
        }
    }

    /// The serialized hash key: formatID, lengths, then the two strings.
    pub fn key(&self) -> Vec<u8> {
        let mut key = Vec::with_capacity(6 + self.gtrid.len() + self.bqual.len());
        key.extend_from_slice(&self.format_id.to_le_bytes());
        key.push(self.gtrid.len() as u8);
        key.push(self.bqual.len() as u8);
        key.extend_from_slice(&self.gtrid);
        key.extend_from_slice(&self.bqual);
        key
    }
}

/// References held by one prepared XID.
#[derive(Debug, Clone)]
pub struct XidElem {
    pub xid: Xid,
    /// The file pinned while this XID is pending.
    pub refcnt_file_no: u64,
    pub oob_num_nodes: u64,
    pub oob_first_file_no: u64,
    pub oob_first_offset: u64,
    pub oob_last_file_no: u64,
    pub oob_last_offset: u64,
}

#[derive(Default)]
pub struct XidHash {
    hash: Mutex<HashMap<Vec<u8>, XidElem>>,
}

/// The OOB references of the transaction being prepared, if it wrote any.
#[derive(Debug, Clone, Copy, Default)]
pub struct XidOobRefs {
    pub num_nodes: u64,
    pub first_file_no: u64,
    pub first_offset: u64,
    pub last_file_no: u64,
    pub last_offset: u64,
}

impl XidHash {
    /// Register an XID at XA PREPARE, pinning the file holding its first
    /// OOB node (or, for an empty XA transaction, the active file so the
    /// prepare record itself stays available).
    pub fn add_xid(
        &self,
        xid: &Xid,
        oob: Option<XidOobRefs>,
        active_file_no: u64,
        file_hash: &FileHash,
    ) -> bool {
        let (refs, refcnt_file_no) = match oob {
            Some(refs) if refs.num_nodes > 0 => (refs, refs.first_file_no),
            _ => (XidOobRefs::default(), active_file_no),
        };
        let elem = XidElem {
            xid: xid.clone(),
            refcnt_file_no,
            oob_num_nodes: refs.num_nodes,
            oob_first_file_no: refs.first_file_no,
            oob_first_offset: refs.first_offset,
            oob_last_file_no: refs.last_file_no,
            oob_last_offset: refs.last_offset,
        };
        let mut hash = self.hash.lock().unwrap();
        if hash.insert(xid.key(), elem).is_some() {
            log::error!("duplicate XA PREPARE for the same XID");
            return false;
        }
        drop(hash);
        file_hash.oob_ref_inc(refcnt_file_no);
        // Published to new header pages so purge keeps honoring the pin
        // across restarts.
        file_hash.xa_ref_pin(refcnt_file_no);
        true
    }

    /// Look up an XID, remove its entry and return it (XA COMMIT/ROLLBACK).
    /// The caller drops the file reference via unlog.
    pub fn grab_xid(&self, xid: &Xid) -> Option<XidElem> {
        self.hash.lock().unwrap().remove(&xid.key())
    }

    /// Run a callback on a registered XID without removing it.
    pub fn run_on_xid<R>(&self, xid: &Xid, f: impl FnOnce(&XidElem) -> R) -> Option<R> {
        self.hash.lock().unwrap().get(&xid.key()).map(f)
    }

    pub fn is_empty(&self) -> bool {
        self.hash.lock().unwrap().is_empty()
    }

    /// The earliest file pinned by any pending XID.
    pub fn earliest_ref(&self) -> Option<u64> {
        self.hash
            .lock()
            .unwrap()
            .values()
            .map(|e| e.refcnt_file_no)
            .min()
    }
}

/// Drop the reference a completed XID held, after all engines are durable.
pub fn xid_unlog(hash: &XidHash, file_hash: &FileHash, xid: &Xid) {
    if let Some(elem) = hash.grab_xid(xid) {
        file_hash.oob_ref_dec(elem.refcnt_file_no);
        file_hash.xa_ref_reset(hash.earliest_ref());
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::Ordering;

    use super::{Xid, XidHash, XidOobRefs, xid_unlog};
    use crate::binlog0files::{FileHash, NO_FILE};

    #[test]
    fn test_add_grab() {
        let hash = XidHash::default();
        let files = FileHash::default();
        let xid = Xid::new(1, b"gtrid", b"bqual");

        assert!(hash.add_xid(
            &xid,
            Some(XidOobRefs {
                num_nodes: 3,
                first_file_no: 2,
                first_offset: 16384,
                last_file_no: 2,
                last_offset: 50000,
            }),
            5,
            &files,
        ));
        assert!(files.ref_in_use(2));
        assert!(!hash.is_empty());
        assert_eq!(hash.earliest_ref(), Some(2));
        // The pending-XA watermark published to header pages follows.
        assert_eq!(files.earliest_xa_ref.load(Ordering::Relaxed), 2);

        let elem = hash.grab_xid(&xid).unwrap();
        assert_eq!(elem.oob_num_nodes, 3);
        assert!(hash.grab_xid(&xid).is_none());
        // grab does not release the pin; unlog does.
        assert!(files.ref_in_use(2));
        files.oob_ref_dec(2);
    }

    #[test]
    fn test_empty_xa_pins_active_file() {
        let hash = XidHash::default();
        let files = FileHash::default();
        let xid = Xid::new(0, b"a", b"");
        hash.add_xid(&xid, None, 9, &files);
        assert!(files.ref_in_use(9));
        assert_eq!(files.earliest_xa_ref.load(Ordering::Relaxed), 9);
        xid_unlog(&hash, &files, &xid);
        assert!(!files.ref_in_use(9));
        assert_eq!(files.earliest_xa_ref.load(Ordering::Relaxed), NO_FILE);
    }

    #[test]
    fn test_watermark_tracks_earliest_pending_xid() {
        let hash = XidHash::default();
        let files = FileHash::default();
        let xid_a = Xid::new(0, b"a", b"");
        let xid_b = Xid::new(0, b"b", b"");
        hash.add_xid(&xid_a, None, 7, &files);
        hash.add_xid(&xid_b, None, 3, &files);
        assert_eq!(files.earliest_xa_ref.load(Ordering::Relaxed), 3);
        xid_unlog(&hash, &files, &xid_b);
        // The remaining XID still pins file 7.
        assert_eq!(files.earliest_xa_ref.load(Ordering::Relaxed), 7);
        xid_unlog(&hash, &files, &xid_a);
        assert_eq!(files.earliest_xa_ref.load(Ordering::Relaxed), NO_FILE);
    }
}
