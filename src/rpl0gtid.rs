//! Replication global transaction IDs and the binlog state: the last GTID
//! recorded for every distinct (domain id, server id) pair. Each point in
//! the binlog corresponds to one such state; seeking to a GTID position
//! means finding the latest point whose state is not yet past the position.

use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RplGtid {
    pub domain_id: u32,
    pub server_id: u32,
    pub seq_no: u64,
}

/// The per-slave requested starting position: one GTID per domain.
#[derive(Debug, Clone, Default)]
pub struct SlaveConnectionState {
    pos: BTreeMap<u32, RplGtid>,
}

impl SlaveConnectionState {
    pub fn new(gtids: impl IntoIterator<Item = RplGtid>) -> SlaveConnectionState {
        let mut pos = BTreeMap::new();
        for gtid in gtids {
            pos.insert(gtid.domain_id, gtid);
        }
        SlaveConnectionState { pos }
    }

    pub fn get(&self, domain_id: u32) -> Option<&RplGtid> {
        self.pos.get(&domain_id)
    }
}

/// A binlog state: mapping from (domain id, server id) to the most recent
/// seq_no. Deterministic iteration order (needed for stable on-disk
/// snapshots) comes from the BTreeMap.
#[derive(Debug, Clone, Default)]
pub struct BinlogState {
    hash: BTreeMap<(u32, u32), u64>,
}

impl BinlogState {
    pub fn new() -> BinlogState {
        BinlogState::default()
    }

    pub fn reset(&mut self) {
        self.hash.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.hash.is_empty()
    }

    pub fn count(&self) -> usize {
        self.hash.len()
    }

    /// Record `gtid` as the most recent one for its (domain, server).
    pub fn update(&mut self, gtid: &RplGtid) {
        self.hash
            .insert((gtid.domain_id, gtid.server_id), gtid.seq_no);
    }

    /// Merge another state on top of this one.
    pub fn load(&mut self, other: &BinlogState) {
        for ((domain_id, server_id), seq_no) in &other.hash {
            self.hash.insert((*domain_id, *server_id), *seq_no);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = RplGtid> + '_ {
        self.hash.iter().map(|((d, s), q)| RplGtid {
            domain_id: *d,
            server_id: *s,
            seq_no: *q,
        })
    }

    pub fn find(&self, domain_id: u32, server_id: u32) -> Option<u64> {
        self.hash.get(&(domain_id, server_id)).copied()
    }

    /// The largest seq_no recorded for a domain, over all servers.
    pub fn last_seq_no(&self, domain_id: u32) -> Option<u64> {
        self.hash
            .range((domain_id, 0)..=(domain_id, u32::MAX))
            .map(|(_, q)| *q)
            .max()
    }

    /// True when this state is at or before the requested position: every
    /// domain the state knows about must be known to the position with an
    /// equal or larger seq_no.
    pub fn is_before_pos(&self, pos: &SlaveConnectionState) -> bool {
        let mut domains: Vec<u32> = self.hash.keys().map(|(d, _)| *d).collect();
        domains.dedup();
        for domain_id in domains {
            let Some(want) = pos.get(domain_id) else {
                return false;
            };
            if self.last_seq_no(domain_id).unwrap_or(0) > want.seq_no {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod test {
    use super::{BinlogState, RplGtid, SlaveConnectionState};

    fn gtid(d: u32, s: u32, q: u64) -> RplGtid {
        RplGtid {
            domain_id: d,
            server_id: s,
            seq_no: q,
        }
    }

    #[test]
    fn test_update_and_find() {
        let mut state = BinlogState::new();
        state.update(&gtid(0, 1, 5));
        state.update(&gtid(0, 1, 9));
        state.update(&gtid(1, 2, 3));
        assert_eq!(state.count(), 2);
        assert_eq!(state.find(0, 1), Some(9));
        assert_eq!(state.last_seq_no(0), Some(9));
    }

    #[test]
    fn test_is_before_pos() {
        let mut state = BinlogState::new();
        state.update(&gtid(0, 1, 5));

        let pos = SlaveConnectionState::new([gtid(0, 1, 5)]);
        assert!(state.is_before_pos(&pos));

        let pos = SlaveConnectionState::new([gtid(0, 1, 4)]);
        assert!(!state.is_before_pos(&pos));

        // A domain unknown to the slave means the state is already too new.
        state.update(&gtid(7, 1, 1));
        let pos = SlaveConnectionState::new([gtid(0, 1, 100)]);
        assert!(!state.is_before_pos(&pos));
    }

    #[test]
    fn test_load_merges() {
        let mut base = BinlogState::new();
        base.update(&gtid(0, 1, 5));
        let mut diff = BinlogState::new();
        diff.update(&gtid(0, 1, 8));
        diff.update(&gtid(2, 3, 1));
        base.load(&diff);
        assert_eq!(base.find(0, 1), Some(8));
        assert_eq!(base.find(2, 3), Some(1));
    }
}
