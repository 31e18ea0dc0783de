//! A single k-bucket: up to `K` peers at a given XOR-distance bit
//! position, ordered by recency (`spec.md` §3, §4.5).

use std::collections::VecDeque;

use veilnet_crypto::NodeId;

use crate::record::PeerRecord;

/// Bucket capacity (`spec.md` §4.5: "Bucket capacity k = 20").
pub const K: usize = 20;

/// Ordered oldest (front) to most-recently-seen (back).
#[derive(Debug, Default)]
pub struct Bucket {
    entries: VecDeque<PeerRecord>,
}

/// What the caller must do after observing a peer, decided synchronously
/// by the bucket. `PingThenRetry` requires an async liveness check the
/// bucket itself cannot perform (`spec.md` §5: "must not hold the write
/// lease across the PING RPC; release, PING, re-acquire").
pub enum Observation {
    /// The peer was already present, or there was free capacity; no
    /// further action needed.
    Settled,
    /// The bucket is full of other peers; ping `candidate_for_eviction`
    /// before deciding whether to admit the new peer.
    PingThenRetry { candidate_for_eviction: NodeId },
}

impl Bucket {
    pub fn new() -> Self {
        Self { entries: VecDeque::new() }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, node_id: &NodeId) -> bool {
        self.entries.iter().any(|e| &e.node_id == node_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerRecord> {
        self.entries.iter()
    }

    pub fn remove(&mut self, node_id: &NodeId) -> Option<PeerRecord> {
        let idx = self.entries.iter().position(|e| &e.node_id == node_id)?;
        self.entries.remove(idx)
    }

    pub fn least_recent(&self) -> Option<&PeerRecord> {
        self.entries.front()
    }

    /// Observe a peer. Moves an existing entry to the most-recent slot;
    /// otherwise appends if there's room; otherwise asks the caller to
    /// ping the least-recently-seen entry before retrying.
    pub fn observe(&mut self, record: PeerRecord) -> Observation {
        if let Some(mut existing) = self.remove(&record.node_id) {
            existing.touch();
            existing.host = record.host;
            existing.port = record.port;
            self.entries.push_back(existing);
            return Observation::Settled;
        }

        if self.entries.len() < K {
            self.entries.push_back(record);
            return Observation::Settled;
        }

        Observation::PingThenRetry {
            candidate_for_eviction: self.entries.front().expect("bucket is at capacity, so non-empty").node_id,
        }
    }

    /// Called after a failed liveness check on `candidate`: evict it and
    /// admit `record` in its place. A no-op if `candidate` is no longer
    /// the least-recent entry (lost the race with another observation).
    pub fn evict_and_insert(&mut self, candidate: &NodeId, record: PeerRecord) {
        if self.entries.front().map(|e| &e.node_id) == Some(candidate) {
            self.entries.pop_front();
        }
        if self.entries.len() < K {
            self.entries.push_back(record);
        }
    }

    /// Apply `f` to the entry for `node_id`, if present. Used to record
    /// ping outcomes without disturbing recency ordering.
    pub fn update<F: FnOnce(&mut PeerRecord)>(&mut self, node_id: &NodeId, f: F) -> bool {
        match self.entries.iter_mut().find(|e| &e.node_id == node_id) {
            Some(entry) => {
                f(entry);
                true
            }
            None => false,
        }
    }

    /// Called after a successful liveness check on `candidate`: the
    /// incumbent survives, so the new peer is dropped. Still refresh the
    /// incumbent's recency since it just answered a PING.
    pub fn keep_incumbent(&mut self, candidate: &NodeId) {
        if let Some(mut existing) = self.remove(candidate) {
            existing.touch();
            self.entries.push_back(existing);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(byte: u8) -> PeerRecord {
        PeerRecord::new([byte; 32], "127.0.0.1".to_string(), 9000)
    }

    #[test]
    fn fresh_bucket_accepts_up_to_k_peers() {
        let mut bucket = Bucket::new();
        for i in 0..K as u8 {
            assert!(matches!(bucket.observe(rec(i)), Observation::Settled));
        }
        assert_eq!(bucket.len(), K);
    }

    #[test]
    fn full_bucket_requests_a_ping_before_admitting_a_new_peer() {
        let mut bucket = Bucket::new();
        for i in 0..K as u8 {
            bucket.observe(rec(i));
        }
        let oldest = bucket.least_recent().unwrap().node_id;
        match bucket.observe(rec(200)) {
            Observation::PingThenRetry { candidate_for_eviction } => {
                assert_eq!(candidate_for_eviction, oldest);
            }
            Observation::Settled => panic!("expected a ping request"),
        }
        assert_eq!(bucket.len(), K, "no admission until liveness check resolves");
    }

    #[test]
    fn failed_liveness_check_evicts_the_incumbent() {
        let mut bucket = Bucket::new();
        for i in 0..K as u8 {
            bucket.observe(rec(i));
        }
        let oldest = bucket.least_recent().unwrap().node_id;
        bucket.evict_and_insert(&oldest, rec(200));
        assert_eq!(bucket.len(), K);
        assert!(!bucket.contains(&oldest));
        assert!(bucket.contains(&[200u8; 32]));
    }

    #[test]
    fn successful_liveness_check_keeps_the_incumbent() {
        let mut bucket = Bucket::new();
        for i in 0..K as u8 {
            bucket.observe(rec(i));
        }
        let oldest = bucket.least_recent().unwrap().node_id;
        bucket.keep_incumbent(&oldest);
        assert_eq!(bucket.len(), K);
        assert!(bucket.contains(&oldest));
        assert_eq!(bucket.least_recent().unwrap().node_id, [1u8; 32], "evicted candidate moved to most-recent, next oldest takes its place");
    }

    #[test]
    fn observing_an_existing_peer_moves_it_to_most_recent() {
        let mut bucket = Bucket::new();
        bucket.observe(rec(1));
        bucket.observe(rec(2));
        bucket.observe(rec(1));
        assert_eq!(bucket.least_recent().unwrap().node_id, [2u8; 32]);
    }
}
