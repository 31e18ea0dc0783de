//! The full 256-bucket routing table (`spec.md` §3, §4.5), reader-writer
//! locked per bucket so lookups and insertions into different buckets
//! never contend.

use tokio::sync::RwLock;

use veilnet_crypto::NodeId;

use crate::bucket::{Bucket, Observation};
use crate::node_id::{bucket_index, xor_distance};
use crate::record::PeerRecord;

/// Performs the liveness check a bucket needs before evicting its
/// least-recently-seen entry. Implemented by the caller (the `Node`
/// orchestrator), which has access to the wire transport; the overlay
/// crate itself knows nothing about sockets.
pub trait LivenessCheck {
    async fn ping(&self, peer: &PeerRecord) -> bool;
}

/// 256 XOR-distance buckets, one per bit position, each independently
/// lockable (`spec.md` §5: "reader-writer discipline... insertions take
/// a write lease on the single affected bucket").
pub struct RoutingTable {
    local_id: NodeId,
    buckets: Vec<RwLock<Bucket>>,
}

impl RoutingTable {
    pub fn new(local_id: NodeId) -> Self {
        let buckets = (0..256).map(|_| RwLock::new(Bucket::new())).collect();
        Self { local_id, buckets }
    }

    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    /// Record an observed peer (from a HELLO, a PING reply, or a peer
    /// piggybacked in any RPC), following the insertion policy in
    /// `spec.md` §4.5. A peer equal to the local id is ignored.
    pub async fn observe<P: LivenessCheck>(&self, record: PeerRecord, liveness: &P) {
        let Some(idx) = bucket_index(&self.local_id, &record.node_id) else {
            return;
        };

        let outcome = {
            let mut bucket = self.buckets[idx].write().await;
            bucket.observe(record.clone())
        };

        // The write lease is released before the PING RPC so other
        // insertions into this bucket are not blocked on network I/O.
        if let Observation::PingThenRetry { candidate_for_eviction } = outcome {
            let candidate = {
                let bucket = self.buckets[idx].read().await;
                bucket.iter().find(|e| e.node_id == candidate_for_eviction).cloned()
            };
            let alive = match candidate {
                Some(c) => liveness.ping(&c).await,
                None => false,
            };

            let mut bucket = self.buckets[idx].write().await;
            if alive {
                bucket.keep_incumbent(&candidate_for_eviction);
            } else {
                bucket.evict_and_insert(&candidate_for_eviction, record);
            }
        }
    }

    /// The `count` peers closest to `target` across every bucket.
    pub async fn find_closest(&self, target: &NodeId, count: usize) -> Vec<PeerRecord> {
        let mut all = Vec::new();
        for bucket in &self.buckets {
            all.extend(bucket.read().await.iter().cloned());
        }
        all.sort_by_key(|r| xor_distance(target, &r.node_id));
        all.truncate(count);
        all
    }

    pub async fn bucket_len(&self, idx: usize) -> usize {
        self.buckets[idx].read().await.len()
    }

    /// The least-recently-seen peer in bucket `idx`, if any.
    pub async fn least_recent_in(&self, idx: usize) -> Option<PeerRecord> {
        self.buckets[idx].read().await.least_recent().cloned()
    }

    /// Apply `f` to the record for `node_id` in bucket `idx`, if present.
    pub async fn update_peer(&self, idx: usize, node_id: &NodeId, f: impl FnOnce(&mut PeerRecord)) -> bool {
        self.buckets[idx].write().await.update(node_id, f)
    }

    /// Total peers across every bucket. Always `≤ k × 256` since each
    /// bucket independently enforces its own `K` cap.
    pub async fn len(&self) -> usize {
        let mut total = 0;
        for bucket in &self.buckets {
            total += bucket.read().await.len();
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AlwaysAlive;
    impl LivenessCheck for AlwaysAlive {
        async fn ping(&self, _peer: &PeerRecord) -> bool {
            true
        }
    }

    fn rec(byte: u8) -> PeerRecord {
        PeerRecord::new([byte; 32], "127.0.0.1".to_string(), 9000)
    }

    #[tokio::test]
    async fn peer_lands_in_exactly_the_bucket_its_highest_differing_bit_names() {
        let local = [0u8; 32];
        let table = RoutingTable::new(local);
        let mut peer_id = [0u8; 32];
        peer_id[0] = 0b0000_0100; // highest set bit at position 5
        table.observe(PeerRecord::new(peer_id, "h".into(), 1), &AlwaysAlive).await;

        assert_eq!(table.bucket_len(5).await, 1);
        assert_eq!(table.bucket_len(4).await, 0);
        assert_eq!(table.bucket_len(6).await, 0);
    }

    #[tokio::test]
    async fn find_closest_orders_by_xor_distance() {
        let table = RoutingTable::new([0u8; 32]);
        for i in 1..10u8 {
            table.observe(rec(i), &AlwaysAlive).await;
        }
        let target = [3u8; 32];
        let closest = table.find_closest(&target, 3).await;
        assert_eq!(closest.len(), 3);
        assert_eq!(closest[0].node_id, [3u8; 32]);
    }

    #[tokio::test]
    async fn total_size_never_exceeds_k_times_256() {
        let table = RoutingTable::new([0u8; 32]);
        for i in 0..40u8 {
            table.observe(rec(i), &AlwaysAlive).await;
        }
        assert!(table.len().await <= crate::bucket::K * 256);
    }
}
