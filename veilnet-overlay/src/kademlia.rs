//! Iterative `FIND_NODE` lookup (`spec.md` §4.5).

use std::collections::HashSet;

use veilnet_crypto::NodeId;

use crate::error::OverlayError;
use crate::node_id::xor_distance;
use crate::record::PeerRecord;
use crate::table::RoutingTable;

/// Number of peers queried in parallel per round.
pub const ALPHA: usize = 3;

/// Issues `FIND_NODE` RPCs to peers. Implemented by the `Node`
/// orchestrator, which owns the actual wire connections; this crate only
/// knows the iterative shortlist algorithm.
pub trait FindNodeRpc {
    async fn find_node(&self, peer: &PeerRecord, target: NodeId) -> Result<Vec<PeerRecord>, OverlayError>;
}

/// Run the iterative lookup for `target`, returning up to `k` peers
/// closest to it. Terminates when a round yields no closer node than the
/// previous round, or every candidate in the current shortlist has been
/// queried.
pub async fn iterative_find_node<R: FindNodeRpc>(table: &RoutingTable, target: NodeId, rpc: &R, k: usize) -> Vec<PeerRecord> {
    let mut shortlist = table.find_closest(&target, k).await;
    let mut queried: HashSet<NodeId> = HashSet::new();

    loop {
        let candidates: Vec<PeerRecord> =
            shortlist.iter().filter(|p| !queried.contains(&p.node_id)).take(ALPHA).cloned().collect();
        if candidates.is_empty() {
            break;
        }

        let closest_before = shortlist.first().map(|p| xor_distance(&target, &p.node_id));

        let mut discovered = Vec::new();
        for candidate in &candidates {
            queried.insert(candidate.node_id);
            match rpc.find_node(candidate, target).await {
                Ok(peers) => discovered.extend(peers),
                Err(e) => tracing::debug!(error = %e, peer = ?candidate.node_id, "find_node RPC failed"),
            }
        }

        for peer in discovered {
            if !shortlist.iter().any(|p| p.node_id == peer.node_id) {
                shortlist.push(peer);
            }
        }
        shortlist.sort_by_key(|p| xor_distance(&target, &p.node_id));
        shortlist.truncate(k);

        let closest_after = shortlist.first().map(|p| xor_distance(&target, &p.node_id));
        let made_progress = closest_after != closest_before;
        let all_queried = shortlist.iter().all(|p| queried.contains(&p.node_id));

        if all_queried || !made_progress {
            break;
        }
    }

    shortlist
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// An in-memory network: every node knows a fixed set of peers and
    /// answers FIND_NODE by returning its k closest to the target.
    struct FakeNetwork {
        peers_of: HashMap<NodeId, Vec<PeerRecord>>,
        call_count: Mutex<usize>,
    }

    impl FindNodeRpc for FakeNetwork {
        async fn find_node(&self, peer: &PeerRecord, target: NodeId) -> Result<Vec<PeerRecord>, OverlayError> {
            *self.call_count.lock().unwrap() += 1;
            let mut known = self.peers_of.get(&peer.node_id).cloned().unwrap_or_default();
            known.sort_by_key(|p| xor_distance(&target, &p.node_id));
            known.truncate(20);
            Ok(known)
        }
    }

    fn rec(byte: u8) -> PeerRecord {
        PeerRecord::new([byte; 32], "127.0.0.1".into(), 9000)
    }

    struct AlwaysAlive;
    impl crate::table::LivenessCheck for AlwaysAlive {
        async fn ping(&self, _peer: &PeerRecord) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn lookup_discovers_peers_multiple_hops_away() {
        let local = [0u8; 32];
        let table = RoutingTable::new(local);
        table.observe(rec(1), &AlwaysAlive).await;

        let mut peers_of = HashMap::new();
        peers_of.insert([1u8; 32], vec![rec(2)]);
        peers_of.insert([2u8; 32], vec![rec(3)]);
        peers_of.insert([3u8; 32], vec![]);
        let net = FakeNetwork { peers_of, call_count: Mutex::new(0) };

        let target = [3u8; 32];
        let result = iterative_find_node(&table, target, &net, 20).await;

        assert!(result.iter().any(|p| p.node_id == [3u8; 32]), "lookup should have chained through peer 1 -> 2 -> 3");
    }

    #[tokio::test]
    async fn lookup_terminates_with_no_known_peers() {
        let table = RoutingTable::new([0u8; 32]);
        let net = FakeNetwork { peers_of: HashMap::new(), call_count: Mutex::new(0) };
        let result = iterative_find_node(&table, [9u8; 32], &net, 20).await;
        assert!(result.is_empty());
    }
}
