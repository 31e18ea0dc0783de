//! Peer records stored in the routing table (`spec.md` §3).

use std::time::Instant;

use veilnet_crypto::NodeId;

/// A known peer's address and health. `last_seen` is a monotonic
/// `Instant`, not wall-clock time — the spec treats timestamps as
/// advisory and out of scope for regulatory metadata.
#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub node_id: NodeId,
    pub host: String,
    pub port: u16,
    pub last_seen: Instant,
    pub ping_rtt: Option<std::time::Duration>,
    pub reputation: f32,
    pub consecutive_fail: u32,
}

impl PeerRecord {
    pub fn new(node_id: NodeId, host: String, port: u16) -> Self {
        Self {
            node_id,
            host,
            port,
            last_seen: Instant::now(),
            ping_rtt: None,
            reputation: 1.0,
            consecutive_fail: 0,
        }
    }

    pub fn touch(&mut self) {
        self.last_seen = Instant::now();
        self.consecutive_fail = 0;
    }

    /// Three consecutive failures mark a peer inactive (`spec.md` §4.5).
    pub fn is_active(&self) -> bool {
        self.consecutive_fail < 3
    }

    pub fn record_failure(&mut self) {
        self.consecutive_fail = self.consecutive_fail.saturating_add(1);
        self.reputation = (self.reputation - 0.2).max(0.0);
    }

    pub fn record_success(&mut self, rtt: std::time::Duration) {
        self.ping_rtt = Some(rtt);
        self.touch();
        self.reputation = (self.reputation + 0.1).min(1.0);
    }
}
