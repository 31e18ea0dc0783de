//! Background peer health: periodically ping the least-recently-seen
//! peer in each non-empty bucket (`spec.md` §4.5).
//!
//! Grounded on the timer-driven background task pattern used throughout
//! the wire transport's connection lifecycle; generalized here to a
//! routing-table sweep rather than a single connection.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::table::{LivenessCheck, RoutingTable};

/// Sweep every bucket once, pinging its least-recently-seen entry and
/// recording the outcome.
pub async fn sweep_once<P: LivenessCheck>(table: &RoutingTable, liveness: &P) {
    for idx in 0..256 {
        let Some(peer) = table.least_recent_in(idx).await else { continue };
        let start = Instant::now();
        let alive = liveness.ping(&peer).await;
        let rtt = start.elapsed();
        table
            .update_peer(idx, &peer.node_id, |record| {
                if alive {
                    record.record_success(rtt);
                } else {
                    record.record_failure();
                }
            })
            .await;
    }
}

/// Spawn the periodic health-check task. Cancels cleanly when `cancel`
/// fires, per the "every spawned task must be awaited or explicitly
/// detached with an owner that outlives it" discipline.
pub fn spawn_health_task<P>(table: Arc<RoutingTable>, liveness: Arc<P>, interval: Duration, cancel: CancellationToken) -> tokio::task::JoinHandle<()>
where
    P: LivenessCheck + Send + Sync + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => sweep_once(&table, liveness.as_ref()).await,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::PeerRecord;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingPinger {
        calls: AtomicUsize,
        alive: bool,
    }

    impl LivenessCheck for CountingPinger {
        async fn ping(&self, _peer: &PeerRecord) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.alive
        }
    }

    struct AlwaysAlive;
    impl LivenessCheck for AlwaysAlive {
        async fn ping(&self, _peer: &PeerRecord) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn sweep_pings_every_non_empty_bucket_once() {
        let table = RoutingTable::new([0u8; 32]);
        table.observe(PeerRecord::new([1u8; 32], "h".into(), 1), &AlwaysAlive).await;
        table.observe(PeerRecord::new([2u8; 32], "h".into(), 1), &AlwaysAlive).await;

        let pinger = CountingPinger { calls: AtomicUsize::new(0), alive: true };
        sweep_once(&table, &pinger).await;
        assert_eq!(pinger.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failed_ping_degrades_reputation() {
        let table = RoutingTable::new([0u8; 32]);
        table.observe(PeerRecord::new([1u8; 32], "h".into(), 1), &AlwaysAlive).await;
        let pinger = CountingPinger { calls: AtomicUsize::new(0), alive: false };

        sweep_once(&table, &pinger).await;
        sweep_once(&table, &pinger).await;
        sweep_once(&table, &pinger).await;

        let peer = table.find_closest(&[1u8; 32], 1).await;
        assert_eq!(peer[0].consecutive_fail, 3);
        assert!(!peer[0].is_active());
    }
}
