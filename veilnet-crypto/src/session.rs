//! Session Registry: the explicit, `Node`-owned collection of Double
//! Ratchet sessions, one per peer. Replaces any notion of global mutable
//! ratchet state with a value the caller threads through explicitly, per
//! `spec.md` §9's "no implicit global state" redesign.
//!
//! Also the enforcement point for `MAX_SKIP_TOTAL`: every session handed
//! out by the registry shares one `AtomicI64` skip budget.

use std::collections::HashMap;
use std::sync::atomic::AtomicI64;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::identity::NodeId;
use crate::ratchet::{Session, MAX_SKIP_TOTAL};

/// All live sessions this node holds with its peers.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<NodeId, Session>>,
    skip_budget: Arc<AtomicI64>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            skip_budget: Arc::new(AtomicI64::new(MAX_SKIP_TOTAL)),
        }
    }

    /// Insert a newly established session for `peer`, wiring it into the
    /// shared global skip budget. Replaces any prior session with `peer`.
    pub async fn insert(&self, peer: NodeId, mut session: Session) {
        session.set_global_skip_budget(self.skip_budget.clone());
        self.sessions.write().await.insert(peer, session);
    }

    pub async fn contains(&self, peer: &NodeId) -> bool {
        self.sessions.read().await.contains_key(peer)
    }

    /// Run `f` against the session for `peer`, if one exists.
    pub async fn with_session<R>(&self, peer: &NodeId, f: impl FnOnce(&mut Session) -> R) -> Option<R> {
        let mut sessions = self.sessions.write().await;
        sessions.get_mut(peer).map(f)
    }

    pub async fn remove(&self, peer: &NodeId) -> Option<Session> {
        self.sessions.write().await.remove(peer)
    }

    pub async fn peer_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Snapshot every session's serialized bytes, for persistence under
    /// `sessions/<peer_node_id>.bin`.
    pub async fn snapshot_all(&self) -> Vec<(NodeId, Vec<u8>)> {
        let sessions = self.sessions.read().await;
        sessions.iter().map(|(peer, s)| (*peer, s.to_bytes())).collect()
    }

    pub fn remaining_skip_budget(&self) -> i64 {
        self.skip_budget.load(std::sync::atomic::Ordering::SeqCst)
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratchet::SessionState;
    use chacha20poly1305::aead::OsRng;
    use x25519_dalek::{PublicKey, StaticSecret};

    fn dummy_session() -> Session {
        let shared_secret = [1u8; 32];
        let their_secret = StaticSecret::random_from_rng(OsRng);
        let their_public = PublicKey::from(&their_secret).to_bytes();
        Session::init_initiator(shared_secret, their_public, [0u8; 64])
    }

    #[tokio::test]
    async fn insert_and_lookup_round_trips() {
        let registry = SessionRegistry::new();
        let peer: NodeId = [9u8; 32];
        registry.insert(peer, dummy_session()).await;

        assert!(registry.contains(&peer).await);
        let state = registry.with_session(&peer, |s| s.state()).await;
        assert_eq!(state, Some(SessionState::Fresh));
    }

    #[tokio::test]
    async fn missing_peer_yields_none() {
        let registry = SessionRegistry::new();
        let result = registry.with_session(&[1u8; 32], |s| s.state()).await;
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn inserted_sessions_share_the_global_skip_budget() {
        let registry = SessionRegistry::new();
        let a: NodeId = [1u8; 32];
        let b: NodeId = [2u8; 32];
        registry.insert(a, dummy_session()).await;
        registry.insert(b, dummy_session()).await;
        assert_eq!(registry.remaining_skip_budget(), MAX_SKIP_TOTAL);
    }
}
