//! Double Ratchet protocol (component C): forward-secret, skip-tolerant
//! per-message key derivation on top of an X3DH root secret.
//!
//! Grounded on `freeq_sdk::ratchet::{kdf_root, kdf_chain, Session}` — the
//! root/chain KDFs are kept essentially unchanged (HKDF-SHA256 for the
//! root chain, HMAC-SHA256 0x01/0x02 for the symmetric chain). Generalized
//! from the teacher's AES-256-GCM/random-nonce/string-wire design to
//! ChaCha20-Poly1305 with the zero-nonce-per-message-key scheme and fixed
//! binary header `spec.md` §6 mandates, plus an explicit session state
//! machine and a distinction between tampered (`AuthFail`) and replayed
//! (`ReplayOld`) messages the teacher does not need.
//!
//! Reference: <https://signal.org/docs/specifications/doubleratchet/>

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::RatchetError;

/// Per-session bound on stored skipped keys (`spec.md` §4.3).
pub const MAX_SKIP: u32 = 1000;
/// Bound on stored skipped keys across all sessions sharing a registry.
pub const MAX_SKIP_TOTAL: i64 = 10_000;
/// Consecutive decrypt failures before a session is closed (`spec.md` §4.3).
pub const MAX_CONSECUTIVE_AUTH_FAIL: u32 = 8;

/// The zero nonce used for every message. Safe only because each
/// ChaCha20-Poly1305 key (`MK`) encrypts exactly one message and is then
/// erased — see `spec.md` §6.
const ZERO_NONCE: [u8; 12] = [0u8; 12];

type HmacSha256 = Hmac<Sha256>;

fn kdf_root(root_key: &[u8; 32], dh_out: &[u8; 32]) -> ([u8; 32], [u8; 32]) {
    let hk = hkdf::Hkdf::<Sha256>::new(Some(root_key), dh_out);
    let mut output = [0u8; 64];
    hk.expand(b"ratchet", &mut output).expect("64 bytes is a valid HKDF length");
    let mut new_root = [0u8; 32];
    let mut chain_key = [0u8; 32];
    new_root.copy_from_slice(&output[..32]);
    chain_key.copy_from_slice(&output[32..]);
    (new_root, chain_key)
}

fn kdf_chain(chain_key: &[u8; 32]) -> ([u8; 32], [u8; 32]) {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(chain_key).expect("HMAC accepts any key length");
    mac.update(&[0x01]);
    let msg_key: [u8; 32] = mac.finalize().into_bytes().into();

    let mut mac = <HmacSha256 as Mac>::new_from_slice(chain_key).expect("HMAC accepts any key length");
    mac.update(&[0x02]);
    let next_chain: [u8; 32] = mac.finalize().into_bytes().into();

    (next_chain, msg_key)
}

fn dh(secret: &StaticSecret, public: &PublicKey) -> [u8; 32] {
    secret.diffie_hellman(public).to_bytes()
}

/// The header carried with every message: the sender's current ratchet
/// public key, the length of its previous sending chain, and its message
/// number in the current chain. Serves as AEAD associated data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub dh_pub: [u8; 32],
    pub pn: u32,
    pub n: u32,
}

impl Header {
    fn to_bytes(self) -> [u8; 40] {
        let mut out = [0u8; 40];
        out[..32].copy_from_slice(&self.dh_pub);
        out[32..36].copy_from_slice(&self.pn.to_be_bytes());
        out[36..40].copy_from_slice(&self.n.to_be_bytes());
        out
    }
}

/// A sealed message: header plus AEAD ciphertext. This is the payload
/// the `RATCHET_MSG` wire body (`spec.md` §6) carries.
#[derive(Debug, Clone)]
pub struct SealedMessage {
    pub header: Header,
    pub ciphertext: Vec<u8>,
}

/// Session lifecycle, per `spec.md` §4.3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Fresh,
    Established,
    Closed,
}

/// A Double Ratchet session between this node and one peer.
#[derive(Serialize, Deserialize)]
pub struct Session {
    dh_self_secret: [u8; 32],
    dh_self_public: [u8; 32],
    dh_remote: Option<[u8; 32]>,
    root_key: [u8; 32],
    send_chain_key: Option<[u8; 32]>,
    send_n: u32,
    recv_chain_key: Option<[u8; 32]>,
    recv_n: u32,
    prev_n: u32,
    /// `(DH_peer_pub, N) -> MK`, bounded to `MAX_SKIP` entries.
    skipped: HashMap<([u8; 32], u32), [u8; 32]>,
    /// AD bound into every AEAD call: `IK_A‖IK_B` from X3DH.
    associated_data: [u8; 64],
    state: SessionState,
    consecutive_auth_fail: u32,
    /// Count of `(DH_pub, N)` pairs already consumed, for `ReplayOld`.
    consumed: std::collections::HashSet<([u8; 32], u32)>,

    #[serde(skip)]
    global_skip_budget: Option<Arc<AtomicI64>>,
}

impl Session {
    /// Initialize as the initiator, immediately after X3DH.
    ///
    /// `shared_secret` is X3DH's `SK`; `their_ratchet_key` is the peer's
    /// signed prekey, used as the peer's first DH ratchet public key.
    pub fn init_initiator(
        shared_secret: [u8; 32],
        their_ratchet_key: [u8; 32],
        associated_data: [u8; 64],
    ) -> Self {
        let our_secret = StaticSecret::random_from_rng(chacha20poly1305::aead::OsRng);
        let our_public = PublicKey::from(&our_secret);
        let their_pub = PublicKey::from(their_ratchet_key);
        let dh_out = dh(&our_secret, &their_pub);
        let (root_key, send_chain_key) = kdf_root(&shared_secret, &dh_out);

        Session {
            dh_self_secret: our_secret.to_bytes(),
            dh_self_public: our_public.to_bytes(),
            dh_remote: Some(their_ratchet_key),
            root_key,
            send_chain_key: Some(send_chain_key),
            send_n: 0,
            recv_chain_key: None,
            recv_n: 0,
            prev_n: 0,
            skipped: HashMap::new(),
            associated_data,
            state: SessionState::Fresh,
            consecutive_auth_fail: 0,
            consumed: std::collections::HashSet::new(),
            global_skip_budget: None,
        }
    }

    /// Initialize as the responder. `our_ratchet_secret` is our signed
    /// prekey's secret, reused as the initial DH ratchet keypair; the
    /// sending chain stays absent until we observe the peer's ratchet key.
    pub fn init_responder(
        shared_secret: [u8; 32],
        our_ratchet_secret: [u8; 32],
        associated_data: [u8; 64],
    ) -> Self {
        let our_public = PublicKey::from(&StaticSecret::from(our_ratchet_secret)).to_bytes();

        Session {
            dh_self_secret: our_ratchet_secret,
            dh_self_public: our_public,
            dh_remote: None,
            root_key: shared_secret,
            send_chain_key: None,
            send_n: 0,
            recv_chain_key: None,
            recv_n: 0,
            prev_n: 0,
            skipped: HashMap::new(),
            associated_data,
            state: SessionState::Fresh,
            consecutive_auth_fail: 0,
            consumed: std::collections::HashSet::new(),
            global_skip_budget: None,
        }
    }

    /// Attach a shared global skipped-key budget (component: Session
    /// Registry). Without one, only the per-session `MAX_SKIP` bound
    /// applies.
    pub fn set_global_skip_budget(&mut self, budget: Arc<AtomicI64>) {
        self.global_skip_budget = Some(budget);
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn our_ratchet_public(&self) -> [u8; 32] {
        self.dh_self_public
    }

    pub fn skipped_key_count(&self) -> usize {
        self.skipped.len()
    }

    fn ad_bytes(&self, header: Header) -> Vec<u8> {
        let mut ad = Vec::with_capacity(64 + 40);
        ad.extend_from_slice(&self.associated_data);
        ad.extend_from_slice(&header.to_bytes());
        ad
    }

    /// Encrypt a plaintext. Advances `N_send` and the sending chain.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<SealedMessage, RatchetError> {
        if self.state == SessionState::Closed {
            return Err(RatchetError::Closed);
        }
        let chain_key = self.send_chain_key.ok_or(RatchetError::NoSendChain)?;
        let (next_chain, msg_key) = kdf_chain(&chain_key);
        self.send_chain_key = Some(next_chain);

        let header = Header { dh_pub: self.dh_self_public, pn: self.prev_n, n: self.send_n };
        self.send_n += 1;

        let cipher = ChaCha20Poly1305::new_from_slice(&msg_key).expect("32-byte key");
        let ad = self.ad_bytes(header);
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&ZERO_NONCE), Payload { msg: plaintext, aad: &ad })
            .map_err(|_| RatchetError::AuthFail)?;

        if self.state == SessionState::Fresh {
            self.state = SessionState::Established;
        }
        Ok(SealedMessage { header, ciphertext })
    }

    /// Decrypt an incoming sealed message, handling out-of-order delivery
    /// and DH ratchet steps per `spec.md` §4.3.
    pub fn decrypt(&mut self, msg: &SealedMessage) -> Result<Vec<u8>, RatchetError> {
        if self.state == SessionState::Closed {
            return Err(RatchetError::Closed);
        }
        let header = msg.header;

        if self.consumed.contains(&(header.dh_pub, header.n)) {
            return Err(RatchetError::ReplayOld);
        }

        if let Some(mk) = self.skipped.remove(&(header.dh_pub, header.n)) {
            let plaintext = self.open_with_key(&mk, header, &msg.ciphertext)?;
            self.consumed.insert((header.dh_pub, header.n));
            self.note_skip_freed(1);
            return Ok(plaintext);
        }

        let their_key_changed = self.dh_remote.map(|k| k != header.dh_pub).unwrap_or(true);

        // Snapshot state so a decrypt failure after a ratchet step does
        // not leave the session partially advanced.
        let snapshot = self.snapshot_for_rollback();

        let result = self.decrypt_inner(header, &msg.ciphertext, their_key_changed);
        match result {
            Ok(plaintext) => {
                self.consumed.insert((header.dh_pub, header.n));
                self.consecutive_auth_fail = 0;
                if self.state == SessionState::Fresh {
                    self.state = SessionState::Established;
                }
                Ok(plaintext)
            }
            Err(RatchetError::TooManySkipped) => {
                self.restore(snapshot);
                self.state = SessionState::Closed;
                Err(RatchetError::TooManySkipped)
            }
            Err(e) => {
                self.restore(snapshot);
                self.consecutive_auth_fail += 1;
                if self.consecutive_auth_fail >= MAX_CONSECUTIVE_AUTH_FAIL {
                    self.state = SessionState::Closed;
                }
                Err(e)
            }
        }
    }

    fn decrypt_inner(
        &mut self,
        header: Header,
        ciphertext: &[u8],
        their_key_changed: bool,
    ) -> Result<Vec<u8>, RatchetError> {
        if their_key_changed {
            if let Some(recv_ck) = self.recv_chain_key {
                self.skip_messages(self.dh_remote.unwrap_or([0u8; 32]), recv_ck, self.recv_n, header.pn)?;
            }

            self.dh_remote = Some(header.dh_pub);
            let their_pk = PublicKey::from(header.dh_pub);
            let our_sk = StaticSecret::from(self.dh_self_secret);
            let dh_out = dh(&our_sk, &their_pk);

            let (root_key, recv_chain_key) = kdf_root(&self.root_key, &dh_out);
            self.root_key = root_key;
            self.recv_chain_key = Some(recv_chain_key);
            self.recv_n = 0;

            self.prev_n = self.send_n;
            self.send_n = 0;
            let new_secret = StaticSecret::random_from_rng(chacha20poly1305::aead::OsRng);
            let new_public = PublicKey::from(&new_secret);
            self.dh_self_secret = new_secret.to_bytes();
            self.dh_self_public = new_public.to_bytes();

            let dh_out = dh(&StaticSecret::from(self.dh_self_secret), &their_pk);
            let (root_key, send_chain_key) = kdf_root(&self.root_key, &dh_out);
            self.root_key = root_key;
            self.send_chain_key = Some(send_chain_key);
        }

        let recv_ck = self.recv_chain_key.ok_or(RatchetError::NoReceiveChain)?;
        self.skip_messages(header.dh_pub, recv_ck, self.recv_n, header.n)?;

        let chain_key = self.recv_chain_key.unwrap();
        let (next_chain, msg_key) = kdf_chain(&chain_key);
        self.recv_chain_key = Some(next_chain);
        self.recv_n = header.n + 1;

        self.open_with_key(&msg_key, header, ciphertext)
    }

    fn open_with_key(&self, msg_key: &[u8; 32], header: Header, ciphertext: &[u8]) -> Result<Vec<u8>, RatchetError> {
        let cipher = ChaCha20Poly1305::new_from_slice(msg_key).expect("32-byte key");
        let ad = self.ad_bytes(header);
        cipher
            .decrypt(Nonce::from_slice(&ZERO_NONCE), Payload { msg: ciphertext, aad: &ad })
            .map_err(|_| RatchetError::AuthFail)
    }

    /// Derive and store keys for messages `from..until` in a chain,
    /// respecting both the per-session and global skip bounds. Overflow
    /// of either bound is fatal (`spec.md` §9 resolves the tension with
    /// Data Model invariant 4 in favor of "overflow is fatal").
    fn skip_messages(&mut self, dh_pub: [u8; 32], mut chain_key: [u8; 32], from: u32, until: u32) -> Result<(), RatchetError> {
        if until < from {
            return Ok(());
        }
        let count = (until - from) as usize;
        if self.skipped.len() + count > MAX_SKIP as usize {
            return Err(RatchetError::TooManySkipped);
        }
        if let Some(budget) = &self.global_skip_budget {
            let remaining_after = budget.fetch_sub(count as i64, Ordering::SeqCst) - count as i64;
            if remaining_after < 0 {
                budget.fetch_add(count as i64, Ordering::SeqCst);
                return Err(RatchetError::TooManySkipped);
            }
        }
        for n in from..until {
            let (next_chain, msg_key) = kdf_chain(&chain_key);
            self.skipped.insert((dh_pub, n), msg_key);
            chain_key = next_chain;
        }
        self.recv_chain_key = Some(chain_key);
        Ok(())
    }

    fn note_skip_freed(&self, count: i64) {
        if let Some(budget) = &self.global_skip_budget {
            budget.fetch_add(count, Ordering::SeqCst);
        }
    }

    fn snapshot_for_rollback(&self) -> RollbackSnapshot {
        RollbackSnapshot {
            dh_self_secret: self.dh_self_secret,
            dh_self_public: self.dh_self_public,
            dh_remote: self.dh_remote,
            root_key: self.root_key,
            send_chain_key: self.send_chain_key,
            send_n: self.send_n,
            recv_chain_key: self.recv_chain_key,
            recv_n: self.recv_n,
            prev_n: self.prev_n,
            skipped_len: self.skipped.len(),
        }
    }

    fn restore(&mut self, snapshot: RollbackSnapshot) {
        self.dh_self_secret = snapshot.dh_self_secret;
        self.dh_self_public = snapshot.dh_self_public;
        self.dh_remote = snapshot.dh_remote;
        self.root_key = snapshot.root_key;
        self.send_chain_key = snapshot.send_chain_key;
        self.send_n = snapshot.send_n;
        self.recv_chain_key = snapshot.recv_chain_key;
        self.recv_n = snapshot.recv_n;
        self.prev_n = snapshot.prev_n;
        // Any keys inserted into `self.skipped` by the failed attempt are
        // harmless to keep (they are still valid future decryptions), so
        // we only roll back the counters that gate ratchet progress, not
        // the skipped-key map itself.
        let _ = snapshot.skipped_len;
    }

    /// Serialize session state for persistence (`sessions/<peer>.bin`).
    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("Session is serializable")
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, RatchetError> {
        serde_json::from_slice(data).map_err(|_| RatchetError::InvalidSession)
    }
}

struct RollbackSnapshot {
    dh_self_secret: [u8; 32],
    dh_self_public: [u8; 32],
    dh_remote: Option<[u8; 32]>,
    root_key: [u8; 32],
    send_chain_key: Option<[u8; 32]>,
    send_n: u32,
    recv_chain_key: Option<[u8; 32]>,
    recv_n: u32,
    prev_n: u32,
    skipped_len: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_sessions() -> (Session, Session) {
        let shared_secret = [42u8; 32];
        let bob_secret = StaticSecret::random_from_rng(chacha20poly1305::aead::OsRng);
        let bob_public = PublicKey::from(&bob_secret).to_bytes();
        let ad = [7u8; 64];

        let alice = Session::init_initiator(shared_secret, bob_public, ad);
        let bob = Session::init_responder(shared_secret, bob_secret.to_bytes(), ad);
        (alice, bob)
    }

    #[test]
    fn basic_roundtrip() {
        let (mut alice, mut bob) = make_sessions();
        let wire = alice.encrypt(b"hello bob").unwrap();
        assert_eq!(bob.decrypt(&wire).unwrap(), b"hello bob");
        assert_eq!(alice.state(), SessionState::Established);
        assert_eq!(bob.state(), SessionState::Established);
    }

    #[test]
    fn bidirectional_ratchet_step() {
        let (mut alice, mut bob) = make_sessions();

        let w1 = alice.encrypt(b"m0").unwrap();
        let k0 = bob.our_ratchet_public();
        bob.decrypt(&w1).unwrap();

        let w2 = alice.encrypt(b"m1").unwrap();
        bob.decrypt(&w2).unwrap();

        let r0 = bob.encrypt(b"r0").unwrap();
        alice.decrypt(&r0).unwrap();

        let w3 = alice.encrypt(b"m2").unwrap();
        assert_ne!(w3.header.dh_pub, w1.header.dh_pub, "ratchet key must advance after peer's reply");
        let _ = k0;
        bob.decrypt(&w3).unwrap();
        assert_eq!(bob.recv_n, 1, "N_recv resets to 1 after the post-ratchet decrypt");
    }

    #[test]
    fn out_of_order_delivery_buffers_skipped_keys() {
        let (mut alice, mut bob) = make_sessions();
        let m0 = alice.encrypt(b"m0").unwrap();
        let m1 = alice.encrypt(b"m1").unwrap();
        let m2 = alice.encrypt(b"m2").unwrap();

        assert_eq!(bob.decrypt(&m2).unwrap(), b"m2");
        assert_eq!(bob.skipped_key_count(), 2);
        assert_eq!(bob.decrypt(&m0).unwrap(), b"m0");
        assert_eq!(bob.skipped_key_count(), 1);
        assert_eq!(bob.decrypt(&m1).unwrap(), b"m1");
        assert_eq!(bob.skipped_key_count(), 0);
    }

    #[test]
    fn replay_is_rejected_without_advancing_state() {
        let (mut alice, mut bob) = make_sessions();
        let wire = alice.encrypt(b"once").unwrap();
        assert_eq!(bob.decrypt(&wire).unwrap(), b"once");
        let n_before = bob.recv_n;
        assert_eq!(bob.decrypt(&wire).unwrap_err(), RatchetError::ReplayOld);
        assert_eq!(bob.recv_n, n_before);
    }

    #[test]
    fn tampered_ciphertext_is_auth_fail_and_session_survives() {
        let (mut alice, mut bob) = make_sessions();
        let mut wire = alice.encrypt(b"tamper me").unwrap();
        let last = wire.ciphertext.len() - 1;
        wire.ciphertext[last] ^= 0x01;
        assert_eq!(bob.decrypt(&wire).unwrap_err(), RatchetError::AuthFail);
        assert_eq!(bob.state(), SessionState::Fresh);
    }

    #[test]
    fn too_many_skipped_closes_session() {
        let (mut alice, mut bob) = make_sessions();
        let _ = alice.encrypt(b"priming").unwrap();
        let forged = SealedMessage {
            header: Header { dh_pub: alice.our_ratchet_public(), pn: 0, n: 2_000 },
            ciphertext: vec![0u8; 32],
        };
        let err = bob.decrypt(&forged).unwrap_err();
        assert_eq!(err, RatchetError::TooManySkipped);
        assert_eq!(bob.state(), SessionState::Closed);
        assert!(bob.skipped_key_count() <= MAX_SKIP as usize);
    }

    #[test]
    fn eight_consecutive_auth_failures_closes_session() {
        let (mut alice, mut bob) = make_sessions();
        for _ in 0..MAX_CONSECUTIVE_AUTH_FAIL {
            let mut wire = alice.encrypt(b"x").unwrap();
            let last = wire.ciphertext.len() - 1;
            wire.ciphertext[last] ^= 0x01;
            let _ = bob.decrypt(&wire);
        }
        assert_eq!(bob.state(), SessionState::Closed);
    }

    #[test]
    fn session_round_trips_through_serialization() {
        let (mut alice, mut bob) = make_sessions();
        let w1 = alice.encrypt(b"before persist").unwrap();
        bob.decrypt(&w1).unwrap();

        let alice_bytes = alice.to_bytes();
        let bob_bytes = bob.to_bytes();
        let mut alice2 = Session::from_bytes(&alice_bytes).unwrap();
        let mut bob2 = Session::from_bytes(&bob_bytes).unwrap();

        let w2 = bob2.encrypt(b"after persist").unwrap();
        assert_eq!(alice2.decrypt(&w2).unwrap(), b"after persist");
    }

    #[test]
    fn global_skip_budget_is_enforced_across_sessions() {
        let (mut alice, mut bob) = make_sessions();
        let budget = Arc::new(AtomicI64::new(5));
        bob.set_global_skip_budget(budget.clone());

        let _ = alice.encrypt(b"m0").unwrap();
        for _ in 0..10 {
            let _ = alice.encrypt(b"filler").unwrap();
        }
        let m11 = alice.encrypt(b"m11").unwrap();
        let err = bob.decrypt(&m11).unwrap_err();
        assert_eq!(err, RatchetError::TooManySkipped);
    }
}
