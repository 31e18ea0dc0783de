//! Identity & Prekey Store (component A).
//!
//! Holds a node's long-term identity keypair, a signed prekey, and a pool
//! of one-time prekeys, and serves prekey bundles for asynchronous X3DH
//! key agreement. Grounded on `freeq_sdk::x3dh::{IdentityKeyPair,
//! SignedPreKey}`, extended with a one-time prekey pool the teacher has
//! no concept of.
//!
//! Reference: <https://signal.org/docs/specifications/x3dh/>

use std::collections::{HashSet, VecDeque};

use chacha20poly1305::aead::OsRng as RandOsRng;
use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

use crate::error::X3dhError;

/// 256-bit node identifier, `SHA-256(IK_pub)`.
pub type NodeId = [u8; 32];

/// Derive a node's identifier from its identity public key.
pub fn node_id_of(ik_pub: &PublicKey) -> NodeId {
    let mut hasher = Sha256::new();
    hasher.update(ik_pub.as_bytes());
    hasher.finalize().into()
}

/// Render the leading 8 bytes of a `NodeId` as hex, for logs and display.
/// Comparisons and routing always use the full 32 bytes.
pub fn short_id(id: &NodeId) -> String {
    id[..8].iter().map(|b| format!("{b:02x}")).collect()
}

/// A node's long-term identity: an X25519 keypair for DH agreement and
/// an Ed25519 signing key used to authenticate the signed prekey.
///
/// `spec.md` treats these as a single `IK`; they are kept as two
/// keypairs here (as the teacher does with its DID signing key vs.
/// X25519 identity key) because X25519 keys cannot sign directly.
pub struct IdentityKeyPair {
    pub dh_secret: StaticSecret,
    pub dh_public: PublicKey,
    pub sign_key: SigningKey,
}

impl IdentityKeyPair {
    pub fn generate() -> Self {
        let dh_secret = StaticSecret::random_from_rng(RandOsRng);
        let dh_public = PublicKey::from(&dh_secret);
        let sign_key = SigningKey::generate(&mut RandOsRng);
        Self { dh_secret, dh_public, sign_key }
    }

    pub fn node_id(&self) -> NodeId {
        node_id_of(&self.dh_public)
    }

    /// Bytes suitable for persistence (`identity.bin`).
    pub fn to_secret_bytes(&self) -> IdentitySecretBytes {
        IdentitySecretBytes {
            dh_secret: self.dh_secret.to_bytes(),
            sign_key: self.sign_key.to_bytes(),
        }
    }

    pub fn from_secret_bytes(bytes: &IdentitySecretBytes) -> Self {
        let dh_secret = StaticSecret::from(bytes.dh_secret);
        let dh_public = PublicKey::from(&dh_secret);
        let sign_key = SigningKey::from_bytes(&bytes.sign_key);
        Self { dh_secret, dh_public, sign_key }
    }
}

/// Serializable secret material for `identity.bin`.
#[derive(Serialize, Deserialize, Zeroize)]
#[zeroize(drop)]
pub struct IdentitySecretBytes {
    dh_secret: [u8; 32],
    sign_key: [u8; 32],
}

/// A signed prekey: a medium-term X25519 keypair, signed by the identity's
/// Ed25519 key. Rotated on a schedule; rotation does not invalidate
/// sessions already running against an older SPK (`Session` only needs
/// `SPK_pub` once, at X3DH time).
pub struct SignedPreKey {
    pub id: u32,
    pub secret: StaticSecret,
    pub public: PublicKey,
    pub signature: [u8; 64],
}

impl SignedPreKey {
    pub fn generate(id: u32, identity: &IdentityKeyPair) -> Self {
        let secret = StaticSecret::random_from_rng(RandOsRng);
        let public = PublicKey::from(&secret);
        let signature = identity.sign_key.sign(public.as_bytes()).to_bytes();
        Self { id, secret, public, signature }
    }

    fn verify(public: &PublicKey, signature: &[u8; 64], verify_key: &VerifyingKey) -> Result<(), X3dhError> {
        let sig = ed25519_dalek::Signature::from_bytes(signature);
        verify_key
            .verify(public.as_bytes(), &sig)
            .map_err(|_| X3dhError::InvalidSignature)
    }
}

/// A one-time prekey. Consumed at most once, on the responder side.
pub struct OneTimePreKey {
    pub id: u32,
    pub secret: StaticSecret,
    pub public: PublicKey,
}

impl OneTimePreKey {
    fn generate(id: u32) -> Self {
        let secret = StaticSecret::random_from_rng(RandOsRng);
        let public = PublicKey::from(&secret);
        Self { id, secret, public }
    }
}

/// The public-only bundle served to a peer wishing to initiate X3DH.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrekeyBundle {
    pub ik_pub: [u8; 32],
    /// The identity's Ed25519 verifying key, used only to check
    /// `spk_sig` — independent of the X25519 `ik_pub` used for DH.
    pub ik_sign_pub: [u8; 32],
    pub spk_pub: [u8; 32],
    pub spk_sig: [u8; 64],
    pub spk_id: u32,
    pub opk: Option<([u8; 32], u32)>,
}

impl PrekeyBundle {
    pub fn verify_signature(&self) -> Result<(), X3dhError> {
        let verify_key = VerifyingKey::from_bytes(&self.ik_sign_pub).map_err(|_| X3dhError::InvalidBundle)?;
        let spk_pub = PublicKey::from(self.spk_pub);
        SignedPreKey::verify(&spk_pub, &self.spk_sig, &verify_key)
    }
}

/// Low-water mark below which `replenish` tops the OPK pool back up.
pub const OPK_LOW_WATER: usize = 10;
/// Target pool size after a replenish.
pub const OPK_POOL_TARGET: usize = 50;
/// Bound on the set of remembered initial-message fingerprints used for
/// `DuplicateInit` detection (component B). Oldest entries are evicted
/// first, matching the skipped-key eviction discipline elsewhere in the
/// core.
const SEEN_INIT_CAP: usize = 4096;

struct Inner {
    identity: IdentityKeyPair,
    spk: SignedPreKey,
    opks: VecDeque<OneTimePreKey>,
    /// Secrets for OPKs already served in a bundle but not yet consumed
    /// by a responding `consume_opk`.
    served: std::collections::HashMap<u32, StaticSecret>,
    consumed: HashSet<u32>,
    next_opk_id: u32,
    seen_inits: VecDeque<[u8; 32]>,
    seen_inits_set: HashSet<[u8; 32]>,
}

/// The identity & prekey store. All mutation goes through an exclusive
/// lock so handing out or consuming a one-time prekey is linearizable,
/// per `spec.md` §4.1's concurrency contract.
pub struct IdentityStore {
    inner: Mutex<Inner>,
    node_id: NodeId,
}

impl IdentityStore {
    /// Produce a fresh identity, signed prekey, and one-time prekey pool.
    pub fn generate() -> Self {
        let identity = IdentityKeyPair::generate();
        let node_id = identity.node_id();
        let spk = SignedPreKey::generate(1, &identity);
        let mut opks = VecDeque::new();
        for i in 0..OPK_POOL_TARGET as u32 {
            opks.push_back(OneTimePreKey::generate(i));
        }
        Self {
            node_id,
            inner: Mutex::new(Inner {
                identity,
                spk,
                opks,
                served: std::collections::HashMap::new(),
                consumed: HashSet::new(),
                next_opk_id: OPK_POOL_TARGET as u32,
                seen_inits: VecDeque::new(),
                seen_inits_set: HashSet::new(),
            }),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Our identity (DH) public key, as served in bundles.
    pub async fn identity_public_bytes(&self) -> [u8; 32] {
        let inner = self.inner.lock().await;
        *inner.identity.dh_public.as_bytes()
    }

    /// `DH(IK_self, peer_pub)`, using the long-term identity secret.
    pub async fn identity_dh(&self, peer_pub: &PublicKey) -> [u8; 32] {
        let inner = self.inner.lock().await;
        inner.identity.dh_secret.diffie_hellman(peer_pub).to_bytes()
    }

    /// `DH(SPK_self, peer_pub)`, using the current signed prekey secret.
    pub async fn spk_dh(&self, peer_pub: &PublicKey) -> [u8; 32] {
        let inner = self.inner.lock().await;
        inner.spk.secret.diffie_hellman(peer_pub).to_bytes()
    }

    /// The current signed prekey's secret scalar, used by the responder
    /// to seed its half of the Double Ratchet.
    pub async fn spk_secret_bytes(&self) -> [u8; 32] {
        let inner = self.inner.lock().await;
        inner.spk.secret.to_bytes()
    }

    /// Return a public-only bundle. Pops at most one one-time prekey so it
    /// is never handed out twice; if the pool is empty, `opk` is `None`.
    pub async fn bundle(&self) -> PrekeyBundle {
        let mut inner = self.inner.lock().await;
        let opk = inner.opks.pop_front().map(|o| {
            let public = *o.public.as_bytes();
            inner.served.insert(o.id, o.secret);
            (public, o.id)
        });
        PrekeyBundle {
            ik_pub: *inner.identity.dh_public.as_bytes(),
            ik_sign_pub: inner.identity.sign_key.verifying_key().to_bytes(),
            spk_pub: *inner.spk.public.as_bytes(),
            spk_sig: inner.spk.signature,
            spk_id: inner.spk.id,
            opk,
        }
    }

    /// Resolve a one-time prekey id to its private scalar, for the
    /// responder side of X3DH. Each id is consumable at most once.
    pub async fn consume_opk(&self, opk_id: u32) -> Result<StaticSecret, X3dhError> {
        let mut inner = self.inner.lock().await;
        if inner.consumed.contains(&opk_id) {
            return Err(X3dhError::UnknownOpk(opk_id));
        }
        let secret = inner.served.remove(&opk_id).ok_or(X3dhError::UnknownOpk(opk_id))?;
        inner.consumed.insert(opk_id);
        Ok(secret)
    }

    /// Generate new one-time prekeys if the pool has dropped below the
    /// low-water mark. Idempotent above the mark.
    pub async fn replenish(&self) {
        let mut inner = self.inner.lock().await;
        if inner.opks.len() >= OPK_LOW_WATER {
            return;
        }
        while inner.opks.len() < OPK_POOL_TARGET {
            let id = inner.next_opk_id;
            inner.next_opk_id += 1;
            inner.opks.push_back(OneTimePreKey::generate(id));
        }
    }

    /// Record that an initial message was seen, returning `true` if it is
    /// a replay (`DuplicateInit`).
    pub async fn check_and_record_init(&self, fingerprint: [u8; 32]) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.seen_inits_set.contains(&fingerprint) {
            return true;
        }
        inner.seen_inits_set.insert(fingerprint);
        inner.seen_inits.push_back(fingerprint);
        if inner.seen_inits.len() > SEEN_INIT_CAP {
            if let Some(oldest) = inner.seen_inits.pop_front() {
                inner.seen_inits_set.remove(&oldest);
            }
        }
        false
    }

    pub async fn rotate_spk(&self) {
        let mut inner = self.inner.lock().await;
        let next_id = inner.spk.id + 1;
        inner.spk = SignedPreKey::generate(next_id, &inner.identity);
    }

    /// Snapshot secret material for persistence (`identity.bin` /
    /// `prekeys.bin` in `spec.md` §6). Opaque beyond this process.
    pub async fn snapshot(&self) -> StoreSnapshot {
        let inner = self.inner.lock().await;
        StoreSnapshot {
            identity: inner.identity.to_secret_bytes(),
            spk_id: inner.spk.id,
            spk_secret: inner.spk.secret.to_bytes(),
            spk_signature: inner.spk.signature,
            opks: inner.opks.iter().map(|o| (o.id, o.secret.to_bytes())).collect(),
            served: inner.served.iter().map(|(id, s)| (*id, s.to_bytes())).collect(),
            consumed: inner.consumed.iter().copied().collect(),
            next_opk_id: inner.next_opk_id,
        }
    }

    /// Restore a store from a prior `snapshot()`.
    pub fn from_snapshot(snapshot: StoreSnapshot) -> Self {
        let identity = IdentityKeyPair::from_secret_bytes(&snapshot.identity);
        let node_id = identity.node_id();
        let spk_secret = StaticSecret::from(snapshot.spk_secret);
        let spk_public = PublicKey::from(&spk_secret);
        let spk = SignedPreKey {
            id: snapshot.spk_id,
            secret: spk_secret,
            public: spk_public,
            signature: snapshot.spk_signature,
        };
        let opks = snapshot
            .opks
            .into_iter()
            .map(|(id, secret_bytes)| {
                let secret = StaticSecret::from(secret_bytes);
                let public = PublicKey::from(&secret);
                OneTimePreKey { id, secret, public }
            })
            .collect();
        let served = snapshot
            .served
            .into_iter()
            .map(|(id, secret_bytes)| (id, StaticSecret::from(secret_bytes)))
            .collect();
        Self {
            node_id,
            inner: Mutex::new(Inner {
                identity,
                spk,
                opks,
                served,
                consumed: snapshot.consumed.into_iter().collect(),
                next_opk_id: snapshot.next_opk_id,
                seen_inits: VecDeque::new(),
                seen_inits_set: HashSet::new(),
            }),
        }
    }
}

/// Serializable secret snapshot of an `IdentityStore`.
#[derive(Serialize, Deserialize)]
pub struct StoreSnapshot {
    identity: IdentitySecretBytes,
    spk_id: u32,
    spk_secret: [u8; 32],
    spk_signature: [u8; 64],
    opks: Vec<(u32, [u8; 32])>,
    served: Vec<(u32, [u8; 32])>,
    consumed: Vec<u32>,
    next_opk_id: u32,
}
