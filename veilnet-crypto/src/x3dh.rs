//! Extended Triple Diffie-Hellman (X3DH) key agreement (component B).
//!
//! Grounded on `freeq_sdk::x3dh::{initiate, respond}`; generalized to add
//! the one-time-prekey branch (`DH4`) and associated-data binding that
//! the teacher's IRC-only X3DH does not need.
//!
//! Reference: <https://signal.org/docs/specifications/x3dh/>

use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::X3dhError;
use crate::identity::{IdentityStore, PrekeyBundle};

/// Associated data binding both parties' identity keys into the first
/// AEAD, per `spec.md` §4.2 step 5: `IK_A‖IK_B`.
pub type Ad = [u8; 64];

fn ad_of(ik_a: &[u8; 32], ik_b: &[u8; 32]) -> Ad {
    let mut ad = [0u8; 64];
    ad[..32].copy_from_slice(ik_a);
    ad[32..].copy_from_slice(ik_b);
    ad
}

/// The initial message sent by the initiator to start a session.
#[derive(Debug, Clone)]
pub struct InitialMessage {
    pub ik_pub: [u8; 32],
    pub ek_pub: [u8; 32],
    pub opk_id: Option<u32>,
}

impl InitialMessage {
    /// A stable fingerprint used for replay detection (`DuplicateInit`).
    pub fn fingerprint(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.ik_pub);
        hasher.update(self.ek_pub);
        hasher.update(self.opk_id.unwrap_or(u32::MAX).to_be_bytes());
        hasher.finalize().into()
    }
}

/// Output of X3DH on the initiator's side.
pub struct InitiatorResult {
    pub shared_secret: [u8; 32],
    /// The peer's signed prekey, used as the initial DH ratchet key.
    pub their_ratchet_key: [u8; 32],
    pub associated_data: Ad,
    pub initial_message: InitialMessage,
}

/// Initiator performs X3DH against a peer's published prekey bundle.
pub async fn initiate(
    own_store: &IdentityStore,
    their_bundle: &PrekeyBundle,
) -> Result<InitiatorResult, X3dhError> {
    their_bundle.verify_signature()?;

    let ik_b = PublicKey::from(their_bundle.ik_pub);
    let spk_b = PublicKey::from(their_bundle.spk_pub);

    let ek_secret = StaticSecret::random_from_rng(chacha20poly1305::aead::OsRng);
    let ek_public = PublicKey::from(&ek_secret);

    let dh1 = own_store.identity_dh(&spk_b).await; // DH(IK_A, SPK_B)
    let dh2 = ek_secret.diffie_hellman(&ik_b).to_bytes(); // DH(EK_A, IK_B)
    let dh3 = ek_secret.diffie_hellman(&spk_b).to_bytes(); // DH(EK_A, SPK_B)
    let dh4 = match their_bundle.opk {
        Some((opk_pub, _)) => Some(ek_secret.diffie_hellman(&PublicKey::from(opk_pub)).to_bytes()),
        None => None,
    };

    let mut ikm = Vec::with_capacity(128);
    ikm.extend_from_slice(&dh1);
    ikm.extend_from_slice(&dh2);
    ikm.extend_from_slice(&dh3);
    if let Some(dh4) = dh4 {
        ikm.extend_from_slice(&dh4);
    }

    let shared_secret = kdf_x3dh(&ikm)?;
    let own_ik_pub = own_store.identity_public_bytes().await;

    Ok(InitiatorResult {
        shared_secret,
        their_ratchet_key: their_bundle.spk_pub,
        associated_data: ad_of(&own_ik_pub, &their_bundle.ik_pub),
        initial_message: InitialMessage {
            ik_pub: own_ik_pub,
            ek_pub: *ek_public.as_bytes(),
            opk_id: their_bundle.opk.map(|(_, id)| id),
        },
    })
}

/// Result of the responder completing X3DH: the shared secret and the
/// secret ratchet key (our signed prekey) used to seed the ratchet.
pub struct ResponderResult {
    pub shared_secret: [u8; 32],
    pub our_ratchet_secret: [u8; 32],
    pub associated_data: Ad,
}

/// Responder completes X3DH from an initiator's initial message.
///
/// Returns `X3dhError::DuplicateInit` if this exact initial message was
/// already processed (a replay).
pub async fn respond(
    own_store: &IdentityStore,
    initial_msg: &InitialMessage,
) -> Result<ResponderResult, X3dhError> {
    if own_store.check_and_record_init(initial_msg.fingerprint()).await {
        return Err(X3dhError::DuplicateInit);
    }

    let ik_a = PublicKey::from(initial_msg.ik_pub);
    let ek_a = PublicKey::from(initial_msg.ek_pub);

    let dh1 = own_store.spk_dh(&ik_a).await; // DH(SPK_B, IK_A)
    let dh2 = own_store.identity_dh(&ek_a).await; // DH(IK_B, EK_A)
    let dh3 = own_store.spk_dh(&ek_a).await; // DH(SPK_B, EK_A)
    let dh4 = match initial_msg.opk_id {
        Some(opk_id) => {
            let opk_secret = own_store.consume_opk(opk_id).await?;
            Some(opk_secret.diffie_hellman(&ek_a).to_bytes())
        }
        None => None,
    };

    let mut ikm = Vec::with_capacity(128);
    ikm.extend_from_slice(&dh1);
    ikm.extend_from_slice(&dh2);
    ikm.extend_from_slice(&dh3);
    if let Some(dh4) = dh4 {
        ikm.extend_from_slice(&dh4);
    }

    let shared_secret = kdf_x3dh(&ikm)?;
    let our_ratchet_secret = own_store.spk_secret_bytes().await;
    let own_ik_pub = own_store.identity_public_bytes().await;

    Ok(ResponderResult {
        shared_secret,
        our_ratchet_secret,
        associated_data: ad_of(&initial_msg.ik_pub, &own_ik_pub),
    })
}

/// `HKDF-SHA256(salt=0x00…, ikm, info="x3dh")`, per `spec.md` §4.2 step 4.
fn kdf_x3dh(ikm: &[u8]) -> Result<[u8; 32], X3dhError> {
    let salt = [0x00u8; 32];
    let hk = hkdf::Hkdf::<sha2::Sha256>::new(Some(&salt), ikm);
    let mut shared = [0u8; 32];
    hk.expand(b"x3dh", &mut shared).map_err(|_| X3dhError::KdfFailed)?;
    Ok(shared)
}
