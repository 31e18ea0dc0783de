//! Persistent state layout (`spec.md` §6): `identity.bin`, `prekeys.bin`,
//! and `sessions/<peer_node_id>.bin`, all rooted under a `base_dir` the
//! caller resolves (no OS keyring integration — passphrase-sealed
//! storage is explicitly out of scope, so these are plain `serde_json`
//! files, same as the teacher's config persistence in
//! `freeq-tui::config::Config::{load,save}`).

use std::path::{Path, PathBuf};

use veilnet_crypto::identity::{NodeId, StoreSnapshot};
use veilnet_crypto::IdentityStore;

use crate::error::NodeError;

pub struct Paths {
    base_dir: PathBuf,
}

impl Paths {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self { base_dir: base_dir.into() }
    }

    fn identity_path(&self) -> PathBuf {
        self.base_dir.join("identity.bin")
    }

    fn sessions_dir(&self) -> PathBuf {
        self.base_dir.join("sessions")
    }

    fn session_path(&self, peer: &NodeId) -> PathBuf {
        self.sessions_dir().join(format!("{}.bin", hex(peer)))
    }

    pub fn ensure_dirs(&self) -> Result<(), NodeError> {
        std::fs::create_dir_all(&self.base_dir)?;
        std::fs::create_dir_all(self.sessions_dir())?;
        Ok(())
    }
}

/// Load an existing identity store from `identity.bin`, or generate and
/// persist a fresh one if none exists yet.
pub async fn load_or_generate_identity(paths: &Paths) -> Result<IdentityStore, NodeError> {
    let path = paths.identity_path();
    if path.exists() {
        let data = std::fs::read(&path)?;
        let snapshot: StoreSnapshot =
            serde_json::from_slice(&data).map_err(|e| NodeError::Corrupt(format!("identity.bin: {e}")))?;
        return Ok(IdentityStore::from_snapshot(snapshot));
    }

    let store = IdentityStore::generate();
    save_identity(paths, &store).await?;
    Ok(store)
}

/// Persist the full identity + prekey pool (`identity.bin`/`prekeys.bin`
/// combined into one snapshot — the pool is small enough that splitting
/// them into two files buys nothing here).
pub async fn save_identity(paths: &Paths, store: &IdentityStore) -> Result<(), NodeError> {
    let snapshot = store.snapshot().await;
    let data = serde_json::to_vec(&snapshot).map_err(|e| NodeError::Corrupt(format!("serializing identity: {e}")))?;
    write_atomic(&paths.identity_path(), &data)
}

/// Load a persisted session for `peer`, if one exists.
pub fn load_session(paths: &Paths, peer: &NodeId) -> Result<Option<veilnet_crypto::Session>, NodeError> {
    let path = paths.session_path(peer);
    if !path.exists() {
        return Ok(None);
    }
    let data = std::fs::read(&path)?;
    let session = veilnet_crypto::Session::from_bytes(&data).map_err(|e| NodeError::Corrupt(format!("{}: {e}", path.display())))?;
    Ok(Some(session))
}

/// Rewrite `sessions/<peer_node_id>.bin` atomically, per `spec.md` §6.
pub fn save_session(paths: &Paths, peer: &NodeId, session: &veilnet_crypto::Session) -> Result<(), NodeError> {
    write_atomic(&paths.session_path(peer), &session.to_bytes())
}

/// Same as `save_session`, for a caller that already has the session's
/// serialized bytes (e.g. from `SessionRegistry::with_session`'s closure)
/// and does not want to hold the registry lock across a disk write.
pub fn write_session_bytes(paths: &Paths, peer: &NodeId, bytes: &[u8]) -> Result<(), NodeError> {
    write_atomic(&paths.session_path(peer), bytes)
}

/// Render the full 32-byte `NodeId` as hex, for filenames. Unlike
/// `short_id` (log/display only, 8 bytes), session filenames need the
/// full id so two peers can never collide on a truncated prefix.
fn hex(id: &NodeId) -> String {
    id.iter().map(|b| format!("{b:02x}")).collect()
}

/// Write `data` to `path` via a temp-file-then-rename so a crash mid-write
/// never leaves a half-written session file behind.
fn write_atomic(path: &Path, data: &[u8]) -> Result<(), NodeError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, data)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn identity_round_trips_through_disk() {
        let dir = tempdir();
        let paths = Paths::new(dir.clone());
        paths.ensure_dirs().unwrap();

        let store = load_or_generate_identity(&paths).await.unwrap();
        let node_id = store.node_id();

        let reloaded = load_or_generate_identity(&paths).await.unwrap();
        assert_eq!(reloaded.node_id(), node_id, "second load must reuse the persisted identity, not generate a new one");

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn missing_session_file_is_none() {
        let dir = tempdir();
        let paths = Paths::new(dir.clone());
        assert!(load_session(&paths, &[1u8; 32]).unwrap().is_none());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn session_round_trips_through_disk() {
        use chacha20poly1305::aead::OsRng;
        use x25519_dalek::{PublicKey, StaticSecret};

        let dir = tempdir();
        let paths = Paths::new(dir.clone());
        paths.ensure_dirs().unwrap();

        let their_secret = StaticSecret::random_from_rng(OsRng);
        let their_public = PublicKey::from(&their_secret).to_bytes();
        let session = veilnet_crypto::Session::init_initiator([1u8; 32], their_public, [0u8; 64]);
        let peer: NodeId = [5u8; 32];

        save_session(&paths, &peer, &session).unwrap();
        let reloaded = load_session(&paths, &peer).unwrap().expect("just saved");
        assert_eq!(reloaded.our_ratchet_public(), session.our_ratchet_public());

        std::fs::remove_dir_all(&dir).ok();
    }

    fn tempdir() -> PathBuf {
        use std::sync::atomic::{AtomicUsize, Ordering};
        static COUNTER: AtomicUsize = AtomicUsize::new(0);
        let n = COUNTER.fetch_add(1, Ordering::SeqCst);
        let dir = std::env::temp_dir().join(format!("veilnet-node-test-{}-{n}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }
}
