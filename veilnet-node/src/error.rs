use thiserror::Error;

/// The tagged sum of everything that can go wrong at the node boundary
/// (`spec.md` §7), composed from each crate's own error type with
/// `#[from]` conversions, the same layering the teacher uses between
/// `freeq_sdk::ratchet::RatchetError` and `anyhow::Result` at `main.rs`.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error(transparent)]
    X3dh(#[from] veilnet_crypto::X3dhError),
    #[error(transparent)]
    Ratchet(#[from] veilnet_crypto::RatchetError),
    #[error(transparent)]
    Wire(#[from] veilnet_wire::WireError),
    #[error(transparent)]
    Overlay(#[from] veilnet_overlay::OverlayError),
    #[error("malformed wire message: {0}")]
    Protocol(String),
    #[error("no session with peer {0}")]
    NoSession(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("persisted state is corrupt: {0}")]
    Corrupt(String),
}
