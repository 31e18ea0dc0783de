use thiserror::Error;

/// Failures from the overlay router (component E).
#[derive(Debug, Error)]
pub enum OverlayError {
    #[error("rpc timed out")]
    Timeout,
    #[error("malformed peer record or node response")]
    Protocol(String),
    #[error("routing table has no peers to query")]
    NoPeers,
}
