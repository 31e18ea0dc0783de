use thiserror::Error;

/// Failures from the wire transport (component D).
#[derive(Debug, Error)]
pub enum WireError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed frame: {0}")]
    Protocol(String),
    #[error("write queue full")]
    Enqueue,
    #[error("tls error: {0}")]
    Tls(String),
    #[error("connection closed")]
    Closed,
}
