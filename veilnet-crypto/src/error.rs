use thiserror::Error;

/// Failures from X3DH key agreement (component B).
#[derive(Debug, Error)]
pub enum X3dhError {
    #[error("invalid pre-key bundle")]
    InvalidBundle,
    #[error("invalid signature on signed pre-key")]
    InvalidSignature,
    #[error("responder has no one-time pre-key with id {0}")]
    UnknownOpk(u32),
    #[error("this initial message has already been processed")]
    DuplicateInit,
    #[error("key derivation failed")]
    KdfFailed,
}

/// Failures from the Double Ratchet (component C).
#[derive(Debug, Error, PartialEq, Eq, Clone, Copy)]
pub enum RatchetError {
    #[error("no sending chain established yet")]
    NoSendChain,
    #[error("no receiving chain established yet")]
    NoReceiveChain,
    #[error("too many skipped messages")]
    TooManySkipped,
    #[error("message authentication failed")]
    AuthFail,
    #[error("message already consumed")]
    ReplayOld,
    #[error("session is closed")]
    Closed,
    #[error("malformed ratchet header")]
    MalformedHeader,
    #[error("invalid persisted session state")]
    InvalidSession,
}
