//! Secure messaging core: identity and prekey management (component A),
//! X3DH session establishment (component B), and the Double Ratchet
//! (component C) that together give two nodes an asynchronous,
//! forward-secret, tamper-evident channel.

pub mod error;
pub mod identity;
pub mod ratchet;
pub mod session;
pub mod x3dh;

pub use error::{RatchetError, X3dhError};
pub use identity::{node_id_of, short_id, IdentityStore, NodeId, PrekeyBundle};
pub use ratchet::{Header, SealedMessage, Session, SessionState};
pub use session::SessionRegistry;
