//! The framed, obfuscated, optionally-TLS-wrapped wire transport
//! (component D): length-prefixed frames, bijective traffic obfuscation,
//! and a read/write task pair per connection with bounded back-pressure.

pub mod conn;
pub mod error;
pub mod frame;
pub mod obfuscate;
pub mod tls;

pub use conn::{spawn, ConnectionHandle, WRITE_QUEUE_CAPACITY};
pub use error::WireError;
pub use frame::{read_frame, write_frame, MAX_FRAME_LEN};
pub use obfuscate::{deobfuscate, obfuscate, Method};
