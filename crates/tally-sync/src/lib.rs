//! tally-sync library.
//!
//! Device pairing, peer links, presence, and lazy asset transfer on top of
//! the `tally-core` document. The UI layer drives everything through a
//! [`session::Session`] — an explicitly constructed context object with
//! clear teardown, no hidden singletons.
//!
//! Network primitives are injected capabilities ([`transport::Signaling`],
//! [`transport::PeerChannel`], `tally_core::store::BlobStore`), so the
//! whole engine runs in plain unit tests over in-memory transports.

pub mod assets;
pub mod config;
pub mod invite;
pub mod link;
pub mod presence;
pub mod session;
pub mod transport;
pub mod wire;

pub use config::SessionConfig;
pub use invite::Invite;
pub use session::{Session, SessionParams};
