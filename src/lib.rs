//! End-to-end encrypted pairwise sessions between devices.
//!
//! Sessions are established asynchronously with X3DH against a published
//! [`PreKeyBundle`] and then kept fresh with the Double Ratchet. The
//! [`SessionEngine`] ties a [`KeyManager`], a [`SessionStore`] and a
//! [`BundleDirectory`] together and exchanges opaque [`MessageEnvelope`] bytes.

mod config;
pub use config::EngineConfig;

mod error;
pub use error::Error;

mod types;
pub use types::{X25519PublicKey, X25519Secret};

mod x3dh;
pub use x3dh::*;

mod ratchet;
pub use ratchet::DoubleRatchet;

mod envelope;
pub use envelope::*;

mod session;
pub use session::*;

mod key_manager;
pub use key_manager::KeyManager;

mod engine;
pub use engine::*;

mod proto;
