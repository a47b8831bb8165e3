mod store;
pub use store::*;

use crate::envelope::{ENVELOPE_VERSION, MessageEnvelope, X3DHPreamble};
use crate::types::X25519PublicKey;
use crate::{DoubleRatchet, Error, IdentityPublicKey};
use base64::Engine;
use sha2::{Digest, Sha256};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Remote end of a pairwise session: an identity and one of its devices.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionAddress {
    /// Name under which the directory publishes the identity.
    pub identity: String,
    /// Device of that identity.
    pub device_id: u32,
}

impl SessionAddress {
    /// Creates an address.
    pub fn new(identity: impl Into<String>, device_id: u32) -> Self {
        Self {
            identity: identity.into(),
            device_id,
        }
    }
}

impl fmt::Display for SessionAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.identity, self.device_id)
    }
}

/// Which side of the X3DH handshake created the session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionRole {
    /// Fetched a bundle and sent the preamble.
    Initiator,
    /// Answered a preamble.
    Responder,
}

/// Handshake progress. Only ever moves forward.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// Initiator has not yet heard back; outgoing envelopes carry the preamble.
    AwaitingHandshake,
    /// Both sides hold the same ratchet.
    Established,
}

/// A secure messaging session with one remote device.
///
/// Encapsulates a Double Ratchet instance along with the handshake
/// bookkeeping needed to confirm the session and to settle concurrent
/// handshakes.
pub struct Session {
    pub(crate) session_id: String,
    pub(crate) local_device_id: u32,
    pub(crate) address: SessionAddress,
    pub(crate) role: SessionRole,
    pub(crate) state: SessionState,
    pub(crate) remote_identity: IdentityPublicKey,
    pub(crate) remote_registration_id: u32,
    /// Initiator's first ratchet public key; orders concurrent handshakes.
    pub(crate) base_ratchet_key: X25519PublicKey,
    pub(crate) pending_preamble: Option<X3DHPreamble>,
    pub(crate) consumed_one_time_pre_key_id: Option<u32>,
    pub(crate) ratchet: DoubleRatchet,
}

impl Session {
    /// Fingerprint of the handshake that created this session.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Local device this session belongs to.
    pub fn local_device_id(&self) -> u32 {
        self.local_device_id
    }

    /// Remote identity and device.
    pub fn address(&self) -> &SessionAddress {
        &self.address
    }

    /// Side of the handshake this session played.
    pub fn role(&self) -> SessionRole {
        self.role
    }

    /// Current handshake state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Remote device's public identity.
    pub fn remote_identity(&self) -> &IdentityPublicKey {
        &self.remote_identity
    }

    /// Remote device's registration id.
    pub fn remote_registration_id(&self) -> u32 {
        self.remote_registration_id
    }

    /// One-time pre-key this responder session consumed, if any.
    pub fn consumed_one_time_pre_key_id(&self) -> Option<u32> {
        self.consumed_one_time_pre_key_id
    }

    pub(crate) fn base_ratchet_key(&self) -> X25519PublicKey {
        self.base_ratchet_key
    }

    pub(crate) fn remote_ratchet_key(&self) -> Option<X25519PublicKey> {
        self.ratchet.state.remote_dh_key_public
    }

    /// Encrypts a message. Until the session is confirmed the preamble rides along.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<MessageEnvelope, Error> {
        let (header, sealed) = self
            .ratchet
            .encrypt_with_preamble(plaintext, self.pending_preamble.as_ref())?;
        MessageEnvelope::from_sealed(self.pending_preamble, header, sealed)
    }

    /// Decrypts a message. The first authenticated reply confirms an initiator session.
    pub fn decrypt(&mut self, envelope: &MessageEnvelope) -> Result<Vec<u8>, Error> {
        if envelope.version != ENVELOPE_VERSION {
            return Err(Error::MalformedEnvelope(format!(
                "Unsupported version {}",
                envelope.version
            )));
        }

        let plaintext = self.ratchet.decrypt_with_preamble(
            &envelope.header,
            &envelope.sealed(),
            envelope.preamble.as_ref(),
        )?;

        if self.state == SessionState::AwaitingHandshake && envelope.preamble.is_none() {
            self.mark_as_established();
        }

        Ok(plaintext)
    }

    /// Marks this session as established end-to-end and drops the preamble.
    pub(crate) fn mark_as_established(&mut self) {
        self.state = SessionState::Established;
        self.pending_preamble = None;
        tracing::debug!(address = %self.address, "session confirmed by peer");
    }
}

/// Derives the fingerprint of a handshake.
///
/// Both sides compute the same value: SHA-256 over the initiator identity,
/// the responder identity and the initiator's ephemeral key.
pub(crate) fn derive_session_id(
    initiator_identity: &IdentityPublicKey,
    responder_identity: &IdentityPublicKey,
    ephemeral_public: &X25519PublicKey,
) -> String {
    let mut hasher = Sha256::new();

    hasher.update(initiator_identity.to_bytes());
    hasher.update(responder_identity.to_bytes());
    hasher.update(ephemeral_public.as_bytes());

    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

impl Zeroize for Session {
    fn zeroize(&mut self) {
        self.session_id.zeroize();
        self.ratchet.zeroize();
        self.pending_preamble = None;
    }
}

impl ZeroizeOnDrop for Session {}
