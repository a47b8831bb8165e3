use crate::IdentityPublicKey;
use crate::types::X25519PublicKey;

/// X3DH parameters attached to a session's first messages.
///
/// Carries what the responder needs to recompute the initiator's shared
/// secret. The initiator keeps attaching it until the responder answers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct X3DHPreamble {
    /// Registration id of the initiating device.
    pub registration_id: u32,
    /// Public identity of the initiating device.
    pub identity: IdentityPublicKey,
    /// Initiator's ephemeral X3DH key.
    pub ephemeral_public: X25519PublicKey,
    /// Responder's signed pre-key that was used.
    pub signed_pre_key_id: u32,
    /// Responder's one-time pre-key that was used, if the bundle carried one.
    pub one_time_pre_key_id: Option<u32>,
}

impl X3DHPreamble {
    /// Longest encoding, reached when a one-time pre-key id is present.
    pub const MAX_LENGTH: usize = 4 + IdentityPublicKey::LENGTH + 32 + 4 + 1 + 4;

    /// Encodes the preamble as it appears on the wire.
    ///
    /// The same bytes are authenticated as associated data of every message
    /// that carries the preamble.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(Self::MAX_LENGTH);
        bytes.extend_from_slice(&self.registration_id.to_be_bytes());
        bytes.extend_from_slice(&self.identity.to_bytes());
        bytes.extend_from_slice(self.ephemeral_public.as_bytes());
        bytes.extend_from_slice(&self.signed_pre_key_id.to_be_bytes());
        match self.one_time_pre_key_id {
            Some(id) => {
                bytes.push(1);
                bytes.extend_from_slice(&id.to_be_bytes());
            }
            None => bytes.push(0),
        }
        bytes
    }
}
