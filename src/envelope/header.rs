use crate::types::X25519PublicKey;

/// Ratchet metadata sent in the clear with every message and authenticated as associated data.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MessageHeader {
    /// Sender's current ratchet public key.
    pub ratchet_public: X25519PublicKey,
    /// Length of the sender's previous sending chain.
    pub previous_chain_length: u32,
    /// Position of this message in the sender's current sending chain.
    pub message_number: u32,
}

impl MessageHeader {
    /// Encoded length of a header.
    pub const LENGTH: usize = 40;

    /// Serializes the header.
    ///
    /// The format is:
    /// - 32 bytes: ratchet public key
    /// - 4 bytes: previous chain length (big-endian u32)
    /// - 4 bytes: message number (big-endian u32)
    pub fn to_bytes(&self) -> [u8; 40] {
        let mut bytes = [0u8; 40];
        bytes[0..32].copy_from_slice(self.ratchet_public.as_bytes());
        bytes[32..36].copy_from_slice(&self.previous_chain_length.to_be_bytes());
        bytes[36..40].copy_from_slice(&self.message_number.to_be_bytes());

        bytes
    }
}

impl From<[u8; 40]> for MessageHeader {
    fn from(bytes: [u8; 40]) -> Self {
        let mut dh_bytes = [0u8; 32];
        dh_bytes.copy_from_slice(&bytes[0..32]);

        let mut pn_bytes = [0u8; 4];
        pn_bytes.copy_from_slice(&bytes[32..36]);

        let mut n_bytes = [0u8; 4];
        n_bytes.copy_from_slice(&bytes[36..40]);

        Self {
            ratchet_public: X25519PublicKey::from(dh_bytes),
            previous_chain_length: u32::from_be_bytes(pn_bytes),
            message_number: u32::from_be_bytes(n_bytes),
        }
    }
}
