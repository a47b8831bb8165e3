use crate::ratchet::BINDING_LENGTH;
use crate::ratchet::chain::Chain;
use crate::types::{SymmetricKey, X25519PublicKey, X25519Secret};
use zeroize::{Zeroize, ZeroizeOnDrop};

#[derive(Clone)]
pub(crate) struct RatchetState {
    /// Identity binding: initiator public identity followed by responder public identity.
    pub(crate) ad: [u8; BINDING_LENGTH],

    pub(crate) dh_pair: X25519Secret,
    pub(crate) remote_dh_key_public: Option<X25519PublicKey>,

    pub(crate) root_key: SymmetricKey,
    // Sending chain is derived lazily after each receiving DH step
    pub(crate) sending_chain: Option<Chain>,
    pub(crate) receiving_chain: Option<Chain>,

    pub(crate) previous_sending_chain_length: u32,
}

impl Zeroize for RatchetState {
    fn zeroize(&mut self) {
        self.dh_pair.zeroize();
        self.root_key.zeroize();

        if let Some(chain) = self.sending_chain.as_mut() {
            chain.zeroize();
        }
        if let Some(chain) = self.receiving_chain.as_mut() {
            chain.zeroize();
        }
    }
}

impl ZeroizeOnDrop for RatchetState {}
