use crate::Error;
use crate::types::SymmetricKey;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

type HmacSha256 = Hmac<Sha256>;

const MESSAGE_KEY_LABEL: &[u8] = b"msg";
const CHAIN_KEY_LABEL: &[u8] = b"chain";

/// Symmetric-key ratchet. `index` is the number of the next message key.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub(crate) struct Chain {
    pub(crate) chain_key: SymmetricKey,
    pub(crate) index: u32,
}

impl Chain {
    pub(crate) fn new(chain_key: SymmetricKey) -> Self {
        Self {
            chain_key,
            index: 0,
        }
    }

    /// Derives the next message key and irreversibly advances the chain key.
    pub(crate) fn next(&mut self) -> Result<SymmetricKey, Error> {
        let index = self
            .index
            .checked_add(1)
            .ok_or_else(|| Error::Session("Chain counter exhausted".to_string()))?;

        let message_key = Self::derive(&self.chain_key, MESSAGE_KEY_LABEL)?;
        self.chain_key = Self::derive(&self.chain_key, CHAIN_KEY_LABEL)?;
        self.index = index;

        Ok(message_key)
    }

    fn derive(chain_key: &SymmetricKey, label: &[u8]) -> Result<SymmetricKey, Error> {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(chain_key.as_bytes())
            .map_err(|err| Error::Crypto(err.to_string()))?;
        mac.update(label);

        SymmetricKey::try_from(mac.finalize().into_bytes().as_slice())
    }
}
