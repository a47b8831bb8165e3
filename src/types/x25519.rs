use crate::Error;
use crate::types::generate_random_seed;
use std::cmp::Ordering;
use x25519_dalek::{PublicKey, SharedSecret, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Public half of an X25519 key pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct X25519PublicKey(PublicKey);

impl X25519PublicKey {
    /// Borrows the raw 32-byte encoding.
    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }

    /// Returns the raw 32-byte encoding.
    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.to_bytes()
    }
}

impl From<[u8; 32]> for X25519PublicKey {
    fn from(bytes: [u8; 32]) -> Self {
        Self(PublicKey::from(bytes))
    }
}

impl TryFrom<&[u8]> for X25519PublicKey {
    type Error = Error;

    fn try_from(bytes: &[u8]) -> Result<Self, Error> {
        let array: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::Serde(format!("Invalid public key length {}", bytes.len())))?;
        Ok(Self::from(array))
    }
}

impl From<PublicKey> for X25519PublicKey {
    fn from(value: PublicKey) -> Self {
        Self(value)
    }
}

impl AsRef<PublicKey> for X25519PublicKey {
    fn as_ref(&self) -> &PublicKey {
        &self.0
    }
}

// Big-endian byte order; used to settle concurrent handshakes.
impl PartialOrd for X25519PublicKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for X25519PublicKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.as_bytes().cmp(other.as_bytes())
    }
}

/// Private X25519 key. Zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct X25519Secret(StaticSecret);

impl X25519Secret {
    /// Generates a fresh key from the OS random number generator.
    pub(crate) fn generate() -> Result<Self, Error> {
        let mut seed = generate_random_seed()?;
        let secret = Self::from(seed);
        seed.zeroize();
        Ok(secret)
    }

    pub(crate) fn dh(&self, public_key: &X25519PublicKey) -> SharedSecret {
        self.0.diffie_hellman(public_key.as_ref())
    }

    /// Diffie-Hellman that rejects low-order peer keys.
    pub(crate) fn contributory_dh(&self, public_key: &X25519PublicKey) -> Result<SharedSecret, Error> {
        let shared = self.dh(public_key);
        if shared.was_contributory() {
            Ok(shared)
        } else {
            Err(Error::Crypto("Non-contributory Diffie-Hellman output".to_string()))
        }
    }

    pub(crate) fn public_key(&self) -> X25519PublicKey {
        PublicKey::from(&self.0).into()
    }

    pub(crate) fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }
}

impl From<[u8; 32]> for X25519Secret {
    fn from(bytes: [u8; 32]) -> Self {
        Self(StaticSecret::from(bytes))
    }
}

impl TryFrom<&[u8]> for X25519Secret {
    type Error = Error;

    fn try_from(bytes: &[u8]) -> Result<Self, Error> {
        let mut array: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::Serde(format!("Invalid secret key length {}", bytes.len())))?;
        let secret = Self::from(array);
        array.zeroize();
        Ok(secret)
    }
}
