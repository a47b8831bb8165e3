mod x25519;
pub use x25519::*;

use crate::Error;
use rand::TryRngCore;
use rand::rngs::OsRng;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Generates a cryptographically secure random 32-byte seed.
pub(crate) fn generate_random_seed() -> Result<[u8; 32], Error> {
    let mut seed = [0u8; 32];
    OsRng.try_fill_bytes(&mut seed).map_err(|_| Error::Random)?;
    Ok(seed)
}

/// Draws a random non-zero `u32` from the OS generator.
pub(crate) fn random_u32() -> Result<u32, Error> {
    loop {
        let value = OsRng.try_next_u32().map_err(|_| Error::Random)?;
        if value != 0 {
            return Ok(value);
        }
    }
}

/// A 32-byte symmetric secret (root, chain or message key).
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub(crate) struct SymmetricKey([u8; 32]);

impl SymmetricKey {
    pub(crate) fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl From<[u8; 32]> for SymmetricKey {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl TryFrom<&[u8]> for SymmetricKey {
    type Error = Error;

    fn try_from(bytes: &[u8]) -> Result<Self, Error> {
        let array: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::Serde(format!("Invalid key length {}", bytes.len())))?;
        Ok(Self(array))
    }
}
