use crate::Error;
use crate::types::{X25519PublicKey, X25519Secret, generate_random_seed};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use x25519_dalek::SharedSecret;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Long-term identity key pair that combines signing and key agreement capabilities.
///
/// An `IdentityKeyPair` holds an Ed25519 signing key used to sign pre-keys and an
/// X25519 key used in the X3DH agreement. The two halves are drawn from
/// independent seeds. Private material never leaves the crate unencrypted except
/// through [`crate::KeyManager::serialize`].
pub struct IdentityKeyPair {
    signing_key: SigningKey,
    dh_key: X25519Secret,
}

impl IdentityKeyPair {
    /// Creates a new identity key with randomly generated components.
    pub fn generate() -> Result<Self, Error> {
        let mut signing_seed = generate_random_seed()?;
        let signing_key = SigningKey::from_bytes(&signing_seed);
        signing_seed.zeroize();

        Ok(Self {
            signing_key,
            dh_key: X25519Secret::generate()?,
        })
    }

    /// Signs a message using the Ed25519 signing key.
    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    /// Returns the shareable half of this identity.
    pub fn public_key(&self) -> IdentityPublicKey {
        IdentityPublicKey {
            dh: self.dh_key.public_key(),
            signing: self.signing_key.verifying_key(),
        }
    }

    /// Performs Diffie-Hellman key agreement with another party's public key.
    pub(crate) fn dh(&self, public_key: &X25519PublicKey) -> Result<SharedSecret, Error> {
        self.dh_key.contributory_dh(public_key)
    }

    /// Serializes the identity key to a 64-byte array.
    ///
    /// The first 32 bytes contain the Ed25519 private key,
    /// and the last 32 bytes contain the X25519 private key.
    pub(crate) fn to_bytes(&self) -> [u8; 64] {
        let mut bytes = [0u8; 64];
        bytes[0..32].copy_from_slice(self.signing_key.as_bytes());
        bytes[32..64].copy_from_slice(self.dh_key.as_bytes());

        bytes
    }
}

impl TryFrom<&[u8]> for IdentityKeyPair {
    type Error = Error;

    /// Deserializes an identity key from its 64-byte encoding.
    fn try_from(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() != 64 {
            return Err(Error::Serde("Invalid identity key length".to_string()));
        }

        let mut signing_bytes = [0u8; 32];
        signing_bytes.copy_from_slice(&bytes[0..32]);
        let signing_key = SigningKey::from_bytes(&signing_bytes);
        signing_bytes.zeroize();

        Ok(Self {
            signing_key,
            dh_key: X25519Secret::try_from(&bytes[32..64])?,
        })
    }
}

impl Zeroize for IdentityKeyPair {
    fn zeroize(&mut self) {
        self.dh_key.zeroize();
    }
}

impl ZeroizeOnDrop for IdentityKeyPair {}

/// Public identity of a device: its X25519 agreement key and Ed25519 verifying key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IdentityPublicKey {
    /// Key used for DH1/DH2 of the X3DH agreement.
    pub dh: X25519PublicKey,
    /// Key that signs the signed pre-key.
    pub signing: VerifyingKey,
}

impl IdentityPublicKey {
    /// Encoded length: 32 bytes X25519 followed by 32 bytes Ed25519.
    pub const LENGTH: usize = 64;

    /// Returns the 64-byte wire encoding.
    pub fn to_bytes(&self) -> [u8; 64] {
        let mut bytes = [0u8; 64];
        bytes[0..32].copy_from_slice(self.dh.as_bytes());
        bytes[32..64].copy_from_slice(self.signing.as_bytes());
        bytes
    }
}

impl TryFrom<&[u8]> for IdentityPublicKey {
    type Error = Error;

    fn try_from(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() != Self::LENGTH {
            return Err(Error::Serde("Invalid identity public key length".to_string()));
        }

        let mut signing_bytes = [0u8; 32];
        signing_bytes.copy_from_slice(&bytes[32..64]);

        Ok(Self {
            dh: X25519PublicKey::try_from(&bytes[0..32])?,
            signing: VerifyingKey::from_bytes(&signing_bytes)
                .map_err(|err| Error::Serde(err.to_string()))?,
        })
    }
}
