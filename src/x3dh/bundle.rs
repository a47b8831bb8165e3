use crate::types::X25519PublicKey;
use crate::{Error, IdentityPublicKey};
use ed25519_dalek::Signature;

/// Public signed pre-key as it appears in a bundle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SignedPreKeyPublic {
    /// Identifier of the signed pre-key on the publishing device.
    pub id: u32,
    /// X25519 public key.
    pub public_key: X25519PublicKey,
    /// Ed25519 signature over `public_key`, made with the identity signing key.
    pub signature: Signature,
}

/// Public one-time pre-key as it appears in a bundle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OneTimePreKeyPublic {
    /// Identifier of the one-time pre-key on the publishing device.
    pub id: u32,
    /// X25519 public key.
    pub public_key: X25519PublicKey,
}

/// A bundle of public keys used for X3DH key agreement.
///
/// Contains all the public key material needed by another device to establish
/// a secure session asynchronously:
/// - Identity key for authentication and key agreement
/// - Signed pre-key with signature for authenticated key agreement
/// - Optional one-time pre-key for additional forward secrecy
///
/// A bundle arriving from a directory is untrusted until [`PreKeyBundle::verify`]
/// succeeds.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PreKeyBundle {
    /// Registration id of the publishing device.
    pub registration_id: u32,
    /// Public identity of the publishing device.
    pub identity: IdentityPublicKey,
    /// Current signed pre-key.
    pub signed_pre_key: SignedPreKeyPublic,
    /// Reserved one-time pre-key, if the pool was not empty.
    pub one_time_pre_key: Option<OneTimePreKeyPublic>,
}

impl PreKeyBundle {
    /// Verifies the signed pre-key signature against the bundle's identity.
    pub fn verify(&self) -> Result<(), Error> {
        self.identity
            .signing
            .verify_strict(
                self.signed_pre_key.public_key.as_bytes(),
                &self.signed_pre_key.signature,
            )
            .map_err(|_| Error::InvalidSignature)
    }
}
