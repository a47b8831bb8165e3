mod bundle;
pub use bundle::*;
mod identity_key;
pub use identity_key::*;
mod one_time_pre_key;
pub use one_time_pre_key::OneTimePreKey;
pub(crate) use one_time_pre_key::OneTimePreKeyPool;
mod pre_key;
pub use pre_key::SignedPreKey;
pub(crate) use pre_key::SignedPreKeyStore;

use crate::Error;
use crate::types::{SymmetricKey, X25519PublicKey, X25519Secret};
use hkdf::Hkdf;
use sha2::Sha256;
use x25519_dalek::SharedSecret;
use zeroize::Zeroizing;

const SALT: &[u8] = b"SealedSession-X3DH";

/// Prefix mixed into the key material so the KDF input never starts with a valid DH output.
const KDF_PREFIX: [u8; 32] = [0xFF; 32];

/// A shared secret derived from X3DH key agreement. Zeroized on drop.
pub struct X3DHSharedSecret(pub(crate) SymmetricKey);

/// The result of an X3DH key agreement started by the initiator.
///
/// Contains both the calculated shared secret and the ephemeral public key
/// that has to travel to the responder in the message preamble.
pub struct X3DHInitiation {
    shared_secret: X3DHSharedSecret,
    ephemeral_public: X25519PublicKey,
}

impl X3DHInitiation {
    /// Returns the ephemeral public key that needs to be sent to the responder.
    pub fn ephemeral_public(&self) -> X25519PublicKey {
        self.ephemeral_public
    }

    /// Consumes the result and returns only the shared secret.
    pub fn shared_secret(self) -> X3DHSharedSecret {
        self.shared_secret
    }
}

/// Responder-side key material referenced by an incoming preamble.
pub(crate) struct ResponderKeys<'a> {
    pub(crate) identity: &'a IdentityKeyPair,
    pub(crate) signed_pre_key: &'a SignedPreKey,
    pub(crate) one_time_pre_key: Option<&'a OneTimePreKey>,
}

/// Implementation of the X3DH (Extended Triple Diffie-Hellman) key agreement protocol.
///
/// X3DH enables two parties to establish a shared secret asynchronously, even if one
/// party is offline. The protocol combines up to four Diffie-Hellman exchanges between
/// identity, signed pre-key, ephemeral and one-time pre-key material.
pub struct X3DH {
    info: Vec<u8>,
}

impl X3DH {
    /// Creates a new X3DH protocol instance with the specified application info.
    ///
    /// The info parameter is used as context for the HKDF key derivation, ensuring
    /// that keys derived in different contexts will be different even if the same
    /// key material is used.
    pub fn new(info: &[u8]) -> Self {
        Self {
            info: info.to_vec(),
        }
    }

    /// Initiates key agreement with a responder's pre-key bundle.
    ///
    /// 1. Verifies the bundle signature; nothing is derived from an unverified bundle
    /// 2. Generates an ephemeral key pair
    /// 3. Performs the DH computations
    /// 4. Derives the shared secret
    pub fn initiate(
        &self,
        local_identity: &IdentityKeyPair,
        bundle: &PreKeyBundle,
    ) -> Result<X3DHInitiation, Error> {
        bundle.verify()?;

        let ephemeral = X25519Secret::generate()?;
        let signed_pre_key = &bundle.signed_pre_key.public_key;

        // DH1 = DH(IKa, SPKb)
        let dh1 = local_identity.dh(signed_pre_key)?;
        // DH2 = DH(EKa, IKb)
        let dh2 = ephemeral.contributory_dh(&bundle.identity.dh)?;
        // DH3 = DH(EKa, SPKb)
        let dh3 = ephemeral.contributory_dh(signed_pre_key)?;
        // DH4 = DH(EKa, OPKb)
        let dh4 = match &bundle.one_time_pre_key {
            Some(one_time_pre_key) => Some(ephemeral.contributory_dh(&one_time_pre_key.public_key)?),
            None => {
                tracing::warn!(
                    registration_id = bundle.registration_id,
                    "bundle carries no one-time pre-key, handshake has reduced forward secrecy"
                );
                None
            }
        };

        Ok(X3DHInitiation {
            shared_secret: self.calculate_shared_secret(dh1, dh2, dh3, dh4)?,
            ephemeral_public: ephemeral.public_key(),
        })
    }

    /// Recomputes the initiator's secret from the keys referenced in a preamble.
    pub(crate) fn respond(
        &self,
        keys: &ResponderKeys<'_>,
        remote_identity: &X25519PublicKey,
        remote_ephemeral: &X25519PublicKey,
    ) -> Result<X3DHSharedSecret, Error> {
        // DH1 = DH(SPKb, IKa)
        let dh1 = keys.signed_pre_key.dh(remote_identity)?;
        // DH2 = DH(IKb, EKa)
        let dh2 = keys.identity.dh(remote_ephemeral)?;
        // DH3 = DH(SPKb, EKa)
        let dh3 = keys.signed_pre_key.dh(remote_ephemeral)?;
        // DH4 = DH(OPKb, EKa)
        let dh4 = keys
            .one_time_pre_key
            .map(|one_time_pre_key| one_time_pre_key.dh(remote_ephemeral))
            .transpose()?;

        self.calculate_shared_secret(dh1, dh2, dh3, dh4)
    }

    fn calculate_shared_secret(
        &self,
        dh1: SharedSecret,
        dh2: SharedSecret,
        dh3: SharedSecret,
        dh4: Option<SharedSecret>,
    ) -> Result<X3DHSharedSecret, Error> {
        // IKM = F || DH1 || DH2 || DH3 || DH4 (if available)
        let mut key_material = Zeroizing::new(Vec::with_capacity(160));
        key_material.extend_from_slice(&KDF_PREFIX);
        key_material.extend_from_slice(dh1.as_bytes());
        key_material.extend_from_slice(dh2.as_bytes());
        key_material.extend_from_slice(dh3.as_bytes());
        if let Some(dh4) = &dh4 {
            key_material.extend_from_slice(dh4.as_bytes());
        }

        let hkdf = Hkdf::<Sha256>::new(Some(SALT), &key_material);

        let mut shared_secret = [0u8; 32];
        hkdf.expand(&self.info, &mut shared_secret)?;

        Ok(X3DHSharedSecret(SymmetricKey::from(shared_secret)))
    }
}
