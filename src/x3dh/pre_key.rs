use crate::types::{X25519PublicKey, X25519Secret};
use crate::{Error, IdentityKeyPair};
use ed25519_dalek::Signature;
use std::collections::BTreeMap;
use std::time::{Duration, SystemTime};
use x25519_dalek::SharedSecret;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// A medium-term signed pre-key as defined in Signal's X3DH protocol.
///
/// Signed pre-keys are medium-term keys that are signed with the user's
/// identity key to provide authentication. They are rotated periodically;
/// the previous key is kept for a grace window so that late handshakes that
/// referenced it can still complete.
pub struct SignedPreKey {
    pre_key: X25519Secret,
    id: u32,
}

impl SignedPreKey {
    /// Creates a new signed pre-key with the given ID.
    pub fn generate(id: u32) -> Result<Self, Error> {
        Ok(Self {
            pre_key: X25519Secret::generate()?,
            id,
        })
    }

    /// Returns the public component of this signed pre-key.
    pub fn public_key(&self) -> X25519PublicKey {
        self.pre_key.public_key()
    }

    /// Returns a copy of the private key, used as the responder's first ratchet key.
    pub(crate) fn key_pair(&self) -> X25519Secret {
        self.pre_key.clone()
    }

    /// Returns the unique identifier for this signed pre-key.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Performs Diffie-Hellman key agreement with the other party's public key.
    pub(crate) fn dh(&self, public_key: &X25519PublicKey) -> Result<SharedSecret, Error> {
        self.pre_key.contributory_dh(public_key)
    }

    /// Signs the public half of this pre-key with the identity key.
    pub fn signature(&self, identity_key: &IdentityKeyPair) -> Signature {
        identity_key.sign(self.public_key().as_bytes())
    }

    /// Serializes the signed pre-key to a 36-byte array.
    ///
    /// The format is:
    /// - 4 bytes: ID (big-endian u32)
    /// - 32 bytes: X25519 private key
    pub(crate) fn to_bytes(&self) -> [u8; 36] {
        let mut result = [0u8; 36];

        result[0..4].copy_from_slice(&self.id.to_be_bytes());
        result[4..].copy_from_slice(self.pre_key.as_bytes());

        result
    }
}

impl TryFrom<&[u8]> for SignedPreKey {
    type Error = Error;

    fn try_from(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() != 36 {
            return Err(Error::Serde("Invalid signed pre-key length".to_string()));
        }

        let mut id_bytes = [0u8; 4];
        id_bytes.copy_from_slice(&bytes[0..4]);

        Ok(Self {
            pre_key: X25519Secret::try_from(&bytes[4..])?,
            id: u32::from_be_bytes(id_bytes),
        })
    }
}

impl Zeroize for SignedPreKey {
    fn zeroize(&mut self) {
        self.pre_key.zeroize();
        self.id = 0;
    }
}

impl ZeroizeOnDrop for SignedPreKey {}

/// The current signed pre-key plus the retired ones still inside their grace window.
pub(crate) struct SignedPreKeyStore {
    pub(crate) current: SignedPreKey,
    pub(crate) current_created_at: SystemTime,
    /// Retired keys and the instant they were retired.
    pub(crate) retired: BTreeMap<u32, (SignedPreKey, SystemTime)>,
}

impl SignedPreKeyStore {
    pub(crate) fn new(now: SystemTime) -> Result<Self, Error> {
        Ok(Self {
            current: SignedPreKey::generate(1)?,
            current_created_at: now,
            retired: BTreeMap::new(),
        })
    }

    /// Replaces the current key. Ids increase monotonically.
    pub(crate) fn rotate(&mut self, now: SystemTime) -> Result<&SignedPreKey, Error> {
        let id = self
            .current
            .id()
            .checked_add(1)
            .ok_or_else(|| Error::Crypto("Signed pre-key id space exhausted".to_string()))?;

        let previous = std::mem::replace(&mut self.current, SignedPreKey::generate(id)?);
        self.retired.insert(previous.id(), (previous, now));
        self.current_created_at = now;

        Ok(&self.current)
    }

    /// Drops retired keys whose grace window has elapsed. Returns the purged ids.
    pub(crate) fn purge_expired(&mut self, now: SystemTime, grace_period: Duration) -> Vec<u32> {
        let expired: Vec<u32> = self
            .retired
            .iter()
            .filter(|(_, (_, retired_at))| {
                now.duration_since(*retired_at).unwrap_or_default() >= grace_period
            })
            .map(|(id, _)| *id)
            .collect();

        for id in &expired {
            self.retired.remove(id);
        }

        expired
    }

    pub(crate) fn get(&self, id: u32) -> Option<&SignedPreKey> {
        if self.current.id() == id {
            return Some(&self.current);
        }
        self.retired.get(&id).map(|(key, _)| key)
    }

    pub(crate) fn is_rotation_due(&self, now: SystemTime, interval: Duration) -> bool {
        now.duration_since(self.current_created_at).unwrap_or_default() >= interval
    }
}
