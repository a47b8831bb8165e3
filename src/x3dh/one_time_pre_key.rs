use crate::Error;
use crate::types::{X25519PublicKey, X25519Secret, random_u32};
use std::collections::{BTreeMap, HashSet};
use std::time::{Duration, SystemTime};
use x25519_dalek::SharedSecret;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// A one-time pre-key as defined in Signal's X3DH protocol.
///
/// One-time pre-keys provide additional forward secrecy for the first message
/// of a session. Each key is used at most once and then discarded.
pub struct OneTimePreKey {
    pre_key: X25519Secret,
    id: u32,
}

impl OneTimePreKey {
    /// Creates a new one-time pre-key with the given ID.
    pub fn generate(id: u32) -> Result<Self, Error> {
        Ok(Self {
            pre_key: X25519Secret::generate()?,
            id,
        })
    }

    /// Returns the public component of this pre-key.
    pub fn public_key(&self) -> X25519PublicKey {
        self.pre_key.public_key()
    }

    /// Returns the unique identifier for this pre-key.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Performs Diffie-Hellman key agreement with the provided public key.
    pub(crate) fn dh(&self, public_key: &X25519PublicKey) -> Result<SharedSecret, Error> {
        self.pre_key.contributory_dh(public_key)
    }

    /// Serializes the one-time pre-key to a 36-byte array.
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

impl TryFrom<&[u8]> for OneTimePreKey {
    type Error = Error;

    fn try_from(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() != 36 {
            return Err(Error::Serde("Invalid one-time pre-key length".to_string()));
        }

        let mut id_bytes = [0u8; 4];
        id_bytes.copy_from_slice(&bytes[0..4]);

        Ok(Self {
            pre_key: X25519Secret::try_from(&bytes[4..])?,
            id: u32::from_be_bytes(id_bytes),
        })
    }
}

impl Zeroize for OneTimePreKey {
    fn zeroize(&mut self) {
        self.pre_key.zeroize();
        self.id = 0;
    }
}

impl ZeroizeOnDrop for OneTimePreKey {}

/// Pool of one-time pre-keys.
///
/// A key is either available, or reserved because it was handed out in a
/// published bundle. Reserved keys go back to the available set once their
/// reservation times out. Consumed keys are removed and zeroized; their ids stay
/// in `issued_ids` so a fresh key never reuses an id a peer may still reference.
pub(crate) struct OneTimePreKeyPool {
    pub(crate) available: BTreeMap<u32, OneTimePreKey>,
    pub(crate) reserved: BTreeMap<u32, (OneTimePreKey, SystemTime)>,
    pub(crate) issued_ids: HashSet<u32>,
}

impl OneTimePreKeyPool {
    pub(crate) fn new() -> Self {
        Self {
            available: BTreeMap::new(),
            reserved: BTreeMap::new(),
            issued_ids: HashSet::new(),
        }
    }

    /// Number of keys not yet consumed, reserved ones included.
    pub(crate) fn count(&self) -> usize {
        self.available.len() + self.reserved.len()
    }

    /// Tops the pool up to `target` keys and returns the public halves of the new ones.
    pub(crate) fn replenish(&mut self, target: usize) -> Result<Vec<(u32, X25519PublicKey)>, Error> {
        let needed = target.saturating_sub(self.count());
        let mut created = Vec::with_capacity(needed);

        for _ in 0..needed {
            let id = self.fresh_id()?;
            let key = OneTimePreKey::generate(id)?;
            created.push((id, key.public_key()));
            self.issued_ids.insert(id);
            self.available.insert(id, key);
        }

        Ok(created)
    }

    fn fresh_id(&self) -> Result<u32, Error> {
        loop {
            let id = random_u32()?;
            if !self.issued_ids.contains(&id) {
                return Ok(id);
            }
        }
    }

    /// Moves one available key into the reserved set.
    pub(crate) fn reserve(&mut self, now: SystemTime) -> Option<(u32, X25519PublicKey)> {
        let (id, key) = self.available.pop_first()?;
        let public = key.public_key();
        self.reserved.insert(id, (key, now));
        Some((id, public))
    }

    /// Returns reservations older than `timeout` to the available set.
    pub(crate) fn release_expired(&mut self, now: SystemTime, timeout: Duration) -> usize {
        let expired: Vec<u32> = self
            .reserved
            .iter()
            .filter(|(_, (_, reserved_at))| {
                now.duration_since(*reserved_at).unwrap_or_default() >= timeout
            })
            .map(|(id, _)| *id)
            .collect();

        for id in &expired {
            if let Some((key, _)) = self.reserved.remove(id) {
                self.available.insert(*id, key);
            }
        }

        expired.len()
    }

    /// Looks up a key without consuming it.
    pub(crate) fn get(&self, id: u32) -> Option<&OneTimePreKey> {
        self.reserved
            .get(&id)
            .map(|(key, _)| key)
            .or_else(|| self.available.get(&id))
    }

    /// Removes a key from the pool.
    pub(crate) fn take(&mut self, id: u32) -> Result<OneTimePreKey, Error> {
        self.reserved
            .remove(&id)
            .map(|(key, _)| key)
            .or_else(|| self.available.remove(&id))
            .ok_or_else(|| Error::KeyNotFound(format!("one-time pre-key {id}")))
    }
}

impl Zeroize for OneTimePreKeyPool {
    fn zeroize(&mut self) {
        for key in self.available.values_mut() {
            key.zeroize();
        }
        for (key, _) in self.reserved.values_mut() {
            key.zeroize();
        }
        self.available.clear();
        self.reserved.clear();
    }
}

impl ZeroizeOnDrop for OneTimePreKeyPool {}
