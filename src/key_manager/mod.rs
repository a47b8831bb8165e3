use crate::envelope::{MessageEnvelope, X3DHPreamble};
use crate::ratchet::identity_binding;
use crate::session::derive_session_id;
use crate::types::random_u32;
use crate::x3dh::{OneTimePreKeyPool, ResponderKeys, SignedPreKeyStore};
use crate::{
    DoubleRatchet, EngineConfig, Error, IdentityKeyPair, IdentityPublicKey, OneTimePreKey,
    OneTimePreKeyPublic, PreKeyBundle, Session, SessionAddress, SessionRole, SessionState,
    SignedPreKeyPublic, X3DH,
};
use parking_lot::Mutex;
use std::time::SystemTime;
use zeroize::Zeroize;

/// Registration ids are 14-bit and never zero.
const REGISTRATION_ID_MASK: u32 = 0x3FFF;

/// Identity material of the local device.
pub(crate) struct LocalIdentity {
    pub(crate) key_pair: IdentityKeyPair,
    pub(crate) registration_id: u32,
    pub(crate) signed_pre_keys: SignedPreKeyStore,
}

impl LocalIdentity {
    fn generate(now: SystemTime) -> Result<Self, Error> {
        Ok(Self {
            key_pair: IdentityKeyPair::generate()?,
            registration_id: generate_registration_id()?,
            signed_pre_keys: SignedPreKeyStore::new(now)?,
        })
    }

    fn signed_pre_key_public(&self) -> SignedPreKeyPublic {
        let current = &self.signed_pre_keys.current;
        SignedPreKeyPublic {
            id: current.id(),
            public_key: current.public_key(),
            signature: current.signature(&self.key_pair),
        }
    }
}

/// Everything guarded by the key manager's lock.
pub(crate) struct KeyPool {
    pub(crate) identity: Option<LocalIdentity>,
    pub(crate) one_time_pre_keys: OneTimePreKeyPool,
}

impl KeyPool {
    fn identity(&self) -> Result<&LocalIdentity, Error> {
        self.identity.as_ref().ok_or(Error::IdentityMissing)
    }

    fn identity_mut(&mut self) -> Result<&mut LocalIdentity, Error> {
        self.identity.as_mut().ok_or(Error::IdentityMissing)
    }
}

impl Zeroize for KeyPool {
    fn zeroize(&mut self) {
        self.identity = None;
        self.one_time_pre_keys.zeroize();
    }
}

/// Owner of the local identity, signed pre-keys and one-time pre-key pool.
///
/// All pool mutation happens under one lock, so a one-time pre-key is never
/// handed out or consumed twice. Share it between engines with an `Arc`.
pub struct KeyManager {
    pub(crate) config: EngineConfig,
    pub(crate) inner: Mutex<KeyPool>,
}

impl KeyManager {
    /// Creates a key manager without an identity.
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(KeyPool {
                identity: None,
                one_time_pre_keys: OneTimePreKeyPool::new(),
            }),
        }
    }

    /// Returns the configuration for this key manager.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Generates the local identity together with signed pre-key 1.
    ///
    /// Fails with [`Error::IdentityExists`] unless `reset` is set. A reset
    /// discards every signed and one-time pre-key of the previous identity.
    pub fn generate_identity(&self, reset: bool) -> Result<IdentityPublicKey, Error> {
        let mut pool = self.inner.lock();
        if pool.identity.is_some() && !reset {
            return Err(Error::IdentityExists);
        }

        let identity = LocalIdentity::generate(SystemTime::now())?;
        let public_key = identity.key_pair.public_key();
        let replaced = pool.identity.is_some();

        pool.zeroize();
        pool.one_time_pre_keys = OneTimePreKeyPool::new();
        pool.identity = Some(identity);

        tracing::info!(reset = replaced, "generated identity key");

        Ok(public_key)
    }

    /// Returns the public half of the local identity.
    pub fn identity_public_key(&self) -> Result<IdentityPublicKey, Error> {
        Ok(self.inner.lock().identity()?.key_pair.public_key())
    }

    /// Returns the local registration id.
    pub fn registration_id(&self) -> Result<u32, Error> {
        Ok(self.inner.lock().identity()?.registration_id)
    }

    /// Replaces the signed pre-key and purges retired keys past their grace period.
    pub fn rotate_signed_pre_key(&self) -> Result<SignedPreKeyPublic, Error> {
        let mut pool = self.inner.lock();
        self.rotate_locked(&mut pool, SystemTime::now())
    }

    /// Rotates the signed pre-key when it is older than the rotation interval.
    pub fn rotate_signed_pre_key_if_due(&self) -> Result<Option<SignedPreKeyPublic>, Error> {
        let mut pool = self.inner.lock();
        let now = SystemTime::now();

        let identity = pool.identity_mut()?;
        if !identity
            .signed_pre_keys
            .is_rotation_due(now, self.config.signed_pre_key_rotation_interval)
        {
            self.purge_signed_pre_keys(identity, now);
            return Ok(None);
        }

        self.rotate_locked(&mut pool, now).map(Some)
    }

    fn rotate_locked(&self, pool: &mut KeyPool, now: SystemTime) -> Result<SignedPreKeyPublic, Error> {
        let identity = pool.identity_mut()?;
        let id = identity.signed_pre_keys.rotate(now)?.id();
        self.purge_signed_pre_keys(identity, now);

        tracing::info!(signed_pre_key_id = id, "rotated signed pre-key");

        Ok(identity.signed_pre_key_public())
    }

    fn purge_signed_pre_keys(&self, identity: &mut LocalIdentity, now: SystemTime) {
        let purged = identity
            .signed_pre_keys
            .purge_expired(now, self.config.signed_pre_key_grace_period);
        if !purged.is_empty() {
            tracing::info!(?purged, "purged signed pre-keys past grace period");
        }
    }

    /// Tops the one-time pre-key pool up to `target_count` keys.
    ///
    /// Returns the public halves of the keys that were created.
    pub fn replenish_one_time_pre_keys(
        &self,
        target_count: usize,
    ) -> Result<Vec<OneTimePreKeyPublic>, Error> {
        let mut pool = self.inner.lock();
        pool.identity()?;

        let created = pool.one_time_pre_keys.replenish(target_count)?;
        tracing::debug!(
            created = created.len(),
            total = pool.one_time_pre_keys.count(),
            "replenished one-time pre-keys"
        );

        Ok(created
            .into_iter()
            .map(|(id, public_key)| OneTimePreKeyPublic { id, public_key })
            .collect())
    }

    /// Replenishes up to the configured maximum when the pool fell below the minimum.
    pub fn replenish_if_below_threshold(&self) -> Result<Vec<OneTimePreKeyPublic>, Error> {
        if self.one_time_pre_key_count() >= self.config.min_one_time_pre_keys {
            return Ok(Vec::new());
        }
        self.replenish_one_time_pre_keys(self.config.max_one_time_pre_keys)
    }

    /// Number of one-time pre-keys not yet consumed, reserved ones included.
    pub fn one_time_pre_key_count(&self) -> usize {
        self.inner.lock().one_time_pre_keys.count()
    }

    /// Returns the current signed pre-key and reserves one unused one-time pre-key.
    ///
    /// Reservations older than the configured timeout go back to the pool first.
    /// When the pool is empty the bundle carries no one-time pre-key.
    pub fn publish_bundle(&self) -> Result<PreKeyBundle, Error> {
        let mut pool = self.inner.lock();
        let now = SystemTime::now();

        let released = pool
            .one_time_pre_keys
            .release_expired(now, self.config.one_time_pre_key_reservation_timeout);
        if released > 0 {
            tracing::debug!(released, "released expired one-time pre-key reservations");
        }

        let one_time_pre_key = pool
            .one_time_pre_keys
            .reserve(now)
            .map(|(id, public_key)| OneTimePreKeyPublic { id, public_key });
        match &one_time_pre_key {
            Some(key) => tracing::debug!(one_time_pre_key_id = key.id, "reserved one-time pre-key"),
            None => tracing::warn!("no one-time pre-key available for bundle"),
        }

        let identity = pool.identity()?;
        Ok(PreKeyBundle {
            registration_id: identity.registration_id,
            identity: identity.key_pair.public_key(),
            signed_pre_key: identity.signed_pre_key_public(),
            one_time_pre_key,
        })
    }

    /// Removes a one-time pre-key from the pool and returns it.
    ///
    /// Fails with [`Error::KeyNotFound`] when the key was already consumed, which
    /// is what a second initiator racing on the same bundle observes.
    pub fn consume_one_time_pre_key(&self, key_id: u32) -> Result<OneTimePreKey, Error> {
        let key = self.inner.lock().one_time_pre_keys.take(key_id)?;
        tracing::debug!(one_time_pre_key_id = key_id, "consumed one-time pre-key");
        Ok(key)
    }

    /// Runs X3DH as initiator against a remote bundle.
    pub(crate) fn create_outbound_session(
        &self,
        address: SessionAddress,
        local_device_id: u32,
        bundle: &PreKeyBundle,
    ) -> Result<Session, Error> {
        let pool = self.inner.lock();
        let identity = pool.identity()?;
        let local_identity = identity.key_pair.public_key();

        let initiation = X3DH::new(&self.config.protocol_info).initiate(&identity.key_pair, bundle)?;
        let ephemeral_public = initiation.ephemeral_public();

        let preamble = X3DHPreamble {
            registration_id: identity.registration_id,
            identity: local_identity,
            ephemeral_public,
            signed_pre_key_id: bundle.signed_pre_key.id,
            one_time_pre_key_id: bundle.one_time_pre_key.map(|key| key.id),
        };
        drop(pool);

        let ratchet = DoubleRatchet::initialize_for_initiator(
            initiation.shared_secret(),
            &bundle.signed_pre_key.public_key,
            &self.config,
            identity_binding(&local_identity, &bundle.identity),
        )?;

        Ok(Session {
            session_id: derive_session_id(&local_identity, &bundle.identity, &ephemeral_public),
            local_device_id,
            address,
            role: SessionRole::Initiator,
            state: SessionState::AwaitingHandshake,
            remote_identity: bundle.identity,
            remote_registration_id: bundle.registration_id,
            base_ratchet_key: ratchet.public_key(),
            pending_preamble: Some(preamble),
            consumed_one_time_pre_key_id: None,
            ratchet,
        })
    }

    /// Runs X3DH as responder for an envelope carrying a preamble.
    ///
    /// The referenced one-time pre-key is only consumed after the first message
    /// authenticated, so a forged preamble cannot burn pool keys.
    pub(crate) fn accept_inbound_session(
        &self,
        address: SessionAddress,
        local_device_id: u32,
        envelope: &MessageEnvelope,
    ) -> Result<(Session, Vec<u8>), Error> {
        let preamble = envelope
            .preamble
            .ok_or_else(|| Error::HandshakeFailed("Envelope carries no preamble".to_string()))?;

        let (mut ratchet, local_identity) = {
            let pool = self.inner.lock();
            let identity = pool.identity()?;

            let signed_pre_key = identity
                .signed_pre_keys
                .get(preamble.signed_pre_key_id)
                .ok_or_else(|| {
                    Error::HandshakeFailed(format!(
                        "Unknown signed pre-key {}",
                        preamble.signed_pre_key_id
                    ))
                })?;

            let one_time_pre_key = preamble
                .one_time_pre_key_id
                .map(|id| {
                    pool.one_time_pre_keys.get(id).ok_or_else(|| {
                        Error::HandshakeFailed(format!("One-time pre-key {id} not found"))
                    })
                })
                .transpose()?;

            let keys = ResponderKeys {
                identity: &identity.key_pair,
                signed_pre_key,
                one_time_pre_key,
            };
            let shared_secret = X3DH::new(&self.config.protocol_info)
                .respond(&keys, &preamble.identity.dh, &preamble.ephemeral_public)
                .map_err(|err| Error::HandshakeFailed(err.to_string()))?;

            let local_identity = identity.key_pair.public_key();
            let ratchet = DoubleRatchet::initialize_for_responder(
                shared_secret,
                signed_pre_key.key_pair(),
                &self.config,
                identity_binding(&preamble.identity, &local_identity),
            );

            (ratchet, local_identity)
        };

        let plaintext =
            ratchet.decrypt_with_preamble(&envelope.header, &envelope.sealed(), Some(&preamble))?;

        if let Some(id) = preamble.one_time_pre_key_id {
            self.consume_one_time_pre_key(id).map_err(|_| {
                Error::HandshakeFailed(format!("One-time pre-key {id} was consumed concurrently"))
            })?;
        }

        let session = Session {
            session_id: derive_session_id(
                &preamble.identity,
                &local_identity,
                &preamble.ephemeral_public,
            ),
            local_device_id,
            address,
            role: SessionRole::Responder,
            state: SessionState::Established,
            remote_identity: preamble.identity,
            remote_registration_id: preamble.registration_id,
            base_ratchet_key: envelope.header.ratchet_public,
            pending_preamble: None,
            consumed_one_time_pre_key_id: preamble.one_time_pre_key_id,
            ratchet,
        };

        Ok((session, plaintext))
    }
}

/// Draws a random non-zero 14-bit registration id.
fn generate_registration_id() -> Result<u32, Error> {
    loop {
        let id = random_u32()? & REGISTRATION_ID_MASK;
        if id != 0 {
            return Ok(id);
        }
    }
}
