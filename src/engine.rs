use crate::session::derive_session_id;
use crate::{
    Error, KeyManager, MessageEnvelope, PreKeyBundle, Session, SessionAddress, SessionLeases,
    SessionRole, SessionState, SessionStore,
};
use std::sync::Arc;

/// Source of remote pre-key bundles.
///
/// Bundles returned here are untrusted; the engine verifies them before use.
pub trait BundleDirectory: Send + Sync {
    /// Fetches a bundle for one device of a remote identity.
    fn fetch_bundle(&self, identity: &str, device_id: u32) -> Result<PreKeyBundle, Error>;
}

/// Optional hooks for session lifecycle events. All methods default to no-ops.
pub trait SessionObserver: Send + Sync {
    /// A session was created by either side of a handshake.
    fn session_created(&self, _address: &SessionAddress, _role: SessionRole) {}

    /// The peer's ratchet key changed, so a DH ratchet step took place.
    fn session_ratcheted(&self, _address: &SessionAddress) {}

    /// A session was deleted by a reset or replaced by a new handshake.
    fn session_deleted(&self, _address: &SessionAddress) {}
}

/// Entry point tying the key manager, session store and bundle directory together.
///
/// Every operation on one address runs under that address's lease, so two
/// calls for the same remote device never interleave. Different devices
/// proceed in parallel.
pub struct SessionEngine<S: SessionStore, D: BundleDirectory> {
    key_manager: Arc<KeyManager>,
    local_device_id: u32,
    store: S,
    directory: D,
    leases: SessionLeases,
    observer: Option<Box<dyn SessionObserver>>,
}

impl<S: SessionStore, D: BundleDirectory> SessionEngine<S, D> {
    /// Creates an engine for one local device.
    pub fn new(key_manager: Arc<KeyManager>, local_device_id: u32, store: S, directory: D) -> Self {
        Self {
            key_manager,
            local_device_id,
            store,
            directory,
            leases: SessionLeases::new(),
            observer: None,
        }
    }

    /// Installs a lifecycle observer.
    pub fn with_observer(mut self, observer: impl SessionObserver + 'static) -> Self {
        self.observer = Some(Box::new(observer));
        self
    }

    pub fn key_manager(&self) -> &Arc<KeyManager> {
        &self.key_manager
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Encrypts `plaintext` for one remote device and returns the wire envelope.
    ///
    /// Without a stored session a bundle is fetched from the directory and an
    /// X3DH handshake is started; the preamble rides along until the peer answers.
    pub fn encrypt(&self, identity: &str, device_id: u32, plaintext: &[u8]) -> Result<Vec<u8>, Error> {
        let address = SessionAddress::new(identity, device_id);
        let _lease = self.leases.acquire(&address);

        let (mut session, created) = match self.store.load(&address)? {
            Some(session) => (session, false),
            None => {
                let bundle = self.directory.fetch_bundle(identity, device_id)?;
                let session = self.key_manager.create_outbound_session(
                    address.clone(),
                    self.local_device_id,
                    &bundle,
                )?;
                (session, true)
            }
        };

        let bytes = session.encrypt(plaintext)?.to_bytes()?;
        self.store.save(&session)?;

        if created {
            tracing::info!(%address, role = ?SessionRole::Initiator, "session created");
            self.notify(|observer| observer.session_created(&address, SessionRole::Initiator));
        }

        Ok(bytes)
    }

    /// Encrypts `plaintext` for every device of `identity` that has a session.
    pub fn encrypt_for_devices(
        &self,
        identity: &str,
        plaintext: &[u8],
    ) -> Result<Vec<(u32, Vec<u8>)>, Error> {
        self.store
            .list_devices(identity)?
            .into_iter()
            .map(|device_id| Ok((device_id, self.encrypt(identity, device_id, plaintext)?)))
            .collect()
    }

    /// Decrypts an envelope received from a remote device.
    ///
    /// An envelope carrying a preamble for an unknown handshake creates a
    /// responder session. When both sides started a handshake concurrently, the
    /// handshake with the larger initiator ratchet key wins on both ends and the
    /// other one fails here with [`Error::HandshakeFailed`]. A preamble for a new
    /// handshake arriving at an established session replaces it, since the peer
    /// reset its side. A preamble built on the current session's base ratchet
    /// key never replaces it.
    pub fn decrypt(&self, identity: &str, device_id: u32, bytes: &[u8]) -> Result<Vec<u8>, Error> {
        let envelope = MessageEnvelope::from_bytes(bytes)?;
        let address = SessionAddress::new(identity, device_id);
        let _lease = self.leases.acquire(&address);

        let existing = self.store.load(&address)?;
        let Some(preamble) = envelope.preamble else {
            let session = existing.ok_or_else(|| Error::SessionNotFound(address.to_string()))?;
            return self.decrypt_with(session, &envelope);
        };

        let Some(session) = existing else {
            return self.accept(address, &envelope, false);
        };

        let local_identity = self.key_manager.identity_public_key()?;
        let incoming_id =
            derive_session_id(&preamble.identity, &local_identity, &preamble.ephemeral_public);
        if incoming_id == session.session_id() {
            return self.decrypt_with(session, &envelope);
        }

        if envelope.header.ratchet_public == session.base_ratchet_key() {
            tracing::warn!(%address, "handshake reuses the current session's base key, discarding it");
            return Err(Error::HandshakeFailed(format!(
                "Handshake from {address} repeats the current session's base key"
            )));
        }

        if session.state() == SessionState::AwaitingHandshake {
            if session.base_ratchet_key() > envelope.header.ratchet_public {
                tracing::warn!(%address, "concurrent handshake lost the tie-break, discarding it");
                return Err(Error::HandshakeFailed(format!(
                    "Concurrent handshake from {address} lost the tie-break"
                )));
            }
            tracing::warn!(%address, "concurrent handshake won by peer, replacing local handshake");
        } else {
            tracing::info!(%address, "peer started a new handshake, replacing established session");
        }

        self.accept(address, &envelope, true)
    }

    /// Deletes the session with one remote device. Returns whether one existed.
    pub fn reset_session(&self, identity: &str, device_id: u32) -> Result<bool, Error> {
        let address = SessionAddress::new(identity, device_id);
        let _lease = self.leases.acquire(&address);

        let deleted = self.store.delete(&address)?;
        if deleted {
            tracing::info!(%address, "session reset");
            self.notify(|observer| observer.session_deleted(&address));
        }

        Ok(deleted)
    }

    /// Deletes the sessions with every device of `identity`. Returns how many were deleted.
    pub fn wipe_sessions(&self, identity: &str) -> Result<usize, Error> {
        let mut deleted = 0;
        for device_id in self.store.list_devices(identity)? {
            if self.reset_session(identity, device_id)? {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    fn accept(
        &self,
        address: SessionAddress,
        envelope: &MessageEnvelope,
        replaces: bool,
    ) -> Result<Vec<u8>, Error> {
        let (session, plaintext) =
            self.key_manager
                .accept_inbound_session(address.clone(), self.local_device_id, envelope)?;
        self.store.save(&session)?;

        if replaces {
            tracing::info!(%address, "previous session discarded");
            self.notify(|observer| observer.session_deleted(&address));
        }

        tracing::info!(%address, role = ?SessionRole::Responder, "session created");
        self.notify(|observer| observer.session_created(&address, SessionRole::Responder));

        Ok(plaintext)
    }

    fn decrypt_with(&self, mut session: Session, envelope: &MessageEnvelope) -> Result<Vec<u8>, Error> {
        let previous_ratchet_key = session.remote_ratchet_key();
        let plaintext = session.decrypt(envelope)?;
        self.store.save(&session)?;

        if session.remote_ratchet_key() != previous_ratchet_key {
            tracing::debug!(address = %session.address(), "peer ratchet key changed");
            self.notify(|observer| observer.session_ratcheted(session.address()));
        }

        Ok(plaintext)
    }

    fn notify(&self, event: impl FnOnce(&dyn SessionObserver)) {
        if let Some(observer) = &self.observer {
            event(observer.as_ref());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EngineConfig, MemorySessionStore};
    use parking_lot::Mutex;
    use std::collections::HashMap;

    #[derive(Default)]
    struct Directory {
        bundles: Mutex<HashMap<(String, u32), Arc<KeyManager>>>,
    }

    impl Directory {
        fn register(&self, identity: &str, device_id: u32, key_manager: &Arc<KeyManager>) {
            self.bundles
                .lock()
                .insert((identity.to_string(), device_id), Arc::clone(key_manager));
        }
    }

    impl BundleDirectory for Arc<Directory> {
        fn fetch_bundle(&self, identity: &str, device_id: u32) -> Result<PreKeyBundle, Error> {
            self.bundles
                .lock()
                .get(&(identity.to_string(), device_id))
                .ok_or_else(|| Error::KeyNotFound(format!("bundle for {identity}.{device_id}")))?
                .publish_bundle()
        }
    }

    #[derive(Default)]
    struct Events(Mutex<Vec<String>>);

    impl SessionObserver for Arc<Events> {
        fn session_created(&self, address: &SessionAddress, role: SessionRole) {
            self.0.lock().push(format!("created {address} {role:?}"));
        }

        fn session_ratcheted(&self, address: &SessionAddress) {
            self.0.lock().push(format!("ratcheted {address}"));
        }

        fn session_deleted(&self, address: &SessionAddress) {
            self.0.lock().push(format!("deleted {address}"));
        }
    }

    type Engine = SessionEngine<MemorySessionStore, Arc<Directory>>;

    fn engine(name: &str, device_id: u32, directory: &Arc<Directory>) -> Engine {
        let key_manager = Arc::new(KeyManager::new(EngineConfig::default()));
        key_manager.generate_identity(false).unwrap();
        key_manager.replenish_one_time_pre_keys(5).unwrap();
        directory.register(name, device_id, &key_manager);

        SessionEngine::new(key_manager, device_id, MemorySessionStore::new(), Arc::clone(directory))
    }

    #[test]
    fn test_observer_sees_lifecycle() {
        let directory = Arc::new(Directory::default());
        let alice_events = Arc::new(Events::default());
        let alice = engine("alice", 1, &directory).with_observer(Arc::clone(&alice_events));
        let bob = engine("bob", 1, &directory);

        let first = alice.encrypt("bob", 1, b"hi").unwrap();
        bob.decrypt("alice", 1, &first).unwrap();
        let reply = bob.encrypt("alice", 1, b"hello").unwrap();
        alice.decrypt("bob", 1, &reply).unwrap();
        assert!(alice.reset_session("bob", 1).unwrap());
        assert!(!alice.reset_session("bob", 1).unwrap());

        assert_eq!(
            *alice_events.0.lock(),
            vec![
                "created bob.1 Initiator".to_string(),
                "ratcheted bob.1".to_string(),
                "deleted bob.1".to_string(),
            ]
        );
    }

    #[test]
    fn test_message_without_session_is_rejected() {
        let directory = Arc::new(Directory::default());
        let alice = engine("alice", 1, &directory);
        let bob = engine("bob", 1, &directory);

        let first = alice.encrypt("bob", 1, b"hi").unwrap();
        bob.decrypt("alice", 1, &first).unwrap();
        let reply = bob.encrypt("alice", 1, b"hello").unwrap();
        alice.decrypt("bob", 1, &reply).unwrap();

        let no_preamble = alice.encrypt("bob", 1, b"confirmed").unwrap();
        bob.reset_session("alice", 1).unwrap();

        assert!(matches!(
            bob.decrypt("alice", 1, &no_preamble),
            Err(Error::SessionNotFound(_))
        ));
    }

    #[test]
    fn test_unknown_remote_device_fails_encrypt() {
        let directory = Arc::new(Directory::default());
        let alice = engine("alice", 1, &directory);

        assert!(matches!(alice.encrypt("carol", 1, b"hi"), Err(Error::KeyNotFound(_))));
        assert!(alice.store().list_devices("carol").unwrap().is_empty());
    }

    #[test]
    fn test_malformed_bytes_leave_session_untouched() {
        let directory = Arc::new(Directory::default());
        let alice = engine("alice", 1, &directory);
        let bob = engine("bob", 1, &directory);

        let first = alice.encrypt("bob", 1, b"hi").unwrap();
        let second = alice.encrypt("bob", 1, b"there").unwrap();
        bob.decrypt("alice", 1, &first).unwrap();

        assert!(matches!(
            bob.decrypt("alice", 1, &first[..first.len() - 1]),
            Err(Error::MalformedEnvelope(_))
        ));
        assert_eq!(bob.decrypt("alice", 1, &second).unwrap(), b"there");
    }

    #[test]
    fn test_observer_sees_replaced_session() {
        let directory = Arc::new(Directory::default());
        let bob_events = Arc::new(Events::default());
        let alice = engine("alice", 1, &directory);
        let bob = engine("bob", 1, &directory).with_observer(Arc::clone(&bob_events));

        let first = alice.encrypt("bob", 1, b"hi").unwrap();
        bob.decrypt("alice", 1, &first).unwrap();

        alice.reset_session("bob", 1).unwrap();
        let restart = alice.encrypt("bob", 1, b"again").unwrap();
        assert_eq!(bob.decrypt("alice", 1, &restart).unwrap(), b"again");

        assert_eq!(
            *bob_events.0.lock(),
            vec![
                "created alice.1 Responder".to_string(),
                "deleted alice.1".to_string(),
                "created alice.1 Responder".to_string(),
            ]
        );
    }

    #[test]
    fn test_handshake_on_current_base_key_is_rejected() {
        let directory = Arc::new(Directory::default());
        let alice = engine("alice", 1, &directory);
        let bob = engine("bob", 1, &directory);
        let mallory = KeyManager::new(EngineConfig::default());
        let mallory_identity = mallory.generate_identity(false).unwrap();

        let first = alice.encrypt("bob", 1, b"hi").unwrap();
        bob.decrypt("alice", 1, &first).unwrap();
        let reply = bob.encrypt("alice", 1, b"hello").unwrap();
        alice.decrypt("bob", 1, &reply).unwrap();

        let mut forged = MessageEnvelope::from_bytes(&first).unwrap();
        if let Some(preamble) = forged.preamble.as_mut() {
            preamble.identity.signing = mallory_identity.signing;
        }
        assert!(matches!(
            bob.decrypt("alice", 1, &forged.to_bytes().unwrap()),
            Err(Error::HandshakeFailed(_))
        ));

        let next = alice.encrypt("bob", 1, b"still here").unwrap();
        assert_eq!(bob.decrypt("alice", 1, &next).unwrap(), b"still here");
        let answer = bob.encrypt("alice", 1, b"me too").unwrap();
        assert_eq!(alice.decrypt("bob", 1, &answer).unwrap(), b"me too");
    }
}
