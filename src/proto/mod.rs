//! Protocol Buffers persistence for sessions and key material.
//!
//! Optional byte fields are encoded as empty bytes; optional ids are wrapped in
//! [`KeyIdProto`]. Timestamps are whole seconds since the UNIX epoch.
//!
//! Intermediate messages hold raw key bytes and are zeroized as soon as they
//! have been encoded or converted back.

use crate::envelope::X3DHPreamble;
use crate::key_manager::{KeyPool, LocalIdentity};
use crate::ratchet::{BINDING_LENGTH, Chain, RatchetState, SkippedMessageKeys};
use crate::types::{SymmetricKey, X25519PublicKey, X25519Secret};
use crate::x3dh::{OneTimePreKeyPool, SignedPreKeyStore};
use crate::{
    DoubleRatchet, EngineConfig, Error, IdentityKeyPair, IdentityPublicKey, KeyManager,
    OneTimePreKey, Session, SessionAddress, SessionRole, SessionState, SignedPreKey,
};
use parking_lot::Mutex;
use prost::Message;
use std::collections::{BTreeMap, HashSet};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use zeroize::Zeroize;

const SCHEMA_VERSION: u32 = 1;

const ROLE_INITIATOR: u32 = 0;
const ROLE_RESPONDER: u32 = 1;

const STATE_AWAITING_HANDSHAKE: u32 = 0;
const STATE_ESTABLISHED: u32 = 1;

#[derive(Clone, PartialEq, prost::Message, Zeroize)]
pub struct KeyIdProto {
    #[prost(uint32, tag = "1")]
    pub id: u32,
}

#[derive(Clone, PartialEq, prost::Message, Zeroize)]
pub struct ChainProto {
    #[prost(bytes = "vec", tag = "1")]
    pub chain_key: Vec<u8>,
    #[prost(uint32, tag = "2")]
    pub index: u32,
}

#[derive(Clone, PartialEq, prost::Message, Zeroize)]
pub struct SkippedMessageKeyProto {
    #[prost(bytes = "vec", tag = "1")]
    pub ratchet_public: Vec<u8>,
    #[prost(uint32, tag = "2")]
    pub message_number: u32,
    #[prost(bytes = "vec", tag = "3")]
    pub message_key: Vec<u8>,
}

#[derive(Clone, PartialEq, prost::Message, Zeroize)]
pub struct RatchetProto {
    #[prost(bytes = "vec", tag = "1")]
    pub ad: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub dh_pair: Vec<u8>,
    #[prost(bytes = "vec", tag = "3")]
    pub remote_dh_key_public: Vec<u8>,
    #[prost(bytes = "vec", tag = "4")]
    pub root_key: Vec<u8>,
    #[prost(message, optional, tag = "5")]
    pub sending_chain: Option<ChainProto>,
    #[prost(message, optional, tag = "6")]
    pub receiving_chain: Option<ChainProto>,
    #[prost(uint32, tag = "7")]
    pub previous_sending_chain_length: u32,
    /// Oldest first, so eviction order survives a round trip.
    #[prost(message, repeated, tag = "8")]
    pub skipped_message_keys: Vec<SkippedMessageKeyProto>,
    #[prost(uint32, tag = "9")]
    pub max_skip: u32,
    #[prost(uint64, tag = "10")]
    pub max_cached_skipped_keys: u64,
}

#[derive(Clone, PartialEq, prost::Message, Zeroize)]
pub struct PreambleProto {
    #[prost(uint32, tag = "1")]
    pub registration_id: u32,
    #[prost(bytes = "vec", tag = "2")]
    pub identity: Vec<u8>,
    #[prost(bytes = "vec", tag = "3")]
    pub ephemeral_public: Vec<u8>,
    #[prost(uint32, tag = "4")]
    pub signed_pre_key_id: u32,
    #[prost(message, optional, tag = "5")]
    pub one_time_pre_key_id: Option<KeyIdProto>,
}

#[derive(Clone, PartialEq, prost::Message, Zeroize)]
pub struct SessionProto {
    #[prost(uint32, tag = "1")]
    pub version: u32,
    #[prost(string, tag = "2")]
    pub session_id: String,
    #[prost(uint32, tag = "3")]
    pub local_device_id: u32,
    #[prost(string, tag = "4")]
    pub identity: String,
    #[prost(uint32, tag = "5")]
    pub device_id: u32,
    #[prost(uint32, tag = "6")]
    pub role: u32,
    #[prost(uint32, tag = "7")]
    pub state: u32,
    #[prost(bytes = "vec", tag = "8")]
    pub remote_identity: Vec<u8>,
    #[prost(uint32, tag = "9")]
    pub remote_registration_id: u32,
    #[prost(bytes = "vec", tag = "10")]
    pub base_ratchet_key: Vec<u8>,
    #[prost(message, optional, tag = "11")]
    pub pending_preamble: Option<PreambleProto>,
    #[prost(message, optional, tag = "12")]
    pub consumed_one_time_pre_key_id: Option<KeyIdProto>,
    #[prost(message, optional, tag = "13")]
    pub ratchet: Option<RatchetProto>,
}

#[derive(Clone, PartialEq, prost::Message, Zeroize)]
pub struct ConfigProto {
    #[prost(uint32, tag = "1")]
    pub max_skip: u32,
    #[prost(uint64, tag = "2")]
    pub max_cached_skipped_keys: u64,
    #[prost(uint64, tag = "3")]
    pub signed_pre_key_rotation_interval_secs: u64,
    #[prost(uint64, tag = "4")]
    pub signed_pre_key_grace_period_secs: u64,
    #[prost(uint64, tag = "5")]
    pub min_one_time_pre_keys: u64,
    #[prost(uint64, tag = "6")]
    pub max_one_time_pre_keys: u64,
    #[prost(uint64, tag = "7")]
    pub one_time_pre_key_reservation_timeout_secs: u64,
    #[prost(bytes = "vec", tag = "8")]
    pub protocol_info: Vec<u8>,
}

#[derive(Clone, PartialEq, prost::Message, Zeroize)]
pub struct RetiredSignedPreKeyProto {
    #[prost(bytes = "vec", tag = "1")]
    pub key: Vec<u8>,
    #[prost(uint64, tag = "2")]
    pub retired_at: u64,
}

#[derive(Clone, PartialEq, prost::Message, Zeroize)]
pub struct IdentityProto {
    #[prost(bytes = "vec", tag = "1")]
    pub key_pair: Vec<u8>,
    #[prost(uint32, tag = "2")]
    pub registration_id: u32,
    #[prost(bytes = "vec", tag = "3")]
    pub signed_pre_key: Vec<u8>,
    #[prost(uint64, tag = "4")]
    pub signed_pre_key_created_at: u64,
    #[prost(message, repeated, tag = "5")]
    pub retired_signed_pre_keys: Vec<RetiredSignedPreKeyProto>,
}

#[derive(Clone, PartialEq, prost::Message, Zeroize)]
pub struct OneTimePreKeyProto {
    #[prost(bytes = "vec", tag = "1")]
    pub key: Vec<u8>,
}

#[derive(Clone, PartialEq, prost::Message, Zeroize)]
pub struct ReservedOneTimePreKeyProto {
    #[prost(bytes = "vec", tag = "1")]
    pub key: Vec<u8>,
    #[prost(uint64, tag = "2")]
    pub reserved_at: u64,
}

#[derive(Clone, PartialEq, prost::Message, Zeroize)]
pub struct KeyManagerProto {
    #[prost(uint32, tag = "1")]
    pub version: u32,
    #[prost(message, optional, tag = "2")]
    pub config: Option<ConfigProto>,
    #[prost(message, optional, tag = "3")]
    pub identity: Option<IdentityProto>,
    #[prost(message, repeated, tag = "4")]
    pub one_time_pre_keys: Vec<OneTimePreKeyProto>,
    #[prost(message, repeated, tag = "5")]
    pub reserved_one_time_pre_keys: Vec<ReservedOneTimePreKeyProto>,
    #[prost(uint32, repeated, tag = "6")]
    pub issued_one_time_pre_key_ids: Vec<u32>,
}

impl Session {
    /// Serializes the session to Protocol Buffers format.
    pub fn serialize(&self) -> Result<Vec<u8>, Error> {
        let role = match self.role {
            SessionRole::Initiator => ROLE_INITIATOR,
            SessionRole::Responder => ROLE_RESPONDER,
        };
        let state = match self.state {
            SessionState::AwaitingHandshake => STATE_AWAITING_HANDSHAKE,
            SessionState::Established => STATE_ESTABLISHED,
        };

        let mut session_proto = SessionProto {
            version: SCHEMA_VERSION,
            session_id: self.session_id.clone(),
            local_device_id: self.local_device_id,
            identity: self.address.identity.clone(),
            device_id: self.address.device_id,
            role,
            state,
            remote_identity: self.remote_identity.to_bytes().to_vec(),
            remote_registration_id: self.remote_registration_id,
            base_ratchet_key: self.base_ratchet_key.to_bytes().to_vec(),
            pending_preamble: self.pending_preamble.as_ref().map(serialize_preamble),
            consumed_one_time_pre_key_id: self
                .consumed_one_time_pre_key_id
                .map(|id| KeyIdProto { id }),
            ratchet: Some(serialize_ratchet(&self.ratchet)?),
        };

        let bytes = session_proto.encode_to_vec();
        session_proto.zeroize();
        Ok(bytes)
    }

    /// Deserializes a session from Protocol Buffers format.
    pub fn deserialize(bytes: &[u8]) -> Result<Self, Error> {
        let mut session_proto = SessionProto::decode(bytes)?;
        let session = deserialize_session(&session_proto);
        session_proto.zeroize();
        session
    }
}

fn deserialize_session(proto: &SessionProto) -> Result<Session, Error> {
    if proto.version != SCHEMA_VERSION {
        return Err(Error::Serde(format!(
            "Unsupported session schema version: {}",
            proto.version
        )));
    }

    let role = match proto.role {
        ROLE_INITIATOR => SessionRole::Initiator,
        ROLE_RESPONDER => SessionRole::Responder,
        other => return Err(Error::Serde(format!("Unknown session role {other}"))),
    };
    let state = match proto.state {
        STATE_AWAITING_HANDSHAKE => SessionState::AwaitingHandshake,
        STATE_ESTABLISHED => SessionState::Established,
        other => return Err(Error::Serde(format!("Unknown session state {other}"))),
    };

    let ratchet = proto
        .ratchet
        .as_ref()
        .ok_or_else(|| Error::Serde("Missing ratchet data".to_string()))
        .and_then(deserialize_ratchet)?;

    Ok(Session {
        session_id: proto.session_id.clone(),
        local_device_id: proto.local_device_id,
        address: SessionAddress::new(proto.identity.clone(), proto.device_id),
        role,
        state,
        remote_identity: IdentityPublicKey::try_from(proto.remote_identity.as_slice())?,
        remote_registration_id: proto.remote_registration_id,
        base_ratchet_key: X25519PublicKey::try_from(proto.base_ratchet_key.as_slice())?,
        pending_preamble: proto
            .pending_preamble
            .as_ref()
            .map(deserialize_preamble)
            .transpose()?,
        consumed_one_time_pre_key_id: proto.consumed_one_time_pre_key_id.as_ref().map(|key| key.id),
        ratchet,
    })
}

impl KeyManager {
    /// Serializes the identity, signed pre-keys and one-time pre-key pool.
    ///
    /// The output holds private keys and must be stored encrypted at rest.
    pub fn serialize(&self) -> Result<Vec<u8>, Error> {
        let pool = self.inner.lock();

        let identity = pool.identity.as_ref().map(|identity| {
            let store = &identity.signed_pre_keys;
            IdentityProto {
                key_pair: identity.key_pair.to_bytes().to_vec(),
                registration_id: identity.registration_id,
                signed_pre_key: store.current.to_bytes().to_vec(),
                signed_pre_key_created_at: to_unix_secs(store.current_created_at),
                retired_signed_pre_keys: store
                    .retired
                    .values()
                    .map(|(key, retired_at)| RetiredSignedPreKeyProto {
                        key: key.to_bytes().to_vec(),
                        retired_at: to_unix_secs(*retired_at),
                    })
                    .collect(),
            }
        });

        let keys = &pool.one_time_pre_keys;
        let mut issued_one_time_pre_key_ids: Vec<u32> = keys.issued_ids.iter().copied().collect();
        issued_one_time_pre_key_ids.sort_unstable();

        let mut manager_proto = KeyManagerProto {
            version: SCHEMA_VERSION,
            config: Some(serialize_config(&self.config)?),
            identity,
            one_time_pre_keys: keys
                .available
                .values()
                .map(|key| OneTimePreKeyProto {
                    key: key.to_bytes().to_vec(),
                })
                .collect(),
            reserved_one_time_pre_keys: keys
                .reserved
                .values()
                .map(|(key, reserved_at)| ReservedOneTimePreKeyProto {
                    key: key.to_bytes().to_vec(),
                    reserved_at: to_unix_secs(*reserved_at),
                })
                .collect(),
            issued_one_time_pre_key_ids,
        };

        let bytes = manager_proto.encode_to_vec();
        manager_proto.zeroize();
        Ok(bytes)
    }

    /// Restores a key manager from [`KeyManager::serialize`] output.
    pub fn deserialize(bytes: &[u8]) -> Result<Self, Error> {
        let mut manager_proto = KeyManagerProto::decode(bytes)?;
        let manager = deserialize_key_manager(&manager_proto);
        manager_proto.zeroize();
        manager
    }
}

fn deserialize_key_manager(proto: &KeyManagerProto) -> Result<KeyManager, Error> {
    if proto.version != SCHEMA_VERSION {
        return Err(Error::Serde(format!(
            "Unsupported key manager schema version: {}",
            proto.version
        )));
    }

    let config = proto
        .config
        .as_ref()
        .ok_or_else(|| Error::Serde("Missing key manager config".to_string()))
        .and_then(deserialize_config)?;

    let identity = proto
        .identity
        .as_ref()
        .map(deserialize_identity)
        .transpose()?;

    let mut available = BTreeMap::new();
    for key_proto in &proto.one_time_pre_keys {
        let key = OneTimePreKey::try_from(key_proto.key.as_slice())?;
        available.insert(key.id(), key);
    }

    let mut reserved = BTreeMap::new();
    for key_proto in &proto.reserved_one_time_pre_keys {
        let key = OneTimePreKey::try_from(key_proto.key.as_slice())?;
        reserved.insert(key.id(), (key, from_unix_secs(key_proto.reserved_at)));
    }

    let mut issued_ids: HashSet<u32> = proto.issued_one_time_pre_key_ids.iter().copied().collect();
    issued_ids.extend(available.keys().chain(reserved.keys()).copied());

    Ok(KeyManager {
        config,
        inner: Mutex::new(KeyPool {
            identity,
            one_time_pre_keys: OneTimePreKeyPool {
                available,
                reserved,
                issued_ids,
            },
        }),
    })
}

fn to_unix_secs(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

fn from_unix_secs(secs: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(secs)
}

fn to_u64(value: usize) -> Result<u64, Error> {
    u64::try_from(value).map_err(|err| Error::Serde(err.to_string()))
}

fn to_usize(value: u64) -> Result<usize, Error> {
    usize::try_from(value).map_err(|err| Error::Serde(err.to_string()))
}

fn serialize_config(config: &EngineConfig) -> Result<ConfigProto, Error> {
    Ok(ConfigProto {
        max_skip: config.max_skip,
        max_cached_skipped_keys: to_u64(config.max_cached_skipped_keys)?,
        signed_pre_key_rotation_interval_secs: config.signed_pre_key_rotation_interval.as_secs(),
        signed_pre_key_grace_period_secs: config.signed_pre_key_grace_period.as_secs(),
        min_one_time_pre_keys: to_u64(config.min_one_time_pre_keys)?,
        max_one_time_pre_keys: to_u64(config.max_one_time_pre_keys)?,
        one_time_pre_key_reservation_timeout_secs: config
            .one_time_pre_key_reservation_timeout
            .as_secs(),
        protocol_info: config.protocol_info.clone(),
    })
}

fn deserialize_config(proto: &ConfigProto) -> Result<EngineConfig, Error> {
    Ok(EngineConfig {
        max_skip: proto.max_skip,
        max_cached_skipped_keys: to_usize(proto.max_cached_skipped_keys)?,
        signed_pre_key_rotation_interval: Duration::from_secs(
            proto.signed_pre_key_rotation_interval_secs,
        ),
        signed_pre_key_grace_period: Duration::from_secs(proto.signed_pre_key_grace_period_secs),
        min_one_time_pre_keys: to_usize(proto.min_one_time_pre_keys)?,
        max_one_time_pre_keys: to_usize(proto.max_one_time_pre_keys)?,
        one_time_pre_key_reservation_timeout: Duration::from_secs(
            proto.one_time_pre_key_reservation_timeout_secs,
        ),
        protocol_info: proto.protocol_info.clone(),
    })
}

fn deserialize_identity(proto: &IdentityProto) -> Result<LocalIdentity, Error> {
    let mut retired = BTreeMap::new();
    for key_proto in &proto.retired_signed_pre_keys {
        let key = SignedPreKey::try_from(key_proto.key.as_slice())?;
        retired.insert(key.id(), (key, from_unix_secs(key_proto.retired_at)));
    }

    Ok(LocalIdentity {
        key_pair: IdentityKeyPair::try_from(proto.key_pair.as_slice())?,
        registration_id: proto.registration_id,
        signed_pre_keys: SignedPreKeyStore {
            current: SignedPreKey::try_from(proto.signed_pre_key.as_slice())?,
            current_created_at: from_unix_secs(proto.signed_pre_key_created_at),
            retired,
        },
    })
}

fn serialize_preamble(preamble: &X3DHPreamble) -> PreambleProto {
    PreambleProto {
        registration_id: preamble.registration_id,
        identity: preamble.identity.to_bytes().to_vec(),
        ephemeral_public: preamble.ephemeral_public.to_bytes().to_vec(),
        signed_pre_key_id: preamble.signed_pre_key_id,
        one_time_pre_key_id: preamble.one_time_pre_key_id.map(|id| KeyIdProto { id }),
    }
}

fn deserialize_preamble(proto: &PreambleProto) -> Result<X3DHPreamble, Error> {
    Ok(X3DHPreamble {
        registration_id: proto.registration_id,
        identity: IdentityPublicKey::try_from(proto.identity.as_slice())?,
        ephemeral_public: X25519PublicKey::try_from(proto.ephemeral_public.as_slice())?,
        signed_pre_key_id: proto.signed_pre_key_id,
        one_time_pre_key_id: proto.one_time_pre_key_id.as_ref().map(|key| key.id),
    })
}

fn serialize_chain(chain: &Chain) -> ChainProto {
    ChainProto {
        chain_key: chain.chain_key.as_bytes().to_vec(),
        index: chain.index,
    }
}

fn deserialize_chain(proto: &ChainProto) -> Result<Chain, Error> {
    Ok(Chain {
        chain_key: SymmetricKey::try_from(proto.chain_key.as_slice())?,
        index: proto.index,
    })
}

fn serialize_ratchet(ratchet: &DoubleRatchet) -> Result<RatchetProto, Error> {
    let state = &ratchet.state;

    Ok(RatchetProto {
        ad: state.ad.to_vec(),
        dh_pair: state.dh_pair.as_bytes().to_vec(),
        remote_dh_key_public: state
            .remote_dh_key_public
            .map(|key| key.to_bytes().to_vec())
            .unwrap_or_default(),
        root_key: state.root_key.as_bytes().to_vec(),
        sending_chain: state.sending_chain.as_ref().map(serialize_chain),
        receiving_chain: state.receiving_chain.as_ref().map(serialize_chain),
        previous_sending_chain_length: state.previous_sending_chain_length,
        skipped_message_keys: ratchet
            .skipped_message_keys
            .iter()
            .map(|((ratchet_public, message_number), message_key)| SkippedMessageKeyProto {
                ratchet_public: ratchet_public.to_vec(),
                message_number: *message_number,
                message_key: message_key.as_bytes().to_vec(),
            })
            .collect(),
        max_skip: ratchet.max_skip,
        max_cached_skipped_keys: to_u64(ratchet.skipped_message_keys.capacity())?,
    })
}

fn deserialize_ratchet(proto: &RatchetProto) -> Result<DoubleRatchet, Error> {
    let ad: [u8; BINDING_LENGTH] = proto
        .ad
        .as_slice()
        .try_into()
        .map_err(|_| Error::Serde("Invalid associated data length".to_string()))?;

    let remote_dh_key_public = if proto.remote_dh_key_public.is_empty() {
        None
    } else {
        Some(X25519PublicKey::try_from(proto.remote_dh_key_public.as_slice())?)
    };

    let mut skipped_message_keys =
        SkippedMessageKeys::new(to_usize(proto.max_cached_skipped_keys)?);
    for key in &proto.skipped_message_keys {
        let ratchet_public = X25519PublicKey::try_from(key.ratchet_public.as_slice())?;
        skipped_message_keys.insert(
            (ratchet_public.to_bytes(), key.message_number),
            SymmetricKey::try_from(key.message_key.as_slice())?,
        );
    }

    Ok(DoubleRatchet {
        state: RatchetState {
            ad,
            dh_pair: X25519Secret::try_from(proto.dh_pair.as_slice())?,
            remote_dh_key_public,
            root_key: SymmetricKey::try_from(proto.root_key.as_slice())?,
            sending_chain: proto.sending_chain.as_ref().map(deserialize_chain).transpose()?,
            receiving_chain: proto
                .receiving_chain
                .as_ref()
                .map(deserialize_chain)
                .transpose()?,
            previous_sending_chain_length: proto.previous_sending_chain_length,
        },
        skipped_message_keys,
        max_skip: proto.max_skip,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MessageEnvelope;

    fn key_manager() -> KeyManager {
        let manager = KeyManager::new(EngineConfig {
            max_skip: 25,
            protocol_info: b"Test-Protocol".to_vec(),
            ..EngineConfig::default()
        });
        manager.generate_identity(false).unwrap();
        manager.replenish_one_time_pre_keys(4).unwrap();
        manager
    }

    fn session_pair(alice: &KeyManager, bob: &KeyManager) -> (Session, Session, MessageEnvelope) {
        let bundle = bob.publish_bundle().unwrap();
        let mut alice_session = alice
            .create_outbound_session(SessionAddress::new("bob", 2), 1, &bundle)
            .unwrap();
        let first = alice_session.encrypt(b"first").unwrap();
        let (bob_session, _) = bob
            .accept_inbound_session(SessionAddress::new("alice", 1), 2, &first)
            .unwrap();
        (alice_session, bob_session, first)
    }

    #[test]
    fn test_key_manager_serialization_roundtrip() {
        let manager = key_manager();
        manager.rotate_signed_pre_key().unwrap();
        let reserved = manager.publish_bundle().unwrap();

        let restored = KeyManager::deserialize(&manager.serialize().unwrap()).unwrap();

        assert_eq!(restored.config(), manager.config());
        assert_eq!(
            restored.identity_public_key().unwrap(),
            manager.identity_public_key().unwrap()
        );
        assert_eq!(restored.registration_id().unwrap(), manager.registration_id().unwrap());
        assert_eq!(restored.one_time_pre_key_count(), 4);

        // Reservation survives, so the next bundle hands out a different key
        let next = restored.publish_bundle().unwrap();
        assert_eq!(next.signed_pre_key, reserved.signed_pre_key);
        assert_ne!(next.one_time_pre_key, reserved.one_time_pre_key);

        let pool = restored.inner.lock();
        let signed_pre_keys = &pool.identity.as_ref().unwrap().signed_pre_keys;
        assert!(signed_pre_keys.get(1).is_some());
        assert!(signed_pre_keys.get(2).is_some());
    }

    #[test]
    fn test_restored_key_manager_accepts_handshake() {
        let alice = key_manager();
        let bob = key_manager();
        let bundle = bob.publish_bundle().unwrap();

        let bob = KeyManager::deserialize(&bob.serialize().unwrap()).unwrap();

        let mut alice_session = alice
            .create_outbound_session(SessionAddress::new("bob", 1), 1, &bundle)
            .unwrap();
        let envelope = alice_session.encrypt(b"Hello after restart").unwrap();
        let (_, plaintext) = bob
            .accept_inbound_session(SessionAddress::new("alice", 1), 1, &envelope)
            .unwrap();

        assert_eq!(plaintext, b"Hello after restart");
        assert_eq!(bob.one_time_pre_key_count(), 3);
    }

    #[test]
    fn test_key_manager_without_identity() {
        let manager = KeyManager::new(EngineConfig::default());
        let restored = KeyManager::deserialize(&manager.serialize().unwrap()).unwrap();

        assert_eq!(restored.identity_public_key(), Err(Error::IdentityMissing));
    }

    #[test]
    fn test_session_serialization_preserves_functionality() {
        let (alice, bob) = (key_manager(), key_manager());
        let (mut alice_session, mut bob_session, _) = session_pair(&alice, &bob);

        let reply = bob_session.encrypt(b"reply").unwrap();
        alice_session.decrypt(&reply).unwrap();

        let mut alice_restored = Session::deserialize(&alice_session.serialize().unwrap()).unwrap();
        let mut bob_restored = Session::deserialize(&bob_session.serialize().unwrap()).unwrap();

        assert_eq!(alice_restored.session_id(), alice_session.session_id());
        assert_eq!(alice_restored.address(), &SessionAddress::new("bob", 2));
        assert_eq!(alice_restored.state(), SessionState::Established);
        assert_eq!(bob_restored.role(), SessionRole::Responder);
        assert_eq!(bob_restored.local_device_id(), 2);
        assert_eq!(bob_restored.remote_identity(), bob_session.remote_identity());

        let envelope = alice_restored.encrypt(b"Hello after serialization").unwrap();
        assert_eq!(
            bob_restored.decrypt(&envelope).unwrap(),
            b"Hello after serialization"
        );
    }

    #[test]
    fn test_pending_preamble_survives_serialization() {
        let (alice, bob) = (key_manager(), key_manager());
        let (alice_session, _, first) = session_pair(&alice, &bob);

        let mut restored = Session::deserialize(&alice_session.serialize().unwrap()).unwrap();

        assert_eq!(restored.state(), SessionState::AwaitingHandshake);
        assert_eq!(restored.encrypt(b"again").unwrap().preamble, first.preamble);
    }

    #[test]
    fn test_skipped_keys_survive_serialization() {
        let (alice, bob) = (key_manager(), key_manager());
        let (mut alice_session, mut bob_session, _) = session_pair(&alice, &bob);

        let messages: Vec<_> = (0..3)
            .map(|i| alice_session.encrypt(format!("Message {i}").as_bytes()).unwrap())
            .collect();
        bob_session.decrypt(&messages[2]).unwrap();

        let mut bob_restored = Session::deserialize(&bob_session.serialize().unwrap()).unwrap();
        assert_eq!(bob_restored.decrypt(&messages[0]).unwrap(), b"Message 0");
        assert_eq!(bob_restored.decrypt(&messages[1]).unwrap(), b"Message 1");
        assert_eq!(bob_restored.ratchet.max_skip, 25);
    }

    #[test]
    fn test_rejects_unknown_schema_version() {
        let (alice, bob) = (key_manager(), key_manager());
        let (alice_session, _, _) = session_pair(&alice, &bob);

        let mut proto = SessionProto::decode(alice_session.serialize().unwrap().as_slice()).unwrap();
        proto.version = 2;
        assert!(matches!(
            Session::deserialize(&proto.encode_to_vec()),
            Err(Error::Serde(_))
        ));

        let mut proto = KeyManagerProto::decode(alice.serialize().unwrap().as_slice()).unwrap();
        proto.version = 0;
        assert!(matches!(
            KeyManager::deserialize(&proto.encode_to_vec()),
            Err(Error::Serde(_))
        ));
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(Session::deserialize(&[0xFF, 0xFF, 0xFF]).is_err());
        assert!(KeyManager::deserialize(&[0x0A, 0x05, 0x01]).is_err());
    }

    #[test]
    fn test_zeroize_clears_key_material() {
        let (alice, bob) = (key_manager(), key_manager());
        let (alice_session, _, _) = session_pair(&alice, &bob);

        let mut proto = SessionProto::decode(alice_session.serialize().unwrap().as_slice()).unwrap();
        assert!(!proto.ratchet.as_ref().unwrap().root_key.is_empty());
        proto.zeroize();
        let ratchet = proto.ratchet.unwrap_or_default();
        assert!(ratchet.root_key.is_empty());
        assert!(ratchet.dh_pair.is_empty());
        assert!(ratchet.sending_chain.is_none());

        let mut proto = KeyManagerProto::decode(alice.serialize().unwrap().as_slice()).unwrap();
        proto.zeroize();
        assert!(proto.identity.is_none());
        assert!(proto.one_time_pre_keys.is_empty());
    }

    #[test]
    fn test_config_survives_roundtrip() {
        let config = EngineConfig {
            max_cached_skipped_keys: 77,
            min_one_time_pre_keys: 3,
            max_one_time_pre_keys: 9,
            ..EngineConfig::default()
        };

        let restored = deserialize_config(&serialize_config(&config).unwrap()).unwrap();
        assert_eq!(restored.max_cached_skipped_keys, 77);
        assert_eq!(restored.min_one_time_pre_keys, 3);
        assert_eq!(restored.max_one_time_pre_keys, 9);
        assert_eq!(restored.protocol_info, config.protocol_info);
    }
}
