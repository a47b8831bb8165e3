mod chain;
mod skipped;
mod state;

pub(crate) use crate::ratchet::chain::Chain;
pub(crate) use crate::ratchet::skipped::SkippedMessageKeys;
pub(crate) use crate::ratchet::state::RatchetState;

use crate::envelope::{ENVELOPE_VERSION, MessageHeader, X3DHPreamble};
use crate::error::Error;
use crate::ratchet::skipped::SkippedKeyId;
use crate::types::{SymmetricKey, X25519PublicKey, X25519Secret};
use crate::{EngineConfig, IdentityPublicKey, X3DHSharedSecret};
use aes_gcm_siv::aead::{Aead, Payload};
use aes_gcm_siv::{Aes256GcmSiv, KeyInit, Nonce};
use hkdf::Hkdf;
use sha2::Sha256;
use x25519_dalek::SharedSecret;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

const NONCE_SIZE: usize = 12; // AES-GCM-SIV uses 12-byte (96-bit) nonces
const ROOT_INFO: &[u8] = b"SealedSession-Ratchet";
const MESSAGE_INFO: &[u8] = b"SealedSession-Message";

/// Length of the identity binding: two full public identities.
pub(crate) const BINDING_LENGTH: usize = 2 * IdentityPublicKey::LENGTH;

/// Builds the identity binding authenticated with every message of a session.
///
/// Both halves of each identity are bound, the DH key and the signing key.
pub(crate) fn identity_binding(
    initiator_identity: &IdentityPublicKey,
    responder_identity: &IdentityPublicKey,
) -> [u8; BINDING_LENGTH] {
    let mut ad = [0u8; BINDING_LENGTH];
    ad[..IdentityPublicKey::LENGTH].copy_from_slice(&initiator_identity.to_bytes());
    ad[IdentityPublicKey::LENGTH..].copy_from_slice(&responder_identity.to_bytes());
    ad
}

/// Double Ratchet state machine for one peer device.
///
/// The Double Ratchet algorithm provides forward secrecy (compromise of current keys
/// does not compromise past messages) and break-in recovery (compromise of current
/// keys does not compromise future messages once a DH ratchet step happens).
///
/// It manages:
/// - A root key that is replaced on each DH ratchet step
/// - Separate sending and receiving chain keys for message encryption
/// - A bounded cache of skipped message keys for out-of-order delivery
///
/// [`DoubleRatchet::decrypt`] is atomic: the state only changes when the
/// message authenticates.
#[derive(Clone)]
pub struct DoubleRatchet {
    pub(crate) state: RatchetState,
    pub(crate) skipped_message_keys: SkippedMessageKeys,
    pub(crate) max_skip: u32,
}

impl Zeroize for DoubleRatchet {
    fn zeroize(&mut self) {
        self.state.zeroize();
        self.skipped_message_keys = SkippedMessageKeys::new(self.skipped_message_keys.capacity());
    }
}

impl ZeroizeOnDrop for DoubleRatchet {}

impl DoubleRatchet {
    /// Returns the current local ratchet public key.
    pub fn public_key(&self) -> X25519PublicKey {
        self.state.dh_pair.public_key()
    }

    /// Initializes the ratchet for the session initiator.
    ///
    /// Takes the X3DH secret as root key and immediately performs a sending-side
    /// DH ratchet step against the responder's signed pre-key.
    pub(crate) fn initialize_for_initiator(
        shared_secret: X3DHSharedSecret,
        responder_signed_pre_key: &X25519PublicKey,
        config: &EngineConfig,
        ad: [u8; BINDING_LENGTH],
    ) -> Result<Self, Error> {
        let mut ratchet = Self {
            state: RatchetState {
                ad,
                dh_pair: X25519Secret::generate()?,
                remote_dh_key_public: Some(*responder_signed_pre_key),
                root_key: shared_secret.0,
                sending_chain: None,
                receiving_chain: None,
                previous_sending_chain_length: 0,
            },
            skipped_message_keys: SkippedMessageKeys::new(config.max_cached_skipped_keys),
            max_skip: config.max_skip,
        };
        ratchet.sending_ratchet()?;

        Ok(ratchet)
    }

    /// Initializes the ratchet for the responder.
    ///
    /// The signed pre-key doubles as the responder's first ratchet key pair.
    pub(crate) fn initialize_for_responder(
        shared_secret: X3DHSharedSecret,
        signed_pre_key_pair: X25519Secret,
        config: &EngineConfig,
        ad: [u8; BINDING_LENGTH],
    ) -> Self {
        Self {
            state: RatchetState {
                ad,
                dh_pair: signed_pre_key_pair,
                remote_dh_key_public: None,
                root_key: shared_secret.0,
                sending_chain: None,
                receiving_chain: None,
                previous_sending_chain_length: 0,
            },
            skipped_message_keys: SkippedMessageKeys::new(config.max_cached_skipped_keys),
            max_skip: config.max_skip,
        }
    }

    /// Root-key KDF: mixes a DH output into the root key.
    ///
    /// Returns the new root key and a fresh chain key.
    fn kdf_rk(
        root_key: &SymmetricKey,
        dh_output: SharedSecret,
    ) -> Result<(SymmetricKey, SymmetricKey), Error> {
        let hkdf = Hkdf::<Sha256>::new(Some(root_key.as_bytes()), dh_output.as_bytes());

        let mut output = Zeroizing::new([0u8; 64]);
        hkdf.expand(ROOT_INFO, output.as_mut_slice())?;

        Ok((
            SymmetricKey::try_from(&output[0..32])?,
            SymmetricKey::try_from(&output[32..64])?,
        ))
    }

    /// Derives a new sending chain from the current key pair and remote key.
    fn sending_ratchet(&mut self) -> Result<(), Error> {
        let remote = self
            .state
            .remote_dh_key_public
            .ok_or_else(|| Error::Session("No remote ratchet key to send to".to_string()))?;

        let dh_output = self.state.dh_pair.contributory_dh(&remote)?;
        let (root_key, chain_key) = Self::kdf_rk(&self.state.root_key, dh_output)?;
        self.state.root_key = root_key;
        self.state.sending_chain = Some(Chain::new(chain_key));

        Ok(())
    }

    /// Encrypts a message.
    ///
    /// 1. Derives a sending chain if this is the first send since the last DH step
    /// 2. Takes the next message key from the sending chain
    /// 3. Encrypts the payload, authenticating identities, version and header
    ///
    /// Returns the header and the ciphertext with its trailing tag.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<(MessageHeader, Vec<u8>), Error> {
        self.encrypt_with_preamble(plaintext, None)
    }

    /// Like [`DoubleRatchet::encrypt`], also authenticating the preamble the message travels with.
    pub(crate) fn encrypt_with_preamble(
        &mut self,
        plaintext: &[u8],
        preamble: Option<&X3DHPreamble>,
    ) -> Result<(MessageHeader, Vec<u8>), Error> {
        if self.state.sending_chain.is_none() {
            self.sending_ratchet()?;
            tracing::debug!("derived sending chain after DH ratchet step");
        }

        let previous_chain_length = self.state.previous_sending_chain_length;
        let public_key = self.public_key();
        let chain = self
            .state
            .sending_chain
            .as_mut()
            .ok_or_else(|| Error::Session("No sending chain".to_string()))?;

        let header = MessageHeader {
            ratchet_public: public_key,
            previous_chain_length,
            message_number: chain.index,
        };
        let message_key = chain.next()?;

        let ciphertext = Self::encrypt_message(
            &message_key,
            plaintext,
            &self.associated_data(&header, preamble),
        )?;

        Ok((header, ciphertext))
    }

    /// Decrypts a message.
    ///
    /// Ratchet steps run on a staged copy of the state and newly skipped keys
    /// are collected aside. Both are committed only when the message authenticates.
    pub fn decrypt(&mut self, header: &MessageHeader, ciphertext: &[u8]) -> Result<Vec<u8>, Error> {
        self.decrypt_with_preamble(header, ciphertext, None)
    }

    /// Like [`DoubleRatchet::decrypt`], for a message that carried a preamble.
    pub(crate) fn decrypt_with_preamble(
        &mut self,
        header: &MessageHeader,
        ciphertext: &[u8],
        preamble: Option<&X3DHPreamble>,
    ) -> Result<Vec<u8>, Error> {
        let ad = self.associated_data(header, preamble);

        let skipped_id = (header.ratchet_public.to_bytes(), header.message_number);
        if let Some(message_key) = self.skipped_message_keys.get(&skipped_id) {
            let plaintext = Self::decrypt_message(message_key, ciphertext, &ad)?;
            // Skipped keys are single use and only removed once they authenticated a message
            self.skipped_message_keys.remove(&skipped_id);
            tracing::debug!(
                message_number = header.message_number,
                "decrypted message with skipped key"
            );

            return Ok(plaintext);
        }

        let mut state = self.state.clone();
        let mut skipped = Vec::new();

        if state.remote_dh_key_public != Some(header.ratchet_public) {
            // The last message of the previous chain is previous_chain_length - 1
            Self::skip_message_keys(
                &mut state,
                header.previous_chain_length,
                header.previous_chain_length.saturating_sub(1),
                self.max_skip,
                &mut skipped,
            )?;
            Self::dh_ratchet(&mut state, &header.ratchet_public)?;
        }

        Self::skip_message_keys(
            &mut state,
            header.message_number,
            header.message_number,
            self.max_skip,
            &mut skipped,
        )?;

        let chain = state
            .receiving_chain
            .as_mut()
            .ok_or(Error::DecryptionFailed)?;
        if header.message_number < chain.index {
            // Already consumed, either delivered or evicted from the cache
            return Err(Error::DecryptionFailed);
        }
        let message_key = chain.next()?;
        let plaintext = Self::decrypt_message(&message_key, ciphertext, &ad)?;

        self.state = state;
        if !skipped.is_empty() {
            let count = skipped.len();
            for (id, message_key) in skipped {
                self.skipped_message_keys.insert(id, message_key);
            }
            tracing::debug!(
                skipped = count,
                cached = self.skipped_message_keys.len(),
                "cached skipped message keys"
            );
        }

        Ok(plaintext)
    }

    /// Performs a receiving DH ratchet step towards a new remote key.
    fn dh_ratchet(state: &mut RatchetState, remote: &X25519PublicKey) -> Result<(), Error> {
        if let Some(chain) = &state.sending_chain {
            state.previous_sending_chain_length = chain.index;
        }
        state.remote_dh_key_public = Some(*remote);

        let dh_output = state.dh_pair.contributory_dh(remote)?;
        let (root_key, chain_key) = Self::kdf_rk(&state.root_key, dh_output)?;
        state.root_key = root_key;
        state.receiving_chain = Some(Chain::new(chain_key));

        state.dh_pair = X25519Secret::generate()?;
        state.sending_chain = None;

        tracing::debug!(
            previous_sending_chain_length = state.previous_sending_chain_length,
            "performed DH ratchet step"
        );

        Ok(())
    }

    /// Derives message keys of the receiving chain up to, not including, `until`.
    ///
    /// `last` is the number of the furthest message that will be read from the
    /// chain. It may lie at most `max_skip` past the last processed message.
    fn skip_message_keys(
        state: &mut RatchetState,
        until: u32,
        last: u32,
        max_skip: u32,
        skipped: &mut Vec<(SkippedKeyId, SymmetricKey)>,
    ) -> Result<(), Error> {
        let (Some(chain), Some(remote)) =
            (state.receiving_chain.as_mut(), state.remote_dh_key_public)
        else {
            return Ok(());
        };

        if until <= chain.index {
            return Ok(());
        }

        // Distance from the last processed message, which is chain.index - 1
        let requested = u64::from(last) + 1 - u64::from(chain.index);
        if requested > u64::from(max_skip) {
            return Err(Error::TooManySkippedMessages {
                requested,
                limit: max_skip,
            });
        }

        let remote = remote.to_bytes();
        while chain.index < until {
            let message_number = chain.index;
            let message_key = chain.next()?;
            skipped.push(((remote, message_number), message_key));
        }

        Ok(())
    }

    fn associated_data(&self, header: &MessageHeader, preamble: Option<&X3DHPreamble>) -> Vec<u8> {
        let mut ad = Vec::with_capacity(
            BINDING_LENGTH + 1 + MessageHeader::LENGTH + X3DHPreamble::MAX_LENGTH,
        );
        ad.extend_from_slice(&self.state.ad);
        ad.push(ENVELOPE_VERSION);
        ad.extend_from_slice(&header.to_bytes());
        if let Some(preamble) = preamble {
            ad.extend_from_slice(&preamble.to_bytes());
        }
        ad
    }

    /// Expands a message key into a unique AES key and nonce.
    fn message_cipher(message_key: &SymmetricKey) -> Result<(Aes256GcmSiv, [u8; NONCE_SIZE]), Error> {
        let hkdf = Hkdf::<Sha256>::new(None, message_key.as_bytes());

        let mut derived_material = Zeroizing::new([0u8; 32 + NONCE_SIZE]);
        hkdf.expand(MESSAGE_INFO, derived_material.as_mut_slice())?;

        let cipher = Aes256GcmSiv::new_from_slice(&derived_material[0..32])
            .map_err(|err| Error::Crypto(err.to_string()))?;

        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&derived_material[32..]);

        Ok((cipher, nonce))
    }

    fn encrypt_message(
        message_key: &SymmetricKey,
        plaintext: &[u8],
        ad: &[u8],
    ) -> Result<Vec<u8>, Error> {
        let (cipher, nonce) = Self::message_cipher(message_key)?;

        cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: ad,
                },
            )
            .map_err(|_| Error::Crypto("Message encryption failed".to_string()))
    }

    fn decrypt_message(
        message_key: &SymmetricKey,
        ciphertext: &[u8],
        ad: &[u8],
    ) -> Result<Vec<u8>, Error> {
        let (cipher, nonce) = Self::message_cipher(message_key)?;

        cipher
            .decrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: ciphertext,
                    aad: ad,
                },
            )
            .map_err(|_| Error::DecryptionFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::generate_random_seed;
    use crate::{IdentityKeyPair, SignedPreKey};
    use proptest::prelude::*;

    fn config(max_skip: u32) -> EngineConfig {
        EngineConfig {
            max_skip,
            ..EngineConfig::default()
        }
    }

    fn create_ratchets(max_skip: u32) -> (DoubleRatchet, DoubleRatchet) {
        let bob_spk = SignedPreKey::generate(1).unwrap();

        // For simplicity, let's create a dummy shared secret
        let shared_secret = generate_random_seed().unwrap();
        let ad = identity_binding(
            &IdentityKeyPair::generate().unwrap().public_key(),
            &IdentityKeyPair::generate().unwrap().public_key(),
        );

        let alice_ratchet = DoubleRatchet::initialize_for_initiator(
            X3DHSharedSecret(SymmetricKey::from(shared_secret)),
            &bob_spk.public_key(),
            &config(max_skip),
            ad,
        )
        .unwrap();

        let bob_ratchet = DoubleRatchet::initialize_for_responder(
            X3DHSharedSecret(SymmetricKey::from(shared_secret)),
            bob_spk.key_pair(),
            &config(max_skip),
            ad,
        );

        (alice_ratchet, bob_ratchet)
    }

    #[test]
    fn test_basic_communication() {
        let (mut alice_ratchet, mut bob_ratchet) = create_ratchets(20);

        let alice_message = "Hello, Bob!";
        let (header, ciphertext) = alice_ratchet.encrypt(alice_message.as_bytes()).unwrap();
        let decrypted = bob_ratchet.decrypt(&header, &ciphertext).unwrap();
        assert_eq!(String::from_utf8(decrypted).unwrap(), alice_message);

        let bob_message = "Hello, Alice!";
        let (header, ciphertext) = bob_ratchet.encrypt(bob_message.as_bytes()).unwrap();
        let decrypted_response = alice_ratchet.decrypt(&header, &ciphertext).unwrap();
        assert_eq!(String::from_utf8(decrypted_response).unwrap(), bob_message);
    }

    #[test]
    fn test_responder_cannot_send_first() {
        let (_, mut bob_ratchet) = create_ratchets(20);

        assert!(matches!(
            bob_ratchet.encrypt(b"too early"),
            Err(Error::Session(_))
        ));
    }

    #[test]
    fn test_key_rotation() {
        let (mut alice_ratchet, mut bob_ratchet) = create_ratchets(20);

        let (header, ciphertext) = alice_ratchet.encrypt(b"Hello, Bob!").unwrap();
        bob_ratchet.decrypt(&header, &ciphertext).unwrap();

        let alice_initial_public = alice_ratchet.public_key();

        for i in 0..5 {
            let bob_msg = format!("Message from Bob {i}");
            let (header, ciphertext) = bob_ratchet.encrypt(bob_msg.as_bytes()).unwrap();
            let decrypted = alice_ratchet.decrypt(&header, &ciphertext).unwrap();
            assert_eq!(String::from_utf8(decrypted).unwrap(), bob_msg);

            let alice_msg = format!("Message from Alice {i}");
            let (header, ciphertext) = alice_ratchet.encrypt(alice_msg.as_bytes()).unwrap();
            let decrypted = bob_ratchet.decrypt(&header, &ciphertext).unwrap();
            assert_eq!(String::from_utf8(decrypted).unwrap(), alice_msg);
        }

        assert_ne!(
            alice_initial_public, alice_ratchet.public_key(),
            "DH keys should have rotated during the conversation"
        );
    }

    #[test]
    fn test_forward_secrecy_of_receiving_chain() {
        let (mut alice_ratchet, mut bob_ratchet) = create_ratchets(20);

        let encrypted: Vec<_> = [b"first", b"again"]
            .iter()
            .map(|msg| alice_ratchet.encrypt(msg.as_slice()).unwrap())
            .collect();
        for (header, ciphertext) in &encrypted {
            bob_ratchet.decrypt(header, ciphertext).unwrap();
        }

        // Keys derived from the current chain key never open an already processed message
        let mut chain = bob_ratchet.state.receiving_chain.clone().unwrap();
        assert_eq!(chain.index, 2);
        for _ in 0..16 {
            let key = chain.next().unwrap();
            for (header, ciphertext) in &encrypted {
                let ad = bob_ratchet.associated_data(header, None);
                assert!(DoubleRatchet::decrypt_message(&key, ciphertext, &ad).is_err());
            }
        }

        for (header, ciphertext) in &encrypted {
            assert_eq!(
                bob_ratchet.decrypt(header, ciphertext),
                Err(Error::DecryptionFailed)
            );
        }
    }

    #[test]
    fn test_post_compromise_recovery() {
        let (mut alice_ratchet, mut bob_ratchet) = create_ratchets(20);

        let (h1, c1) = alice_ratchet.encrypt(b"m1").unwrap();
        let (h2, c2) = alice_ratchet.encrypt(b"m2").unwrap();
        bob_ratchet.decrypt(&h1, &c1).unwrap();

        // Attacker snapshots Bob's entire state
        let mut snapshot = bob_ratchet.clone();
        assert_eq!(snapshot.decrypt(&h2, &c2).unwrap(), b"m2");
        bob_ratchet.decrypt(&h2, &c2).unwrap();

        // A full round trip moves both parties to fresh ratchet keys
        let (h3, c3) = bob_ratchet.encrypt(b"m3").unwrap();
        alice_ratchet.decrypt(&h3, &c3).unwrap();
        let (h4, c4) = alice_ratchet.encrypt(b"m4").unwrap();
        bob_ratchet.decrypt(&h4, &c4).unwrap();
        let (h5, c5) = bob_ratchet.encrypt(b"m5").unwrap();
        alice_ratchet.decrypt(&h5, &c5).unwrap();
        let (h6, c6) = alice_ratchet.encrypt(b"m6").unwrap();

        assert_eq!(bob_ratchet.decrypt(&h6, &c6).unwrap(), b"m6");
        assert!(matches!(
            snapshot.decrypt(&h6, &c6),
            Err(Error::DecryptionFailed)
        ));
    }

    #[test]
    fn test_out_of_order_messages() {
        let (mut alice_ratchet, mut bob_ratchet) = create_ratchets(20);

        let messages = ["Message 1", "Message 2", "Message 3"];
        let encrypted: Vec<_> = messages
            .iter()
            .map(|msg| alice_ratchet.encrypt(msg.as_bytes()).unwrap())
            .collect();

        // Delivered as 2, 3, 1
        for index in [1, 2, 0] {
            let (header, ciphertext) = &encrypted[index];
            let decrypted = bob_ratchet.decrypt(header, ciphertext).unwrap();
            assert_eq!(String::from_utf8(decrypted).unwrap(), messages[index]);
        }
        assert_eq!(bob_ratchet.skipped_message_keys.len(), 0);

        // Every message decrypts exactly once
        for (header, ciphertext) in &encrypted {
            assert!(matches!(
                bob_ratchet.decrypt(header, ciphertext),
                Err(Error::DecryptionFailed)
            ));
        }
    }

    #[test]
    fn test_skipped_key_does_not_advance_receiving_chain() {
        let (mut alice_ratchet, mut bob_ratchet) = create_ratchets(20);

        let (h0, c0) = alice_ratchet.encrypt(b"0").unwrap();
        let (h1, c1) = alice_ratchet.encrypt(b"1").unwrap();
        bob_ratchet.decrypt(&h1, &c1).unwrap();

        let index = bob_ratchet.state.receiving_chain.as_ref().unwrap().index;
        bob_ratchet.decrypt(&h0, &c0).unwrap();
        assert_eq!(
            bob_ratchet.state.receiving_chain.as_ref().unwrap().index,
            index
        );
    }

    #[test]
    fn test_messages_from_previous_chain_after_ratchet() {
        let (mut alice_ratchet, mut bob_ratchet) = create_ratchets(20);

        let (h0, c0) = alice_ratchet.encrypt(b"first").unwrap();
        let (h1, c1) = alice_ratchet.encrypt(b"delayed").unwrap();
        bob_ratchet.decrypt(&h0, &c0).unwrap();

        let (h2, c2) = bob_ratchet.encrypt(b"reply").unwrap();
        alice_ratchet.decrypt(&h2, &c2).unwrap();
        let (h3, c3) = alice_ratchet.encrypt(b"new chain").unwrap();
        assert_eq!(h3.previous_chain_length, 2);

        assert_eq!(bob_ratchet.decrypt(&h3, &c3).unwrap(), b"new chain");
        assert_eq!(bob_ratchet.decrypt(&h1, &c1).unwrap(), b"delayed");
    }

    #[test]
    fn test_large_message() {
        let (mut alice_ratchet, mut bob_ratchet) = create_ratchets(20);

        let large_message = vec![b'A'; 100 * 1024];

        let (header, ciphertext) = alice_ratchet.encrypt(&large_message).unwrap();
        let decrypted = bob_ratchet.decrypt(&header, &ciphertext).unwrap();

        assert_eq!(decrypted, large_message);
    }

    #[test]
    fn test_empty_message() {
        let (mut alice_ratchet, mut bob_ratchet) = create_ratchets(20);

        let (header, ciphertext) = alice_ratchet.encrypt(b"").unwrap();
        let decrypted = bob_ratchet.decrypt(&header, &ciphertext).unwrap();

        assert!(decrypted.is_empty());
    }

    #[test]
    fn test_too_many_skipped_messages() {
        let (mut alice_ratchet, mut bob_ratchet) = create_ratchets(2);

        let encrypted: Vec<_> = (0..5)
            .map(|i| alice_ratchet.encrypt(format!("Message {i}").as_bytes()).unwrap())
            .collect();

        bob_ratchet.decrypt(&encrypted[0].0, &encrypted[0].1).unwrap();

        // Message 3 is three past the last processed one, message 0
        let result = bob_ratchet.decrypt(&encrypted[3].0, &encrypted[3].1);
        assert_eq!(
            result,
            Err(Error::TooManySkippedMessages {
                requested: 3,
                limit: 2
            })
        );
        assert_eq!(bob_ratchet.skipped_message_keys.len(), 0);
        assert_eq!(bob_ratchet.state.receiving_chain.as_ref().unwrap().index, 1);

        assert!(bob_ratchet.decrypt(&encrypted[2].0, &encrypted[2].1).is_ok());
        assert_eq!(bob_ratchet.skipped_message_keys.len(), 1);
        assert!(bob_ratchet.decrypt(&encrypted[4].0, &encrypted[4].1).is_ok());
    }

    #[test]
    fn test_skip_bound_on_first_message_of_chain() {
        let (mut alice_ratchet, mut bob_ratchet) = create_ratchets(2);

        let encrypted: Vec<_> = (0..3)
            .map(|i| alice_ratchet.encrypt(&[i]).unwrap())
            .collect();

        // Nothing was processed yet, so message 2 is three past the chain start
        assert_eq!(
            bob_ratchet.decrypt(&encrypted[2].0, &encrypted[2].1),
            Err(Error::TooManySkippedMessages {
                requested: 3,
                limit: 2
            })
        );
        assert_eq!(bob_ratchet.decrypt(&encrypted[1].0, &encrypted[1].1).unwrap(), [1]);
    }

    #[test]
    fn test_skip_bound_when_closing_previous_chain() {
        let (mut alice_ratchet, mut bob_ratchet) = create_ratchets(2);

        let old_chain: Vec<_> = (0..4)
            .map(|i| alice_ratchet.encrypt(&[i]).unwrap())
            .collect();
        bob_ratchet.decrypt(&old_chain[0].0, &old_chain[0].1).unwrap();

        let (h, c) = bob_ratchet.encrypt(b"reply").unwrap();
        alice_ratchet.decrypt(&h, &c).unwrap();
        let (new_header, new_ciphertext) = alice_ratchet.encrypt(b"new chain").unwrap();
        assert_eq!(new_header.previous_chain_length, 4);

        // Closing the old chain would reach message 3, three past message 0
        assert_eq!(
            bob_ratchet.decrypt(&new_header, &new_ciphertext),
            Err(Error::TooManySkippedMessages {
                requested: 3,
                limit: 2
            })
        );
        assert_ne!(bob_ratchet.state.remote_dh_key_public, Some(new_header.ratchet_public));

        assert_eq!(bob_ratchet.decrypt(&old_chain[1].0, &old_chain[1].1).unwrap(), [1]);
        assert_eq!(
            bob_ratchet.decrypt(&new_header, &new_ciphertext).unwrap(),
            b"new chain"
        );
        assert_eq!(bob_ratchet.decrypt(&old_chain[3].0, &old_chain[3].1).unwrap(), [3]);
        assert_eq!(bob_ratchet.decrypt(&old_chain[2].0, &old_chain[2].1).unwrap(), [2]);
    }

    #[test]
    fn test_preamble_is_authenticated() {
        let (mut alice_ratchet, mut bob_ratchet) = create_ratchets(20);
        let preamble = X3DHPreamble {
            registration_id: 7,
            identity: IdentityKeyPair::generate().unwrap().public_key(),
            ephemeral_public: X25519Secret::generate().unwrap().public_key(),
            signed_pre_key_id: 1,
            one_time_pre_key_id: None,
        };

        let (header, ciphertext) = alice_ratchet
            .encrypt_with_preamble(b"first", Some(&preamble))
            .unwrap();

        // Dropping or altering the preamble breaks the tag
        assert_eq!(
            bob_ratchet.decrypt(&header, &ciphertext),
            Err(Error::DecryptionFailed)
        );
        let mut altered = preamble;
        altered.one_time_pre_key_id = Some(3);
        assert_eq!(
            bob_ratchet.decrypt_with_preamble(&header, &ciphertext, Some(&altered)),
            Err(Error::DecryptionFailed)
        );
        assert!(bob_ratchet.state.receiving_chain.is_none());

        assert_eq!(
            bob_ratchet
                .decrypt_with_preamble(&header, &ciphertext, Some(&preamble))
                .unwrap(),
            b"first"
        );
    }

    #[test]
    fn test_tampering_leaves_state_untouched() {
        let (mut alice_ratchet, mut bob_ratchet) = create_ratchets(20);

        let (h0, c0) = alice_ratchet.encrypt(b"zero").unwrap();
        let (h1, c1) = alice_ratchet.encrypt(b"one").unwrap();

        let mut forged_header = h1;
        forged_header.previous_chain_length ^= 1;
        assert_eq!(
            bob_ratchet.decrypt(&forged_header, &c1),
            Err(Error::DecryptionFailed)
        );

        let mut forged_ciphertext = c1.clone();
        forged_ciphertext[0] ^= 0x01;
        assert_eq!(
            bob_ratchet.decrypt(&h1, &forged_ciphertext),
            Err(Error::DecryptionFailed)
        );

        // Nothing was committed by the failed attempts
        assert!(bob_ratchet.state.receiving_chain.is_none());
        assert_eq!(bob_ratchet.skipped_message_keys.len(), 0);

        assert_eq!(bob_ratchet.decrypt(&h0, &c0).unwrap(), b"zero");
        assert_eq!(bob_ratchet.decrypt(&h1, &c1).unwrap(), b"one");
    }

    #[test]
    fn test_failed_skipped_key_decrypt_keeps_key() {
        let (mut alice_ratchet, mut bob_ratchet) = create_ratchets(20);

        let (h0, c0) = alice_ratchet.encrypt(b"zero").unwrap();
        let (h1, c1) = alice_ratchet.encrypt(b"one").unwrap();
        bob_ratchet.decrypt(&h1, &c1).unwrap();
        assert_eq!(bob_ratchet.skipped_message_keys.len(), 1);

        let mut forged = c0.clone();
        forged[0] ^= 0x01;
        assert!(bob_ratchet.decrypt(&h0, &forged).is_err());
        assert_eq!(bob_ratchet.skipped_message_keys.len(), 1);

        assert_eq!(bob_ratchet.decrypt(&h0, &c0).unwrap(), b"zero");
        assert_eq!(bob_ratchet.skipped_message_keys.len(), 0);
    }

    #[test]
    fn test_skipped_key_cache_is_bounded() {
        let (mut alice_ratchet, mut bob_ratchet) = create_ratchets(50);
        bob_ratchet.skipped_message_keys = SkippedMessageKeys::new(10);

        let encrypted: Vec<_> = (0..41)
            .map(|_| alice_ratchet.encrypt(b"burst").unwrap())
            .collect();

        bob_ratchet.decrypt(&encrypted[40].0, &encrypted[40].1).unwrap();
        assert_eq!(bob_ratchet.skipped_message_keys.len(), 10);

        // The oldest keys were evicted, the newest are still usable
        assert!(bob_ratchet.decrypt(&encrypted[0].0, &encrypted[0].1).is_err());
        assert!(bob_ratchet.decrypt(&encrypted[39].0, &encrypted[39].1).is_ok());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_any_delivery_order_decrypts_each_message_once(
            order in Just((0..8usize).collect::<Vec<_>>()).prop_shuffle()
        ) {
            let (mut alice_ratchet, mut bob_ratchet) = create_ratchets(20);
            let encrypted: Vec<_> = (0..8u8)
                .map(|i| alice_ratchet.encrypt(&[i]).unwrap())
                .collect();

            for index in order {
                let (header, ciphertext) = &encrypted[index];
                prop_assert_eq!(bob_ratchet.decrypt(header, ciphertext).unwrap(), vec![index as u8]);
                prop_assert!(bob_ratchet.decrypt(header, ciphertext).is_err());
            }
            prop_assert_eq!(bob_ratchet.skipped_message_keys.len(), 0);
        }
    }
}
