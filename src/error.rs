/// Errors that can occur while establishing or using a secure session.
///
/// Nothing is retried inside the engine. Each variant documents whether the
/// caller can recover by re-fetching a bundle, resyncing, or simply dropping
/// the offending message.
#[derive(thiserror::Error, Debug, Clone, Eq, PartialEq)]
pub enum Error {
    /// A pre-key bundle's signed pre-key signature did not verify against its
    /// identity key. Fatal for the handshake.
    #[error("Pre-key bundle signature is invalid")]
    InvalidSignature,

    /// A referenced key does not exist (for instance a one-time pre-key that
    /// another initiator already consumed). Recoverable by fetching a new bundle.
    #[error("Key not found: {0}")]
    KeyNotFound(String),

    /// The X3DH handshake could not be completed.
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    /// The message failed authentication or its key is no longer available.
    /// The message is dropped; session state is untouched.
    #[error("Message decryption failed")]
    DecryptionFailed,

    /// The message is further past the last processed one than the skip bound allows.
    #[error("Too many skipped messages: {requested} past the last processed, limit is {limit}")]
    TooManySkippedMessages {
        /// Distance between the message and the last processed one of its chain.
        requested: u64,
        /// Configured skip bound.
        limit: u32,
    },

    /// The wire bytes are not a valid envelope.
    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// An identity already exists and no reset was requested.
    #[error("Identity key already exists")]
    IdentityExists,

    /// No local identity has been generated yet.
    #[error("No local identity key")]
    IdentityMissing,

    /// No session exists for the addressed peer device.
    #[error("No session for {0}")]
    SessionNotFound(String),

    /// Session is in an invalid state for the requested operation.
    #[error("Session state error: {0}")]
    Session(String),

    /// A cryptographic primitive failed.
    #[error("Cryptographic operation failed: {0}")]
    Crypto(String),

    /// Random number generation failed.
    #[error("Random number generation failed")]
    Random,

    /// Serialization or deserialization failed.
    #[error("Serialization/deserialization failed: {0}")]
    Serde(String),

    /// The storage collaborator reported a failure.
    #[error("Storage error: {0}")]
    Storage(String),
}

impl From<hkdf::InvalidLength> for Error {
    fn from(value: hkdf::InvalidLength) -> Self {
        Self::Crypto(value.to_string())
    }
}

impl From<prost::DecodeError> for Error {
    fn from(value: prost::DecodeError) -> Self {
        Self::Serde(value.to_string())
    }
}
