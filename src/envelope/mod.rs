mod header;
pub use header::MessageHeader;
mod preamble;
pub use preamble::X3DHPreamble;

use crate::types::X25519PublicKey;
use crate::{Error, IdentityPublicKey};

/// Wire version produced by this crate.
pub const ENVELOPE_VERSION: u8 = 1;

/// Length of the AEAD authentication tag.
pub const AUTH_TAG_LENGTH: usize = 16;

const FLAG_PREAMBLE: u8 = 0x01;

/// The wire unit exchanged between two devices.
///
/// Encoding:
/// - 1 byte: version
/// - 1 byte: flags (bit 0 set when a preamble follows)
/// - preamble, if flagged: registration id (u32), identity (64 bytes),
///   ephemeral key (32 bytes), signed pre-key id (u32), one-time pre-key
///   marker (u8, 0 or 1) followed by its id (u32) when the marker is 1
/// - 40 bytes: [`MessageHeader`]
/// - 4 bytes: ciphertext length (u32), then the ciphertext
/// - 16 bytes: authentication tag
///
/// All integers are big-endian.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageEnvelope {
    /// Protocol version the envelope was produced with.
    pub version: u8,
    /// X3DH preamble of a session that is not yet confirmed.
    pub preamble: Option<X3DHPreamble>,
    /// Ratchet header.
    pub header: MessageHeader,
    /// Encrypted payload without the tag.
    pub ciphertext: Vec<u8>,
    /// AEAD tag over payload and associated data.
    pub auth_tag: [u8; AUTH_TAG_LENGTH],
}

impl MessageEnvelope {
    /// Builds an envelope from the AEAD output, which ends with the tag.
    pub(crate) fn from_sealed(
        preamble: Option<X3DHPreamble>,
        header: MessageHeader,
        mut sealed: Vec<u8>,
    ) -> Result<Self, Error> {
        let split = sealed
            .len()
            .checked_sub(AUTH_TAG_LENGTH)
            .ok_or_else(|| Error::Crypto("AEAD output shorter than its tag".to_string()))?;

        let mut auth_tag = [0u8; AUTH_TAG_LENGTH];
        auth_tag.copy_from_slice(&sealed[split..]);
        sealed.truncate(split);

        Ok(Self {
            version: ENVELOPE_VERSION,
            preamble,
            header,
            ciphertext: sealed,
            auth_tag,
        })
    }

    /// Ciphertext followed by its tag, as the AEAD expects it.
    pub(crate) fn sealed(&self) -> Vec<u8> {
        let mut sealed = Vec::with_capacity(self.ciphertext.len() + AUTH_TAG_LENGTH);
        sealed.extend_from_slice(&self.ciphertext);
        sealed.extend_from_slice(&self.auth_tag);
        sealed
    }

    /// Serializes the envelope for transmission.
    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        let ciphertext_length = u32::try_from(self.ciphertext.len())
            .map_err(|_| Error::MalformedEnvelope("Ciphertext too long".to_string()))?;

        let mut bytes = Vec::with_capacity(
            2 + X3DHPreamble::MAX_LENGTH
                + MessageHeader::LENGTH
                + 4
                + self.ciphertext.len()
                + AUTH_TAG_LENGTH,
        );
        bytes.push(self.version);

        match &self.preamble {
            Some(preamble) => {
                bytes.push(FLAG_PREAMBLE);
                bytes.extend_from_slice(&preamble.to_bytes());
            }
            None => bytes.push(0),
        }

        bytes.extend_from_slice(&self.header.to_bytes());
        bytes.extend_from_slice(&ciphertext_length.to_be_bytes());
        bytes.extend_from_slice(&self.ciphertext);
        bytes.extend_from_slice(&self.auth_tag);

        Ok(bytes)
    }

    /// Parses an envelope. Rejects unknown versions and flags, truncation and trailing bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        let mut reader = Reader { bytes };

        let version = reader.u8()?;
        if version != ENVELOPE_VERSION {
            return Err(Error::MalformedEnvelope(format!(
                "Unsupported version {version}"
            )));
        }

        let flags = reader.u8()?;
        if flags & !FLAG_PREAMBLE != 0 {
            return Err(Error::MalformedEnvelope(format!("Unknown flags {flags:#04x}")));
        }

        let preamble = if flags & FLAG_PREAMBLE != 0 {
            Some(read_preamble(&mut reader)?)
        } else {
            None
        };

        let header = MessageHeader::from(reader.array::<40>()?);

        let ciphertext_length = usize::try_from(reader.u32()?)
            .map_err(|_| Error::MalformedEnvelope("Ciphertext too long".to_string()))?;
        let ciphertext = reader.take(ciphertext_length)?.to_vec();
        let auth_tag = reader.array::<AUTH_TAG_LENGTH>()?;

        reader.finish()?;

        Ok(Self {
            version,
            preamble,
            header,
            ciphertext,
            auth_tag,
        })
    }
}

fn read_preamble(reader: &mut Reader<'_>) -> Result<X3DHPreamble, Error> {
    let registration_id = reader.u32()?;
    let identity = IdentityPublicKey::try_from(reader.take(IdentityPublicKey::LENGTH)?)
        .map_err(|_| Error::MalformedEnvelope("Invalid identity key".to_string()))?;
    let ephemeral_public = X25519PublicKey::from(reader.array::<32>()?);
    let signed_pre_key_id = reader.u32()?;
    let one_time_pre_key_id = match reader.u8()? {
        0 => None,
        1 => Some(reader.u32()?),
        marker => {
            return Err(Error::MalformedEnvelope(format!(
                "Invalid one-time pre-key marker {marker}"
            )));
        }
    };

    Ok(X3DHPreamble {
        registration_id,
        identity,
        ephemeral_public,
        signed_pre_key_id,
        one_time_pre_key_id,
    })
}

struct Reader<'a> {
    bytes: &'a [u8],
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8], Error> {
        if self.bytes.len() < len {
            return Err(Error::MalformedEnvelope("Truncated envelope".to_string()));
        }
        let (head, tail) = self.bytes.split_at(len);
        self.bytes = tail;
        Ok(head)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], Error> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, Error> {
        Ok(self.array::<1>()?[0])
    }

    fn u32(&mut self) -> Result<u32, Error> {
        Ok(u32::from_be_bytes(self.array::<4>()?))
    }

    fn finish(self) -> Result<(), Error> {
        if self.bytes.is_empty() {
            Ok(())
        } else {
            Err(Error::MalformedEnvelope(format!(
                "{} trailing bytes",
                self.bytes.len()
            )))
        }
    }
}
