//! Wire formats of ratchet messages.
//!
//! ```text
//! SignalMessage       = version(1) || header(40) || ciphertext
//! header              = ratchet_key(32) || previous_chain_length(4 LE) || counter(4 LE)
//! PreKeySignalMessage = version(1) || registration_id(4 LE) || has_pre_key(1)
//!                       || pre_key_id(4 LE) || signed_pre_key_id(4 LE)
//!                       || base_key(32) || identity_key(32) || SignalMessage
//! ```

use crate::crypto::TAG_SIZE;
use crate::error::{Error, Result};
use crate::keys::PublicKey;
use serde::{Deserialize, Serialize};

/// Message version produced by this crate.
pub const CURRENT_VERSION: u8 = 3;

const VERSION_BYTE: u8 = (CURRENT_VERSION << 4) | CURRENT_VERSION;

/// Type tag carried next to a ciphertext.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CiphertextType {
    /// Regular ratchet message
    Signal = 2,
    /// First messages of a session, carrying X3DH material
    PreKey = 3,
}

/// Ratchet header, authenticated but not encrypted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    /// Sender's current ratchet public key
    pub dh_public: PublicKey,

    /// Number of messages in the sender's previous sending chain
    pub previous_chain_length: u32,

    /// Index of this message in the current sending chain
    pub message_number: u32,
}

impl Header {
    pub const SIZE: usize = PublicKey::SIZE + 8;

    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[..32].copy_from_slice(self.dh_public.as_bytes());
        bytes[32..36].copy_from_slice(&self.previous_chain_length.to_le_bytes());
        bytes[36..].copy_from_slice(&self.message_number.to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != Self::SIZE {
            return Err(Error::InvalidMessage("header length"));
        }
        Ok(Self {
            dh_public: PublicKey::deserialize(&bytes[..32])?,
            previous_chain_length: read_u32(&bytes[32..36])?,
            message_number: read_u32(&bytes[36..40])?,
        })
    }
}

/// Encrypted ratchet message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalMessage {
    pub header: Header,
    pub ciphertext: Vec<u8>,
}

impl SignalMessage {
    const MIN_SIZE: usize = 1 + Header::SIZE + TAG_SIZE;

    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(1 + Header::SIZE + self.ciphertext.len());
        bytes.push(VERSION_BYTE);
        bytes.extend_from_slice(&self.header.to_bytes());
        bytes.extend_from_slice(&self.ciphertext);
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::MIN_SIZE {
            return Err(Error::InvalidMessage("signal message too short"));
        }
        check_version(bytes[0])?;
        let header = Header::from_bytes(&bytes[1..=Header::SIZE])?;
        Ok(Self {
            header,
            ciphertext: bytes[1 + Header::SIZE..].to_vec(),
        })
    }
}

/// Ratchet message prefixed with the sender's X3DH material.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreKeySignalMessage {
    pub registration_id: u32,
    pub pre_key_id: Option<u32>,
    pub signed_pre_key_id: u32,
    pub base_key: PublicKey,
    pub identity_key: PublicKey,
    pub message: SignalMessage,
}

impl PreKeySignalMessage {
    const PREFIX_SIZE: usize = 1 + 4 + 1 + 4 + 4 + PublicKey::SIZE * 2;

    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let inner = self.message.to_bytes();
        let mut bytes = Vec::with_capacity(Self::PREFIX_SIZE + inner.len());
        bytes.push(VERSION_BYTE);
        bytes.extend_from_slice(&self.registration_id.to_le_bytes());
        bytes.push(u8::from(self.pre_key_id.is_some()));
        bytes.extend_from_slice(&self.pre_key_id.unwrap_or_default().to_le_bytes());
        bytes.extend_from_slice(&self.signed_pre_key_id.to_le_bytes());
        bytes.extend_from_slice(self.base_key.as_bytes());
        bytes.extend_from_slice(self.identity_key.as_bytes());
        bytes.extend_from_slice(&inner);
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::PREFIX_SIZE + SignalMessage::MIN_SIZE {
            return Err(Error::InvalidMessage("pre-key message too short"));
        }
        check_version(bytes[0])?;

        let registration_id = read_u32(&bytes[1..5])?;
        let pre_key_id = match bytes[5] {
            0 => None,
            1 => Some(read_u32(&bytes[6..10])?),
            _ => return Err(Error::InvalidMessage("pre-key flag")),
        };
        let signed_pre_key_id = read_u32(&bytes[10..14])?;
        let base_key = PublicKey::deserialize(&bytes[14..46])?;
        let identity_key = PublicKey::deserialize(&bytes[46..78])?;
        let message = SignalMessage::from_bytes(&bytes[Self::PREFIX_SIZE..])?;

        Ok(Self {
            registration_id,
            pre_key_id,
            signed_pre_key_id,
            base_key,
            identity_key,
            message,
        })
    }
}

/// Output of an encrypt call, tagged with its type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CiphertextMessage {
    Signal(SignalMessage),
    PreKey(PreKeySignalMessage),
}

impl CiphertextMessage {
    #[must_use]
    pub fn message_type(&self) -> CiphertextType {
        match self {
            Self::Signal(_) => CiphertextType::Signal,
            Self::PreKey(_) => CiphertextType::PreKey,
        }
    }

    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Self::Signal(message) => message.to_bytes(),
            Self::PreKey(message) => message.to_bytes(),
        }
    }
}

fn check_version(byte: u8) -> Result<()> {
    if byte >> 4 == CURRENT_VERSION {
        Ok(())
    } else {
        Err(Error::UnsupportedVersion(byte))
    }
}

fn read_u32(bytes: &[u8]) -> Result<u32> {
    bytes
        .try_into()
        .map(u32::from_le_bytes)
        .map_err(|_| Error::InvalidMessage("integer field"))
}
