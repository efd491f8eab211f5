//! Error types for session, key-store and transport operations.

use crate::transport::TransportError;
use thiserror::Error;

/// Result type alias for session operations
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of an [`Error`], stable across variants.
///
/// This is what callers branch on: transport failures are retryable,
/// crypto failures need new key material, duplicates are absorbed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Bad local state or arguments
    ConfigurationInvalid,
    /// Network failure or a non-2xx server answer
    TransportFailure,
    /// The contact has no published keys (404 on bundle fetch)
    ContactNotFound,
    /// Malformed ciphertext, bad signature, failed key agreement
    CryptoFailure,
    /// The message was already processed
    DuplicateMessage,
    /// The remote identity does not match the pinned one
    UntrustedIdentity,
}

impl ErrorKind {
    /// Reject code understood by the bridge layer.
    #[must_use]
    pub fn reject_code(self) -> &'static str {
        match self {
            Self::ConfigurationInvalid => "ERR_WRONG_CONFIG",
            Self::TransportFailure => "ERR_SERVER_FAILED",
            Self::ContactNotFound => "ERR_ADD_CONTACT_FAILED",
            Self::CryptoFailure | Self::DuplicateMessage | Self::UntrustedIdentity => {
                "ERR_NATIVE_FAILED"
            }
        }
    }
}

/// Errors that can occur during protocol operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Invalid signature detected
    #[error("invalid signature")]
    InvalidSignature,

    /// Invalid public key encoding
    #[error("invalid public key")]
    InvalidPublicKey,

    /// Invalid secret key encoding
    #[error("invalid secret key")]
    InvalidSecretKey,

    /// Referenced one-time pre-key is not (or no longer) available
    #[error("no pre-key with id {0}")]
    InvalidPreKeyId(u32),

    /// Referenced signed pre-key is not available
    #[error("no signed pre-key with id {0}")]
    InvalidSignedPreKeyId(u32),

    /// Wire message could not be decoded
    #[error("invalid message: {0}")]
    InvalidMessage(&'static str),

    /// Wire message carries an unknown version byte
    #[error("unsupported message version {0:#04x}")]
    UnsupportedVersion(u8),

    /// AEAD authentication failed
    #[error("decryption failed")]
    DecryptionFailed,

    /// Skipped too many messages in chain
    #[error("too many skipped messages")]
    TooManySkippedMessages,

    /// Message key was already used
    #[error("message already processed")]
    DuplicateMessage,

    /// Remote identity differs from the pinned one
    #[error("untrusted identity for {0}")]
    UntrustedIdentity(String),

    /// No session stored for the address
    #[error("no session for {0}")]
    NoSession(String),

    /// Session exists but cannot send yet
    #[error("session has no sending chain")]
    NoSendingChain,

    /// Local identity keypair has not been created
    #[error("local identity key pair is missing")]
    MissingLocalIdentity,

    /// Local device has not registered
    #[error("local device is not registered")]
    NotRegistered,

    /// Configuration or argument rejected
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Persisting protocol state failed
    #[error("storage error: {0}")]
    Storage(String),

    /// Serialization failed
    #[error("serialization error")]
    Serialization,

    /// Deserialization failed
    #[error("deserialization error")]
    Deserialization,

    /// Server answered with a malformed body
    #[error("server returned invalid data: {0}")]
    ServerDataInvalid(String),

    /// Bundle fetch returned 404
    #[error("contact {0} not found")]
    ContactNotFound(String),

    /// Recipient devices still stale after one refetch
    #[error("devices of {0} are still stale after refetching keys")]
    StaleDevices(String),

    /// Collaborator call failed
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl Error {
    /// Classifies the error for callers.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::MissingLocalIdentity
            | Self::NotRegistered
            | Self::InvalidConfiguration(_)
            | Self::Storage(_)
            | Self::Serialization
            | Self::Deserialization => ErrorKind::ConfigurationInvalid,
            Self::ServerDataInvalid(_) | Self::StaleDevices(_) | Self::Transport(_) => {
                ErrorKind::TransportFailure
            }
            Self::ContactNotFound(_) => ErrorKind::ContactNotFound,
            Self::DuplicateMessage => ErrorKind::DuplicateMessage,
            Self::UntrustedIdentity(_) => ErrorKind::UntrustedIdentity,
            Self::InvalidSignature
            | Self::InvalidPublicKey
            | Self::InvalidSecretKey
            | Self::InvalidPreKeyId(_)
            | Self::InvalidSignedPreKeyId(_)
            | Self::InvalidMessage(_)
            | Self::UnsupportedVersion(_)
            | Self::DecryptionFailed
            | Self::TooManySkippedMessages
            | Self::NoSession(_)
            | Self::NoSendingChain => ErrorKind::CryptoFailure,
        }
    }
}

impl From<bincode::error::EncodeError> for Error {
    fn from(_: bincode::error::EncodeError) -> Self {
        Error::Serialization
    }
}

impl From<bincode::error::DecodeError> for Error {
    fn from(_: bincode::error::DecodeError) -> Self {
        Error::Deserialization
    }
}
