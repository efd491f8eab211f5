//! Key types with memory safety guarantees and their wire/at-rest encodings.

use crate::{
    crypto::KEY_SIZE_32,
    error::{Error, Result},
    xeddsa,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand_core::CryptoRngCore;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Type byte prefixed to serialized Curve25519 public keys.
pub const DJB_TYPE: u8 = 0x05;

/// X25519 public key (32 bytes)
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PublicKey([u8; KEY_SIZE_32]);

impl PublicKey {
    /// Size in bytes
    pub const SIZE: usize = KEY_SIZE_32;

    /// Size of the type-prefixed encoding
    pub const SERIALIZED_SIZE: usize = KEY_SIZE_32 + 1;

    /// Create from raw bytes
    #[must_use]
    pub fn from_bytes(bytes: [u8; KEY_SIZE_32]) -> Self {
        Self(bytes)
    }

    /// Get raw bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE_32] {
        &self.0
    }

    /// Type-prefixed encoding used on the wire and in signatures.
    #[must_use]
    pub fn serialize(&self) -> [u8; Self::SERIALIZED_SIZE] {
        let mut out = [0u8; Self::SERIALIZED_SIZE];
        out[0] = DJB_TYPE;
        out[1..].copy_from_slice(&self.0);
        out
    }

    /// Decodes either the 33-byte type-prefixed form or 32 raw bytes.
    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        let raw = match bytes {
            [DJB_TYPE, rest @ ..] if rest.len() == KEY_SIZE_32 => rest,
            raw if raw.len() == KEY_SIZE_32 => raw,
            _ => return Err(Error::InvalidPublicKey),
        };
        let key: [u8; KEY_SIZE_32] = raw.try_into().map_err(|_| Error::InvalidPublicKey)?;
        Ok(Self(key))
    }

    /// Base64 of the type-prefixed encoding.
    #[must_use]
    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.serialize())
    }

    /// Parses [`PublicKey::to_base64`] output.
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let bytes = STANDARD
            .decode(encoded)
            .map_err(|_| Error::InvalidPublicKey)?;
        Self::deserialize(&bytes)
    }

    /// Convert to X25519 public key
    pub(crate) fn to_x25519(self) -> X25519PublicKey {
        X25519PublicKey::from(self.0)
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicKey({})", self.to_base64())
    }
}

impl From<&StaticSecret> for PublicKey {
    fn from(secret: &StaticSecret) -> Self {
        Self(*X25519PublicKey::from(secret).as_bytes())
    }
}

impl serde::Serialize for PublicKey {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.0.serialize(serializer)
    }
}

impl<'de> serde::Deserialize<'de> for PublicKey {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        <[u8; KEY_SIZE_32]>::deserialize(deserializer).map(Self)
    }
}

/// X25519 secret key with automatic zeroization
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SecretKey(StaticSecret);

impl SecretKey {
    /// Generate a new random secret key
    pub fn generate<R: CryptoRngCore>(rng: &mut R) -> Self {
        Self(StaticSecret::random_from_rng(rng))
    }

    /// Create from raw bytes
    #[must_use]
    pub fn from_bytes(bytes: [u8; KEY_SIZE_32]) -> Self {
        Self(StaticSecret::from(bytes))
    }

    /// Decodes a 32-byte secret.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let mut raw: [u8; KEY_SIZE_32] = bytes.try_into().map_err(|_| Error::InvalidSecretKey)?;
        let key = Self::from_bytes(raw);
        raw.zeroize();
        Ok(key)
    }

    /// Raw secret bytes. Callers must zeroize the copy.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; KEY_SIZE_32] {
        self.0.to_bytes()
    }

    /// Get the corresponding public key
    #[must_use]
    pub fn public_key(&self) -> PublicKey {
        PublicKey::from(&self.0)
    }

    /// Perform Diffie-Hellman key agreement
    #[must_use]
    pub fn diffie_hellman(&self, public: &PublicKey) -> DhOutput {
        let shared = self.0.diffie_hellman(&public.to_x25519());
        DhOutput(*shared.as_bytes())
    }
}

impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SecretKey([REDACTED])")
    }
}

impl serde::Serialize for SecretKey {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut bytes = self.to_bytes();
        let result = bytes.serialize(serializer);
        bytes.zeroize();
        result
    }
}

impl<'de> serde::Deserialize<'de> for SecretKey {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let mut bytes = <[u8; KEY_SIZE_32]>::deserialize(deserializer)?;
        let key = Self::from_bytes(bytes);
        bytes.zeroize();
        Ok(key)
    }
}

/// Output of Diffie-Hellman operation (32 bytes)
/// Automatically zeroized on drop
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct DhOutput(pub(crate) [u8; KEY_SIZE_32]);

impl DhOutput {
    /// Returns a byte slice of the Diffie-Hellman operation output
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE_32] {
        &self.0
    }
}

impl std::fmt::Debug for DhOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DhOutput([REDACTED])")
    }
}

/// X25519 key pair used for pre-keys and ratchet keys.
#[derive(Clone)]
pub struct KeyPair {
    public: PublicKey,
    secret: SecretKey,
}

impl KeyPair {
    /// Generate a new random key pair
    pub fn generate<R: CryptoRngCore>(rng: &mut R) -> Self {
        Self::from_secret(SecretKey::generate(rng))
    }

    /// Derives the public half from `secret`.
    #[must_use]
    pub fn from_secret(secret: SecretKey) -> Self {
        Self {
            public: secret.public_key(),
            secret,
        }
    }

    /// Rebuilds a key pair from stored halves, rejecting mismatches.
    pub fn from_parts(public: &[u8], secret: &[u8]) -> Result<Self> {
        let public = PublicKey::deserialize(public)?;
        let secret = SecretKey::from_slice(secret)?;
        if secret.public_key() != public {
            return Err(Error::InvalidSecretKey);
        }
        Ok(Self { public, secret })
    }

    #[must_use]
    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    #[must_use]
    pub fn secret_key(&self) -> &SecretKey {
        &self.secret
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public)
            .finish()
    }
}

/// Long-term identity key pair.
///
/// A single X25519 key serves both key agreement and, through XEdDSA,
/// signing of the published signed pre-key.
#[derive(Clone, Debug)]
pub struct IdentityKeyPair(KeyPair);

impl IdentityKeyPair {
    /// Generate a new identity key pair
    pub fn generate<R: CryptoRngCore>(rng: &mut R) -> Self {
        Self(KeyPair::generate(rng))
    }

    /// Rebuilds the pair from its stored public and private halves.
    pub fn from_parts(public: &[u8], secret: &[u8]) -> Result<Self> {
        KeyPair::from_parts(public, secret).map(Self)
    }

    /// Get the public identity key
    #[must_use]
    pub fn public_key(&self) -> &PublicKey {
        self.0.public_key()
    }

    #[must_use]
    pub fn secret_key(&self) -> &SecretKey {
        self.0.secret_key()
    }

    /// Signs `message` with the identity key.
    pub fn sign<R: CryptoRngCore>(
        &self,
        rng: &mut R,
        message: &[u8],
    ) -> [u8; xeddsa::SIGNATURE_LENGTH] {
        xeddsa::sign(rng, self.secret_key(), message)
    }
}
