use super::{KeyValueStore, Namespace, SIGNED_PRE_KEYS_NAMESPACE};
use crate::error::{Error, Result};
use crate::keys::{KeyPair, PublicKey};
use crate::xeddsa::SIGNATURE_LENGTH;
use std::sync::Arc;
use tracing::warn;
use zeroize::Zeroize;

/// Medium-term pre-key signed by the identity key.
#[derive(Debug, Clone)]
pub struct SignedPreKeyRecord {
    pub id: u32,
    /// Milliseconds since the Unix epoch
    pub timestamp: u64,
    pub key_pair: KeyPair,
    pub signature: [u8; SIGNATURE_LENGTH],
}

impl SignedPreKeyRecord {
    const SIZE: usize = 4 + 8 + PublicKey::SERIALIZED_SIZE + PublicKey::SIZE + SIGNATURE_LENGTH;

    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut secret = self.key_pair.secret_key().to_bytes();
        let mut bytes = Vec::with_capacity(Self::SIZE);
        bytes.extend_from_slice(&self.id.to_le_bytes());
        bytes.extend_from_slice(&self.timestamp.to_le_bytes());
        bytes.extend_from_slice(&self.key_pair.public_key().serialize());
        bytes.extend_from_slice(&secret);
        bytes.extend_from_slice(&self.signature);
        secret.zeroize();
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != Self::SIZE {
            return Err(Error::Deserialization);
        }
        let (id, rest) = bytes.split_at(4);
        let (timestamp, rest) = rest.split_at(8);
        let (public, rest) = rest.split_at(PublicKey::SERIALIZED_SIZE);
        let (secret, signature) = rest.split_at(PublicKey::SIZE);

        Ok(Self {
            id: u32::from_le_bytes(id.try_into().map_err(|_| Error::Deserialization)?),
            timestamp: u64::from_le_bytes(
                timestamp.try_into().map_err(|_| Error::Deserialization)?,
            ),
            key_pair: KeyPair::from_parts(public, secret)?,
            signature: signature.try_into().map_err(|_| Error::Deserialization)?,
        })
    }
}

/// Signed pre-keys by id.
#[derive(Debug)]
pub struct SignedPreKeyStore {
    namespace: Namespace,
}

impl SignedPreKeyStore {
    pub fn new(backend: Arc<dyn KeyValueStore>) -> Self {
        Self {
            namespace: Namespace::new(backend, SIGNED_PRE_KEYS_NAMESPACE),
        }
    }

    pub fn load(&self, id: u32) -> Option<SignedPreKeyRecord> {
        let bytes = self.namespace.get(&id.to_string())?;
        SignedPreKeyRecord::from_bytes(&bytes)
            .map_err(|err| warn!(id, error = %err, "stored signed pre-key is invalid"))
            .ok()
    }

    pub fn store(&self, record: &SignedPreKeyRecord) -> bool {
        self.namespace.put(&record.id.to_string(), record.to_bytes())
    }

    #[must_use]
    pub fn contains(&self, id: u32) -> bool {
        self.namespace.contains(&id.to_string())
    }

    pub fn remove(&self, id: u32) -> bool {
        self.namespace.remove(&id.to_string())
    }

    #[must_use]
    pub fn ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self
            .namespace
            .entries()
            .keys()
            .filter_map(|key| key.parse().ok())
            .collect();
        ids.sort_unstable();
        ids
    }

    pub(crate) fn clear(&self) -> bool {
        self.namespace.clear()
    }
}
