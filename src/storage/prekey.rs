use super::{KeyValueStore, Namespace, PRE_KEYS_NAMESPACE};
use crate::error::{Error, Result};
use crate::keys::{KeyPair, PublicKey};
use std::sync::Arc;
use tracing::warn;
use zeroize::Zeroize;

/// Id of the last-resort pre-key. It is never consumed or rotated.
pub const LAST_RESORT_PRE_KEY_ID: u32 = 0x00FF_FFFF;

/// One-time pre-key.
#[derive(Debug, Clone)]
pub struct PreKeyRecord {
    pub id: u32,
    pub key_pair: KeyPair,
}

impl PreKeyRecord {
    const SIZE: usize = 4 + PublicKey::SERIALIZED_SIZE + PublicKey::SIZE;

    #[must_use]
    pub fn new(id: u32, key_pair: KeyPair) -> Self {
        Self { id, key_pair }
    }

    /// `id (4 LE) || public (33) || secret (32)`
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut secret = self.key_pair.secret_key().to_bytes();
        let mut bytes = Vec::with_capacity(Self::SIZE);
        bytes.extend_from_slice(&self.id.to_le_bytes());
        bytes.extend_from_slice(&self.key_pair.public_key().serialize());
        bytes.extend_from_slice(&secret);
        secret.zeroize();
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != Self::SIZE {
            return Err(Error::Deserialization);
        }
        let id = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let split = 4 + PublicKey::SERIALIZED_SIZE;
        let key_pair = KeyPair::from_parts(&bytes[4..split], &bytes[split..])?;
        Ok(Self { id, key_pair })
    }
}

/// One-time pre-keys by id.
#[derive(Debug)]
pub struct PreKeyStore {
    namespace: Namespace,
}

impl PreKeyStore {
    pub fn new(backend: Arc<dyn KeyValueStore>) -> Self {
        Self {
            namespace: Namespace::new(backend, PRE_KEYS_NAMESPACE),
        }
    }

    pub fn load(&self, id: u32) -> Option<PreKeyRecord> {
        let bytes = self.namespace.get(&id.to_string())?;
        PreKeyRecord::from_bytes(&bytes)
            .map_err(|err| warn!(id, error = %err, "stored pre-key is invalid"))
            .ok()
    }

    pub fn store(&self, record: &PreKeyRecord) -> bool {
        self.namespace.put(&record.id.to_string(), record.to_bytes())
    }

    /// Stores `records` with a single namespace write.
    pub fn store_batch(&self, records: &[PreKeyRecord]) -> bool {
        self.namespace
            .update(|entries| {
                for record in records {
                    entries.insert(record.id.to_string(), record.to_bytes());
                }
            })
            .is_some()
    }

    #[must_use]
    pub fn contains(&self, id: u32) -> bool {
        self.namespace.contains(&id.to_string())
    }

    pub fn remove(&self, id: u32) -> bool {
        self.namespace.remove(&id.to_string())
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.namespace.entries().len()
    }

    /// Stored ids in ascending order.
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
