//! Local identity, registration data and remote identity trust records.

use super::{KeyValueStore, Namespace, IDENTITIES_NAMESPACE, USER_NAMESPACE};
use crate::address::ProtocolAddress;
use crate::keys::{IdentityKeyPair, PublicKey};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::warn;
use zeroize::Zeroize;

const REGISTRATION_ID: &str = "registrationId";
const IDENTITY_PUBLIC: &str = "identityKeyPairPublicKey";
const IDENTITY_PRIVATE: &str = "identityKeyPairPrivateKey";
const USERNAME: &str = "username";
const SIGNALING_KEY: &str = "signalingKey";
const LAST_PRE_KEY_ID: &str = "lastPreKeyId";

/// How remote identity keys are trusted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustPolicy {
    /// The first identity seen for an address is pinned; any other is rejected
    #[default]
    TrustOnFirstUse,
    /// Every identity is accepted
    AlwaysTrust,
}

/// Local account data created at registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationRecord {
    pub registration_id: u32,
    pub username: String,
    pub signaling_key: Option<String>,
}

/// Local identity and pinned remote identities.
#[derive(Debug)]
pub struct IdentityKeyStore {
    user: Namespace,
    identities: Namespace,
    policy: TrustPolicy,
}

impl IdentityKeyStore {
    pub fn new(backend: Arc<dyn KeyValueStore>, policy: TrustPolicy) -> Self {
        Self {
            user: Namespace::new(Arc::clone(&backend), USER_NAMESPACE),
            identities: Namespace::new(backend, IDENTITIES_NAMESPACE),
            policy,
        }
    }

    #[must_use]
    pub fn policy(&self) -> TrustPolicy {
        self.policy
    }

    pub fn identity_key_pair(&self) -> Option<IdentityKeyPair> {
        let entries = self.user.entries();
        let public = entries.get(IDENTITY_PUBLIC)?;
        let private = entries.get(IDENTITY_PRIVATE)?;
        IdentityKeyPair::from_parts(public, private)
            .map_err(|err| warn!(error = %err, "stored identity key pair is invalid"))
            .ok()
    }

    pub fn store_identity_key_pair(&self, identity: &IdentityKeyPair) -> bool {
        let mut secret = identity.secret_key().to_bytes();
        let stored = self
            .user
            .update(|entries| {
                entries.insert(
                    IDENTITY_PUBLIC.to_owned(),
                    identity.public_key().serialize().to_vec(),
                );
                entries.insert(IDENTITY_PRIVATE.to_owned(), secret.to_vec());
            })
            .is_some();
        secret.zeroize();
        stored
    }

    pub fn local_registration_id(&self) -> Option<u32> {
        self.user.get(REGISTRATION_ID).and_then(|bytes| decode_u32(&bytes))
    }

    #[must_use]
    pub fn is_local_registered(&self) -> bool {
        self.local_registration_id().is_some()
    }

    pub fn registration(&self) -> Option<RegistrationRecord> {
        let entries = self.user.entries();
        let registration_id = entries.get(REGISTRATION_ID).and_then(|b| decode_u32(b))?;
        let username = entries
            .get(USERNAME)
            .and_then(|bytes| String::from_utf8(bytes.clone()).ok())?;
        let signaling_key = entries
            .get(SIGNALING_KEY)
            .and_then(|bytes| String::from_utf8(bytes.clone()).ok());

        Some(RegistrationRecord {
            registration_id,
            username,
            signaling_key,
        })
    }

    pub fn store_registration(&self, record: &RegistrationRecord) -> bool {
        self.user
            .update(|entries| {
                entries.insert(
                    REGISTRATION_ID.to_owned(),
                    record.registration_id.to_le_bytes().to_vec(),
                );
                entries.insert(USERNAME.to_owned(), record.username.as_bytes().to_vec());
                match &record.signaling_key {
                    Some(key) => entries.insert(SIGNALING_KEY.to_owned(), key.as_bytes().to_vec()),
                    None => entries.remove(SIGNALING_KEY),
                };
            })
            .is_some()
    }

    pub fn store_signaling_key(&self, signaling_key: &str) -> bool {
        self.user
            .put(SIGNALING_KEY, signaling_key.as_bytes().to_vec())
    }

    /// Highest one-time pre-key id issued so far.
    pub fn last_pre_key_id(&self) -> Option<u32> {
        self.user.get(LAST_PRE_KEY_ID).and_then(|bytes| decode_u32(&bytes))
    }

    pub fn store_last_pre_key_id(&self, id: u32) -> bool {
        self.user.put(LAST_PRE_KEY_ID, id.to_le_bytes().to_vec())
    }

    /// Pinned identity of `address`.
    pub fn identity(&self, address: &ProtocolAddress) -> Option<PublicKey> {
        let bytes = self.identities.get(&address.to_string())?;
        PublicKey::deserialize(&bytes)
            .map_err(|err| warn!(%address, error = %err, "stored identity is invalid"))
            .ok()
    }

    pub fn save_identity(&self, address: &ProtocolAddress, identity: &PublicKey) -> bool {
        self.identities
            .put(&address.to_string(), identity.serialize().to_vec())
    }

    pub fn remove_identity(&self, address: &ProtocolAddress) -> bool {
        self.identities.remove(&address.to_string())
    }

    /// Whether `identity` may be used for `address`.
    ///
    /// Under trust-on-first-use an address without a pinned identity is
    /// trusted; the caller pins the identity once the exchange succeeds.
    pub fn is_trusted(&self, address: &ProtocolAddress, identity: &PublicKey) -> bool {
        match self.policy {
            TrustPolicy::AlwaysTrust => true,
            TrustPolicy::TrustOnFirstUse => self.identity(address).map_or(true, |pinned| {
                bool::from(pinned.as_bytes().ct_eq(identity.as_bytes()))
            }),
        }
    }

    pub(crate) fn clear(&self) -> bool {
        let user = self.user.clear();
        let identities = self.identities.clear();
        user && identities
    }
}

fn decode_u32(bytes: &[u8]) -> Option<u32> {
    bytes.try_into().ok().map(u32::from_le_bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::SecretKey;
    use crate::storage::InMemoryKeyValueStore;
    use rand_core::OsRng;

    fn store(policy: TrustPolicy) -> IdentityKeyStore {
        IdentityKeyStore::new(Arc::new(InMemoryKeyValueStore::new()), policy)
    }

    #[test]
    fn test_trust_on_first_use() {
        let store = store(TrustPolicy::TrustOnFirstUse);
        let alice = ProtocolAddress::primary("alice");
        let x = SecretKey::generate(&mut OsRng).public_key();
        let y = SecretKey::generate(&mut OsRng).public_key();

        assert!(store.is_trusted(&alice, &x));
        assert!(store.save_identity(&alice, &x));
        assert!(store.is_trusted(&alice, &x));
        assert!(!store.is_trusted(&alice, &y));

        assert!(store.remove_identity(&alice));
        assert!(store.is_trusted(&alice, &y));
    }

    #[test]
    fn test_always_trust() {
        let store = store(TrustPolicy::AlwaysTrust);
        let alice = ProtocolAddress::primary("alice");
        store.save_identity(&alice, &SecretKey::generate(&mut OsRng).public_key());

        assert!(store.is_trusted(&alice, &SecretKey::generate(&mut OsRng).public_key()));
    }

    #[test]
    fn test_identity_key_pair_persists() {
        let store = store(TrustPolicy::default());
        assert!(store.identity_key_pair().is_none());

        let identity = IdentityKeyPair::generate(&mut OsRng);
        assert!(store.store_identity_key_pair(&identity));

        assert_eq!(
            store.identity_key_pair().unwrap().public_key(),
            identity.public_key()
        );
    }

    #[test]
    fn test_registration_and_signaling_key_backfill() {
        let store = store(TrustPolicy::default());
        assert!(!store.is_local_registered());

        store.store_registration(&RegistrationRecord {
            registration_id: 1234,
            username: "alice".into(),
            signaling_key: None,
        });
        assert_eq!(store.local_registration_id(), Some(1234));
        assert_eq!(store.registration().unwrap().signaling_key, None);

        store.store_signaling_key("c2lnbmFs");
        assert_eq!(
            store.registration().unwrap().signaling_key.as_deref(),
            Some("c2lnbmFs")
        );
    }

    #[test]
    fn test_clear_forgets_everything() {
        let store = store(TrustPolicy::default());
        store.store_last_pre_key_id(100);
        store.save_identity(
            &ProtocolAddress::primary("bob"),
            &SecretKey::generate(&mut OsRng).public_key(),
        );

        assert!(store.clear());
        assert_eq!(store.last_pre_key_id(), None);
        assert_eq!(store.identity(&ProtocolAddress::primary("bob")), None);
    }
}
