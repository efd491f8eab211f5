//! Account registration and pre-key pool management.

use crate::config::PreKeyConfig;
use crate::error::{Error, Result};
use crate::keys::{IdentityKeyPair, KeyPair};
use crate::storage::{
    PreKeyRecord, ProtocolStore, RegistrationRecord, SignedPreKeyRecord, LAST_RESORT_PRE_KEY_ID,
};
use crate::transport::{
    AccountAttributes, KeyExchangeTransport, KeysUpload, PreKeyEntity, SignedPreKeyEntity,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand::Rng;
use rand_core::CryptoRngCore;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

/// Id of the single active signed pre-key.
pub const SIGNED_PRE_KEY_ID: u32 = 1;

const MAX_REGISTRATION_ID: u32 = 16380;
const SIGNALING_KEY_LENGTH: usize = 52;

/// Registration ids are drawn from `1..=16380`.
pub fn generate_registration_id<R: CryptoRngCore>(rng: &mut R) -> u32 {
    rng.gen_range(1..=MAX_REGISTRATION_ID)
}

/// `count` pre-keys with ids following `start`.
///
/// Ids wrap around before reaching the last-resort id, so the sequence
/// continues at 1 after `0xFFFFFE`.
pub fn generate_pre_keys<R: CryptoRngCore>(
    rng: &mut R,
    start: u32,
    count: u32,
) -> Vec<PreKeyRecord> {
    let modulus = u64::from(LAST_RESORT_PRE_KEY_ID - 1);
    (0..count)
        .map(|offset| {
            let id = (u64::from(start) + u64::from(offset)) % modulus + 1;
            // id < LAST_RESORT_PRE_KEY_ID by construction
            let id = u32::try_from(id).unwrap_or(1);
            PreKeyRecord::new(id, KeyPair::generate(rng))
        })
        .collect()
}

pub fn generate_last_resort_pre_key<R: CryptoRngCore>(rng: &mut R) -> PreKeyRecord {
    PreKeyRecord::new(LAST_RESORT_PRE_KEY_ID, KeyPair::generate(rng))
}

/// A fresh signed pre-key, signed by `identity`.
pub fn generate_signed_pre_key<R: CryptoRngCore>(
    rng: &mut R,
    identity: &IdentityKeyPair,
    id: u32,
) -> SignedPreKeyRecord {
    let key_pair = KeyPair::generate(rng);
    let signature = identity.sign(rng, &key_pair.public_key().serialize());
    SignedPreKeyRecord {
        id,
        timestamp: now_millis(),
        key_pair,
        signature,
    }
}

/// 52 random bytes, base64.
pub fn generate_signaling_key<R: CryptoRngCore>(rng: &mut R) -> String {
    let mut bytes = [0u8; SIGNALING_KEY_LENGTH];
    rng.fill_bytes(&mut bytes);
    STANDARD.encode(bytes)
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or_default()
}

/// What [`RegistrationManager::register`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationOutcome {
    Registered { registration_id: u32 },
    AlreadyRegistered,
    /// An older registration lacked a signaling key; one was added
    SignalingKeyBackfilled,
}

/// One-time pre-keys published by [`RegistrationManager::check_pre_keys`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreKeyRefill {
    pub first_id: u32,
    pub count: u32,
}

/// Creates the local account and keeps the server's pre-key pool filled.
pub struct RegistrationManager<'a> {
    store: &'a ProtocolStore,
    transport: &'a dyn KeyExchangeTransport,
    pre_keys: PreKeyConfig,
}

impl<'a> RegistrationManager<'a> {
    #[must_use]
    pub fn new(
        store: &'a ProtocolStore,
        transport: &'a dyn KeyExchangeTransport,
        pre_keys: PreKeyConfig,
    ) -> Self {
        Self {
            store,
            transport,
            pre_keys,
        }
    }

    /// Returns the local identity, generating and storing one if absent.
    pub fn create_identity<R: CryptoRngCore>(&self, rng: &mut R) -> Result<IdentityKeyPair> {
        if let Some(identity) = self.store.identity.identity_key_pair() {
            return Ok(identity);
        }
        let identity = IdentityKeyPair::generate(rng);
        if !self.store.identity.store_identity_key_pair(&identity) {
            return Err(Error::Storage("identity key pair".into()));
        }
        debug!("generated identity key pair");
        Ok(identity)
    }

    /// Registers `username` with the server.
    ///
    /// Registering again is a no-op, except that a missing signaling key is
    /// generated and published. A fresh registration wipes stale protocol
    /// state but keeps an identity created beforehand. The registration id
    /// is only stored once attributes and keys are published, so a failed
    /// attempt can simply be repeated.
    pub async fn register<R: CryptoRngCore>(
        &self,
        rng: &mut R,
        username: &str,
    ) -> Result<RegistrationOutcome> {
        if let Some(registration_id) = self.store.identity.local_registration_id() {
            let existing = self.store.identity.registration();
            if existing
                .as_ref()
                .is_some_and(|record| record.signaling_key.is_some())
            {
                return Ok(RegistrationOutcome::AlreadyRegistered);
            }

            let name = existing.map_or_else(|| username.to_owned(), |record| record.username);
            let signaling_key = generate_signaling_key(rng);
            self.transport
                .publish_account_attributes(&AccountAttributes::new(
                    &name,
                    registration_id,
                    &signaling_key,
                ))
                .await?;
            let stored = self.store.identity.store_registration(&RegistrationRecord {
                registration_id,
                username: name,
                signaling_key: Some(signaling_key),
            });
            if !stored {
                return Err(Error::Storage("signaling key".into()));
            }
            info!(registration_id, "signaling key backfilled");
            return Ok(RegistrationOutcome::SignalingKeyBackfilled);
        }

        let kept_identity = self.store.identity.identity_key_pair();
        self.store.destroy();
        match kept_identity {
            Some(identity) => {
                if !self.store.identity.store_identity_key_pair(&identity) {
                    return Err(Error::Storage("identity key pair".into()));
                }
            }
            None => {
                self.create_identity(rng)?;
            }
        }

        let registration_id = generate_registration_id(rng);
        let signaling_key = generate_signaling_key(rng);
        self.transport
            .publish_account_attributes(&AccountAttributes::new(
                username,
                registration_id,
                &signaling_key,
            ))
            .await?;

        self.register_pre_keys(rng, 0, self.pre_keys.batch_size)
            .await?;

        let stored = self.store.identity.store_registration(&RegistrationRecord {
            registration_id,
            username: username.to_owned(),
            signaling_key: Some(signaling_key),
        });
        if !stored {
            return Err(Error::Storage("registration".into()));
        }

        info!(username, registration_id, "registered");
        Ok(RegistrationOutcome::Registered { registration_id })
    }

    /// Generates `count` pre-keys after id `start` and publishes them with
    /// the signed and last-resort pre-keys.
    ///
    /// Keys are stored locally before they are published. The signed and
    /// last-resort pre-keys are reused when present.
    pub async fn register_pre_keys<R: CryptoRngCore>(
        &self,
        rng: &mut R,
        start: u32,
        count: u32,
    ) -> Result<Option<PreKeyRefill>> {
        let identity = self.create_identity(rng)?;
        let pre_keys = generate_pre_keys(rng, start, count);

        let last_resort = match self.store.pre_keys.load(LAST_RESORT_PRE_KEY_ID) {
            Some(record) => record,
            None => {
                let record = generate_last_resort_pre_key(rng);
                if !self.store.pre_keys.store(&record) {
                    return Err(Error::Storage("last-resort pre-key".into()));
                }
                record
            }
        };

        let signed = match self.store.signed_pre_keys.load(SIGNED_PRE_KEY_ID) {
            Some(record) => record,
            None => {
                let record = generate_signed_pre_key(rng, &identity, SIGNED_PRE_KEY_ID);
                if !self.store.signed_pre_keys.store(&record) {
                    return Err(Error::Storage("signed pre-key".into()));
                }
                record
            }
        };

        if !self.store.pre_keys.store_batch(&pre_keys) {
            return Err(Error::Storage("pre-keys".into()));
        }
        if let Some(last) = pre_keys.last() {
            self.store.identity.store_last_pre_key_id(last.id);
        }

        let upload = KeysUpload {
            identity_key: identity.public_key().to_base64(),
            pre_keys: pre_keys.iter().map(pre_key_entity).collect(),
            signed_pre_key: SignedPreKeyEntity {
                key_id: signed.id,
                public_key: signed.key_pair.public_key().to_base64(),
                signature: STANDARD.encode(signed.signature),
            },
            last_resort_key: Some(pre_key_entity(&last_resort)),
        };
        self.transport.publish_keys(&upload).await?;

        debug!(start, count, "published pre-keys");
        Ok(pre_keys.first().map(|first| PreKeyRefill {
            first_id: first.id,
            count,
        }))
    }

    /// Tops the server's pool back up when it ran low.
    pub async fn check_pre_keys<R: CryptoRngCore>(
        &self,
        rng: &mut R,
    ) -> Result<Option<PreKeyRefill>> {
        let remaining = self.transport.pre_key_count().await?;
        if remaining > self.pre_keys.low_water_mark {
            return Ok(None);
        }

        let count = self.pre_keys.high_water_mark.saturating_sub(remaining);
        let start = self.store.identity.last_pre_key_id().unwrap_or(0);
        info!(remaining, count, "refilling pre-keys");
        self.register_pre_keys(rng, start, count).await
    }
}

impl std::fmt::Debug for RegistrationManager<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistrationManager")
            .field("pre_keys", &self.pre_keys)
            .finish()
    }
}

fn pre_key_entity(record: &PreKeyRecord) -> PreKeyEntity {
    PreKeyEntity {
        key_id: record.id,
        public_key: record.key_pair.public_key().to_base64(),
    }
}
