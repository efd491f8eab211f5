//! High-level messaging client.
//!
//! [`SignalClient`] ties the protocol store, the two transports and the
//! conversation log together. Work on one remote address is serialized by an
//! async lock per address; different contacts proceed in parallel.

use crate::address::ProtocolAddress;
use crate::config::ClientConfig;
use crate::conversation::{
    ConversationLog, ConversationSummary, ParsedMessage, StoredConversationLog,
};
use crate::envelope::{Envelope, UnreadTally, ANY_TAG, CIPHERTEXT_TYPE};
use crate::error::{Error, Result};
use crate::keys::PublicKey;
use crate::registration::{PreKeyRefill, RegistrationManager, RegistrationOutcome};
use crate::session_builder::SessionBuilder;
use crate::session_cipher::{DecryptOutcome, SessionCipher};
use crate::storage::{FileKeyValueStore, InMemoryKeyValueStore, KeyValueStore, ProtocolStore};
use crate::transport::{
    KeyExchangeTransport, MessageRelayTransport, OutgoingMessage, OutgoingMessages, SendResponse,
    TransportError,
};
use crate::x3dh::PreKeyBundle;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand_core::OsRng;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

#[derive(Default)]
struct AddressLocks(Mutex<HashMap<ProtocolAddress, Arc<AsyncMutex<()>>>>);

impl AddressLocks {
    async fn lock(&self, address: &ProtocolAddress) -> AddressGuard<'_> {
        let lock = {
            let mut locks = self.0.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(address.clone()).or_default())
        };
        AddressGuard {
            guard: Some(lock.lock_owned().await),
            locks: self,
            address: address.clone(),
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// Held lock on one address; the map entry is dropped with the last holder.
struct AddressGuard<'a> {
    guard: Option<OwnedMutexGuard<()>>,
    locks: &'a AddressLocks,
    address: ProtocolAddress,
}

impl Drop for AddressGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut locks = self.locks.0.lock().unwrap_or_else(PoisonError::into_inner);
        if locks
            .get(&self.address)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.address);
        }
    }
}

/// Messaging client for one local account.
pub struct SignalClient {
    config: ClientConfig,
    store: ProtocolStore,
    keys: Arc<dyn KeyExchangeTransport>,
    relay: Arc<dyn MessageRelayTransport>,
    log: Arc<dyn ConversationLog>,
    locks: AddressLocks,
}

impl SignalClient {
    pub fn new(
        config: ClientConfig,
        backend: Arc<dyn KeyValueStore>,
        keys: Arc<dyn KeyExchangeTransport>,
        relay: Arc<dyn MessageRelayTransport>,
        log: Arc<dyn ConversationLog>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            store: ProtocolStore::new(backend, config.trust_policy),
            config,
            keys,
            relay,
            log,
            locks: AddressLocks::default(),
        })
    }

    /// Builds a client whose protocol state and conversations share the
    /// store selected by `config.data_dir`.
    pub fn open(
        config: ClientConfig,
        keys: Arc<dyn KeyExchangeTransport>,
        relay: Arc<dyn MessageRelayTransport>,
    ) -> Result<Self> {
        let backend: Arc<dyn KeyValueStore> = match &config.data_dir {
            Some(dir) => Arc::new(FileKeyValueStore::open(dir)?),
            None => Arc::new(InMemoryKeyValueStore::new()),
        };
        let log = Arc::new(StoredConversationLog::new(Arc::clone(&backend)));
        Self::new(config, backend, keys, relay, log)
    }

    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    #[must_use]
    pub fn store(&self) -> &ProtocolStore {
        &self.store
    }

    fn registration(&self) -> RegistrationManager<'_> {
        RegistrationManager::new(&self.store, self.keys.as_ref(), self.config.pre_keys)
    }

    /// Returns the local identity key, creating the key pair on first use.
    pub fn create_identity(&self) -> Result<PublicKey> {
        self.registration()
            .create_identity(&mut OsRng)
            .map(|identity| *identity.public_key())
    }

    pub async fn register(&self) -> Result<RegistrationOutcome> {
        self.registration()
            .register(&mut OsRng, &self.config.username)
            .await
    }

    #[must_use]
    pub fn is_registered(&self) -> bool {
        self.store.identity.is_local_registered()
    }

    /// Wipes every piece of local protocol state.
    pub fn reset_identity(&self) -> Result<()> {
        if !self.store.destroy() {
            return Err(Error::Storage("reset identity".into()));
        }
        info!(username = %self.config.username, "local identity reset");
        Ok(())
    }

    pub async fn check_pre_keys(&self) -> Result<Option<PreKeyRefill>> {
        self.registration().check_pre_keys(&mut OsRng).await
    }

    /// Ensures a session with `contact` exists.
    ///
    /// With `force`, or without a session, the pinned identity and session
    /// are dropped and a fresh bundle is fetched.
    pub async fn establish_session(&self, contact: &str, force: bool) -> Result<()> {
        let address = ProtocolAddress::primary(contact);
        let _guard = self.locks.lock(&address).await;
        self.establish_locked(&address, force).await
    }

    async fn establish_locked(&self, address: &ProtocolAddress, force: bool) -> Result<()> {
        if !force && self.store.sessions.contains(address) {
            return Ok(());
        }

        self.store.identity.remove_identity(address);
        self.store.sessions.remove(address);

        let response = self
            .keys
            .fetch_bundle(address)
            .await
            .map_err(|err| match err {
                TransportError::NotFound => Error::ContactNotFound(address.name().to_owned()),
                other => Error::Transport(other),
            })?;
        let bundle = PreKeyBundle::from_response(&response)?;

        SessionBuilder::new(&self.store, address).process_bundle(&mut OsRng, &bundle)
    }

    /// Forgets sessions and the pinned identity of `contact`.
    ///
    /// Its conversation history is kept.
    pub async fn delete_contact(&self, contact: &str) -> Result<()> {
        let address = ProtocolAddress::primary(contact);
        let _guard = self.locks.lock(&address).await;

        let removed = self.store.sessions.remove_all(contact);
        self.store.identity.remove_identity(&address);
        debug!(address = %address, sessions = removed, "contact deleted");
        Ok(())
    }

    /// Encrypts `plaintext` for `contact`, sends it and records it.
    ///
    /// When the relay reports stale devices the bundle is fetched again and
    /// the send repeated once.
    pub async fn encrypt_and_send(
        &self,
        contact: &str,
        plaintext: &str,
        tag: &str,
        silent: bool,
    ) -> Result<ParsedMessage> {
        let address = ProtocolAddress::primary(contact);
        let _guard = self.locks.lock(&address).await;
        self.establish_locked(&address, false).await?;

        let (response, mut timestamp) = self.send_locked(&address, plaintext, tag, silent).await?;
        if response.has_stale_devices() {
            warn!(
                address = %address,
                devices = ?response.stale_devices,
                "stale devices, refetching keys"
            );
            self.establish_locked(&address, true).await?;

            let (retry, retry_timestamp) =
                self.send_locked(&address, plaintext, tag, silent).await?;
            if retry.has_stale_devices() {
                return Err(Error::StaleDevices(contact.to_owned()));
            }
            timestamp = retry_timestamp;
        }

        let sent = ParsedMessage::new(
            &self.config.username,
            self.config.device_id,
            timestamp,
            plaintext.to_owned(),
        );
        // The relay already accepted the message; a failed append must not
        // make the caller send it again.
        match self.log.append(tag, contact, sent.clone()) {
            Ok(recorded) => Ok(recorded),
            Err(err) => {
                warn!(address = %address, timestamp, error = %err, "sent message not recorded");
                Ok(sent)
            }
        }
    }

    async fn send_locked(
        &self,
        address: &ProtocolAddress,
        plaintext: &str,
        tag: &str,
        silent: bool,
    ) -> Result<(SendResponse, u64)> {
        let cipher = SessionCipher::new(&self.store, address);
        let ciphertext = cipher.encrypt(plaintext.as_bytes())?;
        let timestamp = now_millis();

        let batch = OutgoingMessages {
            messages: vec![OutgoingMessage {
                kind: CIPHERTEXT_TYPE,
                destination: address.name().to_owned(),
                content: String::new(),
                tag: tag.to_owned(),
                silent,
                destination_device_id: address.device_id(),
                destination_registration_id: cipher.remote_registration_id()?,
                body: STANDARD.encode(ciphertext.to_bytes()),
                timestamp,
            }],
        };

        let response = self.relay.put_messages(address.name(), &batch).await?;
        debug!(address = %address, kind = ?ciphertext.message_type(), "message sent");
        Ok((response, timestamp))
    }

    /// Decrypts pending messages from `contact` in conversation `tag`.
    ///
    /// Every processed envelope is removed from the relay, duplicates
    /// included. Envelopes that cannot be decrypted are recorded as
    /// placeholders.
    pub async fn fetch_and_decrypt_new(
        &self,
        contact: &str,
        tag: &str,
    ) -> Result<Vec<ParsedMessage>> {
        let address = ProtocolAddress::primary(contact);
        let envelopes = self.fetch_envelopes().await?;

        let _guard = self.locks.lock(&address).await;
        if !self.store.sessions.contains(&address) {
            debug!(address = %address, "no session, pending messages left on the relay");
            return Ok(Vec::new());
        }

        let mut messages = Vec::new();
        for envelope in envelopes
            .iter()
            .filter(|envelope| envelope.has_tag(tag) && envelope.is_decryptable_for(contact))
        {
            let decrypted = self.decrypt_envelope_locked(&address, envelope, envelope.tag())?;
            if let Some(message) = decrypted {
                messages.push(message);
            }
            self.delete_best_effort(envelope).await;
        }
        Ok(messages)
    }

    /// Decrypts a single envelope delivered outside the relay, e.g. by a
    /// push notification, and records it under `tag`.
    ///
    /// Returns `None` for duplicates and for envelopes that carry no
    /// ciphertext.
    pub async fn decrypt_standalone_envelope(
        &self,
        raw: &str,
        tag: &str,
    ) -> Result<Option<ParsedMessage>> {
        let envelope = Envelope::from_json(raw)?;
        if !envelope.is_decryptable_for(&envelope.source) {
            return Ok(None);
        }

        let address = envelope.address();
        let _guard = self.locks.lock(&address).await;
        if !self.store.sessions.contains(&address) {
            return Err(Error::NoSession(address.to_string()));
        }
        self.decrypt_envelope_locked(&address, &envelope, tag)
    }

    fn decrypt_envelope_locked(
        &self,
        address: &ProtocolAddress,
        envelope: &Envelope,
        tag: &str,
    ) -> Result<Option<ParsedMessage>> {
        let contact = address.name();
        if self.log.contains(tag, contact, &envelope.source, envelope.timestamp) {
            debug!(address = %address, timestamp = envelope.timestamp, "envelope already recorded");
            return Ok(None);
        }

        let body = match envelope.body() {
            Ok(body) => body,
            Err(err) => return self.record_undecryptable(address, envelope, tag, &err),
        };

        // The entry is appended before the ratchet advances, so a failed
        // append leaves the envelope decryptable on redelivery.
        let mut recorded = None;
        let outcome = SessionCipher::new(&self.store, address).decrypt_with(
            &mut OsRng,
            &body,
            |plaintext| {
                let message = ParsedMessage::new(
                    &envelope.source,
                    envelope.source_device,
                    envelope.timestamp,
                    String::from_utf8_lossy(plaintext).into_owned(),
                );
                recorded = Some(self.log.append(tag, contact, message)?);
                Ok(())
            },
        )?;

        match outcome {
            DecryptOutcome::Plaintext(_) => Ok(recorded),
            DecryptOutcome::Duplicate => {
                warn!(
                    address = %address,
                    timestamp = envelope.timestamp,
                    "duplicate message dropped"
                );
                Ok(None)
            }
            DecryptOutcome::Undecryptable(err) => {
                self.record_undecryptable(address, envelope, tag, &err)
            }
        }
    }

    fn record_undecryptable(
        &self,
        address: &ProtocolAddress,
        envelope: &Envelope,
        tag: &str,
        err: &Error,
    ) -> Result<Option<ParsedMessage>> {
        warn!(
            address = %address,
            timestamp = envelope.timestamp,
            error = %err,
            "message is undecryptable"
        );
        let placeholder = ParsedMessage::undecryptable(
            &envelope.source,
            envelope.source_device,
            envelope.timestamp,
        );
        self.log.append(tag, address.name(), placeholder).map(Some)
    }

    /// Tallies pending ciphertexts per source without decrypting them.
    pub async fn unread_counts(&self, tag: &str) -> Result<UnreadTally> {
        let envelopes = self.fetch_envelopes().await?;
        Ok(envelopes
            .iter()
            .filter(|envelope| envelope.has_tag(tag))
            .collect())
    }

    #[must_use]
    pub fn list_conversation(&self, contact: &str, tag: &str) -> Vec<ParsedMessage> {
        self.log.list(tag, contact)
    }

    #[must_use]
    pub fn list_all_conversations(&self, tag: &str) -> Vec<ConversationSummary> {
        self.log.list_all(tag)
    }

    /// Removes one message from the relay.
    pub async fn delete_message(&self, contact: &str, timestamp: u64) -> Result<()> {
        self.relay.delete_message(contact, timestamp).await?;
        Ok(())
    }

    /// Removes every pending record from `contact` in conversation `tag`
    /// (`*` for all) and returns how many were deleted.
    pub async fn delete_contact_pending_messages(&self, contact: &str, tag: &str) -> Result<usize> {
        let envelopes = self.fetch_envelopes().await?;

        let mut deleted = 0;
        for envelope in envelopes
            .iter()
            .filter(|envelope| envelope.source == contact && envelope.has_tag(tag))
        {
            if self.delete_best_effort(envelope).await {
                deleted += 1;
            }
        }
        debug!(contact, tag, deleted, all_tags = tag == ANY_TAG, "pending messages deleted");
        Ok(deleted)
    }

    async fn fetch_envelopes(&self) -> Result<Vec<Envelope>> {
        let records = self.relay.fetch_pending().await?;
        Ok(records
            .into_iter()
            .filter_map(|record| {
                Envelope::from_value(record)
                    .map_err(|err| warn!(error = %err, "skipping malformed relay record"))
                    .ok()
            })
            .collect())
    }

    async fn delete_best_effort(&self, envelope: &Envelope) -> bool {
        match self
            .relay
            .delete_message(&envelope.source, envelope.timestamp)
            .await
        {
            Ok(()) => true,
            Err(err) => {
                warn!(
                    source = %envelope.source,
                    timestamp = envelope.timestamp,
                    error = %err,
                    "relay cleanup failed"
                );
                false
            }
        }
    }
}

impl std::fmt::Debug for SignalClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalClient")
            .field("username", &self.config.username)
            .field("device_id", &self.config.device_id)
            .finish_non_exhaustive()
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or_default()
}
