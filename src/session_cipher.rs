//! Encryption and decryption against a stored session.
//!
//! Every operation loads the session record, works on it in memory and
//! writes it back only after the ratchet step succeeded and, when decrypting
//! through [`SessionCipher::decrypt_with`], after the plaintext was accepted.

use crate::address::ProtocolAddress;
use crate::double_ratchet::DoubleRatchet;
use crate::error::{Error, Result};
use crate::keys::PublicKey;
use crate::protocol::{CiphertextMessage, PreKeySignalMessage, SignalMessage};
use crate::state::{SessionRecord, SessionState};
use crate::storage::{ProtocolStore, LAST_RESORT_PRE_KEY_ID};
use crate::x3dh::{self, ResponderKeys};
use rand_core::CryptoRngCore;
use tracing::{debug, warn};

/// Result of decrypting a relay body whose message type is unknown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecryptOutcome {
    Plaintext(Vec<u8>),
    /// Already processed; nothing to record
    Duplicate,
    /// Every decoding attempt failed; carries the last error
    Undecryptable(Error),
}

/// A decrypted message and the session changes it implies, not yet stored.
struct Pending {
    plaintext: Vec<u8>,
    record: SessionRecord,
    identity: Option<PublicKey>,
    consumed_pre_key: Option<u32>,
}

/// Session operations for one remote address.
pub struct SessionCipher<'a> {
    store: &'a ProtocolStore,
    remote: &'a ProtocolAddress,
}

impl<'a> SessionCipher<'a> {
    #[must_use]
    pub fn new(store: &'a ProtocolStore, remote: &'a ProtocolAddress) -> Self {
        Self { store, remote }
    }

    /// Encrypts `plaintext` with the current session.
    ///
    /// Produces a `PreKeySignalMessage` until the peer has replied, a plain
    /// `SignalMessage` afterwards.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<CiphertextMessage> {
        let mut record = self.load_record()?;
        let state = record
            .session_state_mut()
            .ok_or_else(|| Error::NoSession(self.remote.to_string()))?;

        if !self.store.identity.is_trusted(self.remote, state.remote_identity()) {
            return Err(Error::UntrustedIdentity(self.remote.to_string()));
        }

        let message = state.encrypt(plaintext)?;
        self.store_record(&record)?;
        Ok(message)
    }

    /// Registration id of the remote device in the current session.
    pub fn remote_registration_id(&self) -> Result<u32> {
        self.load_record()?
            .session_state()
            .map(SessionState::remote_registration_id)
            .ok_or_else(|| Error::NoSession(self.remote.to_string()))
    }

    /// Decrypts a message of known type.
    pub fn decrypt_message<R: CryptoRngCore>(
        &self,
        rng: &mut R,
        message: &CiphertextMessage,
    ) -> Result<Vec<u8>> {
        match message {
            CiphertextMessage::Signal(message) => self.decrypt_signal(rng, message),
            CiphertextMessage::PreKey(message) => self.decrypt_pre_key(rng, message),
        }
    }

    /// Decrypts a relay body of unknown type.
    ///
    /// Tries it as a `SignalMessage`, then as a `PreKeySignalMessage`. When
    /// the pre-key attempt hits a changed identity the pinned identity is
    /// dropped and the attempt repeated once.
    pub fn decrypt<R: CryptoRngCore>(&self, rng: &mut R, body: &[u8]) -> DecryptOutcome {
        self.decrypt_with(rng, body, |_| Ok(()))
            .unwrap_or_else(DecryptOutcome::Undecryptable)
    }

    /// Like [`decrypt`](Self::decrypt), but hands the plaintext to `accept`
    /// before any session state is stored.
    ///
    /// When `accept` fails nothing is stored and its error is returned, so
    /// the same body decrypts again on redelivery.
    pub fn decrypt_with<R, F>(&self, rng: &mut R, body: &[u8], accept: F) -> Result<DecryptOutcome>
    where
        R: CryptoRngCore,
        F: FnOnce(&[u8]) -> Result<()>,
    {
        let pending = match self.prepare(rng, body) {
            Ok(pending) => pending,
            Err(outcome) => return Ok(outcome),
        };
        accept(&pending.plaintext)?;
        self.commit(pending).map(DecryptOutcome::Plaintext)
    }

    fn prepare<R: CryptoRngCore>(
        &self,
        rng: &mut R,
        body: &[u8],
    ) -> std::result::Result<Pending, DecryptOutcome> {
        let signal_error = match SignalMessage::from_bytes(body)
            .and_then(|message| self.prepare_signal(rng, &message))
        {
            Ok(pending) => return Ok(pending),
            Err(Error::DuplicateMessage) => return Err(DecryptOutcome::Duplicate),
            Err(err) => err,
        };

        let message = PreKeySignalMessage::from_bytes(body)
            .map_err(|_| DecryptOutcome::Undecryptable(signal_error))?;

        let result = match self.prepare_pre_key(rng, &message) {
            Err(Error::UntrustedIdentity(_)) => {
                warn!(address = %self.remote, "identity changed, re-pinning from pre-key message");
                self.store.identity.remove_identity(self.remote);
                self.prepare_pre_key(rng, &message)
            }
            result => result,
        };
        result.map_err(|err| match err {
            Error::DuplicateMessage => DecryptOutcome::Duplicate,
            err => DecryptOutcome::Undecryptable(err),
        })
    }

    /// Decrypts with the current state, falling back to archived states.
    pub fn decrypt_signal<R: CryptoRngCore>(
        &self,
        rng: &mut R,
        message: &SignalMessage,
    ) -> Result<Vec<u8>> {
        self.prepare_signal(rng, message)
            .and_then(|pending| self.commit(pending))
    }

    fn prepare_signal<R: CryptoRngCore>(
        &self,
        rng: &mut R,
        message: &SignalMessage,
    ) -> Result<Pending> {
        let mut record = self.load_record()?;
        let plaintext = decrypt_with_record(rng, &mut record, message)
            .map_err(|err| match err {
                Error::NoSession(_) => Error::NoSession(self.remote.to_string()),
                other => other,
            })?;

        if let Some(state) = record.session_state() {
            if !self.store.identity.is_trusted(self.remote, state.remote_identity()) {
                return Err(Error::UntrustedIdentity(self.remote.to_string()));
            }
        }

        Ok(Pending {
            plaintext,
            record,
            identity: None,
            consumed_pre_key: None,
        })
    }

    /// Decrypts the first messages of a session started by the peer.
    ///
    /// A message whose base key belongs to a known state is decrypted with
    /// that state. Otherwise X3DH is answered with the referenced pre-keys
    /// and the new state becomes current. The consumed one-time pre-key is
    /// removed after a successful decrypt, unless it is the last-resort key.
    pub fn decrypt_pre_key<R: CryptoRngCore>(
        &self,
        rng: &mut R,
        message: &PreKeySignalMessage,
    ) -> Result<Vec<u8>> {
        self.prepare_pre_key(rng, message)
            .and_then(|pending| self.commit(pending))
    }

    fn prepare_pre_key<R: CryptoRngCore>(
        &self,
        rng: &mut R,
        message: &PreKeySignalMessage,
    ) -> Result<Pending> {
        if !self.store.identity.is_trusted(self.remote, &message.identity_key) {
            return Err(Error::UntrustedIdentity(self.remote.to_string()));
        }

        let mut record = self.store.sessions.load(self.remote).unwrap_or_default();
        let consumed_pre_key = if record.select_state_with_base_key(&message.base_key) {
            None
        } else {
            record.promote_state(self.respond(message)?);
            message.pre_key_id
        };

        let state = record
            .session_state_mut()
            .ok_or_else(|| Error::NoSession(self.remote.to_string()))?;
        let plaintext = state.decrypt(rng, &message.message)?;

        Ok(Pending {
            plaintext,
            record,
            identity: Some(message.identity_key),
            consumed_pre_key: consumed_pre_key.filter(|id| *id != LAST_RESORT_PRE_KEY_ID),
        })
    }

    fn commit(&self, pending: Pending) -> Result<Vec<u8>> {
        self.store_record(&pending.record)?;

        if let Some(identity) = &pending.identity {
            self.store.identity.save_identity(self.remote, identity);
            debug!(
                address = %self.remote,
                pre_key_id = ?pending.consumed_pre_key,
                "session established from pre-key message"
            );
        }
        if let Some(id) = pending.consumed_pre_key {
            self.store.pre_keys.remove(id);
        }
        Ok(pending.plaintext)
    }

    fn respond(&self, message: &PreKeySignalMessage) -> Result<SessionState> {
        let identity = self
            .store
            .identity
            .identity_key_pair()
            .ok_or(Error::MissingLocalIdentity)?;
        let local_registration_id = self
            .store
            .identity
            .local_registration_id()
            .ok_or(Error::NotRegistered)?;
        let signed = self
            .store
            .signed_pre_keys
            .load(message.signed_pre_key_id)
            .ok_or(Error::InvalidSignedPreKeyId(message.signed_pre_key_id))?;
        let one_time = match message.pre_key_id {
            Some(id) => Some(self.store.pre_keys.load(id).ok_or(Error::InvalidPreKeyId(id))?),
            None => None,
        };

        let keys = ResponderKeys {
            identity: &identity,
            signed_pre_key: &signed.key_pair,
            one_time_pre_key: one_time.as_ref().map(|record| &record.key_pair),
        };
        let agreement = x3dh::respond(&keys, &message.identity_key, &message.base_key)?;

        Ok(SessionState {
            local_identity: *identity.public_key(),
            remote_identity: message.identity_key,
            local_registration_id,
            remote_registration_id: message.registration_id,
            base_key: message.base_key,
            associated_data: agreement.associated_data,
            pending_pre_key: None,
            ratchet: DoubleRatchet::new_receiver(
                agreement.root_key,
                signed.key_pair.secret_key().clone(),
            ),
        })
    }

    fn load_record(&self) -> Result<SessionRecord> {
        self.store
            .sessions
            .load(self.remote)
            .ok_or_else(|| Error::NoSession(self.remote.to_string()))
    }

    fn store_record(&self, record: &SessionRecord) -> Result<()> {
        if self.store.sessions.store(self.remote, record) {
            Ok(())
        } else {
            Err(Error::Storage(format!("session for {}", self.remote)))
        }
    }
}

impl std::fmt::Debug for SessionCipher<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCipher")
            .field("remote", self.remote)
            .finish()
    }
}

fn decrypt_with_record<R: CryptoRngCore>(
    rng: &mut R,
    record: &mut SessionRecord,
    message: &SignalMessage,
) -> Result<Vec<u8>> {
    let mut first_error = None;

    if let Some(state) = record.session_state_mut() {
        match state.decrypt(rng, message) {
            Ok(plaintext) => return Ok(plaintext),
            Err(Error::DuplicateMessage) => return Err(Error::DuplicateMessage),
            Err(err) => first_error = Some(err),
        }
    }

    for index in 0..record.previous_states().len() {
        let Some(state) = record.previous_state_mut(index) else {
            break;
        };
        match state.decrypt(rng, message) {
            Ok(plaintext) => {
                record.promote_previous(index);
                return Ok(plaintext);
            }
            Err(Error::DuplicateMessage) => return Err(Error::DuplicateMessage),
            Err(err) => {
                first_error.get_or_insert(err);
            }
        }
    }

    Err(first_error.unwrap_or_else(|| Error::NoSession(String::new())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{IdentityKeyPair, KeyPair};
    use crate::session_builder::SessionBuilder;
    use crate::storage::{
        InMemoryKeyValueStore, PreKeyRecord, RegistrationRecord, SignedPreKeyRecord, TrustPolicy,
    };
    use crate::x3dh::PreKeyBundle;
    use rand_core::OsRng;
    use std::sync::Arc;

    struct Party {
        store: ProtocolStore,
        address: ProtocolAddress,
    }

    impl Party {
        fn new(name: &str, registration_id: u32) -> Self {
            let store =
                ProtocolStore::new(Arc::new(InMemoryKeyValueStore::new()), TrustPolicy::default());
            let identity = IdentityKeyPair::generate(&mut OsRng);
            store.identity.store_identity_key_pair(&identity);
            store.identity.store_registration(&RegistrationRecord {
                registration_id,
                username: name.into(),
                signaling_key: None,
            });

            let signed = KeyPair::generate(&mut OsRng);
            let signature = identity.sign(&mut OsRng, &signed.public_key().serialize());
            store.signed_pre_keys.store(&SignedPreKeyRecord {
                id: 1,
                timestamp: 0,
                key_pair: signed,
                signature,
            });
            store.pre_keys.store_batch(&[
                PreKeyRecord::new(7, KeyPair::generate(&mut OsRng)),
                PreKeyRecord::new(LAST_RESORT_PRE_KEY_ID, KeyPair::generate(&mut OsRng)),
            ]);

            Self {
                store,
                address: ProtocolAddress::primary(name),
            }
        }

        fn bundle(&self, pre_key_id: u32) -> PreKeyBundle {
            let signed = self.store.signed_pre_keys.load(1).unwrap();
            let pre_key = self.store.pre_keys.load(pre_key_id).unwrap();
            PreKeyBundle {
                registration_id: self.store.identity.local_registration_id().unwrap(),
                device_id: 1,
                pre_key: Some((pre_key_id, *pre_key.key_pair.public_key())),
                signed_pre_key_id: 1,
                signed_pre_key: *signed.key_pair.public_key(),
                signed_pre_key_signature: signed.signature,
                identity_key: *self.store.identity.identity_key_pair().unwrap().public_key(),
            }
        }

        fn cipher<'a>(&'a self, peer: &'a Party) -> SessionCipher<'a> {
            SessionCipher::new(&self.store, &peer.address)
        }
    }

    fn established() -> (Party, Party) {
        let alice = Party::new("alice", 1);
        let bob = Party::new("bob", 2);
        SessionBuilder::new(&alice.store, &bob.address)
            .process_bundle(&mut OsRng, &bob.bundle(7))
            .unwrap();
        (alice, bob)
    }

    #[test]
    fn test_first_message_is_pre_key_until_reply() {
        let (alice, bob) = established();

        let first = alice.cipher(&bob).encrypt(b"hello").unwrap();
        assert!(matches!(first, CiphertextMessage::PreKey(_)));
        assert_eq!(alice.cipher(&bob).remote_registration_id().unwrap(), 2);

        let plaintext = bob.cipher(&alice).decrypt_message(&mut OsRng, &first).unwrap();
        assert_eq!(plaintext, b"hello");
        assert!(!bob.store.pre_keys.contains(7));

        let reply = bob.cipher(&alice).encrypt(b"hi alice").unwrap();
        assert!(matches!(reply, CiphertextMessage::Signal(_)));
        assert_eq!(
            alice.cipher(&bob).decrypt_message(&mut OsRng, &reply).unwrap(),
            b"hi alice"
        );

        let second = alice.cipher(&bob).encrypt(b"acknowledged").unwrap();
        assert!(matches!(second, CiphertextMessage::Signal(_)));
    }

    #[test]
    fn test_untyped_decrypt_falls_back_to_pre_key() {
        let (alice, bob) = established();
        let first = alice.cipher(&bob).encrypt(b"untyped").unwrap();

        assert_eq!(
            bob.cipher(&alice).decrypt(&mut OsRng, &first.to_bytes()),
            DecryptOutcome::Plaintext(b"untyped".to_vec())
        );
        assert_eq!(
            bob.cipher(&alice).decrypt(&mut OsRng, &first.to_bytes()),
            DecryptOutcome::Duplicate
        );
    }

    #[test]
    fn test_rejected_plaintext_leaves_state_untouched() {
        let (alice, bob) = established();
        let first = alice.cipher(&bob).encrypt(b"keep me").unwrap().to_bytes();

        let rejected = bob.cipher(&alice).decrypt_with(&mut OsRng, &first, |_| {
            Err(Error::Storage("log unavailable".into()))
        });
        assert!(matches!(rejected, Err(Error::Storage(_))));
        assert!(!bob.store.sessions.contains(&alice.address));
        assert!(bob.store.pre_keys.contains(7));

        let mut seen = Vec::new();
        let outcome = bob
            .cipher(&alice)
            .decrypt_with(&mut OsRng, &first, |plaintext| {
                seen.extend_from_slice(plaintext);
                Ok(())
            })
            .unwrap();
        assert_eq!(outcome, DecryptOutcome::Plaintext(b"keep me".to_vec()));
        assert_eq!(seen, b"keep me");
        assert!(!bob.store.pre_keys.contains(7));
    }

    #[test]
    fn test_last_resort_key_is_kept() {
        let alice = Party::new("alice", 1);
        let bob = Party::new("bob", 2);
        SessionBuilder::new(&alice.store, &bob.address)
            .process_bundle(&mut OsRng, &bob.bundle(LAST_RESORT_PRE_KEY_ID))
            .unwrap();

        let first = alice.cipher(&bob).encrypt(b"last resort").unwrap();
        bob.cipher(&alice).decrypt_message(&mut OsRng, &first).unwrap();

        assert!(bob.store.pre_keys.contains(LAST_RESORT_PRE_KEY_ID));
    }

    #[test]
    fn test_signal_message_without_session_is_crypto_failure() {
        let (alice, bob) = established();
        let first = alice.cipher(&bob).encrypt(b"x").unwrap();
        let CiphertextMessage::PreKey(pre_key) = first else {
            panic!("expected a pre-key message");
        };

        let err = bob
            .cipher(&alice)
            .decrypt_signal(&mut OsRng, &pre_key.message)
            .unwrap_err();
        assert_eq!(err, Error::NoSession("alice.1".into()));
        assert_eq!(err.kind(), crate::error::ErrorKind::CryptoFailure);
    }

    #[test]
    fn test_changed_identity_is_repinned_once() {
        let (alice, bob) = established();
        bob.store.identity.save_identity(
            &alice.address,
            IdentityKeyPair::generate(&mut OsRng).public_key(),
        );
        let first = alice.cipher(&bob).encrypt(b"new phone").unwrap();

        assert_eq!(
            bob.cipher(&alice).decrypt(&mut OsRng, &first.to_bytes()),
            DecryptOutcome::Plaintext(b"new phone".to_vec())
        );
        assert_eq!(
            bob.store.identity.identity(&alice.address).as_ref(),
            Some(alice.store.identity.identity_key_pair().unwrap().public_key())
        );
    }

    #[test]
    fn test_garbage_is_undecryptable() {
        let (alice, bob) = established();
        let outcome = bob.cipher(&alice).decrypt(&mut OsRng, &[0x33; 12]);

        assert!(matches!(outcome, DecryptOutcome::Undecryptable(_)));
    }

    #[test]
    fn test_late_message_on_replaced_session() {
        let (alice, bob) = established();
        let first = alice.cipher(&bob).encrypt(b"one").unwrap();
        bob.cipher(&alice).decrypt_message(&mut OsRng, &first).unwrap();
        let reply = bob.cipher(&alice).encrypt(b"two").unwrap();
        alice.cipher(&bob).decrypt_message(&mut OsRng, &reply).unwrap();

        let late = alice.cipher(&bob).encrypt(b"late").unwrap();

        // alice re-keys; bob now holds two states for alice
        bob.store.pre_keys.store(&PreKeyRecord::new(8, KeyPair::generate(&mut OsRng)));
        SessionBuilder::new(&alice.store, &bob.address)
            .process_bundle(&mut OsRng, &bob.bundle(8))
            .unwrap();
        let rekeyed = alice.cipher(&bob).encrypt(b"fresh").unwrap();
        bob.cipher(&alice).decrypt_message(&mut OsRng, &rekeyed).unwrap();

        assert_eq!(
            bob.cipher(&alice).decrypt_message(&mut OsRng, &late).unwrap(),
            b"late"
        );
    }
}
