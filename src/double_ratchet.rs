//! Double Ratchet state for one session.
//!
//! Combines a symmetric-key ratchet (a fresh message key per message) with
//! a DH ratchet (a fresh root and chain key whenever the peer's ratchet
//! key changes). Each party keeps:
//! - Root key (RK), updated on every DH ratchet step
//! - Sending and receiving chain keys, updated per message
//! - Its current ratchet key pair and the peer's current ratchet key
//! - Message keys of skipped messages, for out-of-order delivery
//!
//! [`DoubleRatchet::decrypt`] works on a copy of the state and only commits
//! it when the message authenticates, so feeding it garbage (for example a
//! pre-key message decoded with the wrong type) never corrupts a session.

use crate::crypto::{decrypt, derive_nonce, encrypt, kdf_chain, kdf_root, SymmetricKey};
use crate::error::{Error, Result};
use crate::keys::{PublicKey, SecretKey};
use crate::protocol::{Header, SignalMessage};
use rand_core::CryptoRngCore;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use zeroize::Zeroize;

/// Largest gap accepted inside one receiving chain.
pub const MAX_SKIP: u32 = 2000;

/// Upper bound on cached skipped message keys across all chains.
const MAX_SKIPPED_KEYS: usize = 2000;

/// Remote ratchet keys remembered after they were replaced.
const MAX_RETIRED_RATCHET_KEYS: usize = 5;

#[derive(Clone, Serialize, Deserialize)]
struct SkippedKey {
    ratchet_key: PublicKey,
    index: u32,
    key: SymmetricKey,
}

/// Double Ratchet state
#[derive(Clone, Serialize, Deserialize)]
pub struct DoubleRatchet {
    root_key: SymmetricKey,
    send_chain_key: Option<SymmetricKey>,
    recv_chain_key: Option<SymmetricKey>,
    dh_send: SecretKey,
    dh_recv: Option<PublicKey>,
    send_count: u32,
    recv_count: u32,
    prev_chain_length: u32,
    skipped_message_keys: VecDeque<SkippedKey>,
    retired_ratchet_keys: VecDeque<PublicKey>,
}

impl DoubleRatchet {
    /// Initialises the session initiator.
    ///
    /// The responder's signed pre-key acts as its first ratchet key, so the
    /// initiator can send immediately.
    pub fn new_sender<R: CryptoRngCore>(
        rng: &mut R,
        root_key: SymmetricKey,
        remote_ratchet_key: PublicKey,
    ) -> Result<Self> {
        let dh_send = SecretKey::generate(rng);
        let (root_key, send_chain_key) =
            kdf_root(&root_key, &dh_send.diffie_hellman(&remote_ratchet_key))?;

        Ok(Self {
            root_key,
            send_chain_key: Some(send_chain_key),
            recv_chain_key: None,
            dh_send,
            dh_recv: Some(remote_ratchet_key),
            send_count: 0,
            recv_count: 0,
            prev_chain_length: 0,
            skipped_message_keys: VecDeque::new(),
            retired_ratchet_keys: VecDeque::new(),
        })
    }

    /// Initialises the responder with its signed pre-key as ratchet key.
    ///
    /// The responder cannot send until the first message arrives.
    #[must_use]
    pub fn new_receiver(root_key: SymmetricKey, local_ratchet_key: SecretKey) -> Self {
        Self {
            root_key,
            send_chain_key: None,
            recv_chain_key: None,
            dh_send: local_ratchet_key,
            dh_recv: None,
            send_count: 0,
            recv_count: 0,
            prev_chain_length: 0,
            skipped_message_keys: VecDeque::new(),
            retired_ratchet_keys: VecDeque::new(),
        }
    }

    /// Our current ratchet public key.
    #[must_use]
    pub fn ratchet_key(&self) -> PublicKey {
        self.dh_send.public_key()
    }

    #[must_use]
    pub fn can_send(&self) -> bool {
        self.send_chain_key.is_some()
    }

    /// Number of cached skipped message keys.
    #[must_use]
    pub fn skipped_key_count(&self) -> usize {
        self.skipped_message_keys.len()
    }

    /// Encrypts `plaintext`, authenticating `associated_data` and the header.
    pub fn encrypt(&mut self, plaintext: &[u8], associated_data: &[u8]) -> Result<SignalMessage> {
        let chain_key = self.send_chain_key.as_ref().ok_or(Error::NoSendingChain)?;
        let (next_chain_key, message_key) = kdf_chain(chain_key)?;

        let header = Header {
            dh_public: self.dh_send.public_key(),
            previous_chain_length: self.prev_chain_length,
            message_number: self.send_count,
        };
        let ciphertext = encrypt(
            &message_key,
            &derive_nonce(header.message_number, header.dh_public.as_bytes()),
            plaintext,
            &message_ad(associated_data, &header),
        )?;

        self.send_chain_key = Some(next_chain_key);
        self.send_count = self
            .send_count
            .checked_add(1)
            .ok_or(Error::NoSendingChain)?;

        Ok(SignalMessage { header, ciphertext })
    }

    /// Decrypts `message`, committing the new state only on success.
    ///
    /// Returns `Error::DuplicateMessage` when the message key was already
    /// consumed.
    pub fn decrypt<R: CryptoRngCore>(
        &mut self,
        rng: &mut R,
        message: &SignalMessage,
        associated_data: &[u8],
    ) -> Result<Vec<u8>> {
        let mut next = self.clone();
        let plaintext = next.decrypt_in_place(rng, message, associated_data)?;
        *self = next;
        Ok(plaintext)
    }

    fn decrypt_in_place<R: CryptoRngCore>(
        &mut self,
        rng: &mut R,
        message: &SignalMessage,
        associated_data: &[u8],
    ) -> Result<Vec<u8>> {
        let header = &message.header;

        if let Some(message_key) = self.take_skipped_key(&header.dh_public, header.message_number) {
            return open(&message_key, message, associated_data);
        }

        if self.dh_recv == Some(header.dh_public) {
            if header.message_number < self.recv_count {
                return Err(Error::DuplicateMessage);
            }
        } else if self.retired_ratchet_keys.contains(&header.dh_public) {
            return Err(Error::DuplicateMessage);
        } else {
            self.skip_message_keys(header.previous_chain_length)?;
            self.dh_ratchet(rng, header.dh_public)?;
        }

        self.skip_message_keys(header.message_number)?;

        let chain_key = self.recv_chain_key.as_ref().ok_or(Error::DecryptionFailed)?;
        let (next_chain_key, message_key) = kdf_chain(chain_key)?;
        self.recv_chain_key = Some(next_chain_key);
        self.recv_count += 1;

        open(&message_key, message, associated_data)
    }

    fn take_skipped_key(&mut self, ratchet_key: &PublicKey, index: u32) -> Option<SymmetricKey> {
        let position = self
            .skipped_message_keys
            .iter()
            .position(|skipped| skipped.ratchet_key == *ratchet_key && skipped.index == index)?;
        self.skipped_message_keys
            .remove(position)
            .map(|skipped| skipped.key)
    }

    /// DH ratchet step on a new remote ratchet key.
    fn dh_ratchet<R: CryptoRngCore>(&mut self, rng: &mut R, remote: PublicKey) -> Result<()> {
        if let Some(previous) = self.dh_recv.replace(remote) {
            self.retired_ratchet_keys.push_back(previous);
            if self.retired_ratchet_keys.len() > MAX_RETIRED_RATCHET_KEYS {
                self.retired_ratchet_keys.pop_front();
            }
        }

        self.prev_chain_length = self.send_count;
        self.send_count = 0;
        self.recv_count = 0;

        let (root_key, recv_chain_key) =
            kdf_root(&self.root_key, &self.dh_send.diffie_hellman(&remote))?;
        self.root_key = root_key;
        self.recv_chain_key = Some(recv_chain_key);

        self.dh_send = SecretKey::generate(rng);
        let (root_key, send_chain_key) =
            kdf_root(&self.root_key, &self.dh_send.diffie_hellman(&remote))?;
        self.root_key = root_key;
        self.send_chain_key = Some(send_chain_key);

        Ok(())
    }

    /// Caches message keys of the current receiving chain up to `until`.
    fn skip_message_keys(&mut self, until: u32) -> Result<()> {
        let (Some(mut chain_key), Some(ratchet_key)) = (self.recv_chain_key.clone(), self.dh_recv)
        else {
            return Ok(());
        };
        if until <= self.recv_count {
            return Ok(());
        }
        if until - self.recv_count > MAX_SKIP {
            return Err(Error::TooManySkippedMessages);
        }

        while self.recv_count < until {
            let (next_chain_key, message_key) = kdf_chain(&chain_key)?;
            self.skipped_message_keys.push_back(SkippedKey {
                ratchet_key,
                index: self.recv_count,
                key: message_key,
            });
            if self.skipped_message_keys.len() > MAX_SKIPPED_KEYS {
                self.skipped_message_keys.pop_front();
            }
            chain_key = next_chain_key;
            self.recv_count += 1;
        }

        self.recv_chain_key = Some(chain_key);
        Ok(())
    }
}

fn message_ad(associated_data: &[u8], header: &Header) -> Vec<u8> {
    let mut ad = Vec::with_capacity(associated_data.len() + Header::SIZE);
    ad.extend_from_slice(associated_data);
    ad.extend_from_slice(&header.to_bytes());
    ad
}

fn open(
    message_key: &SymmetricKey,
    message: &SignalMessage,
    associated_data: &[u8],
) -> Result<Vec<u8>> {
    decrypt(
        message_key,
        &derive_nonce(message.header.message_number, message.header.dh_public.as_bytes()),
        &message.ciphertext,
        &message_ad(associated_data, &message.header),
    )
}

impl std::fmt::Debug for DoubleRatchet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DoubleRatchet")
            .field("send_count", &self.send_count)
            .field("recv_count", &self.recv_count)
            .field("skipped_keys", &self.skipped_message_keys.len())
            .finish()
    }
}

impl Zeroize for DoubleRatchet {
    fn zeroize(&mut self) {
        self.root_key.zeroize();
        self.send_chain_key.zeroize();
        self.recv_chain_key.zeroize();
        for skipped in &mut self.skipped_message_keys {
            skipped.key.zeroize();
        }
        self.skipped_message_keys.clear();
    }
}

impl Drop for DoubleRatchet {
    fn drop(&mut self) {
        self.zeroize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_core::OsRng;

    fn pair() -> (DoubleRatchet, DoubleRatchet) {
        let root = SymmetricKey::from_bytes([11u8; 32]);
        let bob_ratchet = SecretKey::generate(&mut OsRng);
        let alice =
            DoubleRatchet::new_sender(&mut OsRng, root.clone(), bob_ratchet.public_key()).unwrap();
        let bob = DoubleRatchet::new_receiver(root, bob_ratchet);
        (alice, bob)
    }

    #[test]
    fn test_basic_exchange() {
        let (mut alice, mut bob) = pair();

        let msg1 = alice.encrypt(b"Hello Bob!", b"ad").unwrap();
        assert_eq!(bob.decrypt(&mut OsRng, &msg1, b"ad").unwrap(), b"Hello Bob!");

        let msg2 = bob.encrypt(b"Hello Alice!", b"ad").unwrap();
        assert_eq!(alice.decrypt(&mut OsRng, &msg2, b"ad").unwrap(), b"Hello Alice!");
    }

    #[test]
    fn test_receiver_cannot_send_first() {
        let (_, mut bob) = pair();
        assert!(!bob.can_send());
        assert_eq!(bob.encrypt(b"too early", b"").unwrap_err(), Error::NoSendingChain);
    }

    #[test]
    fn test_out_of_order_uses_skipped_keys() {
        let (mut alice, mut bob) = pair();

        let first = alice.encrypt(b"one", b"").unwrap();
        let second = alice.encrypt(b"two", b"").unwrap();
        let third = alice.encrypt(b"three", b"").unwrap();

        assert_eq!(bob.decrypt(&mut OsRng, &third, b"").unwrap(), b"three");
        assert_eq!(bob.skipped_key_count(), 2);
        assert_eq!(bob.decrypt(&mut OsRng, &first, b"").unwrap(), b"one");
        assert_eq!(bob.decrypt(&mut OsRng, &second, b"").unwrap(), b"two");
        assert_eq!(bob.skipped_key_count(), 0);
    }

    #[test]
    fn test_replay_is_duplicate() {
        let (mut alice, mut bob) = pair();

        let message = alice.encrypt(b"once", b"").unwrap();
        bob.decrypt(&mut OsRng, &message, b"").unwrap();

        assert_eq!(bob.decrypt(&mut OsRng, &message, b"").unwrap_err(), Error::DuplicateMessage);
    }

    #[test]
    fn test_replay_from_retired_chain_is_duplicate() {
        let (mut alice, mut bob) = pair();

        let old = alice.encrypt(b"old chain", b"").unwrap();
        bob.decrypt(&mut OsRng, &old, b"").unwrap();

        let reply = bob.encrypt(b"reply", b"").unwrap();
        alice.decrypt(&mut OsRng, &reply, b"").unwrap();
        let fresh = alice.encrypt(b"new chain", b"").unwrap();
        bob.decrypt(&mut OsRng, &fresh, b"").unwrap();

        assert_eq!(bob.decrypt(&mut OsRng, &old, b"").unwrap_err(), Error::DuplicateMessage);
    }

    #[test]
    fn test_failed_decrypt_leaves_state_untouched() {
        let (mut alice, mut bob) = pair();

        let mut tampered = alice.encrypt(b"payload", b"").unwrap();
        let genuine = tampered.clone();
        tampered.ciphertext[0] ^= 0xFF;

        assert_eq!(bob.decrypt(&mut OsRng, &tampered, b"").unwrap_err(), Error::DecryptionFailed);
        assert_eq!(bob.decrypt(&mut OsRng, &genuine, b"").unwrap(), b"payload");
    }

    #[test]
    fn test_skip_limit() {
        let (mut alice, mut bob) = pair();

        let mut message = alice.encrypt(b"far ahead", b"").unwrap();
        message.header.message_number = MAX_SKIP + 1;

        assert_eq!(
            bob.decrypt(&mut OsRng, &message, b"").unwrap_err(),
            Error::TooManySkippedMessages
        );
    }

    #[test]
    fn test_state_survives_serialization() {
        let (mut alice, mut bob) = pair();
        let first = alice.encrypt(b"before", b"").unwrap();
        bob.decrypt(&mut OsRng, &first, b"").unwrap();

        let config = bincode::config::standard();
        let bytes = bincode::serde::encode_to_vec(&bob, config).unwrap();
        let (mut restored, _): (DoubleRatchet, usize) =
            bincode::serde::decode_from_slice(&bytes, config).unwrap();

        let second = alice.encrypt(b"after", b"").unwrap();
        assert_eq!(restored.decrypt(&mut OsRng, &second, b"").unwrap(), b"after");
    }
}
