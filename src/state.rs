//! Per-address session state and its persisted record.
//!
//! A [`SessionRecord`] holds the active [`SessionState`] plus a bounded list
//! of archived states. Archived states keep late messages on a replaced
//! session decryptable, and let two devices that initiated simultaneously
//! converge on whichever state the peer keeps using.

use crate::double_ratchet::DoubleRatchet;
use crate::error::Result;
use crate::keys::PublicKey;
use crate::protocol::{CiphertextMessage, PreKeySignalMessage, SignalMessage};
use rand_core::CryptoRngCore;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Archived states kept per record.
pub const ARCHIVED_STATES_MAX: usize = 40;

/// X3DH material repeated in every outgoing message until the peer replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingPreKey {
    pub pre_key_id: Option<u32>,
    pub signed_pre_key_id: u32,
    pub base_key: PublicKey,
}

/// One ratchet session with a remote device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    pub(crate) local_identity: PublicKey,
    pub(crate) remote_identity: PublicKey,
    pub(crate) local_registration_id: u32,
    pub(crate) remote_registration_id: u32,
    pub(crate) base_key: PublicKey,
    pub(crate) associated_data: Vec<u8>,
    pub(crate) pending_pre_key: Option<PendingPreKey>,
    pub(crate) ratchet: DoubleRatchet,
}

impl SessionState {
    #[must_use]
    pub fn remote_identity(&self) -> &PublicKey {
        &self.remote_identity
    }

    #[must_use]
    pub fn local_identity(&self) -> &PublicKey {
        &self.local_identity
    }

    #[must_use]
    pub fn remote_registration_id(&self) -> u32 {
        self.remote_registration_id
    }

    /// Base key of the X3DH agreement that created this state.
    #[must_use]
    pub fn base_key(&self) -> &PublicKey {
        &self.base_key
    }

    /// Whether outgoing messages still carry X3DH material.
    #[must_use]
    pub fn has_pending_pre_key(&self) -> bool {
        self.pending_pre_key.is_some()
    }

    /// Encrypts `plaintext`, wrapping it in a pre-key message while the
    /// peer has not answered yet.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<CiphertextMessage> {
        let message = self.ratchet.encrypt(plaintext, &self.associated_data)?;

        Ok(match self.pending_pre_key {
            Some(pending) => CiphertextMessage::PreKey(PreKeySignalMessage {
                registration_id: self.local_registration_id,
                pre_key_id: pending.pre_key_id,
                signed_pre_key_id: pending.signed_pre_key_id,
                base_key: pending.base_key,
                identity_key: self.local_identity,
                message,
            }),
            None => CiphertextMessage::Signal(message),
        })
    }

    /// Decrypts `message`; a successful decrypt acknowledges our pre-key
    /// material.
    pub fn decrypt<R: CryptoRngCore>(
        &mut self,
        rng: &mut R,
        message: &SignalMessage,
    ) -> Result<Vec<u8>> {
        let plaintext = self.ratchet.decrypt(rng, message, &self.associated_data)?;
        self.pending_pre_key = None;
        Ok(plaintext)
    }
}

/// Everything persisted for one remote address.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionRecord {
    current: Option<SessionState>,
    previous: VecDeque<SessionState>,
}

impl SessionRecord {
    #[must_use]
    pub fn new(state: SessionState) -> Self {
        Self {
            current: Some(state),
            previous: VecDeque::new(),
        }
    }

    #[must_use]
    pub fn session_state(&self) -> Option<&SessionState> {
        self.current.as_ref()
    }

    pub fn session_state_mut(&mut self) -> Option<&mut SessionState> {
        self.current.as_mut()
    }

    #[must_use]
    pub fn previous_states(&self) -> &VecDeque<SessionState> {
        &self.previous
    }

    pub(crate) fn previous_state_mut(&mut self, index: usize) -> Option<&mut SessionState> {
        self.previous.get_mut(index)
    }

    /// Makes `state` current, archiving the previous current state.
    pub fn promote_state(&mut self, state: SessionState) {
        self.archive_current_state();
        self.current = Some(state);
    }

    /// Moves archived state `index` back to current.
    pub fn promote_previous(&mut self, index: usize) {
        if let Some(state) = self.previous.remove(index) {
            self.promote_state(state);
        }
    }

    pub fn archive_current_state(&mut self) {
        if let Some(state) = self.current.take() {
            self.previous.push_front(state);
            self.previous.truncate(ARCHIVED_STATES_MAX);
        }
    }

    /// Makes the state created with `base_key` current, if one exists.
    ///
    /// Returns `false` when no state was built from that agreement.
    pub fn select_state_with_base_key(&mut self, base_key: &PublicKey) -> bool {
        if self
            .current
            .as_ref()
            .is_some_and(|state| state.base_key == *base_key)
        {
            return true;
        }
        match self
            .previous
            .iter()
            .position(|state| state.base_key == *base_key)
        {
            Some(index) => {
                self.promote_previous(index);
                true
            }
            None => false,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serde::encode_to_vec(
            self,
            bincode::config::standard(),
        )?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let (record, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())?;
        Ok(record)
    }
}
