//! Session establishment from a fetched pre-key bundle.

use crate::address::{ProtocolAddress, DEFAULT_DEVICE_ID};
use crate::double_ratchet::DoubleRatchet;
use crate::error::{Error, Result};
use crate::keys::PublicKey;
use crate::state::{PendingPreKey, SessionState};
use crate::storage::ProtocolStore;
use crate::transport::{DeviceKeys, KeyBundleResponse};
use crate::x3dh::{self, PreKeyBundle};
use crate::xeddsa::SIGNATURE_LENGTH;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand_core::CryptoRngCore;
use tracing::debug;

impl PreKeyBundle {
    /// Builds a bundle from the server's answer for the primary device.
    ///
    /// Missing fields and undecodable base64 are `ServerDataInvalid`;
    /// well-formed but invalid keys are crypto errors.
    pub fn from_response(response: &KeyBundleResponse) -> Result<Self> {
        let device = response
            .devices
            .iter()
            .find(|device| device.device_id.unwrap_or(DEFAULT_DEVICE_ID) == DEFAULT_DEVICE_ID)
            .or_else(|| response.devices.first())
            .ok_or_else(|| invalid("devices"))?;

        let identity_key = response
            .identity_key
            .as_deref()
            .ok_or_else(|| invalid("identityKey"))?;
        let identity_key = PublicKey::deserialize(&decode_field("identityKey", identity_key)?)?;

        let signed = device
            .signed_pre_key
            .as_ref()
            .ok_or_else(|| invalid("signedPreKey"))?;
        let signed_pre_key =
            PublicKey::deserialize(&decode_field("signedPreKey.publicKey", &signed.public_key)?)?;
        let signature: [u8; SIGNATURE_LENGTH] =
            decode_field("signedPreKey.signature", &signed.signature)?
                .try_into()
                .map_err(|_| Error::InvalidSignature)?;

        let pre_key = match &device.pre_key {
            Some(entity) => Some((
                entity.key_id,
                PublicKey::deserialize(&decode_field("preKey.publicKey", &entity.public_key)?)?,
            )),
            None => None,
        };

        Ok(Self {
            registration_id: registration_id(device)?,
            device_id: device.device_id.unwrap_or(DEFAULT_DEVICE_ID),
            pre_key,
            signed_pre_key_id: signed.key_id,
            signed_pre_key,
            signed_pre_key_signature: signature,
            identity_key,
        })
    }
}

fn registration_id(device: &DeviceKeys) -> Result<u32> {
    device
        .registration_id
        .ok_or_else(|| invalid("registrationId"))
}

fn decode_field(field: &str, value: &str) -> Result<Vec<u8>> {
    STANDARD.decode(value).map_err(|_| invalid(field))
}

fn invalid(field: &str) -> Error {
    Error::ServerDataInvalid(format!("bundle field {field} is missing or malformed"))
}

/// Creates sessions with one remote address.
pub struct SessionBuilder<'a> {
    store: &'a ProtocolStore,
    remote: &'a ProtocolAddress,
}

impl<'a> SessionBuilder<'a> {
    #[must_use]
    pub fn new(store: &'a ProtocolStore, remote: &'a ProtocolAddress) -> Self {
        Self { store, remote }
    }

    /// Runs X3DH against `bundle` and stores the resulting session.
    ///
    /// The new state becomes current; an existing session is archived. The
    /// bundle's identity is pinned once the session is persisted.
    pub fn process_bundle<R: CryptoRngCore>(
        &self,
        rng: &mut R,
        bundle: &PreKeyBundle,
    ) -> Result<()> {
        if !self.store.identity.is_trusted(self.remote, &bundle.identity_key) {
            return Err(Error::UntrustedIdentity(self.remote.to_string()));
        }

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

        let agreement = x3dh::initiate(rng, &identity, bundle)?;
        let ratchet = DoubleRatchet::new_sender(rng, agreement.root_key, bundle.signed_pre_key)?;

        let state = SessionState {
            local_identity: *identity.public_key(),
            remote_identity: bundle.identity_key,
            local_registration_id,
            remote_registration_id: bundle.registration_id,
            base_key: agreement.base_key,
            associated_data: agreement.associated_data,
            pending_pre_key: Some(PendingPreKey {
                pre_key_id: bundle.pre_key.map(|(id, _)| id),
                signed_pre_key_id: bundle.signed_pre_key_id,
                base_key: agreement.base_key,
            }),
            ratchet,
        };

        let mut record = self.store.sessions.load(self.remote).unwrap_or_default();
        record.promote_state(state);
        if !self.store.sessions.store(self.remote, &record) {
            return Err(Error::Storage(format!("session for {}", self.remote)));
        }
        self.store
            .identity
            .save_identity(self.remote, &bundle.identity_key);

        debug!(
            address = %self.remote,
            pre_key_id = ?bundle.pre_key.map(|(id, _)| id),
            signed_pre_key_id = bundle.signed_pre_key_id,
            "session established from bundle"
        );
        Ok(())
    }
}

impl std::fmt::Debug for SessionBuilder<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionBuilder")
            .field("remote", self.remote)
            .finish()
    }
}
