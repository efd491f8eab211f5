//! X3DH (Extended Triple Diffie-Hellman) key agreement.
//!
//! Signal's asynchronous key agreement:
//! <https://signal.org/docs/specifications/x3dh/>
//!
//! 1. **Responder** publishes a bundle: identity key, signed pre-key with an
//!    XEdDSA signature by the identity key, and optionally a one-time
//!    pre-key.
//! 2. **Initiator** verifies the signature, generates an ephemeral base
//!    key and computes
//!    - DH1 = `DH(IK_A, SPK_B)`
//!    - DH2 = `DH(EK_A, IK_B)`
//!    - DH3 = `DH(EK_A, SPK_B)`
//!    - DH4 = `DH(EK_A, OPK_B)` when a one-time pre-key was offered
//! 3. **Responder** recomputes the same secret from the base key and identity
//!    key carried by the first `PreKeySignalMessage`.
//!
//! Both sides use `IK_A || IK_B` as associated data for every message.

use crate::crypto::{derive_x3dh_secret, SymmetricKey};
use crate::error::Result;
use crate::keys::{IdentityKeyPair, KeyPair, PublicKey, SecretKey};
use crate::xeddsa::{self, SIGNATURE_LENGTH};
use rand_core::CryptoRngCore;

/// A remote device's published key material.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreKeyBundle {
    pub registration_id: u32,
    pub device_id: u32,

    /// One-time pre-key id and public key, if the server had one left
    pub pre_key: Option<(u32, PublicKey)>,

    pub signed_pre_key_id: u32,
    pub signed_pre_key: PublicKey,

    /// XEdDSA signature over the serialized signed pre-key
    pub signed_pre_key_signature: [u8; SIGNATURE_LENGTH],

    /// Long-term identity key
    pub identity_key: PublicKey,
}

impl PreKeyBundle {
    /// Verifies the identity key's signature on the signed pre-key.
    pub fn verify_signature(&self) -> Result<()> {
        xeddsa::verify(
            &self.identity_key,
            &self.signed_pre_key.serialize(),
            &self.signed_pre_key_signature,
        )
    }
}

/// Result of X3DH initiation.
#[derive(Debug)]
pub struct InitiatorResult {
    /// Initial root key
    pub root_key: SymmetricKey,

    /// Public half of the ephemeral key, sent in every pre-key message
    pub base_key: PublicKey,

    /// `IK_A || IK_B`
    pub associated_data: Vec<u8>,
}

/// Result of X3DH response.
#[derive(Debug)]
pub struct ResponderResult {
    pub root_key: SymmetricKey,
    pub associated_data: Vec<u8>,
}

/// Local key material the responder needs to answer an initiation.
pub struct ResponderKeys<'a> {
    pub identity: &'a IdentityKeyPair,
    pub signed_pre_key: &'a KeyPair,
    pub one_time_pre_key: Option<&'a KeyPair>,
}

/// Initiates X3DH against `bundle`.
///
/// Fails with `Error::InvalidSignature` when the bundle's signed pre-key
/// was not signed by its identity key.
pub fn initiate<R: CryptoRngCore>(
    rng: &mut R,
    identity: &IdentityKeyPair,
    bundle: &PreKeyBundle,
) -> Result<InitiatorResult> {
    bundle.verify_signature()?;

    let ephemeral = SecretKey::generate(rng);

    let dh1 = identity.secret_key().diffie_hellman(&bundle.signed_pre_key);
    let dh2 = ephemeral.diffie_hellman(&bundle.identity_key);
    let dh3 = ephemeral.diffie_hellman(&bundle.signed_pre_key);
    let dh4 = bundle
        .pre_key
        .map(|(_, one_time)| ephemeral.diffie_hellman(&one_time));

    let root_key = derive_x3dh_secret(&dh1, &dh2, &dh3, dh4.as_ref())?;

    Ok(InitiatorResult {
        root_key,
        base_key: ephemeral.public_key(),
        associated_data: associated_data(identity.public_key(), &bundle.identity_key),
    })
}

/// Answers an initiation from `remote_identity` with base key `base_key`.
pub fn respond(
    keys: &ResponderKeys<'_>,
    remote_identity: &PublicKey,
    base_key: &PublicKey,
) -> Result<ResponderResult> {
    let dh1 = keys
        .signed_pre_key
        .secret_key()
        .diffie_hellman(remote_identity);
    let dh2 = keys.identity.secret_key().diffie_hellman(base_key);
    let dh3 = keys.signed_pre_key.secret_key().diffie_hellman(base_key);
    let dh4 = keys
        .one_time_pre_key
        .map(|one_time| one_time.secret_key().diffie_hellman(base_key));

    let root_key = derive_x3dh_secret(&dh1, &dh2, &dh3, dh4.as_ref())?;

    Ok(ResponderResult {
        root_key,
        associated_data: associated_data(remote_identity, keys.identity.public_key()),
    })
}

fn associated_data(initiator: &PublicKey, responder: &PublicKey) -> Vec<u8> {
    let mut ad = Vec::with_capacity(PublicKey::SERIALIZED_SIZE * 2);
    ad.extend_from_slice(&initiator.serialize());
    ad.extend_from_slice(&responder.serialize());
    ad
}
