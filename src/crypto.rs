//! Cryptographic primitives for the key agreement and the ratchet.
//!
//! Provides the X3DH secret derivation, root and chain KDFs, and
//! ChaCha20-Poly1305 sealing of message payloads.

use crate::error::{Error, Result};
use crate::keys::DhOutput;

use chacha20poly1305::{
    aead::{Aead, Payload},
    ChaCha20Poly1305, Key, KeyInit, Nonce,
};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

const X3DH_INFO: &[u8] = b"WhisperText";
const ROOT_INFO: &[u8] = b"WhisperRatchet";

const MESSAGE_KEY_SEED: u8 = 0x01;
const CHAIN_KEY_SEED: u8 = 0x02;

pub const KEY_SIZE_32: usize = 32;
pub const KEY_SIZE_64: usize = 64;
pub const TAG_SIZE: usize = 16;
pub const NONCE_SIZE: usize = 12;

type HmacSha256 = Hmac<Sha256>;

/// 256-bit symmetric key with automatic zeroization on drop.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop, serde::Serialize, serde::Deserialize)]
pub struct SymmetricKey([u8; KEY_SIZE_32]);

impl SymmetricKey {
    /// Creates a symmetric key from raw bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; KEY_SIZE_32]) -> Self {
        Self(bytes)
    }

    /// Returns the key as a byte array reference.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE_32] {
        &self.0
    }
}

impl std::fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SymmetricKey([REDACTED])")
    }
}

/// Derives the initial root key from the X3DH outputs.
///
/// `SK = HKDF(salt = 0^32, F || DH1 || DH2 || DH3 || [DH4])` with
/// `F = 0xFF^32`. The fourth output is present only when the bundle
/// carried a one-time pre-key.
pub fn derive_x3dh_secret(
    dh1: &DhOutput,
    dh2: &DhOutput,
    dh3: &DhOutput,
    dh4: Option<&DhOutput>,
) -> Result<SymmetricKey> {
    let mut ikm = Vec::with_capacity(KEY_SIZE_32 * 5);
    ikm.extend_from_slice(&[0xFF; KEY_SIZE_32]);
    for dh in [Some(dh1), Some(dh2), Some(dh3), dh4].into_iter().flatten() {
        ikm.extend_from_slice(dh.as_bytes());
    }

    let hkdf = Hkdf::<Sha256>::new(Some(&[0u8; KEY_SIZE_32]), &ikm);
    let mut output = [0u8; KEY_SIZE_32];
    let expanded = hkdf.expand(X3DH_INFO, &mut output);
    ikm.zeroize();
    expanded.map_err(|_| Error::DecryptionFailed)?;

    Ok(SymmetricKey(output))
}

/// Root KDF for a DH ratchet step.
///
/// `(RK', CK) = HKDF(salt = RK, DH_out)`, 64 bytes split in half.
pub fn kdf_root(
    root_key: &SymmetricKey,
    dh_output: &DhOutput,
) -> Result<(SymmetricKey, SymmetricKey)> {
    let hkdf = Hkdf::<Sha256>::new(Some(root_key.as_bytes()), dh_output.as_bytes());

    let mut output = [0u8; KEY_SIZE_64];
    hkdf.expand(ROOT_INFO, &mut output)
        .map_err(|_| Error::DecryptionFailed)?;

    let mut root = [0u8; KEY_SIZE_32];
    let mut chain = [0u8; KEY_SIZE_32];
    root.copy_from_slice(&output[..KEY_SIZE_32]);
    chain.copy_from_slice(&output[KEY_SIZE_32..]);
    output.zeroize();

    Ok((SymmetricKey(root), SymmetricKey(chain)))
}

/// Chain KDF for a symmetric ratchet step.
///
/// Returns `(CK', MK)` with `MK = HMAC(CK, 0x01)` and `CK' = HMAC(CK, 0x02)`.
pub fn kdf_chain(chain_key: &SymmetricKey) -> Result<(SymmetricKey, SymmetricKey)> {
    let message_key = hmac_seed(chain_key, MESSAGE_KEY_SEED)?;
    let next_chain_key = hmac_seed(chain_key, CHAIN_KEY_SEED)?;
    Ok((next_chain_key, message_key))
}

fn hmac_seed(chain_key: &SymmetricKey, seed: u8) -> Result<SymmetricKey> {
    let mut mac =
        <HmacSha256 as Mac>::new_from_slice(chain_key.as_bytes()).map_err(|_| Error::DecryptionFailed)?;
    mac.update(&[seed]);
    Ok(SymmetricKey(mac.finalize().into_bytes().into()))
}

/// Encrypts with ChaCha20-Poly1305, appending the 16-byte tag.
///
/// The nonce must never repeat under the same key; ratchet message keys
/// are single-use so a per-message nonce from [`derive_nonce`] suffices.
pub fn encrypt(
    key: &SymmetricKey,
    nonce: &[u8; NONCE_SIZE],
    plaintext: &[u8],
    associated_data: &[u8],
) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
    cipher
        .encrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: plaintext,
                aad: associated_data,
            },
        )
        .map_err(|_| Error::DecryptionFailed)
}

/// Decrypts and authenticates a ChaCha20-Poly1305 payload.
///
/// # Errors
/// `Error::DecryptionFailed` on a wrong key, tampered ciphertext or
/// mismatched associated data.
pub fn decrypt(
    key: &SymmetricKey,
    nonce: &[u8; NONCE_SIZE],
    ciphertext: &[u8],
    associated_data: &[u8],
) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
    cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad: associated_data,
            },
        )
        .map_err(|_| Error::DecryptionFailed)
}

/// `nonce = message_number (4 bytes LE) || ratchet_key[0..8]`
#[must_use]
pub fn derive_nonce(message_number: u32, ratchet_key: &[u8; KEY_SIZE_32]) -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    nonce[..4].copy_from_slice(&message_number.to_le_bytes());
    nonce[4..].copy_from_slice(&ratchet_key[..8]);
    nonce
}
