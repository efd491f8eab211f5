//! XEdDSA signatures with X25519 identity keys.
//!
//! Follows "The XEdDSA and VXEdDSA Signature Schemes" (Perrin, revision 1).
//! The Montgomery secret is mapped to an Edwards scalar whose public point
//! has a zero sign bit, so verifiers can derive the Edwards key from the
//! Montgomery public key alone.

use crate::error::{Error, Result};
use crate::keys::{PublicKey, SecretKey};
use curve25519_dalek::{
    constants::ED25519_BASEPOINT_TABLE,
    edwards::{CompressedEdwardsY, EdwardsPoint},
    montgomery::MontgomeryPoint,
    scalar::Scalar,
};
use rand_core::CryptoRngCore;
use sha2::{Digest, Sha512};
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Signature length: R (32) || s (32)
pub const SIGNATURE_LENGTH: usize = 64;

/// Edwards form of an X25519 secret, sign-normalised.
#[derive(Zeroize, ZeroizeOnDrop)]
struct SigningScalar {
    a: Scalar,
    #[zeroize(skip)]
    public: CompressedEdwardsY,
}

impl SigningScalar {
    fn from_secret(secret: &SecretKey) -> Self {
        let mut k = secret.to_bytes();
        k[0] &= 248;
        k[31] &= 127;
        k[31] |= 64;

        let k_scalar = Scalar::from_bytes_mod_order(k);
        k.zeroize();

        let mut public = (&k_scalar * ED25519_BASEPOINT_TABLE).compress().to_bytes();
        let negative = public[31] >> 7 == 1;
        public[31] &= 0x7F;

        Self {
            a: if negative { -k_scalar } else { k_scalar },
            public: CompressedEdwardsY(public),
        }
    }
}

/// Signs `message` under the Edwards form of `secret`.
pub fn sign<R: CryptoRngCore>(
    rng: &mut R,
    secret: &SecretKey,
    message: &[u8],
) -> [u8; SIGNATURE_LENGTH] {
    let signer = SigningScalar::from_secret(secret);

    let mut nonce_seed = [0u8; 64];
    rng.fill_bytes(&mut nonce_seed);

    // r = hash1(a || M || Z)
    let mut hasher = Sha512::new();
    hasher.update([0xFE]);
    hasher.update([0xFF; 31]);
    hasher.update(signer.a.as_bytes());
    hasher.update(message);
    hasher.update(nonce_seed);
    let r = wide_scalar(&hasher.finalize());
    nonce_seed.zeroize();

    let r_point = (&r * ED25519_BASEPOINT_TABLE).compress();
    let h = challenge(&r_point, &signer.public, message);
    let s = r + h * signer.a;

    let mut signature = [0u8; SIGNATURE_LENGTH];
    signature[..32].copy_from_slice(r_point.as_bytes());
    signature[32..].copy_from_slice(s.as_bytes());
    signature
}

/// Verifies an XEdDSA signature against an X25519 public key.
pub fn verify(
    public: &PublicKey,
    message: &[u8],
    signature: &[u8; SIGNATURE_LENGTH],
) -> Result<()> {
    let edwards_public = edwards_public_key(public)?;

    let mut r_bytes = [0u8; 32];
    let mut s_bytes = [0u8; 32];
    r_bytes.copy_from_slice(&signature[..32]);
    s_bytes.copy_from_slice(&signature[32..]);

    // s must be below 2^253
    if s_bytes[31] & 0xE0 != 0 {
        return Err(Error::InvalidSignature);
    }
    let r_point = CompressedEdwardsY(r_bytes);
    r_point.decompress().ok_or(Error::InvalidSignature)?;

    let a_point = edwards_public
        .decompress()
        .ok_or(Error::InvalidPublicKey)?;
    if !a_point.is_torsion_free() {
        return Err(Error::InvalidPublicKey);
    }

    let s = Scalar::from_bytes_mod_order(s_bytes);
    let h = challenge(&r_point, &edwards_public, message);

    // R' = sB - hA
    let expected = EdwardsPoint::vartime_double_scalar_mul_basepoint(&h, &-a_point, &s).compress();
    if bool::from(expected.as_bytes()[..].ct_eq(&r_bytes[..])) {
        Ok(())
    } else {
        Err(Error::InvalidSignature)
    }
}

fn edwards_public_key(public: &PublicKey) -> Result<CompressedEdwardsY> {
    let mut u = *public.as_bytes();
    u[31] &= 0x7F;
    let edwards = MontgomeryPoint(u)
        .to_edwards(0)
        .ok_or(Error::InvalidPublicKey)?;
    Ok(edwards.compress())
}

fn challenge(r_point: &CompressedEdwardsY, public: &CompressedEdwardsY, message: &[u8]) -> Scalar {
    let mut hasher = Sha512::new();
    hasher.update(r_point.as_bytes());
    hasher.update(public.as_bytes());
    hasher.update(message);
    wide_scalar(&hasher.finalize())
}

fn wide_scalar(digest: &[u8]) -> Scalar {
    let mut wide = [0u8; 64];
    wide.copy_from_slice(digest);
    let scalar = Scalar::from_bytes_mod_order_wide(&wide);
    wide.zeroize();
    scalar
}
