//! Fuzz target for encryption/decryption with corrupted inputs

#![no_main]

use libfuzzer_sys::fuzz_target;
use signal_session::crypto::{decrypt, encrypt, SymmetricKey, NONCE_SIZE};

fuzz_target!(|data: &[u8]| {
    if data.len() < 32 + NONCE_SIZE {
        return;
    }

    let key = SymmetricKey::from_bytes(data[..32].try_into().unwrap());
    let nonce: [u8; NONCE_SIZE] = data[32..32 + NONCE_SIZE].try_into().unwrap();
    let plaintext = &data[32 + NONCE_SIZE..];

    let ciphertext = encrypt(&key, &nonce, plaintext, b"ad").expect("encryption should succeed");
    let decrypted = decrypt(&key, &nonce, &ciphertext, b"ad").expect("decryption should succeed");
    assert_eq!(decrypted, plaintext);

    let mut corrupted = ciphertext.clone();
    corrupted[0] ^= 1;
    assert!(decrypt(&key, &nonce, &corrupted, b"ad").is_err());
    assert!(decrypt(&key, &nonce, &ciphertext, b"wrong").is_err());
});
