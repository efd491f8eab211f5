#![no_main]

use libfuzzer_sys::fuzz_target;
use signal_session::keys::PublicKey;
use signal_session::xeddsa::{verify, SIGNATURE_LENGTH};

fuzz_target!(|data: &[u8]| {
    if data.len() < 32 + SIGNATURE_LENGTH {
        return;
    }

    let public = PublicKey::from_bytes(data[..32].try_into().unwrap());
    let signature: [u8; SIGNATURE_LENGTH] = data[32..32 + SIGNATURE_LENGTH].try_into().unwrap();
    let message = &data[32 + SIGNATURE_LENGTH..];

    // Arbitrary keys and signatures must be rejected, never panic
    let _ = verify(&public, message, &signature);
});
