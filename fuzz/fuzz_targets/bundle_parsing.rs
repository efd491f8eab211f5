//! Fuzz target for key server bundle answers

#![no_main]

use libfuzzer_sys::fuzz_target;
use signal_session::transport::KeyBundleResponse;
use signal_session::x3dh::PreKeyBundle;

fuzz_target!(|data: &[u8]| {
    let Ok(response) = serde_json::from_slice::<KeyBundleResponse>(data) else {
        return;
    };

    // Conversion and verification may fail but must not panic
    if let Ok(bundle) = PreKeyBundle::from_response(&response) {
        let _ = bundle.verify_signature();
    }
});
