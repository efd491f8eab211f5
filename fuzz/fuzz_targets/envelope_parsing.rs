#![no_main]

use libfuzzer_sys::fuzz_target;
use signal_session::{Envelope, UnreadTally};

fuzz_target!(|data: &[u8]| {
    let Ok(raw) = std::str::from_utf8(data) else {
        return;
    };
    if let Ok(envelope) = Envelope::from_json(raw) {
        let _ = envelope.body();
        let _ = envelope.is_decryptable_for(&envelope.source);
        let tally: UnreadTally = std::iter::once(&envelope).collect();
        assert_eq!(tally.is_empty(), !envelope.is_ciphertext());
    }
});
