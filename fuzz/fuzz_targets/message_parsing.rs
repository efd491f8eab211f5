//! Fuzz target for wire message parsing
//!
//! Relay bodies are decoded without knowing their type, so both decoders
//! must survive arbitrary input.

#![no_main]

use libfuzzer_sys::fuzz_target;
use signal_session::protocol::{PreKeySignalMessage, SignalMessage};

fuzz_target!(|data: &[u8]| {
    if let Ok(message) = SignalMessage::from_bytes(data) {
        let roundtrip =
            SignalMessage::from_bytes(&message.to_bytes()).expect("roundtrip should succeed");
        assert_eq!(message, roundtrip);
    }

    if let Ok(message) = PreKeySignalMessage::from_bytes(data) {
        let roundtrip = PreKeySignalMessage::from_bytes(&message.to_bytes())
            .expect("roundtrip should succeed");
        assert_eq!(message.base_key, roundtrip.base_key);
        assert_eq!(message.pre_key_id, roundtrip.pre_key_id);
        assert_eq!(message.message, roundtrip.message);
    }
});
