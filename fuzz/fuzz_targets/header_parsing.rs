//! Fuzz target for ratchet header parsing

#![no_main]

use libfuzzer_sys::fuzz_target;
use signal_session::protocol::Header;

fuzz_target!(|data: &[u8]| {
    if let Ok(header) = Header::from_bytes(data) {
        let roundtrip = Header::from_bytes(&header.to_bytes()).expect("roundtrip should succeed");
        assert_eq!(header, roundtrip);
    }
});
