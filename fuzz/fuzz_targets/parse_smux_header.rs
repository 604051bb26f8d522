#![no_main]

use libfuzzer_sys::fuzz_target;
use sni_protocol::{SMUX_HEADER_SIZE, SmuxHeader};

fuzz_target!(|data: &[u8]| {
    let mut cursor = data;
    if let Ok(header) = SmuxHeader::decode(&mut cursor) {
        // a decoded header re-encodes to the bytes it came from
        let encoded = header.to_bytes();
        assert_eq!(&encoded[..], &data[..SMUX_HEADER_SIZE]);
        let _ = header.kind();
    }
});
