#![no_main]

use arbitrary::Arbitrary;
use bytes::BytesMut;
use libfuzzer_sys::fuzz_target;
use sni_protocol::{ENVELOPE_HEADER_SIZE, EnvelopeHeader};

#[derive(Debug, Arbitrary)]
struct Input {
    payload_len: u16,
    is_last: bool,
    raw: Vec<u8>,
}

fuzz_target!(|input: Input| {
    let mut cursor = input.raw.as_slice();
    if let Ok(header) = EnvelopeHeader::decode(&mut cursor) {
        assert!(header.length as usize >= ENVELOPE_HEADER_SIZE);
    }

    if let Some(header) = EnvelopeHeader::for_payload(input.payload_len as usize, input.is_last) {
        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        let decoded = EnvelopeHeader::decode(&mut buf.freeze()).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(decoded.payload_length(), input.payload_len as usize);
    }
});
