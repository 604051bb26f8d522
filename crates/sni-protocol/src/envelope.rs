//! Prelogin envelope carrying TLS handshake records.
//!
//! Until the TLS handshake completes, handshake bytes travel inside TDS
//! prelogin packets. Each chunk gets an 8-byte header:
//!
//! ```text
//! byte 0     packet type (0x12)
//! byte 1     1 on the last chunk of a write, else 0
//! bytes 2-3  envelope length including this header (big endian)
//! bytes 4-7  zero
//! ```

use bytes::{Buf, BufMut};

use crate::error::ProtocolError;

/// Envelope header size in bytes.
pub const ENVELOPE_HEADER_SIZE: usize = 8;

/// TDS prelogin packet type.
pub const PRELOGIN_PACKET_TYPE: u8 = 0x12;

/// Largest envelope written during the handshake.
pub const MAX_ENVELOPE_SIZE: usize = 4096;

/// Largest payload carried by one envelope.
pub const MAX_ENVELOPE_PAYLOAD: usize = MAX_ENVELOPE_SIZE - ENVELOPE_HEADER_SIZE;

/// Prelogin envelope header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvelopeHeader {
    /// Whether this envelope ends the current write.
    pub is_last: bool,
    /// Envelope length including the header.
    pub length: u16,
}

impl EnvelopeHeader {
    /// Create the header for a chunk of `payload_len` bytes.
    ///
    /// Returns `None` if the chunk does not fit in one envelope.
    #[must_use]
    pub fn for_payload(payload_len: usize, is_last: bool) -> Option<Self> {
        if payload_len > MAX_ENVELOPE_PAYLOAD {
            return None;
        }
        Some(Self {
            is_last,
            length: (payload_len + ENVELOPE_HEADER_SIZE) as u16,
        })
    }

    /// Decode an envelope header.
    pub fn decode(src: &mut impl Buf) -> Result<Self, ProtocolError> {
        if src.remaining() < ENVELOPE_HEADER_SIZE {
            return Err(ProtocolError::Incomplete {
                expected: ENVELOPE_HEADER_SIZE,
                actual: src.remaining(),
            });
        }

        let packet_type = src.get_u8();
        if packet_type != PRELOGIN_PACKET_TYPE {
            return Err(ProtocolError::InvalidEnvelopeType(packet_type));
        }
        let is_last = src.get_u8() != 0;
        let length = src.get_u16();
        src.advance(4);

        if usize::from(length) < ENVELOPE_HEADER_SIZE {
            return Err(ProtocolError::InvalidEnvelopeLength(length));
        }

        Ok(Self { is_last, length })
    }

    /// Encode the envelope header.
    pub fn encode(&self, dst: &mut impl BufMut) {
        dst.put_u8(PRELOGIN_PACKET_TYPE);
        dst.put_u8(u8::from(self.is_last));
        dst.put_u16(self.length);
        dst.put_u32(0);
    }

    /// Payload bytes following this header.
    #[must_use]
    pub const fn payload_length(&self) -> usize {
        (self.length as usize).saturating_sub(ENVELOPE_HEADER_SIZE)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_full_chunk_header() {
        let header = EnvelopeHeader::for_payload(MAX_ENVELOPE_PAYLOAD, false).unwrap();
        let mut buf = Vec::new();
        header.encode(&mut buf);

        assert_eq!(buf, [0x12, 0x00, 0x10, 0x00, 0, 0, 0, 0]);
    }

    #[test]
    fn test_last_chunk_header() {
        let header = EnvelopeHeader::for_payload(912, true).unwrap();
        let mut buf = Vec::new();
        header.encode(&mut buf);

        assert_eq!(buf, [0x12, 0x01, 0x03, 0x98, 0, 0, 0, 0]);
        assert_eq!(header.payload_length(), 912);
    }

    #[test]
    fn test_oversized_chunk() {
        assert!(EnvelopeHeader::for_payload(MAX_ENVELOPE_PAYLOAD + 1, true).is_none());
    }

    #[test]
    fn test_decode_rejects_wrong_type() {
        let wire = [0x04, 0x01, 0x00, 0x10, 0, 0, 0, 0];
        assert_eq!(
            EnvelopeHeader::decode(&mut wire.as_slice()),
            Err(ProtocolError::InvalidEnvelopeType(0x04))
        );
    }

    #[test]
    fn test_decode_rejects_short_length() {
        let wire = [0x12, 0x01, 0x00, 0x07, 0, 0, 0, 0];
        assert_eq!(
            EnvelopeHeader::decode(&mut wire.as_slice()),
            Err(ProtocolError::InvalidEnvelopeLength(7))
        );
    }

    #[test]
    fn test_decode_empty_envelope() {
        let wire = [0x12, 0x00, 0x00, 0x08, 0, 0, 0, 0];
        let header = EnvelopeHeader::decode(&mut wire.as_slice()).unwrap();
        assert_eq!(header.payload_length(), 0);
        assert!(!header.is_last);
    }
}
