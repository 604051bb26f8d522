//! SMUX frame header.
//!
//! Every frame exchanged on a MARS connection starts with a 16-byte header:
//!
//! ```text
//! offset  size  field
//! 0       1     SMID (0x53)
//! 1       1     flags (SYN=1, ACK=2, FIN=4, DATA=8)
//! 2       2     session id          (little endian)
//! 4       4     frame length        (little endian, includes this header)
//! 8       4     sequence number     (little endian)
//! 12      4     highwater mark      (little endian)
//! ```
//!
//! [`SmuxHeader::length`] holds the payload length. The header size is added
//! on encode and subtracted on decode.

use bitflags::bitflags;
use bytes::{Buf, BufMut};

use crate::error::ProtocolError;

/// SMUX header size in bytes.
pub const SMUX_HEADER_SIZE: usize = 16;

/// Protocol marker carried in the first byte of every SMUX header.
pub const SMUX_ID: u8 = 0x53;

bitflags! {
    /// SMUX header flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SmuxFlags: u8 {
        /// Session open.
        const SYN = 0x01;
        /// Window acknowledgment.
        const ACK = 0x02;
        /// Session close.
        const FIN = 0x04;
        /// Payload frame.
        const DATA = 0x08;
    }
}

/// The kind of a SMUX frame.
///
/// A well-formed frame carries exactly one flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SmuxFrameKind {
    /// Opens a session.
    Syn,
    /// Advertises a new receive window.
    Ack,
    /// Closes a session.
    Fin,
    /// Carries session payload.
    Data,
}

impl SmuxFrameKind {
    /// Resolve the frame kind from header flags.
    pub fn from_flags(flags: SmuxFlags) -> Result<Self, ProtocolError> {
        if flags == SmuxFlags::SYN {
            Ok(Self::Syn)
        } else if flags == SmuxFlags::ACK {
            Ok(Self::Ack)
        } else if flags == SmuxFlags::FIN {
            Ok(Self::Fin)
        } else if flags == SmuxFlags::DATA {
            Ok(Self::Data)
        } else {
            Err(ProtocolError::UnknownFlags(flags.bits()))
        }
    }

    /// The header flags for this frame kind.
    #[must_use]
    pub const fn flags(self) -> SmuxFlags {
        match self {
            Self::Syn => SmuxFlags::SYN,
            Self::Ack => SmuxFlags::ACK,
            Self::Fin => SmuxFlags::FIN,
            Self::Data => SmuxFlags::DATA,
        }
    }
}

/// SMUX frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SmuxHeader {
    /// Protocol marker, [`SMUX_ID`] on well-formed frames.
    pub smid: u8,
    /// Frame flags. Unknown bits are preserved.
    pub flags: SmuxFlags,
    /// Logical session id.
    pub session_id: u16,
    /// Payload length, excluding the 16-byte header.
    pub length: u32,
    /// Sender's sequence number.
    pub sequence_number: u32,
    /// Sender's receive window highwater mark.
    pub highwater: u32,
}

impl SmuxHeader {
    /// Create a header for the given frame kind.
    #[must_use]
    pub const fn new(
        kind: SmuxFrameKind,
        session_id: u16,
        length: u32,
        sequence_number: u32,
        highwater: u32,
    ) -> Self {
        Self {
            smid: SMUX_ID,
            flags: kind.flags(),
            session_id,
            length,
            sequence_number,
            highwater,
        }
    }

    /// Decode a header from bytes.
    ///
    /// The wire length must cover at least the header itself.
    pub fn decode(src: &mut impl Buf) -> Result<Self, ProtocolError> {
        if src.remaining() < SMUX_HEADER_SIZE {
            return Err(ProtocolError::Incomplete {
                expected: SMUX_HEADER_SIZE,
                actual: src.remaining(),
            });
        }

        let smid = src.get_u8();
        let flags = SmuxFlags::from_bits_retain(src.get_u8());
        let session_id = src.get_u16_le();
        let wire_length = src.get_u32_le();
        let sequence_number = src.get_u32_le();
        let highwater = src.get_u32_le();

        let length = wire_length
            .checked_sub(SMUX_HEADER_SIZE as u32)
            .ok_or(ProtocolError::InvalidFrameLength(wire_length))?;

        Ok(Self {
            smid,
            flags,
            session_id,
            length,
            sequence_number,
            highwater,
        })
    }

    /// Encode the header to bytes.
    ///
    /// The payload length is widened by the header size. A payload length
    /// within 16 bytes of `u32::MAX` saturates.
    pub fn encode(&self, dst: &mut impl BufMut) {
        dst.put_u8(self.smid);
        dst.put_u8(self.flags.bits());
        dst.put_u16_le(self.session_id);
        dst.put_u32_le(self.frame_length());
        dst.put_u32_le(self.sequence_number);
        dst.put_u32_le(self.highwater);
    }

    /// Encode the header into a fixed array.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; SMUX_HEADER_SIZE] {
        let mut out = [0u8; SMUX_HEADER_SIZE];
        self.encode(&mut out.as_mut_slice());
        out
    }

    /// Total frame length as carried on the wire.
    #[must_use]
    pub const fn frame_length(&self) -> u32 {
        self.length.saturating_add(SMUX_HEADER_SIZE as u32)
    }

    /// Payload length as a buffer size.
    #[must_use]
    pub const fn payload_length(&self) -> usize {
        self.length as usize
    }

    /// Resolve the frame kind from the flags.
    pub fn kind(&self) -> Result<SmuxFrameKind, ProtocolError> {
        SmuxFrameKind::from_flags(self.flags)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_layout() {
        let header = SmuxHeader::new(SmuxFrameKind::Data, 0x0102, 10, 7, 9);
        let bytes = header.to_bytes();

        assert_eq!(bytes[0], SMUX_ID);
        assert_eq!(bytes[1], 0x08);
        assert_eq!(&bytes[2..4], &[0x02, 0x01]);
        assert_eq!(&bytes[4..8], &26u32.to_le_bytes());
        assert_eq!(&bytes[8..12], &7u32.to_le_bytes());
        assert_eq!(&bytes[12..16], &9u32.to_le_bytes());
    }

    #[test]
    fn test_decode_subtracts_header_length() {
        let mut wire = vec![SMUX_ID, 0x02, 0x05, 0x00];
        wire.extend_from_slice(&16u32.to_le_bytes());
        wire.extend_from_slice(&3u32.to_le_bytes());
        wire.extend_from_slice(&12u32.to_le_bytes());

        let header = SmuxHeader::decode(&mut wire.as_slice()).unwrap();
        assert_eq!(header.length, 0);
        assert_eq!(header.session_id, 5);
        assert_eq!(header.kind().unwrap(), SmuxFrameKind::Ack);
        assert_eq!(header.highwater, 12);
    }

    #[test]
    fn test_decode_incomplete() {
        let wire = [SMUX_ID, 0x08, 0x00];
        let err = SmuxHeader::decode(&mut wire.as_slice()).unwrap_err();
        assert_eq!(
            err,
            ProtocolError::Incomplete {
                expected: SMUX_HEADER_SIZE,
                actual: 3
            }
        );
    }

    #[test]
    fn test_decode_rejects_short_frame_length() {
        let mut wire = vec![SMUX_ID, 0x08, 0x00, 0x00];
        wire.extend_from_slice(&15u32.to_le_bytes());
        wire.extend_from_slice(&[0u8; 8]);

        let err = SmuxHeader::decode(&mut wire.as_slice()).unwrap_err();
        assert_eq!(err, ProtocolError::InvalidFrameLength(15));
    }

    #[test]
    fn test_unknown_flags_survive_decode() {
        let mut header = SmuxHeader::new(SmuxFrameKind::Data, 1, 0, 0, 4);
        header.flags = SmuxFlags::DATA | SmuxFlags::ACK;
        let decoded = SmuxHeader::decode(&mut header.to_bytes().as_slice()).unwrap();

        assert_eq!(decoded.flags.bits(), 0x0A);
        assert_eq!(decoded.kind(), Err(ProtocolError::UnknownFlags(0x0A)));
    }

    #[test]
    fn test_frame_kind_flags() {
        for kind in [
            SmuxFrameKind::Syn,
            SmuxFrameKind::Ack,
            SmuxFrameKind::Fin,
            SmuxFrameKind::Data,
        ] {
            assert_eq!(SmuxFrameKind::from_flags(kind.flags()).unwrap(), kind);
        }
        assert!(SmuxFrameKind::from_flags(SmuxFlags::empty()).is_err());
    }
}
