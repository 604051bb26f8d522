//! Protocol-level error types.

use thiserror::Error;

/// Errors raised while decoding SNI wire headers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Not enough bytes to decode a complete header.
    #[error("incomplete header: expected {expected} bytes, got {actual}")]
    Incomplete {
        /// Bytes required.
        expected: usize,
        /// Bytes available.
        actual: usize,
    },

    /// SMUX length field smaller than the header itself.
    #[error("invalid SMUX frame length: {0}")]
    InvalidFrameLength(u32),

    /// SMUX flags that do not name a single frame kind.
    #[error("unknown SMUX flags: 0x{0:02X}")]
    UnknownFlags(u8),

    /// Envelope with a packet type other than prelogin.
    #[error("invalid envelope packet type: 0x{0:02X}")]
    InvalidEnvelopeType(u8),

    /// Envelope length smaller than the envelope header.
    #[error("invalid envelope length: {0}")]
    InvalidEnvelopeLength(u16),
}
