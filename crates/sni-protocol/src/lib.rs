//! # sni-protocol
//!
//! Wire formats used by the SQL Server network interface (SNI) layer.
//!
//! Two headers live here:
//!
//! - The 16-byte SMUX header that multiplexes MARS sessions over a single
//!   physical connection ([`SmuxHeader`]).
//! - The 8-byte prelogin envelope that carries TLS handshake records before
//!   the TLS session owns the socket ([`EnvelopeHeader`]).
//!
//! The crate performs no I/O. Both headers encode into any [`bytes::BufMut`]
//! and decode from any [`bytes::Buf`].
//!
//! ```rust,ignore
//! use sni_protocol::{SmuxFrameKind, SmuxHeader};
//!
//! let header = SmuxHeader::new(SmuxFrameKind::Data, 1, 10, 0, 4);
//! let mut wire = Vec::new();
//! header.encode(&mut wire);
//! assert_eq!(SmuxHeader::decode(&mut wire.as_slice())?, header);
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod envelope;
pub mod error;
pub mod smux;

pub use envelope::{
    ENVELOPE_HEADER_SIZE, EnvelopeHeader, MAX_ENVELOPE_PAYLOAD, MAX_ENVELOPE_SIZE,
    PRELOGIN_PACKET_TYPE,
};
pub use error::ProtocolError;
pub use smux::{SMUX_HEADER_SIZE, SMUX_ID, SmuxFlags, SmuxFrameKind, SmuxHeader};
