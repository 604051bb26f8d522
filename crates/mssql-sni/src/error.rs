//! SNI error types.

use std::io;
use std::sync::Arc;

use sni_protocol::ProtocolError;
use sni_tls::TlsError;
use thiserror::Error;

/// Native SNI error numbers.
///
/// These are the numbers SQL Server client tooling reports for transport
/// failures, kept so errors can be correlated with server-side diagnostics.
pub mod codes {
    /// The peer closed the connection.
    pub const CONNECTION_TERMINATED: u32 = 2;
    /// A parameter (such as a session id) was not valid.
    pub const INVALID_PARAMETER: u32 = 5;
    /// A wait or connection attempt timed out.
    pub const CONNECTION_TIMEOUT: u32 = 11;
    /// The connection cannot be used for further I/O.
    pub const CONNECTION_NOT_USABLE: u32 = 19;
    /// The TLS handshake failed.
    pub const HANDSHAKE_FAILURE: u32 = 31;
    /// An internal invariant was violated.
    pub const INTERNAL_EXCEPTION: u32 = 35;
    /// The connection could not be opened.
    pub const CONNECTION_OPEN_FAILED: u32 = 40;
}

/// Errors produced by the SNI layer.
///
/// Errors are cheap to clone so a connection failure can be latched and
/// reported to every session that asks.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum SniError {
    /// The peer closed the connection (zero-length read).
    #[error("connection terminated by peer")]
    ConnectionTerminated,

    /// A frame addressed a session this connection does not know.
    #[error("frame addressed to unknown session {0}")]
    UnknownSession(u16),

    /// A synchronous wait elapsed without data.
    #[error("wait timed out")]
    WaitTimeout,

    /// The connection could not start receiving.
    #[error("connection is not usable")]
    ConnectionNotUsable,

    /// The physical handle has been disposed.
    #[error("connection is closed")]
    ConnectionClosed,

    /// A wire header could not be decoded.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Transport I/O failure.
    #[error("IO error: {0}")]
    Io(Arc<io::Error>),

    /// TLS negotiation failure.
    #[error("TLS error: {0}")]
    Tls(Arc<TlsError>),

    /// An internal invariant was violated.
    #[error("internal error: {0}")]
    Internal(String),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl SniError {
    /// Native SNI error number for this error.
    #[must_use]
    pub fn code(&self) -> u32 {
        match self {
            Self::ConnectionTerminated | Self::Io(_) => codes::CONNECTION_TERMINATED,
            Self::UnknownSession(_) | Self::Configuration(_) => codes::INVALID_PARAMETER,
            Self::WaitTimeout => codes::CONNECTION_TIMEOUT,
            Self::ConnectionNotUsable | Self::ConnectionClosed => codes::CONNECTION_NOT_USABLE,
            Self::Tls(_) => codes::HANDSHAKE_FAILURE,
            Self::Protocol(_) | Self::Internal(_) => codes::INTERNAL_EXCEPTION,
        }
    }

    /// Whether this is a wait timeout.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::WaitTimeout)
    }

    /// Whether the connection cannot be used after this error.
    ///
    /// A wait timeout is the only per-call failure.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::WaitTimeout | Self::Configuration(_))
    }
}

impl From<io::Error> for SniError {
    fn from(err: io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

impl From<TlsError> for SniError {
    fn from(err: TlsError) -> Self {
        Self::Tls(Arc::new(err))
    }
}
