//! # sni-tls
//!
//! TLS negotiation for SNI physical connections.
//!
//! SQL Server accepts two ways of starting TLS:
//!
//! ```text
//! Enveloped:  TCP connect -> prelogin (cleartext) -> TLS handshake in prelogin envelopes -> raw TLS
//! Direct:     TCP connect -> TLS handshake -> raw TLS
//! ```
//!
//! [`HandshakeEnvelope`] implements the envelope framing and
//! [`TlsConnector`] drives the rustls handshake over it.
//!
//! ```rust,ignore
//! use sni_tls::{TlsConfig, TlsConnector};
//!
//! let connector = TlsConnector::new(TlsConfig::new().with_server_name("db.internal"))?;
//! let tls = connector.connect(tcp_stream, "db.internal").await?;
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod config;
pub mod connector;
pub mod envelope;
pub mod error;

pub use config::{TlsConfig, TlsNegotiation, TlsVersion};
pub use connector::TlsConnector;
pub use envelope::HandshakeEnvelope;
pub use error::TlsError;

// Re-export tokio-rustls stream type for convenience
pub use tokio_rustls::client::TlsStream;
