//! # mssql-sni
//!
//! SNI transport layer for SQL Server: MARS session multiplexing and the
//! packet buffers it runs on.
//!
//! ## Features
//!
//! - SMUX demultiplexing of one physical stream into logical sessions
//! - Per-session sliding-window flow control
//! - Bounded, lock-free packet pool
//! - TLS negotiation through the physical handle
//!
//! ## Architecture
//!
//! ```text
//! TCP / named pipe → PhysicalHandle → MarsConnection → MarsSession (× n)
//! ```
//!
//! The physical handle is supplied by the caller. It reads and writes whole
//! packets and reports completed reads through a callback; the connection
//! reassembles SMUX frames from those reads and routes them to sessions.
//!
//! ```rust,ignore
//! use mssql_sni::{MarsConnection, SniConfig};
//!
//! let connection = MarsConnection::new(handle);
//! connection.start_receive()?;
//!
//! let session = connection.create_session()?;
//! let mut packet = session.rent_packet(request.len());
//! packet.append_data(&request);
//! session.send(packet)?;
//!
//! let reply = session.recv().await?;
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod config;
pub mod error;
pub mod handle;
pub mod mars;
pub mod packet;
pub mod pool;

pub use config::SniConfig;
pub use error::SniError;
pub use handle::{IoStatus, PhysicalHandle, ReceiveCallback, ReceiveStatus};
pub use mars::{AsyncReceive, MarsConnection, MarsSession, PendingReceive, SendCompletion};
pub use packet::{CompletionCallback, Packet};
pub use pool::{PacketPool, PoolId};

pub use sni_protocol::{ProtocolError, SmuxFlags, SmuxFrameKind, SmuxHeader};
pub use sni_tls::{TlsConfig, TlsNegotiation};
