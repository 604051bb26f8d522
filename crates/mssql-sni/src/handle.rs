//! Physical handle contract.
//!
//! A physical handle owns one transport (TCP socket, named pipe, optionally
//! wrapped in TLS) and the packet pool its buffers come from. The MARS layer
//! drives it only through [`PhysicalHandle`].
//!
//! Status vocabulary:
//!
//! | Status | Rust |
//! |---|---|
//! | success | `Ok(..)`, `Ok(IoStatus::Complete)` |
//! | success, pending | `Ok(IoStatus::Pending)`, `Ok(ReceiveStatus::Pending)` |
//! | error | `Err(SniError)` |
//! | wait timeout | `Err(SniError::WaitTimeout)` |

use std::sync::Arc;
use std::time::Duration;

use sni_tls::TlsConfig;

use crate::error::SniError;
use crate::packet::Packet;

/// Outcome of starting an asynchronous send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoStatus {
    /// The operation finished before the call returned.
    Complete,
    /// The operation is in flight and completes through a callback.
    Pending,
}

/// Outcome of starting an asynchronous receive.
#[derive(Debug)]
pub enum ReceiveStatus {
    /// Data was already available.
    Ready(Packet),
    /// The read is in flight; the receive callback fires when it completes.
    Pending,
}

/// Callback a handle runs when an asynchronous receive completes.
///
/// On failure the packet is the buffer that was being filled.
pub type ReceiveCallback = Arc<dyn Fn(Packet, Result<(), SniError>) + Send + Sync>;

/// A connected transport.
///
/// Completions may run on any thread, including inline on the thread that
/// started the operation.
pub trait PhysicalHandle: Send + Sync {
    /// Write a packet, blocking until it is on the wire.
    fn send(&self, packet: &Packet) -> Result<(), SniError>;

    /// Start writing a packet.
    ///
    /// The handle runs the packet's completion exactly once, whatever the
    /// returned status. On `Err` it has already run with the same error.
    fn send_async(&self, packet: Packet) -> Result<IoStatus, SniError>;

    /// Read one packet, waiting at most `timeout` (`None` waits forever).
    fn receive(&self, timeout: Option<Duration>) -> Result<Packet, SniError>;

    /// Start a read.
    ///
    /// When this returns [`ReceiveStatus::Pending`] the registered
    /// [`ReceiveCallback`] fires once the read completes.
    fn receive_async(&self) -> Result<ReceiveStatus, SniError>;

    /// Register the callback for asynchronous receive completions.
    fn set_receive_callback(&self, callback: ReceiveCallback);

    /// Negotiate TLS over the transport.
    fn enable_tls(&self, config: &TlsConfig) -> Result<(), SniError>;

    /// Stop encrypting; later I/O uses the raw transport.
    fn disable_tls(&self);

    /// Check whether the transport is still connected.
    fn check_connection(&self) -> Result<(), SniError>;

    /// Rent a packet from the handle's pool.
    fn rent_packet(&self, header_size: usize, data_size: usize) -> Packet;

    /// Return a packet to the handle's pool.
    fn return_packet(&self, packet: Packet);

    /// Close the transport.
    fn dispose(&self);
}
