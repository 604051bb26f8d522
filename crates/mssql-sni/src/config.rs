//! SNI configuration.

use sni_protocol::SMUX_HEADER_SIZE;

use crate::error::SniError;

/// Default data capacity of receive buffers, the TDS default packet size.
pub const DEFAULT_PACKET_SIZE: usize = 4096;

/// Largest packet size a transport may negotiate.
pub const MAX_PACKET_SIZE: usize = 32767;

/// Default number of idle packets a pool retains.
pub const DEFAULT_POOL_CAPACITY: usize = 16;

/// Configuration for SNI packet handling.
///
/// This struct is marked `#[non_exhaustive]`. Use the builder methods or
/// [`Default::default()`] to construct instances.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct SniConfig {
    /// Data capacity of the buffers transports rent for receives.
    pub packet_size: usize,

    /// Maximum number of idle packets kept by a [`PacketPool`](crate::PacketPool).
    pub pool_capacity: usize,
}

impl Default for SniConfig {
    fn default() -> Self {
        Self {
            packet_size: DEFAULT_PACKET_SIZE,
            pool_capacity: DEFAULT_POOL_CAPACITY,
        }
    }
}

impl SniConfig {
    /// Create a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the receive buffer size.
    #[must_use]
    pub fn packet_size(mut self, size: usize) -> Self {
        self.packet_size = size;
        self
    }

    /// Set the number of idle packets retained by a pool.
    #[must_use]
    pub fn pool_capacity(mut self, capacity: usize) -> Self {
        self.pool_capacity = capacity;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), SniError> {
        if self.pool_capacity == 0 {
            return Err(SniError::Configuration(
                "pool_capacity must be at least 1".into(),
            ));
        }

        if self.packet_size <= SMUX_HEADER_SIZE || self.packet_size > MAX_PACKET_SIZE {
            return Err(SniError::Configuration(format!(
                "packet_size must be in {}..={MAX_PACKET_SIZE}, got {}",
                SMUX_HEADER_SIZE + 1,
                self.packet_size
            )));
        }

        Ok(())
    }
}
