//! Lock-free bounded packet pool.
//!
//! The pool holds one fast-path slot plus a fixed array of slots. Each slot is
//! claimed with a compare-and-swap on its state byte, so concurrent rent and
//! return never block. The pool is best-effort: a packet returned to a full
//! pool is dropped and a rent from an empty pool allocates.

use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::config::SniConfig;
use crate::packet::Packet;

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a [`PacketPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolId(u64);

const EMPTY: u8 = 0;
const BUSY: u8 = 1;
const FULL: u8 = 2;

/// A pool slot.
///
/// The state byte grants exclusive access; the mutex is never contended and
/// only exists to hand the packet across threads without `unsafe`.
struct Slot {
    state: AtomicU8,
    packet: Mutex<Option<Packet>>,
}

impl Slot {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(EMPTY),
            packet: Mutex::new(None),
        }
    }

    fn take(&self) -> Option<Packet> {
        if self
            .state
            .compare_exchange(FULL, BUSY, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return None;
        }

        match self.packet.try_lock() {
            Some(mut guard) => {
                let packet = guard.take();
                drop(guard);
                self.state.store(EMPTY, Ordering::Release);
                packet
            }
            None => {
                self.state.store(FULL, Ordering::Release);
                None
            }
        }
    }

    fn offer(&self, packet: Packet) -> Result<(), Packet> {
        if self
            .state
            .compare_exchange(EMPTY, BUSY, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return Err(packet);
        }

        match self.packet.try_lock() {
            Some(mut guard) => {
                *guard = Some(packet);
                drop(guard);
                self.state.store(FULL, Ordering::Release);
                Ok(())
            }
            None => {
                self.state.store(EMPTY, Ordering::Release);
                Err(packet)
            }
        }
    }

    fn is_full(&self) -> bool {
        self.state.load(Ordering::Acquire) == FULL
    }
}

/// A bounded pool of idle [`Packet`]s.
pub struct PacketPool {
    id: PoolId,
    first: Slot,
    rest: Box<[Slot]>,
    packet_size: usize,
}

impl PacketPool {
    /// Create a pool retaining at most `capacity` idle packets (at least one).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self::with_packet_size(capacity, crate::config::DEFAULT_PACKET_SIZE)
    }

    /// Create a pool sized by `config`.
    #[must_use]
    pub fn from_config(config: &SniConfig) -> Self {
        Self::with_packet_size(config.pool_capacity, config.packet_size)
    }

    fn with_packet_size(capacity: usize, packet_size: usize) -> Self {
        let rest = (1..capacity.max(1)).map(|_| Slot::new()).collect();
        Self {
            id: PoolId(NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed)),
            first: Slot::new(),
            rest,
            packet_size,
        }
    }

    /// This pool's identity.
    #[must_use]
    pub fn id(&self) -> PoolId {
        self.id
    }

    /// Maximum number of idle packets retained.
    #[must_use]
    pub fn capacity(&self) -> usize {
        1 + self.rest.len()
    }

    /// Number of idle packets currently retained.
    #[must_use]
    pub fn idle_count(&self) -> usize {
        std::iter::once(&self.first)
            .chain(self.rest.iter())
            .filter(|slot| slot.is_full())
            .count()
    }

    /// Claim an idle packet, trying the fast-path slot first.
    pub fn try_get(&self) -> Option<Packet> {
        self.first
            .take()
            .or_else(|| self.rest.iter().find_map(Slot::take))
    }

    /// Store an idle packet, dropping it if the pool is full.
    pub fn put(&self, packet: Packet) {
        debug_assert!(!packet.is_active(), "pooling a packet that is still active");

        let mut packet = match self.first.offer(packet) {
            Ok(()) => return,
            Err(packet) => packet,
        };
        for slot in self.rest.iter() {
            packet = match slot.offer(packet) {
                Ok(()) => return,
                Err(packet) => packet,
            };
        }
        tracing::trace!(capacity = self.capacity(), "packet pool full, dropping packet");
    }

    /// Rent a packet with a header reservation and data capacity.
    pub fn rent(&self, header_size: usize, data_size: usize) -> Packet {
        let mut packet = self.try_get().unwrap_or_else(|| {
            tracing::trace!("packet pool empty, allocating");
            Packet::with_owner(self.id)
        });
        packet.allocate(header_size, data_size);
        packet
    }

    /// Rent a receive buffer of the configured packet size.
    pub fn rent_receive_buffer(&self) -> Packet {
        self.rent(0, self.packet_size)
    }

    /// Release a rented packet and keep it for reuse.
    ///
    /// A packet owned by another pool is a programming error. Debug builds
    /// panic; release builds drop the packet.
    pub fn return_packet(&self, mut packet: Packet) {
        debug_assert!(packet.is_active(), "returning a packet that is not active");

        match packet.owner() {
            Some(owner) if owner != self.id => {
                debug_assert_eq!(owner, self.id, "packet returned to a pool that does not own it");
                return;
            }
            Some(_) => {}
            None => packet.adopt(self.id),
        }

        packet.release();
        self.put(packet);
    }
}

impl std::fmt::Debug for PacketPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketPool")
            .field("id", &self.id)
            .field("capacity", &self.capacity())
            .field("idle", &self.idle_count())
            .finish_non_exhaustive()
    }
}
