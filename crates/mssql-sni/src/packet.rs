//! Reusable packet buffers.
//!
//! A [`Packet`] is a fixed-capacity byte buffer with an optional header
//! reservation in front of its data region:
//!
//! ```text
//! |<- header_len ->|<------------ data_capacity ------------>|
//! |  reserved      |  consumed  |  unread        |  free     |
//!                  0          offset        data_len
//! ```
//!
//! Packets are move-only. The pool hands them out by value and takes them
//! back by value, so a packet cannot be returned twice or used after return.

use std::cmp;
use std::io::{Read, Write};

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::SniError;
use crate::pool::PoolId;

/// Callback run when an asynchronous write of the packet finishes.
pub type CompletionCallback = Box<dyn FnOnce(Packet, Result<(), SniError>) + Send>;

/// A pooled byte buffer moving through the SNI layer.
pub struct Packet {
    buffer: BytesMut,
    header_len: usize,
    data_len: usize,
    data_capacity: usize,
    offset: usize,
    out_of_band: bool,
    active: bool,
    owner: Option<PoolId>,
    completion: Option<CompletionCallback>,
}

impl Packet {
    /// Create an idle packet that no pool owns yet.
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::new(),
            header_len: 0,
            data_len: 0,
            data_capacity: 0,
            offset: 0,
            out_of_band: false,
            active: false,
            owner: None,
            completion: None,
        }
    }

    pub(crate) fn with_owner(owner: PoolId) -> Self {
        let mut packet = Self::new();
        packet.owner = Some(owner);
        packet
    }

    /// Size the buffer for a header reservation plus `data_capacity` bytes of
    /// data and reset every cursor.
    ///
    /// Only idle packets may be allocated.
    pub fn allocate(&mut self, header_size: usize, data_capacity: usize) {
        debug_assert!(!self.active, "allocating a packet that is already active");

        self.buffer.clear();
        self.buffer.resize(header_size + data_capacity, 0);
        self.header_len = header_size;
        self.data_capacity = data_capacity;
        self.data_len = 0;
        self.offset = 0;
        self.active = true;
    }

    /// Whether the packet is rented out.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// The pool this packet belongs to.
    #[must_use]
    pub fn owner(&self) -> Option<PoolId> {
        self.owner
    }

    pub(crate) fn adopt(&mut self, owner: PoolId) {
        self.owner = Some(owner);
    }

    /// Data length, excluding any reserved header.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data_len
    }

    /// Whether no data has been written.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data_len == 0
    }

    /// Data capacity, excluding any reserved header.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.data_capacity
    }

    /// Bytes not yet taken.
    #[must_use]
    pub fn data_left(&self) -> usize {
        self.data_len - self.offset
    }

    /// Size of the reserved header region.
    #[must_use]
    pub fn reserved_header_size(&self) -> usize {
        self.header_len
    }

    /// The unread data.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.buffer[self.header_len + self.offset..self.header_len + self.data_len]
    }

    /// Append `data` after the existing data.
    ///
    /// The packet has a fixed capacity and the caller sizes it; exceeding it
    /// panics.
    pub fn append_data(&mut self, data: &[u8]) {
        debug_assert!(
            data.len() <= self.data_capacity - self.data_len,
            "append of {} bytes exceeds packet capacity",
            data.len()
        );

        let start = self.header_len + self.data_len;
        self.buffer[start..start + data.len()].copy_from_slice(data);
        self.data_len += data.len();
    }

    /// Copy unread bytes into `dest` and advance the read offset.
    ///
    /// Returns the number of bytes copied, zero once the packet is consumed.
    pub fn take_data(&mut self, dest: &mut [u8]) -> usize {
        let n = cmp::min(dest.len(), self.data_left());
        let start = self.header_len + self.offset;
        dest[..n].copy_from_slice(&self.buffer[start..start + n]);
        self.offset += n;
        n
    }

    /// Move up to `count` unread bytes onto the end of `dest`'s data.
    ///
    /// Bounded by what this packet has left and what `dest` can hold.
    pub fn take_into(&mut self, dest: &mut Packet, count: usize) -> usize {
        let n = cmp::min(
            cmp::min(count, self.data_left()),
            dest.data_capacity - dest.data_len,
        );
        let src = self.header_len + self.offset;
        let dst = dest.header_len + dest.data_len;
        dest.buffer[dst..dst + n].copy_from_slice(&self.buffer[src..src + n]);
        dest.data_len += n;
        self.offset += n;
        n
    }

    /// Writable view of the reserved header.
    ///
    /// Valid only before the header is activated and before any data has
    /// been taken.
    pub fn header_buffer(&mut self, header_size: usize) -> &mut [u8] {
        debug_assert_eq!(self.offset, 0, "header requested after data was taken");
        debug_assert_eq!(
            self.header_len, header_size,
            "header size does not match the reservation"
        );

        &mut self.buffer[..header_size]
    }

    /// Merge the reserved header into the data region so it is transmitted.
    pub fn set_header_active(&mut self) {
        self.data_capacity += self.header_len;
        self.data_len += self.header_len;
        self.header_len = 0;
    }

    /// Drop the bytes already taken so the unread data starts the data region.
    ///
    /// Only cursors move, no bytes are copied.
    pub fn trim_consumed(&mut self) {
        self.header_len += self.offset;
        self.data_len -= self.offset;
        self.data_capacity -= self.offset;
        self.offset = 0;
    }

    /// Reset to the idle state, dropping the completion and clearing the data.
    ///
    /// The allocation is kept for the next rent.
    pub fn release(&mut self) {
        self.buffer.clear();
        self.header_len = 0;
        self.data_len = 0;
        self.data_capacity = 0;
        self.offset = 0;
        self.out_of_band = false;
        self.active = false;
        self.completion = None;
    }

    /// Whether this packet carries out-of-band (attention) data.
    #[must_use]
    pub fn is_out_of_band(&self) -> bool {
        self.out_of_band
    }

    /// Mark the packet as out-of-band.
    pub fn set_out_of_band(&mut self, out_of_band: bool) {
        self.out_of_band = out_of_band;
    }

    /// Attach the callback run when an asynchronous write finishes.
    pub fn set_completion(&mut self, completion: CompletionCallback) {
        self.completion = Some(completion);
    }

    /// Whether a completion callback is attached.
    #[must_use]
    pub fn has_completion(&self) -> bool {
        self.completion.is_some()
    }

    /// Hand the packet to its completion callback.
    ///
    /// Packets without a callback are dropped.
    pub fn complete(mut self, result: Result<(), SniError>) {
        if let Some(completion) = self.completion.take() {
            completion(self, result);
        }
    }

    // =========================================================================
    // Stream I/O
    // =========================================================================

    /// Fill the data region with one read from `reader`.
    ///
    /// A zero-length read means the peer closed the connection.
    pub fn read_from_stream<R: Read + ?Sized>(&mut self, reader: &mut R) -> Result<usize, SniError> {
        let start = self.header_len;
        let n = reader.read(&mut self.buffer[start..start + self.data_capacity])?;
        self.filled(n)
    }

    /// Write the data region to `writer`.
    pub fn write_to_stream<W: Write + ?Sized>(&self, writer: &mut W) -> Result<(), SniError> {
        writer.write_all(self.frame())?;
        writer.flush()?;
        Ok(())
    }

    /// Fill the data region with one read from an async `reader`.
    ///
    /// A zero-length read means the peer closed the connection.
    pub async fn read_from_stream_async<R: AsyncRead + Unpin + ?Sized>(
        &mut self,
        reader: &mut R,
    ) -> Result<usize, SniError> {
        let start = self.header_len;
        let n = reader
            .read(&mut self.buffer[start..start + self.data_capacity])
            .await?;
        self.filled(n)
    }

    /// Write the data region to an async `writer`.
    pub async fn write_to_stream_async<W: AsyncWrite + Unpin + ?Sized>(
        &self,
        writer: &mut W,
    ) -> Result<(), SniError> {
        writer.write_all(self.frame()).await?;
        writer.flush().await?;
        Ok(())
    }

    fn frame(&self) -> &[u8] {
        &self.buffer[self.header_len..self.header_len + self.data_len]
    }

    fn filled(&mut self, n: usize) -> Result<usize, SniError> {
        if n == 0 {
            return Err(SniError::ConnectionTerminated);
        }
        self.data_len = n;
        self.offset = 0;
        Ok(n)
    }
}

impl Default for Packet {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Packet")
            .field("header_len", &self.header_len)
            .field("data_len", &self.data_len)
            .field("offset", &self.offset)
            .field("active", &self.active)
            .field("out_of_band", &self.out_of_band)
            .field("has_completion", &self.completion.is_some())
            .finish_non_exhaustive()
    }
}
