//! MARS sessions.
//!
//! Each session runs a sliding-window flow control against its peer. Every
//! outbound frame carries the local receive highwater, so any frame doubles as
//! an acknowledgment; a standalone ACK is only sent once the application has
//! consumed more than [`ACK_THRESHOLD`] frames since the last one.
//!
//! Sequence numbers: SYN carries the current sequence number, DATA consumes
//! one, FIN and ACK carry one less than the next DATA frame would use.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll, ready};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use sni_protocol::{SMUX_HEADER_SIZE, SmuxFrameKind, SmuxHeader};
use sni_tls::TlsConfig;
use tokio::sync::oneshot;

use crate::error::SniError;
use crate::mars::connection::MarsConnection;
use crate::packet::Packet;

/// Initial send and receive window.
pub const INITIAL_WINDOW: u32 = 4;

/// Consumed frames tolerated before a standalone ACK is sent.
pub const ACK_THRESHOLD: u32 = 2;

// =============================================================================
// Session state
// =============================================================================

struct QueuedSend {
    packet: Packet,
    done: oneshot::Sender<Result<(), SniError>>,
}

struct FlowState {
    sequence_number: u32,
    send_highwater: u32,
    receive_highwater: u32,
    last_ack_highwater: u32,
    queue: VecDeque<QueuedSend>,
}

impl FlowState {
    fn new() -> Self {
        Self {
            sequence_number: 0,
            send_highwater: INITIAL_WINDOW,
            receive_highwater: INITIAL_WINDOW,
            last_ack_highwater: INITIAL_WINDOW,
            queue: VecDeque::new(),
        }
    }

    /// Whether the peer will accept the next DATA frame.
    fn window_open(&self) -> bool {
        // serial number comparison, tolerant of wraparound
        (self.send_highwater.wrapping_sub(self.sequence_number) as i32) > 0
    }

    fn ack_due(&self) -> bool {
        self.receive_highwater
            .wrapping_sub(self.last_ack_highwater)
            > ACK_THRESHOLD
    }

    /// Build the next outbound header. Every header acknowledges the current
    /// receive highwater.
    fn next_header(&mut self, kind: SmuxFrameKind, session_id: u16, length: u32) -> SmuxHeader {
        let sequence_number = match kind {
            SmuxFrameKind::Fin | SmuxFrameKind::Ack => self.sequence_number.wrapping_sub(1),
            SmuxFrameKind::Syn => self.sequence_number,
            SmuxFrameKind::Data => {
                let current = self.sequence_number;
                self.sequence_number = current.wrapping_add(1);
                current
            }
        };
        self.last_ack_highwater = self.receive_highwater;
        SmuxHeader::new(kind, session_id, length, sequence_number, self.receive_highwater)
    }
}

struct Inbox {
    packets: VecDeque<Packet>,
    waiters: VecDeque<oneshot::Sender<Packet>>,
    error: Option<SniError>,
}

/// Reject packets that cannot carry a SMUX header in front of their data.
fn check_reservation(packet: &Packet) -> Result<(), SniError> {
    if packet.reserved_header_size() != SMUX_HEADER_SIZE {
        return Err(SniError::Internal(format!(
            "packet reserves {} header bytes, SMUX needs {SMUX_HEADER_SIZE}",
            packet.reserved_header_size()
        )));
    }
    if packet.data_left() != packet.len() {
        return Err(SniError::Internal(
            "packet data was partly consumed before send".into(),
        ));
    }
    Ok(())
}

/// Write the SMUX header into the packet's reservation and activate it.
fn stamp(packet: &mut Packet, header: &SmuxHeader) {
    let mut dst = packet.header_buffer(SMUX_HEADER_SIZE);
    header.encode(&mut dst);
    packet.set_header_active();
}

/// Shared session state, referenced by the public handle and weakly by the
/// connection's session map.
pub(crate) struct SessionCore {
    id: u16,
    connection: Arc<MarsConnection>,
    flow: Mutex<FlowState>,
    window_opened: Condvar,
    inbox: Mutex<Inbox>,
    arrived: Condvar,
    closed: AtomicBool,
}

impl SessionCore {
    pub(crate) fn new(id: u16, connection: Arc<MarsConnection>) -> Self {
        Self {
            id,
            connection,
            flow: Mutex::new(FlowState::new()),
            window_opened: Condvar::new(),
            inbox: Mutex::new(Inbox {
                packets: VecDeque::new(),
                waiters: VecDeque::new(),
                error: None,
            }),
            arrived: Condvar::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn id(&self) -> u16 {
        self.id
    }

    fn latched_error(&self) -> Option<SniError> {
        self.inbox.lock().error.clone()
    }

    /// Send the SYN frame.
    pub(crate) fn open(&self) -> Result<(), SniError> {
        let header = self.flow.lock().next_header(SmuxFrameKind::Syn, self.id, 0);
        self.transmit(&header)
    }

    /// Write a header-only control frame.
    fn transmit(&self, header: &SmuxHeader) -> Result<(), SniError> {
        let mut packet = self.connection.rent_packet(SMUX_HEADER_SIZE, 0);
        stamp(&mut packet, header);
        let result = self.connection.send(&packet);
        self.connection.return_packet(packet);
        result
    }

    // =========================================================================
    // Outbound
    // =========================================================================

    fn send(&self, mut packet: Packet) -> Result<(), SniError> {
        if let Err(error) = check_reservation(&packet) {
            self.connection.return_packet(packet);
            return Err(error);
        }

        {
            let mut flow = self.flow.lock();
            while !flow.window_open() {
                if let Some(error) = self.latched_error() {
                    drop(flow);
                    self.connection.return_packet(packet);
                    return Err(error);
                }
                self.window_opened.wait(&mut flow);
            }
            if let Some(error) = self.latched_error() {
                drop(flow);
                self.connection.return_packet(packet);
                return Err(error);
            }

            let header = flow.next_header(SmuxFrameKind::Data, self.id, packet.len() as u32);
            stamp(&mut packet, &header);
            tracing::trace!(
                session_id = self.id,
                sequence = header.sequence_number,
                "sending DATA frame"
            );
        }

        let result = self.connection.send(&packet);
        self.connection.return_packet(packet);
        result
    }

    fn send_async(&self, packet: Packet) -> SendCompletion {
        let (done, rx) = oneshot::channel();

        if let Err(error) = check_reservation(&packet) {
            self.connection.return_packet(packet);
            let _ = done.send(Err(error));
            return SendCompletion { rx };
        }
        if let Some(error) = self.latched_error() {
            self.connection.return_packet(packet);
            let _ = done.send(Err(error));
            return SendCompletion { rx };
        }

        let mut flow = self.flow.lock();
        flow.queue.push_back(QueuedSend { packet, done });
        self.drain(&mut flow);
        SendCompletion { rx }
    }

    /// Send queued packets while the window allows. Called with the flow lock
    /// held so sequence numbers reach the wire in order.
    fn drain(&self, flow: &mut FlowState) {
        while flow.window_open() {
            let Some(QueuedSend { mut packet, done }) = flow.queue.pop_front() else {
                self.window_opened.notify_all();
                return;
            };

            let header = flow.next_header(SmuxFrameKind::Data, self.id, packet.len() as u32);
            stamp(&mut packet, &header);

            let connection = Arc::downgrade(&self.connection);
            packet.set_completion(Box::new(move |packet, result| {
                if let Some(connection) = connection.upgrade() {
                    connection.return_packet(packet);
                }
                let _ = done.send(result);
            }));

            tracing::trace!(
                session_id = self.id,
                sequence = header.sequence_number,
                "sending queued DATA frame"
            );
            if let Err(error) = self.connection.send_async(packet) {
                tracing::debug!(session_id = self.id, error = %error, "queued send failed");
                return;
            }
        }

        if !flow.queue.is_empty() {
            tracing::trace!(
                session_id = self.id,
                queued = flow.queue.len(),
                highwater = flow.send_highwater,
                "send window closed"
            );
        }
    }

    /// Apply a peer highwater update.
    pub(crate) fn handle_ack(&self, highwater: u32) {
        let mut flow = self.flow.lock();
        if flow.send_highwater != highwater {
            tracing::debug!(session_id = self.id, highwater, "send window advanced");
            flow.send_highwater = highwater;
            self.drain(&mut flow);
        }
    }

    // =========================================================================
    // Inbound
    // =========================================================================

    /// Accept a reassembled DATA payload from the connection.
    pub(crate) fn handle_receive_complete(&self, payload: Packet, header: &SmuxHeader) {
        self.handle_ack(header.highwater);

        let mut payload = payload;
        let mut inbox = self.inbox.lock();
        while let Some(waiter) = inbox.waiters.pop_front() {
            match waiter.send(payload) {
                Ok(()) => {
                    drop(inbox);
                    self.consumed();
                    return;
                }
                // the receiver was abandoned
                Err(returned) => payload = returned,
            }
        }

        inbox.packets.push_back(payload);
        drop(inbox);
        self.arrived.notify_one();
    }

    /// Latch a connection error and wake everything waiting on this session.
    pub(crate) fn handle_receive_error(&self, error: SniError) {
        {
            let mut inbox = self.inbox.lock();
            inbox.error.get_or_insert_with(|| error.clone());
            inbox.waiters.clear();
        }
        self.arrived.notify_all();

        let queued: Vec<QueuedSend> = self.flow.lock().queue.drain(..).collect();
        self.window_opened.notify_all();
        for QueuedSend { packet, done } in queued {
            self.connection.return_packet(packet);
            let _ = done.send(Err(error.clone()));
        }
    }

    /// Advance the receive highwater after the application took a packet and
    /// acknowledge if the threshold was crossed.
    fn consumed(&self) {
        let header = {
            let mut flow = self.flow.lock();
            flow.receive_highwater = flow.receive_highwater.wrapping_add(1);
            if !flow.ack_due() {
                return;
            }
            flow.next_header(SmuxFrameKind::Ack, self.id, 0)
        };

        tracing::debug!(session_id = self.id, highwater = header.highwater, "sending ACK");
        if let Err(error) = self.transmit(&header) {
            tracing::debug!(session_id = self.id, error = %error, "failed to send ACK");
        }
    }

    fn receive(&self, timeout: Option<Duration>) -> Result<Packet, SniError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let packet = {
            let mut inbox = self.inbox.lock();
            loop {
                if let Some(error) = &inbox.error {
                    return Err(error.clone());
                }
                if let Some(packet) = inbox.packets.pop_front() {
                    break packet;
                }
                match deadline {
                    Some(deadline) => {
                        if self.arrived.wait_until(&mut inbox, deadline).timed_out()
                            && inbox.packets.is_empty()
                            && inbox.error.is_none()
                        {
                            return Err(SniError::WaitTimeout);
                        }
                    }
                    None => self.arrived.wait(&mut inbox),
                }
            }
        };

        self.consumed();
        Ok(packet)
    }

    fn receive_async(self: &Arc<Self>) -> Result<AsyncReceive, SniError> {
        let queued = {
            let mut inbox = self.inbox.lock();
            if let Some(error) = &inbox.error {
                return Err(error.clone());
            }
            match inbox.packets.pop_front() {
                Some(packet) => packet,
                None => {
                    let (tx, rx) = oneshot::channel();
                    inbox.waiters.push_back(tx);
                    return Ok(AsyncReceive::Pending(PendingReceive {
                        rx,
                        session: Arc::clone(self),
                    }));
                }
            }
        };

        self.consumed();
        Ok(AsyncReceive::Ready(queued))
    }

    // =========================================================================
    // Teardown
    // =========================================================================

    /// Send FIN once.
    fn close(&self) -> Result<(), SniError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if self.connection.is_closed() {
            return Ok(());
        }

        let header = self.flow.lock().next_header(SmuxFrameKind::Fin, self.id, 0);
        tracing::debug!(
            connection_id = %self.connection.id(),
            session_id = self.id,
            sequence = header.sequence_number,
            "closing MARS session"
        );

        self.transmit(&header).map_err(|error| {
            tracing::warn!(session_id = self.id, error = %error, "failed to send FIN");
            SniError::Internal(format!("failed to close session {}: {error}", self.id))
        })
    }
}

// =============================================================================
// Futures
// =============================================================================

/// Result of [`MarsSession::receive_async`].
#[derive(Debug)]
pub enum AsyncReceive {
    /// A packet was already queued.
    Ready(Packet),
    /// No packet yet; the future resolves when one arrives or the connection
    /// fails.
    Pending(PendingReceive),
}

/// A receive waiting for the next DATA payload.
pub struct PendingReceive {
    rx: oneshot::Receiver<Packet>,
    session: Arc<SessionCore>,
}

impl Future for PendingReceive {
    type Output = Result<Packet, SniError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match ready!(Pin::new(&mut self.rx).poll(cx)) {
            Ok(packet) => Poll::Ready(Ok(packet)),
            Err(_) => Poll::Ready(Err(self
                .session
                .latched_error()
                .unwrap_or(SniError::ConnectionClosed))),
        }
    }
}

impl std::fmt::Debug for PendingReceive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingReceive")
            .field("session_id", &self.session.id)
            .finish_non_exhaustive()
    }
}

/// Completion of [`MarsSession::send_async`].
///
/// Dropping it does not cancel the send.
#[derive(Debug)]
pub struct SendCompletion {
    rx: oneshot::Receiver<Result<(), SniError>>,
}

impl Future for SendCompletion {
    type Output = Result<(), SniError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match ready!(Pin::new(&mut self.rx).poll(cx)) {
            Ok(result) => Poll::Ready(result),
            Err(_) => Poll::Ready(Err(SniError::ConnectionClosed)),
        }
    }
}

// =============================================================================
// Public handle
// =============================================================================

/// A logical MARS session.
///
/// Dropping the session sends FIN.
pub struct MarsSession {
    core: Arc<SessionCore>,
}

impl MarsSession {
    pub(crate) fn new(core: Arc<SessionCore>) -> Self {
        Self { core }
    }

    /// Session id.
    #[must_use]
    pub fn id(&self) -> u16 {
        self.core.id
    }

    /// The connection carrying this session.
    #[must_use]
    pub fn connection(&self) -> &Arc<MarsConnection> {
        &self.core.connection
    }

    /// Rent a packet with room for the SMUX header.
    pub fn rent_packet(&self, data_size: usize) -> Packet {
        self.core
            .connection
            .rent_packet(SMUX_HEADER_SIZE, data_size)
    }

    /// Return a packet to the connection's pool.
    pub fn return_packet(&self, packet: Packet) {
        self.core.connection.return_packet(packet);
    }

    /// Send a packet, blocking while the peer's window is full.
    ///
    /// The packet must come from [`rent_packet`](Self::rent_packet).
    pub fn send(&self, packet: Packet) -> Result<(), SniError> {
        self.core.send(packet)
    }

    /// Queue a packet and send it as soon as the window allows.
    ///
    /// The packet must come from [`rent_packet`](Self::rent_packet).
    pub fn send_async(&self, packet: Packet) -> SendCompletion {
        self.core.send_async(packet)
    }

    /// Wait up to `timeout` for the next payload (`None` waits forever).
    pub fn receive(&self, timeout: Option<Duration>) -> Result<Packet, SniError> {
        self.core.receive(timeout)
    }

    /// Take the next payload if one is queued, otherwise register a pending
    /// receive.
    pub fn receive_async(&self) -> Result<AsyncReceive, SniError> {
        self.core.receive_async()
    }

    /// Receive the next payload asynchronously.
    pub async fn recv(&self) -> Result<Packet, SniError> {
        match self.receive_async()? {
            AsyncReceive::Ready(packet) => Ok(packet),
            AsyncReceive::Pending(pending) => pending.await,
        }
    }

    /// Check the underlying connection.
    pub fn check_connection(&self) -> Result<(), SniError> {
        self.core.connection.check_connection()
    }

    /// Negotiate TLS on the underlying connection.
    pub fn enable_tls(&self, config: &TlsConfig) -> Result<(), SniError> {
        self.core.connection.enable_tls(config)
    }

    /// Stop TLS on the underlying connection.
    pub fn disable_tls(&self) {
        self.core.connection.disable_tls();
    }

    /// The latched connection error, if any.
    #[must_use]
    pub fn last_error(&self) -> Option<SniError> {
        self.core.latched_error()
    }

    /// Packets waiting for the send window.
    #[must_use]
    pub fn queued_sends(&self) -> usize {
        self.core.flow.lock().queue.len()
    }

    /// Asynchronous receives waiting for data.
    #[must_use]
    pub fn pending_receives(&self) -> usize {
        let mut inbox = self.core.inbox.lock();
        inbox.waiters.retain(|waiter| !waiter.is_closed());
        inbox.waiters.len()
    }

    /// Send FIN and close the session.
    ///
    /// A failed FIN is reported as [`SniError::Internal`]; the session is
    /// closed either way.
    pub fn close(self) -> Result<(), SniError> {
        self.core.close()
    }
}

impl Drop for MarsSession {
    fn drop(&mut self) {
        let _ = self.core.close();
    }
}

impl std::fmt::Debug for MarsSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarsSession")
            .field("id", &self.core.id)
            .field("connection_id", &self.core.connection.id())
            .finish_non_exhaustive()
    }
}
