//! MARS connection: one physical handle shared by many sessions.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, ReentrantMutex};
use sni_protocol::{SmuxFrameKind, SmuxHeader};
use sni_tls::TlsConfig;
use uuid::Uuid;

use crate::error::SniError;
use crate::handle::{IoStatus, PhysicalHandle, ReceiveStatus};
use crate::mars::demux::{Demuxer, Step};
use crate::mars::session::{MarsSession, SessionCore};
use crate::packet::Packet;

/// Demultiplexer state guarded by the connection lock.
struct ConnectionState {
    demux: Demuxer,
    sessions: HashMap<u16, Weak<SessionCore>>,
    next_session_id: u32,
    last_error: Option<SniError>,
    closed: bool,
}

impl ConnectionState {
    fn live_sessions(&self) -> Vec<Arc<SessionCore>> {
        self.sessions.values().filter_map(Weak::upgrade).collect()
    }

    /// Decide what a complete frame means. Nothing here calls into a session.
    fn route(&mut self, header: SmuxHeader, payload: Packet) -> Action {
        let Some(entry) = self.sessions.get(&header.session_id) else {
            return Action::Fatal(SniError::UnknownSession(header.session_id), Some(payload));
        };
        let session = entry.upgrade();

        match (header.kind(), session) {
            (Ok(SmuxFrameKind::Data), Some(session)) => Action::Deliver {
                session,
                header,
                payload,
            },
            (Ok(SmuxFrameKind::Ack), Some(session)) => Action::Ack {
                session,
                highwater: header.highwater,
                payload,
            },
            (Ok(SmuxFrameKind::Data | SmuxFrameKind::Ack), None) => Action::Discard(payload),
            (Ok(SmuxFrameKind::Fin), _) => {
                self.sessions.remove(&header.session_id);
                Action::Discard(payload)
            }
            (Ok(SmuxFrameKind::Syn), _) => Action::Fatal(
                SniError::Internal(format!(
                    "unexpected SYN for session {}",
                    header.session_id
                )),
                Some(payload),
            ),
            (Err(e), _) => Action::Fatal(e.into(), Some(payload)),
        }
    }
}

/// Side effect decided under the connection lock and performed after it.
enum Action {
    Read,
    Deliver {
        session: Arc<SessionCore>,
        header: SmuxHeader,
        payload: Packet,
    },
    Ack {
        session: Arc<SessionCore>,
        highwater: u32,
        payload: Packet,
    },
    Discard(Packet),
    Fatal(SniError, Option<Packet>),
    Stop,
}

/// A physical connection carrying multiplexed MARS sessions.
///
/// All demultiplexer state lives behind one connection lock. Outbound writes
/// are serialized by a separate write lock so frames from different sessions
/// never interleave on the wire. Session code is never called while the
/// connection lock is held.
pub struct MarsConnection {
    id: Uuid,
    handle: Arc<dyn PhysicalHandle>,
    state: Mutex<ConnectionState>,
    write_lock: ReentrantMutex<()>,
}

impl MarsConnection {
    /// Wrap a connected physical handle.
    ///
    /// Registers the receive callback; call [`start_receive`](Self::start_receive)
    /// to begin demultiplexing.
    pub fn new(handle: Arc<dyn PhysicalHandle>) -> Arc<Self> {
        let connection = Arc::new(Self {
            id: Uuid::new_v4(),
            handle,
            state: Mutex::new(ConnectionState {
                demux: Demuxer::new(),
                sessions: HashMap::new(),
                next_session_id: 0,
                last_error: None,
                closed: false,
            }),
            write_lock: ReentrantMutex::new(()),
        });

        let weak = Arc::downgrade(&connection);
        connection
            .handle
            .set_receive_callback(Arc::new(move |packet, result| {
                if let Some(connection) = weak.upgrade() {
                    connection.handle_receive_complete(packet, result);
                }
            }));

        tracing::debug!(connection_id = %connection.id, "MARS connection created");
        connection
    }

    /// Connection id used in log events.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Open a new session.
    ///
    /// Session ids are assigned sequentially from 0. The SYN frame is written
    /// before this returns.
    pub fn create_session(self: &Arc<Self>) -> Result<MarsSession, SniError> {
        let core = {
            let mut state = self.state.lock();
            if let Some(error) = &state.last_error {
                return Err(error.clone());
            }
            if state.closed {
                return Err(SniError::ConnectionClosed);
            }

            let id = u16::try_from(state.next_session_id)
                .map_err(|_| SniError::Internal("MARS session ids exhausted".into()))?;
            state.next_session_id += 1;

            let core = Arc::new(SessionCore::new(id, Arc::clone(self)));
            state.sessions.insert(id, Arc::downgrade(&core));
            core
        };

        tracing::debug!(connection_id = %self.id, session_id = core.id(), "opening MARS session");

        if let Err(error) = core.open() {
            self.state.lock().sessions.remove(&core.id());
            return Err(error);
        }
        Ok(MarsSession::new(core))
    }

    /// Write a packet synchronously.
    pub fn send(&self, packet: &Packet) -> Result<(), SniError> {
        let _writer = self.write_lock.lock();
        self.ensure_open()?;
        self.handle.send(packet)
    }

    /// Start writing a packet.
    ///
    /// The packet's completion runs exactly once, including on failure.
    pub fn send_async(&self, packet: Packet) -> Result<IoStatus, SniError> {
        let _writer = self.write_lock.lock();
        if let Err(error) = self.ensure_open() {
            packet.complete(Err(error.clone()));
            return Err(error);
        }
        self.handle.send_async(packet)
    }

    /// Issue the first read that primes the demultiplexer.
    pub fn start_receive(&self) -> Result<(), SniError> {
        match self.handle.receive_async() {
            Ok(ReceiveStatus::Pending) => Ok(()),
            Ok(ReceiveStatus::Ready(packet)) => {
                self.handle_receive_complete(packet, Ok(()));
                Ok(())
            }
            Err(error) => {
                tracing::warn!(connection_id = %self.id, error = %error, "failed to start receiving");
                Err(SniError::ConnectionNotUsable)
            }
        }
    }

    /// Process a completed read.
    ///
    /// Frames are dispatched in wire order. A read completing synchronously
    /// from inside this call is processed by the same loop.
    pub fn handle_receive_complete(&self, packet: Packet, result: Result<(), SniError>) {
        if let Err(error) = result {
            self.handle.return_packet(packet);
            self.fail_sessions(error);
            return;
        }

        let mut inbound = Some(packet);
        loop {
            match self.demultiplex(&mut inbound) {
                Action::Read => {
                    if let Some(spent) = inbound.take() {
                        self.handle.return_packet(spent);
                    }
                    match self.handle.receive_async() {
                        Ok(ReceiveStatus::Pending) => return,
                        Ok(ReceiveStatus::Ready(next)) => inbound = Some(next),
                        Err(error) => {
                            self.fail_sessions(error);
                            return;
                        }
                    }
                }
                Action::Deliver {
                    session,
                    header,
                    payload,
                } => session.handle_receive_complete(payload, &header),
                Action::Ack {
                    session,
                    highwater,
                    payload,
                } => {
                    self.handle.return_packet(payload);
                    session.handle_ack(highwater);
                }
                Action::Discard(payload) => self.handle.return_packet(payload),
                Action::Fatal(error, payload) => {
                    for spent in payload.into_iter().chain(inbound.take()) {
                        self.handle.return_packet(spent);
                    }
                    self.fail_connection(error);
                    return;
                }
                Action::Stop => {
                    if let Some(spent) = inbound.take() {
                        self.handle.return_packet(spent);
                    }
                    return;
                }
            }
        }
    }

    /// Advance the state machine until a frame is complete or more data is
    /// needed.
    fn demultiplex(&self, inbound: &mut Option<Packet>) -> Action {
        let mut state = self.state.lock();
        if state.closed {
            return Action::Stop;
        }

        let handle = &self.handle;
        let mut rent = |size| handle.rent_packet(0, size);
        loop {
            match state.demux.step(inbound, &mut rent) {
                Step::Advance => {}
                Step::NeedData => return Action::Read,
                Step::Frame { header, payload } => {
                    tracing::trace!(
                        connection_id = %self.id,
                        session_id = header.session_id,
                        flags = header.flags.bits(),
                        length = header.length,
                        "SMUX frame received"
                    );
                    return state.route(header, payload);
                }
                Step::Corrupt(error) => return Action::Fatal(error.into(), None),
            }
        }
    }

    /// Latch a transport error and report it to every session.
    fn fail_sessions(&self, error: SniError) {
        tracing::warn!(connection_id = %self.id, error = %error, "MARS receive failed");

        let sessions = {
            let mut state = self.state.lock();
            state.last_error.get_or_insert_with(|| error.clone());
            state.live_sessions()
        };
        for session in sessions {
            session.handle_receive_error(error.clone());
        }
    }

    /// Tear the connection down after an unrecoverable error.
    fn fail_connection(&self, error: SniError) {
        tracing::warn!(connection_id = %self.id, error = %error, "MARS connection failed");
        self.shut_down(error);
    }

    fn shut_down(&self, error: SniError) {
        let (sessions, partial) = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.last_error.get_or_insert_with(|| error.clone());
            (state.live_sessions(), state.demux.reset())
        };

        if let Some(partial) = partial {
            self.handle.return_packet(partial);
        }
        for session in sessions {
            session.handle_receive_error(error.clone());
        }
        self.handle.dispose();
    }

    /// Close the physical connection.
    ///
    /// Pending and later session operations fail with
    /// [`SniError::ConnectionClosed`].
    pub fn dispose(&self) {
        tracing::debug!(connection_id = %self.id, "disposing MARS connection");
        self.shut_down(SniError::ConnectionClosed);
    }

    fn ensure_open(&self) -> Result<(), SniError> {
        let state = self.state.lock();
        if state.closed {
            return Err(state
                .last_error
                .clone()
                .unwrap_or(SniError::ConnectionClosed));
        }
        Ok(())
    }

    /// Check the physical connection.
    pub fn check_connection(&self) -> Result<(), SniError> {
        self.ensure_open()?;
        self.handle.check_connection()
    }

    /// Negotiate TLS on the physical connection.
    pub fn enable_tls(&self, config: &TlsConfig) -> Result<(), SniError> {
        self.ensure_open()?;
        self.handle.enable_tls(config)
    }

    /// Stop TLS on the physical connection.
    pub fn disable_tls(&self) {
        self.handle.disable_tls();
    }

    /// Rent a packet from the physical handle's pool.
    pub fn rent_packet(&self, header_size: usize, data_size: usize) -> Packet {
        self.handle.rent_packet(header_size, data_size)
    }

    /// Return a packet to the physical handle's pool.
    pub fn return_packet(&self, packet: Packet) {
        self.handle.return_packet(packet);
    }

    /// Number of sessions registered and not yet closed by the peer.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.state.lock().sessions.len()
    }

    /// Whether a session id is registered.
    #[must_use]
    pub fn has_session(&self, session_id: u16) -> bool {
        self.state.lock().sessions.contains_key(&session_id)
    }

    /// The latched connection error, if any.
    #[must_use]
    pub fn last_error(&self) -> Option<SniError> {
        self.state.lock().last_error.clone()
    }

    /// Whether the physical handle has been disposed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

impl Drop for MarsConnection {
    fn drop(&mut self) {
        if !self.state.get_mut().closed {
            self.handle.dispose();
        }
    }
}

impl std::fmt::Debug for MarsConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarsConnection")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}
