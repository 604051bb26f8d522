//! Scripted physical handle for MARS tests.
//!
//! Records every frame written, serves scripted reads, and lets a test push
//! inbound data through the registered receive callback.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use mssql_sni::{
    IoStatus, Packet, PacketPool, PhysicalHandle, ReceiveCallback, ReceiveStatus, SmuxFrameKind,
    SmuxHeader, SniError, TlsConfig,
};
use parking_lot::Mutex;

/// A frame captured from a send.
#[derive(Debug, Clone)]
pub struct SentFrame {
    pub header: SmuxHeader,
    pub payload: Vec<u8>,
}

impl SentFrame {
    pub fn kind(&self) -> SmuxFrameKind {
        self.header.kind().unwrap()
    }
}

pub struct MockHandle {
    pool: PacketPool,
    sent: Mutex<Vec<Vec<u8>>>,
    scripted: Mutex<VecDeque<Result<Vec<u8>, SniError>>>,
    callback: Mutex<Option<ReceiveCallback>>,
    receive_calls: AtomicUsize,
    defer_completions: AtomicBool,
    deferred: Mutex<Vec<Packet>>,
    fail_sends: Mutex<Option<SniError>>,
    tls_enabled: AtomicBool,
    disposed: AtomicBool,
}

impl MockHandle {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            pool: PacketPool::new(16),
            sent: Mutex::new(Vec::new()),
            scripted: Mutex::new(VecDeque::new()),
            callback: Mutex::new(None),
            receive_calls: AtomicUsize::new(0),
            defer_completions: AtomicBool::new(false),
            deferred: Mutex::new(Vec::new()),
            fail_sends: Mutex::new(None),
            tls_enabled: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
        })
    }

    /// Queue data for the next `receive_async` to return synchronously.
    pub fn script(&self, bytes: &[u8]) {
        self.scripted.lock().push_back(Ok(bytes.to_vec()));
    }

    /// Queue a failure for the next `receive_async`.
    pub fn script_error(&self, error: SniError) {
        self.scripted.lock().push_back(Err(error));
    }

    /// Complete a pending read with `bytes`.
    pub fn deliver(&self, bytes: &[u8]) {
        let mut packet = self.pool.rent(0, bytes.len());
        packet.append_data(bytes);
        let callback = self.callback.lock().clone().expect("no receive callback");
        callback(packet, Ok(()));
    }

    /// Complete a pending read with an error.
    pub fn deliver_error(&self, error: SniError) {
        let packet = self.pool.rent_receive_buffer();
        let callback = self.callback.lock().clone().expect("no receive callback");
        callback(packet, Err(error));
    }

    /// Hold send completions until [`complete_sends`](Self::complete_sends).
    pub fn defer_completions(&self) {
        self.defer_completions.store(true, Ordering::SeqCst);
    }

    /// Run every held send completion successfully.
    pub fn complete_sends(&self) -> usize {
        let packets: Vec<Packet> = self.deferred.lock().drain(..).collect();
        let n = packets.len();
        for packet in packets {
            packet.complete(Ok(()));
        }
        n
    }

    /// Make every later send fail.
    pub fn fail_sends(&self, error: SniError) {
        *self.fail_sends.lock() = Some(error);
    }

    pub fn receive_calls(&self) -> usize {
        self.receive_calls.load(Ordering::SeqCst)
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    pub fn tls_enabled(&self) -> bool {
        self.tls_enabled.load(Ordering::SeqCst)
    }

    pub fn idle_packets(&self) -> usize {
        self.pool.idle_count()
    }

    /// Every frame written so far, decoded.
    pub fn sent_frames(&self) -> Vec<SentFrame> {
        self.sent
            .lock()
            .iter()
            .map(|bytes| {
                let mut src = bytes.as_slice();
                let header = SmuxHeader::decode(&mut src).unwrap();
                SentFrame {
                    header,
                    payload: src.to_vec(),
                }
            })
            .collect()
    }

    pub fn sent_of_kind(&self, kind: SmuxFrameKind) -> Vec<SentFrame> {
        self.sent_frames()
            .into_iter()
            .filter(|f| f.kind() == kind)
            .collect()
    }

    pub fn clear_sent(&self) {
        self.sent.lock().clear();
    }

    fn record(&self, packet: &Packet) -> Result<(), SniError> {
        if let Some(error) = self.fail_sends.lock().clone() {
            return Err(error);
        }
        self.sent.lock().push(packet.data().to_vec());
        Ok(())
    }
}

impl PhysicalHandle for MockHandle {
    fn send(&self, packet: &Packet) -> Result<(), SniError> {
        self.record(packet)
    }

    fn send_async(&self, packet: Packet) -> Result<IoStatus, SniError> {
        if let Err(error) = self.record(&packet) {
            packet.complete(Err(error.clone()));
            return Err(error);
        }
        if self.defer_completions.load(Ordering::SeqCst) {
            self.deferred.lock().push(packet);
            return Ok(IoStatus::Pending);
        }
        packet.complete(Ok(()));
        Ok(IoStatus::Complete)
    }

    fn receive(&self, _timeout: Option<Duration>) -> Result<Packet, SniError> {
        match self.scripted.lock().pop_front() {
            Some(Ok(bytes)) => {
                let mut packet = self.pool.rent(0, bytes.len());
                packet.append_data(&bytes);
                Ok(packet)
            }
            Some(Err(error)) => Err(error),
            None => Err(SniError::WaitTimeout),
        }
    }

    fn receive_async(&self) -> Result<ReceiveStatus, SniError> {
        self.receive_calls.fetch_add(1, Ordering::SeqCst);
        match self.scripted.lock().pop_front() {
            Some(Ok(bytes)) => {
                let mut packet = self.pool.rent(0, bytes.len());
                packet.append_data(&bytes);
                Ok(ReceiveStatus::Ready(packet))
            }
            Some(Err(error)) => Err(error),
            None => Ok(ReceiveStatus::Pending),
        }
    }

    fn set_receive_callback(&self, callback: ReceiveCallback) {
        *self.callback.lock() = Some(callback);
    }

    fn enable_tls(&self, _config: &TlsConfig) -> Result<(), SniError> {
        self.tls_enabled.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn disable_tls(&self) {
        self.tls_enabled.store(false, Ordering::SeqCst);
    }

    fn check_connection(&self) -> Result<(), SniError> {
        if self.is_disposed() {
            return Err(SniError::ConnectionTerminated);
        }
        Ok(())
    }

    fn rent_packet(&self, header_size: usize, data_size: usize) -> Packet {
        self.pool.rent(header_size, data_size)
    }

    fn return_packet(&self, packet: Packet) {
        self.pool.return_packet(packet);
    }

    fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
    }
}

/// Encode one inbound frame.
pub fn frame(kind: SmuxFrameKind, session_id: u16, sequence: u32, highwater: u32, payload: &[u8]) -> Vec<u8> {
    let header = SmuxHeader::new(kind, session_id, payload.len() as u32, sequence, highwater);
    let mut out = header.to_bytes().to_vec();
    out.extend_from_slice(payload);
    out
}

pub fn data(session_id: u16, sequence: u32, highwater: u32, payload: &[u8]) -> Vec<u8> {
    frame(SmuxFrameKind::Data, session_id, sequence, highwater, payload)
}

pub fn ack(session_id: u16, highwater: u32) -> Vec<u8> {
    frame(SmuxFrameKind::Ack, session_id, 0, highwater, &[])
}

pub fn fin(session_id: u16) -> Vec<u8> {
    frame(SmuxFrameKind::Fin, session_id, 0, 4, &[])
}
