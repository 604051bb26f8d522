//! Session flow control: send window, ACK threshold, and error latching.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod common;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use common::{MockHandle, ack, data};
use futures_util::FutureExt;
use mssql_sni::mars::{ACK_THRESHOLD, INITIAL_WINDOW};
use mssql_sni::{AsyncReceive, MarsConnection, MarsSession, SmuxFrameKind, SniError};

const NO_WAIT: Option<Duration> = Some(Duration::from_millis(0));

fn connect() -> (Arc<MockHandle>, Arc<MarsConnection>, MarsSession) {
    let handle = MockHandle::new();
    let connection = MarsConnection::new(handle.clone());
    connection.start_receive().unwrap();
    let session = connection.create_session().unwrap();
    (handle, connection, session)
}

fn packet(session: &MarsSession, body: &[u8]) -> mssql_sni::Packet {
    let mut packet = session.rent_packet(body.len());
    packet.append_data(body);
    packet
}

fn data_sequences(handle: &MockHandle) -> Vec<u32> {
    handle
        .sent_of_kind(SmuxFrameKind::Data)
        .iter()
        .map(|f| f.header.sequence_number)
        .collect()
}

#[tokio::test]
async fn test_window_queues_fifth_send_until_ack() {
    let (handle, _connection, session) = connect();
    assert_eq!(handle.sent_of_kind(SmuxFrameKind::Syn).len(), 1);

    let mut completions: Vec<_> = (0..5u8)
        .map(|i| session.send_async(packet(&session, &[i; 8])))
        .collect();

    assert_eq!(data_sequences(&handle), vec![0, 1, 2, 3]);
    assert_eq!(session.queued_sends(), 1);
    let fifth = completions.pop().unwrap();
    for completion in completions {
        completion.await.unwrap();
    }

    handle.deliver(&ack(0, 6));

    assert_eq!(data_sequences(&handle), vec![0, 1, 2, 3, 4]);
    assert_eq!(session.queued_sends(), 0);
    fifth.await.unwrap();

    let frames = handle.sent_of_kind(SmuxFrameKind::Data);
    assert_eq!(frames[4].payload, vec![4u8; 8]);
}

#[tokio::test]
async fn test_ack_releases_only_what_fits() {
    let (handle, _connection, session) = connect();

    let completions: Vec<_> = (0..8u8)
        .map(|i| session.send_async(packet(&session, &[i])))
        .collect();
    assert_eq!(data_sequences(&handle), vec![0, 1, 2, 3]);

    handle.deliver(&ack(0, 6));
    assert_eq!(data_sequences(&handle), vec![0, 1, 2, 3, 4, 5]);
    assert_eq!(session.queued_sends(), 2);

    // an unchanged highwater releases nothing
    handle.deliver(&ack(0, 6));
    assert_eq!(session.queued_sends(), 2);

    handle.deliver(&ack(0, 20));
    let frames = handle.sent_of_kind(SmuxFrameKind::Data);
    let payloads: Vec<u8> = frames.iter().map(|f| f.payload[0]).collect();
    assert_eq!(payloads, (0..8u8).collect::<Vec<_>>());

    for completion in completions {
        completion.await.unwrap();
    }
}

#[test]
fn test_data_frame_highwater_opens_window() {
    let (handle, _connection, session) = connect();

    for i in 0..5u8 {
        drop(session.send_async(packet(&session, &[i])));
    }
    assert_eq!(session.queued_sends(), 1);

    handle.deliver(&data(0, 0, 5, b"reply"));
    assert_eq!(data_sequences(&handle), vec![0, 1, 2, 3, 4]);
}

#[test]
fn test_blocking_send_waits_for_window() {
    let (handle, _connection, session) = connect();
    let session = Arc::new(session);

    for i in 0..INITIAL_WINDOW {
        session.send(packet(&session, &[i as u8])).unwrap();
    }

    let sender = {
        let session = Arc::clone(&session);
        thread::spawn(move || session.send(packet(&session, b"blocked")))
    };

    thread::sleep(Duration::from_millis(50));
    assert_eq!(handle.sent_of_kind(SmuxFrameKind::Data).len(), 4);

    handle.deliver(&ack(0, 5));
    sender.join().unwrap().unwrap();
    assert_eq!(data_sequences(&handle), vec![0, 1, 2, 3, 4]);
}

#[test]
fn test_blocking_send_fails_on_connection_error() {
    let (handle, _connection, session) = connect();
    let session = Arc::new(session);

    for i in 0..INITIAL_WINDOW {
        session.send(packet(&session, &[i as u8])).unwrap();
    }
    let sender = {
        let session = Arc::clone(&session);
        thread::spawn(move || session.send(packet(&session, b"blocked")))
    };

    thread::sleep(Duration::from_millis(50));
    handle.deliver_error(SniError::ConnectionTerminated);

    assert!(matches!(
        sender.join().unwrap(),
        Err(SniError::ConnectionTerminated)
    ));
}

#[test]
fn test_ack_sent_after_threshold() {
    let (handle, _connection, session) = connect();

    let mut wire = Vec::new();
    for seq in 0..4 {
        wire.extend(data(0, seq, 4, b"x"));
    }
    handle.deliver(&wire);
    // arrival alone never acknowledges
    assert!(handle.sent_of_kind(SmuxFrameKind::Ack).is_empty());

    for _ in 0..ACK_THRESHOLD {
        session.receive(NO_WAIT).unwrap();
        assert!(handle.sent_of_kind(SmuxFrameKind::Ack).is_empty());
    }

    session.receive(NO_WAIT).unwrap();
    let acks = handle.sent_of_kind(SmuxFrameKind::Ack);
    assert_eq!(acks.len(), 1);
    assert_eq!(acks[0].header.highwater, INITIAL_WINDOW + ACK_THRESHOLD + 1);

    session.receive(NO_WAIT).unwrap();
    assert_eq!(handle.sent_of_kind(SmuxFrameKind::Ack).len(), 1);
}

#[test]
fn test_outbound_data_carries_acknowledgment() {
    let (handle, _connection, session) = connect();

    handle.deliver(&data(0, 0, 4, b"a"));
    handle.deliver(&data(0, 1, 4, b"b"));
    session.receive(NO_WAIT).unwrap();
    session.receive(NO_WAIT).unwrap();

    session.send(packet(&session, b"request")).unwrap();
    let frames = handle.sent_of_kind(SmuxFrameKind::Data);
    assert_eq!(frames[0].header.highwater, 6);

    // the DATA frame reset the threshold
    handle.deliver(&data(0, 2, 4, b"c"));
    session.receive(NO_WAIT).unwrap();
    assert!(handle.sent_of_kind(SmuxFrameKind::Ack).is_empty());
}

#[test]
fn test_receive_times_out() {
    let (_handle, _connection, session) = connect();

    let err = session
        .receive(Some(Duration::from_millis(20)))
        .unwrap_err();
    assert!(err.is_timeout());
}

#[test]
fn test_blocking_receive_wakes_on_data() {
    let (handle, _connection, session) = connect();
    let session = Arc::new(session);

    let receiver = {
        let session = Arc::clone(&session);
        thread::spawn(move || session.receive(Some(Duration::from_secs(5))))
    };
    thread::sleep(Duration::from_millis(20));
    handle.deliver(&data(0, 0, 4, b"wake"));

    assert_eq!(receiver.join().unwrap().unwrap().data(), b"wake");
}

#[tokio::test]
async fn test_pending_receive_resolves_on_data() {
    let (handle, _connection, session) = connect();

    let pending = match session.receive_async().unwrap() {
        AsyncReceive::Pending(pending) => pending,
        AsyncReceive::Ready(_) => panic!("nothing was queued"),
    };
    assert_eq!(session.pending_receives(), 1);

    handle.deliver(&data(0, 0, 4, b"async"));
    assert_eq!(session.pending_receives(), 0);
    assert_eq!(pending.await.unwrap().data(), b"async");
}

#[tokio::test]
async fn test_receive_async_ready_when_queued() {
    let (handle, _connection, session) = connect();
    handle.deliver(&data(0, 0, 4, b"queued"));

    match session.receive_async().unwrap() {
        AsyncReceive::Ready(packet) => assert_eq!(packet.data(), b"queued"),
        AsyncReceive::Pending(_) => panic!("data was queued"),
    }
}

#[tokio::test]
async fn test_abandoned_receive_does_not_lose_data() {
    let (handle, _connection, session) = connect();

    let AsyncReceive::Pending(abandoned) = session.receive_async().unwrap() else {
        panic!("nothing was queued");
    };
    drop(abandoned);

    handle.deliver(&data(0, 0, 4, b"kept"));
    assert_eq!(session.recv().await.unwrap().data(), b"kept");
}

#[tokio::test]
async fn test_pending_receive_fails_with_latched_error() {
    let (handle, _connection, session) = connect();

    let AsyncReceive::Pending(pending) = session.receive_async().unwrap() else {
        panic!("nothing was queued");
    };
    handle.deliver_error(SniError::ConnectionTerminated);

    assert!(matches!(
        pending.await,
        Err(SniError::ConnectionTerminated)
    ));
    assert!(matches!(
        session.recv().await,
        Err(SniError::ConnectionTerminated)
    ));
    assert!(matches!(
        session.last_error(),
        Some(SniError::ConnectionTerminated)
    ));
}

#[tokio::test]
async fn test_queued_sends_fail_with_latched_error() {
    let (handle, _connection, session) = connect();

    let completions: Vec<_> = (0..6u8)
        .map(|i| session.send_async(packet(&session, &[i])))
        .collect();
    assert_eq!(session.queued_sends(), 2);

    handle.deliver_error(SniError::ConnectionTerminated);
    assert_eq!(session.queued_sends(), 0);

    let results: Vec<_> = futures_util::future::join_all(completions).await;
    assert!(results[..4].iter().all(Result::is_ok));
    assert!(
        results[4..]
            .iter()
            .all(|r| matches!(r, Err(SniError::ConnectionTerminated)))
    );

    let late = session.send_async(packet(&session, b"late")).await;
    assert!(matches!(late, Err(SniError::ConnectionTerminated)));
}

#[tokio::test]
async fn test_deferred_completion() {
    let (handle, _connection, session) = connect();
    handle.defer_completions();

    let mut completion = session.send_async(packet(&session, b"slow"));
    assert!((&mut completion).now_or_never().is_none());

    assert_eq!(handle.complete_sends(), 1);
    completion.await.unwrap();
    assert!(handle.idle_packets() > 0);
}

#[tokio::test]
async fn test_failed_send_completes_with_error() {
    let (handle, _connection, session) = connect();
    handle.fail_sends(SniError::ConnectionTerminated);

    let result = session.send_async(packet(&session, b"doomed")).await;
    assert!(matches!(result, Err(SniError::ConnectionTerminated)));
}

#[test]
fn test_close_reports_failed_fin() {
    let (handle, _connection, session) = connect();
    handle.fail_sends(SniError::ConnectionTerminated);

    assert!(matches!(session.close(), Err(SniError::Internal(_))));
}

#[test]
fn test_tls_passthrough() {
    let (handle, connection, session) = connect();

    session.enable_tls(&mssql_sni::TlsConfig::new()).unwrap();
    assert!(handle.tls_enabled());
    session.disable_tls();
    assert!(!handle.tls_enabled());

    session.check_connection().unwrap();
    connection.dispose();
    assert!(session.check_connection().is_err());
}

#[test]
fn test_send_rejects_packet_without_header_room() {
    let (handle, connection, session) = connect();

    let mut bare = connection.rent_packet(0, 20);
    bare.append_data(b"ABCDEFGHIJKLMNOPQRST");
    assert!(matches!(session.send(bare), Err(SniError::Internal(_))));

    let mut read = session.rent_packet(4);
    read.append_data(b"abcd");
    let mut first = [0u8; 1];
    read.take_data(&mut first);
    assert!(matches!(session.send(read), Err(SniError::Internal(_))));

    assert!(handle.sent_of_kind(SmuxFrameKind::Data).is_empty());

    // the sequence number was not consumed
    session.send(packet(&session, b"ok")).unwrap();
    assert_eq!(data_sequences(&handle), vec![0]);
}

#[tokio::test]
async fn test_send_async_rejects_packet_without_header_room() {
    let (handle, connection, session) = connect();

    let mut bare = connection.rent_packet(0, 20);
    bare.append_data(b"ABCDEFGHIJKLMNOPQRST");
    let result = session.send_async(bare).await;

    assert!(matches!(result, Err(SniError::Internal(_))));
    assert!(handle.sent_of_kind(SmuxFrameKind::Data).is_empty());
    assert_eq!(session.queued_sends(), 0);
}

#[tokio::test]
async fn test_abandoned_receives_are_not_counted() {
    let (_handle, _connection, session) = connect();

    let AsyncReceive::Pending(first) = session.receive_async().unwrap() else {
        panic!("nothing was queued");
    };
    let AsyncReceive::Pending(second) = session.receive_async().unwrap() else {
        panic!("nothing was queued");
    };
    assert_eq!(session.pending_receives(), 2);

    drop(first);
    assert_eq!(session.pending_receives(), 1);
    drop(second);
    assert_eq!(session.pending_receives(), 0);
}
