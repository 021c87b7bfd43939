//! Integration tests for the chat session over loopback TCP.

use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;

use veil_common::protocol::RECV_BUFFER_SIZE;
use veil_core::dial::connect_with_timeout;
use veil_core::{connect, ChatListener, CloseReason, Error, Session, SessionEvent, SessionState};
use veil_crypto::{ChatCipher, SessionKey, KEY_LEN};

const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Listener on an ephemeral port plus a loopback dialer.
async fn session_pair() -> (Session, Session) {
    let listener = ChatListener::bind(0).unwrap();
    let port = listener.local_addr().port();

    let accept = tokio::spawn(async move { listener.accept().await.unwrap() });
    let dialer = connect("127.0.0.1", port).await.unwrap();
    let listener = timeout(TEST_TIMEOUT, accept).await.unwrap().unwrap();

    (listener, dialer)
}

fn channels() -> (
    mpsc::Sender<String>,
    mpsc::Receiver<String>,
    mpsc::Sender<SessionEvent>,
    mpsc::Receiver<SessionEvent>,
) {
    let (line_tx, line_rx) = mpsc::channel(8);
    let (event_tx, event_rx) = mpsc::channel(32);
    (line_tx, line_rx, event_tx, event_rx)
}

async fn next_received(events: &mut mpsc::Receiver<SessionEvent>) -> String {
    loop {
        match timeout(TEST_TIMEOUT, events.recv()).await.unwrap() {
            Some(SessionEvent::MessageReceived { text, .. }) => return text,
            Some(_) => continue,
            None => panic!("event channel closed before a message arrived"),
        }
    }
}

async fn next_dropped(events: &mut mpsc::Receiver<SessionEvent>) -> String {
    loop {
        match timeout(TEST_TIMEOUT, events.recv()).await.unwrap() {
            Some(SessionEvent::MessageDropped { reason }) => return reason,
            Some(_) => continue,
            None => panic!("event channel closed before a drop was reported"),
        }
    }
}

#[tokio::test]
async fn test_dialer_receives_listener_key() {
    let (listener, dialer) = session_pair().await;

    assert_eq!(listener.key().len(), KEY_LEN);
    assert_eq!(listener.key().as_bytes(), dialer.key().as_bytes());

    // Neither side has entered the chat loop yet.
    assert_eq!(listener.state(), SessionState::Idle);
    assert_eq!(dialer.state(), SessionState::Idle);
    assert_eq!(listener.peer_addr(), dialer.local_addr());
    assert_eq!(dialer.peer_addr().port(), listener.local_addr().port());
}

#[tokio::test]
async fn test_messages_flow_both_ways_and_quit_closes_both_ends() {
    let (listener, dialer) = session_pair().await;

    let (l_line_tx, l_line_rx, l_event_tx, mut l_events) = channels();
    let (d_line_tx, d_line_rx, d_event_tx, mut d_events) = channels();

    let l_run = tokio::spawn(listener.run(l_line_rx, l_event_tx));
    let d_run = tokio::spawn(dialer.run(d_line_rx, d_event_tx));

    d_line_tx.send("hello from the dialer".into()).await.unwrap();
    assert_eq!(next_received(&mut l_events).await, "hello from the dialer");

    l_line_tx.send("hello back".into()).await.unwrap();
    assert_eq!(next_received(&mut d_events).await, "hello back");

    // Blank lines and /clear must not reach the peer.
    l_line_tx.send("   ".into()).await.unwrap();
    l_line_tx.send("/clear".into()).await.unwrap();
    l_line_tx.send("after the clear".into()).await.unwrap();
    assert_eq!(next_received(&mut d_events).await, "after the clear");

    // Local quit, then both sessions close within the timeout interval.
    l_line_tx.send("/quit".into()).await.unwrap();
    let l_reason = timeout(TEST_TIMEOUT, l_run).await.unwrap().unwrap().unwrap();
    assert_eq!(l_reason, CloseReason::LocalQuit);

    let d_reason = timeout(TEST_TIMEOUT, d_run).await.unwrap().unwrap().unwrap();
    assert_eq!(d_reason, CloseReason::PeerDisconnected);

    // Cleanup ran exactly once on each side.
    let mut l_closed = 0;
    while let Some(event) = l_events.recv().await {
        if event == SessionEvent::Closed {
            l_closed += 1;
        }
    }
    assert_eq!(l_closed, 1);

    let mut d_closed = 0;
    while let Some(event) = d_events.recv().await {
        if event == SessionEvent::Closed {
            d_closed += 1;
        }
    }
    assert_eq!(d_closed, 1);
}

#[tokio::test]
async fn test_abrupt_peer_drop_closes_session() {
    let listener = ChatListener::bind(0).unwrap();
    let port = listener.local_addr().port();
    let accept = tokio::spawn(async move { listener.accept().await.unwrap() });

    // Raw peer: take the key, then vanish.
    let mut raw = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let mut key_buf = [0u8; 64];
    let n = raw.read(&mut key_buf).await.unwrap();
    assert_eq!(n, KEY_LEN);

    let session = timeout(TEST_TIMEOUT, accept).await.unwrap().unwrap();
    let running = session.running_flag();
    assert!(running.load(Ordering::SeqCst));

    let (_line_tx, line_rx, event_tx, mut events) = channels();
    let run = tokio::spawn(session.run(line_rx, event_tx));

    drop(raw);

    let reason = timeout(TEST_TIMEOUT, run).await.unwrap().unwrap().unwrap();
    assert_eq!(reason, CloseReason::PeerDisconnected);
    assert!(!running.load(Ordering::SeqCst));

    let mut saw_disconnect = false;
    let mut saw_closed = false;
    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::PeerDisconnected { .. } => saw_disconnect = true,
            SessionEvent::Closed => saw_closed = true,
            _ => {}
        }
    }
    assert!(saw_disconnect);
    assert!(saw_closed);
}

#[tokio::test]
async fn test_corrupt_message_is_dropped_session_survives() {
    let listener = ChatListener::bind(0).unwrap();
    let port = listener.local_addr().port();
    let accept = tokio::spawn(async move { listener.accept().await.unwrap() });

    let mut raw = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let mut key_buf = [0u8; 64];
    let n = raw.read(&mut key_buf).await.unwrap();
    let key = SessionKey::from_bytes(&key_buf[..n]).unwrap();
    let cipher = ChatCipher::new(&key).unwrap();

    let session = timeout(TEST_TIMEOUT, accept).await.unwrap().unwrap();
    let (_line_tx, line_rx, event_tx, mut events) = channels();
    let run = tokio::spawn(session.run(line_rx, event_tx));

    // Garbage first: dropped, not fatal. Wait for the drop report before
    // sending more, so the writes cannot coalesce into one read.
    raw.write_all(&[0x17u8; 48]).await.unwrap();
    let reason = next_dropped(&mut events).await;
    assert!(reason.contains("decryption failed"));

    // A properly sealed message still arrives afterwards.
    let blob = cipher.encrypt(b"still alive").unwrap();
    raw.write_all(&blob).await.unwrap();
    assert_eq!(next_received(&mut events).await, "still alive");

    // Valid ciphertext that is not UTF-8 is also dropped, not fatal.
    let blob = cipher.encrypt(&[0xff, 0xfe, 0x80]).unwrap();
    raw.write_all(&blob).await.unwrap();
    let reason = next_dropped(&mut events).await;
    assert!(reason.contains("UTF-8"));

    drop(raw);
    let reason = timeout(TEST_TIMEOUT, run).await.unwrap().unwrap().unwrap();
    assert_eq!(reason, CloseReason::PeerDisconnected);
}

#[tokio::test]
async fn test_oversized_message_is_refused_locally() {
    let (listener, dialer) = session_pair().await;

    let (l_line_tx, l_line_rx, l_event_tx, mut l_events) = channels();
    let (_d_line_tx, d_line_rx, d_event_tx, _d_events) = channels();

    let l_run = tokio::spawn(listener.run(l_line_rx, l_event_tx));
    let d_run = tokio::spawn(dialer.run(d_line_rx, d_event_tx));

    let oversized = "x".repeat(RECV_BUFFER_SIZE);
    l_line_tx.send(oversized).await.unwrap();
    let reason = next_dropped(&mut l_events).await;
    assert!(reason.contains("not sent"));

    l_line_tx.send("/quit".into()).await.unwrap();
    let l_reason = timeout(TEST_TIMEOUT, l_run).await.unwrap().unwrap().unwrap();
    assert_eq!(l_reason, CloseReason::LocalQuit);
    let d_reason = timeout(TEST_TIMEOUT, d_run).await.unwrap().unwrap().unwrap();
    assert_eq!(d_reason, CloseReason::PeerDisconnected);
}

#[tokio::test]
async fn test_input_channel_eof_closes_session() {
    let (listener, dialer) = session_pair().await;

    let (l_line_tx, l_line_rx, l_event_tx, _l_events) = channels();
    let (d_line_tx, d_line_rx, d_event_tx, _d_events) = channels();

    let l_run = tokio::spawn(listener.run(l_line_rx, l_event_tx));
    let d_run = tokio::spawn(dialer.run(d_line_rx, d_event_tx));

    // Stdin EOF on the listener side.
    drop(l_line_tx);

    let l_reason = timeout(TEST_TIMEOUT, l_run).await.unwrap().unwrap().unwrap();
    assert_eq!(l_reason, CloseReason::InputClosed);
    let d_reason = timeout(TEST_TIMEOUT, d_run).await.unwrap().unwrap().unwrap();
    assert_eq!(d_reason, CloseReason::PeerDisconnected);

    drop(d_line_tx);
}

#[tokio::test]
async fn test_connect_refused_reports_error_without_session() {
    // Bind then drop to find a port with nothing listening.
    let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = probe.local_addr().unwrap().port();
    drop(probe);

    match connect("127.0.0.1", port).await {
        Err(Error::Connect { .. }) => {}
        Err(e) => panic!("expected a connection failure, got: {e}"),
        Ok(_) => panic!("unexpectedly connected"),
    }
}

/// Requires a route that silently drops SYNs (for example a firewalled
/// public address); loopback cannot produce a genuine connect timeout.
#[tokio::test]
#[ignore]
async fn test_connect_timeout_is_distinct_from_refusal() {
    match connect_with_timeout("10.255.255.1", 9, Duration::from_millis(500)).await {
        Err(Error::ConnectTimeout { .. }) => {}
        Err(e) => panic!("expected a timeout, got: {e}"),
        Ok(_) => panic!("unexpectedly connected"),
    }
}
