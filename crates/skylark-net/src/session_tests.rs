//! Integration-style tests for the session lifecycle, run against real
//! TCP listeners on the loopback interface.

use super::*;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::dispatch::{ExecutionContext, HandlerResult};
use crate::framing::Envelope;

/// Fast intervals so lifecycle tests finish in tens of milliseconds.
fn test_config() -> NetConfig {
    NetConfig {
        connect_timeout_ms: 1_000,
        auto_reconnect: true,
        reconnect_interval_ms: 25,
        heartbeat_interval_ms: 10,
        heartbeat_timeout_ms: 10_000,
        sender_stop_timeout_ms: 200,
        ..NetConfig::default()
    }
}

fn session_with(
    config: NetConfig,
) -> (
    Session,
    mpsc::UnboundedReceiver<SessionEvent>,
    Arc<Dispatcher>,
) {
    let (dispatcher, _main_queue) = Dispatcher::new();
    let dispatcher = Arc::new(dispatcher);
    let (session, events) = Session::new(config, Arc::clone(&dispatcher));
    (session, events, dispatcher)
}

/// Helper: a listener that keeps accepting and hands each accepted stream
/// to the test through a channel.
async fn accepting_server() -> (SocketAddr, mpsc::UnboundedReceiver<TcpStream>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    if tx.send(stream).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });
    (addr, rx)
}

/// Helper: an address nothing is listening on.
async fn dead_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

async fn next_stream(rx: &mut mpsc::UnboundedReceiver<TcpStream>) -> TcpStream {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for a connection")
        .expect("listener task ended")
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<SessionEvent>) -> SessionEvent {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for a session event")
        .expect("event channel closed")
}

async fn await_state(rx: &mut watch::Receiver<SessionState>, want: SessionState) {
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if *rx.borrow_and_update() == want {
                return;
            }
            rx.changed().await.expect("state watch closed");
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for state {want:?}"));
}

async fn eventually(what: &str, check: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !check() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// ---------------------------------------------------------------------------
// Connect / state machine
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_connect_reaches_connected_state() {
    let (addr, mut streams) = accepting_server().await;
    let (session, mut events, _dispatcher) = session_with(test_config());

    session.connect(addr).await.expect("connect failed");
    assert_eq!(session.state(), SessionState::Connected);

    let _stream = next_stream(&mut streams).await;
    assert!(matches!(
        next_event(&mut events).await,
        SessionEvent::Connected { .. }
    ));

    session.shutdown().await;
}

#[tokio::test]
async fn test_connect_rejected_while_connected() {
    let (addr, _streams) = accepting_server().await;
    let (session, _events, _dispatcher) = session_with(test_config());

    session.connect(addr).await.expect("connect failed");
    let second = session.connect(addr).await;
    assert!(matches!(second, Err(SessionError::NotDisconnected(_))));

    session.shutdown().await;
}

#[tokio::test]
async fn test_auth_progression_and_invalid_transitions() {
    let (addr, _streams) = accepting_server().await;
    let (session, _events, _dispatcher) = session_with(test_config());

    // No transport yet: application transitions are rejected.
    assert!(matches!(
        session.mark_authenticated(),
        Err(SessionError::InvalidTransition { .. })
    ));

    session.connect(addr).await.expect("connect failed");
    session.mark_authenticated().expect("auth transition failed");
    assert_eq!(session.state(), SessionState::Authenticated);
    assert!(session.state().is_established());

    // Repeating a transition is invalid; the order is fixed.
    assert!(matches!(
        session.mark_authenticated(),
        Err(SessionError::InvalidTransition { .. })
    ));

    session.mark_in_game().expect("in-game transition failed");
    assert_eq!(session.state(), SessionState::InGame);

    session.shutdown().await;
    assert_eq!(session.state(), SessionState::Disconnected);
    assert!(!session.state().is_established());
}

#[tokio::test]
async fn test_connect_failure_schedules_reconnect() {
    let addr = dead_addr().await;
    let (session, _events, _dispatcher) = session_with(test_config());

    let result = session.connect(addr).await;
    assert!(result.is_err());
    assert_eq!(session.state(), SessionState::Disconnected);
    assert!(session.is_reconnecting());

    session.shutdown().await;
    eventually("reconnect loop to stop", || !session.is_reconnecting()).await;
}

// ---------------------------------------------------------------------------
// Inbound dispatch
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_incoming_frames_dispatched_in_order() {
    let (addr, mut streams) = accepting_server().await;
    let (session, _events, dispatcher) = session_with(test_config());

    let received: Arc<StdMutex<Vec<Vec<u8>>>> = Arc::new(StdMutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    dispatcher.register(
        0x0100,
        Arc::new(move |env: &Envelope| -> HandlerResult {
            sink.lock().unwrap().push(env.payload.clone());
            Ok(())
        }),
        ExecutionContext::Inline,
    );

    session.connect(addr).await.expect("connect failed");
    let mut stream = next_stream(&mut streams).await;

    let frame_config = FrameConfig::default();
    let first = encode_frame(0x0100, b"alpha", &frame_config).unwrap();
    let second = encode_frame(0x0100, b"beta", &frame_config).unwrap();
    let third = encode_frame(0x0100, b"gamma", &frame_config).unwrap();

    // Two frames in one write, then the third split mid-frame to exercise
    // partial-frame reassembly across read chunks.
    let mut burst = first.clone();
    burst.extend_from_slice(&second);
    stream.write_all(&burst).await.unwrap();
    stream.write_all(&third[..3]).await.unwrap();
    stream.flush().await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    stream.write_all(&third[3..]).await.unwrap();

    eventually("all three frames to arrive", || {
        received.lock().unwrap().len() == 3
    })
    .await;
    let got = received.lock().unwrap().clone();
    assert_eq!(got, vec![b"alpha".to_vec(), b"beta".to_vec(), b"gamma".to_vec()]);

    session.shutdown().await;
}

#[tokio::test]
async fn test_unknown_kind_does_not_drop_connection() {
    let (addr, mut streams) = accepting_server().await;
    let (session, _events, dispatcher) = session_with(test_config());

    let received = Arc::new(StdMutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    dispatcher.register(
        0x0100,
        Arc::new(move |env: &Envelope| -> HandlerResult {
            sink.lock().unwrap().push(env.payload.clone());
            Ok(())
        }),
        ExecutionContext::Inline,
    );

    session.connect(addr).await.expect("connect failed");
    let mut stream = next_stream(&mut streams).await;

    let frame_config = FrameConfig::default();
    let unknown = encode_frame(0x0999, b"nobody wants this", &frame_config).unwrap();
    let known = encode_frame(0x0100, b"still alive", &frame_config).unwrap();
    stream.write_all(&unknown).await.unwrap();
    stream.write_all(&known).await.unwrap();

    eventually("the known frame to arrive", || {
        !received.lock().unwrap().is_empty()
    })
    .await;
    assert_eq!(session.state(), SessionState::Connected);

    session.shutdown().await;
}

#[tokio::test]
async fn test_decode_failure_drops_connection() {
    let (addr, mut streams) = accepting_server().await;
    let config = NetConfig {
        auto_reconnect: false,
        ..test_config()
    };
    let (session, mut events, _dispatcher) = session_with(config);

    session.connect(addr).await.expect("connect failed");
    assert!(matches!(
        next_event(&mut events).await,
        SessionEvent::Connected { .. }
    ));

    // A frame whose declared body cannot even hold the kind field.
    let mut stream = next_stream(&mut streams).await;
    stream.write_all(&[1, 0, 0, 0, 0xFF]).await.unwrap();

    let mut state = session.subscribe_state();
    await_state(&mut state, SessionState::Disconnected).await;
    match next_event(&mut events).await {
        SessionEvent::Disconnected {
            reason: DisconnectReason::DecodeFailure(_),
        } => {}
        other => panic!("expected decode-failure disconnect, got {other:?}"),
    }
    assert!(!session.is_reconnecting());
}

// ---------------------------------------------------------------------------
// Outbound
// ---------------------------------------------------------------------------

/// Read from `stream` until an envelope of `want` arrives, skipping
/// heartbeat traffic.
async fn read_envelope_of_kind(stream: &mut TcpStream, want: u16) -> Envelope {
    tokio::time::timeout(Duration::from_secs(2), async {
        let mut decoder = FrameDecoder::new(&FrameConfig::default());
        let mut buf = [0u8; 1024];
        loop {
            let n = stream.read(&mut buf).await.expect("server read failed");
            assert!(n > 0, "client closed before the frame arrived");
            for envelope in decoder.feed(&buf[..n]).expect("server decode failed") {
                if envelope.kind == want {
                    return envelope;
                }
            }
        }
    })
    .await
    .expect("timed out waiting for frame")
}

#[tokio::test]
async fn test_send_frames_reach_server() {
    let (addr, mut streams) = accepting_server().await;
    let (session, _events, _dispatcher) = session_with(test_config());

    session.connect(addr).await.expect("connect failed");
    let mut stream = next_stream(&mut streams).await;

    session.send(kind::WORLD_EVENT, b"boom at dawn").expect("send failed");

    let envelope = read_envelope_of_kind(&mut stream, kind::WORLD_EVENT).await;
    assert_eq!(envelope.payload, b"boom at dawn");

    session.shutdown().await;
}

#[tokio::test]
async fn test_send_while_disconnected_is_silently_dropped() {
    let (session, _events, _dispatcher) = session_with(test_config());
    session
        .send(kind::WORLD_EVENT, b"into the void")
        .expect("disconnected send should not error");
}

#[tokio::test]
async fn test_oversized_payload_rejected() {
    let config = NetConfig {
        max_payload_size: 64,
        ..test_config()
    };
    let (session, _events, _dispatcher) = session_with(config);

    let result = session.send(kind::WORLD_EVENT, &[0u8; 65]);
    assert!(matches!(result, Err(FrameError::PayloadTooLarge { .. })));
}

// ---------------------------------------------------------------------------
// Heartbeat
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_heartbeat_pings_flow() {
    let (addr, mut streams) = accepting_server().await;
    let (session, _events, _dispatcher) = session_with(test_config());

    session.connect(addr).await.expect("connect failed");
    let mut stream = next_stream(&mut streams).await;

    // One decoder across all reads, since two pings can share a chunk.
    let pings: Vec<Ping> = tokio::time::timeout(Duration::from_secs(2), async {
        let mut decoder = FrameDecoder::new(&FrameConfig::default());
        let mut pings = Vec::new();
        let mut buf = [0u8; 1024];
        while pings.len() < 2 {
            let n = stream.read(&mut buf).await.expect("server read failed");
            assert!(n > 0, "client closed before pings arrived");
            for envelope in decoder.feed(&buf[..n]).expect("server decode failed") {
                if envelope.kind == kind::PING {
                    pings.push(messages::decode_payload(&envelope.payload).expect("bad ping"));
                }
            }
        }
        pings
    })
    .await
    .expect("timed out waiting for pings");

    assert_eq!(pings[0].sequence, 1);
    assert_eq!(pings[1].sequence, 2);

    session.shutdown().await;
}

#[tokio::test]
async fn test_heartbeat_timeout_drops_connection() {
    let (addr, mut streams) = accepting_server().await;
    let config = NetConfig {
        auto_reconnect: false,
        heartbeat_interval_ms: 10,
        heartbeat_timeout_ms: 60,
        ..test_config()
    };
    let (session, mut events, _dispatcher) = session_with(config);

    session.connect(addr).await.expect("connect failed");
    assert!(matches!(
        next_event(&mut events).await,
        SessionEvent::Connected { .. }
    ));

    // Keep the socket open but never answer the pings.
    let _stream = next_stream(&mut streams).await;

    let mut state = session.subscribe_state();
    await_state(&mut state, SessionState::Disconnected).await;
    match next_event(&mut events).await {
        SessionEvent::Disconnected {
            reason: DisconnectReason::HeartbeatTimeout(_),
        } => {}
        other => panic!("expected heartbeat-timeout disconnect, got {other:?}"),
    }
}

// ---------------------------------------------------------------------------
// Reconnection
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_reconnects_after_server_drop() {
    let (addr, mut streams) = accepting_server().await;
    let (session, mut events, _dispatcher) = session_with(test_config());

    session.connect(addr).await.expect("connect failed");
    assert!(matches!(
        next_event(&mut events).await,
        SessionEvent::Connected { .. }
    ));

    // Server kills the connection; the session must come back on its own.
    // Depending on whether unread pings sat in the server's buffer, the
    // close surfaces as a clean EOF or a reset, both count.
    let stream = next_stream(&mut streams).await;
    drop(stream);

    match next_event(&mut events).await {
        SessionEvent::Disconnected {
            reason: DisconnectReason::PeerClosed | DisconnectReason::ReadError(_),
        } => {}
        other => panic!("expected connection-lost disconnect, got {other:?}"),
    }

    let _second_stream = next_stream(&mut streams).await;
    assert!(matches!(
        next_event(&mut events).await,
        SessionEvent::Connected { .. }
    ));

    let mut state = session.subscribe_state();
    await_state(&mut state, SessionState::Connected).await;
    assert!(session.reconnect_attempts() >= 1);

    session.shutdown().await;
}

#[tokio::test]
async fn test_reconnect_is_single_flight() {
    let addr = dead_addr().await;
    let (session, _events, _dispatcher) = session_with(test_config());

    let _ = session.connect(addr).await;
    assert!(session.is_reconnecting());

    // Pile up spurious triggers; only the already-running loop may retry.
    for _ in 0..30 {
        Shared::maybe_schedule_reconnect(&session.shared);
    }

    tokio::time::sleep(Duration::from_millis(150)).await;
    let attempts = session.reconnect_attempts();
    assert!(attempts >= 1, "loop never attempted, got {attempts}");
    assert!(
        attempts <= 12,
        "more attempts than one 25ms loop could make: {attempts}"
    );

    session.shutdown().await;
    eventually("reconnect loop to stop", || !session.is_reconnecting()).await;
}

#[tokio::test]
async fn test_disconnect_stops_reconnect_and_allows_fresh_connect() {
    let addr = dead_addr().await;
    // A retry interval much longer than the test: the loop would sit on
    // its claim for seconds if disconnect did not take it away.
    let config = NetConfig {
        reconnect_interval_ms: 5_000,
        ..test_config()
    };
    let (session, _events, _dispatcher) = session_with(config);

    let _ = session.connect(addr).await;
    assert!(session.is_reconnecting());

    // Disconnect cancels the pending retry delay outright; the claim is
    // gone by the time it returns, not after the interval runs out.
    session.disconnect().await;
    assert!(!session.is_reconnecting());
    assert_eq!(session.state(), SessionState::Disconnected);

    // The session is reusable against a live server right away.
    let (live_addr, mut streams) = accepting_server().await;
    session.connect(live_addr).await.expect("fresh connect failed");
    let _stream = next_stream(&mut streams).await;
    assert_eq!(session.state(), SessionState::Connected);

    session.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_is_idempotent() {
    let (addr, _streams) = accepting_server().await;
    let (session, mut events, _dispatcher) = session_with(test_config());

    session.connect(addr).await.expect("connect failed");
    session.shutdown().await;
    session.shutdown().await;

    assert_eq!(session.state(), SessionState::Disconnected);
    assert!(matches!(
        next_event(&mut events).await,
        SessionEvent::Connected { .. }
    ));
    assert!(matches!(
        next_event(&mut events).await,
        SessionEvent::Disconnected {
            reason: DisconnectReason::Requested,
        }
    ));
}
