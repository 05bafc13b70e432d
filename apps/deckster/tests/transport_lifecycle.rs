//! Transport lifecycle tests against a real in-process WebSocket listener:
//! heartbeat keep-alive, frame decode, and the reconnect/backoff policy.

use std::sync::Arc;
use std::time::Duration;

use deckster::config::SyncTuning;
use deckster::transport::{
    ConnectionState, DirectorConnection, SessionIdentity, TransportEvent,
};
use director_proto::FrameKind;
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

fn identity() -> SessionIdentity {
    SessionIdentity {
        session_id: "sess-test".into(),
        user_id: "user-test".into(),
    }
}

async fn accept_socket(listener: &TcpListener) -> WebSocketStream<TcpStream> {
    let (stream, _) = listener.accept().await.expect("tcp accept");
    tokio_tungstenite::accept_async(stream)
        .await
        .expect("websocket handshake")
}

async fn next_event(rx: &mut UnboundedReceiver<TransportEvent>) -> TransportEvent {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("event timeout")
        .expect("event channel closed")
}

#[tokio::test]
async fn heartbeat_pings_flow_and_pongs_are_swallowed() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let tuning = SyncTuning {
        heartbeat_interval: Duration::from_millis(40),
        auto_reconnect: false,
        ..SyncTuning::default()
    };
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let conn = Arc::new(
        DirectorConnection::new(&format!("ws://{addr}/ws"), tuning, tx).expect("connection"),
    );
    conn.set_identity(identity());

    let server = tokio::spawn(async move {
        let mut socket = accept_socket(&listener).await;
        let mut pings = 0u32;
        while pings < 3 {
            match socket.next().await {
                Some(Ok(Message::Text(text))) if text == "ping" => {
                    pings += 1;
                    socket
                        .send(Message::Text("pong".into()))
                        .await
                        .expect("pong send");
                }
                Some(Ok(_)) => {}
                _ => break,
            }
        }
        pings
    });

    conn.connect().await;
    assert_eq!(conn.state(), ConnectionState::Connected);

    let pings = timeout(Duration::from_secs(5), server)
        .await
        .expect("server timeout")
        .expect("server task");
    assert!(pings >= 3, "heartbeat must keep pinging while connected");

    conn.disconnect().await;
    assert_eq!(conn.state(), ConnectionState::Disconnected);

    // Pongs are heartbeat acks only; none of them surfaced as frames.
    while let Ok(event) = rx.try_recv() {
        assert!(
            !matches!(event, TransportEvent::Frame { .. }),
            "pong must never decode into a frame"
        );
    }
}

#[tokio::test]
async fn frames_decode_with_a_receipt_stamp_and_sends_roundtrip() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let tuning = SyncTuning {
        heartbeat_interval: Duration::from_secs(3600),
        auto_reconnect: false,
        ..SyncTuning::default()
    };
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let conn = Arc::new(
        DirectorConnection::new(&format!("ws://{addr}/ws"), tuning, tx).expect("connection"),
    );
    conn.set_identity(identity());

    let server = tokio::spawn(async move {
        let mut socket = accept_socket(&listener).await;
        socket
            .send(Message::Text(
                json!({
                    "message_id": "m1",
                    "session_id": "sess-test",
                    "timestamp": "2025-05-02T10:00:00Z",
                    "type": "chat_message",
                    "payload": {"text": "Hello there"}
                })
                .to_string(),
            ))
            .await
            .expect("frame send");
        // Malformed frames are dropped without killing the stream.
        socket
            .send(Message::Text("{not json".into()))
            .await
            .expect("garbage send");

        loop {
            match socket.next().await {
                Some(Ok(Message::Text(text))) if text != "ping" => {
                    let value: Value = serde_json::from_str(&text).expect("client frame json");
                    return value;
                }
                Some(Ok(_)) => {}
                other => panic!("socket ended early: {other:?}"),
            }
        }
    });

    conn.connect().await;
    loop {
        match next_event(&mut rx).await {
            TransportEvent::Frame { frame, received_at } => {
                assert_eq!(frame.kind(), FrameKind::ChatMessage);
                assert_eq!(frame.message_id, "m1");
                let age = chrono::Utc::now().signed_duration_since(received_at);
                assert!(age.num_seconds() < 5, "receipt stamp must be local and fresh");
                break;
            }
            TransportEvent::StateChanged(_) => {}
            other => panic!("unexpected event: {other:?}"),
        }
    }

    assert!(conn.send_user_message("Create a pitch deck", None));
    let envelope = timeout(Duration::from_secs(5), server)
        .await
        .expect("server timeout")
        .expect("server task");
    assert_eq!(envelope["type"], "user_message");
    assert_eq!(envelope["data"]["text"], "Create a pitch deck");

    conn.disconnect().await;
}

#[tokio::test]
async fn reconnects_back_off_and_stop_at_the_cap() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let tuning = SyncTuning {
        heartbeat_interval: Duration::from_secs(3600),
        reconnect_base_delay: Duration::from_millis(10),
        max_reconnect_attempts: 2,
        ..SyncTuning::default()
    };
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let conn = Arc::new(
        DirectorConnection::new(&format!("ws://{addr}/ws"), tuning, tx).expect("connection"),
    );
    conn.set_identity(identity());

    // Accept one handshake, then drop the socket and stop listening so every
    // retry is refused.
    let server = tokio::spawn(async move {
        let socket = accept_socket(&listener).await;
        drop(socket);
        drop(listener);
    });

    conn.connect().await;
    server.await.expect("server task");

    let mut errors = 0u32;
    loop {
        match next_event(&mut rx).await {
            TransportEvent::RetriesExhausted => break,
            TransportEvent::ConnectionError(_) => errors += 1,
            TransportEvent::StateChanged(_) => {}
            other => panic!("unexpected event: {other:?}"),
        }
    }
    assert_eq!(errors, 2, "one failed handshake per allowed attempt");
    assert_eq!(conn.state(), ConnectionState::Failed);

    // No further attempts are scheduled after the cap.
    tokio::time::sleep(Duration::from_millis(150)).await;
    while let Ok(event) = rx.try_recv() {
        assert!(
            !matches!(
                event,
                TransportEvent::ConnectionError(_)
                    | TransportEvent::StateChanged(ConnectionState::Reconnecting)
            ),
            "no reconnect activity past the cap, got {event:?}"
        );
    }
}

#[tokio::test]
async fn a_connection_that_never_opened_does_not_retry() {
    // Bind then immediately free a port so the connect is refused.
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    drop(listener);

    let tuning = SyncTuning {
        reconnect_base_delay: Duration::from_millis(10),
        ..SyncTuning::default()
    };
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let conn = Arc::new(
        DirectorConnection::new(&format!("ws://{addr}/ws"), tuning, tx).expect("connection"),
    );
    conn.set_identity(identity());

    conn.connect().await;
    assert_eq!(conn.state(), ConnectionState::Failed);

    tokio::time::sleep(Duration::from_millis(100)).await;
    let mut saw_error = false;
    while let Ok(event) = rx.try_recv() {
        match event {
            TransportEvent::ConnectionError(_) => saw_error = true,
            TransportEvent::StateChanged(ConnectionState::Reconnecting) => {
                panic!("a never-opened connection must not reconnect-loop")
            }
            TransportEvent::RetriesExhausted => {
                panic!("config failure is not retry exhaustion")
            }
            TransportEvent::StateChanged(_) => {}
            TransportEvent::Frame { .. } => panic!("no frames expected"),
        }
    }
    assert!(saw_error, "the failed handshake surfaces as an error event");
}
