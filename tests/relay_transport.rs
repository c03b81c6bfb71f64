//! Integration tests against a real WebSocket relay.
//!
//! The main relay here is a minimal stand-in: it registers each connection,
//! forwards every text frame to the other connections and acks operations
//! back to their sender. Two scripted relays cover reconnects and URL
//! fallback.

use std::sync::Arc;

use collab_ot::sync::presence::UserInfo;
use collab_ot::sync::protocol::{
    InboundFrame, ProtocolMessage, RelayControl, SyncProtocol, UserLeave,
};
use collab_ot::transport::{ConnectionState, Transport};
use collab_ot::{
    CollaborationSession, CursorState, RelayTransport, SessionConfig, TransportConfig,
    TransportEvent,
};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration, Instant};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

type Clients = Arc<Mutex<Vec<(u64, mpsc::UnboundedSender<Message>)>>>;

/// Find a free port for testing.
async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Serve a relay on `port`; returns every text frame it receives.
async fn start_test_relay(port: u16) -> Arc<Mutex<Vec<String>>> {
    let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
    let frames = Arc::new(Mutex::new(Vec::new()));
    let clients: Clients = Arc::new(Mutex::new(Vec::new()));

    let received = frames.clone();
    tokio::spawn(async move {
        let mut next_id = 0u64;
        while let Ok((stream, _)) = listener.accept().await {
            next_id += 1;
            let id = next_id;
            let Ok(socket) = tokio_tungstenite::accept_async(stream).await else {
                continue;
            };
            let (mut sink, mut source) = socket.split();
            let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

            let _ = tx.send(hello(&format!("conn-{id}")));
            clients.lock().push((id, tx.clone()));

            tokio::spawn(async move {
                while let Some(message) = rx.recv().await {
                    if sink.send(message).await.is_err() {
                        break;
                    }
                }
            });

            let clients = clients.clone();
            let received = received.clone();
            tokio::spawn(async move {
                while let Some(Ok(message)) = source.next().await {
                    let Message::Text(text) = message else { continue };
                    received.lock().push(text.clone());

                    for (other, peer) in clients.lock().iter() {
                        if *other != id {
                            let _ = peer.send(Message::Text(text.clone()));
                        }
                    }

                    let value: Value = serde_json::from_str(&text).unwrap();
                    if value["type"] == "operation" {
                        let ack = json!({
                            "type": "operation-ack",
                            "data": { "operationId": value["data"]["operationId"] }
                        });
                        let _ = tx.send(Message::Text(ack.to_string()));
                    }
                }
                clients.lock().retain(|(other, _)| *other != id);
            });
        }
    });

    frames
}

/// The relay's greeting carrying the connection id
fn hello(connection_id: &str) -> Message {
    Message::Text(json!({ "type": "connected", "connectionId": connection_id }).to_string())
}

/// Greets the first socket and then closes it as going away. The second
/// socket is kept and its text frames are recorded.
async fn start_flaky_relay(port: u16) -> Arc<Mutex<Vec<String>>> {
    let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
    let frames = Arc::new(Mutex::new(Vec::new()));

    let received = frames.clone();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut first = tokio_tungstenite::accept_async(stream).await.unwrap();
        first.send(hello("conn-1")).await.unwrap();
        let close = CloseFrame {
            code: CloseCode::Away,
            reason: "relay restarting".into(),
        };
        let _ = first.close(Some(close)).await;
        drop(first);

        let (stream, _) = listener.accept().await.unwrap();
        let mut second = tokio_tungstenite::accept_async(stream).await.unwrap();
        second.send(hello("conn-2")).await.unwrap();
        while let Some(Ok(message)) = second.next().await {
            if let Message::Text(text) = message {
                received.lock().push(text);
            }
        }
    });

    frames
}

/// Rejects the `/room/{id}` route; returns every request path it saw.
async fn start_query_only_relay(port: u16) -> Arc<Mutex<Vec<String>>> {
    let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
    let paths = Arc::new(Mutex::new(Vec::new()));

    let seen = paths.clone();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let seen = seen.clone();
            let route = move |request: &Request, response: Response| {
                let path = request.uri().to_string();
                seen.lock().push(path.clone());
                if path.starts_with("/room/") {
                    let mut rejected = ErrorResponse::new(Some("unknown route".to_string()));
                    *rejected.status_mut() = StatusCode::NOT_FOUND;
                    Err(rejected)
                } else {
                    Ok(response)
                }
            };

            let Ok(mut socket) = tokio_tungstenite::accept_hdr_async(stream, route).await else {
                continue;
            };
            socket.send(hello("conn-q")).await.unwrap();
            tokio::spawn(async move { while let Some(Ok(_)) = socket.next().await {} });
        }
    });

    paths
}

fn leave(n: usize) -> ProtocolMessage {
    ProtocolMessage::UserLeave(UserLeave {
        user_id: format!("user_{n}"),
    })
}

/// User ids of the `user-leave` frames a relay recorded
fn leave_ids(frames: &[String]) -> Vec<String> {
    frames
        .iter()
        .map(|text| match SyncProtocol::decode(text).unwrap() {
            InboundFrame::Message {
                message: ProtocolMessage::UserLeave(leave),
                ..
            } => leave.user_id,
            other => panic!("Unexpected frame {other:?}"),
        })
        .collect()
}

async fn wait_for_frames(frames: &Mutex<Vec<String>>, count: usize) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while frames.lock().len() < count {
        assert!(Instant::now() < deadline, "relay never received {count} frames");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn test_config(port: u16) -> TransportConfig {
    TransportConfig::new(format!("ws://127.0.0.1:{port}"), "test-room")
        .with_backoff(Duration::from_millis(100), Duration::from_millis(100))
        .with_connect_timeout(Duration::from_secs(2))
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<TransportEvent>) -> TransportEvent {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for transport event")
        .expect("transport stopped")
}

type Session = CollaborationSession<RelayTransport>;

fn session(transport: RelayTransport, user_id: &str) -> Session {
    let identity = UserInfo::new(user_id, user_id, "#22c55e");
    let mut session =
        CollaborationSession::with_identity(transport, SessionConfig::default(), identity);
    session.start("").unwrap();
    session
}

/// Feed transport events into both sessions until `done` holds
async fn drive(
    a: &mut Session,
    a_rx: &mut mpsc::UnboundedReceiver<TransportEvent>,
    b: &mut Session,
    b_rx: &mut mpsc::UnboundedReceiver<TransportEvent>,
    done: impl Fn(&Session, &Session) -> bool,
) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !done(a, b) {
        tokio::select! {
            Some(event) = a_rx.recv() => a.handle_transport_event(event),
            Some(event) = b_rx.recv() => b.handle_transport_event(event),
            _ = tokio::time::sleep_until(deadline) => panic!("sessions did not settle in time"),
        }
    }
}

#[tokio::test]
async fn test_transport_connects_and_receives_connection_id() {
    let port = free_port().await;
    start_test_relay(port).await;

    let (transport, mut events) = RelayTransport::connect(test_config(port));

    assert_eq!(next_event(&mut events).await, TransportEvent::Connected);
    match next_event(&mut events).await {
        TransportEvent::Relay(control) => {
            assert!(format!("{control:?}").contains("conn-1"));
        }
        other => panic!("Expected relay control frame, got {other:?}"),
    }
    assert_eq!(transport.state(), ConnectionState::Connected);

    transport.close();
    assert!(timeout(Duration::from_secs(5), events.recv()).await.unwrap().is_none());
    assert_eq!(transport.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn test_offline_messages_flush_in_order() {
    let port = free_port().await;

    // Nothing is listening yet: these must wait in the offline queue
    let (transport, mut events) = RelayTransport::connect(test_config(port));
    for n in 0..5 {
        transport.send(ProtocolMessage::UserLeave(UserLeave {
            user_id: format!("user_{n}"),
        }));
    }

    tokio::time::sleep(Duration::from_millis(50)).await;
    let frames = start_test_relay(port).await;

    assert_eq!(next_event(&mut events).await, TransportEvent::Connected);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let received: Vec<String> = frames
        .lock()
        .iter()
        .map(|text| match SyncProtocol::decode(text).unwrap() {
            InboundFrame::Message {
                message: ProtocolMessage::UserLeave(leave),
                peer_id,
            } => {
                assert_eq!(peer_id.as_deref(), Some(transport.peer_id()));
                leave.user_id
            }
            other => panic!("Unexpected frame {other:?}"),
        })
        .collect();

    assert_eq!(received, vec!["user_0", "user_1", "user_2", "user_3", "user_4"]);
}

#[tokio::test]
async fn test_sessions_share_edits_through_relay() {
    let port = free_port().await;
    start_test_relay(port).await;

    let (a_transport, mut a_rx) = RelayTransport::connect(test_config(port));
    let (b_transport, mut b_rx) = RelayTransport::connect(test_config(port));
    let mut a = session(a_transport, "user_a");
    let mut b = session(b_transport, "user_b");

    drive(&mut a, &mut a_rx, &mut b, &mut b_rx, |a, b| {
        a.roster().user("user_b").is_some() && b.roster().user("user_a").is_some()
    })
    .await;

    a.local_edit("hello", CursorState::at(5)).unwrap();
    drive(&mut a, &mut a_rx, &mut b, &mut b_rx, |a, b| {
        b.content() == "hello" && a.pending().is_empty()
    })
    .await;

    b.local_edit("hello world", CursorState::at(11)).unwrap();
    drive(&mut a, &mut a_rx, &mut b, &mut b_rx, |a, b| {
        a.content() == "hello world"
            && b.pending().is_empty()
            && a.remote_cursor("user_b") == Some(CursorState::at(11))
    })
    .await;

    assert_eq!(a.authorship().author_at(0), Some("user_a"));
    assert_eq!(a.authorship().author_at(6), Some("user_b"));

    b.disconnect("done");
    drive(&mut a, &mut a_rx, &mut b, &mut b_rx, |a, _| {
        a.roster().user("user_b").is_none()
    })
    .await;
}

#[tokio::test]
async fn test_reconnects_after_abnormal_close() {
    let port = free_port().await;
    let frames = start_flaky_relay(port).await;

    let reconnect_delay = Duration::from_millis(300);
    let config = test_config(port).with_backoff(Duration::from_millis(100), reconnect_delay);
    let (transport, mut events) = RelayTransport::connect(config);

    assert_eq!(next_event(&mut events).await, TransportEvent::Connected);
    assert!(matches!(next_event(&mut events).await, TransportEvent::Relay(_)));
    match next_event(&mut events).await {
        TransportEvent::Disconnected { reason } => assert!(reason.contains("1001"), "{reason}"),
        other => panic!("Expected a disconnect, got {other:?}"),
    }
    let lost_at = Instant::now();

    // Sent while down
    for n in 0..3 {
        transport.send(leave(n));
    }

    assert_eq!(next_event(&mut events).await, TransportEvent::Connected);
    assert!(lost_at.elapsed() >= reconnect_delay / 2);
    assert_eq!(
        next_event(&mut events).await,
        TransportEvent::Relay(RelayControl::Connected {
            connection_id: "conn-2".to_string()
        })
    );

    transport.send(leave(3));
    wait_for_frames(&frames, 4).await;
    assert_eq!(leave_ids(&frames.lock()), vec!["user_0", "user_1", "user_2", "user_3"]);
    assert_eq!(transport.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_falls_back_to_query_url() {
    let port = free_port().await;
    let paths = start_query_only_relay(port).await;

    let (transport, mut events) = RelayTransport::connect(test_config(port));

    assert_eq!(next_event(&mut events).await, TransportEvent::Connected);
    assert_eq!(*paths.lock(), vec!["/room/test-room", "/?room=test-room"]);
    assert!(transport.is_connected());
    assert_eq!(
        next_event(&mut events).await,
        TransportEvent::Relay(RelayControl::Connected {
            connection_id: "conn-q".to_string()
        })
    );
}
