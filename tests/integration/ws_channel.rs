// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::missing_panics_doc,
    clippy::future_not_send,
    clippy::redundant_pub_crate
)]

//! Integration tests for the WebSocket push channel.
//!
//! Each test runs a minimal server on a random localhost port using
//! `tokio-tungstenite` directly and checks the session handshake and frame
//! handling of [`WsConnector`] / `WsChannel`.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use copresence::connection::{ConnectionConfig, ConnectionManager, Inbound};
use copresence::error::SyncError;
use copresence::transport::ws::WsConnector;
use copresence::transport::{Channel, Connector, TransportError};
use copresence_proto::codec;
use copresence_proto::event::ChannelEvent;
use copresence_proto::ids::UserId;

const TIMEOUT: Duration = Duration::from_secs(5);

/// How the test server answers `session:auth`.
#[derive(Clone)]
enum Answer {
    Ready(&'static str),
    Reject(&'static str),
    Silent,
}

/// Start a server accepting one connection. Frames the client sends after
/// the handshake are forwarded on the returned receiver; strings pushed into
/// the returned sender are written raw to the client.
async fn serve_one(answer: Answer) -> (String, mpsc::Sender<String>, mpsc::Receiver<ChannelEvent>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (push_tx, mut push_rx) = mpsc::channel::<String>(16);
    let (seen_tx, seen_rx) = mpsc::channel::<ChannelEvent>(16);

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        let (mut sink, mut stream) = ws.split();

        let Some(Ok(Message::Text(auth))) = stream.next().await else {
            return;
        };
        let ChannelEvent::SessionAuth { token } = codec::decode(auth.as_str()).unwrap() else {
            panic!("expected session:auth first");
        };
        let reply = match answer {
            Answer::Ready(user) => {
                assert_eq!(token, "secret");
                ChannelEvent::SessionReady {
                    user_id: UserId::new(user),
                }
            }
            Answer::Reject(reason) => ChannelEvent::SessionRejected {
                reason: reason.into(),
            },
            Answer::Silent => {
                tokio::time::sleep(Duration::from_secs(10)).await;
                return;
            }
        };
        let frame = codec::encode(&reply).unwrap();
        sink.send(Message::Text(frame.into())).await.unwrap();

        loop {
            tokio::select! {
                raw = push_rx.recv() => match raw {
                    Some(raw) => {
                        if sink.send(Message::Text(raw.into())).await.is_err() {
                            return;
                        }
                    }
                    None => {
                        let _ = sink.send(Message::Close(None)).await;
                        return;
                    }
                },
                msg = stream.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        if let Ok(event) = codec::decode(text.as_str()) {
                            let _ = seen_tx.send(event).await;
                        }
                    }
                    Some(Ok(_)) => {}
                    _ => return,
                },
            }
        }
    });

    (format!("ws://{addr}"), push_tx, seen_rx)
}

#[tokio::test]
async fn handshake_binds_identity() {
    let (url, push, mut seen) = serve_one(Answer::Ready("alice")).await;
    let (channel, user) = WsConnector::new(url).open("secret").await.unwrap();
    assert_eq!(user, UserId::new("alice"));
    assert!(channel.is_open());

    channel.send(&ChannelEvent::Heartbeat {}).await.unwrap();
    let got = tokio::time::timeout(TIMEOUT, seen.recv()).await.unwrap();
    assert_eq!(got, Some(ChannelEvent::Heartbeat {}));

    push.send(codec::encode(&ChannelEvent::Heartbeat {}).unwrap())
        .await
        .unwrap();
    let frame = tokio::time::timeout(TIMEOUT, channel.recv()).await.unwrap();
    assert_eq!(frame.unwrap(), ChannelEvent::Heartbeat {});
}

#[tokio::test]
async fn rejection_is_reported() {
    let (url, _push, _seen) = serve_one(Answer::Reject("token expired")).await;
    let result = WsConnector::new(url).open("secret").await;
    assert!(matches!(result, Err(TransportError::Rejected(reason)) if reason == "token expired"));
}

#[tokio::test]
async fn silent_server_times_out() {
    let (url, _push, _seen) = serve_one(Answer::Silent).await;
    let connector = WsConnector::new(url).with_timeouts(Duration::from_secs(1), Duration::from_millis(100));
    let result = connector.open("secret").await;
    assert!(matches!(result, Err(TransportError::Timeout)));
}

#[tokio::test]
async fn malformed_frames_are_skipped() {
    let (url, push, _seen) = serve_one(Answer::Ready("alice")).await;
    let (channel, _) = WsConnector::new(url).open("secret").await.unwrap();

    push.send("{not json".into()).await.unwrap();
    push.send(r#"{"event":"presence:warp","data":{}}"#.into())
        .await
        .unwrap();
    push.send(
        codec::encode(&ChannelEvent::BoardChanged {
            room_id: copresence_proto::ids::RoomId::new("r1"),
        })
        .unwrap(),
    )
    .await
    .unwrap();

    let frame = tokio::time::timeout(TIMEOUT, channel.recv()).await.unwrap();
    assert!(matches!(frame, Ok(ChannelEvent::BoardChanged { .. })));
    assert!(channel.is_open());
}

#[tokio::test]
async fn server_close_surfaces_as_disconnect() {
    let (url, push, _seen) = serve_one(Answer::Ready("alice")).await;
    let config = ConnectionConfig {
        connect_timeout: Duration::from_secs(1),
        ..ConnectionConfig::default()
    };
    let manager = ConnectionManager::new(WsConnector::new(url), config);
    let (session, mut inbound) = manager.connect("secret").await.unwrap();
    assert_eq!(session.user_id(), &UserId::new("alice"));

    drop(push);
    let notice = tokio::time::timeout(TIMEOUT, inbound.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(notice, Inbound::Disconnected { generation: 1, .. }));
}

#[tokio::test]
async fn unreachable_server_is_a_network_error() {
    // Bind then drop to get a port nothing listens on.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let config = ConnectionConfig {
        connect_timeout: Duration::from_secs(1),
        ..ConnectionConfig::default()
    };
    let manager = ConnectionManager::new(WsConnector::new(format!("ws://{addr}")), config);
    let err = manager.connect("secret").await.unwrap_err();
    assert!(matches!(err, SyncError::Network(_) | SyncError::Timeout));
}
