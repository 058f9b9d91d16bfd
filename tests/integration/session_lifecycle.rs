// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::missing_panics_doc,
    clippy::future_not_send,
    clippy::redundant_pub_crate
)]

//! Integration tests for the client session lifecycle.
//!
//! Drives a client actor over the in-process loopback channel and checks:
//! - the local user is announced online once the session opens
//! - heartbeats flow while the channel is open
//! - idle detection, input recovery and do-not-disturb
//! - explicit shutdown releases the last session lease

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use copresence::client::{ClientCommand, ClientEvent, ClientOptions, spawn_client};
use copresence::config::PresenceConfig;
use copresence::connection::{ConnectionConfig, ConnectionManager, ConnectionState};
use copresence::room::InMemoryRoomApi;
use copresence::transport::loopback::{LoopbackConnector, ServerEnd};
use copresence_proto::event::ChannelEvent;
use copresence_proto::ids::UserId;
use copresence_proto::presence::{Activity, PresenceStatus};

const TIMEOUT: Duration = Duration::from_secs(5);

struct Harness {
    cmd: mpsc::Sender<ClientCommand>,
    events: mpsc::Receiver<ClientEvent>,
    end: ServerEnd,
    api: Arc<InMemoryRoomApi>,
}

async fn start(presence: PresenceConfig) -> Harness {
    let (connector, server) = LoopbackConnector::new(UserId::new("alice"));
    let manager = ConnectionManager::new(connector, ConnectionConfig::default());
    let (session, inbound) = manager.connect("token-a").await.expect("connect");
    let end = server.accept().await.expect("server end");
    let api = Arc::new(InMemoryRoomApi::new(UserId::new("alice")));
    let options = ClientOptions {
        presence,
        ..ClientOptions::default()
    };
    let (cmd, events) = spawn_client(session, inbound, Arc::clone(&api), options);
    Harness {
        cmd,
        events,
        end,
        api,
    }
}

async fn next_event(rx: &mut mpsc::Receiver<ClientEvent>) -> ClientEvent {
    tokio::time::timeout(TIMEOUT, rx.recv())
        .await
        .expect("timed out waiting for client event")
        .expect("event channel closed")
}

/// Skip events until one matches `pred`.
async fn wait_for(
    rx: &mut mpsc::Receiver<ClientEvent>,
    pred: impl Fn(&ClientEvent) -> bool,
) -> ClientEvent {
    loop {
        let event = next_event(rx).await;
        if pred(&event) {
            return event;
        }
    }
}

/// Skip server-side frames until one matches `pred`.
async fn wait_for_frame(end: &mut ServerEnd, pred: impl Fn(&ChannelEvent) -> bool) -> ChannelEvent {
    loop {
        let frame = tokio::time::timeout(TIMEOUT, end.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("client closed the channel");
        if pred(&frame) {
            return frame;
        }
    }
}

fn quiet() -> PresenceConfig {
    PresenceConfig {
        heartbeat_interval: Duration::from_secs(3600),
        idle_threshold: Duration::from_secs(3600),
        idle_check_interval: Duration::from_secs(3600),
        activity_poll_interval: Duration::from_secs(3600),
        handshake_retry: Duration::from_secs(3600),
        handshake_attempts: 4,
    }
}

fn status_of(frame: &ChannelEvent) -> Option<PresenceStatus> {
    match frame {
        ChannelEvent::PresenceUpdate(update) => Some(update.status),
        _ => None,
    }
}

#[tokio::test]
async fn session_open_announces_online() {
    let mut h = start(quiet()).await;

    assert_eq!(
        next_event(&mut h.events).await,
        ClientEvent::Connection(ConnectionState::Open)
    );
    let ClientEvent::PresenceChanged(t) = next_event(&mut h.events).await else {
        panic!("expected presence transition");
    };
    assert_eq!(t.from, PresenceStatus::Offline);
    assert_eq!(t.to, PresenceStatus::Online);

    let frame = wait_for_frame(&mut h.end, |f| status_of(f).is_some()).await;
    let ChannelEvent::PresenceUpdate(update) = frame else {
        unreachable!()
    };
    assert_eq!(update.user_id, UserId::new("alice"));
    assert_eq!(update.status, PresenceStatus::Online);
    assert!(update.at > 0);
}

#[tokio::test]
async fn heartbeats_flow_while_open() {
    let mut h = start(PresenceConfig {
        heartbeat_interval: Duration::from_millis(20),
        ..quiet()
    })
    .await;

    for _ in 0..2 {
        wait_for_frame(&mut h.end, |f| matches!(f, ChannelEvent::Heartbeat {})).await;
    }
}

#[tokio::test]
async fn idle_then_input_returns_online() {
    let mut h = start(PresenceConfig {
        idle_threshold: Duration::from_millis(80),
        idle_check_interval: Duration::from_millis(20),
        ..quiet()
    })
    .await;

    let idle = wait_for(&mut h.events, |e| {
        matches!(e, ClientEvent::PresenceChanged(t) if t.to == PresenceStatus::Idle)
    })
    .await;
    let ClientEvent::PresenceChanged(t) = idle else {
        unreachable!()
    };
    assert_eq!(t.from, PresenceStatus::Online);
    wait_for_frame(&mut h.end, |f| status_of(f) == Some(PresenceStatus::Idle)).await;

    h.cmd.send(ClientCommand::Input).await.unwrap();
    wait_for(&mut h.events, |e| {
        matches!(e, ClientEvent::PresenceChanged(t)
            if t.from == PresenceStatus::Idle && t.to == PresenceStatus::Online)
    })
    .await;
    wait_for_frame(&mut h.end, |f| status_of(f) == Some(PresenceStatus::Online)).await;
}

#[tokio::test]
async fn do_not_disturb_suppresses_idle_and_input() {
    let mut h = start(PresenceConfig {
        idle_threshold: Duration::from_millis(40),
        idle_check_interval: Duration::from_millis(10),
        ..quiet()
    })
    .await;
    wait_for(&mut h.events, |e| {
        matches!(e, ClientEvent::PresenceChanged(t) if t.to == PresenceStatus::Online)
    })
    .await;

    h.cmd.send(ClientCommand::SetDoNotDisturb(true)).await.unwrap();
    wait_for(&mut h.events, |e| {
        matches!(e, ClientEvent::PresenceChanged(t) if t.to == PresenceStatus::DoNotDisturb)
    })
    .await;

    h.cmd.send(ClientCommand::Input).await.unwrap();
    tokio::time::sleep(Duration::from_millis(120)).await;
    h.cmd.send(ClientCommand::SetDoNotDisturb(false)).await.unwrap();

    // Neither the idle timer nor the input produced a transition while DND.
    let ClientEvent::PresenceChanged(t) = next_event(&mut h.events).await else {
        panic!("expected presence transition");
    };
    assert_eq!(t.from, PresenceStatus::DoNotDisturb);
    assert_eq!(t.to, PresenceStatus::Online);
}

#[tokio::test]
async fn activity_reports_are_published() {
    let mut h = start(quiet()).await;
    wait_for(&mut h.events, |e| matches!(e, ClientEvent::PresenceChanged(_))).await;

    let activity = Activity::new("studying", "graphs");
    h.cmd
        .send(ClientCommand::ReportActivity(activity.clone()))
        .await
        .unwrap();
    assert_eq!(
        next_event(&mut h.events).await,
        ClientEvent::ActivityChanged(activity.clone())
    );
    let frame = wait_for_frame(&mut h.end, |f| {
        matches!(f, ChannelEvent::PresenceUpdate(u) if u.activity.is_some())
    })
    .await;
    assert!(matches!(frame, ChannelEvent::PresenceUpdate(u) if u.activity == Some(activity)));

    // Reporting the same activity again is not a change.
    h.cmd
        .send(ClientCommand::ReportActivity(Activity::new("studying", "graphs")))
        .await
        .unwrap();
    let (reply, answer) = oneshot::channel();
    h.cmd
        .send(ClientCommand::QueryRoom { reply })
        .await
        .unwrap();
    assert_eq!(answer.await.unwrap(), None);
    assert!(h.events.try_recv().is_err());
}

#[tokio::test]
async fn shutdown_goes_offline_and_releases_channel() {
    let mut h = start(quiet()).await;
    wait_for(&mut h.events, |e| matches!(e, ClientEvent::PresenceChanged(_))).await;

    h.cmd.send(ClientCommand::Shutdown).await.unwrap();
    let ClientEvent::PresenceChanged(t) = next_event(&mut h.events).await else {
        panic!("expected offline transition");
    };
    assert_eq!(t.to, PresenceStatus::Offline);
    assert!(t.activity.is_none());
    assert_eq!(
        next_event(&mut h.events).await,
        ClientEvent::SessionEnded(None)
    );

    // The actor held the last lease: the channel is torn down.
    let drained = tokio::time::timeout(TIMEOUT, async {
        while h.end.recv().await.is_some() {}
    })
    .await;
    assert!(drained.is_ok(), "channel still open after shutdown");
    // Offline transitions are not announced to the authority.
    assert_eq!(h.api.mutation_count(), 0);
}
