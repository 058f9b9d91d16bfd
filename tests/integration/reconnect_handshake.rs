// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::missing_panics_doc,
    clippy::future_not_send,
    clippy::redundant_pub_crate,
    clippy::too_many_lines
)]

//! Integration tests for pairing handshakes across channel drops.
//!
//! These tests validate:
//! - the pairing handshake is replayed exactly once per reconnect
//! - presence pushed before the handshake is acknowledged is not applied
//! - a poll that lands after a reconnect also waits for the acknowledgment
//! - an unanswered handshake is resent, then given up
//! - a post-reconnect snapshot drops entries the client no longer sees
//! - concurrent pairings resolve to the last one acknowledged
//! - push updates follow arrival order
//! - the pull surface is polled for the partner while the channel is down
//! - rejected or exhausted reconnects end the client session

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use copresence::client::{ClientCommand, ClientEvent, ClientOptions, spawn_client};
use copresence::config::{PresenceConfig, ReconnectConfig};
use copresence::connection::{ConnectionConfig, ConnectionManager, ConnectionState};
use copresence::error::SyncError;
use copresence::presence::PairingSource;
use copresence::room::{InMemoryRoomApi, RoomApi};
use copresence::transport::loopback::{AcceptPolicy, LoopbackConnector, LoopbackServer, ServerEnd};
use copresence_proto::event::ChannelEvent;
use copresence_proto::ids::UserId;
use copresence_proto::legacy::LegacyActivity;
use copresence_proto::now_ms;
use copresence_proto::presence::{
    Activity, ActivityReport, PresenceEntry, PresenceStatus, PresenceUpdate,
};

const TIMEOUT: Duration = Duration::from_secs(5);

fn alice() -> UserId {
    UserId::new("alice")
}

fn bob() -> UserId {
    UserId::new("bob")
}

fn carol() -> UserId {
    UserId::new("carol")
}

struct Harness {
    cmd: mpsc::Sender<ClientCommand>,
    events: mpsc::Receiver<ClientEvent>,
    server: LoopbackServer,
    api: Arc<InMemoryRoomApi>,
}

async fn start(reconnect: ReconnectConfig, presence: PresenceConfig) -> (Harness, ServerEnd) {
    let (connector, server) = LoopbackConnector::new(alice());
    let config = ConnectionConfig {
        connect_timeout: Duration::from_secs(1),
        channel_capacity: 64,
        reconnect,
    };
    let manager = ConnectionManager::new(connector, config);
    let (session, inbound) = manager.connect("token-a").await.expect("connect");
    let end = server.accept().await.expect("server end");
    let api = Arc::new(InMemoryRoomApi::new(alice()));
    let options = ClientOptions {
        presence,
        ..ClientOptions::default()
    };
    let (cmd, events) = spawn_client(session, inbound, Arc::clone(&api), options);
    let harness = Harness {
        cmd,
        events,
        server,
        api,
    };
    (harness, end)
}

fn fast_reconnect() -> ReconnectConfig {
    ReconnectConfig {
        initial_delay: Duration::from_millis(5),
        max_delay: Duration::from_millis(20),
        max_attempts: 3,
        jitter: Duration::ZERO,
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

async fn next_event(rx: &mut mpsc::Receiver<ClientEvent>) -> ClientEvent {
    tokio::time::timeout(TIMEOUT, rx.recv())
        .await
        .expect("timed out waiting for client event")
        .expect("event channel closed")
}

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

async fn query_presence(cmd: &mpsc::Sender<ClientCommand>, user: UserId) -> Option<PresenceEntry> {
    let (reply, answer) = oneshot::channel();
    cmd.send(ClientCommand::QueryPresence { user, reply })
        .await
        .unwrap();
    answer.await.unwrap()
}

fn update(user: UserId, status: PresenceStatus, at: u64) -> ChannelEvent {
    ChannelEvent::PresenceUpdate(PresenceUpdate {
        user_id: user,
        status,
        activity: None,
        at,
    })
}

fn ack(partner: UserId) -> ChannelEvent {
    ChannelEvent::PresenceAck {
        self_id: alice(),
        partner_id: Some(partner),
    }
}

fn is_init_for(frame: &ChannelEvent, partner: &UserId) -> bool {
    matches!(frame, ChannelEvent::PresenceInit { partner_id: Some(p), .. } if p == partner)
}

fn partner_status(event: &ClientEvent) -> Option<PresenceStatus> {
    match event {
        ClientEvent::PartnerPresence {
            entry: Some(entry), ..
        } => Some(entry.status),
        _ => None,
    }
}

/// Pair with bob and wait until the pairing is established.
async fn pair_with_bob(h: &mut Harness, end: &mut ServerEnd) {
    h.cmd
        .send(ClientCommand::Pair {
            partner: bob(),
            source: PairingSource::LocalLink,
        })
        .await
        .unwrap();
    wait_for_frame(end, |f| is_init_for(f, &bob())).await;
    end.push(ack(bob()));
    let paired = wait_for(&mut h.events, |e| matches!(e, ClientEvent::Paired(_))).await;
    let ClientEvent::Paired(ctx) = paired else {
        unreachable!()
    };
    assert_eq!(ctx.partner_id, bob());
    assert_eq!(ctx.source, PairingSource::LocalLink);
}

#[tokio::test]
async fn updates_before_ack_are_not_applied() {
    let (mut h, mut end) = start(fast_reconnect(), quiet()).await;
    h.cmd
        .send(ClientCommand::Pair {
            partner: bob(),
            source: PairingSource::ServerRedeem,
        })
        .await
        .unwrap();
    wait_for_frame(&mut end, |f| is_init_for(f, &bob())).await;

    // Arrives while the handshake is still unacknowledged.
    end.push(update(bob(), PresenceStatus::Online, now_ms()));
    end.push(ack(bob()));

    let paired = wait_for(&mut h.events, |e| matches!(e, ClientEvent::Paired(_))).await;
    assert!(matches!(paired, ClientEvent::Paired(ctx) if ctx.epoch == 1));
    assert_eq!(
        next_event(&mut h.events).await,
        ClientEvent::PartnerPresence {
            partner: bob(),
            entry: None
        }
    );
    assert_eq!(query_presence(&h.cmd, bob()).await, None);

    // After the ack, updates flow.
    end.push(update(bob(), PresenceStatus::Online, now_ms()));
    let event = next_event(&mut h.events).await;
    assert_eq!(partner_status(&event), Some(PresenceStatus::Online));
}

#[tokio::test]
async fn handshake_replayed_once_and_snapshot_rebuilds_directory() {
    let (mut h, mut end) = start(fast_reconnect(), quiet()).await;
    pair_with_bob(&mut h, &mut end).await;

    end.push(update(carol(), PresenceStatus::Online, 1_000));
    end.push(update(bob(), PresenceStatus::Online, 1_000));
    wait_for(&mut h.events, |e| partner_status(e).is_some()).await;
    assert!(query_presence(&h.cmd, carol()).await.is_some());

    // Drop the channel; the client reconnects on its own.
    drop(end);
    let mut end = h.server.accept().await.expect("reconnected");
    wait_for(&mut h.events, |e| {
        matches!(e, ClientEvent::Connection(ConnectionState::Open))
    })
    .await;
    wait_for_frame(&mut end, |f| is_init_for(f, &bob())).await;

    // Gated until the replayed handshake is acknowledged.
    end.push(update(bob(), PresenceStatus::DoNotDisturb, 1_500));
    end.push(ack(bob()));
    end.push(ChannelEvent::PresenceSnapshot {
        map: BTreeMap::from([
            (
                bob(),
                PresenceEntry {
                    status: PresenceStatus::Idle,
                    activity: None,
                    observed_at: 2_000,
                },
            ),
            (
                alice(),
                PresenceEntry {
                    status: PresenceStatus::Online,
                    activity: None,
                    observed_at: 2_000,
                },
            ),
        ]),
    });

    // The next partner change comes from the snapshot, not the gated update.
    let event = wait_for(&mut h.events, |e| partner_status(e).is_some()).await;
    assert_eq!(partner_status(&event), Some(PresenceStatus::Idle));

    assert_eq!(query_presence(&h.cmd, carol()).await, None);
    assert_eq!(query_presence(&h.cmd, alice()).await, None);
    assert_eq!(
        query_presence(&h.cmd, bob()).await.map(|e| e.observed_at),
        Some(2_000)
    );

    let mut inits = 0;
    while let Some(frame) = end.try_recv() {
        if matches!(frame, ChannelEvent::PresenceInit { .. }) {
            inits += 1;
        }
    }
    // One was already consumed above; no duplicate followed.
    assert_eq!(inits, 0);
    assert_eq!(h.server.opened(), 2);
}

#[tokio::test]
async fn poll_landing_after_reconnect_waits_for_ack() {
    let reconnect = ReconnectConfig {
        initial_delay: Duration::from_millis(200),
        max_delay: Duration::from_millis(200),
        max_attempts: 3,
        jitter: Duration::ZERO,
    };
    let presence = PresenceConfig {
        activity_poll_interval: Duration::from_millis(20),
        ..quiet()
    };
    let (mut h, mut end) = start(reconnect, presence).await;
    pair_with_bob(&mut h, &mut end).await;
    end.push(update(bob(), PresenceStatus::Online, 1_000));
    wait_for(&mut h.events, |e| partner_status(e) == Some(PresenceStatus::Online)).await;

    h.api.hold_activity_fetches();
    h.api.put_activity(ActivityReport {
        user_id: bob(),
        status: PresenceStatus::DoNotDisturb,
        activity: None,
        at: 5_000,
    });
    drop(end);

    // A poll goes out while the channel is down and stays in flight.
    tokio::time::timeout(TIMEOUT, async {
        while h.api.activity_fetch_count() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("partner never polled");

    let mut end = h.server.accept().await.expect("reconnected");
    wait_for_frame(&mut end, |f| is_init_for(f, &bob())).await;
    h.api.release_activity_fetches();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(
        query_presence(&h.cmd, bob()).await.map(|e| e.status),
        Some(PresenceStatus::Online),
        "poll result applied before the handshake was acknowledged"
    );

    end.push(ack(bob()));
    end.push(update(bob(), PresenceStatus::Idle, 6_000));
    wait_for(&mut h.events, |e| partner_status(e) == Some(PresenceStatus::Idle)).await;
}

#[tokio::test]
async fn lost_ack_is_resent() {
    let presence = PresenceConfig {
        handshake_retry: Duration::from_millis(50),
        ..quiet()
    };
    let (mut h, mut end) = start(fast_reconnect(), presence).await;
    h.cmd
        .send(ClientCommand::Pair {
            partner: bob(),
            source: PairingSource::LocalLink,
        })
        .await
        .unwrap();

    // The first acknowledgment never arrives.
    wait_for_frame(&mut end, |f| is_init_for(f, &bob())).await;
    wait_for_frame(&mut end, |f| is_init_for(f, &bob())).await;

    end.push(ack(bob()));
    let paired = wait_for(&mut h.events, |e| matches!(e, ClientEvent::Paired(_))).await;
    assert!(matches!(paired, ClientEvent::Paired(ctx) if ctx.partner_id == bob() && ctx.epoch == 1));

    end.push(update(bob(), PresenceStatus::Online, now_ms()));
    let event = wait_for(&mut h.events, |e| partner_status(e).is_some()).await;
    assert_eq!(partner_status(&event), Some(PresenceStatus::Online));
}

#[tokio::test]
async fn unanswered_handshake_is_given_up() {
    let presence = PresenceConfig {
        handshake_retry: Duration::from_millis(20),
        handshake_attempts: 2,
        ..quiet()
    };
    let (mut h, mut end) = start(fast_reconnect(), presence).await;
    h.cmd
        .send(ClientCommand::Pair {
            partner: bob(),
            source: PairingSource::ServerRedeem,
        })
        .await
        .unwrap();

    let error = wait_for(&mut h.events, |e| matches!(e, ClientEvent::Error(_))).await;
    assert_eq!(error, ClientEvent::Error(SyncError::Timeout));

    let mut inits = 0;
    while let Some(frame) = end.try_recv() {
        if is_init_for(&frame, &bob()) {
            inits += 1;
        }
    }
    assert_eq!(inits, 2);

    // The directory is no longer held shut.
    end.push(update(carol(), PresenceStatus::Online, now_ms()));
    tokio::time::timeout(TIMEOUT, async {
        while query_presence(&h.cmd, carol()).await.is_none() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("directory stayed gated");
}

#[tokio::test]
async fn concurrent_pairings_resolve_to_last_acknowledged() {
    let (mut h, mut end) = start(fast_reconnect(), quiet()).await;
    for partner in [bob(), carol()] {
        h.cmd
            .send(ClientCommand::Pair {
                partner,
                source: PairingSource::LocalLink,
            })
            .await
            .unwrap();
    }
    wait_for_frame(&mut end, |f| is_init_for(f, &carol())).await;

    end.push(ack(carol()));
    end.push(ack(bob()));

    let first = wait_for(&mut h.events, |e| matches!(e, ClientEvent::Paired(_))).await;
    let second = wait_for(&mut h.events, |e| matches!(e, ClientEvent::Paired(_))).await;
    assert!(matches!(first, ClientEvent::Paired(ctx) if ctx.partner_id == carol() && ctx.epoch == 1));
    assert!(matches!(second, ClientEvent::Paired(ctx) if ctx.partner_id == bob() && ctx.epoch == 2));

    // After a drop only the winning partner is replayed.
    drop(end);
    let mut end = h.server.accept().await.expect("reconnected");
    let frame = wait_for_frame(&mut end, |f| matches!(f, ChannelEvent::PresenceInit { .. })).await;
    assert!(is_init_for(&frame, &bob()));
}

#[tokio::test]
async fn push_updates_follow_arrival_order() {
    let (mut h, mut end) = start(fast_reconnect(), quiet()).await;
    pair_with_bob(&mut h, &mut end).await;

    end.push(update(bob(), PresenceStatus::Online, 200));
    end.push(update(bob(), PresenceStatus::Idle, 100));
    let first = wait_for(&mut h.events, |e| partner_status(e).is_some()).await;
    let second = wait_for(&mut h.events, |e| partner_status(e).is_some()).await;
    assert_eq!(partner_status(&first), Some(PresenceStatus::Online));
    assert_eq!(partner_status(&second), Some(PresenceStatus::Idle));

    // Own echoes never overwrite the local record.
    end.push(update(alice(), PresenceStatus::Offline, 300));
    end.push(ChannelEvent::LegacyActivity(LegacyActivity {
        user_id: bob(),
        kind: "busy".into(),
        topic: None,
        at: 400,
    }));
    let third = wait_for(&mut h.events, |e| partner_status(e).is_some()).await;
    assert_eq!(partner_status(&third), Some(PresenceStatus::DoNotDisturb));
    assert_eq!(query_presence(&h.cmd, alice()).await, None);
}

#[tokio::test]
async fn partner_is_polled_while_channel_is_down() {
    let slow = ReconnectConfig {
        initial_delay: Duration::from_secs(30),
        max_delay: Duration::from_secs(30),
        max_attempts: 1,
        jitter: Duration::ZERO,
    };
    let presence = PresenceConfig {
        activity_poll_interval: Duration::from_millis(20),
        ..quiet()
    };
    let (mut h, mut end) = start(slow, presence).await;
    pair_with_bob(&mut h, &mut end).await;

    h.api.put_activity(ActivityReport {
        user_id: bob(),
        status: PresenceStatus::Online,
        activity: Some(Activity::new("studying", "graphs")),
        at: now_ms(),
    });
    h.server.set_policy(AcceptPolicy::Unreachable);
    drop(end);

    wait_for(&mut h.events, |e| matches!(e, ClientEvent::Reconnecting { attempt: 1, .. })).await;
    let polled = wait_for(&mut h.events, |e| partner_status(e).is_some()).await;
    let ClientEvent::PartnerPresence { partner, entry } = polled else {
        unreachable!()
    };
    assert_eq!(partner, bob());
    assert_eq!(
        entry.and_then(|e| e.activity),
        Some(Activity::new("studying", "graphs"))
    );

    // Local changes go to the pull surface while the channel is down.
    h.cmd
        .send(ClientCommand::ReportActivity(Activity::kind_only("reviewing")))
        .await
        .unwrap();
    wait_for(&mut h.events, |e| matches!(e, ClientEvent::ActivityChanged(_))).await;
    let posted = tokio::time::timeout(TIMEOUT, async {
        loop {
            if let Some(report) = h.api.fetch_activity(&alice()).await.unwrap() {
                return report;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("activity never posted");
    assert_eq!(posted.activity, Some(Activity::kind_only("reviewing")));
}

#[tokio::test]
async fn rejected_reconnect_ends_session() {
    let (mut h, end) = start(fast_reconnect(), quiet()).await;
    h.server.set_policy(AcceptPolicy::Reject("revoked".into()));
    drop(end);

    let ended = wait_for(&mut h.events, |e| matches!(e, ClientEvent::SessionEnded(_))).await;
    assert_eq!(
        ended,
        ClientEvent::SessionEnded(Some(SyncError::Auth("revoked".into())))
    );
}

#[tokio::test]
async fn exhausted_reconnects_end_session() {
    let (mut h, end) = start(fast_reconnect(), quiet()).await;
    h.server.set_policy(AcceptPolicy::Unreachable);
    drop(end);

    let mut attempts = 0;
    let ended = loop {
        match next_event(&mut h.events).await {
            ClientEvent::Reconnecting { .. } => attempts += 1,
            ClientEvent::SessionEnded(reason) => break reason,
            _ => {}
        }
    };
    assert_eq!(attempts, 3);
    assert_eq!(ended, Some(SyncError::ChannelClosed));
}
