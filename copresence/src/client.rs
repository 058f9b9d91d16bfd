//! Client actor wiring the session, presence and room layers together.
//!
//! All client state lives in one task. Timers, user commands, inbound
//! channel notices and completed pull requests are multiplexed into that
//! task, so every mutation happens in one place and in one order.
//!
//! # Architecture
//!
//! ```text
//! UI ── ClientCommand ──►┐
//! supervisor ─ Inbound ─►│  ClientActor  ── ClientEvent ──► UI
//! pull tasks ─ Completion►│  (engine, directory, pairing, room)
//! timers ───────────────►┘
//! ```
//!
//! Pull requests run in spawned tasks and report back as completions
//! tagged with the session generation and the room epoch; completions for a
//! room that has since been left are discarded.

use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};

use copresence_proto::event::ChannelEvent;
use copresence_proto::ids::{MutationId, RoomId, TopicId, UserId};
use copresence_proto::now_ms;
use copresence_proto::presence::{
    Activity, ActivityReport, PresenceEntry, PresenceStatus, PresenceUpdate,
};
use copresence_proto::room::{CompletionResult, RoomSnapshot};

use crate::config::{PresenceConfig, SyncConfig};
use crate::connection::{ConnectionState, Inbound, Session};
use crate::error::SyncError;
use crate::presence::legacy;
use crate::presence::{
    AckOutcome, ApplyOutcome, EngineOutput, HandshakeState, PairingContext, PairingHandshake,
    PairingSource, PresenceDirectory, PresenceEngine, PresenceTransition,
};
use crate::room::api::{ApiError, RoomApi};
use crate::room::{MutationKind, MutationStatus, Reconciliation, RoomSync};
use crate::transport::Channel;

/// Settings for the client actor.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Presence timers.
    pub presence: PresenceConfig,
    /// Room synchronization.
    pub sync: SyncConfig,
    /// Capacity of the command and event channels.
    pub channel_capacity: usize,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            presence: PresenceConfig::default(),
            sync: SyncConfig::default(),
            channel_capacity: 256,
        }
    }
}

/// Read-only view of the joined room.
#[derive(Debug, Clone, PartialEq)]
pub struct RoomView {
    /// Cached snapshot including optimistic patches.
    pub snapshot: Option<RoomSnapshot>,
    /// Mutations awaiting the authority.
    pub pending: usize,
    /// Whether the snapshot must be refetched before it can be trusted.
    pub stale: bool,
}

/// Commands accepted by the client actor.
#[derive(Debug)]
pub enum ClientCommand {
    /// A raw input signal (pointer, key, scroll).
    Input,
    /// Explicit activity report.
    ReportActivity(Activity),
    /// Enter or leave do-not-disturb.
    SetDoNotDisturb(bool),
    /// Pair with a counterpart.
    Pair {
        /// The counterpart.
        partner: UserId,
        /// Flow that produced the pairing.
        source: PairingSource,
    },
    /// End the current pairing.
    Unpair,
    /// Join a room, leaving any current one.
    JoinRoom(RoomId),
    /// Leave the current room.
    LeaveRoom,
    /// Mark a topic complete.
    CompleteTopic(TopicId),
    /// Undo a topic completion.
    ReopenTopic(TopicId),
    /// Force an authoritative room refetch.
    Refresh,
    /// Read the cached presence of a user.
    QueryPresence {
        /// Whose presence.
        user: UserId,
        /// Where to send the answer.
        reply: oneshot::Sender<Option<PresenceEntry>>,
    },
    /// Read the joined room.
    QueryRoom {
        /// Where to send the answer; `None` when no room is joined.
        reply: oneshot::Sender<Option<RoomView>>,
    },
    /// Tear the session down.
    Shutdown,
}

/// Events emitted by the client actor.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// Push channel state changed.
    Connection(ConnectionState),
    /// A reconnect attempt is scheduled.
    Reconnecting {
        /// 1-based attempt number.
        attempt: u32,
        /// Delay before the attempt.
        delay: Duration,
    },
    /// The local user's status changed.
    PresenceChanged(PresenceTransition),
    /// The local user's activity changed without a status change.
    ActivityChanged(Activity),
    /// The partner's presence changed.
    PartnerPresence {
        /// The partner.
        partner: UserId,
        /// Last-known presence, `None` if unknown.
        entry: Option<PresenceEntry>,
    },
    /// A pairing was established.
    Paired(PairingContext),
    /// The pairing ended.
    Unpaired {
        /// Former partner.
        partner: UserId,
    },
    /// The room view changed.
    RoomUpdated(RoomSnapshot),
    /// A mutation was accepted by the authority.
    MutationConfirmed {
        /// The mutation.
        id: MutationId,
        /// Its target topic.
        topic: TopicId,
    },
    /// A mutation failed and was rolled back (or superseded by a refetch).
    MutationFailed {
        /// The mutation.
        id: MutationId,
        /// Its target topic.
        topic: TopicId,
        /// Why it failed.
        error: SyncError,
    },
    /// A non-fatal error the user should see.
    Error(SyncError),
    /// The actor stopped. `None` after a requested shutdown.
    SessionEnded(Option<SyncError>),
}

/// Results of spawned pull requests.
#[derive(Debug)]
enum Completion {
    RoomFetched {
        generation: u64,
        room_epoch: u64,
        result: Result<RoomSnapshot, ApiError>,
    },
    Mutation {
        generation: u64,
        room_epoch: u64,
        id: MutationId,
        topic: TopicId,
        result: Result<CompletionResult, ApiError>,
    },
    ActivityPolled {
        generation: u64,
        result: Result<Option<ActivityReport>, ApiError>,
    },
}

struct JoinedRoom<Ch: Channel> {
    sync: RoomSync,
    epoch: u64,
    _lease: Session<Ch>,
}

struct ClientActor<Ch: Channel, A> {
    session: Session<Ch>,
    generation: u64,
    self_id: UserId,
    api: Arc<A>,
    options: ClientOptions,
    engine: PresenceEngine,
    directory: PresenceDirectory,
    pairing: PairingHandshake,
    last_partner: Option<(UserId, Option<PresenceEntry>)>,
    handshake_deadline: Option<Instant>,
    room: Option<JoinedRoom<Ch>>,
    room_epoch: u64,
    events: mpsc::Sender<ClientEvent>,
    completions: mpsc::Sender<Completion>,
}

/// Spawn the client actor for an open session.
///
/// Returns the command sender and the event receiver, like the rest of the
/// workspace's background services.
pub fn spawn_client<Ch: Channel, A: RoomApi>(
    session: Session<Ch>,
    inbound: mpsc::Receiver<Inbound>,
    api: Arc<A>,
    options: ClientOptions,
) -> (mpsc::Sender<ClientCommand>, mpsc::Receiver<ClientEvent>) {
    let capacity = options.channel_capacity.max(1);
    let (cmd_tx, cmd_rx) = mpsc::channel(capacity);
    let (evt_tx, evt_rx) = mpsc::channel(capacity);
    let (done_tx, done_rx) = mpsc::channel(capacity);

    let self_id = session.user_id().clone();
    let actor = ClientActor {
        generation: session.generation(),
        session,
        self_id: self_id.clone(),
        api,
        engine: PresenceEngine::new(options.presence.idle_threshold),
        directory: PresenceDirectory::new(self_id.clone()),
        pairing: PairingHandshake::new(self_id),
        last_partner: None,
        handshake_deadline: None,
        room: None,
        room_epoch: 0,
        options,
        events: evt_tx,
        completions: done_tx,
    };
    tokio::spawn(actor.run(cmd_rx, inbound, done_rx));
    (cmd_tx, evt_rx)
}

fn ticker(period: Duration) -> tokio::time::Interval {
    let period = period.max(Duration::from_millis(1));
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

fn now() -> std::time::Instant {
    Instant::now().into_std()
}

impl<Ch: Channel, A: RoomApi> ClientActor<Ch, A> {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<ClientCommand>,
        mut inbound: mpsc::Receiver<Inbound>,
        mut completions: mpsc::Receiver<Completion>,
    ) {
        let mut heartbeat = ticker(self.options.presence.heartbeat_interval);
        let mut idle_check = ticker(self.options.presence.idle_check_interval);
        let mut poll = ticker(self.options.presence.activity_poll_interval);

        tracing::info!(generation = self.generation, user = %self.self_id, "client started");
        self.emit(ClientEvent::Connection(self.session.state())).await;
        if let Some(t) = self.engine.session_opened(now()) {
            self.publish_transition(t).await;
        }

        let ended = loop {
            let resend_at = self.handshake_deadline;
            let flow = tokio::select! {
                cmd = commands.recv() => match cmd {
                    None | Some(ClientCommand::Shutdown) => ControlFlow::Break(None),
                    Some(cmd) => self.handle_command(cmd).await,
                },
                notice = inbound.recv() => match notice {
                    Some(notice) => self.handle_inbound(notice).await,
                    None => ControlFlow::Break(Some(SyncError::ChannelClosed)),
                },
                Some(done) = completions.recv() => self.handle_completion(done).await,
                _ = heartbeat.tick() => {
                    self.on_heartbeat().await;
                    ControlFlow::Continue(())
                }
                _ = idle_check.tick() => {
                    if let Some(t) = self.engine.check_idle(now()) {
                        self.publish_transition(t).await;
                    }
                    ControlFlow::Continue(())
                }
                _ = poll.tick() => {
                    self.on_poll();
                    ControlFlow::Continue(())
                }
                () = tokio::time::sleep_until(resend_at.unwrap_or_else(Instant::now)), if resend_at.is_some() => {
                    self.resend_handshake().await;
                    ControlFlow::Continue(())
                }
            };
            if let ControlFlow::Break(reason) = flow {
                break reason;
            }
        };

        self.shutdown(ended).await;
    }

    async fn shutdown(mut self, reason: Option<SyncError>) {
        if let Some(room) = self.room.take()
            && self.session.is_open()
        {
            let leave = ChannelEvent::RoomLeave {
                room_id: room.sync.room_id().clone(),
            };
            let _ = self.session.send(&leave).await;
        }
        if let Some(t) = self.engine.session_closed() {
            self.emit(ClientEvent::PresenceChanged(t)).await;
        }
        match &reason {
            Some(err) => tracing::warn!(generation = self.generation, err = %err, "client stopped"),
            None => tracing::info!(generation = self.generation, "client shut down"),
        }
        self.emit(ClientEvent::SessionEnded(reason)).await;
        // Dropping `self` releases the session lease.
    }

    async fn emit(&self, event: ClientEvent) {
        if self.events.send(event).await.is_err() {
            tracing::debug!("event receiver dropped");
        }
    }

    // -----------------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------------

    async fn handle_command(&mut self, cmd: ClientCommand) -> ControlFlow<Option<SyncError>> {
        match cmd {
            ClientCommand::Input => {
                if let Some(t) = self.engine.observe_input(now()) {
                    self.publish_transition(t).await;
                }
            }
            ClientCommand::ReportActivity(activity) => {
                match self.engine.report_activity(activity, now()) {
                    Some(EngineOutput::Transition(t)) => self.publish_transition(t).await,
                    Some(EngineOutput::ActivityChanged(activity)) => {
                        self.emit(ClientEvent::ActivityChanged(activity)).await;
                        self.announce_self().await;
                    }
                    None => {}
                }
            }
            ClientCommand::SetDoNotDisturb(enabled) => {
                if let Some(t) = self.engine.set_do_not_disturb(enabled, now()) {
                    self.publish_transition(t).await;
                }
            }
            ClientCommand::Pair { partner, source } => {
                let frame = self.pairing.pair(partner, source);
                self.directory.close_gate();
                self.send_or_defer(&frame).await;
                self.arm_handshake_timer();
            }
            ClientCommand::Unpair => {
                self.handshake_deadline = None;
                if let Some(partner) = self.pairing.unpair() {
                    self.directory.open_gate();
                    self.last_partner = None;
                    self.emit(ClientEvent::Unpaired { partner }).await;
                }
            }
            ClientCommand::JoinRoom(room_id) => self.join_room(room_id).await,
            ClientCommand::LeaveRoom => self.leave_room().await,
            ClientCommand::CompleteTopic(topic) => {
                self.mutate(MutationKind::CompleteTopic, topic).await;
            }
            ClientCommand::ReopenTopic(topic) => {
                self.mutate(MutationKind::ReopenTopic, topic).await;
            }
            ClientCommand::Refresh => self.start_refetch(),
            ClientCommand::QueryPresence { user, reply } => {
                let _ = reply.send(self.directory.get(&user).cloned());
            }
            ClientCommand::QueryRoom { reply } => {
                let view = self.room.as_ref().map(|r| RoomView {
                    snapshot: r.sync.snapshot().cloned(),
                    pending: r.sync.pending().len(),
                    stale: r.sync.is_stale(),
                });
                let _ = reply.send(view);
            }
            ClientCommand::Shutdown => return ControlFlow::Break(None),
        }
        ControlFlow::Continue(())
    }

    async fn join_room(&mut self, room_id: RoomId) {
        self.leave_room().await;
        self.room_epoch += 1;
        tracing::info!(room = %room_id, epoch = self.room_epoch, "joining room");
        let join = ChannelEvent::RoomJoin {
            room_id: room_id.clone(),
        };
        self.room = Some(JoinedRoom {
            sync: RoomSync::new(room_id, self.self_id.clone(), &self.options.sync),
            epoch: self.room_epoch,
            _lease: self.session.clone(),
        });
        self.send_or_defer(&join).await;
        self.start_refetch();
    }

    async fn leave_room(&mut self) {
        if let Some(room) = self.room.take() {
            tracing::info!(room = %room.sync.room_id(), "leaving room");
            let leave = ChannelEvent::RoomLeave {
                room_id: room.sync.room_id().clone(),
            };
            self.send_or_defer(&leave).await;
        }
    }

    async fn mutate(&mut self, kind: MutationKind, topic: TopicId) {
        if self.room.is_none() {
            self.emit(ClientEvent::Error(SyncError::Validation("no room joined".into())))
                .await;
            return;
        }
        let Some(room) = self.room.as_mut() else {
            return;
        };
        match room.sync.begin_mutation(kind, &topic, now_ms()) {
            Ok(id) => {
                let snapshot = room.sync.snapshot().cloned();
                let room_id = room.sync.room_id().clone();
                let room_epoch = room.epoch;
                if let Some(snapshot) = snapshot {
                    self.emit(ClientEvent::RoomUpdated(snapshot)).await;
                }
                let api = Arc::clone(&self.api);
                let done = self.completions.clone();
                let generation = self.generation;
                tokio::spawn(async move {
                    let result = match kind {
                        MutationKind::CompleteTopic => api.complete_topic(&room_id, &topic).await,
                        MutationKind::ReopenTopic => api.reopen_topic(&room_id, &topic).await,
                    };
                    let _ = done
                        .send(Completion::Mutation {
                            generation,
                            room_epoch,
                            id,
                            topic,
                            result,
                        })
                        .await;
                });
            }
            Err(err) => {
                let refetch = err.needs_refetch();
                self.emit(ClientEvent::Error(err)).await;
                if refetch {
                    self.start_refetch();
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Inbound channel notices
    // -----------------------------------------------------------------------

    async fn handle_inbound(&mut self, notice: Inbound) -> ControlFlow<Option<SyncError>> {
        if notice.generation() != self.generation {
            tracing::debug!(
                got = notice.generation(),
                current = self.generation,
                "discarding notice from superseded session"
            );
            return ControlFlow::Continue(());
        }
        match notice {
            Inbound::Event { event, .. } => self.handle_event(event).await,
            Inbound::Disconnected { reason, .. } => {
                tracing::warn!(reason = %reason, "channel lost, reconciliation suspended");
                if let Some(room) = self.room.as_mut() {
                    room.sync.suspend();
                }
                // The handshake is replayed once the channel is back.
                self.handshake_deadline = None;
                self.emit(ClientEvent::Connection(ConnectionState::Reconnecting))
                    .await;
            }
            Inbound::Reconnecting { attempt, delay, .. } => {
                self.emit(ClientEvent::Reconnecting { attempt, delay }).await;
            }
            Inbound::Reconnected { .. } => self.on_reconnected().await,
            Inbound::ReconnectFailed { .. } => {
                return ControlFlow::Break(Some(SyncError::ChannelClosed));
            }
            Inbound::Fatal { error, .. } => return ControlFlow::Break(Some(error)),
        }
        ControlFlow::Continue(())
    }

    async fn on_reconnected(&mut self) {
        self.emit(ClientEvent::Connection(ConnectionState::Open)).await;
        if let Some(frame) = self.pairing.on_reconnect() {
            self.directory.close_gate();
            self.send_or_defer(&frame).await;
            self.arm_handshake_timer();
        }
        self.announce_self().await;
        if let Some(room) = self.room.as_mut() {
            room.sync.resume();
            let join = ChannelEvent::RoomJoin {
                room_id: room.sync.room_id().clone(),
            };
            self.send_or_defer(&join).await;
        }
        self.start_refetch();
    }

    async fn handle_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::PresenceAck {
                self_id,
                partner_id,
            } => {
                let completed = match self.pairing.on_ack(&self_id, partner_id.as_ref(), now_ms()) {
                    AckOutcome::Paired(ctx) => {
                        self.emit(ClientEvent::Paired(ctx)).await;
                        true
                    }
                    AckOutcome::Reestablished => {
                        tracing::debug!("pairing re-established");
                        true
                    }
                    AckOutcome::Ignored => {
                        tracing::debug!(partner = ?partner_id, "ignoring unsolicited ack");
                        false
                    }
                };
                // Any completed handshake opens the gate; a target still
                // awaiting its own ack does not hold the others back.
                if completed || self.pairing.state() != HandshakeState::AwaitingAck {
                    self.directory.open_gate();
                }
                self.arm_handshake_timer();
                self.emit_partner_presence().await;
            }
            ChannelEvent::PresenceUpdate(update) => self.apply_push_update(&update).await,
            ChannelEvent::LegacyActivity(frame) => {
                self.apply_push_update(&legacy::translate(frame)).await;
            }
            ChannelEvent::PresenceSnapshot { map } => {
                if self.directory.apply_snapshot(map) == ApplyOutcome::AwaitingHandshake {
                    tracing::debug!("snapshot dropped while awaiting handshake ack");
                }
                self.emit_partner_presence().await;
            }
            ChannelEvent::Heartbeat {} => {}
            ChannelEvent::MemberChanged { .. }
            | ChannelEvent::TopicCompleted { .. }
            | ChannelEvent::ProgressUpdated { .. }
            | ChannelEvent::MessageCreated { .. }
            | ChannelEvent::ContentReady { .. }
            | ChannelEvent::BoardChanged { .. } => self.reconcile(&event).await,
            ChannelEvent::SessionAuth { .. }
            | ChannelEvent::SessionReady { .. }
            | ChannelEvent::SessionRejected { .. }
            | ChannelEvent::PresenceInit { .. }
            | ChannelEvent::RoomJoin { .. }
            | ChannelEvent::RoomLeave { .. } => {
                tracing::debug!(event = event.name(), "ignoring client-bound control frame");
            }
        }
    }

    async fn apply_push_update(&mut self, update: &PresenceUpdate) {
        match self.directory.apply_incremental(update, now_ms()) {
            ApplyOutcome::Applied => self.emit_partner_presence().await,
            outcome => {
                tracing::debug!(user = %update.user_id, ?outcome, "presence update not applied");
            }
        }
    }

    async fn reconcile(&mut self, event: &ChannelEvent) {
        let Some(room) = self.room.as_mut() else {
            return;
        };
        match room.sync.on_event(event) {
            Reconciliation::Patched => {
                if let Some(snapshot) = room.sync.snapshot().cloned() {
                    self.emit(ClientEvent::RoomUpdated(snapshot)).await;
                }
            }
            Reconciliation::Refetch => self.start_refetch(),
            Reconciliation::Deduplicated | Reconciliation::Ignored => {
                tracing::debug!(event = event.name(), "room event not applied");
            }
        }
    }

    // -----------------------------------------------------------------------
    // Completions
    // -----------------------------------------------------------------------

    async fn handle_completion(&mut self, done: Completion) -> ControlFlow<Option<SyncError>> {
        match done {
            Completion::RoomFetched {
                generation,
                room_epoch,
                result,
            } => {
                let Some(room) = self.current_room(generation, room_epoch) else {
                    return ControlFlow::Continue(());
                };
                match result {
                    Ok(snapshot) => {
                        let again = room.sync.accept_snapshot(snapshot);
                        if let Some(snapshot) = room.sync.snapshot().cloned() {
                            self.emit(ClientEvent::RoomUpdated(snapshot)).await;
                        }
                        if again {
                            self.spawn_fetch();
                        }
                    }
                    Err(e) => {
                        let again = room.sync.refetch_failed();
                        let err = SyncError::from(e);
                        tracing::warn!(err = %err, "room refetch failed");
                        if err.is_fatal() {
                            return ControlFlow::Break(Some(err));
                        }
                        self.emit(ClientEvent::Error(err)).await;
                        if again {
                            self.spawn_fetch();
                        }
                    }
                }
            }
            Completion::Mutation {
                generation,
                room_epoch,
                id,
                topic,
                result,
            } => {
                let Some(room) = self.current_room(generation, room_epoch) else {
                    return ControlFlow::Continue(());
                };
                match result {
                    Ok(result) => {
                        room.sync.confirm(id, &result);
                        let snapshot = room.sync.snapshot().cloned();
                        self.emit(ClientEvent::MutationConfirmed { id, topic }).await;
                        if let Some(snapshot) = snapshot {
                            self.emit(ClientEvent::RoomUpdated(snapshot)).await;
                        }
                    }
                    Err(e) => {
                        let error = SyncError::from(e);
                        tracing::warn!(mutation = %id, topic = %topic, err = %error, "mutation failed");
                        if error.needs_refetch() {
                            room.sync.abandon_for_conflict(id);
                            self.emit(ClientEvent::MutationFailed {
                                id,
                                topic,
                                error: error.clone(),
                            })
                            .await;
                            self.start_refetch();
                        } else {
                            let announced = room
                                .sync
                                .rollback(id)
                                .is_some_and(|m| m.status == MutationStatus::Superseded);
                            let snapshot = room.sync.snapshot().cloned();
                            self.emit(ClientEvent::MutationFailed {
                                id,
                                topic,
                                error: error.clone(),
                            })
                            .await;
                            if announced {
                                self.start_refetch();
                            } else if let Some(snapshot) = snapshot {
                                self.emit(ClientEvent::RoomUpdated(snapshot)).await;
                            }
                        }
                        if error.is_fatal() {
                            return ControlFlow::Break(Some(error));
                        }
                    }
                }
            }
            Completion::ActivityPolled { generation, result } => {
                if generation != self.generation {
                    return ControlFlow::Continue(());
                }
                match result {
                    Ok(Some(report)) => {
                        let update = PresenceUpdate::from(report);
                        if self.directory.apply_polled(&update) == ApplyOutcome::Applied {
                            self.emit_partner_presence().await;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => tracing::debug!(err = %e, "activity poll failed"),
                }
            }
        }
        ControlFlow::Continue(())
    }

    fn current_room(&mut self, generation: u64, room_epoch: u64) -> Option<&mut JoinedRoom<Ch>> {
        if generation != self.generation {
            return None;
        }
        self.room.as_mut().filter(|r| r.epoch == room_epoch)
    }

    // -----------------------------------------------------------------------
    // Pull requests and timers
    // -----------------------------------------------------------------------

    fn start_refetch(&mut self) {
        let Some(room) = self.room.as_mut() else {
            return;
        };
        if room.sync.request_refetch() {
            self.spawn_fetch();
        } else {
            tracing::debug!(room = %room.sync.room_id(), "refetch folded into the one in flight");
        }
    }

    fn spawn_fetch(&self) {
        let Some(room) = self.room.as_ref() else {
            return;
        };
        let room_id = room.sync.room_id().clone();
        let room_epoch = room.epoch;
        let generation = self.generation;
        let api = Arc::clone(&self.api);
        let done = self.completions.clone();
        tracing::debug!(room = %room_id, "fetching room");
        tokio::spawn(async move {
            let result = api.fetch_room(&room_id).await;
            let _ = done
                .send(Completion::RoomFetched {
                    generation,
                    room_epoch,
                    result,
                })
                .await;
        });
    }

    fn arm_handshake_timer(&mut self) {
        self.handshake_deadline = (self.pairing.state() == HandshakeState::AwaitingAck)
            .then(|| Instant::now() + self.options.presence.handshake_retry);
    }

    /// No ack within the retry period: send the handshake again, or give a
    /// target up after too many tries.
    async fn resend_handshake(&mut self) {
        self.handshake_deadline = None;
        if !self.session.is_open() {
            return;
        }
        let partner_before = self.pairing.partner_id().cloned();
        let resend = self.pairing.resend(self.options.presence.handshake_attempts);
        for frame in &resend.frames {
            self.send_or_defer(frame).await;
        }
        for partner in resend.expired {
            tracing::warn!(partner = %partner, "pairing handshake never acknowledged");
            self.emit(ClientEvent::Error(SyncError::Timeout)).await;
        }
        if let Some(partner) = partner_before
            && self.pairing.partner_id().is_none()
        {
            self.last_partner = None;
            self.emit(ClientEvent::Unpaired { partner }).await;
        }
        if self.pairing.state() != HandshakeState::AwaitingAck && self.directory.is_gated() {
            self.directory.open_gate();
            self.emit_partner_presence().await;
        }
        self.arm_handshake_timer();
    }

    async fn on_heartbeat(&self) {
        if !self.session.is_open() {
            return;
        }
        if let Err(e) = self.session.send(&ChannelEvent::Heartbeat {}).await {
            tracing::debug!(err = %e, "heartbeat not sent");
        }
    }

    fn on_poll(&self) {
        if self.session.state() == ConnectionState::Open {
            return;
        }
        let Some(partner) = self.pairing.partner_id().cloned() else {
            return;
        };
        let api = Arc::clone(&self.api);
        let done = self.completions.clone();
        let generation = self.generation;
        tokio::spawn(async move {
            let result = api.fetch_activity(&partner).await;
            let _ = done
                .send(Completion::ActivityPolled { generation, result })
                .await;
        });
    }

    // -----------------------------------------------------------------------
    // Presence publishing
    // -----------------------------------------------------------------------

    async fn publish_transition(&self, transition: PresenceTransition) {
        tracing::info!(from = %transition.from, to = %transition.to, "presence changed");
        self.emit(ClientEvent::PresenceChanged(transition)).await;
        self.announce_self().await;
    }

    /// Tell the authority about the local status: over the channel when it
    /// is open, through the pull surface otherwise.
    async fn announce_self(&self) {
        let status = self.engine.status();
        if status == PresenceStatus::Offline {
            return;
        }
        let update = PresenceUpdate {
            user_id: self.self_id.clone(),
            status,
            activity: self.engine.activity().cloned(),
            at: now_ms(),
        };
        if self.session.is_open() {
            if let Err(e) = self.session.send(&ChannelEvent::PresenceUpdate(update)).await {
                tracing::debug!(err = %e, "presence update not sent");
            }
            return;
        }
        let report = ActivityReport {
            user_id: update.user_id,
            status: update.status,
            activity: update.activity,
            at: update.at,
        };
        let api = Arc::clone(&self.api);
        tokio::spawn(async move {
            if let Err(e) = api.post_activity(&report).await {
                tracing::debug!(err = %e, "activity post failed");
            }
        });
    }

    async fn emit_partner_presence(&mut self) {
        let Some(partner) = self.pairing.partner_id().cloned() else {
            return;
        };
        let entry = self.pairing.partner_presence(&self.directory).cloned();
        let current = Some((partner.clone(), entry.clone()));
        if self.last_partner == current {
            return;
        }
        self.last_partner = current;
        self.emit(ClientEvent::PartnerPresence { partner, entry }).await;
    }

    async fn send_or_defer(&self, frame: &ChannelEvent) {
        if let Err(e) = self.session.send(frame).await {
            tracing::debug!(event = frame.name(), err = %e, "frame not sent; replayed after reconnect");
        }
    }
}
