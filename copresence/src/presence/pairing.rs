//! Pairing handshake: who the local user's counterpart is.
//!
//! `pair` produces a `presence:init` frame and moves to `AwaitingAck`. The
//! server's `presence:ack` completes it. The channel keeps no memory across
//! drops, so [`PairingHandshake::on_reconnect`] replays the handshake for the
//! current target.
//!
//! Two flows can pair: redeeming a link locally and redeeming it through the
//! server. Both may be in flight at once. Whichever is acknowledged last
//! replaces the context; every replacement bumps the epoch.
//!
//! Acknowledgments can be lost on a live channel too. [`PairingHandshake::resend`]
//! repeats the handshake for unanswered targets and gives a target up after
//! a bounded number of sends.

use copresence_proto::event::ChannelEvent;
use copresence_proto::ids::UserId;
use copresence_proto::presence::PresenceEntry;

use super::directory::PresenceDirectory;

/// Which flow produced a pairing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingSource {
    /// Link redeemed from the local cache.
    LocalLink,
    /// Link redeemed through the server.
    ServerRedeem,
}

/// An established pairing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingContext {
    /// The local user.
    pub self_id: UserId,
    /// The counterpart.
    pub partner_id: UserId,
    /// Milliseconds since epoch when the pairing was acknowledged.
    pub established_at: u64,
    /// Flow that produced the pairing.
    pub source: PairingSource,
    /// Increments every time the context is replaced.
    pub epoch: u64,
}

/// Handshake progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// No partner and nothing pending.
    Unpaired,
    /// A handshake was sent and not yet acknowledged.
    AwaitingAck,
    /// Every sent handshake was acknowledged.
    Established,
}

/// What an acknowledgment did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckOutcome {
    /// Not for us, or for a partner we never asked for.
    Ignored,
    /// Re-handshake for the current partner completed; context unchanged.
    Reestablished,
    /// A new context replaced the previous one.
    Paired(PairingContext),
}

/// Frames produced by [`PairingHandshake::resend`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Resend {
    /// Handshakes to send again.
    pub frames: Vec<ChannelEvent>,
    /// Targets dropped after going unanswered too often.
    pub expired: Vec<UserId>,
}

#[derive(Debug, Clone)]
struct PendingPair {
    partner: UserId,
    source: PairingSource,
    sends: u32,
}

/// Pairing state for the local user.
#[derive(Debug, Clone)]
pub struct PairingHandshake {
    self_id: UserId,
    pending: Vec<PendingPair>,
    context: Option<PairingContext>,
    epoch: u64,
}

impl PairingHandshake {
    /// Creates an unpaired handshake for `self_id`.
    #[must_use]
    pub const fn new(self_id: UserId) -> Self {
        Self {
            self_id,
            pending: Vec::new(),
            context: None,
            epoch: 0,
        }
    }

    /// Current handshake progress.
    #[must_use]
    pub fn state(&self) -> HandshakeState {
        if !self.pending.is_empty() {
            HandshakeState::AwaitingAck
        } else if self.context.is_some() {
            HandshakeState::Established
        } else {
            HandshakeState::Unpaired
        }
    }

    /// The established pairing, if any.
    #[must_use]
    pub const fn context(&self) -> Option<&PairingContext> {
        self.context.as_ref()
    }

    /// The established partner, if any.
    #[must_use]
    pub fn partner_id(&self) -> Option<&UserId> {
        self.context.as_ref().map(|c| &c.partner_id)
    }

    /// Start pairing with `partner` and return the frame to send.
    ///
    /// Safe to call repeatedly; the frame is idempotent on the server.
    pub fn pair(&mut self, partner: UserId, source: PairingSource) -> ChannelEvent {
        if let Some(slot) = self.pending.iter_mut().find(|p| p.partner == partner) {
            slot.source = source;
            slot.sends = 1;
        } else {
            self.pending.push(PendingPair {
                partner: partner.clone(),
                source,
                sends: 1,
            });
        }
        tracing::debug!(partner = %partner, ?source, "pairing handshake started");
        init_frame(&self.self_id, partner)
    }

    /// Replay the handshake on a fresh channel.
    ///
    /// Only the most recent target is replayed. Returns `None` when there is
    /// nothing to pair with.
    pub fn on_reconnect(&mut self) -> Option<ChannelEvent> {
        let (partner, source) = self
            .pending
            .last()
            .map(|p| (p.partner.clone(), p.source))
            .or_else(|| {
                self.context
                    .as_ref()
                    .map(|c| (c.partner_id.clone(), c.source))
            })?;
        self.pending = vec![PendingPair {
            partner: partner.clone(),
            source,
            sends: 1,
        }];
        tracing::debug!(partner = %partner, "replaying pairing handshake");
        Some(init_frame(&self.self_id, partner))
    }

    /// Repeat the handshake for every unacknowledged target.
    ///
    /// A target that has already been sent `max_sends` times is dropped
    /// instead and reported in [`Resend::expired`]. If that target is the
    /// current partner, the pairing ends with it.
    pub fn resend(&mut self, max_sends: u32) -> Resend {
        let mut out = Resend::default();
        let self_id = &self.self_id;
        self.pending.retain_mut(|p| {
            if p.sends >= max_sends {
                out.expired.push(p.partner.clone());
                return false;
            }
            p.sends += 1;
            out.frames.push(init_frame(self_id, p.partner.clone()));
            true
        });
        if self
            .partner_id()
            .is_some_and(|partner| out.expired.contains(partner))
        {
            self.context = None;
        }
        if !out.frames.is_empty() || !out.expired.is_empty() {
            tracing::debug!(resent = out.frames.len(), expired = out.expired.len(), "pairing handshake unanswered");
        }
        out
    }

    /// Apply a `presence:ack`.
    pub fn on_ack(&mut self, self_id: &UserId, partner: Option<&UserId>, now_ms: u64) -> AckOutcome {
        let Some(partner) = partner else {
            return AckOutcome::Ignored;
        };
        if *self_id != self.self_id {
            return AckOutcome::Ignored;
        }
        let Some(index) = self.pending.iter().position(|p| p.partner == *partner) else {
            return AckOutcome::Ignored;
        };
        let PendingPair {
            partner: partner_id,
            source,
            ..
        } = self.pending.remove(index);

        if self.partner_id() == Some(&partner_id) {
            return AckOutcome::Reestablished;
        }

        self.epoch += 1;
        let context = PairingContext {
            self_id: self.self_id.clone(),
            partner_id,
            established_at: now_ms,
            source,
            epoch: self.epoch,
        };
        tracing::info!(partner = %context.partner_id, epoch = context.epoch, ?source, "paired");
        self.context = Some(context.clone());
        AckOutcome::Paired(context)
    }

    /// End the pairing. Returns the former partner.
    pub fn unpair(&mut self) -> Option<UserId> {
        self.pending.clear();
        let previous = self.context.take().map(|c| c.partner_id);
        if let Some(partner) = &previous {
            tracing::info!(partner = %partner, "unpaired");
        }
        previous
    }

    /// The partner's entry in `directory`, if paired.
    #[must_use]
    pub fn partner_presence<'a>(&self, directory: &'a PresenceDirectory) -> Option<&'a PresenceEntry> {
        directory.get(self.partner_id()?)
    }
}

fn init_frame(self_id: &UserId, partner: UserId) -> ChannelEvent {
    ChannelEvent::PresenceInit {
        self_id: self_id.clone(),
        partner_id: Some(partner),
    }
}
