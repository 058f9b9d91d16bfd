//! Connection manager: one authenticated push channel per session.
//!
//! [`ConnectionManager::connect`] opens a channel and returns a [`Session`]
//! together with the receiver of [`Inbound`] notices. A supervisor task
//! relays frames in arrival order and, when the channel drops, reconnects
//! with capped exponential backoff.
//!
//! # Architecture
//!
//! ```text
//! Session (lease) ──┐
//! Session (lease) ──┼──► Shared { channel, state, supervisor }
//! Session (lease) ──┘                 │
//!                                     ▼
//!                 supervisor ── Inbound ──► consumer
//! ```
//!
//! Every `Session` clone is a lease. The channel stays up while at least one
//! lease exists; dropping the last one cancels the supervisor, closes the
//! channel and publishes [`ConnectionState::Closed`].
//!
//! Each session gets a fresh generation number. Every [`Inbound`] notice
//! carries it so consumers can discard notices from a superseded session.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use copresence_proto::event::ChannelEvent;
use copresence_proto::ids::UserId;

use crate::config::ReconnectConfig;
use crate::error::SyncError;
use crate::transport::{Channel, Connector, TransportError};

/// Observable state of the push channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// First connection attempt in progress.
    Connecting,
    /// Channel authenticated and relaying frames.
    Open,
    /// Channel dropped; backoff loop running.
    Reconnecting,
    /// Torn down, either deliberately or after a fatal error.
    Closed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connecting => write!(f, "connecting"),
            Self::Open => write!(f, "open"),
            Self::Reconnecting => write!(f, "reconnecting"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// Connection manager settings.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Deadline for each open attempt (connect plus authentication).
    pub connect_timeout: Duration,
    /// Capacity of the inbound notice queue.
    pub channel_capacity: usize,
    /// Reconnect backoff.
    pub reconnect: ReconnectConfig,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            channel_capacity: 256,
            reconnect: ReconnectConfig::default(),
        }
    }
}

/// Notices delivered by a session's supervisor, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// A frame arrived on the channel.
    Event {
        /// Session generation.
        generation: u64,
        /// The decoded frame.
        event: ChannelEvent,
    },
    /// The channel dropped unexpectedly.
    Disconnected {
        /// Session generation.
        generation: u64,
        /// Why the channel dropped.
        reason: String,
    },
    /// A reconnect attempt is scheduled.
    Reconnecting {
        /// Session generation.
        generation: u64,
        /// 1-based attempt number.
        attempt: u32,
        /// Delay before the attempt.
        delay: Duration,
    },
    /// A fresh channel replaced the dropped one. Handshakes must be replayed
    /// and room state refetched.
    Reconnected {
        /// Session generation.
        generation: u64,
    },
    /// Every reconnect attempt failed; the session is closed.
    ReconnectFailed {
        /// Session generation.
        generation: u64,
    },
    /// The session ended with an unrecoverable error.
    Fatal {
        /// Session generation.
        generation: u64,
        /// The error that ended it.
        error: SyncError,
    },
}

impl Inbound {
    /// Generation of the session that produced this notice.
    #[must_use]
    pub const fn generation(&self) -> u64 {
        match self {
            Self::Event { generation, .. }
            | Self::Disconnected { generation, .. }
            | Self::Reconnecting { generation, .. }
            | Self::Reconnected { generation }
            | Self::ReconnectFailed { generation }
            | Self::Fatal { generation, .. } => *generation,
        }
    }
}

/// State shared by all leases of one session and its supervisor.
struct Shared<Ch> {
    generation: u64,
    user_id: UserId,
    token: String,
    channel: Mutex<Option<Arc<Ch>>>,
    state: watch::Sender<ConnectionState>,
    leases: AtomicUsize,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl<Ch> Shared<Ch> {
    fn current_channel(&self) -> Option<Arc<Ch>> {
        self.channel.lock().clone()
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    fn teardown(&self) {
        if let Some(handle) = self.supervisor.lock().take() {
            handle.abort();
        }
        self.channel.lock().take();
        self.set_state(ConnectionState::Closed);
        tracing::info!(generation = self.generation, "session torn down");
    }
}

/// Opens sessions through a [`Connector`].
pub struct ConnectionManager<C> {
    connector: Arc<C>,
    config: ConnectionConfig,
    generation: AtomicU64,
}

impl<C: Connector> ConnectionManager<C> {
    /// Creates a manager using `connector` for every open attempt.
    pub fn new(connector: C, config: ConnectionConfig) -> Self {
        Self {
            connector: Arc::new(connector),
            config,
            generation: AtomicU64::new(0),
        }
    }

    /// Generation of the most recently created session (0 before the first).
    pub fn current_generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Open and authenticate a channel, returning the session and its notices.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Auth`] if the token is empty or rejected,
    /// [`SyncError::Timeout`] if the open attempt exceeded its deadline, and
    /// [`SyncError::Network`] for other transport failures.
    pub async fn connect(
        &self,
        token: &str,
    ) -> Result<(Session<C::Channel>, mpsc::Receiver<Inbound>), SyncError> {
        if token.is_empty() {
            return Err(SyncError::Auth("missing token".into()));
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (state_tx, _) = watch::channel(ConnectionState::Connecting);
        tracing::info!(generation, "connecting");

        let (channel, user_id) = open_with_timeout(&*self.connector, token, &self.config)
            .await
            .map_err(|e| {
                tracing::warn!(generation, err = %e, "connect failed");
                SyncError::from(e)
            })?;

        let shared = Arc::new(Shared {
            generation,
            user_id,
            token: token.to_string(),
            channel: Mutex::new(Some(Arc::new(channel))),
            state: state_tx,
            leases: AtomicUsize::new(1),
            supervisor: Mutex::new(None),
        });
        shared.set_state(ConnectionState::Open);
        tracing::info!(generation, user_id = %shared.user_id, "session open");

        let (inbound_tx, inbound_rx) = mpsc::channel(self.config.channel_capacity.max(1));
        let handle = tokio::spawn(supervise(
            Arc::clone(&self.connector),
            Arc::clone(&shared),
            inbound_tx,
            self.config.clone(),
        ));
        *shared.supervisor.lock() = Some(handle);

        Ok((Session { shared }, inbound_rx))
    }
}

async fn open_with_timeout<C: Connector>(
    connector: &C,
    token: &str,
    config: &ConnectionConfig,
) -> Result<(C::Channel, UserId), TransportError> {
    tokio::time::timeout(config.connect_timeout, connector.open(token))
        .await
        .map_err(|_| TransportError::Timeout)?
}

/// A lease on an authenticated channel.
///
/// Cloning takes another lease; the channel is torn down when the last
/// lease is dropped.
pub struct Session<Ch: Channel> {
    shared: Arc<Shared<Ch>>,
}

impl<Ch: Channel> Session<Ch> {
    /// Send a frame on the current channel.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::ChannelClosed`] while reconnecting or after
    /// teardown, and the mapped transport error if the send fails.
    pub async fn send(&self, event: &ChannelEvent) -> Result<(), SyncError> {
        let channel = self
            .shared
            .current_channel()
            .ok_or(SyncError::ChannelClosed)?;
        channel.send(event).await.map_err(SyncError::from)
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Subscribe to connection state changes.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Whether frames can currently be sent.
    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Generation of this session.
    pub fn generation(&self) -> u64 {
        self.shared.generation
    }

    /// Identity the server bound to the token.
    pub fn user_id(&self) -> &UserId {
        &self.shared.user_id
    }

    /// Number of live leases.
    pub fn leases(&self) -> usize {
        self.shared.leases.load(Ordering::SeqCst)
    }
}

impl<Ch: Channel> Clone for Session<Ch> {
    fn clone(&self) -> Self {
        self.shared.leases.fetch_add(1, Ordering::SeqCst);
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<Ch: Channel> Drop for Session<Ch> {
    fn drop(&mut self) {
        if self.shared.leases.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.shared.teardown();
        }
    }
}

impl<Ch: Channel> std::fmt::Debug for Session<Ch> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("generation", &self.shared.generation)
            .field("user_id", &self.shared.user_id)
            .field("state", &self.state())
            .field("leases", &self.leases())
            .finish_non_exhaustive()
    }
}

/// Why the backoff loop stopped without a channel.
enum ReconnectError {
    Fatal(SyncError),
    Exhausted,
    ConsumerGone,
}

/// Relay frames until the channel drops, then reconnect. Exits when the
/// consumer goes away, on a fatal error, or when attempts are exhausted.
async fn supervise<C: Connector>(
    connector: Arc<C>,
    shared: Arc<Shared<C::Channel>>,
    inbound: mpsc::Sender<Inbound>,
    config: ConnectionConfig,
) {
    let generation = shared.generation;
    loop {
        let Some(channel) = shared.current_channel() else {
            return;
        };

        let reason = loop {
            match channel.recv().await {
                Ok(event) => {
                    tracing::debug!(generation, event = event.name(), "inbound");
                    if inbound
                        .send(Inbound::Event { generation, event })
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
                Err(e) => break e.to_string(),
            }
        };
        drop(channel);
        shared.channel.lock().take();
        shared.set_state(ConnectionState::Reconnecting);
        tracing::warn!(generation, reason = %reason, "channel dropped");

        if inbound
            .send(Inbound::Disconnected { generation, reason })
            .await
            .is_err()
        {
            return;
        }

        match reconnect(&*connector, &shared, &inbound, &config).await {
            Ok(channel) => {
                *shared.channel.lock() = Some(Arc::new(channel));
                shared.set_state(ConnectionState::Open);
                tracing::info!(generation, "reconnected");
                if inbound.send(Inbound::Reconnected { generation }).await.is_err() {
                    return;
                }
            }
            Err(ReconnectError::Fatal(error)) => {
                shared.set_state(ConnectionState::Closed);
                tracing::warn!(generation, err = %error, "reconnect rejected, session closed");
                let _ = inbound.send(Inbound::Fatal { generation, error }).await;
                return;
            }
            Err(ReconnectError::Exhausted) => {
                shared.set_state(ConnectionState::Closed);
                tracing::warn!(
                    generation,
                    attempts = config.reconnect.max_attempts,
                    "reconnect attempts exhausted, session closed"
                );
                let _ = inbound.send(Inbound::ReconnectFailed { generation }).await;
                return;
            }
            Err(ReconnectError::ConsumerGone) => return,
        }
    }
}

async fn reconnect<C: Connector>(
    connector: &C,
    shared: &Shared<C::Channel>,
    inbound: &mpsc::Sender<Inbound>,
    config: &ConnectionConfig,
) -> Result<C::Channel, ReconnectError> {
    let generation = shared.generation;
    for attempt in 1..=config.reconnect.max_attempts {
        let delay = config.reconnect.delay_for(attempt);
        if inbound
            .send(Inbound::Reconnecting {
                generation,
                attempt,
                delay,
            })
            .await
            .is_err()
        {
            return Err(ReconnectError::ConsumerGone);
        }
        tracing::debug!(generation, attempt, ?delay, "reconnect scheduled");
        tokio::time::sleep(delay).await;

        match open_with_timeout(connector, &shared.token, config).await {
            Ok((channel, user_id)) => {
                if user_id != shared.user_id {
                    tracing::warn!(
                        generation,
                        expected = %shared.user_id,
                        got = %user_id,
                        "reconnect bound a different identity"
                    );
                    return Err(ReconnectError::Fatal(SyncError::Auth(format!(
                        "token now bound to {user_id}"
                    ))));
                }
                return Ok(channel);
            }
            Err(TransportError::Rejected(reason)) => {
                return Err(ReconnectError::Fatal(SyncError::Auth(reason)));
            }
            Err(e) => {
                tracing::debug!(generation, attempt, err = %e, "reconnect attempt failed");
            }
        }
    }
    Err(ReconnectError::Exhausted)
}
