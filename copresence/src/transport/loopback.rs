//! In-process push channel for testing.
//!
//! [`LoopbackConnector::new`] returns a connector plus a [`LoopbackServer`]
//! handle that plays the server of record: it decides whether tokens are
//! accepted and receives a [`ServerEnd`] for every opened channel. Dropping a
//! `ServerEnd` closes that channel from the server side, which is how tests
//! simulate a network drop.

use std::sync::Arc;

use parking_lot::Mutex as SyncMutex;
use tokio::sync::{Mutex, mpsc};

use copresence_proto::event::ChannelEvent;
use copresence_proto::ids::UserId;

use super::{Channel, Connector, TransportError};

/// How the loopback server answers the next `open` calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcceptPolicy {
    /// Accept any non-empty token and bind it to this user.
    Accept(UserId),
    /// Reject every token with this reason.
    Reject(String),
    /// Behave as if the server were down.
    Unreachable,
}

/// Server side of one loopback channel.
pub struct ServerEnd {
    /// Token the client authenticated with.
    pub token: String,
    to_client: mpsc::UnboundedSender<ChannelEvent>,
    from_client: mpsc::UnboundedReceiver<ChannelEvent>,
}

impl ServerEnd {
    /// Push an event to the client. Returns `false` if the client is gone.
    pub fn push(&self, event: ChannelEvent) -> bool {
        self.to_client.send(event).is_ok()
    }

    /// Receive the next event the client sent, or `None` once it closed.
    pub async fn recv(&mut self) -> Option<ChannelEvent> {
        self.from_client.recv().await
    }

    /// Return an already-sent client event without waiting.
    pub fn try_recv(&mut self) -> Option<ChannelEvent> {
        self.from_client.try_recv().ok()
    }
}

/// Test handle controlling the loopback server.
#[derive(Clone)]
pub struct LoopbackServer {
    policy: Arc<SyncMutex<AcceptPolicy>>,
    opened: Arc<SyncMutex<usize>>,
    connections: Arc<Mutex<mpsc::UnboundedReceiver<ServerEnd>>>,
}

impl LoopbackServer {
    /// Change how subsequent `open` calls are answered.
    pub fn set_policy(&self, policy: AcceptPolicy) {
        *self.policy.lock() = policy;
    }

    /// Wait for the next channel a client opens.
    pub async fn accept(&self) -> Option<ServerEnd> {
        self.connections.lock().await.recv().await
    }

    /// Number of channels successfully opened so far.
    pub fn opened(&self) -> usize {
        *self.opened.lock()
    }
}

/// Connector producing in-process channels.
pub struct LoopbackConnector {
    policy: Arc<SyncMutex<AcceptPolicy>>,
    opened: Arc<SyncMutex<usize>>,
    connections: mpsc::UnboundedSender<ServerEnd>,
}

impl LoopbackConnector {
    /// Create a connector whose server accepts tokens as `user_id`.
    pub fn new(user_id: UserId) -> (Self, LoopbackServer) {
        let policy = Arc::new(SyncMutex::new(AcceptPolicy::Accept(user_id)));
        let opened = Arc::new(SyncMutex::new(0));
        let (tx, rx) = mpsc::unbounded_channel();
        let connector = Self {
            policy: Arc::clone(&policy),
            opened: Arc::clone(&opened),
            connections: tx,
        };
        let server = LoopbackServer {
            policy,
            opened,
            connections: Arc::new(Mutex::new(rx)),
        };
        (connector, server)
    }
}

impl Connector for LoopbackConnector {
    type Channel = LoopbackChannel;

    async fn open(&self, token: &str) -> Result<(LoopbackChannel, UserId), TransportError> {
        let policy = self.policy.lock().clone();
        let user_id = match policy {
            AcceptPolicy::Accept(_) if token.is_empty() => {
                return Err(TransportError::Rejected("empty token".into()));
            }
            AcceptPolicy::Accept(user_id) => user_id,
            AcceptPolicy::Reject(reason) => return Err(TransportError::Rejected(reason)),
            AcceptPolicy::Unreachable => {
                return Err(TransportError::Unreachable("loopback".into()));
            }
        };

        let (to_client, client_rx) = mpsc::unbounded_channel();
        let (client_tx, from_client) = mpsc::unbounded_channel();
        let end = ServerEnd {
            token: token.to_string(),
            to_client,
            from_client,
        };
        self.connections
            .send(end)
            .map_err(|_| TransportError::Unreachable("loopback".into()))?;
        *self.opened.lock() += 1;

        Ok((
            LoopbackChannel {
                tx: client_tx,
                rx: Mutex::new(client_rx),
            },
            user_id,
        ))
    }
}

/// Client side of one loopback channel.
pub struct LoopbackChannel {
    tx: mpsc::UnboundedSender<ChannelEvent>,
    rx: Mutex<mpsc::UnboundedReceiver<ChannelEvent>>,
}

impl Channel for LoopbackChannel {
    async fn send(&self, event: &ChannelEvent) -> Result<(), TransportError> {
        self.tx
            .send(event.clone())
            .map_err(|_| TransportError::ConnectionClosed)
    }

    async fn recv(&self) -> Result<ChannelEvent, TransportError> {
        let mut rx = self.rx.lock().await;
        rx.recv().await.ok_or(TransportError::ConnectionClosed)
    }

    fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }
}
