//! Push-channel abstraction.
//!
//! A [`Connector`] opens and authenticates a [`Channel`]; the channel then
//! carries typed [`ChannelEvent`] frames in both directions. Implementations:
//! - [`ws::WsConnector`]: WebSocket channel to the server of record
//! - [`loopback::LoopbackConnector`]: in-process channel for testing

pub mod loopback;
pub mod ws;

use copresence_proto::codec::CodecError;
use copresence_proto::event::ChannelEvent;
use copresence_proto::ids::UserId;

/// Errors that can occur on the push channel.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The channel has been closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// The operation timed out before completing.
    #[error("transport operation timed out")]
    Timeout,

    /// The server could not be reached.
    #[error("server {0} is unreachable")]
    Unreachable(String),

    /// The server rejected the session token.
    #[error("session rejected: {0}")]
    Rejected(String),

    /// A frame could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// An underlying I/O error occurred.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// An open, authenticated duplex channel.
///
/// Frames are delivered in order. A channel never reopens itself: once
/// [`Channel::recv`] reports [`TransportError::ConnectionClosed`], the owner
/// must open a new one through its [`Connector`].
pub trait Channel: Send + Sync + 'static {
    /// Send one event to the server.
    fn send(
        &self,
        event: &ChannelEvent,
    ) -> impl std::future::Future<Output = Result<(), TransportError>> + Send;

    /// Receive the next event from the server.
    fn recv(&self) -> impl std::future::Future<Output = Result<ChannelEvent, TransportError>> + Send;

    /// Whether the channel is still usable.
    fn is_open(&self) -> bool;
}

/// Opens authenticated channels to the server of record.
pub trait Connector: Send + Sync + 'static {
    /// Channel type produced by this connector.
    type Channel: Channel;

    /// Open a channel and authenticate it with `token`.
    ///
    /// Returns the channel and the identity the server bound to the token.
    ///
    /// # Errors
    ///
    /// - [`TransportError::Rejected`] if the server refuses the token.
    /// - [`TransportError::Timeout`] if establishment takes too long.
    /// - Any other variant for network failures.
    fn open(
        &self,
        token: &str,
    ) -> impl std::future::Future<Output = Result<(Self::Channel, UserId), TransportError>> + Send;
}
