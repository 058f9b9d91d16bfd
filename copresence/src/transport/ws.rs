//! WebSocket push channel to the server of record.
//!
//! Opening a channel performs the session handshake: the client sends
//! `session:auth` with its token and waits for `session:ready` (or
//! `session:rejected`). After that a background reader task decodes text
//! frames into [`ChannelEvent`]s.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{Mutex, mpsc};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use copresence_proto::codec;
use copresence_proto::event::ChannelEvent;
use copresence_proto::ids::UserId;

use super::{Channel, Connector, TransportError};

/// Type alias for the write half of a WebSocket connection.
type WsSender = futures_util::stream::SplitSink<
    WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
    Message,
>;

/// Type alias for the read half of a WebSocket connection.
type WsReader =
    futures_util::stream::SplitStream<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>>;

/// Default timeout for establishing the WebSocket connection.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default timeout for the `session:ready` answer.
const DEFAULT_AUTH_TIMEOUT: Duration = Duration::from_secs(5);

/// Capacity of the inbound frame queue between reader task and consumer.
const INBOUND_CAPACITY: usize = 256;

/// Opens authenticated WebSocket channels to a fixed URL.
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
    connect_timeout: Duration,
    auth_timeout: Duration,
}

impl WsConnector {
    /// Creates a connector for `url` (ws:// or wss://) with default timeouts.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            auth_timeout: DEFAULT_AUTH_TIMEOUT,
        }
    }

    /// Overrides the connection and authentication timeouts.
    #[must_use]
    pub const fn with_timeouts(mut self, connect: Duration, auth: Duration) -> Self {
        self.connect_timeout = connect;
        self.auth_timeout = auth;
        self
    }

    /// Return the server URL.
    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Connector for WsConnector {
    type Channel = WsChannel;

    async fn open(&self, token: &str) -> Result<(WsChannel, UserId), TransportError> {
        let url = self.url.as_str();
        let (ws_stream, _response) = tokio::time::timeout(self.connect_timeout, connect_async(url))
            .await
            .map_err(|_| {
                tracing::warn!(url, "WebSocket connect timed out");
                TransportError::Timeout
            })?
            .map_err(|e| {
                tracing::warn!(url, err = %e, "WebSocket connect failed");
                map_ws_connect_error(url, e)
            })?;

        let (mut ws_sender, mut ws_reader) = ws_stream.split();

        let auth = codec::encode(&ChannelEvent::SessionAuth {
            token: token.to_string(),
        })?;
        ws_sender
            .send(Message::Text(auth.into()))
            .await
            .map_err(|e| {
                tracing::warn!(err = %e, "failed to send session:auth");
                TransportError::Io(std::io::Error::other(format!(
                    "failed to send session:auth: {e}"
                )))
            })?;

        let user_id = tokio::time::timeout(self.auth_timeout, wait_for_ready(&mut ws_reader))
            .await
            .map_err(|_| {
                tracing::warn!(url, "session:ready timed out");
                TransportError::Timeout
            })??;

        tracing::info!(url, user_id = %user_id, "channel authenticated");

        let (tx, rx) = mpsc::channel(INBOUND_CAPACITY);
        let open = Arc::new(AtomicBool::new(true));
        let reader = tokio::spawn(reader_loop(ws_reader, tx, Arc::clone(&open)));

        Ok((
            WsChannel {
                ws_sender: Mutex::new(ws_sender),
                incoming: Mutex::new(rx),
                open,
                reader,
            },
            user_id,
        ))
    }
}

/// Waits for the server's answer to `session:auth`.
///
/// Control frames (ping/pong) are skipped. Any event other than
/// `session:ready` / `session:rejected` during the handshake is an error.
async fn wait_for_ready(ws_reader: &mut WsReader) -> Result<UserId, TransportError> {
    while let Some(frame) = ws_reader.next().await {
        match frame {
            Ok(Message::Text(text)) => match codec::decode(text.as_str())? {
                ChannelEvent::SessionReady { user_id } => return Ok(user_id),
                ChannelEvent::SessionRejected { reason } => {
                    tracing::warn!(reason = %reason, "session rejected");
                    return Err(TransportError::Rejected(reason));
                }
                other => {
                    tracing::warn!(event = other.name(), "unexpected event during handshake");
                    return Err(TransportError::Io(std::io::Error::other(format!(
                        "unexpected {} during handshake",
                        other.name()
                    ))));
                }
            },
            Ok(Message::Close(_)) => return Err(TransportError::ConnectionClosed),
            Ok(_) => {}
            Err(e) => {
                return Err(TransportError::Io(std::io::Error::other(format!(
                    "WebSocket error during handshake: {e}"
                ))));
            }
        }
    }
    Err(TransportError::ConnectionClosed)
}

/// An authenticated WebSocket channel.
///
/// Dropping the channel aborts its reader task and closes the socket.
pub struct WsChannel {
    ws_sender: Mutex<WsSender>,
    incoming: Mutex<mpsc::Receiver<ChannelEvent>>,
    open: Arc<AtomicBool>,
    reader: tokio::task::JoinHandle<()>,
}

impl Channel for WsChannel {
    async fn send(&self, event: &ChannelEvent) -> Result<(), TransportError> {
        if !self.open.load(Ordering::Relaxed) {
            return Err(TransportError::ConnectionClosed);
        }
        let frame = codec::encode(event)?;
        let mut sender = self.ws_sender.lock().await;
        sender.send(Message::Text(frame.into())).await.map_err(|e| {
            tracing::warn!(err = %e, event = event.name(), "channel send failed");
            self.open.store(false, Ordering::Relaxed);
            TransportError::ConnectionClosed
        })
    }

    async fn recv(&self) -> Result<ChannelEvent, TransportError> {
        let mut rx = self.incoming.lock().await;
        rx.recv().await.ok_or(TransportError::ConnectionClosed)
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Relaxed)
    }
}

impl Drop for WsChannel {
    fn drop(&mut self) {
        self.open.store(false, Ordering::Relaxed);
        self.reader.abort();
    }
}

/// Background task that decodes text frames and forwards them in order.
///
/// Malformed frames are logged and skipped; they never close the channel.
async fn reader_loop(
    mut ws_reader: WsReader,
    tx: mpsc::Sender<ChannelEvent>,
    open: Arc<AtomicBool>,
) {
    while let Some(frame) = ws_reader.next().await {
        match frame {
            Ok(Message::Text(text)) => match codec::decode(text.as_str()) {
                Ok(event) => {
                    if tx.send(event).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!(err = %e, "malformed frame, skipping");
                }
            },
            Ok(Message::Close(_)) => {
                tracing::info!("channel closed by server");
                break;
            }
            Ok(Message::Binary(_)) => {
                tracing::debug!("ignoring binary frame");
            }
            Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => {}
            Err(e) => {
                tracing::warn!(err = %e, "channel read error");
                break;
            }
        }
    }
    open.store(false, Ordering::Relaxed);
    tracing::debug!("channel reader task exiting");
}

/// Map a `tokio_tungstenite` connection error to a [`TransportError`].
fn map_ws_connect_error(url: &str, err: tokio_tungstenite::tungstenite::Error) -> TransportError {
    use tokio_tungstenite::tungstenite::Error as WsError;
    match err {
        WsError::Io(io_err) => {
            if io_err.kind() == std::io::ErrorKind::ConnectionRefused
                || io_err.kind() == std::io::ErrorKind::AddrNotAvailable
            {
                TransportError::Unreachable(url.to_string())
            } else {
                TransportError::Io(io_err)
            }
        }
        WsError::Http(response) if matches!(response.status().as_u16(), 401 | 403) => {
            TransportError::Rejected(format!("HTTP {}", response.status()))
        }
        WsError::Http(response) => TransportError::Io(std::io::Error::other(format!(
            "HTTP error: status {}",
            response.status()
        ))),
        other => TransportError::Io(std::io::Error::other(format!(
            "connection error: {other}"
        ))),
    }
}
