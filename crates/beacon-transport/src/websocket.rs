//! WebSocket transport implementation.
//!
//! Client-side websocket transport over tokio-tungstenite. The stream is
//! split into a writer task fed by a command queue and a reader task that
//! forwards frames as [`TransportEvent`]s to the owner.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async,
    tungstenite::protocol::{frame::coding::CloseCode, CloseFrame, Message},
    tungstenite::Error as WsError,
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, trace, warn};

use async_trait::async_trait;
use beacon_protocol::RawMessage;

use crate::traits::{Transport, TransportError, TransportEvent, TransportReceiver, TransportSender};

/// Websocket frame kind used for outbound messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Framing {
    /// Text frames (JSON serializers).
    #[default]
    Text,
    /// Binary frames (binary serializers).
    Binary,
}

/// WebSocket client transport.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketTransport {
    framing: Framing,
}

impl WebSocketTransport {
    /// Create a new websocket transport with the given outbound framing.
    #[must_use]
    pub fn new(framing: Framing) -> Self {
        Self { framing }
    }

    /// Swap an `http(s)` scheme for the matching `ws(s)` scheme.
    fn ws_url(url: &str) -> String {
        if let Some(rest) = url.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = url.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            url.to_string()
        }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(
        &self,
        url: &str,
    ) -> Result<(Box<dyn TransportSender>, TransportReceiver), TransportError> {
        let url = Self::ws_url(url);
        debug!(url = %url, "connecting websocket");

        let (stream, _response) = connect_async(&url)
            .await
            .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;

        debug!(url = %url, "websocket handshake completed");

        let (write, read) = stream.split();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let open = Arc::new(AtomicBool::new(true));

        // The handshake already succeeded; the connection is ready to send.
        let _ = event_tx.send(TransportEvent::Open);

        tokio::spawn(write_loop(write, command_rx));
        tokio::spawn(read_loop(read, event_tx, command_tx.clone(), open.clone()));

        let sender = WebSocketSender {
            commands: command_tx,
            framing: self.framing,
            open,
        };
        Ok((Box::new(sender), event_rx))
    }

    fn name(&self) -> &'static str {
        "websocket"
    }
}

/// Commands consumed by the writer task.
enum WsCommand {
    Frame(Message),
    Pong(Vec<u8>),
    Close {
        code: Option<u16>,
        reason: Option<String>,
    },
}

struct WebSocketSender {
    commands: mpsc::UnboundedSender<WsCommand>,
    framing: Framing,
    open: Arc<AtomicBool>,
}

impl TransportSender for WebSocketSender {
    fn send(&self, msg: RawMessage) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::NotOpen);
        }
        let frame = match (self.framing, msg) {
            (Framing::Text, RawMessage::Text(text)) => Message::Text(text),
            (Framing::Binary, RawMessage::Text(text)) => Message::Binary(text.into_bytes()),
            (_, RawMessage::Binary(data)) => Message::Binary(data.to_vec()),
        };
        self.commands
            .send(WsCommand::Frame(frame))
            .map_err(|_| TransportError::SendFailed("writer task stopped".to_string()))
    }

    fn close(&self, code: Option<u16>, reason: Option<String>) -> Result<(), TransportError> {
        // Idempotent: a stopped writer means the close already happened.
        let _ = self.commands.send(WsCommand::Close { code, reason });
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

type WsSink = futures_util::stream::SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsStream = futures_util::stream::SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

async fn write_loop(mut write: WsSink, mut commands: mpsc::UnboundedReceiver<WsCommand>) {
    while let Some(command) = commands.recv().await {
        match command {
            WsCommand::Frame(frame) => {
                if let Err(e) = write.send(frame).await {
                    debug!(error = %e, "websocket write failed");
                    break;
                }
            }
            WsCommand::Pong(data) => {
                if write.send(Message::Pong(data)).await.is_err() {
                    break;
                }
            }
            WsCommand::Close { code, reason } => {
                let frame = CloseFrame {
                    code: code.map_or(CloseCode::Normal, CloseCode::from),
                    reason: reason.unwrap_or_default().into(),
                };
                let _ = write.send(Message::Close(Some(frame))).await;
                break;
            }
        }
    }
}

async fn read_loop(
    mut read: WsStream,
    events: mpsc::UnboundedSender<TransportEvent>,
    commands: mpsc::UnboundedSender<WsCommand>,
    open: Arc<AtomicBool>,
) {
    let mut closed = false;

    while let Some(item) = read.next().await {
        match item {
            Ok(Message::Text(text)) => {
                let _ = events.send(TransportEvent::Message(RawMessage::Text(text)));
            }
            Ok(Message::Binary(data)) => {
                let _ = events.send(TransportEvent::Message(RawMessage::Binary(Bytes::from(
                    data,
                ))));
            }
            Ok(Message::Ping(data)) => {
                let _ = commands.send(WsCommand::Pong(data));
            }
            Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => {}
            Ok(Message::Close(frame)) => {
                trace!("received close frame");
                let (code, reason) = match frame {
                    Some(f) => (
                        Some(u16::from(f.code)),
                        (!f.reason.is_empty()).then(|| f.reason.to_string()),
                    ),
                    None => (None, None),
                };
                let _ = events.send(TransportEvent::Closed { code, reason });
                closed = true;
                break;
            }
            Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => {
                let _ = events.send(TransportEvent::Closed {
                    code: None,
                    reason: None,
                });
                closed = true;
                break;
            }
            Err(e) => {
                warn!(error = %e, "websocket error");
                let reason = e.to_string();
                let _ = events.send(TransportEvent::Error(reason.clone()));
                let _ = events.send(TransportEvent::Closed {
                    code: None,
                    reason: Some(reason),
                });
                closed = true;
                break;
            }
        }
    }

    if !closed {
        let _ = events.send(TransportEvent::Closed {
            code: None,
            reason: None,
        });
    }
    open.store(false, Ordering::SeqCst);
}
