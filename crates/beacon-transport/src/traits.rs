//! Transport abstraction traits for Beacon.
//!
//! These traits define the interface every transport implementation must
//! provide, allowing the connection layer to be transport-agnostic. A
//! transport instance is used for exactly one connection attempt; reconnects
//! construct a fresh instance.

use async_trait::async_trait;
use beacon_protocol::RawMessage;
use thiserror::Error;
use tokio::sync::mpsc;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Failed to establish the connection.
    #[error("Connect failed: {0}")]
    ConnectFailed(String),

    /// The transport is not open.
    #[error("Transport is not open")]
    NotOpen,

    /// Failed to send a frame.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// A request timed out.
    #[error("Request timed out")]
    Timeout,

    /// HTTP error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Protocol error.
    #[error("Protocol error: {0}")]
    Protocol(#[from] beacon_protocol::ProtocolError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// Lifecycle events reported by a transport to its owner.
///
/// Contract: `Open` is delivered at most once, first; `Closed` is delivered
/// exactly once, last, on every shutdown path; `Message` and `Error` may be
/// delivered any number of times in between.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// The connection is established and ready to send.
    Open,
    /// A raw frame arrived.
    Message(RawMessage),
    /// A recoverable error occurred. Not authoritative for shutdown; wait
    /// for `Closed`.
    Error(String),
    /// The connection is gone.
    Closed {
        /// Close code, if the peer supplied one.
        code: Option<u16>,
        /// Close reason, if any.
        reason: Option<String>,
    },
}

/// Receiving half of a transport: a stream of [`TransportEvent`]s.
pub type TransportReceiver = mpsc::UnboundedReceiver<TransportEvent>;

/// Sending half of a transport.
///
/// `send` and `close` enqueue; delivery is asynchronous and in call order.
pub trait TransportSender: Send + Sync {
    /// Enqueue a frame for transmission.
    ///
    /// Valid only after the `Open` event has been delivered.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport is not open.
    fn send(&self, msg: RawMessage) -> Result<(), TransportError>;

    /// Close the transport.
    ///
    /// Idempotent; the `Closed` event is always eventually delivered exactly
    /// once.
    ///
    /// # Errors
    ///
    /// Returns an error if the close could not be initiated.
    fn close(&self, code: Option<u16>, reason: Option<String>) -> Result<(), TransportError>;

    /// Check whether the transport is still open.
    fn is_open(&self) -> bool;
}

/// A client transport.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connect to the given endpoint.
    ///
    /// Returns the sending half and the event stream.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established.
    async fn connect(
        &self,
        url: &str,
    ) -> Result<(Box<dyn TransportSender>, TransportReceiver), TransportError>;

    /// Get the transport name (e.g. "websocket", "longpoll").
    fn name(&self) -> &'static str;
}

/// The closed set of transport variants.
///
/// Selected once at connection construction, never at call sites.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportKind {
    /// Persistent duplex websocket connection.
    #[default]
    WebSocket,
    /// Duplex stream simulated over repeated HTTP request/response cycles.
    LongPoll,
}

impl TransportKind {
    /// Get the transport name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            TransportKind::WebSocket => "websocket",
            TransportKind::LongPoll => "longpoll",
        }
    }
}
