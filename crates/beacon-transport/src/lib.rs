//! # beacon-transport
//!
//! Transport abstraction layer for the Beacon realtime client.
//!
//! This crate provides a unified client-side interface over the two wire
//! transports:
//!
//! - **WebSocket** - persistent duplex connection (the default)
//! - **HTTP long-poll** - duplex stream simulated over request/response
//!   cycles, for environments where websockets are unavailable
//!
//! Both implement the [`Transport`] trait and report the same lifecycle
//! contract to their owner: `Open` at most once, then `Message`/`Error`
//! events, then `Closed` exactly once.
//!
//! ```rust,no_run
//! use beacon_transport::{Transport, TransportEvent, WebSocketTransport};
//!
//! # async fn run() -> Result<(), beacon_transport::TransportError> {
//! let transport = WebSocketTransport::default();
//! let (sender, mut events) = transport.connect("ws://localhost:4000/socket").await?;
//!
//! while let Some(event) = events.recv().await {
//!     match event {
//!         TransportEvent::Message(raw) => { /* decode and route */ }
//!         TransportEvent::Closed { .. } => break,
//!         _ => {}
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod ajax;
pub mod longpoll;
pub mod traits;
pub mod websocket;

pub use longpoll::{LongPollConfig, LongPollTransport};
pub use traits::{
    Transport, TransportError, TransportEvent, TransportKind, TransportReceiver, TransportSender,
};
pub use websocket::{Framing, WebSocketTransport};
