//! # beacon-client
//!
//! Resilient realtime pub/sub channel client.
//!
//! One [`Socket`] holds one multiplexed connection to a server over a
//! negotiated transport (websocket or HTTP long-poll). Any number of
//! [`Channel`]s — named topic subscriptions with independent join/leave
//! lifecycles — share that connection. Every outbound event is a [`Push`]
//! that can await one correlated reply; transient network failure is
//! recovered automatically through escalating backoff, and channels rejoin
//! on reconnect.
//!
//! ## Example
//!
//! ```rust,no_run
//! use beacon_client::{Socket, SocketConfig};
//! use serde_json::json;
//!
//! # async fn run() -> Result<(), beacon_client::ChannelError> {
//! let socket = Socket::new("ws://localhost:4000/socket", SocketConfig::default());
//! socket.connect();
//!
//! let channel = socket.channel("room:lobby", json!({"name": "sam"}));
//! channel.on("new_msg", |payload, _ref| {
//!     println!("message: {payload}");
//! });
//!
//! channel
//!     .join(None)?
//!     .receive("ok", |_| println!("joined"))
//!     .receive("error", |reason| println!("rejected: {reason}"));
//!
//! channel.push("new_msg", json!({"body": "hello"}))?
//!     .receive("ok", |_| println!("acknowledged"));
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────┐ push ┌─────────┐ send ┌──────────┐ encode ┌────────────┐
//! │  Push   │─────▶│ Channel │─────▶│  Socket  │───────▶│ Transport  │
//! └─────────┘      └─────────┘      └──────────┘        └────────────┘
//!      ▲                ▲            route by topic           │
//!      └── reply hooks ─┴──────── decode ◀────────────────────┘
//! ```

pub mod channel;
pub mod config;
pub mod push;
pub mod socket;
pub mod timer;

pub use channel::{BindingCallback, Channel, ChannelError, ChannelState};
pub use config::{
    default_reconnect_after, default_rejoin_after, DelayFn, ParamsFn, SocketConfig,
};
pub use push::{Push, ReceiveCallback};
pub use socket::{Socket, SocketState};
pub use timer::BackoffTimer;

pub use beacon_protocol as protocol;
pub use beacon_transport as transport;
