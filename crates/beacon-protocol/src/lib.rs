//! # beacon-protocol
//!
//! Wire protocol definitions for the Beacon realtime channel client.
//!
//! Every frame exchanged with the server is an [`Envelope`]: the ordered
//! 5-tuple `[join_ref, ref, topic, event, payload]`. Envelopes multiplex any
//! number of topic channels over a single connection; the two references
//! correlate replies and distinguish frames of superseded join attempts.
//!
//! ## Serializers
//!
//! - [`JsonSerializer`] - JSON array text frames (the default)
//! - [`MessagePackSerializer`] - the same array as MessagePack binary frames
//!
//! ## Example
//!
//! ```rust
//! use beacon_protocol::{codec, Envelope};
//! use serde_json::json;
//!
//! let envelope = Envelope::new(
//!     Some("1".into()),
//!     Some("2".into()),
//!     "room:lobby",
//!     "new_msg",
//!     json!({"body": "hi"}),
//! );
//!
//! let encoded = codec::encode(&envelope).unwrap();
//! let decoded = codec::decode(&encoded).unwrap();
//! assert_eq!(decoded, envelope);
//! ```

pub mod codec;
pub mod envelope;
pub mod version;

pub use codec::{
    decode, encode, JsonSerializer, MessagePackSerializer, ProtocolError, RawMessage, Serializer,
};
pub use envelope::{
    reply_event, ControlEvent, Envelope, Reply, HEARTBEAT_EVENT, HEARTBEAT_TOPIC,
};
pub use version::{VERSION_PARAM, WIRE_VERSION};
