//! Envelope types for the Beacon protocol.
//!
//! Every frame on the wire is one envelope: a 5-field record that ties a
//! payload to a topic, an event name, and up to two correlation references.
//! The envelope is the multiplexing unit that lets many channels share a
//! single connection.

use serde::de::{Deserialize, Deserializer};
use serde::ser::{Serialize, Serializer};
use serde_json::Value;

/// Reserved topic for connection-level keepalives.
pub const HEARTBEAT_TOPIC: &str = "phoenix";

/// Event name carried by keepalive envelopes.
pub const HEARTBEAT_EVENT: &str = "heartbeat";

/// Reserved lifecycle events.
///
/// These are handled by the channel state machine before any user binding
/// sees them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlEvent {
    /// Channel join request.
    Join,
    /// Channel leave request.
    Leave,
    /// Reply to a previously sent envelope.
    Reply,
    /// Server-initiated channel close.
    Close,
    /// Server-initiated channel error.
    Error,
}

impl ControlEvent {
    /// Get the wire name of the event.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ControlEvent::Join => "phx_join",
            ControlEvent::Leave => "phx_leave",
            ControlEvent::Reply => "phx_reply",
            ControlEvent::Close => "phx_close",
            ControlEvent::Error => "phx_error",
        }
    }

    /// Parse a wire event name into a control event, if it is one.
    #[must_use]
    pub fn from_event(event: &str) -> Option<Self> {
        match event {
            "phx_join" => Some(ControlEvent::Join),
            "phx_leave" => Some(ControlEvent::Leave),
            "phx_reply" => Some(ControlEvent::Reply),
            "phx_close" => Some(ControlEvent::Close),
            "phx_error" => Some(ControlEvent::Error),
            _ => None,
        }
    }

    /// Check whether an event name is one of the reserved lifecycle events.
    #[must_use]
    pub fn is_lifecycle(event: &str) -> bool {
        Self::from_event(event).is_some()
    }
}

impl std::fmt::Display for ControlEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Synthetic event name used to correlate a reply with the envelope that
/// requested it.
#[must_use]
pub fn reply_event(msg_ref: &str) -> String {
    format!("chan_reply_{msg_ref}")
}

/// A protocol envelope.
///
/// On the wire this is the ordered 5-tuple
/// `[join_ref, ref, topic, event, payload]`. `join_ref` and `ref` are
/// strings or null; null is distinct from the string `"null"`.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Reference of the join attempt this frame belongs to.
    pub join_ref: Option<String>,
    /// Reference used to correlate a reply, if one is expected.
    pub msg_ref: Option<String>,
    /// Topic the frame is addressed to.
    pub topic: String,
    /// Event name.
    pub event: String,
    /// Arbitrary JSON payload.
    pub payload: Value,
}

impl Envelope {
    /// Create a new envelope.
    #[must_use]
    pub fn new(
        join_ref: Option<String>,
        msg_ref: Option<String>,
        topic: impl Into<String>,
        event: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            join_ref,
            msg_ref,
            topic: topic.into(),
            event: event.into(),
            payload,
        }
    }

    /// Create a keepalive envelope on the reserved heartbeat topic.
    #[must_use]
    pub fn heartbeat(msg_ref: impl Into<String>) -> Self {
        Self {
            join_ref: None,
            msg_ref: Some(msg_ref.into()),
            topic: HEARTBEAT_TOPIC.to_string(),
            event: HEARTBEAT_EVENT.to_string(),
            payload: Value::Object(serde_json::Map::new()),
        }
    }

    /// Check whether this envelope is a reply.
    #[must_use]
    pub fn is_reply(&self) -> bool {
        self.event == ControlEvent::Reply.as_str()
    }
}

impl Serialize for Envelope {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        (
            &self.join_ref,
            &self.msg_ref,
            &self.topic,
            &self.event,
            &self.payload,
        )
            .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Envelope {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let (join_ref, msg_ref, topic, event, payload) =
            <(Option<String>, Option<String>, String, String, Value)>::deserialize(deserializer)?;
        Ok(Self {
            join_ref,
            msg_ref,
            topic,
            event,
            payload,
        })
    }
}

/// The payload of a reply envelope: a status string plus a response value.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Reply {
    /// Reply status, e.g. `"ok"`, `"error"`, `"timeout"`.
    pub status: String,
    /// Response value associated with the status.
    pub response: Value,
}

impl Reply {
    /// Create an `"ok"` reply.
    #[must_use]
    pub fn ok(response: Value) -> Self {
        Self {
            status: "ok".to_string(),
            response,
        }
    }

    /// Create an `"error"` reply.
    #[must_use]
    pub fn error(response: Value) -> Self {
        Self {
            status: "error".to_string(),
            response,
        }
    }

    /// Create the locally synthesized `"timeout"` reply.
    #[must_use]
    pub fn timeout() -> Self {
        Self {
            status: "timeout".to_string(),
            response: Value::Object(serde_json::Map::new()),
        }
    }

    /// Parse a reply out of an envelope payload.
    ///
    /// Returns `None` when the payload does not carry a status string.
    #[must_use]
    pub fn from_payload(payload: &Value) -> Option<Self> {
        let status = payload.get("status")?.as_str()?.to_string();
        let response = payload
            .get("response")
            .cloned()
            .unwrap_or_else(|| Value::Object(serde_json::Map::new()));
        Some(Self { status, response })
    }

    /// Convert the reply back into an envelope payload.
    #[must_use]
    pub fn into_payload(self) -> Value {
        serde_json::json!({ "status": self.status, "response": self.response })
    }
}
