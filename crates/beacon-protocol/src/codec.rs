//! Serializers for encoding and decoding Beacon envelopes.
//!
//! The text serializer writes the envelope as a JSON array; the binary
//! serializer writes the same 5-element array as MessagePack. Both are exact
//! inverses for any JSON-serializable payload.

use bytes::Bytes;
use thiserror::Error;

use crate::envelope::Envelope;

/// Maximum encoded frame size (1 MiB).
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum size.
    #[error("Frame size {0} exceeds maximum {MAX_FRAME_SIZE}")]
    FrameTooLarge(usize),

    /// JSON codec error.
    #[error("JSON codec error: {0}")]
    Json(#[from] serde_json::Error),

    /// MessagePack encoding error.
    #[error("MessagePack encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// MessagePack decoding error.
    #[error("MessagePack decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// Frame kind does not match the serializer.
    #[error("Framing mismatch: expected a {expected} frame")]
    Framing {
        /// The frame kind the serializer accepts.
        expected: &'static str,
    },
}

/// A raw frame as it appears on the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum RawMessage {
    /// Text frame.
    Text(String),
    /// Binary frame.
    Binary(Bytes),
}

impl RawMessage {
    /// Get the frame length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            RawMessage::Text(s) => s.len(),
            RawMessage::Binary(b) => b.len(),
        }
    }

    /// Check whether the frame is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// An envelope codec.
///
/// Implementations form a closed set selected once at connection
/// construction: envelopes are never encoded differently at different call
/// sites of the same connection.
pub trait Serializer: Send + Sync {
    /// Encode an envelope to a raw frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the envelope is too large or encoding fails.
    fn encode(&self, envelope: &Envelope) -> Result<RawMessage, ProtocolError>;

    /// Decode a raw frame to an envelope.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame kind does not match or decoding fails.
    fn decode(&self, raw: &RawMessage) -> Result<Envelope, ProtocolError>;

    /// Whether this serializer produces binary frames.
    fn is_binary(&self) -> bool;

    /// Get the serializer name (e.g. "json", "msgpack").
    fn name(&self) -> &'static str;
}

/// JSON text serializer (the default wire format).
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn encode(&self, envelope: &Envelope) -> Result<RawMessage, ProtocolError> {
        let text = serde_json::to_string(envelope)?;
        if text.len() > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge(text.len()));
        }
        Ok(RawMessage::Text(text))
    }

    fn decode(&self, raw: &RawMessage) -> Result<Envelope, ProtocolError> {
        match raw {
            RawMessage::Text(text) => Ok(serde_json::from_str(text)?),
            RawMessage::Binary(_) => Err(ProtocolError::Framing { expected: "text" }),
        }
    }

    fn is_binary(&self) -> bool {
        false
    }

    fn name(&self) -> &'static str {
        "json"
    }
}

/// MessagePack binary serializer.
#[derive(Debug, Clone, Copy, Default)]
pub struct MessagePackSerializer;

impl Serializer for MessagePackSerializer {
    fn encode(&self, envelope: &Envelope) -> Result<RawMessage, ProtocolError> {
        let payload = rmp_serde::to_vec(envelope)?;
        if payload.len() > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge(payload.len()));
        }
        Ok(RawMessage::Binary(Bytes::from(payload)))
    }

    fn decode(&self, raw: &RawMessage) -> Result<Envelope, ProtocolError> {
        match raw {
            RawMessage::Binary(data) => Ok(rmp_serde::from_slice(data)?),
            RawMessage::Text(_) => Err(ProtocolError::Framing { expected: "binary" }),
        }
    }

    fn is_binary(&self) -> bool {
        true
    }

    fn name(&self) -> &'static str {
        "msgpack"
    }
}

/// Encode an envelope with the default JSON serializer.
///
/// # Errors
///
/// Returns an error if encoding fails.
pub fn encode(envelope: &Envelope) -> Result<RawMessage, ProtocolError> {
    JsonSerializer.encode(envelope)
}

/// Decode a raw frame with the default JSON serializer.
///
/// # Errors
///
/// Returns an error if decoding fails.
pub fn decode(raw: &RawMessage) -> Result<Envelope, ProtocolError> {
    JsonSerializer.decode(raw)
}
