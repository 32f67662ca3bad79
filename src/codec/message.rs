//! Wire envelopes and the frame codec.
//!
//! ```text
//! outbound  { "type": "method", "id": 7, "method": "livesubscribe", "params": {..}, "discard"?: true }
//! inbound   { "type": "event",  "event": "hello", "data": {..} }
//!           { "type": "reply",  "id": 7, "result": .., "error": {"code": .., "message": ..} }
//! ```
//!
//! Text frames carry the JSON directly; binary frames carry it gzip-compressed.

use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use super::compression::{CompressionDecision, CompressionError, Compressor};
use crate::core::{DEFAULT_MAX_MESSAGE_SIZE, MESSAGE_TYPE_METHOD, MessageParseError, ServerError};
use crate::transport::Frame;

/// Borrowed view of an outbound call, ready to be framed.
#[derive(Debug, Clone, Copy)]
pub struct OutboundMessage<'a> {
    /// Correlation identity.
    pub id: u64,
    /// Remote method name.
    pub method: &'a str,
    /// Call parameters.
    pub params: &'a Value,
    /// Ask the server not to reply.
    pub discard: bool,
}

#[derive(Serialize)]
struct MethodEnvelope<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    id: u64,
    method: &'a str,
    params: &'a Value,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    discard: bool,
}

/// A decoded inbound message.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Incoming {
    /// Server-pushed event.
    Event(ServerEvent),
    /// Reply to one of our calls.
    Reply(Reply),
}

/// Server-pushed event.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ServerEvent {
    /// Event name.
    pub event: String,
    /// Event payload.
    #[serde(default)]
    pub data: Value,
}

/// Reply to a call.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Reply {
    /// Identity of the call being answered.
    pub id: u64,
    /// Result, if the call succeeded.
    #[serde(default)]
    pub result: Option<Value>,
    /// Server-reported failure; takes precedence over `result`.
    #[serde(default)]
    pub error: Option<ServerError>,
}

impl Reply {
    /// Split the reply into the call's outcome.
    pub fn into_outcome(self) -> Result<Value, ServerError> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

/// Frames outbound calls and classifies inbound frames.
#[derive(Clone)]
pub struct MessageCodec {
    decision: Option<Arc<dyn CompressionDecision>>,
    compressor: Compressor,
    max_message_size: usize,
}

impl fmt::Debug for MessageCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageCodec")
            .field("decision", &self.decision)
            .field("max_message_size", &self.max_message_size)
            .finish_non_exhaustive()
    }
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new(None, DEFAULT_MAX_MESSAGE_SIZE)
    }
}

impl MessageCodec {
    /// Create a codec. `decision` of `None` never compresses.
    pub fn new(decision: Option<Arc<dyn CompressionDecision>>, max_message_size: usize) -> Self {
        Self {
            decision,
            compressor: Compressor::new(),
            max_message_size,
        }
    }

    /// Set the gzip level for outbound frames, clamped to 9.
    #[must_use]
    pub fn with_compression_level(mut self, level: u32) -> Self {
        self.compressor.set_level(level);
        self
    }

    /// Gzip level for outbound frames.
    pub fn compression_level(&self) -> u32 {
        self.compressor.level()
    }

    /// Whether outbound frames may be compressed.
    pub fn compression_enabled(&self) -> bool {
        self.decision.is_some()
    }

    /// Frame an outbound call.
    ///
    /// Falls back to a text frame if gzip fails.
    pub fn encode(&self, message: &OutboundMessage<'_>) -> Result<Frame, serde_json::Error> {
        let envelope = MethodEnvelope {
            kind: MESSAGE_TYPE_METHOD,
            id: message.id,
            method: message.method,
            params: message.params,
            discard: message.discard,
        };
        let encoded = serde_json::to_string(&envelope)?;

        let compress = self
            .decision
            .as_ref()
            .is_some_and(|decision| decision.should_compress(encoded.as_bytes(), message.params));
        if compress {
            match self.compressor.compress(encoded.as_bytes()) {
                Ok(data) => return Ok(Frame::Binary(data)),
                Err(e) => warn!(id = message.id, error = %e, "Compression failed, sending text"),
            }
        }

        Ok(Frame::Text(encoded))
    }

    /// Decode and classify an inbound frame.
    pub fn decode(&self, frame: &Frame) -> Result<Incoming, MessageParseError> {
        let text = frame_text(&self.compressor, frame, self.max_message_size)?;
        Ok(serde_json::from_str(&text)?)
    }
}

/// Decode any frame to JSON without classifying it.
pub fn decode_json(frame: &Frame, max_message_size: usize) -> Result<Value, MessageParseError> {
    let text = frame_text(&Compressor::new(), frame, max_message_size)?;
    Ok(serde_json::from_str(&text)?)
}

fn frame_text<'a>(
    compressor: &Compressor,
    frame: &'a Frame,
    max_message_size: usize,
) -> Result<Cow<'a, str>, MessageParseError> {
    match frame {
        Frame::Text(text) => Ok(Cow::Borrowed(text)),
        Frame::Binary(data) => {
            let inflated = compressor
                .decompress(data, max_message_size)
                .map_err(|e| match e {
                    CompressionError::SizeExceeded { size, limit } => {
                        MessageParseError::TooLarge { size, limit }
                    }
                    other => MessageParseError::Decompression(other.to_string()),
                })?;
            String::from_utf8(inflated)
                .map(Cow::Owned)
                .map_err(|_| MessageParseError::Utf8)
        }
    }
}
