//! Error types shared across the Carina layers.

use std::fmt;

use serde::Deserialize;
use thiserror::Error;

/// A method-level failure reported by the server in a reply's `error` field.
///
/// This is the `ConstellationError` of the protocol: the call reached the server
/// and was rejected there.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ServerError {
    /// Numeric error code assigned by the server.
    #[serde(default)]
    pub code: i64,
    /// Human-readable description.
    #[serde(default)]
    pub message: String,
    /// Optional path into the call parameters that caused the failure.
    #[serde(default)]
    pub path: Option<String>,
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "server error {}: {}", self.code, self.message)?;
        if let Some(path) = &self.path {
            write!(f, " (at {path})")?;
        }
        Ok(())
    }
}

impl std::error::Error for ServerError {}

/// A malformed inbound frame.
///
/// Never fatal to the connection: the frame is dropped and the error is
/// surfaced on the event stream.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MessageParseError {
    /// Binary frame could not be gunzipped.
    #[error("failed to decompress frame: {0}")]
    Decompression(String),

    /// Decompressed frame is not valid UTF-8.
    #[error("frame is not valid utf-8")]
    Utf8,

    /// Frame is not JSON, or carries an unknown/missing `type`.
    #[error("invalid message: {0}")]
    Json(String),

    /// Decompressed frame exceeds the configured limit.
    #[error("message size exceeded limit: {size} > {limit}")]
    TooLarge {
        /// Decompressed size observed (lower bound).
        size: usize,
        /// Maximum allowed size.
        limit: usize,
    },
}

impl From<serde_json::Error> for MessageParseError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json(err.to_string())
    }
}

/// Construction-time configuration errors. Fatal, never retried.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Both an OAuth token and a JWT were supplied.
    #[error("an OAuth token and a JWT are mutually exclusive")]
    ConflictingCredentials,

    /// No transport connector was configured.
    #[error("no transport connector configured")]
    MissingConnector,

    /// The endpoint URL could not be parsed.
    #[error("invalid url: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// The reconnection policy parameters are out of range.
    #[error("invalid reconnection policy: {0}")]
    InvalidReconnectionPolicy(String),
}
