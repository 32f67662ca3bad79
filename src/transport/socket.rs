//! The seam between the connection state machine and a concrete socket.
//!
//! A [`Connector`] opens one bidirectional message stream per handshake and
//! hands back a [`TransportLink`]: a write half implementing [`Transport`] and a
//! channel of [`TransportEvent`]s. Opening never blocks; a failed connection
//! attempt is reported as [`TransportEvent::Closed`], exactly like a socket that
//! closed right after being opened.

use std::fmt;

use tokio::sync::mpsc;
use url::Url;

use super::error::TransportResult;

/// A single message on the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Textual frame, parsed directly as JSON.
    Text(String),
    /// Binary frame, gzip-compressed JSON.
    Binary(Vec<u8>),
}

impl Frame {
    /// Get the frame length in bytes.
    pub fn len(&self) -> usize {
        match self {
            Frame::Text(text) => text.len(),
            Frame::Binary(data) => data.len(),
        }
    }

    /// Check if the frame carries no bytes.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Check if this is a binary (compressed) frame.
    pub fn is_binary(&self) -> bool {
        matches!(self, Frame::Binary(_))
    }
}

/// Events delivered by a transport to its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A frame arrived from the peer.
    Message(Frame),
    /// The stream is gone, whoever closed it.
    Closed {
        /// Close code, if the peer sent one.
        code: Option<u16>,
        /// Close reason, possibly empty.
        reason: String,
    },
}

impl TransportEvent {
    /// Closed event used when the event channel ends without an explicit close.
    pub(crate) fn dropped() -> Self {
        TransportEvent::Closed {
            code: None,
            reason: "transport dropped".to_string(),
        }
    }
}

/// Write half of an open transport.
pub trait Transport: Send {
    /// Hand a frame to the socket.
    fn send(&mut self, frame: Frame) -> TransportResult<()>;

    /// Begin closing the socket.
    ///
    /// Implementations MUST eventually report [`TransportEvent::Closed`] (or end
    /// the event channel) once the close has completed.
    fn close(&mut self);
}

/// An open transport: its write half plus the stream of events it produces.
pub struct TransportLink {
    /// Write half.
    pub sink: Box<dyn Transport>,
    /// Inbound frames and the final close notification.
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

impl TransportLink {
    /// Bundle a write half with its event channel.
    pub fn new(sink: Box<dyn Transport>, events: mpsc::UnboundedReceiver<TransportEvent>) -> Self {
        Self { sink, events }
    }
}

impl fmt::Debug for TransportLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportLink").finish_non_exhaustive()
    }
}

/// Factory for transports. Required by the client configuration.
pub trait Connector: Send + Sync {
    /// Start opening a transport for the given handshake.
    fn connect(&self, handshake: &Handshake) -> TransportLink;
}

/// Everything a connector needs to open the socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    /// Endpoint, including any credential query parameter.
    pub url: Url,
    /// Sub-protocol identifier (`cnstl` or `cnstl-gzip`).
    pub protocol: &'static str,
    /// Request headers, in insertion order.
    pub headers: Vec<(String, String)>,
}

impl Handshake {
    /// Create a handshake with no headers.
    pub fn new(url: Url, protocol: &'static str) -> Self {
        Self {
            url,
            protocol,
            headers: Vec::new(),
        }
    }

    /// Append a header.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Look up a header value by case-insensitive name.
    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}
