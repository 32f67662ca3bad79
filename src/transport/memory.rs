//! In-process transport.
//!
//! [`MemoryConnector`] hands every connection attempt to a [`MemoryPeer`] that
//! plays the server: it sees the handshake, reads the client's frames and can
//! push events, replies, raw frames or a close back. Useful for tests and for
//! embedding a client next to an in-process server.

use serde_json::{Value, json};
use tokio::sync::mpsc;

use super::error::{TransportError, TransportResult};
use super::socket::{Connector, Frame, Handshake, Transport, TransportEvent, TransportLink};
use crate::codec::decode_json;
use crate::core::{DEFAULT_MAX_MESSAGE_SIZE, HELLO_EVENT, MessageParseError};

/// Create a connector and the receiver on which each new peer is delivered.
pub fn channel() -> (MemoryConnector, mpsc::UnboundedReceiver<MemoryPeer>) {
    let (accept_tx, accept_rx) = mpsc::unbounded_channel();
    (MemoryConnector { accept_tx }, accept_rx)
}

/// Connector producing in-memory transports.
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    accept_tx: mpsc::UnboundedSender<MemoryPeer>,
}

impl Connector for MemoryConnector {
    fn connect(&self, handshake: &Handshake) -> TransportLink {
        let (to_peer_tx, to_peer_rx) = mpsc::unbounded_channel();
        let (to_client_tx, to_client_rx) = mpsc::unbounded_channel();

        let peer = MemoryPeer {
            handshake: handshake.clone(),
            frames: to_peer_rx,
            events: to_client_tx.clone(),
        };

        // Nobody listening behaves like a refused connection.
        if self.accept_tx.send(peer).is_err() {
            let _ = to_client_tx.send(TransportEvent::Closed {
                code: None,
                reason: "connection refused".to_string(),
            });
        }

        let sink = MemorySink {
            to_peer: Some(to_peer_tx),
            loopback: to_client_tx,
        };
        TransportLink::new(Box::new(sink), to_client_rx)
    }
}

/// Client-side write half.
#[derive(Debug)]
struct MemorySink {
    to_peer: Option<mpsc::UnboundedSender<Frame>>,
    loopback: mpsc::UnboundedSender<TransportEvent>,
}

impl Transport for MemorySink {
    fn send(&mut self, frame: Frame) -> TransportResult<()> {
        let to_peer = self.to_peer.as_ref().ok_or(TransportError::Closed)?;
        to_peer.send(frame).map_err(|_| TransportError::Closed)
    }

    fn close(&mut self) {
        if self.to_peer.take().is_some() {
            let _ = self.loopback.send(TransportEvent::Closed {
                code: Some(1000),
                reason: "closed by client".to_string(),
            });
        }
    }
}

/// Server side of one in-memory connection.
#[derive(Debug)]
pub struct MemoryPeer {
    handshake: Handshake,
    frames: mpsc::UnboundedReceiver<Frame>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl MemoryPeer {
    /// Handshake the client connected with.
    pub fn handshake(&self) -> &Handshake {
        &self.handshake
    }

    /// Push a raw frame to the client.
    pub fn send_frame(&self, frame: Frame) -> TransportResult<()> {
        self.events
            .send(TransportEvent::Message(frame))
            .map_err(|_| TransportError::Closed)
    }

    /// Push a JSON value as a text frame.
    pub fn send_json(&self, value: &Value) -> TransportResult<()> {
        self.send_frame(Frame::Text(value.to_string()))
    }

    /// Push a server event.
    pub fn event(&self, name: &str, data: Value) -> TransportResult<()> {
        self.send_json(&json!({ "type": "event", "event": name, "data": data }))
    }

    /// Push the hello event that marks the socket ready.
    pub fn hello(&self) -> TransportResult<()> {
        self.event(HELLO_EVENT, json!({ "authenticated": false }))
    }

    /// Push a successful reply.
    pub fn reply(&self, id: u64, result: Value) -> TransportResult<()> {
        self.send_json(&json!({ "type": "reply", "id": id, "result": result, "error": null }))
    }

    /// Push a failed reply.
    pub fn reply_error(&self, id: u64, code: i64, message: &str) -> TransportResult<()> {
        self.send_json(&json!({
            "type": "reply",
            "id": id,
            "result": null,
            "error": { "code": code, "message": message },
        }))
    }

    /// Next frame written by the client, or `None` once the client side closed.
    pub async fn recv_frame(&mut self) -> Option<Frame> {
        self.frames.recv().await
    }

    /// Next frame written by the client, decompressed and parsed.
    pub async fn recv_json(&mut self) -> Option<Result<Value, MessageParseError>> {
        let frame = self.frames.recv().await?;
        Some(decode_json(&frame, DEFAULT_MAX_MESSAGE_SIZE))
    }

    /// Frame already written by the client, without waiting.
    pub fn try_recv_frame(&mut self) -> Option<Frame> {
        self.frames.try_recv().ok()
    }

    /// Close the connection from the server side (abnormal closure).
    pub fn close(self) {
        let _ = self.events.send(TransportEvent::Closed {
            code: Some(1006),
            reason: "closed by server".to_string(),
        });
    }
}
