//! WebSocket transport.
//!
//! Each [`WebSocketConnector::connect`] spawns one task that opens the socket
//! and then pumps frames both ways until either side closes. The handshake's
//! sub-protocol goes out as `Sec-WebSocket-Protocol`; its headers are copied
//! onto the upgrade request as-is.

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, trace, warn};

use super::error::{TransportError, TransportResult};
use super::socket::{Connector, Frame, Handshake, Transport, TransportEvent, TransportLink};

const HEADER_PROTOCOL: &str = "sec-websocket-protocol";

/// Connector opening real WebSocket connections.
///
/// `wss://` endpoints need the `rustls` or `native-tls` feature.
///
/// # Panics
///
/// [`Connector::connect`] spawns a task and panics outside a Tokio runtime.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketConnector;

impl WebSocketConnector {
    /// Create a connector.
    pub fn new() -> Self {
        Self
    }
}

impl Connector for WebSocketConnector {
    fn connect(&self, handshake: &Handshake) -> TransportLink {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        tokio::spawn(run_socket(handshake.clone(), commands_rx, events_tx));

        let sink = WebSocketSink {
            commands: Some(commands_tx),
        };
        TransportLink::new(Box::new(sink), events_rx)
    }
}

#[derive(Debug)]
enum SinkCommand {
    Frame(Frame),
    Close,
}

/// Write half handed to the connection state machine.
#[derive(Debug)]
struct WebSocketSink {
    commands: Option<mpsc::UnboundedSender<SinkCommand>>,
}

impl Transport for WebSocketSink {
    fn send(&mut self, frame: Frame) -> TransportResult<()> {
        let commands = self.commands.as_ref().ok_or(TransportError::Closed)?;
        commands
            .send(SinkCommand::Frame(frame))
            .map_err(|_| TransportError::Closed)
    }

    fn close(&mut self) {
        if let Some(commands) = self.commands.take() {
            let _ = commands.send(SinkCommand::Close);
        }
    }
}

async fn run_socket(
    handshake: Handshake,
    mut commands: mpsc::UnboundedReceiver<SinkCommand>,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    let closed = match pump(&handshake, &mut commands, &events).await {
        Ok(closed) => closed,
        Err(e) => {
            warn!(url = %handshake.url, error = %e, "WebSocket failed");
            TransportEvent::Closed {
                code: None,
                reason: e.to_string(),
            }
        }
    };
    let _ = events.send(closed);
}

/// Open the socket and move frames until it closes. Returns the close event.
async fn pump(
    handshake: &Handshake,
    commands: &mut mpsc::UnboundedReceiver<SinkCommand>,
    events: &mpsc::UnboundedSender<TransportEvent>,
) -> TransportResult<TransportEvent> {
    let request = upgrade_request(handshake)?;
    let (socket, _response) = tokio_tungstenite::connect_async(request)
        .await
        .map_err(|e| TransportError::Connect(e.to_string()))?;
    debug!(url = %handshake.url, protocol = handshake.protocol, "WebSocket open");

    let (mut write, mut read) = socket.split();

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(SinkCommand::Frame(frame)) => {
                    write
                        .send(to_message(frame))
                        .await
                        .map_err(|e| TransportError::Send(e.to_string()))?;
                }
                // Close requested, or the owner dropped the write half.
                Some(SinkCommand::Close) | None => {
                    let frame = CloseFrame {
                        code: CloseCode::Normal,
                        reason: "".into(),
                    };
                    if let Err(e) = write.send(Message::Close(Some(frame))).await {
                        debug!(error = %e, "Close frame not delivered");
                    }
                    return Ok(TransportEvent::Closed {
                        code: Some(CloseCode::Normal.into()),
                        reason: "closed by client".to_string(),
                    });
                }
            },
            message = read.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    let _ = events.send(TransportEvent::Message(Frame::Text(text.as_str().to_owned())));
                }
                Some(Ok(Message::Binary(data))) => {
                    let _ = events.send(TransportEvent::Message(Frame::Binary(data.to_vec())));
                }
                Some(Ok(Message::Close(frame))) => return Ok(close_event(frame)),
                // Pings are answered by tungstenite.
                Some(Ok(other)) => trace!(kind = ?other, "Ignoring control frame"),
                Some(Err(e)) => return Ok(error_event(&e)),
                None => return Ok(TransportEvent::dropped()),
            },
        }
    }
}

fn upgrade_request(handshake: &Handshake) -> TransportResult<Request> {
    let mut request = handshake
        .url
        .as_str()
        .into_client_request()
        .map_err(|e| TransportError::Connect(e.to_string()))?;

    let headers = request.headers_mut();
    headers.insert(
        HeaderName::from_static(HEADER_PROTOCOL),
        HeaderValue::from_static(handshake.protocol),
    );
    for (name, value) in &handshake.headers {
        let header = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| TransportError::Connect(format!("invalid header name {name}: {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| TransportError::Connect(format!("invalid value for {name}: {e}")))?;
        headers.insert(header, value);
    }

    Ok(request)
}

fn to_message(frame: Frame) -> Message {
    match frame {
        Frame::Text(text) => Message::text(text),
        Frame::Binary(data) => Message::binary(data),
    }
}

fn close_event(frame: Option<CloseFrame>) -> TransportEvent {
    match frame {
        Some(frame) => TransportEvent::Closed {
            code: Some(frame.code.into()),
            reason: frame.reason.as_str().to_owned(),
        },
        None => TransportEvent::Closed {
            code: None,
            reason: String::new(),
        },
    }
}

fn error_event(error: &tungstenite::Error) -> TransportEvent {
    TransportEvent::Closed {
        code: None,
        reason: error.to_string(),
    }
}
