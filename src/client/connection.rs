//! Connection state machine.
//!
//! A single task owns the transport, the outbound queue and the correlator.
//! Client handles talk to it through a command channel; it publishes its state
//! on a `watch` channel and everything else on a `broadcast` channel.
//!
//! ```text
//!            connect()                hello
//!   Idle ──────────────▶ Connecting ─────────▶ Connected
//!    ▲                    ▲    │                  │
//!    │                    │    └── closed ──┐     │ closed
//!    │                    └── backoff ◀─────┴─────┘ (auto-reconnect)
//!    │        closed
//!    └──────────────── Closing ◀── close() (from any state)
//! ```

use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Sleep;
use tracing::{debug, error, info, trace, warn};

use super::correlator::{ReplyOutcome, RequestCorrelator};
use super::packet::{OutboundQueue, Packet, PacketId, PacketState};
use crate::codec::{Incoming, MessageCodec};
use crate::core::{HELLO_EVENT, MessageParseError};
use crate::transport::{
    Connector, Frame, Handshake, ReconnectionPolicy, TransportEvent, TransportLink,
};

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// No transport and none scheduled.
    Idle,
    /// A transport is opening, or a reconnect is scheduled.
    Connecting,
    /// The server said hello; packets flow.
    Connected,
    /// `close()` was called and the transport is shutting down.
    Closing,
}

/// Events published to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// The socket is ready (the server's hello arrived).
    Open,
    /// The transport closed.
    Close {
        /// Close code, if any.
        code: Option<u16>,
        /// Close reason, possibly empty.
        reason: String,
    },
    /// A server-pushed event, including `hello`.
    Event {
        /// Event name.
        name: String,
        /// Event payload.
        data: Value,
    },
    /// An inbound frame could not be parsed and was dropped.
    ParseError(MessageParseError),
}

pub(crate) enum Command {
    Connect,
    Close {
        done: oneshot::Sender<()>,
    },
    Enqueue {
        packet: Packet,
        waiter: Option<oneshot::Sender<ReplyOutcome>>,
    },
    /// The caller settled or gave up; stop tracking the packet.
    Forget(PacketId),
}

/// Parts of the configuration the connection task owns.
pub(crate) struct ConnectionSettings {
    pub handshake: Handshake,
    pub connector: Arc<dyn Connector>,
    pub policy: Box<dyn ReconnectionPolicy>,
    pub codec: MessageCodec,
    pub auto_reconnect: bool,
}

pub(crate) struct Connection {
    settings: ConnectionSettings,
    commands: mpsc::UnboundedReceiver<Command>,
    state: watch::Sender<ConnectionState>,
    events: broadcast::Sender<ClientEvent>,
    queue: OutboundQueue,
    correlator: RequestCorrelator,
    link: Option<TransportLink>,
    reconnect: Option<Pin<Box<Sleep>>>,
}

impl Connection {
    pub(crate) fn new(
        settings: ConnectionSettings,
        commands: mpsc::UnboundedReceiver<Command>,
        state: watch::Sender<ConnectionState>,
        events: broadcast::Sender<ClientEvent>,
    ) -> Self {
        Self {
            settings,
            commands,
            state,
            events,
            queue: OutboundQueue::new(),
            correlator: RequestCorrelator::new(),
            link: None,
            reconnect: None,
        }
    }

    /// Run until every client handle is gone.
    pub(crate) async fn run(mut self) {
        debug!("Connection task started");

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                event = next_event(&mut self.link) => self.handle_transport_event(event),
                () = reconnect_timer(&mut self.reconnect) => {
                    self.reconnect = None;
                    self.open_transport();
                }
            }
        }

        self.shutdown();
        debug!("Connection task stopped");
    }

    fn current_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn set_state(&self, next: ConnectionState) {
        let previous = self.current_state();
        let changed = self.state.send_if_modified(|state| {
            if *state == next {
                false
            } else {
                *state = next;
                true
            }
        });
        if changed {
            debug!(?previous, ?next, "Connection state changed");
        }
    }

    fn publish(&self, event: ClientEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect => self.connect(),
            Command::Close { done } => {
                self.close();
                let _ = done.send(());
            }
            Command::Enqueue { packet, waiter } => self.enqueue(packet, waiter),
            Command::Forget(id) => {
                self.queue.remove(id);
                self.correlator.forget(id);
            }
        }
    }

    fn connect(&mut self) {
        match self.current_state() {
            ConnectionState::Idle | ConnectionState::Closing => self.open_transport(),
            state => debug!(?state, "Already connecting, connect() ignored"),
        }
    }

    fn open_transport(&mut self) {
        self.reconnect = None;
        if let Some(mut stale) = self.link.take() {
            stale.sink.close();
        }

        let handshake = &self.settings.handshake;
        info!(
            host = handshake.url.host_str().unwrap_or_default(),
            protocol = handshake.protocol,
            "Connecting"
        );
        self.set_state(ConnectionState::Connecting);
        self.link = Some(self.settings.connector.connect(handshake));
    }

    fn close(&mut self) {
        let previous = self.current_state();
        self.set_state(ConnectionState::Closing);

        match self.link.as_mut() {
            Some(link) => link.sink.close(),
            None => self.set_state(ConnectionState::Idle),
        }
        self.reconnect = None;

        let cancelled = self.cancel_all();
        info!(?previous, cancelled, "Closing connection");
    }

    fn cancel_all(&mut self) -> usize {
        let packets = self.queue.drain();
        for packet in &packets {
            packet.cancel();
        }
        self.correlator.clear();
        packets.len()
    }

    fn enqueue(&mut self, packet: Packet, waiter: Option<oneshot::Sender<ReplyOutcome>>) {
        if packet.is_cancelled() {
            return;
        }

        let id = packet.id();
        if let Some(waiter) = waiter {
            self.correlator.register(id, waiter);
        }
        self.queue.insert(packet.clone());

        if self.current_state() == ConnectionState::Connected {
            self.transmit(&packet);
        } else {
            debug!(%id, method = packet.method_name(), "Queued until connected");
        }
    }

    fn transmit(&mut self, packet: &Packet) {
        if packet.state() != PacketState::Pending {
            return;
        }
        let id = packet.id();

        let frame = match self.settings.codec.encode(&packet.outbound()) {
            Ok(frame) => frame,
            Err(e) => {
                error!(%id, error = %e, "Failed to encode packet, cancelling");
                packet.cancel();
                self.queue.remove(id);
                self.correlator.forget(id);
                return;
            }
        };

        let Some(link) = self.link.as_mut() else {
            return;
        };
        let size = frame.len();
        let compressed = matches!(frame, Frame::Binary(_));

        match link.sink.send(frame) {
            Ok(()) => {
                trace!(%id, size, compressed, "Packet transmitted");
                if !packet.mark_sending() {
                    return;
                }
                if !packet.expects_reply() {
                    self.queue.remove(id);
                }
            }
            Err(e) => warn!(%id, error = %e, "Transport rejected packet, keeping it queued"),
        }
    }

    fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Message(frame) => self.handle_frame(&frame),
            TransportEvent::Closed { code, reason } => self.handle_closed(code, reason),
        }
    }

    fn handle_frame(&mut self, frame: &Frame) {
        match self.settings.codec.decode(frame) {
            Ok(Incoming::Event(event)) => {
                if event.event == HELLO_EVENT {
                    self.handle_hello();
                }
                self.publish(ClientEvent::Event {
                    name: event.event,
                    data: event.data,
                });
            }
            Ok(Incoming::Reply(reply)) => {
                let id = PacketId::from(reply.id);
                if !self.correlator.resolve(reply) {
                    debug!(%id, "Discarding reply nobody is waiting for");
                }
                self.queue.remove(id);
            }
            Err(e) => {
                warn!(error = %e, size = frame.len(), "Dropping malformed frame");
                self.publish(ClientEvent::ParseError(e));
            }
        }
    }

    fn handle_hello(&mut self) {
        let state = self.current_state();
        if state != ConnectionState::Connecting {
            debug!(?state, "Ignoring hello");
            return;
        }

        self.set_state(ConnectionState::Connected);
        self.settings.policy.reset();
        self.publish(ClientEvent::Open);

        let pending = self.queue.pending();
        info!(queued = pending.len(), "Connected");
        for packet in &pending {
            self.transmit(packet);
        }
    }

    fn handle_closed(&mut self, code: Option<u16>, reason: String) {
        self.link = None;
        let in_flight = self.queue.reset_in_flight();
        self.publish(ClientEvent::Close {
            code,
            reason: reason.clone(),
        });

        let state = self.current_state();
        if state == ConnectionState::Closing || !self.settings.auto_reconnect {
            info!(?code, %reason, "Connection closed");
            self.set_state(ConnectionState::Idle);
            return;
        }

        let delay = self.settings.policy.next();
        warn!(
            ?code,
            %reason,
            in_flight,
            delay_ms = delay.as_millis() as u64,
            "Connection lost, reconnecting"
        );
        self.set_state(ConnectionState::Connecting);
        self.reconnect = Some(Box::pin(tokio::time::sleep(delay)));
    }

    fn shutdown(&mut self) {
        if let Some(mut link) = self.link.take() {
            link.sink.close();
        }
        self.reconnect = None;
        self.cancel_all();
        self.set_state(ConnectionState::Idle);
    }
}

async fn next_event(link: &mut Option<TransportLink>) -> TransportEvent {
    match link {
        // An event channel that ends without a close counts as one.
        Some(link) => link
            .events
            .recv()
            .await
            .unwrap_or_else(TransportEvent::dropped),
        None => std::future::pending().await,
    }
}

async fn reconnect_timer(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::PROTOCOL_PLAIN;
    use crate::transport::ExponentialReconnectionPolicy;
    use crate::transport::memory::{self, MemoryPeer};
    use url::Url;

    struct Harness {
        connection: Connection,
        accept: mpsc::UnboundedReceiver<MemoryPeer>,
        events: broadcast::Receiver<ClientEvent>,
        _state: watch::Receiver<ConnectionState>,
        _commands: mpsc::UnboundedSender<Command>,
    }

    fn harness() -> Harness {
        let (connector, accept) = memory::channel();
        let settings = ConnectionSettings {
            handshake: Handshake::new(Url::parse("wss://example.com/").unwrap(), PROTOCOL_PLAIN),
            connector: Arc::new(connector),
            policy: Box::new(ExponentialReconnectionPolicy::default()),
            codec: MessageCodec::default(),
            auto_reconnect: true,
        };
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);
        let (events_tx, events_rx) = broadcast::channel(16);

        Harness {
            connection: Connection::new(settings, commands_rx, state_tx, events_tx),
            accept,
            events: events_rx,
            _state: state_rx,
            _commands: commands_tx,
        }
    }

    fn next_link_event(connection: &mut Connection) -> TransportEvent {
        connection
            .link
            .as_mut()
            .expect("transport open")
            .events
            .try_recv()
            .expect("event queued")
    }

    #[test]
    fn test_hello_after_close_ignored() {
        let mut h = harness();
        h.connection.handle_command(Command::Connect);
        assert_eq!(h.connection.current_state(), ConnectionState::Connecting);
        let peer = h.accept.try_recv().unwrap();

        // The hello is already on its way when close() runs.
        peer.hello().unwrap();
        let (done, _done_rx) = oneshot::channel();
        h.connection.handle_command(Command::Close { done });
        assert_eq!(h.connection.current_state(), ConnectionState::Closing);

        let hello = next_link_event(&mut h.connection);
        assert!(matches!(hello, TransportEvent::Message(_)));
        h.connection.handle_transport_event(hello);
        assert_eq!(h.connection.current_state(), ConnectionState::Closing);

        let closed = next_link_event(&mut h.connection);
        assert!(matches!(closed, TransportEvent::Closed { code: Some(1000), .. }));
        h.connection.handle_transport_event(closed);
        assert_eq!(h.connection.current_state(), ConnectionState::Idle);
        assert!(h.connection.reconnect.is_none());

        let mut seen = Vec::new();
        while let Ok(event) = h.events.try_recv() {
            seen.push(event);
        }
        assert!(!seen.contains(&ClientEvent::Open));
        assert!(seen.iter().any(|e| matches!(e, ClientEvent::Event { name, .. } if name == "hello")));
    }

    #[test]
    fn test_hello_while_connecting_flushes_queue() {
        let mut h = harness();
        let packet = Packet::method("queued", serde_json::json!({})).unwrap();
        h.connection.handle_command(Command::Enqueue {
            packet: packet.clone(),
            waiter: None,
        });
        assert_eq!(packet.state(), PacketState::Pending);

        h.connection.handle_command(Command::Connect);
        let mut peer = h.accept.try_recv().unwrap();
        peer.hello().unwrap();
        let hello = next_link_event(&mut h.connection);
        h.connection.handle_transport_event(hello);

        assert_eq!(h.connection.current_state(), ConnectionState::Connected);
        assert_eq!(packet.state(), PacketState::Sending);
        assert!(peer.try_recv_frame().is_some());
    }
}
