//! High-level Carina client API.
//!
//! [`CarinaClient`] is a cheap, cloneable handle onto one connection task.
//! Calls made while disconnected are queued and go out once the server says
//! hello; calls in flight when the socket drops are sent again after the
//! reconnect.

use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::warn;

use super::config::{CarinaClientBuilder, ClientConfig};
use super::connection::{ClientEvent, Command, Connection, ConnectionSettings, ConnectionState};
use super::correlator::PendingCall;
use super::packet::{Packet, PacketId};
use crate::codec::MessageCodec;
use crate::core::ServerError;

/// Errors that can occur in the Carina client.
#[derive(Debug, Error)]
pub enum ClientError {
    /// No reply arrived within the timeout after transmission.
    #[error("call {id} timed out after {timeout:?}")]
    Timeout {
        /// Packet identity.
        id: PacketId,
        /// Timeout that elapsed.
        timeout: Duration,
    },

    /// The packet was cancelled, explicitly or by `close()`.
    #[error("call {id} was cancelled")]
    Cancelled {
        /// Packet identity.
        id: PacketId,
    },

    /// The server rejected the call.
    #[error(transparent)]
    Constellation(#[from] ServerError),

    /// Call parameters could not be serialized.
    #[error("failed to encode call: {0}")]
    Encode(#[from] serde_json::Error),

    /// The same packet is already being sent by another caller.
    #[error("call {id} is already in flight")]
    AlreadyInFlight {
        /// Packet identity.
        id: PacketId,
    },

    /// The connection task is gone.
    #[error("client disconnected")]
    Disconnected,
}

impl ClientError {
    /// Check if this is a reply timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, ClientError::Timeout { .. })
    }

    /// Check if this is a cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ClientError::Cancelled { .. })
    }
}

/// Stream of one named server event.
#[derive(Debug)]
pub struct EventSubscription {
    name: String,
    rx: broadcast::Receiver<ClientEvent>,
}

impl EventSubscription {
    /// Get the event name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Receive the next payload of this event.
    ///
    /// Returns `None` once the client is gone. A subscriber that falls more
    /// than the event channel capacity behind loses the oldest events; the
    /// loss is logged at `warn` and reception resumes with the oldest event
    /// still buffered.
    pub async fn recv(&mut self) -> Option<Value> {
        loop {
            match self.rx.recv().await {
                Ok(ClientEvent::Event { name, data }) if name == self.name => return Some(data),
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(event = %self.name, skipped, "Event subscriber lagging");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

/// Tells the connection task to stop tracking a packet once its caller is
/// done, then frees the packet for another `send`.
struct QueueGuard {
    packet: Packet,
    commands: mpsc::UnboundedSender<Command>,
}

impl Drop for QueueGuard {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Forget(self.packet.id()));
        self.packet.release();
    }
}

/// A persistent, auto-reconnecting Constellation client.
///
/// # Example
///
/// ```ignore
/// use carina::client::CarinaClient;
/// use carina::transport::WebSocketConnector;
///
/// let config = CarinaClient::builder()
///     .oauth_token(token)
///     .connector(WebSocketConnector::new())
///     .build()?;
///
/// let client = CarinaClient::new(config);
/// client.connect()?;
///
/// client
///     .execute("livesubscribe", json!({ "events": ["channel:1:update"] }))
///     .await?;
///
/// let mut updates = client.on_event("live");
/// while let Some(data) = updates.recv().await {
///     // Handle the update
/// }
/// ```
#[derive(Debug, Clone)]
pub struct CarinaClient {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    events: broadcast::Sender<ClientEvent>,
    reply_timeout: Duration,
}

impl CarinaClient {
    /// Start building a client configuration.
    pub fn builder() -> CarinaClientBuilder {
        CarinaClientBuilder::new()
    }

    /// Create a client. It stays idle until [`connect`](Self::connect).
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn new(config: ClientConfig) -> Self {
        let handshake = config.handshake();
        let ClientConfig {
            auto_reconnect,
            compression,
            compression_level,
            reply_timeout,
            max_message_size,
            event_channel_capacity,
            reconnection_policy,
            connector,
            ..
        } = config;

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);
        let (events_tx, _) = broadcast::channel(event_channel_capacity);

        let settings = ConnectionSettings {
            handshake,
            connector,
            policy: reconnection_policy,
            codec: MessageCodec::new(compression, max_message_size)
                .with_compression_level(compression_level),
            auto_reconnect,
        };
        let connection = Connection::new(settings, commands_rx, state_tx, events_tx.clone());
        tokio::spawn(connection.run());

        Self {
            commands: commands_tx,
            state: state_rx,
            events: events_tx,
            reply_timeout,
        }
    }

    /// Open the socket. Ignored unless idle or closing.
    pub fn connect(&self) -> Result<(), ClientError> {
        self.commands
            .send(Command::Connect)
            .map_err(|_| ClientError::Disconnected)
    }

    /// Close the socket and cancel every outstanding packet.
    ///
    /// No reconnect follows. Resolves once the close has been initiated; watch
    /// [`state_changes`](Self::state_changes) for [`ConnectionState::Idle`].
    pub async fn close(&self) {
        let (done, rx) = oneshot::channel();
        if self.commands.send(Command::Close { done }).is_ok() {
            let _ = rx.await;
        }
    }

    /// Call a remote method and wait for its result.
    pub async fn execute(
        &self,
        method: impl Into<String>,
        params: impl Serialize,
    ) -> Result<Value, ClientError> {
        self.send(Packet::method(method, params)?).await
    }

    /// Call a remote method with a timeout overriding the client default.
    pub async fn execute_with_timeout(
        &self,
        method: impl Into<String>,
        params: impl Serialize,
        timeout: Duration,
    ) -> Result<Value, ClientError> {
        self.send(Packet::method(method, params)?.with_timeout(timeout))
            .await
    }

    /// Send a packet and wait for it to settle.
    ///
    /// Calls resolve with the server's result. Fire-and-forget messages resolve
    /// with `null` once transmitted. Dropping the returned future stops the
    /// packet from being (re)sent.
    ///
    /// A packet that already settled may be sent again and goes back on the
    /// wire under the same id. Sending it while another `send` of it is still
    /// outstanding fails with [`ClientError::AlreadyInFlight`].
    pub async fn send(&self, packet: Packet) -> Result<Value, ClientError> {
        let id = packet.id();
        if packet.is_cancelled() {
            return Err(ClientError::Cancelled { id });
        }
        if !packet.try_claim() {
            return Err(ClientError::AlreadyInFlight { id });
        }
        let _guard = QueueGuard {
            packet: packet.clone(),
            commands: self.commands.clone(),
        };
        if !packet.requeue() {
            return Err(ClientError::Cancelled { id });
        }

        let state = packet.subscribe();
        let timeout = packet.timeout().unwrap_or(self.reply_timeout);
        let (waiter, reply) = if packet.expects_reply() {
            let (tx, rx) = oneshot::channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        self.commands
            .send(Command::Enqueue { packet, waiter })
            .map_err(|_| ClientError::Disconnected)?;

        PendingCall::new(id, state, reply, timeout).settle().await
    }

    /// Get the current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch connection state transitions.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Subscribe to every client event.
    ///
    /// The stream is bounded by the configured event channel capacity. A
    /// receiver that falls further behind gets
    /// [`RecvError::Lagged`](broadcast::error::RecvError::Lagged) and the
    /// skipped events are gone.
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    /// Subscribe to one named server event.
    ///
    /// Shares the bounded event stream with [`subscribe`](Self::subscribe):
    /// events are lost if the subscription is read too slowly.
    pub fn on_event(&self, name: impl Into<String>) -> EventSubscription {
        EventSubscription {
            name: name.into(),
            rx: self.events.subscribe(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::{self, MemoryPeer};
    use crate::transport::{ExponentialReconnectionPolicy, Frame};
    use serde_json::json;
    use tokio::task::JoinHandle;
    use tokio::time::Instant;

    type Accept = mpsc::UnboundedReceiver<MemoryPeer>;

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .try_init();
    }

    fn builder() -> (CarinaClientBuilder, Accept) {
        init_tracing();
        let (connector, accept) = memory::channel();
        let policy = ExponentialReconnectionPolicy::new(
            Duration::from_millis(100),
            Duration::from_secs(1),
        )
        .jitter(0.0);
        let builder = CarinaClient::builder()
            .connector(connector)
            .reconnection_policy(policy)
            .no_compression();
        (builder, accept)
    }

    fn client() -> (CarinaClient, Accept) {
        let (builder, accept) = builder();
        (CarinaClient::new(builder.build().unwrap()), accept)
    }

    async fn wait_state(client: &CarinaClient, target: ConnectionState) {
        let mut changes = client.state_changes();
        let _ = changes.wait_for(|state| *state == target).await.unwrap();
    }

    async fn accept_connected(client: &CarinaClient, accept: &mut Accept) -> MemoryPeer {
        let peer = accept.recv().await.unwrap();
        peer.hello().unwrap();
        wait_state(client, ConnectionState::Connected).await;
        peer
    }

    async fn connected() -> (CarinaClient, Accept, MemoryPeer) {
        let (client, mut accept) = client();
        client.connect().unwrap();
        let peer = accept_connected(&client, &mut accept).await;
        (client, accept, peer)
    }

    fn spawn_execute(client: &CarinaClient, method: &str) -> JoinHandle<Result<Value, ClientError>> {
        let client = client.clone();
        let method = method.to_string();
        tokio::spawn(async move { client.execute(method, json!({})).await })
    }

    async fn recv_call(peer: &mut MemoryPeer) -> (u64, String) {
        let value = peer.recv_json().await.unwrap().unwrap();
        assert_eq!(value["type"], "method");
        (
            value["id"].as_u64().unwrap(),
            value["method"].as_str().unwrap().to_string(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_starts_idle() {
        let (client, mut accept) = client();
        assert_eq!(client.state(), ConnectionState::Idle);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(accept.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_roundtrip() {
        let (client, _accept, mut peer) = connected().await;

        let call = spawn_execute(&client, "divide");
        let (id, method) = recv_call(&mut peer).await;
        assert_eq!(method, "divide");

        peer.reply(id, json!({ "quotient": 2 })).unwrap();
        assert_eq!(call.await.unwrap().unwrap(), json!({ "quotient": 2 }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_error() {
        let (client, _accept, mut peer) = connected().await;

        let call = spawn_execute(&client, "nope");
        let (id, _) = recv_call(&mut peer).await;
        peer.reply_error(id, 4106, "unknown method").unwrap();

        match call.await.unwrap() {
            Err(ClientError::Constellation(err)) => {
                assert_eq!(err.code, 4106);
                assert_eq!(err.message, "unknown method");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_queued_call_sent_once_after_hello() {
        let (client, mut accept) = client();
        let call = spawn_execute(&client, "queued");

        client.connect().unwrap();
        let mut peer = accept_connected(&client, &mut accept).await;

        let (id, method) = recv_call(&mut peer).await;
        assert_eq!(method, "queued");
        peer.reply(id, json!(true)).unwrap();
        assert_eq!(call.await.unwrap().unwrap(), json!(true));

        assert!(peer.try_recv_frame().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_timeout_while_queued() {
        let (builder, mut accept) = builder();
        let client = CarinaClient::new(
            builder
                .reply_timeout(Duration::from_millis(100))
                .build()
                .unwrap(),
        );
        let call = spawn_execute(&client, "patient");

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(!call.is_finished());

        client.connect().unwrap();
        let mut peer = accept_connected(&client, &mut accept).await;
        let (id, _) = recv_call(&mut peer).await;
        peer.reply(id, json!("ok")).unwrap();
        assert_eq!(call.await.unwrap().unwrap(), json!("ok"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_takes_precedence_over_late_reply() {
        let (client, _accept, mut peer) = connected().await;

        let packet = Packet::method("slow", json!({})).unwrap();
        let call = {
            let client = client.clone();
            let packet = packet.clone();
            tokio::spawn(async move { client.send(packet).await })
        };
        let (id, _) = recv_call(&mut peer).await;

        assert!(packet.cancel());
        assert!(call.await.unwrap().unwrap_err().is_cancelled());

        // The late reply is discarded and the connection carries on.
        peer.reply(id, json!("too late")).unwrap();
        let next = spawn_execute(&client, "next");
        let (next_id, _) = recv_call(&mut peer).await;
        peer.reply(next_id, json!(1)).unwrap();
        assert_eq!(next.await.unwrap().unwrap(), json!(1));
        assert_eq!(client.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_cancelled_packet() {
        let (client, _accept) = client();
        let packet = Packet::method("m", json!(null)).unwrap();
        packet.cancel();

        assert!(client.send(packet).await.unwrap_err().is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeouts_are_independent() {
        let (client, _accept, mut peer) = connected().await;
        let start = Instant::now();

        let short = {
            let client = client.clone();
            tokio::spawn(async move {
                let result = client
                    .execute_with_timeout("a", json!({}), Duration::from_secs(1))
                    .await;
                (result, start.elapsed())
            })
        };
        let long = {
            let client = client.clone();
            tokio::spawn(async move {
                let result = client
                    .execute_with_timeout("b", json!({}), Duration::from_secs(5))
                    .await;
                (result, start.elapsed())
            })
        };
        recv_call(&mut peer).await;
        recv_call(&mut peer).await;

        let (short_result, short_elapsed) = short.await.unwrap();
        assert!(short_result.unwrap_err().is_timeout());
        assert!(short_elapsed >= Duration::from_secs(1));
        assert!(short_elapsed < Duration::from_secs(5));

        let (long_result, long_elapsed) = long.await.unwrap();
        assert!(long_result.unwrap_err().is_timeout());
        assert!(long_elapsed >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_flight_call_survives_reconnect() {
        let (client, mut accept, mut peer) = connected().await;
        let mut events = client.subscribe();

        let call = spawn_execute(&client, "durable");
        let (id, _) = recv_call(&mut peer).await;

        peer.close();
        let mut peer = accept_connected(&client, &mut accept).await;

        let (resent_id, method) = recv_call(&mut peer).await;
        assert_eq!(resent_id, id);
        assert_eq!(method, "durable");
        peer.reply(id, json!("made it")).unwrap();
        assert_eq!(call.await.unwrap().unwrap(), json!("made it"));

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert!(seen.iter().any(|e| matches!(e, ClientEvent::Close { code: Some(1006), .. })));
        assert!(seen.contains(&ClientEvent::Open));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_waits_for_backoff() {
        let (client, mut accept, peer) = connected().await;
        let closed_at = Instant::now();

        peer.close();
        wait_state(&client, ConnectionState::Connecting).await;
        let _peer = accept.recv().await.unwrap();

        let waited = closed_at.elapsed();
        assert!(waited >= Duration::from_millis(100));
        assert!(waited < Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_reconnect_disabled() {
        let (builder, mut accept) = builder();
        let client = CarinaClient::new(builder.auto_reconnect(false).build().unwrap());
        client.connect().unwrap();
        let peer = accept_connected(&client, &mut accept).await;

        peer.close();
        wait_state(&client, ConnectionState::Idle).await;

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(accept.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_cancels_everything() {
        let (client, mut accept, mut peer) = connected().await;

        let first = spawn_execute(&client, "one");
        let second = spawn_execute(&client, "two");
        recv_call(&mut peer).await;
        recv_call(&mut peer).await;

        client.close().await;
        assert!(first.await.unwrap().unwrap_err().is_cancelled());
        assert!(second.await.unwrap().unwrap_err().is_cancelled());

        wait_state(&client, ConnectionState::Idle).await;
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(accept.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_cancels_queued_call() {
        let (client, _accept) = client();

        let call = client.execute("never", json!({}));
        tokio::pin!(call);
        // First poll enqueues the call.
        assert!(
            tokio::time::timeout(Duration::from_millis(1), &mut call)
                .await
                .is_err()
        );

        client.close().await;
        assert!(call.await.unwrap_err().is_cancelled());
        assert_eq!(client.state(), ConnectionState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_after_close() {
        let (client, mut accept, _peer) = connected().await;

        client.close().await;
        wait_state(&client, ConnectionState::Idle).await;

        client.connect().unwrap();
        let mut peer = accept_connected(&client, &mut accept).await;
        let call = spawn_execute(&client, "again");
        let (id, _) = recv_call(&mut peer).await;
        peer.reply(id, json!(null)).unwrap();
        assert_eq!(call.await.unwrap().unwrap(), Value::Null);
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_frame_is_isolated() {
        let (client, _accept, mut peer) = connected().await;
        let mut events = client.subscribe();

        let call = spawn_execute(&client, "ok");
        let (id, _) = recv_call(&mut peer).await;

        peer.send_frame(Frame::Text("{not json".into())).unwrap();
        loop {
            if let ClientEvent::ParseError(err) = events.recv().await.unwrap() {
                assert!(matches!(err, crate::core::MessageParseError::Json(_)));
                break;
            }
        }
        assert_eq!(client.state(), ConnectionState::Connected);

        peer.reply(id, json!(7)).unwrap();
        assert_eq!(call.await.unwrap().unwrap(), json!(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_hello_does_not_resend() {
        let (client, _accept, mut peer) = connected().await;
        let mut hellos = client.on_event("hello");

        let call = spawn_execute(&client, "once");
        let (id, _) = recv_call(&mut peer).await;

        peer.hello().unwrap();
        hellos.recv().await.unwrap();
        assert!(peer.try_recv_frame().is_none());

        peer.reply(id, json!(1)).unwrap();
        assert_eq!(call.await.unwrap().unwrap(), json!(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_on_event_filters_by_name() {
        let (client, _accept, peer) = connected().await;
        let mut updates = client.on_event("channel:1:update");
        assert_eq!(updates.name(), "channel:1:update");

        peer.event("channel:2:update", json!({ "viewers": 1 })).unwrap();
        peer.event("channel:1:update", json!({ "viewers": 5 })).unwrap();

        assert_eq!(updates.recv().await, Some(json!({ "viewers": 5 })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fire_and_forget_message() {
        let (client, _accept, mut peer) = connected().await;

        let packet = Packet::message("ping", json!({ "n": 1 })).unwrap();
        let sent = client.send(packet).await.unwrap();
        assert_eq!(sent, Value::Null);

        let value = peer.recv_json().await.unwrap().unwrap();
        assert_eq!(value["method"], "ping");
        assert_eq!(value["discard"], true);
    }

    #[tokio::test(start_paused = true)]
    async fn test_compressed_call() {
        let (builder, mut accept) = builder();
        let client = CarinaClient::new(
            builder
                .compression(crate::codec::SizeThreshold::new(16))
                .build()
                .unwrap(),
        );
        client.connect().unwrap();
        let mut peer = accept_connected(&client, &mut accept).await;
        assert_eq!(peer.handshake().protocol, "cnstl-gzip");

        let call = spawn_execute(&client, "a_rather_long_method_name");
        let frame = peer.recv_frame().await.unwrap();
        assert!(frame.is_binary());

        let value = crate::codec::decode_json(&frame, 1 << 20).unwrap();
        peer.reply(value["id"].as_u64().unwrap(), json!("gz")).unwrap();
        assert_eq!(call.await.unwrap().unwrap(), json!("gz"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_compression_level_reaches_the_wire() {
        async fn frame_len(level: u32) -> usize {
            let (builder, mut accept) = builder();
            let client = CarinaClient::new(
                builder
                    .compression(crate::codec::SizeThreshold::new(16))
                    .compression_level(level)
                    .build()
                    .unwrap(),
            );
            client.connect().unwrap();
            let mut peer = accept_connected(&client, &mut accept).await;

            let packet = Packet::message("bulk", json!({ "pad": "abcd".repeat(512) })).unwrap();
            client.send(packet).await.unwrap();
            let frame = peer.recv_frame().await.unwrap();
            assert!(frame.is_binary());
            frame.len()
        }

        assert!(frame_len(9).await < frame_len(0).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_carries_credentials() {
        let (builder, mut accept) = builder();
        let client = CarinaClient::new(builder.oauth_token("tok").is_bot(true).build().unwrap());
        client.connect().unwrap();

        let peer = accept.recv().await.unwrap();
        let handshake = peer.handshake();
        assert_eq!(handshake.protocol, "cnstl");
        assert_eq!(handshake.header_value("Authorization"), Some("Bearer tok"));
        assert_eq!(handshake.header_value("X-Is-Bot"), Some("true"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_resent_message_goes_out_again() {
        let (client, _accept, mut peer) = connected().await;
        let packet = Packet::message("ping", json!({})).unwrap();

        assert_eq!(client.send(packet.clone()).await.unwrap(), Value::Null);
        assert_eq!(client.send(packet.clone()).await.unwrap(), Value::Null);

        let first = peer.recv_json().await.unwrap().unwrap();
        let second = peer.recv_json().await.unwrap().unwrap();
        assert_eq!(first["id"], second["id"]);
        assert_eq!(second["method"], "ping");
    }

    #[tokio::test(start_paused = true)]
    async fn test_resent_call_after_reply() {
        let (client, _accept, mut peer) = connected().await;
        let packet = Packet::method("again", json!({})).unwrap();

        let first = {
            let client = client.clone();
            let packet = packet.clone();
            tokio::spawn(async move { client.send(packet).await })
        };
        let (id, _) = recv_call(&mut peer).await;
        peer.reply(id, json!(1)).unwrap();
        assert_eq!(first.await.unwrap().unwrap(), json!(1));

        let second = {
            let client = client.clone();
            tokio::spawn(async move { client.send(packet).await })
        };
        let (resent_id, _) = recv_call(&mut peer).await;
        assert_eq!(resent_id, id);
        peer.reply(id, json!(2)).unwrap();
        assert_eq!(second.await.unwrap().unwrap(), json!(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_send_of_same_packet_rejected() {
        let (client, _accept, mut peer) = connected().await;
        let packet = Packet::method("dup", json!({})).unwrap();

        let first = {
            let client = client.clone();
            let packet = packet.clone();
            tokio::spawn(async move { client.send(packet).await })
        };
        let (id, _) = recv_call(&mut peer).await;

        let err = client.send(packet.clone()).await.unwrap_err();
        assert!(matches!(err, ClientError::AlreadyInFlight { id: dup } if dup == packet.id()));
        assert!(peer.try_recv_frame().is_none());

        peer.reply(id, json!("one")).unwrap();
        assert_eq!(first.await.unwrap().unwrap(), json!("one"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_during_backoff() {
        let (client, mut accept, peer) = connected().await;

        peer.close();
        wait_state(&client, ConnectionState::Connecting).await;

        client.close().await;
        assert_eq!(client.state(), ConnectionState::Idle);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(accept.try_recv().is_err());
        assert_eq!(client.state(), ConnectionState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lagging_subscriber_skips_oldest_events() {
        let (builder, mut accept) = builder();
        let client = CarinaClient::new(builder.event_channel_capacity(2).build().unwrap());
        client.connect().unwrap();
        let peer = accept_connected(&client, &mut accept).await;
        let mut ticks = client.on_event("tick");

        for n in 0..5 {
            peer.event("tick", json!(n)).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert_eq!(ticks.recv().await, Some(json!(3)));
        assert_eq!(ticks.recv().await, Some(json!(4)));
    }
}
