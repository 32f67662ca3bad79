//! Outbound packets and the queue of packets still owed a result.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;

use crate::codec::OutboundMessage;

static NEXT_PACKET_ID: AtomicU64 = AtomicU64::new(1);

/// Identity used to correlate a reply with its call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PacketId(u64);

impl PacketId {
    /// Allocate the next identity. Monotonic for the lifetime of the process.
    pub(crate) fn next() -> Self {
        Self(NEXT_PACKET_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the wire value.
    pub fn get(self) -> u64 {
        self.0
    }
}

impl From<u64> for PacketId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for PacketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Packet lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketState {
    /// Waiting to be transmitted (again, after a reconnect).
    Pending,
    /// Handed to the transport.
    Sending,
    /// Abandoned by the caller or by `close()`. Terminal.
    Cancelled,
}

struct PacketInner {
    id: PacketId,
    method: String,
    params: Value,
    expects_reply: bool,
    state: watch::Sender<PacketState>,
    in_use: AtomicBool,
}

/// One outbound unit of work: a call, or a fire-and-forget message.
///
/// Cloning yields another handle to the same packet; cancelling through any
/// handle cancels it everywhere.
#[derive(Clone)]
pub struct Packet {
    inner: Arc<PacketInner>,
    timeout: Option<Duration>,
}

impl Packet {
    /// A call expecting a reply.
    pub fn method(method: impl Into<String>, params: impl Serialize) -> serde_json::Result<Self> {
        Ok(Self::build(method.into(), serde_json::to_value(params)?, true))
    }

    /// A message the server is asked not to answer.
    ///
    /// Sending it completes as soon as it has been transmitted.
    pub fn message(method: impl Into<String>, params: impl Serialize) -> serde_json::Result<Self> {
        Ok(Self::build(method.into(), serde_json::to_value(params)?, false))
    }

    fn build(method: String, params: Value, expects_reply: bool) -> Self {
        let (state, _) = watch::channel(PacketState::Pending);
        Self {
            inner: Arc::new(PacketInner {
                id: PacketId::next(),
                method,
                params,
                expects_reply,
                state,
                in_use: AtomicBool::new(false),
            }),
            timeout: None,
        }
    }

    /// Override the client's reply timeout for this handle.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Get the packet identity.
    pub fn id(&self) -> PacketId {
        self.inner.id
    }

    /// Get the remote method name.
    pub fn method_name(&self) -> &str {
        &self.inner.method
    }

    /// Get the call parameters.
    pub fn params(&self) -> &Value {
        &self.inner.params
    }

    /// Whether the server is expected to reply.
    pub fn expects_reply(&self) -> bool {
        self.inner.expects_reply
    }

    /// Get the timeout override, if any.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Get the current lifecycle state.
    pub fn state(&self) -> PacketState {
        *self.inner.state.borrow()
    }

    /// Check if the packet has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.state() == PacketState::Cancelled
    }

    /// Cancel the packet. Idempotent.
    ///
    /// A caller waiting on this packet settles with a cancellation error right
    /// away. A frame already on the wire is not retracted; its reply, if any,
    /// is discarded.
    ///
    /// Returns `true` if this call performed the cancellation.
    pub fn cancel(&self) -> bool {
        self.inner.state.send_if_modified(|state| {
            if *state == PacketState::Cancelled {
                false
            } else {
                *state = PacketState::Cancelled;
                true
            }
        })
    }

    /// Re-arm a packet that was written before so it goes out again.
    /// Returns `false` if it is cancelled.
    pub(crate) fn requeue(&self) -> bool {
        let mut armed = true;
        self.inner.state.send_if_modified(|state| match *state {
            PacketState::Cancelled => {
                armed = false;
                false
            }
            PacketState::Pending => false,
            PacketState::Sending => {
                *state = PacketState::Pending;
                true
            }
        });
        armed
    }

    /// Mark the packet as owned by one `send`. Returns `false` if another
    /// `send` of the same packet has not settled yet.
    pub(crate) fn try_claim(&self) -> bool {
        self.inner
            .in_use
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn release(&self) {
        self.inner.in_use.store(false, Ordering::Release);
    }

    /// Pending -> Sending. Returns `false` if the packet was not pending.
    pub(crate) fn mark_sending(&self) -> bool {
        self.transition(PacketState::Pending, PacketState::Sending)
    }

    /// Sending -> Pending, after the transport carrying it went away.
    pub(crate) fn reset_pending(&self) -> bool {
        self.transition(PacketState::Sending, PacketState::Pending)
    }

    fn transition(&self, from: PacketState, to: PacketState) -> bool {
        self.inner.state.send_if_modified(|state| {
            if *state == from {
                *state = to;
                true
            } else {
                false
            }
        })
    }

    /// Watch lifecycle transitions.
    pub(crate) fn subscribe(&self) -> watch::Receiver<PacketState> {
        self.inner.state.subscribe()
    }

    /// Borrowed envelope for the codec.
    pub(crate) fn outbound(&self) -> OutboundMessage<'_> {
        OutboundMessage {
            id: self.inner.id.get(),
            method: &self.inner.method,
            params: &self.inner.params,
            discard: !self.inner.expects_reply,
        }
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("id", &self.inner.id)
            .field("method", &self.inner.method)
            .field("state", &self.state())
            .field("expects_reply", &self.inner.expects_reply)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Packets not yet resolved, keyed by identity.
///
/// Membership, not transport state, is what says a packet is still owed a
/// result. Iteration order is unspecified.
#[derive(Debug, Default)]
pub struct OutboundQueue {
    packets: HashMap<PacketId, Packet>,
}

impl OutboundQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a packet. Re-adding the same identity replaces the handle.
    pub fn insert(&mut self, packet: Packet) {
        self.packets.insert(packet.id(), packet);
    }

    /// Remove a packet by identity.
    pub fn remove(&mut self, id: PacketId) -> Option<Packet> {
        self.packets.remove(&id)
    }

    /// Check membership.
    pub fn contains(&self, id: PacketId) -> bool {
        self.packets.contains_key(&id)
    }

    /// Number of queued packets.
    pub fn len(&self) -> usize {
        self.packets.len()
    }

    /// Check if the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    /// Snapshot of packets still waiting to be transmitted.
    pub fn pending(&self) -> Vec<Packet> {
        self.packets
            .values()
            .filter(|packet| packet.state() == PacketState::Pending)
            .cloned()
            .collect()
    }

    /// Return every in-flight packet to `Pending`. Returns how many were reset.
    pub fn reset_in_flight(&mut self) -> usize {
        self.packets
            .values()
            .filter(|packet| packet.reset_pending())
            .count()
    }

    /// Remove and return every packet.
    pub fn drain(&mut self) -> Vec<Packet> {
        self.packets.drain().map(|(_, packet)| packet).collect()
    }
}
