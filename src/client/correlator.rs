//! Request/reply correlation.
//!
//! Two halves: [`RequestCorrelator`] is the table owned by the connection task
//! that routes decoded replies to waiting callers, and [`PendingCall`] is the
//! caller-side race between the reply, the timeout and cancellation.

use std::collections::HashMap;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{oneshot, watch};
use tracing::debug;

use super::client::ClientError;
use super::packet::{PacketId, PacketState};
use crate::codec::Reply;
use crate::core::ServerError;

/// What a reply resolves a call to.
pub(crate) type ReplyOutcome = Result<Value, ServerError>;

/// Routes replies to the callers waiting on them.
#[derive(Debug, Default)]
pub struct RequestCorrelator {
    waiters: HashMap<PacketId, oneshot::Sender<ReplyOutcome>>,
}

impl RequestCorrelator {
    /// Create an empty correlator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the waiter for a call.
    pub(crate) fn register(&mut self, id: PacketId, waiter: oneshot::Sender<ReplyOutcome>) {
        self.waiters.insert(id, waiter);
    }

    /// Deliver a reply to its waiter.
    ///
    /// Returns `false` if nobody is waiting on that identity any more.
    pub fn resolve(&mut self, reply: Reply) -> bool {
        let id = PacketId::from(reply.id);
        match self.waiters.remove(&id) {
            Some(waiter) => {
                // The caller may have given up in the meantime.
                let _ = waiter.send(reply.into_outcome());
                true
            }
            None => false,
        }
    }

    /// Drop the waiter for a call without notifying it.
    pub fn forget(&mut self, id: PacketId) -> bool {
        self.waiters.remove(&id).is_some()
    }

    /// Check if a call is awaiting its reply.
    pub fn contains(&self, id: PacketId) -> bool {
        self.waiters.contains_key(&id)
    }

    /// Number of calls awaiting replies.
    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    /// Check if no call is awaiting a reply.
    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }

    /// Drop every waiter.
    pub fn clear(&mut self) {
        self.waiters.clear();
    }
}

/// Caller side of one outstanding packet.
///
/// Outcomes race; the first to settle wins:
/// 1. cancellation (explicit or via `close()`) -> [`ClientError::Cancelled`]
/// 2. reply -> the server's result or [`ClientError::Constellation`]
/// 3. timeout after transmission -> [`ClientError::Timeout`]
///
/// Cancellation is polled first so it beats a timeout firing in the same tick.
/// A reply already delivered when the cancel is observed is still returned.
/// A transport close while the reply is outstanding does not settle the call:
/// the packet goes back to `Pending` and the wait starts over once it is
/// retransmitted.
#[derive(Debug)]
pub(crate) struct PendingCall {
    id: PacketId,
    state: watch::Receiver<PacketState>,
    reply: Option<oneshot::Receiver<ReplyOutcome>>,
    timeout: Duration,
}

impl PendingCall {
    /// `reply` is `None` for fire-and-forget packets, which settle on transmission.
    pub(crate) fn new(
        id: PacketId,
        state: watch::Receiver<PacketState>,
        reply: Option<oneshot::Receiver<ReplyOutcome>>,
        timeout: Duration,
    ) -> Self {
        Self {
            id,
            state,
            reply,
            timeout,
        }
    }

    /// Wait for the call to settle.
    pub(crate) async fn settle(mut self) -> Result<Value, ClientError> {
        let id = self.id;

        loop {
            // Queueing delay is not timed.
            if wait_while(&mut self.state, PacketState::Pending).await == PacketState::Cancelled {
                return match self.reply.as_mut().and_then(|reply| reply.try_recv().ok()) {
                    Some(outcome) => outcome.map_err(ClientError::Constellation),
                    None => Err(ClientError::Cancelled { id }),
                };
            }

            let Some(reply) = self.reply.as_mut() else {
                return Ok(Value::Null);
            };

            tokio::select! {
                biased;

                state = wait_while(&mut self.state, PacketState::Sending) => {
                    // A reply delivered before the cancel or the drop still wins.
                    if let Ok(outcome) = reply.try_recv() {
                        return outcome.map_err(ClientError::Constellation);
                    }
                    if state == PacketState::Cancelled {
                        return Err(ClientError::Cancelled { id });
                    }
                    debug!(%id, "Transport dropped with call in flight, awaiting resend");
                }
                outcome = &mut *reply => {
                    return match outcome {
                        Ok(outcome) => outcome.map_err(ClientError::Constellation),
                        // Waiter dropped by close() racing the cancel.
                        Err(_) => Err(ClientError::Cancelled { id }),
                    };
                }
                () = tokio::time::sleep(self.timeout) => {
                    return Err(ClientError::Timeout { id, timeout: self.timeout });
                }
            }
        }
    }
}

/// Wait until the state moves away from `current`, returning the new state.
async fn wait_while(state: &mut watch::Receiver<PacketState>, current: PacketState) -> PacketState {
    match state.wait_for(|state| *state != current).await {
        Ok(state) => *state,
        Err(_) => PacketState::Cancelled,
    }
}
