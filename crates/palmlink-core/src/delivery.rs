//! Ack-gated per-connection delivery.
//!
//! Each connection has a FIFO of pending batches and at most one batch in
//! flight. The next batch is handed to the transport only after the client
//! acknowledges the previous one, so a client observes batches in order and
//! never sees batch N+1 before it has acked batch N.
//!
//! Queues are guarded by a short-held `std::sync::Mutex` that is never held
//! across a transport call. A transport may therefore call back into
//! [`DeliveryQueue::on_ack`] synchronously. An ack that lands while the
//! in-flight batch is still being handed to the transport is applied once
//! that send returns, so the following batch can never overtake it.

use crate::channel::ConnectionId;
use crate::transcript::StoredLine;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Default bound on pending batches per connection.
pub const DEFAULT_MAX_PENDING: usize = 256;

/// A bundle of transcript lines delivered as one acknowledged unit.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageBatch {
    /// Session the lines belong to
    pub session_id: String,
    /// Lines in file order
    pub lines: Vec<StoredLine>,
    /// True when this is the full snapshot of a newly created transcript
    pub initial: bool,
}

/// Transport failure reported by [`BatchTransport::send_batch`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The connection no longer exists
    #[error("connection gone")]
    ConnectionGone,
    /// Any other send failure
    #[error("send failed: {0}")]
    Other(String),
}

/// Hands batches to the connection layer.
pub trait BatchTransport: Send + Sync {
    /// Send one batch. Must not block on the client's acknowledgement.
    fn send_batch(&self, connection: &ConnectionId, batch: &MessageBatch)
        -> Result<(), TransportError>;
}

/// Delivery queue errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    /// Too many batches were pending; the whole queue was dropped
    #[error("delivery queue for {connection} overflowed ({limit} pending)")]
    QueueOverflow {
        /// Connection whose queue was dropped
        connection: ConnectionId,
        /// Configured bound
        limit: usize,
    },
}

/// Final state of an enqueued batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// The client acknowledged the batch
    Acknowledged,
    /// The connection went away (or overflowed) before an ack
    Dropped,
}

/// Resolves once the batch is acknowledged or dropped.
#[derive(Debug)]
pub struct DeliveryReceipt(oneshot::Receiver<DeliveryOutcome>);

impl DeliveryReceipt {
    /// Wait for the outcome.
    pub async fn outcome(self) -> DeliveryOutcome {
        self.0.await.unwrap_or(DeliveryOutcome::Dropped)
    }
}

struct QueuedBatch {
    batch: Arc<MessageBatch>,
    receipt: oneshot::Sender<DeliveryOutcome>,
}

impl QueuedBatch {
    fn resolve(self, outcome: DeliveryOutcome) {
        let _ = self.receipt.send(outcome);
    }
}

#[derive(Default)]
struct ClientQueue {
    pending: VecDeque<QueuedBatch>,
    in_flight: Option<QueuedBatch>,
    // The in-flight batch is inside `send_batch` right now.
    sending: bool,
    ack_deferred: bool,
}

impl ClientQueue {
    fn drop_all(self) -> usize {
        let mut dropped = 0;
        for queued in self.in_flight.into_iter().chain(self.pending) {
            queued.resolve(DeliveryOutcome::Dropped);
            dropped += 1;
        }
        dropped
    }
}

/// Per-connection ack-gated send queues.
pub struct DeliveryQueue {
    transport: Arc<dyn BatchTransport>,
    queues: Mutex<HashMap<ConnectionId, ClientQueue>>,
    max_pending: usize,
}

impl DeliveryQueue {
    /// Create a queue with the default pending bound.
    pub fn new(transport: Arc<dyn BatchTransport>) -> Self {
        Self::with_max_pending(transport, DEFAULT_MAX_PENDING)
    }

    /// Create a queue with an explicit pending bound.
    pub fn with_max_pending(transport: Arc<dyn BatchTransport>, max_pending: usize) -> Self {
        Self {
            transport,
            queues: Mutex::new(HashMap::new()),
            max_pending: max_pending.max(1),
        }
    }

    /// Queue a batch and send it right away if nothing is in flight.
    ///
    /// On overflow every batch of the connection (in flight and pending) is
    /// dropped; the connection layer should disconnect the client, which
    /// resumes from its cursor.
    pub fn enqueue(
        &self,
        connection: &ConnectionId,
        batch: MessageBatch,
    ) -> Result<DeliveryReceipt, DeliveryError> {
        let (tx, rx) = oneshot::channel();
        {
            let mut queues = self.lock();
            let queue = queues.entry(connection.clone()).or_default();
            if queue.pending.len() >= self.max_pending {
                if let Some(queue) = queues.remove(connection) {
                    let dropped = queue.drop_all();
                    warn!(connection = %connection, dropped, "Delivery queue overflowed");
                }
                return Err(DeliveryError::QueueOverflow {
                    connection: connection.clone(),
                    limit: self.max_pending,
                });
            }
            queue.pending.push_back(QueuedBatch {
                batch: Arc::new(batch),
                receipt: tx,
            });
        }

        self.pump(connection);
        Ok(DeliveryReceipt(rx))
    }

    /// The client acknowledged the in-flight batch; send the next one.
    ///
    /// Returns false when nothing was in flight.
    pub fn on_ack(&self, connection: &ConnectionId) -> bool {
        let acked = {
            let mut queues = self.lock();
            let Some(queue) = queues.get_mut(connection) else {
                debug!(connection = %connection, "Ack for unknown connection");
                return false;
            };
            if queue.sending {
                // The sender applies it after `send_batch` returns.
                let accepted = queue.in_flight.is_some() && !queue.ack_deferred;
                queue.ack_deferred = accepted;
                return accepted;
            }
            queue.in_flight.take()
        };

        match acked {
            Some(queued) => {
                queued.resolve(DeliveryOutcome::Acknowledged);
                self.pump(connection);
                true
            }
            None => {
                debug!(connection = %connection, "Ack with nothing in flight");
                false
            }
        }
    }

    /// Drop everything queued for a connection. Returns how many batches
    /// were dropped.
    pub fn on_disconnect(&self, connection: &ConnectionId) -> usize {
        let queue = self.lock().remove(connection);
        let dropped = queue.map(ClientQueue::drop_all).unwrap_or(0);
        if dropped > 0 {
            debug!(connection = %connection, dropped, "Dropped undelivered batches");
        }
        dropped
    }

    /// Pending (not yet sent) batches for a connection.
    pub fn pending_len(&self, connection: &ConnectionId) -> usize {
        self.lock()
            .get(connection)
            .map(|queue| queue.pending.len())
            .unwrap_or(0)
    }

    /// Whether a batch is awaiting acknowledgement.
    pub fn has_in_flight(&self, connection: &ConnectionId) -> bool {
        self.lock()
            .get(connection)
            .is_some_and(|queue| queue.in_flight.is_some())
    }

    fn pump(&self, connection: &ConnectionId) {
        loop {
            let batch = {
                let mut queues = self.lock();
                let Some(queue) = queues.get_mut(connection) else {
                    return;
                };
                if queue.in_flight.is_some() {
                    return;
                }
                let Some(next) = queue.pending.pop_front() else {
                    return;
                };
                let batch = next.batch.clone();
                queue.in_flight = Some(next);
                queue.sending = true;
                batch
            };

            if let Err(e) = self.transport.send_batch(connection, &batch) {
                warn!(
                    connection = %connection,
                    session_id = %batch.session_id,
                    error = %e,
                    "Batch send failed, treating as disconnect"
                );
                self.on_disconnect(connection);
                return;
            }

            let acked = {
                let mut queues = self.lock();
                let Some(queue) = queues.get_mut(connection) else {
                    return;
                };
                queue.sending = false;
                if !std::mem::take(&mut queue.ack_deferred) {
                    return;
                }
                queue.in_flight.take()
            };
            if let Some(queued) = acked {
                queued.resolve(DeliveryOutcome::Acknowledged);
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ConnectionId, ClientQueue>> {
        // Queue state stays consistent even if a holder panicked.
        self.queues
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for DeliveryQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryQueue")
            .field("connections", &self.lock().len())
            .field("max_pending", &self.max_pending)
            .finish()
    }
}
